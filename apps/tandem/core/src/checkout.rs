use tracing::{debug, info};

use crate::collab::{Repository, VersionControl};
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// No local repository matches the record's repo name.
    NotApplicable,
    CheckedOut {
        repo: Repository,
        /// True when a new local branch was created from the remote ref.
        created: bool,
    },
}

/// Brings the named repository onto `record.branch`:
/// fetch, then either checkout + pull an existing local branch, or check out
/// the remote ref and create a tracking branch from it.
pub async fn checkout_branch(
    vcs: &dyn VersionControl,
    record: &SyncRecord,
) -> SyncResult<CheckoutOutcome> {
    let Some(repo) = vcs
        .find_repository(&record.repo)
        .await
        .map_err(as_checkout)?
    else {
        debug!(target: "tandem::checkout", repo = %record.repo, "no local repository");
        return Ok(CheckoutOutcome::NotApplicable);
    };

    vcs.fetch(&repo, &record.remote, &record.branch)
        .await
        .map_err(as_fetch)?;

    let remote_ref = record.remote_ref();
    let existing = vcs
        .local_branch(&repo, &record.branch)
        .await
        .map_err(as_checkout)?;

    let created = match existing {
        Some(branch) => {
            vcs.checkout(&repo, &branch).await.map_err(as_checkout)?;
            vcs.pull(&repo).await.map_err(as_checkout)?;
            false
        }
        None => {
            vcs.checkout(&repo, &remote_ref).await.map_err(as_checkout)?;
            vcs.create_branch(&repo, &record.branch, &remote_ref)
                .await
                .map_err(as_checkout)?;
            vcs.set_upstream(&repo, &record.branch, &remote_ref)
                .await
                .map_err(as_checkout)?;
            true
        }
    };

    info!(
        target: "tandem::checkout",
        repo = %repo.name,
        branch = %record.branch,
        upstream = %remote_ref,
        created,
        "checked out branch"
    );
    Ok(CheckoutOutcome::CheckedOut { repo, created })
}

fn as_fetch(err: SyncError) -> SyncError {
    match err {
        SyncError::Fetch(_) => err,
        other => SyncError::Fetch(other.to_string()),
    }
}

fn as_checkout(err: SyncError) -> SyncError {
    match err {
        SyncError::Checkout(_) => err,
        other => SyncError::Checkout(other.to_string()),
    }
}
