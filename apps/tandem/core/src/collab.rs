//! Contracts for the tools the reaction pipeline drives. The pipeline never
//! shells out itself; it only talks to these traits.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::protocol::SyncRecord;

/// A local working copy that a `sync` can be applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub root: PathBuf,
}

impl Repository {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// `Ok(None)` means this machine has no repository by that name, which is
    /// a normal outcome rather than a failure.
    async fn find_repository(&self, name: &str) -> SyncResult<Option<Repository>>;

    async fn fetch(&self, repo: &Repository, remote: &str, branch: &str) -> SyncResult<()>;

    async fn local_branch(&self, repo: &Repository, name: &str) -> SyncResult<Option<String>>;

    async fn checkout(&self, repo: &Repository, reference: &str) -> SyncResult<()>;

    /// Creates `name` at `reference` and switches to it.
    async fn create_branch(&self, repo: &Repository, name: &str, reference: &str)
        -> SyncResult<()>;

    async fn set_upstream(&self, repo: &Repository, name: &str, reference: &str)
        -> SyncResult<()>;

    async fn pull(&self, repo: &Repository) -> SyncResult<()>;
}

#[async_trait]
pub trait BuildTool: Send + Sync {
    async fn configure(&self, repo: &Repository, record: &SyncRecord) -> SyncResult<()>;

    async fn build(&self, repo: &Repository, record: &SyncRecord) -> SyncResult<()>;
}

/// Source of the bearer credential attached to every connection handshake.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> SyncResult<String>;
}

/// Fire-and-forget user notifications.
pub trait Notifier: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Notifier that writes to the tracing subscriber; the default for the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        tracing::info!(target: "tandem::notify", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "tandem::notify", "{message}");
    }
}
