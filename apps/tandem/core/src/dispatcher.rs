use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::checkout::{checkout_branch, CheckoutOutcome};
use crate::collab::{BuildTool, Notifier, VersionControl};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{decode, Envelope, Message, SyncRecord};

/// Result of running the reaction pipeline for one `sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Checked out and built.
    Built {
        repo: String,
        branch: String,
        created: bool,
    },
    /// This machine has no repository with that name.
    Skipped,
    /// The record's sequence was already applied for the room.
    Duplicate { seq: u64 },
}

/// What the dispatcher did with one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Greeted,
    KeepAlive,
    Acknowledged,
    Reported(String),
    Synced(SyncOutcome),
    Rejected(SyncError),
}

/// Last applied sequence, per room and sender. Records without a sender
/// share the empty sender key.
type AppliedSeqs = HashMap<(String, String), u64>;

/// Routes inbound envelopes to handlers and runs the checkout-then-build
/// pipeline for `sync`. Pipelines are single-flight: the last-applied
/// sequence table doubles as the pipeline lock.
pub struct Dispatcher {
    vcs: Arc<dyn VersionControl>,
    build: Arc<dyn BuildTool>,
    notifier: Arc<dyn Notifier>,
    applied: Mutex<AppliedSeqs>,
}

impl Dispatcher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        build: Arc<dyn BuildTool>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            vcs,
            build,
            notifier,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Error boundary for the channel event loop: decodes and dispatches one
    /// frame, and turns any failure into a logged, user-visible
    /// [`Reaction::Rejected`] instead of propagating it.
    pub async fn dispatch_frame(&self, room_id: &str, bytes: &[u8]) -> Reaction {
        let result = match decode(bytes) {
            Ok(envelope) => self.dispatch(room_id, envelope).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(reaction) => reaction,
            Err(err) => {
                warn!(
                    target: "tandem::dispatch",
                    room_id = %room_id,
                    reason = err.label(),
                    error = %err,
                    "failed to handle inbound message"
                );
                self.notifier.error(&err.to_string());
                Reaction::Rejected(err)
            }
        }
    }

    pub async fn dispatch(&self, room_id: &str, envelope: Envelope) -> SyncResult<Reaction> {
        let message = envelope.into_message()?;
        self.dispatch_message(room_id, message).await
    }

    pub async fn dispatch_message(&self, room_id: &str, message: Message) -> SyncResult<Reaction> {
        match message {
            Message::Hello => {
                info!(target: "tandem::dispatch", room_id = %room_id, "relay said hello");
                Ok(Reaction::Greeted)
            }
            Message::KeepAlive => {
                trace!(target: "tandem::dispatch", room_id = %room_id, "keep-alive");
                Ok(Reaction::KeepAlive)
            }
            Message::Ack => Ok(Reaction::Acknowledged),
            Message::Error(payload) => {
                warn!(
                    target: "tandem::dispatch",
                    room_id = %room_id,
                    message = %payload.message,
                    "relay reported an error"
                );
                self.notifier.error(&payload.message);
                Ok(Reaction::Reported(payload.message))
            }
            Message::Sync(record) => self
                .handle_sync(room_id, &record)
                .await
                .map(Reaction::Synced),
        }
    }

    /// Runs the reaction pipeline for one sync record.
    pub async fn handle_sync(&self, room_id: &str, record: &SyncRecord) -> SyncResult<SyncOutcome> {
        record.validate()?;

        let mut applied = self.applied.lock().await;
        if let Some(seq) = record.seq {
            let key = (
                room_id.to_string(),
                record.sender.clone().unwrap_or_default(),
            );
            match applied.get(&key).copied() {
                Some(last) if seq == last => {
                    debug!(
                        target: "tandem::dispatch",
                        room_id = %room_id,
                        sender = %key.1,
                        seq,
                        "dropping replayed sync"
                    );
                    return Ok(SyncOutcome::Duplicate { seq });
                }
                Some(last) if seq < last => {
                    warn!(
                        target: "tandem::dispatch",
                        room_id = %room_id,
                        sender = %key.1,
                        seq,
                        last,
                        "dropping out-of-order sync"
                    );
                    self.notifier.info(&format!(
                        "ignored {record}: a newer sync from the same sender was already applied"
                    ));
                    return Ok(SyncOutcome::Duplicate { seq });
                }
                _ => {}
            }
            applied.insert(key, seq);
        }

        info!(
            target: "tandem::dispatch",
            room_id = %room_id,
            repo = %record.repo,
            remote = %record.remote,
            branch = %record.branch,
            "applying sync"
        );

        let (repo, created) = match checkout_branch(self.vcs.as_ref(), record).await? {
            CheckoutOutcome::NotApplicable => return Ok(SyncOutcome::Skipped),
            CheckoutOutcome::CheckedOut { repo, created } => (repo, created),
        };
        self.notifier
            .info(&format!("{}: switched to {}", repo.name, record.branch));

        self.build.configure(&repo, record).await.map_err(as_build)?;
        self.build.build(&repo, record).await.map_err(as_build)?;
        self.notifier
            .info(&format!("{}: build finished on {}", repo.name, record.branch));

        drop(applied);
        Ok(SyncOutcome::Built {
            repo: repo.name,
            branch: record.branch.clone(),
            created,
        })
    }
}

fn as_build(err: SyncError) -> SyncError {
    match err {
        SyncError::Build(_) => err,
        other => SyncError::Build(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Journal, RecordingBuild, RecordingNotifier, RecordingVcs, VcsCall};
    use std::time::Duration;

    struct Fixture {
        vcs: Arc<RecordingVcs>,
        build: Arc<RecordingBuild>,
        notifier: Arc<RecordingNotifier>,
        dispatcher: Dispatcher,
    }

    fn fixture(vcs: RecordingVcs, build: RecordingBuild) -> Fixture {
        let vcs = Arc::new(vcs);
        let build = Arc::new(build);
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(vcs.clone(), build.clone(), notifier.clone());
        Fixture {
            vcs,
            build,
            notifier,
            dispatcher,
        }
    }

    fn sync(repo: &str, branch: &str) -> SyncRecord {
        SyncRecord::new(repo, "origin", branch)
    }

    #[tokio::test]
    async fn new_branch_is_created_and_built_in_order() {
        let journal = Journal::default();
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app").with_journal(journal.clone()),
            RecordingBuild::default().with_journal(journal.clone()),
        );

        let outcome = f
            .dispatcher
            .handle_sync("room", &sync("app", "feature-x"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Built {
                repo: "app".into(),
                branch: "feature-x".into(),
                created: true
            }
        );
        assert!(!f.vcs.calls().contains(&VcsCall::Pull));

        let entries = journal.entries();
        let position = |needle: &str| {
            entries
                .iter()
                .position(|entry| entry.starts_with(needle))
                .unwrap_or_else(|| panic!("missing {needle} in {entries:?}"))
        };
        assert!(position("vcs:SetUpstream") < position("configure:start"));
        assert!(position("configure:end") < position("build:start"));
    }

    #[tokio::test]
    async fn existing_branch_is_pulled_not_created() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app").with_local_branch("main"),
            RecordingBuild::default(),
        );
        f.dispatcher
            .handle_sync("room", &sync("app", "main"))
            .await
            .unwrap();
        let calls = f.vcs.calls();
        assert!(calls.contains(&VcsCall::Checkout("main".into())));
        assert!(calls.contains(&VcsCall::Pull));
        assert!(!calls.iter().any(|c| matches!(c, VcsCall::CreateBranch(..))));
    }

    #[tokio::test]
    async fn missing_repository_is_skipped_quietly() {
        let f = fixture(RecordingVcs::default(), RecordingBuild::default());
        let reaction = f
            .dispatcher
            .dispatch_message("room", Message::Sync(sync("nonexistent", "main")))
            .await
            .unwrap();
        assert_eq!(reaction, Reaction::Synced(SyncOutcome::Skipped));
        assert!(f.notifier.errors().is_empty());
        assert!(f.build.calls().is_empty());
    }

    #[tokio::test]
    async fn blank_repo_is_rejected_before_any_vcs_call() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app"),
            RecordingBuild::default(),
        );
        let err = f
            .dispatcher
            .handle_sync("room", &SyncRecord::new("", "origin", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload(_)));
        assert!(f.vcs.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_and_reported() {
        let f = fixture(RecordingVcs::default(), RecordingBuild::default());
        let envelope = decode(br#"{"type":"bogus"}"#).unwrap();
        assert_eq!(
            f.dispatcher.dispatch("room", envelope).await,
            Err(SyncError::UnknownMessageType("bogus".into()))
        );

        let reaction = f
            .dispatcher
            .dispatch_frame("room", br#"{"type":"bogus"}"#)
            .await;
        assert_eq!(
            reaction,
            Reaction::Rejected(SyncError::UnknownMessageType("bogus".into()))
        );
        assert_eq!(f.notifier.errors(), vec!["unknown message type 'bogus'"]);
    }

    #[tokio::test]
    async fn relay_errors_surface_through_notifier() {
        let f = fixture(RecordingVcs::default(), RecordingBuild::default());
        let reaction = f
            .dispatcher
            .dispatch_frame("room", br#"{"type":"error","data":{"message":"room is full"}}"#)
            .await;
        assert_eq!(reaction, Reaction::Reported("room is full".into()));
        assert_eq!(f.notifier.errors(), vec!["room is full"]);
    }

    #[tokio::test]
    async fn malformed_frames_do_not_escape_the_boundary() {
        let f = fixture(RecordingVcs::default(), RecordingBuild::default());
        let reaction = f.dispatcher.dispatch_frame("room", b"{oops").await;
        assert!(matches!(
            reaction,
            Reaction::Rejected(SyncError::MalformedMessage(_))
        ));
        assert_eq!(f.notifier.errors().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_skips_build() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app").failing_fetch("no such ref"),
            RecordingBuild::default(),
        );
        let reaction = f
            .dispatcher
            .dispatch_frame(
                "room",
                br#"{"type":"sync","data":{"repo":"app","remote":"origin","branch":"gone"}}"#,
            )
            .await;
        assert_eq!(
            reaction,
            Reaction::Rejected(SyncError::Fetch("no such ref".into()))
        );
        assert!(f.build.calls().is_empty());
    }

    #[tokio::test]
    async fn configure_failure_skips_build_step() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app"),
            RecordingBuild::default().failing_configure("cmake exited with 1"),
        );
        let err = f
            .dispatcher
            .handle_sync("room", &sync("app", "main"))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::Build("cmake exited with 1".into()));
        assert_eq!(f.build.calls(), vec!["configure:main"]);
    }

    #[tokio::test]
    async fn replayed_sequence_numbers_are_dropped_per_room() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app"),
            RecordingBuild::default(),
        );
        let first = sync("app", "main").with_seq(10);

        f.dispatcher.handle_sync("room-a", &first).await.unwrap();
        assert_eq!(
            f.dispatcher.handle_sync("room-a", &first).await.unwrap(),
            SyncOutcome::Duplicate { seq: 10 }
        );
        assert_eq!(
            f.dispatcher
                .handle_sync("room-a", &sync("app", "main").with_seq(9))
                .await
                .unwrap(),
            SyncOutcome::Duplicate { seq: 9 }
        );
        assert!(matches!(
            f.dispatcher.handle_sync("room-b", &first).await.unwrap(),
            SyncOutcome::Built { .. }
        ));
        assert!(matches!(
            f.dispatcher
                .handle_sync("room-a", &sync("app", "main").with_seq(11))
                .await
                .unwrap(),
            SyncOutcome::Built { .. }
        ));
        assert_eq!(f.build.calls().len(), 6);
    }

    #[tokio::test]
    async fn sequences_are_compared_per_sender() {
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app"),
            RecordingBuild::default(),
        );
        let ahead = sync("app", "one").with_sender("alice").with_seq(2_000);
        let behind = sync("app", "two").with_sender("bob").with_seq(1_000);

        f.dispatcher.handle_sync("room", &ahead).await.unwrap();
        assert!(matches!(
            f.dispatcher.handle_sync("room", &behind).await.unwrap(),
            SyncOutcome::Built { .. }
        ));
        assert_eq!(
            f.dispatcher.handle_sync("room", &behind).await.unwrap(),
            SyncOutcome::Duplicate { seq: 1_000 }
        );
        assert!(f.notifier.infos().iter().all(|info| !info.starts_with("ignored")));

        let older = sync("app", "three").with_sender("bob").with_seq(900);
        assert_eq!(
            f.dispatcher.handle_sync("room", &older).await.unwrap(),
            SyncOutcome::Duplicate { seq: 900 }
        );
        assert_eq!(
            f.notifier
                .infos()
                .iter()
                .filter(|info| info.starts_with("ignored app origin/three"))
                .count(),
            1
        );
        assert_eq!(f.build.calls(), vec!["configure:one", "build:one", "configure:two", "build:two"]);
    }

    #[tokio::test]
    async fn concurrent_syncs_do_not_interleave() {
        let journal = Journal::default();
        let f = fixture(
            RecordingVcs::with_repo("app", "/src/app").with_journal(journal.clone()),
            RecordingBuild::default()
                .with_delay(Duration::from_millis(20))
                .with_journal(journal.clone()),
        );

        let one = sync("app", "one");
        let two = sync("app", "two");
        let (a, b) = tokio::join!(
            f.dispatcher.handle_sync("room", &one),
            f.dispatcher.handle_sync("room", &two),
        );
        a.unwrap();
        b.unwrap();

        let builds: Vec<String> = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("configure") || entry.starts_with("build"))
            .collect();
        assert_eq!(builds.len(), 8);
        let first_branch = builds[0].rsplit(':').next().unwrap().to_string();
        assert!(builds[..4].iter().all(|entry| entry.ends_with(&first_branch)));
        assert!(builds[4..].iter().all(|entry| !entry.ends_with(&first_branch)));
    }
}
