//! Recording fakes for the collaborator traits, shared by unit tests here and
//! the client's integration tests (via the `testing` feature).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::collab::{BuildTool, Notifier, Repository, VersionControl};
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncRecord;

/// Ordered log shared between fakes so tests can assert cross-collaborator
/// ordering (checkout before configure before build).
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    FindRepository(String),
    Fetch(String, String),
    LocalBranch(String),
    Checkout(String),
    CreateBranch(String, String),
    SetUpstream(String, String),
    Pull,
}

#[derive(Debug, Default)]
pub struct RecordingVcs {
    repos: HashMap<String, Repository>,
    local_branches: Mutex<HashSet<String>>,
    fetch_error: Option<String>,
    checkout_error: Option<String>,
    calls: Mutex<Vec<VcsCall>>,
    journal: Journal,
}

impl RecordingVcs {
    pub fn with_repo(name: &str, root: &str) -> Self {
        Self::default().and_repo(name, root)
    }

    pub fn and_repo(mut self, name: &str, root: &str) -> Self {
        self.repos
            .insert(name.to_string(), Repository::new(name, root));
        self
    }

    pub fn with_local_branch(self, branch: &str) -> Self {
        self.local_branches.lock().insert(branch.to_string());
        self
    }

    pub fn failing_fetch(mut self, message: &str) -> Self {
        self.fetch_error = Some(message.to_string());
        self
    }

    pub fn failing_checkout(mut self, message: &str) -> Self {
        self.checkout_error = Some(message.to_string());
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().clone()
    }

    pub fn has_local_branch(&self, branch: &str) -> bool {
        self.local_branches.lock().contains(branch)
    }

    fn record(&self, call: VcsCall) {
        self.journal.push(format!("vcs:{call:?}"));
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl VersionControl for RecordingVcs {
    async fn find_repository(&self, name: &str) -> SyncResult<Option<Repository>> {
        self.record(VcsCall::FindRepository(name.to_string()));
        Ok(self.repos.get(name).cloned())
    }

    async fn fetch(&self, _repo: &Repository, remote: &str, branch: &str) -> SyncResult<()> {
        self.record(VcsCall::Fetch(remote.to_string(), branch.to_string()));
        match &self.fetch_error {
            Some(message) => Err(SyncError::Fetch(message.clone())),
            None => Ok(()),
        }
    }

    async fn local_branch(&self, _repo: &Repository, name: &str) -> SyncResult<Option<String>> {
        self.record(VcsCall::LocalBranch(name.to_string()));
        Ok(self
            .local_branches
            .lock()
            .contains(name)
            .then(|| name.to_string()))
    }

    async fn checkout(&self, _repo: &Repository, reference: &str) -> SyncResult<()> {
        self.record(VcsCall::Checkout(reference.to_string()));
        match &self.checkout_error {
            Some(message) => Err(SyncError::Checkout(message.clone())),
            None => Ok(()),
        }
    }

    async fn create_branch(
        &self,
        _repo: &Repository,
        name: &str,
        reference: &str,
    ) -> SyncResult<()> {
        self.record(VcsCall::CreateBranch(name.to_string(), reference.to_string()));
        self.local_branches.lock().insert(name.to_string());
        Ok(())
    }

    async fn set_upstream(
        &self,
        _repo: &Repository,
        name: &str,
        reference: &str,
    ) -> SyncResult<()> {
        self.record(VcsCall::SetUpstream(name.to_string(), reference.to_string()));
        Ok(())
    }

    async fn pull(&self, _repo: &Repository) -> SyncResult<()> {
        self.record(VcsCall::Pull);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingBuild {
    configure_error: Option<String>,
    build_error: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    journal: Journal,
}

impl RecordingBuild {
    pub fn failing_configure(mut self, message: &str) -> Self {
        self.configure_error = Some(message.to_string());
        self
    }

    pub fn failing_build(mut self, message: &str) -> Self {
        self.build_error = Some(message.to_string());
        self
    }

    /// Makes each step suspend for `delay`, to exercise interleaving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn step(&self, name: &str, record: &SyncRecord, error: &Option<String>) -> SyncResult<()> {
        self.journal.push(format!("{name}:start:{}", record.branch));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(format!("{name}:{}", record.branch));
        self.journal.push(format!("{name}:end:{}", record.branch));
        match error {
            Some(message) => Err(SyncError::Build(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BuildTool for RecordingBuild {
    async fn configure(&self, _repo: &Repository, record: &SyncRecord) -> SyncResult<()> {
        self.step("configure", record, &self.configure_error).await
    }

    async fn build(&self, _repo: &Repository, record: &SyncRecord) -> SyncResult<()> {
        self.step("build", record, &self.build_error).await
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, message: &str) {
        self.infos.lock().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}
