use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tandem_core::{BuildTool, Repository, SyncError, SyncRecord, SyncResult};
use tokio::process::Command;
use tracing::{debug, info};

const ENV_PREFIX: &str = "TANDEM_SYNC_";

/// [`BuildTool`] that runs shell commands in the repository root.
///
/// Every command sees `TANDEM_SYNC_REPO`, `TANDEM_SYNC_REMOTE`,
/// `TANDEM_SYNC_BRANCH` and one `TANDEM_SYNC_<KEY>` per extension field of
/// the sync record. An unset step is skipped.
#[derive(Debug, Clone, Default)]
pub struct ShellBuildTool {
    configure: Option<String>,
    build: Option<String>,
}

impl ShellBuildTool {
    pub fn new(configure: Option<String>, build: Option<String>) -> Self {
        Self {
            configure: configure.filter(|cmd| !cmd.trim().is_empty()),
            build: build.filter(|cmd| !cmd.trim().is_empty()),
        }
    }

    async fn run(&self, step: &str, command: &Option<String>, repo: &Repository, record: &SyncRecord) -> SyncResult<()> {
        let Some(command) = command else {
            debug!(target: "tandem::build", step, repo = %repo.name, "no command configured");
            return Ok(());
        };

        info!(target: "tandem::build", step, repo = %repo.name, command = %command, "running");
        let status = shell(command)
            .current_dir(&repo.root)
            .envs(sync_env(record))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|err| SyncError::Build(format!("{step}: failed to start '{command}': {err}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(SyncError::Build(format!("{step}: '{command}' exited with {status}")))
        }
    }
}

#[async_trait]
impl BuildTool for ShellBuildTool {
    async fn configure(&self, repo: &Repository, record: &SyncRecord) -> SyncResult<()> {
        self.run("configure", &self.configure, repo, record).await
    }

    async fn build(&self, repo: &Repository, record: &SyncRecord) -> SyncResult<()> {
        self.run("build", &self.build, repo, record).await
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Environment exported to build commands for `record`.
pub fn sync_env(record: &SyncRecord) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(format!("{ENV_PREFIX}REPO"), record.repo.clone());
    env.insert(format!("{ENV_PREFIX}REMOTE"), record.remote.clone());
    env.insert(format!("{ENV_PREFIX}BRANCH"), record.branch.clone());
    for (key, value) in &record.extensions {
        let rendered = match value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        env.insert(format!("{ENV_PREFIX}{}", env_key(key)), rendered);
    }
    env
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
