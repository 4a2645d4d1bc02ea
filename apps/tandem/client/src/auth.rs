use async_trait::async_trait;
use tandem_core::{SyncError, SyncResult, TokenProvider};
use tokio::process::Command;
use tracing::debug;

/// Fixed bearer token, typically from `--token` / `TANDEM_TOKEN`.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> SyncResult<String> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(SyncError::Auth("no token configured".into()));
        }
        Ok(token.to_string())
    }
}

/// Runs a command on every connect and uses its trimmed stdout as the token,
/// e.g. `gh auth token`.
#[derive(Debug, Clone)]
pub struct CommandTokenProvider {
    program: String,
    args: Vec<String>,
}

impl CommandTokenProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a command line on whitespace. Quoting is not supported.
    pub fn from_command_line(line: &str) -> SyncResult<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SyncError::Auth("empty token command".into()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl TokenProvider for CommandTokenProvider {
    async fn token(&self) -> SyncResult<String> {
        debug!(target: "tandem::auth", program = %self.program, "requesting token");
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| SyncError::Auth(format!("failed to run {}: {err}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Auth(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(SyncError::Auth(format!("{} printed no token", self.program)));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_is_trimmed_and_required() {
        assert_eq!(
            StaticTokenProvider::new(" abc \n").token().await.unwrap(),
            "abc"
        );
        assert!(matches!(
            StaticTokenProvider::new("").token().await,
            Err(SyncError::Auth(_))
        ));
    }

    #[test]
    fn debug_output_hides_the_token() {
        let rendered = format!("{:?}", StaticTokenProvider::new("secret"));
        assert!(!rendered.contains("secret"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_token_uses_stdout() {
        let provider = CommandTokenProvider::from_command_line("echo gho_123").unwrap();
        assert_eq!(provider.token().await.unwrap(), "gho_123");

        let failing = CommandTokenProvider::from_command_line("false").unwrap();
        assert!(matches!(failing.token().await, Err(SyncError::Auth(_))));
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert!(CommandTokenProvider::from_command_line("  ").is_err());
    }
}
