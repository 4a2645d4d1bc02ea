use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tandem_core::{Repository, SyncError, SyncResult, VersionControl};
use tokio::process::Command;
use tracing::debug;

/// [`VersionControl`] backed by the `git` executable.
///
/// Repositories are resolved by name: an explicit `name=path` entry wins,
/// otherwise the first search root containing a `<name>` checkout is used.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    repos: HashMap<String, PathBuf>,
    search_roots: Vec<PathBuf>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            repos: HashMap::new(),
            search_roots: Vec::new(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_repo(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.repos.insert(name.into(), root.into());
        self
    }

    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_roots.push(root.into());
        self
    }

    /// Parses a `name=path` mapping as accepted on the command line.
    pub fn parse_mapping(value: &str) -> SyncResult<(String, PathBuf)> {
        let (name, path) = value
            .split_once('=')
            .ok_or_else(|| SyncError::Config(format!("expected name=path, got '{value}'")))?;
        let (name, path) = (name.trim(), path.trim());
        if name.is_empty() || path.is_empty() {
            return Err(SyncError::Config(format!("expected name=path, got '{value}'")));
        }
        Ok((name.to_string(), PathBuf::from(path)))
    }

    fn is_checkout(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Repository names come off the wire; only a single directory name may
    /// be joined onto a search root.
    fn is_repository_name(name: &str) -> bool {
        let mut components = Path::new(name).components();
        !name.starts_with('-')
            && matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            )
    }

    async fn git(&self, repo: &Repository, args: &[&str]) -> Result<String, GitFailure> {
        debug!(target: "tandem::git", repo = %repo.name, ?args, "running git");
        let output = Command::new(&self.program)
            .arg("-C")
            .arg(&repo.root)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| GitFailure {
                code: None,
                message: format!("failed to run {}: {err}", self.program),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitFailure {
                code: output.status.code(),
                message: format!(
                    "git {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

#[derive(Debug)]
struct GitFailure {
    code: Option<i32>,
    message: String,
}

impl From<GitFailure> for String {
    fn from(failure: GitFailure) -> Self {
        failure.message
    }
}

fn fetch_error(failure: GitFailure) -> SyncError {
    SyncError::Fetch(failure.into())
}

fn checkout_error(failure: GitFailure) -> SyncError {
    SyncError::Checkout(failure.into())
}

#[async_trait]
impl VersionControl for GitCli {
    async fn find_repository(&self, name: &str) -> SyncResult<Option<Repository>> {
        if !Self::is_repository_name(name) {
            debug!(target: "tandem::git", repo = %name, "ignoring repository name with path syntax");
            return Ok(None);
        }
        if let Some(root) = self.repos.get(name) {
            return Ok(Self::is_checkout(root).then(|| Repository::new(name, root.clone())));
        }
        Ok(self
            .search_roots
            .iter()
            .map(|root| root.join(name))
            .find(|candidate| Self::is_checkout(candidate))
            .map(|root| Repository::new(name, root)))
    }

    async fn fetch(&self, repo: &Repository, remote: &str, branch: &str) -> SyncResult<()> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
        self.git(repo, &["fetch", "--end-of-options", remote, &refspec])
            .await
            .map(|_| ())
            .map_err(fetch_error)
    }

    async fn local_branch(&self, repo: &Repository, name: &str) -> SyncResult<Option<String>> {
        let reference = format!("refs/heads/{name}");
        match self
            .git(repo, &["rev-parse", "--verify", "--quiet", &reference])
            .await
        {
            Ok(_) => Ok(Some(name.to_string())),
            // `--verify --quiet` exits 1 without output when the ref is missing.
            Err(GitFailure { code: Some(1), .. }) => Ok(None),
            Err(failure) => Err(checkout_error(failure)),
        }
    }

    async fn checkout(&self, repo: &Repository, reference: &str) -> SyncResult<()> {
        self.git(repo, &["checkout", "--end-of-options", reference, "--"])
            .await
            .map(|_| ())
            .map_err(checkout_error)
    }

    async fn create_branch(
        &self,
        repo: &Repository,
        name: &str,
        reference: &str,
    ) -> SyncResult<()> {
        self.git(
            repo,
            &["checkout", "-b", name, "--end-of-options", reference, "--"],
        )
        .await
        .map(|_| ())
        .map_err(checkout_error)
    }

    async fn set_upstream(
        &self,
        repo: &Repository,
        name: &str,
        reference: &str,
    ) -> SyncResult<()> {
        let upstream = format!("--set-upstream-to={reference}");
        self.git(repo, &["branch", &upstream, "--end-of-options", name])
            .await
            .map(|_| ())
            .map_err(checkout_error)
    }

    async fn pull(&self, repo: &Repository) -> SyncResult<()> {
        self.git(repo, &["pull", "--ff-only"])
            .await
            .map(|_| ())
            .map_err(checkout_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use std::sync::Arc;

    use tandem_core::testing::{RecordingBuild, RecordingNotifier};
    use tandem_core::{checkout_branch, CheckoutOutcome, Dispatcher, Reaction, SyncRecord};

    fn run(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=tandem", "-c", "user.email=tandem@example.invalid"])
            .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=main"])
            .args(args)
            .output()
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit(dir: &Path, file: &str, contents: &str) -> String {
        std::fs::write(dir.join(file), contents).unwrap();
        run(dir, &["add", file]);
        run(dir, &["commit", "-q", "-m", file]);
        run(dir, &["rev-parse", "HEAD"])
    }

    /// A bare `origin` with `main` and `feature-x`, a seed clone that can push
    /// to it, and a `work` clone sitting on `main`.
    struct Remote {
        _dir: tempfile::TempDir,
        seed: PathBuf,
        work: PathBuf,
    }

    fn remote() -> Remote {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        let seed = dir.path().join("seed");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(&seed).unwrap();

        run(&origin, &["init", "-q", "--bare"]);
        run(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run(&seed, &["init", "-q"]);
        run(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        commit(&seed, "README", "hello\n");
        run(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]);
        run(&seed, &["push", "-q", "origin", "main"]);
        run(&seed, &["checkout", "-q", "-b", "feature-x"]);
        commit(&seed, "feature.txt", "one\n");
        run(&seed, &["push", "-q", "origin", "feature-x"]);

        run(
            dir.path(),
            &["clone", "-q", origin.to_str().unwrap(), work.to_str().unwrap()],
        );
        Remote {
            _dir: dir,
            seed,
            work,
        }
    }

    #[test]
    fn mappings_are_parsed() {
        let (name, path) = GitCli::parse_mapping("app = /src/app").unwrap();
        assert_eq!(name, "app");
        assert_eq!(path, PathBuf::from("/src/app"));
        assert!(GitCli::parse_mapping("app").is_err());
        assert!(GitCli::parse_mapping("=/src").is_err());
    }

    #[tokio::test]
    async fn repositories_resolve_from_map_then_search_roots() {
        let dir = tempfile::tempdir().unwrap();
        let mapped = dir.path().join("elsewhere");
        let searched = dir.path().join("code").join("lib");
        std::fs::create_dir_all(mapped.join(".git")).unwrap();
        std::fs::create_dir_all(searched.join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("code").join("plain")).unwrap();

        let git = GitCli::new()
            .with_repo("app", &mapped)
            .with_search_root(dir.path().join("code"));

        let app = git.find_repository("app").await.unwrap().unwrap();
        assert_eq!(app.root, mapped);
        let lib = git.find_repository("lib").await.unwrap().unwrap();
        assert_eq!(lib.root, searched);
        assert!(git.find_repository("plain").await.unwrap().is_none());
        assert!(git.find_repository("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_git_binary_is_a_fetch_error() {
        let git = GitCli::new().with_program("tandem-no-such-git");
        let repo = Repository::new("app", "/tmp");
        assert!(matches!(
            git.fetch(&repo, "origin", "main").await,
            Err(SyncError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn missing_branch_is_created_tracking_the_remote() {
        let remote = remote();
        let git = GitCli::new().with_repo("app", &remote.work);
        let record = SyncRecord::new("app", "origin", "feature-x");

        let outcome = checkout_branch(&git, &record).await.unwrap();
        assert!(matches!(outcome, CheckoutOutcome::CheckedOut { created: true, .. }));
        assert_eq!(run(&remote.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "feature-x");
        assert_eq!(
            run(&remote.work, &["rev-parse", "--abbrev-ref", "feature-x@{upstream}"]),
            "origin/feature-x"
        );
        assert_eq!(
            run(&remote.work, &["rev-parse", "HEAD"]),
            run(&remote.seed, &["rev-parse", "feature-x"])
        );
    }

    #[tokio::test]
    async fn existing_branch_is_checked_out_and_fast_forwarded() {
        let remote = remote();
        let git = GitCli::new().with_repo("app", &remote.work);
        let record = SyncRecord::new("app", "origin", "feature-x");
        checkout_branch(&git, &record).await.unwrap();
        run(&remote.work, &["checkout", "-q", "main"]);

        let head = commit(&remote.seed, "feature.txt", "two\n");
        run(&remote.seed, &["push", "-q", "origin", "feature-x"]);

        let outcome = checkout_branch(&git, &record).await.unwrap();
        assert!(matches!(outcome, CheckoutOutcome::CheckedOut { created: false, .. }));
        assert_eq!(run(&remote.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "feature-x");
        assert_eq!(run(&remote.work, &["rev-parse", "HEAD"]), head);
    }

    #[tokio::test]
    async fn unknown_upstream_branch_is_a_fetch_error() {
        let remote = remote();
        let git = GitCli::new().with_repo("app", &remote.work);
        let err = checkout_branch(&git, &SyncRecord::new("app", "origin", "gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)), "{err:?}");
        assert_eq!(run(&remote.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    }

    #[tokio::test]
    async fn local_branch_reports_failures_other_than_a_missing_ref() {
        let remote = remote();
        let git = GitCli::new();
        let work = Repository::new("app", &remote.work);
        assert_eq!(git.local_branch(&work, "main").await.unwrap(), Some("main".into()));
        assert_eq!(git.local_branch(&work, "nope").await.unwrap(), None);

        let plain = tempfile::tempdir().unwrap();
        let not_a_repo = Repository::new("app", plain.path());
        assert!(matches!(
            git.local_branch(&not_a_repo, "main").await,
            Err(SyncError::Checkout(_))
        ));
    }

    #[tokio::test]
    async fn option_shaped_remote_is_never_executed() {
        let remote = remote();
        let marker = remote.work.parent().unwrap().join("marker");
        let hostile = format!("--upload-pack=touch {} #", marker.display());

        let git = Arc::new(GitCli::new().with_repo("app", &remote.work));
        let build = Arc::new(RecordingBuild::default());
        let dispatcher = Dispatcher::new(
            git.clone(),
            build.clone(),
            Arc::new(RecordingNotifier::default()),
        );
        let frame = serde_json::json!({
            "type": "sync",
            "data": {"repo": "app", "remote": hostile, "branch": "."}
        })
        .to_string();
        let reaction = dispatcher.dispatch_frame("room", frame.as_bytes()).await;
        assert!(
            matches!(reaction, Reaction::Rejected(SyncError::InvalidPayload(_))),
            "{reaction:?}"
        );
        assert!(build.calls().is_empty());

        // Even without validation the value reaches git as a remote name.
        let work = Repository::new("app", &remote.work);
        assert!(git.fetch(&work, &hostile, "main").await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn repository_names_cannot_leave_the_search_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("code");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(root.join("app").join(".git")).unwrap();
        std::fs::create_dir_all(outside.join(".git")).unwrap();

        let git = GitCli::new().with_search_root(&root);
        assert!(git.find_repository("app").await.unwrap().is_some());
        for name in [
            outside.to_str().unwrap(),
            "../outside",
            "app/../../outside",
            "./app",
            "..",
            "-app",
        ] {
            assert!(
                git.find_repository(name).await.unwrap().is_none(),
                "resolved {name}"
            );
        }
    }
}
