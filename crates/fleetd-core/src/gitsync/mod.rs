//! Git synchronization of the configuration repository.
//!
//! The syncer owns one local checkout. The first sync clones the configured
//! branch (shallow by default); later syncs fetch and fast-forward. When the
//! observed commit changes, registered callbacks run on detached tasks so
//! the sync path never blocks on fan-out work.
//!
//! All git work is synchronous libgit2 I/O and runs under
//! [`tokio::task::spawn_blocking`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Authentication for the configuration repository.
#[derive(Debug, Clone, Default)]
pub enum GitAuth {
    /// No credentials (public repository or local path).
    #[default]
    Anonymous,
    /// HTTP basic credentials.
    Basic {
        /// User name.
        username: String,
        /// Password or token.
        password: String,
    },
    /// SSH key file identity.
    SshKey {
        /// Path to the private key.
        key_path: PathBuf,
    },
}

/// Configuration for [`GitSyncer`].
#[derive(Debug, Clone)]
pub struct GitSyncConfig {
    /// Remote repository URL.
    pub repo_url: String,
    /// Branch to track.
    pub branch: String,
    /// Local checkout path.
    pub local_path: PathBuf,
    /// Interval of the periodic sync loop; zero disables it.
    pub poll_interval: Duration,
    /// Authentication mode.
    pub auth: GitAuth,
    /// Clone with depth 1. On by default; disable for transports without
    /// shallow support.
    pub shallow: bool,
}

impl GitSyncConfig {
    /// Creates a config with the usual defaults: `main`, 60s polling,
    /// anonymous auth, shallow clone.
    #[must_use]
    pub fn new(repo_url: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: "main".to_string(),
            local_path: local_path.into(),
            poll_interval: Duration::from_secs(60),
            auth: GitAuth::Anonymous,
            shallow: true,
        }
    }
}

/// Errors produced by sync operations.
#[derive(Debug, thiserror::Error)]
pub enum GitSyncError {
    /// libgit2 failure (network, auth, object store).
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    /// Local filesystem failure around the checkout.
    #[error("failed to prepare {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The remote branch history diverged from the local checkout.
    #[error("branch {branch} cannot be fast-forwarded")]
    NonFastForward {
        /// The tracked branch.
        branch: String,
    },

    /// The blocking sync task failed to complete.
    #[error("sync task failed: {message}")]
    Internal {
        /// Failure description.
        message: String,
    },
}

/// Callback invoked with the new commit hash after a commit transition.
pub type SyncCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Synchronizes the configuration repository and detects commit
/// transitions.
#[derive(Clone)]
pub struct GitSyncer {
    inner: Arc<SyncerInner>,
}

struct SyncerInner {
    config: GitSyncConfig,
    repo: Mutex<Option<Repository>>,
    last_commit: Mutex<Option<String>>,
    callbacks: Mutex<Vec<SyncCallback>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for GitSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitSyncer")
            .field("repo_url", &self.inner.config.repo_url)
            .field("branch", &self.inner.config.branch)
            .field("local_path", &self.inner.config.local_path)
            .finish_non_exhaustive()
    }
}

impl GitSyncer {
    /// Creates a syncer. No git work happens until the first sync.
    #[must_use]
    pub fn new(config: GitSyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncerInner {
                config,
                repo: Mutex::new(None),
                last_commit: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Registers a callback invoked (on a detached task) with the new
    /// commit hash after each commit transition.
    pub fn on_sync(&self, callback: SyncCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Returns the local checkout path.
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.inner.config.local_path
    }

    /// Returns the last observed commit hash, if any sync succeeded.
    #[must_use]
    pub fn last_commit(&self) -> Option<String> {
        self.inner
            .last_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Performs one sync: clone on first use, fetch and fast-forward after.
    /// "Already up to date" is a non-error outcome that still returns the
    /// current commit hash.
    ///
    /// # Errors
    ///
    /// Returns [`GitSyncError`] on clone/fetch/checkout failure.
    pub async fn sync_once(&self) -> Result<String, GitSyncError> {
        let inner = Arc::clone(&self.inner);
        let (commit, previous) = tokio::task::spawn_blocking(move || inner.sync_blocking())
            .await
            .map_err(|e| GitSyncError::Internal {
                message: e.to_string(),
            })??;

        if previous.as_deref() != Some(commit.as_str()) {
            info!(
                commit = %commit,
                previous = previous.as_deref().unwrap_or(""),
                "configuration repository updated"
            );
            self.notify(&commit);
        }
        Ok(commit)
    }

    /// Adopts an existing local checkout without touching any remote. The
    /// current head becomes the baseline commit.
    ///
    /// # Errors
    ///
    /// Returns [`GitSyncError::Git`] when `path` is not a repository.
    pub fn open_local(&self, path: impl AsRef<Path>) -> Result<String, GitSyncError> {
        let repo = Repository::open(path.as_ref())?;
        let commit = head_commit(&repo)?;
        *self
            .inner
            .repo
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(repo);
        *self
            .inner
            .last_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(commit.clone());
        Ok(commit)
    }

    /// Performs the initial sync (failure is fatal to the caller) and, when
    /// a poll interval is configured, starts the periodic loop.
    ///
    /// # Errors
    ///
    /// Returns the initial sync error.
    pub async fn start(&self) -> Result<String, GitSyncError> {
        let commit = self.sync_once().await?;
        if !self.inner.config.poll_interval.is_zero() {
            let syncer = self.clone();
            tokio::spawn(async move { syncer.poll_loop().await });
        }
        Ok(commit)
    }

    /// Cancels the periodic sync loop.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    async fn poll_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        // The first tick fires immediately; the initial sync already ran.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => {
                    debug!("git sync loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        warn!(error = %err, "periodic git sync failed, retrying next tick");
                    }
                }
            }
        }
    }

    fn notify(&self, commit: &str) {
        let callbacks: Vec<SyncCallback> = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            let commit = commit.to_string();
            tokio::spawn(async move { callback(commit) });
        }
    }
}

impl SyncerInner {
    /// Runs on the blocking pool: clone/open/pull, then record the commit.
    /// Returns the current commit and the previously recorded one.
    fn sync_blocking(&self) -> Result<(String, Option<String>), GitSyncError> {
        let mut repo_guard = self.repo.lock().unwrap_or_else(PoisonError::into_inner);

        let commit = match repo_guard.as_ref() {
            Some(repo) => {
                self.pull(repo)?;
                head_commit(repo)?
            }
            None => {
                let repo = self.clone_or_open()?;
                let commit = head_commit(&repo)?;
                *repo_guard = Some(repo);
                commit
            }
        };

        let mut last = self
            .last_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = last.replace(commit.clone());
        Ok((commit, previous))
    }

    fn clone_or_open(&self) -> Result<Repository, GitSyncError> {
        let path = &self.config.local_path;
        if path.join(".git").is_dir() {
            debug!(path = %path.display(), "opening existing checkout");
            let repo = Repository::open(path)?;
            self.pull(&repo)?;
            return Ok(repo);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitSyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        info!(
            url = %self.config.repo_url,
            branch = %self.config.branch,
            path = %path.display(),
            "cloning configuration repository"
        );
        let mut fetch_options = self.fetch_options();
        if self.config.shallow {
            fetch_options.depth(1);
        }
        let repo = RepoBuilder::new()
            .branch(&self.config.branch)
            .fetch_options(fetch_options)
            .clone(&self.config.repo_url, path)?;
        Ok(repo)
    }

    fn pull(&self, repo: &Repository) -> Result<(), GitSyncError> {
        let branch = &self.config.branch;
        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &[branch.as_str()],
            Some(&mut self.fetch_options()),
            None,
        )?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(GitSyncError::NonFastForward {
                branch: branch.clone(),
            });
        }

        let refname = format!("refs/heads/{branch}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(fetch_commit.id(), "fast-forward")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        Ok(())
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let auth = self.config.auth.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| match &auth {
            GitAuth::Anonymous => Cred::default(),
            GitAuth::Basic { username, password } => {
                Cred::userpass_plaintext(username, password)
            }
            GitAuth::SshKey { key_path } => Cred::ssh_key(
                username_from_url.unwrap_or("git"),
                None,
                key_path,
                None,
            ),
        });
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options
    }
}

fn head_commit(repo: &Repository) -> Result<String, GitSyncError> {
    Ok(repo.head()?.peel_to_commit()?.id().to_string())
}

#[cfg(test)]
mod tests {
    use git2::Signature;
    use tokio::sync::mpsc;

    use super::*;

    fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("fleetd-test", "fleetd@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn seed_origin(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        std::fs::create_dir_all(dir.join("base")).unwrap();
        std::fs::write(dir.join("base/collector.yaml"), "receivers:\n  otlp: {}\n").unwrap();
        commit_all(&repo, "initial configuration");
        repo
    }

    fn test_config(origin: &Path, checkout: &Path) -> GitSyncConfig {
        GitSyncConfig {
            branch: "master".to_string(),
            poll_interval: Duration::ZERO,
            // Local-path clones do not negotiate shallow fetches.
            shallow: false,
            ..GitSyncConfig::new(origin.to_string_lossy().into_owned(), checkout)
        }
    }

    #[tokio::test]
    async fn test_initial_sync_clones_and_reports_head() {
        let origin_dir = tempfile::tempdir().unwrap();
        let checkout_dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(origin_dir.path());
        let expected = origin.head().unwrap().peel_to_commit().unwrap().id();

        let syncer = GitSyncer::new(test_config(
            origin_dir.path(),
            &checkout_dir.path().join("repo"),
        ));
        let commit = syncer.sync_once().await.unwrap();
        assert_eq!(commit, expected.to_string());
        assert_eq!(syncer.last_commit().as_deref(), Some(commit.as_str()));
        assert!(checkout_dir
            .path()
            .join("repo/base/collector.yaml")
            .exists());
    }

    #[tokio::test]
    async fn test_unchanged_sync_is_not_a_transition() {
        let origin_dir = tempfile::tempdir().unwrap();
        let checkout_dir = tempfile::tempdir().unwrap();
        seed_origin(origin_dir.path());

        let syncer = GitSyncer::new(test_config(
            origin_dir.path(),
            &checkout_dir.path().join("repo"),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        syncer.on_sync(Arc::new(move |commit| {
            let _ = tx.send(commit);
        }));

        let first = syncer.sync_once().await.unwrap();
        // Initial sync observes a commit where none was recorded: one event.
        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, first);

        // Same commit again: no transition, no callback.
        let second = syncer.sync_once().await.unwrap();
        assert_eq!(first, second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commit_transition_fast_forwards_and_notifies() {
        let origin_dir = tempfile::tempdir().unwrap();
        let checkout_dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(origin_dir.path());

        let syncer = GitSyncer::new(test_config(
            origin_dir.path(),
            &checkout_dir.path().join("repo"),
        ));
        let first = syncer.sync_once().await.unwrap();

        std::fs::write(
            origin_dir.path().join("base/collector.yaml"),
            "receivers:\n  jaeger: {}\n",
        )
        .unwrap();
        let new_oid = commit_all(&origin, "switch receiver");

        let (tx, mut rx) = mpsc::unbounded_channel();
        syncer.on_sync(Arc::new(move |commit| {
            let _ = tx.send(commit);
        }));

        let second = syncer.sync_once().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, new_oid.to_string());

        let notified = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notified, second);

        // The checkout reflects the new tree.
        let content = std::fs::read_to_string(
            checkout_dir.path().join("repo/base/collector.yaml"),
        )
        .unwrap();
        assert!(content.contains("jaeger"));
    }

    #[tokio::test]
    async fn test_open_local_adopts_checkout() {
        let origin_dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(origin_dir.path());
        let head = origin.head().unwrap().peel_to_commit().unwrap().id();

        let syncer = GitSyncer::new(test_config(origin_dir.path(), origin_dir.path()));
        let commit = syncer.open_local(origin_dir.path()).unwrap();
        assert_eq!(commit, head.to_string());
        assert_eq!(syncer.last_commit().as_deref(), Some(commit.as_str()));
    }
}
