// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote content fetching.
//!
//! Assets come from one of two places: a plain HTTP endpoint that serves a
//! single file, or a Git repository that gets cloned or pulled as a whole
//! working tree. Both paths are hidden behind small traits, [`Download`] and
//! [`VersionControl`], so reconciliation logic can be exercised against local
//! fixtures.
//!
//! # Staging
//!
//! Nothing is ever written under a destination's own name until it is
//! complete. Files are written to a temporary file next to the destination,
//! and trees are cloned into a temporary directory next to the destination.
//! Only a successful fetch gets renamed into place, so a failed fetch never
//! leaves a truncated file or half a clone behind.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, ErrorCode, FetchOptions, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fs::rename,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tempfile::{NamedTempFile, TempDir};
use tokio::task;
use tracing::{debug, info, instrument};

/// Fetch single file over the network.
#[allow(async_fn_in_trait)]
pub trait Download {
    /// Download entire content behind URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

impl<T: Download + ?Sized> Download for &T {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        (**self).download(url).await
    }
}

/// Download through HTTP.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Construct new HTTP downloader.
    ///
    /// Every request fails once `timeout` elapses, so an unresponsive server
    /// cannot hang a run.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Client`] if HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("lyxdot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self { client })
    }
}

impl Download for HttpDownloader {
    #[instrument(skip(self), level = "debug")]
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let http_error = |err| FetchError::Http {
            url: url.into(),
            source: err,
        };

        let response = self.client.get(url).send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.into(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(http_error)?;
        debug!("downloaded {} bytes", body.len());

        Ok(body.to_vec())
    }
}

/// Result of pulling a working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Working tree already matched its remote.
    UpToDate,

    /// Working tree was fast-forwarded to its remote.
    FastForwarded,
}

/// Clone and synchronize Git working trees.
#[allow(async_fn_in_trait)]
pub trait VersionControl {
    /// Check if `path` is the root of a working tree whose origin is `url`.
    fn tracks(&self, path: &Path, url: &str) -> bool;

    /// Clone `branch` of `url` into `destination`.
    async fn clone_branch(&self, url: &str, branch: &str, destination: &Path) -> Result<()>;

    /// Fast-forward working tree at `path` to its origin's `branch`.
    ///
    /// Never overwrites local modifications. Edits to files that incoming
    /// changes leave alone are kept. Anything that would need a forced update
    /// is reported as [`FetchError::Conflict`].
    async fn pull(&self, path: &Path, branch: &str) -> Result<PullOutcome>;
}

impl<T: VersionControl + ?Sized> VersionControl for &T {
    fn tracks(&self, path: &Path, url: &str) -> bool {
        (**self).tracks(path, url)
    }

    async fn clone_branch(&self, url: &str, branch: &str, destination: &Path) -> Result<()> {
        (**self).clone_branch(url, branch, destination).await
    }

    async fn pull(&self, path: &Path, branch: &str) -> Result<PullOutcome> {
        (**self).pull(path, branch).await
    }
}

/// Version control through libgit2.
///
/// Blocking libgit2 calls run on tokio's blocking thread pool.
#[derive(Debug, Clone, Default)]
pub struct Git2Sync {
    progress: bool,
}

impl Git2Sync {
    /// Construct version control that reports transfer progress on a
    /// progress bar.
    pub fn with_progress() -> Self {
        Self { progress: true }
    }

    fn progress_bar(&self) -> ProgressBar {
        if self.progress {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        }
    }
}

impl VersionControl for Git2Sync {
    fn tracks(&self, path: &Path, url: &str) -> bool {
        let Ok(repository) = Repository::open(path) else {
            return false;
        };

        // INVARIANT: Working tree must be rooted at exactly this path.
        let rooted = repository
            .workdir()
            .is_some_and(|workdir| same_path(workdir, path));
        if !rooted {
            return false;
        }

        repository
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url().map(|origin| same_remote(origin, url)))
            .unwrap_or(false)
    }

    async fn clone_branch(&self, url: &str, branch: &str, destination: &Path) -> Result<()> {
        info!("clone {url:?} at {branch:?}");
        let url = url.to_owned();
        let branch = branch.to_owned();
        let destination = destination.to_path_buf();
        let bar = self.progress_bar();

        task::spawn_blocking(move || clone_blocking(&url, &branch, &destination, bar)).await?
    }

    async fn pull(&self, path: &Path, branch: &str) -> Result<PullOutcome> {
        info!("pull {branch:?} into {:?}", path.display());
        let path = path.to_path_buf();
        let branch = branch.to_owned();
        let bar = self.progress_bar();

        task::spawn_blocking(move || pull_blocking(&path, &branch, bar)).await?
    }
}

fn clone_blocking(url: &str, branch: &str, destination: &Path, bar: ProgressBar) -> Result<()> {
    style_bar(&bar, url)?;
    let authenticator =
        GitAuthenticator::default().set_prompter(IndicatifPrompter::new(bar.clone()));
    let config = Config::open_default()?;

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));
    RepoBuilder::new()
        .branch(branch)
        .fetch_options(fo)
        .clone(url, destination)?;
    bar.finish_and_clear();

    Ok(())
}

fn pull_blocking(path: &Path, branch: &str, bar: ProgressBar) -> Result<PullOutcome> {
    let conflict = |reason: String| FetchError::Conflict {
        path: path.to_path_buf(),
        reason,
    };

    let repository = Repository::open(path)?;
    let checked_out = repository.head()?.shorthand().map(str::to_owned);
    if checked_out.as_deref() != Some(branch) {
        return Err(conflict(format!(
            "{} is checked out instead of {branch:?}",
            checked_out.map_or("detached HEAD".into(), |name| format!("{name:?}"))
        )));
    }

    let mut remote = repository.find_remote("origin")?;
    let url = remote.url().unwrap_or("origin").to_owned();
    style_bar(&bar, &url)?;
    let authenticator =
        GitAuthenticator::default().set_prompter(IndicatifPrompter::new(bar.clone()));
    let config = Config::open_default()?;

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));
    remote.fetch(&[branch], Some(&mut fo), None)?;
    bar.finish_and_clear();

    let fetch_head = repository.find_reference("FETCH_HEAD")?;
    let incoming = repository.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repository.merge_analysis(&[&incoming])?;
    if analysis.is_up_to_date() {
        debug!("{:?} is up to date", path.display());
        return Ok(PullOutcome::UpToDate);
    }

    if !analysis.is_fast_forward() {
        return Err(conflict(format!("history of {branch:?} diverged from origin")));
    }

    // INVARIANT: Check out before moving the branch, so the safe checkout
    //   compares against the tree the working tree was actually built from.
    //   Local edits survive unless incoming changes touch the same files.
    let target = repository.find_object(incoming.id(), None)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.safe();
    repository
        .checkout_tree(&target, Some(&mut checkout))
        .map_err(|err| match err.code() {
            ErrorCode::Conflict => conflict(err.message().to_owned()),
            _ => FetchError::Git2(err),
        })?;

    let refname = format!("refs/heads/{branch}");
    repository
        .find_reference(&refname)?
        .set_target(incoming.id(), "lyxdot: fast-forward")?;
    repository.set_head(&refname)?;

    Ok(PullOutcome::FastForwarded)
}

fn style_bar(bar: &ProgressBar, message: &str) -> Result<()> {
    let style =
        ProgressStyle::with_template("{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]")?
            .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(message.to_owned());
    bar.enable_steady_tick(Duration::from_millis(100));

    Ok(())
}

fn remote_callbacks<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &'a ProgressBar,
) -> RemoteCallbacks<'a> {
    let mut throttle = Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        if throttle.elapsed() > Duration::from_millis(10) {
            throttle = Instant::now();
            bar.set_length(progress.total_objects() as u64);
            bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    rc
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// File content staged next to its destination.
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
    destination: PathBuf,
}

impl StagedFile {
    /// Write content to temporary file in the destination's directory.
    ///
    /// The destination's directory must already exist.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Stage`] if temporary file cannot be written.
    pub fn write(destination: impl Into<PathBuf>, content: &[u8]) -> Result<Self> {
        let destination = destination.into();
        let stage_error = |err| FetchError::Stage {
            path: destination.clone(),
            source: err,
        };

        let mut file = NamedTempFile::new_in(parent_of(&destination)).map_err(stage_error)?;
        file.write_all(content).map_err(stage_error)?;
        file.as_file().sync_all().map_err(stage_error)?;

        Ok(Self { file, destination })
    }

    /// Rename staged content over destination.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Commit`] if staged file cannot be renamed.
    pub fn commit(self) -> Result<()> {
        let destination = self.destination;
        self.file
            .persist(&destination)
            .map_err(|err| FetchError::Commit {
                path: destination.clone(),
                source: err.error,
            })?;

        Ok(())
    }
}

/// Working tree staged next to its destination.
///
/// Dropping a staged tree without committing it removes it.
#[derive(Debug)]
pub struct StagedTree {
    staging: TempDir,
    destination: PathBuf,
}

impl StagedTree {
    /// Prepare empty staging directory in the destination's directory.
    ///
    /// The destination's directory must already exist.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Stage`] if staging directory cannot be created.
    pub fn new(destination: impl Into<PathBuf>) -> Result<Self> {
        let destination = destination.into();
        let staging = tempfile::Builder::new()
            .prefix(".lyxdot-staging-")
            .tempdir_in(parent_of(&destination))
            .map_err(|err| FetchError::Stage {
                path: destination.clone(),
                source: err,
            })?;

        Ok(Self {
            staging,
            destination,
        })
    }

    /// Path to fill with the working tree.
    pub fn path(&self) -> PathBuf {
        self.staging.path().join("tree")
    }

    /// Rename staged working tree onto destination.
    ///
    /// Destination must not exist anymore.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Commit`] if staged tree cannot be renamed.
    pub fn commit(self) -> Result<()> {
        rename(self.path(), &self.destination).map_err(|err| FetchError::Commit {
            path: self.destination.clone(),
            source: err,
        })
    }
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn same_remote(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> &str {
        let url = url.trim_end_matches('/');
        url.strip_suffix(".git").unwrap_or(url).trim_end_matches('/')
    }

    normalize(a) == normalize(b)
}

/// Remote fetch error types.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP client cannot be built.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    /// HTTP request failed before a response arrived, or mid-body.
    #[error("failed to download {url:?}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with something other than success.
    #[error("download of {url:?} answered with HTTP status {status}")]
    Status { url: String, status: u16 },

    /// Working tree cannot be synchronized without overwriting local state.
    #[error("working tree at {:?} conflicts with its remote: {reason}", path.display())]
    Conflict { path: PathBuf, reason: String },

    /// Content cannot be staged next to destination.
    #[error("failed to stage content for {:?}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Staged content cannot be moved into destination.
    #[error("failed to move staged content into {:?}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Blocking task panicked or was cancelled.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// Error signals diverged local state rather than a failed transfer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = FetchError> = std::result::Result<T, E>;
