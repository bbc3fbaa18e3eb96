// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation of remote assets with the configuration root.
//!
//! Each asset's destination is in exactly one of three states, detected
//! fresh every time:
//!
//! | State               | Meaning                                        | Action                       |
//! |---------------------|------------------------------------------------|------------------------------|
//! | `Absent`            | nothing at destination                         | fetch into place             |
//! | `VersionControlled` | working tree rooted at destination, same origin | pull in place                |
//! | `PlainData`         | anything else                                  | back up, then fetch in place |
//!
//! There is no other history. Running reconciliation again after it
//! succeeded lands a repository asset in `VersionControlled`, and a file
//! asset in `PlainData` whose content already matches, which is left alone.
//! Repeated runs therefore converge instead of piling up backups.
//!
//! # Data Safety
//!
//! Remote content is always fetched, and patched, before anything is moved
//! out of the way. Displaced data goes into the run's [`BackupSession`]. If
//! the backup cannot be made, the asset fails and its destination is left
//! exactly as it was. Failures are isolated per asset, so one broken asset
//! never stops the rest of the run.

use crate::{
    backup::BackupSession,
    config::{AssetDefinition, AssetSource, ConfigError, OverlayDefinition},
    fetch::{Download, FetchError, PullOutcome, StagedFile, StagedTree, VersionControl},
    locate::ConfigLocation,
    patch::{PatchError, Patcher},
};

use mkdirp::mkdirp;
use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// Current state of a destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    /// Nothing exists at destination.
    Absent,

    /// Destination is a working tree of the asset's repository.
    VersionControlled,

    /// Destination holds data that lyxdot does not manage.
    PlainData,
}

/// Detect state of destination for asset source.
///
/// File assets are never version controlled by construction, so an existing
/// destination of a file asset is always plain data.
pub fn detect_state(vcs: &impl VersionControl, path: &Path, source: &AssetSource) -> DestinationState {
    if path.symlink_metadata().is_err() {
        return DestinationState::Absent;
    }

    match source {
        AssetSource::Repository { url, .. } if vcs.tracks(path, url) => {
            DestinationState::VersionControlled
        }
        _ => DestinationState::PlainData,
    }
}

/// What to do when a working tree cannot be pulled without losing local
/// changes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Report conflict and leave working tree alone.
    #[default]
    Report,

    /// Back up the working tree like plain data, then clone fresh.
    BackupAndReclone,
}

/// Action taken to reconcile an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Destination was absent, and the asset was fetched into place.
    Fetched,

    /// Destination already held exactly the remote content.
    Unchanged,

    /// Previous content was backed up, and the asset was fetched into place.
    Replaced { backup: PathBuf },

    /// Working tree was pulled in place.
    Pulled { updated: bool },
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Fetched => fmt.write_str("fetched"),
            Self::Unchanged => fmt.write_str("unchanged"),
            Self::Replaced { backup } => {
                write!(fmt, "replaced, previous content at {:?}", backup.display())
            }
            Self::Pulled { updated: true } => fmt.write_str("fast-forwarded"),
            Self::Pulled { updated: false } => fmt.write_str("already up to date"),
        }
    }
}

/// Reconcile assets of overlay definition with configuration root.
#[derive(Debug)]
pub struct Reconciler<'a, D, V>
where
    D: Download,
    V: VersionControl,
{
    definition: &'a OverlayDefinition,
    patcher: &'a Patcher,
    downloader: D,
    vcs: V,
    backups: BackupSession,
    policy: ConflictPolicy,
}

impl<'a, D, V> Reconciler<'a, D, V>
where
    D: Download,
    V: VersionControl,
{
    /// Construct new reconciler.
    pub fn new(
        definition: &'a OverlayDefinition,
        patcher: &'a Patcher,
        downloader: D,
        vcs: V,
        backups: BackupSession,
    ) -> Self {
        Self {
            definition,
            patcher,
            downloader,
            vcs,
            backups,
            policy: ConflictPolicy::default(),
        }
    }

    /// Choose how to treat working trees that cannot be pulled safely.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Backup session of this reconciler.
    pub fn backups(&self) -> &BackupSession {
        &self.backups
    }

    /// Reconcile every asset, or only those named in `only` if non-empty.
    ///
    /// Never stops early. Every failure is logged and collected into the
    /// returned summary.
    pub async fn run(&mut self, location: &ConfigLocation, only: &[String]) -> RunSummary {
        let definition = self.definition;
        let mut summary = RunSummary::default();
        for asset in &definition.assets {
            if !only.is_empty() && !only.contains(&asset.name) {
                debug!("skip asset {:?}", asset.name);
                summary.skipped.push(asset.name.clone());
                continue;
            }

            match self.reconcile(location, asset).await {
                Ok(action) => {
                    info!("{}: {action}", asset.name);
                    summary.succeeded.push((asset.name.clone(), action));
                }
                Err(err) => {
                    error!("{}", error_chain(&err));
                    summary.failed.push(err);
                }
            }
        }

        summary
    }

    /// Reconcile one asset with configuration root.
    ///
    /// # Errors
    ///
    /// - Return [`ReconcileError::Fetch`] if the asset cannot be fetched.
    /// - Return [`ReconcileError::Conflict`] if a working tree cannot be pulled
    ///   without losing local state.
    /// - Return [`ReconcileError::Backup`] if displaced data cannot be backed
    ///   up.
    /// - Return [`ReconcileError::Patch`] if patch rules fail.
    /// - Return [`ReconcileError::Prepare`] if parent directories cannot be
    ///   created.
    /// - Return [`ReconcileError::Config`] if the asset cannot be resolved to
    ///   a remote location.
    #[instrument(skip_all, fields(asset = %asset.name), level = "debug")]
    pub async fn reconcile(
        &mut self,
        location: &ConfigLocation,
        asset: &AssetDefinition,
    ) -> Result<Action> {
        let destination = destination_of(location, asset);
        let state = detect_state(&self.vcs, &destination, &asset.source);
        debug!("destination {:?} is {state:?}", destination.display());

        match &asset.source {
            AssetSource::File { path } => {
                let url = self.definition.settings.file_url(path).ok_or_else(|| {
                    ReconcileError::Config {
                        asset: asset.name.clone(),
                        destination: destination.clone(),
                        source: ConfigError::MissingBaseUrl(asset.name.clone()),
                    }
                })?;
                self.reconcile_file(location, asset, &url, &destination, state)
                    .await
            }
            AssetSource::Repository { url, branch } => {
                self.reconcile_tree(location, asset, url, branch, &destination, state)
                    .await
            }
        }
    }

    async fn reconcile_file(
        &mut self,
        location: &ConfigLocation,
        asset: &AssetDefinition,
        url: &str,
        destination: &Path,
        state: DestinationState,
    ) -> Result<Action> {
        let content = self
            .downloader
            .download(url)
            .await
            .map_err(|err| fetch_error(asset, destination, err))?;
        let content = self
            .patcher
            .patch_bytes(&asset.name, content)
            .map_err(|err| ReconcileError::Patch {
                asset: asset.name.clone(),
                destination: destination.to_path_buf(),
                source: err,
            })?;

        if state == DestinationState::Absent {
            prepare_parent(asset, destination)?;
            StagedFile::write(destination, &content)
                .and_then(StagedFile::commit)
                .map_err(|err| fetch_error(asset, destination, err))?;
            return Ok(Action::Fetched);
        }

        if destination.is_file() && read(destination).is_ok_and(|current| current == content) {
            return Ok(Action::Unchanged);
        }

        let staged = StagedFile::write(destination, &content)
            .map_err(|err| fetch_error(asset, destination, err))?;
        let backup = self.archive(location, asset, destination)?;
        staged
            .commit()
            .map_err(|err| fetch_error(asset, destination, err))?;

        Ok(Action::Replaced { backup })
    }

    async fn reconcile_tree(
        &mut self,
        location: &ConfigLocation,
        asset: &AssetDefinition,
        url: &str,
        branch: &str,
        destination: &Path,
        state: DestinationState,
    ) -> Result<Action> {
        match state {
            DestinationState::Absent => {
                prepare_parent(asset, destination)?;
                let staged = self.clone_staged(asset, url, branch, destination).await?;
                staged
                    .commit()
                    .map_err(|err| fetch_error(asset, destination, err))?;
                Ok(Action::Fetched)
            }
            DestinationState::VersionControlled => {
                match self.vcs.pull(destination, branch).await {
                    Ok(outcome) => Ok(Action::Pulled {
                        updated: outcome == PullOutcome::FastForwarded,
                    }),
                    Err(err) if err.is_conflict() && self.policy == ConflictPolicy::BackupAndReclone => {
                        warn!("{err}, backing up working tree and cloning fresh");
                        self.replace_tree(location, asset, url, branch, destination)
                            .await
                    }
                    Err(err) => Err(fetch_error(asset, destination, err)),
                }
            }
            DestinationState::PlainData => {
                self.replace_tree(location, asset, url, branch, destination)
                    .await
            }
        }
    }

    async fn replace_tree(
        &mut self,
        location: &ConfigLocation,
        asset: &AssetDefinition,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<Action> {
        let staged = self.clone_staged(asset, url, branch, destination).await?;
        let backup = self.archive(location, asset, destination)?;
        staged
            .commit()
            .map_err(|err| fetch_error(asset, destination, err))?;

        Ok(Action::Replaced { backup })
    }

    async fn clone_staged(
        &self,
        asset: &AssetDefinition,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<StagedTree> {
        let staged =
            StagedTree::new(destination).map_err(|err| fetch_error(asset, destination, err))?;
        self.vcs
            .clone_branch(url, branch, &staged.path())
            .await
            .map_err(|err| fetch_error(asset, destination, err))?;

        Ok(staged)
    }

    fn archive(
        &mut self,
        location: &ConfigLocation,
        asset: &AssetDefinition,
        destination: &Path,
    ) -> Result<PathBuf> {
        // INVARIANT: Configuration root itself is archived under its own name.
        let relative = if asset.targets_root() {
            location
                .path()
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("root"))
        } else {
            asset.destination.clone()
        };

        self.backups
            .archive(destination, relative)
            .map_err(|err| ReconcileError::Backup {
                asset: asset.name.clone(),
                destination: destination.to_path_buf(),
                source: err,
            })
    }
}

/// Absolute destination of asset inside configuration root.
pub fn destination_of(location: &ConfigLocation, asset: &AssetDefinition) -> PathBuf {
    if asset.targets_root() {
        location.path().to_path_buf()
    } else {
        location.path().join(&asset.destination)
    }
}

fn prepare_parent(asset: &AssetDefinition, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        mkdirp(parent).map_err(|err| ReconcileError::Prepare {
            asset: asset.name.clone(),
            destination: destination.to_path_buf(),
            source: err,
        })?;
    }

    Ok(())
}

fn fetch_error(asset: &AssetDefinition, destination: &Path, err: FetchError) -> ReconcileError {
    let asset = asset.name.clone();
    let destination = destination.to_path_buf();
    if err.is_conflict() {
        ReconcileError::Conflict {
            asset,
            destination,
            source: err,
        }
    } else {
        ReconcileError::Fetch {
            asset,
            destination,
            source: err,
        }
    }
}

/// Render error with all of its causes on one line.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }

    out
}

/// Outcome of reconciling every asset of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Assets that were reconciled, with the action taken.
    pub succeeded: Vec<(String, Action)>,

    /// Assets that were not selected for this run.
    pub skipped: Vec<String>,

    /// Assets that failed.
    pub failed: Vec<ReconcileError>,
}

impl RunSummary {
    /// No asset failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for RunSummary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(
            fmt,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len()
        )?;

        for (asset, action) in &self.succeeded {
            writeln!(fmt, "  ok      {asset}: {action}")?;
        }

        for asset in &self.skipped {
            writeln!(fmt, "  skipped {asset}")?;
        }

        for err in &self.failed {
            writeln!(fmt, "  failed  {}: {}", err.asset(), error_chain(err))?;
        }

        Ok(())
    }
}

/// Per-asset reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Asset cannot be fetched.
    #[error("failed to fetch asset {asset:?} into {:?}", destination.display())]
    Fetch {
        asset: String,
        destination: PathBuf,
        #[source]
        source: FetchError,
    },

    /// Working tree diverged from its remote.
    #[error("asset {asset:?} at {:?} conflicts with its remote", destination.display())]
    Conflict {
        asset: String,
        destination: PathBuf,
        #[source]
        source: FetchError,
    },

    /// Displaced data cannot be backed up.
    #[error("failed to back up {:?} for asset {asset:?}", destination.display())]
    Backup {
        asset: String,
        destination: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Patch rules fail.
    #[error("failed to patch asset {asset:?} for {:?}", destination.display())]
    Patch {
        asset: String,
        destination: PathBuf,
        #[source]
        source: PatchError,
    },

    /// Parent directories of destination cannot be created.
    #[error("failed to create parent directories of {:?} for asset {asset:?}", destination.display())]
    Prepare {
        asset: String,
        destination: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Asset definition is unusable.
    #[error("asset {asset:?} for {:?} is misconfigured", destination.display())]
    Config {
        asset: String,
        destination: PathBuf,
        #[source]
        source: ConfigError,
    },
}

impl ReconcileError {
    /// Name of failed asset.
    pub fn asset(&self) -> &str {
        match self {
            Self::Fetch { asset, .. }
            | Self::Conflict { asset, .. }
            | Self::Backup { asset, .. }
            | Self::Patch { asset, .. }
            | Self::Prepare { asset, .. }
            | Self::Config { asset, .. } => asset,
        }
    }

    /// Destination of failed asset.
    pub fn destination(&self) -> &Path {
        match self {
            Self::Fetch { destination, .. }
            | Self::Conflict { destination, .. }
            | Self::Backup { destination, .. }
            | Self::Patch { destination, .. }
            | Self::Prepare { destination, .. }
            | Self::Config { destination, .. } => destination,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
