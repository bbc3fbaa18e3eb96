// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{RepoFixture, RepoKind};

use lyxdot::{
    backup::BackupSession,
    config::{AssetDefinition, AssetSource, OverlayDefinition},
    fetch::{Git2Sync, HttpDownloader, VersionControl},
    locate::{ConfigLocation, Discovery},
    patch::Patcher,
    reconcile::{
        destination_of, detect_state, Action, ConflictPolicy, DestinationState, ReconcileError,
        Reconciler, RunSummary,
    },
};

use anyhow::Result;
use chrono::Local;
use git2::Repository;
use pretty_assertions::assert_eq;
use std::{
    fs::{create_dir_all, read_dir, read_to_string, write},
    path::PathBuf,
    time::Duration,
};
use tempfile::TempDir;

struct Deployment {
    _root: TempDir,
    remote: RepoFixture,
    location: ConfigLocation,
    backups: PathBuf,
    definition: OverlayDefinition,
}

impl Deployment {
    fn new(destination: &str) -> Result<Self> {
        let root = TempDir::new()?;
        let remote = RepoFixture::new(root.path().join("remote.git"), RepoKind::Bare)?;
        remote.stage_and_commit("preferences", "\\option true\n")?;

        let location = ConfigLocation::new(root.path().join(".lyx"), Discovery::NativeFixed);
        let backups = BackupSession::default_root(location.path());
        let definition = OverlayDefinition {
            settings: OverlayDefinition::builtin().settings,
            assets: vec![AssetDefinition {
                name: "overlay".into(),
                destination: destination.into(),
                source: AssetSource::Repository {
                    url: remote.url(),
                    branch: "main".into(),
                },
            }],
            replacements: Vec::new(),
            appends: Vec::new(),
        };

        Ok(Self {
            _root: root,
            remote,
            location,
            backups,
            definition,
        })
    }

    async fn sync(&self, policy: ConflictPolicy) -> Result<RunSummary> {
        let patcher = Patcher::new(&self.definition);
        let mut reconciler = Reconciler::new(
            &self.definition,
            &patcher,
            HttpDownloader::new(Duration::from_secs(1))?,
            Git2Sync::default(),
            BackupSession::new(&self.backups, Local::now()),
        )
        .with_conflict_policy(policy);

        Ok(reconciler.run(&self.location, &[]).await)
    }

    async fn sync_one(&self, policy: ConflictPolicy) -> Result<Action> {
        let summary = self.sync(policy).await?;
        match summary.succeeded.as_slice() {
            [(_, action)] => Ok(action.clone()),
            _ => anyhow::bail!("expected one deployed asset:\n{summary}"),
        }
    }

    fn destination(&self) -> PathBuf {
        destination_of(&self.location, &self.definition.assets[0])
    }

    fn backup_sessions(&self) -> usize {
        read_dir(&self.backups).map(|dir| dir.count()).unwrap_or(0)
    }
}

#[tokio::test]
async fn absent_root_is_cloned_then_pulled() -> Result<()> {
    let deployment = Deployment::new(".")?;
    assert!(!deployment.location.exists());

    assert_eq!(deployment.sync_one(ConflictPolicy::Report).await?, Action::Fetched);
    assert_eq!(
        read_to_string(deployment.location.path().join("preferences"))?,
        "\\option true\n"
    );
    assert!(Git2Sync::default().tracks(deployment.location.path(), &deployment.remote.url()));

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });
    assert_eq!(deployment.backup_sessions(), 0);

    Ok(())
}

#[tokio::test]
async fn absent_nested_destination_creates_parents() -> Result<()> {
    let deployment = Deployment::new("layouts/overlay")?;

    assert_eq!(deployment.sync_one(ConflictPolicy::Report).await?, Action::Fetched);
    assert_eq!(
        read_to_string(deployment.destination().join("preferences"))?,
        "\\option true\n"
    );
    assert_eq!(read_dir(deployment.location.path().join("layouts"))?.count(), 1);

    Ok(())
}

#[tokio::test]
async fn new_remote_commit_is_fast_forwarded() -> Result<()> {
    let deployment = Deployment::new(".")?;
    deployment.sync_one(ConflictPolicy::Report).await?;

    deployment
        .remote
        .stage_and_commit("bind/user.bind", "\\bind \"C-s\" \"buffer-write\"\n")?;
    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: true });
    assert_eq!(
        read_to_string(deployment.location.path().join("bind/user.bind"))?,
        "\\bind \"C-s\" \"buffer-write\"\n"
    );

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });

    Ok(())
}

#[tokio::test]
async fn plain_data_is_backed_up_before_clone() -> Result<()> {
    let deployment = Deployment::new(".")?;
    create_dir_all(deployment.location.path().join("bind"))?;
    write(deployment.location.path().join("preferences"), "legacy")?;
    write(deployment.location.path().join("bind/user.bind"), "legacy bind")?;

    let Action::Replaced { backup } = deployment.sync_one(ConflictPolicy::Report).await? else {
        anyhow::bail!("expected legacy root to be replaced");
    };
    assert!(backup.starts_with(&deployment.backups));
    assert!(backup.ends_with(".lyx"));
    assert_eq!(read_to_string(backup.join("preferences"))?, "legacy");
    assert_eq!(read_to_string(backup.join("bind/user.bind"))?, "legacy bind");
    assert_eq!(
        read_to_string(deployment.location.path().join("preferences"))?,
        "\\option true\n"
    );
    assert!(!deployment.location.path().join("bind").exists());

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });
    assert_eq!(deployment.backup_sessions(), 1);

    Ok(())
}

#[tokio::test]
async fn working_tree_of_other_remote_is_plain_data() -> Result<()> {
    let deployment = Deployment::new("overlay")?;
    let destination = deployment.destination();
    RepoFixture::new(&destination, RepoKind::Normal)?;
    Repository::open(&destination)?.remote("origin", "https://blah.org/other.git")?;
    write(destination.join("notes.txt"), "mine")?;

    let state = detect_state(
        &Git2Sync::default(),
        &destination,
        &deployment.definition.assets[0].source,
    );
    assert_eq!(state, DestinationState::PlainData);

    let Action::Replaced { backup } = deployment.sync_one(ConflictPolicy::Report).await? else {
        anyhow::bail!("expected foreign working tree to be replaced");
    };
    assert!(backup.ends_with("overlay"));
    assert_eq!(read_to_string(backup.join("notes.txt"))?, "mine");
    assert!(Git2Sync::default().tracks(&destination, &deployment.remote.url()));

    Ok(())
}

#[tokio::test]
async fn overlapping_local_edit_is_reported_as_conflict() -> Result<()> {
    let deployment = Deployment::new(".")?;
    deployment.sync_one(ConflictPolicy::Report).await?;

    let preferences = deployment.location.path().join("preferences");
    write(&preferences, "\\option false\n\\option local\n")?;
    deployment
        .remote
        .stage_and_commit("preferences", "\\option remote\n")?;

    let summary = deployment.sync(ConflictPolicy::Report).await?;
    assert!(!summary.is_success());
    let [err @ ReconcileError::Conflict { .. }] = summary.failed.as_slice() else {
        anyhow::bail!("expected conflict:\n{summary}");
    };
    assert_eq!(err.asset(), "overlay");
    assert_eq!(err.destination(), deployment.location.path());
    assert_eq!(read_to_string(&preferences)?, "\\option false\n\\option local\n");
    assert_eq!(deployment.backup_sessions(), 0);

    Ok(())
}

#[tokio::test]
async fn reclone_policy_backs_up_conflicting_tree() -> Result<()> {
    let deployment = Deployment::new(".")?;
    deployment.sync_one(ConflictPolicy::Report).await?;

    let preferences = deployment.location.path().join("preferences");
    write(&preferences, "\\option false\n\\option local\n")?;
    deployment
        .remote
        .stage_and_commit("preferences", "\\option remote\n")?;

    let Action::Replaced { backup } = deployment
        .sync_one(ConflictPolicy::BackupAndReclone)
        .await?
    else {
        anyhow::bail!("expected conflicting tree to be replaced");
    };
    assert_eq!(
        read_to_string(backup.join("preferences"))?,
        "\\option false\n\\option local\n"
    );
    assert_eq!(read_to_string(&preferences)?, "\\option remote\n");

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });

    Ok(())
}

#[tokio::test]
async fn local_edit_without_upstream_change_is_kept() -> Result<()> {
    let deployment = Deployment::new(".")?;
    deployment.sync_one(ConflictPolicy::Report).await?;

    let preferences = deployment.location.path().join("preferences");
    write(&preferences, "\\option true\n\\option mine\n")?;

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });
    assert_eq!(read_to_string(&preferences)?, "\\option true\n\\option mine\n");
    assert_eq!(deployment.backup_sessions(), 0);

    Ok(())
}

#[tokio::test]
async fn local_edit_survives_unrelated_upstream_change() -> Result<()> {
    let deployment = Deployment::new(".")?;
    deployment.sync_one(ConflictPolicy::Report).await?;

    let preferences = deployment.location.path().join("preferences");
    write(&preferences, "\\option true\n\\option mine\n")?;
    deployment
        .remote
        .stage_and_commit("bind/user.bind", "\\bind \"C-s\" \"buffer-write\"\n")?;

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: true });
    assert_eq!(read_to_string(&preferences)?, "\\option true\n\\option mine\n");
    assert_eq!(
        read_to_string(deployment.location.path().join("bind/user.bind"))?,
        "\\bind \"C-s\" \"buffer-write\"\n"
    );

    let action = deployment.sync_one(ConflictPolicy::Report).await?;
    assert_eq!(action, Action::Pulled { updated: false });
    assert_eq!(deployment.backup_sessions(), 0);

    Ok(())
}
