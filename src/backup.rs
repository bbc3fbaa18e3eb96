// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backups of displaced configuration.
//!
//! Whenever reconciliation has to put remote content where unmanaged data
//! already lives, the unmanaged data is moved aside first. Everything moved
//! aside during one run lands in one __backup session__ directory under the
//! backup root, named after the time the run started:
//!
//! ```text
//! ~/.lyx-backups/
//! ├── 20250301_101500_backup/
//! │   ├── preferences
//! │   └── bind/user.bind
//! └── 20250302_084210_backup/
//!     └── preferences
//! ```
//!
//! Sessions are created lazily, so a run that displaces nothing leaves no
//! trace. They are never reused, overwritten, or pruned.

use chrono::{DateTime, Local};
use mkdirp::mkdirp;
use std::{
    fs::{create_dir, rename},
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
};
use tracing::info;

/// Static label that ends every session directory name.
pub const BACKUP_LABEL: &str = "backup";

/// Backup session of a single run.
#[derive(Debug, Clone)]
pub struct BackupSession {
    root: PathBuf,
    name: String,
    dir: Option<PathBuf>,
}

impl BackupSession {
    /// Construct new backup session under `root` stamped with `started`.
    ///
    /// Nothing is created on disk until the first archive.
    pub fn new(root: impl Into<PathBuf>, started: DateTime<Local>) -> Self {
        Self {
            root: root.into(),
            name: format!("{}_{BACKUP_LABEL}", started.format("%Y%m%d_%H%M%S")),
            dir: None,
        }
    }

    /// Default backup root for configuration root, i.e., a sibling directory
    /// with "-backups" appended to its name.
    pub fn default_root(config_root: impl AsRef<Path>) -> PathBuf {
        let config_root = config_root.as_ref();
        let name = config_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lyx".into());

        config_root.with_file_name(format!("{name}-backups"))
    }

    /// Directory of session, if anything was archived yet.
    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Move `source` into session at `relative`.
    ///
    /// Returns final path of archived data.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::AlreadyExists`] if session already holds
    ///   something at `relative`.
    /// - Return any OS error from creating the session or moving `source`.
    pub fn archive(&mut self, source: impl AsRef<Path>, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let source = source.as_ref();
        let target = self.ensure_dir()?.join(relative.as_ref());

        // INVARIANT: Never overwrite archived data.
        if target.symlink_metadata().is_ok() {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("backup {:?} already exists", target.display()),
            ));
        }

        if let Some(parent) = target.parent() {
            mkdirp(parent)?;
        }
        rename(source, &target)?;
        info!("backed up {:?} to {:?}", source.display(), target.display());

        Ok(target)
    }

    fn ensure_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }

        mkdirp(&self.root)?;
        let mut attempt = 0;
        loop {
            let name = match attempt {
                0 => self.name.clone(),
                n => format!("{}-{n}", self.name),
            };

            let candidate = self.root.join(name);
            match create_dir(&candidate) {
                Ok(()) => {
                    self.dir = Some(candidate.clone());
                    return Ok(candidate);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::fs::{read_to_string, write};
    use tempfile::TempDir;

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap()
    }

    #[test]
    fn default_root_is_sibling() {
        let result = BackupSession::default_root("/home/blah/.lyx");
        assert_eq!(result, PathBuf::from("/home/blah/.lyx-backups"));
    }

    #[test]
    fn archive_into_one_lazy_session() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let backups = root.path().join("backups");
        write(root.path().join("preferences"), "legacy")?;
        write(root.path().join("user.bind"), "legacy bind")?;

        let mut session = BackupSession::new(&backups, started());
        assert_eq!(session.directory(), None);
        assert!(!backups.exists());

        let first = session.archive(root.path().join("preferences"), "preferences")?;
        let second = session.archive(root.path().join("user.bind"), "bind/user.bind")?;

        let dir = backups.join("20250301_101500_backup");
        assert_eq!(session.directory(), Some(dir.as_path()));
        assert_eq!(first, dir.join("preferences"));
        assert_eq!(second, dir.join("bind/user.bind"));
        assert_eq!(read_to_string(first)?, "legacy");
        assert_eq!(read_to_string(second)?, "legacy bind");
        assert!(!root.path().join("preferences").exists());

        Ok(())
    }

    #[test]
    fn never_reuse_or_overwrite() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let backups = root.path().join("backups");

        write(root.path().join("preferences"), "first")?;
        let mut earlier = BackupSession::new(&backups, started());
        earlier.archive(root.path().join("preferences"), "preferences")?;

        write(root.path().join("preferences"), "second")?;
        let mut later = BackupSession::new(&backups, started());
        let archived = later.archive(root.path().join("preferences"), "preferences")?;
        assert_eq!(archived, backups.join("20250301_101500_backup-1/preferences"));

        write(root.path().join("preferences"), "third")?;
        let result = later.archive(root.path().join("preferences"), "preferences");
        assert_eq!(result.map_err(|err| err.kind()), Err(ErrorKind::AlreadyExists));
        assert_eq!(read_to_string(root.path().join("preferences"))?, "third");
        assert_eq!(read_to_string(archived)?, "second");

        Ok(())
    }
}
