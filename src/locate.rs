// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration root resolution.
//!
//! LyX keeps its user configuration in a different place depending on how it
//! was installed. A Flatpak installation keeps it inside the sandbox's private
//! data directory. A native installation keeps it in a versioned directory
//! under roaming data on Windows, in a versioned directory under application
//! support on macOS, and in a fixed dotfile directory everywhere else.
//!
//! Resolution is a pure query over the host's directories. It never creates
//! anything, and it is recomputed on every run.

use crate::{
    config::{OverlaySettings, SandboxSettings},
    path::HostDirs,
};

use glob::Pattern;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Host platform variants that differ in where configuration lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Unix,
}

impl Platform {
    /// Platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Unix
        }
    }
}

/// How a configuration root was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Private configuration root of sandboxed runtime.
    Sandboxed,

    /// Native configuration root whose name carries a version suffix.
    NativeVersioned,

    /// Native configuration root at a fixed path.
    NativeFixed,
}

impl Display for Discovery {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::Sandboxed => "sandboxed",
            Self::NativeVersioned => "native (versioned)",
            Self::NativeFixed => "native (fixed)",
        };
        fmt.write_str(label)
    }
}

/// The one authoritative configuration root of the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    path: PathBuf,
    discovery: Discovery,
}

impl ConfigLocation {
    /// Construct new configuration location.
    pub fn new(path: impl Into<PathBuf>, discovery: Discovery) -> Self {
        Self {
            path: path.into(),
            discovery,
        }
    }

    /// Absolute path to configuration root.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// How configuration root was discovered.
    pub fn discovery(&self) -> Discovery {
        self.discovery
    }

    /// Configuration root already exists on disk.
    ///
    /// A location that does not exist yet is still valid. It simply needs to
    /// be created during reconciliation.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl Display for ConfigLocation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} [{}]", self.path.display(), self.discovery)
    }
}

/// Resolve configuration root of the application.
///
/// A sandboxed configuration root always wins if it exists, even if a native
/// one exists as well. Otherwise, dispatch to the resolver of the target
/// platform.
///
/// Returns `None` when no configuration root can be determined at all, which
/// the caller should treat as fatal for the run.
///
/// # Errors
///
/// - Return [`LocateError::Enumerate`] if a platform directory cannot be
///   listed.
#[instrument(skip(host, settings), level = "debug")]
pub fn resolve_location(
    platform: Platform,
    sandbox: Option<&SandboxSettings>,
    host: &HostDirs,
    settings: &OverlaySettings,
) -> Result<Option<ConfigLocation>> {
    if let Some(sandbox) = sandbox {
        let path = sandbox_root(host, sandbox);
        debug!("check for sandboxed configuration root at {:?}", path.display());
        if path.exists() {
            return Ok(Some(ConfigLocation::new(path, Discovery::Sandboxed)));
        }
    }

    match platform {
        Platform::Windows => resolve_windows(host, settings),
        Platform::MacOs => resolve_macos(host, settings),
        Platform::Unix => Ok(Some(resolve_unix(host, settings))),
    }
}

/// Path of sandboxed configuration root, i.e.,
/// `~/.var/app/<app_id>/config/<config_dir>`.
pub fn sandbox_root(host: &HostDirs, sandbox: &SandboxSettings) -> PathBuf {
    host.home
        .join(".var")
        .join("app")
        .join(&sandbox.app_id)
        .join("config")
        .join(&sandbox.config_dir)
}

fn resolve_windows(host: &HostDirs, settings: &OverlaySettings) -> Result<Option<ConfigLocation>> {
    match &host.roaming {
        Some(roaming) => resolve_versioned(roaming, settings, settings.windows_fallback.as_deref()),
        None => Ok(None),
    }
}

fn resolve_macos(host: &HostDirs, settings: &OverlaySettings) -> Result<Option<ConfigLocation>> {
    match &host.app_support {
        Some(app_support) => {
            resolve_versioned(app_support, settings, settings.macos_fallback.as_deref())
        }
        None => Ok(None),
    }
}

fn resolve_unix(host: &HostDirs, settings: &OverlaySettings) -> ConfigLocation {
    ConfigLocation::new(host.home.join(&settings.unix_dir), Discovery::NativeFixed)
}

// INVARIANT: Lexicographically greatest name stands in for most recent version.
fn resolve_versioned(
    base: &Path,
    settings: &OverlaySettings,
    fallback: Option<&str>,
) -> Result<Option<ConfigLocation>> {
    if !base.exists() {
        debug!("platform directory {:?} does not exist", base.display());
        return Ok(None);
    }

    let latest = versioned_dirs(base, &settings.application)?.into_iter().max();
    let location = latest
        .or_else(|| fallback.map(|name| base.join(name)))
        .map(|path| ConfigLocation::new(path, Discovery::NativeVersioned));

    Ok(location)
}

fn versioned_dirs(base: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}*",
        Pattern::escape(base.to_string_lossy().as_ref()),
        Pattern::escape(prefix)
    );
    let entries = glob::glob(&pattern).map_err(|err| LocateError::Pattern {
        source: err,
        pattern: pattern.clone(),
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| LocateError::Enumerate {
            path: base.to_path_buf(),
            source: err.into(),
        })?;

        if path.is_dir() {
            dirs.push(path);
        }
    }

    Ok(dirs)
}

/// Location resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// Directory listing pattern could not be built.
    #[error("invalid directory pattern {pattern:?}")]
    Pattern {
        #[source]
        source: glob::PatternError,
        pattern: String,
    },

    /// Platform directory could not be listed.
    #[error("failed to list platform directory {:?}", path.display())]
    Enumerate {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LocateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayDefinition;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::create_dir_all;
    use tempfile::TempDir;

    fn host_in(root: &Path) -> HostDirs {
        HostDirs {
            home: root.join("home"),
            roaming: Some(root.join("AppData").join("Roaming")),
            app_support: Some(root.join("Library").join("Application Support")),
        }
    }

    #[test_case(Platform::Windows; "windows")]
    #[test_case(Platform::MacOs; "macos")]
    #[test_case(Platform::Unix; "unix")]
    #[test]
    fn sandbox_takes_priority_over_native(platform: Platform) -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let host = host_in(root.path());
        let definition = OverlayDefinition::builtin();
        let sandbox = definition.settings.sandbox.as_ref().unwrap();

        create_dir_all(host.home.join(".lyx"))?;
        create_dir_all(host.roaming.as_ref().unwrap().join("LyX2.4"))?;
        create_dir_all(host.app_support.as_ref().unwrap().join("LyX-2.4"))?;
        create_dir_all(sandbox_root(&host, sandbox))?;

        let result = resolve_location(platform, Some(sandbox), &host, &definition.settings)?;
        let expect = ConfigLocation::new(
            host.home.join(".var/app/org.lyx.LyX/config/lyx"),
            Discovery::Sandboxed,
        );
        pretty_assertions::assert_eq!(result.as_ref().map(ConfigLocation::discovery), Some(Discovery::Sandboxed));
        pretty_assertions::assert_eq!(result, Some(expect));

        Ok(())
    }

    #[test]
    fn missing_sandbox_falls_through_to_native() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let host = host_in(root.path());
        let definition = OverlayDefinition::builtin();

        let result = resolve_location(
            Platform::Unix,
            definition.settings.sandbox.as_ref(),
            &host,
            &definition.settings,
        )?;
        let expect = ConfigLocation::new(host.home.join(".lyx"), Discovery::NativeFixed);
        assert_eq!(result, Some(expect.clone()));
        assert!(!expect.exists());

        Ok(())
    }

    #[test]
    fn windows_picks_greatest_versioned_directory() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let host = host_in(root.path());
        let roaming = host.roaming.clone().unwrap();
        let definition = OverlayDefinition::builtin();

        create_dir_all(roaming.join("LyX2.3"))?;
        create_dir_all(roaming.join("LyX2.4"))?;
        create_dir_all(roaming.join("Mozilla"))?;
        std::fs::write(roaming.join("LyX9.9.txt"), "not a directory")?;

        let result = resolve_location(Platform::Windows, None, &host, &definition.settings)?;
        let expect = ConfigLocation::new(roaming.join("LyX2.4"), Discovery::NativeVersioned);
        assert_eq!(result, Some(expect));

        Ok(())
    }

    #[test]
    fn macos_synthesizes_fallback_when_nothing_installed() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let host = host_in(root.path());
        let app_support = host.app_support.clone().unwrap();
        let definition = OverlayDefinition::builtin();
        create_dir_all(&app_support)?;

        let result = resolve_location(Platform::MacOs, None, &host, &definition.settings)?;
        let expect = ConfigLocation::new(app_support.join("LyX-2.4"), Discovery::NativeVersioned);
        assert_eq!(result, Some(expect));

        Ok(())
    }

    #[test]
    fn not_found_without_fallback() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let host = host_in(root.path());
        let mut settings = OverlayDefinition::builtin().settings;
        settings.windows_fallback = None;
        create_dir_all(host.roaming.as_ref().unwrap())?;

        let result = resolve_location(Platform::Windows, None, &host, &settings)?;
        assert_eq!(result, None);

        let host = HostDirs {
            roaming: None,
            ..host
        };
        let result = resolve_location(Platform::Windows, None, &host, &settings)?;
        assert_eq!(result, None);

        Ok(())
    }
}
