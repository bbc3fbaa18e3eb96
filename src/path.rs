// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::PathBuf;

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to overlay definition file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/lyxdot/overlay.toml` as the
/// default. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_definition_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("lyxdot").join("overlay.toml"))
        .ok_or(NoWayHome)
}

/// Directories of the current host that configuration roots hang off of.
///
/// Gathered once per run so that location resolution itself never has to
/// query the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirs {
    /// User's home directory.
    pub home: PathBuf,

    /// Roaming application data directory, i.e., `%APPDATA%` on Windows.
    pub roaming: Option<PathBuf>,

    /// Application support directory, i.e., `~/Library/Application Support`
    /// on macOS.
    pub app_support: Option<PathBuf>,
}

impl HostDirs {
    /// Detect host directories of current user.
    ///
    /// The platform specific entries are only filled in on the platform that
    /// actually has them.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if home directory path cannot be determined.
    pub fn detect() -> Result<Self> {
        let home = home_dir()?;
        let roaming = if cfg!(windows) { dirs::config_dir() } else { None };
        let app_support = if cfg!(target_os = "macos") {
            dirs::config_dir()
        } else {
            None
        };

        Ok(Self {
            home,
            roaming,
            app_support,
        })
    }
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(all(test, unix, not(target_os = "macos")))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("HOME", "/home/blah"), ("XDG_CONFIG_HOME", "/home/blah/.config")])]
    fn detect_host_dirs_from_environment() -> anyhow::Result<()> {
        let result = HostDirs::detect()?;
        let expect = HostDirs {
            home: PathBuf::from("/home/blah"),
            roaming: None,
            app_support: None,
        };
        assert_eq!(result, expect);

        let result = default_definition_path()?;
        assert_eq!(result, PathBuf::from("/home/blah/.config/lyxdot/overlay.toml"));

        Ok(())
    }
}
