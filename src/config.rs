// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the __overlay definition__, the one file that tells
//! lyxdot where LyX keeps its user configuration, which remote assets to lay
//! over it, and how to patch them on the way in. File I/O is left to the
//! caller to figure out.
//!
//! # General Layout
//!
//! An overlay definition is composed of four parts:
//!
//! 1. `[settings]`: how to find the configuration root, where remote files
//!    live, and where backups go.
//! 2. `[[asset]]`: each remote asset, with its local destination relative to
//!    the configuration root and its fetch strategy.
//! 3. `[[replace]]`: literal directive replacements for file assets.
//! 4. `[[append]]`: directives to append to file assets when absent.
//!
//! Local destinations are always spelled out. They are never derived from
//! remote names, because LyX only auto-discovers some directories by their
//! exact lowercase name, e.g., `templates`.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
};

/// Name of the built-in asset that LyX reads its preferences from.
pub const PREFERENCES_ASSET: &str = "preferences";

/// Placeholder filled with the resolved TeX binary directory.
pub const PATH_PREFIX_VARIABLE: &str = "path_prefix";

/// Overlay definition layout.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct OverlayDefinition {
    /// General settings of the overlay.
    pub settings: OverlaySettings,

    /// Remote assets to reconcile, in order.
    #[serde(rename = "asset", default)]
    pub assets: Vec<AssetDefinition>,

    /// Literal directive replacements.
    #[serde(rename = "replace", default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<ReplaceRule>,

    /// Directives to append when absent.
    #[serde(rename = "append", default, skip_serializing_if = "Vec::is_empty")]
    pub appends: Vec<AppendRule>,
}

impl OverlayDefinition {
    /// Overlay definition used when the user has not written one.
    ///
    /// Pulls the StupidityInc LyX configuration as plain files, swaps the
    /// Windows-only David font for its Culmus counterpart, and points LyX at
    /// the TeX binaries.
    pub fn builtin() -> Self {
        let file = |name: &str, destination: &str, path: &str| AssetDefinition {
            name: name.into(),
            destination: destination.into(),
            source: AssetSource::File { path: path.into() },
        };

        Self {
            settings: OverlaySettings {
                application: "LyX".into(),
                unix_dir: ".lyx".into(),
                base_url: Some(
                    "https://raw.githubusercontent.com/StupidityInc/lyx-config/main".into(),
                ),
                windows_fallback: Some("LyX2.4".into()),
                macos_fallback: Some("LyX-2.4".into()),
                timeout_secs: default_timeout_secs(),
                texlive_root: None,
                backup_root: None,
                sandbox: Some(SandboxSettings {
                    app_id: "org.lyx.LyX".into(),
                    config_dir: "lyx".into(),
                }),
            },
            assets: vec![
                file(PREFERENCES_ASSET, "preferences", "preferences"),
                file("bind/user.bind", "bind/user.bind", "bind/user.bind"),
                file(
                    "Macros/Macros_Standard.lyx",
                    "Macros/Macros_Standard.lyx",
                    "Macros/Macros_Standard.lyx",
                ),
                file(
                    "Templates/Assignments.lyx",
                    "templates/Assignments.lyx",
                    "Templates/Assignments.lyx",
                ),
            ],
            replacements: vec![ReplaceRule {
                asset: PREFERENCES_ASSET.into(),
                old: r#"\screen_font_roman "David""#.into(),
                new: r#"\screen_font_roman "David CLM""#.into(),
            }],
            appends: vec![AppendRule {
                asset: PREFERENCES_ASSET.into(),
                marker: r"\path_prefix".into(),
                line: format!(r#"\path_prefix "{{{PATH_PREFIX_VARIABLE}}}""#),
            }],
        }
    }

    /// Find asset by name.
    pub fn asset(&self, name: impl AsRef<str>) -> Option<&AssetDefinition> {
        self.assets.iter().find(|asset| asset.name == name.as_ref())
    }

    /// Check that definition is internally consistent.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DuplicateAsset`] if two assets share a name.
    /// - Return [`ConfigError::MissingBaseUrl`] if a file asset exists without
    ///   a base URL to resolve it against.
    /// - Return [`ConfigError::InvalidDestination`] if a destination escapes
    ///   the configuration root.
    /// - Return [`ConfigError::UnknownAsset`], [`ConfigError::RepositoryPatch`],
    ///   [`ConfigError::EmptyLiteral`], [`ConfigError::SelfReplacing`], or
    ///   [`ConfigError::MissingMarker`] for patch rules that could never
    ///   converge or never match.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for asset in &self.assets {
            if !seen.insert(asset.name.as_str()) {
                return Err(ConfigError::DuplicateAsset(asset.name.clone()));
            }

            if !asset.is_repository() && self.settings.base_url.is_none() {
                return Err(ConfigError::MissingBaseUrl(asset.name.clone()));
            }

            let escapes = asset.destination.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
            let invalid = escapes
                || asset.destination.as_os_str().is_empty()
                || (asset.targets_root() && !asset.is_repository());
            if invalid {
                return Err(ConfigError::InvalidDestination {
                    asset: asset.name.clone(),
                    destination: asset.destination.clone(),
                });
            }
        }

        for rule in &self.replacements {
            self.validate_rule_target(&rule.asset)?;
            if rule.old.is_empty() {
                return Err(ConfigError::EmptyLiteral(rule.asset.clone()));
            }

            if rule.new.contains(&rule.old) && rule.new != rule.old {
                return Err(ConfigError::SelfReplacing {
                    asset: rule.asset.clone(),
                    old: rule.old.clone(),
                    new: rule.new.clone(),
                });
            }
        }

        for rule in &self.appends {
            self.validate_rule_target(&rule.asset)?;
            if rule.marker.is_empty() {
                return Err(ConfigError::EmptyLiteral(rule.asset.clone()));
            }

            if !rule.line.contains(&rule.marker) {
                return Err(ConfigError::MissingMarker {
                    asset: rule.asset.clone(),
                    marker: rule.marker.clone(),
                    line: rule.line.clone(),
                });
            }
        }

        Ok(())
    }

    fn validate_rule_target(&self, name: &str) -> Result<()> {
        match self.asset(name) {
            None => Err(ConfigError::UnknownAsset(name.into())),
            Some(asset) if asset.is_repository() => {
                Err(ConfigError::RepositoryPatch(name.into()))
            }
            Some(_) => Ok(()),
        }
    }
}

impl FromStr for OverlayDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut definition: OverlayDefinition =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path setting.
        let settings = &mut definition.settings;
        settings.texlive_root = settings.texlive_root.as_deref().map(expand_path).transpose()?;
        settings.backup_root = settings.backup_root.as_deref().map(expand_path).transpose()?;

        definition.validate()?;

        Ok(definition)
    }
}

impl Display for OverlayDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Overlay configuration settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct OverlaySettings {
    /// Application name, also the directory prefix of versioned native
    /// configuration roots, e.g., "LyX" matches "LyX2.4".
    pub application: String,

    /// Name of fixed configuration directory in home on Unix-like hosts.
    pub unix_dir: String,

    /// Base URL that file assets are fetched relative to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Directory name under roaming data to use when no versioned directory
    /// exists yet on Windows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_fallback: Option<String>,

    /// Directory name under application support to use when no versioned
    /// directory exists yet on macOS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macos_fallback: Option<String>,

    /// Timeout for single file downloads in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// TeX Live installation root to search for binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texlive_root: Option<PathBuf>,

    /// Directory that holds backups of displaced configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<PathBuf>,

    /// Sandboxed installation of the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,
}

impl OverlaySettings {
    /// Resolve remote path of file asset against base URL.
    pub fn file_url(&self, path: impl AsRef<str>) -> Option<String> {
        self.base_url.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.as_ref().trim_start_matches('/')
            )
        })
    }
}

/// Sandboxed runtime installation, i.e., Flatpak.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SandboxSettings {
    /// Application ID of the sandboxed application.
    pub app_id: String,

    /// Configuration directory name inside the sandbox's config directory.
    pub config_dir: String,
}

/// Remote asset to deploy into the configuration root.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AssetDefinition {
    /// Logical identity of the asset.
    pub name: String,

    /// Destination relative to the configuration root. A repository asset
    /// may use "." to take over the entire configuration root.
    pub destination: PathBuf,

    /// How to fetch the asset.
    pub source: AssetSource,
}

impl AssetDefinition {
    /// Asset is fetched as a Git working tree.
    pub fn is_repository(&self) -> bool {
        matches!(self.source, AssetSource::Repository { .. })
    }

    /// Destination is the configuration root itself.
    pub fn targets_root(&self) -> bool {
        let mut components = self.destination.components().peekable();
        components.peek().is_some() && components.all(|c| c == Component::CurDir)
    }
}

/// Fetch strategy of remote asset.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AssetSource {
    /// Single file relative to the base URL.
    File { path: String },

    /// Git repository at branch.
    Repository { url: String, branch: String },
}

/// Replace every exact occurrence of `old` with `new` in an asset.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ReplaceRule {
    pub asset: String,
    pub old: String,
    pub new: String,
}

/// Append `line` to an asset unless `marker` already occurs in it.
///
/// The line may contain `{name}` placeholders filled from patch variables.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AppendRule {
    pub asset: String,
    pub marker: String,
    pub line: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(PathBuf::from(expanded))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Two assets share one name.
    #[error("asset {0:?} is defined more than once")]
    DuplicateAsset(String),

    /// File asset cannot be resolved to a URL.
    #[error("asset {0:?} is fetched as a file, but no base_url is set")]
    MissingBaseUrl(String),

    /// Destination escapes configuration root, or does not fit fetch strategy.
    #[error("asset {asset:?} has invalid destination {:?}", destination.display())]
    InvalidDestination { asset: String, destination: PathBuf },

    /// Patch rule names asset that does not exist.
    #[error("patch rule targets unknown asset {0:?}")]
    UnknownAsset(String),

    /// Patch rule names repository asset.
    #[error("patch rule targets repository asset {0:?}, only file assets can be patched")]
    RepositoryPatch(String),

    /// Patch rule matches on empty literal.
    #[error("patch rule for asset {0:?} matches on an empty literal")]
    EmptyLiteral(String),

    /// Replacement would match its own output.
    #[error("replacement {new:?} for asset {asset:?} reintroduces {old:?}")]
    SelfReplacing {
        asset: String,
        old: String,
        new: String,
    },

    /// Appended line would not satisfy its own presence check.
    #[error("append line {line:?} for asset {asset:?} lacks marker {marker:?}")]
    MissingMarker {
        asset: String,
        marker: String,
        line: String,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
