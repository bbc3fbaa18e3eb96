// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use lyxdot::{
    backup::BackupSession,
    config::{OverlayDefinition, PATH_PREFIX_VARIABLE},
    fetch::{Git2Sync, HttpDownloader},
    locate::{resolve_location, ConfigLocation, Platform},
    patch::Patcher,
    path::{default_definition_path, HostDirs},
    reconcile::{ConflictPolicy, Reconciler},
    texlive,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use mkdirp::mkdirp;
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    process::exit,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "lyxdot [options] <lyxdot-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Sync(opts) => run_sync(opts).await,
            Command::Locate(opts) => run_locate(opts),
            Command::Init(opts) => run_init(opts),
            Command::Patch(opts) => run_patch(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Deploy overlay into LyX configuration root.
    #[command(override_usage = "lyxdot sync [options]")]
    Sync(SyncOptions),

    /// Show which LyX configuration root would be used.
    #[command(override_usage = "lyxdot locate [options]")]
    Locate(LocateOptions),

    /// Write built-in overlay definition for editing.
    #[command(override_usage = "lyxdot init [options]")]
    Init(InitOptions),

    /// Patch local file as if it was downloaded for an asset.
    #[command(override_usage = "lyxdot patch [options] --asset <name> <file>")]
    Patch(PatchOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Path to overlay definition instead of the default one.
    #[arg(short, long, value_name = "path")]
    pub definition: Option<PathBuf>,

    /// Directory of TeX binaries instead of the detected one.
    #[arg(short, long, value_name = "path")]
    pub path_prefix: Option<String>,

    /// Only deploy named asset. Can be given more than once.
    #[arg(short, long, value_name = "name")]
    pub asset: Vec<String>,

    /// Back up working trees that cannot be pulled, and clone them fresh.
    #[arg(long)]
    pub reclone_on_conflict: bool,

    /// Ignore sandboxed configuration root.
    #[arg(long)]
    pub no_sandbox: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LocateOptions {
    /// Path to overlay definition instead of the default one.
    #[arg(short, long, value_name = "path")]
    pub definition: Option<PathBuf>,

    /// Ignore sandboxed configuration root.
    #[arg(long)]
    pub no_sandbox: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Where to write overlay definition instead of the default path.
    #[arg(value_name = "path")]
    pub path: Option<PathBuf>,

    /// Overwrite existing overlay definition.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PatchOptions {
    /// Name of asset whose patch rules apply.
    #[arg(short, long, required = true, value_name = "name")]
    pub asset: String,

    /// File to patch. Patched text goes to stdout.
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,

    /// Path to overlay definition instead of the default one.
    #[arg(short, long, value_name = "path")]
    pub definition: Option<PathBuf>,

    /// Directory of TeX binaries instead of the detected one.
    #[arg(short, long, value_name = "path")]
    pub path_prefix: Option<String>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

async fn run_sync(opts: SyncOptions) -> Result<()> {
    let definition = load_definition(opts.definition)?;
    for name in &opts.asset {
        if definition.asset(name).is_none() {
            bail!("overlay definition has no asset named {name:?}");
        }
    }

    let location = locate(&definition, opts.no_sandbox)?;
    info!("deploy overlay into {location}");

    let patcher = patcher_for(&definition, opts.path_prefix);
    let downloader = HttpDownloader::new(Duration::from_secs(definition.settings.timeout_secs))?;
    let backup_root = definition
        .settings
        .backup_root
        .clone()
        .unwrap_or_else(|| BackupSession::default_root(location.path()));
    let policy = if opts.reclone_on_conflict {
        ConflictPolicy::BackupAndReclone
    } else {
        ConflictPolicy::Report
    };

    let mut reconciler = Reconciler::new(
        &definition,
        &patcher,
        downloader,
        Git2Sync::with_progress(),
        BackupSession::new(backup_root, Local::now()),
    )
    .with_conflict_policy(policy);
    let summary = reconciler.run(&location, &opts.asset).await;

    print!("{summary}");
    if let Some(dir) = reconciler.backups().directory() {
        info!("displaced data backed up to {:?}", dir.display());
    }

    if !summary.is_success() {
        bail!("{} of the overlay's assets failed to deploy", summary.failed.len());
    }

    Ok(())
}

fn run_locate(opts: LocateOptions) -> Result<()> {
    let definition = load_definition(opts.definition)?;
    let location = locate(&definition, opts.no_sandbox)?;
    println!("{location}");
    if !location.exists() {
        info!("{:?} does not exist yet, sync will create it", location.path().display());
    }

    Ok(())
}

fn run_init(opts: InitOptions) -> Result<()> {
    let path = match opts.path {
        Some(path) => path,
        None => default_definition_path()?,
    };

    if path.exists() && !opts.force {
        bail!(
            "overlay definition {:?} already exists, use --force to overwrite it",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        mkdirp(parent)?;
    }
    write(&path, OverlayDefinition::builtin().to_string())
        .with_context(|| format!("failed to write {:?}", path.display()))?;
    info!("wrote overlay definition to {:?}", path.display());

    Ok(())
}

fn run_patch(opts: PatchOptions) -> Result<()> {
    let definition = load_definition(opts.definition)?;
    if definition.asset(&opts.asset).is_none() {
        bail!("overlay definition has no asset named {:?}", opts.asset);
    }

    let text = read_to_string(&opts.file)
        .with_context(|| format!("failed to read {:?}", opts.file.display()))?;
    let patched = patcher_for(&definition, opts.path_prefix).patch(&opts.asset, &text)?;
    print!("{patched}");

    Ok(())
}

fn load_definition(path: Option<PathBuf>) -> Result<OverlayDefinition> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (default_definition_path()?, false),
    };

    if !explicit && !path.exists() {
        info!("no overlay definition at {:?}, use built-in one", path.display());
        return Ok(OverlayDefinition::builtin());
    }

    let data = read_to_string(&path)
        .with_context(|| format!("failed to read overlay definition {:?}", path.display()))?;
    let definition = data
        .parse::<OverlayDefinition>()
        .with_context(|| format!("invalid overlay definition {:?}", path.display()))?;

    Ok(definition)
}

fn locate(definition: &OverlayDefinition, no_sandbox: bool) -> Result<ConfigLocation> {
    let host = HostDirs::detect()?;
    let sandbox = definition.settings.sandbox.as_ref().filter(|_| !no_sandbox);

    resolve_location(Platform::current(), sandbox, &host, &definition.settings)?.ok_or_else(|| {
        anyhow!(
            "cannot determine {} configuration root on this host",
            definition.settings.application
        )
    })
}

fn patcher_for(definition: &OverlayDefinition, path_prefix: Option<String>) -> Patcher {
    let path_prefix = path_prefix.or_else(|| {
        let root = definition
            .settings
            .texlive_root
            .clone()
            .unwrap_or_else(texlive::default_root);
        texlive::find_bin_dir(&root).map(|dir| dir.to_string_lossy().into_owned())
    });

    let patcher = Patcher::new(definition);
    match path_prefix {
        Some(path_prefix) => patcher.with_variable(PATH_PREFIX_VARIABLE, path_prefix),
        None => {
            warn!("no TeX Live binaries found, LyX path prefix is left alone");
            patcher
        }
    }
}
