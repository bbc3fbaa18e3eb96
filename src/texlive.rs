// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! TeX Live binary discovery.
//!
//! LyX cannot compile anything unless it can find the TeX binaries, which
//! TeX Live installs under `<root>/<year>/bin/<arch>`. The directory found
//! here becomes the `path_prefix` patch variable.

use std::{
    fs::read_dir,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Default TeX Live installation root of the current platform.
pub fn default_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\texlive")
    } else {
        PathBuf::from("/usr/local/texlive")
    }
}

/// Find binary directory of newest TeX Live release under `root`.
///
/// Picks the numerically greatest year directory, then the first
/// architecture directory in its `bin` directory by name. Returns `None` if
/// any piece is missing.
pub fn find_bin_dir(root: impl AsRef<Path>) -> Option<PathBuf> {
    let root = root.as_ref();
    let year = subdirs(root)
        .into_iter()
        .filter_map(|(name, path)| name.parse::<u32>().ok().map(|year| (year, path)))
        .max_by_key(|(year, _)| *year)
        .map(|(_, path)| path)?;

    let bin = year.join("bin");
    let arch = subdirs(&bin)
        .into_iter()
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, path)| path);

    debug!("TeX Live binaries under {:?}: {:?}", root.display(), arch);
    arch
}

fn subdirs(path: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = read_dir(path) else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            Some((name, entry.path()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, write};
    use tempfile::TempDir;

    #[test]
    fn pick_newest_year_numerically() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        create_dir_all(root.path().join("999/bin/x86_64-linux"))?;
        create_dir_all(root.path().join("2023/bin/x86_64-linux"))?;
        create_dir_all(root.path().join("2024/bin/x86_64-linux"))?;
        create_dir_all(root.path().join("2024/bin/aarch64-linux"))?;
        create_dir_all(root.path().join("texmf-local"))?;

        let result = find_bin_dir(root.path());
        assert_eq!(result, Some(root.path().join("2024/bin/aarch64-linux")));

        Ok(())
    }

    #[test]
    fn nothing_found_without_bin() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        create_dir_all(root.path().join("2024"))?;
        write(root.path().join("2025"), "not a directory")?;

        assert_eq!(find_bin_dir(root.path()), None);
        assert_eq!(find_bin_dir(root.path().join("missing")), None);

        Ok(())
    }
}
