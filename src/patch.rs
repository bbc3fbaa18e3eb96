// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent content patching.
//!
//! Downloaded files rarely fit the host as-is. The preferences file names a
//! font that only exists on Windows, and it cannot know where the TeX
//! binaries ended up. The patcher fixes both kinds of problem with two rule
//! kinds:
//!
//! - __Replacement__: swap every exact occurrence of one literal for another.
//! - __Append-if-absent__: append a directive unless a marker of it already
//!   occurs anywhere in the file.
//!
//! Patching is a pure function of asset identity and text. It is also
//! idempotent: the rule set is applied until the text stops changing, so
//! patching already patched text is a no-op. A rule set that never settles
//! is reported as [`PatchError::Diverged`] instead of looping forever.

use crate::config::{AppendRule, OverlayDefinition, ReplaceRule};

use std::{collections::BTreeMap, string::FromUtf8Error};

const MAX_PASSES: usize = 8;

/// Apply replacement and append rules of an overlay definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patcher {
    replacements: Vec<ReplaceRule>,
    appends: Vec<AppendRule>,
    variables: BTreeMap<String, String>,
}

impl Patcher {
    /// Construct new patcher from rules of overlay definition.
    pub fn new(definition: &OverlayDefinition) -> Self {
        Self {
            replacements: definition.replacements.clone(),
            appends: definition.appends.clone(),
            variables: BTreeMap::new(),
        }
    }

    /// Provide value for `{name}` placeholders in appended lines.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Check if any rule targets asset.
    pub fn has_rules_for(&self, asset: &str) -> bool {
        self.replacements.iter().any(|rule| rule.asset == asset)
            || self.appends.iter().any(|rule| rule.asset == asset)
    }

    /// Patch text content of asset.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::Diverged`] if rules keep changing the text.
    pub fn patch(&self, asset: &str, text: &str) -> Result<String> {
        let mut current = text.to_owned();
        for _ in 0..MAX_PASSES {
            let next = self.apply_once(asset, &current);
            if next == current {
                return Ok(current);
            }
            current = next;
        }

        Err(PatchError::Diverged {
            asset: asset.into(),
            passes: MAX_PASSES,
        })
    }

    /// Patch raw content of asset.
    ///
    /// Content of assets without rules passes through untouched, so binary
    /// assets are never required to be text.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::NotUtf8`] if content of patched asset is not
    ///   UTF-8.
    /// - Return [`PatchError::Diverged`] if rules keep changing the text.
    pub fn patch_bytes(&self, asset: &str, content: Vec<u8>) -> Result<Vec<u8>> {
        if !self.has_rules_for(asset) {
            return Ok(content);
        }

        let text = String::from_utf8(content).map_err(|err| PatchError::NotUtf8 {
            asset: asset.into(),
            source: err,
        })?;

        Ok(self.patch(asset, &text)?.into_bytes())
    }

    fn apply_once(&self, asset: &str, text: &str) -> String {
        let mut out = text.to_owned();
        for rule in self.replacements.iter().filter(|rule| rule.asset == asset) {
            if out.contains(&rule.old) {
                out = out.replace(&rule.old, &rule.new);
            }
        }

        for rule in self.appends.iter().filter(|rule| rule.asset == asset) {
            if out.contains(&rule.marker) {
                continue;
            }

            // INVARIANT: Rules with unfilled placeholders are inactive.
            if let Some(line) = render(&rule.line, &self.variables) {
                append_line(&mut out, &line);
            }
        }

        out
    }
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text.push('\n');
}

fn render(template: &str, variables: &BTreeMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder(&after[..end]) => {
                out.push_str(variables.get(&after[..end])?);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    Some(out)
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Content patching error types.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Content of patched asset is not text.
    #[error("content of asset {asset:?} is not valid UTF-8")]
    NotUtf8 {
        asset: String,
        #[source]
        source: FromUtf8Error,
    },

    /// Rule set never reaches a fixed point.
    #[error("patch rules for asset {asset:?} did not settle after {passes} passes")]
    Diverged { asset: String, passes: usize },
}

/// Friendly result alias :3
pub type Result<T, E = PatchError> = std::result::Result<T, E>;
