// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deploy a curated LyX configuration overlay.
//!
//! An __overlay__ is a set of remote assets, single files served over HTTP
//! or whole Git repositories, that should end up inside the user's LyX
//! configuration root. Deploying the overlay means resolving where that root
//! lives on this host, bringing every asset's destination into agreement with
//! its remote, and patching downloaded content so it fits the host.
//!
//! Every run is safe to repeat. Data that lyxdot did not put in place is
//! moved into a timestamped backup, never deleted.

pub mod backup;
pub mod config;
pub mod fetch;
pub mod locate;
pub mod patch;
pub mod path;
pub mod reconcile;
pub mod texlive;
