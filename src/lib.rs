/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! deltapply ships as a command line tool; this library surface exists for
//! the binary and the integration tests, and none of it is covered by the
//! CLI's semver guarantees.
//!
//! The `format` modules handle the wire formats, [`applier`] drives an update
//! attempt end to end, and the remaining modules are the supporting
//! infrastructure those two layers share.

pub mod applier;
pub mod cli;
pub mod crypto;
pub mod errorcode;
pub mod format;
pub mod hardware;
pub mod hash;
pub mod keyvalue;
pub mod plan;
pub mod prefs;
pub mod proto;
pub mod stream;
