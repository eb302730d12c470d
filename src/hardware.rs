// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Capabilities the applier needs from the device it runs on. The embedding
//! binary passes an implementation by shared reference instead of the applier
//! reaching into a global system-state object.

use std::path::{Path, PathBuf};

use crate::keyvalue::KeyValueStore;

pub const RELEASE_TRACK_KEY: &str = "CHROMEOS_RELEASE_TRACK";
pub const POWERWASH_ALLOWED_KEY: &str = "CHROMEOS_IS_POWERWASH_ALLOWED";

pub trait Hardware {
    /// Whether this device runs an official (signed release) build. Official
    /// builds never accept a public key delivered in the update response.
    fn is_official_build(&self) -> bool;

    /// Whether a payload is allowed to request a factory reset on this
    /// device.
    fn is_powerwash_allowed(&self) -> bool;
}

/// Reads build facts from an lsb-release style key/value file. A device with
/// no release file at all is treated as a developer build.
pub struct SystemHardware {
    release_file: PathBuf,
}

impl SystemHardware {
    pub fn new(release_file: &Path) -> Self {
        Self {
            release_file: release_file.to_owned(),
        }
    }
}

impl Hardware for SystemHardware {
    fn is_official_build(&self) -> bool {
        let Ok(store) = KeyValueStore::load(&self.release_file) else {
            return false;
        };

        // Developer builds carry a "test" marker track; anything on a plain
        // release track is official.
        match store.get_string(RELEASE_TRACK_KEY) {
            Some(track) => !track.starts_with("test"),
            None => false,
        }
    }

    fn is_powerwash_allowed(&self) -> bool {
        let Ok(store) = KeyValueStore::load(&self.release_file) else {
            return false;
        };

        store
            .get_bool(POWERWASH_ALLOWED_KEY)
            .unwrap_or(None)
            .unwrap_or(false)
    }
}

/// Test double with settable answers.
#[derive(Clone, Copy, Default)]
pub struct FakeHardware {
    pub official_build: bool,
    pub powerwash_allowed: bool,
}

impl FakeHardware {
    pub fn new(official_build: bool) -> Self {
        Self {
            official_build,
            powerwash_allowed: true,
        }
    }
}

impl Hardware for FakeHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn is_powerwash_allowed(&self) -> bool {
        self.powerwash_allowed
    }
}
