// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

/// Input configuration for one update attempt, produced by the discovery
/// layer. The applier only reads it, except for `metadata_size`, which is
/// updated from the payload header when the discovery response left it unset
/// and hash checks are not mandatory.
#[derive(Clone, Debug, Default)]
pub struct InstallPlan {
    pub is_full_update: bool,
    /// Stable identifier for this payload, used to namespace resume state.
    pub payload_id: String,
    pub source_path: Option<PathBuf>,
    pub kernel_source_path: Option<PathBuf>,
    pub install_path: PathBuf,
    pub kernel_install_path: PathBuf,
    /// Expected total metadata size from the discovery response; 0 if unknown.
    pub metadata_size: u64,
    /// Base64-encoded serialized `Signatures` message covering the metadata
    /// region. May be empty.
    pub metadata_signature: String,
    pub hash_checks_mandatory: bool,
    /// Base64-encoded PEM public key from the discovery response. Only
    /// honored on non-official builds with no on-device key.
    pub public_key_rsa: String,
    pub powerwash_required: bool,
    /// Opaque slot label handed to the external boot controller.
    pub target_slot: String,
}
