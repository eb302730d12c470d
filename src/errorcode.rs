// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Terminal result codes for an update attempt.
//!
//! The discriminants are reporting ordinals shared with the rest of the
//! update pipeline and its metrics backend. They are append-only: never renumber
//! or reuse a value.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Error = 1,
    PostinstallRunnerError = 5,
    PayloadMismatchedType = 6,
    InstallDeviceOpenError = 7,
    KernelDeviceOpenError = 8,
    PayloadHashMismatchError = 10,
    DownloadNewPartitionInfoError = 13,
    DownloadWriteError = 14,
    SignedDeltaPayloadExpectedError = 17,
    DownloadPayloadPubKeyVerificationError = 18,
    PostinstallBootedFromFirmwareB = 19,
    DownloadStateInitializationError = 20,
    DownloadInvalidMetadataMagicString = 21,
    DownloadSignatureMissingInManifest = 22,
    DownloadManifestParseError = 23,
    DownloadMetadataSignatureError = 24,
    DownloadMetadataSignatureMismatch = 26,
    DownloadOperationExecutionError = 28,
    DownloadOperationHashMismatch = 29,
    DownloadInvalidMetadataSize = 32,
    DownloadOperationHashMissingError = 38,
    DownloadMetadataSignatureMissingError = 39,
    PostinstallPowerwashError = 41,
    PostinstallFirmwareRONotUpdatable = 43,
    UnsupportedMajorPayloadVersion = 44,
    UnsupportedMinorPayloadVersion = 45,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", *self as u32)
    }
}
