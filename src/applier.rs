/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The streaming payload applier. It absorbs download chunks, verifies the
//! envelope as it arrives, and executes install operations against the target
//! devices, checkpointing after each completed operation.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use prost::Message;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    crypto,
    errorcode::ErrorCode,
    format::{
        bspatch,
        extent::{self, ExtentRanges},
        payload::{self, HeaderInfo, BLOCK_SIZE, FULL_PAYLOAD_MINOR_VERSION,
            SUPPORTED_MINOR_VERSIONS},
    },
    hardware::Hardware,
    hash::ResumableSha256,
    plan::InstallPlan,
    prefs::{Checkpoint, Prefs},
    proto::{install_operation::Type as OpType, DeltaArchiveManifest, InstallOperation,
        PartitionInfo},
    stream,
};

/// Default on-device location of the payload verification key.
pub const PUBLIC_KEY_PATH: &str = "/usr/share/deltapply/payload-key.pub.pem";

/// Manifests larger than this are rejected before buffering them.
const MAX_MANIFEST_SIZE: u64 = 64 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("A previous write already failed: {0}")]
    AlreadyFailed(ErrorCode),
    #[error("Update ended before the payload was complete")]
    Incomplete,
    #[error("Metadata size should be {expected}, but is {actual}")]
    MetadataSizeMismatch { expected: u64, actual: u64 },
    #[error("Manifest size {0} exceeds the maximum")]
    ManifestTooLarge(u64),
    #[error("Metadata signature is missing")]
    MetadataSignatureMissing,
    #[error("Failed to load metadata signature")]
    MetadataSignatureParse(#[source] crypto::Error),
    #[error("Metadata signature cannot be verified without a public key")]
    MetadataSignatureNoKey,
    #[error("Metadata signature does not match the metadata")]
    MetadataSignatureMismatch(#[source] crypto::Error),
    #[error("Failed to load public key")]
    PublicKey(#[source] crypto::Error),
    #[error("Failed to parse manifest")]
    ManifestParse(#[source] prost::DecodeError),
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(&'static str),
    #[error("Payload type does not match the install plan: {0}")]
    MismatchedType(&'static str),
    #[error("Unsupported minor payload version: {0:?}")]
    UnsupportedMinorVersion(Option<u32>),
    #[error("Operation #{0} carries data but no hash, and hash checks are mandatory")]
    OperationHashMissing(usize),
    #[error("Operation #{0} data hash mismatch")]
    OperationHashMismatch(usize),
    #[error("Operation #{index} failed")]
    OperationExecution {
        index: usize,
        #[source]
        source: BoxError,
    },
    #[error("Payload signature does not match the payload")]
    PayloadSignatureMismatch(#[source] crypto::Error),
    #[error("Payload is unsigned, but hash checks are mandatory")]
    SignatureMissing,
    #[error("New {0} partition hash mismatch")]
    NewPartitionHashMismatch(&'static str),
    #[error("New {0} partition info is invalid")]
    NewPartitionInfoInvalid(&'static str),
    #[error("Source {0} partition hash mismatch")]
    SourcePartitionHashMismatch(&'static str),
    #[error("Failed to open install device: {0:?}")]
    InstallOpen(PathBuf, #[source] io::Error),
    #[error("Failed to open kernel device: {0:?}")]
    KernelOpen(PathBuf, #[source] io::Error),
    #[error("Failed to open source device: {0:?}")]
    SourceOpen(PathBuf, #[source] io::Error),
    #[error("Payload error")]
    Payload(#[from] payload::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Terminal reporting code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyFailed(code) => *code,
            Self::Incomplete => ErrorCode::Error,
            Self::MetadataSizeMismatch { .. } => ErrorCode::DownloadInvalidMetadataSize,
            Self::ManifestTooLarge(_) => ErrorCode::DownloadManifestParseError,
            Self::MetadataSignatureMissing => ErrorCode::DownloadMetadataSignatureMissingError,
            Self::MetadataSignatureParse(_) => ErrorCode::DownloadMetadataSignatureError,
            Self::MetadataSignatureNoKey => ErrorCode::DownloadMetadataSignatureError,
            Self::MetadataSignatureMismatch(_) => ErrorCode::DownloadMetadataSignatureMismatch,
            Self::PublicKey(_) => ErrorCode::DownloadMetadataSignatureError,
            Self::ManifestParse(_) => ErrorCode::DownloadManifestParseError,
            Self::ManifestInvalid(_) => ErrorCode::DownloadManifestParseError,
            Self::MismatchedType(_) => ErrorCode::PayloadMismatchedType,
            Self::UnsupportedMinorVersion(_) => ErrorCode::UnsupportedMinorPayloadVersion,
            Self::OperationHashMissing(_) => ErrorCode::DownloadOperationHashMissingError,
            Self::OperationHashMismatch(_) => ErrorCode::DownloadOperationHashMismatch,
            Self::OperationExecution { .. } => ErrorCode::DownloadOperationExecutionError,
            Self::PayloadSignatureMismatch(_) => {
                ErrorCode::DownloadPayloadPubKeyVerificationError
            }
            Self::SignatureMissing => ErrorCode::SignedDeltaPayloadExpectedError,
            Self::NewPartitionHashMismatch(_) => ErrorCode::PayloadHashMismatchError,
            Self::NewPartitionInfoInvalid(_) => ErrorCode::DownloadNewPartitionInfoError,
            Self::SourcePartitionHashMismatch(_) => {
                ErrorCode::DownloadStateInitializationError
            }
            Self::InstallOpen(..) => ErrorCode::InstallDeviceOpenError,
            Self::KernelOpen(..) => ErrorCode::KernelDeviceOpenError,
            Self::SourceOpen(..) => ErrorCode::InstallDeviceOpenError,
            Self::Payload(e) => match e {
                payload::Error::UnknownMagic(_) => {
                    ErrorCode::DownloadInvalidMetadataMagicString
                }
                payload::Error::UnsupportedVersion(_) => {
                    ErrorCode::UnsupportedMajorPayloadVersion
                }
                payload::Error::Crypto(_) => ErrorCode::DownloadMetadataSignatureError,
                payload::Error::Io(_) => ErrorCode::DownloadWriteError,
                _ => ErrorCode::DownloadManifestParseError,
            },
            Self::Io(_) => ErrorCode::DownloadWriteError,
        }
    }
}

/// Receiver for download progress notifications. Notifications are strictly
/// monotonic in `bytes_so_far`.
pub trait ProgressSink {
    fn download_progress(&self, bytes_so_far: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Partition {
    Rootfs,
    Kernel,
}

impl Partition {
    fn name(self) -> &'static str {
        match self {
            Self::Rootfs => "rootfs",
            Self::Kernel => "kernel",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    WaitHeader,
    WaitMetadata,
    Executing,
    WaitSignatures,
    Done,
    Failed(ErrorCode),
}

/// Streaming applier for one update attempt.
///
/// The caller opens the target (and, for delta payloads, source) devices and
/// then delivers the payload in arbitrary chunks via [`Self::write_chunk`] or
/// the [`Write`] impl. A failure latches: the terminal [`ErrorCode`] stays
/// readable via [`Self::error_code`] and all further writes are rejected.
pub struct Applier<'a> {
    plan: InstallPlan,
    prefs: &'a dyn Prefs,
    hardware: &'a dyn Hardware,
    progress: Option<&'a dyn ProgressSink>,
    cancel_signal: &'a AtomicBool,

    public_key_path: PathBuf,
    staged_key: Option<NamedTempFile>,

    install_file: Option<File>,
    kernel_file: Option<File>,
    source_file: Option<File>,
    source_kernel_file: Option<File>,

    state: State,
    buffer: Vec<u8>,
    total_bytes_received: u64,

    header: Option<HeaderInfo>,
    manifest: Option<DeltaArchiveManifest>,
    manifest_digest: [u8; 32],
    metadata_signature_verified: bool,

    ops: Vec<(Partition, InstallOperation)>,
    next_op: usize,
    /// Bytes of the data region consumed so far.
    data_offset: u64,
    /// Digest of every signed byte seen so far (signature blobs excluded).
    signed_hash: ResumableSha256,

    /// Checkpoint loaded at construction, adopted once the metadata matches.
    stored_checkpoint: Option<Checkpoint>,
    resumed: bool,

    error: Option<ErrorCode>,
}

impl<'a> Applier<'a> {
    pub fn new(
        plan: InstallPlan,
        prefs: &'a dyn Prefs,
        hardware: &'a dyn Hardware,
        cancel_signal: &'a AtomicBool,
    ) -> Self {
        let stored_checkpoint = match Checkpoint::load(prefs, &plan.payload_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Discarding unreadable checkpoint: {e}");
                let _ = Checkpoint::clear(prefs, &plan.payload_id);
                None
            }
        };

        Self {
            plan,
            prefs,
            hardware,
            progress: None,
            cancel_signal,
            public_key_path: PathBuf::from(PUBLIC_KEY_PATH),
            staged_key: None,
            install_file: None,
            kernel_file: None,
            source_file: None,
            source_kernel_file: None,
            state: State::WaitHeader,
            buffer: vec![],
            total_bytes_received: 0,
            header: None,
            manifest: None,
            manifest_digest: [0u8; 32],
            metadata_signature_verified: false,
            ops: vec![],
            next_op: 0,
            data_offset: 0,
            signed_hash: ResumableSha256::new(),
            stored_checkpoint,
            resumed: false,
            error: None,
        }
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Override the on-device public key location. Intended for tests.
    pub fn set_public_key_path(&mut self, path: &Path) {
        self.public_key_path = path.to_owned();
    }

    pub fn open_install(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::InstallOpen(path.to_owned(), e))?;

        self.install_file = Some(file);
        Ok(())
    }

    pub fn open_kernel(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::KernelOpen(path.to_owned(), e))?;

        self.kernel_file = Some(file);
        Ok(())
    }

    pub fn open_source_rootfs(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| Error::SourceOpen(path.to_owned(), e))?;
        self.source_file = Some(file);
        Ok(())
    }

    pub fn open_source_kernel(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| Error::SourceOpen(path.to_owned(), e))?;
        self.source_kernel_file = Some(file);
        Ok(())
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    pub fn is_header_parsed(&self) -> bool {
        self.header.is_some()
    }

    /// Parsed major version, or 0 before the header has been seen.
    pub fn major_version(&self) -> u64 {
        self.header.map_or(0, |h| h.major_version)
    }

    /// File offset of the serialized manifest, once the header is parsed.
    pub fn manifest_offset(&self) -> Option<u64> {
        self.header.map(|h| h.manifest_offset())
    }

    /// Total metadata size computed from the header, or 0 before parsing.
    pub fn metadata_size(&self) -> u64 {
        self.header.map_or(0, |h| h.metadata_size())
    }

    /// Whether a stored checkpoint was adopted for this payload.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Payload file offset at which the caller should resume delivery after
    /// the metadata has been re-delivered.
    pub fn resume_offset(&self) -> u64 {
        self.metadata_size() + self.data_offset
    }

    /// Latched terminal error, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error
    }

    pub fn powerwash_required(&self) -> bool {
        self.plan.powerwash_required
    }

    pub fn target_slot(&self) -> &str {
        &self.plan.target_slot
    }

    /// Absorb the next chunk of the payload stream. Returns an error on the
    /// first inconsistency; afterwards the applier refuses further data.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if let State::Failed(code) = self.state {
            return Err(Error::AlreadyFailed(code));
        }

        stream::check_cancel(self.cancel_signal)?;

        self.buffer.extend_from_slice(data);
        self.total_bytes_received += data.len() as u64;

        if let Some(sink) = self.progress {
            sink.download_progress(self.total_bytes_received);
        }

        match self.advance() {
            Ok(()) => Ok(()),
            Err(e) => {
                let code = e.code();
                self.state = State::Failed(code);
                self.error = Some(code);
                Err(e)
            }
        }
    }

    /// Finish the update attempt. Succeeds only when the payload was fully
    /// applied and verified.
    pub fn close(&mut self) -> Result<()> {
        self.install_file = None;
        self.kernel_file = None;
        self.source_file = None;
        self.source_kernel_file = None;

        match self.state {
            State::Done => Ok(()),
            State::Failed(code) => Err(Error::AlreadyFailed(code)),
            _ => {
                self.error.get_or_insert(ErrorCode::Error);
                Err(Error::Incomplete)
            }
        }
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::WaitHeader => {
                    let Some(header) = payload::parse_header_prefix(&self.buffer)? else {
                        return Ok(());
                    };

                    if header.manifest_size > MAX_MANIFEST_SIZE {
                        return Err(Error::ManifestTooLarge(header.manifest_size));
                    }

                    self.header = Some(header);
                    self.check_metadata_size(&header)?;
                    self.state = State::WaitMetadata;
                }
                State::WaitMetadata => {
                    let header = self.header.unwrap();
                    if (self.buffer.len() as u64) < header.metadata_size() {
                        return Ok(());
                    }

                    self.parse_and_validate_metadata()?;
                    self.state = State::Executing;
                }
                State::Executing => {
                    if !self.execute_ready_ops()? {
                        return Ok(());
                    }

                    let manifest = self.manifest.as_ref().unwrap();
                    if manifest.signatures_offset.unwrap_or(0) > 0 {
                        self.state = State::WaitSignatures;
                    } else {
                        self.finalize()?;
                        self.state = State::Done;
                    }
                }
                State::WaitSignatures => {
                    if !self.consume_payload_signature()? {
                        return Ok(());
                    }

                    self.finalize()?;
                    self.state = State::Done;
                }
                State::Done => {
                    if !self.buffer.is_empty() {
                        debug!(
                            "Ignoring {} bytes past the end of the payload",
                            self.buffer.len(),
                        );
                        self.buffer.clear();
                    }
                    return Ok(());
                }
                State::Failed(code) => return Err(Error::AlreadyFailed(code)),
            }
        }
    }

    /// Cross-check the computed metadata size against the discovery response.
    fn check_metadata_size(&mut self, header: &HeaderInfo) -> Result<()> {
        let actual = header.metadata_size();

        if self.plan.metadata_size != actual {
            if self.plan.hash_checks_mandatory {
                return Err(Error::MetadataSizeMismatch {
                    expected: self.plan.metadata_size,
                    actual,
                });
            }

            // Soft-check regime: trust the payload's own value, but leave a
            // trace since a zero here means the discovery response never
            // carried one.
            warn!(
                "Updating metadata size from {} to {}",
                self.plan.metadata_size, actual,
            );
            self.plan.metadata_size = actual;
        }

        Ok(())
    }

    fn resolve_public_key(&mut self) -> Result<Option<RsaPublicKey>> {
        if self.public_key_path.exists() {
            let key = crypto::read_pem_public_key_file(&self.public_key_path)
                .map_err(Error::PublicKey)?;
            return Ok(Some(key));
        }

        if let Some(staged) = self.public_key_from_response()? {
            let key = crypto::read_pem_public_key_file(staged).map_err(Error::PublicKey)?;
            return Ok(Some(key));
        }

        Ok(None)
    }

    /// Stage the public key delivered in the discovery response, if it is
    /// usable: only on non-official builds, only when there is no on-device
    /// key, and only when the blob is valid base64.
    pub fn public_key_from_response(&mut self) -> Result<Option<&Path>> {
        if self.hardware.is_official_build()
            || self.public_key_path.exists()
            || self.plan.public_key_rsa.is_empty()
        {
            return Ok(None);
        }

        if self.staged_key.is_none() {
            let staged = crypto::stage_key_from_base64(&self.plan.public_key_rsa)
                .map_err(Error::PublicKey)?;

            info!("Using public key from the update response");
            self.staged_key = Some(staged);
        }

        Ok(self.staged_key.as_ref().map(|f| f.path()))
    }

    fn check_metadata_signature(
        &mut self,
        signed_bytes: &[u8],
        payload_signature_blob: &[u8],
    ) -> Result<()> {
        let signatures = if !self.plan.metadata_signature.is_empty() {
            crypto::parse_signatures_base64(&self.plan.metadata_signature)
                .map_err(Error::MetadataSignatureParse)?
        } else if !payload_signature_blob.is_empty() {
            crypto::parse_signatures(payload_signature_blob)
                .map_err(Error::MetadataSignatureParse)?
        } else {
            return Err(Error::MetadataSignatureMissing);
        };

        let Some(key) = self.resolve_public_key()? else {
            return Err(Error::MetadataSignatureNoKey);
        };

        let digest: [u8; 32] = Sha256::digest(signed_bytes).into();
        crypto::verify_digest(&digest, &signatures, &key)
            .map_err(Error::MetadataSignatureMismatch)?;

        Ok(())
    }

    /// Validate the type-level manifest rules against the install plan.
    pub fn validate_manifest(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        let minor_version = manifest.minor_version();

        if self.plan.is_full_update {
            if manifest.old_rootfs_info.is_some() || manifest.old_kernel_info.is_some() {
                return Err(Error::MismatchedType(
                    "full payload must not carry old partition info",
                ));
            }
            if minor_version != FULL_PAYLOAD_MINOR_VERSION {
                return Err(Error::UnsupportedMinorVersion(Some(minor_version)));
            }
        } else {
            if manifest.minor_version.is_none() {
                return Err(Error::UnsupportedMinorVersion(None));
            }
            if !SUPPORTED_MINOR_VERSIONS.contains(&minor_version) {
                return Err(Error::UnsupportedMinorVersion(Some(minor_version)));
            }
            if manifest.new_rootfs_info.is_none() || manifest.new_kernel_info.is_none() {
                return Err(Error::MismatchedType(
                    "delta payload must carry new partition info",
                ));
            }
        }

        Ok(())
    }

    /// Validate the structural invariants: block size, data region tiling,
    /// extent bounds, and destination coverage.
    fn validate_manifest_structure(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        if manifest.block_size_or_default() != BLOCK_SIZE {
            return Err(Error::ManifestInvalid("unsupported block size"));
        }

        let block_size = u64::from(BLOCK_SIZE);
        let mut data_offset: u64 = 0;

        let all_ops = manifest
            .install_operations
            .iter()
            .map(|op| (Partition::Rootfs, op))
            .chain(
                manifest
                    .kernel_install_operations
                    .iter()
                    .map(|op| (Partition::Kernel, op)),
            );

        for (partition, op) in all_ops {
            let Some(op_type) = op.op_type() else {
                return Err(Error::ManifestInvalid("unknown operation type"));
            };

            let needs_data = matches!(
                op_type,
                OpType::Replace
                    | OpType::ReplaceBz
                    | OpType::ReplaceXz
                    | OpType::Bsdiff
                    | OpType::SourceBsdiff
            );
            let data_length = op.data_length.unwrap_or(0);

            if needs_data && data_length == 0 {
                return Err(Error::ManifestInvalid("operation is missing its data"));
            }
            if !needs_data && data_length != 0 {
                return Err(Error::ManifestInvalid("operation must not carry data"));
            }

            // Blobs must tile the data region in order with no gaps.
            if data_length > 0 {
                if op.data_offset != Some(data_offset) {
                    return Err(Error::ManifestInvalid("operation data is not contiguous"));
                }
                data_offset += data_length;
            }

            if op.dst_extents.is_empty() {
                return Err(Error::ManifestInvalid("operation has no destination"));
            }

            if self.plan.is_full_update && !op.src_extents.is_empty() {
                return Err(Error::ManifestInvalid(
                    "full payload must not read source extents",
                ));
            }

            // Source extents must stay within the declared old image.
            let old_info = match partition {
                Partition::Rootfs => &manifest.old_rootfs_info,
                Partition::Kernel => &manifest.old_kernel_info,
            };
            if let Some(old_size) = old_info.as_ref().and_then(|i| i.size) {
                let old_blocks = old_size.div_ceil(block_size);
                for ext in &op.src_extents {
                    let start = ext.start_block.unwrap_or(0);
                    let num = ext.num_blocks.unwrap_or(0);
                    if start != extent::SPARSE_HOLE && start + num > old_blocks {
                        return Err(Error::ManifestInvalid(
                            "source extent outside the old image",
                        ));
                    }
                }
            }
        }

        if let Some(signatures_offset) = manifest.signatures_offset {
            if signatures_offset > 0 && signatures_offset != data_offset {
                return Err(Error::ManifestInvalid(
                    "signature blob does not follow the last operation",
                ));
            }
        }

        // A full payload must write every block of the new image.
        if self.plan.is_full_update {
            for (ops, info, what) in [
                (
                    &manifest.install_operations,
                    &manifest.new_rootfs_info,
                    "rootfs coverage is not exact",
                ),
                (
                    &manifest.kernel_install_operations,
                    &manifest.new_kernel_info,
                    "kernel coverage is not exact",
                ),
            ] {
                let Some(new_size) = info.as_ref().and_then(|i| i.size) else {
                    continue;
                };

                let mut ranges = ExtentRanges::new();
                for op in ops.iter() {
                    ranges
                        .add_extents(&op.dst_extents)
                        .map_err(|_| Error::ManifestInvalid("invalid destination extent"))?;
                }

                if !ranges.covers_exactly(new_size.div_ceil(block_size)) {
                    return Err(Error::ManifestInvalid(what));
                }
            }
        }

        Ok(())
    }

    fn parse_and_validate_metadata(&mut self) -> Result<()> {
        let header = self.header.unwrap();
        let manifest_offset = header.manifest_offset() as usize;
        let manifest_size = header.manifest_size as usize;
        let signed_size = header.signed_metadata_size() as usize;
        let metadata_size = header.metadata_size() as usize;

        let metadata = self.buffer[..metadata_size].to_vec();
        let signed_bytes = &metadata[..signed_size];
        let manifest_raw = &metadata[manifest_offset..manifest_offset + manifest_size];
        let signature_blob = &metadata[signed_size..];

        match self.check_metadata_signature(signed_bytes, signature_blob) {
            Ok(()) => {
                info!("Metadata signature verified");
                self.metadata_signature_verified = true;
            }
            Err(e) if self.plan.hash_checks_mandatory => return Err(e),
            Err(e) => {
                warn!("Ignoring metadata signature failure: {e}");
            }
        }

        let manifest =
            DeltaArchiveManifest::decode(manifest_raw).map_err(Error::ManifestParse)?;
        self.manifest_digest = <[u8; 32]>::from(Sha256::digest(manifest_raw));

        self.validate_manifest(&manifest)?;
        self.validate_manifest_structure(&manifest)?;

        self.ops = manifest
            .install_operations
            .iter()
            .cloned()
            .map(|op| (Partition::Rootfs, op))
            .chain(
                manifest
                    .kernel_install_operations
                    .iter()
                    .cloned()
                    .map(|op| (Partition::Kernel, op)),
            )
            .collect();
        self.manifest = Some(manifest);

        self.adopt_checkpoint(&header)?;
        if !self.resumed {
            self.signed_hash.update(signed_bytes);
        }

        self.verify_source_partitions()?;

        self.buffer.drain(..metadata_size);

        info!(
            "Parsed manifest: {} operations, minor version {}",
            self.ops.len(),
            self.manifest.as_ref().unwrap().minor_version(),
        );

        Ok(())
    }

    /// Adopt a stored checkpoint when it matches the payload we are being
    /// fed; otherwise discard it and start from scratch.
    fn adopt_checkpoint(&mut self, header: &HeaderInfo) -> Result<()> {
        let Some(checkpoint) = self.stored_checkpoint.take() else {
            return Ok(());
        };

        let consistent = checkpoint.major_version == header.major_version
            && checkpoint.metadata_size == header.metadata_size()
            && checkpoint.manifest_digest == self.manifest_digest
            && checkpoint.next_operation <= self.ops.len();

        if !consistent {
            warn!("Stored checkpoint does not match this payload; restarting");
            let _ = Checkpoint::clear(self.prefs, &self.plan.payload_id);
            return Ok(());
        }

        match ResumableSha256::restore(&checkpoint.sha256_state) {
            Ok(hash) => {
                info!(
                    "Resuming at operation {} (data offset {})",
                    checkpoint.next_operation, checkpoint.data_offset,
                );
                self.signed_hash = hash;
                self.next_op = checkpoint.next_operation;
                self.data_offset = checkpoint.data_offset;
                self.resumed = true;
            }
            Err(e) => {
                warn!("Discarding checkpoint with invalid digest state: {e}");
                let _ = Checkpoint::clear(self.prefs, &self.plan.payload_id);
            }
        }

        Ok(())
    }

    /// For delta payloads, confirm the source partitions still match what the
    /// payload was generated against before transforming anything.
    fn verify_source_partitions(&mut self) -> Result<()> {
        let manifest = self.manifest.as_ref().unwrap();

        for (file, info, name) in [
            (
                self.source_file.as_mut(),
                manifest.old_rootfs_info.clone(),
                Partition::Rootfs.name(),
            ),
            (
                self.source_kernel_file.as_mut(),
                manifest.old_kernel_info.clone(),
                Partition::Kernel.name(),
            ),
        ] {
            let (Some(file), Some(info)) = (file, info) else {
                continue;
            };
            let (Some(size), Some(hash)) = (info.size, info.hash.as_ref()) else {
                continue;
            };
            if hash.is_empty() {
                continue;
            }

            let digest = hash_file_prefix(file, size, self.cancel_signal)?;
            if digest.as_slice() != hash.as_slice() {
                return Err(Error::SourcePartitionHashMismatch(name));
            }

            debug!("Verified source {name} partition hash");
        }

        Ok(())
    }

    /// Run every operation whose data is fully buffered. Returns `Ok(true)`
    /// once all operations have completed.
    fn execute_ready_ops(&mut self) -> Result<bool> {
        while self.next_op < self.ops.len() {
            let (partition, op) = self.ops[self.next_op].clone();
            let index = self.next_op;
            let data_length = op.data_length.unwrap_or(0) as usize;

            if data_length > 0 {
                if op.data_offset != Some(self.data_offset) {
                    return Err(Error::OperationExecution {
                        index,
                        source: "operation data offset does not match the stream".into(),
                    });
                }
                if self.buffer.len() < data_length {
                    return Ok(false);
                }
            }

            let data = self.buffer[..data_length].to_vec();

            self.validate_operation_hash(index, &op, &data)?;
            self.perform_operation(partition, &op, &data)
                .map_err(|source| Error::OperationExecution { index, source })?;

            self.signed_hash.update(&data);
            self.buffer.drain(..data_length);
            self.data_offset += data_length as u64;
            self.next_op += 1;

            self.sync_target(partition)
                .map_err(|source| Error::OperationExecution { index, source })?;
            self.store_checkpoint();

            debug!(
                "Completed operation {index} ({:?}) on {}",
                op.op_type(),
                partition.name(),
            );
        }

        Ok(true)
    }

    fn validate_operation_hash(
        &self,
        index: usize,
        op: &InstallOperation,
        data: &[u8],
    ) -> Result<()> {
        match &op.data_sha256_hash {
            Some(expected) => {
                let digest: [u8; 32] = Sha256::digest(data).into();
                if digest.as_slice() != expected.as_slice() {
                    return Err(Error::OperationHashMismatch(index));
                }
            }
            None if !data.is_empty() => {
                if self.plan.hash_checks_mandatory {
                    return Err(Error::OperationHashMissing(index));
                }
                debug!("Operation {index} carries no data hash; skipping check");
            }
            None => {}
        }

        Ok(())
    }

    fn perform_operation(
        &mut self,
        partition: Partition,
        op: &InstallOperation,
        data: &[u8],
    ) -> std::result::Result<(), BoxError> {
        let block_size = u64::from(BLOCK_SIZE);
        let op_type = op
            .op_type()
            .ok_or_else(|| BoxError::from(format!("unknown operation type {}", op.r#type)))?;
        let dst_bytes = extent::extents_bytes(&op.dst_extents, block_size)?;

        // Everything except ZERO reduces to "produce the output bytes, then
        // write them across the destination extents".
        let out: Vec<u8> = match op_type {
            OpType::Zero => {
                let target = self.target_file(partition)?;
                for range in extent::byte_ranges(&op.dst_extents, block_size, None)? {
                    if let Some(offset) = range.offset {
                        target.seek(SeekFrom::Start(offset))?;
                        stream::write_zeros(&mut *target, range.length)?;
                    }
                }
                return Ok(());
            }
            OpType::Replace => {
                if data.len() as u64 != dst_bytes {
                    return Err("replace data does not fit the destination exactly".into());
                }
                data.to_vec()
            }
            OpType::ReplaceBz => {
                let out = bounded_decompress(
                    bzip2::read::BzDecoder::new(data),
                    dst_bytes,
                    self.cancel_signal,
                )?;
                if out.len() as u64 != dst_bytes {
                    return Err("bzip2 output does not fit the destination exactly".into());
                }
                out
            }
            OpType::ReplaceXz => {
                let mut out = bounded_decompress(
                    xz2::read::XzDecoder::new(data),
                    dst_bytes,
                    self.cancel_signal,
                )?;
                // The trailing partial block is zero padded.
                out.resize(dst_bytes as usize, 0);
                out
            }
            OpType::SourceCopy => {
                let src_bytes = extent::extents_bytes(&op.src_extents, block_size)?;
                if src_bytes != dst_bytes {
                    return Err("source and destination extent sizes differ".into());
                }

                let source = self.source_file(partition)?;
                extent::read_extents(source, &op.src_extents, block_size, None)?
            }
            OpType::Move => {
                let src_bytes = extent::extents_bytes(&op.src_extents, block_size)?;
                if src_bytes != dst_bytes {
                    return Err("source and destination extent sizes differ".into());
                }

                // Source and destination may alias on the install device, so
                // every referenced source block is buffered before the first
                // write.
                if extents_overlap(&op.src_extents, &op.dst_extents)? {
                    debug!("Move source aliases its destination; relying on the full pre-read");
                }

                let target = self.target_file(partition)?;
                extent::read_extents(target, &op.src_extents, block_size, None)?
            }
            OpType::Bsdiff | OpType::SourceBsdiff => {
                if op_type == OpType::Bsdiff
                    && extents_overlap(&op.src_extents, &op.dst_extents)?
                {
                    debug!("Patch input aliases its destination; relying on the full pre-read");
                }

                let old_file = match op_type {
                    // Reads the install device; same pre-read rule as MOVE.
                    OpType::Bsdiff => self.target_file(partition)?,
                    _ => self.source_file(partition)?,
                };
                let old = extent::read_extents(
                    old_file,
                    &op.src_extents,
                    block_size,
                    op.src_length,
                )?;

                debug!(
                    "Applying bsdiff patch; old positions {:?}",
                    extent::bsdiff_positions_string(
                        &op.src_extents,
                        block_size,
                        op.src_length.unwrap_or(
                            extent::extents_bytes(&op.src_extents, block_size)?,
                        ),
                    ),
                );

                let new = bspatch::apply(&old, data)?;

                if let Some(dst_length) = op.dst_length {
                    if new.len() as u64 != dst_length {
                        return Err("patch output length mismatch".into());
                    }
                }
                if new.len() as u64 > dst_bytes {
                    return Err("patch output exceeds the destination".into());
                }
                new
            }
            OpType::Discard => {
                return Err("DISCARD operations are not supported".into());
            }
        };

        let target = self.target_file(partition)?;
        extent::write_extents(target, &op.dst_extents, block_size, &out)?;

        Ok(())
    }

    fn target_file(&mut self, partition: Partition) -> std::result::Result<&mut File, BoxError> {
        let file = match partition {
            Partition::Rootfs => self.install_file.as_mut(),
            Partition::Kernel => self.kernel_file.as_mut(),
        };

        file.ok_or_else(|| format!("{} install device is not open", partition.name()).into())
    }

    fn source_file(&mut self, partition: Partition) -> std::result::Result<&mut File, BoxError> {
        let file = match partition {
            Partition::Rootfs => self.source_file.as_mut(),
            Partition::Kernel => self.source_kernel_file.as_mut(),
        };

        file.ok_or_else(|| format!("{} source device is not open", partition.name()).into())
    }

    fn sync_target(&mut self, partition: Partition) -> std::result::Result<(), BoxError> {
        let file = match partition {
            Partition::Rootfs => self.install_file.as_ref(),
            Partition::Kernel => self.kernel_file.as_ref(),
        };

        if let Some(file) = file {
            file.sync_data()?;
        }

        Ok(())
    }

    /// Persist the resume state. Failing to write it never fails the update;
    /// it only costs a restart from scratch later.
    fn store_checkpoint(&mut self) {
        let Some(header) = self.header else {
            return;
        };

        let checkpoint = Checkpoint {
            major_version: header.major_version,
            metadata_size: header.metadata_size(),
            manifest_digest: self.manifest_digest,
            next_operation: self.next_op,
            data_offset: self.data_offset,
            sha256_state: self.signed_hash.state(),
        };

        if let Err(e) = checkpoint.store(self.prefs, &self.plan.payload_id) {
            warn!("Failed to persist checkpoint: {e}");
        }
    }

    /// Buffer and verify the payload signature blob that trails the last
    /// operation's data. Returns `Ok(false)` while more bytes are needed.
    fn consume_payload_signature(&mut self) -> Result<bool> {
        let manifest = self.manifest.as_ref().unwrap();
        let signatures_offset = manifest.signatures_offset.unwrap();
        let signatures_size = manifest
            .signatures_size
            .ok_or(Error::ManifestInvalid("signatures_size is missing"))?;

        if self.data_offset != signatures_offset {
            return Err(Error::ManifestInvalid(
                "signature blob does not follow the last operation",
            ));
        }
        if (self.buffer.len() as u64) < signatures_size {
            return Ok(false);
        }

        let blob = self.buffer[..signatures_size as usize].to_vec();

        // The signature signs every byte before it, never itself.
        let digest = self.signed_hash.clone().finalize();

        match self.resolve_public_key()? {
            Some(key) => {
                let signatures =
                    crypto::parse_signatures(&blob).map_err(Error::PayloadSignatureMismatch)?;
                crypto::verify_digest(&digest, &signatures, &key)
                    .map_err(Error::PayloadSignatureMismatch)?;
                info!("Payload signature verified");
            }
            None => {
                warn!("No public key available; skipping payload signature verification");
            }
        }

        self.buffer.drain(..signatures_size as usize);
        self.data_offset += signatures_size;

        Ok(true)
    }

    fn finalize(&mut self) -> Result<()> {
        let manifest = self.manifest.as_ref().unwrap();

        if manifest.signatures_offset.unwrap_or(0) == 0
            && self.plan.hash_checks_mandatory
            && !self.metadata_signature_verified
        {
            return Err(Error::SignatureMissing);
        }

        let rootfs_info = manifest.new_rootfs_info.clone();
        let kernel_info = manifest.new_kernel_info.clone();
        self.verify_new_partition(Partition::Rootfs, rootfs_info)?;
        self.verify_new_partition(Partition::Kernel, kernel_info)?;

        if let Err(e) = Checkpoint::clear(self.prefs, &self.plan.payload_id) {
            warn!("Failed to clear checkpoint: {e}");
        }

        info!(
            "Payload applied; {} now matches the target image",
            self.plan.install_path.display(),
        );

        Ok(())
    }

    fn verify_new_partition(
        &mut self,
        partition: Partition,
        info: Option<PartitionInfo>,
    ) -> Result<()> {
        let name = partition.name();
        let Some(info) = info else {
            return Ok(());
        };
        let (Some(size), Some(hash)) = (info.size, info.hash) else {
            return Ok(());
        };
        if hash.is_empty() {
            return Ok(());
        }
        if hash.len() != 32 {
            return Err(Error::NewPartitionInfoInvalid(name));
        }

        let file = match partition {
            Partition::Rootfs => self.install_file.as_mut(),
            Partition::Kernel => self.kernel_file.as_mut(),
        };
        let Some(file) = file else {
            warn!("New {name} partition is not open; skipping hash verification");
            return Ok(());
        };

        let digest = hash_file_prefix(file, size, self.cancel_signal)?;
        if digest.as_slice() != hash.as_slice() {
            return Err(Error::NewPartitionHashMismatch(name));
        }

        debug!("Verified new {name} partition hash");

        Ok(())
    }
}

impl Write for Applier<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// SHA-256 of the first `size` bytes of `file`.
fn hash_file_prefix(
    file: &mut File,
    size: u64,
    cancel_signal: &AtomicBool,
) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();

    file.seek(SeekFrom::Start(0))?;
    stream::transfer_exact_with(
        file,
        io::sink(),
        size,
        |data| hasher.update(data),
        cancel_signal,
    )?;

    Ok(hasher.finalize().into())
}

/// Whether any source block is also written by the destination extents.
fn extents_overlap(
    src_extents: &[crate::proto::Extent],
    dst_extents: &[crate::proto::Extent],
) -> std::result::Result<bool, BoxError> {
    let mut dst_blocks = ExtentRanges::new();
    dst_blocks.add_extents(dst_extents)?;

    Ok(src_extents.iter().any(|extent| {
        match (extent.start_block, extent.num_blocks) {
            (Some(start), Some(num)) if start != extent::SPARSE_HOLE => {
                dst_blocks.overlaps(start, num)
            }
            _ => false,
        }
    }))
}

/// Decompress fully, but never produce more than `limit` bytes.
fn bounded_decompress(
    mut decoder: impl Read,
    limit: u64,
    cancel_signal: &AtomicBool,
) -> std::result::Result<Vec<u8>, BoxError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 16384];

    loop {
        stream::check_cancel(cancel_signal)?;

        let n = decoder.read(&mut chunk)?;
        if n == 0 {
            break;
        }

        if out.len() as u64 + n as u64 > limit {
            return Err("decompressed data exceeds the destination".into());
        }

        out.extend_from_slice(&chunk[..n]);
    }

    Ok(out)
}
