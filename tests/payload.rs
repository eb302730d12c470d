// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests that build payloads with the crate's own generator and
//! run them through the streaming applier.

use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Mutex},
};

use bzip2::{write::BzEncoder, Compression};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use deltapply::{
    applier::{Applier, ProgressSink},
    crypto,
    errorcode::ErrorCode,
    format::{
        bspatch,
        payload::{
            metadata_signature_base64, BuiltPayload, PayloadBuilder,
            BRILLO_MAJOR_PAYLOAD_VERSION, CHROMEOS_MAJOR_PAYLOAD_VERSION,
            FULL_PAYLOAD_MINOR_VERSION, SUPPORTED_MINOR_VERSIONS,
        },
    },
    hardware::FakeHardware,
    keyvalue::KeyValueStore,
    plan::InstallPlan,
    prefs::MemPrefs,
    proto::{install_operation::Type as OpType, DeltaArchiveManifest, Extent, InstallOperation,
        PartitionInfo},
};

const BLOCK: usize = 4096;

const TEST_KEY: &str = include_str!("keys/testkey.pem");

// Compressed data without checksum, generated with:
// echo -n a | xz -9 --check=none | hexdump -v -e '"    " 12/1 "0x%02x, " "\n"'
const XZ_COMPRESSED_DATA: &[u8] = &[
    0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00, 0x00, 0xff, 0x12, 0xd9, 0x41, 0x02, 0x00, 0x21,
    0x01, 0x1c, 0x00, 0x00, 0x00, 0x10, 0xcf, 0x58, 0xcc, 0x01, 0x00, 0x00, 0x61, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x01, 0x11, 0x01, 0xad, 0xa6, 0x58, 0x04, 0x06, 0x72, 0x9e, 0x7a, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x59, 0x5a,
];

fn pub_key_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/keys/testkey.pub.pem")
}

fn missing_key_path() -> PathBuf {
    PathBuf::from("/nonexistent/payload-key.pub.pem")
}

fn test_key() -> rsa::RsaPrivateKey {
    crypto::read_pem_key(TEST_KEY.as_bytes()).unwrap()
}

fn other_key() -> rsa::RsaPrivateKey {
    crypto::read_pem_key(include_str!("keys/otherkey.pem").as_bytes()).unwrap()
}

/// Deterministic stand-in for random image contents.
fn pseudo_random(len: usize, mut seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        data.push((seed >> 24) as u8);
    }
    data
}

fn bzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).as_slice().to_vec()
}

fn temp_file_with(data: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

fn op(op_type: OpType) -> InstallOperation {
    InstallOperation {
        r#type: op_type as i32,
        ..Default::default()
    }
}

fn rootfs_info(image: &[u8]) -> PartitionInfo {
    PartitionInfo {
        size: Some(image.len() as u64),
        hash: Some(sha256(image)),
    }
}

/// Delta payloads must carry new partition info for both partitions even when
/// only the rootfs is updated.
fn delta_builder(minor_version: u32) -> PayloadBuilder {
    PayloadBuilder::new(CHROMEOS_MAJOR_PAYLOAD_VERSION)
        .minor_version(minor_version)
        .new_kernel_info(PartitionInfo::default())
}

struct Apply<'a> {
    payload: &'a BuiltPayload,
    is_full: bool,
    source_data: Option<&'a [u8]>,
    target_data: &'a [u8],
    hash_checks_mandatory: bool,
    metadata_signature: String,
    public_key: PathBuf,
}

impl<'a> Apply<'a> {
    fn new(payload: &'a BuiltPayload) -> Self {
        Self {
            payload,
            is_full: false,
            source_data: None,
            target_data: &[],
            hash_checks_mandatory: false,
            metadata_signature: String::new(),
            public_key: missing_key_path(),
        }
    }

    fn full(mut self) -> Self {
        self.is_full = true;
        self
    }

    fn source(mut self, data: &'a [u8]) -> Self {
        self.source_data = Some(data);
        self
    }

    fn target(mut self, data: &'a [u8]) -> Self {
        self.target_data = data;
        self
    }

    /// Run the payload through a fresh applier and return the resulting
    /// target image.
    fn run(self) -> Result<Vec<u8>, ErrorCode> {
        let prefs = MemPrefs::new();
        self.run_with_prefs(&prefs)
    }

    fn run_with_prefs(self, prefs: &MemPrefs) -> Result<Vec<u8>, ErrorCode> {
        let cancel_signal = AtomicBool::new(false);
        let hardware = FakeHardware::new(false);

        let source = self.source_data.map(temp_file_with);
        let source_kernel = temp_file_with(&[]);
        let target = temp_file_with(self.target_data);
        let kernel = temp_file_with(&[]);

        let plan = InstallPlan {
            is_full_update: self.is_full,
            payload_id: "test-payload".to_owned(),
            metadata_size: self.payload.metadata_size,
            metadata_signature: self.metadata_signature.clone(),
            hash_checks_mandatory: self.hash_checks_mandatory,
            install_path: target.path().to_owned(),
            ..Default::default()
        };

        let mut applier = Applier::new(plan, prefs, &hardware, &cancel_signal);
        applier.set_public_key_path(&self.public_key);

        applier.open_install(target.path()).map_err(|e| e.code())?;
        applier.open_kernel(kernel.path()).map_err(|e| e.code())?;
        if let Some(source) = &source {
            applier.open_source_rootfs(source.path()).map_err(|e| e.code())?;
        }
        applier
            .open_source_kernel(source_kernel.path())
            .map_err(|e| e.code())?;

        applier
            .write_chunk(&self.payload.data)
            .map_err(|e| e.code())?;
        applier.close().map_err(|e| e.code())?;

        Ok(fs::read(target.path()).unwrap())
    }
}

#[test]
fn full_payload_write() {
    let expected = pseudo_random(BLOCK, 1);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = PayloadBuilder::new(CHROMEOS_MAJOR_PAYLOAD_VERSION)
        .minor_version(FULL_PAYLOAD_MINOR_VERSION)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).full().run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn replace_operation() {
    let expected = pseudo_random(BLOCK, 2);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];
    operation.data_sha256_hash = Some(sha256(&expected));

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn replace_bz_operation() {
    let expected = pseudo_random(BLOCK, 3);
    let bz_data = bzip_compress(&expected);

    let mut operation = op(OpType::ReplaceBz);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(bz_data))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn replace_xz_operation() {
    // The compressed data carries a single "a"; the rest of the block must be
    // zero padded.
    let mut expected = vec![0u8; BLOCK];
    expected[0] = b'a';

    let mut operation = op(OpType::ReplaceXz);
    operation.dst_extents = vec![Extent::for_range(0, 1)];
    operation.data_sha256_hash = Some(sha256(XZ_COMPRESSED_DATA));

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(XZ_COMPRESSED_DATA.to_vec()))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn zero_operation() {
    let existing = vec![b'a'; BLOCK * 10];
    let mut expected = existing.clone();
    // Blocks 4, 5, and 7 become zeros; everything else is untouched.
    expected[BLOCK * 4..BLOCK * 6].fill(0);
    expected[BLOCK * 7..BLOCK * 8].fill(0);

    let mut operation = op(OpType::Zero);
    operation.dst_extents = vec![Extent::for_range(4, 2), Extent::for_range(7, 1)];

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, None)
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).target(&existing).run().unwrap();
    assert_eq!(result, expected);

    // Applying the same operation again must be a no-op.
    let again = Apply::new(&payload).target(&result).run().unwrap();
    assert_eq!(again, expected);
}

#[test]
fn source_copy_operation() {
    let expected = pseudo_random(BLOCK, 4);

    let mut operation = op(OpType::SourceCopy);
    operation.src_extents = vec![Extent::for_range(0, 1)];
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = delta_builder(2)
        .old_rootfs_info(rootfs_info(&expected))
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, None)
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).source(&expected).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn source_copy_rejects_modified_source() {
    let original = pseudo_random(BLOCK, 5);
    let modified = pseudo_random(BLOCK, 6);

    let mut operation = op(OpType::SourceCopy);
    operation.src_extents = vec![Extent::for_range(0, 1)];
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = delta_builder(2)
        .old_rootfs_info(rootfs_info(&original))
        .new_rootfs_info(rootfs_info(&original))
        .rootfs_op(operation, None)
        .build(None)
        .unwrap();

    let err = Apply::new(&payload).source(&modified).run().unwrap_err();
    assert_eq!(err, ErrorCode::DownloadStateInitializationError);
}

#[test]
fn move_operation_with_overlap() {
    // Blocks [A, B, C]; moving blocks 0-1 onto 1-2 must read both source
    // blocks before writing, or block 1 would be clobbered first.
    let mut existing = Vec::new();
    existing.extend_from_slice(&vec![b'A'; BLOCK]);
    existing.extend_from_slice(&vec![b'B'; BLOCK]);
    existing.extend_from_slice(&vec![b'C'; BLOCK]);

    let mut expected = Vec::new();
    expected.extend_from_slice(&vec![b'A'; BLOCK]);
    expected.extend_from_slice(&vec![b'A'; BLOCK]);
    expected.extend_from_slice(&vec![b'B'; BLOCK]);

    let mut operation = op(OpType::Move);
    operation.src_extents = vec![Extent::for_range(0, 2)];
    operation.dst_extents = vec![Extent::for_range(1, 2)];

    let payload = delta_builder(1)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, None)
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).target(&existing).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn bsdiff_operation() {
    // Every byte of block 0 is incremented via the diff stream.
    let existing = vec![b'x'; BLOCK];
    let expected = vec![b'y'; BLOCK];

    let patch = bspatch::build_patch(&[(BLOCK as i64, 0, 0)], &[1u8; BLOCK], &[]).unwrap();

    let mut operation = op(OpType::Bsdiff);
    operation.src_extents = vec![Extent::for_range(0, 1)];
    operation.src_length = Some(BLOCK as u64);
    operation.dst_extents = vec![Extent::for_range(0, 1)];
    operation.dst_length = Some(BLOCK as u64);

    let payload = delta_builder(1)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(patch))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload).target(&existing).run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn source_bsdiff_operation_with_short_output() {
    let source = pseudo_random(BLOCK, 7);

    // The patch reproduces only the first 4000 bytes of the source; the tail
    // of the destination block keeps its previous contents.
    let patch = bspatch::build_patch(&[(4000, 0, 0)], &[0u8; 4000], &[]).unwrap();

    let existing = vec![0u8; BLOCK];
    let mut expected = source[..4000].to_vec();
    expected.extend_from_slice(&[0u8; 96]);

    let mut operation = op(OpType::SourceBsdiff);
    operation.src_extents = vec![Extent::for_range(0, 1)];
    operation.src_length = Some(BLOCK as u64);
    operation.dst_extents = vec![Extent::for_range(0, 1)];
    operation.dst_length = Some(4000);

    let payload = delta_builder(2)
        .old_rootfs_info(rootfs_info(&source))
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(patch))
        .build(None)
        .unwrap();

    let result = Apply::new(&payload)
        .source(&source)
        .target(&existing)
        .run()
        .unwrap();
    assert_eq!(result, expected);
}

#[test]
fn operation_hash_mismatch() {
    let expected = pseudo_random(BLOCK, 8);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];
    operation.data_sha256_hash = Some(sha256(b"something else"));

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(None)
        .unwrap();

    let err = Apply::new(&payload).run().unwrap_err();
    assert_eq!(err, ErrorCode::DownloadOperationHashMismatch);
}

#[test]
fn operation_hash_missing_under_mandatory_checks() {
    let expected = pseudo_random(BLOCK, 9);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let key = test_key();
    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(Some(&key))
        .unwrap();

    let mut apply = Apply::new(&payload);
    apply.hash_checks_mandatory = true;
    apply.metadata_signature = payload.metadata_signature.clone().unwrap();
    apply.public_key = pub_key_path();

    let err = apply.run().unwrap_err();
    assert_eq!(err, ErrorCode::DownloadOperationHashMissingError);
}

#[test]
fn new_partition_hash_mismatch() {
    let written = pseudo_random(BLOCK, 10);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = delta_builder(2)
        .new_rootfs_info(PartitionInfo {
            size: Some(BLOCK as u64),
            hash: Some(sha256(b"not what gets written")),
        })
        .rootfs_op(operation, Some(written))
        .build(None)
        .unwrap();

    let err = Apply::new(&payload).run().unwrap_err();
    assert_eq!(err, ErrorCode::PayloadHashMismatchError);
}

#[test]
fn signed_payload_round_trip() {
    let expected = pseudo_random(BLOCK * 2, 11);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 2)];
    operation.data_sha256_hash = Some(sha256(&expected));

    let key = test_key();
    let payload = PayloadBuilder::new(BRILLO_MAJOR_PAYLOAD_VERSION)
        .minor_version(FULL_PAYLOAD_MINOR_VERSION)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(Some(&key))
        .unwrap();

    let mut apply = Apply::new(&payload).full();
    apply.hash_checks_mandatory = true;
    apply.public_key = pub_key_path();

    let result = apply.run().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn payload_signature_mismatch() {
    let expected = pseudo_random(BLOCK, 12);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let key = test_key();
    let payload = PayloadBuilder::new(BRILLO_MAJOR_PAYLOAD_VERSION)
        .minor_version(FULL_PAYLOAD_MINOR_VERSION)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(Some(&key))
        .unwrap();

    // Flip a bit inside the operation data. The per-op hash is absent, so
    // the corruption must be caught by the payload signature instead.
    let mut corrupted = BuiltPayload {
        data: payload.data.clone(),
        metadata_size: payload.metadata_size,
        metadata_signature: payload.metadata_signature.clone(),
    };
    corrupted.data[payload.metadata_size as usize] ^= 1;

    let mut apply = Apply::new(&corrupted).full();
    apply.public_key = pub_key_path();

    let err = apply.run().unwrap_err();
    assert_eq!(err, ErrorCode::DownloadPayloadPubKeyVerificationError);
}

fn empty_payload(signed: bool) -> BuiltPayload {
    let builder = PayloadBuilder::new(CHROMEOS_MAJOR_PAYLOAD_VERSION)
        .minor_version(FULL_PAYLOAD_MINOR_VERSION);

    if signed {
        builder.build(Some(&test_key())).unwrap()
    } else {
        builder.build(None).unwrap()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum MetadataSignature {
    Empty,
    Invalid,
    Valid,
}

fn do_metadata_signature_test(
    signature: MetadataSignature,
    sign_payload: bool,
    hash_checks_mandatory: bool,
) {
    let payload = empty_payload(sign_payload);

    let metadata_signature = match signature {
        MetadataSignature::Empty => String::new(),
        // A well-formed signature from the wrong key.
        MetadataSignature::Invalid => {
            metadata_signature_base64(&payload.data, payload.metadata_size, &other_key()).unwrap()
        }
        MetadataSignature::Valid => {
            metadata_signature_base64(&payload.data, payload.metadata_size, &test_key()).unwrap()
        }
    };

    let mut apply = Apply::new(&payload).full();
    apply.hash_checks_mandatory = hash_checks_mandatory;
    apply.metadata_signature = metadata_signature;
    apply.public_key = pub_key_path();

    let result = apply.run();

    if hash_checks_mandatory {
        match signature {
            MetadataSignature::Empty => {
                assert_eq!(
                    result.unwrap_err(),
                    ErrorCode::DownloadMetadataSignatureMissingError,
                );
            }
            MetadataSignature::Invalid => {
                assert_eq!(
                    result.unwrap_err(),
                    ErrorCode::DownloadMetadataSignatureMismatch,
                );
            }
            MetadataSignature::Valid => {
                result.unwrap();
            }
        }
    } else {
        // Metadata signature failures are advisory in the soft-check regime.
        result.unwrap();
    }
}

#[test]
fn mandatory_empty_metadata_signature() {
    do_metadata_signature_test(MetadataSignature::Empty, true, true);
}

#[test]
fn non_mandatory_empty_metadata_signature() {
    do_metadata_signature_test(MetadataSignature::Empty, true, false);
}

#[test]
fn mandatory_invalid_metadata_signature() {
    do_metadata_signature_test(MetadataSignature::Invalid, true, true);
}

#[test]
fn non_mandatory_invalid_metadata_signature() {
    do_metadata_signature_test(MetadataSignature::Invalid, true, false);
}

#[test]
fn mandatory_valid_metadata_signature_unsigned_payload() {
    do_metadata_signature_test(MetadataSignature::Valid, false, true);
}

#[test]
fn mandatory_valid_metadata_signature_signed_payload() {
    do_metadata_signature_test(MetadataSignature::Valid, true, true);
}

#[test]
fn non_mandatory_valid_metadata_signature() {
    do_metadata_signature_test(MetadataSignature::Valid, true, false);
}

fn header_test_applier<'a>(
    plan: InstallPlan,
    prefs: &'a MemPrefs,
    hardware: &'a FakeHardware,
    cancel_signal: &'a AtomicBool,
) -> (Applier<'a>, NamedTempFile, NamedTempFile) {
    let target = temp_file_with(&[]);
    let kernel = temp_file_with(&[]);

    let mut applier = Applier::new(plan, prefs, hardware, cancel_signal);
    applier.set_public_key_path(&missing_key_path());
    applier.open_install(target.path()).unwrap();
    applier.open_kernel(kernel.path()).unwrap();

    (applier, target, kernel)
}

fn do_metadata_size_test(
    expected_metadata_size: u64,
    actual_metadata_size: u64,
    hash_checks_mandatory: bool,
) {
    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);

    let plan = InstallPlan {
        payload_id: "metadata-size-test".to_owned(),
        metadata_size: expected_metadata_size,
        hash_checks_mandatory,
        ..Default::default()
    };

    let (mut applier, _target, _kernel) =
        header_test_applier(plan, &prefs, &hardware, &cancel_signal);

    applier.write_chunk(b"CrAU").unwrap();
    applier
        .write_chunk(&CHROMEOS_MAJOR_PAYLOAD_VERSION.to_be_bytes())
        .unwrap();

    // The fixed header is 20 bytes for major version 1 and is not part of the
    // manifest size field.
    let size_in_manifest = actual_metadata_size - 20;
    let result = applier.write_chunk(&size_in_manifest.to_be_bytes());

    if expected_metadata_size == actual_metadata_size || !hash_checks_mandatory {
        result.unwrap();
    } else {
        result.unwrap_err();
        assert_eq!(
            applier.error_code(),
            Some(ErrorCode::DownloadInvalidMetadataSize),
        );
    }

    applier.close().unwrap_err();
}

#[test]
fn missing_mandatory_metadata_size() {
    do_metadata_size_test(0, 75456, true);
}

#[test]
fn missing_non_mandatory_metadata_size() {
    do_metadata_size_test(0, 123456, false);
}

#[test]
fn invalid_mandatory_metadata_size() {
    do_metadata_size_test(13000, 140000, true);
}

#[test]
fn invalid_non_mandatory_metadata_size() {
    do_metadata_size_test(40000, 50000, false);
}

#[test]
fn valid_mandatory_metadata_size() {
    do_metadata_size_test(85376, 85376, true);
}

#[test]
fn brillo_metadata_signature_size() {
    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);

    let plan = InstallPlan {
        payload_id: "brillo-header-test".to_owned(),
        ..Default::default()
    };

    let (mut applier, _target, _kernel) =
        header_test_applier(plan, &prefs, &hardware, &cancel_signal);

    let manifest_size: u64 = 222;
    let metadata_signature_size: u32 = 45;

    applier.write_chunk(b"CrAU").unwrap();
    applier
        .write_chunk(&BRILLO_MAJOR_PAYLOAD_VERSION.to_be_bytes())
        .unwrap();
    applier.write_chunk(&manifest_size.to_be_bytes()).unwrap();
    applier
        .write_chunk(&metadata_signature_size.to_be_bytes())
        .unwrap();

    applier.close().unwrap_err();

    assert!(applier.is_header_parsed());
    assert_eq!(applier.major_version(), BRILLO_MAJOR_PAYLOAD_VERSION);
    assert_eq!(applier.manifest_offset(), Some(24));
    assert_eq!(
        applier.metadata_size(),
        24 + manifest_size + u64::from(metadata_signature_size),
    );
}

#[test]
fn bad_payload_magic() {
    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);

    let (mut applier, _target, _kernel) = header_test_applier(
        InstallPlan::default(),
        &prefs,
        &hardware,
        &cancel_signal,
    );

    // Four bytes are not enough to tell the magic and version apart yet.
    applier.write_chunk(b"junk").unwrap();
    applier.write_chunk(b"morejunk").unwrap_err();
    assert_eq!(
        applier.error_code(),
        Some(ErrorCode::DownloadInvalidMetadataMagicString),
    );
    applier.close().unwrap_err();
}

#[derive(Default)]
struct RecordingSink {
    progress: Mutex<Vec<u64>>,
}

impl ProgressSink for RecordingSink {
    fn download_progress(&self, bytes_so_far: u64) {
        self.progress.lock().unwrap().push(bytes_so_far);
    }
}

#[test]
fn write_reports_progress() {
    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);
    let sink = RecordingSink::default();

    let target = temp_file_with(&[]);
    let mut applier = Applier::new(InstallPlan::default(), &prefs, &hardware, &cancel_signal)
        .with_progress(&sink);
    applier.open_install(target.path()).unwrap();

    applier.write_chunk(b"junk").unwrap();
    applier.write_chunk(b"morejunk").unwrap_err();

    // Cumulative and strictly monotonic, including the failing write.
    assert_eq!(*sink.progress.lock().unwrap(), vec![4, 12]);
}

fn validation_applier<'a>(
    is_full_update: bool,
    prefs: &'a MemPrefs,
    hardware: &'a FakeHardware,
    cancel_signal: &'a AtomicBool,
) -> Applier<'a> {
    let plan = InstallPlan {
        is_full_update,
        ..Default::default()
    };

    Applier::new(plan, prefs, hardware, cancel_signal)
}

fn run_manifest_validation(
    manifest: &DeltaArchiveManifest,
    full_payload: bool,
    expected: Option<ErrorCode>,
) {
    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);

    let applier = validation_applier(full_payload, &prefs, &hardware, &cancel_signal);
    let result = applier.validate_manifest(manifest);

    assert_eq!(result.err().map(|e| e.code()), expected);
}

#[test]
fn validate_manifest_full_good() {
    let manifest = DeltaArchiveManifest {
        new_kernel_info: Some(PartitionInfo::default()),
        new_rootfs_info: Some(PartitionInfo::default()),
        minor_version: Some(FULL_PAYLOAD_MINOR_VERSION),
        ..Default::default()
    };

    run_manifest_validation(&manifest, true, None);
}

#[test]
fn validate_manifest_delta_good() {
    let manifest = DeltaArchiveManifest {
        old_kernel_info: Some(PartitionInfo::default()),
        old_rootfs_info: Some(PartitionInfo::default()),
        new_kernel_info: Some(PartitionInfo::default()),
        new_rootfs_info: Some(PartitionInfo::default()),
        minor_version: Some(2),
        ..Default::default()
    };

    run_manifest_validation(&manifest, false, None);
}

#[test]
fn validate_manifest_full_unset_minor_version() {
    run_manifest_validation(&DeltaArchiveManifest::default(), true, None);
}

#[test]
fn validate_manifest_delta_unset_minor_version() {
    run_manifest_validation(
        &DeltaArchiveManifest::default(),
        false,
        Some(ErrorCode::UnsupportedMinorPayloadVersion),
    );
}

#[test]
fn validate_manifest_full_old_kernel() {
    let manifest = DeltaArchiveManifest {
        old_kernel_info: Some(PartitionInfo::default()),
        new_kernel_info: Some(PartitionInfo::default()),
        new_rootfs_info: Some(PartitionInfo::default()),
        minor_version: Some(2),
        ..Default::default()
    };

    run_manifest_validation(&manifest, true, Some(ErrorCode::PayloadMismatchedType));
}

#[test]
fn validate_manifest_full_old_rootfs() {
    let manifest = DeltaArchiveManifest {
        old_rootfs_info: Some(PartitionInfo::default()),
        new_kernel_info: Some(PartitionInfo::default()),
        new_rootfs_info: Some(PartitionInfo::default()),
        minor_version: Some(2),
        ..Default::default()
    };

    run_manifest_validation(&manifest, true, Some(ErrorCode::PayloadMismatchedType));
}

#[test]
fn validate_manifest_delta_missing_new_info() {
    let manifest = DeltaArchiveManifest {
        minor_version: Some(2),
        ..Default::default()
    };

    run_manifest_validation(&manifest, false, Some(ErrorCode::PayloadMismatchedType));
}

#[test]
fn validate_manifest_bad_minor_version() {
    let manifest = DeltaArchiveManifest {
        minor_version: Some(10002),
        new_kernel_info: Some(PartitionInfo::default()),
        new_rootfs_info: Some(PartitionInfo::default()),
        ..Default::default()
    };

    run_manifest_validation(
        &manifest,
        false,
        Some(ErrorCode::UnsupportedMinorPayloadVersion),
    );
}

#[test]
fn public_key_from_response_rules() {
    let cancel_signal = AtomicBool::new(false);
    let prefs = MemPrefs::new();

    let existing_key = temp_file_with(b"on-device key");
    let valid_blob = "VGVzdAo=".to_owned(); // 'echo "Test" | base64'

    // (official, on-device key exists, response blob, accepted)
    let cases = [
        (false, false, valid_blob.clone(), true),
        (true, false, valid_blob.clone(), false),
        (false, true, valid_blob.clone(), false),
        (true, true, valid_blob.clone(), false),
        (false, false, String::new(), false),
        (true, false, String::new(), false),
        (false, true, String::new(), false),
        (true, true, String::new(), false),
    ];

    for (official, key_on_device, blob, accepted) in cases {
        let hardware = FakeHardware::new(official);
        let plan = InstallPlan {
            public_key_rsa: blob.clone(),
            ..Default::default()
        };

        let mut applier = Applier::new(plan, &prefs, &hardware, &cancel_signal);
        if key_on_device {
            applier.set_public_key_path(existing_key.path());
        } else {
            applier.set_public_key_path(&missing_key_path());
        }

        let staged = applier.public_key_from_response().unwrap();
        assert_eq!(
            staged.is_some(),
            accepted,
            "official={official} key_on_device={key_on_device} blob={blob:?}",
        );

        if let Some(path) = staged {
            assert_eq!(fs::read(path).unwrap(), b"Test\n");
        }
    }

    // A response key that is not valid base64 is never accepted.
    let hardware = FakeHardware::new(false);
    let plan = InstallPlan {
        public_key_rsa: "not-valid-base64".to_owned(),
        ..Default::default()
    };
    let mut applier = Applier::new(plan, &prefs, &hardware, &cancel_signal);
    applier.set_public_key_path(&missing_key_path());
    applier.public_key_from_response().unwrap_err();
}

#[test]
fn resume_after_interruption() {
    let block_a = pseudo_random(BLOCK, 20);
    let block_b = pseudo_random(BLOCK, 21);
    let mut expected = block_a.clone();
    expected.extend_from_slice(&block_b);

    let mut op_a = op(OpType::Replace);
    op_a.dst_extents = vec![Extent::for_range(0, 1)];
    op_a.data_sha256_hash = Some(sha256(&block_a));

    let mut op_b = op(OpType::Replace);
    op_b.dst_extents = vec![Extent::for_range(1, 1)];
    op_b.data_sha256_hash = Some(sha256(&block_b));

    let key = test_key();
    let payload = PayloadBuilder::new(BRILLO_MAJOR_PAYLOAD_VERSION)
        .minor_version(FULL_PAYLOAD_MINOR_VERSION)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(op_a, Some(block_a.clone()))
        .rootfs_op(op_b, Some(block_b.clone()))
        .build(Some(&key))
        .unwrap();

    let prefs = MemPrefs::new();
    let hardware = FakeHardware::new(false);
    let cancel_signal = AtomicBool::new(false);
    let target = temp_file_with(&[]);
    let kernel = temp_file_with(&[]);

    let plan = InstallPlan {
        is_full_update: true,
        payload_id: "resume-test".to_owned(),
        metadata_size: payload.metadata_size,
        ..Default::default()
    };

    // First attempt: deliver the metadata plus exactly one operation, then
    // drop the applier as if the download was interrupted.
    {
        let mut applier = Applier::new(plan.clone(), &prefs, &hardware, &cancel_signal);
        applier.set_public_key_path(&pub_key_path());
        applier.open_install(target.path()).unwrap();
        applier.open_kernel(kernel.path()).unwrap();

        let first = payload.metadata_size as usize + BLOCK;
        applier.write_chunk(&payload.data[..first]).unwrap();
        assert!(!applier.resumed());
        applier.close().unwrap_err();
    }

    // Second attempt: the metadata is re-delivered, the checkpoint matches,
    // and delivery continues from the resume offset.
    {
        let mut applier = Applier::new(plan, &prefs, &hardware, &cancel_signal);
        applier.set_public_key_path(&pub_key_path());
        applier.open_install(target.path()).unwrap();
        applier.open_kernel(kernel.path()).unwrap();

        applier
            .write_chunk(&payload.data[..payload.metadata_size as usize])
            .unwrap();
        assert!(applier.resumed());
        assert_eq!(applier.resume_offset(), payload.metadata_size + BLOCK as u64);

        applier
            .write_chunk(&payload.data[applier.resume_offset() as usize..])
            .unwrap();
        applier.close().unwrap();
    }

    assert_eq!(fs::read(target.path()).unwrap(), expected);
}

#[test]
fn mismatched_checkpoint_restarts_from_scratch() {
    let expected = pseudo_random(BLOCK, 22);

    let mut operation = op(OpType::Replace);
    operation.dst_extents = vec![Extent::for_range(0, 1)];

    let payload = delta_builder(2)
        .new_rootfs_info(rootfs_info(&expected))
        .rootfs_op(operation, Some(expected.clone()))
        .build(None)
        .unwrap();

    let prefs = MemPrefs::new();

    // Plant a checkpoint for a different payload under the same id.
    deltapply::prefs::Checkpoint {
        major_version: CHROMEOS_MAJOR_PAYLOAD_VERSION,
        metadata_size: 999,
        manifest_digest: [9u8; 32],
        next_operation: 1,
        data_offset: 4096,
        sha256_state: deltapply::hash::ResumableSha256::new().state(),
    }
    .store(&prefs, "test-payload")
    .unwrap();

    let result = Apply::new(&payload).run_with_prefs(&prefs).unwrap();
    assert_eq!(result, expected);
}

#[test]
fn conf_pins_supported_versions() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("deltapply.conf");
    let store = KeyValueStore::load(&path).unwrap();

    let major: u64 = store
        .get_string("PAYLOAD_MAJOR_VERSION")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(major, BRILLO_MAJOR_PAYLOAD_VERSION);

    let minor: u32 = store
        .get_string("PAYLOAD_MINOR_VERSION")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(Some(&minor), SUPPORTED_MINOR_VERSIONS.last());
}
