/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The `"CrAU"` payload envelope: header parsing, construction, and offline
//! verification of complete payload files.

use std::{
    io::{self, Cursor, Read, Seek},
    sync::atomic::AtomicBool,
};

use byteorder::{BigEndian, ReadBytesExt};
use prost::Message;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    crypto,
    proto::{DeltaArchiveManifest, InstallOperation, PartitionInfo},
    stream,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Major version used by ChromeOS payloads: 20-byte header, metadata
/// signature only deliverable through the discovery response.
pub const CHROMEOS_MAJOR_PAYLOAD_VERSION: u64 = 1;
/// Major version used by Brillo payloads: 24-byte header with an in-payload
/// metadata signature blob.
pub const BRILLO_MAJOR_PAYLOAD_VERSION: u64 = 2;

pub const SUPPORTED_MAJOR_VERSIONS: &[u64] =
    &[CHROMEOS_MAJOR_PAYLOAD_VERSION, BRILLO_MAJOR_PAYLOAD_VERSION];

/// Minor version denoting a full payload.
pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;
/// Delta dialects this applier understands.
pub const SUPPORTED_MINOR_VERSIONS: &[u32] = &[1, 2];

pub const BLOCK_SIZE: u32 = 4096;

/// Bytes before the version-dependent header fields: magic + major version.
const VERSION_PREFIX_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload major version: {0}")]
    UnsupportedVersion(u64),
    #[error("Payload contains no signatures")]
    NoSignatures,
    #[error("Blob offset should be {0}, but is {1}")]
    InvalidBlobOffset(u64, u64),
    #[error("Payload signatures offset should be {0}, but is {1}")]
    InvalidPayloadSignaturesOffset(u64, u64),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Protobuf error")]
    Protobuf(#[from] prost::DecodeError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Size of the fixed header for the given major version, which is also the
/// file offset of the serialized manifest.
pub fn manifest_offset(major_version: u64) -> u64 {
    match major_version {
        CHROMEOS_MAJOR_PAYLOAD_VERSION => 20,
        BRILLO_MAJOR_PAYLOAD_VERSION => 24,
        v => unreachable!("unsupported major version {v}"),
    }
}

/// Fixed header fields, available before the manifest has been received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub major_version: u64,
    pub manifest_size: u64,
    /// Always zero for major version 1.
    pub metadata_signature_size: u32,
}

impl HeaderInfo {
    pub fn manifest_offset(&self) -> u64 {
        manifest_offset(self.major_version)
    }

    /// Total metadata region size: header + manifest + metadata signature.
    pub fn metadata_size(&self) -> u64 {
        self.manifest_offset() + self.manifest_size + u64::from(self.metadata_signature_size)
    }

    /// Size of the leading portion of the metadata covered by the metadata
    /// signature (the signature never signs itself).
    pub fn signed_metadata_size(&self) -> u64 {
        self.manifest_offset() + self.manifest_size
    }
}

/// Incrementally parse the fixed header from a payload prefix. Returns
/// `Ok(None)` while more bytes are needed. The magic and major version are
/// checked together once both are present.
pub fn parse_header_prefix(buf: &[u8]) -> Result<Option<HeaderInfo>> {
    if buf.len() < VERSION_PREFIX_SIZE {
        return Ok(None);
    }

    let magic: [u8; 4] = buf[..4].try_into().unwrap();
    if magic != *PAYLOAD_MAGIC {
        return Err(Error::UnknownMagic(magic));
    }

    let major_version = u64::from_be_bytes(buf[4..12].try_into().unwrap());
    if !SUPPORTED_MAJOR_VERSIONS.contains(&major_version) {
        return Err(Error::UnsupportedVersion(major_version));
    }

    let header_size = manifest_offset(major_version) as usize;
    if buf.len() < header_size {
        return Ok(None);
    }

    let manifest_size = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    let metadata_signature_size = if major_version >= BRILLO_MAJOR_PAYLOAD_VERSION {
        u32::from_be_bytes(buf[20..24].try_into().unwrap())
    } else {
        0
    };

    Ok(Some(HeaderInfo {
        major_version,
        manifest_size,
        metadata_signature_size,
    }))
}

/// Parsed header and manifest of a complete payload file.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// File offset of the data region.
    pub blob_offset: u64,
}

impl PayloadHeader {
    pub fn is_full_payload(&self) -> bool {
        self.manifest.old_rootfs_info.is_none() && self.manifest.old_kernel_info.is_none()
    }

    /// Parse the header from a payload file. After this function returns, the
    /// file position is set to the beginning of the data region, whose offset
    /// follows from the header fields alone.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if !SUPPORTED_MAJOR_VERSIONS.contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader.read_u64::<BigEndian>()?;
        let manifest_len = usize::try_from(manifest_size)
            .map_err(|_| Error::IntegerTooLarge("manifest_size"))?;

        let metadata_signature_size = if version >= BRILLO_MAJOR_PAYLOAD_VERSION {
            reader.read_u32::<BigEndian>()?
        } else {
            0
        };

        let mut manifest_raw = vec![0u8; manifest_len];
        reader.read_exact(&mut manifest_raw)?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        // Consume the metadata signature blob; the applier checks it from its
        // own buffer and the offline path re-reads it, so it is not kept.
        let mut signature_raw = vec![0u8; metadata_signature_size as usize];
        reader.read_exact(&mut signature_raw)?;

        let blob_offset =
            manifest_offset(version) + manifest_size + u64::from(metadata_signature_size);

        Ok(Self {
            version,
            manifest,
            metadata_signature_size,
            blob_offset,
        })
    }
}

/// Append bytes to the payload under construction while folding them into
/// the signed-bytes digest. Signature blobs bypass this on purpose.
fn emit_signed(out: &mut Vec<u8>, h_signed: &mut Sha256, bytes: &[u8]) {
    h_signed.update(bytes);
    out.extend_from_slice(bytes);
}

/// A finished payload plus the values the discovery response would carry.
pub struct BuiltPayload {
    pub data: Vec<u8>,
    /// Total metadata size, including any in-payload metadata signature.
    pub metadata_size: u64,
    /// Base64-encoded serialized `Signatures` message over the signed portion
    /// of the metadata. Present when the payload was signed.
    pub metadata_signature: Option<String>,
}

/// Builder for payload files, used by the CLI pack path and as the fixture
/// generator for the applier's own tests. Data offsets are recomputed so the
/// blobs tile the data region in operation order with no gaps.
pub struct PayloadBuilder {
    major_version: u64,
    manifest: DeltaArchiveManifest,
    rootfs_blobs: Vec<Option<Vec<u8>>>,
    kernel_blobs: Vec<Option<Vec<u8>>>,
}

impl PayloadBuilder {
    pub fn new(major_version: u64) -> Self {
        assert!(
            SUPPORTED_MAJOR_VERSIONS.contains(&major_version),
            "unsupported major version {major_version}",
        );

        let manifest = DeltaArchiveManifest {
            block_size: Some(BLOCK_SIZE),
            ..Default::default()
        };

        Self {
            major_version,
            manifest,
            rootfs_blobs: vec![],
            kernel_blobs: vec![],
        }
    }

    pub fn minor_version(mut self, minor_version: u32) -> Self {
        self.manifest.minor_version = Some(minor_version);
        self
    }

    pub fn old_rootfs_info(mut self, info: PartitionInfo) -> Self {
        self.manifest.old_rootfs_info = Some(info);
        self
    }

    pub fn new_rootfs_info(mut self, info: PartitionInfo) -> Self {
        self.manifest.new_rootfs_info = Some(info);
        self
    }

    pub fn old_kernel_info(mut self, info: PartitionInfo) -> Self {
        self.manifest.old_kernel_info = Some(info);
        self
    }

    pub fn new_kernel_info(mut self, info: PartitionInfo) -> Self {
        self.manifest.new_kernel_info = Some(info);
        self
    }

    /// Append a rootfs operation. `data` becomes the operation's blob; its
    /// offset and length fields are filled in by [`Self::build`].
    pub fn rootfs_op(mut self, op: InstallOperation, data: Option<Vec<u8>>) -> Self {
        self.manifest.install_operations.push(op);
        self.rootfs_blobs.push(data);
        self
    }

    pub fn kernel_op(mut self, op: InstallOperation, data: Option<Vec<u8>>) -> Self {
        self.manifest.kernel_install_operations.push(op);
        self.kernel_blobs.push(data);
        self
    }

    pub fn build(mut self, signing_key: Option<&RsaPrivateKey>) -> Result<BuiltPayload> {
        // The data region must contain all blobs in operation order with no
        // gaps, rootfs operations first.
        let mut blob_size: u64 = 0;
        let ops = self
            .manifest
            .install_operations
            .iter_mut()
            .zip(&self.rootfs_blobs)
            .chain(
                self.manifest
                    .kernel_install_operations
                    .iter_mut()
                    .zip(&self.kernel_blobs),
            );
        for (op, blob) in ops {
            if let Some(blob) = blob {
                op.data_offset = Some(blob_size);
                op.data_length = Some(blob.len() as u64);
                blob_size += blob.len() as u64;
            } else {
                op.data_offset = None;
                op.data_length = None;
            }
        }

        // The signature length fields are part of the signed manifest, so
        // compute the size from a throwaway signature first.
        let mut signature_size = 0u64;
        if let Some(key) = signing_key {
            let empty_digest: [u8; 32] = Sha256::digest(b"").into();
            let dummy_sig = crypto::sign_digest(&empty_digest, key)?;
            signature_size = dummy_sig.encode_to_vec().len() as u64;

            self.manifest.signatures_offset = Some(blob_size);
            self.manifest.signatures_size = Some(signature_size);
        }

        let manifest_raw = self.manifest.encode_to_vec();

        let metadata_signature_size =
            if self.major_version >= BRILLO_MAJOR_PAYLOAD_VERSION && signing_key.is_some() {
                signature_size as u32
            } else {
                0
            };

        let mut out = Vec::new();
        // Hash of the signed bytes: everything except the signatures.
        let mut h_signed = Sha256::new();

        emit_signed(&mut out, &mut h_signed, PAYLOAD_MAGIC);
        emit_signed(&mut out, &mut h_signed, &self.major_version.to_be_bytes());
        emit_signed(
            &mut out,
            &mut h_signed,
            &(manifest_raw.len() as u64).to_be_bytes(),
        );
        if self.major_version >= BRILLO_MAJOR_PAYLOAD_VERSION {
            emit_signed(&mut out, &mut h_signed, &metadata_signature_size.to_be_bytes());
        }
        emit_signed(&mut out, &mut h_signed, &manifest_raw);

        // Sign the metadata (header + manifest). The signature itself is
        // never part of any signed hash.
        let metadata_hash: [u8; 32] = h_signed.clone().finalize().into();
        let mut metadata_signature = None;

        if let Some(key) = signing_key {
            metadata_signature = Some(crypto::sign_digest_base64(&metadata_hash, key)?);

            if self.major_version >= BRILLO_MAJOR_PAYLOAD_VERSION {
                let sig_raw = crypto::sign_digest(&metadata_hash, key)?.encode_to_vec();
                assert_eq!(sig_raw.len() as u64, signature_size);
                out.extend_from_slice(&sig_raw);
            }
        }

        let metadata_size = manifest_offset(self.major_version)
            + manifest_raw.len() as u64
            + u64::from(metadata_signature_size);

        for blob in self.rootfs_blobs.iter().chain(&self.kernel_blobs).flatten() {
            emit_signed(&mut out, &mut h_signed, blob);
        }

        if let Some(key) = signing_key {
            let payload_hash: [u8; 32] = h_signed.finalize().into();
            let sig_raw = crypto::sign_digest(&payload_hash, key)?.encode_to_vec();
            assert_eq!(sig_raw.len() as u64, signature_size);
            out.extend_from_slice(&sig_raw);
        }

        Ok(BuiltPayload {
            data: out,
            metadata_size,
            metadata_signature,
        })
    }
}

/// Sign the metadata region of an existing payload, returning the base64
/// string a discovery response would carry.
pub fn metadata_signature_base64(
    payload: &[u8],
    signed_metadata_size: u64,
    key: &RsaPrivateKey,
) -> Result<String> {
    let signed = payload
        .get(..signed_metadata_size as usize)
        .ok_or(Error::MissingField("metadata"))?;
    let digest: [u8; 32] = Sha256::digest(signed).into();

    Ok(crypto::sign_digest_base64(&digest, key)?)
}

/// Verify a complete, signed payload file against a public key: the metadata
/// signature (when embedded) and the payload signature, with the signed
/// hashes excluding the signature bytes themselves.
pub fn verify_payload(
    mut reader: impl Read + Seek,
    key: &RsaPublicKey,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let header = PayloadHeader::from_reader(&mut reader)?;
    reader.rewind()?;

    let signatures_offset = header
        .manifest
        .signatures_offset
        .filter(|&o| o > 0 || header.manifest.signatures_size.is_some())
        .ok_or(Error::NoSignatures)?;
    let signatures_size = header
        .manifest
        .signatures_size
        .ok_or(Error::MissingField("signatures_size"))?;

    let mut h_signed = Sha256::new();

    // Hash everything up to the metadata signature.
    let signed_metadata_size = header.blob_offset - u64::from(header.metadata_signature_size);
    stream::transfer_exact_with(
        &mut reader,
        io::sink(),
        signed_metadata_size,
        |data| h_signed.update(data),
        cancel_signal,
    )?;
    let metadata_hash: [u8; 32] = h_signed.clone().finalize().into();

    if header.metadata_signature_size > 0 {
        let mut writer = Cursor::new(Vec::new());
        stream::transfer_exact(
            &mut reader,
            &mut writer,
            header.metadata_signature_size.into(),
            cancel_signal,
        )?;

        let metadata_sigs = crypto::parse_signatures(&writer.into_inner())?;
        crypto::verify_digest(&metadata_hash, &metadata_sigs, key)?;
    }

    // Ensure the parsed sizes place us at the start of the data region.
    {
        let actual = reader.stream_position()?;
        if header.blob_offset != actual {
            return Err(Error::InvalidBlobOffset(header.blob_offset, actual));
        }
    }

    stream::transfer_exact_with(
        &mut reader,
        io::sink(),
        signatures_offset,
        |data| h_signed.update(data),
        cancel_signal,
    )?;
    let payload_hash: [u8; 32] = h_signed.finalize().into();

    {
        let expected = header.blob_offset + signatures_offset;
        let actual = reader.stream_position()?;
        if expected != actual {
            return Err(Error::InvalidPayloadSignaturesOffset(expected, actual));
        }
    }

    let payload_sigs = {
        let mut writer = Cursor::new(Vec::new());
        stream::transfer_exact(&mut reader, &mut writer, signatures_size, cancel_signal)?;
        crypto::parse_signatures(&writer.into_inner())?
    };

    crypto::verify_digest(&payload_hash, &payload_sigs, key)?;

    Ok(())
}
