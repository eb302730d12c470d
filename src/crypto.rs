/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::Path,
};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use prost::Message;
use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::proto::{Signature, Signatures};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load public key")]
    LoadPublicKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load private key")]
    LoadPrivateKey(#[source] pkcs8::Error),
    #[error("Invalid base64 data")]
    InvalidBase64(#[source] base64::DecodeError),
    #[error("Signature block contains no usable signatures")]
    NoSignatures,
    #[error("Failed to parse signature block")]
    Protobuf(#[from] prost::DecodeError),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Read a PEM-encoded SPKI public key from a reader.
pub fn read_pem_public_key(mut reader: impl Read) -> Result<RsaPublicKey> {
    let mut data = String::new();
    reader.read_to_string(&mut data)?;

    RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPublicKey)
}

/// Read a PEM-encoded SPKI public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    read_pem_public_key(reader)
}

/// Read an unencrypted PEM-encoded PKCS8 private key from a reader.
pub fn read_pem_key(mut reader: impl Read) -> Result<RsaPrivateKey> {
    let mut data = String::new();
    reader.read_to_string(&mut data)?;

    RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadPrivateKey)
}

/// Read an unencrypted PEM-encoded PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    read_pem_key(reader)
}

/// Sign `digest` with `key` and return a [`Signatures`] message with the
/// signature padded to the maximum size. Padding keeps the serialized message
/// size independent of the digest, which the payload layout relies on.
pub fn sign_digest(digest: &[u8], key: &RsaPrivateKey) -> Result<Signatures> {
    let scheme = Pkcs1v15Sign::new::<Sha256>();
    let mut digest_signed = key.sign(scheme, digest)?;
    assert!(
        digest_signed.len() <= key.size(),
        "Signature exceeds maximum size",
    );

    let unpadded_size = digest_signed.len();
    digest_signed.resize(key.size(), 0);

    let signature = Signature {
        version: None,
        data: Some(digest_signed),
        // Always fits in even a u16.
        unpadded_signature_size: Some(unpadded_size as u32),
    };

    Ok(Signatures {
        signatures: vec![signature],
    })
}

/// Sign `digest` and return the base64-encoded serialized [`Signatures`]
/// message, the form a discovery response carries for the metadata signature.
pub fn sign_digest_base64(digest: &[u8], key: &RsaPrivateKey) -> Result<String> {
    let signatures = sign_digest(digest, key)?;

    Ok(STANDARD.encode(signatures.encode_to_vec()))
}

/// Verify `digest` against any of the entries in `signatures`. Entries
/// without an unpadded size are treated as unpadded, which old payloads
/// produce.
pub fn verify_digest(digest: &[u8], signatures: &Signatures, key: &RsaPublicKey) -> Result<()> {
    let mut last_error = None;

    for signature in &signatures.signatures {
        let Some(data) = &signature.data else {
            continue;
        };
        let size = signature
            .unpadded_signature_size
            .map_or(data.len(), |s| s as usize)
            .min(data.len());
        let without_padding = &data[..size];

        let scheme = Pkcs1v15Sign::new::<Sha256>();
        match key.verify(scheme, digest, without_padding) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.map_or(Error::NoSignatures, Error::Rsa))
}

/// Parse a serialized [`Signatures`] message.
pub fn parse_signatures(data: &[u8]) -> Result<Signatures> {
    Ok(Signatures::decode(data)?)
}

/// Parse a base64-encoded serialized [`Signatures`] message.
pub fn parse_signatures_base64(data: &str) -> Result<Signatures> {
    let raw = STANDARD.decode(data).map_err(Error::InvalidBase64)?;

    parse_signatures(&raw)
}

/// Decode a base64-encoded PEM public key received in-band and stage it in a
/// temporary file. The file is deleted when the returned handle is dropped.
pub fn stage_key_from_base64(blob: &str) -> Result<NamedTempFile> {
    let decoded = STANDARD.decode(blob).map_err(Error::InvalidBase64)?;

    let mut file = NamedTempFile::new()?;
    file.write_all(&decoded)?;
    file.flush()?;

    Ok(file)
}
