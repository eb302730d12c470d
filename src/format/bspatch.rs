// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Applier for the classic `BSDIFF40` patch container: a header carrying the
//! control and diff stream lengths plus the new file size, followed by three
//! independently bzip2-compressed streams (control triples, diff bytes, extra
//! bytes).

use std::io::{self, Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Patch too short: {0} bytes")]
    PatchTooShort(usize),
    #[error("Negative length field: {0}")]
    NegativeLength(i64),
    #[error("Control stream is inconsistent with the new size")]
    CorruptControl,
    #[error("Seek outside the old data: {0}")]
    BadSeek(i64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decode a sign-magnitude 64-bit little-endian integer.
fn offtin(buf: [u8; 8]) -> i64 {
    let mut y = i64::from(buf[7] & 0x7f);
    for i in (0..7).rev() {
        y = (y << 8) | i64::from(buf[i]);
    }

    if buf[7] & 0x80 != 0 {
        -y
    } else {
        y
    }
}

/// Encode a sign-magnitude 64-bit little-endian integer.
fn offtout(x: i64) -> [u8; 8] {
    let mut buf = x.unsigned_abs().to_le_bytes();
    if x < 0 {
        buf[7] |= 0x80;
    }

    buf
}

fn non_negative(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::NegativeLength(value))
}

/// Read the next sign-magnitude field from the control stream.
fn read_off(mut reader: impl Read) -> io::Result<[u8; 8]> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Apply `patch` to `old`, returning the new data.
pub fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() < HEADER_SIZE {
        return Err(Error::PatchTooShort(patch.len()));
    }

    let magic: [u8; 8] = patch[..8].try_into().unwrap();
    if magic != *MAGIC {
        return Err(Error::UnknownMagic(magic));
    }

    let ctrl_len = non_negative(offtin(patch[8..16].try_into().unwrap()))?;
    let diff_len = non_negative(offtin(patch[16..24].try_into().unwrap()))?;
    let new_size = non_negative(offtin(patch[24..32].try_into().unwrap()))?;

    let body = &patch[HEADER_SIZE..];
    if body.len() < ctrl_len + diff_len {
        return Err(Error::PatchTooShort(patch.len()));
    }

    let mut ctrl = BzDecoder::new(&body[..ctrl_len]);
    let mut diff = BzDecoder::new(&body[ctrl_len..ctrl_len + diff_len]);
    let mut extra = BzDecoder::new(&body[ctrl_len + diff_len..]);

    let mut new = vec![0u8; new_size];
    let mut new_pos = 0usize;
    let mut old_pos = 0i64;

    while new_pos < new_size {
        let add_len = non_negative(offtin(read_off(&mut ctrl)?))?;
        let copy_len = non_negative(offtin(read_off(&mut ctrl)?))?;
        let seek_len = offtin(read_off(&mut ctrl)?);

        if add_len + copy_len > new_size - new_pos {
            return Err(Error::CorruptControl);
        }

        // Diff bytes are added to the corresponding old bytes. Positions
        // outside the old data contribute zero to the sum.
        diff.read_exact(&mut new[new_pos..new_pos + add_len])?;
        for i in 0..add_len {
            let opos = old_pos + i as i64;
            if opos >= 0 && (opos as usize) < old.len() {
                new[new_pos + i] = new[new_pos + i].wrapping_add(old[opos as usize]);
            }
        }
        new_pos += add_len;
        old_pos += add_len as i64;

        extra.read_exact(&mut new[new_pos..new_pos + copy_len])?;
        new_pos += copy_len;

        old_pos = old_pos.checked_add(seek_len).ok_or(Error::BadSeek(seek_len))?;
    }

    Ok(new)
}

/// Assemble a `BSDIFF40` patch from raw control triples, diff bytes, and
/// extra bytes. This is the fixture-side counterpart of [`apply`]; it does no
/// matching of its own.
pub fn build_patch(ctrl: &[(i64, i64, i64)], diff: &[u8], extra: &[u8]) -> io::Result<Vec<u8>> {
    let compress = |data: &[u8]| -> io::Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    };

    let mut ctrl_raw = Vec::with_capacity(ctrl.len() * 24);
    for &(add_len, copy_len, seek_len) in ctrl {
        ctrl_raw.extend_from_slice(&offtout(add_len));
        ctrl_raw.extend_from_slice(&offtout(copy_len));
        ctrl_raw.extend_from_slice(&offtout(seek_len));
    }

    let ctrl_bz = compress(&ctrl_raw)?;
    let diff_bz = compress(diff)?;
    let extra_bz = compress(extra)?;

    let new_size = ctrl
        .iter()
        .map(|&(add_len, copy_len, _)| add_len + copy_len)
        .sum::<i64>();

    let mut patch = Vec::with_capacity(HEADER_SIZE + ctrl_bz.len() + diff_bz.len() + extra_bz.len());
    patch.extend_from_slice(MAGIC);
    patch.extend_from_slice(&offtout(ctrl_bz.len() as i64));
    patch.extend_from_slice(&offtout(diff_bz.len() as i64));
    patch.extend_from_slice(&offtout(new_size));
    patch.extend_from_slice(&ctrl_bz);
    patch.extend_from_slice(&diff_bz);
    patch.extend_from_slice(&extra_bz);

    Ok(patch)
}
