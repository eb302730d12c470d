// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Cancellable bulk transfers. Almost every copy in this crate moves a byte
//! count dictated by the payload manifest, so the helpers here are
//! exact-length transfers that treat an early EOF on either side as
//! corruption, not as a normal end of stream.

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Per-iteration buffer size for the transfer loops.
const TRANSFER_BUF_SIZE: usize = 64 * 1024;

/// Fail with [`io::ErrorKind::Interrupted`] once `cancel_signal` has been
/// raised. Transfer loops poll this between buffers, bounding how much work
/// happens after a cancellation request.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Update was cancelled",
        ));
    }

    Ok(())
}

/// Move exactly `size` bytes from `reader` to `writer`, handing each buffer
/// to `observe` before it is written. This is the seam where consumed payload
/// bytes also feed a running digest.
pub fn transfer_exact_with(
    mut reader: impl Read,
    mut writer: impl Write,
    size: u64,
    mut observe: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = vec![0u8; TRANSFER_BUF_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        check_cancel(cancel_signal)?;

        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Transfer ended with {remaining} bytes still expected"),
            ));
        }

        observe(&buf[..n]);
        writer.write_all(&buf[..n])?;

        remaining -= n as u64;
    }

    Ok(())
}

/// Move exactly `size` bytes from `reader` to `writer`.
pub fn transfer_exact(
    reader: impl Read,
    writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    transfer_exact_with(reader, writer, size, |_| {}, cancel_signal)
}

/// Drain `reader` into `writer` until the reader reaches EOF and return the
/// number of bytes moved. Only the download tail uses this; everything with a
/// known length goes through [`transfer_exact`].
pub fn transfer_to_end(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = vec![0u8; TRANSFER_BUF_SIZE];
    let mut total = 0u64;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }

        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Write `size` zero bytes at the writer's current position. ZERO operations
/// and block padding always produce whole 4096-byte blocks, so the fill
/// buffer is one block.
pub fn write_zeros(mut writer: impl Write, size: u64) -> io::Result<()> {
    const ZERO_BLOCK: [u8; 4096] = [0u8; 4096];

    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZERO_BLOCK.len() as u64) as usize;
        writer.write_all(&ZERO_BLOCK[..n])?;
        remaining -= n as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Seek, SeekFrom},
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::{check_cancel, transfer_exact, transfer_exact_with, transfer_to_end, write_zeros};

    #[test]
    fn cancel_flag() {
        let cancel_signal = AtomicBool::new(false);
        check_cancel(&cancel_signal).unwrap();

        cancel_signal.store(true, Ordering::SeqCst);
        let err = check_cancel(&cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn exact_transfer_observes_all_bytes() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"exactly these bytes");
        let mut writer = Cursor::new(vec![0u8; 19]);

        let mut observed = vec![];
        transfer_exact_with(
            &mut reader,
            &mut writer,
            19,
            |data| observed.extend_from_slice(data),
            &cancel_signal,
        )
        .unwrap();

        assert_eq!(writer.get_ref().as_slice(), b"exactly these bytes");
        assert_eq!(observed, b"exactly these bytes");
    }

    #[test]
    fn exact_transfer_rejects_short_reader() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"short");
        let mut writer = Cursor::new(vec![0u8; 16]);

        let err = transfer_exact(&mut reader, &mut writer, 16, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn exact_transfer_rejects_short_writer() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(vec![7u8; 16]);
        // A fixed-size cursor cannot grow past its array.
        let mut writer = Cursor::new([0u8; 4]);

        let err = transfer_exact(&mut reader, &mut writer, 16, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn transfer_stops_on_cancel() {
        let cancel_signal = AtomicBool::new(true);
        let mut reader = Cursor::new(b"data");
        let mut writer = Cursor::new(vec![0u8; 4]);

        let err = transfer_exact(&mut reader, &mut writer, 4, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);

        let err = transfer_to_end(&mut reader, &mut writer, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn drain_to_end() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"whatever is left");
        let mut writer = Cursor::new(vec![0u8; 16]);

        let n = transfer_to_end(&mut reader, &mut writer, &cancel_signal).unwrap();
        assert_eq!(n, 16);
        assert_eq!(writer.get_ref().as_slice(), b"whatever is left");
    }

    #[test]
    fn zero_fill() {
        let mut writer = Cursor::new(vec![0xffu8; 6000]);

        write_zeros(&mut writer, 5000).unwrap();
        writer.seek(SeekFrom::Start(0)).unwrap();

        let data = writer.into_inner();
        assert!(data[..5000].iter().all(|&b| b == 0));
        assert!(data[5000..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn zero_fill_rejects_full_writer() {
        let mut writer = Cursor::new([0xffu8; 100]);

        let err = write_zeros(&mut writer, 200).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
