// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block extent arithmetic and extent-addressed device I/O.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    io::{self, Read, Seek, SeekFrom, Write},
};

use thiserror::Error;

use crate::proto::Extent;

/// Start block marking a hole: reads produce zeros, writes are dropped.
pub const SPARSE_HOLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("Extent ({0}, {1}) exceeds integer bounds")]
    IntegerTooLarge(u64, u64),
    #[error("Sparse hole not allowed here")]
    UnexpectedSparseHole,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A resolved byte range on a device. `offset` is `None` for holes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: Option<u64>,
    pub length: u64,
}

fn extent_fields(extent: &Extent) -> Result<(u64, u64)> {
    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

    Ok((start_block, num_blocks))
}

/// Total byte count covered by `extents`.
pub fn extents_bytes(extents: &[Extent], block_size: u64) -> Result<u64> {
    let mut total: u64 = 0;

    for extent in extents {
        let (start_block, num_blocks) = extent_fields(extent)?;
        let length = num_blocks
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge(start_block, num_blocks))?;
        total = total
            .checked_add(length)
            .ok_or(Error::IntegerTooLarge(start_block, num_blocks))?;
    }

    Ok(total)
}

/// Resolve `extents` into byte ranges. When `file_length` is provided and is
/// smaller than the nominal total, the trailing range is clamped to it and
/// anything past it is dropped.
pub fn byte_ranges(
    extents: &[Extent],
    block_size: u64,
    file_length: Option<u64>,
) -> Result<Vec<ByteRange>> {
    let mut ranges = Vec::with_capacity(extents.len());
    let mut remaining = file_length.unwrap_or(u64::MAX);

    for extent in extents {
        if remaining == 0 {
            break;
        }

        let (start_block, num_blocks) = extent_fields(extent)?;
        let nominal = num_blocks
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge(start_block, num_blocks))?;
        let length = nominal.min(remaining);

        let offset = if start_block == SPARSE_HOLE {
            None
        } else {
            Some(
                start_block
                    .checked_mul(block_size)
                    .ok_or(Error::IntegerTooLarge(start_block, num_blocks))?,
            )
        };

        ranges.push(ByteRange { offset, length });
        remaining -= length;
    }

    Ok(ranges)
}

/// Serialize `extents` as `<byte_offset>:<byte_length>` pairs, the addressing
/// form used for bsdiff inputs and outputs. The final entry is clamped to
/// `file_length`.
pub fn bsdiff_positions_string(
    extents: &[Extent],
    block_size: u64,
    file_length: u64,
) -> Result<String> {
    let mut result = String::new();

    for range in byte_ranges(extents, block_size, Some(file_length))? {
        let Some(offset) = range.offset else {
            return Err(Error::UnexpectedSparseHole);
        };

        if !result.is_empty() {
            result.push(',');
        }
        write!(result, "{}:{}", offset, range.length).unwrap();
    }

    Ok(result)
}

/// Read the bytes covered by `extents` into memory, in extent order. Holes
/// read as zeros. The result is truncated to `length` when provided.
pub fn read_extents(
    reader: &mut (impl Read + Seek),
    extents: &[Extent],
    block_size: u64,
    length: Option<u64>,
) -> Result<Vec<u8>> {
    let ranges = byte_ranges(extents, block_size, length)?;
    let total = ranges.iter().map(|r| r.length).sum::<u64>() as usize;

    let mut data = vec![0u8; total];
    let mut filled = 0usize;

    for range in ranges {
        let buf = &mut data[filled..filled + range.length as usize];

        if let Some(offset) = range.offset {
            reader.seek(SeekFrom::Start(offset))?;
            reader.read_exact(buf)?;
        }

        filled += range.length as usize;
    }

    Ok(data)
}

/// Write `data` across `extents` in order. A shorter `data` leaves the tail
/// of the final extents untouched; writes into holes are dropped. Returns the
/// number of bytes consumed from `data`.
pub fn write_extents(
    writer: &mut (impl Write + Seek),
    extents: &[Extent],
    block_size: u64,
    data: &[u8],
) -> Result<u64> {
    let mut consumed = 0usize;

    for range in byte_ranges(extents, block_size, None)? {
        if consumed == data.len() {
            break;
        }

        let n = (range.length as usize).min(data.len() - consumed);

        if let Some(offset) = range.offset {
            writer.seek(SeekFrom::Start(offset))?;
            writer.write_all(&data[consumed..consumed + n])?;
        }

        consumed += n;
    }

    Ok(consumed as u64)
}

/// A normalized set of blocks, kept as disjoint sorted runs.
#[derive(Clone, Debug, Default)]
pub struct ExtentRanges {
    /// start block -> run length
    ranges: BTreeMap<u64, u64>,
}

impl ExtentRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start_block: u64, num_blocks: u64) {
        if num_blocks == 0 {
            return;
        }

        let mut new_start = start_block;
        let mut new_end = start_block.saturating_add(num_blocks);

        // Merge with a predecessor that touches or overlaps us.
        if let Some((&start, &num)) = self.ranges.range(..=start_block).next_back() {
            if start + num >= start_block {
                new_start = start;
                new_end = new_end.max(start + num);
                self.ranges.remove(&start);
            }
        }

        // Absorb every run starting inside the merged range.
        let absorbed = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&start, _)| start)
            .collect::<Vec<_>>();
        for start in absorbed {
            let num = self.ranges.remove(&start).unwrap();
            new_end = new_end.max(start + num);
        }

        self.ranges.insert(new_start, new_end - new_start);
    }

    pub fn add_extents(&mut self, extents: &[Extent]) -> Result<()> {
        for extent in extents {
            let (start_block, num_blocks) = extent_fields(extent)?;
            if start_block != SPARSE_HOLE {
                self.add(start_block, num_blocks);
            }
        }

        Ok(())
    }

    pub fn overlaps(&self, start_block: u64, num_blocks: u64) -> bool {
        if num_blocks == 0 {
            return false;
        }

        let end = start_block.saturating_add(num_blocks);

        match self.ranges.range(..end).next_back() {
            Some((&start, &num)) => start + num > start_block,
            None => false,
        }
    }

    /// Total number of blocks in the set.
    pub fn blocks(&self) -> u64 {
        self.ranges.values().sum()
    }

    /// Whether the set is exactly `[0, num_blocks)`.
    pub fn covers_exactly(&self, num_blocks: u64) -> bool {
        if num_blocks == 0 {
            return self.ranges.is_empty();
        }

        self.ranges.len() == 1 && self.ranges.get(&0) == Some(&num_blocks)
    }
}
