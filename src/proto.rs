// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! `chromeos_update_engine` payload manifest messages.
//!
//! These are hand-written prost derives using the canonical field tags so
//! that the wire format stays byte compatible with payloads produced by other
//! tooling. Field numbers must never be changed.

/// A contiguous run of blocks on a device. A `start_block` equal to
/// [`crate::format::extent::SPARSE_HOLE`] denotes a hole: reads produce
/// zeros and writes are dropped.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Extent {
    #[prost(uint64, optional, tag = "1")]
    pub start_block: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub num_blocks: Option<u64>,
}

impl Extent {
    pub fn for_range(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }
}

/// Size and SHA-256 digest of a whole partition image.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PartitionInfo {
    #[prost(uint64, optional, tag = "1")]
    pub size: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct InstallOperation {
    #[prost(enumeration = "install_operation::Type", required, tag = "1")]
    pub r#type: i32,
    /// Offset into the payload data region carrying this operation's bytes.
    #[prost(uint64, optional, tag = "2")]
    pub data_offset: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub data_length: Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub src_extents: Vec<Extent>,
    #[prost(uint64, optional, tag = "5")]
    pub src_length: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub dst_extents: Vec<Extent>,
    #[prost(uint64, optional, tag = "7")]
    pub dst_length: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub data_sha256_hash: Option<Vec<u8>>,
}

pub mod install_operation {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Type {
        Replace = 0,
        ReplaceBz = 1,
        Move = 2,
        Bsdiff = 3,
        SourceCopy = 4,
        SourceBsdiff = 5,
        Zero = 6,
        Discard = 7,
        ReplaceXz = 8,
    }
}

impl InstallOperation {
    /// Decoded opcode, or `None` for values from a newer dialect.
    pub fn op_type(&self) -> Option<install_operation::Type> {
        install_operation::Type::try_from(self.r#type).ok()
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Signature {
    /// Historical key version field. Ignored, but kept for wire compatibility.
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    /// Length of the signature before zero padding. Absent in old payloads,
    /// in which case `data` is unpadded.
    #[prost(fixed32, optional, tag = "3")]
    pub unpadded_signature_size: Option<u32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Signatures {
    #[prost(message, repeated, tag = "1")]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DeltaArchiveManifest {
    #[prost(message, repeated, tag = "1")]
    pub install_operations: Vec<InstallOperation>,
    #[prost(message, repeated, tag = "2")]
    pub kernel_install_operations: Vec<InstallOperation>,
    #[prost(uint32, optional, tag = "3")]
    pub block_size: Option<u32>,
    /// Offset of the payload signature blob within the data region. Zero or
    /// absent when the payload is unsigned.
    #[prost(uint64, optional, tag = "4")]
    pub signatures_offset: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub signatures_size: Option<u64>,
    #[prost(message, optional, tag = "6")]
    pub old_kernel_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "7")]
    pub new_kernel_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "8")]
    pub old_rootfs_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "9")]
    pub new_rootfs_info: Option<PartitionInfo>,
    #[prost(uint32, optional, tag = "12")]
    pub minor_version: Option<u32>,
}

impl DeltaArchiveManifest {
    pub fn block_size_or_default(&self) -> u32 {
        self.block_size.unwrap_or(4096)
    }
}
