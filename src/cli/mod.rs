// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Mutex},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing::info;
use xz2::stream::{Check, Stream};
use xz2::write::XzEncoder;

use crate::{
    applier::{Applier, ProgressSink},
    crypto,
    format::payload::{
        self, PayloadBuilder, PayloadHeader, BLOCK_SIZE, BRILLO_MAJOR_PAYLOAD_VERSION,
        FULL_PAYLOAD_MINOR_VERSION,
    },
    hardware::{Hardware, SystemHardware},
    plan::InstallPlan,
    prefs::FsPrefs,
    proto::{install_operation, Extent, InstallOperation, PartitionInfo},
    stream,
};

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

const RELEASE_FILE: &str = "/etc/lsb-release";

/// Uncompressed chunk size for payloads produced by `pack`.
const PACK_CHUNK_SIZE: usize = 2 * 1024 * 1024;

fn open_payload(path: &Path) -> Result<(BufReader<File>, PayloadHeader)> {
    let mut reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open payload for reading: {path:?}"))?;
    let header = PayloadHeader::from_reader(&mut reader)
        .with_context(|| format!("Failed to read payload header: {path:?}"))?;

    Ok((reader, header))
}

/// Prints coarse download progress without flooding the terminal.
struct CliProgress {
    payload_size: u64,
    last_percent: Mutex<u64>,
}

impl CliProgress {
    fn new(payload_size: u64) -> Self {
        Self {
            payload_size,
            last_percent: Mutex::new(0),
        }
    }
}

impl ProgressSink for CliProgress {
    fn download_progress(&self, bytes_so_far: u64) {
        if self.payload_size == 0 {
            return;
        }

        let percent = bytes_so_far * 100 / self.payload_size;
        let mut last = self.last_percent.lock().unwrap();

        if percent / 10 > *last / 10 {
            status!("Applied {percent}%");
            *last = percent;
        }
    }
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let (mut reader, header) = open_payload(&cli.input)?;
    let payload_size = reader
        .seek(SeekFrom::End(0))
        .with_context(|| format!("Failed to get file size: {:?}", cli.input))?;

    status!("Payload size: {payload_size} bytes");
    status!("Metadata size: {} bytes", header.blob_offset);
    println!("{header:#?}");

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let public_key = crypto::read_pem_public_key_file(&cli.public_key)
        .with_context(|| format!("Failed to load key: {:?}", cli.public_key))?;

    let reader = File::open(&cli.input)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open payload for reading: {:?}", cli.input))?;

    payload::verify_payload(reader, &public_key, cancel_signal)
        .context("Payload verification failed")?;

    status!("Payload signatures are valid");

    Ok(())
}

fn apply_subcommand(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let plan = InstallPlan {
        is_full_update: cli.full,
        payload_id: cli
            .payload
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_owned()),
        source_path: cli.source.clone(),
        kernel_source_path: cli.source_kernel.clone(),
        install_path: cli.install.clone(),
        kernel_install_path: cli.kernel_install.clone().unwrap_or_default(),
        metadata_size: cli.metadata_size.unwrap_or(0),
        metadata_signature: cli.metadata_signature.clone().unwrap_or_default(),
        hash_checks_mandatory: cli.mandatory_hash_checks,
        public_key_rsa: String::new(),
        powerwash_required: cli.powerwash,
        target_slot: cli.target_slot.clone().unwrap_or_default(),
    };

    let prefs = FsPrefs::new(&cli.state_dir);
    let hardware = SystemHardware::new(Path::new(RELEASE_FILE));

    let mut file = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;
    let payload_size = file.seek(SeekFrom::End(0))?;
    file.rewind()?;

    // The header is parsed up front so the metadata can be delivered as one
    // piece and the resume decision made before streaming the data region.
    let header = PayloadHeader::from_reader(&mut file)
        .with_context(|| format!("Failed to read payload header: {:?}", cli.payload))?;
    let metadata_size = header.blob_offset;
    file.rewind()?;

    let progress = CliProgress::new(payload_size);
    let mut applier =
        Applier::new(plan, &prefs, &hardware, cancel_signal).with_progress(&progress);

    if let Some(path) = &cli.public_key {
        applier.set_public_key_path(path);
    }

    applier
        .open_install(&cli.install)
        .context("Failed to open install target")?;
    if let Some(path) = &cli.kernel_install {
        applier
            .open_kernel(path)
            .context("Failed to open kernel install target")?;
    }
    if let Some(path) = &cli.source {
        applier
            .open_source_rootfs(path)
            .context("Failed to open source rootfs")?;
    }
    if let Some(path) = &cli.source_kernel {
        applier
            .open_source_kernel(path)
            .context("Failed to open source kernel")?;
    }

    if let Err(e) = feed_payload(&mut file, &mut applier, metadata_size, cancel_signal) {
        let _ = applier.close();
        if let Some(code) = applier.error_code() {
            bail!("{e:#}: {code}");
        }
        return Err(e);
    }

    applier.close().context("Update did not complete")?;

    status!("Target image written and verified");
    if applier.powerwash_required() {
        if hardware.is_powerwash_allowed() {
            status!("A powerwash will be requested by the post-install step");
        } else {
            status!("This device does not allow powerwash; the request is dropped");
        }
    }
    if !applier.target_slot().is_empty() {
        status!(
            "Slot {} is ready to be marked bootable by the boot controller",
            applier.target_slot(),
        );
    }

    Ok(())
}

fn feed_payload(
    file: &mut File,
    applier: &mut Applier<'_>,
    metadata_size: u64,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    stream::transfer_exact(&mut *file, &mut *applier, metadata_size, cancel_signal)
        .context("Failed to apply payload metadata")?;

    if applier.resumed() {
        let offset = applier.resume_offset();
        status!("Resuming interrupted update at offset {offset}");
        file.seek(SeekFrom::Start(offset))?;
    }

    stream::transfer_to_end(&mut *file, &mut *applier, cancel_signal)
        .context("Failed to apply payload data")?;

    Ok(())
}

/// Compress a chunk the way payload generators do: xz with no integrity
/// check, since the applier's decoder does not require one.
fn xz_compress(data: &[u8]) -> Result<Vec<u8>> {
    let stream = Stream::new_easy_encoder(6, Check::None)?;
    let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(data)?;

    Ok(encoder.finish()?)
}

fn pack_image(
    path: &Path,
    mut builder: PayloadBuilder,
    kernel: bool,
    cancel_signal: &AtomicBool,
) -> Result<PayloadBuilder> {
    let mut file = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open image: {path:?}"))?;

    let mut image_hash = Sha256::new();
    let mut image_size = 0u64;
    let mut block = 0u64;
    let mut chunk = vec![0u8; PACK_CHUNK_SIZE];

    loop {
        stream::check_cancel(cancel_signal)?;

        let n = read_up_to(&mut file, &mut chunk)?;
        if n == 0 {
            break;
        }

        let mut data = chunk[..n].to_vec();
        if data.len() % BLOCK_SIZE as usize != 0 {
            bail!("Image size of {path:?} is not aligned to the block size");
        }

        image_hash.update(&data);
        image_size += data.len() as u64;

        let num_blocks = data.len() as u64 / u64::from(BLOCK_SIZE);
        let extent = Extent::for_range(block, num_blocks);
        block += num_blocks;

        let op = if all_zeros(&data) {
            InstallOperation {
                r#type: install_operation::Type::Zero as i32,
                dst_extents: vec![extent],
                ..Default::default()
            }
        } else {
            let compressed = xz_compress(&data)?;
            let op_type = if compressed.len() < data.len() {
                data = compressed;
                install_operation::Type::ReplaceXz
            } else {
                install_operation::Type::Replace
            };

            InstallOperation {
                r#type: op_type as i32,
                dst_extents: vec![extent],
                data_sha256_hash: Some(Sha256::digest(&data).to_vec()),
                ..Default::default()
            }
        };

        let data = (op.data_sha256_hash.is_some()).then_some(data);
        builder = if kernel {
            builder.kernel_op(op, data)
        } else {
            builder.rootfs_op(op, data)
        };
    }

    let info = PartitionInfo {
        size: Some(image_size),
        hash: Some(image_hash.finalize().to_vec()),
    };
    builder = if kernel {
        builder.new_kernel_info(info)
    } else {
        builder.new_rootfs_info(info)
    };

    Ok(builder)
}

/// A chunk containing only zero blocks becomes a ZERO operation instead of
/// carrying (even compressed) data in the payload.
fn all_zeros(chunk: &[u8]) -> bool {
    chunk.iter().all(|&b| b == 0)
}

fn read_up_to(mut reader: impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(filled)
}

fn pack_subcommand(cli: &PackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let signing_key = cli
        .key
        .as_deref()
        .map(|path| {
            crypto::read_pem_key_file(path)
                .with_context(|| format!("Failed to load key: {path:?}"))
        })
        .transpose()?;

    let mut builder =
        PayloadBuilder::new(cli.major_version).minor_version(FULL_PAYLOAD_MINOR_VERSION);

    builder = pack_image(&cli.rootfs, builder, false, cancel_signal)?;
    if let Some(path) = &cli.kernel {
        builder = pack_image(path, builder, true, cancel_signal)?;
    }

    info!("Generating payload");

    let built = builder
        .build(signing_key.as_ref())
        .context("Failed to build payload")?;

    std::fs::write(&cli.output, &built.data)
        .with_context(|| format!("Failed to write payload: {:?}", cli.output))?;

    status!("Payload size: {} bytes", built.data.len());
    status!("Metadata size: {} bytes", built.metadata_size);
    if let Some(signature) = &built.metadata_signature {
        status!("Metadata signature: {signature}");
    }

    Ok(())
}

/// Display payload header information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify the signatures of a complete payload file.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to PEM public key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    public_key: PathBuf,
}

/// Apply a payload to the target image files.
///
/// For delta payloads, the source images must be provided and are only read.
/// The applier leaves a checkpoint in the state directory after every
/// completed operation, so an interrupted run resumes where it stopped.
#[derive(Debug, Parser)]
struct ApplyCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,

    /// Path to the rootfs install target.
    #[arg(short, long, value_name = "FILE", value_parser)]
    install: PathBuf,

    /// Path to the kernel install target.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel_install: Option<PathBuf>,

    /// Path to the source rootfs (delta payloads).
    #[arg(long, value_name = "FILE", value_parser)]
    source: Option<PathBuf>,

    /// Path to the source kernel (delta payloads).
    #[arg(long, value_name = "FILE", value_parser)]
    source_kernel: Option<PathBuf>,

    /// The payload is a full image rather than a delta.
    #[arg(long)]
    full: bool,

    /// Expected metadata size from the update response.
    #[arg(long, value_name = "BYTES")]
    metadata_size: Option<u64>,

    /// Base64 metadata signature from the update response.
    #[arg(long, value_name = "BASE64")]
    metadata_signature: Option<String>,

    /// Treat all size and signature checks as mandatory.
    #[arg(long)]
    mandatory_hash_checks: bool,

    /// Request a factory reset after the update is installed.
    #[arg(long)]
    powerwash: bool,

    /// Path to PEM public key for signature verification.
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Option<PathBuf>,

    /// Opaque target slot label reported to the boot controller.
    #[arg(long, value_name = "SLOT")]
    target_slot: Option<String>,

    /// Directory for resumable update state.
    #[arg(long, value_name = "DIR", value_parser, default_value = "deltapply-state")]
    state_dir: PathBuf,
}

/// Build a full payload from partition images.
///
/// All-zero chunks become ZERO operations and the rest are stored
/// xz-compressed when that is smaller. Mainly useful for producing test
/// payloads.
#[derive(Debug, Parser)]
struct PackCli {
    /// Path to output payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to rootfs image.
    #[arg(long, value_name = "FILE", value_parser)]
    rootfs: PathBuf,

    /// Path to kernel image.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel: Option<PathBuf>,

    /// Path to PEM private key for signing.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,

    /// Payload major version to produce.
    #[arg(long, value_name = "VERSION", default_value_t = BRILLO_MAJOR_PAYLOAD_VERSION)]
    major_version: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    Info(InfoCli),
    Verify(VerifyCli),
    Apply(ApplyCli),
    Pack(PackCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

pub fn main(cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Info(c) => info_subcommand(c),
        Command::Verify(c) => verify_subcommand(c, cancel_signal),
        Command::Apply(c) => apply_subcommand(c, cancel_signal),
        Command::Pack(c) => pack_subcommand(c, cancel_signal),
    }
}
