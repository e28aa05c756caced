use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest, Md5};
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mz_ota::format::{header_block, magic_block, TargetHeader};
use mz_ota::storage::ERASED_BYTE;
use mz_ota::{TargetKind, ARCHIVE_MAGIC, BLOCK_SIZE, BOUNDARY_MARKER};

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "MZ5 Clock OTA Archive Tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack firmware images into an MZ5 update archive
    Pack {
        /// Application firmware image
        #[arg(long)]
        app: Option<PathBuf>,

        /// SPIFFS filesystem image
        #[arg(long)]
        spiffs: Option<PathBuf>,

        /// Font asset image
        #[arg(long)]
        font: Option<PathBuf>,

        /// Output archive file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List the targets in an archive and verify their digests
    Inspect {
        /// Archive file
        archive: PathBuf,
    },
    /// Upload an archive to a device
    Upload {
        /// Device IP address
        ip: String,

        /// Archive file to upload
        #[arg(short, long)]
        archive: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Pack {
            app,
            spiffs,
            font,
            output,
        } => pack(app, spiffs, font, &output),
        Commands::Inspect { archive } => inspect(&archive),
        Commands::Upload { ip, archive } => upload(&ip, &archive),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn pack(
    app: Option<PathBuf>,
    spiffs: Option<PathBuf>,
    font: Option<PathBuf>,
    output: &Path,
) -> Result<()> {
    let inputs: Vec<(TargetKind, PathBuf)> = [
        (TargetKind::Code, app),
        (TargetKind::Filesystem, spiffs),
        (TargetKind::FontAsset, font),
    ]
    .into_iter()
    .filter_map(|(kind, path)| path.map(|p| (kind, p)))
    .collect();

    if inputs.is_empty() {
        bail!("nothing to pack; pass at least one of --app, --spiffs, --font");
    }

    let mut out = magic_block().to_vec();

    for (kind, path) in &inputs {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let original_length = u32::try_from(raw.len())
            .ok()
            .filter(|&n| n > 0)
            .with_context(|| format!("{} is empty or too large", path.display()))?;

        // Pad to a whole number of blocks with the flash erased value, so
        // the padding costs nothing to write and the digest covers the
        // exact final on-flash content.
        let mut padded = raw;
        let rem = padded.len() % BLOCK_SIZE;
        if rem != 0 {
            padded.resize(padded.len() + BLOCK_SIZE - rem, ERASED_BYTE);
        }
        let digest: [u8; 16] = Md5::digest(&padded).into();

        let header = TargetHeader::new(*kind, original_length, padded.len() as u32, digest);
        out.extend_from_slice(&header_block(&header));
        out.extend_from_slice(&padded);

        println!(
            "  {} {:<8} {:>9} bytes ({} blocks)  md5 {}",
            "+".green(),
            kind.label(),
            original_length,
            padded.len() / BLOCK_SIZE,
            hex(&digest)
        );
    }

    fs::write(output, &out).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "{} {} ({} bytes, {} target(s))",
        "Packed".green().bold(),
        output.display(),
        out.len(),
        inputs.len()
    );
    Ok(())
}

fn inspect(archive: &Path) -> Result<()> {
    let bytes = fs::read(archive).with_context(|| format!("reading {}", archive.display()))?;
    if bytes.len() % BLOCK_SIZE != 0 {
        bail!("archive is not a whole number of {BLOCK_SIZE}-byte blocks");
    }
    if bytes.len() < BLOCK_SIZE || bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        bail!("not an MZ5 archive (bad magic)");
    }
    println!("{}", "MZ5 firmware archive 1.0".bold());

    let mut pos = BLOCK_SIZE;
    let mut ok = true;
    while pos < bytes.len() {
        let block = &bytes[pos..pos + BLOCK_SIZE];
        if block[..BOUNDARY_MARKER.len()] != BOUNDARY_MARKER {
            bail!("missing target boundary marker at offset {pos:#x}");
        }
        let header =
            TargetHeader::parse(&block[BOUNDARY_MARKER.len()..]).context("short target header")?;
        pos += BLOCK_SIZE;

        let archived = header.archived_length as usize;
        if archived == 0 || archived % BLOCK_SIZE != 0 || pos + archived > bytes.len() {
            bail!("target '{}' has invalid size {archived}", header.label_str());
        }
        let digest: [u8; 16] = Md5::digest(&bytes[pos..pos + archived]).into();
        pos += archived;

        let verdict = if digest == header.content_hash {
            "ok".green()
        } else {
            ok = false;
            "DIGEST MISMATCH".red().bold()
        };
        let label = match header.kind() {
            Some(_) => header.label_str().normal(),
            None => format!("{} (unknown)", header.label_str()).yellow(),
        };
        println!(
            "  {:<8} {:>9} -> {:>9} bytes  md5 {}  {}",
            label,
            header.original_length,
            header.archived_length,
            hex(&header.content_hash),
            verdict
        );
    }

    if !ok {
        bail!("archive failed verification");
    }
    Ok(())
}

fn upload(ip: &str, archive: &Path) -> Result<()> {
    let bytes = fs::read(archive).with_context(|| format!("reading {}", archive.display()))?;
    println!(
        "{} {} ({} bytes) to {}",
        "Uploading".cyan(),
        archive.display(),
        bytes.len(),
        ip
    );

    let client = Client::builder().timeout(Duration::from_secs(300)).build()?;

    let pb = ProgressBar::new(bytes.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("#>-"),
    );

    let url = format!("http://{ip}/update");
    let response = client
        .post(&url)
        .header("Content-Length", bytes.len().to_string())
        .body(bytes)
        .send()
        .with_context(|| format!("uploading to {url}"))?;
    pb.finish_and_clear();

    if !response.status().is_success() {
        bail!("device rejected the update: HTTP {}", response.status());
    }
    println!(
        "{} Device verified the archive and will restart.",
        "Done.".green().bold()
    );
    Ok(())
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
