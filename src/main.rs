//! BTRFS chunk-map rescue CLI
//!
//! Scans the given devices, rebuilds the chunk map, and prints the
//! diagnostic report to stdout. An expensive scan can be saved to JSON and
//! reused across runs.

use anyhow::{Context, Result};
use btrfs_rescue::core::{AddrDelta, LogicalVolume};
use btrfs_rescue::{blockdev, rebuild, scan, BlockDevice, CancelToken, RebuildOptions, Superblock};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

struct Args {
    devices: Vec<String>,
    scan_in: Option<String>,
    scan_out: Option<String>,
    min_fuzzy_pct: f64,
}

fn usage(program: &str) -> ! {
    eprintln!("BTRFS Rescue v{}", btrfs_rescue::VERSION);
    eprintln!();
    eprintln!("Usage: {} [options] <device>...", program);
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  device            BTRFS image file or block device (one per filesystem device)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scan-out FILE   Save the device scan result as JSON");
    eprintln!("  --scan-in FILE    Reuse a saved scan result instead of scanning");
    eprintln!("  --min-fuzzy-pct P Fuzzy-match acceptance threshold (default 0.5)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} /dev/sdb /dev/sdc", program);
    eprintln!("  {} --scan-out scan.json ./btrfs.img", program);
    std::process::exit(1);
}

fn parse_args() -> Result<Args> {
    let mut argv = std::env::args();
    let program = argv.next().unwrap_or_else(|| "btrfs-rescue".to_string());
    let mut args = Args {
        devices: Vec::new(),
        scan_in: None,
        scan_out: None,
        min_fuzzy_pct: 0.5,
    };
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--scan-in" => args.scan_in = argv.next(),
            "--scan-out" => args.scan_out = argv.next(),
            "--min-fuzzy-pct" => {
                let value = argv.next().unwrap_or_else(|| usage(&program));
                args.min_fuzzy_pct = value
                    .parse()
                    .with_context(|| format!("bad --min-fuzzy-pct value: {}", value))?;
            }
            "-h" | "--help" => usage(&program),
            other if other.starts_with('-') => usage(&program),
            other => args.devices.push(other.to_string()),
        }
    }
    if args.devices.is_empty() {
        usage(&program);
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = parse_args()?;

    let token = CancelToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling");
                token.cancel();
            }
        });
    }

    // Open every device and read its superblock; the newest valid copy
    // across devices describes the filesystem.
    let mut devices: Vec<(btrfs_rescue::core::DeviceId, Arc<dyn BlockDevice>)> = Vec::new();
    let mut sb: Option<Superblock> = None;
    for path in &args.devices {
        let device: Arc<dyn BlockDevice> =
            Arc::from(blockdev::open(path).with_context(|| format!("opening {}", path))?);
        let dev_sb = Superblock::read_from_device(device.as_ref())
            .with_context(|| format!("reading superblock of {}", path))?;
        tracing::info!(
            "{}: devid {} of {} (fsid {}, generation {})",
            path,
            dev_sb.devid(),
            dev_sb.num_devices(),
            dev_sb.fsid(),
            dev_sb.generation()
        );
        devices.push((dev_sb.devid(), device));
        if sb
            .as_ref()
            .is_none_or(|best| dev_sb.generation() > best.generation())
        {
            sb = Some(dev_sb);
        }
    }
    let sb = sb.context("no usable superblock found")?;
    if devices.len() as u64 != sb.num_devices() {
        tracing::warn!(
            "superblock names {} devices but {} were given; the rebuild will be partial",
            sb.num_devices(),
            devices.len()
        );
    }

    let scan_result = match &args.scan_in {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing scan result {}", path))?
        }
        None => scan::scan_devices(&token, &sb, devices).await?,
    };
    if let Some(path) = &args.scan_out {
        let file = File::create(path).with_context(|| format!("creating {}", path))?;
        serde_json::to_writer(BufWriter::new(file), &scan_result)
            .with_context(|| format!("writing scan result {}", path))?;
        tracing::info!("scan result saved to {}", path);
    }

    let mut lv = LogicalVolume::new();
    for (&dev, result) in &scan_result.devices {
        lv.add_physical_volume(dev, result.size);
    }

    let opts = RebuildOptions {
        min_fuzzy_pct: args.min_fuzzy_pct,
    };
    let mut stdout = std::io::stdout().lock();
    rebuild::rebuild_mappings(
        &token,
        &mut lv,
        &scan_result,
        AddrDelta(sb.node_size() as i64),
        &opts,
        &mut stdout,
    )?;

    tracing::info!("rebuild complete: {} mappings", lv.len());
    Ok(())
}
