use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use dfuse_core::file::DfuFile;
use dfuse_core::progress::ProgressSink;
use dfuse_core::protocol::constants::{ST_DFU_PRODUCT_ID, ST_VENDOR_ID};
use dfuse_core::session::{ProgramOptions, Programmer};
use dfuse_core::transport::NusbTransport;

#[derive(Parser, Debug)]
#[command(
    name = "dfuse",
    author,
    version,
    about = "Flash DfuSe firmware images onto STM32 DFU bootloaders",
    long_about = "Parses a DfuSe (.dfu) container, erases the affected flash pages, \
writes and verifies every image element, then tells the device to leave DFU mode."
)]
struct Args {
    /// Path to the DfuSe firmware file
    #[arg(required_unless_present = "list")]
    file: Option<String>,

    /// Device to open as VID:PID (hex), e.g. 0483:df11
    #[arg(short, long)]
    device: Option<String>,

    /// List matching DFU devices and exit
    #[arg(short, long)]
    list: bool,

    /// Erase the whole part instead of only the affected pages
    #[arg(long)]
    mass_erase: bool,

    /// Skip the read-back verification pass
    #[arg(long)]
    no_verify: bool,

    /// Leave the device in DFU mode when done
    #[arg(long)]
    stay_in_dfu: bool,

    /// Accept firmware files with an unexpected DFU format field
    #[arg(long)]
    lenient: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Progress sink drawing an indicatif bar on stderr.
struct BarProgress {
    bar: Mutex<ProgressBar>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(ProgressBar::hidden()),
        }
    }
}

impl ProgressSink for BarProgress {
    fn reset(&self) {
        let mut bar = self.bar.lock().unwrap();
        bar.finish_and_clear();
        *bar = ProgressBar::no_length();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:12} [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
    }

    fn set_status(&self, text: &str) {
        self.bar.lock().unwrap().set_message(text.to_string());
    }

    fn set_max(&self, n: u64) {
        self.bar.lock().unwrap().set_length(n);
    }

    fn set_increment(&self, _n: u64) {}

    fn increment(&self) {
        self.bar.lock().unwrap().inc(1);
    }
}

fn parse_device_id(spec: &str) -> Result<(u16, u16)> {
    let (vid, pid) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("Device id must look like VID:PID, got {spec:?}"))?;
    Ok((
        u16::from_str_radix(vid, 16).context("Bad VID")?,
        u16::from_str_radix(pid, 16).context("Bad PID")?,
    ))
}

fn run(args: Args) -> Result<()> {
    let (vid, pid) = match &args.device {
        Some(spec) => parse_device_id(spec)?,
        None => (ST_VENDOR_ID, ST_DFU_PRODUCT_ID),
    };

    if args.list {
        let devices = NusbTransport::list(vid, pid)?;
        if devices.is_empty() {
            bail!("No DFU devices found for {vid:04x}:{pid:04x}");
        }
        for dev in devices {
            println!(
                "{:03}.{:03} {:04x}:{:04x} {}",
                dev.bus,
                dev.address,
                dev.vendor_id,
                dev.product_id,
                dev.product.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let path = args.file.as_deref().expect("clap enforces the file argument");
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {path}"))?;
    let file = if args.lenient {
        DfuFile::from_bytes_lenient(&bytes)
    } else {
        DfuFile::from_bytes(&bytes)
    }
    .with_context(|| format!("{path} is not a valid DfuSe file"))?;

    info!(
        images = file.images.len(),
        payload = file.payload_size(),
        "Loaded firmware file"
    );

    let transport = NusbTransport::open_with_ids(vid, pid)?;
    let options = ProgramOptions {
        mass_erase: args.mass_erase,
        verify: !args.no_verify,
        leave_dfu: !args.stay_in_dfu,
    };

    let mut programmer = Programmer::new(transport, options);
    programmer.add_progress(Box::new(BarProgress::new()));
    programmer.resynchronize()?;
    programmer.program(&file)?;

    eprintln!("✓ Programming complete");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        eprintln!("✗ FAILED: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("0483:df11").unwrap(), (0x0483, 0xDF11));
        assert!(parse_device_id("0483").is_err());
        assert!(parse_device_id("zz:df11").is_err());
    }
}
