//! Flash command implementation.

use {
    super::{connect, ensure_not_interrupted},
    crate::{
        Cli, CliError, INTERRUPTED, config::Config, parse_hex_u32, use_fancy_output,
        was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::debug,
    std::{
        fs, io,
        path::Path,
        sync::atomic::{AtomicBool, Ordering},
    },
    vnadfu::{Error, Progress, ReaderSource},
};

/// Flash destination used when neither the command line nor the config names one.
pub(crate) const DEFAULT_FLASH_ADDRESS: u32 = 0x0800_4000;

/// Chunk source that stops at the next pull once `cancelled` is set.
///
/// The stop is reported as an [`io::ErrorKind::Interrupted`] error so the
/// upload ends through its normal failure path.
pub(crate) struct CancellableSource<S> {
    inner: S,
    cancelled: &'static AtomicBool,
    stopped: bool,
}

impl<S> CancellableSource<S> {
    pub(crate) fn new(inner: S, cancelled: &'static AtomicBool) -> Self {
        Self {
            inner,
            cancelled,
            stopped: false,
        }
    }
}

impl<S> Iterator for CancellableSource<S>
where
    S: Iterator<Item = io::Result<Vec<u8>>>,
{
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.stopped = true;
            return Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled by user",
            )));
        }
        self.inner.next()
    }
}

/// Pick the flash address: command line, then config, then the default.
pub(crate) fn resolve_address(cli_address: Option<u32>, config: &Config) -> Result<u32> {
    if let Some(address) = cli_address {
        return Ok(address);
    }
    match &config.flash.address {
        Some(text) => parse_hex_u32(text).map_err(|e| {
            CliError::Usage(format!("Invalid flash address '{text}' in config: {e}")).into()
        }),
        None => Ok(DEFAULT_FLASH_ADDRESS),
    }
}

fn load_image(image: &Path) -> Result<Vec<u8>> {
    let data = fs::read(image)
        .with_context(|| format!("Failed to read firmware image {}", image.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("Firmware image {} is empty", image.display())).into());
    }
    Ok(data)
}

fn progress_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(concat!(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ",
                "{bytes}/{total_bytes} {msg}",
            ))
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    image: &Path,
    address: Option<u32>,
    user_arg: Option<u32>,
    no_reboot: bool,
) -> Result<()> {
    let data = load_image(image)?;
    let address = resolve_address(address, config)?;
    let reboot = !no_reboot && config.flash.reboot.unwrap_or(true);
    let total = data.len() as u64;

    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes), target 0x{address:08X}",
            style("📦").cyan(),
            image.display(),
            total
        );
    }

    let mut device = connect(cli, config)?;

    let pb = progress_bar(total, cli.quiet);
    let sink_pb = pb.clone();
    let sink = move |progress: Progress| match progress {
        Progress::Sent(bytes) => sink_pb.set_position(bytes),
        Progress::Finished => sink_pb.tick(),
    };
    let source = CancellableSource::new(ReaderSource::from_bytes(data), &INTERRUPTED);

    pb.set_message("writing");
    device.begin_upload(address, source, sink)?;
    let outcome = device.end_upload();

    let summary = match outcome {
        Ok(summary) => summary,
        Err(Error::Source(e)) if e.kind() == io::ErrorKind::Interrupted && was_interrupted() => {
            pb.abandon_with_message("cancelled");
            return Err(CliError::Cancelled("Flashing cancelled by user".to_string()).into());
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("Firmware upload failed");
        },
    };
    pb.finish_with_message("done");
    debug!("Upload summary: {summary:?}");

    if !cli.quiet {
        let secs = summary.elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let rate = if secs > 0.0 {
            summary.bytes_sent as f64 / 1024.0 / secs
        } else {
            0.0
        };
        eprintln!(
            "{} Wrote {} bytes in {} chunks ({secs:.1}s, {rate:.1} KiB/s)",
            style("✓").green(),
            summary.bytes_sent,
            summary.chunks_sent
        );
    }

    if let Some(arg) = user_arg {
        device.set_user_argument(arg)?;
        if !cli.quiet {
            eprintln!("{} User argument set to 0x{arg:08X}", style("✓").green());
        }
    }

    ensure_not_interrupted()?;

    if reboot {
        if !cli.quiet {
            eprintln!("{} Rebooting into the new firmware", style("🔄").cyan());
        }
        device.reboot()?;
    }
    device.close();

    if !cli.quiet {
        eprintln!("\n{} Firmware update completed", style("🎉").green().bold());
    }

    Ok(())
}
