//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod ports;
pub(crate) mod register;

use {
    crate::{Cli, CliError, config::Config, dfu_options, get_port, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    vnadfu::{DfuDevice, NativePort},
};

/// Fail with a cancellation error if Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Select a port, open it and run the DFU handshake.
pub(crate) fn connect(cli: &Cli, config: &mut Config) -> Result<DfuDevice<NativePort>> {
    let port = get_port(cli, config)?;
    let options = dfu_options(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} @ {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            options.baud_rate
        );
    }
    ensure_not_interrupted()?;

    let device = DfuDevice::open_native(&port, options)
        .with_context(|| format!("Could not connect to a DFU bootloader on {port}"))?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Device is in DFU mode", style("✓").green());
    }
    Ok(device)
}
