//! Probe, reboot and raw register commands.

use {
    super::connect,
    crate::{Cli, CliError, config::Config},
    anyhow::Result,
    console::style,
    vnadfu::Register,
};

/// Probe command: handshake only.
pub(crate) fn cmd_probe(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut device = connect(cli, config)?;
    let name = device.name().to_string();
    device.close();

    if !cli.quiet {
        eprintln!("{} {name} is ready for flashing", style("✓").green().bold());
    }
    Ok(())
}

/// Reboot command implementation.
pub(crate) fn cmd_reboot(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut device = connect(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Rebooting device", style("🔄").cyan());
    }
    device.reboot()?;
    device.close();
    Ok(())
}

/// Read one register and print it to stdout.
pub(crate) fn cmd_read_reg(cli: &Cli, config: &mut Config, addr: u8) -> Result<()> {
    let mut device = connect(cli, config)?;
    let value = device.read_register(addr)?;
    device.close();

    println!("0x{value:02X}");
    Ok(())
}

/// Check a write-reg value fits the chosen register width.
pub(crate) fn validate_write(addr: u8, value: u32, wide: bool) -> Result<()> {
    if !wide && value > 0xFF {
        return Err(CliError::Usage(format!(
            "Value 0x{value:X} does not fit in an 8-bit register (use --wide for 32-bit writes)"
        ))
        .into());
    }
    if addr == Register::Reboot.addr() {
        log::warn!("Writing the reboot register may restart the device");
    }
    Ok(())
}

/// Write one register, 8 or 32 bits wide.
pub(crate) fn cmd_write_reg(
    cli: &Cli,
    config: &mut Config,
    addr: u8,
    value: u32,
    wide: bool,
) -> Result<()> {
    validate_write(addr, value, wide)?;

    let mut device = connect(cli, config)?;
    if wide {
        device.write_register32(addr, value)?;
    } else {
        // Checked above
        #[allow(clippy::cast_possible_truncation)]
        device.write_register(addr, value as u8)?;
    }
    device.close();

    if !cli.quiet {
        eprintln!(
            "{} Wrote 0x{value:0width$X} to register 0x{addr:02X}",
            style("✓").green(),
            width = if wide { 8 } else { 2 }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_write_byte_range() {
        assert!(validate_write(0x10, 0xFF, false).is_ok());
        let err = validate_write(0x10, 0x100, false).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_validate_write_wide_accepts_full_range() {
        assert!(validate_write(0xE8, u32::MAX, true).is_ok());
        assert!(validate_write(0xE0, 0x0800_4000, true).is_ok());
    }

    #[test]
    fn test_validate_write_reboot_register_is_allowed() {
        assert!(validate_write(Register::Reboot.addr(), 0x5E, false).is_ok());
    }
}
