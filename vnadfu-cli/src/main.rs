//! vnadfu CLI - Command-line tool for updating VNA firmware.
//!
//! ## Features
//!
//! - Flash raw firmware images through the serial DFU bootloader
//! - Read and write bootloader registers
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::{debug, warn},
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
    vnadfu::DfuOptions,
};

mod commands;
mod config;
mod serial;

use {
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Bad invocation; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

/// vnadfu - Update vector network analyzer firmware over the DFU bootloader.
///
/// Put the device in DFU mode (usually by holding the jog button while
/// powering on) before running a command that talks to it.
///
/// Environment variables:
///   VNADFU_PORT              - Default serial port
///   VNADFU_BAUD              - Baud rate (default: 115200)
///   VNADFU_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "vnadfu")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "VNADFU_PORT")]
    port: Option<String>,

    /// Baud rate for the serial link.
    #[arg(short, long, global = true, env = "VNADFU_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "VNADFU_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a raw firmware image to flash.
    Flash {
        /// Firmware image (.bin).
        image: PathBuf,

        /// Flash destination address (hex, default 0x08004000).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Argument passed to the application after reboot (hex).
        #[arg(long, value_parser = parse_hex_u32)]
        user_arg: Option<u32>,

        /// Stay in DFU mode after flashing.
        #[arg(long)]
        no_reboot: bool,
    },

    /// Check that the device is in DFU mode.
    Probe,

    /// Leave DFU mode and start the application.
    Reboot,

    /// Read a bootloader register.
    ReadReg {
        /// Register address (hex).
        #[arg(value_parser = parse_hex_u8)]
        addr: u8,
    },

    /// Write a bootloader register.
    WriteReg {
        /// Register address (hex).
        #[arg(value_parser = parse_hex_u8)]
        addr: u8,

        /// Value to write (hex).
        #[arg(value_parser = parse_hex_u32)]
        value: u32,

        /// Write a 32-bit value instead of a single byte.
        #[arg(long)]
        wide: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x0800_4000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

/// Parse a hexadecimal register address.
fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let value = parse_hex_u32(s)?;
    u8::try_from(value)
        .map_err(|_| format!("Register address 0x{value:X} is out of range (max 0xFF)"))
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "vnadfu v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            address,
            user_arg,
            no_reboot,
        } => commands::flash::cmd_flash(cli, &mut config, image, *address, *user_arg, *no_reboot),
        Commands::Probe => commands::register::cmd_probe(cli, &mut config),
        Commands::Reboot => commands::register::cmd_reboot(cli, &mut config),
        Commands::ReadReg { addr } => commands::register::cmd_read_reg(cli, &mut config, *addr),
        Commands::WriteReg { addr, value, wide } => {
            commands::register::cmd_write_reg(cli, &mut config, *addr, *value, *wide)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g.: vnadfu completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// First Ctrl-C asks the running command to stop, a second one exits.
fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!(
            "\n{} Interrupted, stopping after the current step (press Ctrl-C again to force)",
            style("⚠").yellow()
        );
    });
    if let Err(e) = result {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Connection settings from the command line and config file.
fn dfu_options(cli: &Cli, config: &Config) -> DfuOptions {
    let mut options = DfuOptions::default();
    if let Some(baud) = cli.baud.or(config.connection.baud) {
        options = options.with_baud_rate(baud);
    }
    if let Some(ms) = config.flash.settle_delay_ms {
        options = options.with_settle_delay(Duration::from_millis(ms));
    }
    if let Some(ms) = config.flash.handshake_timeout_ms {
        options = options.with_handshake_timeout(Duration::from_millis(ms));
    }
    options
}
