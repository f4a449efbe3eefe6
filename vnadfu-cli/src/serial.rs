//! Interactive serial port selection.
//!
//! Resolution order:
//! - explicit `--port` / `VNADFU_PORT`
//! - `[connection] port` from the config
//! - a single recognized device is picked without asking
//! - otherwise the user chooses from a list (never in non-interactive mode)

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
    vnadfu::{DetectedPort, DeviceKind, discover_ports},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not just recognized ones.
    pub list_all_ports: bool,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Ask even when a single recognized port was found.
    pub confirm_port: bool,
}

/// Result of port selection.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known or remembered device.
    pub is_known: bool,
}

const NO_PORTS: &str = "No serial ports found. Is the device connected and in DFU mode?";

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Ports left after filtering, by how many there are.
enum Candidates {
    None,
    One(DetectedPort),
    Many(Vec<DetectedPort>),
}

impl Candidates {
    fn from_ports(mut ports: Vec<DetectedPort>) -> Self {
        match ports.len() {
            0 => Self::None,
            1 => ports.pop().map_or(Self::None, Self::One),
            _ => Self::Many(ports),
        }
    }
}

/// Recognized ports, or every port when none is recognized or `list_all` is set.
fn candidate_ports(ports: Vec<DetectedPort>, list_all: bool, config: &Config) -> Vec<DetectedPort> {
    if list_all {
        return ports;
    }
    let (known, unknown): (Vec<_>, Vec<_>) =
        ports.into_iter().partition(|p| is_known_device(p, config));
    if known.is_empty() { unknown } else { known }
}

fn select_non_interactive_port(ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    match Candidates::from_ports(ports) {
        Candidates::One(port) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        Candidates::Many(_) => Err(usage_err(
            "Found multiple serial ports; use --port to pick one in non-interactive mode",
        )),
        Candidates::None => Err(usage_err(NO_PORTS)),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    let named = options.port.as_deref().or_else(|| {
        let from_config = config.connection.port.as_deref();
        if let Some(name) = from_config {
            debug!("Using port from config: {name}");
        }
        from_config
    });
    if let Some(name) = named {
        return Ok(find_port_by_name(name, config));
    }

    let candidates = candidate_ports(discover_ports(), options.list_all_ports, config);
    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match Candidates::from_ports(candidates) {
        Candidates::None => Err(usage_err(NO_PORTS)),
        Candidates::One(port) if is_known_device(&port, config) && !options.confirm_port => {
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            Ok(SelectedPort {
                port,
                is_known: true,
            })
        },
        Candidates::One(port) => {
            ensure_interactive_terminal()?;
            confirm_single_port(port)
        },
        Candidates::Many(ports) => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports, config)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

/// Look up a port by name, falling back to a bare entry for ports the
/// enumerator does not list.
fn find_port_by_name(name: &str, config: &Config) -> SelectedPort {
    let ports = discover_ports();

    if let Some(port) = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
    {
        return SelectedPort {
            port: port.clone(),
            is_known: is_known_device(port, config),
        };
    }

    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: false,
    }
}

/// Check if a port matches a built-in or remembered device.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    matches!((port.vid, port.pid), (Some(vid), Some(pid)) if config.knows_usb_device(vid, pid))
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Recognized devices are shown in bold").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Keep labels on one line in narrow terminals
    let max_item_width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| {
            console::truncate_str(&port_label(p, config), max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port of your VNA")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled)?;
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognized USB device.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.knows_usb_device(vid, pid) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for automatic selection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
