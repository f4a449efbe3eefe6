//! Serial port listing.

use {
    console::style,
    vnadfu::{DetectedPort, auto_detect_port, discover_ports},
};

fn port_json(p: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": p.name,
        "device": p.device.name(),
        "known": p.device.is_known(),
        "vid": p.vid,
        "pid": p.pid,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

/// List-ports command implementation.
///
/// JSON goes to stdout; the human-readable list goes to stderr.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
}
