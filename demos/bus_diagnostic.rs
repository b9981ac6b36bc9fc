// Bus diagnostic: READ-ONLY survey of the pucks on one CAN bus
//
// This tool only sends GET requests. It does not wake pucks, change modes or
// zero the arm. Use it first before running torque_test.
//
// Usage: cargo run --example bus_diagnostic -- [config.json | sim]

use std::time::Duration;

use wam_runtime::bus::{Property, PropertyTable, PuckStatus};
use wam_runtime::can::CanDevice;
use wam_runtime::config::{DEFAULT_CONFIG_PATH, SAFETY_PUCK_ID, WambotConfig};

const PROBE_WAIT: Duration = Duration::from_millis(1);
const IDENTITY: [Property; 6] = [
    Property::Role,
    Property::Cts,
    Property::Ipnm,
    Property::Grpb,
    Property::Pidx,
    Property::Ap,
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let source = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match source.as_str() {
        "sim" => WambotConfig::wam4_sim(),
        path => WambotConfig::load(path)?,
    };
    let port = config.bus.port.unwrap_or(0) as u32;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             WAM Bus Diagnostic (READ-ONLY)                   ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only READS from pucks - no writes, no movement    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Adapter: {:?}, port {}", config.bus.adapter, port);
    println!();

    println!("Step 1: Opening CAN adapter...");
    let device = match CanDevice::open(config.bus.adapter, port, config.bus.device.as_deref()) {
        Ok(device) => {
            println!("  ✓ Opened {}", device.name());
            device
        }
        Err(e) => {
            println!("  ✗ Failed to open adapter: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - SocketCAN: 'ip link set can{} up type can bitrate 1000000'", port);
            println!("  - SLCAN: check the serial device path and permissions");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Probing node IDs...");
    let mut live = Vec::new();
    for result in device.scan(PROBE_WAIT) {
        let (node, status) = result?;
        let label = match PuckStatus::from_raw(status) {
            Some(PuckStatus::Ready) => "READY",
            Some(PuckStatus::Reset) => "RESET (asleep)",
            Some(PuckStatus::Err) => "ERROR",
            _ => "unknown",
        };
        let role = if node == SAFETY_PUCK_ID { " [safety]" } else { "" };
        println!("  Node {:2}: status {} ({}){}", node, status, label, role);
        live.push((node, status));
    }
    if live.is_empty() {
        println!("  ✗ Nothing answered");
        println!("  - Check arm power and the CAN cable");
        return Ok(());
    }
    println!();

    println!("Step 3: Reading identity of ready pucks...");
    println!();
    for &(node, status) in &live {
        if PuckStatus::from_raw(status) != Some(PuckStatus::Ready) {
            continue;
        }
        println!("  === Puck {} ===", node);
        let vers = match device.get_property(node, 0) {
            Ok(vers) => vers,
            Err(e) => {
                println!("    VERS: ERROR - {}", e);
                continue;
            }
        };
        let table = PropertyTable::for_firmware(vers);
        println!(
            "    VERS: {} ({} property table)",
            vers,
            if table.is_legacy() { "legacy" } else { "modern" }
        );
        if node == SAFETY_PUCK_ID {
            if let Some(index) = table.get(Property::Zero) {
                match device.get_property(node, index) {
                    Ok(zero) => println!("    ZERO: {} ({})", zero, if zero != 0 { "zeroed" } else { "not zeroed" }),
                    Err(e) => println!("    ZERO: ERROR - {}", e),
                }
            }
            println!();
            continue;
        }
        for property in IDENTITY {
            let Some(index) = table.get(property) else {
                continue;
            };
            match device.get_property(node, index) {
                Ok(value) => println!("    {:5} {}", format!("{}:", property), value),
                Err(e) => println!("    {:5} ERROR - {}", format!("{}:", property), e),
            }
        }
        println!();
    }

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Pucks in RESET are woken by discovery; that is expected.");
    println!("Next step: Run 'cargo run --example torque_test' with the arm clear of obstacles");

    Ok(())
}
