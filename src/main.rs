use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wam_runtime::bus::{Bus, Property, UpdatePolicy};
use wam_runtime::config::{DEFAULT_CONFIG_PATH, WambotConfig};
use wam_runtime::runtime;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "wam-runtime", about = "Barrett WAM CAN runtime")]
struct Cli {
    /// JSON arm configuration
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use a simulated arm instead of the config file (wam4 or wam7)
    #[arg(long, value_name = "PRESET")]
    sim: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the safety puck, motor pucks and broadcast groups
    Scan,
    /// Read one property from a puck
    Get {
        id: u8,
        property: Property,
    },
    /// Write one property to a puck
    Set {
        id: u8,
        property: Property,
        #[arg(allow_negative_numbers = true)]
        value: i64,
        /// Read the value back and fail on mismatch
        #[arg(long)]
        verify: bool,
    },
    /// Zero the arm and servo it with zero torque until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> CliResult<()> {
    let config = match cli.sim.as_deref() {
        Some("wam4") => WambotConfig::wam4_sim(),
        Some("wam7") => WambotConfig::wam7_sim(),
        Some(other) => return Err(format!("unknown simulator preset '{}'", other).into()),
        None => WambotConfig::load(&cli.config)?,
    };

    match cli.command {
        Command::Scan => scan(&config),
        Command::Get { id, property } => {
            let bus = Bus::create(&config.bus, UpdatePolicy::PositionOnly)?;
            let value = bus.get_property(id, property)?;
            println!("{}[{}] = {}", property, id, value);
            Ok(())
        }
        Command::Set {
            id,
            property,
            value,
            verify,
        } => {
            let bus = Bus::create(&config.bus, UpdatePolicy::PositionOnly)?;
            bus.set_property(id, property, value, verify)?;
            println!("{}[{}] <- {}", property, id, value);
            Ok(())
        }
        Command::Run => Ok(runtime::run(&config).await?),
    }
}

fn scan(config: &WambotConfig) -> CliResult<()> {
    let bus = Bus::create(&config.bus, UpdatePolicy::PositionOnly)?;

    println!("Port {} ({})", bus.port(), bus.device().name());
    println!("Firmware table: {}", bus.properties().firmware());
    match bus.safety_puck() {
        Some(safety) => println!("Safety puck: {}", safety.id),
        None => println!("Safety puck: none"),
    }
    for (id, puck) in bus.pucks().iter() {
        println!(
            "Puck {:2}: vers {} role 0x{:X} cts {} ipnm {:.0} group {} slot {}",
            id,
            puck.vers(),
            puck.role(),
            puck.counts_per_rev(),
            puck.i_per_nm(),
            puck.group(),
            puck.order()
        );
    }
    for (gid, group) in bus.groups().iter() {
        println!("Group {}: {:?}", gid, group.slots());
    }
    Ok(())
}
