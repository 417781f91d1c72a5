use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lwnsim::simulator::{Simulator, Storage};
use lwnsim::{init_logger, log_info};

#[derive(Parser)]
#[command(name = "lwnsim")]
#[command(about = "LoRaWAN network simulator")]
struct Cli {
    /// Directory holding simulator.json, devices.json, gateways.json
    #[arg(short, long, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the simulation and run until interrupted
    Run,
    /// Load and validate the persisted state, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.config_dir);

    match cli.command {
        Commands::Run => {
            let simulator = Simulator::from_storage(&storage).await?;
            simulator.run().await?;
            log_info("simulator running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            simulator.stop().await;
            log_info("simulator stopped");
        }
        Commands::Check => {
            let config = storage.load_simulator()?;
            let devices = storage.load_devices()?;
            let gateways = storage.load_gateways()?;
            log_info(&format!(
                "configuration OK: bridge {}, {} device(s), {} gateway(s)",
                config.bridge_address,
                devices.len(),
                gateways.len()
            ));
        }
    }

    Ok(())
}
