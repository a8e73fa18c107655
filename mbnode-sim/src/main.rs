//! mbnode on the host
//!
//! Runs the node's bring-up sequence against simulated WiFi and Ethernet
//! drivers, then serves the register bank over real Modbus TCP.

use anyhow::Context;
use log::*;
use mbnode_core::app::{bring_up_with_mode, run_register_loop};
use mbnode_core::ethernet::ChipRevision;
use mbnode_core::sim::{SimulatedEthernet, SimulatedRadio};
use mbnode_core::wifi::{ApRecord, AuthMode, SCAN_LIST_SIZE};
use mbnode_core::{RegisterBank, Settings, Wifi, WifiMode};
use std::sync::Arc;
use std::time::Duration;

#[derive(clap::Parser)]
#[command(name = "mbnode-sim")]
#[command(about = "Run an mbnode Modbus TCP slave on this machine")]
struct Cli {
    /// Modbus TCP port (502 usually needs privileges)
    #[arg(long, default_value_t = 5020)]
    port: u16,

    /// WiFi mode to bring up
    #[arg(long, value_enum, default_value_t = Mode::Sta)]
    mode: Mode,

    /// Make the configured access point refuse association
    #[arg(long)]
    unreachable: bool,

    /// Register increment period in milliseconds
    #[arg(long, default_value_t = 1000)]
    period_ms: u64,

    /// Scan for access points, print them and exit
    #[arg(long)]
    scan: bool,

    /// Print scan results as JSON
    #[arg(long, requires = "scan")]
    json: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Sta,
    Ap,
    StaAp,
}

impl From<Mode> for WifiMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sta => WifiMode::Station,
            Mode::Ap => WifiMode::AccessPoint,
            Mode::StaAp => WifiMode::StationAccessPoint,
        }
    }
}

fn simulated_air(settings: &Settings, reachable: bool) -> SimulatedRadio {
    let mut radio = SimulatedRadio::new();
    radio.add_access_point(&settings.wifi.ssid, -47, 6, AuthMode::Wpa2Psk);
    radio.add_access_point("warehouse-guest", -71, 1, AuthMode::Open);
    radio.add_access_point("line-3-plc", -63, 11, AuthMode::WpaWpa2Psk);
    radio.add_access_point("legacy-scanner", -85, 3, AuthMode::Wep);
    radio.set_reachable(reachable);
    radio
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli: Cli = clap::Parser::parse();

    let mut settings = Settings::default();
    settings.modbus.port = cli.port;

    let mut wifi = Wifi::new(simulated_air(&settings, !cli.unreachable), settings.wifi.clone());

    if cli.scan {
        if cli.json {
            let mut records = vec![ApRecord::default(); SCAN_LIST_SIZE];
            let summary = wifi.scan(Some(&mut records))?;
            records.truncate(summary.returned);
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            wifi.scan(None)?;
        }
        wifi.stop();
        return Ok(());
    }

    let mut eth = SimulatedEthernet::new(ChipRevision::B7);
    let bank = Arc::new(RegisterBank::new());

    let _slave = bring_up_with_mode(&mut wifi, cli.mode.into(), &mut eth, &bank, &settings)
        .with_context(|| format!("bring-up failed (Modbus port {})", cli.port))?;

    info!("Registers tick every {} ms, Ctrl-C to quit", cli.period_ms);
    run_register_loop(&bank, Duration::from_millis(cli.period_ms))
}
