//! Top-level sequencing: network bring-up, then the register loop

use crate::config::Settings;
use crate::error::Result;
use crate::ethernet::{ethernet_init, EthernetDriver};
use crate::modbus::{modbus_slave_init, Netif, SlaveHandle};
use crate::registers::RegisterBank;
use crate::wifi::{Wifi, WifiDriver, WifiMode};
use log::*;
use std::sync::Arc;
use std::time::Duration;

pub const HOLDING_STEP: u16 = 1;
pub const INPUT_STEP: u16 = 5;
pub const LOOP_PERIOD: Duration = Duration::from_millis(1000);

/// Bring the node up: WiFi station, then Ethernet, then the Modbus slave on
/// the Ethernet interface. The first failure aborts the sequence.
pub fn bring_up<W, E>(
    wifi: &mut Wifi<W>,
    eth: &mut E,
    bank: &Arc<RegisterBank>,
    settings: &Settings,
) -> Result<SlaveHandle>
where
    W: WifiDriver,
    E: EthernetDriver,
{
    bring_up_with_mode(wifi, WifiMode::Station, eth, bank, settings)
}

/// [`bring_up`] with a different WiFi mode
pub fn bring_up_with_mode<W, E>(
    wifi: &mut Wifi<W>,
    mode: WifiMode,
    eth: &mut E,
    bank: &Arc<RegisterBank>,
    settings: &Settings,
) -> Result<SlaveHandle>
where
    W: WifiDriver,
    E: EthernetDriver,
{
    wifi.begin(mode)?;
    ethernet_init(eth, &settings.ethernet)?;
    let slave = modbus_slave_init(bank, &settings.modbus, Netif::Ethernet)?;
    info!("Node up, Modbus TCP on port {}", slave.port());
    Ok(slave)
}

/// One loop tick: every holding register +1, every input register +5
pub fn increment_registers(bank: &RegisterBank) {
    bank.increment(HOLDING_STEP, INPUT_STEP);
}

/// Increment the registers every `period`, forever
pub fn run_register_loop(bank: &RegisterBank, period: Duration) -> ! {
    debug!("Register loop running every {:?}", period);
    loop {
        increment_registers(bank);
        std::thread::sleep(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterKind;

    #[test]
    fn one_tick() {
        let bank = RegisterBank::new();
        increment_registers(&bank);
        increment_registers(&bank);
        assert!(bank.snapshot(RegisterKind::Holding).iter().all(|&v| v == 2));
        assert!(bank.snapshot(RegisterKind::Input).iter().all(|&v| v == 10));
    }

    #[test]
    fn loop_keeps_ticking() {
        let bank = Arc::new(RegisterBank::new());
        {
            let bank = bank.clone();
            let _ticker: std::thread::JoinHandle<()> =
                std::thread::spawn(move || run_register_loop(&bank, Duration::from_millis(5)));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bank.get(RegisterKind::Holding, 0) < Some(3) {
            assert!(std::time::Instant::now() < deadline, "loop stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
        let holding = bank.get(RegisterKind::Holding, 0).unwrap_or(0);
        let input = bank.get(RegisterKind::Input, 0).unwrap_or(0);
        assert!(input >= holding * 5);
    }
}
