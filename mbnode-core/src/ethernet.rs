//! SPI Ethernet (ENC28J60) bring-up
//!
//! The MAC/PHY driver, the SPI master and the TCP/IP glue all belong to the
//! platform. This module only fixes the call order and the values handed to
//! them, and turns link events into log lines.

use crate::config::EthernetSettings;
use crate::error::{DriverError, Error, Result};
use crate::wifi::IpInfo;
use crate::{mac_to_string, MacAddr};
use log::*;
use std::sync::Arc;

/// Minimum CS hold time after a transfer, in nanoseconds
const CS_HOLD_TIME_MIN_NS: u32 = 210;
/// Revisions below B5 need at least this SPI clock (errata #1)
const ERRATA_MIN_CLOCK_MHZ: u32 = 8;

/// ENC28J60 silicon revision as read from the EREVID register
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChipRevision(pub u8);

impl ChipRevision {
    pub const B1: ChipRevision = ChipRevision(0b0000_0010);
    pub const B4: ChipRevision = ChipRevision(0b0000_0100);
    pub const B5: ChipRevision = ChipRevision(0b0000_0101);
    pub const B7: ChipRevision = ChipRevision(0b0000_0110);
}

/// Reject clock/revision combinations hit by ENC28J60 errata #1
pub fn check_errata(revision: ChipRevision, clock_mhz: u32) -> Result<()> {
    if revision < ChipRevision::B5 && clock_mhz < ERRATA_MIN_CLOCK_MHZ {
        error!(
            target: "mbnode::eth",
            "SPI frequency must be at least {} MHz for chip revision less than 5",
            ERRATA_MIN_CLOCK_MHZ
        );
        return Err(Error::Errata {
            revision: revision.0,
            clock_mhz,
        });
    }
    Ok(())
}

/// SPI clock cycles the CS line must stay asserted after a transfer.
/// Returns 0 for clocks outside 1..=20 MHz.
pub fn cs_hold_cycles(clock_mhz: u32) -> u8 {
    if clock_mhz == 0 || clock_mhz > 20 {
        return 0;
    }
    (clock_mhz * CS_HOLD_TIME_MIN_NS).div_ceil(1000) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiBusConfig {
    pub host: u32,
    pub miso: i32,
    pub mosi: i32,
    pub sclk: i32,
    /// -1 when unused
    pub quadwp: i32,
    pub quadhd: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiDeviceConfig {
    pub host: u32,
    pub mode: u8,
    pub clock_hz: u32,
    pub cs: i32,
    pub int: i32,
    pub queue_size: u32,
    pub cs_ena_posttrans: u8,
}

impl SpiBusConfig {
    pub fn from_settings(settings: &EthernetSettings) -> Self {
        Self {
            host: settings.spi_host,
            miso: settings.miso,
            mosi: settings.mosi,
            sclk: settings.sclk,
            quadwp: -1,
            quadhd: -1,
        }
    }
}

impl SpiDeviceConfig {
    pub fn from_settings(settings: &EthernetSettings) -> Self {
        Self {
            host: settings.spi_host,
            mode: 0,
            clock_hz: settings.clock_mhz * 1_000_000,
            cs: settings.cs,
            int: settings.int,
            queue_size: 20,
            cs_ena_posttrans: cs_hold_cycles(settings.clock_mhz),
        }
    }
}

/// Link and IP notifications from the Ethernet driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthernetEvent {
    LinkUp { mac: MacAddr },
    LinkDown,
    Started,
    Stopped,
    GotIp(IpInfo),
}

pub type EthernetEventHandler = Arc<dyn Fn(&EthernetEvent) + Send + Sync>;

pub fn log_ethernet_event(event: &EthernetEvent) {
    match event {
        EthernetEvent::LinkUp { mac } => {
            info!(target: "mbnode::eth", "Ethernet Link Up");
            info!(target: "mbnode::eth", "Ethernet HW Addr {}", mac_to_string(mac));
        }
        EthernetEvent::LinkDown => info!(target: "mbnode::eth", "Ethernet Link Down"),
        EthernetEvent::Started => info!(target: "mbnode::eth", "Ethernet Started"),
        EthernetEvent::Stopped => info!(target: "mbnode::eth", "Ethernet Stopped"),
        EthernetEvent::GotIp(ip_info) => {
            info!(target: "mbnode::eth", "Ethernet Got IP Address");
            info!(target: "mbnode::eth", "~~~~~~~~~~~");
            info!(target: "mbnode::eth", "ETHIP:{}", ip_info.ip);
            info!(target: "mbnode::eth", "ETHMASK:{}", ip_info.netmask);
            info!(target: "mbnode::eth", "ETHGW:{}", ip_info.gateway);
            info!(target: "mbnode::eth", "~~~~~~~~~~~");
        }
    }
}

/// Platform SPI/Ethernet stack
///
/// The TCP/IP stack and the default event loop are already up (WiFi
/// bring-up creates them) when these are called.
pub trait EthernetDriver {
    fn install_isr_service(&mut self) -> Result<(), DriverError>;

    /// Create the Ethernet flavoured network interface
    fn create_netif(&mut self) -> Result<(), DriverError>;

    fn init_spi_bus(&mut self, bus: &SpiBusConfig) -> Result<(), DriverError>;

    /// Create the SPI-attached MAC and PHY and install the Ethernet driver
    fn install_mac_phy(&mut self, device: &SpiDeviceConfig) -> Result<(), DriverError>;

    fn set_mac_addr(&mut self, mac: MacAddr) -> Result<(), DriverError>;

    fn chip_revision(&mut self) -> Result<ChipRevision, DriverError>;

    fn attach_netif(&mut self) -> Result<(), DriverError>;

    /// Route link events and IP-acquired events to `handler`
    fn subscribe(&mut self, handler: EthernetEventHandler) -> Result<(), DriverError>;

    fn set_full_duplex(&mut self) -> Result<(), DriverError>;

    fn start(&mut self) -> Result<(), DriverError>;

    /// True once `start` succeeded
    fn is_started(&self) -> bool;
}

/// One-shot Ethernet bring-up. There is no stop or reconfigure path.
pub fn ethernet_init<D: EthernetDriver>(driver: &mut D, settings: &EthernetSettings) -> Result<()> {
    if driver.is_started() {
        return Err(Error::AlreadyStarted("ethernet"));
    }

    driver.install_isr_service()?;
    driver.create_netif()?;
    driver.init_spi_bus(&SpiBusConfig::from_settings(settings))?;
    driver.install_mac_phy(&SpiDeviceConfig::from_settings(settings))?;

    // The ENC28J60 has no factory MAC.
    driver.set_mac_addr(settings.mac)?;

    let revision = driver.chip_revision()?;
    check_errata(revision, settings.clock_mhz)?;

    driver.attach_netif()?;
    driver.subscribe(Arc::new(log_ethernet_event))?;

    if settings.full_duplex {
        driver.set_full_duplex()?;
    }

    driver.start()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cs_hold_cycles_rounds_up() {
        assert_eq!(cs_hold_cycles(16), 4);
        assert_eq!(cs_hold_cycles(8), 2);
        assert_eq!(cs_hold_cycles(20), 5);
        assert_eq!(cs_hold_cycles(1), 1);
    }

    #[test]
    fn cs_hold_cycles_out_of_range() {
        assert_eq!(cs_hold_cycles(0), 0);
        assert_eq!(cs_hold_cycles(21), 0);
    }

    #[test]
    fn errata_only_hits_old_revisions_at_low_clock() {
        assert!(check_errata(ChipRevision::B4, 16).is_ok());
        assert!(check_errata(ChipRevision::B5, 4).is_ok());
        assert!(check_errata(ChipRevision::B7, 1).is_ok());
        assert!(matches!(
            check_errata(ChipRevision::B4, 6),
            Err(Error::Errata { revision: 4, clock_mhz: 6 })
        ));
    }

    #[test]
    fn device_config_from_defaults() {
        let dev = SpiDeviceConfig::from_settings(&EthernetSettings::default());
        assert_eq!(dev.clock_hz, 16_000_000);
        assert_eq!(dev.mode, 0);
        assert_eq!(dev.queue_size, 20);
        assert_eq!(dev.cs, 10);
        assert_eq!(dev.int, 14);
        assert_eq!(dev.cs_ena_posttrans, 4);
    }
}
