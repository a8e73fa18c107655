//! mbnode Core Library
//!
//! Platform-independent half of the mbnode firmware: a Modbus TCP slave that
//! publishes two register blocks over an SPI Ethernet link while WiFi runs
//! alongside it.
//!
//! This crate provides:
//! - WiFi orchestration (station, soft-AP, dual) over the [`WifiDriver`] trait
//! - ENC28J60 Ethernet bring-up over the [`EthernetDriver`] trait
//! - The shared [`RegisterBank`] and the Modbus TCP responder serving it
//! - Build-time settings and the top-level bring-up sequence
//!
//! # MCU implementations
//! - ESP32: see `mbnode-esp32`
//! - Host: [`sim`] provides simulated drivers, used by `mbnode-sim` and tests

pub mod app;
pub mod config;
pub mod error;
pub mod ethernet;
pub mod modbus;
pub mod registers;
pub mod sim;
pub mod wifi;

pub use app::{bring_up, increment_registers, run_register_loop};
pub use config::{EthernetSettings, ModbusSettings, Settings, WifiSettings};
pub use error::{DriverError, Error, Result};
pub use ethernet::{ethernet_init, EthernetDriver, EthernetEvent};
pub use modbus::{modbus_slave_init, ModbusSlave, SlaveHandle};
pub use registers::{RegisterBank, RegisterKind};
pub use wifi::{Wifi, WifiDriver, WifiEvent, WifiMode, WifiStatus};

/// Six-byte hardware address.
pub type MacAddr = [u8; 6];

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn mac_to_string(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
