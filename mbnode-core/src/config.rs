//! Build-time settings
//!
//! There is no runtime configuration on the device. Credentials come from the
//! build environment (`MBNODE_WIFI_SSID`, `MBNODE_WIFI_PASSWORD`,
//! `MBNODE_AP_SSID`, `MBNODE_AP_PASSWORD`), everything else is a constant.

use crate::MacAddr;
use std::time::Duration;

pub const WIFI_SSID: &str = match option_env!("MBNODE_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "XXXXXXXXXXXX",
};
pub const WIFI_PASSWORD: &str = match option_env!("MBNODE_WIFI_PASSWORD") {
    Some(pass) => pass,
    None => "XXXXXXXXXXXX",
};
pub const AP_SSID: &str = match option_env!("MBNODE_AP_SSID") {
    Some(ssid) => ssid,
    None => "mbnode",
};
pub const AP_PASSWORD: &str = match option_env!("MBNODE_AP_PASSWORD") {
    Some(pass) => pass,
    None => "",
};

// Comment out to keep the factory addresses.
pub const STA_CUSTOM_MAC: Option<MacAddr> = Some([0x32, 0xAE, 0xA4, 0x07, 0x0D, 0x66]);
pub const AP_CUSTOM_MAC: Option<MacAddr> = Some([0x32, 0xAE, 0xA4, 0x07, 0x0D, 0x67]);

pub const AP_MAX_CONNECTIONS: u8 = 4;

// ENC28J60 wiring
pub const ENC28J60_SPI_HOST: u32 = 2;
pub const ENC28J60_MISO_GPIO: i32 = 13;
pub const ENC28J60_MOSI_GPIO: i32 = 11;
pub const ENC28J60_SCLK_GPIO: i32 = 12;
pub const ENC28J60_CS_GPIO: i32 = 10;
pub const ENC28J60_INT_GPIO: i32 = 14;
pub const ENC28J60_SPI_CLOCK_MHZ: u32 = 16;
/// 02:00:00 is a locally administered range, only for LANs you control.
pub const ENC28J60_MAC: MacAddr = [0x02, 0x00, 0x00, 0x12, 0x34, 0x56];

pub const MODBUS_TCP_PORT: u16 = 502;
pub const HOLDING_REG_COUNT: usize = 50;
pub const INPUT_REG_COUNT: usize = 50;
pub const HOLDING_START: u16 = 0;
pub const INPUT_START: u16 = 0;
/// A client that sends nothing for this long is disconnected
pub const MODBUS_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Where the WiFi driver keeps its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStorage {
    /// Volatile, lost on reset
    Ram,
    /// Non-volatile storage partition
    Flash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    pub ap_ssid: String,
    pub ap_password: String,
    pub sta_mac: Option<MacAddr>,
    pub ap_mac: Option<MacAddr>,
    pub storage: CredentialStorage,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            ssid: WIFI_SSID.to_string(),
            password: WIFI_PASSWORD.to_string(),
            ap_ssid: AP_SSID.to_string(),
            ap_password: AP_PASSWORD.to_string(),
            sta_mac: STA_CUSTOM_MAC,
            ap_mac: AP_CUSTOM_MAC,
            storage: CredentialStorage::Ram,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetSettings {
    pub spi_host: u32,
    pub miso: i32,
    pub mosi: i32,
    pub sclk: i32,
    pub cs: i32,
    pub int: i32,
    pub clock_mhz: u32,
    pub mac: MacAddr,
    pub full_duplex: bool,
}

impl Default for EthernetSettings {
    fn default() -> Self {
        Self {
            spi_host: ENC28J60_SPI_HOST,
            miso: ENC28J60_MISO_GPIO,
            mosi: ENC28J60_MOSI_GPIO,
            sclk: ENC28J60_SCLK_GPIO,
            cs: ENC28J60_CS_GPIO,
            int: ENC28J60_INT_GPIO,
            clock_mhz: ENC28J60_SPI_CLOCK_MHZ,
            mac: ENC28J60_MAC,
            // Half duplex has several ENC28J60 errata
            full_duplex: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusSettings {
    pub port: u16,
    pub holding_start: u16,
    pub input_start: u16,
    pub holding_count: usize,
    pub input_count: usize,
    pub idle_timeout: Duration,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            port: MODBUS_TCP_PORT,
            holding_start: HOLDING_START,
            input_start: INPUT_START,
            holding_count: HOLDING_REG_COUNT,
            input_count: INPUT_REG_COUNT,
            idle_timeout: MODBUS_IDLE_TIMEOUT,
        }
    }
}

/// Everything the bring-up sequence needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub wifi: WifiSettings,
    pub ethernet: EthernetSettings,
    pub modbus: ModbusSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_defaults() {
        let modbus = ModbusSettings::default();
        assert_eq!(modbus.port, 502);
        assert_eq!(modbus.holding_count, 50);
        assert_eq!(modbus.input_count, 50);
        assert_eq!((modbus.holding_start, modbus.input_start), (0, 0));
    }

    #[test]
    fn ethernet_mac_is_locally_administered() {
        let eth = EthernetSettings::default();
        assert_eq!(eth.mac[0] & 0x02, 0x02);
        assert_eq!(eth.mac[0] & 0x01, 0x00);
    }
}
