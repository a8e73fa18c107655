//! WiFi value types, connection status and the event transition table

use crate::{mac_to_string, MacAddr};
use log::*;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Maximum number of access points returned by a scan
pub const SCAN_LIST_SIZE: usize = 10;
/// Text buffer size for `aa:bb:cc:dd:ee:ff` plus NUL
pub const MAC_ADDR_LENGTH: usize = 18;
/// Text buffer size for `255.255.255.255` plus NUL
pub const IP_ADDR_LENGTH: usize = 16;

/// Coarse WiFi connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WifiStatus {
    NotStarted = 0,
    Connected = 1,
    Started = 2,
    GotIp = 3,
    Disconnected = 4,
    ApStarted = 5,
}

impl WifiStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WifiStatus::NotStarted),
            1 => Some(WifiStatus::Connected),
            2 => Some(WifiStatus::Started),
            3 => Some(WifiStatus::GotIp),
            4 => Some(WifiStatus::Disconnected),
            5 => Some(WifiStatus::ApStarted),
            _ => None,
        }
    }
}

/// Single-writer status cell, written from the driver's event context.
///
/// Each WiFi session gets a fresh cell, so an event that arrives after
/// teardown lands in a cell nobody reads anymore.
#[derive(Debug)]
pub struct StatusCell {
    value: AtomicU8,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(WifiStatus::NotStarted as u8),
        }
    }

    pub fn get(&self) -> WifiStatus {
        // Only valid discriminants are ever stored.
        WifiStatus::from_u8(self.value.load(Ordering::Acquire)).unwrap_or(WifiStatus::NotStarted)
    }

    pub fn set(&self, status: WifiStatus) {
        self.value.store(status as u8, Ordering::Release);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WifiMode {
    Station,
    AccessPoint,
    StationAccessPoint,
}

impl WifiMode {
    pub fn has_station(self) -> bool {
        matches!(self, WifiMode::Station | WifiMode::StationAccessPoint)
    }

    pub fn has_access_point(self) -> bool {
        matches!(self, WifiMode::AccessPoint | WifiMode::StationAccessPoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WifiInterface {
    Station,
    AccessPoint,
}

/// IPv4 settings of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for IpInfo {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AuthMode {
    #[default]
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
    Owe,
    Unknown,
}

impl AuthMode {
    pub fn label(self) -> &'static str {
        match self {
            AuthMode::Open => "open",
            AuthMode::Wep => "WEP",
            AuthMode::WpaPsk => "WPA-PSK",
            AuthMode::Wpa2Psk => "WPA2-PSK",
            AuthMode::WpaWpa2Psk => "WPA/WPA2-PSK",
            AuthMode::Wpa2Enterprise => "WPA2-Enterprise",
            AuthMode::Wpa3Psk => "WPA3-PSK",
            AuthMode::Wpa2Wpa3Psk => "WPA2/WPA3-PSK",
            AuthMode::Owe => "OWE",
            AuthMode::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Cipher {
    #[default]
    None,
    Wep40,
    Wep104,
    Tkip,
    Ccmp,
    TkipCcmp,
    Unknown,
}

impl Cipher {
    pub fn label(self) -> &'static str {
        match self {
            Cipher::None => "none",
            Cipher::Wep40 => "WEP40",
            Cipher::Wep104 => "WEP104",
            Cipher::Tkip => "TKIP",
            Cipher::Ccmp => "CCMP",
            Cipher::TkipCcmp => "TKIP/CCMP",
            Cipher::Unknown => "unknown",
        }
    }
}

/// Snapshot of an access point, as reported by the stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApRecord {
    pub ssid: String,
    pub bssid: MacAddr,
    pub rssi: i8,
    pub channel: u8,
    pub auth_mode: AuthMode,
    pub pairwise_cipher: Cipher,
    pub group_cipher: Cipher,
}

/// Scan outcome: how many APs the stack saw vs how many were handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScanSummary {
    pub available: usize,
    pub returned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    /// 0 follows the station's channel
    pub channel: u8,
    pub max_connections: u8,
    pub auth_mode: AuthMode,
    pub pmf_required: bool,
}

/// Asynchronous notifications from the WiFi stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    StaStarted,
    StaConnected,
    StaGotIp(IpInfo),
    StaDisconnected,
    ApStarted,
    ApStaConnected { mac: MacAddr, aid: u16 },
    ApStaDisconnected { mac: MacAddr, aid: u16 },
    Other,
}

/// What the subscription glue must do after an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    None,
    /// Issue a station connect request
    Reconnect,
}

/// Callback handed to [`crate::WifiDriver::subscribe`]
pub type EventHandler = Arc<dyn Fn(&WifiEvent) -> EventAction + Send + Sync>;

/// Apply one event to the status cell.
///
/// Station start and disconnect always ask for a (re)connect. There is no
/// backoff and no attempt limit.
pub fn handle_event(status: &StatusCell, event: &WifiEvent) -> EventAction {
    match event {
        WifiEvent::StaStarted => {
            status.set(WifiStatus::Started);
            info!(target: "mbnode::wifi", "Connecting to AP...");
            EventAction::Reconnect
        }
        WifiEvent::StaConnected => {
            status.set(WifiStatus::Connected);
            info!(target: "mbnode::wifi", "Connected to AP");
            EventAction::None
        }
        WifiEvent::StaGotIp(ip_info) => {
            status.set(WifiStatus::GotIp);
            info!(target: "mbnode::wifi", "Got IP address {}", ip_info.ip);
            EventAction::None
        }
        WifiEvent::StaDisconnected => {
            status.set(WifiStatus::Disconnected);
            info!(target: "mbnode::wifi", "Disconnected from AP");
            EventAction::Reconnect
        }
        WifiEvent::ApStarted => {
            status.set(WifiStatus::ApStarted);
            info!(target: "mbnode::wifi", "Soft-AP started");
            EventAction::None
        }
        WifiEvent::ApStaConnected { mac, aid } => {
            info!(target: "mbnode::wifi", "station {} join, AID={}", mac_to_string(mac), aid);
            EventAction::None
        }
        WifiEvent::ApStaDisconnected { mac, aid } => {
            info!(target: "mbnode::wifi", "station {} leave, AID={}", mac_to_string(mac), aid);
            EventAction::None
        }
        WifiEvent::Other => EventAction::None,
    }
}

/// Build the subscription callback for one session's status cell
pub fn event_handler(status: Arc<StatusCell>) -> EventHandler {
    Arc::new(move |event: &WifiEvent| handle_event(&status, event))
}

/// Write `text` into `buf` as a NUL-terminated string, truncating if needed
pub fn write_text(buf: &mut [u8], text: &str) {
    if buf.is_empty() {
        return;
    }
    let len = text.len().min(buf.len() - 1);
    buf[..len].copy_from_slice(&text.as_bytes()[..len]);
    buf[len] = 0;
}

/// Read back a NUL-terminated buffer filled by one of the query functions
pub fn buffer_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u8() {
        for value in 0..=5u8 {
            let status = WifiStatus::from_u8(value).unwrap();
            assert_eq!(status as u8, value);
        }
        assert_eq!(WifiStatus::from_u8(6), None);
        assert_eq!(WifiStatus::from_u8(255), None);
    }

    #[test]
    fn fresh_cell_is_not_started() {
        assert_eq!(StatusCell::new().get(), WifiStatus::NotStarted);
    }

    #[test]
    fn transition_table() {
        let cell = StatusCell::new();
        let cases = [
            (WifiEvent::StaStarted, WifiStatus::Started, EventAction::Reconnect),
            (WifiEvent::StaConnected, WifiStatus::Connected, EventAction::None),
            (WifiEvent::StaGotIp(IpInfo::default()), WifiStatus::GotIp, EventAction::None),
            (WifiEvent::StaDisconnected, WifiStatus::Disconnected, EventAction::Reconnect),
            (WifiEvent::ApStarted, WifiStatus::ApStarted, EventAction::None),
        ];
        for (event, status, action) in cases {
            assert_eq!(handle_event(&cell, &event), action);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn client_join_leave_does_not_touch_status() {
        let cell = StatusCell::new();
        cell.set(WifiStatus::ApStarted);
        let mac = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
        handle_event(&cell, &WifiEvent::ApStaConnected { mac, aid: 1 });
        handle_event(&cell, &WifiEvent::ApStaDisconnected { mac, aid: 1 });
        handle_event(&cell, &WifiEvent::Other);
        assert_eq!(cell.get(), WifiStatus::ApStarted);
    }

    #[test]
    fn write_text_truncates_and_terminates() {
        let mut buf = [0xffu8; 8];
        write_text(&mut buf, "255.255.255.255");
        assert_eq!(buf[7], 0);
        assert_eq!(buffer_str(&buf), "255.255");

        let mut empty: [u8; 0] = [];
        write_text(&mut empty, "anything");
    }

    #[test]
    fn ap_record_json() {
        let record = ApRecord {
            ssid: "plant-floor".to_string(),
            rssi: -61,
            channel: 6,
            auth_mode: AuthMode::Wpa2Psk,
            pairwise_cipher: Cipher::Ccmp,
            ..ApRecord::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ssid"], "plant-floor");
        assert_eq!(json["auth_mode"], "Wpa2Psk");
        assert_eq!(json["group_cipher"], "None");
        assert_eq!(json["bssid"].as_array().map(Vec::len), Some(6));
    }
}
