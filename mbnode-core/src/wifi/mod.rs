//! WiFi bring-up and queries
//!
//! [`Wifi`] sequences calls into a [`WifiDriver`] (the platform WiFi/TCP-IP
//! stack) for station, soft-AP or dual operation, and tracks the connection
//! status from the driver's asynchronous events.

mod types;

pub use types::*;

use crate::config::{CredentialStorage, WifiSettings, AP_MAX_CONNECTIONS};
use crate::error::{DriverError, Result};
use crate::{mac_to_string, MacAddr};
use log::*;
use std::sync::Arc;

/// Platform WiFi stack, one method per collaborator call
///
/// MCU-specific crates implement this trait using their WiFi stack.
pub trait WifiDriver {
    /// Initialize the non-volatile storage the WiFi driver may use
    fn init_storage(&mut self) -> Result<(), DriverError>;

    /// Initialize the TCP/IP stack, create interface handles for `mode`
    /// and initialize the radio driver
    fn init(&mut self, mode: WifiMode, storage: CredentialStorage) -> Result<(), DriverError>;

    /// Route WiFi events to `handler`, plus station IP events when
    /// `ip_events` is set. When the handler returns
    /// [`EventAction::Reconnect`] the implementation issues a station
    /// connect request.
    fn subscribe(&mut self, handler: EventHandler, ip_events: bool) -> Result<(), DriverError>;

    /// Drop the handler registered by `subscribe`. After this returns the
    /// handler is not called again.
    fn unsubscribe(&mut self);

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), DriverError>;

    fn set_station_config(&mut self, config: &StationConfig) -> Result<(), DriverError>;

    fn set_ap_config(&mut self, config: &AccessPointConfig) -> Result<(), DriverError>;

    fn set_mac(&mut self, iface: WifiInterface, mac: MacAddr) -> Result<(), DriverError>;

    fn start(&mut self) -> Result<(), DriverError>;

    fn disconnect(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self) -> Result<(), DriverError>;

    fn deinit(&mut self) -> Result<(), DriverError>;

    fn netif_exists(&self, iface: WifiInterface) -> bool;

    fn destroy_netif(&mut self, iface: WifiInterface);

    /// Record of the AP the station is associated with
    fn connected_ap(&self) -> Result<ApRecord, DriverError>;

    fn mac(&self, iface: WifiInterface) -> Result<MacAddr, DriverError>;

    fn ip_info(&self, iface: WifiInterface) -> Result<IpInfo, DriverError>;

    /// Run a blocking scan
    fn scan_start(&mut self) -> Result<(), DriverError>;

    /// Copy up to `out.len()` records of the last scan, returns how many
    fn scan_records(&mut self, out: &mut [ApRecord]) -> Result<usize, DriverError>;

    /// Number of APs found by the last scan
    fn scan_count(&mut self) -> Result<usize, DriverError>;
}

/// WiFi orchestrator
///
/// Owns the driver and the status cell of the current session. Nothing here
/// is global, so several instances can coexist (one per test, for example).
pub struct Wifi<D: WifiDriver> {
    driver: D,
    settings: WifiSettings,
    status: Arc<StatusCell>,
}

impl<D: WifiDriver> Wifi<D> {
    pub fn new(driver: D, settings: WifiSettings) -> Self {
        Self {
            driver,
            settings,
            status: Arc::new(StatusCell::new()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn settings(&self) -> &WifiSettings {
        &self.settings
    }

    /// Current connection status, never blocks
    pub fn status(&self) -> WifiStatus {
        self.status.get()
    }

    /// Configure and start the radio in `mode`.
    ///
    /// A running radio is stopped first. A storage init failure is logged
    /// and ignored, every other failed call is returned to the caller.
    pub fn begin(&mut self, mode: WifiMode) -> Result<()> {
        if let Err(e) = self.driver.init_storage() {
            warn!(target: "mbnode::wifi", "Storage init failed: {}", e);
        }

        if self.status() != WifiStatus::NotStarted {
            warn!(target: "mbnode::wifi", "Stop previously initialized WiFi...");
            self.stop();
            warn!(target: "mbnode::wifi", "WiFi stopped. Init again...");
        }

        self.status = Arc::new(StatusCell::new());

        self.driver.init(mode, self.settings.storage)?;
        // No station, no IP events to listen for
        self.driver.subscribe(event_handler(self.status.clone()), mode.has_station())?;
        self.driver.set_mode(mode)?;

        if mode.has_station() {
            self.driver.set_station_config(&self.station_config())?;
            if let Some(mac) = self.settings.sta_mac {
                self.driver.set_mac(WifiInterface::Station, mac)?;
            }
        }

        if mode.has_access_point() {
            let channel = if mode == WifiMode::AccessPoint { 1 } else { 0 };
            self.driver.set_ap_config(&self.ap_config(channel))?;
            if let Some(mac) = self.settings.ap_mac {
                self.driver.set_mac(WifiInterface::AccessPoint, mac)?;
            }
        }

        self.driver.start()?;
        info!(target: "mbnode::wifi", "WiFi started in {:?} mode", mode);
        Ok(())
    }

    /// Disconnect, stop and release the radio. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Err(e) = self.driver.disconnect() {
            debug!(target: "mbnode::wifi", "disconnect: {}", e);
        }
        if let Err(e) = self.driver.stop() {
            debug!(target: "mbnode::wifi", "stop: {}", e);
        }
        if let Err(e) = self.driver.deinit() {
            debug!(target: "mbnode::wifi", "deinit: {}", e);
        }

        for iface in [WifiInterface::Station, WifiInterface::AccessPoint] {
            if self.driver.netif_exists(iface) {
                self.driver.destroy_netif(iface);
            }
        }

        self.driver.unsubscribe();
        self.status = Arc::new(StatusCell::new());
    }

    /// Info about the AP the station is connected to: logged when `out` is
    /// `None`, copied into `out` otherwise.
    pub fn ap_info(&self, out: Option<&mut ApRecord>) -> Result<()> {
        let ap = self.driver.connected_ap()?;
        match out {
            None => {
                info!(target: "mbnode::wifi", "SSID: {}", ap.ssid);
                info!(target: "mbnode::wifi", "RSSI: {}", ap.rssi);
                info!(target: "mbnode::wifi", "BSSID: {}", mac_to_string(&ap.bssid));
                info!(target: "mbnode::wifi", "Channel: {}", ap.channel);
            }
            Some(out) => *out = ap,
        }
        Ok(())
    }

    /// Station MAC address as text: logged when `out` is `None`
    pub fn station_mac(&self, out: Option<&mut [u8; MAC_ADDR_LENGTH]>) -> Result<()> {
        let mac = mac_to_string(&self.driver.mac(WifiInterface::Station)?);
        match out {
            None => info!(target: "mbnode::wifi", "Station MAC Address: {}", mac),
            Some(buf) => write_text(buf, &mac),
        }
        Ok(())
    }

    pub fn station_ip(&self, out: Option<&mut [u8; IP_ADDR_LENGTH]>) -> Result<()> {
        self.ip_query("IP Address", |info| info.ip, out)
    }

    pub fn station_subnet_mask(&self, out: Option<&mut [u8; IP_ADDR_LENGTH]>) -> Result<()> {
        self.ip_query("Subnet Mask", |info| info.netmask, out)
    }

    pub fn station_gateway(&self, out: Option<&mut [u8; IP_ADDR_LENGTH]>) -> Result<()> {
        self.ip_query("Gateway", |info| info.gateway, out)
    }

    fn ip_query(
        &self,
        label: &str,
        field: impl Fn(&IpInfo) -> std::net::Ipv4Addr,
        out: Option<&mut [u8; IP_ADDR_LENGTH]>,
    ) -> Result<()> {
        let ip_info = self.driver.ip_info(WifiInterface::Station)?;
        let text = field(&ip_info).to_string();
        match out {
            None => info!(target: "mbnode::wifi", "{}: {}", label, text),
            Some(buf) => write_text(buf, &text),
        }
        Ok(())
    }

    /// Scan for access points.
    ///
    /// Brings the radio up in plain station mode first if it was never
    /// started. Found APs are logged when `out` is `None`, otherwise copied
    /// into `out`, capped at [`SCAN_LIST_SIZE`] and silently truncated.
    pub fn scan(&mut self, out: Option<&mut [ApRecord]>) -> Result<ScanSummary> {
        if self.status() == WifiStatus::NotStarted {
            self.start_for_scan()?;
        }

        self.driver.scan_start()?;

        let mut found = vec![ApRecord::default(); SCAN_LIST_SIZE];
        let fetched = match self.driver.scan_records(&mut found) {
            Ok(n) => n.min(SCAN_LIST_SIZE),
            Err(e) => {
                warn!(target: "mbnode::wifi", "Fetching scan records failed: {}", e);
                0
            }
        };
        let available = match self.driver.scan_count() {
            Ok(n) => n,
            Err(e) => {
                warn!(target: "mbnode::wifi", "Fetching scan count failed: {}", e);
                fetched
            }
        };
        found.truncate(fetched.min(available));

        let returned = match out {
            None => {
                info!(target: "mbnode::wifi", "Total APs scanned = {}", available);
                for ap in &found {
                    log_ap_record(ap);
                }
                found.len()
            }
            Some(buf) => {
                let n = found.len().min(buf.len());
                buf[..n].clone_from_slice(&found[..n]);
                n
            }
        };

        Ok(ScanSummary {
            available,
            returned,
        })
    }

    fn start_for_scan(&mut self) -> Result<()> {
        if let Err(e) = self.driver.init_storage() {
            warn!(target: "mbnode::wifi", "Storage init failed: {}", e);
        }
        self.status = Arc::new(StatusCell::new());
        self.driver.init(WifiMode::Station, self.settings.storage)?;
        self.driver.set_mode(WifiMode::Station)?;
        if let Some(mac) = self.settings.sta_mac {
            self.driver.set_mac(WifiInterface::Station, mac)?;
        }
        self.driver.start()?;
        self.status.set(WifiStatus::Started);
        Ok(())
    }

    fn station_config(&self) -> StationConfig {
        StationConfig {
            ssid: self.settings.ssid.clone(),
            password: self.settings.password.clone(),
        }
    }

    fn ap_config(&self, channel: u8) -> AccessPointConfig {
        let auth_mode = if self.settings.ap_password.is_empty() {
            AuthMode::Open
        } else {
            AuthMode::Wpa2Psk
        };
        AccessPointConfig {
            ssid: self.settings.ap_ssid.clone(),
            password: self.settings.ap_password.clone(),
            channel,
            max_connections: AP_MAX_CONNECTIONS,
            auth_mode,
            pmf_required: false,
        }
    }
}

fn log_ap_record(ap: &ApRecord) {
    info!(target: "mbnode::wifi", "SSID \t\t{}", ap.ssid);
    info!(target: "mbnode::wifi", "RSSI \t\t{}", ap.rssi);
    info!(target: "mbnode::wifi", "Authmode \t{}", ap.auth_mode.label());
    if ap.auth_mode != AuthMode::Wep {
        info!(target: "mbnode::wifi", "Pairwise Cipher \t{}", ap.pairwise_cipher.label());
        info!(target: "mbnode::wifi", "Group Cipher \t{}", ap.group_cipher.label());
    }
    info!(target: "mbnode::wifi", "Channel \t\t{}", ap.channel);
}
