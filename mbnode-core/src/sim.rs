//! Simulated platform drivers for running the node on a host
//!
//! [`SimulatedRadio`] behaves like an asynchronous WiFi stack: events are
//! delivered on a dispatcher thread, never from inside the call that caused
//! them. [`SimulatedEthernet`] records the calls it receives.

use crate::config::CredentialStorage;
use crate::error::DriverError;
use crate::ethernet::{ChipRevision, EthernetDriver, EthernetEvent, EthernetEventHandler, SpiBusConfig, SpiDeviceConfig};
use crate::wifi::{
    AccessPointConfig, ApRecord, AuthMode, Cipher, EventAction, EventHandler, IpInfo, StationConfig, WifiDriver,
    WifiEvent, WifiInterface, WifiMode,
};
use crate::MacAddr;
use log::*;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FACTORY_STA_MAC: MacAddr = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x01];
const FACTORY_AP_MAC: MacAddr = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x02];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Dispatch {
    Event(WifiEvent),
    Connect,
    Shutdown,
}

/// State shared with the dispatcher thread
struct Air {
    handler: Mutex<Option<EventHandler>>,
    ip_events: AtomicBool,
    lease: Mutex<IpInfo>,
    visible: Mutex<Vec<ApRecord>>,
    station: Mutex<Option<StationConfig>>,
    associated: Mutex<Option<(ApRecord, IpInfo)>>,
    reachable: AtomicBool,
    started: AtomicBool,
    connect_attempts: AtomicUsize,
    retry_delay: Duration,
}

impl Air {
    fn deliver(&self, event: &WifiEvent) -> EventAction {
        // Held across the call so that `unsubscribe` waits for a running handler.
        let handler = lock(&self.handler);
        if matches!(event, WifiEvent::StaGotIp(_)) && !self.ip_events.load(Ordering::Acquire) {
            return EventAction::None;
        }
        match handler.as_ref() {
            Some(handler) => handler(event),
            None => EventAction::None,
        }
    }

    /// One association attempt, returns the resulting event
    fn connect(&self) -> Option<WifiEvent> {
        if !self.started.load(Ordering::Acquire) {
            return None;
        }
        let attempt = self.connect_attempts.fetch_add(1, Ordering::AcqRel) + 1;

        let ssid = lock(&self.station).as_ref().map(|config| config.ssid.clone())?;
        let ap = lock(&self.visible).iter().find(|ap| ap.ssid == ssid).cloned();

        match ap {
            Some(ap) if self.reachable.load(Ordering::Acquire) => {
                let ip_info = *lock(&self.lease);
                *lock(&self.associated) = Some((ap, ip_info));
                Some(WifiEvent::StaConnected)
            }
            _ => {
                trace!(target: "mbnode::sim", "association attempt {} to {:?} failed", attempt, ssid);
                thread::sleep(self.retry_delay);
                Some(WifiEvent::StaDisconnected)
            }
        }
    }
}

fn dispatch_loop(air: Arc<Air>, tx: Sender<Dispatch>, rx: Receiver<Dispatch>) {
    while let Ok(message) = rx.recv() {
        let event = match message {
            Dispatch::Shutdown => break,
            Dispatch::Event(event) => event,
            Dispatch::Connect => match air.connect() {
                Some(event) => event,
                None => continue,
            },
        };

        if air.deliver(&event) == EventAction::Reconnect {
            let _ = tx.send(Dispatch::Connect);
        }

        if event == WifiEvent::StaConnected {
            if let Some((_, ip_info)) = lock(&air.associated).clone() {
                let _ = tx.send(Dispatch::Event(WifiEvent::StaGotIp(ip_info)));
            }
        }
    }
}

/// Host stand-in for the WiFi radio and its TCP/IP glue
pub struct SimulatedRadio {
    air: Arc<Air>,
    dispatcher: Option<(Sender<Dispatch>, JoinHandle<()>)>,
    storage_ready: bool,
    storage: Option<CredentialStorage>,
    mode: Option<WifiMode>,
    ap_config: Option<AccessPointConfig>,
    sta_netif: bool,
    ap_netif: bool,
    sta_mac: MacAddr,
    ap_mac: MacAddr,
    last_scan: Vec<ApRecord>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::with_retry_delay(Duration::from_millis(100))
    }

    /// `retry_delay` is how long a failed association takes
    pub fn with_retry_delay(retry_delay: Duration) -> Self {
        Self {
            air: Arc::new(Air {
                handler: Mutex::new(None),
                ip_events: AtomicBool::new(false),
                lease: Mutex::new(IpInfo {
                    ip: Ipv4Addr::new(192, 168, 1, 100),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: Ipv4Addr::new(192, 168, 1, 1),
                }),
                visible: Mutex::new(Vec::new()),
                station: Mutex::new(None),
                associated: Mutex::new(None),
                reachable: AtomicBool::new(true),
                started: AtomicBool::new(false),
                connect_attempts: AtomicUsize::new(0),
                retry_delay,
            }),
            dispatcher: None,
            storage_ready: false,
            storage: None,
            mode: None,
            ap_config: None,
            sta_netif: false,
            ap_netif: false,
            sta_mac: FACTORY_STA_MAC,
            ap_mac: FACTORY_AP_MAC,
            last_scan: Vec::new(),
        }
    }

    /// Add an access point to the simulated air
    pub fn add_access_point(&mut self, ssid: &str, rssi: i8, channel: u8, auth_mode: AuthMode) {
        let mut visible = lock(&self.air.visible);
        let index = visible.len() as u8;
        let cipher = match auth_mode {
            AuthMode::Open => Cipher::None,
            AuthMode::Wep => Cipher::Wep40,
            AuthMode::WpaPsk => Cipher::Tkip,
            _ => Cipher::Ccmp,
        };
        visible.push(ApRecord {
            ssid: ssid.to_string(),
            bssid: [0x02, 0x11, 0x22, 0x33, 0x44, index],
            rssi,
            channel,
            auth_mode,
            pairwise_cipher: cipher,
            group_cipher: cipher,
        });
    }

    /// Whether configured credentials lead to an association
    pub fn set_reachable(&mut self, reachable: bool) {
        self.air.reachable.store(reachable, Ordering::Release);
    }

    /// Address handed to the station on its next association
    pub fn set_dhcp_lease(&mut self, lease: IpInfo) {
        *lock(&self.air.lease) = lease;
    }

    /// Whether the current handler also receives station IP events
    pub fn ip_events_subscribed(&self) -> bool {
        self.air.ip_events.load(Ordering::Acquire)
    }

    pub fn connect_attempts(&self) -> usize {
        self.air.connect_attempts.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.air.started.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn storage(&self) -> Option<CredentialStorage> {
        self.storage
    }

    pub fn ap_config(&self) -> Option<&AccessPointConfig> {
        self.ap_config.as_ref()
    }

    pub fn station_config(&self) -> Option<StationConfig> {
        lock(&self.air.station).clone()
    }

    fn send(&self, message: Dispatch) {
        if let Some((tx, _)) = &self.dispatcher {
            let _ = tx.send(message);
        }
    }

    fn require_init(&self, op: &'static str) -> Result<(), DriverError> {
        if self.dispatcher.is_none() {
            return Err(DriverError::new(op, DriverError::NOT_INIT));
        }
        Ok(())
    }

    fn shutdown_dispatcher(&mut self) {
        if let Some((tx, handle)) = self.dispatcher.take() {
            let _ = tx.send(Dispatch::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        self.air.started.store(false, Ordering::Release);
        self.shutdown_dispatcher();
    }
}

impl WifiDriver for SimulatedRadio {
    fn init_storage(&mut self) -> Result<(), DriverError> {
        self.storage_ready = true;
        Ok(())
    }

    fn init(&mut self, mode: WifiMode, storage: CredentialStorage) -> Result<(), DriverError> {
        if mode.has_station() {
            self.sta_netif = true;
        }
        if mode.has_access_point() {
            self.ap_netif = true;
        }
        self.storage = Some(storage);

        if self.dispatcher.is_none() {
            let (tx, rx) = mpsc::channel();
            let air = self.air.clone();
            let loopback = tx.clone();
            let handle = thread::Builder::new()
                .name("sim-wifi-events".into())
                .spawn(move || dispatch_loop(air, loopback, rx))
                .map_err(|_| DriverError::fail("esp_wifi_init"))?;
            self.dispatcher = Some((tx, handle));
        }
        Ok(())
    }

    fn subscribe(&mut self, handler: EventHandler, ip_events: bool) -> Result<(), DriverError> {
        self.require_init("esp_event_handler_instance_register")?;
        let mut slot = lock(&self.air.handler);
        self.air.ip_events.store(ip_events, Ordering::Release);
        *slot = Some(handler);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        let mut slot = lock(&self.air.handler);
        self.air.ip_events.store(false, Ordering::Release);
        *slot = None;
    }

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), DriverError> {
        self.require_init("esp_wifi_set_mode")?;
        self.mode = Some(mode);
        Ok(())
    }

    fn set_station_config(&mut self, config: &StationConfig) -> Result<(), DriverError> {
        self.require_init("esp_wifi_set_config")?;
        *lock(&self.air.station) = Some(config.clone());
        Ok(())
    }

    fn set_ap_config(&mut self, config: &AccessPointConfig) -> Result<(), DriverError> {
        self.require_init("esp_wifi_set_config")?;
        self.ap_config = Some(config.clone());
        Ok(())
    }

    fn set_mac(&mut self, iface: WifiInterface, mac: MacAddr) -> Result<(), DriverError> {
        self.require_init("esp_wifi_set_mac")?;
        match iface {
            WifiInterface::Station => self.sta_mac = mac,
            WifiInterface::AccessPoint => self.ap_mac = mac,
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.require_init("esp_wifi_start")?;
        let mode = self.mode.ok_or(DriverError::fail("esp_wifi_start"))?;
        self.air.started.store(true, Ordering::Release);

        if mode.has_station() {
            self.send(Dispatch::Event(WifiEvent::StaStarted));
        }
        if mode.has_access_point() {
            self.send(Dispatch::Event(WifiEvent::ApStarted));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.require_init("esp_wifi_disconnect")?;
        if !self.is_started() {
            return Err(DriverError::new("esp_wifi_disconnect", DriverError::NOT_STARTED));
        }
        if lock(&self.air.associated).take().is_some() {
            self.send(Dispatch::Event(WifiEvent::StaDisconnected));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.require_init("esp_wifi_stop")?;
        self.air.started.store(false, Ordering::Release);
        *lock(&self.air.associated) = None;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DriverError> {
        self.require_init("esp_wifi_deinit")?;
        self.shutdown_dispatcher();
        self.mode = None;
        self.sta_mac = FACTORY_STA_MAC;
        self.ap_mac = FACTORY_AP_MAC;
        Ok(())
    }

    fn netif_exists(&self, iface: WifiInterface) -> bool {
        match iface {
            WifiInterface::Station => self.sta_netif,
            WifiInterface::AccessPoint => self.ap_netif,
        }
    }

    fn destroy_netif(&mut self, iface: WifiInterface) {
        match iface {
            WifiInterface::Station => self.sta_netif = false,
            WifiInterface::AccessPoint => self.ap_netif = false,
        }
    }

    fn connected_ap(&self) -> Result<ApRecord, DriverError> {
        if !self.is_started() {
            return Err(DriverError::new("esp_wifi_sta_get_ap_info", DriverError::NOT_STARTED));
        }
        lock(&self.air.associated)
            .as_ref()
            .map(|(ap, _)| ap.clone())
            .ok_or(DriverError::new("esp_wifi_sta_get_ap_info", DriverError::NOT_CONNECTED))
    }

    fn mac(&self, iface: WifiInterface) -> Result<MacAddr, DriverError> {
        self.require_init("esp_wifi_get_mac")?;
        Ok(match iface {
            WifiInterface::Station => self.sta_mac,
            WifiInterface::AccessPoint => self.ap_mac,
        })
    }

    fn ip_info(&self, iface: WifiInterface) -> Result<IpInfo, DriverError> {
        if !self.netif_exists(iface) {
            return Err(DriverError::new("esp_netif_get_ip_info", DriverError::NO_INTERFACE));
        }
        Ok(match iface {
            WifiInterface::Station => lock(&self.air.associated)
                .as_ref()
                .map(|(_, ip_info)| *ip_info)
                .unwrap_or_default(),
            WifiInterface::AccessPoint => IpInfo {
                ip: Ipv4Addr::new(192, 168, 4, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(192, 168, 4, 1),
            },
        })
    }

    fn scan_start(&mut self) -> Result<(), DriverError> {
        if !self.is_started() || !self.mode.is_some_and(WifiMode::has_station) {
            return Err(DriverError::new("esp_wifi_scan_start", DriverError::NOT_STARTED));
        }
        let mut found = lock(&self.air.visible).clone();
        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        self.last_scan = found;
        Ok(())
    }

    fn scan_records(&mut self, out: &mut [ApRecord]) -> Result<usize, DriverError> {
        let n = out.len().min(self.last_scan.len());
        out[..n].clone_from_slice(&self.last_scan[..n]);
        Ok(n)
    }

    fn scan_count(&mut self) -> Result<usize, DriverError> {
        Ok(self.last_scan.len())
    }
}

/// Host stand-in for the SPI bus and ENC28J60 driver
pub struct SimulatedEthernet {
    revision: ChipRevision,
    calls: Vec<&'static str>,
    bus: Option<SpiBusConfig>,
    device: Option<SpiDeviceConfig>,
    mac: Option<MacAddr>,
    handler: Option<EthernetEventHandler>,
    started: bool,
}

impl SimulatedEthernet {
    pub fn new(revision: ChipRevision) -> Self {
        Self {
            revision,
            calls: Vec::new(),
            bus: None,
            device: None,
            mac: None,
            handler: None,
            started: false,
        }
    }

    /// Names of the driver calls made so far, in order
    pub fn calls(&self) -> &[&'static str] {
        &self.calls
    }

    pub fn bus(&self) -> Option<&SpiBusConfig> {
        self.bus.as_ref()
    }

    pub fn device(&self) -> Option<&SpiDeviceConfig> {
        self.device.as_ref()
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.mac
    }

    fn emit(&self, event: EthernetEvent) {
        if let Some(handler) = &self.handler {
            handler(&event);
        }
    }
}

impl Default for SimulatedEthernet {
    fn default() -> Self {
        Self::new(ChipRevision::B7)
    }
}

impl EthernetDriver for SimulatedEthernet {
    fn install_isr_service(&mut self) -> Result<(), DriverError> {
        self.calls.push("gpio_install_isr_service");
        Ok(())
    }

    fn create_netif(&mut self) -> Result<(), DriverError> {
        self.calls.push("esp_netif_new");
        Ok(())
    }

    fn init_spi_bus(&mut self, bus: &SpiBusConfig) -> Result<(), DriverError> {
        self.calls.push("spi_bus_initialize");
        self.bus = Some(*bus);
        Ok(())
    }

    fn install_mac_phy(&mut self, device: &SpiDeviceConfig) -> Result<(), DriverError> {
        self.calls.push("esp_eth_driver_install");
        self.device = Some(*device);
        Ok(())
    }

    fn set_mac_addr(&mut self, mac: MacAddr) -> Result<(), DriverError> {
        self.calls.push("esp_eth_ioctl(ETH_CMD_S_MAC_ADDR)");
        self.mac = Some(mac);
        Ok(())
    }

    fn chip_revision(&mut self) -> Result<ChipRevision, DriverError> {
        self.calls.push("emac_enc28j60_get_chip_info");
        Ok(self.revision)
    }

    fn attach_netif(&mut self) -> Result<(), DriverError> {
        self.calls.push("esp_netif_attach");
        Ok(())
    }

    fn subscribe(&mut self, handler: EthernetEventHandler) -> Result<(), DriverError> {
        self.calls.push("esp_event_handler_register");
        self.handler = Some(handler);
        Ok(())
    }

    fn set_full_duplex(&mut self) -> Result<(), DriverError> {
        self.calls.push("esp_eth_ioctl(ETH_CMD_S_DUPLEX_MODE)");
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.calls.push("esp_eth_start");
        self.started = true;

        let mac = self.mac.unwrap_or_default();
        self.emit(EthernetEvent::Started);
        self.emit(EthernetEvent::LinkUp { mac });
        self.emit(EthernetEvent::GotIp(IpInfo {
            ip: Ipv4Addr::new(192, 168, 10, 50),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 10, 1),
        }));
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_need_init() {
        let mut radio = SimulatedRadio::new();
        let err = radio.set_mode(WifiMode::Station).unwrap_err();
        assert_eq!(err.code, DriverError::NOT_INIT);
        assert!(radio.deinit().is_err());
        assert_eq!(
            radio.ip_info(WifiInterface::Station).unwrap_err().code,
            DriverError::NO_INTERFACE
        );
    }

    #[test]
    fn scan_sorts_by_signal() {
        let mut radio = SimulatedRadio::new();
        radio.add_access_point("weak", -80, 1, AuthMode::Open);
        radio.add_access_point("strong", -40, 6, AuthMode::Wpa2Psk);
        radio.init(WifiMode::Station, CredentialStorage::Ram).unwrap();
        radio.set_mode(WifiMode::Station).unwrap();
        radio.start().unwrap();
        radio.scan_start().unwrap();

        let mut out = vec![ApRecord::default(); 1];
        assert_eq!(radio.scan_records(&mut out).unwrap(), 1);
        assert_eq!(out[0].ssid, "strong");
        assert_eq!(out[0].pairwise_cipher, Cipher::Ccmp);
        assert_eq!(radio.scan_count().unwrap(), 2);
    }

    #[test]
    fn ethernet_start_emits_link_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut eth = SimulatedEthernet::default();
        {
            let seen = seen.clone();
            eth.subscribe(Arc::new(move |event: &EthernetEvent| lock(&seen).push(event.clone())))
                .unwrap();
        }
        eth.start().unwrap();
        let seen = lock(&seen);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], EthernetEvent::Started);
        assert!(matches!(seen[2], EthernetEvent::GotIp(_)));
    }
}
