//! ESP-IDF WiFi stack behind [`WifiDriver`]
//!
//! Driver lifetime (init/deinit, default netifs, configuration, start/stop)
//! goes through `EspWifi`. Event routing, MAC handling, AP info and scanning
//! use the raw ESP-IDF calls because the orchestrator needs their exact
//! semantics.

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::*;
use esp_idf_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi};
use log::*;
use mbnode_core::config::CredentialStorage;
use mbnode_core::wifi::{
    AccessPointConfig, ApRecord, AuthMode, Cipher, EventAction, EventHandler, IpInfo, StationConfig, WifiDriver,
    WifiEvent, WifiInterface, WifiMode,
};
use mbnode_core::{DriverError, MacAddr};
use std::ffi::c_void;
use std::net::Ipv4Addr;

fn driver_err(op: &'static str) -> impl Fn(EspError) -> DriverError {
    move |e| DriverError::new(op, e.code())
}

fn not_init(op: &'static str) -> DriverError {
    DriverError::new(op, DriverError::NOT_INIT)
}

fn raw_mode(mode: WifiMode) -> wifi_mode_t {
    match mode {
        WifiMode::Station => wifi_mode_t_WIFI_MODE_STA,
        WifiMode::AccessPoint => wifi_mode_t_WIFI_MODE_AP,
        WifiMode::StationAccessPoint => wifi_mode_t_WIFI_MODE_APSTA,
    }
}

fn raw_interface(iface: WifiInterface) -> wifi_interface_t {
    match iface {
        WifiInterface::Station => wifi_interface_t_WIFI_IF_STA,
        WifiInterface::AccessPoint => wifi_interface_t_WIFI_IF_AP,
    }
}

fn auth_mode(raw: wifi_auth_mode_t) -> AuthMode {
    match raw {
        wifi_auth_mode_t_WIFI_AUTH_OPEN => AuthMode::Open,
        wifi_auth_mode_t_WIFI_AUTH_WEP => AuthMode::Wep,
        wifi_auth_mode_t_WIFI_AUTH_WPA_PSK => AuthMode::WpaPsk,
        wifi_auth_mode_t_WIFI_AUTH_WPA2_PSK => AuthMode::Wpa2Psk,
        wifi_auth_mode_t_WIFI_AUTH_WPA_WPA2_PSK => AuthMode::WpaWpa2Psk,
        wifi_auth_mode_t_WIFI_AUTH_WPA2_ENTERPRISE => AuthMode::Wpa2Enterprise,
        wifi_auth_mode_t_WIFI_AUTH_WPA3_PSK => AuthMode::Wpa3Psk,
        wifi_auth_mode_t_WIFI_AUTH_WPA2_WPA3_PSK => AuthMode::Wpa2Wpa3Psk,
        wifi_auth_mode_t_WIFI_AUTH_OWE => AuthMode::Owe,
        _ => AuthMode::Unknown,
    }
}

fn cipher(raw: wifi_cipher_type_t) -> Cipher {
    match raw {
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_NONE => Cipher::None,
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_WEP40 => Cipher::Wep40,
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_WEP104 => Cipher::Wep104,
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_TKIP => Cipher::Tkip,
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_CCMP => Cipher::Ccmp,
        wifi_cipher_type_t_WIFI_CIPHER_TYPE_TKIP_CCMP => Cipher::TkipCcmp,
        _ => Cipher::Unknown,
    }
}

fn ap_record(raw: &wifi_ap_record_t) -> ApRecord {
    let len = raw.ssid.iter().position(|&b| b == 0).unwrap_or(raw.ssid.len());
    ApRecord {
        ssid: String::from_utf8_lossy(&raw.ssid[..len]).into_owned(),
        bssid: raw.bssid,
        rssi: raw.rssi,
        channel: raw.primary,
        auth_mode: auth_mode(raw.authmode),
        pairwise_cipher: cipher(raw.pairwise_cipher),
        group_cipher: cipher(raw.group_cipher),
    }
}

/// lwIP keeps addresses in network order inside a `u32`
pub fn ipv4(addr: &esp_ip4_addr_t) -> Ipv4Addr {
    Ipv4Addr::from(addr.addr.to_le_bytes())
}

pub fn ip_info(raw: &esp_netif_ip_info_t) -> IpInfo {
    IpInfo {
        ip: ipv4(&raw.ip),
        netmask: ipv4(&raw.netmask),
        gateway: ipv4(&raw.gw),
    }
}

fn translate(base: esp_event_base_t, id: i32, data: *mut c_void) -> WifiEvent {
    unsafe {
        if base == WIFI_EVENT {
            match id as wifi_event_t {
                wifi_event_t_WIFI_EVENT_STA_START => WifiEvent::StaStarted,
                wifi_event_t_WIFI_EVENT_STA_CONNECTED => WifiEvent::StaConnected,
                wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => WifiEvent::StaDisconnected,
                wifi_event_t_WIFI_EVENT_AP_START => WifiEvent::ApStarted,
                wifi_event_t_WIFI_EVENT_AP_STACONNECTED => {
                    let event = &*(data as *const wifi_event_ap_staconnected_t);
                    WifiEvent::ApStaConnected {
                        mac: event.mac,
                        aid: event.aid as u16,
                    }
                }
                wifi_event_t_WIFI_EVENT_AP_STADISCONNECTED => {
                    let event = &*(data as *const wifi_event_ap_stadisconnected_t);
                    WifiEvent::ApStaDisconnected {
                        mac: event.mac,
                        aid: event.aid as u16,
                    }
                }
                _ => WifiEvent::Other,
            }
        } else if base == IP_EVENT && id as ip_event_t == ip_event_t_IP_EVENT_STA_GOT_IP {
            let event = &*(data as *const ip_event_got_ip_t);
            WifiEvent::StaGotIp(ip_info(&event.ip_info))
        } else {
            WifiEvent::Other
        }
    }
}

/// Runs on the default event loop task
unsafe extern "C" fn on_event(arg: *mut c_void, base: esp_event_base_t, id: i32, data: *mut c_void) {
    let handler = &*(arg as *const EventHandler);
    if handler(&translate(base, id, data)) == EventAction::Reconnect {
        if let Err(e) = esp!(esp_wifi_connect()) {
            warn!(target: "mbnode::wifi", "esp_wifi_connect: {}", e);
        }
    }
}

struct Subscription {
    wifi: esp_event_handler_instance_t,
    ip: esp_event_handler_instance_t,
    handler: *mut EventHandler,
}

impl Subscription {
    fn register(handler: EventHandler, ip_events: bool) -> Result<Self, DriverError> {
        let handler = Box::into_raw(Box::new(handler));
        let mut subscription = Subscription {
            wifi: std::ptr::null_mut(),
            ip: std::ptr::null_mut(),
            handler,
        };

        esp!(unsafe {
            esp_event_handler_instance_register(
                WIFI_EVENT,
                ESP_EVENT_ANY_ID,
                Some(on_event),
                handler as *mut c_void,
                &mut subscription.wifi,
            )
        })
        .map_err(driver_err("esp_event_handler_instance_register"))?;

        if ip_events {
            esp!(unsafe {
                esp_event_handler_instance_register(
                    IP_EVENT,
                    ip_event_t_IP_EVENT_STA_GOT_IP as i32,
                    Some(on_event),
                    handler as *mut c_void,
                    &mut subscription.ip,
                )
            })
            .map_err(driver_err("esp_event_handler_instance_register"))?;
        }

        Ok(subscription)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Unregistering waits for a handler running on the event task, so
        // the handler can be freed afterwards.
        unsafe {
            if !self.wifi.is_null() {
                esp_event_handler_instance_unregister(WIFI_EVENT, ESP_EVENT_ANY_ID, self.wifi);
            }
            if !self.ip.is_null() {
                esp_event_handler_instance_unregister(IP_EVENT, ip_event_t_IP_EVENT_STA_GOT_IP as i32, self.ip);
            }
            drop(Box::from_raw(self.handler));
        }
    }
}

/// The on-chip radio
pub struct EspRadio {
    sys_loop: EspSystemEventLoop,
    modem: Option<Modem>,
    nvs: Option<EspDefaultNvsPartition>,
    wifi: Option<EspWifi<'static>>,
    mode: Option<WifiMode>,
    station: Option<ClientConfiguration>,
    access_point: Option<AccessPointConfiguration>,
    subscription: Option<Subscription>,
}

impl EspRadio {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop) -> Self {
        Self {
            sys_loop,
            modem: Some(modem),
            nvs: None,
            wifi: None,
            mode: None,
            station: None,
            access_point: None,
            subscription: None,
        }
    }

    fn wifi(&self, op: &'static str) -> Result<&EspWifi<'static>, DriverError> {
        self.wifi.as_ref().ok_or_else(|| not_init(op))
    }

    fn wifi_mut(&mut self, op: &'static str) -> Result<&mut EspWifi<'static>, DriverError> {
        self.wifi.as_mut().ok_or_else(|| not_init(op))
    }
}

impl WifiDriver for EspRadio {
    fn init_storage(&mut self) -> Result<(), DriverError> {
        if self.nvs.is_none() {
            self.nvs = Some(EspDefaultNvsPartition::take().map_err(driver_err("nvs_flash_init"))?);
        }
        Ok(())
    }

    fn init(&mut self, mode: WifiMode, storage: CredentialStorage) -> Result<(), DriverError> {
        if self.wifi.is_some() {
            return Ok(());
        }

        // EspWifi consumes the modem and never hands it back.
        let modem = self.modem.take().unwrap_or_else(|| unsafe { Modem::new() });
        let nvs = match storage {
            CredentialStorage::Flash => self.nvs.clone(),
            CredentialStorage::Ram => None,
        };
        let wifi = EspWifi::new(modem, self.sys_loop.clone(), nvs).map_err(driver_err("esp_wifi_init"))?;

        if storage == CredentialStorage::Ram {
            esp!(unsafe { esp_wifi_set_storage(wifi_storage_t_WIFI_STORAGE_RAM) })
                .map_err(driver_err("esp_wifi_set_storage"))?;
        }

        debug!(target: "mbnode::wifi", "driver initialized for {:?}", mode);
        self.wifi = Some(wifi);
        Ok(())
    }

    fn subscribe(&mut self, handler: EventHandler, ip_events: bool) -> Result<(), DriverError> {
        self.subscription = None;
        self.subscription = Some(Subscription::register(handler, ip_events)?);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.subscription = None;
    }

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), DriverError> {
        self.wifi("esp_wifi_set_mode")?;
        esp!(unsafe { esp_wifi_set_mode(raw_mode(mode)) }).map_err(driver_err("esp_wifi_set_mode"))?;
        self.mode = Some(mode);
        Ok(())
    }

    fn set_station_config(&mut self, config: &StationConfig) -> Result<(), DriverError> {
        let invalid = || DriverError::new("esp_wifi_set_config", ESP_ERR_INVALID_ARG as i32);
        self.station = Some(ClientConfiguration {
            ssid: config.ssid.as_str().try_into().map_err(|_| invalid())?,
            password: config.password.as_str().try_into().map_err(|_| invalid())?,
            auth_method: if config.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        Ok(())
    }

    fn set_ap_config(&mut self, config: &AccessPointConfig) -> Result<(), DriverError> {
        let invalid = || DriverError::new("esp_wifi_set_config", ESP_ERR_INVALID_ARG as i32);
        self.access_point = Some(AccessPointConfiguration {
            ssid: config.ssid.as_str().try_into().map_err(|_| invalid())?,
            password: config.password.as_str().try_into().map_err(|_| invalid())?,
            channel: config.channel,
            max_connections: config.max_connections as u16,
            auth_method: match config.auth_mode {
                AuthMode::Open => AuthMethod::None,
                _ => AuthMethod::WPA2Personal,
            },
            ..Default::default()
        });
        Ok(())
    }

    fn set_mac(&mut self, iface: WifiInterface, mac: MacAddr) -> Result<(), DriverError> {
        self.wifi("esp_wifi_set_mac")?;
        esp!(unsafe { esp_wifi_set_mac(raw_interface(iface), mac.as_ptr()) }).map_err(driver_err("esp_wifi_set_mac"))
    }

    fn start(&mut self) -> Result<(), DriverError> {
        let mode = self.mode.ok_or_else(|| not_init("esp_wifi_start"))?;
        let station = self.station.clone().unwrap_or_default();
        let access_point = self.access_point.clone().unwrap_or_default();
        let configuration = match mode {
            WifiMode::Station => Configuration::Client(station),
            WifiMode::AccessPoint => Configuration::AccessPoint(access_point),
            WifiMode::StationAccessPoint => Configuration::Mixed(station, access_point),
        };

        let wifi = self.wifi_mut("esp_wifi_start")?;
        wifi.set_configuration(&configuration).map_err(driver_err("esp_wifi_set_config"))?;
        wifi.start().map_err(driver_err("esp_wifi_start"))
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.wifi_mut("esp_wifi_disconnect")?
            .disconnect()
            .map_err(driver_err("esp_wifi_disconnect"))
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.wifi_mut("esp_wifi_stop")?.stop().map_err(driver_err("esp_wifi_stop"))
    }

    fn deinit(&mut self) -> Result<(), DriverError> {
        // Dropping EspWifi deinitializes the driver and frees its netifs.
        self.wifi.take().ok_or_else(|| not_init("esp_wifi_deinit"))?;
        self.mode = None;
        self.station = None;
        self.access_point = None;
        Ok(())
    }

    fn netif_exists(&self, _iface: WifiInterface) -> bool {
        self.wifi.is_some()
    }

    fn destroy_netif(&mut self, _iface: WifiInterface) {
        // Default netifs belong to the driver instance.
        self.wifi = None;
    }

    fn connected_ap(&self) -> Result<ApRecord, DriverError> {
        let mut raw = wifi_ap_record_t::default();
        esp!(unsafe { esp_wifi_sta_get_ap_info(&mut raw) }).map_err(driver_err("esp_wifi_sta_get_ap_info"))?;
        Ok(ap_record(&raw))
    }

    fn mac(&self, iface: WifiInterface) -> Result<MacAddr, DriverError> {
        let mut mac = MacAddr::default();
        esp!(unsafe { esp_wifi_get_mac(raw_interface(iface), mac.as_mut_ptr()) })
            .map_err(driver_err("esp_wifi_get_mac"))?;
        Ok(mac)
    }

    fn ip_info(&self, iface: WifiInterface) -> Result<IpInfo, DriverError> {
        let wifi = self
            .wifi
            .as_ref()
            .ok_or(DriverError::new("esp_netif_get_ip_info", DriverError::NO_INTERFACE))?;
        let netif = match iface {
            WifiInterface::Station => wifi.sta_netif(),
            WifiInterface::AccessPoint => wifi.ap_netif(),
        };

        let mut raw = esp_netif_ip_info_t::default();
        esp!(unsafe { esp_netif_get_ip_info(netif.handle(), &mut raw) }).map_err(driver_err("esp_netif_get_ip_info"))?;
        Ok(ip_info(&raw))
    }

    fn scan_start(&mut self) -> Result<(), DriverError> {
        self.wifi("esp_wifi_scan_start")?;
        esp!(unsafe { esp_wifi_scan_start(std::ptr::null(), true) }).map_err(driver_err("esp_wifi_scan_start"))
    }

    fn scan_records(&mut self, out: &mut [ApRecord]) -> Result<usize, DriverError> {
        let mut number = out.len() as u16;
        let mut raw: Vec<wifi_ap_record_t> = (0..out.len()).map(|_| Default::default()).collect();
        esp!(unsafe { esp_wifi_scan_get_ap_records(&mut number, raw.as_mut_ptr()) })
            .map_err(driver_err("esp_wifi_scan_get_ap_records"))?;

        let n = (number as usize).min(out.len());
        for (slot, record) in out.iter_mut().zip(&raw[..n]) {
            *slot = ap_record(record);
        }
        Ok(n)
    }

    fn scan_count(&mut self) -> Result<usize, DriverError> {
        let mut count: u16 = 0;
        esp!(unsafe { esp_wifi_scan_get_ap_num(&mut count) }).map_err(driver_err("esp_wifi_scan_get_ap_num"))?;
        Ok(count as usize)
    }
}
