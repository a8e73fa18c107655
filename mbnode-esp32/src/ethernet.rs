//! ENC28J60 over SPI behind [`EthernetDriver`]

use crate::wifi::ip_info;
use esp_idf_svc::netif::{EspNetif, NetifStack};
use esp_idf_svc::sys::*;
use log::*;
use mbnode_core::ethernet::{
    ChipRevision, EthernetDriver, EthernetEvent, EthernetEventHandler, SpiBusConfig, SpiDeviceConfig,
};
use mbnode_core::{DriverError, MacAddr};
use std::ffi::c_void;

fn driver_err(op: &'static str) -> impl Fn(EspError) -> DriverError {
    move |e| DriverError::new(op, e.code())
}

fn translate(base: esp_event_base_t, id: i32, data: *mut c_void) -> Option<EthernetEvent> {
    unsafe {
        if base == ETH_EVENT {
            let event = match id as eth_event_t {
                eth_event_t_ETHERNET_EVENT_CONNECTED => {
                    let handle = *(data as *const esp_eth_handle_t);
                    let mut mac = MacAddr::default();
                    esp_eth_ioctl(handle, eth_io_cmd_t_ETH_CMD_G_MAC_ADDR, mac.as_mut_ptr() as *mut c_void);
                    EthernetEvent::LinkUp { mac }
                }
                eth_event_t_ETHERNET_EVENT_DISCONNECTED => EthernetEvent::LinkDown,
                eth_event_t_ETHERNET_EVENT_START => EthernetEvent::Started,
                eth_event_t_ETHERNET_EVENT_STOP => EthernetEvent::Stopped,
                _ => return None,
            };
            Some(event)
        } else if base == IP_EVENT && id as ip_event_t == ip_event_t_IP_EVENT_ETH_GOT_IP {
            let event = &*(data as *const ip_event_got_ip_t);
            Some(EthernetEvent::GotIp(ip_info(&event.ip_info)))
        } else {
            None
        }
    }
}

unsafe extern "C" fn on_event(arg: *mut c_void, base: esp_event_base_t, id: i32, data: *mut c_void) {
    let handler = &*(arg as *const EthernetEventHandler);
    if let Some(event) = translate(base, id, data) {
        handler(&event);
    }
}

/// SPI Ethernet controller. Lives for the rest of the program once started.
pub struct Enc28j60 {
    netif: Option<EspNetif>,
    host: spi_host_device_t,
    mac: *mut esp_eth_mac_t,
    handle: esp_eth_handle_t,
    started: bool,
}

impl Enc28j60 {
    pub fn new() -> Self {
        Self {
            netif: None,
            host: 0,
            mac: std::ptr::null_mut(),
            handle: std::ptr::null_mut(),
            started: false,
        }
    }

    fn installed(&self, op: &'static str) -> Result<(), DriverError> {
        if self.handle.is_null() {
            return Err(DriverError::new(op, ESP_ERR_INVALID_STATE as i32));
        }
        Ok(())
    }
}

impl EthernetDriver for Enc28j60 {
    fn install_isr_service(&mut self) -> Result<(), DriverError> {
        esp!(unsafe { gpio_install_isr_service(0) }).map_err(driver_err("gpio_install_isr_service"))
    }

    fn create_netif(&mut self) -> Result<(), DriverError> {
        self.netif = Some(EspNetif::new(NetifStack::Eth).map_err(driver_err("esp_netif_new"))?);
        Ok(())
    }

    fn init_spi_bus(&mut self, bus: &SpiBusConfig) -> Result<(), DriverError> {
        let config = spi_bus_config_t {
            __bindgen_anon_1: spi_bus_config_t__bindgen_ty_1 { mosi_io_num: bus.mosi },
            __bindgen_anon_2: spi_bus_config_t__bindgen_ty_2 { miso_io_num: bus.miso },
            sclk_io_num: bus.sclk,
            __bindgen_anon_3: spi_bus_config_t__bindgen_ty_3 { quadwp_io_num: bus.quadwp },
            __bindgen_anon_4: spi_bus_config_t__bindgen_ty_4 { quadhd_io_num: bus.quadhd },
            ..Default::default()
        };
        self.host = bus.host as spi_host_device_t;
        esp!(unsafe { spi_bus_initialize(self.host, &config, spi_common_dma_t_SPI_DMA_CH_AUTO) })
            .map_err(driver_err("spi_bus_initialize"))
    }

    fn install_mac_phy(&mut self, device: &SpiDeviceConfig) -> Result<(), DriverError> {
        let mut spi_devcfg = spi_device_interface_config_t {
            mode: device.mode,
            clock_speed_hz: device.clock_hz as i32,
            spics_io_num: device.cs,
            queue_size: device.queue_size as i32,
            cs_ena_posttrans: device.cs_ena_posttrans,
            ..Default::default()
        };
        let enc28j60_config = eth_enc28j60_config_t {
            spi_host_id: self.host,
            spi_devcfg: &mut spi_devcfg,
            int_gpio_num: device.int,
            ..Default::default()
        };
        let mac_config = eth_mac_config_t {
            sw_reset_timeout_ms: 100,
            rx_task_stack_size: 4096,
            rx_task_prio: 15,
            ..Default::default()
        };
        let phy_config = eth_phy_config_t {
            phy_addr: -1,
            reset_timeout_ms: 100,
            // No auto-negotiation and no PHY reset pin on this chip
            autonego_timeout_ms: 0,
            reset_gpio_num: -1,
            ..Default::default()
        };

        let mac = unsafe { esp_eth_mac_new_enc28j60(&enc28j60_config, &mac_config) };
        let phy = unsafe { esp_eth_phy_new_enc28j60(&phy_config) };
        if mac.is_null() || phy.is_null() {
            return Err(DriverError::fail("esp_eth_mac_new_enc28j60"));
        }

        let eth_config = esp_eth_config_t {
            mac,
            phy,
            check_link_period_ms: 2000,
            ..Default::default()
        };
        let mut handle: esp_eth_handle_t = std::ptr::null_mut();
        esp!(unsafe { esp_eth_driver_install(&eth_config, &mut handle) }).map_err(driver_err("esp_eth_driver_install"))?;

        self.mac = mac;
        self.handle = handle;
        Ok(())
    }

    fn set_mac_addr(&mut self, mac: MacAddr) -> Result<(), DriverError> {
        self.installed("esp_eth_ioctl")?;
        let mut mac = mac;
        esp!(unsafe { esp_eth_ioctl(self.handle, eth_io_cmd_t_ETH_CMD_S_MAC_ADDR, mac.as_mut_ptr() as *mut c_void) })
            .map_err(driver_err("esp_eth_ioctl"))
    }

    fn chip_revision(&mut self) -> Result<ChipRevision, DriverError> {
        self.installed("emac_enc28j60_get_chip_info")?;
        let revision = unsafe { emac_enc28j60_get_chip_info(self.mac) };
        Ok(ChipRevision(revision as u8))
    }

    fn attach_netif(&mut self) -> Result<(), DriverError> {
        self.installed("esp_netif_attach")?;
        let netif = self
            .netif
            .as_ref()
            .ok_or(DriverError::new("esp_netif_attach", DriverError::NO_INTERFACE))?;
        esp!(unsafe { esp_netif_attach(netif.handle(), esp_eth_new_netif_glue(self.handle) as *mut c_void) })
            .map_err(driver_err("esp_netif_attach"))
    }

    fn subscribe(&mut self, handler: EthernetEventHandler) -> Result<(), DriverError> {
        // Never unregistered: Ethernet has no stop path.
        let arg = Box::into_raw(Box::new(handler)) as *mut c_void;
        esp!(unsafe { esp_event_handler_register(ETH_EVENT, ESP_EVENT_ANY_ID, Some(on_event), arg) })
            .map_err(driver_err("esp_event_handler_register"))?;
        esp!(unsafe {
            esp_event_handler_register(IP_EVENT, ip_event_t_IP_EVENT_ETH_GOT_IP as i32, Some(on_event), arg)
        })
        .map_err(driver_err("esp_event_handler_register"))
    }

    fn set_full_duplex(&mut self) -> Result<(), DriverError> {
        self.installed("esp_eth_ioctl")?;
        let mut duplex = eth_duplex_t_ETH_DUPLEX_FULL;
        esp!(unsafe {
            esp_eth_ioctl(
                self.handle,
                eth_io_cmd_t_ETH_CMD_S_DUPLEX_MODE,
                &mut duplex as *mut eth_duplex_t as *mut c_void,
            )
        })
        .map_err(driver_err("esp_eth_ioctl"))
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.installed("esp_eth_start")?;
        esp!(unsafe { esp_eth_start(self.handle) }).map_err(driver_err("esp_eth_start"))?;
        self.started = true;
        info!(target: "mbnode::eth", "ENC28J60 driver started");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}
