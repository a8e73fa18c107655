//! mbnode for ESP32
//!
//! This firmware brings up WiFi in station mode and an ENC28J60 Ethernet
//! port, then serves 50 holding and 50 input registers over Modbus TCP on
//! port 502. Every second holding registers go up by 1 and input registers
//! by 5.

mod ethernet;
mod wifi;

use esp_idf_svc::{eventloop::EspSystemEventLoop, hal::prelude::Peripherals};
use log::*;
use mbnode_core::app::LOOP_PERIOD;
use mbnode_core::{bring_up, run_register_loop, RegisterBank, Settings, Wifi};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("mbnode v{}", env!("CARGO_PKG_VERSION"));

    // The Modbus slave's tokio runtime polls through eventfd.
    esp_idf_svc::sys::esp!(unsafe {
        esp_idf_svc::sys::esp_vfs_eventfd_register(&esp_idf_svc::sys::esp_vfs_eventfd_config_t {
            max_fds: 5,
            ..Default::default()
        })
    })?;

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let settings = Settings::default();

    let mut wifi = Wifi::new(wifi::EspRadio::new(peripherals.modem, sys_loop), settings.wifi.clone());
    let mut eth = ethernet::Enc28j60::new();
    let bank = Arc::new(RegisterBank::new());

    // Any failure here aborts start-up, the device then resets.
    let _slave = bring_up(&mut wifi, &mut eth, &bank, &settings)?;

    run_register_loop(&bank, LOOP_PERIOD)
}
