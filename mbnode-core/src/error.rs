//! Error types shared by the orchestration modules

/// A call into a platform collaborator (WiFi stack, SPI, Ethernet driver) failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed (code {code})")]
pub struct DriverError {
    /// Name of the failed collaborator call
    pub op: &'static str,
    /// Platform error code (`esp_err_t` on ESP-IDF)
    pub code: i32,
}

impl DriverError {
    /// Generic failure code (`ESP_FAIL`)
    pub const FAIL: i32 = -1;
    /// Interface handle not found (`ESP_ERR_ESP_NETIF_INVALID_PARAMS`)
    pub const NO_INTERFACE: i32 = 0x5001;
    /// Radio driver not initialized (`ESP_ERR_WIFI_NOT_INIT`)
    pub const NOT_INIT: i32 = 0x3001;
    /// Radio not started (`ESP_ERR_WIFI_NOT_STARTED`)
    pub const NOT_STARTED: i32 = 0x3007;
    /// Station not associated (`ESP_ERR_WIFI_NOT_CONNECT`)
    pub const NOT_CONNECTED: i32 = 0x300f;

    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }

    pub fn fail(op: &'static str) -> Self {
        Self::new(op, Self::FAIL)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("SPI clock of {clock_mhz} MHz is below 8 MHz, required for chip revision {revision}")]
    Errata { revision: u8, clock_mhz: u32 },

    #[error("invalid register descriptor: {0}")]
    Descriptor(&'static str),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
