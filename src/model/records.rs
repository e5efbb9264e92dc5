// src/model/records.rs
//
// Persisted records: the device table row binding a physical device to a
// driver, and the driver table row carrying a stored driver document.

use serde::{Deserialize, Serialize};

use super::driver::ConnectionType;

/// Physical device category. Bluetooth devices are addressed by MAC;
/// local devices get a synthesized identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Invalid,
    Bluetooth,
    Local,
}

impl DeviceType {
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceType::Invalid => "-",
            DeviceType::Bluetooth => "bluetooth",
            DeviceType::Local => "local",
        }
    }

    pub fn from_tag(value: &str) -> DeviceType {
        match value {
            "bluetooth" => DeviceType::Bluetooth,
            "local" => DeviceType::Local,
            _ => DeviceType::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != DeviceType::Invalid
    }
}

impl From<String> for DeviceType {
    fn from(value: String) -> Self {
        DeviceType::from_tag(&value)
    }
}

impl From<DeviceType> for String {
    fn from(value: DeviceType) -> Self {
        value.tag().to_string()
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

pub const AUTO_CONNECT_DEFAULT: bool = true;
pub const AUTO_RECONNECT_DEFAULT: bool = true;
pub const PTT_DOWN_DELAY_DEFAULT: u64 = 0;

/// A device record. Owned by the persistence layer; the pipeline only reads
/// it to parameterize a session (address, delay override, reconnect flags).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Row id; -1 until inserted.
    pub id: i64,
    pub device_type: DeviceType,
    pub name: String,
    /// MAC address for Bluetooth devices, serial device node or synthesized
    /// id for local ones.
    pub address: String,
    pub driver_id: i64,
    pub driver_name: String,
    pub auto_connect: bool,
    pub auto_reconnect: bool,
    /// User-chosen key-down delay (ms). Overrides the driver default.
    pub ptt_down_delay: u64,
}

impl Device {
    pub fn new(device_type: DeviceType, name: &str, address: &str) -> Device {
        Device {
            id: -1,
            device_type,
            name: name.to_string(),
            address: address.to_string(),
            driver_id: -1,
            driver_name: String::new(),
            auto_connect: AUTO_CONNECT_DEFAULT,
            auto_reconnect: AUTO_RECONNECT_DEFAULT,
            ptt_down_delay: PTT_DOWN_DELAY_DEFAULT,
        }
    }

    pub fn with_driver(mut self, driver_id: i64, driver_name: &str) -> Device {
        self.driver_id = driver_id;
        self.driver_name = driver_name.to_string();
        self
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// A stored driver document plus the columns extracted for lookup without a
/// full parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    /// Row id; -1 until inserted.
    pub id: i64,
    pub name: String,
    pub connection_type: ConnectionType,
    pub device_name_match: String,
    pub watch_for_device_name: Option<String>,
    /// The driver document verbatim.
    pub json: String,
}

impl DriverRecord {
    /// Build a record from a parsed, validated driver document.
    pub fn from_driver(driver: &crate::model::driver::PttDriver) -> Result<DriverRecord, String> {
        let json = driver.to_json_string()?;
        Ok(DriverRecord {
            id: -1,
            name: driver.driver_name.clone().unwrap_or_default(),
            connection_type: driver.connection_type.unwrap_or(ConnectionType::Invalid),
            device_name_match: driver.device_name.clone().unwrap_or_default(),
            watch_for_device_name: driver.watch_for_device_name.clone(),
            json,
        })
    }
}

impl std::fmt::Display for DriverRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.connection_type.human_readable())
    }
}
