// src/store.rs
//
// SQLite-backed storage for device and driver records. The core only reads
// records to parameterize sessions; the create path assigns the row id back
// onto the record after insert. Driver documents are stored verbatim with a
// few columns extracted for lookup without a full parse.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::model::{ConnectionType, Device, DeviceType, DriverRecord};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY,
    device_type TEXT NOT NULL DEFAULT 'bluetooth',
    name TEXT NOT NULL,
    address TEXT NOT NULL,
    driver_id INTEGER NOT NULL DEFAULT -1,
    auto_connect INTEGER NOT NULL DEFAULT 1,
    auto_reconnect INTEGER NOT NULL DEFAULT 1,
    ptt_down_delay INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS drivers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    connection_type TEXT NOT NULL,
    device_name_match TEXT NOT NULL DEFAULT '',
    watch_for_device_name TEXT,
    json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_devices_address ON devices (address);
CREATE INDEX IF NOT EXISTS idx_drivers_name ON drivers (name);
";

/// Record store. rusqlite::Connection is !Sync, so the connection sits
/// behind a Mutex.
pub struct DriverStore {
    conn: Mutex<Connection>,
}

impl DriverStore {
    pub fn open(path: &Path) -> Result<DriverStore, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data dir: {}", e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open record database: {}", e))?;
        DriverStore::init(conn)
    }

    pub fn open_in_memory() -> Result<DriverStore, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory database: {}", e))?;
        DriverStore::init(conn)
    }

    fn init(conn: Connection) -> Result<DriverStore, String> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| format!("Failed to set WAL mode: {}", e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("Failed to create schema: {}", e))?;
        Ok(DriverStore {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        work: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, String> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| format!("Record database mutex poisoned: {}", e))?;
        work(&conn).map_err(|e| format!("Record database error: {}", e))
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
        Ok(Device {
            id: row.get(0)?,
            device_type: DeviceType::from_tag(&row.get::<_, String>(1)?),
            name: row.get(2)?,
            address: row.get(3)?,
            driver_id: row.get(4)?,
            driver_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            auto_connect: row.get(6)?,
            auto_reconnect: row.get(7)?,
            ptt_down_delay: row.get::<_, i64>(8)?.max(0) as u64,
        })
    }

    const DEVICE_COLUMNS: &'static str = "d.id, d.device_type, d.name, d.address, d.driver_id, \
         (SELECT name FROM drivers WHERE drivers.id = d.driver_id), \
         d.auto_connect, d.auto_reconnect, d.ptt_down_delay";

    pub fn devices(&self) -> Result<Vec<Device>, String> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT {} FROM devices d ORDER BY d.id",
                Self::DEVICE_COLUMNS
            ))?;
            let rows = statement.query_map([], Self::device_from_row)?;
            rows.collect()
        })
    }

    pub fn device(&self, id: i64) -> Result<Option<Device>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM devices d WHERE d.id = ?1", Self::DEVICE_COLUMNS),
                params![id],
                Self::device_from_row,
            )
            .optional()
        })
    }

    pub fn device_by_address(&self, address: &str) -> Result<Option<Device>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM devices d WHERE d.address = ?1 COLLATE NOCASE",
                    Self::DEVICE_COLUMNS
                ),
                params![address],
                Self::device_from_row,
            )
            .optional()
        })
    }

    pub fn device_exists(&self, address: &str) -> Result<bool, String> {
        Ok(self.device_by_address(address)?.is_some())
    }

    /// Insert and assign the new row id onto the record.
    pub fn add_device(&self, device: &mut Device) -> Result<(), String> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (device_type, name, address, driver_id, auto_connect, auto_reconnect, ptt_down_delay) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    device.device_type.tag(),
                    device.name,
                    device.address,
                    device.driver_id,
                    device.auto_connect,
                    device.auto_reconnect,
                    device.ptt_down_delay as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        device.id = id;
        Ok(())
    }

    pub fn update_device(&self, device: &Device) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE devices SET device_type = ?2, name = ?3, address = ?4, driver_id = ?5, \
                 auto_connect = ?6, auto_reconnect = ?7, ptt_down_delay = ?8 WHERE id = ?1",
                params![
                    device.id,
                    device.device_type.tag(),
                    device.name,
                    device.address,
                    device.driver_id,
                    device.auto_connect,
                    device.auto_reconnect,
                    device.ptt_down_delay as i64,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn add_or_update_device(&self, device: &mut Device) -> Result<(), String> {
        match self.device_by_address(&device.address)? {
            Some(existing) => {
                device.id = existing.id;
                self.update_device(device)
            }
            None => self.add_device(device),
        }
    }

    pub fn remove_device(&self, id: i64) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM devices WHERE id = ?1", params![id])
                .map(|_| ())
        })
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    fn driver_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DriverRecord> {
        Ok(DriverRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            connection_type: ConnectionType::from_tag(&row.get::<_, String>(2)?),
            device_name_match: row.get(3)?,
            watch_for_device_name: row.get(4)?,
            json: row.get(5)?,
        })
    }

    const DRIVER_COLUMNS: &'static str =
        "id, name, connection_type, device_name_match, watch_for_device_name, json";

    pub fn drivers(&self) -> Result<Vec<DriverRecord>, String> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT {} FROM drivers ORDER BY id",
                Self::DRIVER_COLUMNS
            ))?;
            let rows = statement.query_map([], Self::driver_from_row)?;
            rows.collect()
        })
    }

    pub fn driver(&self, id: i64) -> Result<Option<DriverRecord>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM drivers WHERE id = ?1", Self::DRIVER_COLUMNS),
                params![id],
                Self::driver_from_row,
            )
            .optional()
        })
    }

    pub fn driver_by_name(&self, name: &str) -> Result<Option<DriverRecord>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM drivers WHERE name = ?1", Self::DRIVER_COLUMNS),
                params![name],
                Self::driver_from_row,
            )
            .optional()
        })
    }

    pub fn driver_exists(&self, name: &str) -> Result<bool, String> {
        Ok(self.driver_by_name(name)?.is_some())
    }

    pub fn add_driver(&self, driver: &mut DriverRecord) -> Result<(), String> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drivers (name, connection_type, device_name_match, watch_for_device_name, json) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    driver.name,
                    driver.connection_type.tag(),
                    driver.device_name_match,
                    driver.watch_for_device_name,
                    driver.json,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        driver.id = id;
        Ok(())
    }

    pub fn update_driver(&self, driver: &DriverRecord) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE drivers SET name = ?2, connection_type = ?3, device_name_match = ?4, \
                 watch_for_device_name = ?5, json = ?6 WHERE id = ?1",
                params![
                    driver.id,
                    driver.name,
                    driver.connection_type.tag(),
                    driver.device_name_match,
                    driver.watch_for_device_name,
                    driver.json,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn add_or_update_driver(&self, driver: &mut DriverRecord) -> Result<(), String> {
        match self.driver_by_name(&driver.name)? {
            Some(existing) => {
                driver.id = existing.id;
                self.update_driver(driver)
            }
            None => self.add_driver(driver),
        }
    }

    pub fn remove_driver(&self, id: i64) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM drivers WHERE id = ?1", params![id])
                .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PttDriver;

    fn sample_driver_record() -> DriverRecord {
        let driver = PttDriver::from_json_str(
            r#"{
                "name": "Test Mic", "deviceName": "TEST-MIC", "type": "spp",
                "read": {
                    "serialDataType": "ascii", "eol": "0D0A",
                    "pttDownKeyIntent": "a.b", "intentMap": {"A": "a.b"}
                }
            }"#,
        )
        .unwrap();
        DriverRecord::from_driver(&driver).unwrap()
    }

    #[test]
    fn test_device_round_trip() {
        let store = DriverStore::open_in_memory().unwrap();
        let mut device = Device::new(DeviceType::Bluetooth, "Mic", "00:11:22:33:44:55");
        device.ptt_down_delay = 150;
        store.add_device(&mut device).unwrap();
        assert!(device.id > 0, "insert assigns the row id");

        let loaded = store.device(device.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Mic");
        assert_eq!(loaded.address, "00:11:22:33:44:55");
        assert_eq!(loaded.ptt_down_delay, 150);
        assert!(loaded.auto_connect);
        assert!(loaded.auto_reconnect);

        // Natural-key lookup is case-insensitive on the address
        assert!(store.device_by_address("00:11:22:33:44:55").unwrap().is_some());
        assert!(store.device_exists("00:11:22:33:44:55").unwrap());
        assert!(!store.device_exists("ff:ff:ff:ff:ff:ff").unwrap());
    }

    #[test]
    fn test_device_join_carries_driver_name() {
        let store = DriverStore::open_in_memory().unwrap();
        let mut record = sample_driver_record();
        store.add_driver(&mut record).unwrap();

        let mut device = Device::new(DeviceType::Bluetooth, "Mic", "00:11:22:33:44:55")
            .with_driver(record.id, &record.name);
        store.add_device(&mut device).unwrap();

        let loaded = store.device(device.id).unwrap().unwrap();
        assert_eq!(loaded.driver_id, record.id);
        assert_eq!(loaded.driver_name, "Test Mic");
    }

    #[test]
    fn test_add_or_update_device_keys_on_address() {
        let store = DriverStore::open_in_memory().unwrap();
        let mut first = Device::new(DeviceType::Bluetooth, "Mic", "00:11:22:33:44:55");
        store.add_or_update_device(&mut first).unwrap();
        let mut second = Device::new(DeviceType::Bluetooth, "Renamed", "00:11:22:33:44:55");
        store.add_or_update_device(&mut second).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.devices().unwrap().len(), 1);
        assert_eq!(store.device(first.id).unwrap().unwrap().name, "Renamed");
    }

    #[test]
    fn test_driver_round_trip() {
        let store = DriverStore::open_in_memory().unwrap();
        let mut record = sample_driver_record();
        store.add_driver(&mut record).unwrap();
        assert!(record.id > 0);

        let loaded = store.driver_by_name("Test Mic").unwrap().unwrap();
        assert_eq!(loaded.connection_type, ConnectionType::Spp);
        assert_eq!(loaded.device_name_match, "TEST-MIC");

        // The stored document parses back to a valid driver
        let driver = PttDriver::from_json_str(&loaded.json).unwrap();
        assert!(driver.validate().is_empty());
    }

    #[test]
    fn test_remove() {
        let store = DriverStore::open_in_memory().unwrap();
        let mut record = sample_driver_record();
        store.add_driver(&mut record).unwrap();
        store.remove_driver(record.id).unwrap();
        assert!(store.driver(record.id).unwrap().is_none());

        let mut device = Device::new(DeviceType::Local, "Files", "local:1");
        store.add_device(&mut device).unwrap();
        store.remove_device(device.id).unwrap();
        assert!(store.device(device.id).unwrap().is_none());
    }
}
