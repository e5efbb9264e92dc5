// src/model/driver.rs
//
// Driver descriptor model. A driver document is UTF-8 JSON describing one
// device's wire protocol: connection type, data encoding, intent mappings and
// de-duplication policy. Parsing is a single serde pass that skips unknown
// fields (forward compatibility); validation is a separate pure pass over the
// parsed descriptor that collects every violation instead of stopping at the
// first one.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Flat lookup-key -> event-name mapping table.
pub type IntentMap = BTreeMap<String, String>;

/// Named data-transform operations for filestream drivers.
pub type OperationsMap = BTreeMap<String, String>;

// ============================================================================
// Enumerations
// ============================================================================

/// Connection type tag versioning the descriptor. Unknown tags parse to
/// `Invalid` and are rejected by validation, not by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionType {
    Invalid,
    Ble,
    BleSerial,
    Spp,
    Hfp,
    Filestream,
}

impl ConnectionType {
    pub fn tag(&self) -> &'static str {
        match self {
            ConnectionType::Invalid => "-",
            ConnectionType::Ble => "ble",
            ConnectionType::BleSerial => "ble-serial",
            ConnectionType::Spp => "spp",
            ConnectionType::Hfp => "hfp",
            ConnectionType::Filestream => "filestream",
        }
    }

    pub fn from_tag(value: &str) -> ConnectionType {
        match value {
            "ble" => ConnectionType::Ble,
            "ble-serial" => ConnectionType::BleSerial,
            "spp" => ConnectionType::Spp,
            "hfp" => ConnectionType::Hfp,
            "filestream" => ConnectionType::Filestream,
            _ => ConnectionType::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != ConnectionType::Invalid
    }

    pub fn human_readable(&self) -> &'static str {
        match self {
            ConnectionType::Invalid => "Invalid",
            ConnectionType::Ble => "BLE",
            ConnectionType::BleSerial => "BLE Serial",
            ConnectionType::Spp => "Serial",
            ConnectionType::Hfp => "Hands-Free",
            ConnectionType::Filestream => "Local Filestream",
        }
    }
}

impl From<String> for ConnectionType {
    fn from(value: String) -> Self {
        ConnectionType::from_tag(&value)
    }
}

impl From<ConnectionType> for String {
    fn from(value: ConnectionType) -> Self {
        value.tag().to_string()
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Serial payload encoding: ASCII text or hex-encoded binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Invalid,
    Ascii,
    Hex,
}

impl DataType {
    pub fn tag(&self) -> &'static str {
        match self {
            DataType::Invalid => "-",
            DataType::Ascii => "ascii",
            DataType::Hex => "hex",
        }
    }

    pub fn from_tag(value: &str) -> DataType {
        match value {
            "ascii" => DataType::Ascii,
            "hex" => DataType::Hex,
            _ => DataType::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != DataType::Invalid
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        DataType::from_tag(&value)
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.tag().to_string()
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// Validation report
// ============================================================================

/// All violations found in a descriptor, grouped by section (`driver`,
/// `read`, `write`, `files[n]`) in document order. Never a single opaque
/// failure - a user gets every problem at once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    sections: BTreeMap<String, Vec<String>>,
}

impl ValidationReport {
    pub fn push(&mut self, section: &str, message: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|msgs| msgs.is_empty())
    }

    pub fn sections(&self) -> &BTreeMap<String, Vec<String>> {
        &self.sections
    }

    pub fn messages(&self, section: &str) -> &[String] {
        self.sections.get(section).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (section, messages) in &self.sections {
            for message in messages {
                writeln!(f, "{}: {}", section, message)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Lenient field deserializers
// ============================================================================

/// UUID fields tolerate malformed values: a bad UUID string parses to `None`
/// and validation reports the missing field, mirroring how malformed fields
/// are skipped elsewhere.
fn lenient_uuid<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match Uuid::parse_str(&value) {
        Ok(uuid) => Some(uuid),
        Err(_) => {
            tlog!("[driver] Failed to parse UUID: {}", value);
            None
        }
    }))
}

/// A null mapping table reads as empty, like any other absent field.
fn lenient_intent_map<'de, D>(deserializer: D) -> Result<IntentMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IntentMap>::deserialize(deserializer)?.unwrap_or_default())
}

/// Characteristic map keys are UUIDs; entries with malformed keys are dropped
/// rather than failing the whole document.
fn lenient_uuid_map<'de, D>(
    deserializer: D,
) -> Result<Option<BTreeMap<Uuid, IntentMap>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, IntentMap>>::deserialize(deserializer)?;
    Ok(raw.map(|map| {
        map.into_iter()
            .filter_map(|(key, value)| match Uuid::parse_str(&key) {
                Ok(uuid) => Some((uuid, value)),
                Err(e) => {
                    tlog!("[driver] Could not insert intent map for '{}': {}", key, e);
                    None
                }
            })
            .collect()
    }))
}

// ============================================================================
// Descriptor objects
// ============================================================================

/// The `write` object: where and how to send bytes to the device, plus the
/// optional start command issued once the session is connected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSpec {
    #[serde(deserialize_with = "lenient_uuid", skip_serializing_if = "Option::is_none")]
    pub service: Option<Uuid>,
    #[serde(deserialize_with = "lenient_uuid", skip_serializing_if = "Option::is_none")]
    pub characteristic: Option<Uuid>,
    #[serde(rename = "startCmdStr", skip_serializing_if = "Option::is_none")]
    pub start_cmd: Option<String>,
    #[serde(rename = "startCmdStrType", skip_serializing_if = "Option::is_none")]
    pub start_cmd_type: Option<DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eol: Option<String>,
    #[serde(rename = "serialDataType", skip_serializing_if = "Option::is_none")]
    pub serial_data_type: Option<DataType>,
    #[serde(rename = "intentMap", skip_serializing_if = "Option::is_none")]
    pub intent_map: Option<IntentMap>,
}

impl WriteSpec {
    fn validate(&self, report: &mut ValidationReport) {
        if let (Some(cmd), Some(DataType::Hex)) = (&self.start_cmd, self.start_cmd_type) {
            if hex::decode(cmd).is_err() {
                report.push(
                    "write",
                    format!("'startCmdStr' of '{}' is not valid hex", cmd),
                );
            }
        }
    }
}

/// One watched file of a filestream driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEntry {
    #[serde(rename = "filename", skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "preprocess", skip_serializing_if = "Option::is_none")]
    pub preprocess: Option<String>,
    #[serde(rename = "intentMap", skip_serializing_if = "Option::is_none")]
    pub intent_map: Option<IntentMap>,
}

impl FileEntry {
    fn validate(&self, section: &str, report: &mut ValidationReport) {
        match &self.filename {
            None => report.push(section, "'filename' must not be null for a file object"),
            Some(name) if name.is_empty() => {
                report.push(section, "'filename' must not be empty")
            }
            _ => {}
        }
        match &self.preprocess {
            None => report.push(section, "'preprocess' must not be null for a file object"),
            Some(op) if op.is_empty() => report.push(section, "'preprocess' must not be empty"),
            _ => {}
        }
        match &self.intent_map {
            None => report.push(section, "'intentMap' must not be null for a file object"),
            Some(map) if map.is_empty() => {
                report.push(section, "'intentMap' must not be empty")
            }
            _ => {}
        }
    }
}

/// The `read` object: where incoming data arrives, how it decodes to a lookup
/// key, the mapping table(s), and the de-duplication / key-down-delay policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSpec {
    #[serde(deserialize_with = "lenient_uuid", skip_serializing_if = "Option::is_none")]
    pub service: Option<Uuid>,
    #[serde(deserialize_with = "lenient_uuid", skip_serializing_if = "Option::is_none")]
    pub characteristic: Option<Uuid>,
    #[serde(rename = "pttDownKeyIntent", skip_serializing_if = "Option::is_none")]
    pub ptt_down_key_intent: Option<String>,
    #[serde(rename = "defaultPttDownKeyDelay")]
    pub default_ptt_down_key_delay: u64,
    #[serde(rename = "intentDeDuplicate")]
    pub intent_de_duplicate: bool,
    #[serde(rename = "intentDeDuplicateTimeout")]
    pub intent_de_duplicate_timeout: u64,
    #[serde(rename = "intentsDeDuplicateNoTimeout")]
    pub intents_de_duplicate_no_timeout: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eol: Option<String>,
    #[serde(rename = "serialDataType", skip_serializing_if = "Option::is_none")]
    pub serial_data_type: Option<DataType>,
    #[serde(
        rename = "intentMap",
        deserialize_with = "lenient_intent_map",
        skip_serializing_if = "IntentMap::is_empty"
    )]
    pub intent_map: IntentMap,
    #[serde(
        rename = "characteristicMaps",
        deserialize_with = "lenient_uuid_map",
        skip_serializing_if = "Option::is_none"
    )]
    pub characteristic_maps: Option<BTreeMap<Uuid, IntentMap>>,
    #[serde(rename = "operations", skip_serializing_if = "Option::is_none")]
    pub operations: Option<OperationsMap>,
    #[serde(rename = "files", skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
}

impl Default for ReadSpec {
    fn default() -> Self {
        ReadSpec {
            service: None,
            characteristic: None,
            ptt_down_key_intent: None,
            default_ptt_down_key_delay: 0,
            intent_de_duplicate: true,
            intent_de_duplicate_timeout: 50,
            intents_de_duplicate_no_timeout: Vec::new(),
            eol: None,
            serial_data_type: None,
            intent_map: IntentMap::new(),
            characteristic_maps: None,
            operations: None,
            files: None,
        }
    }
}

impl ReadSpec {
    /// EOL marker as raw bytes. The marker is stored hex-encoded in driver
    /// documents ("0D0A"); a string that is not a hex literal is taken as the
    /// marker bytes themselves.
    pub fn eol_bytes(&self) -> Option<Vec<u8>> {
        self.eol.as_deref().map(decode_marker)
    }

    fn characteristic_maps_empty(&self) -> bool {
        match &self.characteristic_maps {
            None => true,
            Some(maps) => maps.is_empty() || maps.values().all(|m| m.is_empty()),
        }
    }

    fn validate(&self, connection_type: Option<ConnectionType>, report: &mut ValidationReport) {
        // Fields required for every connection type
        if self.ptt_down_key_intent.is_none() {
            report.push("read", "'pttDownKeyIntent' must not be null");
        }
        match self.serial_data_type {
            None => report.push("read", "'serialDataType' must not be null"),
            Some(data_type) if !data_type.is_valid() => report.push(
                "read",
                format!("'serialDataType' of '{}' is invalid", data_type),
            ),
            _ => {}
        }
        if self.serial_data_type == Some(DataType::Ascii) && self.eol.is_none() {
            report.push(
                "read",
                "'eol' must not be null for 'serialDataType' of 'ascii'",
            );
        }

        let connection_type = match connection_type {
            Some(ct) => ct,
            None => return,
        };
        match connection_type {
            ConnectionType::Ble => {
                if self.service.is_none() {
                    report.push("read", "'service' must not be null");
                }
                if self.characteristic.is_some() {
                    if self.intent_map.is_empty() {
                        report.push(
                            "read",
                            "'intentMap' must not be empty for type of 'ble' with 'characteristic' defined",
                        );
                    }
                } else if self.characteristic_maps.is_none() {
                    report.push("read", "'characteristicMaps' must not be null for type of 'ble'");
                } else if self.characteristic_maps_empty() {
                    report.push("read", "'characteristicMaps' must not be empty");
                }
            }
            ConnectionType::BleSerial => {
                if self.service.is_none() {
                    report.push("read", "'service' must not be null");
                }
                if self.characteristic.is_none() {
                    report.push("read", "'characteristic' must not be null");
                }
                if self.intent_map.is_empty() {
                    report.push(
                        "read",
                        "'intentMap' must not be empty for type of 'ble-serial'",
                    );
                }
            }
            ConnectionType::Spp | ConnectionType::Hfp => {
                if self.intent_map.is_empty() {
                    report.push(
                        "read",
                        format!("'intentMap' must not be empty for type of '{}'", connection_type),
                    );
                }
                if connection_type == ConnectionType::Hfp
                    && self.serial_data_type != Some(DataType::Ascii)
                {
                    report.push("read", "'serialDataType' must be 'ascii' for type of 'hfp'");
                }
            }
            ConnectionType::Filestream => {
                match &self.operations {
                    None => report.push(
                        "read",
                        "'operations' must not be null for type of 'filestream'",
                    ),
                    Some(ops) if ops.is_empty() => {
                        report.push("read", "'operations' must not be empty")
                    }
                    _ => {}
                }
                match &self.files {
                    None => {
                        report.push("read", "'files' must not be null for type of 'filestream'")
                    }
                    Some(files) if files.is_empty() => {
                        report.push("read", "'files' must not be empty")
                    }
                    Some(files) => {
                        for (idx, file) in files.iter().enumerate() {
                            file.validate(&format!("files[{}]", idx), report);
                        }
                    }
                }
            }
            ConnectionType::Invalid => {}
        }
    }
}

/// Decode an EOL / marker string: hex literal if it parses as one, otherwise
/// the literal bytes.
pub fn decode_marker(marker: &str) -> Vec<u8> {
    if marker.len() >= 2 && marker.len() % 2 == 0 && marker.chars().all(|c| c.is_ascii_hexdigit())
    {
        if let Ok(bytes) = hex::decode(marker) {
            return bytes;
        }
    }
    marker.as_bytes().to_vec()
}

// ============================================================================
// Driver descriptor
// ============================================================================

/// A parsed driver document. Immutable once loaded; a session holds it for
/// its whole lifetime and a configuration change means a fresh parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PttDriver {
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
    #[serde(rename = "deviceName", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(rename = "watchForDeviceName", skip_serializing_if = "Option::is_none")]
    pub watch_for_device_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
    #[serde(rename = "write", skip_serializing_if = "Option::is_none")]
    pub write: Option<WriteSpec>,
    #[serde(rename = "read", skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadSpec>,
}

impl PttDriver {
    pub fn from_json_str(json: &str) -> Result<PttDriver, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse driver document: {}", e))
    }

    pub fn from_file(path: &Path) -> Result<PttDriver, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        PttDriver::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to serialise driver: {}", e))
    }

    /// The read object; empty default when the document had none. Validation
    /// rejects such a document, so post-validation callers always see the
    /// real read object.
    pub fn read_spec(&self) -> ReadSpec {
        self.read.clone().unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Evaluate every validation rule, collecting all violations grouped by
    /// section. Rules are keyed by connection type (see the read object).
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        if self.driver_name.is_none() {
            report.push("driver", "'name' must not be null");
        }
        if self.device_name.is_none() {
            report.push("driver", "'deviceName' must not be null");
        }
        match self.connection_type {
            None => report.push("driver", "'type' must not be null"),
            Some(ct) if !ct.is_valid() => {
                report.push("driver", "'type' is not a known connection type")
            }
            _ => {}
        }
        if let Some(write) = &self.write {
            write.validate(&mut report);
        }
        match &self.read {
            None => report.push("driver", "'read' must not be null"),
            Some(read) => read.validate(self.connection_type, &mut report),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPP_DRIVER: &str = r#"{
        "name": "Example Speaker Mic",
        "deviceName": "EXAMPLE-MIC",
        "type": "spp",
        "read": {
            "serialDataType": "ascii",
            "eol": "0D0A",
            "pttDownKeyIntent": "com.example.ptt.down",
            "intentMap": {
                "+PTT=P": "com.example.ptt.down",
                "+PTT=R": "com.example.ptt.up"
            }
        }
    }"#;

    #[test]
    fn test_parse_spp_driver() {
        let driver = PttDriver::from_json_str(SPP_DRIVER).unwrap();
        assert_eq!(driver.connection_type, Some(ConnectionType::Spp));
        assert_eq!(driver.driver_name.as_deref(), Some("Example Speaker Mic"));
        let read = driver.read_spec();
        assert_eq!(read.serial_data_type, Some(DataType::Ascii));
        assert_eq!(read.eol_bytes(), Some(vec![0x0d, 0x0a]));
        assert_eq!(
            read.intent_map.get("+PTT=P").map(String::as_str),
            Some("com.example.ptt.down")
        );
        // Defaults from the read object
        assert!(read.intent_de_duplicate);
        assert_eq!(read.intent_de_duplicate_timeout, 50);
        assert!(driver.validate().is_empty());
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "spp",
            "futureFeature": {"nested": [1, 2, 3]},
            "read": {
                "serialDataType": "ascii", "eol": "0A",
                "pttDownKeyIntent": "a.b", "intentMap": {"X": "a.b"},
                "someNewKnob": 42
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        assert!(driver.validate().is_empty());
    }

    #[test]
    fn test_null_intent_map_reads_as_empty() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "spp",
            "read": {
                "serialDataType": "ascii", "eol": "0A",
                "pttDownKeyIntent": "a.b", "intentMap": null
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        assert!(driver.read_spec().intent_map.is_empty());
        assert!(!driver.validate().is_empty());
    }

    #[test]
    fn test_bundled_driver_documents_validate() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("drivers");
        let mut seen = 0;
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let driver = PttDriver::from_file(&path).unwrap();
                let report = driver.validate();
                assert!(report.is_empty(), "{}: {}", path.display(), report);
                seen += 1;
            }
        }
        assert!(seen >= 3);
    }

    #[test]
    fn test_unknown_type_is_invalid_not_parse_error() {
        let json = r#"{"name": "D", "deviceName": "N", "type": "quantum", "read": {}}"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        assert_eq!(driver.connection_type, Some(ConnectionType::Invalid));
        let report = driver.validate();
        assert!(report
            .messages("driver")
            .iter()
            .any(|m| m.contains("'type'")));
    }

    #[test]
    fn test_malformed_uuid_tolerated() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "ble-serial",
            "read": {
                "service": "not-a-uuid",
                "characteristic": "0000ffe1-0000-1000-8000-00805f9b34fb",
                "serialDataType": "hex",
                "pttDownKeyIntent": "a.b",
                "intentMap": {"01": "a.b"}
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let read = driver.read_spec();
        assert!(read.service.is_none());
        assert!(read.characteristic.is_some());
        // The dropped UUID surfaces as a missing-service violation
        assert!(driver
            .validate()
            .messages("read")
            .iter()
            .any(|m| m.contains("'service'")));
    }

    #[test]
    fn test_ble_with_characteristic_requires_flat_map() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "ble",
            "read": {
                "service": "0000ffe0-0000-1000-8000-00805f9b34fb",
                "characteristic": "0000ffe1-0000-1000-8000-00805f9b34fb",
                "serialDataType": "hex",
                "pttDownKeyIntent": "a.b"
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let report = driver.validate();
        assert!(report
            .messages("read")
            .iter()
            .any(|m| m.contains("'intentMap'")));
    }

    #[test]
    fn test_ble_without_characteristic_requires_characteristic_maps() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "ble",
            "read": {
                "service": "0000ffe0-0000-1000-8000-00805f9b34fb",
                "serialDataType": "hex",
                "pttDownKeyIntent": "a.b",
                "characteristicMaps": {
                    "0000ffe1-0000-1000-8000-00805f9b34fb": {}
                }
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let report = driver.validate();
        // A characteristic map whose every entry is empty counts as empty
        assert!(report
            .messages("read")
            .iter()
            .any(|m| m.contains("'characteristicMaps' must not be empty")));
    }

    #[test]
    fn test_hfp_requires_ascii() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "hfp",
            "read": {
                "serialDataType": "hex",
                "pttDownKeyIntent": "a.b",
                "intentMap": {"01": "a.b"}
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let report = driver.validate();
        assert!(report
            .messages("read")
            .iter()
            .any(|m| m.contains("must be 'ascii'")));
    }

    #[test]
    fn test_all_violations_collected() {
        let driver = PttDriver::from_json_str(r#"{"type": "spp", "read": {}}"#).unwrap();
        let report = driver.validate();
        assert!(report.messages("driver").len() >= 2, "name and deviceName");
        // pttDownKeyIntent, serialDataType, intentMap all reported together
        assert!(report.messages("read").len() >= 3);
    }

    #[test]
    fn test_filestream_validation() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "filestream",
            "read": {
                "serialDataType": "ascii", "eol": "0A",
                "pttDownKeyIntent": "a.b",
                "operations": {"readKey": "utf8 | line | trim"},
                "files": [
                    {"filename": "/tmp/dev-events", "preprocess": "readKey",
                     "intentMap": {"down": "a.b"}},
                    {"filename": "", "preprocess": "readKey", "intentMap": {"x": "y"}}
                ]
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let report = driver.validate();
        assert!(report.messages("files[0]").is_empty());
        assert!(report
            .messages("files[1]")
            .iter()
            .any(|m| m.contains("'filename' must not be empty")));
    }

    #[test]
    fn test_round_trip_validation_equivalent() {
        let driver = PttDriver::from_json_str(SPP_DRIVER).unwrap();
        let json = driver.to_json_string().unwrap();
        let reparsed = PttDriver::from_json_str(&json).unwrap();
        assert_eq!(driver.validate(), reparsed.validate());
        assert_eq!(driver.read_spec().intent_map, reparsed.read_spec().intent_map);
        assert_eq!(driver.connection_type, reparsed.connection_type);

        // An invalid descriptor stays invalid across a round trip
        let invalid = PttDriver::from_json_str(r#"{"name": "D", "type": "spp", "read": {}}"#).unwrap();
        let rejson = invalid.to_json_string().unwrap();
        let reparsed = PttDriver::from_json_str(&rejson).unwrap();
        assert_eq!(invalid.validate(), reparsed.validate());
    }

    #[test]
    fn test_decode_marker() {
        assert_eq!(decode_marker("0D0A"), vec![0x0d, 0x0a]);
        assert_eq!(decode_marker("0a"), vec![0x0a]);
        assert_eq!(decode_marker("\r\n"), b"\r\n".to_vec());
        assert_eq!(decode_marker(";"), b";".to_vec());
    }
}
