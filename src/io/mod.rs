// src/io/mod.rs
//
// Serial transport abstraction. Four interchangeable variants (BLE GATT,
// SPP, HFP-over-RFCOMM, local filestream) satisfy one contract: connect is
// asynchronous, and success/failure plus incoming data are reported through
// the session event channel, never as direct return values - the underlying
// transports are inherently event-driven.

pub mod ble;
mod error;
pub mod filestream;
pub mod hfp;
pub mod spp;

pub use error::TransportError;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{ConnectionType, Device, PttDriver};

// ============================================================================
// Session events
// ============================================================================

/// Where a chunk of incoming data came from. BLE tags data with the
/// delivering characteristic (per-characteristic intent maps key on it);
/// filestream tags it with the watched file.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// A plain byte stream (SPP, HFP).
    Stream,
    Characteristic { service: Uuid, characteristic: Uuid },
    File(String),
}

/// Events a transport reports to its session.
#[derive(Debug, Clone)]
pub enum SerialEvent {
    Connected,
    /// Negotiation or connect failed before the session was up.
    ConnectError(String),
    /// Orderly disconnect (transport-initiated or remote).
    Disconnected,
    Data { data: Vec<u8>, source: DataSource },
    /// Battery level 0-100, from the auto-detected battery service.
    Battery(u8),
    /// Failure after the session was up.
    IoError(String),
}

pub type SerialEventSender = mpsc::UnboundedSender<SerialEvent>;
pub type SerialEventReceiver = mpsc::UnboundedReceiver<SerialEvent>;

pub fn serial_event_channel() -> (SerialEventSender, SerialEventReceiver) {
    mpsc::unbounded_channel()
}

// ============================================================================
// Transport contract
// ============================================================================

/// The capability every transport variant exposes. One instance backs one
/// session; a reconnect builds a fresh transport.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    fn name(&self) -> String;

    fn address(&self) -> String;

    /// Begin connecting. Returns `AlreadyConnected` if a session is in
    /// flight; all other outcomes (including connect failure) arrive as
    /// events on `listener`.
    async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError>;

    /// Tear the session down. Teardown always completes - transport errors
    /// while closing are swallowed. When `silent`, the final `Disconnected`
    /// event is suppressed (used when the caller is already handling the
    /// disconnect).
    async fn disconnect(&mut self, silent: bool);

    /// Write bytes to the device. Fails with `NotConnected` before the
    /// session is up.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Offer the variant data that matched no intent mapping. HFP answers
    /// protocol chatter here; other variants ignore it. Returns true if the
    /// data was consumed.
    async fn handle_unmapped(&self, _data: &[u8]) -> bool {
        false
    }
}

// ============================================================================
// Link state capability
// ============================================================================

/// Injected "is the physical link still up" query used by reconnection
/// policy. Session-level disconnection without link-level disconnection is
/// the failure mode auto-reconnect exists for; when the physical link is
/// gone too, the policy waits for the link to come back instead of polling.
#[async_trait]
pub trait LinkMonitor: Send + Sync {
    async fn link_present(&self, address: &str) -> bool;
}

/// Monitor for transports with no meaningful link state (filestream, tests).
pub struct AlwaysPresent;

#[async_trait]
impl LinkMonitor for AlwaysPresent {
    async fn link_present(&self, _address: &str) -> bool {
        true
    }
}

// ============================================================================
// Variant selection
// ============================================================================

/// Build the transport variant selected by the driver's connection type.
/// The driver must already have passed validation.
pub fn build_transport(
    driver: &PttDriver,
    device: &Device,
) -> Result<Box<dyn SerialTransport>, TransportError> {
    let connection_type = driver
        .connection_type
        .ok_or_else(|| TransportError::Connect("driver has no connection type".to_string()))?;
    match connection_type {
        ConnectionType::Ble | ConnectionType::BleSerial => {
            let map = ble::gatt::CharacteristicMap::from_driver(driver)
                .map_err(TransportError::Connect)?;
            Ok(Box::new(ble::BleTransport::new(
                &device.address,
                &device.name,
                map,
            )))
        }
        ConnectionType::Spp => Ok(Box::new(spp::SppTransport::new(
            &device.address,
            &device.name,
        ))),
        ConnectionType::Hfp => Ok(Box::new(hfp::HfpTransport::new(
            &device.address,
            &device.name,
        ))),
        ConnectionType::Filestream => {
            let files: Vec<String> = driver
                .read_spec()
                .files
                .unwrap_or_default()
                .into_iter()
                .filter_map(|f| f.filename)
                .collect();
            Ok(Box::new(filestream::FilestreamTransport::new(
                &device.address,
                &device.name,
                files,
            )))
        }
        ConnectionType::Invalid => {
            Err(TransportError::Connect("invalid connection type".to_string()))
        }
    }
}

/// Build the link monitor matching a connection type.
pub fn build_link_monitor(connection_type: ConnectionType) -> std::sync::Arc<dyn LinkMonitor> {
    match connection_type {
        ConnectionType::Ble | ConnectionType::BleSerial => {
            std::sync::Arc::new(ble::BleLinkMonitor)
        }
        ConnectionType::Spp | ConnectionType::Hfp => std::sync::Arc::new(spp::SerialPortMonitor),
        _ => std::sync::Arc::new(AlwaysPresent),
    }
}
