// src/io/ble/mod.rs
//
// BLE transport variant. Wraps the platform GATT stack (btleplug) behind the
// GattOps surface, runs the session negotiator, and pumps notifications into
// the session event channel. Callback-driven throughout - no dedicated
// reader thread.

pub mod gatt;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::io::{DataSource, LinkMonitor, SerialEvent, SerialEventSender, SerialTransport, TransportError};
use gatt::{CharProps, CharacteristicMap, GattCharacteristic, GattNegotiator, GattOps, GattService, NegotiatedLink, NotifyKind, WriteQueue};

// ============================================================================
// Shared adapter state
// ============================================================================

struct BleAdapterState {
    manager: Option<Manager>,
    adapter: Option<Adapter>,
}

static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done.
async fn ensure_adapter() -> Result<(), String> {
    let mut state = BLE_ADAPTER.lock().await;
    if state.adapter.is_some() {
        return Ok(());
    }
    let manager = Manager::new()
        .await
        .map_err(|e| format!("BLE manager init failed: {e}"))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| format!("Failed to list BLE adapters: {e}"))?;
    let adapter = adapters.into_iter().next().ok_or("No BLE adapter found")?;
    state.adapter = Some(adapter);
    state.manager = Some(manager);
    Ok(())
}

async fn get_adapter() -> Result<Adapter, String> {
    let state = BLE_ADAPTER.lock().await;
    state
        .adapter
        .clone()
        .ok_or_else(|| "BLE adapter not initialised".to_string())
}

async fn lookup_peripheral(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, String> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| format!("Failed to list peripherals: {e}"))?;
    Ok(peripherals.into_iter().find(|p| {
        p.id().to_string() == address || p.address().to_string().eq_ignore_ascii_case(address)
    }))
}

/// Find a peripheral by platform id or MAC address, scanning for up to ~10
/// seconds if it is not already known to the adapter.
async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral, String> {
    if let Some(peripheral) = lookup_peripheral(adapter, address).await? {
        return Ok(peripheral);
    }
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| format!("Failed to start BLE scan: {e}"))?;
    for _ in 0..20 {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        if let Some(peripheral) = lookup_peripheral(adapter, address).await? {
            let _ = adapter.stop_scan().await;
            return Ok(peripheral);
        }
    }
    let _ = adapter.stop_scan().await;
    Err(format!("Device '{}' not found", address))
}

// ============================================================================
// GattOps over btleplug
// ============================================================================

/// The platform half of the negotiator: maps GattOps calls onto a connected
/// btleplug peripheral. Keeps the concrete characteristic handles recorded
/// during discovery for later subscribe/write calls.
struct PeripheralOps {
    peripheral: Peripheral,
    handles: StdMutex<HashMap<Uuid, Characteristic>>,
}

impl PeripheralOps {
    fn new(peripheral: Peripheral) -> PeripheralOps {
        PeripheralOps {
            peripheral,
            handles: StdMutex::new(HashMap::new()),
        }
    }

    fn handle_for(&self, uuid: Uuid) -> Result<Characteristic, String> {
        self.handles
            .lock()
            .expect("handle map poisoned")
            .get(&uuid)
            .cloned()
            .ok_or_else(|| format!("characteristic {} not discovered", uuid))
    }
}

#[async_trait]
impl GattOps for PeripheralOps {
    async fn discover_services(&self) -> Result<Vec<GattService>, String> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| format!("Failed to discover services: {e}"))?;
        let mut services = Vec::new();
        let mut handles = self.handles.lock().expect("handle map poisoned");
        for service in self.peripheral.services() {
            let mut characteristics = Vec::new();
            for characteristic in &service.characteristics {
                handles.insert(characteristic.uuid, characteristic.clone());
                characteristics.push(GattCharacteristic {
                    service: service.uuid,
                    uuid: characteristic.uuid,
                    properties: CharProps {
                        write: characteristic.properties.contains(CharPropFlags::WRITE),
                        write_without_response: characteristic
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                        notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
                        indicate: characteristic.properties.contains(CharPropFlags::INDICATE),
                    },
                });
            }
            services.push(GattService {
                uuid: service.uuid,
                characteristics,
            });
        }
        Ok(services)
    }

    async fn negotiate_mtu(&self, _requested: usize) -> Result<usize, String> {
        // The platform stack negotiates the MTU during connection and does
        // not expose an explicit request; the session falls back to the
        // default payload size and chunks accordingly.
        Err("MTU negotiation handled by platform stack".to_string())
    }

    async fn enable_change_events(
        &self,
        characteristic: &GattCharacteristic,
        _kind: NotifyKind,
    ) -> Result<(), String> {
        // subscribe() performs the CCC descriptor write, picking indication
        // or notification from the characteristic's advertised properties.
        let handle = self.handle_for(characteristic.uuid)?;
        self.peripheral
            .subscribe(&handle)
            .await
            .map_err(|e| format!("subscribe failed: {e}"))
    }

    async fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<(), String> {
        let handle = self.handle_for(characteristic.uuid)?;
        let write_type = if characteristic.properties.write {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&handle, data, write_type)
            .await
            .map_err(|e| format!("write failed: {e}"))
    }
}

// ============================================================================
// Transport
// ============================================================================

struct BleSession {
    peripheral: Peripheral,
    ops: Arc<PeripheralOps>,
    link: NegotiatedLink,
    queue: WriteQueue,
    listener: SerialEventSender,
    cancel: AtomicBool,
}

pub struct BleTransport {
    address: String,
    display_name: String,
    map: CharacteristicMap,
    session: Arc<Mutex<Option<Arc<BleSession>>>>,
    connecting: Arc<AtomicBool>,
}

impl BleTransport {
    pub fn new(address: &str, display_name: &str, map: CharacteristicMap) -> BleTransport {
        BleTransport {
            address: address.to_string(),
            display_name: display_name.to_string(),
            map,
            session: Arc::new(Mutex::new(None)),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SerialTransport for BleTransport {
    fn name(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else {
            self.display_name.clone()
        }
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError> {
        if self.session.lock().await.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        tlog!("[ble] connect {}", self.address);
        let address = self.address.clone();
        let map = self.map.clone();
        let session_slot = self.session.clone();
        let connecting = self.connecting.clone();
        tokio::spawn(async move {
            run_ble_session(address, map, listener, session_slot, connecting).await;
        });
        Ok(())
    }

    async fn disconnect(&mut self, silent: bool) {
        tlog!("[ble] disconnect {} (silent: {})", self.address, silent);
        self.connecting.store(false, Ordering::SeqCst);
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.cancel.store(true, Ordering::SeqCst);
            session.queue.clear();
            // Best-effort teardown - the peripheral may already be gone
            let _ = session.peripheral.disconnect().await;
            if !silent {
                let _ = session.listener.send(SerialEvent::Disconnected);
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let session = self
            .session
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        if session.cancel.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let target = session
            .link
            .map
            .write_target()
            .cloned()
            .ok_or_else(|| TransportError::Io("no write characteristic".to_string()))?;
        let mut item = session.queue.enqueue(data, &target, session.link.payload_size);
        while let Some(next) = item {
            if let Err(e) = session
                .ops
                .write_characteristic(&next.characteristic, &next.data)
                .await
            {
                session.queue.clear();
                let _ = session.listener.send(SerialEvent::IoError(e.clone()));
                return Err(TransportError::Io(e));
            }
            item = session.queue.complete_one();
        }
        Ok(())
    }
}

/// Establish the session, publish it for writers, then pump notifications
/// until cancellation or link loss.
async fn run_ble_session(
    address: String,
    map: CharacteristicMap,
    listener: SerialEventSender,
    session_slot: Arc<Mutex<Option<Arc<BleSession>>>>,
    connecting: Arc<AtomicBool>,
) {
    let established = establish(&address, map).await;
    let session = match established {
        Ok((peripheral, ops, link)) => Arc::new(BleSession {
            peripheral,
            ops,
            link,
            queue: WriteQueue::new(),
            listener: listener.clone(),
            cancel: AtomicBool::new(false),
        }),
        Err(message) => {
            tlog!("[ble] connect to {} failed: {}", address, message);
            connecting.store(false, Ordering::SeqCst);
            let _ = listener.send(SerialEvent::ConnectError(message));
            return;
        }
    };
    *session_slot.lock().await = Some(session.clone());
    connecting.store(false, Ordering::SeqCst);
    tlog!("[ble] connected to {}", address);
    let _ = listener.send(SerialEvent::Connected);

    pump_notifications(&session, &listener).await;

    // Late events after a disconnect are dropped, not acted on
    let mut slot = session_slot.lock().await;
    let is_current = slot
        .as_ref()
        .map(|current| Arc::ptr_eq(current, &session))
        .unwrap_or(false);
    if is_current {
        *slot = None;
    }
}

async fn establish(
    address: &str,
    map: CharacteristicMap,
) -> Result<(Peripheral, Arc<PeripheralOps>, NegotiatedLink), String> {
    ensure_adapter().await?;
    let adapter = get_adapter().await?;
    let peripheral = find_peripheral(&adapter, address).await?;
    peripheral
        .connect()
        .await
        .map_err(|e| format!("Failed to connect: {e}"))?;
    let ops = Arc::new(PeripheralOps::new(peripheral.clone()));
    let mut negotiator = GattNegotiator::new(map);
    match negotiator.negotiate(ops.as_ref()).await {
        Ok(link) => Ok((peripheral, ops, link)),
        Err(e) => {
            let _ = peripheral.disconnect().await;
            Err(e.to_string())
        }
    }
}

async fn pump_notifications(session: &Arc<BleSession>, listener: &SerialEventSender) {
    let mut stream = match session.peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = listener.send(SerialEvent::IoError(format!(
                "notification stream unavailable: {e}"
            )));
            return;
        }
    };
    let battery = session.link.map.battery().map(|c| c.uuid);
    let mut watchdog = tokio::time::interval(tokio::time::Duration::from_secs(2));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if session.cancel.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            notification = stream.next() => match notification {
                Some(notification) => {
                    if session.cancel.load(Ordering::SeqCst) {
                        return;
                    }
                    if battery == Some(notification.uuid) {
                        if let Some(&level) = notification.value.first() {
                            let _ = listener.send(SerialEvent::Battery(level));
                        }
                    } else if let Some(characteristic) =
                        session.link.map.read_characteristic(notification.uuid)
                    {
                        tlog!(
                            "[ble] read, len={}, data={}",
                            notification.value.len(),
                            hex::encode_upper(&notification.value)
                        );
                        let _ = listener.send(SerialEvent::Data {
                            data: notification.value,
                            source: DataSource::Characteristic {
                                service: characteristic.service,
                                characteristic: characteristic.uuid,
                            },
                        });
                    }
                }
                None => {
                    if !session.cancel.load(Ordering::SeqCst) {
                        let _ = listener.send(SerialEvent::IoError(
                            "notification stream ended".to_string(),
                        ));
                    }
                    return;
                }
            },
            _ = watchdog.tick() => {
                if session.cancel.load(Ordering::SeqCst) {
                    return;
                }
                let up = session.peripheral.is_connected().await.unwrap_or(false);
                if !up {
                    tlog!("[ble] watchdog: peripheral disconnected unexpectedly");
                    let _ = listener.send(SerialEvent::IoError("gatt link lost".to_string()));
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Link state
// ============================================================================

/// Reconnection guard: asks the platform whether the physical device is
/// still connected at the link level.
pub struct BleLinkMonitor;

#[async_trait]
impl LinkMonitor for BleLinkMonitor {
    async fn link_present(&self, address: &str) -> bool {
        if ensure_adapter().await.is_err() {
            return false;
        }
        let adapter = match get_adapter().await {
            Ok(adapter) => adapter,
            Err(_) => return false,
        };
        match lookup_peripheral(&adapter, address).await {
            Ok(Some(peripheral)) => peripheral.is_connected().await.unwrap_or(false),
            _ => false,
        }
    }
}
