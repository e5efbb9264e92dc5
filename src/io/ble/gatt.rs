// src/io/ble/gatt.rs
//
// GATT session negotiation. Drives the connect -> service discovery -> MTU ->
// characteristic setup -> descriptor setup -> connected sequence over an
// injected set of platform GATT primitives, and owns the characteristic
// bookkeeping plus the serialized write queue. The platform allows one
// outstanding GATT operation, so descriptor enables and writes are strictly
// sequential.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::io::TransportError;
use crate::model::{ConnectionType, PttDriver};

/// Build a 128-bit UUID from the 5-field textual encoding.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Standard battery service/characteristic, auto-detected during discovery
/// independent of the driver descriptor.
pub const BATTERY_SERVICE: Uuid = uuid_from_fields(0x0000180f, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid =
    uuid_from_fields(0x00002a19, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);

/// BLE 4.2 devices commonly support 251; the platform caps at 512.
pub const MAX_MTU: usize = 512;
pub const DEFAULT_MTU: usize = 23;
/// ATT write overhead subtracted from the MTU.
const ATT_OVERHEAD: usize = 3;

// ============================================================================
// Platform primitive surface
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProps,
}

#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Notification,
    Indication,
}

/// The platform GATT primitives the negotiator drives. One outstanding
/// operation at a time is the caller's responsibility; the negotiator and
/// write queue uphold it structurally.
#[async_trait]
pub trait GattOps: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<GattService>, String>;

    /// Request a larger MTU. Implementations report `Err` when the platform
    /// does not expose negotiation; the session proceeds with the default
    /// either way.
    async fn negotiate_mtu(&self, requested: usize) -> Result<usize, String>;

    /// Enable change notifications on a read characteristic - the
    /// client-characteristic-configuration descriptor write.
    async fn enable_change_events(
        &self,
        characteristic: &GattCharacteristic,
        kind: NotifyKind,
    ) -> Result<(), String>;

    async fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<(), String>;
}

// ============================================================================
// Characteristic bookkeeping
// ============================================================================

/// The read/write identifiers a driver declares, and the concrete
/// characteristic handles recorded for them during service discovery.
#[derive(Debug, Clone, Default)]
pub struct CharacteristicMap {
    read: BTreeMap<Uuid, BTreeSet<Uuid>>,
    write: BTreeMap<Uuid, BTreeSet<Uuid>>,
    resolved_read: Vec<GattCharacteristic>,
    resolved_write: Vec<GattCharacteristic>,
    battery: Option<GattCharacteristic>,
}

impl CharacteristicMap {
    pub fn new() -> CharacteristicMap {
        CharacteristicMap::default()
    }

    /// Declared read/write targets from a validated driver descriptor.
    pub fn from_driver(driver: &PttDriver) -> Result<CharacteristicMap, String> {
        let read = driver.read_spec();
        let mut map = CharacteristicMap::new();
        let service = read
            .service
            .ok_or_else(|| "driver has no read service".to_string())?;
        match (driver.connection_type, read.characteristic) {
            (Some(ConnectionType::Ble), None) => {
                let maps = read
                    .characteristic_maps
                    .as_ref()
                    .ok_or_else(|| "driver has no characteristic maps".to_string())?;
                for characteristic in maps.keys() {
                    map.add_read(service, *characteristic);
                }
            }
            (_, Some(characteristic)) => {
                map.add_read(service, characteristic);
            }
            (_, None) => return Err("driver has no read characteristic".to_string()),
        }
        if let Some(write) = &driver.write {
            if let (Some(service), Some(characteristic)) = (write.service, write.characteristic) {
                map.add_write(service, characteristic);
            }
        }
        Ok(map)
    }

    pub fn add_read(&mut self, service: Uuid, characteristic: Uuid) {
        self.read.entry(service).or_default().insert(characteristic);
    }

    pub fn add_write(&mut self, service: Uuid, characteristic: Uuid) {
        self.write.entry(service).or_default().insert(characteristic);
    }

    pub fn is_read_characteristic(&self, characteristic: Uuid) -> bool {
        self.resolved_read.iter().any(|c| c.uuid == characteristic)
    }

    pub fn read_characteristic(&self, characteristic: Uuid) -> Option<&GattCharacteristic> {
        self.resolved_read.iter().find(|c| c.uuid == characteristic)
    }

    /// The write target: the first resolved write characteristic.
    pub fn write_target(&self) -> Option<&GattCharacteristic> {
        self.resolved_write.first()
    }

    pub fn battery(&self) -> Option<&GattCharacteristic> {
        self.battery.as_ref()
    }

    pub fn resolved_read(&self) -> &[GattCharacteristic] {
        &self.resolved_read
    }

    pub fn resolved_write(&self) -> &[GattCharacteristic] {
        &self.resolved_write
    }

    /// Walk discovered services, recording concrete handles for every
    /// declared target and auto-detecting the battery service. Returns how
    /// many targets matched.
    fn resolve(&mut self, services: &[GattService]) -> usize {
        let mut matched = 0;
        for service in services {
            tlog!("[gatt] service {}", service.uuid);
            if let Some(wanted) = self.read.get(&service.uuid) {
                for characteristic in &service.characteristics {
                    if wanted.contains(&characteristic.uuid) {
                        tlog!("[gatt] read characteristic {}", characteristic.uuid);
                        self.resolved_read.push(characteristic.clone());
                        matched += 1;
                    }
                }
            }
            if let Some(wanted) = self.write.get(&service.uuid) {
                for characteristic in &service.characteristics {
                    if wanted.contains(&characteristic.uuid) {
                        tlog!("[gatt] write characteristic {}", characteristic.uuid);
                        self.resolved_write.push(characteristic.clone());
                        matched += 1;
                    }
                }
            }
            if service.uuid == BATTERY_SERVICE {
                if let Some(level) = service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == BATTERY_LEVEL_CHARACTERISTIC)
                {
                    tlog!("[gatt] battery service detected");
                    self.battery = Some(level.clone());
                    // The battery characteristic joins the read set so its
                    // notifications get enabled with the rest.
                    self.resolved_read.push(level.clone());
                }
            }
        }
        matched
    }
}

// ============================================================================
// Negotiation state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattPhase {
    Idle,
    Connecting,
    ServiceDiscovery,
    MtuNegotiation,
    CharacteristicSetup,
    DescriptorSetup,
    Connected,
    Failed,
    Disconnected,
}

/// Everything a connected session needs from negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedLink {
    pub payload_size: usize,
    pub map: CharacteristicMap,
}

pub struct GattNegotiator {
    phase: GattPhase,
    map: CharacteristicMap,
}

impl GattNegotiator {
    pub fn new(map: CharacteristicMap) -> GattNegotiator {
        GattNegotiator {
            phase: GattPhase::Idle,
            map,
        }
    }

    pub fn phase(&self) -> GattPhase {
        self.phase
    }

    fn fail(&mut self, error: TransportError) -> TransportError {
        self.phase = GattPhase::Failed;
        error
    }

    /// Run the full negotiation sequence. The caller has already brought the
    /// physical connection up.
    pub async fn negotiate(&mut self, ops: &dyn GattOps) -> Result<NegotiatedLink, TransportError> {
        self.phase = GattPhase::ServiceDiscovery;
        let services = ops
            .discover_services()
            .await
            .map_err(|e| self.fail(TransportError::Connect(e)))?;
        let matched = self.map.resolve(&services);
        if matched == 0 {
            tlog!("[gatt] no declared characteristic matched; dumping services");
            for service in &services {
                for characteristic in &service.characteristics {
                    tlog!("[gatt]   {} / {}", service.uuid, characteristic.uuid);
                }
            }
            return Err(self.fail(TransportError::NoSerialProfileFound));
        }

        // MTU: proceed with the negotiated or default size either way.
        self.phase = GattPhase::MtuNegotiation;
        let payload_size = match ops.negotiate_mtu(MAX_MTU).await {
            Ok(mtu) => {
                tlog!("[gatt] mtu {}", mtu);
                mtu.saturating_sub(ATT_OVERHEAD).max(1)
            }
            Err(e) => {
                tlog!("[gatt] mtu negotiation unavailable ({}), using default", e);
                DEFAULT_MTU - ATT_OVERHEAD
            }
        };
        tlog!("[gatt] payload size {}", payload_size);

        self.phase = GattPhase::CharacteristicSetup;
        let write_targets: Vec<GattCharacteristic> = self.map.resolved_write().to_vec();
        for characteristic in &write_targets {
            let props = characteristic.properties;
            if !props.write && !props.write_without_response {
                return Err(self.fail(TransportError::NotWritable(characteristic.uuid)));
            }
        }
        let read_targets: Vec<GattCharacteristic> = self.map.resolved_read().to_vec();
        for characteristic in &read_targets {
            let props = characteristic.properties;
            if !props.notify && !props.indicate {
                return Err(self.fail(TransportError::NoNotifySupport(characteristic.uuid)));
            }
        }

        // One descriptor write completes before the next is issued; a
        // missing or rejected descriptor is skipped, not fatal.
        self.phase = GattPhase::DescriptorSetup;
        for characteristic in read_targets {
            let kind = if characteristic.properties.indicate {
                NotifyKind::Indication
            } else {
                NotifyKind::Notification
            };
            match ops.enable_change_events(&characteristic, kind).await {
                Ok(()) => tlog!("[gatt] enabled {:?} for {}", kind, characteristic.uuid),
                Err(e) => {
                    tlog!(
                        "[gatt] descriptor write for {} failed ({}), skipping",
                        characteristic.uuid,
                        e
                    );
                }
            }
        }

        self.phase = GattPhase::Connected;
        Ok(NegotiatedLink {
            payload_size,
            map: self.map.clone(),
        })
    }
}

// ============================================================================
// Serialized write queue
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub data: Vec<u8>,
    pub characteristic: GattCharacteristic,
}

struct WriteQueueState {
    write_pending: bool,
    items: VecDeque<WriteItem>,
}

/// Write serialization: a request is issued immediately when nothing is in
/// flight; otherwise it - and any chunks beyond the payload size - queue up
/// and drain one at a time as each prior write completes.
pub struct WriteQueue {
    state: Mutex<WriteQueueState>,
}

impl WriteQueue {
    pub fn new() -> WriteQueue {
        WriteQueue {
            state: Mutex::new(WriteQueueState {
                write_pending: false,
                items: VecDeque::new(),
            }),
        }
    }

    /// Split `data` into payload-sized chunks and queue them. Returns the
    /// first chunk when the queue was idle - the caller issues it and then
    /// drains via `complete_one`.
    pub fn enqueue(
        &self,
        data: &[u8],
        characteristic: &GattCharacteristic,
        payload_size: usize,
    ) -> Option<WriteItem> {
        if data.is_empty() {
            return None;
        }
        let mut state = self.state.lock().expect("write queue poisoned");
        let mut chunks = data.chunks(payload_size.max(1));
        let first = WriteItem {
            data: chunks.next().unwrap_or_default().to_vec(),
            characteristic: characteristic.clone(),
        };
        let issue = if !state.write_pending && state.items.is_empty() {
            state.write_pending = true;
            Some(first)
        } else {
            tlog!("[gatt] write queued, len={}", first.data.len());
            state.items.push_back(first);
            None
        };
        for chunk in chunks {
            state.items.push_back(WriteItem {
                data: chunk.to_vec(),
                characteristic: characteristic.clone(),
            });
        }
        issue
    }

    /// A write completed; hand back the next queued item, or clear the
    /// in-flight flag when drained.
    pub fn complete_one(&self) -> Option<WriteItem> {
        let mut state = self.state.lock().expect("write queue poisoned");
        match state.items.pop_front() {
            Some(item) => {
                state.write_pending = true;
                Some(item)
            }
            None => {
                state.write_pending = false;
                None
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("write queue poisoned");
        state.items.clear();
        state.write_pending = false;
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("write queue poisoned");
        !state.write_pending && state.items.is_empty()
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        WriteQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn props(write: bool, notify: bool, indicate: bool) -> CharProps {
        CharProps {
            write,
            write_without_response: false,
            notify,
            indicate,
        }
    }

    fn characteristic(service: Uuid, uuid: Uuid, p: CharProps) -> GattCharacteristic {
        GattCharacteristic {
            service,
            uuid,
            properties: p,
        }
    }

    const READ_SERVICE: Uuid = uuid_from_fields(0x0000ffe0, 0, 0x1000, 0x8000, 0x00805f9b34fb);
    const READ_CHAR: Uuid = uuid_from_fields(0x0000ffe1, 0, 0x1000, 0x8000, 0x00805f9b34fb);
    const READ_CHAR_2: Uuid = uuid_from_fields(0x0000ffe2, 0, 0x1000, 0x8000, 0x00805f9b34fb);
    const WRITE_CHAR: Uuid = uuid_from_fields(0x0000ffe9, 0, 0x1000, 0x8000, 0x00805f9b34fb);

    /// Fake platform: records operation interleaving so tests can assert the
    /// one-outstanding-operation invariant.
    struct FakeGatt {
        services: Vec<GattService>,
        mtu: Result<usize, String>,
        fail_enable_for: Option<Uuid>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        enables: Mutex<Vec<(Uuid, NotifyKind)>>,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeGatt {
        fn new(services: Vec<GattService>) -> FakeGatt {
            FakeGatt {
                services,
                mtu: Err("unsupported".to_string()),
                fail_enable_for: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                enables: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
            }
        }

        async fn track<T>(&self, work: impl std::future::Future<Output = T>) -> T {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let out = work.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl GattOps for FakeGatt {
        async fn discover_services(&self) -> Result<Vec<GattService>, String> {
            Ok(self.services.clone())
        }

        async fn negotiate_mtu(&self, _requested: usize) -> Result<usize, String> {
            self.mtu.clone()
        }

        async fn enable_change_events(
            &self,
            characteristic: &GattCharacteristic,
            kind: NotifyKind,
        ) -> Result<(), String> {
            self.track(async {
                self.enables
                    .lock()
                    .unwrap()
                    .push((characteristic.uuid, kind));
                if self.fail_enable_for == Some(characteristic.uuid) {
                    Err("descriptor rejected".to_string())
                } else {
                    Ok(())
                }
            })
            .await
        }

        async fn write_characteristic(
            &self,
            _characteristic: &GattCharacteristic,
            data: &[u8],
        ) -> Result<(), String> {
            self.track(async {
                self.writes.lock().unwrap().push(data.to_vec());
                Ok(())
            })
            .await
        }
    }

    fn serial_services() -> Vec<GattService> {
        vec![GattService {
            uuid: READ_SERVICE,
            characteristics: vec![
                characteristic(READ_SERVICE, READ_CHAR, props(false, true, false)),
                characteristic(READ_SERVICE, READ_CHAR_2, props(false, false, true)),
                characteristic(READ_SERVICE, WRITE_CHAR, props(true, false, false)),
            ],
        }]
    }

    fn map_with_reads() -> CharacteristicMap {
        let mut map = CharacteristicMap::new();
        map.add_read(READ_SERVICE, READ_CHAR);
        map.add_read(READ_SERVICE, READ_CHAR_2);
        map.add_write(READ_SERVICE, WRITE_CHAR);
        map
    }

    #[tokio::test]
    async fn test_negotiation_happy_path() {
        let ops = FakeGatt::new(serial_services());
        let mut negotiator = GattNegotiator::new(map_with_reads());
        let link = negotiator.negotiate(&ops).await.unwrap();
        assert_eq!(negotiator.phase(), GattPhase::Connected);
        // MTU unavailable -> default payload
        assert_eq!(link.payload_size, DEFAULT_MTU - 3);
        assert!(link.map.write_target().is_some());
        // Indication preferred where advertised
        let enables = ops.enables.lock().unwrap();
        assert_eq!(enables.len(), 2);
        assert!(enables.contains(&(READ_CHAR, NotifyKind::Notification)));
        assert!(enables.contains(&(READ_CHAR_2, NotifyKind::Indication)));
    }

    #[tokio::test]
    async fn test_negotiated_mtu_sets_payload() {
        let mut ops = FakeGatt::new(serial_services());
        ops.mtu = Ok(185);
        let mut negotiator = GattNegotiator::new(map_with_reads());
        let link = negotiator.negotiate(&ops).await.unwrap();
        assert_eq!(link.payload_size, 182);
    }

    #[tokio::test]
    async fn test_no_serial_profile() {
        let ops = FakeGatt::new(vec![GattService {
            uuid: uuid_from_fields(0x1234, 0, 0x1000, 0x8000, 0x00805f9b34fb),
            characteristics: vec![],
        }]);
        let mut negotiator = GattNegotiator::new(map_with_reads());
        let err = negotiator.negotiate(&ops).await.unwrap_err();
        assert!(matches!(err, TransportError::NoSerialProfileFound));
        assert_eq!(negotiator.phase(), GattPhase::Failed);
    }

    #[tokio::test]
    async fn test_unwritable_write_characteristic_fails_by_name() {
        let services = vec![GattService {
            uuid: READ_SERVICE,
            characteristics: vec![
                characteristic(READ_SERVICE, READ_CHAR, props(false, true, false)),
                characteristic(READ_SERVICE, WRITE_CHAR, props(false, false, false)),
            ],
        }];
        let ops = FakeGatt::new(services);
        let mut map = CharacteristicMap::new();
        map.add_read(READ_SERVICE, READ_CHAR);
        map.add_write(READ_SERVICE, WRITE_CHAR);
        let mut negotiator = GattNegotiator::new(map);
        match negotiator.negotiate(&ops).await.unwrap_err() {
            TransportError::NotWritable(uuid) => assert_eq!(uuid, WRITE_CHAR),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_descriptor_queue_is_sequential_and_skips_failures() {
        let mut ops = FakeGatt::new(serial_services());
        ops.fail_enable_for = Some(READ_CHAR);
        let mut negotiator = GattNegotiator::new(map_with_reads());
        let link = negotiator.negotiate(&ops).await;
        // A rejected descriptor is skipped, not fatal
        assert!(link.is_ok());
        assert_eq!(negotiator.phase(), GattPhase::Connected);
        // Exactly one outstanding enable at any moment
        assert_eq!(ops.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(ops.enables.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_battery_service_auto_detected() {
        let mut services = serial_services();
        services.push(GattService {
            uuid: BATTERY_SERVICE,
            characteristics: vec![characteristic(
                BATTERY_SERVICE,
                BATTERY_LEVEL_CHARACTERISTIC,
                props(false, true, false),
            )],
        });
        let ops = FakeGatt::new(services);
        let mut negotiator = GattNegotiator::new(map_with_reads());
        let link = negotiator.negotiate(&ops).await.unwrap();
        assert!(link.map.battery().is_some());
        // Battery notifications got enabled along with the declared reads
        assert_eq!(ops.enables.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_write_queue_chunks_and_serializes() {
        let queue = WriteQueue::new();
        let target = characteristic(READ_SERVICE, WRITE_CHAR, props(true, false, false));

        // 50 bytes at payload 20 means 3 chunks; the first issues immediately
        let data: Vec<u8> = (0u8..50).collect();
        let first = queue.enqueue(&data, &target, 20).unwrap();
        assert_eq!(first.data.len(), 20);

        // A second request while one is in flight never issues directly
        assert!(queue.enqueue(&[0xff], &target, 20).is_none());

        let mut drained = Vec::new();
        while let Some(item) = queue.complete_one() {
            drained.push(item.data);
        }
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].len(), 20);
        assert_eq!(drained[1].len(), 10);
        assert_eq!(drained[2], vec![0xff]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_write_queue_clear() {
        let queue = WriteQueue::new();
        let target = characteristic(READ_SERVICE, WRITE_CHAR, props(true, false, false));
        let _ = queue.enqueue(&[1, 2, 3], &target, 1);
        queue.clear();
        assert!(queue.complete_one().is_none());
        assert!(queue.is_idle());
    }

    #[test]
    fn test_characteristic_map_from_driver() {
        let json = r#"{
            "name": "D", "deviceName": "N", "type": "ble",
            "read": {
                "service": "0000ffe0-0000-1000-8000-00805f9b34fb",
                "serialDataType": "hex",
                "pttDownKeyIntent": "a.b",
                "characteristicMaps": {
                    "0000ffe1-0000-1000-8000-00805f9b34fb": {"01": "a.b"},
                    "0000ffe2-0000-1000-8000-00805f9b34fb": {"02": "a.c"}
                }
            }
        }"#;
        let driver = PttDriver::from_json_str(json).unwrap();
        let map = CharacteristicMap::from_driver(&driver).unwrap();
        assert_eq!(map.read.get(&READ_SERVICE).map(|s| s.len()), Some(2));
    }
}
