// src/pipeline.rs
//
// Event dispatch pipeline: the one component with cross-cutting
// connection-lifecycle state. Owns a session per connect attempt, decodes
// incoming bytes per the driver descriptor, resolves them to intents,
// applies de-duplication and key-down delay, and evaluates reconnection
// policy on every disconnection. Runs as a single task; timers come back in
// through the command channel so all state stays single-owner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::events::EventBroadcaster;
use crate::io::{
    self, DataSource, LinkMonitor, SerialEvent, SerialEventReceiver, SerialTransport,
    TransportError,
};
use crate::model::{ConnectionType, DataType, Device, IntentMap, PttDriver, ReadSpec};
use crate::transform::Transform;

/// Settle delay between connect, start command, and ready.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Staying quiet this long resets the reconnect attempt counter.
const RECONNECT_QUIET_PERIOD: Duration = Duration::from_secs(120);
/// So does blowing past this many attempts - both guards keep the linear
/// backoff from growing without bound on a flapping link.
const RECONNECT_COUNT_CEILING: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Enabling,
    Ready,
}

// ============================================================================
// De-duplication
// ============================================================================

#[derive(Debug, Clone)]
pub struct DedupePolicy {
    pub enabled: bool,
    pub timeout: Duration,
    /// Events suppressed only when identical to the immediately preceding
    /// one, with no timeout window.
    pub no_timeout: Vec<String>,
}

impl DedupePolicy {
    pub fn from_read_spec(read: &ReadSpec) -> DedupePolicy {
        DedupePolicy {
            enabled: read.intent_de_duplicate,
            timeout: Duration::from_millis(read.intent_de_duplicate_timeout),
            no_timeout: read.intents_de_duplicate_no_timeout.clone(),
        }
    }
}

/// Per-session last-event slot. One slot, not one per transport channel.
#[derive(Debug, Default)]
pub struct DedupeFilter {
    last: Option<(String, Instant)>,
}

impl DedupeFilter {
    /// Decide whether `intent` gets through, recording it if so. The slot is
    /// written at request time, before any key-down delay.
    pub fn admit(&mut self, policy: &DedupePolicy, intent: &str, now: Instant) -> bool {
        if let Some((last_intent, last_time)) = &self.last {
            if last_intent == intent && policy.no_timeout.iter().any(|name| name == intent) {
                return false;
            }
            if policy.enabled
                && last_intent == intent
                && now.duration_since(*last_time) < policy.timeout
            {
                return false;
            }
        }
        self.last = Some((intent.to_string(), now));
        true
    }

    /// The most recently admitted intent; delayed emission re-checks this.
    pub fn last_intent(&self) -> Option<&str> {
        self.last.as_ref().map(|(intent, _)| intent.as_str())
    }
}

// ============================================================================
// Reconnect backoff
// ============================================================================

/// Linear backoff: attempt n waits n seconds.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    count: u64,
    last_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) > RECONNECT_QUIET_PERIOD {
                self.count = 0;
            }
        }
        if self.count > RECONNECT_COUNT_CEILING {
            self.count = 0;
        }
        self.count += 1;
        self.last_attempt = Some(now);
        Duration::from_secs(self.count)
    }
}

// ============================================================================
// Byte decoding
// ============================================================================

/// Remove every occurrence of `marker` from `data`.
fn strip_marker(data: &[u8], marker: &[u8]) -> Vec<u8> {
    if marker.is_empty() || data.len() < marker.len() {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(marker) {
            i += marker.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Decode incoming bytes into the lookup key: strip the EOL marker, then
/// render per the configured encoding (hex keys are uppercase).
pub fn decode_key(data: &[u8], data_type: DataType, eol: Option<&[u8]>) -> String {
    let stripped = match eol {
        Some(marker) => strip_marker(data, marker),
        None => data.to_vec(),
    };
    match data_type {
        DataType::Hex => hex::encode_upper(stripped),
        _ => String::from_utf8_lossy(&stripped).into_owned(),
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct PipelineConfig {
    pub driver: PttDriver,
    pub device: Device,
    /// Key-down delay override from the session owner; wins over the
    /// driver's default, even when zero.
    pub ptt_down_delay_override: Option<u64>,
}

pub type TransportFactory =
    Box<dyn Fn(&PttDriver, &Device) -> Result<Box<dyn SerialTransport>, TransportError> + Send + Sync>;

enum PipelineCommand {
    Connect,
    Disconnect,
    EnableTick,
    ReadyTick,
    EmitDelayed { intent: String },
    ReconnectTick,
    Shutdown,
}

/// Control surface for one running pipeline. Cheap to clone.
#[derive(Clone)]
#[derive(Debug)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
    state: Arc<Mutex<DeviceConnectionState>>,
}

impl PipelineHandle {
    pub fn connect(&self) {
        let _ = self.tx.send(PipelineCommand::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(PipelineCommand::Disconnect);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PipelineCommand::Shutdown);
    }

    pub fn state(&self) -> DeviceConnectionState {
        *self.state.lock().expect("pipeline state poisoned")
    }
}

struct EventPipeline {
    driver: PttDriver,
    read: ReadSpec,
    device: Device,
    delay_override: Option<u64>,
    policy: DedupePolicy,
    eol: Option<Vec<u8>>,
    state: DeviceConnectionState,
    shared_state: Arc<Mutex<DeviceConnectionState>>,
    transport: Option<Box<dyn SerialTransport>>,
    link_rx: Option<SerialEventReceiver>,
    events: EventBroadcaster,
    link_monitor: Arc<dyn LinkMonitor>,
    factory: TransportFactory,
    dedupe: DedupeFilter,
    backoff: ReconnectBackoff,
    reconnect_pending: bool,
    enabled_sent: bool,
    cached_name: String,
    cached_address: String,
    self_tx: mpsc::UnboundedSender<PipelineCommand>,
    /// Parsed filestream transforms, by operation name.
    transforms: HashMap<String, Transform>,
    /// Watched-file path -> (operation name, intent map).
    file_maps: HashMap<String, (String, IntentMap)>,
}

/// Start a pipeline with explicit collaborators (tests inject fakes here).
pub fn spawn(
    config: PipelineConfig,
    events: EventBroadcaster,
    link_monitor: Arc<dyn LinkMonitor>,
    factory: TransportFactory,
) -> PipelineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared_state = Arc::new(Mutex::new(DeviceConnectionState::Disconnected));
    let read = config.driver.read_spec();

    let mut transforms = HashMap::new();
    if let Some(operations) = &read.operations {
        for (name, script) in operations {
            match Transform::parse(script) {
                Ok(transform) => {
                    transforms.insert(name.clone(), transform);
                }
                Err(e) => tlog!("[pipeline] bad transform '{}': {}", name, e),
            }
        }
    }
    let mut file_maps = HashMap::new();
    if let Some(files) = &read.files {
        for file in files {
            if let (Some(filename), Some(preprocess)) = (&file.filename, &file.preprocess) {
                file_maps.insert(
                    filename.clone(),
                    (
                        preprocess.clone(),
                        file.intent_map.clone().unwrap_or_default(),
                    ),
                );
            }
        }
    }

    let pipeline = EventPipeline {
        policy: DedupePolicy::from_read_spec(&read),
        eol: read.eol_bytes(),
        read,
        delay_override: config.ptt_down_delay_override,
        device: config.device,
        driver: config.driver,
        state: DeviceConnectionState::Disconnected,
        shared_state: shared_state.clone(),
        transport: None,
        link_rx: None,
        events,
        link_monitor,
        factory,
        dedupe: DedupeFilter::default(),
        backoff: ReconnectBackoff::default(),
        reconnect_pending: false,
        enabled_sent: false,
        cached_name: String::new(),
        cached_address: String::new(),
        self_tx: tx.clone(),
        transforms,
        file_maps,
    };
    tokio::spawn(pipeline.run(rx));
    PipelineHandle {
        tx,
        state: shared_state,
    }
}

/// Start a pipeline with the real transport variants and link monitor.
pub fn spawn_with_defaults(config: PipelineConfig, events: EventBroadcaster) -> PipelineHandle {
    let connection_type = config
        .driver
        .connection_type
        .unwrap_or(ConnectionType::Invalid);
    let link_monitor = io::build_link_monitor(connection_type);
    spawn(
        config,
        events,
        link_monitor,
        Box::new(|driver, device| io::build_transport(driver, device)),
    )
}

impl EventPipeline {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PipelineCommand>) {
        enum Step {
            Command(Option<PipelineCommand>),
            Link(Option<SerialEvent>),
        }
        loop {
            // Resolve the select into a value first so the borrow of the
            // link receiver ends before any state is touched.
            let step = {
                let link_rx = self.link_rx.as_mut();
                tokio::select! {
                    command = commands.recv() => Step::Command(command),
                    incoming = async {
                        match link_rx {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Step::Link(incoming),
                }
            };
            match step {
                Step::Command(None) | Step::Command(Some(PipelineCommand::Shutdown)) => {
                    self.teardown().await;
                    return;
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Link(Some(event)) => self.handle_serial_event(event).await,
                Step::Link(None) => {
                    // Sender dropped without a disconnect event
                    self.link_rx = None;
                    if self.state != DeviceConnectionState::Disconnected {
                        self.on_error("transport channel closed", false).await;
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: DeviceConnectionState) {
        self.state = state;
        *self.shared_state.lock().expect("pipeline state poisoned") = state;
    }

    fn schedule(&self, command: PipelineCommand, delay: Duration) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Connect => self.do_connect().await,
            PipelineCommand::Disconnect => {
                self.events.status("Disconnecting...");
                self.teardown().await;
                self.events
                    .device_disconnected(&self.cached_name, &self.cached_address);
                self.events.status("Disconnected");
            }
            PipelineCommand::EnableTick => self.enable_ptt().await,
            PipelineCommand::ReadyTick => {
                if self.state == DeviceConnectionState::Enabling {
                    self.set_state(DeviceConnectionState::Ready);
                    self.events.status("Connected");
                    self.events
                        .device_ready(&self.cached_name, &self.cached_address);
                }
            }
            PipelineCommand::EmitDelayed { intent } => {
                // A key released (or replaced) before the delay elapsed must
                // not still fire.
                if self.dedupe.last_intent() == Some(intent.as_str()) {
                    self.events.intent(&intent);
                }
            }
            PipelineCommand::ReconnectTick => {
                self.reconnect_pending = false;
                if self.state == DeviceConnectionState::Disconnected {
                    tlog!("[pipeline] try reconnect to device");
                    self.do_connect().await;
                }
            }
            PipelineCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn do_connect(&mut self) {
        if self.state != DeviceConnectionState::Disconnected {
            tlog!("[pipeline] connect ignored, state is {:?}", self.state);
            return;
        }
        self.events.status("Connecting to device...");
        let mut transport = match (self.factory)(&self.driver, &self.device) {
            Ok(transport) => transport,
            Err(e) => {
                self.events.status(format!("Connection failed: {}", e));
                self.evaluate_reconnect().await;
                return;
            }
        };
        self.cached_name = transport.name();
        self.cached_address = transport.address();
        let (tx, rx) = io::serial_event_channel();
        match transport.connect(tx).await {
            Ok(()) => {
                self.transport = Some(transport);
                self.link_rx = Some(rx);
                self.set_state(DeviceConnectionState::Connecting);
            }
            Err(e) => {
                self.events.status(format!("Connection failed: {}", e));
                self.evaluate_reconnect().await;
            }
        }
    }

    /// Drop the session. Teardown always completes; the transport swallows
    /// its own close errors.
    async fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect(true).await;
        }
        self.link_rx = None;
        self.enabled_sent = false;
        self.set_state(DeviceConnectionState::Disconnected);
    }

    async fn on_error(&mut self, message: &str, before_connected: bool) {
        let prefix = if before_connected {
            "Connection failed:"
        } else {
            "Connection lost:"
        };
        self.events.status(format!("{} {}", prefix, message));
        self.teardown().await;
        self.events
            .device_disconnected(&self.cached_name, &self.cached_address);
        self.evaluate_reconnect().await;
    }

    async fn handle_serial_event(&mut self, event: SerialEvent) {
        match event {
            SerialEvent::Connected => {
                self.set_state(DeviceConnectionState::Connected);
                self.events.status("Connected");
                self.events
                    .device_connected(&self.cached_name, &self.cached_address);
                if !self.enabled_sent {
                    self.schedule(PipelineCommand::EnableTick, SETTLE_DELAY);
                }
            }
            SerialEvent::ConnectError(message) => self.on_error(&message, true).await,
            SerialEvent::IoError(message) => self.on_error(&message, false).await,
            SerialEvent::Disconnected => {
                self.events.status("Disconnected");
                self.teardown().await;
                self.events
                    .device_disconnected(&self.cached_name, &self.cached_address);
                self.evaluate_reconnect().await;
            }
            SerialEvent::Data { data, source } => {
                if self.state == DeviceConnectionState::Disconnected {
                    return;
                }
                self.handle_serial_read(data, source).await;
            }
            SerialEvent::Battery(level) => {
                if self.state != DeviceConnectionState::Disconnected {
                    self.events
                        .battery(level, &self.cached_name, &self.cached_address);
                }
            }
        }
    }

    /// Send the descriptor's optional start command, then settle into Ready.
    async fn enable_ptt(&mut self) {
        if self.state == DeviceConnectionState::Disconnected || self.enabled_sent {
            return;
        }
        self.events.status("Enabling PTT...");
        self.set_state(DeviceConnectionState::Enabling);
        let start = self
            .driver
            .write
            .as_ref()
            .and_then(|w| w.start_cmd.clone())
            .filter(|cmd| !cmd.is_empty());
        let start_cmd_type = self.driver.write.as_ref().and_then(|w| w.start_cmd_type);
        match start {
            None => {
                // Nothing to send; settle into Ready after the same delay
                self.enabled_sent = true;
                self.schedule(PipelineCommand::ReadyTick, SETTLE_DELAY);
            }
            Some(command) => {
                let bytes = match start_cmd_type {
                    Some(DataType::Hex) => match hex::decode(&command) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tlog!("[pipeline] bad hex start command '{}': {}", command, e);
                            Vec::new()
                        }
                    },
                    _ => command.clone().into_bytes(),
                };
                tlog!(
                    "[pipeline] sending start command: {} ({})",
                    command,
                    hex::encode_upper(&bytes)
                );
                if !bytes.is_empty() {
                    if let Some(transport) = &self.transport {
                        if let Err(e) = transport.write(&bytes).await {
                            self.on_error(&e.to_string(), false).await;
                            return;
                        }
                    }
                }
                self.enabled_sent = true;
                self.schedule(PipelineCommand::ReadyTick, SETTLE_DELAY);
            }
        }
    }

    /// Resolve incoming bytes to an intent via the descriptor's mapping
    /// tables. HFP traffic with no mapping is protocol chatter - it goes to
    /// the AT engine, not to the floor.
    async fn resolve_intent(&self, data: &[u8], source: &DataSource) -> Option<String> {
        let connection_type = self.driver.connection_type?;
        let data_type = self.read.serial_data_type.unwrap_or(DataType::Ascii);
        let flat = matches!(
            connection_type,
            ConnectionType::BleSerial | ConnectionType::Spp | ConnectionType::Hfp
        ) || (connection_type == ConnectionType::Ble && self.read.characteristic.is_some());

        if flat {
            let key = decode_key(data, data_type, self.eol.as_deref());
            tlog!("[pipeline] received key: {}", key);
            let intent = self.read.intent_map.get(&key).cloned();
            if connection_type == ConnectionType::Hfp {
                match intent {
                    None => {
                        if let Some(transport) = &self.transport {
                            transport.handle_unmapped(data).await;
                        }
                        return None;
                    }
                    Some(intent) => {
                        // Mapped HFP traffic still gets acknowledged
                        if let Some(transport) = &self.transport {
                            let _ = transport.write(b"\r\nOK\r\n").await;
                        }
                        return Some(intent);
                    }
                }
            }
            return intent;
        }

        match connection_type {
            ConnectionType::Ble => {
                let raw = decode_key(data, data_type, None);
                if raw.is_empty() {
                    return None;
                }
                let key: String = raw.split_whitespace().collect();
                tlog!("[pipeline] received key: {}", key);
                match (&self.read.characteristic_maps, source) {
                    (Some(maps), DataSource::Characteristic { characteristic, .. }) => maps
                        .get(characteristic)
                        .and_then(|map| map.get(&key))
                        .cloned(),
                    _ => None,
                }
            }
            ConnectionType::Filestream => {
                let DataSource::File(path) = source else {
                    return None;
                };
                let (operation, intent_map) = self.file_maps.get(path)?;
                let transform = self.transforms.get(operation)?;
                let key = transform.apply(data);
                if key.is_empty() {
                    return None;
                }
                tlog!("[pipeline] file {} produced key: {}", path, key);
                intent_map.get(&key).cloned()
            }
            _ => None,
        }
    }

    async fn handle_serial_read(&mut self, data: Vec<u8>, source: DataSource) {
        let Some(intent) = self.resolve_intent(&data, &source).await else {
            return;
        };
        tlog!("[pipeline] mapped intent: {}", intent);
        let mut delay = Duration::ZERO;
        if self.read.ptt_down_key_intent.as_deref() == Some(intent.as_str()) {
            let millis = self
                .delay_override
                .unwrap_or(self.read.default_ptt_down_key_delay);
            delay = Duration::from_millis(millis);
        }
        self.send_intent(intent, delay);
    }

    fn send_intent(&mut self, intent: String, delay: Duration) {
        if !self.dedupe.admit(&self.policy, &intent, Instant::now()) {
            return;
        }
        if delay > Duration::ZERO {
            self.schedule(PipelineCommand::EmitDelayed { intent }, delay);
        } else {
            self.events.intent(&intent);
        }
    }

    /// Reconnection policy: only when auto-reconnect is on, at most one
    /// pending timer, and only while the physical link is still up.
    async fn evaluate_reconnect(&mut self) {
        if self.reconnect_pending {
            tlog!("[pipeline] reconnect attempt pending, don't schedule more");
            return;
        }
        if !self.device.auto_reconnect {
            return;
        }
        let mut link_up = self.link_monitor.link_present(&self.device.address).await;
        if !link_up {
            if let Some(watch_name) = &self.driver.watch_for_device_name {
                link_up = self.link_monitor.link_present(watch_name).await;
            }
        }
        if !link_up {
            tlog!("[pipeline] physical link down, waiting for link-level reconnect");
            return;
        }
        let delay = self.backoff.next_delay(Instant::now());
        self.events.status("Reconnecting...");
        tlog!("[pipeline] attempting reconnect in {}ms", delay.as_millis());
        self.reconnect_pending = true;
        self.schedule(PipelineCommand::ReconnectTick, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceEvent;
    use crate::io::{AlwaysPresent, SerialEventSender};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Pure policy tests
    // ------------------------------------------------------------------

    fn policy(enabled: bool, timeout_ms: u64, no_timeout: &[&str]) -> DedupePolicy {
        DedupePolicy {
            enabled,
            timeout: Duration::from_millis(timeout_ms),
            no_timeout: no_timeout.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_dedupe_within_timeout_suppresses() {
        let policy = policy(true, 50, &[]);
        let mut filter = DedupeFilter::default();
        let t0 = Instant::now();
        assert!(filter.admit(&policy, "evt.a", t0));
        assert!(!filter.admit(&policy, "evt.a", t0 + Duration::from_millis(10)));
        // Beyond the window it passes again
        assert!(filter.admit(&policy, "evt.a", t0 + Duration::from_millis(60)));
        assert!(filter.admit(&policy, "evt.a", t0 + Duration::from_millis(120)));
    }

    #[test]
    fn test_dedupe_different_events_pass() {
        let policy = policy(true, 50, &[]);
        let mut filter = DedupeFilter::default();
        let t0 = Instant::now();
        assert!(filter.admit(&policy, "evt.a", t0));
        assert!(filter.admit(&policy, "evt.b", t0 + Duration::from_millis(1)));
        assert!(filter.admit(&policy, "evt.a", t0 + Duration::from_millis(2)));
    }

    #[test]
    fn test_no_timeout_list_suppresses_repeats_forever() {
        let policy = policy(true, 50, &["evt.up"]);
        let mut filter = DedupeFilter::default();
        let t0 = Instant::now();
        assert!(filter.admit(&policy, "evt.up", t0));
        // Hours later the repeat is still suppressed
        assert!(!filter.admit(&policy, "evt.up", t0 + Duration::from_secs(3600)));
        // A different event in between re-arms it
        assert!(filter.admit(&policy, "evt.down", t0 + Duration::from_secs(3601)));
        assert!(filter.admit(&policy, "evt.up", t0 + Duration::from_secs(3602)));
    }

    #[test]
    fn test_dedupe_disabled_only_honors_no_timeout_list() {
        let policy = policy(false, 50, &["evt.up"]);
        let mut filter = DedupeFilter::default();
        let t0 = Instant::now();
        assert!(filter.admit(&policy, "evt.down", t0));
        assert!(filter.admit(&policy, "evt.down", t0 + Duration::from_millis(1)));
        assert!(filter.admit(&policy, "evt.up", t0 + Duration::from_millis(2)));
        assert!(!filter.admit(&policy, "evt.up", t0 + Duration::from_millis(3)));
    }

    #[test]
    fn test_backoff_is_linear_and_resets_after_quiet_period() {
        let mut backoff = ReconnectBackoff::default();
        let t0 = Instant::now();
        assert_eq!(backoff.next_delay(t0), Duration::from_secs(1));
        assert_eq!(
            backoff.next_delay(t0 + Duration::from_secs(5)),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.next_delay(t0 + Duration::from_secs(10)),
            Duration::from_secs(3)
        );
        // Quiet for longer than the reset window -> back to 1s
        assert_eq!(
            backoff.next_delay(t0 + Duration::from_secs(200)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_backoff_count_ceiling_resets() {
        let mut backoff = ReconnectBackoff::default();
        let mut t = Instant::now();
        for _ in 0..=RECONNECT_COUNT_CEILING {
            t += Duration::from_secs(1);
            backoff.next_delay(t);
        }
        // Next attempt trips the ceiling and starts over
        assert_eq!(backoff.next_delay(t + Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(
            decode_key(b"A\r\n", DataType::Ascii, Some(b"\r\n")),
            "A"
        );
        assert_eq!(decode_key(b"A\r\n", DataType::Ascii, None), "A\r\n");
        assert_eq!(
            decode_key(&[0x01, 0xab, 0x0d, 0x0a], DataType::Hex, Some(b"\r\n")),
            "01AB"
        );
        assert_eq!(decode_key(&[0x01, 0xab], DataType::Hex, None), "01AB");
    }

    // ------------------------------------------------------------------
    // Pipeline integration tests with a scripted transport
    // ------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct FakeLink {
        listener: Arc<Mutex<Option<SerialEventSender>>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        unmapped: Arc<Mutex<Vec<Vec<u8>>>>,
        connects: Arc<AtomicUsize>,
    }

    impl FakeLink {
        fn send(&self, event: SerialEvent) {
            let guard = self.listener.lock().unwrap();
            guard
                .as_ref()
                .expect("transport not connected")
                .send(event)
                .unwrap();
        }

        async fn wait_connected(&self) {
            while self.listener.lock().unwrap().is_none() {
                tokio::task::yield_now().await;
            }
        }
    }

    struct FakeTransport {
        link: FakeLink,
    }

    #[async_trait]
    impl SerialTransport for FakeTransport {
        fn name(&self) -> String {
            "Fake Device".to_string()
        }

        fn address(&self) -> String {
            "00:11:22:33:44:55".to_string()
        }

        async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError> {
            self.link.connects.fetch_add(1, Ordering::SeqCst);
            *self.link.listener.lock().unwrap() = Some(listener);
            Ok(())
        }

        async fn disconnect(&mut self, _silent: bool) {
            *self.link.listener.lock().unwrap() = None;
        }

        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            self.link.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn handle_unmapped(&self, data: &[u8]) -> bool {
            self.link.unmapped.lock().unwrap().push(data.to_vec());
            true
        }
    }

    fn spp_driver(default_delay: u64) -> PttDriver {
        PttDriver::from_json_str(&format!(
            r#"{{
                "name": "Test", "deviceName": "TEST", "type": "spp",
                "read": {{
                    "serialDataType": "ascii", "eol": "0D0A",
                    "pttDownKeyIntent": "evt.ptt_down",
                    "defaultPttDownKeyDelay": {default_delay},
                    "intentMap": {{"A": "evt.ptt_down", "B": "evt.ptt_up"}}
                }}
            }}"#
        ))
        .unwrap()
    }

    fn start_pipeline(
        driver: PttDriver,
        override_delay: Option<u64>,
    ) -> (PipelineHandle, FakeLink, EventBroadcaster) {
        let link = FakeLink::default();
        let factory_link = link.clone();
        let events = EventBroadcaster::new(64);
        let handle = spawn(
            PipelineConfig {
                driver,
                device: Device::new(crate::model::DeviceType::Bluetooth, "TEST", "00:11:22:33:44:55"),
                ptt_down_delay_override: override_delay,
            },
            events.clone(),
            Arc::new(AlwaysPresent),
            Box::new(move |_, _| {
                let transport: Box<dyn SerialTransport> = Box::new(FakeTransport {
                    link: factory_link.clone(),
                });
                Ok(transport)
            }),
        );
        (handle, link, events)
    }

    async fn next_intent(rx: &mut tokio::sync::broadcast::Receiver<DeviceEvent>) -> String {
        loop {
            match rx.recv().await.unwrap() {
                DeviceEvent::Intent { action, .. } => return action,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spp_scenario_immediate_emission() {
        let (handle, link, events) = start_pipeline(spp_driver(0), None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        link.send(SerialEvent::Data {
            data: b"A\r\n".to_vec(),
            source: DataSource::Stream,
        });
        assert_eq!(next_intent(&mut rx).await, "evt.ptt_down");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_down_delay_cancelled_by_release() {
        let (handle, link, events) = start_pipeline(spp_driver(200), None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        // Key down, then release before the delay elapses
        link.send(SerialEvent::Data {
            data: b"A\r\n".to_vec(),
            source: DataSource::Stream,
        });
        link.send(SerialEvent::Data {
            data: b"B\r\n".to_vec(),
            source: DataSource::Stream,
        });
        // The release is immediate; the delayed key-down must never fire
        assert_eq!(next_intent(&mut rx).await, "evt.ptt_up");
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.shutdown();
        // Drain remaining events: no ptt_down
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::Intent { action, .. } = event {
                panic!("unexpected intent after release: {}", action);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_down_delay_fires_when_held() {
        let (handle, link, events) = start_pipeline(spp_driver(200), None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        link.send(SerialEvent::Data {
            data: b"A\r\n".to_vec(),
            source: DataSource::Stream,
        });
        assert_eq!(next_intent(&mut rx).await, "evt.ptt_down");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_delay_wins_over_driver_default() {
        // Driver says 10s; the device record overrides to zero -> immediate
        let (handle, link, events) = start_pipeline(spp_driver(10_000), Some(0));
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        link.send(SerialEvent::Data {
            data: b"A\r\n".to_vec(),
            source: DataSource::Stream,
        });
        let action = tokio::time::timeout(Duration::from_millis(50), next_intent(&mut rx))
            .await
            .expect("intent not immediate");
        assert_eq!(action, "evt.ptt_down");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_scheduled_once_per_disconnect() {
        let (handle, link, events) = start_pipeline(spp_driver(0), None);
        let _rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
        link.send(SerialEvent::Connected);
        link.send(SerialEvent::IoError("link lost".to_string()));
        // Backoff is 1s for the first attempt; paused time auto-advances
        tokio::time::sleep(Duration::from_millis(1100)).await;
        link.wait_connected().await;
        assert_eq!(link.connects.load(Ordering::SeqCst), 2);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmapped_hfp_routes_to_at_engine() {
        let driver = PttDriver::from_json_str(
            r#"{
                "name": "T", "deviceName": "T", "type": "hfp",
                "read": {
                    "serialDataType": "ascii", "eol": "0D0A",
                    "pttDownKeyIntent": "evt.ptt_down",
                    "intentMap": {"+PTT=P": "evt.ptt_down"}
                }
            }"#,
        )
        .unwrap();
        let (handle, link, events) = start_pipeline(driver, None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);

        // Unmapped chatter goes to the AT engine
        link.send(SerialEvent::Data {
            data: b"AT+BRSF=0\r\n".to_vec(),
            source: DataSource::Stream,
        });
        // Mapped traffic is acknowledged with OK and emitted
        link.send(SerialEvent::Data {
            data: b"+PTT=P\r\n".to_vec(),
            source: DataSource::Stream,
        });
        assert_eq!(next_intent(&mut rx).await, "evt.ptt_down");
        assert_eq!(
            link.unmapped.lock().unwrap().as_slice(),
            &[b"AT+BRSF=0\r\n".to_vec()]
        );
        assert!(link
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|w| w == b"\r\nOK\r\n"));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_command_sent_after_settle() {
        let driver = PttDriver::from_json_str(
            r#"{
                "name": "T", "deviceName": "T", "type": "spp",
                "write": {"serialDataType": "ascii", "startCmdStr": "5a01", "startCmdStrType": "hex"},
                "read": {
                    "serialDataType": "ascii", "eol": "0D0A",
                    "pttDownKeyIntent": "evt.ptt_down",
                    "intentMap": {"A": "evt.ptt_down"}
                }
            }"#,
        )
        .unwrap();
        let (handle, link, events) = start_pipeline(driver, None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        // Wait for Ready: settle, start command, settle again
        loop {
            match rx.recv().await.unwrap() {
                DeviceEvent::Ready { .. } => break,
                _ => {}
            }
        }
        assert_eq!(link.writes.lock().unwrap().as_slice(), &[vec![0x5a, 0x01]]);
        assert_eq!(handle.state(), DeviceConnectionState::Ready);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_fires_once_per_connection() {
        let (handle, link, events) = start_pipeline(spp_driver(0), None);
        let mut rx = events.subscribe();
        handle.connect();
        link.wait_connected().await;
        link.send(SerialEvent::Connected);
        // Wait for the one Ready side effect
        loop {
            if let DeviceEvent::Ready { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        // Let any stray timers fire; no second Ready may appear
        tokio::time::sleep(Duration::from_secs(2)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, DeviceEvent::Ready { .. }),
                "Ready fired more than once"
            );
        }
        handle.shutdown();
    }
}
