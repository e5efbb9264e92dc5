// src/io/spp.rs
//
// SPP transport variant. The platform exposes a bonded RFCOMM channel as a
// serial device node (/dev/rfcomm0, /dev/cu.<device>-SPP, COMx); the device
// record's address names that node. The socket read is blocking, so the
// variant runs a dedicated reader thread; writes hand off to that thread
// through a transmit channel and complete asynchronously.

use async_trait::async_trait;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::io::{DataSource, LinkMonitor, SerialEvent, SerialEventSender, SerialTransport, TransportError};

/// RFCOMM ignores line speed; the serial layer still wants one.
const RFCOMM_BAUD: u32 = 115_200;
const TRANSMIT_QUEUE_DEPTH: usize = 32;
const WRITE_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Write request handed to the reader thread.
pub(crate) struct TransmitRequest {
    pub data: Vec<u8>,
    pub result_tx: oneshot::Sender<Result<(), String>>,
}

pub(crate) type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;

/// Shared connection state between the transport handle and its reader
/// thread.
pub(crate) struct StreamShared {
    pub cancel: AtomicBool,
    pub connected: AtomicBool,
    pub transmit_tx: Mutex<Option<TransmitSender>>,
}

impl StreamShared {
    pub fn new() -> Arc<StreamShared> {
        Arc::new(StreamShared {
            cancel: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            transmit_tx: Mutex::new(None),
        })
    }
}

/// Open the port and run the blocking read loop until cancellation, EOF or
/// error. Shared by the SPP and HFP variants.
pub(crate) fn run_stream_blocking(
    port_path: String,
    shared: Arc<StreamShared>,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    listener: SerialEventSender,
) {
    // Short timeout so cancellation and queued writes are observed promptly
    let port = match serialport::new(&port_path, RFCOMM_BAUD)
        .timeout(Duration::from_millis(10))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            shared.connected.store(false, Ordering::SeqCst);
            let _ = listener.send(SerialEvent::ConnectError(format!(
                "Failed to open {}: {}",
                port_path, e
            )));
            return;
        }
    };
    let port = Arc::new(Mutex::new(port));
    tlog!("[spp] opened {}", port_path);
    shared.connected.store(true, Ordering::SeqCst);
    let _ = listener.send(SerialEvent::Connected);

    let mut buf = [0u8; 1024];
    loop {
        if shared.cancel.load(Ordering::SeqCst) {
            break;
        }

        // Process pending transmit requests (non-blocking)
        while let Ok(request) = transmit_rx.try_recv() {
            let result = match port.lock() {
                Ok(mut guard) => guard
                    .write_all(&request.data)
                    .and_then(|_| guard.flush())
                    .map_err(|e| format!("write error: {}", e)),
                Err(e) => Err(format!("port mutex poisoned: {}", e)),
            };
            let _ = request.result_tx.send(result);
        }

        let read_result = match port.lock() {
            Ok(mut guard) => guard.read(&mut buf),
            Err(e) => {
                tlog!("[spp] mutex poisoned in read loop: {}", e);
                break;
            }
        };
        match read_result {
            Ok(n) if n > 0 => {
                let _ = listener.send(SerialEvent::Data {
                    data: buf[..n].to_vec(),
                    source: DataSource::Stream,
                });
            }
            Ok(_) => {
                // Port closed from the other side
                shared.connected.store(false, Ordering::SeqCst);
                let _ = listener.send(SerialEvent::Disconnected);
                return;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeouts are the idle case for serial reads
            }
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if !shared.cancel.load(Ordering::SeqCst) {
                    let _ = listener.send(SerialEvent::IoError(format!("read error: {}", e)));
                }
                return;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

/// Start a connection: spawns the blocking reader and wires the transmit
/// channel into the shared state.
pub(crate) async fn start_stream(
    port_path: &str,
    shared: &Arc<StreamShared>,
    listener: SerialEventSender,
) -> Result<(), TransportError> {
    if shared.connected.load(Ordering::SeqCst) || shared_has_transmit(shared) {
        return Err(TransportError::AlreadyConnected);
    }
    shared.cancel.store(false, Ordering::SeqCst);
    let (transmit_tx, transmit_rx) = std_mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);
    {
        let mut guard = shared
            .transmit_tx
            .lock()
            .map_err(|e| TransportError::Connect(format!("transmit channel poisoned: {}", e)))?;
        *guard = Some(transmit_tx);
    }
    let port_path = port_path.to_string();
    let shared = shared.clone();
    tokio::task::spawn_blocking(move || {
        run_stream_blocking(port_path, shared.clone(), transmit_rx, listener);
        // The loop owns the channel's life: tear it down on the way out
        if let Ok(mut guard) = shared.transmit_tx.lock() {
            *guard = None;
        }
    });
    Ok(())
}

fn shared_has_transmit(shared: &Arc<StreamShared>) -> bool {
    shared
        .transmit_tx
        .lock()
        .map(|guard| guard.is_some())
        .unwrap_or(false)
}

/// Queue a write through the reader thread and await its completion.
pub(crate) async fn stream_write(
    shared: &Arc<StreamShared>,
    data: &[u8],
) -> Result<(), TransportError> {
    if !shared.connected.load(Ordering::SeqCst) {
        return Err(TransportError::NotConnected);
    }
    let tx = {
        let guard = shared
            .transmit_tx
            .lock()
            .map_err(|e| TransportError::Io(format!("transmit channel poisoned: {}", e)))?;
        guard.clone().ok_or(TransportError::NotConnected)?
    };
    let (result_tx, result_rx) = oneshot::channel();
    tx.try_send(TransmitRequest {
        data: data.to_vec(),
        result_tx,
    })
    .map_err(|e| TransportError::Io(format!("failed to queue write: {}", e)))?;
    match tokio::time::timeout(WRITE_REPLY_TIMEOUT, result_rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(TransportError::Io(e)),
        Ok(Err(_)) => Err(TransportError::Io("write dropped".to_string())),
        Err(_) => Err(TransportError::Io("write timed out".to_string())),
    }
}

pub(crate) async fn stop_stream(shared: &Arc<StreamShared>) {
    shared.cancel.store(true, Ordering::SeqCst);
    if let Ok(mut guard) = shared.transmit_tx.lock() {
        *guard = None;
    }
    shared.connected.store(false, Ordering::SeqCst);
}

// ============================================================================
// Transport
// ============================================================================

pub struct SppTransport {
    port_path: String,
    display_name: String,
    shared: Arc<StreamShared>,
    listener: Mutex<Option<SerialEventSender>>,
}

impl SppTransport {
    pub fn new(port_path: &str, display_name: &str) -> SppTransport {
        SppTransport {
            port_path: port_path.to_string(),
            display_name: display_name.to_string(),
            shared: StreamShared::new(),
            listener: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SerialTransport for SppTransport {
    fn name(&self) -> String {
        if self.display_name.is_empty() {
            self.port_path.clone()
        } else {
            self.display_name.clone()
        }
    }

    fn address(&self) -> String {
        self.port_path.clone()
    }

    async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError> {
        tlog!("[spp] connect {}", self.port_path);
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(listener.clone());
        }
        start_stream(&self.port_path, &self.shared, listener).await
    }

    async fn disconnect(&mut self, silent: bool) {
        tlog!("[spp] disconnect {} (silent: {})", self.port_path, silent);
        stop_stream(&self.shared).await;
        if !silent {
            if let Ok(guard) = self.listener.lock() {
                if let Some(listener) = guard.as_ref() {
                    let _ = listener.send(SerialEvent::Disconnected);
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        stream_write(&self.shared, data).await
    }
}

// ============================================================================
// Link state
// ============================================================================

/// Reconnection guard for serial-node transports: the link counts as present
/// while the platform still enumerates the device node.
pub struct SerialPortMonitor;

#[async_trait]
impl LinkMonitor for SerialPortMonitor {
    async fn link_present(&self, address: &str) -> bool {
        match serialport::available_ports() {
            Ok(ports) => ports.iter().any(|p| p.port_name == address),
            Err(_) => std::path::Path::new(address).exists(),
        }
    }
}
