// src/io/filestream.rs
//
// Local filestream variant: watches files instead of a radio link. Each
// watched file gets a polling thread that picks up appended data (and
// rewrites, via truncate detection) and reports it tagged with the file
// path; the driver's per-file transform and intent map do the rest in the
// dispatch pipeline.

use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::io::{DataSource, SerialEvent, SerialEventSender, SerialTransport, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct FilestreamTransport {
    address: String,
    display_name: String,
    files: Vec<String>,
    cancel: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    listener: Mutex<Option<SerialEventSender>>,
}

impl FilestreamTransport {
    pub fn new(address: &str, display_name: &str, files: Vec<String>) -> FilestreamTransport {
        FilestreamTransport {
            address: address.to_string(),
            display_name: display_name.to_string(),
            files,
            cancel: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        }
    }
}

/// Poll one file for appended data until cancelled. A shrinking file is
/// treated as rewritten: the offset resets and the new content is picked up
/// whole on the next tick.
fn watch_file_blocking(path: String, cancel: Arc<AtomicBool>, listener: SerialEventSender) {
    let mut offset: u64 = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    tlog!("[filestream] watching {} from offset {}", path, offset);
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            // The file may not exist yet; keep watching
            Err(_) => continue,
        };
        if len < offset {
            offset = 0;
        }
        if len > offset {
            match read_from(&path, offset, len) {
                Ok(data) => {
                    offset = len;
                    if !data.is_empty() {
                        let _ = listener.send(SerialEvent::Data {
                            data,
                            source: DataSource::File(path.clone()),
                        });
                    }
                }
                Err(e) => {
                    tlog!("[filestream] read of {} failed: {}", path, e);
                }
            }
        }
    }
}

fn read_from(path: &str, offset: u64, len: u64) -> Result<Vec<u8>, String> {
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| e.to_string())?;
    let mut data = vec![0u8; (len - offset) as usize];
    file.read_exact(&mut data).map_err(|e| e.to_string())?;
    Ok(data)
}

#[async_trait]
impl SerialTransport for FilestreamTransport {
    fn name(&self) -> String {
        if self.display_name.is_empty() {
            "filestream".to_string()
        } else {
            self.display_name.clone()
        }
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&mut self, listener: SerialEventSender) -> Result<(), TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        self.cancel.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(listener.clone());
        }
        for path in &self.files {
            let path = path.clone();
            let cancel = self.cancel.clone();
            let listener = listener.clone();
            tokio::task::spawn_blocking(move || watch_file_blocking(path, cancel, listener));
        }
        // Watchers are up; there is no negotiation to wait for
        let _ = listener.send(SerialEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self, silent: bool) {
        tlog!("[filestream] disconnect (silent: {})", silent);
        self.cancel.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if !silent {
            if let Ok(guard) = self.listener.lock() {
                if let Some(listener) = guard.as_ref() {
                    let _ = listener.send(SerialEvent::Disconnected);
                }
            }
        }
    }

    async fn write(&self, _data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Err(TransportError::Io("filestream is read-only".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial_event_channel;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pttlink-test-{}-{}", std::process::id(), name));
        path
    }

    #[tokio::test]
    async fn test_appended_data_is_reported() {
        let path = temp_path("append");
        std::fs::write(&path, b"seed\n").unwrap();
        let (tx, mut rx) = serial_event_channel();
        let mut transport = FilestreamTransport::new(
            "local:test",
            "test",
            vec![path.to_string_lossy().into_owned()],
        );
        transport.connect(tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SerialEvent::Connected)));

        // Pre-existing content is not replayed; appended content is
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"down\n").unwrap();
        }
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        match event {
            SerialEvent::Data { data, source } => {
                assert_eq!(data, b"down\n".to_vec());
                assert_eq!(
                    source,
                    DataSource::File(path.to_string_lossy().into_owned())
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }

        transport.disconnect(true).await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_truncated_file_resets_offset() {
        let path = temp_path("truncate");
        std::fs::write(&path, b"longer seed content\n").unwrap();
        let (tx, mut rx) = serial_event_channel();
        let mut transport = FilestreamTransport::new(
            "local:test",
            "test",
            vec![path.to_string_lossy().into_owned()],
        );
        transport.connect(tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SerialEvent::Connected)));

        // Rewrite shorter: offset resets and the new content is reported
        std::fs::write(&path, b"up\n").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        match event {
            SerialEvent::Data { data, .. } => assert_eq!(data, b"up\n".to_vec()),
            other => panic!("unexpected event: {:?}", other),
        }

        transport.disconnect(true).await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let (tx, _rx) = serial_event_channel();
        let (tx2, _rx2) = serial_event_channel();
        let mut transport = FilestreamTransport::new("local:test", "test", vec![]);
        transport.connect(tx).await.unwrap();
        assert!(matches!(
            transport.connect(tx2).await,
            Err(TransportError::AlreadyConnected)
        ));
        transport.disconnect(true).await;
    }
}
