// src/service.rs
//
// Service host surface: one pipeline per device record, plus the two
// out-of-band lifecycle triggers ("disconnect now" / "reconnect now") a
// shell or notification action may invoke. Status and intent fan-out goes
// through the shared event broadcaster.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::events::EventBroadcaster;
use crate::model::{Device, PttDriver};
use crate::pipeline::{self, DeviceConnectionState, PipelineConfig, PipelineHandle};

pub struct ServiceManager {
    events: EventBroadcaster,
    pipelines: Mutex<HashMap<i64, PipelineHandle>>,
}

impl ServiceManager {
    pub fn new(events: EventBroadcaster) -> ServiceManager {
        ServiceManager {
            events,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Create (or recreate) the pipeline for a device record. A descriptor
    /// that fails validation is rejected outright - no session is created.
    pub fn start(&self, device: &Device, driver: PttDriver) -> Result<PipelineHandle, String> {
        let report = driver.validate();
        if !report.is_empty() {
            return Err(format!(
                "driver '{}' failed validation:\n{}",
                driver.driver_name.as_deref().unwrap_or("?"),
                report
            ));
        }
        self.stop(device.id);
        let handle = pipeline::spawn_with_defaults(
            PipelineConfig {
                driver,
                device: device.clone(),
                // The device record owns the key-down delay once bound
                ptt_down_delay_override: Some(device.ptt_down_delay),
            },
            self.events.clone(),
        );
        if device.auto_connect {
            handle.connect();
        }
        self.pipelines
            .lock()
            .expect("pipeline map poisoned")
            .insert(device.id, handle.clone());
        Ok(handle)
    }

    pub fn handle(&self, device_id: i64) -> Option<PipelineHandle> {
        self.pipelines
            .lock()
            .expect("pipeline map poisoned")
            .get(&device_id)
            .cloned()
    }

    pub fn state(&self, device_id: i64) -> Option<DeviceConnectionState> {
        self.handle(device_id).map(|handle| handle.state())
    }

    /// Notification-action trigger: tear the session down now.
    pub fn disconnect_now(&self, device_id: i64) -> bool {
        match self.handle(device_id) {
            Some(handle) => {
                handle.disconnect();
                true
            }
            None => false,
        }
    }

    /// Notification-action trigger: connect again now.
    pub fn reconnect_now(&self, device_id: i64) -> bool {
        match self.handle(device_id) {
            Some(handle) => {
                handle.connect();
                true
            }
            None => false,
        }
    }

    pub fn stop(&self, device_id: i64) {
        let handle = self
            .pipelines
            .lock()
            .expect("pipeline map poisoned")
            .remove(&device_id);
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    pub fn stop_all(&self) {
        let handles: Vec<PipelineHandle> = {
            let mut map = self.pipelines.lock().expect("pipeline map poisoned");
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.shutdown();
        }
    }
}
