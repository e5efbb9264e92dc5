// src/events.rs
//
// Status/event egress. The pipeline publishes everything a consumer (GUI
// shell, system broadcast, CLI) might care about on a broadcast channel:
// status text, connect/disconnect edges, battery level and the semantic
// intents themselves. Replaces the Android broadcast-intent fan-out of the
// original service with an explicit channel.

use tokio::sync::broadcast;

use crate::keymap;

/// Key action for synthetic key injection. Values follow the Android
/// KeyEvent convention drivers encode in their intent names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    pub fn from_code(code: i64) -> KeyAction {
        if code == 1 {
            KeyAction::Up
        } else {
            KeyAction::Down
        }
    }
}

/// A synthetic key press carried by an intent of the form
/// `<action>:<KEYCODE_NAME>,<action-code>`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyStroke {
    pub name: String,
    pub code: u16,
    pub action: KeyAction,
}

/// One event on the egress channel.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Status { message: String },
    Connected { name: String, address: String },
    Disconnected { name: String, address: String },
    /// The session reached Ready; fires exactly once per connection.
    /// Consumers hang audio cues off this.
    Ready { name: String, address: String },
    Battery { level: u8, name: String, address: String },
    Intent { action: String, key: Option<KeyStroke> },
}

/// Split an intent name into the action to broadcast and an optional key
/// stroke. `"com.app.PTT:KEYCODE_HEADSETHOOK,0"` becomes the action
/// `"com.app.PTT"` plus a HEADSETHOOK key-down.
pub fn parse_intent(intent: &str) -> (String, Option<KeyStroke>) {
    if let (Some(colon), true) = (intent.find(':'), intent.contains(',')) {
        let action = &intent[..colon];
        let event_data = &intent[colon + 1..];
        let mut parts = event_data.splitn(2, ',');
        let key_name = parts.next().unwrap_or_default();
        let action_code = parts
            .next()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if let Some(code) = keymap::key_code_from_string(key_name) {
            return (
                action.to_string(),
                Some(KeyStroke {
                    name: key_name.to_string(),
                    code,
                    action: KeyAction::from_code(action_code),
                }),
            );
        }
        tlog!("[events] Unknown key code in intent: {}", key_name);
        return (action.to_string(), None);
    }
    (intent.to_string(), None)
}

/// Broadcast fan-out for device events. Cheap to clone; every subscriber
/// gets every event. Slow subscribers lag and drop, they never block the
/// pipeline.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> EventBroadcaster {
        let (tx, _) = broadcast::channel(capacity);
        EventBroadcaster { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: DeviceEvent) {
        // No receivers is fine - events are best-effort fan-out
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tlog!("[status] {}", message);
        self.send(DeviceEvent::Status { message });
    }

    pub fn device_connected(&self, name: &str, address: &str) {
        self.send(DeviceEvent::Connected {
            name: name.to_string(),
            address: address.to_string(),
        });
    }

    pub fn device_disconnected(&self, name: &str, address: &str) {
        self.send(DeviceEvent::Disconnected {
            name: name.to_string(),
            address: address.to_string(),
        });
    }

    pub fn device_ready(&self, name: &str, address: &str) {
        self.send(DeviceEvent::Ready {
            name: name.to_string(),
            address: address.to_string(),
        });
    }

    pub fn battery(&self, level: u8, name: &str, address: &str) {
        self.send(DeviceEvent::Battery {
            level,
            name: name.to_string(),
            address: address.to_string(),
        });
    }

    pub fn intent(&self, intent: &str) {
        let (action, key) = parse_intent(intent);
        tlog!("[events] Sending intent: {}", action);
        self.send(DeviceEvent::Intent { action, key });
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        EventBroadcaster::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_intent() {
        let (action, key) = parse_intent("com.example.ptt.down");
        assert_eq!(action, "com.example.ptt.down");
        assert!(key.is_none());
    }

    #[test]
    fn test_parse_key_intent() {
        let (action, key) = parse_intent("com.example.ptt:KEYCODE_HEADSETHOOK,0");
        assert_eq!(action, "com.example.ptt");
        let key = key.unwrap();
        assert_eq!(key.code, 79);
        assert_eq!(key.action, KeyAction::Down);

        let (_, key) = parse_intent("com.example.ptt:KEYCODE_HEADSETHOOK,1");
        assert_eq!(key.unwrap().action, KeyAction::Up);
    }

    #[test]
    fn test_parse_unknown_key_falls_back() {
        let (action, key) = parse_intent("com.example.ptt:KEYCODE_BOGUS,0");
        assert_eq!(action, "com.example.ptt");
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let broadcaster = EventBroadcaster::new(8);
        let mut rx_a = broadcaster.subscribe();
        let mut rx_b = broadcaster.subscribe();
        broadcaster.intent("evt.channel_up");
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                DeviceEvent::Intent { action, .. } => assert_eq!(action, "evt.channel_up"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
