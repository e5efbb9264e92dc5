// src/io/error.rs
//
// Error taxonomy for the transport layer. `Connect` covers everything that
// fails before a session reaches Connected; `Io` covers failures after.
// Both are recoverable - the pipeline resets to Disconnected and evaluates
// reconnection policy. Lower-level helpers use plain String errors and are
// mapped at this boundary.

use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    /// No characteristic on the live device matched the driver descriptor.
    #[error("no serial profile found")]
    NoSerialProfileFound,

    #[error("write characteristic {0} not writable")]
    NotWritable(Uuid),

    #[error("no indication/notification for read characteristic {0}")]
    NoNotifySupport(Uuid),

    /// Transport or negotiation failure before reaching Connected.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Failure after Connected (write failure, unexpected disconnect).
    #[error("i/o error: {0}")]
    Io(String),
}
