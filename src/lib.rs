// pttlink: turns serial-like transports (BLE GATT, RFCOMM/SPP, HFP, local
// filestreams) into streams of named semantic device events, driven by
// declarative driver documents.

#[macro_use]
pub mod logging;

pub mod events;
pub mod io;
pub mod keymap;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod transform;
