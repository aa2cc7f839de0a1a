//! Bluetooth communication layer.
//!
//! L2CAP transport, the per-accessory link session and adapter discovery.

pub mod discovery;
pub mod l2cap;
pub mod session;
