//! `AirPods` protocol implementation.
//!
//! Frame codec, model catalog, device recognition and the shared device
//! state store.

pub mod model;
pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod state;
