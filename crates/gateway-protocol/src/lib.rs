//! Wire codec, identifier validation, device/module registry, and per-device
//! persistence for the gateway bridge. No network or serial I/O lives here —
//! see `gateway-bridge` for the daemon that drives this against real
//! transports.

pub mod codec;
pub mod ids;
pub mod persistence;
pub mod registry;
