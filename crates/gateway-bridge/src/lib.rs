//! The gateway bridge daemon: configuration, both transports, the
//! dispatcher, and the controller that drives them. Exposed as a library
//! too so the protocol-level behaviour (dispatch, registry, persistence)
//! can be exercised directly from `tests/`, the same split the teacher
//! keeps between its protocol crate and its daemon binaries.

pub mod bandwidth;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod liveness;
pub mod mqtt;
pub mod script;
pub mod serial;
pub mod signals;
