//! Platform-independent pieces of the update coordinator.
//!
//! - [config]: immutable connection and cadence parameters
//! - [version]: firmware version identity and the application descriptor
//! - [transport]: metadata/image fetch contracts and the HTTP/2 implementation
//! - [target]: the update slot written during a download
//! - [ota]: the update state machine
//! - [sched]: periodic polling with pause/resume
//! - [exec]: futures execution helpers

pub mod config;
pub mod exec;
pub mod ota;
pub mod sched;
pub mod target;
#[cfg(test)]
pub(crate) mod testutil;
pub mod transport;
pub mod version;
