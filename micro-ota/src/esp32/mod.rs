//! ESP32 bindings: an [`crate::common::target::UpdateTarget`] backed by the
//! inactive app partition, plus helpers for reading the running firmware
//! version and handing control to a staged image.

pub mod ota;

pub use esp_idf_svc;
