pub mod common;

#[cfg(feature = "esp32")]
pub mod esp32;

#[cfg(feature = "native")]
pub mod native;
