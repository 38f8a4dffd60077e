//! Console logging for native builds.

/// Installs the process logger: `RUST_LOG` filtered, `info` by default,
/// millisecond timestamps.
pub fn initialize_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .try_init();
}
