//! Logging bootstrap. The core only initializes a `tracing` subscriber; the
//! actual log sink/rotation policy (`log_max_files`, `log_retention_days`,
//! `log_max_size_mb` in `Config`) belongs to the external logger service.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber at `level` if one is not already
/// installed. Safe to call more than once (e.g. once per test).
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
