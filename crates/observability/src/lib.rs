//! Process-wide tracing setup shared by lymbo binaries.

/// Initialize tracing for the process from `RUST_LOG` / `LYMBO_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let _ = tracing::init(tracing::TracingConfig::from_env());
}

/// Subscriber configuration and installation.
pub mod tracing;
