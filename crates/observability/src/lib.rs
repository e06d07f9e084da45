//! Tracing and logging (shared setup).

/// Log output format and subscriber installation.
pub mod logging;

pub use logging::{LogFormat, ParseLogFormatError};

/// Initialize process-wide logging from `LOG_FORMAT` and `RUST_LOG`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init();
}
