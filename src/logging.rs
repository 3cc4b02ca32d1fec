use crate::error::{QleverError, Result};
use tracing::Level;

/// Maps a `general.log_level` value to a tracing level. Accepts the names
/// used in existing Qleverfiles, case-insensitively.
pub fn parse_level(value: &str) -> Result<Level> {
    match value.trim().to_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warning" | "warn" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        _ => Err(QleverError::InvalidLogLevel(value.to_uppercase())),
    }
}

/// Installs the stderr logger. Messages are printed bare, like the rest of
/// the operator-facing output. A second call is a no-op.
pub fn init(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_writer(std::io::stderr)
        .try_init();
}
