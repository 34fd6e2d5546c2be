//! Logging initialization.
//!
//! Sets up structured logging with tracing and optional JSON output.

use crate::error::VmError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global tracing subscriber.
///
/// Embedders that already installed a subscriber keep theirs; the call then
/// only reports it at debug level.
pub fn init_tracing(log_level: &str, json_format: bool) -> Result<(), VmError> {
    let filter = EnvFilter::try_new(log_level).map_err(|e| VmError::Config(e.to_string()))?;

    let installed = if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        assert!(init_tracing("kchain_vm=debug", false).is_ok());
        assert!(init_tracing("kchain_vm=debug", true).is_ok());
    }

    #[test]
    fn test_invalid_filter() {
        assert!(matches!(init_tracing("kchain_vm=notalevel", false), Err(VmError::Config(_))));
    }
}
