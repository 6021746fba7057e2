//! Structured logging utilities for Strata components.
//!
//! Provides consistent logging with component prefixes and structured fields.

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const PACK: &'static str = "PACK";
    pub const MDLOG: &'static str = "MDLOG";
    pub const MOUNT: &'static str = "MOUNT";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::PACK, "PACK");
        assert_eq!(Component::MDLOG, "MDLOG");
        assert_eq!(Component::MOUNT, "MOUNT");
    }
}
