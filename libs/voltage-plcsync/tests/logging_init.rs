//! Global subscriber installation; kept in its own test binary

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use voltage_plcsync::logging::{self, LogConfig};

#[test]
fn test_init_is_idempotent() {
    let config = LogConfig {
        level: "debug".to_string(),
        json: false,
        ansi: false,
    };
    logging::init_with_config(&config).unwrap();
    logging::init("info").unwrap();
    tracing::info!("logging initialized twice without error");
}
