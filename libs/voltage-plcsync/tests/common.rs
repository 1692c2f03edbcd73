//! Shared fixtures for the PLC mirror integration tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::{Duration, Instant};

use voltage_plcsync::{PlcConfig, PlcContext, RegionSizes, SimulatedPlc, WordOrder};

/// Word2 = bytes 4..5, Status = byte 6, Run = byte 8 bit 0,
/// Total = bytes 12..15, Delay = bytes 16..19, Limit = bytes 20..21
pub const DECLARATIONS: &str = r"
// Test process image
Word2    AT %MW2   : WORD;              // shared word
Status   AT %MB6   : BYTE;              // status byte
Run      AT %MX8.0 : BOOL;              // run flag
Total    AT %MD3   : DWORD;             // counter
Delay    AT %MD4   : TIME := T#500ms;   // on-delay
Limit    AT %MW10  : WORD := 1000;      // upper limit (RO)
Sensor   AT %IW0   : WORD;              // field input
Out      AT %QB0   : BYTE;              // output byte
";

pub fn config(word_order: WordOrder) -> PlcConfig {
    let mut config = PlcConfig::new(word_order);
    config.regions = RegionSizes {
        input: 16,
        output: 16,
        memory: 64,
    };
    config.connection.retry_delay_ms = 5;
    config.connection.operation_retries = 1;
    config.connection.failure_threshold = 2;
    config.connection.probe_ttl_ms = 20;
    config.connection.probe_timeout_ms = 100;
    config.connection.max_retry_delay_ms = 20;
    config.connection.jitter = false;
    config.polling.default_interval_ms = 20;
    config.polling.stop_grace_ms = 300;
    config
}

pub fn context_with(word_order: WordOrder, declarations: &str) -> (Arc<SimulatedPlc>, PlcContext) {
    let config = config(word_order);
    let plc = Arc::new(SimulatedPlc::new(&config.regions));
    let ctx = PlcContext::from_declarations(config, declarations, plc.clone()).unwrap();
    (plc, ctx)
}

/// Context over [`DECLARATIONS`], already connected to a fresh simulator
pub async fn connected_context() -> (Arc<SimulatedPlc>, PlcContext) {
    let (plc, ctx) = context_with(WordOrder::LowWordFirst, DECLARATIONS);
    ctx.connect(1, Duration::ZERO).await.unwrap();
    (plc, ctx)
}

/// Poll `condition` every 5ms until it holds; panics after `timeout`
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
