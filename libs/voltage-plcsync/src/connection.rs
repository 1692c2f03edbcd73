//! Connection guard
//!
//! Tracks link health and wraps every transport call in the retry policy.
//!
//! ```text
//! Disconnected --connect ok--> Connected --error--> Degraded --N failures--> Disconnected
//!                                  ^                   |
//!                                  +-----success-------+
//! ```
//!
//! `alive()` only reads cached state. When the cache is older than the probe TTL it
//! schedules one background refresh: a probe while the link is usable, a single
//! connect attempt while it is down. A link closed with `disconnect()` stays closed
//! until the next explicit `connect()`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::Area;
use crate::config::ConnectionConfig;
use crate::transport::{PlcTransport, TransportError, TransportResult};

/// Link state as seen by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Usable, but the last operation failed
    Degraded,
}

impl ConnectionState {
    /// Whether operations may be attempted
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Retry and liveness policy
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub connect_retries: u32,
    pub retry_delay: Duration,
    /// Extra attempts after a failed operation
    pub operation_retries: u32,
    pub failure_threshold: u32,
    pub probe_ttl: Duration,
    pub probe_timeout: Duration,
    pub max_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl GuardPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            connect_retries: config.connect_retries,
            retry_delay: config.retry_delay(),
            operation_retries: config.operation_retries,
            failure_threshold: config.failure_threshold.max(1),
            probe_ttl: config.probe_ttl(),
            probe_timeout: config.probe_timeout(),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based), exponential with optional ±25% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base_ms = self.retry_delay.as_millis() as f64;
        let capped_ms = (base_ms * self.backoff_multiplier.max(1.0).powi(exponent))
            .min(self.max_retry_delay.as_millis() as f64);
        let mut delay = Duration::from_millis(capped_ms as u64);

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }
        delay
    }
}

/// Snapshot of the guard for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct GuardInner {
    state: ConnectionState,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_checked: Option<Instant>,
    /// Set by `disconnect()`; background refresh never reopens a closed link
    closed: bool,
}

pub struct ConnectionGuard {
    transport: Arc<dyn PlcTransport>,
    policy: GuardPolicy,
    inner: Mutex<GuardInner>,
    refreshing: AtomicBool,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("transport", &self.transport.name())
            .field("policy", &self.policy)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl ConnectionGuard {
    pub fn new(transport: Arc<dyn PlcTransport>, policy: GuardPolicy) -> Self {
        Self {
            transport,
            policy,
            inner: Mutex::new(GuardInner {
                state: ConnectionState::Disconnected,
                consecutive_failures: 0,
                last_success: None,
                last_checked: None,
                closed: false,
            }),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PlcTransport> {
        &self.transport
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock();
        ConnectionStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_success: inner.last_success,
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Non-blocking liveness check from cached state
    pub fn alive(self: &Arc<Self>) -> bool {
        let (state, stale, closed) = {
            let inner = self.inner.lock();
            let stale = inner
                .last_checked
                .map_or(true, |t| t.elapsed() >= self.policy.probe_ttl);
            (inner.state, stale, inner.closed)
        };

        if stale && !closed && state != ConnectionState::Connecting {
            self.schedule_refresh();
        }
        state.is_usable()
    }

    fn schedule_refresh(self: &Arc<Self>) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let guard = Arc::clone(self);
                handle.spawn(async move {
                    guard.refresh().await;
                    guard.refreshing.store(false, Ordering::Release);
                });
            },
            Err(_) => {
                debug!("No runtime for background liveness refresh");
                self.refreshing.store(false, Ordering::Release);
            },
        }
    }

    /// One liveness refresh: probe a usable link, or try a single reconnect
    pub async fn refresh(&self) {
        if self.state().is_usable() {
            let probe = tokio::time::timeout(self.policy.probe_timeout, self.transport.probe());
            match probe.await {
                Ok(Ok(())) => self.record_success(),
                Ok(Err(e)) => self.record_failure(&e),
                Err(_) => self.record_failure(&TransportError::Timeout(self.policy.probe_timeout)),
            }
        } else {
            {
                let mut inner = self.inner.lock();
                if inner.closed || inner.state != ConnectionState::Disconnected {
                    return;
                }
                inner.state = ConnectionState::Connecting;
            }
            match self.transport.connect().await {
                Ok(()) => {
                    if self.inner.lock().closed {
                        // closed while the attempt was in flight
                        if let Err(e) = self.transport.disconnect().await {
                            debug!("Close after late reconnect: {}", e);
                        }
                        return;
                    }
                    info!("Reconnected to {}", self.transport.name());
                    self.mark_connected();
                },
                Err(e) => {
                    debug!("Reconnect to {} failed: {}", self.transport.name(), e);
                    let mut inner = self.inner.lock();
                    if inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Disconnected;
                    }
                    inner.last_checked = Some(Instant::now());
                },
            }
        }
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Up to `retries` connect attempts spaced by `retry_delay`
    ///
    /// Expected failures are reported as `false`, never as an error. On failure the
    /// transport is closed and the guard stays Disconnected.
    pub async fn connect(&self, retries: u32, retry_delay: Duration) -> bool {
        let attempts = retries.max(1);
        {
            let mut inner = self.inner.lock();
            inner.closed = false;
            inner.state = ConnectionState::Connecting;
        }

        for attempt in 1..=attempts {
            match self.transport.connect().await {
                Ok(()) => {
                    info!(
                        "Connected to {} (attempt {}/{})",
                        self.transport.name(),
                        attempt,
                        attempts
                    );
                    self.mark_connected();
                    return true;
                },
                Err(e) => {
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.transport.name(),
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay).await;
                    }
                },
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            debug!("Close after failed connect: {}", e);
        }
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Disconnected;
        inner.last_checked = Some(Instant::now());
        false
    }

    /// Connect using the configured retry count and delay
    pub async fn connect_default(&self) -> bool {
        self.connect(self.policy.connect_retries, self.policy.retry_delay).await
    }

    /// Close the link; it stays closed until the next `connect()`
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.state = ConnectionState::Disconnected;
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect from {}: {}", self.transport.name(), e);
        }
    }

    /// Whether the link was closed by `disconnect()`
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // ========================================================================
    // Guarded operations
    // ========================================================================

    /// Run `op` under the retry policy
    ///
    /// Fails fast with `NotConnected` while the link is down. Connection-loss errors
    /// degrade the link and are retried with backoff; device exceptions are returned
    /// as is.
    pub async fn execute<T, F, Fut>(&self, op_name: &str, mut op: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let attempts = self.policy.operation_retries + 1;
        let mut attempt = 0;
        loop {
            if !self.state().is_usable() {
                return Err(TransportError::NotConnected);
            }
            attempt += 1;

            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                },
                Err(e) if !e.is_connection_loss() => {
                    debug!("{} rejected by {}: {}", op_name, self.transport.name(), e);
                    return Err(e);
                },
                Err(e) => {
                    self.record_failure(&e);
                    if attempt >= attempts || !self.state().is_usable() {
                        warn!(
                            "{} on {} failed after {} attempt(s): {}",
                            op_name,
                            self.transport.name(),
                            attempt,
                            e
                        );
                        return Err(e);
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        "{} attempt {}/{} failed: {}, retrying in {:?}",
                        op_name, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    pub async fn read_registers(
        &self,
        area: Area,
        offset: u32,
        count: u16,
    ) -> TransportResult<Bytes> {
        self.execute("read", || self.transport.read_registers(area, offset, count))
            .await
    }

    pub async fn write_registers(
        &self,
        area: Area,
        offset: u32,
        data: Bytes,
    ) -> TransportResult<()> {
        self.execute("write", || {
            self.transport.write_registers(area, offset, data.clone())
        })
        .await
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn mark_connected(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Connected;
        inner.consecutive_failures = 0;
        inner.last_success = Some(Utc::now());
        inner.last_checked = Some(Instant::now());
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.state == ConnectionState::Degraded {
            info!(
                "Link to {} recovered after {} failure(s)",
                self.transport.name(),
                inner.consecutive_failures
            );
        }
        inner.state = ConnectionState::Connected;
        inner.consecutive_failures = 0;
        inner.last_success = Some(Utc::now());
        inner.last_checked = Some(Instant::now());
    }

    fn record_failure(&self, error: &TransportError) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_checked = Some(Instant::now());
        if inner.consecutive_failures >= self.policy.failure_threshold {
            if inner.state != ConnectionState::Disconnected {
                warn!(
                    "Link to {} down after {} consecutive failures: {}",
                    self.transport.name(),
                    inner.consecutive_failures,
                    error
                );
            }
            inner.state = ConnectionState::Disconnected;
        } else if inner.state.is_usable() {
            inner.state = ConnectionState::Degraded;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::RegionSizes;
    use crate::transport::SimulatedPlc;
    use tracing_test::traced_test;

    fn policy() -> GuardPolicy {
        GuardPolicy {
            connect_retries: 2,
            retry_delay: Duration::from_millis(5),
            operation_retries: 1,
            failure_threshold: 3,
            probe_ttl: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn setup() -> (Arc<SimulatedPlc>, Arc<ConnectionGuard>) {
        let plc = Arc::new(SimulatedPlc::new(&RegionSizes {
            input: 4,
            output: 4,
            memory: 8,
        }));
        let guard = Arc::new(ConnectionGuard::new(plc.clone(), policy()));
        (plc, guard)
    }

    #[test]
    fn test_backoff_without_jitter() {
        let mut p = policy();
        p.retry_delay = Duration::from_millis(100);
        p.max_retry_delay = Duration::from_millis(350);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let mut p = policy();
        p.retry_delay = Duration::from_millis(100);
        p.jitter = true;
        for _ in 0..50 {
            let d = p.delay_for(1).as_millis();
            assert!((75..=125).contains(&d), "delay {} out of range", d);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_success_and_failure() {
        let (plc, guard) = setup();
        assert!(guard.connect(2, Duration::from_millis(1)).await);
        assert_eq!(guard.state(), ConnectionState::Connected);
        assert!(guard.status().last_success.is_some());

        plc.set_online(false);
        assert!(!guard.connect(3, Duration::from_millis(1)).await);
        assert_eq!(guard.state(), ConnectionState::Disconnected);
        // one successful attempt, then three failed ones
        assert_eq!(plc.connect_count(), 4);
        assert!(logs_contain("Connect attempt 3/3 to simulator failed"));
    }

    #[tokio::test]
    async fn test_degraded_then_disconnected() {
        let (plc, guard) = setup();
        guard.connect(1, Duration::ZERO).await;

        plc.fail_next(1);
        // first attempt fails, retry succeeds
        assert!(guard.read_registers(Area::Memory, 0, 1).await.is_ok());
        assert_eq!(guard.state(), ConnectionState::Connected);

        plc.fail_next(2);
        assert!(guard.read_registers(Area::Memory, 0, 1).await.is_err());
        assert_eq!(guard.state(), ConnectionState::Degraded);
        assert_eq!(guard.status().consecutive_failures, 2);

        plc.fail_next(1);
        assert!(guard.read_registers(Area::Memory, 0, 1).await.is_err());
        assert_eq!(guard.state(), ConnectionState::Disconnected);

        assert_eq!(
            guard.read_registers(Area::Memory, 0, 1).await.unwrap_err(),
            TransportError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_exception_does_not_degrade() {
        let (_plc, guard) = setup();
        guard.connect(1, Duration::ZERO).await;
        let err = guard.read_registers(Area::Memory, 10, 1).await.unwrap_err();
        assert_eq!(err, TransportError::Exception(0x02));
        assert_eq!(guard.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_background_refresh_reconnects() {
        let (plc, guard) = setup();
        plc.set_online(false);
        assert!(!guard.alive());

        plc.set_online(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !guard.alive() {
            assert!(Instant::now() < deadline, "guard never reconnected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(guard.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_not_undone_by_refresh() {
        let (plc, guard) = setup();
        assert!(guard.connect(1, Duration::ZERO).await);
        guard.disconnect().await;
        assert!(guard.is_closed());

        for _ in 0..6 {
            assert!(!guard.alive());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        guard.refresh().await;
        assert!(!plc.is_connected());
        assert_eq!(guard.state(), ConnectionState::Disconnected);
        assert_eq!(plc.connect_count(), 1);

        // an explicit connect reopens and re-enables background recovery
        assert!(guard.connect(1, Duration::ZERO).await);
        assert!(!guard.is_closed());
        plc.set_online(false);
        plc.set_online(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !plc.is_connected() || !guard.alive() {
            assert!(Instant::now() < deadline, "guard never recovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
