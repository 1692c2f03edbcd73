//! Device transport abstraction
//!
//! The mirror never speaks a wire protocol itself. A transport moves 16-bit
//! registers of one memory area; register `r` covers area bytes `2r` and `2r + 1`
//! and payloads are in area image order.

pub mod simulator;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::address::Area;

pub use simulator::SimulatedPlc;

/// Transport failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No open connection to the device
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Device rejected the request with an exception code
    #[error("Device exception 0x{0:02X}")]
    Exception(u8),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Errors that indicate the link itself is gone rather than a rejected request
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::ConnectionFailed(_)
                | TransportError::Io(_)
                | TransportError::Timeout(_)
        )
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Register-level access to one PLC
#[async_trait]
pub trait PlcTransport: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    /// Read `count` registers starting at register `offset`
    async fn read_registers(&self, area: Area, offset: u32, count: u16) -> TransportResult<Bytes>;

    /// Write `data.len() / 2` registers starting at register `offset`
    async fn write_registers(&self, area: Area, offset: u32, data: Bytes) -> TransportResult<()>;

    /// Cheap liveness check
    async fn probe(&self) -> TransportResult<()> {
        self.read_registers(Area::Memory, 0, 1).await.map(|_| ())
    }
}
