//! VoltageEMS PLC mirror
//!
//! Mirrors a PLC memory image (`%I`, `%Q`, `%M` areas addressed as `%MW2`,
//! `%MB6`, `%MX8.0`, `%MD0`) onto named, typed variables. Every declared Word,
//! DWord and Byte expands into byte and bit aliases that share the same storage, so
//! a write through any view is immediately visible through all the others.
//! Polling groups refresh the mirror from the device on their own cadence.
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltage_plcsync::{PlcConfig, PlcContext, SimulatedPlc, Value, WordOrder};
//!
//! # async fn demo() -> voltage_plcsync::Result<()> {
//! let config = PlcConfig::new(WordOrder::LowWordFirst);
//! let plc = Arc::new(SimulatedPlc::new(&config.regions));
//! let ctx = PlcContext::from_declarations(
//!     config,
//!     "Speed AT %MW2 : WORD; // motor speed",
//!     plc,
//! )?;
//!
//! ctx.connect(3, std::time::Duration::from_millis(200)).await?;
//! ctx.write_var("Speed", Value::Word(0x00FF), false).await?;
//! assert_eq!(ctx.read_var("Speed_LowByte")?, Value::Byte(0xFF));
//!
//! ctx.add_polling_group("fast", &["Speed"], 100, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod address_space;
pub mod config;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod logging;
pub mod polling;
pub mod registry;
pub mod sync;
pub mod tracker;
pub mod transport;
pub mod value;

pub use address::{AccessSize, Address, Area, IecAddress, WordOrder};
pub use address_space::{AddressSpace, RegionMemory};
pub use config::{ConnectionConfig, PlcConfig, PollingConfig, RegionSizes};
pub use connection::{ConnectionGuard, ConnectionState, ConnectionStatus, GuardPolicy};
pub use context::PlcContext;
pub use descriptor::{load_declarations, parse_declarations, VarKind, VariableDescriptor};
pub use error::{PlcError, Result};
pub use logging::LogConfig;
pub use polling::{GroupSnapshot, PollingScheduler, RunState};
pub use registry::{AliasRole, VarId, Variable, VariableRegistry};
pub use sync::{Propagation, SyncEngine};
pub use tracker::{ChangeReader, ChangeTracker, ReaderId};
pub use transport::{PlcTransport, SimulatedPlc, TransportError};
pub use value::Value;
