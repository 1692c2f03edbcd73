//! Variable-level device I/O on top of register transfers
//!
//! Words and double words map onto whole registers. Bytes and bits live inside a
//! register, so writing them is a read-modify-write of the covering register.

use bytes::Bytes;
use tracing::trace;

use crate::address::AccessSize;
use crate::connection::ConnectionGuard;
use crate::error::Result;
use crate::registry::Variable;
use crate::transport::TransportError;

/// Read the raw value of `var` from the device
pub async fn read_variable(guard: &ConnectionGuard, var: &Variable) -> Result<u32> {
    let addr = var.address();
    let (first, count) = addr.register_span();
    let data = guard.read_registers(addr.area, first, count).await?;
    if data.len() != usize::from(count) * 2 {
        return Err(TransportError::Malformed(format!(
            "{}: expected {} bytes, got {}",
            var.name(),
            usize::from(count) * 2,
            data.len()
        ))
        .into());
    }
    let raw = addr.load(&data, first as usize * 2)?;
    trace!("Device read {} = {:#X}", var.name(), raw);
    Ok(raw)
}

/// Write the raw value of `var` to the device
pub async fn write_variable(guard: &ConnectionGuard, var: &Variable, raw: u32) -> Result<()> {
    let addr = var.address();
    let (first, count) = addr.register_span();
    let base = first as usize * 2;

    let mut buf = match addr.size {
        AccessSize::Word | AccessSize::DWord => vec![0u8; usize::from(count) * 2],
        AccessSize::Byte | AccessSize::Bit => {
            let current = guard.read_registers(addr.area, first, count).await?;
            if current.len() != usize::from(count) * 2 {
                return Err(TransportError::Malformed(format!(
                    "{}: short read before write",
                    var.name()
                ))
                .into());
            }
            current.to_vec()
        },
    };
    addr.store(&mut buf, base, raw)?;
    guard
        .write_registers(addr.area, first, Bytes::from(buf))
        .await?;
    trace!("Device write {} = {:#X}", var.name(), raw);
    Ok(())
}
