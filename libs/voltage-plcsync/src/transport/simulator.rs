//! In-memory PLC for tests and offline use
//!
//! Keeps one byte image per area, can be switched offline, can fail the next N
//! operations and can delay reads. Counters let tests assert how often the device
//! was touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use super::{PlcTransport, TransportError, TransportResult};
use crate::address::{Address, Area, WordOrder};
use crate::config::RegionSizes;

/// Simulated device with register images per area
#[derive(Debug)]
pub struct SimulatedPlc {
    name: String,
    images: HashMap<Area, RwLock<Vec<u8>>>,
    online: AtomicBool,
    connected: AtomicBool,
    fail_next: AtomicU32,
    read_delay_ms: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    connects: AtomicU64,
    probes: AtomicU64,
}

impl SimulatedPlc {
    pub fn new(sizes: &RegionSizes) -> Self {
        let images = Area::ALL
            .iter()
            .map(|&area| (area, RwLock::new(vec![0; sizes.size(area)])))
            .collect();
        Self {
            name: "simulator".to_string(),
            images,
            online: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            read_delay_ms: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Take the device off the network; open connections drop
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.connected.store(false, Ordering::SeqCst);
        }
        debug!("Simulator {} online={}", self.name, online);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fail the next `n` read or write calls with an I/O error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Device-side byte write, invisible to the mirror until it reads
    pub fn poke(&self, area: Area, offset: usize, data: &[u8]) {
        if let Some(image) = self.images.get(&area) {
            let mut image = image.write();
            let end = (offset + data.len()).min(image.len());
            if offset < end {
                image[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
    }

    /// Device-side typed write through an address
    pub fn poke_value(&self, addr: &Address, raw: u32) {
        if let Some(image) = self.images.get(&addr.area) {
            let _ = addr.store(&mut image.write(), 0, raw);
        }
    }

    pub fn poke_word(&self, area: Area, offset: usize, value: u16) {
        self.poke(area, offset, &value.to_le_bytes());
    }

    pub fn poke_dword(&self, area: Area, offset: usize, order: WordOrder, value: u32) {
        self.poke_value(&Address::dword(area, offset, order), value);
    }

    pub fn peek(&self, area: Area, offset: usize, len: usize) -> Vec<u8> {
        self.images
            .get(&area)
            .map(|image| {
                let image = image.read();
                let end = (offset + len).min(image.len());
                image.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn peek_word(&self, area: Area, offset: usize) -> u16 {
        let bytes = self.peek(area, offset, 2);
        match bytes.as_slice() {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> TransportResult<()> {
        if !self.is_online() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io("device unreachable".to_string()));
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> TransportResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::Io("injected failure".to_string()));
        }
        Ok(())
    }

    fn range(
        &self,
        area: Area,
        offset: u32,
        count: usize,
    ) -> TransportResult<std::ops::Range<usize>> {
        let start = offset as usize * 2;
        let end = start + count * 2;
        let len = self.images.get(&area).map_or(0, |i| i.read().len());
        if end > len {
            // Illegal data address
            return Err(TransportError::Exception(0x02));
        }
        Ok(start..end)
    }
}

#[async_trait]
impl PlcTransport for SimulatedPlc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> TransportResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(TransportError::ConnectionFailed(format!(
                "{} is offline",
                self.name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read_registers(&self, area: Area, offset: u32, count: u16) -> TransportResult<Bytes> {
        self.check_link()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.take_injected_failure()?;

        let range = self.range(area, offset, usize::from(count))?;
        let image = self
            .images
            .get(&area)
            .ok_or(TransportError::Exception(0x02))?
            .read();
        Ok(Bytes::copy_from_slice(&image[range]))
    }

    async fn write_registers(&self, area: Area, offset: u32, data: Bytes) -> TransportResult<()> {
        self.check_link()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.take_injected_failure()?;

        if data.len() % 2 != 0 {
            return Err(TransportError::Malformed(format!(
                "odd payload length {}",
                data.len()
            )));
        }
        let range = self.range(area, offset, data.len() / 2)?;
        let mut image = self
            .images
            .get(&area)
            .ok_or(TransportError::Exception(0x02))?
            .write();
        image[range].copy_from_slice(&data);
        Ok(())
    }

    async fn probe(&self) -> TransportResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.check_link()
    }
}
