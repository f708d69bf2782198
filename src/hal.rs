//! ==============================================================================
//! hal.rs - I2C Bus Transport
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the I2C bus the sensors hang off.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine or test (using a mock).
//!
//! contract:
//!     - write(addr, bytes) / read(addr, buffer), nothing more.
//!     - no retry, no framing. the drivers own the protocol.
//!
//! relationships:
//!     - used by: drivers/*.rs (through `I2cDevice`)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("i2c bus unavailable: {0}")]
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    Open(String),
    #[error("i2c write to 0x{addr:02X} failed: {reason}")]
    Write { addr: u8, reason: String },
    #[error("i2c read from 0x{addr:02X} failed: {reason}")]
    Read { addr: u8, reason: String },
}

/// Byte oriented command channel shared by every device on one bus.
pub trait I2cBus: Send + Sync {
    fn write(&self, addr: u8, bytes: &[u8]) -> Result<(), BusError>;
    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<(), BusError>;
}

/// A bus connection bound to a single 7-bit address.
///
/// Owned by exactly one driver. Dropping the driver releases the handle.
pub struct I2cDevice<B> {
    bus: Arc<B>,
    address: u8,
}

impl<B: I2cBus> I2cDevice<B> {
    pub fn new(bus: Arc<B>, address: u8) -> Self {
        Self { bus, address }
    }

    pub fn transmit(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.bus.write(self.address, bytes)
    }

    pub fn receive(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
        self.bus.read(self.address, buf)
    }

    /// Write then read, skipping whichever half is empty.
    pub fn write_read(&mut self, bytes: &[u8], buf: &mut [u8]) -> Result<(), BusError> {
        if !bytes.is_empty() {
            self.transmit(bytes)?;
        }
        if !buf.is_empty() {
            self.receive(buf)?;
        }
        Ok(())
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build / Tests)
// ==============================================================================================

enum Scripted {
    Bytes(Vec<u8>),
    Fail,
}

#[derive(Default)]
struct MockState {
    reads: HashMap<u8, VecDeque<Scripted>>,
    write_failures: HashMap<u8, usize>,
    writes: Vec<(u8, Vec<u8>)>,
    read_counts: HashMap<u8, usize>,
}

/// Scripted bus. Reads are answered from a per-address queue; an empty queue
/// answers zeros.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockState>,
}

impl MockBus {
    pub fn new() -> Self {
        tracing::info!("Using MOCK I2C bus (No hardware access)");
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the bus from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_read(&self, addr: u8, bytes: &[u8]) {
        self.state()
            .reads
            .entry(addr)
            .or_default()
            .push_back(Scripted::Bytes(bytes.to_vec()));
    }

    pub fn queue_read_error(&self, addr: u8) {
        self.state()
            .reads
            .entry(addr)
            .or_default()
            .push_back(Scripted::Fail);
    }

    pub fn queue_write_error(&self, addr: u8) {
        *self.state().write_failures.entry(addr).or_default() += 1;
    }

    /// Every successful write to `addr`, oldest first.
    pub fn writes_to(&self, addr: u8) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn reads_from(&self, addr: u8) -> usize {
        self.state().read_counts.get(&addr).copied().unwrap_or(0)
    }
}

impl I2cBus for MockBus {
    fn write(&self, addr: u8, bytes: &[u8]) -> Result<(), BusError> {
        tracing::debug!("[MOCK I2C] Addr: 0x{:02X}, Write: {:02X?}", addr, bytes);
        let mut state = self.state();
        if let Some(pending) = state.write_failures.get_mut(&addr) {
            if *pending > 0 {
                *pending -= 1;
                return Err(BusError::Write {
                    addr,
                    reason: "scripted failure".to_string(),
                });
            }
        }
        state.writes.push((addr, bytes.to_vec()));
        Ok(())
    }

    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<(), BusError> {
        tracing::debug!("[MOCK I2C] Addr: 0x{:02X}, ReadLen: {}", addr, buf.len());
        let mut state = self.state();
        *state.read_counts.entry(addr).or_default() += 1;
        match state.reads.get_mut(&addr).and_then(VecDeque::pop_front) {
            Some(Scripted::Bytes(bytes)) => {
                buf.fill(0);
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(())
            }
            Some(Scripted::Fail) => Err(BusError::Read {
                addr,
                reason: "scripted failure".to_string(),
            }),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub struct RppalBus {
    i2c: Mutex<rppal::i2c::I2c>,
}

#[cfg(feature = "hardware")]
impl RppalBus {
    /// Open `/dev/i2c-{bus}`.
    pub fn open(bus: u8) -> Result<Self, BusError> {
        let i2c = rppal::i2c::I2c::with_bus(bus).map_err(|e| BusError::Open(e.to_string()))?;
        tracing::info!("Using REAL HARDWARE I2C bus {} (rppal)", bus);
        Ok(Self { i2c: Mutex::new(i2c) })
    }

    fn with_slave<T>(
        &self,
        addr: u8,
        f: impl FnOnce(&mut rppal::i2c::I2c) -> rppal::i2c::Result<T>,
    ) -> rppal::i2c::Result<T> {
        let mut i2c = self.i2c.lock().unwrap_or_else(|e| e.into_inner());
        i2c.set_slave_address(addr as u16)?;
        f(&mut i2c)
    }
}

#[cfg(feature = "hardware")]
impl I2cBus for RppalBus {
    fn write(&self, addr: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.with_slave(addr, |i2c| i2c.write(bytes))
            .map(|_| ())
            .map_err(|e| BusError::Write {
                addr,
                reason: e.to_string(),
            })
    }

    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.with_slave(addr, |i2c| i2c.read(buf))
            .map(|_| ())
            .map_err(|e| BusError::Read {
                addr,
                reason: e.to_string(),
            })
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_device() {
        let open = BusError::Open("/dev/i2c-1: No such file or directory".to_string());
        assert_eq!(open.to_string(), "i2c bus unavailable: /dev/i2c-1: No such file or directory");
        let write = BusError::Write {
            addr: 0x38,
            reason: "nack".to_string(),
        };
        assert_eq!(write.to_string(), "i2c write to 0x38 failed: nack");
    }

    #[test]
    fn empty_queue_reads_zeros() {
        let bus = Arc::new(MockBus::new());
        let mut dev = I2cDevice::new(bus.clone(), 0x38);
        let mut buf = [0xFFu8; 3];
        dev.receive(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0]);
        assert_eq!(bus.reads_from(0x38), 1);
    }

    #[test]
    fn write_read_skips_empty_halves() {
        let bus = Arc::new(MockBus::new());
        let mut dev = I2cDevice::new(bus.clone(), 0x23);
        dev.write_read(&[], &mut []).unwrap();
        assert!(bus.writes_to(0x23).is_empty());
        assert_eq!(bus.reads_from(0x23), 0);

        bus.queue_read(0x23, &[0xAB]);
        let mut buf = [0u8; 1];
        dev.write_read(&[0x71], &mut buf).unwrap();
        assert_eq!(bus.writes_to(0x23), vec![vec![0x71]]);
        assert_eq!(buf, [0xAB]);
    }

    #[test]
    fn scripted_failures_are_per_address() {
        let bus = Arc::new(MockBus::new());
        bus.queue_write_error(0x38);
        bus.queue_read_error(0x76);

        let mut aht = I2cDevice::new(bus.clone(), 0x38);
        let mut bmp = I2cDevice::new(bus.clone(), 0x76);

        assert!(matches!(aht.transmit(&[0xBA]), Err(BusError::Write { addr: 0x38, .. })));
        assert!(aht.transmit(&[0xBA]).is_ok());
        assert!(bmp.transmit(&[0xD0]).is_ok());
        assert!(matches!(bmp.receive(&mut [0u8; 1]), Err(BusError::Read { addr: 0x76, .. })));
        assert_eq!(bus.writes_to(0x38), vec![vec![0xBA]]);
    }
}
