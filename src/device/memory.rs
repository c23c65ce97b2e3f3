//! Device memory and the port the arbiter drives.
//!
//! The port models an on-chip SRAM/BRAM controller: one access at a time,
//! a fixed number of cycles from issue to completion, and a fault signal
//! for accesses that fall outside the array or into an injected bad
//! range.
//!
//! ```text
//!  issue(op) ──► [ latency cycles ] ──► tick() returns Some(result)
//! ```

use std::ops::Range;

use thiserror::Error;

/// One memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    /// Read the low `bytes` bytes (1..=4) of a little-endian word;
    /// the rest read as zero
    Read { addr: u64, bytes: u8 },
    /// Write the low `bytes` bytes of `data` (1..=4)
    Write { addr: u64, data: u32, bytes: u8 },
}

impl MemoryOp {
    pub fn addr(&self) -> u64 {
        match *self {
            MemoryOp::Read { addr, .. } | MemoryOp::Write { addr, .. } => addr,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, MemoryOp::Write { .. })
    }

    fn len(&self) -> u64 {
        match *self {
            MemoryOp::Read { bytes, .. } | MemoryOp::Write { bytes, .. } => {
                bytes.clamp(1, 4) as u64
            }
        }
    }
}

/// Fault reported by the memory port.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    #[error("Address 0x{0:X} outside device memory")]
    OutOfRange(u64),

    #[error("Access fault at 0x{0:X}")]
    AccessFault(u64),
}

/// Completion of an access: read data (0 for writes) or a fault.
pub type MemoryResult = Result<u32, MemoryFault>;

/// Memory collaborator driven by the arbiter.
pub trait MemoryPort: Send {
    /// Start an access. Returns `false` if an access is already in flight.
    fn issue(&mut self, op: MemoryOp) -> bool;

    /// Advance one cycle. Returns the completion on the cycle the access
    /// finishes.
    fn tick(&mut self) -> Option<MemoryResult>;

    /// An access is in flight.
    fn is_busy(&self) -> bool;

    /// Abandon any in-flight access. Contents are kept.
    fn reset(&mut self);

    /// Zero-latency read for test setup and inspection.
    fn backdoor_read(&self, addr: u64) -> MemoryResult;

    /// Zero-latency write for test setup.
    fn backdoor_write(&mut self, addr: u64, value: u32) -> Result<(), MemoryFault>;
}

/// Default device memory size (1 MiB).
pub const DEFAULT_MEMORY_SIZE: usize = 1 << 20;

/// Default access latency in cycles.
pub const DEFAULT_MEMORY_LATENCY: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    op: MemoryOp,
    remaining: u32,
}

/// Flat device memory with fixed latency.
#[derive(Debug)]
pub struct DeviceMemory {
    data: Vec<u8>,
    latency: u32,
    in_flight: Option<InFlight>,
    faults: Vec<Range<u64>>,
}

impl DeviceMemory {
    /// `latency` is clamped to at least one cycle.
    pub fn new(size: usize, latency: u32) -> Self {
        Self {
            data: vec![0; size],
            latency: latency.max(1),
            in_flight: None,
            faults: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Make every access touching `range` fault.
    pub fn inject_fault(&mut self, range: Range<u64>) {
        log::debug!("Fault injected at 0x{:X}..0x{:X}", range.start, range.end);
        self.faults.push(range);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    fn check(&self, addr: u64, len: u64) -> Result<usize, MemoryFault> {
        let end = addr.checked_add(len).ok_or(MemoryFault::OutOfRange(addr))?;
        if end > self.data.len() as u64 {
            return Err(MemoryFault::OutOfRange(addr));
        }
        if self.faults.iter().any(|r| addr < r.end && end > r.start) {
            return Err(MemoryFault::AccessFault(addr));
        }
        Ok(addr as usize)
    }

    fn perform(&mut self, op: MemoryOp) -> MemoryResult {
        let start = self.check(op.addr(), op.len())?;
        let n = op.len() as usize;
        match op {
            MemoryOp::Read { .. } => {
                let mut buf = [0u8; 4];
                buf[..n].copy_from_slice(&self.data[start..start + n]);
                Ok(u32::from_le_bytes(buf))
            }
            MemoryOp::Write { data, .. } => {
                self.data[start..start + n].copy_from_slice(&data.to_le_bytes()[..n]);
                Ok(0)
            }
        }
    }
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_SIZE, DEFAULT_MEMORY_LATENCY)
    }
}

impl MemoryPort for DeviceMemory {
    fn issue(&mut self, op: MemoryOp) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(InFlight {
            op,
            remaining: self.latency,
        });
        true
    }

    fn tick(&mut self) -> Option<MemoryResult> {
        let flight = self.in_flight.as_mut()?;
        flight.remaining -= 1;
        if flight.remaining > 0 {
            return None;
        }
        let op = flight.op;
        self.in_flight = None;

        let result = self.perform(op);
        if let Err(fault) = result {
            log::debug!("Memory fault: {}", fault);
        }
        Some(result)
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn reset(&mut self) {
        self.in_flight = None;
    }

    fn backdoor_read(&self, addr: u64) -> MemoryResult {
        let start = self.check(addr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[start..start + 4]);
        Ok(u32::from_le_bytes(buf))
    }

    fn backdoor_write(&mut self, addr: u64, value: u32) -> Result<(), MemoryFault> {
        let start = self.check(addr, 4)?;
        self.data[start..start + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mem: &mut DeviceMemory, op: MemoryOp) -> (u32, MemoryResult) {
        assert!(mem.issue(op));
        let mut cycles = 0;
        loop {
            cycles += 1;
            if let Some(result) = mem.tick() {
                return (cycles, result);
            }
        }
    }

    #[test]
    fn test_latency() {
        let mut mem = DeviceMemory::new(1024, 3);
        let (cycles, result) = run(&mut mem, MemoryOp::Write { addr: 0x10, data: 0xCAFE, bytes: 4 });
        assert_eq!(cycles, 3);
        assert_eq!(result, Ok(0));

        let (cycles, result) = run(&mut mem, MemoryOp::Read { addr: 0x10, bytes: 4 });
        assert_eq!(cycles, 3);
        assert_eq!(result, Ok(0xCAFE));
    }

    #[test]
    fn test_single_outstanding_access() {
        let mut mem = DeviceMemory::new(64, 2);
        assert!(mem.issue(MemoryOp::Read { addr: 0, bytes: 4 }));
        assert!(mem.is_busy());
        assert!(!mem.issue(MemoryOp::Read { addr: 4, bytes: 4 }));
        mem.tick();
        mem.tick();
        assert!(!mem.is_busy());
    }

    #[test]
    fn test_partial_write() {
        let mut mem = DeviceMemory::new(64, 1);
        mem.backdoor_write(0, 0xFFFF_FFFF).unwrap();
        run(&mut mem, MemoryOp::Write { addr: 0, data: 0x0000_1234, bytes: 2 });
        assert_eq!(mem.backdoor_read(0), Ok(0xFFFF_1234));
    }

    #[test]
    fn test_out_of_range_faults() {
        let mut mem = DeviceMemory::new(64, 1);
        let (_, result) = run(&mut mem, MemoryOp::Read { addr: 62, bytes: 4 });
        assert_eq!(result, Err(MemoryFault::OutOfRange(62)));
        assert!(mem.backdoor_write(u64::MAX - 1, 0).is_err());
    }

    #[test]
    fn test_partial_read_at_top_of_memory() {
        let mut mem = DeviceMemory::new(64, 1);
        mem.backdoor_write(60, 0xAABB_CCDD).unwrap();
        let (_, result) = run(&mut mem, MemoryOp::Read { addr: 62, bytes: 2 });
        assert_eq!(result, Ok(0xAABB));
        let (_, result) = run(&mut mem, MemoryOp::Read { addr: 63, bytes: 1 });
        assert_eq!(result, Ok(0xAA));
    }

    #[test]
    fn test_injected_fault() {
        let mut mem = DeviceMemory::new(256, 1);
        mem.inject_fault(0x40..0x50);
        let (_, result) = run(&mut mem, MemoryOp::Write { addr: 0x4C, data: 1, bytes: 4 });
        assert_eq!(result, Err(MemoryFault::AccessFault(0x4C)));

        mem.clear_faults();
        let (_, result) = run(&mut mem, MemoryOp::Write { addr: 0x4C, data: 1, bytes: 4 });
        assert_eq!(result, Ok(0));
    }

    #[test]
    fn test_reset_abandons_access() {
        let mut mem = DeviceMemory::new(64, 4);
        mem.issue(MemoryOp::Write { addr: 0, data: 7, bytes: 4 });
        mem.tick();
        mem.reset();
        assert!(!mem.is_busy());
        assert_eq!(mem.tick(), None);
        assert_eq!(mem.backdoor_read(0), Ok(0));
    }
}
