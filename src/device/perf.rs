//! Performance counters.

use std::fmt;

/// Free-running device counters. A soft reset does not clear them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    /// Device cycles stepped
    pub cycles: u64,
    /// Instructions retired (results forwarded or STOREs completed)
    pub instructions: u64,
    /// Lane-operations completed by the PE array
    pub pe_operations: u64,
    /// Device memory reads issued by LOAD or DMA
    pub memory_reads: u64,
    /// Device memory writes issued by STORE or DMA
    pub memory_writes: u64,
    /// Cycles writeback was held by a full result lane
    pub pipeline_stalls: u64,
    /// Bytes moved by completed DMA descriptors
    pub dma_bytes: u64,
    /// Instructions dropped at decode
    pub unknown_opcodes: u64,
}

impl PerfCounters {
    /// Instructions per cycle.
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.instructions as f64 / self.cycles as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for PerfCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:          {}", self.cycles)?;
        writeln!(f, "instructions:    {} (IPC {:.3})", self.instructions, self.ipc())?;
        writeln!(f, "pe_operations:   {}", self.pe_operations)?;
        writeln!(f, "memory_reads:    {}", self.memory_reads)?;
        writeln!(f, "memory_writes:   {}", self.memory_writes)?;
        writeln!(f, "pipeline_stalls: {}", self.pipeline_stalls)?;
        writeln!(f, "dma_bytes:       {}", self.dma_bytes)?;
        write!(f, "unknown_opcodes: {}", self.unknown_opcodes)
    }
}
