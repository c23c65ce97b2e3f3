//! DMA engine.
//!
//! Moves one descriptor at a time between host memory and device memory.
//! The transfer is split across the two clock domains:
//!
//! ```text
//!   host domain                    CDC                   device domain
//!  ┌──────────────┐  beat  ┌─────────┐  word   ┌───────────────────┐
//!  │ HostMemory   │ ─────► │ split   │ ──h2d─► │ write via arbiter │ ToDevice
//!  │              │ ◄───── │ pack    │ ◄─d2h── │ read via arbiter  │ FromDevice
//!  └──────────────┘  beat  └─────────┘  word   └───────────────────┘
//! ```
//!
//! # States
//!
//! ```text
//!  Idle ──START──► Armed ──► Transferring ──► Done ──► Idle
//!                              │
//!                              └── memory fault ──► Idle (ERROR)
//! ```
//!
//! At most one descriptor is in flight. Each descriptor gets a tag that
//! travels with its data words, so words left on a lane by an aborted
//! descriptor are dropped rather than applied to the next one.

pub mod engine;

pub use engine::DmaEngine;

use std::fmt;

use super::memory::MemoryFault;

/// Transfer direction (`DMA_CTRL.DIR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaDirection {
    /// Host memory to device memory
    #[default]
    ToDevice,
    /// Device memory to host memory
    FromDevice,
}

/// A latched transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaDescriptor {
    /// Source address (host for ToDevice, device for FromDevice)
    pub src_addr: u64,
    /// Destination address
    pub dst_addr: u64,
    /// Bytes to move
    pub length: u32,
    pub direction: DmaDirection,
    /// Raise INT_PENDING on completion
    pub interrupt_enable: bool,
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaState {
    #[default]
    Idle,
    /// Descriptor latched, transfer starts next cycle
    Armed,
    Transferring,
    /// All bytes landed; returns to Idle next cycle
    Done,
}

/// DMA engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// A descriptor is already in flight
    Busy,
    /// Device memory reported a fault
    MemoryFault(MemoryFault),
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "DMA engine busy"),
            Self::MemoryFault(fault) => write!(f, "DMA transfer aborted: {}", fault),
        }
    }
}

impl std::error::Error for DmaError {}

impl From<MemoryFault> for DmaError {
    fn from(fault: MemoryFault) -> Self {
        Self::MemoryFault(fault)
    }
}

/// Outcome reported when the engine returns to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    /// Descriptor finished
    Completed { bytes: u32, interrupt: bool },
    /// Descriptor aborted on a fault
    Aborted { error: DmaError, interrupt: bool },
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    pub transfers_completed: u64,
    pub transfers_aborted: u64,
    pub bytes_transferred: u64,
}
