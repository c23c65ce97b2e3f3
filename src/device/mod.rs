//! Device model for the FPGA NPU control-and-transport core.
//!
//! This module provides:
//! - Register map and register file (host control surface)
//! - CDC queues and the 128/32-bit width adapters between the domains
//! - DMA engine moving bytes between host memory and device memory
//! - Instruction dispatch pipeline and the PE array it drives
//! - Memory arbiter in front of the device memory port
//!
//! # Architecture Overview
//!
//! ```text
//!          host domain                 │            device domain
//!                                      │
//!  ┌─────────────┐  128-bit beats      │
//!  │ HostMemory  │◄──────┐             │
//!  └─────────────┘       │             │
//!               ┌────────┴───────┐  h2d CdcQueue  ┌──────────┐   ┌─────────┐
//!  registers ──►│ splitter/packer│ ──────────────►│ demux    │──►│Dispatch │─► PeArray
//!  instructions►│   (DMA host)   │◄────────────── │          │   └────┬────┘
//!               └────────────────┘  d2h CdcQueue  └────┬─────┘        │
//!                                      │               ▼              ▼
//!                                      │          ┌─────────┐   ┌──────────────┐
//!                                      │          │DmaEngine│──►│MemoryArbiter │─► MemoryPort
//!                                      │          └─────────┘   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use fpga_npu_emu::config::NpuConfig;
//! use fpga_npu_emu::device::{ctrl, offset, Instruction, Npu};
//!
//! let mut npu = Npu::new(NpuConfig::default()).unwrap();
//! npu.write_register(offset::CTRL, ctrl::ENABLE);
//!
//! let results = npu.execute_batch(&[Instruction::add(5, 7)], 1000).unwrap();
//! assert_eq!(results, vec![12]);
//! ```

pub mod arbiter;
pub mod cdc;
pub mod dispatch;
pub mod dma;
pub mod host_memory;
pub mod link;
pub mod memory;
pub mod npu;
pub mod pe_array;
pub mod perf;
pub mod register_file;
pub mod registers;
pub mod status;

pub use arbiter::{ArbiterSource, ArbiterStats, MemoryArbiter};
pub use cdc::{CdcConsumer, CdcError, CdcProducer, CdcQueue};
pub use dispatch::{Dispatch, DispatchEvent, DispatchState, Instruction, Operation};
pub use dma::{DmaDescriptor, DmaDirection, DmaEngine, DmaError, DmaEvent, DmaState, DmaStats};
pub use host_memory::HostMemory;
pub use link::LinkWord;
pub use memory::{DeviceMemory, MemoryFault, MemoryOp, MemoryPort};
pub use npu::{Npu, NpuError};
pub use pe_array::{PeArray, PeCommand, PeOp};
pub use perf::PerfCounters;
pub use register_file::{RegisterEffect, RegisterFile, ResetEvent};
pub use registers::{ctrl, dma_ctrl, offset, status as status_bits, Access, RegisterInfo};
pub use status::{DeviceStatus, ErrorCode};
