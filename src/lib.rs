//! fpga-npu-emu library
//!
//! Cycle-stepped model of an FPGA NPU control-and-transport core.

pub mod config;
pub mod device;
