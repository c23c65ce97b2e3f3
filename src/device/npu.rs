//! Top-level device model.
//!
//! [`Npu`] owns every component and steps them once per [`Npu::tick`] in a
//! fixed order:
//!
//! 1. consume a pending soft reset (all actors forced to Idle);
//! 2. memory arbiter and memory port;
//! 3. host domain: drain the device-to-host lane into host memory and the
//!    result queue, then place one word on the host-to-device lane (DMA
//!    beat words first, instructions only between beats and only while
//!    `CTRL.ENABLE` is set);
//! 4. device domain: route the head of the host-to-device lane to the
//!    fetch latch or the DMA engine, feed dispatch from the latch, then
//!    step dispatch and DMA;
//! 5. publish activity to the register file.
//!
//! The host talks to the device through [`Npu::write_register`] and
//! [`Npu::read_register`] plus the helpers built on them.
//!
//! A `CTRL.RESET` write takes effect at the start of the next `tick`. Until
//! then a `DMA_CTRL.START` is rejected with `DEVICE_BUSY`, since the reset
//! would discard the descriptor.

use std::collections::VecDeque;

use thiserror::Error;

use crate::config::{ConfigError, NpuConfig};

use super::arbiter::MemoryArbiter;
use super::cdc::{CdcConsumer, CdcError, CdcProducer, CdcQueue};
use super::dispatch::{Dispatch, DispatchEvent, DispatchPorts, DispatchState, Instruction};
use super::dma::{DmaDescriptor, DmaDirection, DmaEngine, DmaEvent, DmaState};
use super::host_memory::HostMemory;
use super::link::LinkWord;
use super::memory::{DeviceMemory, MemoryPort};
use super::pe_array::PeArray;
use super::perf::PerfCounters;
use super::register_file::{RegisterEffect, RegisterFile, ResetEvent};
use super::registers::{ctrl, dma_ctrl, offset, status, RegisterInfo};
use super::status::{DeviceStatus, ErrorCode};

/// Errors from the host-side helpers.
#[derive(Debug, Error)]
pub enum NpuError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] CdcError),

    #[error("Device did not go idle within {cycles} cycles")]
    Timeout { cycles: u64 },

    #[error("Instruction fetch is disabled (CTRL.ENABLE = 0)")]
    NotEnabled,

    #[error("DMA_CTRL.START rejected: descriptor in flight or reset pending")]
    DeviceBusy,

    #[error("DMA transfer failed: {code}")]
    DmaFailed { code: ErrorCode },
}

/// The NPU control-and-transport core.
#[derive(Debug)]
pub struct Npu {
    config: NpuConfig,
    regs: RegisterFile,
    reset_event: ResetEvent,

    h2d_tx: CdcProducer<LinkWord>,
    h2d_rx: CdcConsumer<LinkWord>,
    d2h_tx: CdcProducer<LinkWord>,
    d2h_rx: CdcConsumer<LinkWord>,

    /// Host instruction port (one slot)
    host_instruction: Option<u32>,
    /// An instruction word is on the host-to-device lane
    instruction_on_lane: bool,
    /// Device-side fetch latch between the lane and dispatch
    fetch_latch: Option<u32>,
    /// Results received by the host
    results: VecDeque<u32>,
    host: HostMemory,

    dma: DmaEngine,
    dispatch: Dispatch,
    pe_array: PeArray,
    arbiter: MemoryArbiter,

    perf: PerfCounters,
}

impl Npu {
    /// Create a device with the default device memory.
    pub fn new(config: NpuConfig) -> Result<Self, NpuError> {
        let memory = DeviceMemory::new(config.memory_size, config.memory_latency);
        Self::with_memory(config, Box::new(memory))
    }

    /// Create a device backed by a custom memory port.
    pub fn with_memory(config: NpuConfig, memory: Box<dyn MemoryPort>) -> Result<Self, NpuError> {
        config.validate()?;
        let (h2d_tx, h2d_rx) = CdcQueue::with_depth(config.queue_depth)?;
        let (d2h_tx, d2h_rx) = CdcQueue::with_depth(config.queue_depth)?;
        let regs = RegisterFile::new();
        let reset_event = regs.reset_event();

        log::debug!(
            "Npu::new queue_depth={} pe_count={} memory_size={} latency={}",
            config.queue_depth,
            config.pe_count,
            config.memory_size,
            config.memory_latency
        );

        Ok(Self {
            config,
            regs,
            reset_event,
            h2d_tx,
            h2d_rx,
            d2h_tx,
            d2h_rx,
            host_instruction: None,
            instruction_on_lane: false,
            fetch_latch: None,
            results: VecDeque::new(),
            host: HostMemory::new(),
            dma: DmaEngine::new(),
            dispatch: Dispatch::new(),
            pe_array: PeArray::new(config.pe_count),
            arbiter: MemoryArbiter::new(memory),
            perf: PerfCounters::default(),
        })
    }

    pub fn config(&self) -> &NpuConfig {
        &self.config
    }

    // --- Register interface ---

    /// Host register write.
    pub fn write_register(&mut self, off: u16, value: u32) -> Option<RegisterEffect> {
        let effect = self.regs.write(off, value);
        if let Some(RegisterEffect::StartDma(desc)) = effect {
            if let Err(e) = self.dma.start(desc) {
                log::warn!("DMA start failed: {}", e);
            }
        }
        effect
    }

    /// Host register read. Never has side effects.
    pub fn read_register(&self, off: u16) -> u32 {
        self.regs.read(off)
    }

    pub fn status(&self) -> DeviceStatus {
        self.regs.status()
    }

    /// Interrupt output level.
    pub fn irq_line(&self) -> bool {
        self.regs.irq_line()
    }

    /// Handle that can request a soft reset from another thread.
    pub fn reset_handle(&self) -> ResetEvent {
        self.reset_event.clone()
    }

    // --- Clock ---

    /// Advance the whole device by one cycle.
    pub fn tick(&mut self) {
        if self.reset_event.consume() {
            self.soft_reset();
        }

        self.arbiter.tick();
        self.host_step();
        self.device_step();

        self.regs.set_activity(self.dma.is_busy(), !self.dispatch.ready());
        self.perf.cycles += 1;
    }

    fn soft_reset(&mut self) {
        log::info!(
            "Soft reset: dispatch {:?}, DMA {:?}",
            self.dispatch.state(),
            self.dma.state()
        );
        self.dma.reset();
        self.dispatch.reset();
        self.pe_array.reset();
        self.arbiter.reset();
        let dropped = self.h2d_rx.drain() + self.d2h_rx.drain();
        if dropped > 0 {
            log::debug!("Soft reset discarded {} lane words", dropped);
        }
        self.host_instruction = None;
        self.instruction_on_lane = false;
        self.fetch_latch = None;
        self.regs.soft_reset();
    }

    fn host_step(&mut self) {
        while let Some(word) = self.d2h_rx.dequeue() {
            match word {
                LinkWord::Result(value) => self.results.push_back(value),
                LinkWord::Data { tag, word } => self.dma.host_receive(tag, word, &mut self.host),
                LinkWord::Instruction(w) => {
                    log::warn!("Instruction 0x{:08X} on device-to-host lane dropped", w)
                }
            }
        }

        // An instruction only enters the lane between DMA beats
        if let Some(word) = self.dma.host_front() {
            if self.h2d_tx.enqueue(word).is_ok() {
                self.dma.host_consume();
            }
        } else if let Some(inst) = self.sendable_instruction() {
            if self.h2d_tx.enqueue(LinkWord::Instruction(inst)).is_ok() {
                self.host_instruction = None;
                self.instruction_on_lane = true;
            }
        }

        if self.sendable_instruction().is_none() {
            self.dma.host_refill(&mut self.host);
        }
    }

    /// The host instruction, if it may enter the lane this cycle.
    ///
    /// At most one instruction is between the host port and dispatch, and
    /// none while fetch is disabled, so an instruction never sits at the
    /// head of the lane in front of DMA data.
    fn sendable_instruction(&self) -> Option<u32> {
        let fetch_free = !self.instruction_on_lane && self.fetch_latch.is_none();
        self.host_instruction
            .filter(|_| fetch_free && self.regs.enabled())
    }

    fn device_step(&mut self) {
        if let Some(head) = self.h2d_rx.peek() {
            let taken = match head {
                LinkWord::Data { tag, word } => {
                    !self.dma.owns(tag) || self.dma.device_accept(word)
                }
                LinkWord::Instruction(word) => {
                    let free = self.fetch_latch.is_none();
                    if free {
                        self.fetch_latch = Some(word);
                        self.instruction_on_lane = false;
                    }
                    free
                }
                LinkWord::Result(_) => true,
            };
            if taken {
                self.h2d_rx.dequeue();
            }
        }

        if let Some(word) = self.fetch_latch {
            if self.regs.enabled() && self.dispatch.accept(word) {
                self.fetch_latch = None;
            }
        }

        self.pe_array.set_precision(self.regs.precision());
        let event = self.dispatch.step(DispatchPorts {
            pe_array: &mut self.pe_array,
            arbiter: &mut self.arbiter,
            results: &mut self.d2h_tx,
        });
        match event {
            Some(DispatchEvent::Retired { .. }) => self.perf.instructions += 1,
            Some(DispatchEvent::UnknownOpcode(_)) => self.perf.unknown_opcodes += 1,
            Some(DispatchEvent::Stalled) => self.perf.pipeline_stalls += 1,
            Some(DispatchEvent::MemoryFault(_)) => self.regs.raise_error(ErrorCode::DeviceError),
            None => {}
        }

        match self.dma.step(&mut self.arbiter, &mut self.d2h_tx) {
            Some(DmaEvent::Completed { bytes, interrupt }) => {
                self.perf.dma_bytes += bytes as u64;
                if interrupt {
                    self.regs.raise_interrupt();
                }
            }
            Some(DmaEvent::Aborted { interrupt, .. }) => {
                self.regs.raise_error(ErrorCode::DmaError);
                if interrupt {
                    self.regs.raise_interrupt();
                }
            }
            None => {}
        }
    }

    /// Nothing left to do: DMA and dispatch idle, lanes and host port empty.
    pub fn is_idle(&self) -> bool {
        !self.dma.is_busy()
            && self.dispatch.ready()
            && self.host_instruction.is_none()
            && !self.instruction_on_lane
            && self.fetch_latch.is_none()
            && self.h2d_rx.is_empty()
            && self.d2h_rx.is_empty()
            && self.arbiter.is_idle()
    }

    /// Tick until [`is_idle`](Self::is_idle) or `max_cycles` elapse.
    /// Returns the cycles taken.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64, NpuError> {
        let mut cycles = 0;
        while !self.is_idle() {
            if cycles >= max_cycles {
                return Err(NpuError::Timeout { cycles });
            }
            self.tick();
            cycles += 1;
        }
        Ok(cycles)
    }

    // --- Host helpers ---

    /// Offer an instruction word to the host port. Returns `false` if the
    /// port still holds the previous one.
    pub fn submit_instruction(&mut self, word: u32) -> bool {
        if self.host_instruction.is_some() {
            return false;
        }
        self.host_instruction = Some(word);
        true
    }

    pub fn submit(&mut self, inst: Instruction) -> bool {
        self.submit_instruction(inst.encode())
    }

    /// Oldest result received by the host.
    pub fn pop_result(&mut self) -> Option<u32> {
        self.results.pop_front()
    }

    /// Run a sequence of instructions and return every result the host
    /// holds once the device is idle.
    pub fn execute_batch(
        &mut self,
        program: &[Instruction],
        max_cycles: u64,
    ) -> Result<Vec<u32>, NpuError> {
        if !self.regs.enabled() {
            return Err(NpuError::NotEnabled);
        }

        let mut cycles = 0;
        for inst in program {
            while !self.submit(*inst) {
                if cycles >= max_cycles {
                    return Err(NpuError::Timeout { cycles });
                }
                self.tick();
                cycles += 1;
            }
        }
        cycles += self
            .run_until_idle(max_cycles.saturating_sub(cycles))
            .map_err(|_| NpuError::Timeout { cycles: max_cycles })?;

        log::debug!("Batch of {} instructions took {} cycles", program.len(), cycles);
        Ok(self.results.drain(..).collect())
    }

    /// Program the DMA registers and set START.
    pub fn start_dma(&mut self, desc: &DmaDescriptor) -> Result<(), NpuError> {
        self.regs.write64(offset::DMA_SRC_ADDR, desc.src_addr);
        self.regs.write64(offset::DMA_DST_ADDR, desc.dst_addr);
        self.regs.write(offset::DMA_LENGTH, desc.length);

        let mut value = dma_ctrl::START;
        if desc.direction == DmaDirection::FromDevice {
            value |= dma_ctrl::DIR;
        }
        if desc.interrupt_enable {
            value |= dma_ctrl::INT_EN;
        }
        match self.write_register(offset::DMA_CTRL, value) {
            Some(RegisterEffect::DmaRejected) => Err(NpuError::DeviceBusy),
            _ => Ok(()),
        }
    }

    /// Start a descriptor and wait for it to finish.
    pub fn run_dma(&mut self, desc: &DmaDescriptor, max_cycles: u64) -> Result<u64, NpuError> {
        let aborted = self.dma.stats().transfers_aborted;
        self.start_dma(desc)?;
        let mut cycles = 0;
        while self.dma.is_busy() {
            if cycles >= max_cycles {
                return Err(NpuError::Timeout { cycles });
            }
            self.tick();
            cycles += 1;
        }
        if self.dma.stats().transfers_aborted != aborted {
            return Err(NpuError::DmaFailed {
                code: self.status().error_code,
            });
        }
        Ok(cycles)
    }

    /// Clear INT_PENDING.
    pub fn acknowledge_interrupt(&mut self) {
        self.write_register(offset::STATUS, status::INT_PENDING);
    }

    /// Clear ERROR and ERROR_CODE.
    pub fn clear_error(&mut self) {
        self.write_register(offset::STATUS, status::ERROR);
    }

    /// Request a soft reset, keeping the other CTRL bits.
    pub fn request_reset(&mut self) {
        let value = self.read_register(offset::CTRL) & ctrl::WRITABLE;
        self.write_register(offset::CTRL, value | ctrl::RESET);
    }

    /// All defined registers with their current values.
    pub fn dump_registers(&self) -> Vec<(&'static RegisterInfo, u32)> {
        RegisterInfo::all()
            .iter()
            .map(|info| (info, self.regs.read(info.offset)))
            .collect()
    }

    // --- Inspection ---

    pub fn perf_counters(&self) -> PerfCounters {
        let arb = self.arbiter.stats();
        PerfCounters {
            pe_operations: self.pe_array.operations(),
            memory_reads: arb.reads,
            memory_writes: arb.writes,
            ..self.perf
        }
    }

    pub fn reset_perf_counters(&mut self) {
        self.perf.reset();
        self.pe_array.reset_operations();
        self.arbiter.reset_stats();
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatch.state()
    }

    /// Dispatch result register and valid flag.
    pub fn dispatch_output(&self) -> (u32, bool) {
        self.dispatch.output()
    }

    pub fn dma_state(&self) -> DmaState {
        self.dma.state()
    }

    pub fn pe_array(&self) -> &PeArray {
        &self.pe_array
    }

    pub fn arbiter(&self) -> &MemoryArbiter {
        &self.arbiter
    }

    pub fn host_memory(&self) -> &HostMemory {
        &self.host
    }

    pub fn host_memory_mut(&mut self) -> &mut HostMemory {
        &mut self.host
    }

    pub fn device_memory(&self) -> &dyn MemoryPort {
        self.arbiter.memory()
    }

    pub fn device_memory_mut(&mut self) -> &mut dyn MemoryPort {
        self.arbiter.memory_mut()
    }
}
