//! DMA engine state machine.
//!
//! The engine is driven from both domains each cycle:
//!
//! - host side: [`DmaEngine::host_front`]/[`DmaEngine::host_consume`] feed
//!   split words onto the host-to-device lane,
//!   [`DmaEngine::host_refill`] loads the next beat from host memory, and
//!   [`DmaEngine::host_receive`] packs returning words into host memory;
//! - device side: [`DmaEngine::device_accept`] takes a word off the lane
//!   and [`DmaEngine::step`] moves data through the memory arbiter and
//!   advances the state machine.

use crate::device::arbiter::{ArbiterSource, MemoryArbiter};
use crate::device::cdc::width::{WidthPacker, WidthSplitter, BEAT_BYTES, WIDTH_RATIO};
use crate::device::cdc::CdcProducer;
use crate::device::host_memory::HostMemory;
use crate::device::link::LinkWord;
use crate::device::memory::MemoryOp;

use super::{DmaDescriptor, DmaDirection, DmaError, DmaEvent, DmaState, DmaStats};

const WORD_BYTES: u32 = 4;

/// Single-descriptor DMA engine.
#[derive(Debug, Default)]
pub struct DmaEngine {
    state: DmaState,
    descriptor: Option<DmaDescriptor>,
    /// Tag carried by this descriptor's data words
    tag: u8,
    stats: DmaStats,

    // Host side
    splitter: WidthSplitter,
    packer: WidthPacker,
    /// Bytes read from (ToDevice) or written to (FromDevice) host memory
    host_offset: u32,

    // Device side
    /// Bytes written to (ToDevice) or read from (FromDevice) device memory
    device_offset: u32,
    /// Word taken off the lane, waiting for its write to complete
    accepted: Option<u32>,
    /// Word read from device memory, waiting for room on the lane
    outgoing: Option<u32>,
    /// Words placed on the device-to-host lane, padding included
    words_sent: u32,
    /// Request outstanding at the arbiter
    mem_outstanding: bool,
}

impl DmaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != DmaState::Idle
    }

    /// Descriptor in flight, if any.
    pub fn descriptor(&self) -> Option<DmaDescriptor> {
        self.descriptor.filter(|_| self.is_busy())
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn stats(&self) -> DmaStats {
        self.stats
    }

    /// Latch a descriptor. The transfer begins on the next step.
    pub fn start(&mut self, desc: DmaDescriptor) -> Result<(), DmaError> {
        if self.is_busy() {
            return Err(DmaError::Busy);
        }
        self.clear_progress();
        self.tag = self.tag.wrapping_add(1);
        self.descriptor = Some(desc);
        self.state = DmaState::Armed;
        log::debug!(
            "DMA armed: {:?} src=0x{:X} dst=0x{:X} len={} tag={}",
            desc.direction,
            desc.src_addr,
            desc.dst_addr,
            desc.length,
            self.tag
        );
        Ok(())
    }

    fn transferring(&self, direction: DmaDirection) -> Option<DmaDescriptor> {
        match self.descriptor {
            Some(desc) if self.state == DmaState::Transferring && desc.direction == direction => {
                Some(desc)
            }
            _ => None,
        }
    }

    // --- Host side ---

    /// Next word to place on the host-to-device lane.
    pub fn host_front(&self) -> Option<LinkWord> {
        self.splitter
            .front()
            .map(|word| LinkWord::Data { tag: self.tag, word })
    }

    /// The front word was accepted by the lane.
    pub fn host_consume(&mut self) {
        self.splitter.consume();
    }

    /// No beat is partially sent.
    pub fn host_idle(&self) -> bool {
        self.splitter.is_idle()
    }

    /// Load the next beat from host memory once the previous one is sent.
    pub fn host_refill(&mut self, host: &mut HostMemory) {
        let Some(desc) = self.transferring(DmaDirection::ToDevice) else {
            return;
        };
        if !self.splitter.is_idle() || self.host_offset >= desc.length {
            return;
        }

        let bytes = (desc.length - self.host_offset).min(BEAT_BYTES as u32);
        let addr = desc.src_addr.wrapping_add(self.host_offset as u64);
        let beat = host.read_beat(addr);
        let words = bytes.div_ceil(WORD_BYTES) as usize;
        if self.splitter.load(beat, words) {
            log::trace!("DMA host beat 0x{:X}: {} bytes", addr, bytes);
            self.host_offset += bytes;
        }
    }

    /// Accept a word from the device-to-host lane.
    ///
    /// Words whose tag does not belong to the descriptor in flight are
    /// dropped.
    pub fn host_receive(&mut self, tag: u8, word: u32, host: &mut HostMemory) {
        let Some(desc) = self.transferring(DmaDirection::FromDevice) else {
            log::trace!("DMA dropping stale word (tag {})", tag);
            return;
        };
        if tag != self.tag {
            log::trace!("DMA dropping stale word (tag {}, expected {})", tag, self.tag);
            return;
        }

        if let Some(beat) = self.packer.push(word) {
            let remaining = desc.length.saturating_sub(self.host_offset);
            let bytes = remaining.min(BEAT_BYTES as u32);
            let addr = desc.dst_addr.wrapping_add(self.host_offset as u64);
            host.write_beat(addr, beat, bytes as usize);
            self.host_offset += bytes;
        }
    }

    // --- Device side ---

    /// Whether a lane word with `tag` belongs to the descriptor in flight.
    pub fn owns(&self, tag: u8) -> bool {
        self.is_busy() && tag == self.tag
    }

    /// Ready to take a word off the host-to-device lane.
    pub fn device_ready(&self) -> bool {
        match self.transferring(DmaDirection::ToDevice) {
            Some(desc) => self.accepted.is_none() && self.device_offset < desc.length,
            None => false,
        }
    }

    /// Take a word off the host-to-device lane. Returns `false` if not ready.
    pub fn device_accept(&mut self, word: u32) -> bool {
        if !self.device_ready() {
            return false;
        }
        self.accepted = Some(word);
        true
    }

    /// Advance the device side by one cycle.
    pub fn step(
        &mut self,
        arbiter: &mut MemoryArbiter,
        d2h: &mut CdcProducer<LinkWord>,
    ) -> Option<DmaEvent> {
        let desc = self.descriptor?;
        match self.state {
            DmaState::Idle => None,
            DmaState::Armed => {
                self.state = DmaState::Transferring;
                None
            }
            DmaState::Transferring => {
                let result = match desc.direction {
                    DmaDirection::ToDevice => self.step_to_device(&desc, arbiter),
                    DmaDirection::FromDevice => self.step_from_device(&desc, arbiter, d2h),
                };
                if let Err(error) = result {
                    return Some(self.abort(&desc, error));
                }
                if self.is_complete(&desc) {
                    log::debug!("DMA transfer done: {} bytes", desc.length);
                    self.state = DmaState::Done;
                }
                None
            }
            DmaState::Done => {
                self.state = DmaState::Idle;
                self.stats.transfers_completed += 1;
                self.stats.bytes_transferred += desc.length as u64;
                Some(DmaEvent::Completed {
                    bytes: desc.length,
                    interrupt: desc.interrupt_enable,
                })
            }
        }
    }

    fn is_complete(&self, desc: &DmaDescriptor) -> bool {
        match desc.direction {
            DmaDirection::ToDevice => self.device_offset >= desc.length,
            DmaDirection::FromDevice => self.host_offset >= desc.length,
        }
    }

    fn step_to_device(
        &mut self,
        desc: &DmaDescriptor,
        arbiter: &mut MemoryArbiter,
    ) -> Result<(), DmaError> {
        let bytes = (desc.length - self.device_offset).min(WORD_BYTES);

        if self.mem_outstanding {
            let Some(response) = arbiter.take_response(ArbiterSource::Dma) else {
                return Ok(());
            };
            response?;
            self.mem_outstanding = false;
            self.accepted = None;
            self.device_offset += bytes;
            return Ok(());
        }

        if let Some(word) = self.accepted {
            let op = MemoryOp::Write {
                addr: desc.dst_addr.wrapping_add(self.device_offset as u64),
                data: word,
                bytes: bytes as u8,
            };
            self.mem_outstanding = arbiter.request(ArbiterSource::Dma, op);
        }
        Ok(())
    }

    fn step_from_device(
        &mut self,
        desc: &DmaDescriptor,
        arbiter: &mut MemoryArbiter,
        d2h: &mut CdcProducer<LinkWord>,
    ) -> Result<(), DmaError> {
        if let Some(word) = self.outgoing {
            if d2h.enqueue(LinkWord::Data { tag: self.tag, word }).is_err() {
                return Ok(());
            }
            self.outgoing = None;
            self.words_sent += 1;
        }

        if self.mem_outstanding {
            let Some(response) = arbiter.take_response(ArbiterSource::Dma) else {
                return Ok(());
            };
            let word = response?;
            self.mem_outstanding = false;
            self.device_offset = (self.device_offset + WORD_BYTES).min(desc.length);
            self.outgoing = Some(word);
            return Ok(());
        }

        if self.device_offset < desc.length {
            let op = MemoryOp::Read {
                addr: desc.src_addr.wrapping_add(self.device_offset as u64),
                bytes: (desc.length - self.device_offset).min(WORD_BYTES) as u8,
            };
            self.mem_outstanding = arbiter.request(ArbiterSource::Dma, op);
        } else if self.outgoing.is_none() && self.words_sent % WIDTH_RATIO as u32 != 0 {
            // Pad the final beat
            self.outgoing = Some(0);
        }
        Ok(())
    }

    fn abort(&mut self, desc: &DmaDescriptor, error: DmaError) -> DmaEvent {
        log::warn!(
            "DMA {:?} aborted after {} bytes: {}",
            desc.direction,
            self.device_offset,
            error
        );
        self.clear_progress();
        self.state = DmaState::Idle;
        self.stats.transfers_aborted += 1;
        DmaEvent::Aborted {
            error,
            interrupt: desc.interrupt_enable,
        }
    }

    fn clear_progress(&mut self) {
        self.splitter.clear();
        self.packer.clear();
        self.host_offset = 0;
        self.device_offset = 0;
        self.accepted = None;
        self.outgoing = None;
        self.words_sent = 0;
        self.mem_outstanding = false;
    }

    /// Soft reset: discard the descriptor and everything in flight.
    pub fn reset(&mut self) {
        if self.is_busy() {
            log::debug!("DMA reset in {:?}, descriptor discarded", self.state);
        }
        self.clear_progress();
        self.state = DmaState::Idle;
        self.descriptor = None;
    }
}
