//! Register file: host-visible control and status state.
//!
//! The register file is a plain state holder. Writes can have side
//! effects, which are returned to the caller as [`RegisterEffect`]s
//! rather than performed here:
//!
//! - `CTRL.RESET` fires the shared [`ResetEvent`]; the device consumes it
//!   once at the start of its next cycle.
//! - `DMA_CTRL.START` latches a [`DmaDescriptor`] for the DMA engine, or is
//!   rejected with `ERROR_CODE = DEVICE_BUSY` if a descriptor is in flight
//!   or a reset pulse is still pending.
//!
//! Reads never have side effects. Reserved offsets and reserved bits are
//! ignored on write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::dma::{DmaDescriptor, DmaDirection};
use super::registers::{ctrl, dma_ctrl, offset, status, NPU_VERSION};
use super::status::{DeviceStatus, ErrorCode};

/// One-shot soft reset request.
///
/// Fired by the host domain, consumed exactly once by the device domain.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ResetEvent {
    pending: Arc<AtomicBool>,
}

impl ResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reset pulse.
    pub fn fire(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume the pulse. Returns `true` at most once per `fire`.
    pub fn consume(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Whether a pulse is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Side effect of a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterEffect {
    /// Soft reset pulse scheduled for the next cycle
    Reset,
    /// Descriptor latched; hand it to the DMA engine
    StartDma(DmaDescriptor),
    /// START rejected because a descriptor is already in flight
    DmaRejected,
}

/// Register file state.
#[derive(Debug)]
pub struct RegisterFile {
    /// Writable CTRL bits (ENABLE, INT_EN, PRECISION)
    ctrl: u32,
    reset: ResetEvent,

    error: bool,
    error_code: ErrorCode,
    int_pending: bool,

    /// Activity reported by the device each cycle
    dma_busy: bool,
    pipeline_busy: bool,

    dma_src: u64,
    dma_dst: u64,
    dma_length: u32,
    /// Stored DMA_CTRL bits (DIR, INT_EN)
    dma_ctrl: u32,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Power-on state.
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            reset: ResetEvent::new(),
            error: false,
            error_code: ErrorCode::None,
            int_pending: false,
            dma_busy: false,
            pipeline_busy: false,
            dma_src: 0,
            dma_dst: 0,
            dma_length: 0,
            dma_ctrl: 0,
        }
    }

    /// Handle to the reset pulse shared with the device domain.
    pub fn reset_event(&self) -> ResetEvent {
        self.reset.clone()
    }

    /// Host write of a 32-bit register.
    pub fn write(&mut self, off: u16, value: u32) -> Option<RegisterEffect> {
        match off {
            offset::CTRL => {
                self.ctrl = value & ctrl::WRITABLE;
                if value & ctrl::RESET != 0 {
                    log::debug!("CTRL.RESET written, reset pulse scheduled");
                    self.reset.fire();
                    return Some(RegisterEffect::Reset);
                }
                None
            }
            offset::STATUS => {
                if value & status::INT_PENDING != 0 {
                    self.int_pending = false;
                }
                if value & status::ERROR != 0 {
                    self.error = false;
                    self.error_code = ErrorCode::None;
                }
                None
            }
            offset::DMA_SRC_ADDR => {
                self.dma_src = (self.dma_src & !0xFFFF_FFFF) | value as u64;
                None
            }
            offset::DMA_SRC_ADDR_HI => {
                self.dma_src = (self.dma_src & 0xFFFF_FFFF) | ((value as u64) << 32);
                None
            }
            offset::DMA_DST_ADDR => {
                self.dma_dst = (self.dma_dst & !0xFFFF_FFFF) | value as u64;
                None
            }
            offset::DMA_DST_ADDR_HI => {
                self.dma_dst = (self.dma_dst & 0xFFFF_FFFF) | ((value as u64) << 32);
                None
            }
            offset::DMA_LENGTH => {
                self.dma_length = value;
                None
            }
            offset::DMA_CTRL => self.write_dma_ctrl(value),
            _ => {
                log::trace!("Ignoring write to reserved offset 0x{:03X}", off);
                None
            }
        }
    }

    fn write_dma_ctrl(&mut self, value: u32) -> Option<RegisterEffect> {
        if value & dma_ctrl::START == 0 {
            self.dma_ctrl = value & dma_ctrl::STORED;
            return None;
        }

        if self.dma_busy || self.reset.is_pending() {
            log::warn!("DMA_CTRL.START rejected: descriptor in flight or reset pending");
            self.raise_error(ErrorCode::DeviceBusy);
            return Some(RegisterEffect::DmaRejected);
        }

        self.dma_ctrl = value & dma_ctrl::STORED;
        self.dma_busy = true;
        let desc = self.descriptor();
        log::debug!("DMA descriptor latched: {:?}", desc);
        Some(RegisterEffect::StartDma(desc))
    }

    /// Host write of a 64-bit register pair. A high half past the end of
    /// the offset space is a reserved offset.
    pub fn write64(&mut self, off: u16, value: u64) -> Option<RegisterEffect> {
        let low = self.write(off, value as u32);
        let high = off
            .checked_add(4)
            .and_then(|hi| self.write(hi, (value >> 32) as u32));
        low.or(high)
    }

    /// Host read of a 32-bit register. Reserved offsets read as zero.
    pub fn read(&self, off: u16) -> u32 {
        match off {
            offset::CTRL => {
                let mut value = self.ctrl | ((NPU_VERSION as u32) << ctrl::VERSION_SHIFT);
                if self.reset.is_pending() {
                    value |= ctrl::RESET;
                }
                value
            }
            offset::STATUS => self.status().to_bits(),
            offset::DMA_SRC_ADDR => self.dma_src as u32,
            offset::DMA_SRC_ADDR_HI => (self.dma_src >> 32) as u32,
            offset::DMA_DST_ADDR => self.dma_dst as u32,
            offset::DMA_DST_ADDR_HI => (self.dma_dst >> 32) as u32,
            offset::DMA_LENGTH => self.dma_length,
            offset::DMA_CTRL => self.dma_ctrl,
            _ => 0,
        }
    }

    /// Host read of a 64-bit register pair.
    pub fn read64(&self, off: u16) -> u64 {
        let high = off.checked_add(4).map_or(0, |hi| self.read(hi));
        (self.read(off) as u64) | ((high as u64) << 32)
    }

    /// Current status word.
    pub fn status(&self) -> DeviceStatus {
        let busy = self.dma_busy || self.pipeline_busy;
        DeviceStatus {
            ready: !busy,
            busy,
            error: self.error,
            interrupt_pending: self.int_pending,
            error_code: self.error_code,
        }
    }

    /// Descriptor described by the current DMA registers.
    pub fn descriptor(&self) -> DmaDescriptor {
        DmaDescriptor {
            src_addr: self.dma_src,
            dst_addr: self.dma_dst,
            length: self.dma_length,
            direction: if self.dma_ctrl & dma_ctrl::DIR != 0 {
                DmaDirection::FromDevice
            } else {
                DmaDirection::ToDevice
            },
            interrupt_enable: self.dma_ctrl & dma_ctrl::INT_EN != 0,
        }
    }

    /// `CTRL.ENABLE`
    pub fn enabled(&self) -> bool {
        self.ctrl & ctrl::ENABLE != 0
    }

    /// `CTRL.PRECISION` raw field.
    pub fn precision(&self) -> u8 {
        ((self.ctrl & ctrl::PRECISION_MASK) >> ctrl::PRECISION_SHIFT) as u8
    }

    /// Interrupt line level: INT_PENDING gated by `CTRL.INT_EN`.
    pub fn irq_line(&self) -> bool {
        self.int_pending && self.ctrl & ctrl::INT_EN != 0
    }

    /// Update the activity flags from the device.
    pub fn set_activity(&mut self, dma_busy: bool, pipeline_busy: bool) {
        self.dma_busy = dma_busy;
        self.pipeline_busy = pipeline_busy;
    }

    /// Latch an error. The flag is sticky until cleared by the host or a reset.
    pub fn raise_error(&mut self, code: ErrorCode) {
        self.error = true;
        self.error_code = code;
    }

    /// Assert INT_PENDING.
    pub fn raise_interrupt(&mut self) {
        self.int_pending = true;
    }

    /// Soft reset: clear status and the DMA control register.
    ///
    /// The DMA address/length registers and the writable CTRL bits keep the
    /// values the host programmed.
    pub fn soft_reset(&mut self) {
        self.error = false;
        self.error_code = ErrorCode::None;
        self.int_pending = false;
        self.dma_busy = false;
        self.pipeline_busy = false;
        self.dma_ctrl = 0;
    }
}
