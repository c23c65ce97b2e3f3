//! Device status word and error codes.

use std::fmt;

use super::registers::status;

/// Value reported in `STATUS.ERROR_CODE`.
///
/// Numbering follows the driver's `NPU_ERROR_*` constants so host software
/// can share one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// No error latched
    #[default]
    None,
    /// `DMA_CTRL.START` written while a descriptor was in flight
    DeviceBusy,
    /// Memory fault on an instruction LOAD/STORE
    DeviceError,
    /// Memory fault during a DMA transfer
    DmaError,
    /// Code not known to this model (read back from a raw status word)
    Other(u16),
}

impl ErrorCode {
    /// Raw 16-bit value.
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::DeviceBusy => 4,
            ErrorCode::DeviceError => 5,
            ErrorCode::DmaError => 6,
            ErrorCode::Other(code) => code,
        }
    }

    /// Decode a raw 16-bit value.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ErrorCode::None,
            4 => ErrorCode::DeviceBusy,
            5 => ErrorCode::DeviceError,
            6 => ErrorCode::DmaError,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::None => write!(f, "none"),
            ErrorCode::DeviceBusy => write!(f, "device busy"),
            ErrorCode::DeviceError => write!(f, "device memory fault"),
            ErrorCode::DmaError => write!(f, "DMA transfer fault"),
            ErrorCode::Other(code) => write!(f, "unknown error 0x{:04X}", code),
        }
    }
}

/// Decoded `STATUS` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// DMA engine and dispatch pipeline are both idle
    pub ready: bool,
    /// DMA engine or dispatch pipeline has work in flight
    pub busy: bool,
    /// Sticky error flag
    pub error: bool,
    /// Interrupt pending (W1C)
    pub interrupt_pending: bool,
    /// Code of the latched error
    pub error_code: ErrorCode,
}

impl DeviceStatus {
    /// Pack into the register layout.
    pub fn to_bits(&self) -> u32 {
        let mut bits = (self.error_code.code() as u32) << status::ERROR_CODE_SHIFT;
        if self.ready {
            bits |= status::READY;
        }
        if self.busy {
            bits |= status::BUSY;
        }
        if self.error {
            bits |= status::ERROR;
        }
        if self.interrupt_pending {
            bits |= status::INT_PENDING;
        }
        bits
    }

    /// Unpack from the register layout.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            ready: bits & status::READY != 0,
            busy: bits & status::BUSY != 0,
            error: bits & status::ERROR != 0,
            interrupt_pending: bits & status::INT_PENDING != 0,
            error_code: ErrorCode::from_code((bits >> status::ERROR_CODE_SHIFT) as u16),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, name: &'static str| if set { name } else { "-" };
        write!(
            f,
            "[{} {} {} {}] code={}",
            flag(self.ready, "READY"),
            flag(self.busy, "BUSY"),
            flag(self.error, "ERROR"),
            flag(self.interrupt_pending, "INT"),
            self.error_code,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bit_layout() {
        let st = DeviceStatus {
            ready: true,
            busy: false,
            error: true,
            interrupt_pending: true,
            error_code: ErrorCode::DmaError,
        };
        assert_eq!(st.to_bits(), 0x0006_000D);
        assert_eq!(DeviceStatus::from_bits(0x0006_000D), st);
    }

    #[test]
    fn test_error_code_numbering() {
        assert_eq!(ErrorCode::DeviceBusy.code(), 4);
        assert_eq!(ErrorCode::DmaError.code(), 6);
        assert_eq!(ErrorCode::from_code(5), ErrorCode::DeviceError);
        assert_eq!(ErrorCode::from_code(0x42), ErrorCode::Other(0x42));
        // Codes the core never raises decode as Other
        assert_eq!(ErrorCode::from_code(1), ErrorCode::Other(1));
        assert_eq!(ErrorCode::Other(1).code(), 1);
    }
}
