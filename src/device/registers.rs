//! Host-visible register map.
//!
//! All registers are 32 bits wide and addressed by byte offset from the
//! start of the control BAR. The 64-bit DMA address registers are split
//! into a low half at the base offset and a high half at base + 4.
//!
//! ```text
//! 0x000  CTRL          [31:16] VERSION (RO)  [15:8] PRECISION  [2] INT_EN  [1] RESET  [0] ENABLE
//! 0x004  STATUS        [31:16] ERROR_CODE    [3] INT_PENDING (W1C)  [2] ERROR (W1C)  [1] BUSY  [0] READY
//! 0x100  DMA_SRC_ADDR  low word   (0x104 high word)
//! 0x108  DMA_DST_ADDR  low word   (0x10C high word)
//! 0x110  DMA_LENGTH    bytes
//! 0x114  DMA_CTRL      [2] INT_EN  [1] DIR  [0] START
//! ```

use std::fmt;

/// Hardware version reported in `CTRL[31:16]`.
pub const NPU_VERSION: u16 = 0x0100;

/// Register offsets.
pub mod offset {
    pub const CTRL: u16 = 0x000;
    pub const STATUS: u16 = 0x004;
    pub const DMA_SRC_ADDR: u16 = 0x100;
    pub const DMA_SRC_ADDR_HI: u16 = 0x104;
    pub const DMA_DST_ADDR: u16 = 0x108;
    pub const DMA_DST_ADDR_HI: u16 = 0x10C;
    pub const DMA_LENGTH: u16 = 0x110;
    pub const DMA_CTRL: u16 = 0x114;
}

/// `CTRL` fields.
pub mod ctrl {
    pub const ENABLE: u32 = 1 << 0;
    pub const RESET: u32 = 1 << 1;
    pub const INT_EN: u32 = 1 << 2;
    pub const PRECISION_SHIFT: u32 = 8;
    pub const PRECISION_MASK: u32 = 0xFF << PRECISION_SHIFT;
    pub const VERSION_SHIFT: u32 = 16;

    /// Bits a host write can change (RESET is handled as a pulse).
    pub const WRITABLE: u32 = ENABLE | INT_EN | PRECISION_MASK;
}

/// `STATUS` fields.
pub mod status {
    pub const READY: u32 = 1 << 0;
    pub const BUSY: u32 = 1 << 1;
    pub const ERROR: u32 = 1 << 2;
    pub const INT_PENDING: u32 = 1 << 3;
    pub const ERROR_CODE_SHIFT: u32 = 16;
}

/// `DMA_CTRL` fields.
pub mod dma_ctrl {
    pub const START: u32 = 1 << 0;
    pub const DIR: u32 = 1 << 1;
    pub const INT_EN: u32 = 1 << 2;

    /// Bits retained in the register (START is a trigger and reads back 0).
    pub const STORED: u32 = DIR | INT_EN;
}

/// Access class of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only.
    ReadOnly,
    /// Read-write.
    ReadWrite,
    /// Read-only with write-one-to-clear bits.
    ReadWriteOneToClear,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::ReadOnly => write!(f, "RO"),
            Access::ReadWrite => write!(f, "RW"),
            Access::ReadWriteOneToClear => write!(f, "RO/W1C"),
        }
    }
}

/// Information about a specific register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    /// Register name
    pub name: &'static str,
    /// Byte offset
    pub offset: u16,
    /// Access class
    pub access: Access,
    /// Brief description
    pub description: &'static str,
}

impl RegisterInfo {
    /// Look up a defined register by offset.
    ///
    /// Returns `None` for reserved offsets, which the register file
    /// ignores on write and reads as zero.
    pub fn lookup(offset: u16) -> Option<&'static RegisterInfo> {
        REGISTER_MAP.iter().find(|r| r.offset == offset)
    }

    /// All defined registers in offset order.
    pub fn all() -> &'static [RegisterInfo] {
        REGISTER_MAP
    }
}

impl fmt::Display for RegisterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} {:<16} {:<6} {}", self.offset, self.name, self.access, self.description)
    }
}

static REGISTER_MAP: &[RegisterInfo] = &[
    RegisterInfo {
        name: "CTRL",
        offset: offset::CTRL,
        access: Access::ReadWrite,
        description: "Enable, soft reset, interrupt enable, precision, version",
    },
    RegisterInfo {
        name: "STATUS",
        offset: offset::STATUS,
        access: Access::ReadWriteOneToClear,
        description: "Ready, busy, error, interrupt pending, error code",
    },
    RegisterInfo {
        name: "DMA_SRC_ADDR",
        offset: offset::DMA_SRC_ADDR,
        access: Access::ReadWrite,
        description: "DMA source address [31:0]",
    },
    RegisterInfo {
        name: "DMA_SRC_ADDR_HI",
        offset: offset::DMA_SRC_ADDR_HI,
        access: Access::ReadWrite,
        description: "DMA source address [63:32]",
    },
    RegisterInfo {
        name: "DMA_DST_ADDR",
        offset: offset::DMA_DST_ADDR,
        access: Access::ReadWrite,
        description: "DMA destination address [31:0]",
    },
    RegisterInfo {
        name: "DMA_DST_ADDR_HI",
        offset: offset::DMA_DST_ADDR_HI,
        access: Access::ReadWrite,
        description: "DMA destination address [63:32]",
    },
    RegisterInfo {
        name: "DMA_LENGTH",
        offset: offset::DMA_LENGTH,
        access: Access::ReadWrite,
        description: "DMA transfer length in bytes",
    },
    RegisterInfo {
        name: "DMA_CTRL",
        offset: offset::DMA_CTRL,
        access: Access::ReadWrite,
        description: "DMA start, direction, interrupt enable",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_defined_registers() {
        let info = RegisterInfo::lookup(0x004).unwrap();
        assert_eq!(info.name, "STATUS");
        assert_eq!(info.access, Access::ReadWriteOneToClear);

        let info = RegisterInfo::lookup(0x114).unwrap();
        assert_eq!(info.name, "DMA_CTRL");
    }

    #[test]
    fn test_lookup_reserved_offset() {
        assert!(RegisterInfo::lookup(0x008).is_none());
        assert!(RegisterInfo::lookup(0x118).is_none());
        assert!(RegisterInfo::lookup(0xFFFF).is_none());
    }

    #[test]
    fn test_map_is_sorted_and_word_aligned() {
        let map = RegisterInfo::all();
        for pair in map.windows(2) {
            assert!(pair[0].offset < pair[1].offset);
        }
        assert!(map.iter().all(|r| r.offset % 4 == 0));
    }

    #[test]
    fn test_ctrl_writable_mask_excludes_version() {
        assert_eq!(ctrl::WRITABLE & 0xFFFF_0000, 0);
        assert_eq!(ctrl::WRITABLE & ctrl::RESET, 0);
    }
}
