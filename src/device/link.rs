//! Words carried on the CDC link.
//!
//! Both directions share one queue each, so every 32-bit word is tagged
//! with what it is. DMA words also carry the tag of the descriptor they
//! belong to; sinks drop words whose tag does not match the descriptor
//! currently in flight.

/// One word on a CDC lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkWord {
    /// Instruction for the dispatch pipeline (host to device)
    Instruction(u32),
    /// DMA payload word
    Data { tag: u8, word: u32 },
    /// Instruction result (device to host)
    Result(u32),
}

impl LinkWord {
    /// The raw 32-bit payload.
    pub fn payload(&self) -> u32 {
        match *self {
            LinkWord::Instruction(w) | LinkWord::Result(w) => w,
            LinkWord::Data { word, .. } => word,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, LinkWord::Data { .. })
    }
}
