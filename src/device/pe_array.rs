//! Processing element array.
//!
//! Every PE receives the same operand pair and operation selector each
//! cycle. A PE is a three-stage pipeline:
//!
//! ```text
//!   cycle t          cycle t+1
//!  ┌─────────┐     ┌────────────┐    ┌─────────────────┐
//!  │ capture │ ──► │ arithmetic │ ─► │ result register │ ─► valid
//!  └─────────┘     └────────────┘    └─────────────────┘
//! ```
//!
//! Operands are captured on the cycle `enable` is high; the result register
//! and `valid` are updated on the following cycle. `valid` drops the cycle
//! after a cycle without `enable`.
//!
//! Arithmetic is two's-complement wraparound at the width selected by
//! `CTRL.PRECISION` (8, 16, otherwise 32 bits). The MAC accumulator
//! persists across operations until [`PeArray::reset`].

/// Default number of PEs.
pub const DEFAULT_PE_COUNT: usize = 16;

/// 4-bit operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Mac = 3,
}

impl PeOp {
    /// Decode a selector value. Only the low 4 bits are used.
    pub fn from_selector(sel: u8) -> Option<Self> {
        match sel & 0xF {
            0 => Some(Self::Add),
            1 => Some(Self::Sub),
            2 => Some(Self::Mul),
            3 => Some(Self::Mac),
            _ => None,
        }
    }

    pub fn selector(self) -> u8 {
        self as u8
    }
}

/// Operation and operands broadcast to the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeCommand {
    pub op: PeOp,
    pub a: u32,
    pub b: u32,
}

/// Mask for a `CTRL.PRECISION` value.
pub fn precision_mask(precision: u8) -> u32 {
    match precision {
        8 => 0xFF,
        16 => 0xFFFF,
        _ => u32::MAX,
    }
}

/// A single processing element.
#[derive(Debug, Clone, Default)]
pub struct ProcessingElement {
    captured: Option<PeCommand>,
    accumulator: u32,
    result: u32,
    valid: bool,
}

impl ProcessingElement {
    fn tick(&mut self, input: Option<PeCommand>, mask: u32) {
        match self.captured.take() {
            Some(cmd) => {
                let a = cmd.a & mask;
                let b = cmd.b & mask;
                self.result = match cmd.op {
                    PeOp::Add => a.wrapping_add(b),
                    PeOp::Sub => a.wrapping_sub(b),
                    PeOp::Mul => a.wrapping_mul(b),
                    PeOp::Mac => {
                        self.accumulator = self.accumulator.wrapping_add(a.wrapping_mul(b)) & mask;
                        self.accumulator
                    }
                } & mask;
                self.valid = true;
            }
            None => self.valid = false,
        }
        self.captured = input;
    }

    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }

    pub fn result(&self) -> u32 {
        self.result
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Array of identical PEs driven in lockstep.
#[derive(Debug, Clone)]
pub struct PeArray {
    pes: Vec<ProcessingElement>,
    precision: u8,
    operations: u64,
}

impl PeArray {
    pub fn new(count: usize) -> Self {
        Self {
            pes: vec![ProcessingElement::default(); count.max(1)],
            precision: 0,
            operations: 0,
        }
    }

    /// Advance one cycle. `input` is `Some` when `enable` is high.
    pub fn tick(&mut self, input: Option<PeCommand>) {
        let mask = precision_mask(self.precision);
        for pe in &mut self.pes {
            pe.tick(input, mask);
        }
        if self.valid() {
            self.operations += self.pes.len() as u64;
        }
    }

    /// Result of lane 0.
    pub fn result(&self) -> u32 {
        self.pes[0].result
    }

    pub fn valid(&self) -> bool {
        self.pes[0].valid
    }

    pub fn lane(&self, index: usize) -> Option<&ProcessingElement> {
        self.pes.get(index)
    }

    pub fn len(&self) -> usize {
        self.pes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pes.is_empty()
    }

    pub fn set_precision(&mut self, precision: u8) {
        self.precision = precision;
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Total lane-operations completed.
    pub fn operations(&self) -> u64 {
        self.operations
    }

    pub fn reset_operations(&mut self) {
        self.operations = 0;
    }

    /// Clear accumulators, results and anything in flight.
    pub fn reset(&mut self) {
        for pe in &mut self.pes {
            pe.reset();
        }
    }
}

impl Default for PeArray {
    fn default() -> Self {
        Self::new(DEFAULT_PE_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(array: &mut PeArray, op: PeOp, a: u32, b: u32) -> u32 {
        array.tick(Some(PeCommand { op, a, b }));
        assert!(!array.valid());
        array.tick(None);
        assert!(array.valid());
        array.result()
    }

    #[test]
    fn test_selector_decode() {
        assert_eq!(PeOp::from_selector(0), Some(PeOp::Add));
        assert_eq!(PeOp::from_selector(3), Some(PeOp::Mac));
        assert_eq!(PeOp::from_selector(0x13), Some(PeOp::Mac));
        assert_eq!(PeOp::from_selector(4), None);
        assert_eq!(PeOp::Mul.selector(), 2);
    }

    #[test]
    fn test_valid_one_cycle_after_enable() {
        let mut array = PeArray::new(4);
        array.tick(Some(PeCommand { op: PeOp::Mul, a: 3, b: 4 }));
        assert!(!array.valid());
        array.tick(None);
        assert!(array.valid());
        assert_eq!(array.result(), 12);
        array.tick(None);
        assert!(!array.valid());
        // Result register holds its value
        assert_eq!(array.result(), 12);
    }

    #[test]
    fn test_back_to_back_enable() {
        let mut array = PeArray::new(1);
        array.tick(Some(PeCommand { op: PeOp::Add, a: 1, b: 2 }));
        array.tick(Some(PeCommand { op: PeOp::Add, a: 10, b: 20 }));
        assert!(array.valid());
        assert_eq!(array.result(), 3);
        array.tick(None);
        assert!(array.valid());
        assert_eq!(array.result(), 30);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let mut array = PeArray::new(1);
        assert_eq!(issue(&mut array, PeOp::Sub, 0, 1), u32::MAX);
        assert_eq!(issue(&mut array, PeOp::Add, u32::MAX, 2), 1);
        assert_eq!(issue(&mut array, PeOp::Mul, 0x1_0000, 0x1_0000), 0);
    }

    #[test]
    fn test_mac_accumulates_until_reset() {
        let mut array = PeArray::new(2);
        let pairs = [(2, 3), (4, 5), (6, 7)];
        let mut last = 0;
        for (a, b) in pairs {
            last = issue(&mut array, PeOp::Mac, a, b);
        }
        assert_eq!(last, 6 + 20 + 42);
        assert_eq!(array.lane(1).map(|pe| pe.accumulator()), Some(68));

        array.reset();
        assert_eq!(issue(&mut array, PeOp::Mac, 2, 2), 4);
    }

    #[test]
    fn test_all_lanes_agree() {
        let mut array = PeArray::new(DEFAULT_PE_COUNT);
        issue(&mut array, PeOp::Mul, 7, 6);
        for i in 0..array.len() {
            let pe = array.lane(i).unwrap();
            assert!(pe.valid());
            assert_eq!(pe.result(), 42);
        }
        assert_eq!(array.operations(), DEFAULT_PE_COUNT as u64);
    }

    #[test]
    fn test_precision_int8() {
        let mut array = PeArray::new(1);
        array.set_precision(8);
        assert_eq!(issue(&mut array, PeOp::Add, 200, 100), 44);
        assert_eq!(issue(&mut array, PeOp::Sub, 0, 1), 0xFF);
        assert_eq!(issue(&mut array, PeOp::Mac, 16, 16), 0);
    }

    #[test]
    fn test_precision_int16() {
        let mut array = PeArray::new(1);
        array.set_precision(16);
        assert_eq!(issue(&mut array, PeOp::Mul, 0x100, 0x100), 0);
        assert_eq!(issue(&mut array, PeOp::Mul, 0xFF, 0x100), 0xFF00);
    }
}
