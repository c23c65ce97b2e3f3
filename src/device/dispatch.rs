//! Instruction dispatch pipeline.
//!
//! Takes one instruction at a time from the host-to-device lane, drives
//! the PE array or the memory arbiter, and forwards results on the
//! device-to-host lane.
//!
//! ```text
//!  Idle ─► Decode ─► Execute ─────────────────► Writeback ─► Idle
//!            │          └─► MemoryAccess ──────────┘
//!            └─ undefined opcode ─► Idle
//! ```
//!
//! The pipeline holds no queue: it is ready for a new instruction only in
//! `Idle`, and the word stays at the head of the lane until then.
//!
//! # Instruction format
//!
//! ```text
//!  31      24 23     16 15      8 7       0
//! ┌──────────┬─────────┬─────────┬─────────┐
//! │  opcode  │  src1   │  src2   │   dst   │
//! └──────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! ALU opcodes operate on `src1` and `src2` as immediate operands. LOAD and
//! STORE address device memory by word index `{src1, src2}`; STORE writes
//! `dst`.

use std::fmt;

use super::arbiter::{ArbiterSource, MemoryArbiter};
use super::cdc::CdcProducer;
use super::link::LinkWord;
use super::memory::{MemoryFault, MemoryOp};
use super::pe_array::{PeArray, PeCommand, PeOp};

/// Opcode values.
pub mod opcode {
    pub const ADD: u8 = 0x01;
    pub const SUB: u8 = 0x02;
    pub const MUL: u8 = 0x03;
    pub const MAC: u8 = 0x04;
    pub const LOAD: u8 = 0x10;
    pub const STORE: u8 = 0x11;
}

/// Decoded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Alu(PeOp),
    Load,
    Store,
}

impl Operation {
    pub fn from_opcode(op: u8) -> Option<Self> {
        match op {
            opcode::ADD => Some(Self::Alu(PeOp::Add)),
            opcode::SUB => Some(Self::Alu(PeOp::Sub)),
            opcode::MUL => Some(Self::Alu(PeOp::Mul)),
            opcode::MAC => Some(Self::Alu(PeOp::Mac)),
            opcode::LOAD => Some(Self::Load),
            opcode::STORE => Some(Self::Store),
            _ => None,
        }
    }
}

/// A 32-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub opcode: u8,
    pub src1: u8,
    pub src2: u8,
    pub dst: u8,
}

impl Instruction {
    pub fn new(opcode: u8, src1: u8, src2: u8, dst: u8) -> Self {
        Self { opcode, src1, src2, dst }
    }

    pub fn decode(word: u32) -> Self {
        Self {
            opcode: (word >> 24) as u8,
            src1: (word >> 16) as u8,
            src2: (word >> 8) as u8,
            dst: word as u8,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.opcode as u32) << 24
            | (self.src1 as u32) << 16
            | (self.src2 as u32) << 8
            | self.dst as u32
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_opcode(self.opcode)
    }

    /// Byte address of the LOAD/STORE word.
    pub fn address(&self) -> u64 {
        (((self.src1 as u64) << 8) | self.src2 as u64) * 4
    }

    pub fn add(a: u8, b: u8) -> Self {
        Self::new(opcode::ADD, a, b, 0)
    }

    pub fn sub(a: u8, b: u8) -> Self {
        Self::new(opcode::SUB, a, b, 0)
    }

    pub fn mul(a: u8, b: u8) -> Self {
        Self::new(opcode::MUL, a, b, 0)
    }

    pub fn mac(a: u8, b: u8) -> Self {
        Self::new(opcode::MAC, a, b, 0)
    }

    pub fn load(index: u16) -> Self {
        Self::new(opcode::LOAD, (index >> 8) as u8, index as u8, 0)
    }

    pub fn store(index: u16, value: u8) -> Self {
        Self::new(opcode::STORE, (index >> 8) as u8, index as u8, value)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation() {
            Some(Operation::Alu(op)) => write!(f, "{:?} {}, {}", op, self.src1, self.src2),
            Some(Operation::Load) => write!(f, "LOAD [0x{:X}]", self.address()),
            Some(Operation::Store) => {
                write!(f, "STORE [0x{:X}], {}", self.address(), self.dst)
            }
            None => write!(f, ".word 0x{:08X}", self.encode()),
        }
    }
}

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    #[default]
    Idle,
    Decode,
    Execute,
    MemoryAccess,
    Writeback,
}

/// Something the device needs to know about after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Instruction left the pipeline; `result` is `Some` if it was forwarded.
    Retired { result: Option<u32> },
    /// Undefined opcode dropped at decode
    UnknownOpcode(u8),
    /// LOAD/STORE faulted
    MemoryFault(MemoryFault),
    /// Writeback held because the result lane is full
    Stalled,
}

/// Collaborators the pipeline drives each cycle.
pub struct DispatchPorts<'a> {
    pub pe_array: &'a mut PeArray,
    pub arbiter: &'a mut MemoryArbiter,
    pub results: &'a mut CdcProducer<LinkWord>,
}

/// Instruction dispatch pipeline.
#[derive(Debug, Default)]
pub struct Dispatch {
    state: DispatchState,
    current: Option<Instruction>,
    operation: Option<Operation>,
    pe_issued: bool,
    mem_requested: bool,
    result: u32,
    valid: bool,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Ready to accept an instruction.
    pub fn ready(&self) -> bool {
        self.state == DispatchState::Idle
    }

    /// Latest result value and its valid flag.
    pub fn output(&self) -> (u32, bool) {
        (self.result, self.valid)
    }

    /// Instruction currently in the pipeline.
    pub fn current(&self) -> Option<Instruction> {
        self.current
    }

    /// Fetch an instruction. Returns `false` (and leaves the word with the
    /// caller) unless the pipeline is idle.
    pub fn accept(&mut self, word: u32) -> bool {
        if !self.ready() {
            return false;
        }
        self.current = Some(Instruction::decode(word));
        self.state = DispatchState::Decode;
        true
    }

    /// Advance one cycle. The PE array is ticked exactly once.
    pub fn step(&mut self, ports: DispatchPorts<'_>) -> Option<DispatchEvent> {
        let mut pe_input = None;
        let event = match self.state {
            DispatchState::Idle => None,
            DispatchState::Decode => self.decode(),
            DispatchState::Execute => {
                match self.operation {
                    Some(Operation::Alu(op)) if !self.pe_issued => {
                        let (a, b) = self.operands();
                        pe_input = Some(PeCommand { op, a, b });
                        self.pe_issued = true;
                    }
                    Some(Operation::Alu(_)) => {}
                    _ => {
                        self.mem_requested = false;
                        self.state = DispatchState::MemoryAccess;
                    }
                }
                None
            }
            DispatchState::MemoryAccess => self.memory_access(ports.arbiter),
            DispatchState::Writeback => self.writeback(ports.results),
        };

        ports.pe_array.tick(pe_input);

        // Result register is observed after the array has clocked
        if self.state == DispatchState::Execute && self.pe_issued && pe_input.is_none() {
            if ports.pe_array.valid() {
                self.result = ports.pe_array.result();
                self.valid = true;
                self.state = DispatchState::Writeback;
            }
        }

        event
    }

    fn operands(&self) -> (u32, u32) {
        self.current
            .map_or((0, 0), |i| (i.src1 as u32, i.src2 as u32))
    }

    fn decode(&mut self) -> Option<DispatchEvent> {
        let inst = self.current?;
        match inst.operation() {
            Some(op) => {
                log::trace!("Decode: {}", inst);
                self.operation = Some(op);
                self.pe_issued = false;
                self.valid = false;
                self.state = DispatchState::Execute;
                None
            }
            None => {
                log::debug!("Undefined opcode 0x{:02X}, instruction dropped", inst.opcode);
                self.result = 0;
                self.valid = false;
                self.finish();
                Some(DispatchEvent::UnknownOpcode(inst.opcode))
            }
        }
    }

    fn memory_access(&mut self, arbiter: &mut MemoryArbiter) -> Option<DispatchEvent> {
        let inst = self.current?;
        if !self.mem_requested {
            let op = match self.operation {
                Some(Operation::Store) => MemoryOp::Write {
                    addr: inst.address(),
                    data: inst.dst as u32,
                    bytes: 4,
                },
                _ => MemoryOp::Read {
                    addr: inst.address(),
                    bytes: 4,
                },
            };
            self.mem_requested = arbiter.request(ArbiterSource::Dispatch, op);
            return None;
        }

        match arbiter.take_response(ArbiterSource::Dispatch)? {
            Ok(data) => {
                if self.operation == Some(Operation::Load) {
                    self.result = data;
                    self.valid = true;
                } else {
                    self.valid = false;
                }
                self.state = DispatchState::Writeback;
                None
            }
            Err(fault) => {
                log::warn!("{} faulted: {}", inst, fault);
                self.valid = false;
                self.finish();
                Some(DispatchEvent::MemoryFault(fault))
            }
        }
    }

    fn writeback(&mut self, results: &mut CdcProducer<LinkWord>) -> Option<DispatchEvent> {
        if !self.valid {
            self.finish();
            return Some(DispatchEvent::Retired { result: None });
        }
        match results.enqueue(LinkWord::Result(self.result)) {
            Ok(()) => {
                self.finish();
                Some(DispatchEvent::Retired {
                    result: Some(self.result),
                })
            }
            Err(_) => Some(DispatchEvent::Stalled),
        }
    }

    fn finish(&mut self) {
        self.state = DispatchState::Idle;
        self.current = None;
        self.operation = None;
        self.pe_issued = false;
        self.mem_requested = false;
    }

    /// Abandon the current instruction and clear the output.
    pub fn reset(&mut self) {
        self.finish();
        self.result = 0;
        self.valid = false;
    }
}
