//! Memory arbiter between the dispatch pipeline and the DMA engine.
//!
//! Device memory has a single port, so only one access is in flight at a
//! time. Each source may hold one pending request. When the port frees up,
//! the oldest pending request is granted; requests made in the same cycle
//! are resolved round-robin against the last grant, so neither source can
//! starve the other.
//!
//! # Usage
//!
//! ```
//! use fpga_npu_emu::device::arbiter::{MemoryArbiter, ArbiterSource};
//! use fpga_npu_emu::device::memory::{DeviceMemory, MemoryOp};
//!
//! let mut arbiter = MemoryArbiter::new(Box::new(DeviceMemory::new(1024, 1)));
//! assert!(arbiter.request(ArbiterSource::Dma, MemoryOp::Write { addr: 0, data: 5, bytes: 4 }));
//!
//! arbiter.tick(); // granted
//! arbiter.tick(); // completed
//! assert_eq!(arbiter.take_response(ArbiterSource::Dma), Some(Ok(0)));
//! ```

use super::memory::{MemoryOp, MemoryPort, MemoryResult};

/// Source of a memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterSource {
    /// LOAD/STORE from the dispatch pipeline
    Dispatch,
    /// Device-side DMA data movement
    Dma,
}

impl ArbiterSource {
    const COUNT: usize = 2;

    fn id(self) -> usize {
        match self {
            Self::Dispatch => 0,
            Self::Dma => 1,
        }
    }

    fn from_id(id: usize) -> Self {
        if id == 0 {
            Self::Dispatch
        } else {
            Self::Dma
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    op: MemoryOp,
    request_cycle: u64,
}

/// Arbitration statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    /// Requests granted to the port
    pub grants: u64,
    /// Grants made while the other source was also waiting
    pub contention_count: u64,
    /// Cycles pending requests spent waiting for a grant
    pub wait_cycles: u64,
    /// Granted reads
    pub reads: u64,
    /// Granted writes
    pub writes: u64,
}

/// Single-port memory arbiter.
pub struct MemoryArbiter {
    port: Box<dyn MemoryPort>,
    pending: [Option<PendingRequest>; ArbiterSource::COUNT],
    responses: [Option<MemoryResult>; ArbiterSource::COUNT],
    in_flight: Option<ArbiterSource>,
    last_granted: Option<ArbiterSource>,
    current_cycle: u64,
    stats: ArbiterStats,
}

impl MemoryArbiter {
    pub fn new(port: Box<dyn MemoryPort>) -> Self {
        Self {
            port,
            pending: [None; ArbiterSource::COUNT],
            responses: [None; ArbiterSource::COUNT],
            in_flight: None,
            last_granted: None,
            current_cycle: 0,
            stats: ArbiterStats::default(),
        }
    }

    /// Queue a request for `source`.
    ///
    /// Returns `false` if the source already has a request outstanding
    /// (pending, in flight, or with an unread response).
    pub fn request(&mut self, source: ArbiterSource, op: MemoryOp) -> bool {
        if self.is_outstanding(source) {
            return false;
        }
        self.pending[source.id()] = Some(PendingRequest {
            op,
            request_cycle: self.current_cycle,
        });
        true
    }

    /// Collect the completion for `source`, if it has arrived.
    pub fn take_response(&mut self, source: ArbiterSource) -> Option<MemoryResult> {
        self.responses[source.id()].take()
    }

    /// Whether `source` has anything outstanding.
    pub fn is_outstanding(&self, source: ArbiterSource) -> bool {
        self.pending[source.id()].is_some()
            || self.responses[source.id()].is_some()
            || self.in_flight == Some(source)
    }

    /// Advance one cycle: complete the in-flight access, then grant.
    pub fn tick(&mut self) {
        self.current_cycle += 1;

        if let Some(source) = self.in_flight {
            if let Some(result) = self.port.tick() {
                self.responses[source.id()] = Some(result);
                self.in_flight = None;
            }
        }

        if self.in_flight.is_none() {
            self.grant();
        }

        for _ in self.pending.iter().flatten() {
            self.stats.wait_cycles += 1;
        }
    }

    fn grant(&mut self) {
        let waiting: Vec<usize> = (0..ArbiterSource::COUNT)
            .filter(|&id| self.pending[id].is_some())
            .collect();

        let winner = match waiting.as_slice() {
            [] => return,
            [only] => *only,
            _ => {
                self.stats.contention_count += 1;
                self.pick(&waiting)
            }
        };

        let Some(req) = self.pending[winner].take() else {
            return;
        };
        let source = ArbiterSource::from_id(winner);
        if self.port.issue(req.op) {
            log::trace!("Arbiter granted {:?}: {:?}", source, req.op);
            self.in_flight = Some(source);
            self.last_granted = Some(source);
            self.stats.grants += 1;
            if req.op.is_write() {
                self.stats.writes += 1;
            } else {
                self.stats.reads += 1;
            }
        } else {
            // Port still busy; retry next cycle
            self.pending[winner] = Some(req);
        }
    }

    /// Oldest request first; same-cycle ties go to the source after the
    /// last grant.
    fn pick(&self, waiting: &[usize]) -> usize {
        let last = self.last_granted.map(|s| s.id());
        let rr_distance = |id: usize| match last {
            Some(l) => (id + ArbiterSource::COUNT - l - 1) % ArbiterSource::COUNT,
            None => id,
        };
        waiting
            .iter()
            .copied()
            .min_by_key(|&id| {
                let cycle = self.pending[id].map_or(u64::MAX, |r| r.request_cycle);
                (cycle, rr_distance(id))
            })
            .unwrap_or(waiting[0])
    }

    /// Drop all requests and responses and abandon the in-flight access.
    pub fn reset(&mut self) {
        self.pending = [None; ArbiterSource::COUNT];
        self.responses = [None; ArbiterSource::COUNT];
        self.in_flight = None;
        self.last_granted = None;
        self.port.reset();
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
            && self.pending.iter().all(Option::is_none)
            && self.responses.iter().all(Option::is_none)
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ArbiterStats::default();
    }

    /// The memory behind the arbiter, for backdoor access.
    pub fn memory(&self) -> &dyn MemoryPort {
        &*self.port
    }

    pub fn memory_mut(&mut self) -> &mut dyn MemoryPort {
        &mut *self.port
    }
}

impl std::fmt::Debug for MemoryArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArbiter")
            .field("in_flight", &self.in_flight)
            .field("last_granted", &self.last_granted)
            .field("stats", &self.stats)
            .finish()
    }
}
