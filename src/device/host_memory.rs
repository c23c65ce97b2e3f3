//! Host memory seen by the DMA engine.
//!
//! Models the host DRAM behind the PCIe/AXI bridge. The DMA engine reads
//! and writes it one 128-bit beat at a time; tests and the CLI use the
//! byte and word accessors to stage buffers and check results.
//!
//! Storage is sparse: 4 KiB pages are allocated on first write and
//! untouched addresses read as zero, so the full 64-bit address space can
//! be used without reserving it.

use std::collections::BTreeMap;
use std::fmt;

use super::cdc::width::{Beat, BEAT_BYTES};

/// Sparse host memory.
pub struct HostMemory {
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,

    bytes_written: u64,
    bytes_read: u64,
}

impl HostMemory {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    fn page_mut(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        self.pages
            .entry(addr & Self::PAGE_MASK)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        self.pages.get(&(addr & Self::PAGE_MASK)).map(|p| p.as_ref())
    }

    #[inline]
    fn page_offset(addr: u64) -> usize {
        (addr & !Self::PAGE_MASK) as usize
    }

    /// Write bytes starting at `addr`. Addresses wrap at the top of the
    /// 64-bit space.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut cur = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let offset = Self::page_offset(cur);
            let n = rest.len().min(Self::PAGE_SIZE - offset);
            self.page_mut(cur)[offset..offset + n].copy_from_slice(&rest[..n]);
            cur = cur.wrapping_add(n as u64);
            rest = &rest[n..];
        }
        self.bytes_written += data.len() as u64;
    }

    /// Read bytes starting at `addr` into `buf`.
    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        self.peek_bytes(addr, buf);
        self.bytes_read += buf.len() as u64;
    }

    /// Read without counting the access.
    pub fn peek_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut cur = addr;
        let mut done = 0;
        while done < buf.len() {
            let offset = Self::page_offset(cur);
            let n = (buf.len() - done).min(Self::PAGE_SIZE - offset);
            match self.page(cur) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            cur = cur.wrapping_add(n as u64);
            done += n;
        }
    }

    /// Read one 128-bit beat (little-endian).
    pub fn read_beat(&mut self, addr: u64) -> Beat {
        let mut buf = [0u8; BEAT_BYTES];
        self.read_bytes(addr, &mut buf);
        Beat::from_le_bytes(buf)
    }

    /// Write the first `bytes` bytes of a beat (little-endian).
    pub fn write_beat(&mut self, addr: u64, beat: Beat, bytes: usize) {
        let buf = beat.to_le_bytes();
        self.write_bytes(addr, &buf[..bytes.min(BEAT_BYTES)]);
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.peek_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Stage a buffer of words.
    pub fn write_words(&mut self, addr: u64, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write_bytes(addr, &bytes);
    }

    /// Read back `count` words.
    pub fn read_words(&self, addr: u64, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| self.read_u32(addr.wrapping_add(4 * i as u64)))
            .collect()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Hexdump a range for debugging.
    pub fn hexdump(&self, addr: u64, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.peek_bytes(addr, &mut buf);

        let mut out = String::new();
        for (i, chunk) in buf.chunks(16).enumerate() {
            out.push_str(&format!("{:016x}: ", addr.wrapping_add(16 * i as u64)));
            for byte in chunk {
                out.push_str(&format!("{:02x} ", byte));
            }
            for _ in chunk.len()..16 {
                out.push_str("   ");
            }
            out.push_str(" |");
            out.extend(chunk.iter().map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            }));
            out.push_str("|\n");
        }
        out
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("allocated_pages", &self.pages.len())
            .field("bytes_written", &self.bytes_written)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}
