//! Width adaptation between the 128-bit host beat and 32-bit device words.
//!
//! Word 0 of a beat is its least significant 32 bits.
//!
//! ```text
//!  beat [127:96][95:64][63:32][31:0]
//!          w3     w2     w1     w0     -> emitted w0, w1, w2, w3
//! ```

/// External bus beat.
pub type Beat = u128;

/// Internal words per beat.
pub const WIDTH_RATIO: usize = 4;

/// Bytes per beat.
pub const BEAT_BYTES: usize = 16;

/// Split a beat into words, least significant first.
pub fn split_beat(beat: Beat) -> [u32; WIDTH_RATIO] {
    std::array::from_fn(|i| (beat >> (32 * i)) as u32)
}

/// Join words (least significant first) into a beat.
pub fn join_beat(words: [u32; WIDTH_RATIO]) -> Beat {
    words
        .iter()
        .enumerate()
        .fold(0, |beat, (i, &w)| beat | ((w as Beat) << (32 * i)))
}

/// Parallel-in serial-out: one beat in, one word out per cycle.
///
/// A new beat is refused until every word of the current one has been
/// consumed.
#[derive(Debug, Clone, Default)]
pub struct WidthSplitter {
    words: [u32; WIDTH_RATIO],
    next: usize,
    len: usize,
}

impl WidthSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a beat of which the first `words` words are meaningful.
    ///
    /// Returns `false` if the previous beat is still draining.
    pub fn load(&mut self, beat: Beat, words: usize) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.words = split_beat(beat);
        self.next = 0;
        self.len = words.min(WIDTH_RATIO);
        true
    }

    /// Next word to send, if any.
    pub fn front(&self) -> Option<u32> {
        (self.next < self.len).then(|| self.words[self.next])
    }

    /// Mark the front word as sent.
    pub fn consume(&mut self) {
        if self.next < self.len {
            self.next += 1;
        }
    }

    /// No words pending.
    pub fn is_idle(&self) -> bool {
        self.next >= self.len
    }

    pub fn remaining(&self) -> usize {
        self.len - self.next
    }

    pub fn clear(&mut self) {
        self.next = 0;
        self.len = 0;
    }
}

/// Serial-in parallel-out: collects words and emits a beat once full.
#[derive(Debug, Clone, Default)]
pub struct WidthPacker {
    words: [u32; WIDTH_RATIO],
    count: usize,
}

impl WidthPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a word. Returns the completed beat on the fourth word.
    pub fn push(&mut self, word: u32) -> Option<Beat> {
        self.words[self.count] = word;
        self.count += 1;
        if self.count == WIDTH_RATIO {
            self.count = 0;
            Some(join_beat(self.words))
        } else {
            None
        }
    }

    /// Words collected toward the current beat.
    pub fn pending(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}
