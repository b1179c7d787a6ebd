//! Chunk manager: split a stream into sequences of chunks, track and reassemble one sequence.

use crate::protocol::{MAX_CHUNK_SIZE, MAX_PACKETS_PER_SEQUENCE};

/// Split data into chunks of `chunk_size` bytes (last one shorter).
/// Size 0 or above the frame limit falls back to `MAX_CHUNK_SIZE`.
/// Empty data yields a single empty chunk so an empty stream still has one sequence.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        MAX_CHUNK_SIZE
    } else {
        chunk_size
    };
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(size).map(<[u8]>::to_vec).collect()
}

/// Split data into sequences of at most `MAX_PACKETS_PER_SEQUENCE` chunks each.
pub fn split_into_sequences(data: &[u8], chunk_size: usize) -> Vec<Vec<Vec<u8>>> {
    let chunks = split_into_chunks(data, chunk_size);
    chunks
        .chunks(MAX_PACKETS_PER_SEQUENCE)
        .map(<[Vec<u8>]>::to_vec)
        .collect()
}

/// Bitmap with the low `packets` bits set.
pub fn full_bitmap(packets: u8) -> u32 {
    match packets as u32 {
        0 => 0,
        n if n >= u32::BITS => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

/// Received state of one sequence: which packet indices arrived, and their chunks.
#[derive(Debug, Clone)]
pub struct Reassembly {
    packets_in_sequence: u8,
    received: u32,
    chunks: Vec<Option<Vec<u8>>>,
}

impl Reassembly {
    /// Caller guarantees 1 ..= MAX_PACKETS_PER_SEQUENCE packets.
    pub fn new(packets_in_sequence: u8) -> Self {
        Self {
            packets_in_sequence,
            received: 0,
            chunks: vec![None; packets_in_sequence as usize],
        }
    }

    pub fn packets_in_sequence(&self) -> u8 {
        self.packets_in_sequence
    }

    /// Store a chunk. Returns true if the sequence is now complete.
    /// Duplicate indices keep the first copy; out-of-range indices are ignored.
    pub fn mark_received(&mut self, index: u8, chunk: Vec<u8>) -> bool {
        if let Some(slot) = self.chunks.get_mut(index as usize) {
            if slot.is_none() {
                *slot = Some(chunk);
                self.received |= 1 << index;
            }
        }
        self.is_complete()
    }

    pub fn is_received(&self, index: u8) -> bool {
        index < self.packets_in_sequence && self.received & (1 << index) != 0
    }

    pub fn is_complete(&self) -> bool {
        self.received == full_bitmap(self.packets_in_sequence)
    }

    pub fn received_bitmap(&self) -> u32 {
        self.received
    }

    /// Bit i set: packet i has not arrived yet.
    pub fn missing_bitmap(&self) -> u32 {
        !self.received & full_bitmap(self.packets_in_sequence)
    }

    pub fn missing_count(&self) -> u32 {
        self.missing_bitmap().count_ones()
    }

    /// Append chunks in index order to `out`. Call only when `is_complete()`.
    pub fn reassemble_into(&self, out: &mut Vec<u8>) {
        for chunk in self.chunks.iter().flatten() {
            out.extend_from_slice(chunk);
        }
    }
}

/// Indices of the set bits of `bitmap`, lowest first.
pub fn bitmap_indices(bitmap: u32) -> impl Iterator<Item = u8> {
    (0..u32::BITS as u8).filter(move |&i| bitmap & (1 << i) != 0)
}
