//! QuickXorHash codec.
//!
//! The remote's integrity hash for file content. The algorithm keeps a
//! 160-bit circular accumulator; input is consumed in 64-byte blocks,
//! and each byte of block `i` is XORed in at a bit offset that starts at
//! `(i * 11) mod 160` and advances 8 bits per byte within the block.
//! After all data, the total byte length is XORed into the top 8 bytes
//! of the accumulator little-endian. Output is 20 bytes, carried
//! Base64-encoded on the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Digest size in bytes.
pub const SIZE: usize = 20;

/// Internal block size in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Width of the circular accumulator in bits.
const WIDTH_BITS: usize = SIZE * 8;

/// Per-block rotation in bits.
const SHIFT: usize = 11;

/// Streaming QuickXorHash state.
///
/// ```
/// use nimbus_hash::quickxor::QuickXorHasher;
///
/// let mut hasher = QuickXorHasher::new();
/// hasher.update(b"our super special data");
/// let digest = hasher.finalize();
/// assert_eq!(digest.len(), 20);
/// ```
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    /// 160-bit circular accumulator.
    acc: [u8; SIZE],
    /// Buffered tail of the last partial block.
    tail: [u8; BLOCK_SIZE],
    tail_len: usize,
    /// Index of the next full block to absorb.
    block_index: u64,
    /// Total bytes consumed.
    length: u64,
}

impl QuickXorHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            acc: [0u8; SIZE],
            tail: [0u8; BLOCK_SIZE],
            tail_len: 0,
            block_index: 0,
            length: 0,
        }
    }

    /// Absorbs more input.
    pub fn update(&mut self, mut data: &[u8]) {
        self.length += data.len() as u64;

        // Complete a buffered partial block first.
        if self.tail_len > 0 {
            let need = BLOCK_SIZE - self.tail_len;
            let take = need.min(data.len());
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            data = &data[take..];
            if self.tail_len == BLOCK_SIZE {
                let block = self.tail;
                self.absorb_block(&block);
                self.tail_len = 0;
            }
        }

        // Absorb whole blocks directly.
        while data.len() >= BLOCK_SIZE {
            let (block, rest) = data.split_at(BLOCK_SIZE);
            let mut buf = [0u8; BLOCK_SIZE];
            buf.copy_from_slice(block);
            self.absorb_block(&buf);
            data = rest;
        }

        // Buffer the remainder.
        if !data.is_empty() {
            self.tail[..data.len()].copy_from_slice(data);
            self.tail_len = data.len();
        }
    }

    /// Finishes the stream and returns the 20-byte digest.
    #[must_use]
    pub fn finalize(mut self) -> [u8; SIZE] {
        // A trailing partial block is absorbed as-is; absent bytes
        // contribute nothing, which is the zero-padding identity.
        if self.tail_len > 0 {
            let shift = ((self.block_index as usize) * SHIFT) % WIDTH_BITS;
            for (j, &b) in self.tail[..self.tail_len].iter().enumerate() {
                xor_byte_at(&mut self.acc, b, (shift + j * 8) % WIDTH_BITS);
            }
        }

        // Mix the total length into the top 8 bytes, little-endian.
        let len_bytes = self.length.to_le_bytes();
        for (k, &b) in len_bytes.iter().enumerate() {
            self.acc[SIZE - 8 + k] ^= b;
        }

        self.acc
    }

    /// Finishes the stream and returns the Base64 wire form.
    #[must_use]
    pub fn finalize_base64(self) -> String {
        BASE64.encode(self.finalize())
    }

    fn absorb_block(&mut self, block: &[u8; BLOCK_SIZE]) {
        let shift = ((self.block_index as usize) * SHIFT) % WIDTH_BITS;
        for (j, &b) in block.iter().enumerate() {
            xor_byte_at(&mut self.acc, b, (shift + j * 8) % WIDTH_BITS);
        }
        self.block_index += 1;
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// XORs one byte into the circular accumulator at a bit offset.
///
/// An unaligned offset straddles two accumulator cells.
fn xor_byte_at(acc: &mut [u8; SIZE], b: u8, bit_offset: usize) {
    let cell = bit_offset / 8;
    let bit = bit_offset % 8;
    acc[cell] ^= b << bit;
    if bit != 0 {
        acc[(cell + 1) % SIZE] ^= b >> (8 - bit);
    }
}

/// One-shot QuickXorHash of a byte slice.
#[must_use]
pub fn quick_xor(data: &[u8]) -> [u8; SIZE] {
    let mut hasher = QuickXorHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// One-shot QuickXorHash, Base64-encoded.
#[must_use]
pub fn quick_xor_base64(data: &[u8]) -> String {
    BASE64.encode(quick_xor(data))
}
