//! Arithmetic range decoder over an in-memory member buffer.
//!
//! The decoder starts just past the member header and reads the buffer one
//! byte at a time, maintaining the `(code, range)` pair.  Past the end of
//! the buffer it yields `0xFF` filler bytes, which keeps a truncated member
//! from looking like a valid end-of-stream marker.

use crate::header::{Header, Trailer};
use crate::lzma::{
    BitModel, LenModel, BIT_MODEL_MOVE_BITS, BIT_MODEL_TOTAL, BIT_MODEL_TOTAL_BITS,
    LEN_LOW_SYMBOLS, LEN_MID_SYMBOLS,
};

#[derive(Clone)]
pub struct RangeDecoder<'a> {
    buffer: &'a [u8],
    pos: usize,
    code: u32,
    range: u32,
    /// Single-byte overlay: `(position, value)` replaces the buffer byte at
    /// `position`.  Lets a forked tester probe a mutation while other
    /// testers keep reading the pristine buffer.
    patch: Option<(usize, u8)>,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(buffer: &'a [u8]) -> RangeDecoder<'a> {
        RangeDecoder { buffer, pos: Header::SIZE, code: 0, range: 0xFFFF_FFFF, patch: None }
    }

    pub fn set_patch(&mut self, pos: usize, value: u8) {
        self.patch = Some((pos, value));
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    #[inline]
    pub fn member_position(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub fn get_byte(&mut self) -> u8 {
        if self.finished() {
            return 0xFF;
        }
        let b = match self.patch {
            Some((p, v)) if p == self.pos => v,
            _ => self.buffer[self.pos],
        };
        self.pos += 1;
        b
    }

    /// The first LZMA byte of the member, normally zero.
    pub fn nonzero_first_byte(&self) -> bool {
        self.buffer.len() > Header::SIZE && self.buffer[Header::SIZE] != 0
    }

    /// Read the 20 trailer bytes following the coded stream, if present.
    pub fn get_trailer(&mut self) -> Option<Trailer> {
        if self.buffer.len() - self.pos < Trailer::SIZE {
            return None;
        }
        let mut t = Trailer::from_bytes(&self.buffer[self.pos..]);
        if let Some((p, v)) = self.patch {
            if p >= self.pos && p < self.pos + Trailer::SIZE {
                t.data[p - self.pos] = v;
            }
        }
        self.pos += Trailer::SIZE;
        Some(t)
    }

    /// Load the coder: five bytes, the first of which is discarded.
    pub fn load(&mut self) {
        self.code = 0;
        for _ in 0..5 {
            self.code = (self.code << 8) | self.get_byte() as u32;
        }
        self.range = 0xFFFF_FFFF;
    }

    #[inline]
    pub fn normalize(&mut self) {
        if self.range <= 0x00FF_FFFF {
            self.range <<= 8;
            self.code = (self.code << 8) | self.get_byte() as u32;
        }
    }

    /// Decode `num_bits` raw (equiprobable) bits.
    pub fn decode(&mut self, num_bits: u32) -> u32 {
        let mut symbol = 0;
        for _ in 0..num_bits {
            self.normalize();
            self.range >>= 1;
            let bit = (self.code >= self.range) as u32;
            symbol = (symbol << 1) + bit;
            self.code -= self.range & bit.wrapping_neg();
        }
        symbol
    }

    #[inline]
    pub fn decode_bit(&mut self, bm: &mut BitModel) -> u32 {
        self.normalize();
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * bm.probability;
        if self.code < bound {
            self.range = bound;
            bm.probability += (BIT_MODEL_TOTAL - bm.probability) >> BIT_MODEL_MOVE_BITS;
            0
        } else {
            self.range -= bound;
            self.code -= bound;
            bm.probability -= bm.probability >> BIT_MODEL_MOVE_BITS;
            1
        }
    }

    pub fn decode_tree3(&mut self, bm: &mut [BitModel]) -> u32 {
        let mut symbol = 1;
        for _ in 0..3 {
            symbol = (symbol << 1) | self.decode_bit(&mut bm[symbol as usize]);
        }
        symbol & 7
    }

    pub fn decode_tree6(&mut self, bm: &mut [BitModel]) -> u32 {
        let mut symbol = 1;
        for _ in 0..6 {
            symbol = (symbol << 1) | self.decode_bit(&mut bm[symbol as usize]);
        }
        symbol & 0x3F
    }

    pub fn decode_tree8(&mut self, bm: &mut [BitModel]) -> u32 {
        let mut symbol = 1;
        for _ in 0..8 {
            symbol = (symbol << 1) | self.decode_bit(&mut bm[symbol as usize]);
        }
        symbol & 0xFF
    }

    pub fn decode_tree_reversed(&mut self, bm: &mut [BitModel], num_bits: u32) -> u32 {
        let mut model = 1usize;
        let mut symbol = 0;
        for i in 0..num_bits {
            let bit = self.decode_bit(&mut bm[model]);
            model = (model << 1) + bit as usize;
            symbol |= bit << i;
        }
        symbol
    }

    pub fn decode_tree_reversed4(&mut self, bm: &mut [BitModel]) -> u32 {
        self.decode_tree_reversed(bm, 4)
    }

    /// Decode a literal byte matched against `match_byte` from the
    /// dictionary (used after match states).
    pub fn decode_matched(&mut self, bm: &mut [BitModel], mut match_byte: u32) -> u32 {
        let mut symbol: u32 = 1;
        while symbol < 0x100 {
            match_byte <<= 1;
            let match_bit = match_byte & 0x100;
            let bit = self.decode_bit(&mut bm[(0x100 + match_bit + symbol) as usize]);
            symbol = (symbol << 1) | bit;
            if match_bit != bit << 8 {
                while symbol < 0x100 {
                    symbol = (symbol << 1) | self.decode_bit(&mut bm[symbol as usize]);
                }
                break;
            }
        }
        symbol & 0xFF
    }

    /// Decode a match length, not yet offset by `MIN_MATCH_LEN`.
    pub fn decode_len(&mut self, lm: &mut LenModel, pos_state: usize) -> u32 {
        if self.decode_bit(&mut lm.choice1) == 0 {
            return self.decode_tree3(&mut lm.bm_low[pos_state]);
        }
        if self.decode_bit(&mut lm.choice2) == 0 {
            return LEN_LOW_SYMBOLS as u32 + self.decode_tree3(&mut lm.bm_mid[pos_state]);
        }
        (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32 + self.decode_tree8(&mut lm.bm_high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::BitModel;

    fn member_with_stream(stream: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x4C, 0x5A, 0x49, 0x50, 1, 12];
        buf.extend_from_slice(stream);
        buf
    }

    #[test]
    fn raw_bits_all_ones_and_zeros() {
        let ones = member_with_stream(&[0xFF; 16]);
        let mut rd = RangeDecoder::new(&ones);
        rd.load();
        assert_eq!(rd.decode(8), 0xFF);

        let mut rd = RangeDecoder::new(&ones);
        rd.load();
        assert_eq!(rd.decode(4), 0xF);

        let zeros = member_with_stream(&[0x00; 16]);
        let mut rd = RangeDecoder::new(&zeros);
        rd.load();
        assert_eq!(rd.decode(8), 0);
        assert_eq!(rd.decode(32), 0);
    }

    #[test]
    fn truncated_input_yields_filler() {
        let short = member_with_stream(&[0x00, 0x12]);
        let mut rd = RangeDecoder::new(&short);
        rd.load(); // already reads past the end
        assert!(rd.finished());
        assert_eq!(rd.get_byte(), 0xFF);
        assert!(rd.get_trailer().is_none());
    }

    #[test]
    fn bit_model_adapts() {
        let zeros = member_with_stream(&[0x00; 16]);
        let mut rd = RangeDecoder::new(&zeros);
        rd.load();
        let mut bm = BitModel::new();
        let before = bm.probability;
        assert_eq!(rd.decode_bit(&mut bm), 0);
        assert!(bm.probability > before);

        let ones = member_with_stream(&[0xFF; 16]);
        let mut rd = RangeDecoder::new(&ones);
        rd.load();
        let mut bm = BitModel::new();
        assert_eq!(rd.decode_bit(&mut bm), 1);
        assert!(bm.probability < before);
    }

    #[test]
    fn tree_decode_on_biased_input() {
        let zeros = member_with_stream(&[0x00; 32]);
        let mut rd = RangeDecoder::new(&zeros);
        rd.load();
        let mut bm = [BitModel::new(); 256];
        assert_eq!(rd.decode_tree8(&mut bm), 0);
        let mut bm = [BitModel::new(); 16];
        assert_eq!(rd.decode_tree_reversed4(&mut bm), 0);
    }

    #[test]
    fn trailer_extraction() {
        let mut buf = member_with_stream(&[0; 4]);
        buf.extend_from_slice(&[0xAA; 20]);
        let mut rd = RangeDecoder::new(&buf);
        for _ in 0..4 {
            rd.get_byte();
        }
        let t = rd.get_trailer().unwrap();
        assert_eq!(t.data, [0xAA; 20]);
        assert!(rd.finished());
    }
}
