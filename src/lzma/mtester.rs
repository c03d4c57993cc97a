//! Minimal LZMA tester/decoder for whole members held in memory.
//!
//! # Role
//!
//! [`MemberTester`] replays one compressed member and reports the precise
//! byte position of any failure.  It never panics on corrupt input: a
//! distance beyond the live dictionary, a truncated stream, a mismatched
//! trailer, and an unknown in-stream marker each map to a [`Status`].
//!
//! # Fork-resume
//!
//! `test_member` with a member-position limit suspends the tester at a
//! packet boundary.  [`MemberTester::fork_into`] then clones the whole
//! decoder state — probability models, repeat distances, range coder, CRC —
//! into a caller-provided dictionary buffer, so 255 mutations of one byte
//! can each resume from the same suspend point without re-decoding the
//! prefix.  The borrow of the buffer lives as long as the forked tester.
//!
//! # Output
//!
//! Decoded bytes go to a `&mut dyn Write` sink: `io::sink()` for pure
//! testing, a file for decompression, or a filtering writer for
//! range-decompression.

use std::io::{self, Write};

use crate::header::Header;
use crate::lzma::range_dec::RangeDecoder;
use crate::lzma::{
    get_len_state, get_lit_state, BitModel, LenModel, State, DIS_ALIGN_BITS, DIS_ALIGN_SIZE,
    END_DIS_MODEL, LEN_STATES, MIN_MATCH_LEN, MODELED_DISTANCES, POS_STATES, POS_STATE_MASK,
    START_DIS_MODEL, STATES,
};

/// Result of replaying (part of) a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// A match distance exceeded the live dictionary.
    DecoderError,
    /// The stream ended before the end-of-stream marker.
    UnexpectedEof,
    /// Decoding finished but the trailer disagrees with the computed
    /// CRC, data size, or member size.
    TrailerMismatch,
    /// A marker payload other than end-of-stream or sync-flush.
    UnknownMarker,
    /// A position limit was reached; the tester is suspended.
    LimitReached,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

const NUM_DIS_MODELS: usize = (MODELED_DISTANCES - END_DIS_MODEL + 1) as usize;

#[derive(Clone)]
struct Models {
    bm_literal: [[BitModel; 0x300]; 1 << 3],
    bm_match: [[BitModel; POS_STATES]; STATES],
    bm_rep: [BitModel; STATES],
    bm_rep0: [BitModel; STATES],
    bm_rep1: [BitModel; STATES],
    bm_rep2: [BitModel; STATES],
    bm_len: [[BitModel; POS_STATES]; STATES],
    bm_dis_slot: [[BitModel; 1 << 6]; LEN_STATES],
    bm_dis: [BitModel; NUM_DIS_MODELS],
    bm_align: [BitModel; DIS_ALIGN_SIZE],
    match_len_model: LenModel,
    rep_len_model: LenModel,
}

impl Models {
    fn new() -> Box<Models> {
        Box::new(Models {
            bm_literal: [[BitModel::new(); 0x300]; 1 << 3],
            bm_match: [[BitModel::new(); POS_STATES]; STATES],
            bm_rep: [BitModel::new(); STATES],
            bm_rep0: [BitModel::new(); STATES],
            bm_rep1: [BitModel::new(); STATES],
            bm_rep2: [BitModel::new(); STATES],
            bm_len: [[BitModel::new(); POS_STATES]; STATES],
            bm_dis_slot: [[BitModel::new(); 1 << 6]; LEN_STATES],
            bm_dis: [BitModel::new(); NUM_DIS_MODELS],
            bm_align: [BitModel::new(); DIS_ALIGN_SIZE],
            match_len_model: LenModel::new(),
            rep_len_model: LenModel::new(),
        })
    }
}

enum DictBuf<'b> {
    Owned(Box<[u8]>),
    External(&'b mut [u8]),
}

impl DictBuf<'_> {
    #[inline]
    fn get(&self) -> &[u8] {
        match self {
            DictBuf::Owned(b) => b,
            DictBuf::External(b) => b,
        }
    }

    #[inline]
    fn get_mut(&mut self) -> &mut [u8] {
        match self {
            DictBuf::Owned(b) => b,
            DictBuf::External(b) => b,
        }
    }
}

pub struct MemberTester<'a, 'b> {
    rdec: RangeDecoder<'a>,
    dictionary_size: u32,
    dict: DictBuf<'b>,
    pos: u32,
    stream_pos: u32,
    partial_data_pos: u64,
    crc: crc32fast::Hasher,
    rep0: u32,
    rep1: u32,
    rep2: u32,
    rep3: u32,
    state: State,
    max_rep0: u32,
    max_rep0_pos: u64,
    pos_wrapped: bool,
    loaded: bool,
    models: Box<Models>,
}

impl<'a> MemberTester<'a, 'static> {
    /// Tester over a whole member image (header + stream + trailer) with an
    /// owned dictionary buffer.
    pub fn new(member: &'a [u8], dictionary_size: u32) -> MemberTester<'a, 'static> {
        MemberTester {
            rdec: RangeDecoder::new(member),
            dictionary_size,
            dict: DictBuf::Owned(vec![0; dictionary_size as usize].into_boxed_slice()),
            pos: 0,
            stream_pos: 0,
            partial_data_pos: 0,
            crc: crc32fast::Hasher::new(),
            rep0: 0,
            rep1: 0,
            rep2: 0,
            rep3: 0,
            state: State::default(),
            max_rep0: 0,
            max_rep0_pos: 0,
            pos_wrapped: false,
            loaded: false,
            models: Models::new(),
        }
    }
}

impl<'a, 'b> MemberTester<'a, 'b> {
    pub fn crc(&self) -> u32 {
        self.crc.clone().finalize()
    }

    pub fn data_position(&self) -> u64 {
        self.partial_data_pos + self.pos as u64
    }

    pub fn member_position(&self) -> u64 {
        self.rdec.member_position()
    }

    pub fn finished(&self) -> bool {
        self.rdec.finished()
    }

    pub fn max_distance(&self) -> u32 {
        self.max_rep0 + 1
    }

    pub fn max_distance_pos(&self) -> u64 {
        self.max_rep0_pos
    }

    pub fn dictionary_size(&self) -> u32 {
        self.dictionary_size
    }

    /// Overlay one mutated byte on the member image for this tester only.
    pub fn set_patch(&mut self, pos: usize, value: u8) {
        self.rdec.set_patch(pos, value);
    }

    /// The decoded dictionary as (recent, older) parts.  `recent` ends at
    /// the last decoded byte; `older` is the wrapped-around remainder, if
    /// the window has wrapped.
    pub fn dict_parts(&self) -> (&[u8], Option<&[u8]>) {
        let buf = self.dict.get();
        let pos = self.pos as usize;
        if self.pos_wrapped {
            (&buf[..pos], Some(&buf[pos..]))
        } else {
            (&buf[..pos], None)
        }
    }

    /// Clone the suspended tester into an externally-owned dictionary
    /// buffer of at least `dictionary_size` bytes.
    pub fn fork_into<'c>(&self, buf2: &'c mut [u8]) -> MemberTester<'a, 'c> {
        let ds = self.dictionary_size as usize;
        let buf2 = &mut buf2[..ds];
        let n = self.data_position().min(ds as u64) as usize;
        if n > 0 {
            buf2[..n].copy_from_slice(&self.dict.get()[..n]);
        } else {
            buf2[ds - 1] = 0;
        }
        MemberTester {
            rdec: self.rdec.clone(),
            dictionary_size: self.dictionary_size,
            dict: DictBuf::External(buf2),
            pos: self.pos,
            stream_pos: self.stream_pos,
            partial_data_pos: self.partial_data_pos,
            crc: self.crc.clone(),
            rep0: self.rep0,
            rep1: self.rep1,
            rep2: self.rep2,
            rep3: self.rep3,
            state: self.state,
            max_rep0: self.max_rep0,
            max_rep0_pos: self.max_rep0_pos,
            pos_wrapped: self.pos_wrapped,
            loaded: self.loaded,
            models: self.models.clone(),
        }
    }

    // ── Dictionary ──────────────────────────────────────────────────────────

    #[inline]
    fn peek_prev(&self) -> u8 {
        let i = if self.pos > 0 { self.pos } else { self.dictionary_size } - 1;
        self.dict.get()[i as usize]
    }

    #[inline]
    fn peek(&self, distance: u32) -> u8 {
        let base = if self.pos > distance { 0 } else { self.dictionary_size };
        self.dict.get()[(base + self.pos - distance - 1) as usize]
    }

    fn flush_data(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.pos > self.stream_pos {
            let buf = match &self.dict {
                DictBuf::Owned(b) => &b[..],
                DictBuf::External(b) => &b[..],
            };
            let chunk = &buf[self.stream_pos as usize..self.pos as usize];
            self.crc.update(chunk);
            out.write_all(chunk)?;
            if self.pos >= self.dictionary_size {
                self.partial_data_pos += self.pos as u64;
                self.pos = 0;
                self.pos_wrapped = true;
            }
            self.stream_pos = self.pos;
        }
        Ok(())
    }

    #[inline]
    fn put_byte(&mut self, b: u8, out: &mut dyn Write) -> io::Result<()> {
        let pos = self.pos as usize;
        self.dict.get_mut()[pos] = b;
        self.pos += 1;
        if self.pos >= self.dictionary_size {
            self.flush_data(out)?;
        }
        Ok(())
    }

    fn copy_block(&mut self, distance: u32, len: u32, out: &mut dyn Write) -> io::Result<()> {
        let ds = self.dictionary_size;
        if self.pos > distance && (self.pos as u64 + len as u64) < ds as u64 {
            // neither cursor wraps; sequential copy preserves overlap semantics
            let lpos = self.pos as usize;
            let i = (self.pos - distance - 1) as usize;
            let buf = self.dict.get_mut();
            for k in 0..len as usize {
                buf[lpos + k] = buf[i + k];
            }
            self.pos += len;
        } else {
            let mut i = if self.pos > distance {
                self.pos - distance - 1
            } else {
                ds + self.pos - distance - 1
            };
            for _ in 0..len {
                let b = self.dict.get()[i as usize];
                self.put_byte(b, out)?;
                i += 1;
                if i >= ds {
                    i = 0;
                }
            }
        }
        Ok(())
    }

    fn verify_trailer(&mut self) -> bool {
        let crc = self.crc();
        let data_size = self.data_position();
        match self.rdec.get_trailer() {
            Some(trailer) => {
                trailer.data_crc() == crc
                    && trailer.data_size() == data_size
                    && trailer.member_size() == self.member_position()
            }
            None => false,
        }
    }

    // ── Decoding ────────────────────────────────────────────────────────────

    /// Decode one member, or until a position limit is reached.
    ///
    /// After `Status::LimitReached` the tester may be resumed with another
    /// call, or forked with [`MemberTester::fork_into`].
    pub fn test_member(
        &mut self,
        mpos_limit: u64,
        dpos_limit: u64,
        out: &mut dyn Write,
    ) -> io::Result<Status> {
        if !self.loaded {
            if mpos_limit < (Header::SIZE + 5) as u64 {
                return Ok(Status::LimitReached);
            }
            self.rdec.load();
            self.loaded = true;
        }
        while !self.rdec.finished() {
            if self.member_position() >= mpos_limit || self.data_position() >= dpos_limit {
                self.flush_data(out)?;
                return Ok(Status::LimitReached);
            }
            let pos_state = (self.data_position() & POS_STATE_MASK) as usize;
            let st = self.state.get();
            if self.rdec.decode_bit(&mut self.models.bm_match[st][pos_state]) == 0 {
                // literal byte
                let lit_state = get_lit_state(self.peek_prev());
                let b = if self.state.is_char_set_char() {
                    self.rdec.decode_tree8(&mut self.models.bm_literal[lit_state])
                } else {
                    let match_byte = self.peek(self.rep0) as u32;
                    self.rdec
                        .decode_matched(&mut self.models.bm_literal[lit_state], match_byte)
                };
                self.put_byte(b as u8, out)?;
                continue;
            }
            // match or repeated match
            let len;
            if self.rdec.decode_bit(&mut self.models.bm_rep[st]) != 0 {
                if self.rdec.decode_bit(&mut self.models.bm_rep0[st]) == 0 {
                    if self.rdec.decode_bit(&mut self.models.bm_len[st][pos_state]) == 0 {
                        self.state.set_short_rep();
                        let b = self.peek(self.rep0);
                        self.put_byte(b, out)?;
                        continue;
                    }
                } else {
                    let distance;
                    if self.rdec.decode_bit(&mut self.models.bm_rep1[st]) == 0 {
                        distance = self.rep1;
                    } else {
                        if self.rdec.decode_bit(&mut self.models.bm_rep2[st]) == 0 {
                            distance = self.rep2;
                        } else {
                            distance = self.rep3;
                            self.rep3 = self.rep2;
                        }
                        self.rep2 = self.rep1;
                    }
                    self.rep1 = self.rep0;
                    self.rep0 = distance;
                }
                self.state.set_rep();
                len = MIN_MATCH_LEN + self.rdec.decode_len(&mut self.models.rep_len_model, pos_state);
            } else {
                len = MIN_MATCH_LEN
                    + self.rdec.decode_len(&mut self.models.match_len_model, pos_state);
                let mut distance =
                    self.rdec.decode_tree6(&mut self.models.bm_dis_slot[get_len_state(len)]);
                if distance >= START_DIS_MODEL {
                    let dis_slot = distance;
                    let direct_bits = (dis_slot >> 1) - 1;
                    distance = (2 | (dis_slot & 1)) << direct_bits;
                    if dis_slot < END_DIS_MODEL {
                        let base = (distance - dis_slot) as usize;
                        distance += self
                            .rdec
                            .decode_tree_reversed(&mut self.models.bm_dis[base..], direct_bits);
                    } else {
                        distance += self.rdec.decode(direct_bits - DIS_ALIGN_BITS) << DIS_ALIGN_BITS;
                        distance += self.rdec.decode_tree_reversed4(&mut self.models.bm_align);
                        if distance == 0xFFFF_FFFF {
                            // marker found
                            self.rdec.normalize();
                            self.flush_data(out)?;
                            if len == MIN_MATCH_LEN {
                                // End Of Stream
                                return Ok(if self.verify_trailer() {
                                    Status::Ok
                                } else {
                                    Status::TrailerMismatch
                                });
                            }
                            if len == MIN_MATCH_LEN + 1 {
                                // Sync Flush
                                self.rdec.load();
                                continue;
                            }
                            return Ok(Status::UnknownMarker);
                        }
                        if distance > self.max_rep0 {
                            self.max_rep0 = distance;
                            self.max_rep0_pos = self.member_position();
                        }
                    }
                }
                self.rep3 = self.rep2;
                self.rep2 = self.rep1;
                self.rep1 = self.rep0;
                self.rep0 = distance;
                self.state.set_match();
                if self.rep0 >= self.dictionary_size
                    || (self.rep0 >= self.pos && !self.pos_wrapped)
                {
                    self.flush_data(out)?;
                    return Ok(Status::DecoderError);
                }
            }
            self.copy_block(self.rep0, len, out)?;
        }
        self.flush_data(out)?;
        Ok(Status::UnexpectedEof)
    }

    /// Convenience: decode the whole member to a sink.
    pub fn test(&mut self) -> io::Result<Status> {
        self.test_member(u64::MAX, u64::MAX, &mut io::sink())
    }
}

// ── Packet-level diagnostics ──────────────────────────────────────────────────

/// Counters collected by [`debug_decode_member`].
#[derive(Debug, Default, Clone)]
pub struct PacketStats {
    pub total_packets: u64,
    pub max_distance: u32,
    pub max_distance_pos: u64,
    /// Largest number of stream bytes consumed by a single packet, and the
    /// member positions of the packets that reached it.
    pub max_packet_size: u64,
    pub max_packet_positions: Vec<u64>,
    pub max_marker_size: u64,
}

/// Decode one member recording per-packet statistics, optionally printing a
/// description of every packet to `log`.
pub fn debug_decode_member(
    member: &[u8],
    dictionary_size: u32,
    dpos: u64,
    mpos: u64,
    show_packets: bool,
    log: &mut dyn Write,
    out: &mut dyn Write,
) -> io::Result<(Status, PacketStats)> {
    let mut t = MemberTester::new(member, dictionary_size);
    let mut stats = PacketStats::default();
    t.rdec.load();
    t.loaded = true;
    let mut packet_start = t.member_position();
    loop {
        if t.rdec.finished() {
            t.flush_data(out)?;
            return Ok((Status::UnexpectedEof, stats));
        }
        let mp = t.member_position() + mpos;
        let dp = t.data_position() + dpos;
        let status = t.test_member(t.member_position() + 1, u64::MAX, out)?;
        stats.total_packets += 1;
        let psize = t.member_position() - packet_start;
        match status {
            Status::LimitReached => {
                if show_packets {
                    writeln!(log, "{:6} {:6}  packet", mp, dp)?;
                }
                if psize > stats.max_packet_size {
                    stats.max_packet_size = psize;
                    stats.max_packet_positions.clear();
                }
                if psize == stats.max_packet_size {
                    stats.max_packet_positions.push(mp);
                }
            }
            _ => {
                stats.max_marker_size = stats.max_marker_size.max(psize);
                stats.max_distance = t.max_distance();
                stats.max_distance_pos = t.max_distance_pos();
                if show_packets {
                    writeln!(log, "{:6} {:6}  marker / end of member", mp, dp)?;
                }
                return Ok((status, stats));
            }
        }
        stats.max_distance = t.max_distance();
        stats.max_distance_pos = t.max_distance_pos();
        packet_start = t.member_position();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    fn fake_member(stream: &[u8]) -> Vec<u8> {
        let mut m = Header::new(1 << 16).unwrap().data.to_vec();
        m.extend_from_slice(stream);
        m.extend_from_slice(&[0u8; 20]); // inconsistent trailer, never reached
        m
    }

    #[test]
    fn truncated_member_reports_eof() {
        let m = Header::new(1 << 12).unwrap().data.to_vec();
        let mut t = MemberTester::new(&m, 1 << 12);
        assert_eq!(t.test().unwrap(), Status::UnexpectedEof);
    }

    #[test]
    fn garbage_never_panics() {
        // a couple of adversarial byte patterns; all must terminate with a
        // non-Ok status and without panicking
        let patterns: [&[u8]; 4] = [&[0x00; 64], &[0xFF; 64], &[0xA5; 300], &[0x17, 0x55, 0x93, 0x00, 0xFF, 0x2C, 0x81, 0x40]];
        for p in patterns {
            let m = fake_member(p);
            let mut t = MemberTester::new(&m, 1 << 12);
            let status = t.test().unwrap();
            assert!(!status.is_ok(), "garbage decoded cleanly: {:?}", status);
        }
    }

    #[test]
    fn limit_suspends_before_load() {
        let m = fake_member(&[0u8; 32]);
        let mut t = MemberTester::new(&m, 1 << 12);
        let st = t.test_member(5, u64::MAX, &mut io::sink()).unwrap();
        assert_eq!(st, Status::LimitReached);
        assert_eq!(t.member_position(), Header::SIZE as u64);
    }

    #[test]
    fn suspend_and_resume_matches_straight_run() {
        let m = fake_member(&[0x00; 256]);
        let mut straight = MemberTester::new(&m, 1 << 12);
        let final_status = straight.test().unwrap();

        let mut stepped = MemberTester::new(&m, 1 << 12);
        let mut limit = 16;
        let status = loop {
            match stepped.test_member(limit, u64::MAX, &mut io::sink()).unwrap() {
                Status::LimitReached => limit += 16,
                other => break other,
            }
        };
        assert_eq!(status, final_status);
        assert_eq!(stepped.member_position(), straight.member_position());
        assert_eq!(stepped.data_position(), straight.data_position());
        assert_eq!(stepped.crc(), straight.crc());
    }

    #[test]
    fn fork_continues_identically() {
        let m = fake_member(&[0x00; 256]);
        let mut master = MemberTester::new(&m, 1 << 12);
        let final_status = {
            let mut t = MemberTester::new(&m, 1 << 12);
            t.test().unwrap()
        };
        assert_eq!(master.test_member(40, u64::MAX, &mut io::sink()).unwrap(), Status::LimitReached);

        let mut buf = vec![0u8; 1 << 12];
        let mut forked = master.fork_into(&mut buf);
        assert_eq!(forked.data_position(), master.data_position());
        let st = forked.test().unwrap();
        assert_eq!(st, final_status);

        // the master is still suspended and can be forked again
        let forked_pos = {
            let mut buf2 = vec![0u8; 1 << 12];
            let mut f2 = master.fork_into(&mut buf2);
            f2.test().unwrap();
            f2.member_position()
        };
        let mut buf3 = vec![0u8; 1 << 12];
        let mut f3 = master.fork_into(&mut buf3);
        f3.test().unwrap();
        assert_eq!(f3.member_position(), forked_pos);
    }
}
