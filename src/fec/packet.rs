//! FEC packet framing: the coded block size, the chksum packet, the fec
//! packet, and the index built from a fec file image.
//!
//! Serialization is bit-exact: every multi-byte integer is little-endian,
//! every CRC32 covers the bytes immediately before it, and packet
//! boundaries are byte-aligned.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::fec::crc32c::Crc32c;
use crate::fec::{gf16, gf8};

pub const FEC_MAGIC: [u8; 4] = [0xB3, 0xA5, 0xB6, 0xAF]; // ~"LZIP"
pub const FEC_PACKET_MAGIC: [u8; 4] = [FEC_MAGIC[0], b'F', b'E', b'C'];

pub const MIN_FBS: u64 = 512;
pub const MAX_UNIT_FBS: u64 = 1 << 30; //   1 GiB
pub const MAX_FBS: u64 = 1 << 47; // 128 TiB

pub const MAX_K8: u32 = 128;
pub const MAX_K16: u32 = 32768;
pub const MAX_NK16: u32 = 2048;

pub fn is_valid_fbs(fbs: u64) -> bool {
    (MIN_FBS..=MAX_FBS).contains(&fbs) && fbs % MIN_FBS == 0
}

pub fn ceil_divide(size: u64, block_size: u64) -> u64 {
    size / block_size + (size % block_size > 0) as u64
}

/// Zero-padded copy of the last (partial) data block, or `None` when the
/// payload fills its last block exactly.
pub fn set_lastbuf(prodata: &[u8], fbs: u64) -> Option<Vec<u8>> {
    let rest = (prodata.len() as u64 % fbs) as usize;
    if rest == 0 {
        return None;
    }
    let mut lastbuf = vec![0u8; fbs as usize];
    lastbuf[..rest].copy_from_slice(&prodata[prodata.len() - rest..]);
    Some(lastbuf)
}

// ── Coded block size ──────────────────────────────────────────────────────────

/// The compact floating-point block size: an 11-bit mantissa shifted by a
/// 5-bit exponent plus 9.  Valid block sizes are multiples of 512 from 512
/// to 2^47.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodedFbs {
    pub data: [u8; 2],
}

impl CodedFbs {
    pub const SIZE: usize = 2;

    /// Encode the smallest representable size `>= fbs` that is a multiple
    /// of `unit_fbs`.
    pub fn new(fbs: u64, unit_fbs: u64) -> Result<CodedFbs> {
        let mut m = fbs;
        let mut e: u32 = 0;
        while m > 2047 || (m > 1 && e < 9) {
            m >>= 1;
            e += 1;
        }
        if (m << e) < fbs {
            m += 1;
            if m > 2047 {
                m >>= 1;
                e += 1;
            }
        }
        while (m << e) % unit_fbs != 0 {
            m += 1;
            if m > 2047 {
                m >>= 1;
                e += 1;
            }
        }
        if m == 0 || m > 2047 || e < 9 || e > 40 || (m << e) < fbs
            || !is_valid_fbs(m << e)
            || !is_valid_fbs(fbs)
        {
            return Err(Error::internal("can't fit fec_block_size in packet"));
        }
        Ok(CodedFbs { data: [m as u8, (((e - 9) << 3) | (m >> 8) as u32) as u8] })
    }

    pub fn from_bytes(buf: &[u8]) -> CodedFbs {
        CodedFbs { data: [buf[0], buf[1]] }
    }

    pub fn value(&self) -> u64 {
        let m = (((self.data[1] & 7) as u64) << 8) | self.data[0] as u64;
        let e = (self.data[1] >> 3) + 9;
        m << e
    }
}

// ── Image validation ──────────────────────────────────────────────────────────

/// Result of checking an in-memory packet image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCheck {
    /// Not a packet of this type.
    NotThisType,
    WrongSize,
    WrongCrc,
    /// A valid packet of the given total size.
    Valid(usize),
}

// ── Chksum packet ─────────────────────────────────────────────────────────────

pub mod chksum {
    use super::*;

    pub const VERSION_O: usize = 4;
    pub const FLAGS_O: usize = 5;
    pub const FBS_O: usize = 6;
    pub const PRODATA_SIZE_O: usize = 8;
    pub const PRODATA_MD5_O: usize = 16;
    pub const HEADER_CRC_O: usize = 32;
    pub const HEADER_SIZE: usize = 36;
    pub const CRC_ARRAY_O: usize = HEADER_SIZE;
    pub const TRAILER_SIZE: usize = 4;
    pub const CURRENT_VERSION: u8 = 0;

    pub fn min_packet_size() -> usize {
        HEADER_SIZE + 4 + TRAILER_SIZE
    }

    /// Serialize a chksum packet: header, one le32 CRC per data block,
    /// payload CRC.
    pub fn build(
        prodata: &[u8],
        prodata_md5: &[u8; 16],
        coded_fbs: CodedFbs,
        gf16_flag: bool,
        is_crc_c: bool,
    ) -> Result<Vec<u8>> {
        let fbs = coded_fbs.value();
        let prodata_blocks = ceil_divide(prodata.len() as u64, fbs);
        if prodata_blocks * fbs < prodata.len() as u64 {
            return Err(Error::internal("prodata_blocks * fec_block_size < prodata_size"));
        }
        let paysize = (prodata_blocks * 4) as usize;
        let packet_size = HEADER_SIZE + paysize + TRAILER_SIZE;
        let mut image = vec![0u8; packet_size];

        image[..4].copy_from_slice(&FEC_MAGIC);
        image[VERSION_O] = CURRENT_VERSION;
        image[FLAGS_O] = ((gf16_flag as u8) << 1) | is_crc_c as u8;
        image[FBS_O..FBS_O + 2].copy_from_slice(&coded_fbs.data);
        LittleEndian::write_u64(&mut image[PRODATA_SIZE_O..PRODATA_SIZE_O + 8],
                                prodata.len() as u64);
        image[PRODATA_MD5_O..PRODATA_MD5_O + 16].copy_from_slice(prodata_md5);
        let header_crc = crc32fast::hash(&image[..HEADER_CRC_O]);
        LittleEndian::write_u32(&mut image[HEADER_CRC_O..HEADER_CRC_O + 4], header_crc);

        let crc32c = Crc32c::new();
        for (i, chunk) in prodata.chunks(fbs as usize).enumerate() {
            let crc = if is_crc_c { crc32c.compute(chunk) } else { crc32fast::hash(chunk) };
            let o = CRC_ARRAY_O + i * 4;
            LittleEndian::write_u32(&mut image[o..o + 4], crc);
        }
        let payload_crc = crc32fast::hash(&image[CRC_ARRAY_O..CRC_ARRAY_O + paysize]);
        let o = CRC_ARRAY_O + paysize;
        LittleEndian::write_u32(&mut image[o..o + 4], payload_crc);
        Ok(image)
    }

    pub fn prodata_size(image: &[u8]) -> u64 {
        LittleEndian::read_u64(&image[PRODATA_SIZE_O..PRODATA_SIZE_O + 8])
    }

    pub fn prodata_md5(image: &[u8]) -> [u8; 16] {
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&image[PRODATA_MD5_O..PRODATA_MD5_O + 16]);
        md5
    }

    pub fn fec_block_size(image: &[u8]) -> u64 {
        CodedFbs::from_bytes(&image[FBS_O..]).value()
    }

    pub fn gf16_flag(image: &[u8]) -> bool {
        image[FLAGS_O] & 2 != 0
    }

    pub fn is_crc_c(image: &[u8]) -> bool {
        image[FLAGS_O] & 1 != 0
    }

    pub fn packet_size(image: &[u8]) -> u64 {
        ceil_divide(prodata_size(image), fec_block_size(image)) * 4
            + (HEADER_SIZE + TRAILER_SIZE) as u64
    }

    /// Validate an image: magic, header CRC, version, flags, derived
    /// sizes, payload CRC, in that order.
    pub fn check_image(image: &[u8], max_size: usize) -> ImageCheck {
        if max_size < min_packet_size() || image.len() < min_packet_size()
            || image[..4] != FEC_MAGIC
        {
            return ImageCheck::NotThisType;
        }
        let stored = LittleEndian::read_u32(&image[HEADER_CRC_O..HEADER_CRC_O + 4]);
        if stored != crc32fast::hash(&image[..HEADER_CRC_O]) {
            return ImageCheck::WrongCrc;
        }
        if image[VERSION_O] != CURRENT_VERSION || image[FLAGS_O] > 3 {
            return ImageCheck::WrongCrc;
        }
        let fbs = fec_block_size(image);
        if !is_valid_fbs(fbs) {
            return ImageCheck::WrongSize;
        }
        let image_size = packet_size(image);
        let max_k = if gf16_flag(image) { MAX_K16 } else { MAX_K8 } as u64;
        if image_size < min_packet_size() as u64
            || image_size > max_size as u64
            || image_size > image.len() as u64
            || image_size > (HEADER_SIZE + TRAILER_SIZE) as u64 + max_k * 4
        {
            return ImageCheck::WrongSize;
        }
        let image_size = image_size as usize;
        let paysize = image_size - HEADER_SIZE - TRAILER_SIZE;
        let prodata_blocks = ceil_divide(prodata_size(image), fbs);
        if paysize % 4 != 0
            || (paysize / 4) as u64 != prodata_blocks
            || prodata_blocks == 0
            || prodata_blocks > max_k
        {
            return ImageCheck::WrongSize;
        }
        let payload_crc = LittleEndian::read_u32(&image[image_size - 4..image_size]);
        if crc32fast::hash(&image[CRC_ARRAY_O..image_size - 4]) != payload_crc {
            return ImageCheck::WrongCrc;
        }
        ImageCheck::Valid(image_size)
    }
}

// ── Fec packet ────────────────────────────────────────────────────────────────

pub mod fec_packet {
    use super::*;

    pub const FBN_O: usize = 4;
    pub const FBS_O: usize = 6;
    pub const HEADER_CRC_O: usize = 8;
    pub const HEADER_SIZE: usize = 12;
    pub const FEC_BLOCK_O: usize = HEADER_SIZE;
    pub const TRAILER_SIZE: usize = 4;

    pub fn min_packet_size() -> usize {
        HEADER_SIZE + MIN_FBS as usize + TRAILER_SIZE
    }

    /// Serialize one fec packet: header, parity block, payload CRC.
    pub fn build(
        prodata: &[u8],
        lastbuf: Option<&[u8]>,
        fbn: u32,
        k: usize,
        coded_fbs: CodedFbs,
        gf16_flag: bool,
    ) -> Vec<u8> {
        let fbs = coded_fbs.value() as usize;
        let packet_size = HEADER_SIZE + fbs + TRAILER_SIZE;
        let mut image = vec![0u8; packet_size];

        image[..4].copy_from_slice(&FEC_PACKET_MAGIC);
        LittleEndian::write_u16(&mut image[FBN_O..FBN_O + 2], fbn as u16);
        image[FBS_O..FBS_O + 2].copy_from_slice(&coded_fbs.data);
        let header_crc = crc32fast::hash(&image[..HEADER_CRC_O]);
        LittleEndian::write_u32(&mut image[HEADER_CRC_O..HEADER_CRC_O + 4], header_crc);

        {
            let (_, rest) = image.split_at_mut(FEC_BLOCK_O);
            let block = &mut rest[..fbs];
            if gf16_flag {
                gf16::rs16_encode(prodata, lastbuf, block, fbs, fbn, k);
            } else {
                gf8::rs8_encode(prodata, lastbuf, block, fbs, fbn, k);
            }
        }
        let payload_crc = crc32fast::hash(&image[FEC_BLOCK_O..FEC_BLOCK_O + fbs]);
        let o = FEC_BLOCK_O + fbs;
        LittleEndian::write_u32(&mut image[o..o + 4], payload_crc);
        image
    }

    pub fn fec_block_number(image: &[u8]) -> u32 {
        LittleEndian::read_u16(&image[FBN_O..FBN_O + 2]) as u32
    }

    pub fn fec_block_size(image: &[u8]) -> u64 {
        CodedFbs::from_bytes(&image[FBS_O..]).value()
    }

    pub fn packet_size(image: &[u8]) -> u64 {
        (HEADER_SIZE + TRAILER_SIZE) as u64 + fec_block_size(image)
    }

    pub fn check_image(image: &[u8], max_size: usize) -> ImageCheck {
        if max_size < min_packet_size()
            || image.len() < min_packet_size()
            || image[..4] != FEC_PACKET_MAGIC
        {
            return ImageCheck::NotThisType;
        }
        let stored = LittleEndian::read_u32(&image[HEADER_CRC_O..HEADER_CRC_O + 4]);
        if stored != crc32fast::hash(&image[..HEADER_CRC_O]) {
            return ImageCheck::WrongCrc;
        }
        let image_size = packet_size(image);
        if image_size < min_packet_size() as u64
            || image_size > max_size as u64
            || image_size > image.len() as u64
        {
            return ImageCheck::WrongSize;
        }
        let image_size = image_size as usize;
        let fbs = fec_block_size(image);
        let paysize = image_size - HEADER_SIZE - TRAILER_SIZE;
        let payload_crc = LittleEndian::read_u32(&image[image_size - 4..image_size]);
        if crc32fast::hash(&image[FEC_BLOCK_O..image_size - 4]) != payload_crc {
            return ImageCheck::WrongCrc;
        }
        if !is_valid_fbs(fbs) || paysize as u64 != fbs {
            return ImageCheck::WrongSize;
        }
        ImageCheck::Valid(image_size)
    }
}

// ── Fec index ─────────────────────────────────────────────────────────────────

/// Parsed view of a fec file: the CRC arrays, the fec packets, and the
/// parameters every packet must agree on.
pub struct FecIndex<'a> {
    crc_array: Option<&'a [u8]>,
    crcc_array: Option<&'a [u8]>,
    fec_packets: Vec<&'a [u8]>, // whole packet images
    fec_net_size: u64,
    fec_block_size: u64,
    prodata_size: u64,
    prodata_md5: [u8; 16],
    gf16: bool,
}

impl<'a> FecIndex<'a> {
    pub fn parse(fecdata: &'a [u8], ignore_errors: bool) -> Result<FecIndex<'a>> {
        if fecdata.is_empty() {
            return Err(Error::data("Fec file is empty."));
        }
        if fecdata.len() >= 4 && fecdata[..4] != FEC_MAGIC {
            return Err(Error::data("Bad magic number (file is not fec data)."));
        }
        if fecdata.len() < chksum::min_packet_size() + fec_packet::min_packet_size() {
            return Err(Error::data("Fec file is too short."));
        }
        if fecdata[chksum::VERSION_O] != chksum::CURRENT_VERSION {
            return Err(Error::data(format!(
                "Version {} fec format not supported.",
                fecdata[chksum::VERSION_O]
            )));
        }

        let mut index = FecIndex {
            crc_array: None,
            crcc_array: None,
            fec_packets: Vec::new(),
            fec_net_size: 0,
            fec_block_size: 0,
            prodata_size: 0,
            prodata_md5: [0; 16],
            gf16: false,
        };

        // pos usually points at a packet header, except while resyncing
        // over a corrupt packet
        let mut pos = 0usize;
        while pos < fecdata.len() {
            let rest = &fecdata[pos..];
            match chksum::check_image(rest, rest.len()) {
                ImageCheck::Valid(size) => {
                    index.parse_chksum(&fecdata[pos..pos + size])?;
                    index.fec_net_size += size as u64;
                    pos += size;
                    continue;
                }
                ImageCheck::WrongSize if !ignore_errors => {
                    return Err(Error::data("Wrong packet size in chksum packet."))
                }
                ImageCheck::WrongCrc if !ignore_errors => {
                    return Err(Error::data("Wrong CRC in chksum packet."))
                }
                ImageCheck::NotThisType => {}
                _ => {
                    pos += 1;
                    continue;
                }
            }
            match fec_packet::check_image(rest, rest.len()) {
                ImageCheck::Valid(size) => {
                    let image = &fecdata[pos..pos + size];
                    let fbs = fec_packet::fec_block_size(image);
                    if !is_valid_fbs(index.fec_block_size) {
                        index.fec_block_size = fbs;
                    } else if index.fec_block_size != fbs {
                        return Err(Error::data("Contradictory fec_block_size in fec packet."));
                    }
                    index.fec_packets.push(image);
                    index.fec_net_size += size as u64;
                    pos += size;
                    continue;
                }
                ImageCheck::WrongSize if !ignore_errors => {
                    return Err(Error::data("Wrong packet size in fec packet."))
                }
                ImageCheck::WrongCrc if !ignore_errors => {
                    return Err(Error::data("Wrong CRC in fec packet."))
                }
                ImageCheck::NotThisType => {}
                _ => {
                    pos += 1;
                    continue;
                }
            }
            if ignore_errors {
                // resync on the next magic byte
                pos += 1;
                while pos < fecdata.len() && fecdata[pos] != FEC_MAGIC[0] {
                    pos += 1;
                }
                continue;
            }
            return Err(Error::data("Unknown packet type in fec file."));
        }

        if index.prodata_size == 0 {
            return Err(Error::data("No valid chksum packets found."));
        }
        if index.fec_packets.is_empty() {
            return Err(Error::data("No valid fec packets found."));
        }
        if !index.has_array() && !ignore_errors {
            return Err(Error::data("No valid CRC arrays found."));
        }
        if index.fec_blocks() as u64 > index.prodata_blocks() {
            return Err(Error::data("Too many fec packets found. (More than data blocks)"));
        }
        if !is_valid_fbs(index.fec_block_size) {
            return Err(Error::internal("fec_block_size not found"));
        }
        // every fbn must be unique and below max_k
        let max_k = if index.gf16 { MAX_K16 } else { MAX_K8 };
        let mut seen = vec![false; max_k as usize];
        for p in &index.fec_packets {
            let fbn = fec_packet::fec_block_number(p);
            if fbn >= max_k {
                return Err(Error::data("Invalid fec_block_number in fec packet."));
            }
            if seen[fbn as usize] {
                return Err(Error::data("Same fec_block_number in two fec packets."));
            }
            seen[fbn as usize] = true;
        }
        Ok(index)
    }

    fn parse_chksum(&mut self, image: &'a [u8]) -> Result<()> {
        let prodata_size = chksum::prodata_size(image);
        if self.prodata_size == 0 {
            // first chksum packet fixes the parameters
            self.prodata_size = prodata_size;
            self.prodata_md5 = chksum::prodata_md5(image);
            self.gf16 = chksum::gf16_flag(image);
        } else {
            if self.prodata_size != prodata_size {
                return Err(Error::data("Contradictory protected data size in chksum packet."));
            }
            if self.prodata_md5 != chksum::prodata_md5(image) {
                return Err(Error::data("Contradictory protected data MD5 in chksum packet."));
            }
            if self.gf16 != chksum::gf16_flag(image) {
                return Err(Error::data("Contradictory Galois Field size in chksum packet."));
            }
        }
        let fbs = chksum::fec_block_size(image);
        if !is_valid_fbs(self.fec_block_size) {
            self.fec_block_size = fbs;
        } else if self.fec_block_size != fbs {
            return Err(Error::data("Contradictory fec_block_size in chksum packet."));
        }
        let paysize = image.len() - chksum::HEADER_SIZE - chksum::TRAILER_SIZE;
        let array = &image[chksum::CRC_ARRAY_O..chksum::CRC_ARRAY_O + paysize];
        if !chksum::is_crc_c(image) {
            if self.crc_array.is_some() {
                return Err(Error::data("More than one CRC32 array found."));
            }
            self.crc_array = Some(array);
        } else {
            if self.crcc_array.is_some() {
                return Err(Error::data("More than one CRC32-C array found."));
            }
            self.crcc_array = Some(array);
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn fec_block_size(&self) -> u64 {
        self.fec_block_size
    }

    pub fn fec_blocks(&self) -> usize {
        self.fec_packets.len()
    }

    pub fn fec_bytes(&self) -> u64 {
        self.fec_blocks() as u64 * self.fec_block_size
    }

    pub fn fec_net_size(&self) -> u64 {
        self.fec_net_size
    }

    pub fn fec_block(&self, i: usize) -> &'a [u8] {
        let image = self.fec_packets[i];
        &image[fec_packet::FEC_BLOCK_O..fec_packet::FEC_BLOCK_O + self.fec_block_size as usize]
    }

    pub fn fbn(&self, i: usize) -> u32 {
        fec_packet::fec_block_number(self.fec_packets[i])
    }

    pub fn gf16(&self) -> bool {
        self.gf16
    }

    pub fn prodata_size(&self) -> u64 {
        self.prodata_size
    }

    pub fn prodata_md5(&self) -> &[u8; 16] {
        &self.prodata_md5
    }

    pub fn prodata_blocks(&self) -> u64 {
        ceil_divide(self.prodata_size, self.fec_block_size)
    }

    pub fn has_array(&self) -> bool {
        self.crc_array.is_some() || self.crcc_array.is_some()
    }

    pub fn crc(&self, i: u64) -> Option<u32> {
        self.crc_array.map(|a| LittleEndian::read_u32(&a[i as usize * 4..]))
    }

    pub fn crcc(&self, i: u64) -> Option<u32> {
        self.crcc_array.map(|a| LittleEndian::read_u32(&a[i as usize * 4..]))
    }

    pub fn block_pos(&self, i: u64) -> u64 {
        i * self.fec_block_size
    }

    pub fn block_size(&self, i: u64) -> u64 {
        let pos = i * self.fec_block_size;
        if pos >= self.prodata_size {
            0
        } else {
            self.fec_block_size.min(self.prodata_size - pos)
        }
    }

    /// Human-readable summary, fbn values printed as ranges.
    pub fn show(&self, input_name: &str, fec_name: &str) {
        if !input_name.is_empty() {
            println!("Protected file: '{}'", input_name);
        }
        println!(
            "Protected size: {:>11}   Block size: {:>7}   Data blocks: {}",
            self.prodata_size,
            self.fec_block_size,
            self.prodata_blocks()
        );
        println!("      Fec file: '{}'", fec_name);
        println!(
            "      Fec size: {:>11}   Fec blocks: {}   Fec bytes: {}",
            self.fec_net_size,
            self.fec_blocks(),
            self.fec_bytes()
        );
        print!("   Fec numbers:");
        let mut i = 0;
        while i < self.fec_blocks() {
            print!(" {}", self.fbn(i));
            let j = i;
            while i + 1 < self.fec_blocks() && self.fbn(i + 1) == self.fbn(i) + 1 {
                i += 1;
            }
            if i > j {
                print!("{}{}", if i == j + 1 { ' ' } else { '-' }, self.fbn(i));
            }
            i += 1;
        }
        println!();
        println!(
            "      Features: GF(2^{}){}{}",
            if self.gf16 { "16" } else { "8" },
            if self.crc_array.is_some() { " CRC32" } else { "" },
            if self.crcc_array.is_some() { " CRC32-C" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_fbs_round_trip() {
        for &(fbs, unit) in
            &[(512u64, 512u64), (4096, 512), (65536, 4096), (512 * 3, 512), (1 << 20, 65536)]
        {
            let coded = CodedFbs::new(fbs, unit).unwrap();
            assert!(coded.value() >= fbs);
            assert_eq!(coded.value() % unit, 0, "fbs {} unit {}", fbs, unit);
            assert!(is_valid_fbs(coded.value()));
        }
        // exact powers of two encode exactly
        assert_eq!(CodedFbs::new(512, 512).unwrap().value(), 512);
        assert_eq!(CodedFbs::new(1 << 20, 512).unwrap().value(), 1 << 20);
    }

    #[test]
    fn coded_fbs_rejects_invalid() {
        assert!(CodedFbs::new(100, 512).is_err()); // not a multiple of 512
        assert!(CodedFbs::new(0, 512).is_err());
    }

    #[test]
    fn chksum_packet_builds_and_validates() {
        let prodata: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let coded = CodedFbs::new(512, 512).unwrap();
        let md5 = [7u8; 16];
        let image = chksum::build(&prodata, &md5, coded, false, false).unwrap();
        // 4 blocks of 512 -> 4 CRCs
        assert_eq!(image.len(), chksum::HEADER_SIZE + 4 * 4 + chksum::TRAILER_SIZE);
        assert_eq!(chksum::check_image(&image, image.len()), ImageCheck::Valid(image.len()));
        assert_eq!(chksum::prodata_size(&image), 2000);
        assert_eq!(chksum::prodata_md5(&image), md5);
        assert!(!chksum::gf16_flag(&image));
        assert!(!chksum::is_crc_c(&image));

        let mut corrupt = image.clone();
        corrupt[chksum::CRC_ARRAY_O] ^= 0xFF;
        assert_eq!(chksum::check_image(&corrupt, corrupt.len()), ImageCheck::WrongCrc);
        let mut corrupt = image.clone();
        corrupt[0] ^= 0xFF;
        assert_eq!(chksum::check_image(&corrupt, corrupt.len()), ImageCheck::NotThisType);
    }

    #[test]
    fn fec_packet_builds_and_validates() {
        let prodata = vec![0x5Au8; 1024];
        let coded = CodedFbs::new(512, 512).unwrap();
        let image = fec_packet::build(&prodata, None, 3, 2, coded, false);
        assert_eq!(
            fec_packet::check_image(&image, image.len()),
            ImageCheck::Valid(image.len())
        );
        assert_eq!(fec_packet::fec_block_number(&image), 3);
        assert_eq!(fec_packet::fec_block_size(&image), 512);

        let mut corrupt = image.clone();
        let o = fec_packet::FEC_BLOCK_O + 100;
        corrupt[o] ^= 1;
        assert_eq!(fec_packet::check_image(&corrupt, corrupt.len()), ImageCheck::WrongCrc);
    }

    #[test]
    fn fec_index_parses_a_whole_file() {
        let prodata: Vec<u8> = (0..3000).map(|i| (i * 7 % 256) as u8).collect();
        let coded = CodedFbs::new(512, 512).unwrap();
        let md5 = [1u8; 16];
        let mut fecdata = chksum::build(&prodata, &md5, coded, false, false).unwrap();
        let lastbuf = set_lastbuf(&prodata, 512);
        let k = ceil_divide(3000, 512) as usize;
        for fbn in 0..3u32 {
            fecdata.extend(fec_packet::build(
                &prodata,
                lastbuf.as_deref(),
                fbn,
                k,
                coded,
                false,
            ));
        }
        fecdata.extend(chksum::build(&prodata, &md5, coded, false, true).unwrap());

        let index = FecIndex::parse(&fecdata, false).unwrap();
        assert_eq!(index.prodata_size(), 3000);
        assert_eq!(index.prodata_blocks(), 6);
        assert_eq!(index.fec_blocks(), 3);
        assert_eq!(index.fec_block_size(), 512);
        assert!(index.has_array());
        assert!(index.crc(0).is_some());
        assert!(index.crcc(0).is_some());
        assert_eq!(index.fbn(2), 2);
        assert!(!index.gf16());

        // duplicate fbn is rejected
        let dup = fec_packet::build(&prodata, lastbuf.as_deref(), 2, k, coded, false);
        let mut bad = fecdata.clone();
        bad.extend(dup);
        assert!(FecIndex::parse(&bad, false).is_err());
    }

    #[test]
    fn fec_index_resyncs_with_ignore_errors() {
        let prodata = vec![9u8; 2048];
        let coded = CodedFbs::new(512, 512).unwrap();
        let md5 = [2u8; 16];
        let mut fecdata = chksum::build(&prodata, &md5, coded, false, false).unwrap();
        // garbage between packets
        fecdata.extend_from_slice(b"garbage!");
        fecdata.extend(fec_packet::build(&prodata, None, 0, 4, coded, false));

        assert!(FecIndex::parse(&fecdata, false).is_err());
        let index = FecIndex::parse(&fecdata, true).unwrap();
        assert_eq!(index.fec_blocks(), 1);
    }
}
