//! CRC32-C (Castagnoli polynomial), table-driven.
//!
//! The chksum packet may carry one CRC32 array and one CRC32-C array over
//! the same payload; two different polynomials make a corrupted block
//! visible even when one CRC collides.

pub struct Crc32c {
    table: [u32; 256],
}

impl Crc32c {
    const POLY: u32 = 0x82F6_3B78;

    pub fn new() -> Crc32c {
        let mut table = [0u32; 256];
        for (n, entry) in table.iter_mut().enumerate() {
            let mut c = n as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { Self::POLY ^ (c >> 1) } else { c >> 1 };
            }
            *entry = c;
        }
        Crc32c { table }
    }

    pub fn update(&self, crc: &mut u32, buffer: &[u8]) {
        let mut c = *crc;
        for &byte in buffer {
            c = self.table[((c ^ byte as u32) & 0xFF) as usize] ^ (c >> 8);
        }
        *crc = c;
    }

    pub fn compute(&self, buffer: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFF;
        self.update(&mut crc, buffer);
        crc ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32c {
    fn default() -> Crc32c {
        Crc32c::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        let crc = Crc32c::new();
        // RFC 3720 test vector
        assert_eq!(crc.compute(b"123456789"), 0xE3069283);
        assert_eq!(crc.compute(b""), 0);
        assert_eq!(crc.compute(&[0u8; 32]), 0x8A9136AA);
    }

    #[test]
    fn differs_from_crc32() {
        let crc = Crc32c::new();
        assert_ne!(crc.compute(b"123456789"), crc32fast::hash(b"123456789"));
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);
    }
}
