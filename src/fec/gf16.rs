//! GF(2^16) arithmetic and the Reed-Solomon codec over it.
//!
//! Same construction as GF(2^8) with the top bit 0x8000 and up to 32768
//! data blocks.  A full multiplication table is out of the question, so
//! three 64 Ki "split" tables (low x low, low x high, high x high) provide
//! `dst ^= c * src` through two 256-entry lane tables extracted per
//! constant and applied to each 16-bit little-endian word.

use std::sync::OnceLock;

use crate::error::{Error, Result};

const SIZE: usize = 1 << 16;
const POLY: u32 = 0x1100B; // generator polynomial

pub struct Gf16Tables {
    log: Box<[u16]>,        // SIZE
    ilog: Box<[u16]>,       // SIZE
    mul_tables: Box<[u16]>, // 3 * 256 * 256: LL, LH, HH
}

impl Gf16Tables {
    fn new() -> Gf16Tables {
        let mut log = vec![0u16; SIZE];
        let mut ilog = vec![0u16; SIZE];
        let mut b: u32 = 1;
        for i in 0..SIZE - 1 {
            log[b as usize] = i as u16;
            ilog[i] = b as u16;
            b <<= 1;
            if b & SIZE as u32 != 0 {
                b ^= POLY;
            }
        }
        log[0] = (SIZE - 1) as u16; // log(0) is undefined; use a sentinel
        ilog[SIZE - 1] = 1;

        let raw_mul = |a: u16, b: u16| -> u16 {
            if a == 0 || b == 0 {
                return 0;
            }
            let sum = log[a as usize] as usize + log[b as usize] as usize;
            if sum >= SIZE - 1 { ilog[sum - (SIZE - 1)] } else { ilog[sum] }
        };
        let mut mul_tables = vec![0u16; 3 * 256 * 256];
        for a in 0..256usize {
            for b in 0..256usize {
                mul_tables[a * 256 + b] = raw_mul(a as u16, b as u16);
                mul_tables[65536 + a * 256 + b] = raw_mul(a as u16, (b as u16) << 8);
                mul_tables[131072 + a * 256 + b] = raw_mul((a as u16) << 8, (b as u16) << 8);
            }
        }
        Gf16Tables {
            log: log.into_boxed_slice(),
            ilog: ilog.into_boxed_slice(),
            mul_tables: mul_tables.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        let sum = self.log[a as usize] as usize + self.log[b as usize] as usize;
        if sum >= SIZE - 1 {
            self.ilog[sum - (SIZE - 1)]
        } else {
            self.ilog[sum]
        }
    }

    #[inline]
    pub fn inverse(&self, a: u16) -> u16 {
        self.ilog[SIZE - 1 - self.log[a as usize] as usize]
    }
}

pub fn gf16() -> &'static Gf16Tables {
    static TABLES: OnceLock<Gf16Tables> = OnceLock::new();
    TABLES.get_or_init(Gf16Tables::new)
}

/// dst[] ^= c * src[], the buffers being arrays of 16-bit LE values.
pub fn mul_add(gf: &Gf16Tables, src: &[u8], dst: &mut [u8], c: u16) {
    if c == 0 {
        return; // nothing to add
    }
    let cl = (c & 0xFF) as usize;
    let ch = (c >> 8) as usize;
    // extract the two lane tables for this constant:
    // l[i] = c * i, h[i] = c * (i << 8)
    let ll = &gf.mul_tables[cl * 256..cl * 256 + 256];
    let lh = &gf.mul_tables[65536 + cl * 256..65536 + cl * 256 + 256];
    let hh = &gf.mul_tables[131072 + ch * 256..131072 + ch * 256 + 256];
    let mut l = [0u16; 256];
    let mut h = [0u16; 256];
    for i in 0..256 {
        l[i] = ll[i] ^ gf.mul_tables[65536 + i * 256 + ch];
        h[i] = lh[i] ^ hh[i];
    }
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let r = l[s[0] as usize] ^ h[s[1] as usize];
        d[0] ^= r as u8;
        d[1] ^= (r >> 8) as u8;
    }
}

/// Invert a k x k matrix in place; see `gf8::invert_matrix`.
pub fn invert_matrix(gf: &Gf16Tables, matrix: &mut [u16], k: usize) -> bool {
    for row in 0..k {
        let mut pivot = matrix[row * k + row];
        if pivot == 0 {
            return false;
        }
        if pivot != 1 {
            pivot = gf.inverse(pivot);
            matrix[row * k + row] = 1;
            for col in 0..k {
                matrix[row * k + col] = gf.mul(matrix[row * k + col], pivot);
            }
        }
        for row2 in 0..k {
            if row2 == row {
                continue;
            }
            let c = matrix[row2 * k + row];
            matrix[row2 * k + row] = 0;
            if c == 0 {
                continue;
            }
            for col in 0..k {
                let scaled = gf.mul(matrix[row * k + col], c);
                matrix[row2 * k + col] ^= scaled;
            }
        }
    }
    true
}

fn check_element(gf: &Gf16Tables, a: &[u16], b: &[u16], k: usize, row: usize, col: usize) -> bool {
    let mut sum = 0u16;
    for i in 0..k {
        sum ^= gf.mul(a[row * k + i], b[i * k + col]);
    }
    sum == (row == col) as u16
}

/// Check A * B == I; only the diagonals for matrices larger than 1024.
fn check_inverse(gf: &Gf16Tables, a: &[u16], b: &[u16], k: usize) -> bool {
    for row in 0..k {
        if k <= 1024 {
            for col in 0..k {
                if !check_element(gf, a, b, k, row, col) {
                    return false;
                }
            }
        } else if !check_element(gf, a, b, k, row, row)
            || !check_element(gf, a, b, k, row, k - 1 - row)
        {
            return false;
        }
    }
    true
}

fn init_dec_matrix(gf: &Gf16Tables, bb: &[u32], fbn: &[u32]) -> Result<Vec<u16>> {
    let bad_blocks = bb.len();
    let mut dec_matrix = vec![0u16; bad_blocks * bad_blocks];
    for row in 0..bad_blocks {
        let f = fbn[row] | 0x8000;
        for col in 0..bad_blocks {
            dec_matrix[row * bad_blocks + col] = gf.inverse((f ^ bb[col]) as u16);
        }
    }
    if !invert_matrix(gf, &mut dec_matrix, bad_blocks) {
        return Err(Error::internal("GF(2^16) matrix not invertible"));
    }
    Ok(dec_matrix)
}

#[inline]
fn data_block<'a>(
    prodata: &'a [u8],
    lastbuf: Option<&'a [u8]>,
    col: usize,
    fbs: usize,
    k: usize,
) -> &'a [u8] {
    match lastbuf {
        Some(last) if col == k - 1 => last,
        _ => &prodata[col * fbs..(col + 1) * fbs],
    }
}

/// Compute one parity block for `fbn`; see `gf8::rs8_encode`.
pub fn rs16_encode(
    prodata: &[u8],
    lastbuf: Option<&[u8]>,
    fec_block: &mut [u8],
    fbs: usize,
    fbn: u32,
    k: usize,
) {
    let gf = gf16();
    let row = fbn | 0x8000;
    fec_block.fill(0);
    for col in 0..k {
        let src = data_block(prodata, lastbuf, col, fbs, k);
        mul_add(gf, src, fec_block, gf.inverse((row ^ col as u32) as u16));
    }
}

/// Rebuild missing data blocks; see `gf8::rs8_decode`.
pub fn rs16_decode(
    prodata: &mut [u8],
    mut lastbuf: Option<&mut [u8]>,
    bb: &[u32],
    fbn: &[u32],
    fecbuf: &mut [u8],
    fbs: usize,
    k: usize,
) -> Result<()> {
    let gf = gf16();
    let bad_blocks = bb.len();
    {
        let last: Option<&[u8]> = lastbuf.as_deref();
        let mut bi = 0;
        for col in 0..k {
            if bi < bad_blocks && col as u32 == bb[bi] {
                bi += 1;
                continue;
            }
            let src = data_block(prodata, last, col, fbs, k);
            for row in 0..bad_blocks {
                let f = fbn[row] | 0x8000;
                mul_add(
                    gf,
                    src,
                    &mut fecbuf[row * fbs..(row + 1) * fbs],
                    gf.inverse((f ^ col as u32) as u16),
                );
            }
        }
    }
    let dec_matrix = init_dec_matrix(gf, bb, fbn)?;
    for (col, &di) in bb.iter().enumerate() {
        let di = di as usize;
        let dst: &mut [u8] = match lastbuf.as_deref_mut() {
            Some(last) if di == k - 1 => last,
            _ => &mut prodata[di * fbs..(di + 1) * fbs],
        };
        dst.fill(0);
        for row in 0..bad_blocks {
            mul_add(
                gf,
                &fecbuf[row * fbs..(row + 1) * fbs],
                dst,
                dec_matrix[col * bad_blocks + row],
            );
        }
    }
    Ok(())
}

/// Field and matrix self-test, as `gf8::gf8_check`.
pub fn gf16_check(fbn_vector: &[u32], k: usize) -> bool {
    if k == 0 {
        return true;
    }
    let gf = gf16();
    for a in 1..SIZE as u32 {
        if gf.mul(a as u16, gf.inverse(a as u16)) != 1 {
            return false;
        }
    }
    let random = fbn_vector.len() == k;
    let mut enc_matrix = vec![0u16; k * k];
    for row in 0..k {
        let f = (if random { fbn_vector[row] } else { row as u32 }) | 0x8000;
        for col in 0..k {
            enc_matrix[row * k + col] = gf.inverse((f ^ col as u32) as u16);
        }
    }
    let mut dec_matrix = enc_matrix.clone();
    invert_matrix(gf, &mut dec_matrix, k) && check_inverse(gf, &enc_matrix, &dec_matrix, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_laws_sampled() {
        let gf = gf16();
        for a in [1u16, 2, 255, 256, 0x1234, 0x8000, 0xFFFF] {
            assert_eq!(gf.mul(a, gf.inverse(a)), 1, "a = {}", a);
            assert_eq!(gf.mul(a, 1), a);
            assert_eq!(gf.mul(a, 0), 0);
        }
        assert_eq!(gf.mul(0x1234, 0x5678), gf.mul(0x5678, 0x1234));
    }

    #[test]
    fn split_table_mul_add_matches_direct_mul() {
        let gf = gf16();
        let src: Vec<u8> = (0..1024).map(|i| (i * 89 + 3) as u8).collect();
        for c in [1u16, 0x00FF, 0x0100, 0xABCD, 0x8001] {
            let mut dst = vec![0u8; 1024];
            mul_add(gf, &src, &mut dst, c);
            for (i, pair) in src.chunks_exact(2).enumerate() {
                let s = u16::from_le_bytes([pair[0], pair[1]]);
                let expected = gf.mul(s, c);
                let got = u16::from_le_bytes([dst[2 * i], dst[2 * i + 1]]);
                assert_eq!(got, expected, "c = {:#x}, word {}", c, i);
            }
        }
    }

    #[test]
    fn matrix_inversion_round_trip() {
        assert!(gf16_check(&[], 16));
        assert!(gf16_check(&[1000, 2000, 30000], 3));
    }

    #[test]
    fn erasure_round_trip() {
        let fbs = 512;
        let k = 6;
        let mut prodata: Vec<u8> = (0..k * fbs).map(|i| (i * 17 + 11) as u8).collect();
        let original = prodata.clone();

        let mut parity = vec![vec![0u8; fbs]; 3];
        for (fbn, p) in parity.iter_mut().enumerate() {
            rs16_encode(&prodata, None, p, fbs, fbn as u32, k);
        }
        prodata[0..fbs].fill(0);
        prodata[5 * fbs..6 * fbs].fill(0);
        let mut fecbuf = Vec::new();
        fecbuf.extend_from_slice(&parity[1]);
        fecbuf.extend_from_slice(&parity[2]);
        rs16_decode(&mut prodata, None, &[0, 5], &[1, 2], &mut fecbuf, fbs, k).unwrap();
        assert_eq!(prodata, original);
    }
}
