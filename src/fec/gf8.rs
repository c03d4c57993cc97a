//! GF(2^8) arithmetic and the Reed-Solomon codec over it.
//!
//! Addition and subtraction are exclusive or.  The encode matrix is a
//! Cauchy matrix whose `(row, col)` entry is `inverse((fbn | 0x80) ^ col)`;
//! the `fbn | 0x80` and `col` ranges are disjoint, which guarantees every
//! square submatrix is invertible.  The matrix is derived, never stored:
//! only the decode submatrix is materialized.

use std::sync::OnceLock;

use crate::error::{Error, Result};

const SIZE: usize = 1 << 8;
const POLY: u32 = 0x11D; // generator polynomial

pub struct Gf8Tables {
    log: [u8; SIZE],
    ilog: [u8; SIZE],
    mul_table: Vec<u8>, // SIZE * SIZE
}

impl Gf8Tables {
    fn new() -> Gf8Tables {
        let mut log = [0u8; SIZE];
        let mut ilog = [0u8; SIZE];
        let mut b: u32 = 1;
        for i in 0..SIZE - 1 {
            log[b as usize] = i as u8;
            ilog[i] = b as u8;
            b <<= 1;
            if b & SIZE as u32 != 0 {
                b ^= POLY;
            }
        }
        log[0] = (SIZE - 1) as u8; // log(0) is undefined; use a sentinel
        ilog[SIZE - 1] = 1;

        let mut mul_table = vec![0u8; SIZE * SIZE];
        for i in 1..SIZE {
            for j in 1..SIZE {
                mul_table[i * SIZE + j] =
                    ilog[(log[i] as usize + log[j] as usize) % (SIZE - 1)];
            }
        }
        Gf8Tables { log, ilog, mul_table }
    }

    #[inline]
    pub fn mul(&self, a: u8, b: u8) -> u8 {
        self.mul_table[a as usize * SIZE + b as usize]
    }

    #[inline]
    pub fn inverse(&self, a: u8) -> u8 {
        self.ilog[SIZE - 1 - self.log[a as usize] as usize]
    }

    #[inline]
    fn mul_row(&self, c: u8) -> &[u8] {
        &self.mul_table[c as usize * SIZE..(c as usize + 1) * SIZE]
    }
}

pub fn gf8() -> &'static Gf8Tables {
    static TABLES: OnceLock<Gf8Tables> = OnceLock::new();
    TABLES.get_or_init(Gf8Tables::new)
}

/// dst[] ^= c * src[]
#[inline]
pub fn mul_add(gf: &Gf8Tables, src: &[u8], dst: &mut [u8], c: u8) {
    if c == 0 {
        return; // nothing to add
    }
    let row = gf.mul_row(c);
    for (d, &s) in dst.iter_mut().zip(src) {
        *d ^= row[s as usize];
    }
}

/// Invert a k x k matrix in place.  Gaussian elimination with a virtual
/// identity matrix; Galois arithmetic is exact and Cauchy submatrices are
/// non-singular, so no row or column swapping is needed.
pub fn invert_matrix(gf: &Gf8Tables, matrix: &mut [u8], k: usize) -> bool {
    for row in 0..k {
        let pivot = matrix[row * k + row];
        if pivot == 0 {
            return false;
        }
        if pivot != 1 {
            // scale the pivot row
            let inv_row = gf.mul_row(gf.inverse(pivot));
            matrix[row * k + row] = 1;
            for col in 0..k {
                matrix[row * k + col] = inv_row[matrix[row * k + col] as usize];
            }
        }
        // subtract the pivot row from the other rows
        for row2 in 0..k {
            if row2 == row {
                continue;
            }
            let c = matrix[row2 * k + row];
            matrix[row2 * k + row] = 0;
            if c == 0 {
                continue;
            }
            let mul_row = gf.mul_row(c);
            for col in 0..k {
                let scaled = mul_row[matrix[row * k + col] as usize];
                matrix[row2 * k + col] ^= scaled;
            }
        }
    }
    true
}

/// Check A * B == I.
fn check_inverse(gf: &Gf8Tables, a: &[u8], b: &[u8], k: usize) -> bool {
    for row in 0..k {
        for col in 0..k {
            let mut sum = 0u8;
            for i in 0..k {
                sum ^= gf.mul(a[row * k + i], b[i * k + col]);
            }
            if sum != (row == col) as u8 {
                return false;
            }
        }
    }
    true
}

/// Build the decode submatrix for the missing blocks and invert it.
fn init_dec_matrix(gf: &Gf8Tables, bb: &[u32], fbn: &[u32]) -> Result<Vec<u8>> {
    let bad_blocks = bb.len();
    let mut dec_matrix = vec![0u8; bad_blocks * bad_blocks];
    for row in 0..bad_blocks {
        let f = fbn[row] | 0x80;
        for col in 0..bad_blocks {
            dec_matrix[row * bad_blocks + col] = gf.inverse((f ^ bb[col]) as u8);
        }
    }
    if !invert_matrix(gf, &mut dec_matrix, bad_blocks) {
        return Err(Error::internal("GF(2^8) matrix not invertible"));
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

/// Compute one parity block for `fbn`.
///
/// `prodata` holds the k data blocks back to back; when the payload does
/// not fill the last block, `lastbuf` is its zero-padded copy.
pub fn rs8_encode(
    prodata: &[u8],
    lastbuf: Option<&[u8]>,
    fec_block: &mut [u8],
    fbs: usize,
    fbn: u32,
    k: usize,
) {
    let gf = gf8();
    let row = fbn | 0x80;
    fec_block.fill(0);
    for col in 0..k {
        let src = data_block(prodata, lastbuf, col, fbs, k);
        mul_add(gf, src, fec_block, gf.inverse((row ^ col as u32) as u8));
    }
}

/// Rebuild the missing data blocks listed in `bb` from the parity blocks
/// in `fecbuf` (one per entry of `fbn`, in that order).  Repaired blocks
/// are written in place in `prodata` / `lastbuf`.
pub fn rs8_decode(
    prodata: &mut [u8],
    mut lastbuf: Option<&mut [u8]>,
    bb: &[u32],
    fbn: &[u32],
    fecbuf: &mut [u8],
    fbs: usize,
    k: usize,
) -> Result<()> {
    let gf = gf8();
    let bad_blocks = bb.len();
    {
        // reduce: subtract the contribution of every present data block
        let last: Option<&[u8]> = lastbuf.as_deref();
        let mut bi = 0;
        for col in 0..k {
            if bi < bad_blocks && col as u32 == bb[bi] {
                bi += 1;
                continue;
            }
            let src = data_block(prodata, last, col, fbs, k);
            for row in 0..bad_blocks {
                let f = fbn[row] | 0x80;
                mul_add(
                    gf,
                    src,
                    &mut fecbuf[row * fbs..(row + 1) * fbs],
                    gf.inverse((f ^ col as u32) as u8),
                );
            }
        }
    }
    // solve
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

/// Field and matrix self-test: `a * 1/a == 1` for every element, and
/// `A * A^-1 == I` for the encode submatrix of size k.
pub fn gf8_check(fbn_vector: &[u32], k: usize) -> bool {
    if k == 0 {
        return true;
    }
    let gf = gf8();
    for a in 1..SIZE as u32 {
        if gf.mul(a as u8, gf.inverse(a as u8)) != 1 {
            return false;
        }
    }
    let random = fbn_vector.len() == k;
    let mut enc_matrix = vec![0u8; k * k];
    for row in 0..k {
        let f = (if random { fbn_vector[row] } else { row as u32 }) | 0x80;
        for col in 0..k {
            enc_matrix[row * k + col] = gf.inverse((f ^ col as u32) as u8);
        }
    }
    let mut dec_matrix = enc_matrix.clone();
    invert_matrix(gf, &mut dec_matrix, k) && check_inverse(gf, &enc_matrix, &dec_matrix, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_laws() {
        let gf = gf8();
        for a in 1..=255u8 {
            assert_eq!(gf.mul(a, gf.inverse(a)), 1, "a = {}", a);
            assert_eq!(gf.mul(a, 1), a);
            assert_eq!(gf.mul(a, 0), 0);
            assert_eq!(gf.mul(0, a), 0);
        }
        // commutativity on a sample
        for a in [3u8, 0x53, 0xCA, 0xFF] {
            for b in [7u8, 0x11, 0x80] {
                assert_eq!(gf.mul(a, b), gf.mul(b, a));
            }
        }
    }

    #[test]
    fn matrix_inversion_round_trip() {
        assert!(gf8_check(&[], 8));
        assert!(gf8_check(&[], 128));
        assert!(gf8_check(&[5, 17, 99, 127], 4));
    }

    #[test]
    fn erasure_round_trip() {
        let fbs = 512;
        let k = 5;
        let mut prodata: Vec<u8> = (0..k * fbs).map(|i| (i * 31 + 7) as u8).collect();
        let original = prodata.clone();

        // three parity blocks
        let mut parity = vec![vec![0u8; fbs]; 3];
        for (fbn, p) in parity.iter_mut().enumerate() {
            rs8_encode(&prodata, None, p, fbs, fbn as u32, k);
        }

        // erase data blocks 1 and 3, repair with parity 0 and 2
        prodata[fbs..2 * fbs].fill(0);
        prodata[3 * fbs..4 * fbs].fill(0);
        let mut fecbuf = Vec::new();
        fecbuf.extend_from_slice(&parity[0]);
        fecbuf.extend_from_slice(&parity[2]);
        rs8_decode(&mut prodata, None, &[1, 3], &[0, 2], &mut fecbuf, fbs, k).unwrap();
        assert_eq!(prodata, original);
    }

    #[test]
    fn erasure_round_trip_with_lastbuf() {
        let fbs = 512;
        let k = 4;
        let payload_len = 3 * fbs + 100; // last block is partial
        let payload: Vec<u8> = (0..payload_len).map(|i| (i * 13 + 5) as u8).collect();
        let mut lastbuf = vec![0u8; fbs];
        lastbuf[..100].copy_from_slice(&payload[3 * fbs..]);

        let mut parity = vec![vec![0u8; fbs]; 2];
        for (fbn, p) in parity.iter_mut().enumerate() {
            rs8_encode(&payload, Some(&lastbuf), p, fbs, fbn as u32, k);
        }

        // erase the last (partial) block
        let mut damaged = payload.clone();
        damaged[3 * fbs..].fill(0);
        let mut last_damaged = vec![0u8; fbs]; // missing: rebuilt from scratch
        let mut fecbuf = parity[1].clone();
        rs8_decode(&mut damaged, Some(&mut last_damaged), &[3], &[1], &mut fecbuf, fbs, k)
            .unwrap();
        assert_eq!(&last_damaged[..100], &payload[3 * fbs..]);
        assert!(last_damaged[100..].iter().all(|&b| b == 0));
    }
}
