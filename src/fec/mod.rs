//! FEC coordinator: block-size computation, parallel parity creation, and
//! the test / repair / list flows pairing a payload with its `.fec` file.
//!
//! # Parallel encoder
//!
//! Parity generation is embarrassingly parallel but the packets must land
//! in the output in strict fbn order.  A pool of W workers shares a ticket
//! counter: worker `i` computes fbn `i, i+W, i+2W, ...`; after producing a
//! packet it waits on its own condition variable until `deliver_id == i`,
//! writes the packet, advances `deliver_id` modulo W, and signals the next
//! worker.  In-order delivery without a separate writer thread.

pub mod crc32c;
pub mod gf16;
pub mod gf8;
pub mod packet;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::fileio::{insert_fixed, OutFile};
use self::crc32c::Crc32c;
use self::packet::{
    ceil_divide, chksum, fec_packet, is_valid_fbs, set_lastbuf, CodedFbs, FecIndex, MAX_K16,
    MAX_K8, MAX_NK16, MIN_FBS,
};

pub const FEC_EXTENSION: &str = ".fec";

/// How the number of fec blocks is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecCount {
    /// Thousandths of a percent of the payload size (10% == 10000).
    Percent(u64),
    Blocks(u64),
    Bytes(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct FecCreateParams {
    pub count: FecCount,
    /// Unit block size; 0 selects one automatically.
    pub cl_block_size: u64,
    pub num_workers: usize,
    /// 0..=9; smaller levels give larger blocks and less protection.
    pub fec_level: u8,
    pub gf16: bool,
    pub random: bool,
}

impl Default for FecCreateParams {
    fn default() -> FecCreateParams {
        FecCreateParams {
            count: FecCount::Percent(8000),
            cl_block_size: 0,
            num_workers: 1,
            fec_level: 9,
            gf16: false,
            random: false,
        }
    }
}

// ── Block geometry ────────────────────────────────────────────────────────────

/// Smallest power of two in [512, 65536] with `4 * U^2 >= prodata_size`.
fn compute_unit_fbs(prodata_size: u64) -> u64 {
    let mut bs = MIN_FBS;
    while bs < 65536 && 4 * bs * bs < prodata_size {
        bs <<= 1;
    }
    bs
}

/// Block size in units needed to cover `size` with `blocks` blocks.
fn divide_fbs(size: u64, blocks: u64, unit_fbs: u64) -> u64 {
    let fbs = ceil_divide(size, blocks).clamp(MIN_FBS, packet::MAX_FBS);
    ceil_divide(fbs, unit_fbs)
}

/// Join a linear and an exponential component into the final block size.
pub fn compute_fbs(prodata_size: u64, cl_block_size: u64, fec_level: u8) -> Result<CodedFbs> {
    let unit_fbs = if is_valid_fbs(cl_block_size) {
        cl_block_size
    } else {
        compute_unit_fbs(prodata_size)
    };
    let max_k = if fec_level == 0 { MAX_K8 } else { MAX_K16 } as u64;
    let k9 = ceil_divide(prodata_size, unit_fbs).min(max_k).max(1);
    let fbsu9 = divide_fbs(prodata_size, k9, unit_fbs);
    let fbsu0 = divide_fbs(prodata_size, MAX_K8 as u64, unit_fbs);
    let a = ((10 - fec_level as u64) * fbsu9).min(fbsu0); // linear
    let b = fbsu0 >> fec_level; // exponential
    let fbsu = a.max(b);
    CodedFbs::new(fbsu * unit_fbs, unit_fbs)
}

/// Number of fec blocks for the user's mode, capped at the number of data
/// blocks and at the field limit.
pub fn compute_fec_blocks(
    prodata_size: u64,
    count: FecCount,
    fec_level: u8,
    coded_fbs: CodedFbs,
) -> u32 {
    let fbs = coded_fbs.value();
    let prodata_blocks = ceil_divide(prodata_size, fbs);
    let max_k = if fec_level == 0 { MAX_K8 } else { MAX_K16 } as u64;
    if !is_valid_fbs(fbs) || prodata_blocks > max_k {
        return 0;
    }
    let max_nk = if fec_level == 0 { MAX_K8 } else { MAX_NK16 } as u64;
    let mut fec_blocks = match count {
        FecCount::Blocks(n) => max_nk.min(n),
        FecCount::Percent(pct) => {
            let pct = pct.clamp(1, 100_000);
            let fec_bytes = ceil_divide(prodata_size.saturating_mul(pct), 100_000);
            ceil_divide(fec_bytes, fbs).min(max_nk)
        }
        FecCount::Bytes(n) => {
            let fec_bytes = n.min(prodata_size);
            ceil_divide(fec_bytes, fbs).min(max_nk)
        }
    };
    if fec_blocks > prodata_blocks {
        fec_blocks = prodata_blocks;
    }
    fec_blocks as u32
}

/// Unique random fbn values in `[0, max_k)`.
fn random_fbn_vector(fec_blocks: u32, gf16_flag: bool) -> Vec<u32> {
    let max_k = if gf16_flag { MAX_K16 } else { MAX_K8 };
    let mut rng = SmallRng::from_entropy();
    let mut v: Vec<u32> = Vec::with_capacity(fec_blocks as usize);
    while v.len() < fec_blocks as usize {
        let fbn = rng.gen_range(0..max_k);
        if !v.contains(&fbn) {
            v.push(fbn);
        }
    }
    v
}

/// Field and matrix self-test entry point.
pub fn gf_check(k: usize, cl_gf16: bool, random: bool) -> bool {
    let gf16_flag = cl_gf16 || k > MAX_K8 as usize;
    let fbn_vector = if random { random_fbn_vector(k as u32, gf16_flag) } else { Vec::new() };
    if gf16_flag {
        gf16::gf16_check(&fbn_vector, k)
    } else {
        gf8::gf8_check(&fbn_vector, k)
    }
}

// ── Parallel create ───────────────────────────────────────────────────────────

struct DeliverState {
    deliver_id: usize,
    out_size: u64,
    failed: bool,
}

#[allow(clippy::too_many_arguments)]
fn write_fec_mt(
    out: &File,
    prodata: &[u8],
    lastbuf: Option<&[u8]>,
    fec_blocks: u32,
    k: usize,
    num_workers: usize,
    coded_fbs: CodedFbs,
    gf16_flag: bool,
) -> Result<u64> {
    let shared = Mutex::new(DeliverState { deliver_id: 0, out_size: 0, failed: false });
    let may_deliver: Vec<Condvar> = (0..num_workers).map(|_| Condvar::new()).collect();

    std::thread::scope(|s| {
        for id in 0..num_workers {
            let shared = &shared;
            let may_deliver = &may_deliver;
            let mut w = out;
            s.spawn(move || {
                let mut fbn = id as u32;
                while fbn < fec_blocks {
                    let image = fec_packet::build(prodata, lastbuf, fbn, k, coded_fbs, gf16_flag);
                    let mut g = shared.lock();
                    while g.deliver_id != id && !g.failed {
                        may_deliver[id].wait(&mut g);
                    }
                    if g.failed {
                        return;
                    }
                    if w.write_all(&image).is_err() {
                        g.failed = true;
                        for cv in may_deliver {
                            cv.notify_one();
                        }
                        return;
                    }
                    g.out_size += image.len() as u64;
                    g.deliver_id = (g.deliver_id + 1) % num_workers;
                    may_deliver[g.deliver_id].notify_one();
                    drop(g);
                    fbn += num_workers as u32;
                }
            });
        }
    });

    let state = shared.into_inner();
    if state.failed {
        return Err(Error::env("Write error in fec worker."));
    }
    Ok(state.out_size)
}

/// Write the complete fec stream for `prodata`: a CRC32 chksum packet, the
/// fec packets in fbn order, and (when they fit the size rule) a CRC32-C
/// chksum packet.  The total is always a multiple of 4 bytes.
pub fn write_fec(
    out: &mut dyn Write,
    out_file: Option<&File>,
    input_name: &str,
    prodata: &[u8],
    params: &FecCreateParams,
    verbose: bool,
) -> Result<u64> {
    let prodata_size = prodata.len() as u64;
    let coded_fbs = compute_fbs(prodata_size, params.cl_block_size, params.fec_level)?;
    let fec_blocks =
        compute_fec_blocks(prodata_size, params.count, params.fec_level, coded_fbs);
    if fec_blocks == 0 {
        return Err(Error::data(format!(
            "{}: Input file is too large for fec protection.",
            input_name
        )));
    }
    let num_workers = params.num_workers.clamp(1, fec_blocks as usize);
    let fbs = coded_fbs.value();
    let prodata_blocks = ceil_divide(prodata_size, fbs) as usize;
    let md5: [u8; 16] = Md5::digest(prodata).into();
    let gf16_flag =
        params.gf16 || prodata_blocks > MAX_K8 as usize || fec_blocks > MAX_K8;

    let chksum_image = chksum::build(prodata, &md5, coded_fbs, gf16_flag, false)?;
    out.write_all(&chksum_image)?;
    let chksum_size = chksum_image.len() as u64;
    let mut fecdata_size = chksum_size;

    let lastbuf = set_lastbuf(prodata, fbs);
    if params.random {
        for fbn in random_fbn_vector(fec_blocks, gf16_flag) {
            let image = fec_packet::build(
                prodata,
                lastbuf.as_deref(),
                fbn,
                prodata_blocks,
                coded_fbs,
                gf16_flag,
            );
            out.write_all(&image)?;
            fecdata_size += image.len() as u64;
        }
    } else if num_workers > 1 {
        let file = out_file
            .ok_or_else(|| Error::internal("parallel fec creation needs a file output"))?;
        fecdata_size += write_fec_mt(
            file,
            prodata,
            lastbuf.as_deref(),
            fec_blocks,
            prodata_blocks,
            num_workers,
            coded_fbs,
            gf16_flag,
        )?;
    } else {
        for fbn in 0..fec_blocks {
            let image = fec_packet::build(
                prodata,
                lastbuf.as_deref(),
                fbn,
                prodata_blocks,
                coded_fbs,
                gf16_flag,
            );
            out.write_all(&image)?;
            fecdata_size += image.len() as u64;
        }
    }

    if (fecdata_size + chksum_size) / 2 <= fec_blocks as u64 * fbs && fec_blocks > 1 {
        // the CRC32-C array fits the size rule: write the second chksum packet
        let image = chksum::build(prodata, &md5, coded_fbs, gf16_flag, true)?;
        out.write_all(&image)?;
        fecdata_size += image.len() as u64;
    }
    if fecdata_size % 4 != 0 {
        return Err(Error::internal("fecdata_size % 4 != 0"));
    }
    if verbose {
        eprintln!(
            "  {}: {} fec bytes, {} blocks of {} bytes",
            input_name,
            fec_blocks as u64 * fbs,
            fec_blocks,
            fbs
        );
    }
    Ok(fecdata_size)
}

/// `--fec=create`: write `<input>.fec` (or `output`).
pub fn fec_create(
    input: &Path,
    output: Option<&Path>,
    params: &FecCreateParams,
    force: bool,
    verbose: bool,
) -> Result<()> {
    let name = input.display().to_string();
    if name.ends_with(FEC_EXTENSION) {
        return Err(Error::env(format!(
            "{}: Input file already has '{}' suffix, ignored.",
            name, FEC_EXTENSION
        )));
    }
    let f = File::open(input).map_err(|e| Error::from(e).for_file(&name))?;
    if f.metadata()?.len() == 0 {
        return Err(Error::data(format!("{}: Input file is empty.", name)));
    }
    // Safety: the payload is only read; concurrent modification would at
    // worst produce fec data for the newer content.
    let prodata = unsafe { Mmap::map(&f) }
        .map_err(|e| Error::env(format!("{}: Can't mmap: {}", name, e)))?;

    let out_path: PathBuf = output
        .map_or_else(|| PathBuf::from(format!("{}{}", name, FEC_EXTENSION)), Path::to_path_buf);
    let mut out = OutFile::create(&out_path, force)?;
    let file = out.file();
    let file_ref = file.try_clone()?;
    write_fec(file, Some(&file_ref), &name, &prodata, params, verbose)?;
    out.close(None)?;
    Ok(())
}

// ── Test / repair ─────────────────────────────────────────────────────────────

fn zeroed_data_block(chunk: &[u8]) -> bool {
    const MINLEN: usize = 8;
    let mut count = 0;
    for j in 1..chunk.len() {
        if chunk[j] != chunk[j - 1] {
            count = 0;
        } else {
            count += 1;
            if count >= MINLEN - 1 {
                return true;
            }
        }
    }
    false
}

/// Indices of payload blocks failing their CRC array entries, or, for lzip
/// payloads without arrays, blocks containing a run of identical bytes.
pub fn find_bad_blocks(index: &FecIndex, prodata: &[u8], is_lz: bool) -> Vec<u32> {
    let crc32c = Crc32c::new();
    let blocks = index.prodata_blocks();
    let mut bb = Vec::new();
    for i in 0..blocks {
        let pos = index.block_pos(i) as usize;
        let size = index.block_size(i) as usize;
        let chunk = &prodata[pos..pos + size];
        let bad = if index.has_array() {
            let crc_bad = index.crc(i).map_or(false, |c| c != crc32fast::hash(chunk));
            let crcc_bad = index.crcc(i).map_or(false, |c| c != crc32c.compute(chunk));
            crc_bad || crcc_bad
        } else if is_lz {
            zeroed_data_block(chunk)
        } else {
            false
        };
        if bad {
            bb.push(i as u32);
        }
    }
    bb
}

/// Rebuild the bad blocks in place.  Returns false (with a diagnostic)
/// when the damage exceeds the available parity or the final MD5 check
/// fails.
pub fn repair_prodata(index: &FecIndex, bb: &[u32], prodata: &mut [u8]) -> Result<bool> {
    if bb.is_empty() {
        return Ok(true); // nothing to repair
    }
    let fec_blocks = index.fec_blocks();
    if bb.len() > fec_blocks {
        eprintln!(
            "Too many damaged blocks ({}).\n  Can't repair file if it contains more than {} damaged blocks.",
            bb.len(),
            fec_blocks
        );
        return Ok(false);
    }
    let fbs = index.fec_block_size() as usize;
    let mut fbn_vector: Vec<u32> = Vec::with_capacity(bb.len());
    let mut fecbuf = vec![0u8; bb.len() * fbs];
    for bi in 0..bb.len() {
        fbn_vector.push(index.fbn(bi));
        fecbuf[bi * fbs..(bi + 1) * fbs].copy_from_slice(index.fec_block(bi));
    }
    let prodata_blocks = index.prodata_blocks();
    let last_is_missing = *bb.last().expect("bb not empty") as u64 == prodata_blocks - 1;
    let mut lastbuf = if prodata.len() as u64 % fbs as u64 != 0 {
        if last_is_missing {
            Some(vec![0u8; fbs]) // rebuilt from scratch
        } else {
            set_lastbuf(prodata, fbs as u64)
        }
    } else {
        None
    };

    if index.gf16() {
        gf16::rs16_decode(
            prodata,
            lastbuf.as_deref_mut(),
            bb,
            &fbn_vector,
            &mut fecbuf,
            fbs,
            prodata_blocks as usize,
        )?;
    } else {
        gf8::rs8_decode(
            prodata,
            lastbuf.as_deref_mut(),
            bb,
            &fbn_vector,
            &mut fecbuf,
            fbs,
            prodata_blocks as usize,
        )?;
    }
    if let (Some(last), true) = (lastbuf.as_ref(), last_is_missing) {
        // copy the repaired last block back to its (shorter) place
        let di = prodata_blocks - 1;
        let pos = index.block_pos(di) as usize;
        let size = index.block_size(di) as usize;
        prodata[pos..pos + size].copy_from_slice(&last[..size]);
    }
    let md5: [u8; 16] = Md5::digest(&prodata).into();
    if &md5 == index.prodata_md5() {
        Ok(true)
    } else {
        eprintln!("Repair of input file failed.");
        Ok(false)
    }
}

fn read_fec_file(input: &Path, fec_file: Option<&Path>) -> Result<(PathBuf, Vec<u8>)> {
    let fec_path: PathBuf = fec_file.map_or_else(
        || PathBuf::from(format!("{}{}", input.display(), FEC_EXTENSION)),
        Path::to_path_buf,
    );
    let fecdata = std::fs::read(&fec_path)
        .map_err(|e| Error::from(e).for_file(&fec_path.display().to_string()))?;
    Ok((fec_path, fecdata))
}

fn has_lz_extension(name: &str) -> bool {
    name.ends_with(".lz") || name.ends_with(".tlz")
}

/// Load the payload for testing/repair: a copy-on-write mapping when the
/// file is at least as large as the protected data, a zero-padded buffer
/// otherwise.
enum Payload {
    Mapped(memmap2::MmapMut),
    Buffer(Vec<u8>),
}

impl Payload {
    fn load(input: &Path, name: &str, prodata_size: u64) -> Result<(Payload, bool)> {
        let f = File::open(input).map_err(|e| Error::from(e).for_file(name))?;
        let file_size = f.metadata()?.len();
        let same_size = file_size == prodata_size;
        if prodata_size <= file_size && prodata_size > 0 {
            let map = unsafe { memmap2::MmapOptions::new().map_copy(&f) }
                .map_err(|e| Error::env(format!("{}: Can't mmap: {}", name, e)))?;
            Ok((Payload::Mapped(map), same_size))
        } else {
            let mut buf = std::fs::read(input).map_err(|e| Error::from(e).for_file(name))?;
            buf.resize(prodata_size as usize, 0);
            Ok((Payload::Buffer(buf), same_size))
        }
    }

    fn data(&mut self, prodata_size: u64) -> &mut [u8] {
        match self {
            Payload::Mapped(m) => &mut m[..prodata_size as usize],
            Payload::Buffer(b) => &mut b[..prodata_size as usize],
        }
    }
}

/// `--fec=test` and `--fec=repair`.
#[allow(clippy::too_many_arguments)]
pub fn fec_test_file(
    input: &Path,
    fec_file: Option<&Path>,
    output: Option<&Path>,
    repair: bool,
    force: bool,
    ignore_errors: bool,
    verbose: bool,
) -> Result<()> {
    let name = input.display().to_string();
    if name.ends_with(FEC_EXTENSION) {
        return Err(Error::env(format!(
            "{}: Input file has '{}' suffix, ignored.",
            name, FEC_EXTENSION
        )));
    }
    let (fec_path, fecdata) = read_fec_file(input, fec_file)?;
    let index = FecIndex::parse(&fecdata, ignore_errors)
        .map_err(|e| e.for_file(&fec_path.display().to_string()))?;

    let prodata_size = index.prodata_size();
    let (mut payload, same_size) = Payload::load(input, &name, prodata_size)?;
    let prodata = payload.data(prodata_size);
    let is_lz = has_lz_extension(&name);

    let md5: [u8; 16] = Md5::digest(&prodata).into();
    let bb = find_bad_blocks(&index, prodata, is_lz);
    if verbose {
        index.show(&name, &fec_path.display().to_string());
    }
    let md5_match = &md5 == index.prodata_md5();
    let mismatch = !same_size || !md5_match || !bb.is_empty();
    if !mismatch {
        if verbose {
            if repair {
                println!("Protected data checked successfully. Repair not needed.");
            } else {
                println!("Protected data checked successfully.");
            }
        }
        return Ok(());
    }
    if !bb.is_empty() && verbose {
        println!("Block mismatches: {}", bb.len());
    }
    if !repair {
        return Err(Error::data(format!(
            "{}: MD5 mismatch between protected data and fec data.",
            name
        )));
    }

    if !is_lz && !index.has_array() {
        return Err(Error::data(format!(
            "{}: Can't repair. No valid CRC arrays found and protected file not in lzip format.",
            name
        )));
    }
    if verbose {
        eprintln!("Repairing file '{}'", name);
        if !index.has_array() {
            eprintln!("warning: Repairing without CRC arrays.");
        }
    }
    if !repair_prodata(&index, &bb, prodata)? {
        return Err(Error::data(format!("{}: Repair failed.", name)));
    }

    let out_path: PathBuf =
        output.map_or_else(|| PathBuf::from(insert_fixed(&name)), Path::to_path_buf);
    let mut out = OutFile::create(&out_path, force)?;
    out.file().write_all(prodata)?;
    out.close(None)?;
    if verbose {
        eprintln!("Repaired copy of '{}' written to '{}'", name, out_path.display());
    }
    Ok(())
}

/// `--fec=list`: print the packet summary of each fec file.
pub fn fec_list(paths: &[&Path], ignore_errors: bool) -> Result<()> {
    let mut failed = None;
    for path in paths {
        let name = path.display().to_string();
        let result = std::fs::read(path)
            .map_err(Error::from)
            .and_then(|fecdata| {
                let index = FecIndex::parse(&fecdata, ignore_errors)?;
                index.show("", &name);
                Ok(())
            });
        if let Err(e) = result {
            let e = e.for_file(&name);
            eprintln!("{}", e);
            if failed.is_none() {
                failed = Some(e);
            }
        }
    }
    match failed {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_valid_over_a_size_sweep() {
        for &size in
            &[1u64, 511, 512, 513, 100_000, 1_000_000, 10_000_000, 1 << 30, (1 << 35) + 17]
        {
            for level in [0u8, 1, 5, 9] {
                let coded = compute_fbs(size, 0, level).unwrap();
                let fbs = coded.value();
                assert!(is_valid_fbs(fbs), "size {} level {} -> fbs {}", size, level, fbs);
                let max_k = if level == 0 { MAX_K8 } else { MAX_K16 } as u64;
                assert!(
                    ceil_divide(size, fbs) <= max_k,
                    "size {} level {} -> {} blocks",
                    size,
                    level,
                    ceil_divide(size, fbs)
                );
            }
        }
    }

    #[test]
    fn fec_block_count_modes() {
        let coded = compute_fbs(1_000_000, 0, 9).unwrap();
        let fbs = coded.value();
        let blocks = ceil_divide(1_000_000, fbs);

        let n = compute_fec_blocks(1_000_000, FecCount::Blocks(4), 9, coded);
        assert_eq!(n as u64, 4.min(blocks));
        // 10% overhead
        let n = compute_fec_blocks(1_000_000, FecCount::Percent(10_000), 9, coded);
        assert_eq!(n as u64, ceil_divide(100_000, fbs).min(blocks));
        let n = compute_fec_blocks(1_000_000, FecCount::Bytes(50_000), 9, coded);
        assert_eq!(n as u64, ceil_divide(50_000, fbs).min(blocks));
        // never more fec blocks than data blocks
        let n = compute_fec_blocks(1_000_000, FecCount::Blocks(1 << 20), 9, coded);
        assert!(n as u64 <= blocks);
    }

    #[test]
    fn random_fbns_are_unique_and_bounded() {
        let v = random_fbn_vector(64, false);
        assert_eq!(v.len(), 64);
        assert!(v.iter().all(|&f| f < MAX_K8));
        let mut sorted = v.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 64);
    }

    #[test]
    fn gf_self_checks() {
        assert!(gf_check(16, false, false));
        assert!(gf_check(16, false, true));
        assert!(gf_check(8, true, false));
    }

    #[test]
    fn create_and_repair_in_memory() {
        // payload, fec stream, two zeroed sectors, repair, md5 compare
        let mut state = 0x2545F491_4F6CDD1Du64;
        let mut payload: Vec<u8> = Vec::with_capacity(200_000);
        for _ in 0..200_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            payload.push(state as u8);
        }
        let params = FecCreateParams {
            count: FecCount::Percent(10_000),
            ..FecCreateParams::default()
        };
        let mut fecdata = Vec::new();
        write_fec(&mut fecdata, None, "payload", &payload, &params, false).unwrap();

        let index = FecIndex::parse(&fecdata, false).unwrap();
        assert_eq!(index.prodata_size(), 200_000);
        assert!(index.fec_blocks() >= 1);

        let mut damaged = payload.clone();
        let fbs = index.fec_block_size() as usize;
        damaged[0..fbs].fill(0);
        let tail = index.block_pos(index.prodata_blocks() - 1) as usize;
        damaged[tail..].fill(0);

        let bb = find_bad_blocks(&index, &damaged, false);
        assert!(bb.contains(&0));
        assert!(bb.contains(&((index.prodata_blocks() - 1) as u32)));
        assert!(bb.len() <= index.fec_blocks(), "not enough parity for the test");

        assert!(repair_prodata(&index, &bb, &mut damaged).unwrap());
        assert_eq!(damaged, payload);
    }

    #[test]
    fn repair_refuses_excess_damage() {
        let payload = vec![0xABu8; 65536];
        let params = FecCreateParams { count: FecCount::Blocks(2), ..Default::default() };
        let mut fecdata = Vec::new();
        write_fec(&mut fecdata, None, "payload", &payload, &params, false).unwrap();
        let index = FecIndex::parse(&fecdata, false).unwrap();
        assert!(index.fec_blocks() >= 2);

        let mut damaged = payload.clone();
        let fbs = index.fec_block_size() as usize;
        let blocks = index.prodata_blocks() as usize;
        assert!(blocks > index.fec_blocks());
        // damage one more block than there is parity
        for i in 0..index.fec_blocks() + 1 {
            let not_all_equal = (i * fbs) + 1;
            damaged[not_all_equal] ^= 0x55;
        }
        let bb = find_bad_blocks(&index, &damaged, false);
        assert_eq!(bb.len(), index.fec_blocks() + 1);
        assert!(!repair_prodata(&index, &bb, &mut damaged).unwrap());
    }
}
