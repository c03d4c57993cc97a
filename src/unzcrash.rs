//! Fault-injection harness: flip bits, set bytes, zero blocks, truncate,
//! and check that the decoder never accepts damage silently.
//!
//! Injections run in-process: the member tester returns status codes
//! instead of crashing, so there is no need to contain a child decoder.
//! Where the original compared decompressor output with an external
//! `zcmp`, this harness compares the MD5 of the decoded output against the
//! pristine member; a damaged member that decodes cleanly to different
//! data counts as a false negative.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::block::BadByte;
use crate::decompress::{test_member_image, Md5Sink, MemberTestOutcome};
use crate::error::{Error, Result};
use crate::fileio::read_member_image;
use crate::header::{is_valid_ds, Header, Trailer};
use crate::index::{FileIndex, IndexOptions};
use crate::lzma::mtester::{MemberTester, Status};
use crate::num::format_ds;
use crate::repair::repair_image;

fn harness_options() -> IndexOptions {
    IndexOptions { ignore_trailing: true, loose_trailing: true, ..Default::default() }
}

/// Decode one pristine member and return the MD5 of its output.
fn member_digest(image: &[u8], dictionary_size: u32) -> Result<[u8; 16]> {
    let mut sink = Md5Sink::new();
    let mut t = MemberTester::new(image, dictionary_size);
    let status = t.test_member(u64::MAX, u64::MAX, &mut sink)?;
    if !status.is_ok() || !t.finished() {
        return Err(Error::data("Error verifying input file."));
    }
    Ok(sink.digest())
}

/// Decode a mutated member image and compare its output digest.
fn compare_member(image: &[u8], dictionary_size: u32, patch: (usize, u8), digest: &[u8; 16]) -> bool {
    let mut sink = Md5Sink::new();
    let mut t = MemberTester::new(image, dictionary_size);
    t.set_patch(patch.0, patch.1);
    match t.test_member(u64::MAX, u64::MAX, &mut sink) {
        Ok(s) if s.is_ok() && t.finished() => sink.digest() == *digest,
        _ => false,
    }
}

// ── Bit flips ─────────────────────────────────────────────────────────────────

/// `--unzcrash=1`: flip every bit of every stream byte and re-test.
pub fn unzcrash_bit(path: &Path, verbose: bool) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let index = FileIndex::new(&mut f, harness_options()).map_err(|e| e.for_file(&name))?;

    let mut positions = 0u64;
    let mut decompressions = 0u64;
    let mut successes = 0u64;
    let mut failed_comparisons = 0u64;

    for i in 0..index.len() {
        let mpos = index.member(i).mblock.pos();
        let msize = index.member(i).mblock.size();
        let dictionary_size = index.member(i).dictionary_size;
        let image = read_member_image(&mut f, mpos, msize)?;
        let md5_orig = member_digest(&image, dictionary_size).map_err(|e| e.for_file(&name))?;

        let mut buffer2 = vec![0u8; dictionary_size as usize];
        let mut master = MemberTester::new(&image, dictionary_size);
        let end = msize - Trailer::SIZE as u64;
        if verbose {
            println!("Testing bytes {} to {}", mpos + Header::SIZE as u64 + 1, mpos + end - 1);
        }
        for pos in Header::SIZE as u64 + 1..end {
            let pos_limit = pos.saturating_sub(16);
            if pos_limit > 0
                && master.test_member(pos_limit, u64::MAX, &mut std::io::sink())?
                    != Status::LimitReached
            {
                return Err(Error::env("Can't advance master."));
            }
            positions += 1;
            let byte = image[pos as usize];
            let mut mask = 1u8;
            loop {
                decompressions += 1;
                let value = byte ^ mask;
                let mut t = master.fork_into(&mut buffer2);
                t.set_patch(pos as usize, value);
                let status = t.test()?;
                if status.is_ok() && t.finished() {
                    successes += 1;
                    if verbose {
                        println!(
                            "byte {} 0x{:02X} (0x{:02X}^0x{:02X}) passed the test",
                            mpos + pos,
                            value,
                            byte,
                            mask
                        );
                    }
                    if !compare_member(&image, dictionary_size, (pos as usize, value), &md5_orig)
                    {
                        failed_comparisons += 1;
                        println!("byte {} comparison failed", mpos + pos);
                    }
                }
                if mask == 0x80 {
                    break;
                }
                mask <<= 1;
            }
        }
    }

    print_summary(positions, decompressions, successes, failed_comparisons);
    Ok(())
}

// ── Zeroed blocks ─────────────────────────────────────────────────────────────

/// `--unzcrash=B<size>`: zero a block of `sector_size` bytes at every
/// `delta`-stride position and re-test the members it touches.
pub fn unzcrash_block(path: &Path, sector_size: u64, delta: u64, verbose: bool) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let index = FileIndex::new(&mut f, harness_options()).map_err(|e| e.for_file(&name))?;

    // pristine member images and their output digests
    let mut images: Vec<Vec<u8>> = Vec::with_capacity(index.len());
    let mut digests: Vec<[u8; 16]> = Vec::with_capacity(index.len());
    for m in index.members() {
        let image = read_member_image(&mut f, m.mblock.pos(), m.mblock.size())?;
        digests.push(member_digest(&image, m.dictionary_size).map_err(|e| e.for_file(&name))?);
        images.push(image);
    }

    let cdata_size = index.cdata_size();
    let mut positions = 0u64;
    let mut decompressions = 0u64;
    let mut successes = 0u64;
    let mut failed_comparisons = 0u64;

    let mut pos = 0u64;
    while pos < cdata_size {
        let zend = (pos + sector_size).min(cdata_size);
        positions += 1;
        for (i, m) in index.members().iter().enumerate() {
            let mb = m.mblock;
            if zend <= mb.pos() || pos >= mb.end() {
                continue;
            }
            decompressions += 1;
            let mut image = images[i].clone();
            let from = pos.max(mb.pos()) - mb.pos();
            let to = zend.min(mb.end()) - mb.pos();
            image[from as usize..to as usize].fill(0);
            match test_member_image(&image) {
                MemberTestOutcome::Good => {
                    successes += 1;
                    let mut sink = Md5Sink::new();
                    let mut t = MemberTester::new(&image, m.dictionary_size);
                    let ok = matches!(t.test_member(u64::MAX, u64::MAX, &mut sink),
                                      Ok(s) if s.is_ok());
                    if !ok || sink.digest() != digests[i] {
                        failed_comparisons += 1;
                        println!("block {},{} comparison failed", pos, zend - pos);
                    } else if verbose {
                        println!("block {},{} passed the test", pos, zend - pos);
                    }
                }
                _ => {}
            }
        }
        pos += delta;
    }

    print_summary(positions, decompressions, successes, failed_comparisons);
    Ok(())
}

// ── Truncations ───────────────────────────────────────────────────────────────

/// `--truncate=<delta>`: test the file truncated at every stride.  For
/// each length the decoder must either report an error for the cut member
/// or produce exactly the members that fit.
pub fn unzcrash_truncate(path: &Path, delta: u64, verbose: bool) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let index = FileIndex::new(&mut f, harness_options()).map_err(|e| e.for_file(&name))?;

    // whole members must be intact to begin with
    for m in index.members() {
        let image = read_member_image(&mut f, m.mblock.pos(), m.mblock.size())?;
        if !test_member_image(&image).is_good() {
            return Err(Error::data(format!("{}: Input file is already damaged.", name)));
        }
    }

    let mut lengths = 0u64;
    let mut false_negatives = 0u64;
    let file_size = index.file_size();
    let mut length = 0u64;
    while length < file_size {
        lengths += 1;
        // the member cut by this length, if any
        for m in index.members() {
            let mb = m.mblock;
            if mb.pos() >= length || mb.end() <= length {
                continue;
            }
            let cut = (length - mb.pos()) as usize;
            let image = read_member_image(&mut f, mb.pos(), mb.size())?;
            match test_member_image(&image[..cut]) {
                MemberTestOutcome::Bad { .. } => {}
                _ => {
                    false_negatives += 1;
                    println!("length {}: truncated member decoded cleanly", length);
                }
            }
        }
        length += delta;
    }
    if verbose || false_negatives > 0 {
        println!("{} lengths tested, {} false negatives", lengths, false_negatives);
    }
    if false_negatives > 0 {
        return Err(Error::data("Truncated members decoded cleanly."));
    }
    Ok(())
}

// ── Single byte ───────────────────────────────────────────────────────────────

/// `--set-byte`: inject one literal/delta/flip mutation, re-test, and try
/// the byte-repair engine on the result.
pub fn debug_byte_repair(path: &Path, bad_byte: BadByte, verbose: bool) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let index = FileIndex::new(&mut f, IndexOptions::default()).map_err(|e| e.for_file(&name))?;

    let idx = match index.members().iter().position(|m| m.mblock.includes(bad_byte.pos)) {
        Some(i) => i,
        None => {
            println!("{}: Nothing to do.", name);
            return Ok(());
        }
    };
    let mpos = index.member(idx).mblock.pos();
    let msize = index.member(idx).mblock.size();
    let outcome = crate::decompress::test_member_in_file(&mut f, mpos, msize)?;
    if !outcome.is_good() {
        return Err(Error::data(format!(
            "Member {} of {} already damaged  (failure pos = {})",
            idx + 1,
            index.len(),
            mpos + outcome.failure_pos()
        )));
    }
    let mut image = read_member_image(&mut f, mpos, msize)?;
    let good_value = image[(bad_byte.pos - mpos) as usize];
    let bad_value = bad_byte.apply(good_value);
    image[(bad_byte.pos - mpos) as usize] = bad_value;

    let header = Header::from_bytes(&image);
    let mut failure_pos = 0;
    if bad_byte.pos - mpos != 5 || is_valid_ds(header.dictionary_size()) {
        match test_member_image(&image) {
            MemberTestOutcome::Good => {
                if verbose {
                    println!("Member decompressed with no errors.");
                }
                return Ok(());
            }
            outcome => failure_pos = outcome.failure_pos(),
        }
    }
    if verbose {
        println!(
            "Test repairing member {} of {}  (damage pos = {} (0x{:02X}->0x{:02X}), failure pos = {})",
            idx + 1,
            index.len(),
            bad_byte.pos,
            good_value,
            bad_value,
            mpos + failure_pos
        );
    }
    if failure_pos >= msize {
        failure_pos = msize - 1;
    }
    match repair_image(&image, failure_pos)? {
        crate::repair::Repair::MasterFail => Err(Error::env("Can't prepare master.")),
        crate::repair::Repair::NotFound => {
            Err(Error::internal("can't repair input file"))
        }
        crate::repair::Repair::Found { .. } => {
            if verbose {
                println!("Member repaired successfully.");
            }
            Ok(())
        }
    }
}

// ── Repeated-sequence statistics ──────────────────────────────────────────────

/// `--nrep-stats`: frequency of N-byte repeated sequences inside the LZMA
/// streams, against the 1 / 2^(8N) expectation for random data.
pub fn nrep_stats(paths: &[&Path], repeated_byte: Option<u8>) -> Result<()> {
    let mut len_vector: Vec<u64> = Vec::new();
    let mut lzma_size = 0u64;
    let mut best: Option<(u64, String)> = None;

    for path in paths {
        let name = path.display().to_string();
        let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let index = FileIndex::new(&mut f, harness_options()).map_err(|e| e.for_file(&name))?;
        for m in index.members() {
            let image = read_member_image(&mut f, m.mblock.pos(), m.mblock.size())?;
            // skip the header plus the first stream byte, and the trailer
            let start = Header::SIZE + 1;
            let end = image.len() - Trailer::SIZE;
            lzma_size += (end - start) as u64;
            let mut pos = start;
            while pos < end {
                let byte = image[pos];
                pos += 1;
                if pos < end && image[pos] == byte {
                    let run_start = pos - 1;
                    let mut len = 2;
                    pos += 1;
                    while pos < end && image[pos] == byte {
                        pos += 1;
                        len += 1;
                    }
                    if let Some(rb) = repeated_byte {
                        if rb != byte {
                            continue;
                        }
                    }
                    if len >= len_vector.len() {
                        len_vector.resize(len + 1, 0);
                        best = Some((m.mblock.pos() + run_start as u64, name.clone()));
                    }
                    len_vector[len] += 1;
                }
            }
        }
    }

    match repeated_byte {
        None => println!("\nShowing repeated sequences of any byte value."),
        Some(b) => println!("\nShowing repeated sequences of the byte value 0x{:02X}", b),
    }
    println!("Total size of LZMA data: {} bytes", lzma_size);
    for (len, &count) in len_vector.iter().enumerate().skip(2) {
        if count > 0 {
            let shift = 8 * (len - repeated_byte.is_none() as usize) as u32;
            let expected = 1u128.checked_shl(shift).unwrap_or(u128::MAX);
            println!(
                "len {} found {} times, 1 every {} bytes (expected 1 every {} bytes)",
                len,
                count,
                lzma_size / count,
                expected
            );
        }
    }
    if let Some((pos, name)) = best {
        println!("Longest sequence found at position {} of '{}'", pos, name);
    }
    Ok(())
}

/// Show the decoded LZMA packet structure of every member.
pub fn show_packets(path: &Path, bad_byte: Option<BadByte>, show: bool) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let index = FileIndex::new(&mut f, IndexOptions::default()).map_err(|e| e.for_file(&name))?;

    for i in 0..index.len() {
        let m = *index.member(i);
        if !is_valid_ds(m.dictionary_size) {
            return Err(Error::data(crate::header::BAD_DICT_MSG));
        }
        let mut image = read_member_image(&mut f, m.mblock.pos(), m.mblock.size())?;
        if let Some(bb) = bad_byte {
            if m.mblock.includes(bb.pos) {
                let o = (bb.pos - m.mblock.pos()) as usize;
                image[o] = bb.apply(image[o]);
            }
        }
        println!(
            "Decoding LZMA packets in member {} of {}  (mpos = {}, msize = {})",
            i + 1,
            index.len(),
            m.mblock.pos(),
            m.mblock.size()
        );
        println!("  dict {}", format_ds(m.dictionary_size));
        let stdout = std::io::stdout();
        let mut log = stdout.lock();
        let (status, stats) = crate::lzma::mtester::debug_decode_member(
            &image,
            m.dictionary_size,
            m.dblock.pos(),
            m.mblock.pos(),
            show,
            &mut log,
            &mut std::io::sink(),
        )?;
        log.flush()?;
        println!(
            "Total packets in member   = {}\nMax distance in any match = {} at file position {}\nMax marker size found = {}\nMax packet size found = {}",
            stats.total_packets,
            stats.max_distance,
            stats.max_distance_pos,
            stats.max_marker_size,
            stats.max_packet_size,
        );
        if !status.is_ok() {
            return Err(Error::data(format!(
                "Member {} failed: {:?} at pos {}",
                i + 1,
                status,
                m.mblock.pos()
            )));
        }
    }
    Ok(())
}

fn print_summary(positions: u64, decompressions: u64, successes: u64, failed: u64) {
    println!(
        "\n{:>8} bytes tested\n{:>8} total decompressions\n{:>8} decompressions returned with zero status",
        positions, decompressions, successes
    );
    if successes > 0 {
        if failed > 0 {
            println!(", of which\n{:>8} comparisons failed", failed);
        } else {
            println!("         all comparisons passed");
        }
    }
}
