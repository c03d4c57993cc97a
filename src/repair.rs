//! Single-byte repair engine.
//!
//! # Strategy
//!
//! For each damaged member, in order, stopping at the first success:
//!
//! 1. *Gross-damage filter* — eight consecutive identical bytes inside the
//!    LZMA stream mean a zeroed sector; a one-byte repair cannot help and
//!    the reproduce engine is the right tool.
//! 2. *Dictionary-size repair* — an invalid or too-small coded dictionary
//!    size is retried with two candidate sizes.
//! 3. *Header-adjacent bytes* — the six bytes right after the header are
//!    tried first.
//! 4. *Dense sweep* — walk backward from the failure position in 100-byte
//!    slabs, bounded by 50 000 bytes.  A master tester is suspended 16
//!    bytes before each slab; each of the 255 possible mutations of each
//!    byte is probed by forking the master and resuming to end of member.
//!
//! A mutation is probed through the decoder's one-byte patch overlay, so
//! the member image itself stays pristine until a repair is confirmed.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::decompress::test_member_in_file;
use crate::error::{Error, Result};
use crate::fileio::{copy_data, insert_fixed, read_member_image, seek_write, OutFile};
use crate::header::{
    is_valid_ds, Header, Trailer, MAX_DICTIONARY_SIZE, MIN_DICTIONARY_SIZE,
};
use crate::index::{FileIndex, IndexOptions};
use crate::lzma::mtester::{MemberTester, Status};

/// Outcome of one repair attempt over a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// The master tester could not reach its suspend point.
    MasterFail,
    NotFound,
    /// Writing `value` at member offset `pos` makes the member test clean.
    Found { pos: u64, value: u8 },
}

/// Eight consecutive identical bytes inside the stream.
pub(crate) fn gross_damage(image: &[u8]) -> bool {
    const MAXLEN: usize = 7; // repeats after the first byte of the run
    let end = image.len().saturating_sub(Trailer::SIZE + MAXLEN);
    let mut i = Header::SIZE;
    while i < end {
        let byte = image[i];
        let mut len = 0;
        i += 1;
        while i < image.len() && image[i] == byte {
            len += 1;
            if len >= MAXLEN {
                return true;
            }
            i += 1;
        }
    }
    false
}

fn run_tester(image: &[u8], dictionary_size: u32) -> Result<(Status, u32)> {
    let mut t = MemberTester::new(image, dictionary_size);
    let status = t.test()?;
    Ok((status, t.max_distance()))
}

/// Try to fix an invalid or too-small coded dictionary size.
/// Returns `Some(Repair::Found { pos: 5, .. })` when a candidate size
/// makes the member decode.
fn repair_dictionary_size(image: &[u8]) -> Result<Option<Repair>> {
    let header = Header::from_bytes(image);
    let dictionary_size = header.dictionary_size();
    let trailer = Trailer::from_bytes(&image[image.len() - Trailer::SIZE..]);
    let data_size = trailer.data_size();
    let valid_ds = is_valid_ds(dictionary_size);
    if valid_ds && dictionary_size as u64 >= data_size {
        return Ok(None); // can't be bad
    }

    const DICTIONARY_SIZE_9: u64 = 1 << 25; // dictionary size of option -9
    if !valid_ds || (dictionary_size as u64) < DICTIONARY_SIZE_9 {
        let candidate =
            data_size.min(DICTIONARY_SIZE_9).max(MIN_DICTIONARY_SIZE as u64) as u32;
        let (status, max_distance) = run_tester(image, candidate)?;
        if status.is_ok() {
            return Ok(Some(found_ds(candidate)));
        }
        if status != Status::DecoderError
            || max_distance <= candidate
            || max_distance > MAX_DICTIONARY_SIZE
        {
            return Ok(None);
        }
    }
    if data_size > DICTIONARY_SIZE_9 {
        let candidate = data_size.min(MAX_DICTIONARY_SIZE as u64) as u32;
        let (status, _) = run_tester(image, candidate)?;
        if status.is_ok() {
            return Ok(Some(found_ds(candidate)));
        }
    }
    Ok(None)
}

fn found_ds(dictionary_size: u32) -> Repair {
    let mut h = Header { data: [0; Header::SIZE] };
    h.set_dictionary_size(dictionary_size);
    Repair::Found { pos: 5, value: h.data[5] }
}

/// Decode up to `pos_limit` and hand back the suspended tester.
fn prepare_master<'a>(
    image: &'a [u8],
    pos_limit: u64,
    dictionary_size: u32,
) -> Result<Option<MemberTester<'a, 'static>>> {
    let mut master = MemberTester::new(image, dictionary_size);
    if master.test_member(pos_limit, u64::MAX, &mut std::io::sink())? == Status::LimitReached {
        Ok(Some(master))
    } else {
        Ok(None)
    }
}

/// Probe every mutation of every position in `[begin, end]`, walking
/// backward from `end` in 100-byte slabs, at most 50 000 positions.
pub(crate) fn repair_member(
    image: &[u8],
    begin: u64,
    end: u64,
    dictionary_size: u32,
) -> Result<Repair> {
    let mut buffer2 = vec![0u8; dictionary_size as usize];
    let mut pos = end;
    while pos >= begin && pos + 50_000 > end {
        let min_pos = begin.max(pos.saturating_sub(100));
        let pos_limit = min_pos.saturating_sub(16);
        let master = match prepare_master(image, pos_limit, dictionary_size)? {
            Some(m) => m,
            None => return Ok(Repair::MasterFail),
        };
        while pos >= min_pos {
            let old = image[pos as usize];
            for j in 1..=255u8 {
                let value = old.wrapping_add(j);
                let mut t = master.fork_into(&mut buffer2);
                t.set_patch(pos as usize, value);
                if t.test()?.is_ok() && t.finished() {
                    return Ok(Repair::Found { pos, value });
                }
            }
            if pos == 0 {
                return Ok(Repair::NotFound);
            }
            pos -= 1;
        }
    }
    Ok(Repair::NotFound)
}

/// Full repair attempt over one member image; applies the heuristic order.
pub(crate) fn repair_image(image: &[u8], failure_pos: u64) -> Result<Repair> {
    if gross_damage(image) {
        return Ok(Repair::NotFound);
    }
    if let Some(r) = repair_dictionary_size(image)? {
        return Ok(r);
    }
    let dictionary_size = Header::from_bytes(image).dictionary_size();
    let r = repair_member(
        image,
        Header::SIZE as u64 + 1,
        Header::SIZE as u64 + 6,
        dictionary_size,
    )?;
    if r != Repair::NotFound {
        return Ok(r);
    }
    repair_member(image, Header::SIZE as u64 + 7, failure_pos, dictionary_size)
}

/// `--byte-repair`: find and fix a single corrupted byte per member.
pub fn byte_repair_file(
    input: &Path,
    output: Option<&Path>,
    force: bool,
    verbose: bool,
) -> Result<()> {
    let name = input.display().to_string();
    let mut f = File::open(input).map_err(|e| Error::from(e).for_file(&name))?;
    let meta = f.metadata()?;
    let opts = IndexOptions { ignore_bad_dict: true, ..Default::default() };
    let index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;

    let out_path: PathBuf =
        output.map_or_else(|| PathBuf::from(insert_fixed(&name)), Path::to_path_buf);
    let mut outfile: Option<OutFile> = None;

    for i in 0..index.len() {
        let mpos = index.member(i).mblock.pos();
        let msize = index.member(i).mblock.size();
        let outcome = test_member_in_file(&mut f, mpos, msize)?;
        if outcome.is_good() {
            continue;
        }
        let mut failure_pos = outcome.failure_pos();
        if failure_pos < Header::SIZE as u64 {
            return Err(Error::data("Can't repair error in input file."));
        }
        if failure_pos >= msize - 8 {
            failure_pos = msize - 8 - 1;
        }
        if verbose {
            println!(
                "Repairing member {} of {}  (failure pos = {})",
                i + 1,
                index.len(),
                mpos + failure_pos
            );
        }
        let image = read_member_image(&mut f, mpos, msize)?;
        match repair_image(&image, failure_pos)? {
            Repair::MasterFail => return Err(Error::env("Can't prepare master.")),
            Repair::NotFound => {
                return Err(Error::data(
                    "Can't repair input file. Error is probably larger than 1 byte.",
                ))
            }
            Repair::Found { pos, value } => {
                let out = match outfile.as_mut() {
                    Some(out) => out,
                    None => {
                        // first damaged member repaired: copy the whole input
                        let mut out = OutFile::create(&out_path, force)?;
                        f.seek(SeekFrom::Start(0))?;
                        copy_data(&mut f, out.file(), None)?;
                        outfile.insert(out)
                    }
                };
                seek_write(out.file(), &[value], mpos + pos)?;
            }
        }
    }

    match outfile {
        None => {
            if verbose {
                println!("Input file has no errors. Recovery is not needed.");
            }
        }
        Some(out) => {
            out.close(Some(&meta))?;
            if verbose {
                println!("Copy of input file repaired successfully.");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_member;

    #[test]
    fn gross_damage_detects_runs() {
        let mut image = fake_member(64);
        assert!(!gross_damage(&image));
        // a run of 8 identical bytes inside the stream
        for b in image.iter_mut().skip(20).take(8) {
            *b = 0x42;
        }
        assert!(gross_damage(&image));
    }

    #[test]
    fn gross_damage_ignores_trailer() {
        let mut image = fake_member(64);
        // identical bytes in the trailer region do not count
        let n = image.len();
        image[n - 8..].fill(0x11);
        assert!(!gross_damage(&image));
    }

    #[test]
    fn repair_gives_up_on_garbage() {
        // no single-byte change makes a filler stream decode; the sweep must
        // terminate with NotFound instead of claiming success
        let image = fake_member(48);
        let r = repair_image(&image, image.len() as u64 - 9).unwrap();
        assert_eq!(r, Repair::NotFound);
    }

    #[test]
    fn found_ds_encodes_position_five() {
        match found_ds(1 << 20) {
            Repair::Found { pos, value } => {
                assert_eq!(pos, 5);
                assert_eq!(value, 20);
            }
            other => panic!("{:?}", other),
        }
    }
}
