//! Reproduce engine: regenerate a zeroed sector by re-compressing
//! reference plaintext through an external lzip-compatible compressor.
//!
//! # Flow
//!
//! 1. Locate the single zeroed sector (a run of 8 or more identical bytes)
//!    inside the damaged member.
//! 2. Decode as much of the member as possible without crossing the sector
//!    (`prepare_master`), then match the decoded dictionary tail against
//!    the reference file.  The earliest full suffix match wins; the longest
//!    partial match of at least 512 bytes is the fallback.
//! 3. For each candidate compression level (`-0`..`-9`, then match-length
//!    limits `-m5`..`-m273`) spawn the compressor, feed it the decoded
//!    prefix followed by reference data, and compare its output with the
//!    damaged member byte by byte.  Bytes inside the zeroed sector are
//!    copied in; a mismatch anywhere else fails the level.
//! 4. A final whole-member test confirms the reproduction; the first level
//!    that passes wins and the sector is spliced into a copy of the input.
//!
//! The compressor is a black box: one feeder thread streams data into its
//! stdin while this thread reads its stdout.  Exit status is checked for
//! both.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use memmap2::Mmap;

use crate::decompress::test_member_in_file;
use crate::error::{Error, Result};
use crate::fileio::{copy_data, insert_fixed, seek_write, OutFile};
use crate::header::{Header, Trailer};
use crate::index::{FileIndex, IndexOptions};
use crate::lzma::mtester::{MemberTester, Status};
use crate::lzma::{MAX_MATCH_LEN, MIN_MATCH_LEN_LIMIT};

/// Candidate-level selection for the external compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LzipLevel {
    /// Levels `-0`..`-9`, then match lengths `-m5`..`-m273`.
    Default,
    /// Levels `-0`..`-9` only.
    AllLevels,
    /// One compression level.
    One(u8),
    /// All match-length limits.
    AnyMatchLen,
    /// One match-length limit.
    MatchLen(u32),
}

impl LzipLevel {
    /// Recognized formats: `<digit>`, `a`, `m[<match_length>]`.
    pub fn parse(arg: &str) -> Result<LzipLevel> {
        match arg.as_bytes() {
            [b'a'] => Ok(LzipLevel::AllLevels),
            [d] if d.is_ascii_digit() => Ok(LzipLevel::One(d - b'0')),
            [b'm'] => Ok(LzipLevel::AnyMatchLen),
            [b'm', ..] => {
                let n = crate::num::getnum_in(
                    &arg[1..],
                    MIN_MATCH_LEN_LIMIT as u64,
                    MAX_MATCH_LEN as u64,
                )?;
                Ok(LzipLevel::MatchLen(n as u32))
            }
            _ => Err(Error::env(format!("bad argument in --lzip-level '{}'", arg))),
        }
    }
}

// ── Sector location ───────────────────────────────────────────────────────────

/// Find the single zeroed sector: the only run of >= 8 consecutive
/// identical bytes inside the stream.  Returns `(begin, size, value)`.
pub(crate) fn zeroed_sector_pos(image: &[u8], name: &str) -> Result<(u64, u64, u8)> {
    const MINLEN: usize = 8;
    let msize = image.len();
    let end = msize.saturating_sub(MINLEN);
    let mut found: Option<(usize, usize, u8)> = None;
    let mut i = Header::SIZE;
    while i < end {
        let byte = image[i];
        i += 1;
        if i < msize && image[i] == byte {
            let pos = i - 1;
            i += 1;
            while i < msize && image[i] == byte {
                i += 1;
            }
            if i - pos >= MINLEN {
                if found.is_some() {
                    return Err(Error::data(format!(
                        "{}: Member contains more than one damaged area.",
                        name
                    )));
                }
                found = Some((pos, i - pos, byte));
            }
        }
    }
    match found {
        Some((begin, size, value)) => Ok((begin as u64, size as u64, value)),
        None => Err(Error::data(format!("{}: Can't locate damaged area.", name))),
    }
}

/// Decode up to, but never past, `begin` and return the suspended tester.
fn prepare_master<'a>(
    image: &'a [u8],
    begin: u64,
    dictionary_size: u32,
) -> Result<Option<MemberTester<'a, 'static>>> {
    let mut pos_limit = begin.saturating_sub(16).max(Header::SIZE as u64);
    let mut master = MemberTester::new(image, dictionary_size);
    if master.test_member(pos_limit, u64::MAX, &mut io::sink())? != Status::LimitReached
        || master.member_position() > begin
    {
        return Ok(None);
    }
    // creep forward as far as possible without crossing begin
    while pos_limit < begin
        && master.test_member(pos_limit + 1, u64::MAX, &mut io::sink())? == Status::LimitReached
        && master.member_position() <= begin
    {
        pos_limit += 1;
    }
    let mut master = MemberTester::new(image, dictionary_size);
    if master.test_member(pos_limit, u64::MAX, &mut io::sink())? == Status::LimitReached
        && master.member_position() <= begin
    {
        Ok(Some(master))
    } else {
        Ok(None)
    }
}

// ── Reference matching ────────────────────────────────────────────────────────

/// Locate the decoded dictionary tail inside the reference file.
///
/// The reference must match from the last decoded byte back to the
/// beginning of the file or of the dictionary; the match nearest the
/// beginning of the file is chosen.  As a fallback, the longest partial
/// match of at least 512 bytes is accepted.  Returns the offset of the
/// first undecoded byte.
pub(crate) fn match_reference(
    dec: &[u8],
    prev: Option<&[u8]>,
    rbuf: &[u8],
) -> Option<(u64, bool /* multiple */)> {
    let dec_size = dec.len();
    if dec_size < 4 {
        return None;
    }
    let prev_size = prev.map_or(0, |p| p.len());
    let last_byte = dec[dec_size - 1];
    let mut offset: Option<u64> = None;
    let mut multiple = false;

    // exact pass: match at least 4 bytes back to bof or dictionary start
    let mut i = rbuf.len() as i64 - 1;
    while i >= 3 {
        let iu = i as usize;
        if rbuf[iu] == last_byte {
            let len = (dec_size - 1).min(iu);
            if rbuf[iu - len..iu] == dec[dec_size - 1 - len..dec_size - 1] {
                let len2 = prev_size.min(iu - len);
                let prev_ok = len2 == 0
                    || prev.map_or(false, |p| {
                        rbuf[iu - len - len2..iu - len] == p[prev_size - len2..]
                    });
                if prev_ok {
                    if offset.is_some() {
                        multiple = true;
                    }
                    offset = Some(iu as u64 + 1);
                    i -= (len + len2) as i64;
                }
            }
        }
        i -= 1;
    }
    if let Some(off) = offset {
        return Some((off, multiple));
    }

    // fallback: longest partial match, at least 512 bytes
    let mut maxlen = 0usize;
    let mut i = rbuf.len() as i64 - 1;
    while i >= 0 {
        let iu = i as usize;
        if rbuf[iu] == last_byte {
            let size1 = dec_size.min(iu + 1);
            let mut len = 1;
            while len < size1 && rbuf[iu - len] == dec[dec_size - len - 1] {
                len += 1;
            }
            if len == size1 {
                let size2 = prev_size.min(iu + 1 - size1);
                if let Some(p) = prev {
                    while len < size1 + size2
                        && rbuf[iu - len] == p[prev_size - 1 - (len - dec_size)]
                    {
                        len += 1;
                    }
                }
            }
            if len > maxlen {
                maxlen = len;
                offset = Some(iu as u64 + 1);
                i -= len as i64;
            }
        }
        i -= 1;
    }
    if maxlen >= 512 {
        offset.map(|o| (o, false))
    } else {
        None
    }
}

// ── Level probing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryOutcome {
    Success,
    LevelFailed,
}

fn wait_child(child: &mut Child, name: &str, soft: bool) -> Result<bool> {
    match child.wait() {
        Ok(status) if status.success() => Ok(true),
        Ok(_) if soft => Ok(false),
        Ok(_) => Err(Error::env(format!("{}: Child terminated with error status.", name))),
        Err(e) => Err(Error::env(format!("Error waiting termination of '{}': {}", name, e))),
    }
}

/// Run the compressor once and compare its output with the member.
/// Reproduced bytes are copied into the zeroed sector of `image`.
#[allow(clippy::too_many_arguments)]
fn try_reproduce(
    image: &mut [u8],
    data_size: u64,
    good_dsize: u64,
    begin: u64,
    end: u64,
    rbuf: &[u8],
    offset: u64,
    dictionary_size: u32,
    argv: &[String],
    auto0: bool,
) -> Result<TryOutcome> {
    let msize = image.len() as u64;
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::env(format!("Can't exec '{}': {}", argv[0], e)))?;
    let mut child_in = child.stdin.take().ok_or_else(|| Error::internal("no child stdin"))?;
    let mut child_out = child.stdout.take().ok_or_else(|| Error::internal("no child stdout"))?;

    // the feeder only ever reads member bytes before the sector
    let (head, tail) = image.split_at_mut(begin as usize);
    let head: &[u8] = head;
    let child_ref = &mut child;

    let (mismatch, cut_short, feeder_res) =
        std::thread::scope(|s| -> Result<(bool, bool, Result<()>)> {
            let feeder = s.spawn(move || -> Result<()> {
                let mut t = MemberTester::new(head, dictionary_size);
                let status = t.test_member(u64::MAX, good_dsize, &mut child_in)?;
                if status != Status::LimitReached || t.data_position() != good_dsize {
                    return Err(Error::data("Error decompressing prefix data for compressor."));
                }
                // limit reference data to the remaining decompressed data
                let size = (rbuf.len() as u64 - offset).min(data_size - good_dsize);
                child_in.write_all(&rbuf[offset as usize..(offset + size) as usize])?;
                Ok(()) // dropping child_in closes the pipe
            });

            let xend = (end + 4).min(msize);
            let mut buffer = [0u8; 16384];
            let mut i: u64 = 0;
            let mut mismatch = false;
            let mut saw_eof = false;
            'compare: while i < xend {
                let rd = match child_out.read(&mut buffer) {
                    Ok(0) => {
                        // not enough data to fill the sector at this level
                        saw_eof = true;
                        if i < end {
                            mismatch = true;
                        }
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                let mut j = 0;
                while j < rd && i < begin {
                    // coded dictionary sizes may differ legitimately (byte 5)
                    if head[i as usize] != buffer[j] && i != 5 {
                        mismatch = true;
                        break 'compare;
                    }
                    j += 1;
                    i += 1;
                }
                while j < rd && i < end {
                    // copy reproduced bytes into the zeroed sector
                    tail[(i - begin) as usize] = buffer[j];
                    j += 1;
                    i += 1;
                }
                while j < rd && i < xend {
                    // mismatch past the sector: wrong reference or lzip version
                    if tail[(i - begin) as usize] != buffer[j] {
                        mismatch = true;
                        break 'compare;
                    }
                    j += 1;
                    i += 1;
                }
            }
            drop(child_out);
            let cut_short = !saw_eof;
            if cut_short {
                // stop the compressor so the feeder cannot stay blocked on a
                // full pipe; its exit status is meaningless from here on
                let _ = child_ref.kill();
            }
            let feeder_res = match feeder.join() {
                Ok(r) => r,
                Err(_) => Err(Error::internal("data feeder panicked")),
            };
            Ok((mismatch, cut_short, feeder_res))
        })?;

    if cut_short {
        let _ = child.wait(); // reap; status not meaningful after kill
    } else {
        let child_ok = wait_child(&mut child, &argv[0], auto0)?;
        if !child_ok {
            return Ok(TryOutcome::LevelFailed);
        }
    }
    match feeder_res {
        Ok(()) => {}
        // a feeder cut off mid-write is expected when the child was stopped
        Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => {
            if auto0 {
                return Ok(TryOutcome::LevelFailed);
            }
            return Err(e);
        }
    }
    if mismatch {
        return Ok(TryOutcome::LevelFailed);
    }
    // test the whole member after reproduction
    let mut t = MemberTester::new(image, dictionary_size);
    if t.test()?.is_ok() && t.finished() {
        Ok(TryOutcome::Success)
    } else {
        Ok(TryOutcome::LevelFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReproduceOutcome {
    Success,
    MasterFail,
    Failure,
}

/// Try every candidate level against one member.  On success the zeroed
/// sector inside `image` holds the reproduced bytes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn reproduce_member(
    image: &mut [u8],
    data_size: u64,
    lzip_name: &str,
    rbuf: &[u8],
    reference_name: &str,
    begin: u64,
    size: u64,
    lzip_level: LzipLevel,
    verbose: bool,
) -> Result<ReproduceOutcome> {
    let msize = image.len() as u64;
    let header = Header::from_bytes(image);
    let dictionary_size = header.dictionary_size();

    let (good_dsize, offset, multiple) = {
        let master = match prepare_master(image, begin, dictionary_size)? {
            Some(m) => m,
            None => return Ok(ReproduceOutcome::MasterFail),
        };
        let (dec, prev) = master.dict_parts();
        match match_reference(dec, prev, rbuf) {
            Some((offset, multiple)) => (master.data_position(), offset, multiple),
            None => {
                if verbose {
                    println!("'{}' does not match with decoded data.", reference_name);
                }
                return Ok(ReproduceOutcome::Failure);
            }
        }
    };
    if multiple && verbose {
        println!(
            "warning: {}: Multiple matches. Using match at offset {}",
            reference_name, offset
        );
    }
    // reference data after the match must cover the zeroed sector, minus
    // the trailer when the sector reaches into it
    let t = if begin + size >= msize { 16 + Trailer::SIZE as u64 } else { 0 };
    if rbuf.len() as u64 - offset < size.saturating_sub(t) {
        return Err(Error::data(format!(
            "{}: Not enough reference data after match.",
            reference_name
        )));
    }

    let end = begin + size;
    let dict_arg = format!("-s{}", dictionary_size);
    if matches!(lzip_level, LzipLevel::Default | LzipLevel::AllLevels | LzipLevel::One(_)) {
        for level in 0u8..=9 {
            if let LzipLevel::One(l) = lzip_level {
                if l != level {
                    continue;
                }
            }
            if verbose {
                println!("Trying level -{}", level);
            }
            let level0 = level == 0;
            let auto0 = level0 && lzip_level != LzipLevel::One(0);
            let argv: Vec<String> = if level0 {
                vec![lzip_name.to_string(), "-0".to_string()]
            } else {
                vec![lzip_name.to_string(), format!("-{}", level), dict_arg.clone()]
            };
            match try_reproduce(
                image, data_size, good_dsize, begin, end, rbuf, offset, dictionary_size, &argv,
                auto0,
            )? {
                TryOutcome::Success => return Ok(ReproduceOutcome::Success),
                TryOutcome::LevelFailed => {}
            }
        }
    }
    if matches!(
        lzip_level,
        LzipLevel::Default | LzipLevel::AnyMatchLen | LzipLevel::MatchLen(_)
    ) {
        for len in MIN_MATCH_LEN_LIMIT..=MAX_MATCH_LEN {
            if let LzipLevel::MatchLen(l) = lzip_level {
                if l != len {
                    continue;
                }
            }
            if verbose {
                println!("Trying match length limit {}", len);
            }
            let argv =
                vec![lzip_name.to_string(), format!("-m{}", len), dict_arg.clone()];
            match try_reproduce(
                image, data_size, good_dsize, begin, end, rbuf, offset, dictionary_size, &argv,
                false,
            )? {
                TryOutcome::Success => return Ok(ReproduceOutcome::Success),
                TryOutcome::LevelFailed => {}
            }
        }
    }
    Ok(ReproduceOutcome::Failure)
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// `--reproduce`: replace a zeroed sector using a reference plaintext and
/// an external compressor.
#[allow(clippy::too_many_arguments)]
pub fn reproduce_file(
    input: &Path,
    output: Option<&Path>,
    lzip_name: &str,
    reference: &Path,
    lzip_level: LzipLevel,
    force: bool,
    verbose: bool,
) -> Result<()> {
    let name = input.display().to_string();
    let mut f = File::open(input).map_err(|e| Error::from(e).for_file(&name))?;
    let meta = f.metadata()?;
    let opts = IndexOptions { ignore_bad_dict: true, ..Default::default() };
    let index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;

    let reference_name = reference.display().to_string();
    let rfile = File::open(reference).map_err(|e| Error::from(e).for_file(&reference_name))?;
    // Safety: the reference file is only read; a concurrent writer would at
    // worst make the reproduction fail its final test.
    let rmap = unsafe { Mmap::map(&rfile) }
        .map_err(|e| Error::env(format!("{}: Can't mmap: {}", reference_name, e)))?;

    let out_path: PathBuf =
        output.map_or_else(|| PathBuf::from(insert_fixed(&name)), Path::to_path_buf);
    let mut outfile: Option<OutFile> = None;
    let mut errors = 0;

    for i in 0..index.len() {
        let mpos = index.member(i).mblock.pos();
        let msize = index.member(i).mblock.size();
        let data_size = index.member(i).dblock.size();
        let outcome = test_member_in_file(&mut f, mpos, msize)?;
        if outcome.is_good() {
            continue;
        }
        errors += 1;
        if errors > 1 {
            break; // only one member can be reproduced
        }
        let failure_pos = outcome.failure_pos();
        if failure_pos < Header::SIZE as u64 {
            return Err(Error::data(format!("{}: Unexpected end of file.", name)));
        }
        // copy-on-write private mapping: candidate bytes are mutated without
        // touching the input file
        let mut map = unsafe { memmap2::MmapOptions::new().map_copy(&f) }
            .map_err(|e| Error::env(format!("{}: Can't mmap: {}", name, e)))?;
        let image = &mut map[mpos as usize..(mpos + msize) as usize];

        let (begin, size, value) = zeroed_sector_pos(image, &name)?;
        if failure_pos < begin {
            return Err(Error::data(format!("{}: Data error found before damaged area.", name)));
        }
        if verbose {
            println!(
                "Reproducing bad area in member {} of {}\n  (begin = {}, size = {}, value = 0x{:02X})",
                i + 1,
                index.len(),
                begin,
                size,
                value
            );
        }
        match reproduce_member(
            image,
            data_size,
            lzip_name,
            &rmap,
            &reference_name,
            begin,
            size,
            lzip_level,
            verbose,
        )? {
            ReproduceOutcome::MasterFail => return Err(Error::env("Can't prepare master.")),
            ReproduceOutcome::Failure => {
                return Err(Error::data(format!("{}: Unable to reproduce member.", name)))
            }
            ReproduceOutcome::Success => {
                let out = match outfile.as_mut() {
                    Some(out) => out,
                    None => {
                        let mut out = OutFile::create(&out_path, force)?;
                        f.seek(SeekFrom::Start(0))?;
                        copy_data(&mut f, out.file(), None)?;
                        outfile.insert(out)
                    }
                };
                seek_write(
                    out.file(),
                    &image[begin as usize..(begin + size) as usize],
                    mpos + begin,
                )?;
                if verbose {
                    println!("Member reproduced successfully.");
                }
            }
        }
    }

    match outfile {
        None => {
            if verbose {
                println!("Input file '{}' has no errors. Recovery is not needed.", name);
            }
        }
        Some(out) => {
            out.close(Some(&meta))?;
            if errors > 1 {
                println!("One member reproduced. Copy of input file still contains errors.");
            } else if verbose {
                println!("Repaired copy of '{}' written to '{}'", name, out_path.display());
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
    fn level_grammar() {
        assert_eq!(LzipLevel::parse("a").unwrap(), LzipLevel::AllLevels);
        assert_eq!(LzipLevel::parse("7").unwrap(), LzipLevel::One(7));
        assert_eq!(LzipLevel::parse("m").unwrap(), LzipLevel::AnyMatchLen);
        assert_eq!(LzipLevel::parse("m36").unwrap(), LzipLevel::MatchLen(36));
        assert!(LzipLevel::parse("m4").is_err()); // below MIN_MATCH_LEN_LIMIT
        assert!(LzipLevel::parse("x").is_err());
    }

    #[test]
    fn locates_single_zeroed_sector() {
        let mut image = fake_member(200);
        image[50..90].fill(0);
        let (begin, size, value) = zeroed_sector_pos(&image, "t").unwrap();
        assert_eq!((begin, size, value), (50, 40, 0));
    }

    #[test]
    fn rejects_multiple_damaged_areas() {
        let mut image = fake_member(200);
        image[50..70].fill(0);
        image[120..140].fill(7);
        assert!(zeroed_sector_pos(&image, "t").is_err());
        let image = fake_member(200);
        assert!(zeroed_sector_pos(&image, "t").is_err()); // nothing zeroed
    }

    #[test]
    fn match_reference_prefers_earliest_full_match() {
        let dict = b"abcdefgh";
        // dictionary tail appears twice; earliest offset must win
        let mut rbuf = Vec::new();
        rbuf.extend_from_slice(b"xxabcdefghyy");
        rbuf.extend_from_slice(b"zzabcdefghww");
        let (offset, multiple) = match_reference(dict, None, &rbuf).unwrap();
        assert_eq!(offset, 10); // right after the first occurrence
        assert!(multiple);
    }

    #[test]
    fn match_reference_uses_wrapped_dictionary() {
        // logical data is prev ++ dec
        let prev = b"0123";
        let dec = b"4567";
        let rbuf = b"zz01234567tail";
        let (offset, multiple) = match_reference(dec, Some(prev), rbuf).unwrap();
        assert_eq!(offset, 10);
        assert!(!multiple);
    }

    #[test]
    fn match_reference_needs_four_bytes() {
        assert!(match_reference(b"abc", None, b"abcabcabc").is_none());
    }
}
