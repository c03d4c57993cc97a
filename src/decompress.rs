//! Decompress / test / list / range-decompress drivers over the member
//! index, plus the filtering sinks they write through.

use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use md5::{Digest, Md5};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fileio::{read_member_image, OutFile};
use crate::header::{is_valid_ds, Header, BAD_DICT_MSG};
use crate::index::{FileIndex, IndexOptions};
use crate::lzma::mtester::{MemberTester, Status};
use crate::num::format_ds;

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Writer that drops the first `skip` bytes, passes the next `limit` bytes
/// through, and swallows the rest.  Used by range-decompression: the
/// decoder still decodes (and verifies) the whole member, only the window
/// reaches the output.
pub struct RangeSink<W: Write> {
    inner: W,
    skip: u64,
    limit: u64,
}

impl<W: Write> RangeSink<W> {
    pub fn new(inner: W, skip: u64, limit: u64) -> RangeSink<W> {
        RangeSink { inner, skip, limit }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RangeSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();
        let mut buf = buf;
        if self.skip > 0 {
            let n = (self.skip).min(len as u64) as usize;
            self.skip -= n as u64;
            buf = &buf[n..];
        }
        if self.limit > 0 && !buf.is_empty() {
            let n = (self.limit).min(buf.len() as u64) as usize;
            self.inner.write_all(&buf[..n])?;
            self.limit -= n as u64;
        }
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writer that folds everything into an MD5 digest.
#[derive(Default)]
pub struct Md5Sink {
    md5: Md5,
}

impl Md5Sink {
    pub fn new() -> Md5Sink {
        Md5Sink::default()
    }

    pub fn digest(self) -> [u8; 16] {
        self.md5.finalize().into()
    }
}

impl Write for Md5Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.md5.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Member testing ────────────────────────────────────────────────────────────

/// Outcome of replaying a whole member image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberTestOutcome {
    Good,
    /// The member decoded and verified, but ended before the image does;
    /// the trailer that closed the image is fake.
    SizeMismatch { failure_pos: u64 },
    Bad { failure_pos: u64 },
}

impl MemberTestOutcome {
    pub fn is_good(&self) -> bool {
        matches!(self, MemberTestOutcome::Good)
    }

    pub fn failure_pos(&self) -> u64 {
        match *self {
            MemberTestOutcome::Good => 0,
            MemberTestOutcome::SizeMismatch { failure_pos }
            | MemberTestOutcome::Bad { failure_pos } => failure_pos,
        }
    }
}

/// Test one member image, header checks included.
pub fn test_member_image(image: &[u8]) -> MemberTestOutcome {
    if image.len() >= Header::SIZE {
        let header = Header::from_bytes(image);
        let ds = header.dictionary_size();
        if header.check_magic() && header.check_version() && is_valid_ds(ds) {
            let mut t = MemberTester::new(image, ds);
            let status = match t.test() {
                Ok(s) => s,
                Err(_) => Status::UnexpectedEof, // sink is io::sink(); unreachable
            };
            let mpos = t.member_position();
            return match status {
                Status::Ok if mpos == image.len() as u64 => MemberTestOutcome::Good,
                Status::Ok => MemberTestOutcome::SizeMismatch { failure_pos: mpos },
                _ => MemberTestOutcome::Bad { failure_pos: mpos },
            };
        }
    }
    MemberTestOutcome::Bad { failure_pos: Header::SIZE.min(image.len()) as u64 }
}

/// Read the member at `[mpos, mpos + msize)` and test it.
pub fn test_member_in_file<R: Read + Seek>(
    f: &mut R,
    mpos: u64,
    msize: u64,
) -> Result<MemberTestOutcome> {
    let image = read_member_image(f, mpos, msize)?;
    Ok(test_member_image(&image))
}

// ── Whole-file operations ─────────────────────────────────────────────────────

fn status_message(status: Status, pos: u64) -> String {
    match status {
        Status::DecoderError => format!("Decoder error at pos {}", pos),
        Status::UnexpectedEof => format!("File ends unexpectedly at pos {}", pos),
        Status::TrailerMismatch => format!("Trailer mismatch at pos {}", pos),
        Status::UnknownMarker => format!("Unknown marker found at pos {}", pos),
        Status::Ok | Status::LimitReached => String::new(),
    }
}

/// Decode every member of `f` into `out`.  With `range`, only the bytes of
/// the uncompressed stream falling in the range are written; trailers are
/// verified regardless because partial output does not license corrupt
/// input.
pub fn decompress<R: Read + Seek>(
    f: &mut R,
    index: &FileIndex,
    out: &mut dyn Write,
    range: Option<Block>,
    ignore_errors: bool,
) -> Result<u64> {
    let mut written = 0u64;
    for (i, m) in index.members().iter().enumerate() {
        let db = m.dblock;
        let (skip, limit) = match range {
            Some(r) => {
                if !r.overlaps(&db) {
                    continue;
                }
                let skip = r.pos().saturating_sub(db.pos());
                let end = db.size().min(r.end() - db.pos());
                (skip, end - skip)
            }
            None => (0, u64::MAX),
        };
        if !is_valid_ds(m.dictionary_size) {
            return Err(Error::data(BAD_DICT_MSG));
        }
        let image = read_member_image(f, m.mblock.pos(), m.mblock.size())?;
        let mut sink = RangeSink::new(&mut *out, skip, limit);
        let mut t = MemberTester::new(&image, m.dictionary_size);
        let status = t.test_member(u64::MAX, u64::MAX, &mut sink)?;
        if !status.is_ok() || !t.finished() {
            let msg = format!(
                "Member {}: {}",
                i + 1,
                status_message(status, m.mblock.pos() + t.member_position())
            );
            if !ignore_errors {
                return Err(Error::data(msg));
            }
            eprintln!("warning: {}", msg);
        }
        written += limit.min(db.size().saturating_sub(skip));
    }
    Ok(written)
}

/// `--test`: verify every member of every file without writing.
pub fn test_files(paths: &[&Path], opts: IndexOptions, verbose: bool) -> Result<()> {
    let mut failed = None;
    for path in paths {
        let name = path.display().to_string();
        let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let result = FileIndex::new(&mut f, opts)
            .and_then(|index| decompress(&mut f, &index, &mut io::sink(), None, false));
        match result {
            Ok(_) => {
                if verbose {
                    println!("{}: ok", name);
                }
            }
            Err(e) => {
                let e = e.for_file(&name);
                eprintln!("{}", e);
                if failed.is_none() {
                    failed = Some(e);
                }
            }
        }
    }
    match failed {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// `--decompress` and `--range-decompress`.
pub fn decompress_file(
    path: &Path,
    output: Option<&Path>,
    range: Option<Block>,
    opts: IndexOptions,
    ignore_errors: bool,
    force: bool,
) -> Result<()> {
    let name = path.display().to_string();
    let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
    let meta = f.metadata()?;
    let index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;

    let range = match range {
        Some(mut r) => {
            if r.end() > index.udata_size() {
                r.set_size(index.udata_size().saturating_sub(r.pos()));
            }
            if r.size() == 0 {
                return Err(Error::env(format!("{}: Nothing to do.", name)));
            }
            Some(r)
        }
        None => None,
    };

    match output {
        Some(out_path) => {
            let mut out = OutFile::create(out_path, force)?;
            let mut writer = io::BufWriter::new(out.file());
            decompress(&mut f, &index, &mut writer, range, ignore_errors)
                .map_err(|e| e.for_file(&name))?;
            writer.flush()?;
            drop(writer);
            out.close(Some(&meta))?;
        }
        None => {
            let stdout = io::stdout();
            let mut writer = io::BufWriter::new(stdout.lock());
            decompress(&mut f, &index, &mut writer, range, ignore_errors)
                .map_err(|e| e.for_file(&name))?;
            writer.flush()?;
        }
    }
    Ok(())
}

/// `--list`: print sizes and member counts.
pub fn list_files(paths: &[&Path], opts: IndexOptions) -> Result<()> {
    let mut failed = None;
    println!("   dict   members  trailing    uncompressed      compressed  name");
    for path in paths {
        let name = path.display().to_string();
        let result = File::open(path).map_err(Error::from).and_then(|mut f| {
            let index = FileIndex::new(&mut f, opts)?;
            let trailing = index.file_size() - index.cdata_size();
            // a fabricated member over a gap has no authoritative data size
            let approximate = index.members().iter().any(|m| m.dictionary_size == 0);
            println!(
                "{:>7} {:>9} {:>9} {:>15}{} {:>15}  {}",
                format_ds(index.dictionary_size_max()),
                index.len(),
                trailing,
                index.udata_size(),
                if approximate { "?" } else { " " },
                index.cdata_size(),
                name
            );
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

/// `--md5sum`: print the MD5 digest of each input file.
pub fn md5sum_files(paths: &[&Path]) -> Result<()> {
    for path in paths {
        let name = path.display().to_string();
        let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let mut md5 = Md5::new();
        let mut buffer = vec![0u8; 65536];
        loop {
            match f.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => md5.update(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e).for_file(&name)),
            }
        }
        let digest: [u8; 16] = md5.finalize().into();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{}  {}", hex, name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_member;

    #[test]
    fn range_sink_window() {
        let mut inner = Vec::new();
        {
            let mut sink = RangeSink::new(&mut inner, 5, 10);
            sink.write_all(&[0u8; 3]).unwrap(); // all skipped
            sink.write_all(&(0u8..12).collect::<Vec<u8>>()).unwrap(); // skip 2, pass 10
            sink.write_all(&[9u8; 4]).unwrap(); // beyond the window
        }
        assert_eq!(inner, (2u8..12).collect::<Vec<u8>>());
    }

    #[test]
    fn range_sink_split_writes() {
        let mut inner = Vec::new();
        {
            let mut sink = RangeSink::new(&mut inner, 4, 4);
            for b in 0u8..12 {
                sink.write_all(&[b]).unwrap();
            }
        }
        assert_eq!(inner, vec![4, 5, 6, 7]);
    }

    #[test]
    fn md5_sink_matches_known_vector() {
        let mut sink = Md5Sink::new();
        sink.write_all(b"abc").unwrap();
        let hex: String = sink.digest().iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn bad_member_image_reports_failure() {
        let image = fake_member(64);
        match test_member_image(&image) {
            MemberTestOutcome::Bad { failure_pos } => {
                assert!(failure_pos >= Header::SIZE as u64);
                assert!(failure_pos <= image.len() as u64);
            }
            other => panic!("fake stream decoded: {:?}", other),
        }
        // not even a header
        assert!(!test_member_image(&[0x4C, 0x5A]).is_good());
    }
}
