//! Member index — locate the compressed members inside a possibly damaged
//! multimember file.
//!
//! # How it works
//!
//! A forward parse is impossible on a truncated or gapped file because
//! members only carry their size in the trailer.  The scan therefore walks
//! *backward*: the cursor starts at EOF (or a supplied upper bound), reads
//! the 20 bytes ending there as a candidate trailer, checks it for internal
//! consistency, and verifies the header at the implied member start.  On
//! failure a sliding window is searched from its end toward its beginning
//! for the most significant byte of a plausible member size (`skip_gap`).
//!
//! Garbage between members is represented by gaps between the member
//! blocks; `blocks()` counts members plus gaps (plus trailing data on
//! request) so selector indices line up with what the user sees.

use std::io::{self, Read, Seek, SeekFrom};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::header::{
    is_valid_ds, Header, Trailer, BAD_DICT_MSG, BAD_MAGIC_MSG, CORRUPT_MM_MSG, MIN_MEMBER_SIZE,
    TRAILING_MSG,
};

/// One indexed member: its position in the uncompressed data space, its
/// position in the file, and its coded dictionary size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub dblock: Block,
    pub mblock: Block,
    pub dictionary_size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    pub ignore_trailing: bool,
    pub loose_trailing: bool,
    pub ignore_bad_dict: bool,
    /// Also ignores format errors and a truncated last member.
    pub ignore_gaps: bool,
    /// Upper scan bound; 0 means scan from EOF.
    pub max_pos: u64,
}

#[derive(Debug, Clone)]
pub struct FileIndex {
    members: Vec<Member>,
    insize: u64,
    dictionary_size_max: u32,
}

/// Read exactly `buf.len()` bytes at `pos` unless EOF cuts the read short.
/// Returns the number of bytes read.
pub fn seek_read<R: Read + Seek>(f: &mut R, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    f.seek(SeekFrom::Start(pos))?;
    let mut sz = 0;
    while sz < buf.len() {
        match f.read(&mut buf[sz..]) {
            Ok(0) => break,
            Ok(n) => sz += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(sz)
}

impl FileIndex {
    pub fn new<R: Read + Seek>(f: &mut R, opts: IndexOptions) -> Result<FileIndex> {
        let insize = f.seek(SeekFrom::End(0))?;
        if insize < MIN_MEMBER_SIZE {
            return Err(Error::data("Input file is too short."));
        }
        if insize > i64::MAX as u64 {
            return Err(Error::data("Input file is too long (2^63 bytes or more)."));
        }

        let mut hbuf = [0u8; Header::SIZE];
        if seek_read(f, &mut hbuf, 0)? != Header::SIZE {
            return Err(Error::env("Error reading member header"));
        }
        let header = Header::from_bytes(&hbuf);
        if !header.check_magic() {
            return Err(Error::data(BAD_MAGIC_MSG));
        }
        if !header.check_version() {
            return Err(Error::data(format!(
                "Version {} member format not supported.",
                header.version()
            )));
        }
        if !opts.ignore_bad_dict && !is_valid_ds(header.dictionary_size()) {
            return Err(Error::data(BAD_DICT_MSG));
        }

        let mut members: Vec<Member> = Vec::new();
        // pos always points to a header or to EOF / max_pos
        let mut pos = if opts.max_pos > 0 { opts.max_pos } else { insize };
        while pos >= MIN_MEMBER_SIZE {
            let mut tbuf = [0u8; Trailer::SIZE];
            if seek_read(f, &mut tbuf, pos - Trailer::SIZE as u64)? != Trailer::SIZE {
                return Err(Error::env("Error reading member trailer"));
            }
            let trailer = Trailer::from_bytes(&tbuf);
            let member_size = trailer.member_size();
            if member_size > pos || !trailer.is_consistent() {
                if opts.ignore_gaps || members.is_empty() {
                    skip_gap(f, &mut pos, &opts, &mut members)?;
                    continue;
                }
                return Err(Error::data(format!(
                    "Bad trailer at pos {}",
                    pos - Trailer::SIZE as u64
                )));
            }
            if seek_read(f, &mut hbuf, pos - member_size)? != Header::SIZE {
                return Err(Error::env("Error reading member header"));
            }
            let header = Header::from_bytes(&hbuf);
            let dictionary_size = header.dictionary_size();
            if !header.check_magic()
                || !header.check_version()
                || (!opts.ignore_bad_dict && !is_valid_ds(dictionary_size))
            {
                if opts.ignore_gaps || members.is_empty() {
                    skip_gap(f, &mut pos, &opts, &mut members)?;
                    continue;
                }
                return Err(Error::data(format!("Bad header at pos {}", pos - member_size)));
            }
            pos -= member_size;
            members.push(Member {
                dblock: Block::new(0, trailer.data_size()),
                mblock: Block::new(pos, member_size),
                dictionary_size,
            });
        }

        if pos >= MIN_MEMBER_SIZE || (pos != 0 && !opts.ignore_gaps) || members.is_empty() {
            return Err(Error::data("Can't create file index."));
        }
        FileIndex::finish(members, insize)
    }

    /// Index built from N redundant copies of the same file.  At each step
    /// of the backward walk the trailer may come from any copy and the
    /// header from any (possibly different) copy.
    pub fn multi<R: Read + Seek>(files: &mut [R], fsize: u64) -> Result<FileIndex> {
        let insize = fsize;
        if insize < MIN_MEMBER_SIZE {
            return Err(Error::data("Input file is too short."));
        }
        if insize > i64::MAX as u64 {
            return Err(Error::data("Input file is too long (2^63 bytes or more)."));
        }

        let mut hbuf = [0u8; Header::SIZE];
        let mut good = false;
        for f in files.iter_mut() {
            if seek_read(f, &mut hbuf, 0)? != Header::SIZE {
                return Err(Error::env("Error reading member header"));
            }
            let header = Header::from_bytes(&hbuf);
            if header.check_magic() && header.check_version() {
                good = true;
                break;
            }
        }
        if !good {
            return Err(Error::data(BAD_MAGIC_MSG));
        }

        let mut members: Vec<Member> = Vec::new();
        let mut pos = insize; // always points to a header or to EOF
        'walk: while pos >= MIN_MEMBER_SIZE {
            let mut accepted: Option<(u64, u64)> = None; // (member_size, data_size)
            'trailers: for it in 0..files.len() {
                let mut tbuf = [0u8; Trailer::SIZE];
                if seek_read(&mut files[it], &mut tbuf, pos - Trailer::SIZE as u64)?
                    != Trailer::SIZE
                {
                    return Err(Error::env("Error reading member trailer"));
                }
                let trailer = Trailer::from_bytes(&tbuf);
                let member_size = trailer.member_size();
                if member_size > pos || !trailer.is_consistent() {
                    continue;
                }
                for ih in 0..files.len() {
                    if seek_read(&mut files[ih], &mut hbuf, pos - member_size)? != Header::SIZE {
                        return Err(Error::env("Error reading member header"));
                    }
                    let header = Header::from_bytes(&hbuf);
                    if header.check_magic() && header.check_version() {
                        accepted = Some((member_size, trailer.data_size()));
                        break 'trailers;
                    }
                }
            }
            let (member_size, data_size) = match accepted {
                Some(t) => t,
                None => {
                    if members.is_empty() {
                        pos -= 1; // maybe trailing data
                        continue 'walk;
                    }
                    return Err(Error::data(format!(
                        "Member size in trailer may be corrupt at pos {}",
                        pos - 8
                    )));
                }
            };
            if members.is_empty() && insize > pos {
                // a header prefix right after the last member means the last
                // member is truncated, not trailing data
                let size = (Header::SIZE as u64).min(insize - pos) as usize;
                for f in files.iter_mut() {
                    let mut buf = [0u8; Header::SIZE];
                    if seek_read(f, &mut buf[..size], pos)? == size
                        && Header::from_bytes(&buf).check_prefix(size)
                    {
                        return Err(Error::data(
                            "Last member in input file is truncated or corrupt.",
                        ));
                    }
                }
            }
            pos -= member_size;
            members.push(Member {
                dblock: Block::new(0, data_size),
                mblock: Block::new(pos, member_size),
                dictionary_size: 0,
            });
        }
        if pos != 0 || members.is_empty() {
            return Err(Error::data("Can't create file index."));
        }
        FileIndex::finish(members, insize)
    }

    fn finish(mut members: Vec<Member>, insize: u64) -> Result<FileIndex> {
        members.reverse();
        for i in 0..members.len() {
            let end = members[i].dblock.end();
            if end > i64::MAX as u64 {
                return Err(Error::data("Data in input file is too long (2^63 bytes or more)."));
            }
            if i + 1 < members.len() {
                members[i + 1].dblock.set_pos(end);
            }
        }
        for i in 1..members.len() {
            if members[i].mblock.overlaps(&members[i - 1].mblock) {
                return Err(Error::internal("two member blocks overlap after indexing"));
            }
        }
        let dictionary_size_max = members.iter().map(|m| m.dictionary_size).max().unwrap_or(0);
        Ok(FileIndex { members, insize, dictionary_size_max })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, i: usize) -> &Member {
        &self.members[i]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Total uncompressed size.
    pub fn udata_size(&self) -> u64 {
        self.members.last().map_or(0, |m| m.dblock.end())
    }

    /// End of the last member in the file.
    pub fn cdata_size(&self) -> u64 {
        self.members.last().map_or(0, |m| m.mblock.end())
    }

    /// Total file size including trailing data (if any).
    pub fn file_size(&self) -> u64 {
        self.insize
    }

    /// Largest dictionary size in the file.
    pub fn dictionary_size_max(&self) -> u32 {
        self.dictionary_size_max
    }

    /// Members + gaps (+ trailing data if `count_tdata`).
    pub fn blocks(&self, count_tdata: bool) -> u64 {
        let mut n =
            self.members.len() as u64 + (count_tdata && self.cdata_size() < self.insize) as u64;
        if !self.members.is_empty() && self.members[0].mblock.pos() > 0 {
            n += 1;
        }
        for i in 1..self.members.len() {
            if self.members[i].mblock.pos() > self.members[i - 1].mblock.end() {
                n += 1;
            }
        }
        n
    }
}

impl PartialEq for FileIndex {
    fn eq(&self, other: &FileIndex) -> bool {
        self.insize == other.insize
            && self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(&other.members)
                .all(|(a, b)| a.mblock == b.mblock)
    }
}

// ── Gap skip ──────────────────────────────────────────────────────────────────

/// Skip backward over the gap or trailing data ending at `pos`.  On success
/// the member preceding the gap has been pushed and `pos` points at its
/// header.
fn skip_gap<R: Read + Seek>(
    f: &mut R,
    pos: &mut u64,
    opts: &IndexOptions,
    members: &mut Vec<Member>,
) -> Result<()> {
    const BLOCK_SIZE: usize = 16384;
    const BUFFER_SIZE: usize = BLOCK_SIZE + Trailer::SIZE - 1 + Header::SIZE;

    if *pos < MIN_MEMBER_SIZE {
        if opts.ignore_gaps && !members.is_empty() {
            *pos = 0;
            return Ok(());
        }
        return Err(Error::data(format!(
            "Bad trailer at pos {}",
            pos.saturating_sub(Trailer::SIZE as u64)
        )));
    }
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut bsize = (*pos % BLOCK_SIZE as u64) as usize; // total bytes in buffer
    if bsize <= BUFFER_SIZE - BLOCK_SIZE {
        bsize += BLOCK_SIZE;
    }
    let mut search_size = bsize; // bytes to search for trailer
    let mut rd_size = bsize; // bytes to read from file
    let mut ipos = *pos - rd_size as u64; // aligned to BLOCK_SIZE

    loop {
        if seek_read(f, &mut buffer[..rd_size], ipos)? != rd_size {
            return Err(Error::env("Error seeking member trailer"));
        }
        let max_msb = ((ipos + search_size as u64) >> 56) as u8;
        let mut i = search_size;
        while i >= Trailer::SIZE {
            // candidate most-significant byte of member_size
            if buffer[i - 1] > max_msb {
                i -= 1;
                continue;
            }
            let trailer = Trailer::from_bytes(&buffer[i - Trailer::SIZE..i]);
            let member_size = trailer.member_size();
            if member_size == 0 {
                // skip runs of trailing zeros
                while i > Trailer::SIZE && buffer[i - 9] == 0 {
                    i -= 1;
                }
                i -= 1;
                continue;
            }
            if member_size > ipos + i as u64 || !trailer.is_consistent() {
                i -= 1;
                continue;
            }
            let mut hbuf = [0u8; Header::SIZE];
            if seek_read(f, &mut hbuf, ipos + i as u64 - member_size)? != Header::SIZE {
                return Err(Error::env("Error reading member header"));
            }
            let header = Header::from_bytes(&hbuf);
            let dictionary_size = header.dictionary_size();
            if !header.check_magic()
                || !header.check_version()
                || (!opts.ignore_bad_dict && !is_valid_ds(dictionary_size))
            {
                i -= 1;
                continue;
            }
            if members.is_empty() {
                // the bytes after this trailer: trailing data or a
                // truncated member?
                let avail = (bsize - i).min(Header::SIZE);
                let mut lh = [0u8; Header::SIZE];
                lh[..avail].copy_from_slice(&buffer[i..i + avail]);
                let last_header = Header { data: lh };
                if last_header.check_prefix(bsize - i) {
                    if !opts.ignore_gaps {
                        return Err(Error::data(
                            "Last member in input file is truncated or corrupt.",
                        ));
                    }
                    let ds = if bsize - i >= Header::SIZE {
                        last_header.dictionary_size()
                    } else {
                        0
                    };
                    let trunc_size = *pos - (ipos + i as u64);
                    *pos = ipos + i as u64;
                    members.push(Member {
                        dblock: Block::new(0, 0),
                        mblock: Block::new(*pos, trunc_size),
                        dictionary_size: ds,
                    });
                    return Ok(());
                }
                if !opts.ignore_gaps {
                    if !opts.loose_trailing
                        && bsize - i >= Header::SIZE
                        && last_header.check_corrupt()
                    {
                        return Err(Error::data(CORRUPT_MM_MSG));
                    }
                    if !opts.ignore_trailing {
                        return Err(Error::data(TRAILING_MSG));
                    }
                }
            }
            *pos = ipos + i as u64 - member_size;
            members.push(Member {
                dblock: Block::new(0, trailer.data_size()),
                mblock: Block::new(*pos, member_size),
                dictionary_size,
            });
            return Ok(());
        }
        if ipos == 0 {
            if opts.ignore_gaps && !members.is_empty() {
                *pos = 0;
                return Ok(());
            }
            return Err(Error::data(format!(
                "Bad trailer at pos {}",
                *pos - Trailer::SIZE as u64
            )));
        }
        bsize = BUFFER_SIZE;
        search_size = bsize - Header::SIZE;
        rd_size = BLOCK_SIZE;
        ipos -= BLOCK_SIZE as u64;
        buffer.copy_within(0..BUFFER_SIZE - BLOCK_SIZE, BLOCK_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_member, FAKE_DATA_SIZE};
    use std::io::Cursor;

    #[test]
    fn single_member() {
        let m = fake_member(100);
        let mut cur = Cursor::new(m.clone());
        let idx = FileIndex::new(&mut cur, IndexOptions::default()).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.member(0).mblock, Block::new(0, m.len() as u64));
        assert_eq!(idx.udata_size(), FAKE_DATA_SIZE);
        assert_eq!(idx.blocks(true), 1);
    }

    #[test]
    fn multimember_chains_data_blocks() {
        let mut file = Vec::new();
        let sizes = [40, 100, 70];
        for &s in &sizes {
            file.extend_from_slice(&fake_member(s));
        }
        let mut cur = Cursor::new(file);
        let idx = FileIndex::new(&mut cur, IndexOptions::default()).unwrap();
        assert_eq!(idx.len(), 3);
        for i in 1..idx.len() {
            assert_eq!(idx.member(i).dblock.pos(), idx.member(i - 1).dblock.end());
            assert_eq!(idx.member(i).mblock.pos(), idx.member(i - 1).mblock.end());
        }
        assert_eq!(idx.udata_size(), 3 * FAKE_DATA_SIZE);
        assert_eq!(idx.cdata_size(), idx.file_size());
    }

    #[test]
    fn trailing_data_policy() {
        let mut file = fake_member(80);
        file.extend_from_slice(b"some trailing bytes here");
        let insize = file.len() as u64;

        let mut cur = Cursor::new(file);
        let err = FileIndex::new(&mut cur, IndexOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Trailing data"), "{}", err);

        let opts = IndexOptions { ignore_trailing: true, ..Default::default() };
        let idx = FileIndex::new(&mut cur, opts).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.file_size(), insize);
        assert!(idx.cdata_size() < idx.file_size());
        assert_eq!(idx.blocks(true), 2);
    }

    #[test]
    fn trailing_corrupt_header_needs_loose() {
        let mut file = fake_member(80);
        file.extend_from_slice(b"LZxPtrailing"); // 3 of 4 magic bytes
        let mut cur = Cursor::new(file);
        let opts = IndexOptions { ignore_trailing: true, ..Default::default() };
        let err = FileIndex::new(&mut cur, opts).unwrap_err();
        assert!(err.to_string().contains("Corrupt header"), "{}", err);

        let opts =
            IndexOptions { ignore_trailing: true, loose_trailing: true, ..Default::default() };
        assert_eq!(FileIndex::new(&mut cur, opts).unwrap().len(), 1);
    }

    #[test]
    fn gap_between_members() {
        let mut file = fake_member(60);
        file.extend_from_slice(&[0x55; 300]); // damaged area, not a member
        file.extend_from_slice(&fake_member(90));
        let mut cur = Cursor::new(file);
        let opts = IndexOptions { ignore_gaps: true, ..Default::default() };
        let idx = FileIndex::new(&mut cur, opts).unwrap();
        assert_eq!(idx.len(), 2);
        assert!(idx.member(1).mblock.pos() > idx.member(0).mblock.end());
        assert_eq!(idx.blocks(false), 3); // two members and one gap
    }

    #[test]
    fn truncated_file_is_an_error() {
        let m = fake_member(100);
        let truncated = &m[..m.len() - 7];
        let mut cur = Cursor::new(truncated.to_vec());
        assert!(FileIndex::new(&mut cur, IndexOptions::default()).is_err());
    }

    #[test]
    fn multi_file_index_combines_copies() {
        let mut file = Vec::new();
        for &s in &[50u64, 80] {
            file.extend_from_slice(&fake_member(s as usize));
        }
        // copy A: trailer of member 2 zeroed; copy B: header of member 1 zeroed
        let mut a = file.clone();
        let alen = a.len();
        a[alen - 20..].fill(0);
        let mut b = file.clone();
        b[0..6].fill(0);
        let fsize = file.len() as u64;
        let mut readers = [Cursor::new(a), Cursor::new(b)];
        let idx = FileIndex::multi(&mut readers, fsize).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.cdata_size(), fsize);
    }
}
