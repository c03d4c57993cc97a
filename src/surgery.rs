//! Byte-exact surgery on member lists: dump, strip, remove, split, and the
//! nonzero-marker repair.
//!
//! All operations share a walk over the member index and the selector
//! predicate from [`crate::block::MemberList`].  Gaps between members and
//! trailing data are preserved byte-exactly; selector indices count
//! members and gaps in file order.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::block::MemberList;
use crate::decompress::test_member_in_file;
use crate::error::{Error, Result};
use crate::fileio::{copy_data, seek_write, OutFile};
use crate::header::{Header, MIN_MEMBER_SIZE};
use crate::index::{FileIndex, IndexOptions};

fn surgery_index_options(
    member_list: &MemberList,
    ignore_errors: bool,
    ignore_trailing: bool,
    loose_trailing: bool,
) -> (IndexOptions, bool) {
    let ignore_errors = ignore_errors || member_list.damaged;
    let opts = IndexOptions {
        ignore_trailing: ignore_trailing || member_list.tdata,
        loose_trailing,
        ignore_bad_dict: ignore_errors,
        ignore_gaps: ignore_errors,
        max_pos: 0,
    };
    (opts, ignore_errors)
}

/// Membership of member `j` (with `gaps` gaps seen so far) for dump/strip/
/// remove.  `damaged` and `empty` widen the plain index selection.
fn member_included<R: Read + Seek>(
    f: &mut R,
    index: &FileIndex,
    member_list: &MemberList,
    j: usize,
    gaps: u64,
    blocks: u64,
) -> Result<bool> {
    let mut included = member_list.includes(j as u64 + gaps, blocks);
    if !included && member_list.damaged {
        let mb = index.member(j).mblock;
        included = !test_member_in_file(f, mb.pos(), mb.size())?.is_good();
    }
    if !included && member_list.empty {
        included = index.member(j).dblock.size() == 0;
    }
    Ok(included)
}

// ── Dump / strip ──────────────────────────────────────────────────────────────

/// If `strip` is false, copy members/gaps/tdata *in* the selector to the
/// output.  If `strip` is true, copy the ones *not* in the selector.
#[allow(clippy::too_many_arguments)]
pub fn dump_members(
    paths: &[&Path],
    output: Option<&Path>,
    member_list: &MemberList,
    force: bool,
    ignore_errors: bool,
    ignore_trailing: bool,
    loose_trailing: bool,
    strip: bool,
    verbose: bool,
) -> Result<()> {
    let (opts, _) =
        surgery_index_options(member_list, ignore_errors, ignore_trailing, loose_trailing);

    let mut outfile = match output {
        Some(path) => Some(OutFile::create(path, force)?),
        None => None,
    };
    let stdout = io::stdout();
    let mut copied_size = 0u64;
    let mut stripped_size = 0u64;
    let mut copied_tsize = 0u64;
    let mut members = 0u64;
    let mut smembers = 0u64;

    for (fi, path) in paths.iter().enumerate() {
        let name = path.display().to_string();
        let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;
        let blocks = index.blocks(false); // not counting tdata
        let mut stream_pos = 0u64;
        let mut gaps = 0u64;
        let prev_members = members;

        // buffered passes write either to the file or to stdout
        let mut pending: Vec<(u64, u64)> = Vec::new(); // ranges to copy
        for j in 0..index.len() {
            let mb = index.member(j).mblock;
            if mb.pos() > stream_pos {
                // gap
                let included =
                    member_list.damaged || member_list.includes(j as u64 + gaps, blocks);
                if included == !strip {
                    pending.push((stream_pos, mb.pos() - stream_pos));
                    copied_size += mb.pos() - stream_pos;
                    members += 1;
                } else {
                    stripped_size += mb.pos() - stream_pos;
                    smembers += 1;
                }
                gaps += 1;
            }
            let included = member_included(&mut f, &index, member_list, j, gaps, blocks)?;
            if included == !strip {
                pending.push((mb.pos(), mb.size()));
                copied_size += mb.size();
                members += 1;
            } else {
                stripped_size += mb.size();
                smembers += 1;
            }
            stream_pos = mb.end();
        }
        if strip && members == prev_members && index.len() > 0 {
            // every member of this file would be stripped
            eprintln!("{}: All members stripped, skipping.", name);
            continue;
        }
        // trailing data
        let cdata_size = index.cdata_size();
        let trailing_size = index.file_size() - cdata_size;
        if member_list.tdata == !strip
            && trailing_size > 0
            && (!strip || fi + 1 >= paths.len())
        {
            pending.push((cdata_size, trailing_size));
            copied_tsize += trailing_size;
        }

        for (pos, size) in pending {
            f.seek(SeekFrom::Start(pos))?;
            match outfile.as_mut() {
                Some(out) => copy_data(&mut f, out.file(), Some(size))?,
                None => copy_data(&mut f, &mut stdout.lock(), Some(size))?,
            };
        }
    }
    if let Some(out) = outfile {
        out.close(None)?;
    }
    if verbose {
        if !strip {
            eprintln!("{} bytes dumped from {} members.", copied_size, members);
            if member_list.tdata {
                eprintln!("{} trailing bytes dumped.", copied_tsize);
            }
        } else {
            eprintln!("{} bytes stripped from {} members.", stripped_size, smembers);
        }
    }
    Ok(())
}

// ── Remove in place ───────────────────────────────────────────────────────────

/// Rewrite each file in place, dropping the selected members, then truncate
/// and restore the file times.
pub fn remove_members(
    paths: &[&Path],
    member_list: &MemberList,
    ignore_errors: bool,
    ignore_trailing: bool,
    loose_trailing: bool,
    verbose: bool,
) -> Result<()> {
    let (opts, _) =
        surgery_index_options(member_list, ignore_errors, ignore_trailing, loose_trailing);
    let mut removed_size = 0u64;
    let mut members = 0u64;

    for path in paths {
        let name = path.display().to_string();
        let mut infd = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let meta = infd.metadata()?;
        let index = FileIndex::new(&mut infd, opts).map_err(|e| e.for_file(&name))?;
        let mut fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from(e).for_file(&name))?;

        let blocks = index.blocks(false);
        let mut stream_pos = 0u64; // first pos not yet written to file
        let mut gaps = 0u64;
        let prev_members = members;
        for j in 0..index.len() {
            let mb = index.member(j).mblock;
            let prev_end = if j > 0 { index.member(j - 1).mblock.end() } else { 0 };
            if mb.pos() > prev_end {
                // gap
                if !member_list.damaged && !member_list.includes(j as u64 + gaps, blocks) {
                    if stream_pos != prev_end {
                        infd.seek(SeekFrom::Start(prev_end))?;
                        fd.seek(SeekFrom::Start(stream_pos))?;
                        copy_data(&mut infd, &mut fd, Some(mb.pos() - prev_end))?;
                    }
                    stream_pos += mb.pos() - prev_end;
                } else {
                    members += 1;
                }
                gaps += 1;
            }
            let included = member_included(&mut infd, &index, member_list, j, gaps, blocks)?;
            if !included {
                if stream_pos != mb.pos() {
                    infd.seek(SeekFrom::Start(mb.pos()))?;
                    fd.seek(SeekFrom::Start(stream_pos))?;
                    copy_data(&mut infd, &mut fd, Some(mb.size()))?;
                }
                stream_pos += mb.size();
            } else {
                members += 1;
            }
        }
        if stream_pos == 0 {
            // refuse to empty the file
            eprintln!("{}: All members would be removed, skipping.", name);
            members = prev_members;
            continue;
        }
        let cdata_size = index.cdata_size();
        if cdata_size > stream_pos {
            removed_size += cdata_size - stream_pos;
        }
        let file_size = index.file_size();
        let trailing_size = file_size - cdata_size;
        if trailing_size > 0 && !member_list.tdata {
            // keep trailing data
            if stream_pos != cdata_size {
                infd.seek(SeekFrom::Start(cdata_size))?;
                fd.seek(SeekFrom::Start(stream_pos))?;
                copy_data(&mut infd, &mut fd, Some(trailing_size))?;
            }
            stream_pos += trailing_size;
        }
        if stream_pos >= file_size {
            continue; // nothing was removed
        }
        fd.set_len(stream_pos).map_err(|e| Error::from(e).for_file(&name))?;
        let mut times = std::fs::FileTimes::new();
        if let Ok(t) = meta.accessed() {
            times = times.set_accessed(t);
        }
        if let Ok(t) = meta.modified() {
            times = times.set_modified(t);
        }
        let _ = fd.set_times(times);
        fd.sync_all()?;
    }
    if verbose {
        eprintln!("{} bytes removed from {} members.", removed_size, members);
    }
    Ok(())
}

// ── Split ─────────────────────────────────────────────────────────────────────

fn rec_name(base: &Path, n: u64, max_digits: usize) -> PathBuf {
    let dir = base.parent().unwrap_or_else(|| Path::new(""));
    let file = base.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    dir.join(format!("rec{:0width$}{}", n, file, width = max_digits))
}

/// Split a multimember file into one file per member, gap, and trailing
/// data, named `rec1<name>`, `rec2<name>`, ... with zero-padded indices.
pub fn split_file(input: &Path, output: Option<&Path>, force: bool, verbose: bool) -> Result<()> {
    let name = input.display().to_string();
    let mut f = File::open(input).map_err(|e| Error::from(e).for_file(&name))?;
    let meta = f.metadata()?;
    let opts = IndexOptions {
        ignore_trailing: true,
        loose_trailing: true,
        ignore_bad_dict: true,
        ignore_gaps: true,
        max_pos: 0,
    };
    let mut index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;

    // if the last member carries a fake trailer, re-scan up to the point
    // where its real data ends
    let last = index.member(index.len() - 1);
    let mut mpos = last.mblock.pos();
    let mut msize = last.mblock.size();
    if let crate::decompress::MemberTestOutcome::SizeMismatch { mut failure_pos } =
        test_member_in_file(&mut f, mpos, msize)?
    {
        loop {
            mpos += failure_pos;
            msize -= failure_pos;
            if msize < MIN_MEMBER_SIZE {
                break; // the rest is trailing data
            }
            match test_member_in_file(&mut f, mpos, msize)? {
                crate::decompress::MemberTestOutcome::SizeMismatch { failure_pos: fp } => {
                    failure_pos = fp;
                }
                _ => break,
            }
        }
        let opts = IndexOptions { max_pos: mpos, ..opts };
        index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;
    }

    let mut max_digits = 1usize;
    let mut i = index.blocks(true);
    while i >= 10 {
        max_digits += 1;
        i /= 10;
    }
    let base: PathBuf = output.map_or_else(|| input.to_path_buf(), Path::to_path_buf);

    let mut n = 1u64;
    let mut stream_pos = 0u64;
    let write_piece = |f: &mut File, pos: u64, size: u64, n: u64| -> Result<()> {
        let path = rec_name(&base, n, max_digits);
        let mut out = OutFile::create(&path, force)?;
        f.seek(SeekFrom::Start(pos))?;
        copy_data(f, out.file(), Some(size))?;
        out.close(Some(&meta))?;
        if verbose {
            println!("Member '{}' done", path.display());
        }
        Ok(())
    };
    for j in 0..index.len() {
        let mb = index.member(j).mblock;
        if mb.pos() > stream_pos {
            // gap
            write_piece(&mut f, stream_pos, mb.pos() - stream_pos, n)?;
            n += 1;
        }
        write_piece(&mut f, mb.pos(), mb.size(), n)?;
        n += 1;
        stream_pos = mb.end();
    }
    if index.file_size() > stream_pos {
        // trailing data
        write_piece(&mut f, stream_pos, index.file_size() - stream_pos, n)?;
    }
    Ok(())
}

// ── Nonzero repair ────────────────────────────────────────────────────────────

/// Zero the first LZMA byte of every member when nonzero.  That byte must
/// be zero in a valid member; some tools mark streams there.  Idempotent.
pub fn nonzero_repair(paths: &[&Path], verbose: bool) -> Result<()> {
    for path in paths {
        let name = path.display().to_string();
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from(e).for_file(&name))?;
        let meta = f.metadata()?;
        let opts = IndexOptions {
            ignore_trailing: true,
            loose_trailing: true,
            ignore_bad_dict: true,
            ..Default::default()
        };
        let index = FileIndex::new(&mut f, opts).map_err(|e| e.for_file(&name))?;
        let mut repaired = 0u64;
        for m in index.members() {
            let pos = m.mblock.pos() + Header::SIZE as u64;
            let mut byte = [0u8; 1];
            f.seek(SeekFrom::Start(pos))?;
            f.read_exact(&mut byte)?;
            if byte[0] != 0 {
                seek_write(&mut f, &[0], pos)?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            let mut times = std::fs::FileTimes::new();
            if let Ok(t) = meta.accessed() {
                times = times.set_accessed(t);
            }
            if let Ok(t) = meta.modified() {
                times = times.set_modified(t);
            }
            let _ = f.set_times(times);
            f.sync_all()?;
        }
        if verbose {
            println!("{}: {} marking byte(s) zeroed.", name, repaired);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_names_are_zero_padded() {
        let p = rec_name(Path::new("dir/archive.lz"), 3, 4);
        assert_eq!(p, Path::new("dir/rec0003archive.lz"));
        let p = rec_name(Path::new("archive.lz"), 12, 2);
        assert_eq!(p, Path::new("rec12archive.lz"));
    }
}
