//! Merge engine: produce one intact file from N damaged copies.
//!
//! # Flow
//!
//! Duplicate copies are rejected by whole-file CRC.  The member index comes
//! from the first copy whose format is intact, or from the multi-file
//! index when every copy is damaged.  For each member the pairwise byte
//! differences between all copies are combined into a candidate block set
//! (splitting blocks so every edge is preserved); copies that differ
//! nowhere share a "color" and are treated as one.  Three strategies are
//! tried in order: a binary partition between two colors, the exhaustive
//! `files^blocks` search with early abort, and a byte-by-byte split of a
//! single block.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::block::Block;
use crate::decompress::test_member_in_file;
use crate::error::{Error, Result};
use crate::fileio::{copy_data, insert_fixed, stream_crc32, OutFile};
use crate::header::MIN_MEMBER_SIZE;
use crate::index::{FileIndex, IndexOptions};

/// Add `bv` to `block_vector`, splitting blocks as needed to keep every
/// edge (pos and end of every block).  `bv` is consumed.
pub(crate) fn combine(block_vector: &mut Vec<Block>, mut bv: Vec<Block>) {
    if block_vector.is_empty() {
        *block_vector = bv;
        return;
    }
    let mut i1 = 0;
    let mut i2 = 0;
    while i1 < block_vector.len() && i2 < bv.len() {
        let mut b1 = block_vector[i1];
        let mut b2 = bv[i2];
        if b1.overlaps(&b2) {
            if b1.pos() < b2.pos() {
                let prefix = b1.split(b2.pos()).expect("overlap guarantees interior split");
                block_vector[i1] = b1;
                block_vector.insert(i1, prefix);
                i1 += 1;
            } else if b2.pos() < b1.pos() {
                let prefix = Block::new(b2.pos(), b1.pos() - b2.pos());
                b2.split(b1.pos());
                bv[i2] = b2;
                block_vector.insert(i1, prefix);
                i1 += 1;
            } else if b1.end() < b2.end() {
                b2.split(b1.end());
                bv[i2] = b2;
                i1 += 1;
            } else if b2.end() < b1.end() {
                let prefix = b1.split(b2.end()).expect("overlap guarantees interior split");
                block_vector[i1] = b1;
                block_vector.insert(i1, prefix);
                i1 += 1;
                i2 += 1;
            } else {
                // blocks are identical
                i1 += 1;
                i2 += 1;
            }
        } else if b1.pos() < b2.pos() {
            i1 += 1;
        } else {
            block_vector.insert(i1, b2);
            i1 += 1;
            i2 += 1;
        }
    }
    if i2 < bv.len() {
        block_vector.extend_from_slice(&bv[i2..]);
    }
}

/// Pairwise byte-diff all copies over one member, accumulating candidate
/// blocks (absolute file positions) and assigning colors to identical
/// copies.
pub(crate) fn diff_member<R: Read + Seek>(
    mpos: u64,
    msize: u64,
    files: &mut [R],
    block_vector: &mut Vec<Block>,
    color_vector: &mut [u32],
) -> Result<()> {
    const BUFFER_SIZE: usize = 65536;
    let nfiles = files.len();
    let mut buffer1 = vec![0u8; BUFFER_SIZE];
    let mut buffer2 = vec![0u8; BUFFER_SIZE];
    let mut next_color = 1;

    for i1 in 0..nfiles {
        for i2 in i1 + 1..nfiles {
            if color_vector[i1] != 0 && color_vector[i1] == color_vector[i2] {
                continue;
            }
            let mut bv: Vec<Block> = Vec::new();
            let mut partial_pos = 0u64;
            let mut begin: Option<u64> = None;
            let mut prev_equal = true;
            files[i1].seek(SeekFrom::Start(mpos))?;
            files[i2].seek(SeekFrom::Start(mpos))?;

            while partial_pos < msize {
                let size = (BUFFER_SIZE as u64).min(msize - partial_pos) as usize;
                let (a, b) = files.split_at_mut(i2);
                a[i1].read_exact(&mut buffer1[..size])?;
                b[0].read_exact(&mut buffer2[..size])?;
                for i in 0..size {
                    if buffer1[i] != buffer2[i] {
                        prev_equal = false;
                        if begin.is_none() {
                            begin = Some(partial_pos + i as u64);
                        }
                    } else if !prev_equal {
                        prev_equal = true;
                    } else if let Some(bpos) = begin.take() {
                        // a diff block closes after two equal bytes
                        bv.push(Block::new(mpos + bpos, partial_pos + i as u64 - 1 - bpos));
                    }
                }
                partial_pos += size as u64;
            }
            if let Some(bpos) = begin {
                bv.push(Block::new(mpos + bpos, partial_pos - prev_equal as u64 - bpos));
            }
            if bv.is_empty() {
                // members are identical, share one color
                if color_vector[i1] == 0 {
                    if color_vector[i2] != 0 {
                        color_vector[i1] = color_vector[i2];
                    } else {
                        color_vector[i1] = next_color;
                        color_vector[i2] = next_color;
                        next_color += 1;
                    }
                } else if color_vector[i2] == 0 {
                    color_vector[i2] = color_vector[i1];
                } else {
                    return Err(Error::internal(
                        "different colors assigned to identical members",
                    ));
                }
            }
            combine(block_vector, bv);
        }
        if color_vector[i1] == 0 {
            color_vector[i1] = next_color;
            next_color += 1;
        }
    }
    Ok(())
}

/// Repeatedly merge the blocks separated by the smallest uniform gap until
/// at most 16 candidate blocks remain.
pub(crate) fn cluster_blocks(block_vector: &mut Vec<Block>) {
    while block_vector.len() > 16 {
        let mut min_gap = u64::MAX;
        let mut same = true; // all gaps have the same size
        for i in 1..block_vector.len() {
            let gap = block_vector[i].pos() - block_vector[i - 1].end();
            if gap < min_gap {
                if min_gap < u64::MAX {
                    same = false;
                }
                min_gap = gap;
            } else if gap != min_gap {
                same = false;
            }
        }
        if min_gap == u64::MAX || same {
            break;
        }
        for i in (1..block_vector.len()).rev() {
            let gap = block_vector[i].pos() - block_vector[i - 1].end();
            if gap == min_gap {
                let grown = block_vector[i - 1].size() + gap + block_vector[i].size();
                block_vector[i - 1].set_size(grown);
                block_vector.remove(i);
            }
        }
    }
}

fn color_done(color_vector: &[u32], i: usize) -> bool {
    color_vector[..i].contains(&color_vector[i])
}

fn ipow(base: u64, exponent: usize) -> u64 {
    let mut result: u64 = 1;
    for _ in 0..exponent {
        result = result.saturating_mul(base);
    }
    result
}

fn copy_block_from(src: &mut File, out: &mut File, b: &Block) -> Result<()> {
    src.seek(SeekFrom::Start(b.pos()))?;
    out.seek(SeekFrom::Start(b.pos()))?;
    copy_data(src, out, Some(b.size()))?;
    Ok(())
}

// ── Strategies ────────────────────────────────────────────────────────────────

/// Strategy 1: divide the blocks in two color groups at every gap.
fn try_merge_member2(
    mpos: u64,
    msize: u64,
    block_vector: &[Block],
    color_vector: &[u32],
    infds: &mut [File],
    out: &mut File,
) -> Result<bool> {
    let nfiles = infds.len();
    for i1 in 0..nfiles {
        for i2 in 0..nfiles {
            if i1 == i2 || color_vector[i1] == color_vector[i2] || color_done(color_vector, i1) {
                continue;
            }
            for b in block_vector {
                copy_block_from(&mut infds[i2], out, b)?;
            }
            for b in block_vector.iter().take(block_vector.len() - 1) {
                copy_block_from(&mut infds[i1], out, b)?;
                let outcome = test_member_in_file(out, mpos, msize)?;
                if outcome.is_good() {
                    return Ok(true);
                }
                if mpos + outcome.failure_pos() < b.end() {
                    break;
                }
            }
        }
    }
    Ok(false)
}

/// Strategy 2: exhaustive merge block by block with early abort.
fn try_merge_member_full(
    mpos: u64,
    msize: u64,
    block_vector: &[Block],
    color_vector: &[u32],
    infds: &mut [File],
    out: &mut File,
) -> Result<bool> {
    let blocks = block_vector.len();
    let nfiles = infds.len();
    let variations = ipow(nfiles as u64, blocks);
    if variations >= i64::MAX as u64 {
        return Err(Error::data(if nfiles > 2 {
            "Too many damaged blocks. Try merging fewer files."
        } else {
            "Too many damaged blocks. Merging is not possible."
        }));
    }
    let mut file_idx = vec![0usize; blocks];
    let mut bi: isize = 0;

    while bi >= 0 {
        while (bi as usize) < blocks {
            let b = &block_vector[bi as usize];
            copy_block_from(&mut infds[file_idx[bi as usize]], out, b)?;
            bi += 1;
        }
        let outcome = test_member_in_file(out, mpos, msize)?;
        if outcome.is_good() {
            return Ok(true);
        }
        let failure_pos = outcome.failure_pos();
        while bi > 0 && mpos + failure_pos < block_vector[bi as usize - 1].pos() {
            bi -= 1;
        }
        loop {
            bi -= 1;
            if bi < 0 {
                break;
            }
            let idx = &mut file_idx[bi as usize];
            loop {
                *idx += 1;
                if *idx >= nfiles || !color_done(color_vector, *idx) {
                    break;
                }
            }
            if *idx < nfiles {
                break;
            }
            *idx = 0;
        }
    }
    Ok(false)
}

/// Strategy 3: a single block split at every possible position.
fn try_merge_member1(
    mpos: u64,
    msize: u64,
    block_vector: &[Block],
    color_vector: &[u32],
    infds: &mut [File],
    out: &mut File,
) -> Result<bool> {
    if block_vector.len() != 1 || block_vector[0].size() <= 1 {
        return Ok(false);
    }
    let pos = block_vector[0].pos();
    let size = block_vector[0].size();
    let nfiles = infds.len();

    for i1 in 0..nfiles {
        for i2 in 0..nfiles {
            if i1 == i2 || color_vector[i1] == color_vector[i2] || color_done(color_vector, i1) {
                continue;
            }
            copy_block_from(&mut infds[i2], out, &block_vector[0])?;
            infds[i1].seek(SeekFrom::Start(pos))?;
            for i in 0..size - 1 {
                let mut byte = [0u8; 1];
                infds[i1].read_exact(&mut byte)?;
                out.seek(SeekFrom::Start(pos + i))?;
                use std::io::Write;
                out.write_all(&byte)?;
                let outcome = test_member_in_file(out, mpos, msize)?;
                if outcome.is_good() {
                    return Ok(true);
                }
                if mpos + outcome.failure_pos() <= pos + i {
                    break;
                }
            }
        }
    }
    Ok(false)
}

// ── Driver ────────────────────────────────────────────────────────────────────

fn open_input_files(
    paths: &[&Path],
    verbose: bool,
) -> Result<Option<(Vec<File>, FileIndex, std::fs::Metadata)>> {
    let nfiles = paths.len();
    for i in 0..nfiles {
        for j in i + 1..nfiles {
            if paths[i] == paths[j] {
                return Err(Error::data(format!(
                    "{}: Input file given twice.",
                    paths[i].display()
                )));
            }
        }
    }
    let mut infds = Vec::with_capacity(nfiles);
    let mut crcs: Vec<u32> = Vec::with_capacity(nfiles);
    for path in paths {
        let name = path.display().to_string();
        let mut f = File::open(path).map_err(|e| Error::from(e).for_file(&name))?;
        let crc = stream_crc32(&mut f)?;
        if let Some(j) = crcs.iter().position(|&c| c == crc) {
            return Err(Error::data(format!(
                "Input files {} and {} are identical.",
                paths[j].display(),
                name
            )));
        }
        crcs.push(crc);
        infds.push(f);
    }
    let meta = infds[0].metadata()?;

    let opts = IndexOptions { ignore_bad_dict: true, ..Default::default() };
    let mut index: Option<FileIndex> = None;
    let mut insize: u64 = 0;
    for (i, f) in infds.iter_mut().enumerate() {
        let size;
        match FileIndex::new(f, opts) {
            Ok(li) => {
                if let Some(existing) = &index {
                    if *existing != li {
                        return Err(Error::data(format!(
                            "Input files {} and {} are different.",
                            paths[0].display(),
                            paths[i].display()
                        )));
                    }
                } else {
                    index = Some(li.clone());
                }
                size = li.file_size();
            }
            Err(_) => {
                size = f.seek(SeekFrom::End(0))?;
            }
        }
        if size < MIN_MEMBER_SIZE {
            return Err(Error::data(format!("{}: Input file is too short.", paths[i].display())));
        }
        if i == 0 {
            insize = size;
        } else if insize != size {
            return Err(Error::data(format!(
                "Sizes of input files {} and {} are different.",
                paths[0].display(),
                paths[i].display()
            )));
        }
    }

    let index = match index {
        Some(li) => li,
        None => FileIndex::multi(&mut infds, insize)
            .map_err(|_| Error::data("Format damaged in all input files."))?,
    };

    // a copy with no errors makes recovery unnecessary
    for (i, f) in infds.iter_mut().enumerate() {
        let mut error = false;
        for m in index.members() {
            if !test_member_in_file(f, m.mblock.pos(), m.mblock.size())?.is_good() {
                error = true;
                break;
            }
        }
        if !error {
            if verbose {
                println!(
                    "Input file '{}' has no errors. Recovery is not needed.",
                    paths[i].display()
                );
            }
            return Ok(None);
        }
    }
    Ok(Some((infds, index, meta)))
}

/// `--merge`: reconcile N damaged copies into one intact file.
pub fn merge_files(
    paths: &[&Path],
    output: Option<&Path>,
    force: bool,
    verbose: bool,
) -> Result<()> {
    if paths.len() < 2 {
        return Err(Error::env("At least 2 files are needed for merging."));
    }
    let (mut infds, index, meta) = match open_input_files(paths, verbose)? {
        Some(t) => t,
        None => return Ok(()),
    };

    let out_path: PathBuf = output.map_or_else(
        || PathBuf::from(insert_fixed(&paths[0].display().to_string())),
        Path::to_path_buf,
    );
    let mut out = OutFile::create_rw(&out_path, force)?;
    infds[0].seek(SeekFrom::Start(0))?;
    copy_data(&mut infds[0], out.file(), None)?;

    for j in 0..index.len() {
        let mpos = index.member(j).mblock.pos();
        let msize = index.member(j).mblock.size();
        let mut block_vector: Vec<Block> = Vec::new();
        let mut color_vector = vec![0u32; infds.len()];
        diff_member(mpos, msize, &mut infds, &mut block_vector, &mut color_vector)?;

        if block_vector.is_empty() {
            if index.len() > 1 && test_member_in_file(out.file(), mpos, msize)?.is_good() {
                continue;
            }
            return Err(Error::data(format!(
                "Member {} is damaged and identical in all files. Merging is not possible.",
                j + 1
            )));
        }
        if verbose {
            println!(
                "Merging member {} of {}  ({} error{})",
                j + 1,
                index.len(),
                block_vector.len(),
                if block_vector.len() == 1 { "" } else { "s" }
            );
        }

        let mut done = false;
        if block_vector.len() > 1 {
            cluster_blocks(&mut block_vector);
            done = try_merge_member2(
                mpos, msize, &block_vector, &color_vector, &mut infds, out.file(),
            )?;
        }
        // with one differing block in a single-member file the binary
        // partition cannot succeed
        if !done && (index.len() > 1 || block_vector.len() > 1) {
            done = try_merge_member_full(
                mpos, msize, &block_vector, &color_vector, &mut infds, out.file(),
            )?;
        }
        if !done {
            done = try_merge_member1(
                mpos, msize, &block_vector, &color_vector, &mut infds, out.file(),
            )?;
        }
        if !done {
            return Err(Error::data("Some error areas overlap. Merging is not possible."));
        }
    }

    out.close(Some(&meta))?;
    if verbose {
        println!("Input files merged successfully.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn combine_preserves_edges() {
        let mut acc = vec![Block::new(10, 10)];
        combine(&mut acc, vec![Block::new(15, 10)]);
        assert_eq!(acc, vec![Block::new(10, 5), Block::new(15, 5), Block::new(20, 5)]);

        let mut acc = vec![Block::new(0, 4)];
        combine(&mut acc, vec![Block::new(8, 4)]);
        assert_eq!(acc, vec![Block::new(0, 4), Block::new(8, 4)]);

        let mut acc = vec![Block::new(5, 5)];
        combine(&mut acc, vec![Block::new(5, 5)]);
        assert_eq!(acc, vec![Block::new(5, 5)]);
    }

    #[test]
    fn diff_finds_mismatched_runs() {
        // identical except bytes 10..12 and byte 40
        let a: Vec<u8> = (0..64).map(|i| (i % 251) as u8).collect();
        let mut b = a.clone();
        b[10] ^= 0xFF;
        b[11] ^= 0xFF;
        b[40] ^= 0x10;
        let mut files = [Cursor::new(a), Cursor::new(b)];
        let mut blocks = Vec::new();
        let mut colors = vec![0u32; 2];
        diff_member(0, 64, &mut files, &mut blocks, &mut colors).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].includes(10) && blocks[0].includes(11));
        assert!(blocks[1].includes(40));
        assert_ne!(colors[0], colors[1]);
    }

    #[test]
    fn identical_copies_share_color() {
        let a: Vec<u8> = vec![9; 100];
        let mut files = [Cursor::new(a.clone()), Cursor::new(a.clone()), Cursor::new(a)];
        let mut blocks = Vec::new();
        let mut colors = vec![0u32; 3];
        diff_member(0, 100, &mut files, &mut blocks, &mut colors).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(colors[0], colors[1]);
        assert_eq!(colors[1], colors[2]);
    }

    #[test]
    fn clustering_caps_block_count() {
        // 40 one-byte blocks, gaps growing with index
        let mut blocks: Vec<Block> = (0..40u64).map(|i| Block::new(i * i + 100, 1)).collect();
        cluster_blocks(&mut blocks);
        assert!(blocks.len() <= 16, "still {} blocks", blocks.len());
        // coverage is preserved: first pos and last end unchanged
        assert_eq!(blocks.first().unwrap().pos(), 100);
        assert_eq!(blocks.last().unwrap().end(), 39 * 39 + 100 + 1);
    }

    #[test]
    fn ipow_saturates() {
        assert_eq!(ipow(3, 4), 81);
        assert_eq!(ipow(u64::MAX, 3), u64::MAX);
    }
}
