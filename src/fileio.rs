//! Shared file plumbing: guarded output files, bounded copies, member reads.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::index::seek_read;

/// An output file that is deleted on drop unless explicitly kept.
///
/// Recovery operations write whole-file copies before patching them; if the
/// operation fails midway the partial output must not survive.
pub struct OutFile {
    path: PathBuf,
    file: Option<File>,
    keep: bool,
}

impl OutFile {
    pub fn create(path: &Path, force: bool) -> Result<OutFile> {
        Self::open(path, force, false)
    }

    /// Open read-write; needed when the output is re-read while testing
    /// merge candidates.
    pub fn create_rw(path: &Path, force: bool) -> Result<OutFile> {
        Self::open(path, force, true)
    }

    fn open(path: &Path, force: bool, rw: bool) -> Result<OutFile> {
        let mut options = OpenOptions::new();
        options.write(true).read(rw);
        if force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::env(format!(
                    "Output file '{}' already exists. Use '--force' to overwrite it.",
                    path.display()
                ))
            } else {
                Error::env(format!("Can't create output file '{}': {}", path.display(), e))
            }
        })?;
        Ok(OutFile { path: path.to_path_buf(), file: Some(file), keep: false })
    }

    pub fn file(&mut self) -> &mut File {
        self.file.as_mut().expect("output file already closed")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the file, optionally restoring the reference file's access and
    /// modification times, and keep it on disk.
    pub fn close(mut self, times_from: Option<&fs::Metadata>) -> Result<()> {
        let file = self.file.take().expect("output file already closed");
        if let Some(meta) = times_from {
            let mut times = fs::FileTimes::new();
            if let Ok(t) = meta.accessed() {
                times = times.set_accessed(t);
            }
            if let Ok(t) = meta.modified() {
                times = times.set_modified(t);
            }
            let _ = file.set_times(times);
        }
        file.sync_all()?;
        self.keep = true;
        Ok(())
    }
}

impl Drop for OutFile {
    fn drop(&mut self) {
        if !self.keep {
            drop(self.file.take());
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Copy up to `max_size` bytes (all remaining input when `None`) from the
/// current position of `r` to the current position of `w`.  A short input
/// under an explicit `max_size` is an error.
pub fn copy_data<R: Read + ?Sized, W: Write + ?Sized>(
    r: &mut R,
    w: &mut W,
    max_size: Option<u64>,
) -> Result<u64> {
    const BUFFER_SIZE: usize = 65536;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut rest = max_size.unwrap_or(u64::MAX);
    let mut copied = 0u64;
    while rest > 0 {
        let size = (BUFFER_SIZE as u64).min(rest) as usize;
        let rd = match r.read(&mut buffer[..size]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        w.write_all(&buffer[..rd])?;
        copied += rd as u64;
        rest -= rd as u64;
    }
    if let Some(max) = max_size {
        if copied != max {
            return Err(Error::data("Input file ends unexpectedly."));
        }
    }
    Ok(copied)
}

/// Read a whole member image (header + stream + trailer) into memory.
pub fn read_member_image<R: Read + Seek>(f: &mut R, mpos: u64, msize: u64) -> Result<Vec<u8>> {
    if msize == 0 || msize > usize::MAX as u64 {
        return Err(Error::env("Input file contains a member too large to load."));
    }
    let mut image = vec![0u8; msize as usize];
    if seek_read(f, &mut image, mpos)? != image.len() {
        return Err(Error::env("Error reading input file"));
    }
    Ok(image)
}

/// CRC32 of a whole stream from its current position.
pub fn stream_crc32<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; 65536];
    loop {
        match r.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hasher.finalize())
}

/// Write `buf` at an absolute position, preserving the rest of the file.
pub fn seek_write(f: &mut File, buf: &[u8], pos: u64) -> Result<()> {
    f.seek(SeekFrom::Start(pos))?;
    f.write_all(buf)?;
    Ok(())
}

/// Derive the default output name for a repaired copy: `foo.lz` becomes
/// `foo_fixed.lz`, anything else gets `_fixed` appended.
pub fn insert_fixed(name: &str) -> String {
    for ext in [".lz", ".tlz"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return format!("{}_fixed{}", stem, ext);
        }
    }
    format!("{}_fixed", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn copy_data_bounded() {
        let mut src = Cursor::new(vec![7u8; 1000]);
        let mut dst = Vec::new();
        assert_eq!(copy_data(&mut src, &mut dst, Some(300)).unwrap(), 300);
        assert_eq!(dst.len(), 300);

        let mut src = Cursor::new(vec![7u8; 100]);
        let mut dst = Vec::new();
        assert!(copy_data(&mut src, &mut dst, Some(300)).is_err());
    }

    #[test]
    fn copy_data_unbounded() {
        let mut src = Cursor::new((0u8..=255).collect::<Vec<u8>>());
        let mut dst = Vec::new();
        assert_eq!(copy_data(&mut src, &mut dst, None).unwrap(), 256);
        assert_eq!(dst, src.into_inner());
    }

    #[test]
    fn fixed_name() {
        assert_eq!(insert_fixed("a.lz"), "a_fixed.lz");
        assert_eq!(insert_fixed("a.tlz"), "a_fixed.tlz");
        assert_eq!(insert_fixed("archive"), "archive_fixed");
    }

    #[test]
    fn outfile_deleted_unless_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        {
            let mut of = OutFile::create(&path, false).unwrap();
            of.file().write_all(b"partial").unwrap();
        }
        assert!(!path.exists(), "partial output must be deleted");

        let mut of = OutFile::create(&path, false).unwrap();
        of.file().write_all(b"done").unwrap();
        of.close(None).unwrap();
        assert!(path.exists());
        assert!(OutFile::create(&path, false).is_err()); // no --force
        assert!(OutFile::create(&path, true).is_ok());
    }
}
