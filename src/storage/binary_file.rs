//! Binary file: typed positioned I/O over a single file handle.
//!
//! Thin wrapper over `std::fs::File` providing the semantics the buffer
//! manager needs: open with a flag bitmask, positioned reads and writes
//! that loop over short transfers, and size/truncate. Every error is
//! reported with the file's path attached.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Open-flag bitmask for [`BinaryFile::open`]
pub mod oflag {
    /// Open for reading
    pub const IN: u32 = 0x1;
    /// Open for writing; the file is created if absent
    pub const OUT: u32 = 0x2;
    /// Discard existing contents
    pub const TRUNCATE: u32 = 0x4;
    /// Sequentially read the whole file on open to warm the OS cache
    pub const PRELOAD: u32 = 0x8;
    /// Access-pattern hint; accepted, not acted upon
    pub const RANDOM: u32 = 0x10;
    /// Access-pattern hint; accepted, not acted upon
    pub const SEQUENTIAL: u32 = 0x20;
}

/// Outcome of a [`BinaryFile::read`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer was filled completely
    Full,
    /// End of file before any byte was read
    Eof,
    /// End of file partway through; holds the bytes actually read
    Partial(usize),
}

/// A binary disk file open for positioned access
pub struct BinaryFile {
    file: File,
    path: PathBuf,
}

impl BinaryFile {
    /// Open `path` with the given `oflag` bits.
    ///
    /// `OUT` implies creation if the file does not exist. Returns the
    /// file along with whether it already existed and was not truncated.
    pub fn open(path: &Path, flags: u32) -> Result<(Self, bool)> {
        let writable = flags & oflag::OUT != 0;
        let truncate = flags & oflag::TRUNCATE != 0;
        if truncate && !writable {
            return Err(Error::invalid_argument("truncate requires out"));
        }
        let existed = path.exists() && !truncate;

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(truncate)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let mut bf = Self {
            file,
            path: path.to_path_buf(),
        };

        if flags & oflag::PRELOAD != 0 && existed {
            bf.preload()?;
        }

        Ok((bf, existed))
    }

    /// Sequentially read the entire file to populate the OS page cache
    fn preload(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0))?;
        let mut sink = [0u8; 8192];
        loop {
            match self.file.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
        self.seek(SeekFrom::Start(0))
    }

    /// The path this file was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reposition the file cursor
    pub fn seek(&mut self, pos: SeekFrom) -> Result<()> {
        self.file
            .seek(pos)
            .map(|_| ())
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Short reads from the OS are retried until the buffer is full or
    /// end of file is reached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Ok(if filled == 0 {
                        ReadStatus::Eof
                    } else {
                        ReadStatus::Partial(filled)
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
        Ok(ReadStatus::Full)
    }

    /// Write all of `buf` at the current position, looping over short
    /// writes.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Current size of the file in bytes
    pub fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Shrink or extend the file to exactly `len` bytes
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| Error::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");

        let (mut f, existed) = BinaryFile::open(&path, oflag::IN | oflag::OUT)?;
        assert!(!existed);

        f.write(b"hello world")?;
        f.seek(SeekFrom::Start(6))?;
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf)?, ReadStatus::Full);
        assert_eq!(&buf, b"world");
        assert_eq!(f.size()?, 11);
        Ok(())
    }

    #[test]
    fn test_read_past_eof() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");

        let (mut f, _) = BinaryFile::open(&path, oflag::IN | oflag::OUT)?;
        f.write(b"abc")?;
        f.seek(SeekFrom::Start(0))?;

        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf)?, ReadStatus::Partial(3));
        assert_eq!(f.read(&mut buf)?, ReadStatus::Eof);
        Ok(())
    }

    #[test]
    fn test_reopen_reports_existing() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");

        {
            let (mut f, _) = BinaryFile::open(&path, oflag::IN | oflag::OUT)?;
            f.write(b"data")?;
        }
        let (_, existed) = BinaryFile::open(&path, oflag::IN)?;
        assert!(existed);

        let (f, existed) = BinaryFile::open(&path, oflag::IN | oflag::OUT | oflag::TRUNCATE)?;
        assert!(!existed);
        assert_eq!(f.size()?, 0);
        Ok(())
    }

    #[test]
    fn test_preload_existing() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        {
            let (mut f, _) = BinaryFile::open(&path, oflag::IN | oflag::OUT)?;
            f.write(&vec![0xAAu8; 20_000])?;
        }
        let (mut f, existed) = BinaryFile::open(&path, oflag::IN | oflag::PRELOAD)?;
        assert!(existed);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf)?, ReadStatus::Full);
        assert_eq!(buf, [0xAA; 4]);
        Ok(())
    }
}
