//! Random-access byte storage behind the pager.
//!
//! Two backends: a regular file opened read/write (created if missing), and
//! an expandable in-memory buffer.  The memory backend grows in page-sized
//! increments and cannot fail; reads past its end see zero-filled bytes, so
//! a freshly allocated page reads back as all zeroes before it is first
//! written.  File errors from the OS are surfaced to the caller.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error opening backing file: {0}")]
    OpenFailed(std::io::Error),
    #[error("Error accessing backing file: {0}")]
    Io(#[from] std::io::Error),
}

// Growth increment for the memory backend.  Matches the page size so that
// growing for one page never over-allocates by more than a page.
const GROW_INCREMENT: usize = 4096;

pub enum Storage {
    File(std::fs::File),
    Memory(Vec<u8>),
}

impl Storage {
    pub fn open_file(path: &Path) -> Result<Storage, Error> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(Error::OpenFailed)?;
        Ok(Storage::File(f))
    }

    pub fn open_memory() -> Storage {
        Storage::Memory(vec![])
    }

    /// Fills `buf` from `offset`.  Bytes beyond the end of the backing
    /// store read as zero (lazy extension); the caller cannot tell a short
    /// file from a long zeroed one.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        match self {
            Storage::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                let mut filled = 0;
                while filled < buf.len() {
                    let n = f.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf[filled..].fill(0);
                Ok(())
            }
            Storage::Memory(m) => {
                let start = usize::min(offset as usize, m.len());
                let end = usize::min(offset as usize + buf.len(), m.len());
                let have = end - start;
                buf[..have].copy_from_slice(&m[start..end]);
                buf[have..].fill(0);
                Ok(())
            }
        }
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        match self {
            Storage::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                f.write_all(buf)?;
                Ok(())
            }
            Storage::Memory(m) => {
                let end = offset as usize + buf.len();
                if end > m.len() {
                    let grown = end.div_ceil(GROW_INCREMENT) * GROW_INCREMENT;
                    m.resize(grown, 0);
                }
                m[offset as usize..end].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    /// Flushes file contents and metadata to disk.  A no-op for memory.
    pub fn sync(&mut self) -> Result<(), Error> {
        match self {
            Storage::File(f) => {
                f.sync_all()?;
                Ok(())
            }
            Storage::Memory(_) => Ok(()),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Storage::Memory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_read_past_end_is_zero_filled() {
        let mut s = Storage::open_memory();
        let mut buf = [0xffu8; 16];
        s.read_at(1 << 20, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_memory_write_then_read() {
        let mut s = Storage::open_memory();
        s.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        s.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_memory_grows_in_page_increments() {
        let mut s = Storage::open_memory();
        s.write_at(0, &[1u8]).unwrap();
        match &s {
            Storage::Memory(m) => assert_eq!(m.len(), GROW_INCREMENT),
            _ => unreachable!(),
        }
        s.write_at(GROW_INCREMENT as u64, &[2u8]).unwrap();
        match &s {
            Storage::Memory(m) => assert_eq!(m.len(), 2 * GROW_INCREMENT),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_file_read_past_end_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut s = Storage::open_file(&path).unwrap();
        s.write_at(0, b"abc").unwrap();
        let mut buf = [0xffu8; 8];
        s.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc\0\0\0\0\0");
    }

    #[test]
    fn test_file_write_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let mut s = Storage::open_file(&path).unwrap();
            s.write_at(10, b"persist").unwrap();
            s.sync().unwrap();
        }
        let mut s = Storage::open_file(&path).unwrap();
        let mut buf = [0u8; 7];
        s.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }
}
