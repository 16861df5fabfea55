#![forbid(unsafe_code)]

//! Positional file I/O underneath the pager.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;

use crate::error::Result;

pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
}

pub struct StdFileIo {
    file: File,
}

impl StdFileIo {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub fn read_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_at(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub fn read_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_at(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = positional::read_at(&self.file, off, dst)?;
            if read == 0 {
                return Err(
                    io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into(),
                );
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = positional::write_at(&self.file, off, src)?;
            if written == 0 {
                return Err(
                    io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into(),
                );
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_back_what_was_written() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("f"), true).unwrap();
        io.write_at(8, b"farol").unwrap();
        let mut buf = [0u8; 5];
        io.read_at(8, &mut buf).unwrap();
        assert_eq!(&buf, b"farol");
        assert_eq!(io.len().unwrap(), 13);
    }

    #[test]
    fn short_read_past_eof_is_an_error() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("f"), true).unwrap();
        io.write_at(0, b"xy").unwrap();
        let mut buf = [0u8; 8];
        assert!(io.read_at(0, &mut buf).is_err());
    }
}
