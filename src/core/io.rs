//! Positioned I/O over the archive's backing stream

use crate::error::{ArchiveError, Result};
use crate::header::{ArchiveHeader, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access byte stream an archive lives in.
///
/// Files and in-memory cursors both qualify. Retry policy, buffering and
/// any filter wrapping belong to the stream, not to the archive.
pub trait ArchiveStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ArchiveStream for T {}

/// Archive backing store
pub struct ArchiveFile<S: ArchiveStream> {
    stream: S,
    /// Offset the next appended record lands at
    end: u64,
}

impl ArchiveFile<File> {
    /// Create (or truncate) an archive file on disk
    pub fn create_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(ArchiveFile::new(file, 0))
    }

    /// Open an existing archive file for reading and writing
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let end = file.seek(SeekFrom::End(0))?;
        Ok(ArchiveFile::new(file, end))
    }
}

impl<S: ArchiveStream> ArchiveFile<S> {
    pub fn new(stream: S, end: u64) -> Self {
        ArchiveFile { stream, end }
    }

    /// Wrap an existing stream, appending after its current end
    pub fn from_stream(mut stream: S) -> Result<Self> {
        let end = stream.seek(SeekFrom::End(0))?;
        Ok(ArchiveFile::new(stream, end))
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Reserve the header region so appended records start after it
    pub fn reserve_header(&mut self) {
        self.end = self.end.max(HEADER_SIZE as u64);
    }

    pub fn read_header(&mut self) -> Result<ArchiveHeader> {
        let bytes = self.read_at(0, HEADER_SIZE, "archive header")?;
        ArchiveHeader::from_bytes(&bytes)
    }

    pub fn write_header(&mut self, header: &ArchiveHeader) -> Result<()> {
        self.stream.seek(SeekFrom::Start(0))?;
        self.stream.write_all(&header.to_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read exactly `len` bytes at `offset`
    ///
    /// A read running past the end of the stream is reported as `Truncated`.
    pub fn read_at(&mut self, offset: u64, len: usize, what: &'static str) -> Result<Vec<u8>> {
        // Reject lengths read from damaged records before allocating for them
        let needed = offset.saturating_add(len as u64);
        if needed > self.end {
            return Err(ArchiveError::Truncated {
                what,
                needed,
                available: self.end,
            });
        }

        self.stream.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.stream.read(&mut buffer[filled..]) {
                Ok(0) => {
                    return Err(ArchiveError::Truncated {
                        what,
                        needed: offset + len as u64,
                        available: offset + filled as u64,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buffer)
    }

    /// Append a record and flush it, returning the offset it was written at.
    ///
    /// The end marker only moves once the write and flush both succeed, so
    /// a failed append is overwritten by the next one.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.write_all(data)?;
        self.stream.flush()?;
        self.end = offset + data.len() as u64;
        Ok(offset)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl ArchiveFile<File> {
    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.stream.sync_all()?;
        Ok(())
    }
}
