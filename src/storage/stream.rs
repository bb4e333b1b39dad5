//! # Stream Abstraction
//!
//! Positional byte I/O over the single data file. A [`Stream`] exposes
//! `read_exact_at` / `write_all_at` plus `flush_to_disk`, which must issue a
//! real durability barrier (fsync), not just a userspace flush.
//!
//! Two backends exist:
//!
//! - [`FileStreamFactory`]: one `std::fs::File` handle per stream. Handles
//!   are independent, so readers never contend with the writer for a file
//!   position.
//! - [`MemoryStreamFactory`]: a shared in-memory byte vector for `:memory:`
//!   databases; all handles observe the same bytes under an `RwLock`, which
//!   also makes each positional operation serialised the way the concurrent
//!   stream wrapper of the original design requires.
//!
//! The [`StreamPool`] owns exactly one writer stream and lends out reader
//! streams, creating new ones on demand and recycling returned handles.
//!
//! ## Reads past the end
//!
//! Reading a range that extends past the current end of the stream yields
//! zero bytes for the missing tail. The page store relies on this when it
//! materialises never-written pages of a pre-allocated region.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::Result;

/// Positioned read/write with an explicit durability barrier.
pub trait Stream: Send {
    /// Fills `buf` from `position`, zero-padding anything past end of stream.
    fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` at `position`, extending the stream if needed.
    fn write_all_at(&mut self, position: u64, buf: &[u8]) -> Result<()>;

    fn length(&self) -> Result<u64>;

    fn set_length(&mut self, len: u64) -> Result<()>;

    /// Durability barrier: no later write may be acknowledged durable until
    /// this returns.
    fn flush_to_disk(&mut self) -> Result<()>;
}

// ----------------------------------------------------------------------------
// file backend
// ----------------------------------------------------------------------------

struct FileStream {
    file: File,
}

impl Stream for FileStream {
    fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.file.metadata()?.len();
        if position >= len {
            buf.fill(0);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(position))?;
        let available = ((len - position) as usize).min(buf.len());
        self.file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);
        Ok(())
    }

    fn write_all_at(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush_to_disk(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// memory backend
// ----------------------------------------------------------------------------

struct MemoryStream {
    data: Arc<RwLock<Vec<u8>>>,
}

impl Stream for MemoryStream {
    fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = (position as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let available = end - start;
        buf[..available].copy_from_slice(&data[start..end]);
        buf[available..].fill(0);
        Ok(())
    }

    fn write_all_at(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let end = position as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[position as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn flush_to_disk(&mut self) -> Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// factories
// ----------------------------------------------------------------------------

/// Creates independent stream handles over one logical byte store.
pub trait StreamFactory: Send + Sync {
    fn open_read(&self) -> Result<Box<dyn Stream>>;
    fn open_write(&self) -> Result<Box<dyn Stream>>;
    fn exists(&self) -> bool;
}

pub struct FileStreamFactory {
    path: PathBuf,
    read_only: bool,
}

impl FileStreamFactory {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }
}

impl StreamFactory for FileStreamFactory {
    fn open_read(&self) -> Result<Box<dyn Stream>> {
        let file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(Box::new(FileStream { file }))
    }

    fn open_write(&self) -> Result<Box<dyn Stream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .create(!self.read_only)
            .open(&self.path)?;
        Ok(Box::new(FileStream { file }))
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[derive(Default, Clone)]
pub struct MemoryStreamFactory {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn open_read(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(MemoryStream {
            data: Arc::clone(&self.data),
        }))
    }

    fn open_write(&self) -> Result<Box<dyn Stream>> {
        self.open_read()
    }

    fn exists(&self) -> bool {
        !self.data.read().is_empty()
    }
}

// ----------------------------------------------------------------------------
// pool
// ----------------------------------------------------------------------------

/// Lends reader streams (many) and owns exactly one writer stream.
pub struct StreamPool {
    factory: Box<dyn StreamFactory>,
    writer: Arc<Mutex<Box<dyn Stream>>>,
    readers: Arc<Mutex<Vec<Box<dyn Stream>>>>,
}

impl StreamPool {
    pub fn new(factory: Box<dyn StreamFactory>) -> Result<Self> {
        let writer = factory.open_write()?;
        Ok(Self {
            factory,
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The single writer stream, shared with the disk writer queue.
    pub fn writer(&self) -> &Arc<Mutex<Box<dyn Stream>>> {
        &self.writer
    }

    /// Rents a reader stream; it returns to the pool on drop.
    pub fn rent_reader(&self) -> Result<PooledStream> {
        let stream = match self.readers.lock().pop() {
            Some(stream) => stream,
            None => self.factory.open_read()?,
        };

        Ok(PooledStream {
            stream: Some(stream),
            pool: Arc::clone(&self.readers),
        })
    }
}

/// A reader stream that returns to its pool when dropped.
pub struct PooledStream {
    stream: Option<Box<dyn Stream>>,
    pool: Arc<Mutex<Vec<Box<dyn Stream>>>>,
}

impl PooledStream {
    pub fn get(&mut self) -> &mut dyn Stream {
        self.stream.as_mut().expect("stream present until drop").as_mut()
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.lock().push(stream);
        }
    }
}
