use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

/// Capability the engine reads file content through. Abstracts over real
/// files and in-memory buffers so the transfer pipeline never touches the
/// filesystem directly.
pub trait BlobSource: Send + Sync {
    fn byte_length(&self) -> u64;

    /// Reads `[start, end)`. Fails if the range exceeds the blob.
    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>>;
}

/// Blob backed by an owned byte buffer. The test and small-payload impl.
pub struct MemoryBlob {
    data: Vec<u8>,
}

impl MemoryBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlobSource for MemoryBlob {
    fn byte_length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        if start > end || end > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} out of bounds for {} bytes", self.data.len()),
            ));
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

/// Blob backed by a file on disk. Length is captured at open time; the
/// file must not change while a transfer references it, or digests and
/// chunk boundaries would no longer describe the uploaded bytes.
pub struct FileBlob {
    file: Mutex<File>,
    len: u64,
}

impl FileBlob {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl BlobSource for FileBlob {
    fn byte_length(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        if start > end || end > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} out of bounds for {} bytes", self.len),
            ));
        }
        let mut buf = vec![0u8; (end - start) as usize];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
