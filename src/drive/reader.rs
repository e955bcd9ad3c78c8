//! Lazy reads over a file's shards.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use crate::drive::tree::Shard;
use crate::storage::{ObjectRef, ObjectStore};

/// A `Read` view over a byte range of a finished file.
///
/// Shards are fetched from the object store one at a time as the reader
/// advances; shards entirely before `offset` are never fetched.
pub struct FileReader {
    objects: Arc<dyn ObjectStore>,
    pending: VecDeque<(ObjectRef, usize)>,
    buf: Vec<u8>,
    pos: usize,
    remaining: Option<u64>,
}

impl FileReader {
    /// `size <= 0` reads to the end of the file.
    pub(crate) fn new(objects: Arc<dyn ObjectStore>, shards: &[Shard], offset: u64, size: i64) -> Self {
        let mut pending = VecDeque::new();
        let mut start = 0u64;
        for shard in shards {
            let end = start + shard.size;
            if end > offset {
                let skip = offset.saturating_sub(start) as usize;
                pending.push_back((shard.object, skip));
            }
            start = end;
        }

        Self {
            objects,
            pending,
            buf: Vec::new(),
            pos: 0,
            remaining: (size > 0).then_some(size as u64),
        }
    }

    fn fill(&mut self) -> io::Result<bool> {
        while self.pos >= self.buf.len() {
            let Some((object, skip)) = self.pending.pop_front() else {
                return Ok(false);
            };
            self.buf = self.objects.get(&object).map_err(io::Error::other)?;
            self.pos = skip;
        }
        Ok(true)
    }
}

impl Read for FileReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.remaining == Some(0) || !self.fill()? {
            return Ok(0);
        }

        let available = &self.buf[self.pos..];
        let mut n = available.len().min(out.len());
        if let Some(remaining) = self.remaining {
            n = n.min(remaining as usize);
        }
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Ok(n)
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("pending_shards", &self.pending.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn file(parts: &[&[u8]]) -> (Arc<dyn ObjectStore>, Vec<Shard>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let shards = parts
            .iter()
            .map(|p| Shard {
                object: store.put(p).unwrap(),
                size: p.len() as u64,
            })
            .collect();
        (store, shards)
    }

    fn read(store: &Arc<dyn ObjectStore>, shards: &[Shard], offset: u64, size: i64) -> String {
        let mut out = String::new();
        FileReader::new(Arc::clone(store), shards, offset, size)
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_whole_file() {
        let (store, shards) = file(&[b"hel", b"lo ", b"world"]);
        assert_eq!(read(&store, &shards, 0, 0), "hello world");
        assert_eq!(read(&store, &shards, 0, -1), "hello world");
    }

    #[test]
    fn test_ranges_across_shards() {
        let (store, shards) = file(&[b"hel", b"lo ", b"world"]);
        assert_eq!(read(&store, &shards, 2, 5), "llo w");
        assert_eq!(read(&store, &shards, 6, 0), "world");
        assert_eq!(read(&store, &shards, 3, 3), "lo ");
        assert_eq!(read(&store, &shards, 10, 100), "d");
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let (store, shards) = file(&[b"abc"]);
        assert_eq!(read(&store, &shards, 3, 0), "");
        assert_eq!(read(&store, &shards, 50, 1), "");
    }

    #[test]
    fn test_missing_object_is_io_error() {
        let (_, shards) = file(&[b"abc"]);
        let empty: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut out = Vec::new();
        let err = FileReader::new(empty, &shards, 0, 0).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
