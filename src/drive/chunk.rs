//! Splitting ingested byte streams into file shards.
//!
//! The incoming stream is cut into records according to a [`Delimiter`];
//! records accumulate into a shard until either threshold is reached, then
//! the shard is written to the object store as one object. Concatenating the
//! resulting shards always reproduces the input exactly.

use std::cell::RefCell;
use std::io::{self, BufRead, BufReader, Read};
use std::rc::Rc;

use serde::de::IgnoredAny;

use crate::drive::error::DriveResult;
use crate::drive::tree::Shard;
use crate::drive::types::Delimiter;
use crate::storage::ObjectStore;

const READ_CHUNK: usize = 64 * 1024;

/// Accumulates records and seals them into shards.
pub(crate) struct ShardWriter<'a> {
    objects: &'a dyn ObjectStore,
    target_datums: u64,
    target_bytes: u64,
    buf: Vec<u8>,
    datums: u64,
    shards: Vec<Shard>,
}

impl<'a> ShardWriter<'a> {
    /// a threshold of 0 disables that threshold
    pub fn new(objects: &'a dyn ObjectStore, target_datums: u64, target_bytes: u64) -> Self {
        Self {
            objects,
            target_datums,
            target_bytes,
            buf: Vec::new(),
            datums: 0,
            shards: Vec::new(),
        }
    }

    /// Consume `reader` and return the sealed shards in order.
    pub fn write_stream(mut self, delimiter: Delimiter, reader: impl Read) -> DriveResult<Vec<Shard>> {
        match delimiter {
            Delimiter::None => self.split_bytes(reader)?,
            Delimiter::Line => self.split_lines(reader)?,
            Delimiter::Json => self.split_json(reader)?,
        }
        self.seal()?;
        Ok(self.shards)
    }

    fn split_bytes(&mut self, mut reader: impl Read) -> DriveResult<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let mut data = &chunk[..n];

            if self.target_bytes == 0 {
                self.buf.extend_from_slice(data);
                continue;
            }
            // cut at exactly target_bytes, carrying the remainder over
            while !data.is_empty() {
                let room = (self.target_bytes as usize).saturating_sub(self.buf.len());
                let take = room.min(data.len());
                self.buf.extend_from_slice(&data[..take]);
                data = &data[take..];
                if self.buf.len() as u64 >= self.target_bytes {
                    self.seal()?;
                }
            }
        }
    }

    fn split_lines(&mut self, reader: impl Read) -> DriveResult<()> {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            self.push_record(&line)?;
        }
    }

    fn split_json(&mut self, reader: impl Read) -> DriveResult<()> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let tee = Tee {
            inner: BufReader::new(reader),
            seen: Rc::clone(&seen),
        };
        let mut values = serde_json::Deserializer::from_reader(tee).into_iter::<IgnoredAny>();

        // `seen` holds the bytes read past `consumed`; a record is held back
        // until the next value shows it is not the last one
        let mut consumed = 0;
        let mut pending: Option<Vec<u8>> = None;
        while let Some(value) = values.next() {
            value?;
            let end = values.byte_offset();
            let record: Vec<u8> = seen.borrow_mut().drain(..end - consumed).collect();
            consumed = end;
            if let Some(previous) = pending.replace(record) {
                self.push_record(&previous)?;
            }
        }

        // trailing whitespace rides along with the last record
        let mut last = pending.unwrap_or_default();
        last.extend(seen.borrow_mut().drain(..));
        if !last.is_empty() {
            self.push_record(&last)?;
        }
        Ok(())
    }

    fn push_record(&mut self, record: &[u8]) -> DriveResult<()> {
        self.buf.extend_from_slice(record);
        self.datums += 1;

        let datums_full = self.target_datums > 0 && self.datums >= self.target_datums;
        let bytes_full = self.target_bytes > 0 && self.buf.len() as u64 >= self.target_bytes;
        if datums_full || bytes_full {
            self.seal()?;
        }
        Ok(())
    }

    fn seal(&mut self) -> DriveResult<()> {
        if self.buf.is_empty() {
            self.datums = 0;
            return Ok(());
        }
        let object = self.objects.put(&self.buf)?;
        self.shards.push(Shard {
            object,
            size: self.buf.len() as u64,
        });
        self.buf.clear();
        self.datums = 0;
        Ok(())
    }
}

/// Passes reads through while keeping a copy of every byte handed out.
struct Tee<R> {
    inner: R,
    seen: Rc<RefCell<Vec<u8>>>,
}

impl<R: Read> Read for Tee<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.seen.borrow_mut().extend_from_slice(&out[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn split(delimiter: Delimiter, datums: u64, bytes: u64, input: &[u8]) -> (MemoryObjectStore, Vec<Shard>) {
        let store = MemoryObjectStore::new();
        let shards = ShardWriter::new(&store, datums, bytes)
            .write_stream(delimiter, input)
            .unwrap();
        (store, shards)
    }

    fn reassemble(store: &MemoryObjectStore, shards: &[Shard]) -> Vec<u8> {
        shards
            .iter()
            .flat_map(|s| store.get(&s.object).unwrap())
            .collect()
    }

    #[test]
    fn test_no_thresholds_single_shard() {
        let (store, shards) = split(Delimiter::None, 0, 0, b"hello");
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].size, 5);
        assert_eq!(reassemble(&store, &shards), b"hello");
    }

    #[test]
    fn test_empty_input_has_no_shards() {
        let (_store, shards) = split(Delimiter::Line, 0, 4, b"");
        assert!(shards.is_empty());
    }

    #[test]
    fn test_bytes_cut_exactly() {
        let (store, shards) = split(Delimiter::None, 0, 4, b"0123456789");
        let sizes: Vec<u64> = shards.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(reassemble(&store, &shards), b"0123456789");
    }

    #[test]
    fn test_lines_by_datums() {
        let input = b"a\nb\nc\nd\ne\n";
        let (store, shards) = split(Delimiter::Line, 2, 0, input);
        assert_eq!(shards.len(), 3);
        assert_eq!(store.get(&shards[0].object).unwrap(), b"a\nb\n");
        assert_eq!(store.get(&shards[2].object).unwrap(), b"e\n");
    }

    #[test]
    fn test_lines_keep_records_whole() {
        let input = b"short\na much longer line\nx";
        let (store, shards) = split(Delimiter::Line, 0, 8, input);
        // "short\n" (6) is under 8, so the next line joins it
        assert_eq!(shards.len(), 2);
        assert_eq!(store.get(&shards[0].object).unwrap(), b"short\na much longer line\n");
        assert_eq!(store.get(&shards[1].object).unwrap(), b"x");
    }

    #[test]
    fn test_json_records() {
        let input = br#"{"a":1} {"b":[1,2,{"c":"}"}]}
[3]  "#;
        let (store, shards) = split(Delimiter::Json, 1, 0, input);
        assert_eq!(shards.len(), 3);
        assert_eq!(store.get(&shards[0].object).unwrap(), br#"{"a":1}"#);
        assert_eq!(store.get(&shards[1].object).unwrap(), br#" {"b":[1,2,{"c":"}"}]}"#);
        assert_eq!(store.get(&shards[2].object).unwrap(), b"\n[3]  ");
        assert_eq!(reassemble(&store, &shards), input);
    }

    #[test]
    fn test_json_rejects_malformed() {
        let store = MemoryObjectStore::new();
        let result = ShardWriter::new(&store, 1, 0).write_stream(Delimiter::Json, &b"{\"a\": }"[..]);
        assert!(result.is_err());
    }

    /// Serves one byte per read and notes how many shards existed at EOF.
    struct Trickle<'a> {
        data: &'a [u8],
        store: &'a MemoryObjectStore,
        objects_at_eof: &'a Cell<Option<usize>>,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            match self.data.split_first() {
                Some((b, rest)) if !out.is_empty() => {
                    out[0] = *b;
                    self.data = rest;
                    Ok(1)
                }
                Some(_) => Ok(0),
                None => {
                    self.objects_at_eof.set(Some(self.store.len()));
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn test_json_shards_seal_while_reading() {
        let store = MemoryObjectStore::new();
        let at_eof = Cell::new(None);
        let input = br#"{"a":1} {"b":2} {"c":3}"#;
        let reader = Trickle {
            data: input,
            store: &store,
            objects_at_eof: &at_eof,
        };

        let shards = ShardWriter::new(&store, 1, 0)
            .write_stream(Delimiter::Json, reader)
            .unwrap();
        assert_eq!(shards.len(), 3);
        assert!(at_eof.get().unwrap() >= 2);
        assert_eq!(reassemble(&store, &shards), input);
    }

    #[test]
    fn test_json_whitespace_only_is_one_record() {
        let (store, shards) = split(Delimiter::Json, 1, 0, b" \n ");
        assert_eq!(shards.len(), 1);
        assert_eq!(reassemble(&store, &shards), b" \n ");
    }

    fn ceil_div(a: u64, b: u64) -> u64 {
        (a + b - 1) / b
    }

    proptest! {
        #[test]
        fn prop_byte_split_count_and_content(data in proptest::collection::vec(any::<u8>(), 0..2000), b in 1u64..300) {
            let (store, shards) = split(Delimiter::None, 0, b, &data);
            prop_assert_eq!(shards.len() as u64, ceil_div(data.len() as u64, b));
            prop_assert_eq!(reassemble(&store, &shards), data);
        }

        #[test]
        fn prop_line_split_is_bounded(lines in proptest::collection::vec("[a-z]{0,40}", 0..60), b in 1u64..200) {
            let input: Vec<u8> = lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect();
            let (store, shards) = split(Delimiter::Line, 0, b, &input);
            prop_assert!(shards.len() as u64 <= ceil_div(input.len() as u64, b) + 1);
            prop_assert_eq!(reassemble(&store, &shards), input);
        }
    }
}
