//! Stream Splitter - incremental record extraction from a growing file
//!
//! ```text
//!  file:   {...rec 1...}\n{...rec 2...}\n{...rec 3 (writer still app
//!          ^ returned     ^ returned     ^ get() -> None, retry later
//! ```
//!
//! The splitter owns one read handle and a byte buffer. Each `get` scans the
//! buffered bytes for one balanced record; if there is none yet it reads the
//! next chunk from the handle's current position and scans again, resuming
//! where the previous scan stopped. At end of file it returns `None`. Bytes
//! the producer appends later are picked up by the next call, because the
//! handle's position is never rewound.
//!
//! A record larger than the read chunk simply makes the buffer grow.

use crate::queue::codec::{self, CodecError, RecordScanner};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Default read chunk size (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Error type for splitter reads
#[derive(Debug)]
pub enum SplitterError {
    /// Reading the underlying handle failed
    Io(std::io::Error),
    /// A complete record did not decode
    Codec(CodecError),
}

impl std::fmt::Display for SplitterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitterError::Io(e) => write!(f, "Splitter I/O error: {}", e),
            SplitterError::Codec(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SplitterError {}

impl From<std::io::Error> for SplitterError {
    fn from(e: std::io::Error) -> Self {
        SplitterError::Io(e)
    }
}

impl From<CodecError> for SplitterError {
    fn from(e: CodecError) -> Self {
        SplitterError::Codec(e)
    }
}

/// Splits a byte stream into JSON records
pub struct RecordSplitter<R: Read> {
    reader: R,
    buffer: BytesMut,
    chunk_size: usize,
    scanner: RecordScanner,
    /// Absolute stream offset of `buffer[0]`
    position: u64,
}

impl RecordSplitter<File> {
    /// Open a file for splitting from its beginning
    pub fn open(path: &Path) -> Result<Self, SplitterError> {
        Ok(RecordSplitter::new(File::open(path)?))
    }
}

impl<R: Read> RecordSplitter<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0, "Precondition: chunk_size must be positive");
        RecordSplitter {
            reader,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            scanner: RecordScanner::new(),
            position: 0,
        }
    }

    /// Next complete record, or `None` if no complete record is available yet
    pub fn get<T: DeserializeOwned>(&mut self) -> Result<Option<T>, SplitterError> {
        Ok(self.get_with_size()?.0)
    }

    /// Like `get`, also returning the raw byte length of the record itself
    /// (whitespace before it is not counted). Size is 0 when no record.
    pub fn get_with_size<T: DeserializeOwned>(
        &mut self,
    ) -> Result<(Option<T>, usize), SplitterError> {
        loop {
            self.skip_whitespace();

            if !self.buffer.is_empty() {
                if let Some(end) = self.scanner.scan(&self.buffer)? {
                    let raw = self.buffer.split_to(end);
                    self.position += end as u64;
                    let value = codec::decode_value(&raw)?;
                    return Ok((Some(value), end));
                }
            }

            if self.fill()? == 0 {
                return Ok((None, 0));
            }
        }
    }

    /// Offset just past the last returned record (plus any whitespace
    /// skipped after it). Reopening at this offset resumes exactly here.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Buffered bytes that do not (yet) form a complete record
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Release the underlying handle
    pub fn close(self) {
        drop(self);
    }

    fn skip_whitespace(&mut self) {
        let skip = self
            .buffer
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        if skip > 0 {
            self.buffer.advance(skip);
            self.position += skip as u64;
        }
    }

    /// Read one chunk from the current handle position. Returns bytes read.
    fn fill(&mut self) -> Result<usize, SplitterError> {
        let start = self.buffer.len();
        self.buffer.resize(start + self.chunk_size, 0);
        loop {
            match self.reader.read(&mut self.buffer[start..]) {
                Ok(n) => {
                    self.buffer.truncate(start + n);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buffer.truncate(start);
                    return Err(SplitterError::Io(e));
                }
            }
        }
    }
}

impl<R: Read + Seek> RecordSplitter<R> {
    /// Start splitting at a known record boundary
    pub fn at_offset(mut reader: R, offset: u64) -> Result<Self, SplitterError> {
        reader.seek(SeekFrom::Start(offset))?;
        let mut splitter = RecordSplitter::new(reader);
        splitter.position = offset;
        Ok(splitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
    }

    fn create_file(content: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data-1.log");
        std::fs::write(&path, content).unwrap();
        Fixture { _dir: dir, path }
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_simple_file() {
        let fixture = create_file("{\n    \"a\": 5,\n    \"b\": \"text\"\n}\n{\n    \"a\": 13\n}\n{}\n");
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 5, "b": "text"})));
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 13})));
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
        splitter.close();
    }

    #[test]
    fn test_empty_file() {
        let fixture = create_file("");
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(splitter.get::<Value>().unwrap(), None);
        assert_eq!(splitter.position(), 0);
    }

    #[test]
    fn test_append() {
        let fixture = create_file(
            r#"
            {
                "a": 5,
                "b": "text"
            }
            {
                "a": 13
            }"#,
        );
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 5, "b": "text"})));
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 13})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);

        append(
            &fixture.path,
            r#"
            {
                "q": 555,
                "r": "something"
            }
            {
                "a": {
                    "b": [1, 2, 3]
                }
            }
            {}"#,
        );
        assert_eq!(
            splitter.get::<Value>().unwrap(),
            Some(json!({"q": 555, "r": "something"}))
        );
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": {"b": [1, 2, 3]}})));
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
    }

    #[test]
    fn test_append_cut_record() {
        let fixture = create_file(
            r#"
            {
                "a": 5,
                "b": "text"
            }
            {
                "a": 1"#,
        );
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 5, "b": "text"})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
        assert!(splitter.pending_bytes() > 0);

        append(
            &fixture.path,
            r#"55,
                "r": "something"
            }
            {
                "a": {
                    "b": [1, 2, 3]
                }
            }"#,
        );
        assert_eq!(
            splitter.get::<Value>().unwrap(),
            Some(json!({"a": 155, "r": "something"}))
        );
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": {"b": [1, 2, 3]}})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
    }

    #[test]
    fn test_big_record() {
        let big_x = "x".repeat(DEFAULT_BUFFER_SIZE * 2);
        let big_y = "y".repeat(DEFAULT_BUFFER_SIZE * 2);
        let content = format!(
            "{{\n    \"a\": 5,\n    \"b\": \"text\"\n}}\n{{\n    \"a\": \"{}\",\n    \"b\": \"{}\"\n}}\n{{}}\n",
            big_x, big_y
        );
        let fixture = create_file(&content);
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"a": 5, "b": "text"})));
        assert_eq!(
            splitter.get::<Value>().unwrap(),
            Some(json!({"a": big_x, "b": big_y}))
        );
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
    }

    #[test]
    fn test_record_straddles_small_buffer() {
        let content = "{\"alpha\": \"0123456789\"}\n{\"beta\": [1, 2, 3]}\n";
        let mut splitter = RecordSplitter::with_buffer_size(content.as_bytes(), 4);
        assert_eq!(
            splitter.get::<Value>().unwrap(),
            Some(json!({"alpha": "0123456789"}))
        );
        assert_eq!(splitter.get::<Value>().unwrap(), Some(json!({"beta": [1, 2, 3]})));
        assert_eq!(splitter.get::<Value>().unwrap(), None);
    }

    #[test]
    fn test_data_size() {
        let object1 = "{\n                \"a\": 5,\n                \"b\": \"text\"\n            }";
        let object2 = "{\n                \"a\": 155,\n                \"r\": \"something\"\n            }";
        let object3 = "{\n                \"a\": {\n                    \"b\": [1, 2, 3]\n                }\n            }";
        let content1 = "\n            {\n                \"a\": 5,\n                \"b\": \"text\"\n            }\n            {\n                \"a\": 1";
        let content2 = "55,\n                \"r\": \"something\"\n            }\n            {\n                \"a\": {\n                    \"b\": [1, 2, 3]\n                }\n            }";

        let fixture = create_file(content1);
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert_eq!(
            splitter.get_with_size::<Value>().unwrap(),
            (Some(json!({"a": 5, "b": "text"})), object1.len())
        );
        assert!(splitter.get_with_size::<Value>().unwrap().0.is_none());

        append(&fixture.path, content2);
        assert_eq!(
            splitter.get_with_size::<Value>().unwrap(),
            (Some(json!({"a": 155, "r": "something"})), object2.len())
        );
        assert_eq!(
            splitter.get_with_size::<Value>().unwrap(),
            (Some(json!({"a": {"b": [1, 2, 3]}})), object3.len())
        );
        assert!(splitter.get_with_size::<Value>().unwrap().0.is_none());
    }

    #[test]
    fn test_split_exactly_at_chunk_boundary() {
        let first = "{\"obj\": {\"type\": \"AssignInt\", \"path\": [\"a\"], \"value\": 5}, \"version\": 1}\n";
        let second = "{\"obj\": {\"type\": \"AssignInt\", \"path\": [\"a\"], \"value\": 7}, \"version\": 2}\n";
        let cut = second.len() / 2;

        let fixture = create_file(&format!("{}{}", first, &second[..cut]));
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        let (_, size1) = splitter.get_with_size::<Value>().unwrap();
        assert_eq!(size1, first.trim_end().len());
        assert_eq!(splitter.get::<Value>().unwrap(), None);

        append(&fixture.path, &second[cut..]);
        let (record, size2) = splitter.get_with_size::<Value>().unwrap();
        assert_eq!(record.unwrap()["version"], 2);
        assert_eq!(size2, second.trim_end().len());
        assert_eq!(
            splitter.position(),
            (first.len() + second.trim_end().len()) as u64
        );
    }

    #[test]
    fn test_at_offset_resumes() {
        let content = "{\"n\": 1}\n{\"n\": 2}\n{\"n\": 3}\n";
        let fixture = create_file(content);
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        splitter.get::<Value>().unwrap();
        let offset = splitter.position();
        splitter.close();

        let file = File::open(&fixture.path).unwrap();
        let mut resumed = RecordSplitter::at_offset(file, offset).unwrap();
        assert_eq!(resumed.get::<Value>().unwrap(), Some(json!({"n": 2})));
        assert_eq!(resumed.get::<Value>().unwrap(), Some(json!({"n": 3})));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let fixture = create_file("{\"n\": 1}\n@@@\n");
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert!(splitter.get::<Value>().unwrap().is_some());
        assert!(matches!(
            splitter.get::<Value>(),
            Err(SplitterError::Codec(CodecError::MalformedRecord(_)))
        ));
    }

    #[test]
    fn test_balanced_but_invalid_is_malformed() {
        let fixture = create_file("{\"n\": }\n");
        let mut splitter = RecordSplitter::open(&fixture.path).unwrap();
        assert!(matches!(
            splitter.get::<Value>(),
            Err(SplitterError::Codec(CodecError::MalformedRecord(_)))
        ));
    }
}
