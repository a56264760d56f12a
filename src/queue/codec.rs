//! Record Codec
//!
//! A record is one JSON object on its own line:
//!
//! ```text
//! {"obj":{"type":"AssignInt","path":["a"],"value":5},"version":1}\n
//! ```
//!
//! Records carry no length prefix. A reader finds the end of a record by
//! scanning for the brace that closes the opening `{`, skipping braces that
//! appear inside string literals. Whitespace between records is ignored.

use crate::queue::operation::QueuedOperation;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for record encoding/decoding
#[derive(Debug)]
pub enum CodecError {
    /// Bytes claimed to be a complete record do not parse as one.
    /// On disk this means corruption; readers must stop, not skip.
    MalformedRecord(String),
    /// The value cannot be represented as a record
    Serialize(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedRecord(msg) => write!(f, "Malformed record: {}", msg),
            CodecError::Serialize(msg) => write!(f, "Cannot encode record: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode one record followed by a newline separator
pub fn encode(record: &QueuedOperation) -> Result<Vec<u8>, CodecError> {
    if record.obj.has_non_finite() {
        return Err(CodecError::Serialize(format!(
            "{} at version {} contains a non-finite float",
            record.obj.kind(),
            record.version
        )));
    }
    let mut buf = encode_value(record)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encode any serializable value as a compact JSON record (no separator)
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let buf = serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    debug_assert!(
        buf.first() == Some(&b'{'),
        "Postcondition: records must be JSON objects"
    );
    Ok(buf)
}

/// Decode exactly one queue record
pub fn decode(bytes: &[u8]) -> Result<QueuedOperation, CodecError> {
    decode_value(bytes)
}

/// Decode exactly one complete JSON value; surrounding whitespace is allowed
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| {
        CodecError::MalformedRecord(format!("{} ({} bytes)", e, bytes.len()))
    })
}

/// Find the end (exclusive) of the record starting at `buf[0]`.
/// `Ok(None)` means the record is not complete yet.
pub fn find_record_end(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    RecordScanner::new().scan(buf)
}

/// Resumable balanced-brace scanner.
///
/// Keeps its position and nesting state between calls, so a record that
/// arrives in many small appends is scanned once in total rather than once
/// per append. The buffer passed to `scan` must always start at the same
/// record start and only grow.
#[derive(Debug, Clone, Default)]
pub struct RecordScanner {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget progress; the next `scan` starts a new record
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        debug_assert!(
            self.pos <= buf.len(),
            "Precondition: buffer must not shrink while scanning a record"
        );

        if self.pos == 0 {
            match buf.first() {
                None => return Ok(None),
                Some(b'{') => {
                    self.depth = 1;
                    self.pos = 1;
                }
                Some(other) => {
                    return Err(CodecError::MalformedRecord(format!(
                        "record must start with '{{', found byte 0x{:02x}",
                        other
                    )))
                }
            }
        }

        while self.pos < buf.len() {
            if self.escaped {
                self.escaped = false;
                self.pos += 1;
                continue;
            }

            let rest = &buf[self.pos..];
            if self.in_string {
                match memchr::memchr2(b'"', b'\\', rest) {
                    None => {
                        self.pos = buf.len();
                    }
                    Some(i) => {
                        if rest[i] == b'\\' {
                            self.escaped = true;
                        } else {
                            self.in_string = false;
                        }
                        self.pos += i + 1;
                    }
                }
                continue;
            }

            match memchr::memchr3(b'{', b'}', b'"', rest) {
                None => {
                    self.pos = buf.len();
                }
                Some(i) => {
                    match rest[i] {
                        b'{' => self.depth += 1,
                        b'}' => self.depth -= 1,
                        _ => self.in_string = true,
                    }
                    self.pos += i + 1;
                    if self.depth == 0 {
                        let end = self.pos;
                        self.reset();
                        return Ok(Some(end));
                    }
                }
            }
        }

        Ok(None)
    }
}
