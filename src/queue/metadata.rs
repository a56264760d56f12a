//! Queue metadata files
//!
//! | File | Content |
//! |------|---------|
//! | `last_put_version` | highest appended version, plain integer |
//! | `last_ack_version` | highest acknowledged version, plain integer |
//! | `ack_checkpoint.json` | `{segment, offset, version}` resume cursor |
//! | `metadata.json` | container identity and queue mode |
//!
//! All of them are replaced atomically through the store.

use crate::queue::codec::{self, CodecError};
use crate::queue::disk_queue::QueueError;
use crate::queue::layout::QueueMode;
use crate::queue::operation::ContainerType;
use crate::queue::store::SegmentStore;
use serde::{Deserialize, Serialize};

pub const LAST_PUT_VERSION_FILE: &str = "last_put_version";
pub const LAST_ACK_VERSION_FILE: &str = "last_ack_version";
pub const CHECKPOINT_FILE: &str = "ack_checkpoint.json";
pub const METADATA_FILE: &str = "metadata.json";

pub const FORMAT_VERSION: u32 = 1;

/// Read a plain-integer version file; `None` when absent
pub fn read_version<S: SegmentStore>(store: &S, name: &str) -> Result<Option<u64>, QueueError> {
    let Some(raw) = store.read_file(name)? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| {
        QueueError::Codec(CodecError::MalformedRecord(format!(
            "{} holds {:?}, expected an integer",
            name, text
        )))
    })
}

pub fn write_version<S: SegmentStore>(store: &S, name: &str, version: u64) -> Result<(), QueueError> {
    store.write_file_atomic(name, version.to_string().as_bytes())?;
    Ok(())
}

/// Resume cursor: byte offset just past the record with `version`
/// inside segment `data-<segment>.log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCheckpoint {
    pub segment: u64,
    pub offset: u64,
    pub version: u64,
}

pub fn read_checkpoint<S: SegmentStore>(store: &S) -> Result<Option<AckCheckpoint>, QueueError> {
    match store.read_file(CHECKPOINT_FILE)? {
        Some(raw) => Ok(Some(codec::decode_value(&raw)?)),
        None => Ok(None),
    }
}

pub fn write_checkpoint<S: SegmentStore>(
    store: &S,
    checkpoint: &AckCheckpoint,
) -> Result<(), QueueError> {
    store.write_file_atomic(CHECKPOINT_FILE, &codec::encode_value(checkpoint)?)?;
    Ok(())
}

/// Identity of the container a queue belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetadata {
    pub format_version: u32,
    pub container_type: ContainerType,
    /// Remote id for async queues, local id for offline ones
    pub container_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub mode: QueueMode,
    /// Remote id assigned when an offline queue was registered by sync
    #[serde(default)]
    pub registered_id: Option<String>,
    pub created_at_ms: u64,
}

impl QueueMetadata {
    pub fn online(
        container_type: ContainerType,
        container_id: impl Into<String>,
        execution_id: impl Into<String>,
        project: Option<String>,
    ) -> Self {
        QueueMetadata {
            format_version: FORMAT_VERSION,
            container_type,
            container_id: container_id.into(),
            execution_id: Some(execution_id.into()),
            project,
            mode: QueueMode::Async,
            registered_id: None,
            created_at_ms: crate::queue::layout::now_millis(),
        }
    }

    pub fn offline(
        container_type: ContainerType,
        local_id: impl Into<String>,
        project: Option<String>,
    ) -> Self {
        QueueMetadata {
            format_version: FORMAT_VERSION,
            container_type,
            container_id: local_id.into(),
            execution_id: None,
            project,
            mode: QueueMode::Offline,
            registered_id: None,
            created_at_ms: crate::queue::layout::now_millis(),
        }
    }

    /// Remote container id, if the queue has one
    pub fn remote_id(&self) -> Option<&str> {
        match self.mode {
            QueueMode::Async => Some(&self.container_id),
            QueueMode::Offline => self.registered_id.as_deref(),
        }
    }

    pub fn read<S: SegmentStore>(store: &S) -> Result<Option<Self>, QueueError> {
        match store.read_file(METADATA_FILE)? {
            Some(raw) => Ok(Some(codec::decode_value(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn write<S: SegmentStore>(&self, store: &S) -> Result<(), QueueError> {
        debug_assert!(
            !self.container_id.is_empty(),
            "Precondition: container id must not be empty"
        );
        let mut raw = codec::encode_value(self)?;
        raw.push(b'\n');
        store.write_file_atomic(METADATA_FILE, &raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::InMemorySegmentStore;

    #[test]
    fn test_version_files() {
        let store = InMemorySegmentStore::new();
        assert_eq!(read_version(&store, LAST_PUT_VERSION_FILE).unwrap(), None);

        write_version(&store, LAST_PUT_VERSION_FILE, 17).unwrap();
        assert_eq!(
            store.get_file_data(LAST_PUT_VERSION_FILE).unwrap(),
            b"17".to_vec()
        );
        assert_eq!(read_version(&store, LAST_PUT_VERSION_FILE).unwrap(), Some(17));
    }

    #[test]
    fn test_version_file_tolerates_newline() {
        let store = InMemorySegmentStore::new();
        store.write_file_atomic(LAST_ACK_VERSION_FILE, b"5\n").unwrap();
        assert_eq!(read_version(&store, LAST_ACK_VERSION_FILE).unwrap(), Some(5));
    }

    #[test]
    fn test_version_file_garbage() {
        let store = InMemorySegmentStore::new();
        store.write_file_atomic(LAST_PUT_VERSION_FILE, b"five").unwrap();
        assert!(matches!(
            read_version(&store, LAST_PUT_VERSION_FILE),
            Err(QueueError::Codec(CodecError::MalformedRecord(_)))
        ));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = InMemorySegmentStore::new();
        assert!(read_checkpoint(&store).unwrap().is_none());
        let cp = AckCheckpoint {
            segment: 1,
            offset: 312,
            version: 4,
        };
        write_checkpoint(&store, &cp).unwrap();
        assert_eq!(read_checkpoint(&store).unwrap(), Some(cp));
    }

    #[test]
    fn test_metadata_remote_id() {
        let online = QueueMetadata::online(ContainerType::Model, "MOD-1", "e1", None);
        assert_eq!(online.remote_id(), Some("MOD-1"));

        let mut offline = QueueMetadata::offline(ContainerType::Run, "abc", Some("ws/proj".into()));
        assert_eq!(offline.remote_id(), None);
        offline.registered_id = Some("RUN-9".into());
        assert_eq!(offline.remote_id(), Some("RUN-9"));

        let store = InMemorySegmentStore::new();
        offline.write(&store).unwrap();
        assert_eq!(QueueMetadata::read(&store).unwrap(), Some(offline));
    }
}
