//! Segment naming
//!
//! A segment is named after the first version it holds: `data-<N>.log`.
//! Listing parses the names and orders them numerically, so `data-10.log`
//! comes after `data-9.log`.

use crate::queue::store::{SegmentStore, StoreError};

const SEGMENT_PREFIX: &str = "data-";
const SEGMENT_SUFFIX: &str = ".log";

pub fn segment_file_name(first_version: u64) -> String {
    debug_assert!(first_version > 0, "Precondition: versions start at 1");
    format!("{}{}{}", SEGMENT_PREFIX, first_version, SEGMENT_SUFFIX)
}

/// First version encoded in a segment file name, `None` for other files
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&v| v > 0)
}

/// First versions of all segments in ascending order
pub fn list_segments<S: SegmentStore>(store: &S) -> Result<Vec<u64>, StoreError> {
    let mut segments: Vec<u64> = store
        .list()?
        .iter()
        .filter_map(|name| parse_segment_name(name))
        .collect();
    segments.sort_unstable();
    Ok(segments)
}

/// The segment following `first_version`, if one exists yet
pub fn next_segment<S: SegmentStore>(
    store: &S,
    first_version: u64,
) -> Result<Option<u64>, StoreError> {
    Ok(list_segments(store)?
        .into_iter()
        .find(|&s| s > first_version))
}
