//! Operation data model
//!
//! One `Operation` is one mutation intent against an attribute of a remote
//! container. The set is closed: every kind is a variant carrying only the
//! fields it needs, and decoding dispatches once on the JSON `"type"` tag.
//!
//! ```text
//! {"obj": {"type": "AssignInt", "path": ["a"], "value": 5}, "version": 1}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of remote container a queue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Run,
    Model,
    ModelVersion,
    Project,
}

impl ContainerType {
    pub const ALL: [ContainerType; 4] = [
        ContainerType::Run,
        ContainerType::Model,
        ContainerType::ModelVersion,
        ContainerType::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Run => "run",
            ContainerType::Model => "model",
            ContainerType::ModelVersion => "model_version",
            ContainerType::Project => "project",
        }
    }

    /// Only runs may be recorded without a remote container
    pub fn supports_offline(&self) -> bool {
        matches!(self, ContainerType::Run)
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContainerType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown container type: {}", s))
    }
}

/// Split a slash-separated attribute path ("metrics/train/loss")
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// One point of a logged series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<T> {
    pub value: T,
    pub step: Option<f64>,
    /// Wall-clock seconds since the Unix epoch
    pub ts: f64,
}

/// A single mutation intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    AssignFloat {
        path: Vec<String>,
        value: f64,
    },
    AssignInt {
        path: Vec<String>,
        value: i64,
    },
    AssignBool {
        path: Vec<String>,
        value: bool,
    },
    AssignString {
        path: Vec<String>,
        value: String,
    },
    /// Milliseconds since the Unix epoch
    AssignDatetime {
        path: Vec<String>,
        value: i64,
    },
    LogFloats {
        path: Vec<String>,
        values: Vec<LogEntry<f64>>,
    },
    LogStrings {
        path: Vec<String>,
        values: Vec<LogEntry<String>>,
    },
    ClearFloatLog {
        path: Vec<String>,
    },
    ClearStringLog {
        path: Vec<String>,
    },
    ConfigFloatSeries {
        path: Vec<String>,
        min: Option<f64>,
        max: Option<f64>,
        unit: Option<String>,
    },
    AddStrings {
        path: Vec<String>,
        values: Vec<String>,
    },
    RemoveStrings {
        path: Vec<String>,
        values: Vec<String>,
    },
    ClearStringSet {
        path: Vec<String>,
    },
    DeleteFiles {
        path: Vec<String>,
        file_paths: Vec<String>,
    },
    DeleteAttribute {
        path: Vec<String>,
    },
    /// Copies the source attribute's value as of this operation's position
    /// in the queue; every earlier operation has been applied by then.
    CopyAttribute {
        path: Vec<String>,
        container_id: String,
        container_type: ContainerType,
        source_path: Vec<String>,
        source_attr_name: String,
    },
}

impl Operation {
    /// Target attribute path
    pub fn path(&self) -> &[String] {
        match self {
            Operation::AssignFloat { path, .. }
            | Operation::AssignInt { path, .. }
            | Operation::AssignBool { path, .. }
            | Operation::AssignString { path, .. }
            | Operation::AssignDatetime { path, .. }
            | Operation::LogFloats { path, .. }
            | Operation::LogStrings { path, .. }
            | Operation::ClearFloatLog { path }
            | Operation::ClearStringLog { path }
            | Operation::ConfigFloatSeries { path, .. }
            | Operation::AddStrings { path, .. }
            | Operation::RemoveStrings { path, .. }
            | Operation::ClearStringSet { path }
            | Operation::DeleteFiles { path, .. }
            | Operation::DeleteAttribute { path }
            | Operation::CopyAttribute { path, .. } => path,
        }
    }

    /// The `"type"` tag as written to disk
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::AssignFloat { .. } => "AssignFloat",
            Operation::AssignInt { .. } => "AssignInt",
            Operation::AssignBool { .. } => "AssignBool",
            Operation::AssignString { .. } => "AssignString",
            Operation::AssignDatetime { .. } => "AssignDatetime",
            Operation::LogFloats { .. } => "LogFloats",
            Operation::LogStrings { .. } => "LogStrings",
            Operation::ClearFloatLog { .. } => "ClearFloatLog",
            Operation::ClearStringLog { .. } => "ClearStringLog",
            Operation::ConfigFloatSeries { .. } => "ConfigFloatSeries",
            Operation::AddStrings { .. } => "AddStrings",
            Operation::RemoveStrings { .. } => "RemoveStrings",
            Operation::ClearStringSet { .. } => "ClearStringSet",
            Operation::DeleteFiles { .. } => "DeleteFiles",
            Operation::DeleteAttribute { .. } => "DeleteAttribute",
            Operation::CopyAttribute { .. } => "CopyAttribute",
        }
    }

    /// JSON has no representation for NaN/inf; such a record could never be
    /// read back.
    pub fn has_non_finite(&self) -> bool {
        let bad = |v: f64| !v.is_finite();
        let bad_opt = |v: Option<f64>| v.map(bad).unwrap_or(false);
        match self {
            Operation::AssignFloat { value, .. } => bad(*value),
            Operation::LogFloats { values, .. } => values
                .iter()
                .any(|e| bad(e.value) || bad(e.ts) || bad_opt(e.step)),
            Operation::LogStrings { values, .. } => {
                values.iter().any(|e| bad(e.ts) || bad_opt(e.step))
            }
            Operation::ConfigFloatSeries { min, max, .. } => bad_opt(*min) || bad_opt(*max),
            _ => false,
        }
    }
}

/// An operation with its assigned queue version. This is the on-disk record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub obj: Operation,
    pub version: u64,
}

impl QueuedOperation {
    pub fn new(obj: Operation, version: u64) -> Self {
        QueuedOperation { obj, version }
    }
}
