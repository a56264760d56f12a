//! Fault identifiers
//!
//! Naming: `<layer>.<fault>`. Each id is a stable key into `FaultConfig`.

/// Segment store faults
pub mod disk {
    pub const WRITE_FAIL: &str = "disk.write_fail";
    pub const PARTIAL_WRITE: &str = "disk.partial_write";
    pub const FSYNC_FAIL: &str = "disk.fsync_fail";
    pub const DISK_FULL: &str = "disk.full";
}

/// Remote backend faults
pub mod remote {
    /// Backend temporarily unreachable (retryable)
    pub const UNAVAILABLE: &str = "remote.unavailable";
    /// Backend permanently rejects the operation (fatal for that op)
    pub const REJECT: &str = "remote.reject";
    /// Submission takes noticeably long
    pub const SLOW_SUBMIT: &str = "remote.slow_submit";
}

/// Process-level faults driven by the DST harness
pub mod process {
    /// Consumer replaced mid-drain (simulated crash + restart)
    pub const CONSUMER_CRASH: &str = "process.consumer_crash";
}

pub const ALL_FAULTS: &[&str] = &[
    disk::WRITE_FAIL,
    disk::PARTIAL_WRITE,
    disk::FSYNC_FAIL,
    disk::DISK_FULL,
    remote::UNAVAILABLE,
    remote::REJECT,
    remote::SLOW_SUBMIT,
    process::CONSUMER_CRASH,
];
