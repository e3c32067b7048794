//! Core domain enumerations for the task queue.
//!
//! These are closed sets by design (see `DESIGN.md`): adding a resource
//! group or operation type is a code change at every layer, not a runtime
//! registration. Each enum supports `encode`/`decode` string round-trips so
//! the store can persist them as plain `TEXT` columns while staying
//! forward-compatible with unseen values on read.
//!
//! # Examples
//!
//! ```rust
//! use taskcore::types::{ResourceGroup, OperationType, TaskStatus};
//!
//! let group = ResourceGroup::Filesystem;
//! assert_eq!(group.encode(), "filesystem");
//! assert_eq!(ResourceGroup::decode("filesystem"), Some(ResourceGroup::Filesystem));
//!
//! assert!(TaskStatus::Pending.is_active());
//! assert!(!TaskStatus::Completed.is_active());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A partition of work sharing one queue, one worker pool, one breaker, and
/// one throttle. Closed enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceGroup {
    Filesystem,
    Network,
    Computation,
    MemoryIntensive,
}

impl ResourceGroup {
    /// All groups, in a stable order used for iteration (e.g. when spinning
    /// up one dispatch loop per group).
    pub const ALL: [ResourceGroup; 4] = [
        ResourceGroup::Filesystem,
        ResourceGroup::Network,
        ResourceGroup::Computation,
        ResourceGroup::MemoryIntensive,
    ];

    /// Encode for persistence as a stable lowercase-hyphen string.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ResourceGroup::Filesystem => "filesystem",
            ResourceGroup::Network => "network",
            ResourceGroup::Computation => "computation",
            ResourceGroup::MemoryIntensive => "memory-intensive",
        }
    }

    /// Decode a persisted string back into a `ResourceGroup`.
    ///
    /// Returns `None` for unrecognized values rather than silently falling
    /// back: resource groups are a closed set and a miss almost certainly
    /// indicates schema drift, which callers should surface as an error.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "filesystem" => Some(ResourceGroup::Filesystem),
            "network" => Some(ResourceGroup::Network),
            "computation" => Some(ResourceGroup::Computation),
            "memory-intensive" => Some(ResourceGroup::MemoryIntensive),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<&str> for ResourceGroup {
    /// Falls back to `Computation` for unrecognized input. Prefer
    /// [`ResourceGroup::decode`] wherever an unrecognized value should be an
    /// error instead of a silent default.
    fn from(s: &str) -> Self {
        ResourceGroup::decode(s).unwrap_or(ResourceGroup::Computation)
    }
}

/// Informational tag describing the semantic intent of a task's operation.
/// Does not affect scheduling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    FileRead,
    FileWrite,
    DirectoryList,
    FindFiles,
    NetworkRequest,
    Computation,
    MemoryOperation,
}

impl OperationType {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            OperationType::FileRead => "file-read",
            OperationType::FileWrite => "file-write",
            OperationType::DirectoryList => "directory-list",
            OperationType::FindFiles => "find-files",
            OperationType::NetworkRequest => "network-request",
            OperationType::Computation => "computation",
            OperationType::MemoryOperation => "memory-operation",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "file-read" => Some(OperationType::FileRead),
            "file-write" => Some(OperationType::FileWrite),
            "directory-list" => Some(OperationType::DirectoryList),
            "find-files" => Some(OperationType::FindFiles),
            "network-request" => Some(OperationType::NetworkRequest),
            "computation" => Some(OperationType::Computation),
            "memory-operation" => Some(OperationType::MemoryOperation),
            _ => None,
        }
    }

    /// The resource group a given operation type naturally belongs to.
    /// Submission helpers use this to pick the internal queue when the
    /// caller does not pick a group explicitly.
    #[must_use]
    pub fn default_group(&self) -> ResourceGroup {
        match self {
            OperationType::FileRead | OperationType::FileWrite => ResourceGroup::Filesystem,
            OperationType::DirectoryList | OperationType::FindFiles => ResourceGroup::Filesystem,
            OperationType::NetworkRequest => ResourceGroup::Network,
            OperationType::Computation => ResourceGroup::Computation,
            OperationType::MemoryOperation => ResourceGroup::MemoryIntensive,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Lifecycle status of a task. `Retry` is deliberately absent here: it is a
/// transition argument, never an at-rest status — a retried task settles
/// back to [`TaskStatus::Pending`] with `retry_count` incremented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are monotonic: once reached, no further status
    /// transition is valid except an administrative purge.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_group_round_trips() {
        for g in ResourceGroup::ALL {
            assert_eq!(ResourceGroup::decode(g.encode()), Some(g));
        }
    }

    #[test]
    fn operation_type_round_trips() {
        let all = [
            OperationType::FileRead,
            OperationType::FileWrite,
            OperationType::DirectoryList,
            OperationType::FindFiles,
            OperationType::NetworkRequest,
            OperationType::Computation,
            OperationType::MemoryOperation,
        ];
        for op in all {
            assert_eq!(OperationType::decode(op.encode()), Some(op));
        }
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn unknown_resource_group_is_rejected_by_decode() {
        assert_eq!(ResourceGroup::decode("gpu"), None);
    }

    #[test]
    fn operation_type_default_group_matches_expectations() {
        assert_eq!(
            OperationType::NetworkRequest.default_group(),
            ResourceGroup::Network
        );
        assert_eq!(
            OperationType::MemoryOperation.default_group(),
            ResourceGroup::MemoryIntensive
        );
    }
}
