//! The unit of dispatchable work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::meta::Meta;
use crate::ranges::InclusiveRanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unprocessed,
    Assigned,
    Processing,
    Complete,
    Failed,
    Deleted,
}

impl TaskStatus {
    /// Statuses that still hold ownership and can be released back to the pool.
    pub const ACTIVE: [TaskStatus; 3] = [
        TaskStatus::Unprocessed,
        TaskStatus::Assigned,
        TaskStatus::Processing,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unprocessed => "UNPROCESSED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNPROCESSED" => Ok(TaskStatus::Unprocessed),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "FAILED" => Ok(TaskStatus::Failed),
            "DELETED" => Ok(TaskStatus::Deleted),
            other => Err(Error::Store(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorTask {
    pub id: i64,
    /// Bumped on every write, updates are only applied against the version they were read at.
    pub version: i32,
    pub filter_id: i32,
    pub meta_id: i64,
    /// Serialized [`InclusiveRanges`] when the task covers only part of a unit.
    pub data: Option<String>,
    pub node_name: Option<String>,
    pub feed_name: Option<String>,
    pub status: TaskStatus,
    pub create_time_ms: i64,
    pub status_time_ms: Option<i64>,
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
}

impl ProcessorTask {
    pub fn event_ranges(&self) -> crate::Result<Option<InclusiveRanges>> {
        self.data.as_deref().map(str::parse).transpose()
    }
}

/// A source-data unit selected for tasking, with event ranges when the work is sub-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCandidate {
    pub meta: Meta,
    pub ranges: Option<InclusiveRanges>,
}

impl TaskCandidate {
    pub fn whole(meta: Meta) -> Self {
        Self { meta, ranges: None }
    }
}

/// Outcome of persisting one batch of candidates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedTasks {
    pub total_tasks_created: usize,
    /// Tasks created already owned by this node, ready to queue.
    pub available_tasks_created: usize,
    pub available_tasks: Vec<ProcessorTask>,
    pub event_count: u64,
}
