//! Durable task and tracker records. Every ownership change goes through a version-checked write.

use std::collections::HashSet;

use crate::Result;
use crate::criteria::{FindTaskCriteria, ProcessorTaskSummary, ResultPage};
use crate::filter::ProcessorFilter;
use crate::task::{CreatedTasks, ProcessorTask, TaskCandidate, TaskStatus};
use crate::tracker::ProcessorFilterTracker;

pub mod in_memory;

/// One batch of candidates to persist for a filter.
#[derive(Debug, Clone)]
pub struct NewTasks<'a> {
    pub filter: &'a ProcessorFilter,
    /// Tracker as read by the caller, written back advanced in the same transaction.
    pub tracker: ProcessorFilterTracker,
    pub candidates: Vec<TaskCandidate>,
    pub node_name: &'a str,
    pub stream_query_time_ms: i64,
    pub max_meta_id: Option<i64>,
    /// Take ownership of tasks whose source data is already unlocked.
    pub assign_new_tasks: bool,
}

#[trait_variant::make(Send)]
pub trait TaskStore: Clone + Send + Sync + 'static {
    /// Inserts one task per candidate and advances the tracker, all or nothing.
    async fn create_tasks(&self, request: NewTasks<'_>) -> Result<CreatedTasks>;

    async fn find(&self, criteria: &FindTaskCriteria) -> Result<ResultPage<ProcessorTask>>;

    async fn find_summary(
        &self,
        criteria: &FindTaskCriteria,
    ) -> Result<ResultPage<ProcessorTaskSummary>>;

    /// Returns `None` when the task is gone, deleted, or could not be updated after the
    /// configured number of conflicting attempts.
    async fn change_task_status(
        &self,
        task: &ProcessorTask,
        node_name: Option<&str>,
        status: TaskStatus,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
    ) -> Result<Option<ProcessorTask>>;

    /// Marks unprocessed tasks assigned to `node_name`. Tasks that could not be moved are left
    /// out of the result.
    async fn assign_tasks(&self, ids: &[i64], node_name: &str) -> Result<Vec<ProcessorTask>>;

    /// Takes ownership of unprocessed, unowned tasks so they can be queued on this node.
    async fn queue_existing_tasks(
        &self,
        ids: &[i64],
        node_name: &str,
    ) -> Result<Vec<ProcessorTask>>;

    /// Returns active tasks back to unprocessed and unowned.
    async fn release_tasks(&self, ids: &[i64]) -> Result<u64>;

    async fn release_owned_tasks(&self, node_name: &str) -> Result<u64>;

    /// Releases active tasks owned by any node outside `retain_nodes` whose status is older
    /// than `status_older_than_ms`.
    async fn retain_owned_tasks(
        &self,
        retain_nodes: &HashSet<String>,
        status_older_than_ms: i64,
    ) -> Result<u64>;

    async fn logical_delete_by_filter(&self, filter_id: i32) -> Result<u64>;

    async fn logical_delete_by_processor(&self, processor_id: i32) -> Result<u64>;

    /// Logically deletes tasks of filters deleted before `threshold_ms`.
    async fn logical_delete_for_deleted_filters(&self, threshold_ms: i64) -> Result<u64>;

    /// Removes finished or deleted tasks whose status is older than `threshold_ms` or unset.
    async fn physically_delete_old_tasks(&self, threshold_ms: i64) -> Result<u64>;

    /// Loads the tracker of a filter, creating an empty one on first use.
    async fn load_tracker(&self, filter_id: i32) -> Result<ProcessorFilterTracker>;

    /// Version-checked write, returns the tracker at its new version.
    async fn update_tracker(
        &self,
        tracker: ProcessorFilterTracker,
    ) -> Result<ProcessorFilterTracker>;
}
