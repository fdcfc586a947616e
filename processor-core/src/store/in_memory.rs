//! In-memory processor database. Holds tasks, trackers and filters behind one lock so that
//! joins and "transactions" behave like the relational store would.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::retry::{Retry, RetryError};
use backoff::strategy::fixed;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::config::BATCH_SIZE;
use crate::criteria::{
    FindTaskCriteria, ProcessorTaskSummary, ResultPage, SortField, TaskPredicate,
};
use crate::filter::ProcessorFilter;
use crate::meta::MetaStatus;
use crate::registry::{FilterRegistry, FindFilterCriteria};
use crate::store::{NewTasks, TaskStore};
use crate::task::{CreatedTasks, ProcessorTask, TaskStatus};
use crate::tracker::{CreationProgress, ProcessorFilterTracker};
use crate::{Error, Result, now_ms};

#[derive(Debug, Default)]
struct Tables {
    tasks: BTreeMap<i64, ProcessorTask>,
    last_task_id: i64,
    trackers: HashMap<i32, ProcessorFilterTracker>,
    last_tracker_id: i32,
    filters: BTreeMap<i32, ProcessorFilter>,
    pipelines: HashMap<String, String>,
}

impl Tables {
    fn filter_of(&self, task: &ProcessorTask) -> Option<&ProcessorFilter> {
        self.filters.get(&task.filter_id)
    }

    fn matches(&self, task: &ProcessorTask, predicate: &TaskPredicate) -> bool {
        match predicate {
            TaskPredicate::IdGreaterThan(id) => task.id > *id,
            TaskPredicate::IdIn(ids) => ids.contains(&task.id),
            TaskPredicate::Status(statuses) => statuses.contains(&task.status),
            TaskPredicate::Node(node) => task.node_name.as_deref() == node.as_deref(),
            TaskPredicate::FilterId(id) => task.filter_id == *id,
            TaskPredicate::ProcessorId(id) => {
                self.filter_of(task).is_some_and(|f| f.processor_id == *id)
            }
            TaskPredicate::MetaId(id) => task.meta_id == *id,
            TaskPredicate::Feed(feed) => task.feed_name.as_deref() == Some(feed.as_str()),
            TaskPredicate::Pipeline(uuid) => {
                self.filter_of(task).is_some_and(|f| &f.pipeline_uuid == uuid)
            }
            TaskPredicate::Priority(priority) => {
                self.filter_of(task).is_some_and(|f| f.priority == *priority)
            }
            TaskPredicate::CreateTime(range) => range.contains(Some(task.create_time_ms)),
            TaskPredicate::StatusTime(range) => range.contains(task.status_time_ms),
            TaskPredicate::StartTime(range) => range.contains(task.start_time_ms),
            TaskPredicate::EndTime(range) => range.contains(task.end_time_ms),
        }
    }

    fn select(&self, criteria: &FindTaskCriteria) -> Vec<&ProcessorTask> {
        let mut rows: Vec<&ProcessorTask> = self
            .tasks
            .values()
            .filter(|task| criteria.predicates.iter().all(|p| self.matches(task, p)))
            .collect();
        rows.sort_by(|a, b| {
            criteria
                .sort
                .iter()
                .map(|sort| {
                    let ordering = self.compare(a, b, sort.field);
                    if sort.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.id.cmp(&b.id))
        });
        rows
    }

    fn compare(&self, a: &ProcessorTask, b: &ProcessorTask, field: SortField) -> Ordering {
        match field {
            SortField::Id => a.id.cmp(&b.id),
            SortField::CreateTime => a.create_time_ms.cmp(&b.create_time_ms),
            SortField::StatusTime => a.status_time_ms.cmp(&b.status_time_ms),
            SortField::Status => a.status.cmp(&b.status),
            SortField::Priority => {
                let priority = |t: &ProcessorTask| self.filter_of(t).map(|f| f.priority);
                priority(a).cmp(&priority(b))
            }
        }
    }

    /// UNPROCESSED and ASSIGNED tasks matching `pred` become DELETED.
    fn logical_delete(&mut self, pred: impl Fn(&ProcessorTask) -> bool) -> u64 {
        let now = now_ms();
        let mut deleted = 0;
        for task in self.tasks.values_mut().filter(|t| {
            matches!(t.status, TaskStatus::Unprocessed | TaskStatus::Assigned) && pred(t)
        }) {
            task.status = TaskStatus::Deleted;
            task.version += 1;
            task.status_time_ms = Some(now);
            deleted += 1;
        }
        deleted
    }
}

#[derive(Debug, thiserror::Error)]
enum StatusChangeError {
    #[error("task {id} is at version {found}, expected {expected}")]
    Conflict { id: i64, expected: i32, found: i32 },
}

/// In-memory processor database.
#[derive(Debug, Clone)]
pub struct InMemoryProcessorDb {
    inner: Arc<Mutex<Tables>>,
    status_update_attempts: usize,
    status_update_backoff: Duration,
    /// Makes the next `create_tasks` hand one fresh row to another node before selecting back.
    #[cfg(test)]
    steal_after_insert: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for InMemoryProcessorDb {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(1000))
    }
}

impl InMemoryProcessorDb {
    pub fn new(status_update_attempts: usize, status_update_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Tables::default())),
            status_update_attempts,
            status_update_backoff,
            #[cfg(test)]
            steal_after_insert: Arc::default(),
        }
    }

    pub fn save_filter(&self, filter: ProcessorFilter) {
        self.inner.lock().filters.insert(filter.id, filter);
    }

    pub fn save_pipeline(&self, pipeline_uuid: &str, name: &str) {
        self.inner
            .lock()
            .pipelines
            .insert(pipeline_uuid.to_string(), name.to_string());
    }

    pub fn task(&self, id: i64) -> Option<ProcessorTask> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn steal_next_insert(&self) {
        self.steal_after_insert
            .store(true, std::sync::atomic::Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_status_time(&self, id: i64, status_time_ms: Option<i64>) {
        if let Some(task) = self.inner.lock().tasks.get_mut(&id) {
            task.status_time_ms = status_time_ms;
        }
    }

    /// One optimistic attempt. `expected_version` is only checked on the first attempt,
    /// retries re-read the row and apply against whatever version is current.
    fn try_change_status(
        &self,
        task_id: i64,
        expected_version: Option<i32>,
        node_name: Option<&str>,
        status: TaskStatus,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
    ) -> std::result::Result<Option<ProcessorTask>, StatusChangeError> {
        let mut tables = self.inner.lock();
        let Some(row) = tables.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if row.status == TaskStatus::Deleted {
            return Ok(None);
        }
        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(StatusChangeError::Conflict {
                    id: task_id,
                    expected,
                    found: row.version,
                });
            }
        }
        row.node_name = node_name.map(str::to_string);
        row.status = status;
        row.status_time_ms = Some(now_ms());
        row.start_time_ms = start_time_ms;
        row.end_time_ms = end_time_ms;
        row.version += 1;
        Ok(Some(row.clone()))
    }

    /// Releases matching active tasks one row at a time, each update guarded by the version and
    /// status it was selected with.
    fn release_where(&self, pred: impl Fn(&ProcessorTask) -> bool) -> u64 {
        let mut after = Bound::Unbounded;
        let mut released = 0;
        loop {
            let batch: Vec<(i64, i32, TaskStatus)> = self
                .inner
                .lock()
                .tasks
                .range((after, Bound::Unbounded))
                .map(|(_, task)| task)
                .filter(|task| task.status.is_active() && pred(task))
                .take(BATCH_SIZE)
                .map(|task| (task.id, task.version, task.status))
                .collect();

            for (id, version, status) in &batch {
                let mut tables = self.inner.lock();
                let Some(row) = tables.tasks.get_mut(id) else {
                    continue;
                };
                if row.version != *version || row.status != *status {
                    trace!(task_id = id, "Task changed while releasing, skipping");
                    continue;
                }
                row.status = TaskStatus::Unprocessed;
                row.node_name = None;
                row.status_time_ms = Some(now_ms());
                row.version += 1;
                released += 1;
            }

            match batch.last() {
                Some((last_id, _, _)) if batch.len() == BATCH_SIZE => {
                    after = Bound::Excluded(*last_id)
                }
                _ => break,
            }
        }
        released
    }

    fn logical_delete_existing_filter(&self, filter_id: i32) -> Result<u64> {
        let mut tables = self.inner.lock();
        if !tables.filters.contains_key(&filter_id) {
            return Err(Error::Integrity(format!(
                "filter {filter_id} removed while deleting its tasks"
            )));
        }
        Ok(tables.logical_delete(|task| task.filter_id == filter_id))
    }
}

impl TaskStore for InMemoryProcessorDb {
    async fn create_tasks(&self, request: NewTasks<'_>) -> Result<CreatedTasks> {
        let now = now_ms();
        let filter_id = request.filter.id;
        let mut guard = self.inner.lock();
        let tables = &mut *guard;

        let stored_version = tables.trackers.get(&filter_id).map(|t| t.version);
        if stored_version.is_some_and(|v| v != request.tracker.version) {
            return Err(Error::OptimisticLock(format!(
                "tracker of filter {filter_id} changed, expected version {}",
                request.tracker.version
            )));
        }

        let mut progress = CreationProgress::default();
        let mut available_tasks_created = 0;
        let first_id = tables.last_task_id + 1;
        for candidate in &request.candidates {
            progress.record(&candidate.meta, candidate.ranges.as_ref());
            let owned =
                request.assign_new_tasks && candidate.meta.status == MetaStatus::Unlocked;
            if owned {
                available_tasks_created += 1;
            }
            tables.last_task_id += 1;
            let task = ProcessorTask {
                id: tables.last_task_id,
                version: 1,
                filter_id,
                meta_id: candidate.meta.id,
                data: candidate
                    .ranges
                    .as_ref()
                    .filter(|r| !r.is_empty())
                    .map(ToString::to_string),
                node_name: owned.then(|| request.node_name.to_string()),
                feed_name: Some(candidate.meta.feed_name.clone()),
                status: TaskStatus::Unprocessed,
                create_time_ms: now,
                status_time_ms: Some(now),
                start_time_ms: None,
                end_time_ms: None,
            };
            tables.tasks.insert(task.id, task);
        }

        #[cfg(test)]
        if self
            .steal_after_insert
            .swap(false, std::sync::atomic::Ordering::AcqRel)
        {
            if let Some(row) = tables
                .tasks
                .range_mut(first_id..)
                .map(|(_, task)| task)
                .find(|task| task.node_name.is_some())
            {
                row.node_name = Some("elsewhere".to_string());
            }
        }

        let available_tasks: Vec<ProcessorTask> = tables
            .tasks
            .range(first_id..)
            .map(|(_, task)| task)
            .filter(|task| {
                task.filter_id == filter_id
                    && task.create_time_ms == now
                    && task.status == TaskStatus::Unprocessed
                    && task.node_name.as_deref() == Some(request.node_name)
            })
            .cloned()
            .collect();

        if available_tasks.len() != available_tasks_created {
            // roll back the inserts, the tracker has not been touched yet
            let inserted: Vec<i64> = tables.tasks.range(first_id..).map(|(id, _)| *id).collect();
            for id in inserted {
                tables.tasks.remove(&id);
            }
            return Err(Error::InsertSelectMismatch {
                expected: available_tasks_created,
                selected: available_tasks.len(),
            });
        }

        let mut tracker = request.tracker;
        tracker.advance(
            request.filter,
            &progress,
            request.stream_query_time_ms,
            request.max_meta_id,
            now,
        );
        if tracker.id == 0 {
            tables.last_tracker_id += 1;
            tracker.id = tables.last_tracker_id;
        }
        tracker.version += 1;
        tables.trackers.insert(filter_id, tracker);

        Ok(CreatedTasks {
            total_tasks_created: progress.total_created,
            available_tasks_created,
            available_tasks,
            event_count: progress.event_count,
        })
    }

    async fn find(&self, criteria: &FindTaskCriteria) -> Result<ResultPage<ProcessorTask>> {
        let tables = self.inner.lock();
        let rows = tables.select(criteria).into_iter().cloned().collect();
        Ok(ResultPage::from_sorted(rows, criteria.page))
    }

    async fn find_summary(
        &self,
        criteria: &FindTaskCriteria,
    ) -> Result<ResultPage<ProcessorTaskSummary>> {
        let tables = self.inner.lock();
        let mut groups: BTreeMap<(String, i32, Option<String>, TaskStatus), u64> = BTreeMap::new();
        for task in tables.select(criteria) {
            let (pipeline, priority) = tables
                .filter_of(task)
                .map(|f| (f.pipeline_uuid.clone(), f.priority))
                .unwrap_or_default();
            *groups
                .entry((pipeline, priority, task.feed_name.clone(), task.status))
                .or_default() += 1;
        }
        let summaries = groups
            .into_iter()
            .map(|((pipeline_uuid, priority, feed, status), count)| ProcessorTaskSummary {
                pipeline_name: tables.pipelines.get(&pipeline_uuid).cloned(),
                feed,
                pipeline_uuid,
                priority,
                status,
                count,
            })
            .collect();
        Ok(ResultPage::from_sorted(summaries, criteria.page))
    }

    async fn change_task_status(
        &self,
        task: &ProcessorTask,
        node_name: Option<&str>,
        status: TaskStatus,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
    ) -> Result<Option<ProcessorTask>> {
        let mut expected_version = Some(task.version);
        let interval = fixed::Interval::from_duration(self.status_update_backoff)
            .take(self.status_update_attempts.saturating_sub(1));
        let outcome = Retry::new(
            interval,
            || {
                let attempt = self.try_change_status(
                    task.id,
                    expected_version.take(),
                    node_name,
                    status,
                    start_time_ms,
                    end_time_ms,
                );
                future::ready(attempt)
            },
            |e: &StatusChangeError| {
                debug!(%e, "Task status update conflicted, reloading");
                true
            },
        )
        .await;

        match outcome {
            Ok(updated) => Ok(updated),
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(task_id = task.id, attempts, ?last, "Giving up on task status update");
                Ok(None)
            }
            Err(RetryError::Aborted(e)) => {
                error!(task_id = task.id, ?e, "Task status update aborted");
                Ok(None)
            }
        }
    }

    async fn assign_tasks(&self, ids: &[i64], node_name: &str) -> Result<Vec<ProcessorTask>> {
        let now = now_ms();
        let mut tables = self.inner.lock();
        let mut assigned = Vec::with_capacity(ids.len());
        for id in ids {
            match tables.tasks.get_mut(id) {
                Some(row) if row.status == TaskStatus::Unprocessed => {
                    row.status = TaskStatus::Assigned;
                    row.node_name = Some(node_name.to_string());
                    row.status_time_ms = Some(now);
                    row.version += 1;
                    assigned.push(row.clone());
                }
                _ => debug!(task_id = id, "Task no longer assignable"),
            }
        }
        Ok(assigned)
    }

    async fn queue_existing_tasks(
        &self,
        ids: &[i64],
        node_name: &str,
    ) -> Result<Vec<ProcessorTask>> {
        let mut tables = self.inner.lock();
        let mut queued = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = tables.tasks.get_mut(id) {
                if row.status == TaskStatus::Unprocessed && row.node_name.is_none() {
                    row.node_name = Some(node_name.to_string());
                    row.version += 1;
                    queued.push(row.clone());
                }
            }
        }
        Ok(queued)
    }

    async fn release_tasks(&self, ids: &[i64]) -> Result<u64> {
        let ids: HashSet<i64> = ids.iter().copied().collect();
        Ok(self.release_where(|task| ids.contains(&task.id)))
    }

    async fn release_owned_tasks(&self, node_name: &str) -> Result<u64> {
        Ok(self.release_where(|task| task.node_name.as_deref() == Some(node_name)))
    }

    async fn retain_owned_tasks(
        &self,
        retain_nodes: &HashSet<String>,
        status_older_than_ms: i64,
    ) -> Result<u64> {
        Ok(self.release_where(|task| {
            task.node_name
                .as_ref()
                .is_some_and(|node| !retain_nodes.contains(node))
                && task.status_time_ms.is_some_and(|t| t < status_older_than_ms)
        }))
    }

    async fn logical_delete_by_filter(&self, filter_id: i32) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .logical_delete(|task| task.filter_id == filter_id))
    }

    async fn logical_delete_by_processor(&self, processor_id: i32) -> Result<u64> {
        let mut tables = self.inner.lock();
        let filter_ids: HashSet<i32> = tables
            .filters
            .values()
            .filter(|f| f.processor_id == processor_id)
            .map(|f| f.id)
            .collect();
        Ok(tables.logical_delete(|task| filter_ids.contains(&task.filter_id)))
    }

    async fn logical_delete_for_deleted_filters(&self, threshold_ms: i64) -> Result<u64> {
        let criteria = FindFilterCriteria::deleted_before(threshold_ms);
        let filter_ids: Vec<i32> = self
            .inner
            .lock()
            .filters
            .values()
            .filter(|f| criteria.matches(f))
            .map(|f| f.id)
            .collect();

        let mut total = 0;
        for filter_id in filter_ids {
            match self.logical_delete_existing_filter(filter_id) {
                Ok(count) => total += count,
                Err(Error::Integrity(reason)) => {
                    debug!(filter_id, %reason, "Filter went away during logical delete");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    async fn physically_delete_old_tasks(&self, threshold_ms: i64) -> Result<u64> {
        let mut tables = self.inner.lock();
        let before = tables.tasks.len();
        tables.tasks.retain(|_, task| {
            let finished = matches!(task.status, TaskStatus::Complete | TaskStatus::Deleted);
            let old = task.status_time_ms.is_none_or(|t| t < threshold_ms);
            !(finished && old)
        });
        Ok((before - tables.tasks.len()) as u64)
    }

    async fn load_tracker(&self, filter_id: i32) -> Result<ProcessorFilterTracker> {
        let mut guard = self.inner.lock();
        let tables = &mut *guard;
        if let Some(tracker) = tables.trackers.get(&filter_id) {
            return Ok(tracker.clone());
        }
        tables.last_tracker_id += 1;
        let mut tracker = ProcessorFilterTracker::new(filter_id);
        tracker.id = tables.last_tracker_id;
        tables.trackers.insert(filter_id, tracker.clone());
        Ok(tracker)
    }

    async fn update_tracker(
        &self,
        mut tracker: ProcessorFilterTracker,
    ) -> Result<ProcessorFilterTracker> {
        let mut tables = self.inner.lock();
        match tables.trackers.get(&tracker.filter_id) {
            Some(stored) if stored.version != tracker.version => Err(Error::OptimisticLock(
                format!(
                    "tracker of filter {} is at version {}, update was for {}",
                    tracker.filter_id, stored.version, tracker.version
                ),
            )),
            _ => {
                tracker.version += 1;
                tables.trackers.insert(tracker.filter_id, tracker.clone());
                Ok(tracker)
            }
        }
    }
}

#[async_trait]
impl FilterRegistry for InMemoryProcessorDb {
    async fn fetch(&self, id: i32) -> Result<Option<ProcessorFilter>> {
        Ok(self.inner.lock().filters.get(&id).cloned())
    }

    async fn find_filters(&self, criteria: &FindFilterCriteria) -> Result<Vec<ProcessorFilter>> {
        Ok(self
            .inner
            .lock()
            .filters
            .values()
            .filter(|f| criteria.matches(f))
            .cloned()
            .collect())
    }

    async fn pipeline_name(&self, pipeline_uuid: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().pipelines.get(pipeline_uuid).cloned())
    }

    async fn delete(&self, id: i32) -> Result<()> {
        let mut tables = self.inner.lock();
        if tables.tasks.values().any(|task| task.filter_id == id) {
            return Err(Error::Integrity(format!(
                "filter {id} is still referenced by tasks"
            )));
        }
        tables.filters.remove(&id);
        tables.trackers.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{PageRequest, TimeRange};
    use crate::expression::ExpressionOperator;
    use crate::filter::QueryData;
    use crate::meta::Meta;
    use crate::task::TaskCandidate;
    use crate::tracker::TrackerStatus;

    fn filter(id: i32, processor_id: i32, priority: i32) -> ProcessorFilter {
        ProcessorFilter::new(
            id,
            processor_id,
            priority,
            QueryData::stream_store(ExpressionOperator::and()),
        )
    }

    async fn create(
        db: &InMemoryProcessorDb,
        filter: &ProcessorFilter,
        metas: impl IntoIterator<Item = Meta>,
        node: &str,
    ) -> CreatedTasks {
        let tracker = db.load_tracker(filter.id).await.unwrap();
        db.create_tasks(NewTasks {
            filter,
            tracker,
            candidates: metas.into_iter().map(TaskCandidate::whole).collect(),
            node_name: node,
            stream_query_time_ms: now_ms(),
            max_meta_id: None,
            assign_new_tasks: true,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_select_mismatch_rolls_back() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        db.save_filter(f.clone());
        let before = db.load_tracker(1).await.unwrap();
        db.steal_next_insert();

        let err = db
            .create_tasks(NewTasks {
                filter: &f,
                tracker: before.clone(),
                candidates: (1..=3)
                    .map(|id| TaskCandidate::whole(Meta::new(id, "FEED", MetaStatus::Unlocked, id)))
                    .collect(),
                node_name: "node1",
                stream_query_time_ms: now_ms(),
                max_meta_id: None,
                assign_new_tasks: true,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::InsertSelectMismatch {
                expected: 3,
                selected: 2
            }
        );
        assert!(db.find(&FindTaskCriteria::new()).await.unwrap().values.is_empty());
        assert_eq!(db.load_tracker(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_batch_creation_counts() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        db.save_filter(f.clone());
        let metas = (1..=10).map(|id| {
            let status = if id <= 6 {
                MetaStatus::Unlocked
            } else {
                MetaStatus::Locked
            };
            Meta::new(id, "FEED", status, id * 1000)
        });

        let created = create(&db, &f, metas, "node1").await;
        assert_eq!(created.total_tasks_created, 10);
        assert_eq!(created.available_tasks_created, 6);
        assert_eq!(created.available_tasks.len(), 6);
        assert!(created
            .available_tasks
            .iter()
            .all(|t| t.node_name.as_deref() == Some("node1")));

        let tracker = db.load_tracker(1).await.unwrap();
        assert_eq!(tracker.min_meta_id, 11);
        assert_eq!(tracker.meta_count, 10);
        assert_eq!(tracker.status, TrackerStatus::Active);
    }

    #[tokio::test]
    async fn test_stale_tracker_rejected() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        let stale = db.load_tracker(1).await.unwrap();
        create(&db, &f, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "node1").await;

        let err = db
            .create_tasks(NewTasks {
                filter: &f,
                tracker: stale,
                candidates: vec![TaskCandidate::whole(Meta::new(1, "FEED", MetaStatus::Unlocked, 1))],
                node_name: "node1",
                stream_query_time_ms: 0,
                max_meta_id: None,
                assign_new_tasks: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OptimisticLock(_)));
        // nothing from the rejected batch was written
        let all = db.find(&FindTaskCriteria::new()).await.unwrap();
        assert_eq!(all.values.len(), 1);
    }

    #[tokio::test]
    async fn test_change_status_reloads_on_conflict() {
        let db = InMemoryProcessorDb::new(5, Duration::from_millis(1));
        let f = filter(1, 1, 10);
        let created = create(&db, &f, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "node1").await;
        let captured = created.available_tasks[0].clone();

        let first = db
            .change_task_status(&captured, Some("node1"), TaskStatus::Processing, Some(5), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, captured.version + 1);

        // stale version reloads and applies on top of the first writer
        let second = db
            .change_task_status(&captured, Some("node1"), TaskStatus::Complete, Some(5), Some(9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_change_status_of_deleted_task_is_none() {
        let db = InMemoryProcessorDb::new(5, Duration::from_millis(1));
        let f = filter(1, 1, 10);
        db.save_filter(f.clone());
        let created = create(&db, &f, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "node1").await;
        let captured = created.available_tasks[0].clone();

        assert_eq!(db.logical_delete_by_filter(1).await.unwrap(), 1);
        let updated = db
            .change_task_status(&captured, Some("node1"), TaskStatus::Processing, None, None)
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(db.task(captured.id).unwrap().status, TaskStatus::Deleted);
    }

    #[tokio::test]
    async fn test_release_owned_tasks_leaves_finished_work() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        let created = create(
            &db,
            &f,
            (1..=4).map(|id| Meta::new(id, "FEED", MetaStatus::Unlocked, id)),
            "nodeA",
        )
        .await;
        let tasks = created.available_tasks;
        for (task, status) in tasks.iter().zip([
            TaskStatus::Unprocessed,
            TaskStatus::Assigned,
            TaskStatus::Processing,
            TaskStatus::Complete,
        ]) {
            db.change_task_status(task, Some("nodeA"), status, None, None)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(db.release_owned_tasks("nodeA").await.unwrap(), 3);
        for task in &tasks[..3] {
            let row = db.task(task.id).unwrap();
            assert_eq!(row.status, TaskStatus::Unprocessed);
            assert_eq!(row.node_name, None);
        }
        let complete = db.task(tasks[3].id).unwrap();
        assert_eq!(complete.status, TaskStatus::Complete);
        assert_eq!(complete.node_name.as_deref(), Some("nodeA"));
    }

    #[tokio::test]
    async fn test_retain_owned_tasks() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        let x = create(&db, &f, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "nodeX").await;
        let y = create(&db, &f, [Meta::new(2, "FEED", MetaStatus::Unlocked, 2)], "nodeY").await;
        let fresh = create(&db, &f, [Meta::new(3, "FEED", MetaStatus::Unlocked, 3)], "nodeZ").await;
        let x_id = x.available_tasks[0].id;
        let y_id = y.available_tasks[0].id;
        let fresh_id = fresh.available_tasks[0].id;
        db.set_status_time(x_id, Some(100));
        db.set_status_time(y_id, Some(100));

        let retain = HashSet::from(["nodeY".to_string()]);
        assert_eq!(db.retain_owned_tasks(&retain, 1_000).await.unwrap(), 1);
        assert_eq!(db.task(x_id).unwrap().node_name, None);
        assert_eq!(db.task(y_id).unwrap().node_name.as_deref(), Some("nodeY"));
        // too recent to be considered dead
        assert_eq!(db.task(fresh_id).unwrap().node_name.as_deref(), Some("nodeZ"));
    }

    #[tokio::test]
    async fn test_logical_and_physical_delete() {
        let db = InMemoryProcessorDb::default();
        let mut gone = filter(1, 1, 10);
        let kept = filter(2, 2, 10);
        let created_gone =
            create(&db, &gone, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "node1").await;
        create(&db, &kept, [Meta::new(2, "FEED", MetaStatus::Unlocked, 2)], "node1").await;
        gone.deleted = true;
        gone.update_time_ms = 500;
        db.save_filter(gone);
        db.save_filter(kept);

        assert_eq!(db.logical_delete_for_deleted_filters(100).await.unwrap(), 0);
        assert_eq!(db.logical_delete_for_deleted_filters(1_000).await.unwrap(), 1);
        assert_eq!(db.logical_delete_by_processor(2).await.unwrap(), 1);

        let deleted_id = created_gone.available_tasks[0].id;
        db.set_status_time(deleted_id, Some(50));
        assert_eq!(db.physically_delete_old_tasks(100).await.unwrap(), 1);
        assert!(db.task(deleted_id).is_none());
        assert_eq!(db.find(&FindTaskCriteria::new()).await.unwrap().values.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_excludes_unavailable_tasks() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        let created = create(
            &db,
            &f,
            (1..=3).map(|id| Meta::new(id, "FEED", MetaStatus::Unlocked, id)),
            "master",
        )
        .await;
        let ids: Vec<i64> = created.available_tasks.iter().map(|t| t.id).collect();
        db.change_task_status(&created.available_tasks[1], Some("other"), TaskStatus::Processing, None, None)
            .await
            .unwrap();

        let assigned = db.assign_tasks(&ids, "worker").await.unwrap();
        let assigned_ids: Vec<i64> = assigned.iter().map(|t| t.id).collect();
        assert_eq!(assigned_ids, vec![ids[0], ids[2]]);
        assert!(assigned.iter().all(|t| t.status == TaskStatus::Assigned));
    }

    #[tokio::test]
    async fn test_find_and_summary() {
        let db = InMemoryProcessorDb::default();
        let f1 = filter(1, 1, 1);
        let f2 = filter(2, 2, 5);
        db.save_filter(f1.clone());
        db.save_filter(f2.clone());
        db.save_pipeline(&f1.pipeline_uuid, "Translate");
        create(&db, &f1, (1..=3).map(|id| Meta::new(id, "A", MetaStatus::Unlocked, id)), "n").await;
        create(&db, &f2, (4..=5).map(|id| Meta::new(id, "B", MetaStatus::Locked, id)), "n").await;

        let page = db
            .find(
                &FindTaskCriteria::new()
                    .with(TaskPredicate::Node(None))
                    .with(TaskPredicate::CreateTime(TimeRange::default()))
                    .sort_by(SortField::Id, true)
                    .page(PageRequest::first(1)),
            )
            .await
            .unwrap();
        assert_eq!(page.page_response.total, 2);
        assert_eq!(page.values[0].meta_id, 5);

        let summary = db.find_summary(&FindTaskCriteria::new()).await.unwrap();
        assert_eq!(summary.values.len(), 2);
        assert_eq!(summary.values[0].pipeline_name.as_deref(), Some("Translate"));
        assert_eq!(summary.values[0].count, 3);
        assert_eq!(summary.values[1].priority, 5);
    }

    #[tokio::test]
    async fn test_filter_delete_blocked_by_tasks() {
        let db = InMemoryProcessorDb::default();
        let f = filter(1, 1, 10);
        db.save_filter(f.clone());
        db.save_filter(filter(2, 1, 10));
        create(&db, &f, [Meta::new(1, "FEED", MetaStatus::Unlocked, 1)], "n").await;

        assert!(matches!(FilterRegistry::delete(&db, 1).await, Err(Error::Integrity(_))));
        FilterRegistry::delete(&db, 2).await.unwrap();
        assert!(FilterRegistry::fetch(&db, 2).await.unwrap().is_none());
    }
}
