//! Task creation engine. One pass walks the enabled filters in priority order and tops up their
//! queues, first by reclaiming unowned tasks and then by creating new ones, until the node's
//! queue target is met.
//!
//! A pass holds a local mutex and the cluster lock [`CREATOR_LOCK`], so exactly one node
//! creates tasks at a time. Search-backed filters run their search on a bounded pool and the
//! pass does not return until every search it started has finished.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterLockService, NodeDirectory, with_cluster_lock};
use crate::config::{BATCH_SIZE, MAX_RANGES_PER_STREAM, SearchSettings, Settings};
use crate::criteria::{FindTaskCriteria, PageRequest, SortField, TaskPredicate};
use crate::filter::{DataSource, ProcessorFilter, sort_by_priority};
use crate::meta::{FindMetaCriteria, MetaService, MetaStatus};
use crate::metrics::{filter_labels, processor_metrics};
use crate::progress::{Phase, ProgressMonitor};
use crate::queue::{ProcessorTaskQueue, TaskQueues};
use crate::ranges::InclusiveRanges;
use crate::registry::{FilterRegistry, FindFilterCriteria};
use crate::search::{EventRef, EventRefs, EventSearch, SearchRequest};
use crate::store::{NewTasks, TaskStore};
use crate::task::{CreatedTasks, TaskCandidate, TaskStatus};
use crate::tracker::{ProcessorFilterTracker, TrackerStatus};
use crate::{Error, Result, millis, now_ms};

/// Cluster lock serialising creation passes across nodes.
pub const CREATOR_LOCK: &str = "ProcessorTaskCreator";

/// Everything the scheduler consumes from outside.
#[derive(Clone)]
pub struct Collaborators<S> {
    pub store: S,
    pub registry: Arc<dyn FilterRegistry>,
    pub meta: Arc<dyn MetaService>,
    pub search: Arc<dyn EventSearch>,
    pub cluster_lock: Arc<dyn ClusterLockService>,
    pub nodes: Arc<dyn NodeDirectory>,
}

/// Holds the filling flag of one queue and clears it when dropped, wherever that happens.
struct FillingGuard {
    queue: Arc<ProcessorTaskQueue>,
}

impl FillingGuard {
    fn claim(queue: Arc<ProcessorTaskQueue>) -> Option<Self> {
        queue
            .compare_and_set_filling(false, true)
            .then(|| Self { queue })
    }

    fn queue(&self) -> &ProcessorTaskQueue {
        &self.queue
    }
}

impl Drop for FillingGuard {
    fn drop(&mut self) {
        self.queue.set_filling(false);
    }
}

/// How many more tasks this pass wants, shared with the search tasks it spawns.
#[derive(Debug)]
struct PassState {
    target: usize,
    initial: usize,
    added: AtomicUsize,
}

impl PassState {
    fn new(target: usize, initial: usize) -> Self {
        Self {
            target,
            initial,
            added: AtomicUsize::new(0),
        }
    }

    fn required(&self) -> usize {
        self.target
            .saturating_sub(self.initial + self.added.load(Ordering::Acquire))
    }

    fn keep_adding(&self) -> bool {
        self.required() > 0
    }

    fn add(&self, count: usize) {
        self.added.fetch_add(count, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SearchBounds {
    max_streams: u64,
    max_events: u64,
}

/// Applies the filter's limits in order duration, stream count, event count. `None` means a
/// limit is used up and the filter is complete.
fn search_bounds(
    filter: &ProcessorFilter,
    tracker: &ProcessorFilterTracker,
    required: usize,
    settings: &SearchSettings,
    now_ms: i64,
) -> Option<SearchBounds> {
    let mut max_streams = i64::try_from(required).unwrap_or(i64::MAX);
    let mut max_events = i64::try_from(settings.max_events).unwrap_or(i64::MAX);

    if let Some(limits) = &filter.query_data.limits {
        if limits
            .duration_ms
            .is_some_and(|duration| filter.create_time_ms.saturating_add(duration) < now_ms)
        {
            return None;
        }
        if let Some(stream_count) = limits.stream_count {
            max_streams = max_streams.min(stream_count - tracker.meta_count);
            if max_streams <= 0 {
                return None;
            }
        }
        if let Some(event_count) = limits.event_count {
            max_events = max_events.min(event_count - tracker.event_count);
            if max_events <= 0 {
                return None;
            }
        }
    }

    Some(SearchBounds {
        max_streams: max_streams.max(0).unsigned_abs(),
        max_events: max_events.max(0).unsigned_abs(),
    })
}

/// Groups search hits per stream. When a stream has more ranges than a task may carry it is
/// cut short and no later stream is taken, so the watermark resumes inside that stream.
fn group_event_refs(refs: &EventRefs) -> Vec<(i64, InclusiveRanges)> {
    let mut streams: Vec<(i64, InclusiveRanges)> = Vec::new();
    for event in &refs.refs {
        let same_stream = streams
            .last()
            .is_some_and(|(stream_id, _)| *stream_id == event.stream_id);
        if !same_stream {
            if streams
                .last()
                .is_some_and(|(_, ranges)| ranges.len() > MAX_RANGES_PER_STREAM)
            {
                break;
            }
            streams.push((event.stream_id, InclusiveRanges::new()));
        }
        if let Some((_, ranges)) = streams.last_mut() {
            ranges.add_event(event.event_id);
        }
    }

    if let Some((stream_id, ranges)) = streams.last_mut() {
        if ranges.len() > MAX_RANGES_PER_STREAM {
            debug!(stream_id, ranges = ranges.len(), "Trimming event ranges");
            *ranges = ranges.sub_ranges(MAX_RANGES_PER_STREAM);
        }
    }
    streams
}

fn queue_created(
    filter_id: i32,
    queue: &ProcessorTaskQueue,
    created: CreatedTasks,
    state: &PassState,
    progress: &ProgressMonitor,
) -> usize {
    let total = created.total_tasks_created;
    processor_metrics().tasks_created.inc_by(total as u64);
    progress.add_new_tasks_in_db(filter_id, total);

    let available = created.available_tasks.len();
    if available > 0 {
        queue.add_all(created.available_tasks);
        progress.add_new_tasks_to_queue(filter_id, available);
        state.add(available);
    }
    debug!(filter_id, created = total, queued = available, "Created tasks for filter");
    total
}

struct SearchJob {
    filter: ProcessorFilter,
    tracker: ProcessorFilterTracker,
    query: String,
    bounds: SearchBounds,
    max_meta_id: Option<i64>,
    stream_query_time_ms: i64,
}

struct CreatorInner<S> {
    settings: Settings,
    collaborators: Collaborators<S>,
    queues: Arc<TaskQueues>,
    local_lock: Mutex<()>,
    search_permits: Semaphore,
    allow_creation: AtomicBool,
    filters: RwLock<Arc<Vec<ProcessorFilter>>>,
    /// Epoch millis of the next retention sweep, 0 when none is scheduled.
    next_delete_ms: Arc<AtomicI64>,
}

#[derive(Clone)]
pub struct TaskCreator<S> {
    inner: Arc<CreatorInner<S>>,
}

impl<S: TaskStore> TaskCreator<S> {
    pub fn new(
        settings: Settings,
        collaborators: Collaborators<S>,
        queues: Arc<TaskQueues>,
        next_delete_ms: Arc<AtomicI64>,
    ) -> Self {
        let permits = settings.search.pool_size.max(1);
        Self {
            inner: Arc::new(CreatorInner {
                settings,
                collaborators,
                queues,
                local_lock: Mutex::new(()),
                search_permits: Semaphore::new(permits),
                allow_creation: AtomicBool::new(false),
                filters: RwLock::new(Arc::new(Vec::new())),
                next_delete_ms,
            }),
        }
    }

    pub fn set_allow_creation(&self, allow: bool) {
        self.inner.allow_creation.store(allow, Ordering::Release);
    }

    /// Active filters in the order tasks are handed out, as of the last pass.
    pub fn prioritised_filters(&self) -> Arc<Vec<ProcessorFilter>> {
        Arc::clone(&self.inner.filters.read())
    }

    pub fn queues(&self) -> &Arc<TaskQueues> {
        &self.inner.queues
    }

    /// Gives every queued task back to the store. Waits for a running pass first, its searches
    /// may still be adding to the queues.
    pub async fn release_all_queues(&self) -> Result<u64> {
        let _local = self.inner.local_lock.lock().await;
        self.inner
            .queues
            .release_all(&self.inner.collaborators.store)
            .await
    }

    /// Forgets every queued task once no pass is running.
    pub async fn clear_queues(&self) {
        let _local = self.inner.local_lock.lock().await;
        self.inner.queues.clear();
    }

    /// Runs one creation pass under the local and the cluster lock.
    pub async fn create_tasks(&self) -> Result<()> {
        if !self.inner.allow_creation.load(Ordering::Acquire) {
            debug!("Task creation is disabled");
            return Ok(());
        }
        let _local = self.inner.local_lock.lock().await;
        let settings = &self.inner.settings;
        with_cluster_lock(
            self.inner.collaborators.cluster_lock.as_ref(),
            CREATOR_LOCK,
            &settings.node_name,
            settings.cluster_lock_timeout,
            || self.do_create_tasks(),
        )
        .await
    }

    async fn do_create_tasks(&self) -> Result<()> {
        let inner = &self.inner;
        let filters = self.update_prioritised_filters().await?;

        let initial = inner.queues.total_len();
        let state = Arc::new(PassState::new(inner.settings.queue_size, initial));
        let progress = Arc::new(ProgressMonitor::new(initial));
        let mut searches = JoinSet::new();
        debug!(
            filters = filters.len(),
            initial,
            required = state.required(),
            "Starting task creation pass"
        );

        for filter in filters.iter() {
            if !state.keep_adding() {
                debug!("Queue target reached");
                break;
            }
            let Some(guard) = FillingGuard::claim(inner.queues.get_or_create(filter.id)) else {
                debug!(filter_id = filter.id, "Queue is already being filled");
                continue;
            };
            progress.start_filter(filter.id, filter.priority);

            if let Err(e) = self
                .create_tasks_for_filter(filter, guard, &state, &progress, &mut searches)
                .await
            {
                error!(filter_id = filter.id, ?e, "Error creating tasks for filter");
                self.record_error(filter.id, &e).await;
            }
        }

        self.release_inactive_queues(&filters, &progress).await;
        self.schedule_delete();

        while let Some(joined) = searches.join_next().await {
            if let Err(e) = joined {
                error!(?e, "Search task did not complete");
            }
        }

        let final_size = inner.queues.total_len();
        let metrics = processor_metrics();
        metrics.task_queue_size.set(final_size as i64);
        for (filter_id, size) in inner.queues.sizes() {
            metrics
                .filter_queue_size
                .get_or_create(&filter_labels(filter_id))
                .set(size as i64);
        }
        metrics
            .creation_pass_duration
            .observe(progress.elapsed().as_secs_f64());
        progress.report(final_size);
        Ok(())
    }

    async fn update_prioritised_filters(&self) -> Result<Arc<Vec<ProcessorFilter>>> {
        let registry = &self.inner.collaborators.registry;
        let mut filters = registry.find_filters(&FindFilterCriteria::active()).await?;
        sort_by_priority(&mut filters);

        for filter in filters.iter_mut() {
            match registry.pipeline_name(&filter.pipeline_uuid).await {
                Ok(name) => filter.pipeline_name = name,
                Err(e) => debug!(pipeline = filter.pipeline_uuid, ?e, "Unable to resolve pipeline name"),
            }
        }

        let filters = Arc::new(filters);
        *self.inner.filters.write() = Arc::clone(&filters);
        Ok(filters)
    }

    async fn create_tasks_for_filter(
        &self,
        filter: &ProcessorFilter,
        guard: FillingGuard,
        state: &Arc<PassState>,
        progress: &Arc<ProgressMonitor>,
        searches: &mut JoinSet<()>,
    ) -> Result<()> {
        let inner = &self.inner;
        let collaborators = &inner.collaborators;

        // the filter may have been changed since the list was loaded
        let Some(mut current) = collaborators.registry.fetch(filter.id).await? else {
            debug!(filter_id = filter.id, "Filter no longer exists");
            return Ok(());
        };
        if !current.is_active() {
            debug!(filter_id = filter.id, "Filter no longer active");
            return Ok(());
        }
        current.pipeline_name = filter.pipeline_name.clone();

        if inner.settings.fill_task_queue {
            let started = Instant::now();
            match self.add_unowned_tasks(&current, guard.queue(), state).await {
                Ok(added) => {
                    progress.log_phase(current.id, Phase::AddUnownedTasks, started, added);
                    progress.add_unowned_tasks_to_queue(current.id, added);
                }
                Err(e) => error!(filter_id = current.id, ?e, "Failed to grab non owned tasks"),
            }
        }

        if !inner.settings.create_tasks || !state.keep_adding() {
            return Ok(());
        }

        let mut tracker = collaborators.store.load_tracker(current.id).await?;
        if tracker.status.is_terminal() {
            if tracker.record_empty_poll(now_ms()) {
                self.update_tracker(current.id, tracker, progress).await?;
            }
            return Ok(());
        }

        let search_query = match &current.query_data.data_source {
            DataSource::StreamStore => None,
            DataSource::Search { query } => Some(query.clone()),
        };
        match search_query {
            None => {
                self.create_tasks_from_criteria(&current, tracker, guard.queue(), state, progress)
                    .await
            }
            Some(query) => {
                self.start_search(current, tracker, query, guard, state, progress, searches)
                    .await
            }
        }
    }

    /// Takes ownership of persisted tasks nobody owns whose data has become usable.
    async fn add_unowned_tasks(
        &self,
        filter: &ProcessorFilter,
        queue: &ProcessorTaskQueue,
        state: &PassState,
    ) -> Result<usize> {
        let collaborators = &self.inner.collaborators;
        let node_name = &self.inner.settings.node_name;
        let batch_size = BATCH_SIZE.max(state.required());
        let mut min_task_id = 0;
        let mut added = 0;

        while state.keep_adding() {
            let page = collaborators
                .store
                .find(
                    &FindTaskCriteria::new()
                        .with(TaskPredicate::IdGreaterThan(min_task_id))
                        .with(TaskPredicate::Status(vec![TaskStatus::Unprocessed]))
                        .with(TaskPredicate::Node(None))
                        .with(TaskPredicate::FilterId(filter.id))
                        .sort_by(SortField::Id, false)
                        .page(PageRequest::first(batch_size)),
                )
                .await?;
            let tasks = page.values;
            let Some(last) = tasks.last() else {
                break;
            };
            min_task_id = last.id;

            let meta_ids: Vec<i64> = tasks.iter().map(|t| t.meta_id).collect();
            let unlocked: HashSet<i64> = collaborators
                .meta
                .find_unlocked(&meta_ids)
                .await?
                .into_iter()
                .map(|meta| meta.id)
                .collect();
            let ids: Vec<i64> = tasks
                .iter()
                .filter(|t| unlocked.contains(&t.meta_id))
                .map(|t| t.id)
                .take(state.required())
                .collect();

            if !ids.is_empty() {
                let queued = collaborators
                    .store
                    .queue_existing_tasks(&ids, node_name)
                    .await?;
                added += queued.len();
                state.add(queued.len());
                queue.add_all(queued);
            }

            if tasks.len() < batch_size {
                break;
            }
        }

        if added > 0 {
            debug!(filter_id = filter.id, added, "Added tasks that are no longer locked");
        }
        Ok(added)
    }

    async fn create_tasks_from_criteria(
        &self,
        filter: &ProcessorFilter,
        mut tracker: ProcessorFilterTracker,
        queue: &ProcessorTaskQueue,
        state: &PassState,
        progress: &ProgressMonitor,
    ) -> Result<()> {
        let collaborators = &self.inner.collaborators;
        let settings = &self.inner.settings;
        let expression = &filter.query_data.expression;
        if expression.term_count() == 0 {
            return Err(Error::UnconstrainedFilter(format!(
                "attempting to create tasks with an unconstrained filter {}",
                filter.id
            )));
        }

        let stream_query_time_ms = now_ms();
        tracker.status = TrackerStatus::Creating;
        let tracker = self.update_tracker(filter.id, tracker, progress).await?;

        let started = Instant::now();
        let max_meta_id = collaborators.meta.get_max_id().await?;
        let criteria = FindMetaCriteria {
            expression: expression.clone(),
            min_meta_id: tracker.min_meta_id,
            min_create_ms: filter.min_meta_create_time_ms,
            max_create_ms: filter.max_meta_create_time_ms,
            // locked data still needs tasks, they just cannot be queued yet
            statuses: vec![MetaStatus::Unlocked, MetaStatus::Locked],
            limit: state.required(),
        };
        let metas = if filter.reprocess {
            collaborators.meta.find_reprocess(&criteria).await?
        } else {
            collaborators.meta.find(&criteria).await?
        };

        let created = collaborators
            .store
            .create_tasks(NewTasks {
                filter,
                tracker,
                candidates: metas.into_iter().map(TaskCandidate::whole).collect(),
                node_name: &settings.node_name,
                stream_query_time_ms,
                max_meta_id,
                assign_new_tasks: settings.fill_task_queue,
            })
            .await?;
        let total = queue_created(filter.id, queue, created, state, progress);
        progress.log_phase(filter.id, Phase::CreateTasksFromCriteria, started, total);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_search(
        &self,
        filter: ProcessorFilter,
        mut tracker: ProcessorFilterTracker,
        query: String,
        guard: FillingGuard,
        state: &Arc<PassState>,
        progress: &Arc<ProgressMonitor>,
        searches: &mut JoinSet<()>,
    ) -> Result<()> {
        let stream_query_time_ms = now_ms();
        let Some(bounds) = search_bounds(
            &filter,
            &tracker,
            state.required(),
            &self.inner.settings.search,
            stream_query_time_ms,
        ) else {
            info!(filter_id = filter.id, "Filter limits reached, marking complete");
            tracker.status = TrackerStatus::Complete;
            self.update_tracker(filter.id, tracker, progress).await?;
            return Ok(());
        };

        tracker.status = TrackerStatus::Searching;
        let tracker = self.update_tracker(filter.id, tracker, progress).await?;
        let max_meta_id = self.inner.collaborators.meta.get_max_id().await?;

        let job = SearchJob {
            filter,
            tracker,
            query,
            bounds,
            max_meta_id,
            stream_query_time_ms,
        };
        let creator = self.clone();
        let state = Arc::clone(state);
        let progress = Arc::clone(progress);
        searches.spawn(async move { creator.run_search(job, guard, state, progress).await });
        Ok(())
    }

    /// Body of a spawned search. The guard is held until tasks are queued, keeping other passes
    /// off this filter's queue.
    async fn run_search(
        self,
        job: SearchJob,
        guard: FillingGuard,
        state: Arc<PassState>,
        progress: Arc<ProgressMonitor>,
    ) {
        let filter_id = job.filter.id;
        let started = Instant::now();
        let created = match self
            .search_and_create(&job, guard.queue(), &state, &progress)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                error!(filter_id, ?e, "Error creating tasks for filter");
                self.record_error(filter_id, &e).await;
                0
            }
        };
        progress.log_phase(filter_id, Phase::CreateTasksFromSearchQuery, started, created);
        drop(guard);
    }

    async fn search_and_create(
        &self,
        job: &SearchJob,
        queue: &ProcessorTaskQueue,
        state: &PassState,
        progress: &ProgressMonitor,
    ) -> Result<usize> {
        let collaborators = &self.inner.collaborators;
        let settings = &self.inner.settings;
        let filter = &job.filter;

        let _permit = self
            .inner
            .search_permits
            .acquire()
            .await
            .map_err(|e| Error::Search(format!("search pool closed: {e}")))?;

        let refs = collaborators
            .search
            .search(SearchRequest {
                query: job.query.clone(),
                expression: filter.query_data.expression.clone(),
                min_event: EventRef::new(job.tracker.min_meta_id, job.tracker.min_event_id),
                max_event: EventRef::new(i64::MAX, 0),
                max_streams: job.bounds.max_streams,
                max_events: job.bounds.max_events,
                max_events_per_stream: settings.search.max_events_per_stream,
            })
            .await?;
        debug!(filter_id = filter.id, refs = refs.refs.len(), reached_limit = refs.reached_limit, "Search finished");

        let mut tracker = job.tracker.clone();
        tracker.status = TrackerStatus::Creating;
        let tracker = self.update_tracker(filter.id, tracker, progress).await?;

        let started = Instant::now();
        let mut candidates = Vec::new();
        for (stream_id, ranges) in group_event_refs(&refs) {
            match collaborators.meta.get_meta(stream_id).await? {
                Some(meta) if meta.status != MetaStatus::Deleted => {
                    candidates.push(TaskCandidate {
                        meta,
                        ranges: Some(ranges),
                    });
                }
                _ => debug!(stream_id, "No usable meta for search hit"),
            }
        }
        progress.log_phase(filter.id, Phase::CreateStreamMap, started, candidates.len());

        let created = collaborators
            .store
            .create_tasks(NewTasks {
                filter,
                tracker,
                candidates,
                node_name: &settings.node_name,
                stream_query_time_ms: job.stream_query_time_ms,
                // a truncated search says nothing about ids past the last hit
                max_meta_id: job.max_meta_id.filter(|_| !refs.reached_limit),
                assign_new_tasks: settings.fill_task_queue,
            })
            .await?;
        Ok(queue_created(filter.id, queue, created, state, progress))
    }

    async fn update_tracker(
        &self,
        filter_id: i32,
        tracker: ProcessorFilterTracker,
        progress: &ProgressMonitor,
    ) -> Result<ProcessorFilterTracker> {
        let started = Instant::now();
        let updated = self.inner.collaborators.store.update_tracker(tracker).await?;
        progress.log_phase(filter_id, Phase::UpdateTracker, started, 0);
        Ok(updated)
    }

    async fn try_record_error(&self, filter_id: i32, e: &Error) -> Result<()> {
        let store = &self.inner.collaborators.store;
        let mut tracker = store.load_tracker(filter_id).await?;
        tracker.status = TrackerStatus::error(&e.to_string());
        store.update_tracker(tracker).await?;
        Ok(())
    }

    async fn record_error(&self, filter_id: i32, e: &Error) {
        if let Err(update_error) = self.try_record_error(filter_id, e).await {
            warn!(filter_id, ?update_error, "Unable to record filter error on its tracker");
        }
    }

    async fn release_inactive_queues(&self, filters: &[ProcessorFilter], progress: &ProgressMonitor) {
        let active: HashSet<i32> = filters.iter().map(|f| f.id).collect();
        let queues = &self.inner.queues;
        for filter_id in queues.filter_ids() {
            if active.contains(&filter_id) {
                continue;
            }
            let started = Instant::now();
            match queues
                .release_filter(filter_id, &self.inner.collaborators.store)
                .await
            {
                Ok(released) => {
                    progress.log_phase(filter_id, Phase::ReleaseQueuedTasks, started, released as usize)
                }
                Err(e) => error!(filter_id, ?e, "Unable to release tasks of inactive filter"),
            }
        }
    }

    fn schedule_delete(&self) {
        let next = now_ms() + millis(self.inner.settings.poll_interval * 10);
        if self
            .inner
            .next_delete_ms
            .compare_exchange(0, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(next_delete_ms = next, "Scheduled task deletion");
        }
    }
}
