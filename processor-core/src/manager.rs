//! Entry point of the scheduler on one node. Owns the queues, hands tasks out to workers and
//! drives the periodic creation, liveness and retention work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::creator::{Collaborators, TaskCreator};
use crate::criteria::{FindTaskCriteria, ProcessorTaskSummary, ResultPage};
use crate::liveness::NodeLivenessMonitor;
use crate::metrics::{SystemInfoSource, processor_metrics};
use crate::queue::TaskQueues;
use crate::retention::TaskRetention;
use crate::store::TaskStore;
use crate::task::ProcessorTask;
use crate::{Error, Result, millis, now_ms};

/// Who is calling the worker facing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The internal identity worker nodes use.
    ProcessingUser,
    User(String),
}

impl Identity {
    pub fn is_processing_user(&self) -> bool {
        matches!(self, Identity::ProcessingUser)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::ProcessingUser => f.write_str("processing user"),
            Identity::User(name) => write!(f, "user '{name}'"),
        }
    }
}

fn check_permission(identity: &Identity, action: &str) -> Result<()> {
    if identity.is_processing_user() {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "{identity} is not allowed to {action}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub filter_id: i32,
    pub pipeline_name: Option<String>,
    pub priority: i32,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Non-empty queues in priority order.
    pub queues: Vec<QueueInfo>,
    pub overall_queue_size: usize,
}

struct ManagerInner<S> {
    settings: Settings,
    store: S,
    nodes: Arc<dyn crate::cluster::NodeDirectory>,
    queues: Arc<TaskQueues>,
    creator: TaskCreator<S>,
    liveness: NodeLivenessMonitor<S>,
    retention: TaskRetention<S>,
    /// Set while an opportunistic creation pass is running.
    filling: AtomicBool,
    next_poll_ms: AtomicI64,
}

#[derive(Clone)]
pub struct ProcessorTaskManager<S> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: TaskStore> ProcessorTaskManager<S> {
    pub fn new(settings: Settings, collaborators: Collaborators<S>) -> Self {
        let queues = Arc::new(TaskQueues::new());
        let next_delete_ms = Arc::new(AtomicI64::new(0));
        let store = collaborators.store.clone();
        let nodes = Arc::clone(&collaborators.nodes);
        let retention = TaskRetention::new(
            settings.node_name.clone(),
            collaborators.store.clone(),
            Arc::clone(&collaborators.registry),
            Arc::clone(&collaborators.cluster_lock),
            settings.delete_age,
            settings.cluster_lock_timeout,
            Arc::clone(&next_delete_ms),
        );
        let creator = TaskCreator::new(
            settings.clone(),
            collaborators,
            Arc::clone(&queues),
            next_delete_ms,
        );
        let liveness = NodeLivenessMonitor::new(
            settings.node_name.clone(),
            store.clone(),
            Arc::clone(&nodes),
            creator.clone(),
            settings.disown_dead_tasks_after,
        );

        Self {
            inner: Arc::new(ManagerInner {
                settings,
                store,
                nodes,
                queues,
                creator,
                liveness,
                retention,
                filling: AtomicBool::new(false),
                next_poll_ms: AtomicI64::new(0),
            }),
        }
    }

    /// Gives back whatever this node owned before it (re)started, then allows task creation.
    pub async fn startup(&self) {
        let inner = &self.inner;
        match inner.store.release_owned_tasks(&inner.settings.node_name).await {
            Ok(released) => info!(released, "Released tasks owned before startup"),
            Err(e) => error!(?e, "Unable to release owned tasks on startup"),
        }
        inner.creator.set_allow_creation(true);
    }

    /// Stops creation and, once a running pass is over, forgets the queues. Tasks stay owned in
    /// the store until reassigned or disowned.
    pub async fn shutdown(&self) {
        self.inner.creator.set_allow_creation(false);
        self.inner.creator.clear_queues().await;
        processor_metrics().task_queue_size.set(0);
        info!("Processor task manager stopped");
    }

    /// Forces a creation pass, whether or not this node is master.
    pub async fn create_tasks(&self) -> Result<()> {
        self.inner.creator.create_tasks().await
    }

    /// Scheduled creation pass. Only the master creates tasks.
    pub async fn poll(&self) -> Result<()> {
        let node_name = &self.inner.settings.node_name;
        match self.inner.nodes.master_node().await {
            Ok(master) if &master == node_name => self.create_tasks().await,
            Ok(master) => {
                debug!(master, "Not master, skipping task creation");
                Ok(())
            }
            Err(e) if e.is_node_state_unknown() => {
                debug!(?e, "Cluster state unknown, skipping task creation");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_task_queue_size(&self) -> usize {
        self.inner.queues.total_len()
    }

    pub fn system_info(&self) -> SystemInfo {
        let filters = self.inner.creator.prioritised_filters();
        let queues = filters
            .iter()
            .filter_map(|filter| {
                let queue_size = self.inner.queues.get(filter.id)?.len();
                (queue_size > 0).then(|| QueueInfo {
                    filter_id: filter.id,
                    pipeline_name: filter.pipeline_name.clone(),
                    priority: filter.priority,
                    queue_size,
                })
            })
            .collect();
        SystemInfo {
            queues,
            overall_queue_size: self.get_task_queue_size(),
        }
    }

    /// Hands up to `count` queued tasks to `node_name`, highest priority filters first.
    pub async fn assign_tasks(
        &self,
        identity: &Identity,
        node_name: &str,
        count: usize,
    ) -> Result<Vec<ProcessorTask>> {
        check_permission(identity, "assign tasks")?;
        let inner = &self.inner;
        if !inner.settings.assign_tasks || count == 0 {
            return Ok(Vec::new());
        }

        let drained = self.drain_queues(count);
        let assigned = if drained.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<i64> = drained.iter().map(|t| t.id).collect();
            match inner.store.assign_tasks(&ids, node_name).await {
                Ok(assigned) => assigned,
                Err(e) => {
                    error!(?e, node_name, "Unable to assign tasks, releasing them");
                    if let Err(release_error) = inner.store.release_tasks(&ids).await {
                        error!(?release_error, "Unable to release tasks after failed assignment");
                    }
                    return Err(e);
                }
            }
        };
        if assigned.len() < drained.len() {
            warn!(
                node_name,
                queued = drained.len(),
                assigned = assigned.len(),
                "Some queued tasks could not be assigned"
            );
        }

        let metrics = processor_metrics();
        metrics.tasks_assigned.inc_by(assigned.len() as u64);
        metrics.task_queue_size.set(self.get_task_queue_size() as i64);
        debug!(node_name, count, assigned = assigned.len(), "Assigned tasks");

        self.fill_task_store();
        Ok(assigned)
    }

    fn drain_queues(&self, count: usize) -> Vec<ProcessorTask> {
        let filters = self.inner.creator.prioritised_filters();
        let mut drained = Vec::with_capacity(count);
        for filter in filters.iter() {
            if drained.len() >= count {
                break;
            }
            let Some(queue) = self.inner.queues.get(filter.id) else {
                continue;
            };
            while drained.len() < count {
                match queue.poll() {
                    Some(task) => drained.push(task),
                    None => break,
                }
            }
        }
        drained
    }

    /// Gives tasks a worker could not start back to the pool. Only tasks still waiting or running
    /// are released, so a stale copy never reopens finished work. True if every task was released.
    pub async fn abandon_tasks(
        &self,
        identity: &Identity,
        node_name: &str,
        tasks: &[ProcessorTask],
    ) -> Result<bool> {
        check_permission(identity, "abandon tasks")?;
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        let abandoned = self.inner.store.release_tasks(&ids).await?;
        processor_metrics().tasks_abandoned.inc_by(abandoned);
        info!(node_name, abandoned, requested = tasks.len(), "Abandoned tasks");
        Ok(abandoned == tasks.len() as u64)
    }

    pub async fn find(&self, criteria: &FindTaskCriteria) -> Result<ResultPage<ProcessorTask>> {
        self.inner.store.find(criteria).await
    }

    pub async fn find_summary(
        &self,
        criteria: &FindTaskCriteria,
    ) -> Result<ResultPage<ProcessorTaskSummary>> {
        self.inner.store.find_summary(criteria).await
    }

    pub async fn disown_dead_tasks(&self) -> Result<u64> {
        self.inner.liveness.disown_dead_tasks().await
    }

    pub async fn release_old_queued_tasks(&self) -> Result<u64> {
        self.inner.liveness.release_old_queued_tasks().await
    }

    /// Runs a background pass if none is running and the last one finished more than a poll
    /// interval ago.
    fn fill_task_store(&self) {
        let inner = &self.inner;
        if now_ms() <= inner.next_poll_ms.load(Ordering::Acquire) {
            return;
        }
        if inner
            .filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.poll().await {
                warn!(?e, "Opportunistic task creation failed");
            }
            let inner = &manager.inner;
            inner.next_poll_ms.store(
                now_ms() + millis(inner.settings.poll_interval),
                Ordering::Release,
            );
            inner.filling.store(false, Ordering::Release);
        });
    }

    /// Starts the node and runs the periodic work until `cancel` fires. In-flight work is let
    /// finish, then the node shuts down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.startup().await;
        let settings = &self.inner.settings;
        let mut jobs = JoinSet::new();

        let manager = self.clone();
        jobs.spawn(every(settings.poll_interval, cancel.clone(), move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.poll().await {
                    warn!(?e, "Scheduled task creation failed");
                }
            }
        }));

        let manager = self.clone();
        jobs.spawn(every(settings.liveness_interval, cancel.clone(), move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.disown_dead_tasks().await {
                    error!(?e, "Disowning dead tasks failed");
                }
                if let Err(e) = manager.release_old_queued_tasks().await {
                    error!(?e, "Releasing queued tasks failed");
                }
            }
        }));

        let manager = self.clone();
        jobs.spawn(every(settings.retention_interval, cancel.clone(), move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.inner.retention.exec().await {
                    error!(?e, "Deleting old tasks failed");
                }
            }
        }));

        cancel.cancelled().await;
        info!("Shutting down processor task manager");
        self.inner.creator.set_allow_creation(false);
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                error!(?e, "Periodic job did not stop cleanly");
            }
        }
        self.shutdown().await;
        Ok(())
    }
}

impl<S: TaskStore> SystemInfoSource for ProcessorTaskManager<S> {
    fn system_info(&self) -> SystemInfo {
        ProcessorTaskManager::system_info(self)
    }
}

async fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => job().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryClusterLock, StaticNodeDirectory};
    use crate::criteria::TaskPredicate;
    use crate::expression::{Condition, ExpressionOperator};
    use crate::filter::{ProcessorFilter, QueryData};
    use crate::meta::{FIELD_FEED, InMemoryMetaService, Meta, MetaStatus};
    use crate::search::InMemoryEventSearch;
    use crate::store::in_memory::InMemoryProcessorDb;
    use crate::task::TaskStatus;

    struct Harness {
        db: InMemoryProcessorDb,
        meta: InMemoryMetaService,
        nodes: StaticNodeDirectory,
        manager: ProcessorTaskManager<InMemoryProcessorDb>,
    }

    fn harness(settings: Settings) -> Harness {
        let db = InMemoryProcessorDb::new(3, Duration::from_millis(1));
        let meta = InMemoryMetaService::new();
        let nodes = StaticNodeDirectory::single(&settings.node_name);
        let collaborators = Collaborators {
            store: db.clone(),
            registry: Arc::new(db.clone()),
            meta: Arc::new(meta.clone()),
            search: Arc::new(InMemoryEventSearch::new()),
            cluster_lock: Arc::new(InMemoryClusterLock::new()),
            nodes: Arc::new(nodes.clone()),
        };
        let manager = ProcessorTaskManager::new(settings, collaborators);
        Harness {
            db,
            meta,
            nodes,
            manager,
        }
    }

    fn settings() -> Settings {
        Settings {
            node_name: "master".to_string(),
            queue_size: 100,
            cluster_lock_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Filter `id` selecting feed `feed`, with `metas` unlocked units of that feed.
    fn add_filter(h: &Harness, id: i32, priority: i32, feed: &str, metas: std::ops::RangeInclusive<i64>) {
        h.db.save_filter(ProcessorFilter::new(
            id,
            id,
            priority,
            QueryData::stream_store(ExpressionOperator::and().with_term(
                FIELD_FEED,
                Condition::Equals,
                feed,
            )),
        ));
        for meta_id in metas {
            h.meta
                .insert(Meta::new(meta_id, feed, MetaStatus::Unlocked, meta_id));
        }
    }

    #[tokio::test]
    async fn test_assign_serves_lower_priority_value_first() {
        let h = harness(settings());
        add_filter(&h, 1, 5, "P2", 1..=4);
        add_filter(&h, 2, 1, "P1", 5..=8);
        h.manager.startup().await;
        h.manager.create_tasks().await.unwrap();
        assert_eq!(h.manager.get_task_queue_size(), 8);

        let tasks = h
            .manager
            .assign_tasks(&Identity::ProcessingUser, "worker", 3)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.filter_id == 2));
        assert!(tasks
            .iter()
            .all(|t| t.status == TaskStatus::Assigned && t.node_name.as_deref() == Some("worker")));
        assert_eq!(h.manager.get_task_queue_size(), 5);
    }

    #[tokio::test]
    async fn test_worker_operations_need_processing_identity() {
        let h = harness(settings());
        let user = Identity::User("alice".to_string());
        let err = h.manager.assign_tasks(&user, "worker", 3).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        let err = h.manager.abandon_tasks(&user, "worker", &[]).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_abandoned_tasks_become_unowned() {
        let h = harness(settings());
        add_filter(&h, 1, 1, "FEED", 1..=2);
        h.manager.startup().await;
        h.manager.create_tasks().await.unwrap();
        let tasks = h
            .manager
            .assign_tasks(&Identity::ProcessingUser, "worker", 2)
            .await
            .unwrap();

        assert!(h
            .manager
            .abandon_tasks(&Identity::ProcessingUser, "worker", &tasks)
            .await
            .unwrap());
        for task in &tasks {
            let row = h.db.task(task.id).unwrap();
            assert_eq!(row.status, TaskStatus::Unprocessed);
            assert_eq!(row.node_name, None);
        }
    }

    #[tokio::test]
    async fn test_stale_abandon_leaves_finished_task() {
        let h = harness(settings());
        add_filter(&h, 1, 1, "FEED", 1..=1);
        h.manager.startup().await;
        h.manager.create_tasks().await.unwrap();
        let tasks = h
            .manager
            .assign_tasks(&Identity::ProcessingUser, "worker", 1)
            .await
            .unwrap();
        let task = &tasks[0];
        h.db.change_task_status(task, Some("worker"), TaskStatus::Complete, None, None)
            .await
            .unwrap()
            .unwrap();

        // the worker gives back the copy it was assigned
        assert!(!h
            .manager
            .abandon_tasks(&Identity::ProcessingUser, "worker", &tasks)
            .await
            .unwrap());
        let row = h.db.task(task.id).unwrap();
        assert_eq!(row.status, TaskStatus::Complete);
        assert_eq!(row.node_name.as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn test_scheduled_poll_only_on_master() {
        let h = harness(settings());
        add_filter(&h, 1, 1, "FEED", 1..=2);
        h.manager.startup().await;
        h.nodes.set_master(Some("other"));

        h.manager.poll().await.unwrap();
        assert_eq!(h.manager.get_task_queue_size(), 0);

        // forced passes ignore mastership
        h.manager.create_tasks().await.unwrap();
        assert_eq!(h.manager.get_task_queue_size(), 2);
    }

    #[tokio::test]
    async fn test_startup_and_shutdown() {
        let h = harness(settings());
        add_filter(&h, 1, 1, "FEED", 1..=2);

        // nothing is created before startup
        h.manager.create_tasks().await.unwrap();
        assert_eq!(h.manager.get_task_queue_size(), 0);

        h.manager.startup().await;
        h.manager.create_tasks().await.unwrap();
        assert_eq!(h.manager.get_task_queue_size(), 2);
        let info = h.manager.system_info();
        assert_eq!(info.overall_queue_size, 2);
        assert_eq!(info.queues[0].filter_id, 1);

        h.manager.shutdown().await;
        assert_eq!(h.manager.get_task_queue_size(), 0);
        // ownership in the store is kept
        let owned = h
            .manager
            .find(&FindTaskCriteria::new().with(TaskPredicate::Node(Some("master".to_string()))))
            .await
            .unwrap();
        assert_eq!(owned.values.len(), 2);

        // a restart takes it back
        h.manager.startup().await;
        let owned = h
            .manager
            .find(&FindTaskCriteria::new().with(TaskPredicate::Node(Some("master".to_string()))))
            .await
            .unwrap();
        assert!(owned.values.is_empty());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let h = harness(Settings {
            poll_interval: Duration::from_millis(10),
            liveness_interval: Duration::from_millis(10),
            retention_interval: Duration::from_millis(10),
            ..settings()
        });
        add_filter(&h, 1, 1, "FEED", 1..=3);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = h.manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let created = h.db.find(&FindTaskCriteria::new()).await.unwrap();
        assert_eq!(created.values.len(), 3);
        assert_eq!(h.manager.get_task_queue_size(), 0);
    }
}
