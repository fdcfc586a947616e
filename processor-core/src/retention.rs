//! Purges finished work once a creation pass has scheduled a sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::{ClusterLockService, with_cluster_lock};
use crate::registry::{FilterRegistry, FindFilterCriteria};
use crate::store::TaskStore;
use crate::tracker::TrackerStatus;
use crate::{Error, Result, millis, now_ms};

/// Cluster lock serialising retention sweeps across nodes.
pub const DELETE_LOCK: &str = "ProcessorTaskDeleteExecutor";

pub struct TaskRetention<S> {
    node_name: String,
    store: S,
    registry: Arc<dyn FilterRegistry>,
    cluster_lock: Arc<dyn ClusterLockService>,
    delete_age: Duration,
    lock_timeout: Duration,
    next_delete_ms: Arc<AtomicI64>,
}

impl<S: TaskStore> TaskRetention<S> {
    pub fn new(
        node_name: impl Into<String>,
        store: S,
        registry: Arc<dyn FilterRegistry>,
        cluster_lock: Arc<dyn ClusterLockService>,
        delete_age: Duration,
        lock_timeout: Duration,
        next_delete_ms: Arc<AtomicI64>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            registry,
            cluster_lock,
            delete_age,
            lock_timeout,
            next_delete_ms,
        }
    }

    /// Runs a sweep if one is due. Returns whether it ran.
    pub async fn exec(&self) -> Result<bool> {
        let next = self.next_delete_ms.load(Ordering::Acquire);
        if next == 0 || now_ms() < next {
            return Ok(false);
        }

        with_cluster_lock(
            self.cluster_lock.as_ref(),
            DELETE_LOCK,
            &self.node_name,
            self.lock_timeout,
            || self.delete_old(),
        )
        .await?;
        // the next creation pass schedules the following sweep
        self.next_delete_ms.store(0, Ordering::Release);
        Ok(true)
    }

    async fn delete_old(&self) -> Result<()> {
        let threshold_ms = now_ms() - millis(self.delete_age);
        let logically_deleted = self
            .store
            .logical_delete_for_deleted_filters(threshold_ms)
            .await?;
        let physically_deleted = self.store.physically_delete_old_tasks(threshold_ms).await?;
        let filters_deleted = self.delete_old_filters(threshold_ms).await?;
        info!(
            logically_deleted,
            physically_deleted,
            filters_deleted,
            threshold_ms,
            "Deleted old processor tasks"
        );
        Ok(())
    }

    /// Removes complete filters that have not been polled since `threshold_ms` and no longer
    /// have tasks.
    async fn delete_old_filters(&self, threshold_ms: i64) -> Result<usize> {
        let mut deleted = 0;
        for filter in self
            .registry
            .find_filters(&FindFilterCriteria::default())
            .await?
        {
            let tracker = self.store.load_tracker(filter.id).await?;
            let old = tracker.last_poll_ms.is_some_and(|t| t < threshold_ms);
            if tracker.status != TrackerStatus::Complete || !old {
                continue;
            }
            match self.registry.delete(filter.id).await {
                Ok(()) => deleted += 1,
                Err(Error::Integrity(reason)) => {
                    debug!(filter_id = filter.id, %reason, "Filter still has tasks, keeping it");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterLock;
    use crate::criteria::FindTaskCriteria;
    use crate::expression::ExpressionOperator;
    use crate::filter::{ProcessorFilter, QueryData};
    use crate::meta::{Meta, MetaStatus};
    use crate::store::NewTasks;
    use crate::store::in_memory::InMemoryProcessorDb;
    use crate::task::{TaskCandidate, TaskStatus};

    fn retention(db: &InMemoryProcessorDb, next_delete_ms: &Arc<AtomicI64>) -> TaskRetention<InMemoryProcessorDb> {
        TaskRetention::new(
            "node1",
            db.clone(),
            Arc::new(db.clone()),
            Arc::new(InMemoryClusterLock::new()),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Arc::clone(next_delete_ms),
        )
    }

    #[tokio::test]
    async fn test_not_due_does_nothing() {
        let db = InMemoryProcessorDb::default();
        let next = Arc::new(AtomicI64::new(0));
        assert!(!retention(&db, &next).exec().await.unwrap());
        next.store(now_ms() + 60_000, Ordering::Release);
        assert!(!retention(&db, &next).exec().await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_work_and_resets_schedule() {
        let db = InMemoryProcessorDb::default();
        let filter = ProcessorFilter::new(1, 1, 1, QueryData::stream_store(ExpressionOperator::and()));
        db.save_filter(filter.clone());
        let tracker = db.load_tracker(1).await.unwrap();
        let created = db
            .create_tasks(NewTasks {
                filter: &filter,
                tracker,
                candidates: vec![TaskCandidate::whole(Meta::new(1, "FEED", MetaStatus::Unlocked, 1))],
                node_name: "node1",
                stream_query_time_ms: 0,
                max_meta_id: None,
                assign_new_tasks: true,
            })
            .await
            .unwrap();
        let task = &created.available_tasks[0];
        db.change_task_status(task, Some("node1"), TaskStatus::Complete, None, None)
            .await
            .unwrap()
            .unwrap();
        db.set_status_time(task.id, Some(1));

        let mut tracker = db.load_tracker(1).await.unwrap();
        tracker.status = TrackerStatus::Complete;
        tracker.last_poll_ms = Some(1);
        db.update_tracker(tracker).await.unwrap();

        let next = Arc::new(AtomicI64::new(1));
        assert!(retention(&db, &next).exec().await.unwrap());
        assert_eq!(next.load(Ordering::Acquire), 0);
        assert!(db.find(&FindTaskCriteria::new()).await.unwrap().values.is_empty());
        assert!(FilterRegistry::fetch(&db, 1).await.unwrap().is_none());
    }
}
