//! In-memory per-filter FIFOs of tasks that are persisted, owned by this node and ready to hand
//! out. Nothing here is durable, queues are rebuilt from the store after a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::Result;
use crate::config::BATCH_SIZE;
use crate::metrics::{filter_labels, processor_metrics};
use crate::store::TaskStore;
use crate::task::ProcessorTask;

#[derive(Debug, Default)]
pub struct ProcessorTaskQueue {
    tasks: Mutex<VecDeque<ProcessorTask>>,
    /// Set while a creation pass is topping this queue up.
    filling: AtomicBool,
}

impl ProcessorTaskQueue {
    pub fn poll(&self) -> Option<ProcessorTask> {
        self.tasks.lock().pop_front()
    }

    pub fn add_all(&self, tasks: impl IntoIterator<Item = ProcessorTask>) {
        self.tasks.lock().extend(tasks);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    fn drain(&self, max: usize) -> Vec<ProcessorTask> {
        let mut tasks = self.tasks.lock();
        let n = max.min(tasks.len());
        tasks.drain(..n).collect()
    }

    /// Claims the right to fill this queue. Only one caller wins until [`Self::set_filling`]
    /// clears the flag.
    pub fn compare_and_set_filling(&self, expected: bool, update: bool) -> bool {
        self.filling
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_filling(&self, filling: bool) {
        self.filling.store(filling, Ordering::Release);
    }

    pub fn is_filling(&self) -> bool {
        self.filling.load(Ordering::Acquire)
    }
}

/// Filter id to queue.
#[derive(Debug, Default)]
pub struct TaskQueues {
    queues: RwLock<HashMap<i32, Arc<ProcessorTaskQueue>>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filter_id: i32) -> Option<Arc<ProcessorTaskQueue>> {
        self.queues.read().get(&filter_id).map(Arc::clone)
    }

    pub fn get_or_create(&self, filter_id: i32) -> Arc<ProcessorTaskQueue> {
        if let Some(queue) = self.get(filter_id) {
            return queue;
        }
        Arc::clone(self.queues.write().entry(filter_id).or_default())
    }

    pub fn filter_ids(&self) -> Vec<i32> {
        self.queues.read().keys().copied().collect()
    }

    /// Queue depth per filter.
    pub fn sizes(&self) -> Vec<(i32, usize)> {
        self.queues
            .read()
            .iter()
            .map(|(id, queue)| (*id, queue.len()))
            .collect()
    }

    pub fn total_len(&self) -> usize {
        self.queues.read().values().map(|q| q.len()).sum()
    }

    /// Forgets every queued task. Ownership in the store is left as is.
    pub fn clear(&self) {
        let metrics = processor_metrics();
        for (filter_id, _) in self.queues.write().drain() {
            metrics.filter_queue_size.remove(&filter_labels(filter_id));
        }
    }

    /// Removes the queue of a filter and gives its tasks back to the store, in batches.
    pub async fn release_filter<S: TaskStore>(&self, filter_id: i32, store: &S) -> Result<u64> {
        let Some(queue) = self.queues.write().remove(&filter_id) else {
            return Ok(0);
        };
        processor_metrics()
            .filter_queue_size
            .remove(&filter_labels(filter_id));
        let mut released = 0;
        loop {
            let batch = queue.drain(BATCH_SIZE);
            if batch.is_empty() {
                break;
            }
            let ids: Vec<i64> = batch.iter().map(|t| t.id).collect();
            released += store.release_tasks(&ids).await?;
        }
        debug!(filter_id, released, "Released queued tasks of filter");
        Ok(released)
    }

    pub async fn release_all<S: TaskStore>(&self, store: &S) -> Result<u64> {
        let mut released = 0;
        for filter_id in self.filter_ids() {
            released += self.release_filter(filter_id, store).await?;
        }
        if released > 0 {
            info!(released, "Released all queued tasks");
        }
        Ok(released)
    }
}
