//! Distributed processor task scheduler.
//!
//! Processor filters select source-data units (streams) that a pipeline should process. On every
//! node a [`manager::ProcessorTaskManager`] keeps per-filter queues of ready tasks topped up:
//! - the master node periodically runs a creation pass under a cluster wide lock, reclaiming
//!   unowned tasks and creating new ones from each filter's criteria or event search
//! - worker nodes ask for tasks and are served highest priority filters first
//! - tasks owned by nodes that stopped reporting are handed back to the pool
//! - finished tasks and deleted filters are purged once old enough

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod error;
pub use crate::error::{Error, Result};

pub mod cluster;
pub mod config;
pub mod creator;
pub mod criteria;
pub mod expression;
pub mod filter;
pub mod liveness;
pub mod manager;
pub mod meta;
pub mod metrics;
mod progress;
pub mod queue;
pub mod ranges;
pub mod registry;
pub mod retention;
pub mod search;
pub mod store;
pub mod task;
pub mod tracker;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Runs a single node scheduler backed by in-memory collaborators until `cancel` fires.
pub async fn run(settings: config::Settings, cancel: CancellationToken) -> Result<()> {
    let db = store::in_memory::InMemoryProcessorDb::new(
        settings.status_update_attempts,
        settings.status_update_backoff,
    );
    let collaborators = creator::Collaborators {
        store: db.clone(),
        registry: Arc::new(db),
        meta: Arc::new(meta::InMemoryMetaService::new()),
        search: Arc::new(search::InMemoryEventSearch::new()),
        cluster_lock: Arc::new(cluster::InMemoryClusterLock::new()),
        nodes: Arc::new(cluster::StaticNodeDirectory::single(&settings.node_name)),
    };
    info!(node_name = %settings.node_name, queue_size = settings.queue_size, "Starting processor task manager");

    let manager = manager::ProcessorTaskManager::new(settings.clone(), collaborators);
    let admin = tokio::spawn(metrics::start_admin_server(
        settings.metrics_addr,
        Arc::new(manager.clone()),
        cancel.clone(),
    ));

    manager.run(cancel).await?;
    match admin.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(?e, "Admin server failed");
            Err(e)
        }
        Err(e) => Err(e.into()),
    }
}
