//! Cluster coordination consumed by the scheduler: a named cross-node lock and the directory of
//! nodes telling us who is master and who is alive.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A lock with at most one holder across the cluster. Not reentrant.
#[async_trait]
pub trait ClusterLockService: Send + Sync {
    /// Waits until `holder` owns `name`.
    async fn lock(&self, name: &str, holder: &str) -> Result<()>;

    async fn unlock(&self, name: &str, holder: &str) -> Result<()>;
}

/// Runs `section` while holding the cluster lock `name`. Gives up with [`Error::ClusterLock`] if
/// the lock is not acquired within `wait`. The lock is released whatever the section returns.
pub async fn with_cluster_lock<T, F, Fut>(
    service: &dyn ClusterLockService,
    name: &str,
    holder: &str,
    wait: Duration,
    section: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(wait, service.lock(name, holder))
        .await
        .map_err(|_| Error::ClusterLock(format!("timed out after {wait:?} waiting for {name}")))??;
    debug!(name, holder, "Acquired cluster lock");

    let result = section().await;

    if let Err(e) = service.unlock(name, holder).await {
        warn!(?e, name, "Failed to release cluster lock");
    }
    result
}

/// Single process stand-in for the cluster lock service.
#[derive(Debug, Default, Clone)]
pub struct InMemoryClusterLock {
    holders: Arc<Mutex<HashMap<String, String>>>,
    released: Arc<Notify>,
}

impl InMemoryClusterLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, name: &str) -> Option<String> {
        self.holders.lock().get(name).cloned()
    }
}

#[async_trait]
impl ClusterLockService for InMemoryClusterLock {
    async fn lock(&self, name: &str, holder: &str) -> Result<()> {
        loop {
            // register interest before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut holders = self.holders.lock();
                if !holders.contains_key(name) {
                    holders.insert(name.to_string(), holder.to_string());
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<()> {
        let mut holders = self.holders.lock();
        match holders.get(name) {
            Some(current) if current == holder => {
                holders.remove(name);
                drop(holders);
                self.released.notify_waiters();
                Ok(())
            }
            Some(current) => Err(Error::ClusterLock(format!(
                "{name} is held by {current}, not {holder}"
            ))),
            None => Err(Error::ClusterLock(format!("{name} is not locked"))),
        }
    }
}

/// Who is master and which nodes are currently enabled and alive.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Fails with [`Error::NodeNotFound`] or [`Error::NullClusterState`] when the cluster state
    /// is not known.
    async fn master_node(&self) -> Result<String>;

    async fn enabled_active_nodes(&self) -> Result<HashSet<String>>;
}

#[derive(Debug, Default)]
struct ClusterState {
    master: Option<String>,
    active: HashSet<String>,
    unreachable: bool,
}

/// Node directory whose answers are set by hand. Used for standalone nodes and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticNodeDirectory {
    state: Arc<RwLock<ClusterState>>,
}

impl StaticNodeDirectory {
    /// A one node cluster where `node_name` is master and active.
    pub fn single(node_name: &str) -> Self {
        let directory = Self::default();
        directory.set_master(Some(node_name));
        directory.set_active([node_name]);
        directory
    }

    pub fn set_master(&self, node_name: Option<&str>) {
        self.state.write().master = node_name.map(str::to_string);
    }

    pub fn set_active<'a>(&self, nodes: impl IntoIterator<Item = &'a str>) {
        self.state.write().active = nodes.into_iter().map(str::to_string).collect();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.write().unreachable = unreachable;
    }
}

#[async_trait]
impl NodeDirectory for StaticNodeDirectory {
    async fn master_node(&self) -> Result<String> {
        let state = self.state.read();
        if state.unreachable {
            return Err(Error::NullClusterState("cluster state unavailable".to_string()));
        }
        state
            .master
            .clone()
            .ok_or_else(|| Error::NodeNotFound("no master node elected".to_string()))
    }

    async fn enabled_active_nodes(&self) -> Result<HashSet<String>> {
        let state = self.state.read();
        if state.unreachable {
            return Err(Error::NullClusterState("cluster state unavailable".to_string()));
        }
        Ok(state.active.clone())
    }
}
