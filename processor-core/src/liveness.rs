//! Dead-node detection. The master remembers when it last saw each node alive and takes back
//! the tasks of nodes that have been silent for longer than the grace period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cluster::NodeDirectory;
use crate::creator::TaskCreator;
use crate::metrics::processor_metrics;
use crate::store::TaskStore;
use crate::{Result, millis, now_ms};

#[derive(Debug)]
struct Contacts {
    last_contact_ms: HashMap<String, i64>,
    /// Starts at creation time, so a new master watches for a full grace period before it
    /// reclaims anything.
    last_disowned_ms: i64,
}

pub struct NodeLivenessMonitor<S> {
    node_name: String,
    store: S,
    nodes: Arc<dyn NodeDirectory>,
    creator: TaskCreator<S>,
    grace_period: Duration,
    contacts: Mutex<Contacts>,
}

impl<S: TaskStore> NodeLivenessMonitor<S> {
    pub fn new(
        node_name: impl Into<String>,
        store: S,
        nodes: Arc<dyn NodeDirectory>,
        creator: TaskCreator<S>,
        grace_period: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            nodes,
            creator,
            grace_period,
            contacts: Mutex::new(Contacts {
                last_contact_ms: HashMap::new(),
                last_disowned_ms: now_ms(),
            }),
        }
    }

    #[cfg(test)]
    fn set_last_disowned_ms(&self, last_disowned_ms: i64) {
        self.contacts.lock().last_disowned_ms = last_disowned_ms;
    }

    /// Reclaims tasks owned by nodes not seen within the grace period. Only the master sweeps.
    /// An unknown cluster state skips the sweep.
    pub async fn disown_dead_tasks(&self) -> Result<u64> {
        match self.try_disown_dead_tasks().await {
            Err(e) if e.is_node_state_unknown() => {
                debug!(?e, "Cluster state unknown, skipping disown sweep");
                Ok(0)
            }
            result => result,
        }
    }

    async fn try_disown_dead_tasks(&self) -> Result<u64> {
        if self.nodes.master_node().await? != self.node_name {
            return Ok(0);
        }
        let active = self.nodes.enabled_active_nodes().await?;
        let now = now_ms();
        let disown_age_ms = now - millis(self.grace_period);

        let retain: HashSet<String> = {
            let mut contacts = self.contacts.lock();
            for node in active {
                contacts.last_contact_ms.insert(node, now);
            }
            if contacts.last_disowned_ms >= disown_age_ms {
                return Ok(0);
            }
            contacts.last_disowned_ms = now;
            contacts
                .last_contact_ms
                .retain(|_, last_contact| *last_contact >= disown_age_ms);
            contacts.last_contact_ms.keys().cloned().collect()
        };

        let disowned = self.store.retain_owned_tasks(&retain, disown_age_ms).await?;
        if disowned > 0 {
            info!(disowned, live_nodes = retain.len(), "Disowned tasks of dead nodes");
            processor_metrics().tasks_disowned.inc_by(disowned);
        }
        Ok(disowned)
    }

    /// A node that is no longer master gives its queued tasks back so the new master can hand
    /// them out. A pass still running on this node is let finish first.
    pub async fn release_old_queued_tasks(&self) -> Result<u64> {
        match self.nodes.master_node().await {
            Ok(master) if master == self.node_name => Ok(0),
            Ok(_) if self.creator.queues().filter_ids().is_empty() => Ok(0),
            Ok(master) => {
                info!(master, "No longer master, releasing queued tasks");
                self.creator.release_all_queues().await
            }
            Err(e) if e.is_node_state_unknown() => {
                debug!(?e, "Cluster state unknown, keeping queued tasks");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}
