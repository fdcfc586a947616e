//! Node settings, read from `PROCESSOR_*` environment variables on top of [`Settings::default`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

const ENV_NODE_NAME: &str = "PROCESSOR_NODE_NAME";
const ENV_QUEUE_SIZE: &str = "PROCESSOR_QUEUE_SIZE";
const ENV_ASSIGN_TASKS: &str = "PROCESSOR_ASSIGN_TASKS";
const ENV_CREATE_TASKS: &str = "PROCESSOR_CREATE_TASKS";
const ENV_FILL_TASK_QUEUE: &str = "PROCESSOR_FILL_TASK_QUEUE";
const ENV_DISOWN_DEAD_TASKS_AFTER_MS: &str = "PROCESSOR_DISOWN_DEAD_TASKS_AFTER_MS";
const ENV_DELETE_AGE_MS: &str = "PROCESSOR_DELETE_AGE_MS";
const ENV_POLL_INTERVAL_MS: &str = "PROCESSOR_POLL_INTERVAL_MS";
const ENV_LIVENESS_INTERVAL_MS: &str = "PROCESSOR_LIVENESS_INTERVAL_MS";
const ENV_RETENTION_INTERVAL_MS: &str = "PROCESSOR_RETENTION_INTERVAL_MS";
const ENV_SEARCH_POOL_SIZE: &str = "PROCESSOR_SEARCH_POOL_SIZE";
const ENV_SEARCH_MAX_EVENTS: &str = "PROCESSOR_SEARCH_MAX_EVENTS";
const ENV_SEARCH_MAX_EVENTS_PER_STREAM: &str = "PROCESSOR_SEARCH_MAX_EVENTS_PER_STREAM";
const ENV_STATUS_UPDATE_ATTEMPTS: &str = "PROCESSOR_STATUS_UPDATE_ATTEMPTS";
const ENV_STATUS_UPDATE_BACKOFF_MS: &str = "PROCESSOR_STATUS_UPDATE_BACKOFF_MS";
const ENV_CLUSTER_LOCK_TIMEOUT_MS: &str = "PROCESSOR_CLUSTER_LOCK_TIMEOUT_MS";
const ENV_METRICS_ADDR: &str = "PROCESSOR_METRICS_ADDR";

/// Rows handled per statement when releasing, reclaiming or inserting tasks.
pub const BATCH_SIZE: usize = 1000;
/// Longest error text stored on a tracker before it is cut short.
pub const MAX_ERROR_LENGTH: usize = 200;
/// Event ranges kept per source-data unit in a single creation pass.
pub const MAX_RANGES_PER_STREAM: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub node_name: String,
    /// Number of tasks the node tries to keep queued across all filters.
    pub queue_size: usize,
    pub assign_tasks: bool,
    pub create_tasks: bool,
    /// Reclaim already persisted but unowned tasks before creating new ones.
    pub fill_task_queue: bool,
    /// Grace period before tasks of a silent node are disowned.
    pub disown_dead_tasks_after: Duration,
    /// Age after which finished tasks and deleted filters are purged.
    pub delete_age: Duration,
    pub poll_interval: Duration,
    pub liveness_interval: Duration,
    pub retention_interval: Duration,
    pub search: SearchSettings,
    pub status_update_attempts: usize,
    pub status_update_backoff: Duration,
    pub cluster_lock_timeout: Duration,
    pub metrics_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    /// Concurrent event searches allowed during one creation pass.
    pub pool_size: usize,
    pub max_events: u64,
    pub max_events_per_stream: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            pool_size: 3,
            max_events: 1_000_000,
            max_events_per_stream: 1000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            queue_size: 1000,
            assign_tasks: true,
            create_tasks: true,
            fill_task_queue: true,
            disown_dead_tasks_after: Duration::from_secs(10 * 60),
            delete_age: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(10),
            retention_interval: Duration::from_secs(60),
            search: SearchSettings::default(),
            status_update_attempts: 100,
            status_update_backoff: Duration::from_millis(1000),
            cluster_lock_timeout: Duration::from_secs(30),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

fn parse<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    env_vars
        .get(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| {
                Error::ParseConfig(format!("Parsing {key}(set to '{value}'): {e:?}"))
            })
        })
        .transpose()
}

fn parse_millis(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<Duration>, Error> {
    Ok(parse::<u64>(env_vars, key)?.map(Duration::from_millis))
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self, Self::Error> {
        let mut settings = Settings::default();

        if let Some(node_name) = env_vars.get(ENV_NODE_NAME) {
            if node_name.trim().is_empty() {
                return Err(Error::ParseConfig(format!("{ENV_NODE_NAME} is empty")));
            }
            settings.node_name = node_name.trim().to_string();
        }
        if let Some(queue_size) = parse::<usize>(&env_vars, ENV_QUEUE_SIZE)? {
            settings.queue_size = queue_size.max(1);
        }
        if let Some(v) = parse(&env_vars, ENV_ASSIGN_TASKS)? {
            settings.assign_tasks = v;
        }
        if let Some(v) = parse(&env_vars, ENV_CREATE_TASKS)? {
            settings.create_tasks = v;
        }
        if let Some(v) = parse(&env_vars, ENV_FILL_TASK_QUEUE)? {
            settings.fill_task_queue = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_DISOWN_DEAD_TASKS_AFTER_MS)? {
            settings.disown_dead_tasks_after = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_DELETE_AGE_MS)? {
            settings.delete_age = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_POLL_INTERVAL_MS)? {
            settings.poll_interval = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_LIVENESS_INTERVAL_MS)? {
            settings.liveness_interval = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_RETENTION_INTERVAL_MS)? {
            settings.retention_interval = v;
        }
        if let Some(v) = parse::<usize>(&env_vars, ENV_SEARCH_POOL_SIZE)? {
            settings.search.pool_size = v.max(1);
        }
        if let Some(v) = parse(&env_vars, ENV_SEARCH_MAX_EVENTS)? {
            settings.search.max_events = v;
        }
        if let Some(v) = parse(&env_vars, ENV_SEARCH_MAX_EVENTS_PER_STREAM)? {
            settings.search.max_events_per_stream = v;
        }
        if let Some(v) = parse(&env_vars, ENV_STATUS_UPDATE_ATTEMPTS)? {
            settings.status_update_attempts = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_STATUS_UPDATE_BACKOFF_MS)? {
            settings.status_update_backoff = v;
        }
        if let Some(v) = parse_millis(&env_vars, ENV_CLUSTER_LOCK_TIMEOUT_MS)? {
            settings.cluster_lock_timeout = v;
        }
        if let Some(v) = parse(&env_vars, ENV_METRICS_ADDR)? {
            settings.metrics_addr = v;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let settings: Settings = HashMap::new().try_into().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.search.pool_size, 3);
        assert_eq!(settings.status_update_attempts, 100);
    }

    #[test]
    fn test_env_overrides() {
        let env_vars: HashMap<String, String> = [
            (ENV_NODE_NAME, "node7"),
            (ENV_QUEUE_SIZE, "50"),
            (ENV_CREATE_TASKS, "false"),
            (ENV_DISOWN_DEAD_TASKS_AFTER_MS, "1500"),
            (ENV_METRICS_ADDR, "127.0.0.1:9100"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = Settings::try_from(env_vars).unwrap();
        assert_eq!(settings.node_name, "node7");
        assert_eq!(settings.queue_size, 50);
        assert!(!settings.create_tasks);
        assert!(settings.assign_tasks);
        assert_eq!(settings.disown_dead_tasks_after, Duration::from_millis(1500));
        assert_eq!(settings.metrics_addr.port(), 9100);
    }

    #[test]
    fn test_invalid_value_is_parse_error() {
        let env_vars = HashMap::from([(ENV_QUEUE_SIZE.to_string(), "lots".to_string())]);
        let err = Settings::try_from(env_vars).unwrap_err();
        assert!(matches!(err, Error::ParseConfig(_)));
    }

    #[test]
    fn test_queue_size_never_zero() {
        let env_vars = HashMap::from([(ENV_QUEUE_SIZE.to_string(), "0".to_string())]);
        let settings = Settings::try_from(env_vars).unwrap();
        assert_eq!(settings.queue_size, 1);
    }
}
