//! Prometheus metrics for the task scheduler and the admin HTTP endpoints serving them.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;
use crate::manager::SystemInfo;

const TASK_QUEUE_SIZE: &str = "processor_task_queue_size";
const FILTER_QUEUE_SIZE: &str = "processor_filter_task_queue_size";
const TASKS_CREATED: &str = "processor_tasks_created";
const TASKS_ASSIGNED: &str = "processor_tasks_assigned";
const TASKS_ABANDONED: &str = "processor_tasks_abandoned";
const TASKS_DISOWNED: &str = "processor_tasks_disowned";
const CREATION_PASS_DURATION: &str = "processor_creation_pass_duration_seconds";

pub(crate) const FILTER_ID_LABEL: &str = "filter_id";

struct GlobalRegistry {
    // each metric registers exactly once
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

pub(crate) struct ProcessorMetrics {
    pub(crate) task_queue_size: Gauge,
    pub(crate) filter_queue_size: Family<Vec<(String, String)>, Gauge>,
    pub(crate) tasks_created: Counter,
    pub(crate) tasks_assigned: Counter,
    pub(crate) tasks_abandoned: Counter,
    pub(crate) tasks_disowned: Counter,
    pub(crate) creation_pass_duration: Histogram,
}

impl ProcessorMetrics {
    fn new() -> Self {
        let metrics = Self {
            task_queue_size: Gauge::default(),
            filter_queue_size: Family::default(),
            tasks_created: Counter::default(),
            tasks_assigned: Counter::default(),
            tasks_abandoned: Counter::default(),
            tasks_disowned: Counter::default(),
            creation_pass_duration: Histogram::new(exponential_buckets(0.01, 2.0, 14)),
        };
        let mut registry = global_registry().registry.lock();
        registry.register(
            TASK_QUEUE_SIZE,
            "Tasks queued on this node across all filters",
            metrics.task_queue_size.clone(),
        );
        registry.register(
            FILTER_QUEUE_SIZE,
            "Tasks queued on this node per filter",
            metrics.filter_queue_size.clone(),
        );
        registry.register(
            TASKS_CREATED,
            "Tasks persisted by creation passes",
            metrics.tasks_created.clone(),
        );
        registry.register(
            TASKS_ASSIGNED,
            "Tasks handed to worker nodes",
            metrics.tasks_assigned.clone(),
        );
        registry.register(
            TASKS_ABANDONED,
            "Tasks given back by worker nodes",
            metrics.tasks_abandoned.clone(),
        );
        registry.register(
            TASKS_DISOWNED,
            "Tasks reclaimed from dead nodes",
            metrics.tasks_disowned.clone(),
        );
        registry.register(
            CREATION_PASS_DURATION,
            "Duration of task creation passes",
            metrics.creation_pass_duration.clone(),
        );
        metrics
    }
}

static PROCESSOR_METRICS: OnceLock<ProcessorMetrics> = OnceLock::new();

pub(crate) fn processor_metrics() -> &'static ProcessorMetrics {
    PROCESSOR_METRICS.get_or_init(ProcessorMetrics::new)
}

pub(crate) fn filter_labels(filter_id: i32) -> Vec<(String, String)> {
    vec![(FILTER_ID_LABEL.to_string(), filter_id.to_string())]
}

/// Source of the `/sysinfo` payload.
pub trait SystemInfoSource: Send + Sync {
    fn system_info(&self) -> SystemInfo;
}

/// Snapshot of the global registry in the OpenMetrics text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &global_registry().registry.lock()) {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        Body::from(buffer),
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn sysinfo(State(source): State<Arc<dyn SystemInfoSource>>) -> Json<SystemInfo> {
    Json(source.system_info())
}

pub fn admin_router(source: Arc<dyn SystemInfoSource>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/sysinfo", get(sysinfo))
        .with_state(source)
}

/// Serves the admin router until `cancel` fires.
pub async fn start_admin_server(
    addr: SocketAddr,
    source: Arc<dyn SystemInfoSource>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding admin server to {addr}: {e}")))?;
    info!(%addr, "Admin server listening");
    axum::serve(listener, admin_router(source))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Serving admin endpoints: {e}")))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::manager::QueueInfo;

    struct FixedInfo;

    impl SystemInfoSource for FixedInfo {
        fn system_info(&self) -> SystemInfo {
            SystemInfo {
                queues: vec![QueueInfo {
                    filter_id: 3,
                    pipeline_name: Some("Index".to_string()),
                    priority: 1,
                    queue_size: 4,
                }],
                overall_queue_size: 4,
            }
        }
    }

    #[tokio::test]
    async fn test_metrics_handler_exposes_registered_metrics() {
        processor_metrics().tasks_created.inc_by(2);
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(TASKS_CREATED));
    }

    #[tokio::test]
    async fn test_livez() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_sysinfo_route() {
        let router = admin_router(Arc::new(FixedInfo));
        let response = router
            .oneshot(Request::builder().uri("/sysinfo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["overall_queue_size"], 4);
        assert_eq!(info["queues"][0]["pipeline_name"], "Index");
    }
}
