//! Standing rules that discover work, and their priority order.

use serde::{Deserialize, Serialize};

use crate::expression::ExpressionOperator;

/// Where a filter's expression is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Directly against the meta catalogue.
    StreamStore,
    /// Through the event search engine, yielding event-level ranges.
    Search { query: String },
}

/// Caps on how much work a search filter may ever produce. The first one reached completes the
/// filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub duration_ms: Option<i64>,
    pub stream_count: Option<i64>,
    pub event_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    pub data_source: DataSource,
    pub expression: ExpressionOperator,
    pub limits: Option<Limits>,
}

impl QueryData {
    pub fn stream_store(expression: ExpressionOperator) -> Self {
        Self {
            data_source: DataSource::StreamStore,
            expression,
            limits: None,
        }
    }

    pub fn search(query: impl Into<String>, expression: ExpressionOperator, limits: Limits) -> Self {
        Self {
            data_source: DataSource::Search {
                query: query.into(),
            },
            expression,
            limits: Some(limits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorFilter {
    pub id: i32,
    pub version: i32,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
    pub processor_id: i32,
    pub pipeline_uuid: String,
    /// Resolved for display only.
    pub pipeline_name: Option<String>,
    pub query_data: QueryData,
    /// Lower values are served first.
    pub priority: i32,
    pub enabled: bool,
    pub deleted: bool,
    pub processor_enabled: bool,
    pub processor_deleted: bool,
    pub reprocess: bool,
    pub min_meta_create_time_ms: Option<i64>,
    pub max_meta_create_time_ms: Option<i64>,
}

impl ProcessorFilter {
    pub fn new(id: i32, processor_id: i32, priority: i32, query_data: QueryData) -> Self {
        Self {
            id,
            version: 1,
            create_time_ms: 0,
            update_time_ms: 0,
            processor_id,
            pipeline_uuid: format!("pipeline-{processor_id}"),
            pipeline_name: None,
            query_data,
            priority,
            enabled: true,
            deleted: false,
            processor_enabled: true,
            processor_deleted: false,
            reprocess: false,
            min_meta_create_time_ms: None,
            max_meta_create_time_ms: None,
        }
    }

    /// Enabled and not deleted, at both the filter and the processor level.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted && self.processor_enabled && !self.processor_deleted
    }
}

/// Sorts so that lower priority values come first. The sort is stable and ties fall back to
/// creation time then id, so equal filters keep registry order.
pub fn sort_by_priority(filters: &mut [ProcessorFilter]) {
    filters.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.create_time_ms.cmp(&b.create_time_ms))
            .then(a.id.cmp(&b.id))
    });
}
