//! Read access to processor filters, owned by operators.

use async_trait::async_trait;

use crate::Result;
use crate::filter::ProcessorFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindFilterCriteria {
    /// Enabled and not deleted at filter and processor level.
    pub active: Option<bool>,
    pub deleted: Option<bool>,
    pub updated_before_ms: Option<i64>,
}

impl FindFilterCriteria {
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn deleted_before(threshold_ms: i64) -> Self {
        Self {
            deleted: Some(true),
            updated_before_ms: Some(threshold_ms),
            ..Default::default()
        }
    }

    pub fn matches(&self, filter: &ProcessorFilter) -> bool {
        let deleted = filter.deleted || filter.processor_deleted;
        self.active.is_none_or(|active| filter.is_active() == active)
            && self.deleted.is_none_or(|d| deleted == d)
            && self
                .updated_before_ms
                .is_none_or(|before| filter.update_time_ms < before)
    }
}

#[async_trait]
pub trait FilterRegistry: Send + Sync {
    async fn fetch(&self, id: i32) -> Result<Option<ProcessorFilter>>;

    async fn find_filters(&self, criteria: &FindFilterCriteria) -> Result<Vec<ProcessorFilter>>;

    /// Human readable pipeline name, for display only.
    async fn pipeline_name(&self, pipeline_uuid: &str) -> Result<Option<String>>;

    /// Hard delete. Fails with an integrity error while tasks still reference the filter.
    async fn delete(&self, id: i32) -> Result<()>;
}
