//! The catalogue of ingested source-data units ("meta").

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::expression::{ExpressionOperator, FieldSource};

pub const FIELD_ID: &str = "Id";
pub const FIELD_FEED: &str = "Feed";
pub const FIELD_TYPE: &str = "Type";
pub const FIELD_STATUS: &str = "Status";
pub const FIELD_CREATE_TIME: &str = "Create Time";
pub const FIELD_PARENT_ID: &str = "Parent Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaStatus {
    /// Fully written and usable.
    Unlocked,
    /// Still being written.
    Locked,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub id: i64,
    pub feed_name: String,
    pub type_name: String,
    pub status: MetaStatus,
    pub create_ms: i64,
    pub parent_id: Option<i64>,
}

impl Meta {
    pub fn new(id: i64, feed_name: &str, status: MetaStatus, create_ms: i64) -> Self {
        Self {
            id,
            feed_name: feed_name.to_string(),
            type_name: "Raw Events".to_string(),
            status,
            create_ms,
            parent_id: None,
        }
    }
}

impl FieldSource for Meta {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            FIELD_ID => Some(self.id.to_string()),
            FIELD_FEED => Some(self.feed_name.clone()),
            FIELD_TYPE => Some(self.type_name.clone()),
            FIELD_STATUS => Some(format!("{:?}", self.status)),
            FIELD_CREATE_TIME => Some(self.create_ms.to_string()),
            FIELD_PARENT_ID => self.parent_id.map(|id| id.to_string()),
            _ => None,
        }
    }
}

/// Selects units for the direct creation path. Results come back sorted by id.
#[derive(Debug, Clone, PartialEq)]
pub struct FindMetaCriteria {
    pub expression: ExpressionOperator,
    pub min_meta_id: i64,
    pub min_create_ms: Option<i64>,
    pub max_create_ms: Option<i64>,
    pub statuses: Vec<MetaStatus>,
    pub limit: usize,
}

#[async_trait]
pub trait MetaService: Send + Sync {
    async fn get_meta(&self, id: i64) -> Result<Option<Meta>>;

    async fn find(&self, criteria: &FindMetaCriteria) -> Result<Vec<Meta>>;

    /// Like [`MetaService::find`] but the expression and statuses apply to the parent unit,
    /// and children of deleted parents never match.
    async fn find_reprocess(&self, criteria: &FindMetaCriteria) -> Result<Vec<Meta>>;

    async fn get_max_id(&self) -> Result<Option<i64>>;

    /// The subset of `ids` that is currently unlocked.
    async fn find_unlocked(&self, ids: &[i64]) -> Result<Vec<Meta>>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMetaService {
    metas: Arc<RwLock<BTreeMap<i64, Meta>>>,
}

impl InMemoryMetaService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: Meta) {
        self.metas.write().insert(meta.id, meta);
    }

    pub fn set_status(&self, id: i64, status: MetaStatus) {
        if let Some(meta) = self.metas.write().get_mut(&id) {
            meta.status = status;
        }
    }

    fn in_window(meta: &Meta, criteria: &FindMetaCriteria) -> bool {
        criteria.min_create_ms.is_none_or(|min| meta.create_ms >= min)
            && criteria.max_create_ms.is_none_or(|max| meta.create_ms <= max)
    }
}

#[async_trait]
impl MetaService for InMemoryMetaService {
    async fn get_meta(&self, id: i64) -> Result<Option<Meta>> {
        Ok(self.metas.read().get(&id).cloned())
    }

    async fn find(&self, criteria: &FindMetaCriteria) -> Result<Vec<Meta>> {
        Ok(self
            .metas
            .read()
            .range(criteria.min_meta_id..)
            .map(|(_, meta)| meta)
            .filter(|meta| criteria.statuses.contains(&meta.status))
            .filter(|meta| Self::in_window(meta, criteria))
            .filter(|meta| criteria.expression.matches(*meta))
            .take(criteria.limit)
            .cloned()
            .collect())
    }

    async fn find_reprocess(&self, criteria: &FindMetaCriteria) -> Result<Vec<Meta>> {
        let metas = self.metas.read();
        Ok(metas
            .range(criteria.min_meta_id..)
            .map(|(_, meta)| meta)
            .filter(|meta| meta.status != MetaStatus::Deleted)
            .filter(|meta| {
                meta.parent_id
                    .and_then(|parent_id| metas.get(&parent_id))
                    .is_some_and(|parent| {
                        parent.status != MetaStatus::Deleted
                            && criteria.statuses.contains(&parent.status)
                            && Self::in_window(parent, criteria)
                            && criteria.expression.matches(parent)
                    })
            })
            .take(criteria.limit)
            .cloned()
            .collect())
    }

    async fn get_max_id(&self) -> Result<Option<i64>> {
        Ok(self.metas.read().keys().next_back().copied())
    }

    async fn find_unlocked(&self, ids: &[i64]) -> Result<Vec<Meta>> {
        let metas = self.metas.read();
        Ok(ids
            .iter()
            .filter_map(|id| metas.get(id))
            .filter(|meta| meta.status == MetaStatus::Unlocked)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Condition;

    fn criteria(expression: ExpressionOperator, min_meta_id: i64) -> FindMetaCriteria {
        FindMetaCriteria {
            expression,
            min_meta_id,
            min_create_ms: None,
            max_create_ms: None,
            statuses: vec![MetaStatus::Unlocked, MetaStatus::Locked],
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_find_past_watermark() {
        let service = InMemoryMetaService::new();
        for id in 1..=5 {
            service.insert(Meta::new(id, "FEED", MetaStatus::Unlocked, id * 10));
        }
        service.insert(Meta::new(6, "OTHER", MetaStatus::Locked, 60));
        service.set_status(2, MetaStatus::Deleted);

        let expr = ExpressionOperator::and().with_term(FIELD_FEED, Condition::Equals, "FEED");
        let found = service.find(&criteria(expr, 2)).await.unwrap();
        let ids: Vec<i64> = found.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(service.get_max_id().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_reprocess_skips_deleted_parents() {
        let service = InMemoryMetaService::new();
        service.insert(Meta::new(1, "FEED", MetaStatus::Unlocked, 10));
        service.insert(Meta::new(2, "FEED", MetaStatus::Deleted, 20));
        let mut child_of_live = Meta::new(3, "FEED", MetaStatus::Unlocked, 30);
        child_of_live.parent_id = Some(1);
        let mut child_of_deleted = Meta::new(4, "FEED", MetaStatus::Unlocked, 40);
        child_of_deleted.parent_id = Some(2);
        service.insert(child_of_live);
        service.insert(child_of_deleted);

        let expr = ExpressionOperator::and().with_term(FIELD_FEED, Condition::Equals, "FEED");
        let found = service.find_reprocess(&criteria(expr, 0)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 3);
    }

    #[tokio::test]
    async fn test_find_unlocked() {
        let service = InMemoryMetaService::new();
        service.insert(Meta::new(1, "FEED", MetaStatus::Unlocked, 10));
        service.insert(Meta::new(2, "FEED", MetaStatus::Locked, 20));
        let unlocked = service.find_unlocked(&[1, 2, 3]).await.unwrap();
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].id, 1);
    }
}
