//! Event search collaborator. Resolves a query into event references, bounded by stream and
//! event limits.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::expression::ExpressionOperator;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub stream_id: i64,
    pub event_id: i64,
}

impl EventRef {
    pub fn new(stream_id: i64, event_id: i64) -> Self {
        Self {
            stream_id,
            event_id,
        }
    }
}

/// Search hits sorted by stream then event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRefs {
    pub refs: Vec<EventRef>,
    /// Some limit cut the result short.
    pub reached_limit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub expression: ExpressionOperator,
    /// Inclusive lower bound.
    pub min_event: EventRef,
    /// Inclusive upper bound.
    pub max_event: EventRef,
    pub max_streams: u64,
    pub max_events: u64,
    pub max_events_per_stream: u64,
}

#[async_trait]
pub trait EventSearch: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<EventRefs>;
}

/// Serves hits from a preloaded set of references. A query starting with `fail:` errors with
/// the rest of the query as message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSearch {
    events: Arc<RwLock<BTreeSet<EventRef>>>,
}

impl InMemoryEventSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_events(&self, stream_id: i64, event_ids: impl IntoIterator<Item = i64>) {
        let mut events = self.events.write();
        events.extend(event_ids.into_iter().map(|e| EventRef::new(stream_id, e)));
    }
}

#[async_trait]
impl EventSearch for InMemoryEventSearch {
    async fn search(&self, request: SearchRequest) -> Result<EventRefs> {
        if let Some(message) = request.query.strip_prefix("fail:") {
            return Err(Error::Search(message.trim().to_string()));
        }

        let events = self.events.read();
        let mut result = EventRefs::default();
        let mut streams = 0u64;
        let mut in_stream = 0u64;
        let mut current = None;

        for event in events.range(request.min_event..=request.max_event) {
            if current != Some(event.stream_id) {
                if streams == request.max_streams {
                    result.reached_limit = true;
                    break;
                }
                current = Some(event.stream_id);
                streams += 1;
                in_stream = 0;
            }
            if in_stream == request.max_events_per_stream {
                result.reached_limit = true;
                continue;
            }
            if result.refs.len() as u64 == request.max_events {
                result.reached_limit = true;
                break;
            }
            result.refs.push(*event);
            in_stream += 1;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_streams: u64, max_events: u64, per_stream: u64) -> SearchRequest {
        SearchRequest {
            query: "index".to_string(),
            expression: ExpressionOperator::and(),
            min_event: EventRef::new(2, 3),
            max_event: EventRef::new(i64::MAX, i64::MAX),
            max_streams,
            max_events,
            max_events_per_stream: per_stream,
        }
    }

    #[tokio::test]
    async fn test_search_honours_bounds_and_limits() {
        let search = InMemoryEventSearch::new();
        search.add_events(1, 1..=5);
        search.add_events(2, 1..=5);
        search.add_events(3, 1..=5);
        search.add_events(4, 1..=5);

        let all = search.search(request(10, 100, 100)).await.unwrap();
        assert_eq!(all.refs.first(), Some(&EventRef::new(2, 3)));
        assert_eq!(all.refs.len(), 3 + 5 + 5);
        assert!(!all.reached_limit);

        let capped = search.search(request(2, 100, 2)).await.unwrap();
        assert_eq!(capped.refs.len(), 4);
        assert!(capped.reached_limit);
    }

    #[tokio::test]
    async fn test_search_failure() {
        let search = InMemoryEventSearch::new();
        let mut req = request(1, 1, 1);
        req.query = "fail: index offline".to_string();
        let err = search.search(req).await.unwrap_err();
        assert_eq!(err, Error::Search("index offline".to_string()));
    }
}
