//! Task queries and paged results.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Inclusive lower and exclusive upper bound in epoch millis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl TimeRange {
    pub fn before(to: i64) -> Self {
        Self { from: None, to: Some(to) }
    }

    pub fn contains(&self, value: Option<i64>) -> bool {
        match value {
            Some(v) => self.from.is_none_or(|from| v >= from) && self.to.is_none_or(|to| v < to),
            None => self.from.is_none() && self.to.is_none(),
        }
    }
}

/// One condition on a task row. Filter attributes are joined in by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPredicate {
    IdGreaterThan(i64),
    IdIn(HashSet<i64>),
    Status(Vec<TaskStatus>),
    /// `None` matches unowned tasks.
    Node(Option<String>),
    FilterId(i32),
    ProcessorId(i32),
    MetaId(i64),
    Feed(String),
    Pipeline(String),
    Priority(i32),
    CreateTime(TimeRange),
    StatusTime(TimeRange),
    StartTime(TimeRange),
    EndTime(TimeRange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Id,
    CreateTime,
    StatusTime,
    Status,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub length: Option<usize>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            length: None,
        }
    }
}

impl PageRequest {
    pub fn first(length: usize) -> Self {
        Self {
            offset: 0,
            length: Some(length),
        }
    }
}

/// All predicates must hold. Default order is ascending id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindTaskCriteria {
    pub predicates: Vec<TaskPredicate>,
    pub sort: Vec<Sort>,
    pub page: PageRequest,
}

impl FindTaskCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: TaskPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn sort_by(mut self, field: SortField, descending: bool) -> Self {
        self.sort.push(Sort { field, descending });
        self
    }

    pub fn page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    pub offset: usize,
    pub length: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage<T> {
    pub values: Vec<T>,
    pub page_response: PageResponse,
}

impl<T> ResultPage<T> {
    /// Cuts one page out of the full, already sorted result.
    pub fn from_sorted(all: Vec<T>, page: PageRequest) -> Self {
        let total = all.len();
        let values: Vec<T> = all
            .into_iter()
            .skip(page.offset)
            .take(page.length.unwrap_or(usize::MAX))
            .collect();
        Self {
            page_response: PageResponse {
                offset: page.offset,
                length: values.len(),
                total,
            },
            values,
        }
    }
}

/// Task counts grouped by feed, pipeline, priority and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorTaskSummary {
    pub feed: Option<String>,
    pub pipeline_uuid: String,
    pub pipeline_name: Option<String>,
    pub priority: i32,
    pub status: TaskStatus,
    pub count: u64,
}
