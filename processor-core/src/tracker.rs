//! Per-filter resumable watermark and its status state machine.
//!
//! ```text
//! Active -> Searching -> Creating -> Active | Complete | Error
//!        \______________/
//! ```
//! `Complete` and `Error` are terminal, the filter never gets new tasks again.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::MAX_ERROR_LENGTH;
use crate::filter::ProcessorFilter;
use crate::meta::Meta;
use crate::ranges::{InclusiveRange, InclusiveRanges};

const COMPLETE: &str = "COMPLETE";
const ERROR_PREFIX: &str = "ERROR:";
const SEARCHING: &str = "Searching...";
const CREATING: &str = "Creating...";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStatus {
    #[default]
    Active,
    Searching,
    Creating,
    Complete,
    Error(String),
}

impl TrackerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackerStatus::Complete | TrackerStatus::Error(_))
    }

    /// Builds an error status, cutting long messages short.
    pub fn error(message: &str) -> Self {
        let message = message.trim();
        if message.chars().count() > MAX_ERROR_LENGTH {
            let cut: String = message.chars().take(MAX_ERROR_LENGTH).collect();
            TrackerStatus::Error(format!("{cut}..."))
        } else {
            TrackerStatus::Error(message.to_string())
        }
    }

    /// Parses the stored form. Unknown text is treated as an in-progress status.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None | Some("") => TrackerStatus::Active,
            Some(COMPLETE) => TrackerStatus::Complete,
            Some(SEARCHING) => TrackerStatus::Searching,
            Some(CREATING) => TrackerStatus::Creating,
            Some(s) => match s.strip_prefix(ERROR_PREFIX) {
                Some(message) => TrackerStatus::Error(message.trim().to_string()),
                None => TrackerStatus::Active,
            },
        }
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerStatus::Active => Ok(()),
            TrackerStatus::Searching => f.write_str(SEARCHING),
            TrackerStatus::Creating => f.write_str(CREATING),
            TrackerStatus::Complete => f.write_str(COMPLETE),
            TrackerStatus::Error(message) => write!(f, "{ERROR_PREFIX}{message}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorFilterTracker {
    pub id: i32,
    pub version: i32,
    pub filter_id: i32,
    /// Lowest meta id not yet fully considered.
    pub min_meta_id: i64,
    /// Lowest event id not yet considered within `min_meta_id`.
    pub min_event_id: i64,
    pub min_meta_create_ms: Option<i64>,
    pub max_meta_create_ms: Option<i64>,
    /// Newest meta creation time seen so far.
    pub meta_create_ms: Option<i64>,
    pub last_poll_ms: Option<i64>,
    pub last_poll_task_count: Option<i64>,
    pub meta_count: i64,
    pub event_count: i64,
    pub status: TrackerStatus,
}

/// Bounds of what one batch of candidates covered, gathered while building the task rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreationProgress {
    pub stream_id_range: Option<InclusiveRange>,
    pub stream_ms_range: Option<InclusiveRange>,
    /// Outer event range of the highest stream id seen, if it had ranges.
    pub event_id_range: Option<InclusiveRange>,
    pub total_created: usize,
    pub event_count: u64,
}

fn extend(range: Option<InclusiveRange>, value: i64) -> InclusiveRange {
    match range {
        None => InclusiveRange::new(value, value),
        Some(r) => InclusiveRange::new(r.min.min(value), r.max.max(value)),
    }
}

impl CreationProgress {
    pub fn record(&mut self, meta: &Meta, ranges: Option<&InclusiveRanges>) {
        if let Some(ranges) = ranges {
            self.event_count += ranges.count();
        }
        if self.stream_id_range.is_none_or(|r| meta.id > r.max) {
            self.event_id_range = ranges.and_then(InclusiveRanges::outer_range);
        }
        self.stream_id_range = Some(extend(self.stream_id_range, meta.id));
        self.stream_ms_range = Some(extend(self.stream_ms_range, meta.create_ms));
        self.total_created += 1;
    }
}

impl ProcessorFilterTracker {
    pub fn new(filter_id: i32) -> Self {
        Self {
            filter_id,
            version: 1,
            ..Default::default()
        }
    }

    /// A terminal filter still records one empty poll so operators can see it was visited.
    /// Returns true if anything changed.
    pub fn record_empty_poll(&mut self, now_ms: i64) -> bool {
        if self.last_poll_task_count.unwrap_or(0) > 0 {
            self.last_poll_ms = Some(now_ms);
            self.last_poll_task_count = Some(0);
            true
        } else {
            false
        }
    }

    /// Moves the watermark past what a creation batch covered. Runs in the same write as the
    /// task rows. Watermarks never move backwards.
    pub fn advance(
        &mut self,
        filter: &ProcessorFilter,
        progress: &CreationProgress,
        stream_query_time_ms: i64,
        max_meta_id: Option<i64>,
        now_ms: i64,
    ) {
        match (progress.total_created, progress.stream_id_range) {
            (1.., Some(ids)) => {
                if let Some(ms) = progress.stream_ms_range {
                    if self.min_meta_create_ms.is_none() || self.last_poll_task_count == Some(0) {
                        self.min_meta_create_ms = Some(ms.min);
                    }
                    self.meta_create_ms = Some(ms.max);
                }
                match progress.event_id_range {
                    Some(events) => self.move_to(ids.max, events.max + 1),
                    None => self.move_to(ids.max + 1, 0),
                }
            }
            _ => {
                self.min_meta_create_ms = Some(stream_query_time_ms);
                self.meta_create_ms = Some(stream_query_time_ms);
                if let Some(max_id) = max_meta_id {
                    self.move_to(max_id + 1, 0);
                }
            }
        }

        self.meta_count += progress.total_created as i64;
        self.event_count += progress.event_count as i64;
        self.last_poll_ms = Some(now_ms);
        self.last_poll_task_count = Some(progress.total_created as i64);
        self.status = TrackerStatus::Active;

        if self.max_meta_create_ms.is_none() {
            self.max_meta_create_ms = filter.max_meta_create_time_ms;
        }
        if let (Some(max), Some(seen)) = (self.max_meta_create_ms, self.meta_create_ms) {
            if seen > max {
                self.status = TrackerStatus::Complete;
            }
        }
    }

    fn move_to(&mut self, meta_id: i64, event_id: i64) {
        if meta_id > self.min_meta_id {
            self.min_meta_id = meta_id;
            self.min_event_id = event_id;
        } else if meta_id == self.min_meta_id {
            self.min_event_id = self.min_event_id.max(event_id);
        }
    }
}
