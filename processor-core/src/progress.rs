//! Per-pass bookkeeping of what each filter did and how long it took, summarised in the logs
//! once the pass is over.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    AddUnownedTasks,
    UpdateTracker,
    CreateTasksFromCriteria,
    CreateStreamMap,
    CreateTasksFromSearchQuery,
    ReleaseQueuedTasks,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AddUnownedTasks => "add unowned tasks",
            Phase::UpdateTracker => "update tracker",
            Phase::CreateTasksFromCriteria => "create tasks from criteria",
            Phase::CreateStreamMap => "create stream map",
            Phase::CreateTasksFromSearchQuery => "create tasks from search query",
            Phase::ReleaseQueuedTasks => "release queued tasks",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseStats {
    calls: u32,
    items: usize,
    elapsed: Duration,
}

#[derive(Debug, Default)]
struct FilterProgress {
    priority: i32,
    phases: BTreeMap<Phase, PhaseStats>,
    unowned_queued: usize,
    created_in_db: usize,
    new_queued: usize,
}

#[derive(Debug, Default)]
struct Totals {
    filters: BTreeMap<i32, FilterProgress>,
}

/// Shared by the synchronous part of a pass and its search tasks.
#[derive(Debug)]
pub struct ProgressMonitor {
    started: Instant,
    initial_queue_size: usize,
    totals: Mutex<Totals>,
}

impl ProgressMonitor {
    pub fn new(initial_queue_size: usize) -> Self {
        Self {
            started: Instant::now(),
            initial_queue_size,
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn start_filter(&self, filter_id: i32, priority: i32) {
        self.totals.lock().filters.entry(filter_id).or_default().priority = priority;
    }

    pub fn log_phase(&self, filter_id: i32, phase: Phase, started: Instant, items: usize) {
        let mut totals = self.totals.lock();
        let stats = totals
            .filters
            .entry(filter_id)
            .or_default()
            .phases
            .entry(phase)
            .or_default();
        stats.calls += 1;
        stats.items += items;
        stats.elapsed += started.elapsed();
    }

    pub fn add_unowned_tasks_to_queue(&self, filter_id: i32, count: usize) {
        self.totals.lock().filters.entry(filter_id).or_default().unowned_queued += count;
    }

    pub fn add_new_tasks_in_db(&self, filter_id: i32, count: usize) {
        self.totals.lock().filters.entry(filter_id).or_default().created_in_db += count;
    }

    pub fn add_new_tasks_to_queue(&self, filter_id: i32, count: usize) {
        self.totals.lock().filters.entry(filter_id).or_default().new_queued += count;
    }

    /// Totals over every filter: unowned tasks queued, tasks created, new tasks queued.
    pub fn totals(&self) -> (usize, usize, usize) {
        self.totals.lock().filters.values().fold((0, 0, 0), |acc, f| {
            (
                acc.0 + f.unowned_queued,
                acc.1 + f.created_in_db,
                acc.2 + f.new_queued,
            )
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self, final_queue_size: usize) {
        let totals = self.totals.lock();
        for (filter_id, progress) in &totals.filters {
            let phases = progress
                .phases
                .iter()
                .map(|(phase, s)| format!("{phase}: {} calls, {} items in {:?}", s.calls, s.items, s.elapsed))
                .collect::<Vec<_>>()
                .join("; ");
            debug!(
                filter_id,
                priority = progress.priority,
                unowned_queued = progress.unowned_queued,
                created = progress.created_in_db,
                queued = progress.new_queued,
                phases,
                "Filter creation summary"
            );
        }
        drop(totals);

        let (unowned, created, queued) = self.totals();
        info!(
            initial_queue_size = self.initial_queue_size,
            final_queue_size,
            unowned,
            created,
            queued,
            elapsed = ?self.elapsed(),
            "Finished task creation pass"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate_across_filters() {
        let monitor = ProgressMonitor::new(4);
        monitor.start_filter(1, 1);
        monitor.start_filter(2, 5);
        monitor.add_unowned_tasks_to_queue(1, 2);
        monitor.add_new_tasks_in_db(1, 10);
        monitor.add_new_tasks_to_queue(1, 6);
        monitor.add_new_tasks_in_db(2, 3);
        monitor.log_phase(2, Phase::CreateTasksFromCriteria, Instant::now(), 3);
        monitor.log_phase(2, Phase::CreateTasksFromCriteria, Instant::now(), 1);

        assert_eq!(monitor.totals(), (2, 13, 6));
        let totals = monitor.totals.lock();
        let stats = totals.filters[&2].phases[&Phase::CreateTasksFromCriteria];
        assert_eq!((stats.calls, stats.items), (2, 4));
    }
}
