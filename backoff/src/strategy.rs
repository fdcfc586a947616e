//! Backoff schedules. A schedule is an [`Iterator`] of delays, bound it with
//! [`Iterator::take`] to cap the number of retries.

pub mod fixed;
