//! Retries a fallible async [`Operation`] on a backoff schedule. The schedule is any iterator of
//! [`Duration`](std::time::Duration)s, see [`strategy`]. When the schedule runs dry the caller
//! gets a [`retry::RetryError::Exhausted`] value back instead of a panic, so bounded retry
//! loops can decide for themselves whether giving up is fatal.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// A unit of work that can be started again after a failure.
pub trait Operation {
    type Future: Future<Output = Result<Self::Item, Self::Error>>;
    type Item;
    type Error;

    /// Starts a fresh attempt.
    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut() -> T,
    T: Future<Output = Result<I, E>>,
{
    type Future = T;
    type Item = I;
    type Error = E;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
