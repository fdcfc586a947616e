use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// Why a [`Retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The [`Condition`] refused to retry this error.
    Aborted(E),
    /// The backoff schedule ran out. `last` is the error of the final attempt.
    Exhausted { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Aborted(e) => write!(f, "{e}"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// A retry is either running the [`Operation`] or sleeping before the next attempt.
/// ```no_rust
///             (Ok) -> [Return(Ok)]
///            /
/// (Running) ---- (Err, not retryable) -> [Return(Aborted)]
///            \
///             (Err, retryable) -> backoff.next()
///                                   |-- None -> [Return(Exhausted)]
///                                   \-- Some(d) -> (Sleeping d) -> (Running)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retries an operation on the given backoff schedule.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempts: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            retry_state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempts: 1,
        }
    }

    /// Moves to the sleeping state, or hands the error back if the schedule is spent.
    fn cool_off(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), RetryError<O::Error>> {
        let this = self.as_mut().project();
        match this.backoff.next() {
            None => Err(RetryError::Exhausted {
                attempts: *this.attempts,
                last: err,
            }),
            Some(duration) => {
                let till = sleep_until(Instant::now() + duration);
                self.as_mut()
                    .project()
                    .retry_state
                    .set(RetryState::Sleeping(till));
                Ok(())
            }
        }
    }

    fn reattempt(mut self: Pin<&mut Self>) {
        let future = {
            let this = self.as_mut().project();
            *this.attempts += 1;
            this.operation.run()
        };
        self.as_mut()
            .project()
            .retry_state
            .set(RetryState::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().retry_state.project() {
                RetryStateProj::Running(op) => match op.poll(cx) {
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.as_mut().project().condition.can_retry(&e) {
                            return Poll::Ready(Err(RetryError::Aborted(e)));
                        }
                        if let Err(e) = self.as_mut().cool_off(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                },
                RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Ready(_) => self.as_mut().reattempt(),
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::fixed;

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let fut = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Ok::<u64, ()>(7)),
            |_: &()| true,
        );
        assert_eq!(fut.await, Ok(7));
    }

    #[tokio::test]
    async fn test_aborted_when_condition_refuses() {
        let fut = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Err::<(), &str>("conflict")),
            |_: &&str| false,
        );
        assert_eq!(fut.await, Err(RetryError::Aborted("conflict")));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);

        let fut = Retry::new(
            fixed::Interval::from_millis(1).take(10),
            move || {
                let attempt = cloned.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 4 {
                    future::ready(Err("stale version"))
                } else {
                    future::ready(Ok(attempt))
                }
            },
            |_: &&str| true,
        );

        assert_eq!(fut.await, Ok(4));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_is_a_value() {
        let retries = 5;
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);

        let fut = Retry::new(
            fixed::Interval::from_millis(1).take(retries),
            move || {
                let attempt = cloned.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(Err::<(), usize>(attempt))
            },
            |_: &usize| true,
        );

        let err = fut.await.unwrap_err();
        // the first run is not a retry
        assert!(err.is_exhausted());
        assert_eq!(
            err,
            RetryError::Exhausted {
                attempts: retries + 1,
                last: retries + 1
            }
        );
        assert_eq!(counter.load(Ordering::SeqCst), retries + 1);
    }
}
