use std::time::Duration;

/// Waits the same amount of time between every attempt. Unbounded, so use
/// `Interval::from_millis(10).take(n)` to allow at most `n` retries.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            duration: Duration::from_millis(millis),
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}
