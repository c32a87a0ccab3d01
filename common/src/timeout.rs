use std::thread;
use std::time::{Duration, Instant};

/// Bounded wait. Polling loops call [`Timeout::run`] once per iteration; it
/// yields the thread while time remains and errors once the deadline passes,
/// so no loop built on it can spin forever.
pub struct Timeout {
    started: Instant,
    duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self {
            started: Instant::now(),
            duration,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.duration
    }

    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            Err(())
        } else {
            thread::yield_now();
            Ok(())
        }
    }

    /// Like [`Timeout::run`] but sleeps between polls instead of yielding,
    /// for loops whose condition changes on a millisecond scale.
    pub fn run_spaced(&self, spacing: Duration) -> Result<(), ()> {
        if self.expired() {
            Err(())
        } else {
            thread::sleep(spacing);
            Ok(())
        }
    }
}
