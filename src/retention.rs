use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::store::StoreInner;

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// How long events are kept before the background task deletes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Maximum event age. Zero disables retention.
    pub max_age: Duration,
    /// How often the cleanup task runs. Zero defaults to `max_age / 10`,
    /// floored at one minute.
    pub cleanup_interval: Duration,
}

impl RetentionPolicy {
    pub(crate) fn effective_interval(&self) -> Duration {
        if !self.cleanup_interval.is_zero() {
            return self.cleanup_interval;
        }
        let derived = self.max_age / 10;
        if derived < MIN_CLEANUP_INTERVAL {
            MIN_CLEANUP_INTERVAL
        } else {
            derived
        }
    }

    pub(crate) fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let age = TimeDelta::from_std(self.max_age).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the background cleanup thread. At most one exists per database
/// handle; replacing the policy stops the old task before starting a new one.
pub(crate) struct RetentionTask {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl RetentionTask {
    pub(crate) fn spawn(store: Arc<StoreInner>, policy: RetentionPolicy) -> Self {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_signal = Arc::clone(&signal);
        let thread = std::thread::Builder::new()
            .name("sepia-retention".to_string())
            .spawn(move || run(store, policy, &worker_signal))
            .expect("failed to spawn retention thread");

        Self {
            signal,
            thread: Some(thread),
        }
    }

    /// Signals the worker and blocks until it has exited.
    pub(crate) fn stop(mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
        }
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Runs one pass immediately, then wakes every cleanup interval until the
/// stop signal arrives.
fn run(store: Arc<StoreInner>, policy: RetentionPolicy, signal: &StopSignal) {
    let interval = policy.effective_interval();
    loop {
        let cutoff = policy.cutoff(Utc::now());
        match store.delete_expired(cutoff) {
            Ok(0) => {}
            Ok(deleted) => debug!(deleted, %cutoff, "retention pass removed expired events"),
            Err(err) => warn!(error = %err, "retention pass failed"),
        }

        let mut stopped = signal.stopped.lock();
        while !*stopped {
            if signal.wake.wait_for(&mut stopped, interval).timed_out() {
                break;
            }
        }
        if *stopped {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_interval_is_kept() {
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(3_600),
            cleanup_interval: Duration::from_millis(10),
        };
        assert_eq!(policy.effective_interval(), Duration::from_millis(10));
    }

    #[test]
    fn default_interval_is_a_tenth_of_max_age() {
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(10 * 3_600),
            cleanup_interval: Duration::ZERO,
        };
        assert_eq!(policy.effective_interval(), Duration::from_secs(3_600));
    }

    #[test]
    fn default_interval_is_floored_at_one_minute() {
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::ZERO,
        };
        assert_eq!(policy.effective_interval(), Duration::from_secs(60));
    }

    #[test]
    fn cutoff_subtracts_the_max_age() {
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(3_600),
            cleanup_interval: Duration::ZERO,
        };
        let now = Utc::now();
        let cutoff = policy.cutoff(now);
        assert_eq!((now - cutoff).num_seconds(), 3_600);
    }
}
