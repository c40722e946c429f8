//! Per-catalog TTL expiry scheduling
//!
//! Each catalog owns one [`ExpiryScheduler`]. Deadlines are kept in a map
//! keyed by instance ID (the authoritative schedule) and in a min-heap that
//! is pruned lazily: a heap entry whose deadline no longer matches the map is
//! a leftover from an earlier renewal and is skipped. A single background
//! task sleeps until the earliest deadline and hands due IDs to the catalog,
//! which re-checks expiry under its own lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// Catalog side of the expiry protocol
#[async_trait]
pub(crate) trait ExpiryCheck: Send + Sync + 'static {
    /// Remove `instance_id` if it is still expired; anything else is a no-op
    async fn check_expired(&self, instance_id: &str);
}

#[derive(Default)]
struct Schedule {
    deadlines: HashMap<String, Instant>,
    heap: BinaryHeap<Reverse<(Instant, String)>>,
}

impl Schedule {
    fn insert(&mut self, instance_id: &str, deadline: Instant) -> bool {
        let earliest = self
            .heap
            .peek()
            .is_none_or(|Reverse((head, _))| deadline < *head);

        self.deadlines.insert(instance_id.to_string(), deadline);
        self.heap.push(Reverse((deadline, instance_id.to_string())));

        // Frequent renewals leave stale heap entries behind
        if self.heap.len() > 2 * self.deadlines.len() + 64 {
            self.heap = self
                .deadlines
                .iter()
                .map(|(id, at)| Reverse((*at, id.clone())))
                .collect();
        }
        earliest
    }

    fn take_due(&mut self, now: Instant) -> (Vec<String>, Option<Instant>) {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, id))) = self.heap.pop() else {
                break;
            };
            if self.deadlines.get(&id) == Some(&deadline) {
                self.deadlines.remove(&id);
                due.push(id);
            }
        }
        (due, self.heap.peek().map(|Reverse((at, _))| *at))
    }
}

/// Cancel-and-reschedule timer set for one catalog
pub(crate) struct ExpiryScheduler {
    schedule: Arc<Mutex<Schedule>>,
    wake: async_channel::Sender<()>,
}

impl ExpiryScheduler {
    /// Start the worker; it stops once `target` is gone or the scheduler is dropped
    pub(crate) fn start<C: ExpiryCheck>(target: Weak<C>) -> Self {
        let schedule = Arc::new(Mutex::new(Schedule::default()));
        let (wake, wake_rx) = async_channel::bounded(1);
        smol::spawn(run(schedule.clone(), wake_rx, target)).detach();
        Self { schedule, wake }
    }

    /// Schedule (or reschedule) an expiry check `after` from now
    pub(crate) fn schedule(&self, instance_id: &str, after: Duration) {
        let deadline = Instant::now() + after;
        let earliest = self.schedule.lock().insert(instance_id, deadline);
        if earliest {
            // A full channel already carries a pending wake-up
            let _ = self.wake.try_send(());
        }
    }

    /// Drop any pending check for `instance_id`
    pub(crate) fn cancel(&self, instance_id: &str) {
        self.schedule.lock().deadlines.remove(instance_id);
    }

    /// Number of scheduled checks
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.schedule.lock().deadlines.len()
    }
}

async fn run<C: ExpiryCheck>(
    schedule: Arc<Mutex<Schedule>>,
    wake: async_channel::Receiver<()>,
    target: Weak<C>,
) {
    loop {
        let (due, next) = schedule.lock().take_due(Instant::now());

        if !due.is_empty() {
            let Some(catalog) = target.upgrade() else {
                break;
            };
            for instance_id in due {
                trace!(instance_id = %instance_id, "expiry deadline reached");
                catalog.check_expired(&instance_id).await;
            }
            continue;
        }

        let awake = match next {
            Some(at) => {
                smol::future::or(
                    async {
                        smol::Timer::at(at).await;
                        true
                    },
                    async { wake.recv().await.is_ok() },
                )
                .await
            }
            None => wake.recv().await.is_ok(),
        };
        if !awake {
            break;
        }
    }
    trace!("expiry worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExpiryCheck for Recorder {
        async fn check_expired(&self, instance_id: &str) {
            self.fired.lock().push(instance_id.to_string());
        }
    }

    #[smol_potat::test]
    async fn test_fires_in_deadline_order() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = ExpiryScheduler::start(Arc::downgrade(&recorder));

        scheduler.schedule("late", Duration::from_millis(80));
        scheduler.schedule("early", Duration::from_millis(20));
        smol::Timer::after(Duration::from_millis(250)).await;

        assert_eq!(*recorder.fired.lock(), vec!["early", "late"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[smol_potat::test]
    async fn test_reschedule_and_cancel() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = ExpiryScheduler::start(Arc::downgrade(&recorder));

        scheduler.schedule("renewed", Duration::from_millis(20));
        scheduler.schedule("renewed", Duration::from_secs(60));
        scheduler.schedule("cancelled", Duration::from_millis(20));
        scheduler.cancel("cancelled");
        smol::Timer::after(Duration::from_millis(150)).await;

        assert!(recorder.fired.lock().is_empty());
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_stale_heap_entries_are_compacted() {
        let mut schedule = Schedule::default();
        let now = Instant::now();
        for i in 0..200u64 {
            schedule.insert("same", now + Duration::from_millis(i));
        }
        assert_eq!(schedule.deadlines.len(), 1);
        assert!(schedule.heap.len() <= 66);

        let (due, _) = schedule.take_due(now + Duration::from_secs(1));
        assert_eq!(due, vec!["same"]);
    }
}
