use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Something the pending delete pool can hold until nobody else references it
pub trait Reclaimable: Send + Sync {
    fn reference_count(&self) -> usize;
}

impl<T: Send + Sync + 'static> Reclaimable for Arc<T> {
    fn reference_count(&self) -> usize {
        Arc::strong_count(self)
    }
}

struct PendingEntry {
    record: Box<dyn Reclaimable>,
    marked_at: Instant,
}

/// Holds records that were removed from their table until it is safe to free them: nobody but
///  the pool holds a reference, and the grace period since removal has passed.
///
/// Pool-level serialization is a single mutex.
pub struct PendingDeletePool {
    grace_period: Duration,
    entries: Mutex<Vec<PendingEntry>>,
}

impl PendingDeletePool {
    pub fn new(grace_period: Duration) -> PendingDeletePool {
        PendingDeletePool {
            grace_period,
            entries: Default::default(),
        }
    }

    pub fn insert<T: Send + Sync + 'static>(&self, record: Arc<T>) {
        self.insert_at(record, Instant::now());
    }

    fn insert_at<T: Send + Sync + 'static>(&self, record: Arc<T>, marked_at: Instant) {
        self.entries.lock().unwrap().push(PendingEntry {
            record: Box::new(record),
            marked_at,
        });
    }

    /// Frees every entry that is past its grace period and no longer referenced. Returns the
    ///  number of freed entries.
    pub fn reclaim(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| {
            e.record.reference_count() > 1
                || now.saturating_duration_since(e.marked_at) < self.grace_period
        });

        let num_reclaimed = before - entries.len();
        if num_reclaimed > 0 {
            trace!("reclaimed {} records, {} still pending", num_reclaimed, entries.len());
        }
        num_reclaimed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
