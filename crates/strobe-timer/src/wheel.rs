//! The wheel: a power-of-two ring of buckets plus the insertion math.
//!
//! Lock discipline is deliberately inverted from the usual reader/writer
//! intuition. Schedulers and cancellers take the *shared* side because the
//! buckets are themselves thread-safe sets and peers may mutate them
//! concurrently; the worker takes the *exclusive* side so that advancing the
//! cursor and draining the entered bucket observe a consistent snapshot.
//! Firing happens outside the lock entirely.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::error::TimerError;
use crate::timeout::{Timeout, TimeoutId};

pub(crate) const MAX_TICKS_PER_WHEEL: usize = 1 << 30;

/// One wheel slot: a mutex-guarded set of timeouts.
///
/// `add` and `remove` may run concurrently from any thread holding the
/// shared wheel lock. `retain` and `drain` are worker-only and run under
/// the exclusive lock.
pub(crate) struct Bucket {
    entries: Mutex<Vec<Arc<Timeout>>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, timeout: Arc<Timeout>) {
        self.entries.lock().push(timeout);
    }

    /// Remove by identity. Removing an absent entry is a no-op returning
    /// false.
    fn remove(&self, id: TimeoutId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|t| t.id() == id) {
            Some(index) => {
                entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn retain(&self, f: impl FnMut(&Arc<Timeout>) -> bool) {
        self.entries.lock().retain(f);
    }

    fn drain(&self) -> Vec<Arc<Timeout>> {
        std::mem::take(&mut *self.entries.lock())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Result of one cursor advance.
#[derive(Default)]
pub(crate) struct Sweep {
    /// Entries whose deadline has been reached; fire these.
    pub(crate) expired: Vec<Arc<Timeout>>,
    /// Entries whose rounds hit zero a tick before their deadline; put
    /// these back for the remainder of their delay.
    pub(crate) slipped: Vec<Arc<Timeout>>,
}

/// Fixed-size ring of buckets with a single advancing cursor.
pub(crate) struct Wheel {
    lock: RwLock<()>,
    buckets: Box<[Bucket]>,
    /// Slot the worker drained last. Written only by the worker under the
    /// exclusive lock; readers need visibility, not linearizability.
    cursor: CachePadded<AtomicUsize>,
    mask: usize,
    tick_duration_ms: u64,
    round_duration_ms: u64,
}

impl Wheel {
    /// `ticks_per_wheel` is rounded up to the next power of two. Rejects
    /// out-of-range sizes and configurations whose round duration would
    /// overflow the millisecond domain.
    pub(crate) fn new(tick_duration_ms: u64, ticks_per_wheel: usize) -> Result<Self, TimerError> {
        if ticks_per_wheel == 0 || ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(TimerError::InvalidTicksPerWheel(ticks_per_wheel));
        }
        let size = ticks_per_wheel.next_power_of_two();
        if tick_duration_ms >= u64::MAX / size as u64 {
            return Err(TimerError::RoundDurationOverflow {
                tick_ms: tick_duration_ms,
                wheel_size: size,
            });
        }

        let buckets: Box<[Bucket]> = (0..size).map(|_| Bucket::new()).collect();

        Ok(Self {
            lock: RwLock::new(()),
            buckets,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            mask: size - 1,
            tick_duration_ms,
            round_duration_ms: tick_duration_ms * size as u64,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn tick_duration_ms(&self) -> u64 {
        self.tick_duration_ms
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Slot and remaining-rounds count for a delay relative to the current
    /// cursor.
    ///
    /// Delays below one tick are raised to a whole tick. A delay that is not
    /// tick-aligned is rounded up one slot so the worker can never fire it
    /// before its deadline; a delay that is an exact multiple of a round
    /// sheds one round, because the cursor has already moved past the slot
    /// it hashes to and will not reach it again until the next revolution.
    fn coordinates(&self, delay_ms: u64) -> (usize, u64) {
        let delay_ms = delay_ms.max(self.tick_duration_ms);
        let last_round_delay = delay_ms % self.round_duration_ms;
        let last_tick_delay = delay_ms % self.tick_duration_ms;
        let relative_index =
            last_round_delay / self.tick_duration_ms + u64::from(last_tick_delay != 0);
        let remaining_rounds =
            delay_ms / self.round_duration_ms - u64::from(last_round_delay == 0);
        let index = (self.cursor() + relative_index as usize) & self.mask;
        (index, remaining_rounds)
    }

    /// Place a timeout `delay_ms` from now. Shared-lock side; callable from
    /// any thread, concurrently with other insertions and removals.
    pub(crate) fn insert(&self, timeout: &Arc<Timeout>, delay_ms: u64) {
        let _shared = self.lock.read();
        let (index, rounds) = self.coordinates(delay_ms);
        timeout.set_remaining_rounds(rounds);
        timeout.set_bucket_index(index);
        self.buckets[index].add(Arc::clone(timeout));
    }

    /// Best-effort removal after cancellation. Shared-lock side.
    pub(crate) fn remove(&self, timeout: &Timeout) -> bool {
        let _shared = self.lock.read();
        self.buckets[timeout.bucket_index()].remove(timeout.id())
    }

    /// Advance the cursor one slot and classify the entered bucket.
    /// Exclusive-lock side; worker only.
    ///
    /// Entries still owing rounds are decremented and stay put. Cancelled
    /// entries whose best-effort removal raced are dropped here. Everything
    /// else leaves the bucket as either expired or slipped.
    pub(crate) fn sweep(&self, worker_deadline_ms: u64) -> Sweep {
        let mut sweep = Sweep::default();
        let _exclusive = self.lock.write();

        let cursor = (self.cursor.load(Ordering::Relaxed) + 1) & self.mask;
        self.cursor.store(cursor, Ordering::Release);

        self.buckets[cursor].retain(|timeout| {
            if timeout.is_cancelled() {
                return false;
            }
            if timeout.remaining_rounds() > 0 {
                timeout.decrement_rounds();
                return true;
            }
            if timeout.deadline_ms() <= worker_deadline_ms {
                sweep.expired.push(Arc::clone(timeout));
            } else {
                sweep.slipped.push(Arc::clone(timeout));
            }
            false
        });

        sweep
    }

    /// Empty every bucket and return the evicted entries. Used for the
    /// shutdown snapshot once the worker has exited.
    pub(crate) fn drain(&self) -> Vec<Arc<Timeout>> {
        let _exclusive = self.lock.write();
        self.buckets.iter().flat_map(Bucket::drain).collect()
    }

    /// Number of entries currently resident in the wheel.
    pub(crate) fn pending(&self) -> usize {
        let _shared = self.lock.read();
        self.buckets.iter().map(Bucket::len).sum()
    }
}
