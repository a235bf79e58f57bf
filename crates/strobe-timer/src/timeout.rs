//! Timeout entries, handles, and lifecycle state.
//!
//! A `Timeout` is one scheduled task: its absolute deadline, its current
//! wheel slot, the number of wheel revolutions it must still sit out, and a
//! three-state lifecycle driven purely by compare-and-set. The public
//! `TimeoutHandle` is a cheap clone over the shared entry.
//!
//! State transitions are monotone: `Init -> Cancelled` and `Init -> Expired`
//! are the only legal moves, and each is a single CAS. The canonical race is
//! cancel-vs-fire; exactly one side wins, and a timeout whose state left
//! `Init` never has its task invoked afterwards.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::timer::{TimerInner, TimerWheel};

/// Work to run when a timeout expires.
///
/// Implemented for any `Fn(&TimeoutHandle)` closure, so most callers never
/// name this trait.
pub trait TimerTask: Send + Sync + 'static {
    fn run(&self, timeout: &TimeoutHandle);
}

impl<F> TimerTask for F
where
    F: Fn(&TimeoutHandle) + Send + Sync + 'static,
{
    fn run(&self, timeout: &TimeoutHandle) {
        self(timeout)
    }
}

/// Unique identifier for a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

impl TimeoutId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimeoutId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeout({})", self.0)
    }
}

/// Lifecycle state of a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    /// Scheduled; neither cancelled nor expired.
    Init,
    /// Cancelled before its task ran.
    Cancelled,
    /// Expired; its task has run or is about to run.
    Expired,
}

const STATE_INIT: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

fn state_from_raw(raw: u8) -> TimeoutState {
    match raw {
        STATE_CANCELLED => TimeoutState::Cancelled,
        STATE_EXPIRED => TimeoutState::Expired,
        _ => TimeoutState::Init,
    }
}

/// One scheduled entry, shared between the wheel, the worker, and every
/// handle clone.
pub(crate) struct Timeout {
    id: TimeoutId,
    task: Box<dyn TimerTask>,
    /// Absolute expiry in the worker's millisecond domain. Immutable.
    deadline_ms: u64,
    state: AtomicU8,
    /// Slot this entry currently lives in. Rewritten only while the entry
    /// is out of every bucket (initial insert, slipped reschedule).
    bucket_index: AtomicUsize,
    /// Full revolutions left before the entry may fire. Decremented by the
    /// worker under the exclusive wheel lock.
    remaining_rounds: AtomicU64,
    timer: Weak<TimerInner>,
}

impl Timeout {
    pub(crate) fn new(task: Box<dyn TimerTask>, deadline_ms: u64, timer: Weak<TimerInner>) -> Self {
        Self {
            id: TimeoutId::next(),
            task,
            deadline_ms,
            state: AtomicU8::new(STATE_INIT),
            bucket_index: AtomicUsize::new(0),
            remaining_rounds: AtomicU64::new(0),
            timer,
        }
    }

    pub(crate) fn id(&self) -> TimeoutId {
        self.id
    }

    pub(crate) fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub(crate) fn state(&self) -> TimeoutState {
        state_from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_init(&self) -> bool {
        self.state() == TimeoutState::Init
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == TimeoutState::Cancelled
    }

    pub(crate) fn bucket_index(&self) -> usize {
        self.bucket_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_bucket_index(&self, index: usize) {
        self.bucket_index.store(index, Ordering::Release);
    }

    pub(crate) fn remaining_rounds(&self) -> u64 {
        self.remaining_rounds.load(Ordering::Acquire)
    }

    pub(crate) fn set_remaining_rounds(&self, rounds: u64) {
        self.remaining_rounds.store(rounds, Ordering::Release);
    }

    pub(crate) fn decrement_rounds(&self) {
        self.remaining_rounds.fetch_sub(1, Ordering::AcqRel);
    }

    /// `Init -> Cancelled`. False if the state already left `Init`.
    pub(crate) fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_INIT,
                STATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Init -> Expired`. False if cancellation won the race.
    pub(crate) fn try_expire(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_INIT,
                STATE_EXPIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms)
            .field("state", &self.state())
            .field("remaining_rounds", &self.remaining_rounds())
            .finish()
    }
}

/// Handle to a scheduled timeout.
///
/// Cheap to clone; all clones observe the same entry.
#[derive(Clone)]
pub struct TimeoutHandle {
    inner: Arc<Timeout>,
}

impl TimeoutHandle {
    pub(crate) fn new(inner: Arc<Timeout>) -> Self {
        Self { inner }
    }

    /// Get the timeout ID.
    pub fn id(&self) -> TimeoutId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TimeoutState {
        self.inner.state()
    }

    /// Check if this timeout has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TimeoutState::Cancelled
    }

    /// Check if this timeout has expired.
    pub fn is_expired(&self) -> bool {
        self.state() == TimeoutState::Expired
    }

    /// Absolute deadline on the owning timer's clock, in milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.inner.deadline_ms
    }

    /// The task this timeout will run.
    pub fn task(&self) -> &dyn TimerTask {
        self.inner.task.as_ref()
    }

    /// The timer that owns this timeout, if it is still alive.
    pub fn timer(&self) -> Option<TimerWheel> {
        self.inner
            .timer
            .upgrade()
            .map(|inner| TimerWheel { inner })
    }

    /// Cancel this timeout.
    ///
    /// Returns true if the cancellation won, in which case the task is
    /// guaranteed never to run. Returns false if the timeout already fired
    /// or was already cancelled. Bucket removal is best-effort; an entry the
    /// worker has already drained is simply suppressed at fire time.
    pub fn cancel(&self) -> bool {
        if !self.inner.try_cancel() {
            return false;
        }
        if let Some(timer) = self.inner.timer.upgrade() {
            timer.wheel.remove(&self.inner);
        }
        true
    }
}

impl fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("id", &self.id())
            .field("deadline_ms", &self.deadline_ms())
            .field("state", &self.state())
            .finish()
    }
}

/// Run the task behind an expired handle, containing any panic.
///
/// The payload message is preserved when possible and logged at WARN; the
/// worker loop must survive arbitrary user tasks.
pub(crate) fn invoke(handle: &TimeoutHandle) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handle.inner.task.run(handle)));

    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!("timer task {} panicked: {}", handle.id(), message);
    }
}
