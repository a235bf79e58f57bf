//! The timer: construction, scheduling, shutdown, and the worker loop.
//!
//! One dedicated worker thread advances the wheel one slot per tick,
//! classifies the entries it drains, and fires expired tasks outside the
//! wheel lock. Arbitrarily many threads may schedule and cancel
//! concurrently; they only ever touch the shared side of the wheel lock.
//!
//! # Lifecycle
//!
//! A timer starts in `Init`, moves to `Started` on the first `schedule` (or
//! an explicit `start`), and ends in `Stopped`. The transitions are
//! monotone; a stopped timer can never be restarted. `stop` wakes the
//! worker, joins it, and hands back every timeout that was still pending.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use strobe_timer::{TimeoutHandle, TimerWheel};
//!
//! let timer = TimerWheel::builder()
//!     .with_tick_duration(Duration::from_millis(10))
//!     .build()
//!     .unwrap();
//!
//! let handle = timer
//!     .schedule(|_: &TimeoutHandle| println!("deadline reached"), Duration::from_millis(50))
//!     .unwrap();
//!
//! handle.cancel();
//! let pending = timer.stop().unwrap();
//! assert!(pending.is_empty());
//! ```

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::{self, Clock, MonotonicClock};
use crate::error::TimerError;
use crate::observe::{DeviationHistogram, RateCounter};
use crate::timeout::{self, Timeout, TimeoutHandle, TimerTask};
use crate::wheel::Wheel;

/// Default tick granularity.
const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(100);

/// Default slot count; rounded up to a power of two at build time.
const DEFAULT_TICKS_PER_WHEEL: usize = 512;

/// How long `stop` waits between worker wake-ups while joining.
const STOP_JOIN_POLL: Duration = Duration::from_millis(100);

const TIMER_INIT: u8 = 0;
const TIMER_STARTED: u8 = 1;
const TIMER_STOPPED: u8 = 2;

/// Live (built but not yet stopped) timers in this process. Each instance
/// owns an OS thread and a full wheel, so a climbing count almost always
/// means instances are being created where one should be shared.
static ACTIVE_TIMERS: AtomicUsize = AtomicUsize::new(0);
const ACTIVE_TIMER_WARN_THRESHOLD: usize = 64;

/// Configures and builds a [`TimerWheel`].
///
/// ```rust
/// use std::time::Duration;
/// use strobe_timer::TimerWheel;
///
/// let timer = TimerWheel::builder()
///     .with_tick_duration(Duration::from_millis(50))
///     .with_ticks_per_wheel(256)
///     .with_thread_name("io-deadlines")
///     .build()
///     .unwrap();
/// # timer.stop().unwrap();
/// ```
pub struct TimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    thread_name: String,
    stack_size: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
    rate_counter: Option<Arc<dyn RateCounter>>,
    deviation_histogram: Option<Arc<dyn DeviationHistogram>>,
    coarse_sleep: Option<bool>,
}

impl TimerBuilder {
    pub fn new() -> Self {
        Self {
            tick_duration: DEFAULT_TICK_DURATION,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            thread_name: "strobe-timer".to_string(),
            stack_size: None,
            clock: None,
            rate_counter: None,
            deviation_histogram: None,
            coarse_sleep: None,
        }
    }

    /// Set the tick granularity. Must be at least one millisecond.
    pub fn with_tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Set the wheel size; rounded up to the next power of two.
    pub fn with_ticks_per_wheel(mut self, ticks_per_wheel: usize) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Set the worker thread's name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker thread's stack size in bytes.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Replace the default monotonic clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Observe every fired timeout.
    pub fn with_rate_counter(mut self, counter: Arc<dyn RateCounter>) -> Self {
        self.rate_counter = Some(counter);
        self
    }

    /// Observe firing tardiness relative to each deadline.
    pub fn with_deviation_histogram(mut self, histogram: Arc<dyn DeviationHistogram>) -> Self {
        self.deviation_histogram = Some(histogram);
        self
    }

    /// Override the platform probe for 10 ms sleep quantization.
    pub fn with_coarse_sleep(mut self, coarse: bool) -> Self {
        self.coarse_sleep = Some(coarse);
        self
    }

    /// Validate the configuration and build the timer. The worker thread is
    /// not spawned until the timer is started.
    pub fn build(self) -> Result<TimerWheel, TimerError> {
        if self.tick_duration.as_millis() == 0 {
            return Err(TimerError::InvalidTickDuration(self.tick_duration));
        }
        let tick_ms = u64::try_from(self.tick_duration.as_millis())
            .map_err(|_| TimerError::InvalidTickDuration(self.tick_duration))?;
        let wheel = Wheel::new(tick_ms, self.ticks_per_wheel)?;

        let inner = Arc::new(TimerInner {
            wheel,
            state: AtomicU8::new(TIMER_INIT),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            rate_counter: self.rate_counter,
            deviation_histogram: self.deviation_histogram,
            thread_name: self.thread_name,
            stack_size: self.stack_size,
            coarse_sleep: self.coarse_sleep.unwrap_or_else(clock::coarse_sleep_platform),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
            tick_signal: Condvar::new(),
            tick_mutex: Mutex::new(()),
        });

        let live = ACTIVE_TIMERS.fetch_add(1, Ordering::Relaxed) + 1;
        if live > ACTIVE_TIMER_WARN_THRESHOLD {
            warn!(
                "{} timer instances are live; share one instance instead of creating them per task",
                live
            );
        }

        Ok(TimerWheel { inner })
    }
}

impl Default for TimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TimerInner {
    pub(crate) wheel: Wheel,
    state: AtomicU8,
    clock: Arc<dyn Clock>,
    rate_counter: Option<Arc<dyn RateCounter>>,
    deviation_histogram: Option<Arc<dyn DeviationHistogram>>,
    thread_name: String,
    stack_size: Option<usize>,
    coarse_sleep: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
    tick_signal: Condvar,
    tick_mutex: Mutex<()>,
}

impl TimerInner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// A hashed-wheel timer.
///
/// Clones share the same wheel and worker; cloning is how a
/// [`TimeoutHandle`] hands back its owning timer. The worker thread lives
/// until [`stop`](TimerWheel::stop) is called, so every timer should be
/// stopped when it is no longer needed.
#[derive(Clone)]
pub struct TimerWheel {
    pub(crate) inner: Arc<TimerInner>,
}

impl TimerWheel {
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Tick granularity this timer runs at.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.inner.wheel.tick_duration_ms())
    }

    /// Number of slots in the wheel.
    pub fn wheel_size(&self) -> usize {
        self.inner.wheel.size()
    }

    /// Number of timeouts currently resident in the wheel.
    pub fn pending_timeouts(&self) -> usize {
        self.inner.wheel.pending()
    }

    /// Start the worker thread.
    ///
    /// Idempotent while running; scheduling calls this implicitly. Fails
    /// once the timer has been stopped.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.inner.state.compare_exchange(
            TIMER_INIT,
            TIMER_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.spawn_worker(),
            Err(TIMER_STARTED) => Ok(()),
            Err(_) => Err(TimerError::Restarted),
        }
    }

    fn spawn_worker(&self) -> Result<(), TimerError> {
        let mut builder = thread::Builder::new().name(self.inner.thread_name.clone());
        if let Some(stack_size) = self.inner.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let inner = Arc::clone(&self.inner);
        let spawned = builder.spawn(move || Worker::new(inner).run());

        match spawned {
            Ok(handle) => {
                *self.inner.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                // roll back so a later start can retry
                let _ = self.inner.state.compare_exchange(
                    TIMER_STARTED,
                    TIMER_INIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Err(TimerError::SpawnFailed(e.to_string()))
            }
        }
    }

    /// Schedule `task` to run once `delay` has elapsed.
    ///
    /// Starts the timer if it is not yet running. The task fires no earlier
    /// than its deadline and no later than roughly one tick past it.
    pub fn schedule<T>(&self, task: T, delay: Duration) -> Result<TimeoutHandle, TimerError>
    where
        T: TimerTask,
    {
        self.start()?;

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let deadline_ms = self.inner.clock.now_ms().saturating_add(delay_ms);
        let timeout = Arc::new(Timeout::new(
            Box::new(task),
            deadline_ms,
            Arc::downgrade(&self.inner),
        ));
        self.inner.wheel.insert(&timeout, delay_ms);

        Ok(TimeoutHandle::new(timeout))
    }

    /// Stop the timer and return every timeout that had not yet fired or
    /// been cancelled. The returned timeouts are still `Init`; they are the
    /// caller's responsibility.
    ///
    /// Must not be called from inside a timer task. Stopping an already
    /// stopped timer returns an empty list.
    pub fn stop(&self) -> Result<Vec<TimeoutHandle>, TimerError> {
        if *self.inner.worker_thread.lock() == Some(thread::current().id()) {
            return Err(TimerError::StopFromTimerTask);
        }

        loop {
            match self.inner.state.compare_exchange(
                TIMER_STARTED,
                TIMER_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(TIMER_STOPPED) => return Ok(Vec::new()),
                Err(_) => {
                    // never started; just bar any future start
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            TIMER_INIT,
                            TIMER_STOPPED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        ACTIVE_TIMERS.fetch_sub(1, Ordering::Relaxed);
                        return Ok(Vec::new());
                    }
                    // lost to a concurrent start, go around again
                }
            }
        }

        // Wake the worker out of its tick wait and join it. Notifying under
        // the tick mutex pairs with the worker's state re-check, so the
        // wake-up cannot be missed.
        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            while !handle.is_finished() {
                {
                    let _guard = self.inner.tick_mutex.lock();
                    self.inner.tick_signal.notify_all();
                }
                thread::sleep(STOP_JOIN_POLL);
            }
            if handle.join().is_err() {
                warn!("timer worker thread terminated by panic");
            }
        }

        ACTIVE_TIMERS.fetch_sub(1, Ordering::Relaxed);

        let pending: Vec<TimeoutHandle> = self
            .inner
            .wheel
            .drain()
            .into_iter()
            .filter(|t| t.is_init())
            .map(TimeoutHandle::new)
            .collect();
        debug!("timer stopped with {} pending timeouts", pending.len());
        Ok(pending)
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state() {
            TIMER_STARTED => "started",
            TIMER_STOPPED => "stopped",
            _ => "init",
        };
        f.debug_struct("TimerWheel")
            .field("state", &state)
            .field("tick_duration", &self.tick_duration())
            .field("wheel_size", &self.wheel_size())
            .finish()
    }
}

/// The single background thread driving the wheel.
struct Worker {
    inner: Arc<TimerInner>,
    /// Worker epoch on the injected clock, captured once at thread start.
    start_ms: u64,
    /// Next tick ordinal; tick N has deadline `start_ms + N * tick_duration`.
    tick: u64,
}

impl Worker {
    fn new(inner: Arc<TimerInner>) -> Self {
        let start_ms = inner.clock.now_ms();
        Self {
            inner,
            start_ms,
            tick: 1,
        }
    }

    fn run(mut self) {
        *self.inner.worker_thread.lock() = Some(thread::current().id());
        debug!("timer worker running, tick {:?}", self.tick_duration());

        while self.inner.state() == TIMER_STARTED {
            let Some(deadline_ms) = self.wait_for_next_tick() else {
                break;
            };

            let sweep = self.inner.wheel.sweep(deadline_ms);

            // Entries that came up a revolution early get put back for the
            // remainder of their delay; the exclusive lock is already
            // released, so this re-enters the shared-side insertion path.
            for timeout in &sweep.slipped {
                let delay_ms = timeout.deadline_ms() - deadline_ms;
                self.inner.wheel.insert(timeout, delay_ms);
            }

            for timeout in sweep.expired.iter().rev() {
                self.fire(timeout);
            }
        }

        debug!("timer worker exiting");
    }

    fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.inner.wheel.tick_duration_ms())
    }

    /// Sleep until the current tick's deadline, recomputing the remaining
    /// time on every pass so oversleep and spurious wake-ups self-correct.
    /// Returns the tick's absolute deadline, or None when the timer stopped
    /// while waiting.
    fn wait_for_next_tick(&mut self) -> Option<u64> {
        let tick_ms = self.inner.wheel.tick_duration_ms();
        let target_ms = tick_ms * self.tick;

        loop {
            let elapsed_ms = self.inner.clock.now_ms().saturating_sub(self.start_ms);
            if elapsed_ms >= target_ms {
                self.tick += 1;
                return Some(self.start_ms + target_ms);
            }

            let mut sleep_ms = target_ms - elapsed_ms;
            if self.inner.coarse_sleep {
                sleep_ms = clock::quantize_sleep_ms(sleep_ms);
            }

            let mut guard = self.inner.tick_mutex.lock();
            if self.inner.state() != TIMER_STARTED {
                return None;
            }
            let _ = self
                .inner
                .tick_signal
                .wait_for(&mut guard, Duration::from_millis(sleep_ms));
            if self.inner.state() != TIMER_STARTED {
                return None;
            }
        }
    }

    /// Expire one drained entry. The CAS loses to a cancellation that raced
    /// in after the drain, in which case the task is suppressed.
    fn fire(&self, timeout: &Arc<Timeout>) {
        if !timeout.try_expire() {
            return;
        }

        if let Some(rate_counter) = &self.inner.rate_counter {
            rate_counter.event();
        }
        if let Some(histogram) = &self.inner.deviation_histogram {
            let now_ms = self.inner.clock.now_ms();
            histogram.update(now_ms.saturating_sub(timeout.deadline_ms()));
        }

        timeout::invoke(&TimeoutHandle::new(Arc::clone(timeout)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_timer() -> TimerWheel {
        TimerWheel::builder()
            .with_tick_duration(Duration::from_millis(10))
            .with_ticks_per_wheel(8)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let timer = TimerWheel::builder().build().unwrap();
        assert_eq!(timer.tick_duration(), Duration::from_millis(100));
        assert_eq!(timer.wheel_size(), 512);
        timer.stop().unwrap();
    }

    #[test]
    fn test_builder_rejects_zero_tick() {
        let result = TimerWheel::builder()
            .with_tick_duration(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(TimerError::InvalidTickDuration(_))));
    }

    #[test]
    fn test_builder_rejects_submillisecond_tick() {
        let result = TimerWheel::builder()
            .with_tick_duration(Duration::from_micros(500))
            .build();
        assert!(matches!(result, Err(TimerError::InvalidTickDuration(_))));
    }

    #[test]
    fn test_builder_rejects_zero_wheel() {
        let result = TimerWheel::builder().with_ticks_per_wheel(0).build();
        assert!(matches!(result, Err(TimerError::InvalidTicksPerWheel(0))));
    }

    #[test]
    fn test_builder_rejects_round_overflow() {
        let result = TimerWheel::builder()
            .with_tick_duration(Duration::from_millis(u64::MAX / 4))
            .with_ticks_per_wheel(8)
            .build();
        assert!(matches!(
            result,
            Err(TimerError::RoundDurationOverflow { .. })
        ));
    }

    #[test]
    fn test_schedule_fires_task() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let task_fired = Arc::clone(&fired);

        timer
            .schedule(
                move |_: &TimeoutHandle| {
                    task_fired.fetch_add(1, Ordering::Relaxed);
                },
                Duration::from_millis(30),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        timer.stop().unwrap();
    }

    #[test]
    fn test_schedule_implicitly_starts() {
        let timer = fast_timer();
        let handle = timer
            .schedule(|_: &TimeoutHandle| {}, Duration::from_secs(60))
            .unwrap();
        // the worker is up, which is what lets stop find and return the entry
        let pending = timer.stop().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), handle.id());
    }

    #[test]
    fn test_cancel_suppresses_task() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let task_fired = Arc::clone(&fired);

        let handle = timer
            .schedule(
                move |_: &TimeoutHandle| {
                    task_fired.fetch_add(1, Ordering::Relaxed);
                },
                Duration::from_millis(200),
            )
            .unwrap();

        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());

        thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        timer.stop().unwrap();
    }

    #[test]
    fn test_stop_returns_pending_and_is_idempotent() {
        let timer = fast_timer();
        for _ in 0..5 {
            timer
                .schedule(|_: &TimeoutHandle| {}, Duration::from_secs(30))
                .unwrap();
        }

        let pending = timer.stop().unwrap();
        assert_eq!(pending.len(), 5);
        assert!(pending.iter().all(|h| !h.is_expired() && !h.is_cancelled()));

        let again = timer.stop().unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_stopped_timer_rejects_restart_and_schedule() {
        let timer = fast_timer();
        timer.start().unwrap();
        timer.stop().unwrap();

        assert!(matches!(timer.start(), Err(TimerError::Restarted)));
        assert!(matches!(
            timer.schedule(|_: &TimeoutHandle| {}, Duration::from_millis(10)),
            Err(TimerError::Restarted)
        ));
    }

    #[test]
    fn test_stop_before_start_returns_empty() {
        let timer = fast_timer();
        let pending = timer.stop().unwrap();
        assert!(pending.is_empty());
        assert!(matches!(timer.start(), Err(TimerError::Restarted)));
    }

    #[test]
    fn test_start_is_idempotent() {
        let timer = fast_timer();
        timer.start().unwrap();
        timer.start().unwrap();
        timer.stop().unwrap();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let task_fired = Arc::clone(&fired);

        timer
            .schedule(
                |_: &TimeoutHandle| panic!("intentional panic"),
                Duration::from_millis(20),
            )
            .unwrap();
        timer
            .schedule(
                move |_: &TimeoutHandle| {
                    task_fired.fetch_add(1, Ordering::Relaxed);
                },
                Duration::from_millis(60),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        timer.stop().unwrap();
    }
}
