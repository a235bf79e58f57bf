//! Strobe timer - hashed-wheel timeout scheduling
//!
//! This crate provides an approximate timer built for very large numbers of
//! short-to-medium timeouts, the kind a high-concurrency network server
//! creates per connection for I/O deadlines:
//! - `TimerWheel` - the scheduler: `start`, `stop`, `schedule`
//! - `TimeoutHandle` - one scheduled task: `cancel`, state queries
//! - `TimerTask` - the work to run at expiry (any `Fn(&TimeoutHandle)`)
//! - `TimerBuilder` - tick duration, wheel size, injected clock/observers
//!
//! # Design
//!
//! A single fixed wheel of power-of-two size hashes each timeout to the
//! slot its delay lands on; delays longer than one revolution carry a
//! remaining-rounds counter instead of spilling into extra wheel levels.
//! Insertion and cancellation are O(1); a lone worker thread advances one
//! slot per tick and pays O(bucket) to drain it. The trade is bounded
//! firing jitter: a task never runs before its deadline, but may run up to
//! about one tick after it.
//!
//! Schedulers take the shared side of the wheel lock (buckets are
//! thread-safe sets, so peers can insert concurrently); the worker takes
//! the exclusive side only while it advances the cursor and drains a
//! bucket. Tasks always run outside the lock.
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
//! // fires no earlier than one minute from now
//! let handle = timer
//!     .schedule(
//!         |_: &TimeoutHandle| println!("connection timed out"),
//!         Duration::from_secs(60),
//!     )
//!     .unwrap();
//!
//! // a cancelled timeout never runs
//! assert!(handle.cancel());
//!
//! let pending = timer.stop().unwrap();
//! assert!(pending.is_empty());
//! ```

pub mod clock;
pub mod error;
pub mod observe;
pub mod timeout;
pub mod timer;
mod wheel;

pub use clock::{Clock, MonotonicClock};
pub use error::TimerError;
pub use observe::{DeviationHistogram, RateCounter};
pub use timeout::{TimeoutHandle, TimeoutId, TimeoutState, TimerTask};
pub use timer::{TimerBuilder, TimerWheel};
