//! Error types for the strobe timer.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by timer construction and lifecycle operations.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The configured tick duration is zero or below one millisecond.
    #[error("tick duration must be at least one millisecond, got {0:?}")]
    InvalidTickDuration(Duration),

    /// The configured wheel size is out of range.
    #[error("ticks per wheel must be between 1 and 2^30, got {0}")]
    InvalidTicksPerWheel(usize),

    /// A full revolution of the wheel would not fit in the millisecond domain.
    #[error("round duration overflows: {tick_ms} ms per tick across {wheel_size} slots")]
    RoundDurationOverflow { tick_ms: u64, wheel_size: usize },

    /// The timer was stopped and can never be started again.
    #[error("timer cannot be restarted once stopped")]
    Restarted,

    /// `stop` was invoked from inside a running timer task.
    #[error("cannot stop the timer from within a timer task")]
    StopFromTimerTask,

    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}
