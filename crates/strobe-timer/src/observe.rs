//! Observer hooks for firing metrics.
//!
//! Both observers are optional collaborators injected through the builder;
//! the timer is fully functional without them.

/// Counts fired timeouts, one `event` per task invocation.
pub trait RateCounter: Send + Sync + 'static {
    fn event(&self);
}

impl<F> RateCounter for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn event(&self) {
        self()
    }
}

/// Records how late each timeout fired relative to its deadline.
pub trait DeviationHistogram: Send + Sync + 'static {
    fn update(&self, deviation_ms: u64);
}

impl<F> DeviationHistogram for F
where
    F: Fn(u64) + Send + Sync + 'static,
{
    fn update(&self, deviation_ms: u64) {
        self(deviation_ms)
    }
}
