use std::time::{Duration, Instant};

/// Per-operator wall-clock accounting. An operator's timer runs exactly
/// while the graph driver is inside one of its calls (`run`,
/// `on_receive`, `on_drain`, ...) and is stopped the rest of the time,
/// so `elapsed()` reflects active work, not time spent waiting on
/// upstream producers.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    running_since: Option<Instant>,
    elapsed: Duration,
    pub rows_in: u64,
    pub rows_out: u64,
    pub batches_in: u64,
    pub batches_out: u64,
}

impl Metrics {
    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Starts the timer. Starting an already-running timer is a bug in
    /// the graph driver (a context switch without stopping the previous
    /// holder first) and panics rather than silently double-counting.
    pub fn start(&mut self) {
        assert!(self.running_since.is_none(), "timer already running");
        self.running_since = Some(Instant::now());
    }

    /// Stops the timer, folding the interval into `elapsed`. Stopping an
    /// already-stopped timer is a no-op so callers that defensively
    /// stop on every exit path don't need to track whether they started it.
    pub fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.elapsed + since.elapsed(),
            None => self.elapsed,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub elapsed_secs: f64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub batches_in: u64,
    pub batches_out: u64,
    pub extra: serde_json::Value,
}
