use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::TaskId;

/// Samples retained per task.
pub const SPEED_WINDOW_CAPACITY: usize = 5;

/// A window with no new sample for this long reports zero speed and no
/// ETA, so paused or failed tasks stop contributing to the aggregate.
pub const SPEED_STALL_HORIZON: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SpeedSample {
    pub at_ms: u64,
    pub cumulative_bytes: u64,
}

/// Bounded sliding window of `(timestamp, cumulative bytes)` samples.
/// Oldest samples are evicted once the window is full.
#[derive(Debug)]
pub struct SpeedWindow {
    samples: VecDeque<SpeedSample>,
    capacity: usize,
}

impl SpeedWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, at_ms: u64, cumulative_bytes: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(SpeedSample {
            at_ms,
            cumulative_bytes,
        });
    }

    /// Instantaneous throughput over the window, or 0.0 with fewer than
    /// two samples or a degenerate time delta.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 || last.at_ms <= first.at_ms {
            return 0.0;
        }
        let elapsed = (last.at_ms - first.at_ms) as f64 / 1000.0;
        let bytes = last.cumulative_bytes.saturating_sub(first.cumulative_bytes) as f64;
        bytes / elapsed
    }

    /// Estimated time to reach `total_bytes`. `None` while speed is
    /// unknown or non-positive.
    pub fn eta(&self, total_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        let done = self.samples.back().map(|s| s.cumulative_bytes)?;
        let remaining = total_bytes.saturating_sub(done) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    /// True when the newest sample is older than `horizon` as of `now_ms`
    /// (or the window is empty). The computed rate is then history, not
    /// throughput.
    pub fn is_stalled(&self, now_ms: u64, horizon: Duration) -> bool {
        self.samples
            .back()
            .map_or(true, |s| now_ms.saturating_sub(s.at_ms) > horizon.as_millis() as u64)
    }
}

struct TaskWindow {
    window: SpeedWindow,
    total_bytes: u64,
}

/// Per-task speed windows plus an aggregate view, safe to update from
/// racing chunk confirmations.
pub struct ProgressEstimator {
    started: Instant,
    windows: Mutex<HashMap<TaskId, TaskWindow>>,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Appends a sample for `task` at the current instant.
    pub fn record(&self, task: &TaskId, cumulative_bytes: u64, total_bytes: u64) {
        let at_ms = self.now_ms();
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(task.clone()).or_insert_with(|| TaskWindow {
            window: SpeedWindow::new(SPEED_WINDOW_CAPACITY),
            total_bytes,
        });
        entry.total_bytes = total_bytes;
        entry.window.push(at_ms, cumulative_bytes);
    }

    pub fn speed(&self, task: &TaskId) -> f64 {
        let now = self.now_ms();
        let windows = self.windows.lock().unwrap();
        windows
            .get(task)
            .filter(|t| !t.window.is_stalled(now, SPEED_STALL_HORIZON))
            .map(|t| t.window.bytes_per_second())
            .unwrap_or(0.0)
    }

    pub fn eta(&self, task: &TaskId) -> Option<Duration> {
        let now = self.now_ms();
        let windows = self.windows.lock().unwrap();
        let entry = windows.get(task)?;
        if entry.window.is_stalled(now, SPEED_STALL_HORIZON) {
            return None;
        }
        entry.window.eta(entry.total_bytes)
    }

    /// Sum of per-task speeds across all tracked tasks; stalled windows
    /// contribute nothing.
    pub fn aggregate_speed(&self) -> f64 {
        let now = self.now_ms();
        let windows = self.windows.lock().unwrap();
        windows
            .values()
            .filter(|t| !t.window.is_stalled(now, SPEED_STALL_HORIZON))
            .map(|t| t.window.bytes_per_second())
            .sum()
    }

    pub fn forget(&self, task: &TaskId) {
        self.windows.lock().unwrap().remove(task);
    }

    pub fn clear(&self) {
        self.windows.lock().unwrap().clear();
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}
