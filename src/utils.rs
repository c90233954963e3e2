use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const MB: f64 = 1024.0 * 1024.0;

/// Throughput of a replay or capture, with *all-time* totals and a
/// *sliding window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time bytes read
    pub total_bytes: usize,
    /// All-time events decoded
    pub n_events: usize,
    pub t_begin: Instant,

    window: Duration,
    chunks: VecDeque<(Instant, usize, usize)>,
    bytes_in_window: usize,
    events_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total_bytes: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window,
            chunks: VecDeque::new(),
            bytes_in_window: 0,
            events_in_window: 0,
        }
    }

    /// Average rate since `t_begin`, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_bytes as f64 / secs / MB
    }

    /// Sliding-window data rate, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.bytes_in_window as f64 / secs / MB
    }

    /// Sliding-window event rate, in Hz
    pub fn event_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.events_in_window as f64 / secs
    }

    /// Record a chunk of `bytes` that yielded `events` events.
    pub fn increment(&mut self, bytes: usize, events: usize) {
        self.increment_at(Instant::now(), bytes, events);
    }

    fn increment_at(&mut self, now: Instant, bytes: usize, events: usize) {
        self.total_bytes += bytes;
        self.n_events += events;

        self.chunks.push_back((now, bytes, events));
        self.bytes_in_window += bytes;
        self.events_in_window += events;

        while let Some(&(ts, b, e)) = self.chunks.front() {
            if now.duration_since(ts) <= self.window {
                break;
            }
            self.chunks.pop_front();
            self.bytes_in_window -= b;
            self.events_in_window -= e;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::with_window(self.window);
    }
}
