//! Pace tracking: max-N-events-per-window.
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Tracks event timestamps in a sliding window. Callers decide what exceeding
/// the pace means -- the Wi-Fi supervisor stops re-evaluating channels, the
/// transient-I/O path escalates to a daemon restart.
#[derive(Debug)]
pub struct PaceTracker {
    max: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl PaceTracker {
    /// at most `max` events per `window`
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an event. Returns true while the pace is within budget.
    pub fn tick(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock().expect("pace lock poisoned");
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.push_back(now);
        events.len() <= self.max
    }

    /// Is the pace currently exceeded, without recording an event?
    pub fn exceeded(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock().expect("pace lock poisoned");
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len() > self.max
    }

    /// events currently inside the window
    pub fn count(&self) -> usize {
        self.events.lock().expect("pace lock poisoned").len()
    }

    /// forget all history
    pub fn reset(&self) {
        self.events.lock().expect("pace lock poisoned").clear();
    }
}
