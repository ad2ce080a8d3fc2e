//! Operator-log rate limiting.
//!
//! Peer-state errors (wrong ring, phishing lookups, bad passwords) are
//! interesting the first time and log spam the hundredth. Each daemon keeps a
//! [`RateLimiter`] keyed on whatever identifies the offender -- usually
//! `(mac, kind)` or `(mac, hostname)` -- and only publishes when `allow`
//! returns true.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Allows one event per key per window.
#[derive(Debug)]
pub struct RateLimiter<K> {
    window: Duration,
    seen: Mutex<HashMap<K, Instant>>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash,
{
    /// one event per `window` per key
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// hourly limiter, the default for `net.exception` publication
    pub fn hourly() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }

    /// Returns true if the key has not fired within the window, recording the
    /// attempt either way. Stale entries are dropped opportunistically.
    pub fn allow(&self, key: K) -> bool {
        let mut seen = self.seen.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        if seen.len() > 1024 {
            let window = self.window;
            seen.retain(|_, last| now.duration_since(*last) < window);
        }
        match seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }

    /// Drop the key so the next event fires immediately. Used when the
    /// condition resolves (e.g. a client moves back to its correct ring).
    pub fn forget(&self, key: &K) {
        let mut seen = self.seen.lock().expect("rate limiter lock poisoned");
        seen.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_allowed_second_suppressed() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        assert!(rl.allow(("aa:bb:cc:dd:ee:01", "bad_ring")));
        assert!(!rl.allow(("aa:bb:cc:dd:ee:01", "bad_ring")));
        // different key is independent
        assert!(rl.allow(("aa:bb:cc:dd:ee:02", "bad_ring")));
    }

    #[test]
    fn forget_resets_window() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        assert!(rl.allow("host"));
        assert!(!rl.allow("host"));
        rl.forget(&"host");
        assert!(rl.allow("host"));
    }

    #[test]
    fn zero_window_always_allows() {
        let rl = RateLimiter::new(Duration::ZERO);
        assert!(rl.allow(1));
        assert!(rl.allow(1));
    }
}
