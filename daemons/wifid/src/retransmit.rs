//! EAP retransmit tracking.
//!
//! Some clients wedge themselves in an EAP retransmit loop. A short streak
//! gets the station kicked (DISASSOCIATE frequently clears the stuck
//! state); a long streak marks the client broken and restarts hostapd --
//! but only once per problem: every tracked client is marked `restarted`
//! at that point so a second streak can only disassociate.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use pnet::util::MacAddr;
use tracing::{info, warn};

/// retransmits before we force a disassociation
pub const SOFT_LIMIT: u32 = 3;
/// retransmits before we declare the client broken
pub const HARD_LIMIT: u32 = 6;
/// a quiet streak is forgotten after this long
pub const STREAK_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-client streak state.
#[derive(Debug, Clone)]
pub struct Streak {
    /// retransmits seen in this streak
    pub count: u32,
    /// when the streak started
    pub first: Instant,
    /// last retransmit
    pub last: Instant,
    /// hit the hard limit
    pub broken: bool,
    /// hostapd has been restarted on this client's behalf (or during its
    /// streak); never restart twice for the same problem
    pub restarted: bool,
}

/// What the supervisor should do about a retransmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitAction {
    /// keep counting
    None,
    /// kick the station
    Disassociate,
    /// restart hostapd globally
    RestartHostapd,
}

/// Tracks retransmit streaks for every station.
#[derive(Debug, Default)]
pub struct RetransmitTracker {
    clients: Mutex<HashMap<MacAddr, Streak>>,
}

impl RetransmitTracker {
    /// empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retransmit event.
    pub fn on_retransmit(&self, mac: MacAddr) -> RetransmitAction {
        let now = Instant::now();
        let mut clients = self.clients.lock().expect("retransmit lock poisoned");
        let streak = clients.entry(mac).or_insert_with(|| Streak {
            count: 0,
            first: now,
            last: now,
            broken: false,
            restarted: false,
        });
        // silence resets the streak but keeps the restart marker
        if now.duration_since(streak.last) > STREAK_TIMEOUT {
            streak.count = 0;
            streak.first = now;
            streak.broken = false;
        }
        streak.count += 1;
        streak.last = now;

        if streak.count == SOFT_LIMIT {
            info!(%mac, count = streak.count, "retransmit soft limit, disassociating");
            return RetransmitAction::Disassociate;
        }
        if streak.count >= HARD_LIMIT && !streak.broken {
            streak.broken = true;
            if streak.restarted {
                warn!(%mac, "broken client, hostapd already restarted for it");
                return RetransmitAction::Disassociate;
            }
            warn!(%mac, count = streak.count, "retransmit hard limit, restarting hostapd");
            for s in clients.values_mut() {
                s.restarted = true;
            }
            return RetransmitAction::RestartHostapd;
        }
        RetransmitAction::None
    }

    /// A successful EAP authentication clears the streak.
    pub fn on_success(&self, mac: &MacAddr) {
        let mut clients = self.clients.lock().expect("retransmit lock poisoned");
        if let Some(streak) = clients.get_mut(mac) {
            streak.count = 0;
            streak.broken = false;
        }
    }

    /// The client is gone; forget its state entirely.
    pub fn forget(&self, mac: &MacAddr) {
        self.clients
            .lock()
            .expect("retransmit lock poisoned")
            .remove(mac);
    }

    /// current streak snapshot, for diagnostics
    pub fn streak(&self, mac: &MacAddr) -> Option<Streak> {
        self.clients
            .lock()
            .expect("retransmit lock poisoned")
            .get(mac)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    #[test]
    fn soft_limit_disassociates() {
        let tracker = RetransmitTracker::new();
        let m = mac(1);
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::None);
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::None);
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::Disassociate);
    }

    #[test]
    fn hard_limit_restarts_once_then_only_disassociates() {
        let tracker = RetransmitTracker::new();
        let m = mac(1);
        for _ in 0..HARD_LIMIT - 1 {
            tracker.on_retransmit(m);
        }
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::RestartHostapd);
        assert!(tracker.streak(&m).unwrap().broken);
        assert!(tracker.streak(&m).unwrap().restarted);

        // a second streak from the same client cannot restart again
        tracker.on_success(&m);
        for _ in 0..HARD_LIMIT - 1 {
            tracker.on_retransmit(m);
        }
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::Disassociate);
    }

    #[test]
    fn restart_marks_every_tracked_client() {
        let tracker = RetransmitTracker::new();
        let quiet = mac(2);
        tracker.on_retransmit(quiet);
        let noisy = mac(1);
        for _ in 0..HARD_LIMIT {
            tracker.on_retransmit(noisy);
        }
        assert!(tracker.streak(&quiet).unwrap().restarted);
    }

    #[test]
    fn success_clears_the_streak() {
        let tracker = RetransmitTracker::new();
        let m = mac(1);
        tracker.on_retransmit(m);
        tracker.on_retransmit(m);
        tracker.on_success(&m);
        // the count starts over
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::None);
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::None);
        assert_eq!(tracker.on_retransmit(m), RetransmitAction::Disassociate);
    }
}
