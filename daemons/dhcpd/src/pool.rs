//! The slot-indexed lease pool. One [`Lease`] per usable address in the
//! ring's range; slot `i` always corresponds to `range_start + i`. All
//! mutation happens under the owning handler's mutex.
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use rand::Rng;
use tracing::debug;

use rings::RingConfig;

/// One slot's binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// the slot's address
    pub ipaddr: Ipv4Addr,
    /// bound hardware address, when assigned
    pub hwaddr: Option<MacAddr>,
    /// absolute expiry; `None` on a static lease
    pub expires: Option<DateTime<Utc>>,
    /// operator-assigned, never expires, survives release attempts
    pub is_static: bool,
    /// the slot is bound to `hwaddr`
    pub assigned: bool,
    /// a REQUEST has completed on this binding (the client is established)
    pub confirmed: bool,
}

impl Lease {
    fn empty(ipaddr: Ipv4Addr) -> Self {
        Self {
            ipaddr,
            hwaddr: None,
            expires: None,
            is_static: false,
            assigned: false,
            confirmed: false,
        }
    }

    fn clear(&mut self) {
        let ipaddr = self.ipaddr;
        *self = Lease::empty(ipaddr);
    }

    /// expired dynamic binding?
    pub fn stale(&self, now: DateTime<Utc>) -> bool {
        self.assigned
            && !self.is_static
            && matches!(self.expires, Some(exp) if exp <= now)
    }
}

/// Per-ring pool: `range_span` slots plus the ring's address math.
#[derive(Debug)]
pub struct LeasePool {
    cfg: RingConfig,
    slots: Vec<Lease>,
}

impl LeasePool {
    /// One unassigned slot per usable address.
    pub fn new(cfg: RingConfig) -> Self {
        let start = u32::from(cfg.range_start());
        let slots = (0..cfg.range_span())
            .map(|i| Lease::empty(Ipv4Addr::from(start + i)))
            .collect();
        Self { cfg, slots }
    }

    /// the ring config this pool serves
    pub fn config(&self) -> &RingConfig {
        &self.cfg
    }

    /// slot index for an address, if it is in range
    pub fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        if !self.cfg.in_range(ip) {
            return None;
        }
        Some((u32::from(ip) - u32::from(self.cfg.range_start())) as usize)
    }

    /// Look at a slot, lazily expiring a stale binding first.
    pub fn slot(&mut self, idx: usize, now: DateTime<Utc>) -> Option<&Lease> {
        let lease = self.slots.get_mut(idx)?;
        if lease.stale(now) {
            debug!(ip = %lease.ipaddr, "lazily expiring stale lease");
            lease.clear();
        }
        Some(&*lease)
    }

    /// Find the slot currently bound to `mac`, lazily expiring as it scans.
    pub fn slot_for_mac(&mut self, mac: &MacAddr, now: DateTime<Utc>) -> Option<usize> {
        for (idx, lease) in self.slots.iter_mut().enumerate() {
            if lease.stale(now) {
                lease.clear();
            }
            if lease.assigned && lease.hwaddr.as_ref() == Some(mac) {
                return Some(idx);
            }
        }
        None
    }

    /// Has this MAC ever completed a REQUEST on a live binding?
    pub fn is_established(&mut self, mac: &MacAddr, now: DateTime<Utc>) -> bool {
        match self.slot_for_mac(mac, now) {
            Some(idx) => self.slots[idx].confirmed || self.slots[idx].is_static,
            None => false,
        }
    }

    /// Pick a free slot uniformly at random.
    pub fn random_free<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) -> Option<usize> {
        let free: Vec<usize> = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, lease)| {
                if lease.stale(now) {
                    lease.clear();
                }
                (!lease.assigned).then_some(idx)
            })
            .collect();
        if free.is_empty() {
            return None;
        }
        Some(free[rng.gen_range(0..free.len())])
    }

    /// Bind a slot.
    pub fn assign(
        &mut self,
        idx: usize,
        mac: MacAddr,
        expires: Option<DateTime<Utc>>,
        is_static: bool,
        confirmed: bool,
    ) {
        let lease = &mut self.slots[idx];
        lease.hwaddr = Some(mac);
        lease.expires = expires;
        lease.is_static = is_static;
        lease.assigned = true;
        lease.confirmed = confirmed;
    }

    /// Release a binding: only for the matching MAC and never for statics.
    /// Returns the freed address.
    pub fn release(&mut self, idx: usize, mac: &MacAddr) -> Option<Ipv4Addr> {
        let lease = self.slots.get_mut(idx)?;
        if !lease.assigned || lease.is_static || lease.hwaddr.as_ref() != Some(mac) {
            return None;
        }
        let ip = lease.ipaddr;
        lease.clear();
        Some(ip)
    }

    /// Release whatever `mac` holds, static or not; used when the client is
    /// deleted from the registry (terminal) or moved to another ring.
    pub fn evict_mac(&mut self, mac: &MacAddr) -> Option<Ipv4Addr> {
        for lease in &mut self.slots {
            if lease.assigned && lease.hwaddr.as_ref() == Some(mac) {
                let ip = lease.ipaddr;
                lease.clear();
                return Some(ip);
            }
        }
        None
    }

    /// currently assigned slots
    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|l| l.assigned).count()
    }

    /// total slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// all slots, for the invariant-minded
    pub fn leases(&self) -> &[Lease] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rings::{AuthMode, Ring};
    use std::time::Duration;

    fn test_cfg() -> RingConfig {
        RingConfig {
            ring: Ring::Standard,
            subnet: "192.168.2.0/28".parse().unwrap(),
            vlan: 2,
            vap: Some("vap0".into()),
            lease_duration: Duration::from_secs(3600),
            auth: AuthMode::WpaPsk,
        }
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    #[test]
    fn slot_addresses_track_indices() {
        let pool = LeasePool::new(test_cfg());
        // /28: network .0, router .1, satellites .2-.5, range .6-.14
        assert_eq!(pool.capacity(), 9);
        for (i, lease) in pool.leases().iter().enumerate() {
            assert_eq!(
                lease.ipaddr,
                Ipv4Addr::from(u32::from(Ipv4Addr::new(192, 168, 2, 6)) + i as u32)
            );
        }
    }

    #[test]
    fn exhaustion_after_capacity_assignments() {
        let mut pool = LeasePool::new(test_cfg());
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let expires = Some(now + chrono::Duration::hours(1));
        for i in 0..pool.capacity() {
            let idx = pool.random_free(&mut rng, now).expect("slot free");
            pool.assign(idx, mac(i as u8), expires, false, false);
        }
        assert_eq!(pool.random_free(&mut rng, now), None);
        // every assigned slot carries a hardware address
        for lease in pool.leases() {
            assert!(lease.assigned);
            assert!(lease.hwaddr.is_some());
        }
    }

    #[test]
    fn lazy_expiry_frees_stale_slots() {
        let mut pool = LeasePool::new(test_cfg());
        let now = Utc::now();
        pool.assign(0, mac(1), Some(now - chrono::Duration::seconds(1)), false, true);
        // the stale binding is cleared on access
        let lease = pool.slot(0, now).unwrap();
        assert!(!lease.assigned);
        assert!(pool.slot_for_mac(&mac(1), now).is_none());
    }

    #[test]
    fn static_leases_survive_release() {
        let mut pool = LeasePool::new(test_cfg());
        pool.assign(2, mac(9), None, true, true);
        assert_eq!(pool.release(2, &mac(9)), None);
        assert!(pool.leases()[2].assigned);
        // but eviction (client deleted) clears even statics
        assert_eq!(pool.evict_mac(&mac(9)), Some(Ipv4Addr::new(192, 168, 2, 8)));
    }

    #[test]
    fn release_requires_matching_mac() {
        let mut pool = LeasePool::new(test_cfg());
        let now = Utc::now();
        pool.assign(0, mac(1), Some(now + chrono::Duration::hours(1)), false, true);
        assert_eq!(pool.release(0, &mac(2)), None);
        assert!(pool.leases()[0].assigned);
        assert_eq!(pool.release(0, &mac(1)), Some(Ipv4Addr::new(192, 168, 2, 6)));
    }

    #[test]
    fn out_of_range_addresses_have_no_slot() {
        let pool = LeasePool::new(test_cfg());
        // one beyond range_end (the broadcast address)
        assert_eq!(pool.index_of(Ipv4Addr::new(192, 168, 2, 15)), None);
        assert_eq!(pool.index_of(Ipv4Addr::new(192, 168, 3, 6)), None);
        assert_eq!(pool.index_of(Ipv4Addr::new(192, 168, 2, 6)), Some(0));
    }
}
