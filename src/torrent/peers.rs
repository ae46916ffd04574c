use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Candidate {
    attempts: u32,
    next_attempt: Instant,
    busy: bool,
}

/// Addresses we may connect to, with exponential backoff between attempts.
///
/// An entry is `busy` while a connection attempt or session is running. A
/// candidate that fails `max_attempts` times in a row is forgotten.
pub(crate) struct PeerCandidates {
    entries: HashMap<SocketAddr, Candidate>,
    base_delay: Duration,
    max_attempts: u32,
}

impl PeerCandidates {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            entries: HashMap::new(),
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns `true` if `addr` was not known yet.
    pub fn add(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if self.entries.contains_key(&addr) {
            return false;
        }
        self.entries.insert(
            addr,
            Candidate {
                attempts: 0,
                next_attempt: now,
                busy: false,
            },
        );
        true
    }

    /// Marks up to `max` due candidates busy and returns them, least-failed
    /// first.
    pub fn take_due(&mut self, now: Instant, max: usize) -> Vec<SocketAddr> {
        let mut due: Vec<(u32, SocketAddr)> = self
            .entries
            .iter()
            .filter(|(_, c)| !c.busy && c.next_attempt <= now)
            .map(|(addr, c)| (c.attempts, *addr))
            .collect();
        due.sort_unstable();
        due.truncate(max);

        for (_, addr) in &due {
            if let Some(c) = self.entries.get_mut(addr) {
                c.busy = true;
            }
        }
        due.into_iter().map(|(_, addr)| addr).collect()
    }

    /// Marks an inbound or outbound session as established.
    pub fn connected(&mut self, addr: SocketAddr, now: Instant) {
        let entry = self.entries.entry(addr).or_insert(Candidate {
            attempts: 0,
            next_attempt: now,
            busy: true,
        });
        entry.attempts = 0;
        entry.busy = true;
    }

    /// Records a failed attempt or a dropped session. Returns `false` when the
    /// candidate has used up its attempts and was forgotten.
    pub fn failed(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&addr) else {
            return false;
        };
        entry.busy = false;
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            self.entries.remove(&addr);
            return false;
        }
        entry.next_attempt = now + self.base_delay * 2u32.pow(entry.attempts - 1);
        true
    }

    pub fn remove(&mut self, addr: SocketAddr) {
        self.entries.remove(&addr);
    }

    pub fn is_busy(&self, addr: SocketAddr) -> bool {
        self.entries.get(&addr).is_some_and(|c| c.busy)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
