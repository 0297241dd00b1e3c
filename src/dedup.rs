//! Bounded TTL seen-window.
//!
//! Used by the order tracker to drop replayed push fills (upstream
//! reconnect replay) and by the notifier to collapse duplicate user-facing
//! events. Kept across reconnects on purpose: a per-connection set would
//! forget everything exactly when the upstream replays.
//!
//! Keys are recorded once and never refreshed, so insertion order is age
//! order — both TTL expiry and capacity eviction pop from the front of one
//! queue in O(1).

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SeenWindow {
    keys: HashSet<String>,
    order: VecDeque<(Instant, String)>,
    ttl: Duration,
    capacity: usize,
}

impl SeenWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            ttl,
            capacity,
        }
    }

    /// Record a key; returns false if it is already inside the window.
    pub fn insert(&mut self, key: String) -> bool {
        let now = Instant::now();
        self.expire(now);

        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() >= self.capacity {
            self.pop_oldest();
        }
        self.keys.insert(key.clone());
        self.order.push_back((now, key));
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((seen_at, _)) = self.order.front() {
            if now.duration_since(*seen_at) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_front() {
            self.keys.remove(&key);
        }
    }
}
