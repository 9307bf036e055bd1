// Dedup cache — bounded, time-windowed set of seen event ids
//
// The same event reaches us once per relay. Only the first copy goes
// through; later ones are dropped and counted.

use crate::config::DedupConfig;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct DedupCache {
    /// event id → first seen
    seen: HashMap<String, Instant>,
    /// Insertion order, for O(1) eviction from the front
    order: VecDeque<(String, Instant)>,
    retention: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            retention: config.retention(),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Record `id` as seen. Returns false if it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub fn insert_at(&mut self, id: &str, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(id) {
            return false;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));

        while self.seen.len() > self.max_entries {
            match self.order.pop_front() {
                Some((old_id, _)) => {
                    self.seen.remove(&old_id);
                }
                None => break,
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Drop entries older than the retention horizon
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, first_seen)) = self.order.front() {
            if now.saturating_duration_since(*first_seen) < self.retention {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.seen.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
