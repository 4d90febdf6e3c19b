//! TinyLFU admission and eviction policy
//!
//! Cost-bounded cache policy in the ristretto mold: a count-min sketch
//! estimates access frequency, and when the cache is over budget a new
//! entry is admitted only if its estimated frequency beats that of the
//! sampled victim. Frequency ties evict the oldest sampled entry, so a
//! cold working set degrades to FIFO instead of thrashing the newest
//! insertions.
//!
//! Get signals are buffered in a small ring and folded into the sketch
//! in batches, keeping the common read path to a vector push.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;

const SKETCH_ROWS: usize = 4;
const SAMPLE_SIZE: usize = 5;

fn hash_key(key: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(key);
    h.finish()
}

/// Count-min sketch over 4-bit counters, two per byte. All counters are
/// halved once the number of increments reaches the sample size, so
/// stale frequencies age out.
struct CountMinSketch {
    rows: [Vec<u8>; SKETCH_ROWS],
    mask: u64,
    increments: u64,
    reset_at: u64,
}

const ROW_SEEDS: [u64; SKETCH_ROWS] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
    0x27D4_EB2F_1656_67C5,
];

impl CountMinSketch {
    fn new(num_counters: usize) -> Self {
        let width = num_counters.next_power_of_two().max(16);
        Self {
            rows: std::array::from_fn(|_| vec![0u8; width / 2]),
            mask: width as u64 - 1,
            increments: 0,
            reset_at: num_counters as u64,
        }
    }

    fn counter(row: &[u8], idx: u64) -> u8 {
        let byte = row[(idx / 2) as usize];
        if idx % 2 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    fn bump(row: &mut [u8], idx: u64) {
        let slot = (idx / 2) as usize;
        if idx % 2 == 0 {
            if row[slot] & 0x0f < 0x0f {
                row[slot] += 1;
            }
        } else if row[slot] >> 4 < 0x0f {
            row[slot] += 0x10;
        }
    }

    fn index(&self, hash: u64, row: usize) -> u64 {
        (hash ^ ROW_SEEDS[row]).wrapping_mul(ROW_SEEDS[(row + 1) % SKETCH_ROWS]) >> 32 & self.mask
    }

    fn increment(&mut self, hash: u64) {
        for i in 0..SKETCH_ROWS {
            let idx = self.index(hash, i);
            Self::bump(&mut self.rows[i], idx);
        }
        self.increments += 1;
        if self.increments >= self.reset_at {
            self.reset();
        }
    }

    fn estimate(&self, hash: u64) -> u8 {
        (0..SKETCH_ROWS)
            .map(|i| Self::counter(&self.rows[i], self.index(hash, i)))
            .min()
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        for row in &mut self.rows {
            for byte in row.iter_mut() {
                // halve both nibbles in place
                *byte = (*byte >> 1) & 0x77;
            }
        }
        self.increments = 0;
    }
}

struct Entry {
    key: Vec<u8>,
    cost: i64,
    seq: u64,
}

/// The policy proper. Not thread-safe; callers wrap it in a mutex.
pub struct TinyLfu {
    sketch: CountMinSketch,
    entries: HashMap<u64, Entry>,
    total_cost: i64,
    max_cost: i64,
    buffer: Vec<u64>,
    buffer_items: usize,
    seq: u64,
}

impl TinyLfu {
    /// `num_counters` sizes the frequency sketch (the caller passes
    /// 10x its expected entry count), `max_cost` bounds the summed
    /// entry costs, `buffer_items` sizes the get-signal ring.
    pub fn new(num_counters: usize, max_cost: i64, buffer_items: usize) -> Self {
        Self {
            sketch: CountMinSketch::new(num_counters),
            entries: HashMap::new(),
            total_cost: 0,
            max_cost,
            buffer: Vec::with_capacity(buffer_items.max(1)),
            buffer_items: buffer_items.max(1),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> i64 {
        self.total_cost
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(&hash_key(key))
    }

    pub fn cost(&self, key: &[u8]) -> Option<i64> {
        self.entries.get(&hash_key(key)).map(|e| e.cost)
    }

    /// Record a get. Buffered; the sketch sees it once the ring fills.
    pub fn touch(&mut self, key: &[u8]) {
        self.buffer.push(hash_key(key));
        if self.buffer.len() >= self.buffer_items {
            self.drain_buffer();
        }
    }

    /// Fold any buffered get signals into the sketch now.
    pub fn drain_buffer(&mut self) {
        for i in 0..self.buffer.len() {
            let h = self.buffer[i];
            self.sketch.increment(h);
        }
        self.buffer.clear();
    }

    /// Admit `key` with `cost`, evicting as needed to stay within
    /// budget. Returns the evicted `(key, cost)` pairs; when admission
    /// rejects the candidate itself, the candidate is in that list.
    pub fn insert(&mut self, key: &[u8], cost: i64) -> Vec<(Vec<u8>, i64)> {
        let hash = hash_key(key);
        self.sketch.increment(hash);

        if cost > self.max_cost {
            // can never fit; do not disturb residents
            if let Some(e) = self.entries.remove(&hash) {
                self.total_cost -= e.cost;
            }
            return vec![(key.to_vec(), cost)];
        }

        self.seq += 1;
        match self.entries.get_mut(&hash) {
            Some(entry) => {
                self.total_cost += cost - entry.cost;
                entry.cost = cost;
                entry.seq = self.seq;
            }
            None => {
                self.entries.insert(
                    hash,
                    Entry {
                        key: key.to_vec(),
                        cost,
                        seq: self.seq,
                    },
                );
                self.total_cost += cost;
            }
        }

        let mut evicted = Vec::new();
        while self.total_cost > self.max_cost {
            let victim = self.sample_victim(hash);
            let Some(victim_hash) = victim else {
                // nothing left to sample but the candidate itself
                if let Some(e) = self.entries.remove(&hash) {
                    self.total_cost -= e.cost;
                    evicted.push((e.key, e.cost));
                }
                break;
            };
            let victim_freq = self.sketch.estimate(victim_hash);
            let candidate_freq = self.sketch.estimate(hash);
            if candidate_freq < victim_freq {
                // victim is hotter: the candidate loses its slot
                if let Some(e) = self.entries.remove(&hash) {
                    self.total_cost -= e.cost;
                    evicted.push((e.key, e.cost));
                }
                break;
            }
            if let Some(e) = self.entries.remove(&victim_hash) {
                self.total_cost -= e.cost;
                evicted.push((e.key, e.cost));
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(&hash_key(key)) {
            Some(e) => {
                self.total_cost -= e.cost;
                true
            }
            None => false,
        }
    }

    /// Sample a handful of residents (excluding `candidate`) and pick
    /// the coldest; frequency ties go to the oldest.
    fn sample_victim(&self, candidate: u64) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(h, _)| **h != candidate)
            .take(SAMPLE_SIZE)
            .min_by_key(|(h, e)| (self.sketch.estimate(**h), e.seq))
            .map(|(h, _)| *h)
    }

    /// Resident `(key, cost)` pairs, for mirror checks.
    pub fn entries(&self) -> Vec<(Vec<u8>, i64)> {
        self.entries
            .values()
            .map(|e| (e.key.clone(), e.cost))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_budget() {
        let mut lfu = TinyLfu::new(100, 100, 4);
        for i in 0u32..50 {
            lfu.insert(&i.to_be_bytes(), 10);
            assert!(lfu.total_cost() <= 100, "cost {} over budget", lfu.total_cost());
        }
        assert!(lfu.len() <= 10);
    }

    #[test]
    fn no_eviction_under_budget() {
        let mut lfu = TinyLfu::new(100, 1 << 20, 4);
        for i in 0u32..20 {
            assert!(lfu.insert(&i.to_be_bytes(), 100).is_empty());
        }
        assert_eq!(lfu.len(), 20);
        assert_eq!(lfu.total_cost(), 2000);
    }

    #[test]
    fn frequent_entry_survives_pressure() {
        let mut lfu = TinyLfu::new(1000, 50, 4);
        lfu.insert(b"hot", 10);
        for _ in 0..40 {
            lfu.touch(b"hot");
        }
        lfu.drain_buffer();
        for i in 0u32..200 {
            lfu.insert(&i.to_be_bytes(), 10);
        }
        assert!(lfu.contains(b"hot"), "hot entry was evicted");
    }

    #[test]
    fn newest_insert_wins_frequency_ties() {
        let mut lfu = TinyLfu::new(100, 30, 4);
        for i in 0u32..50 {
            lfu.insert(&i.to_be_bytes(), 10);
        }
        assert!(lfu.contains(&49u32.to_be_bytes()));
    }

    #[test]
    fn oversized_item_rejected_without_disturbing_residents() {
        let mut lfu = TinyLfu::new(100, 100, 4);
        lfu.insert(b"a", 50);
        let evicted = lfu.insert(b"huge", 500);
        assert_eq!(evicted, vec![(b"huge".to_vec(), 500)]);
        assert!(lfu.contains(b"a"));
        assert!(!lfu.contains(b"huge"));
    }

    #[test]
    fn remove_releases_cost() {
        let mut lfu = TinyLfu::new(100, 100, 4);
        lfu.insert(b"x", 60);
        assert!(lfu.remove(b"x"));
        assert!(!lfu.remove(b"x"));
        assert_eq!(lfu.total_cost(), 0);
        assert!(lfu.insert(b"y", 90).is_empty());
    }

    #[test]
    fn update_changes_cost_in_place() {
        let mut lfu = TinyLfu::new(100, 100, 4);
        lfu.insert(b"k", 10);
        lfu.insert(b"k", 40);
        assert_eq!(lfu.len(), 1);
        assert_eq!(lfu.total_cost(), 40);
        assert_eq!(lfu.cost(b"k"), Some(40));
    }

    #[test]
    fn sketch_counts_and_ages() {
        let mut s = CountMinSketch::new(1 << 10);
        let h = hash_key(b"counted");
        for _ in 0..10 {
            s.increment(h);
        }
        assert!(s.estimate(h) >= 5);
        let before = s.estimate(h);
        s.reset();
        assert_eq!(s.estimate(h), before / 2);
    }
}
