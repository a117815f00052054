//! TinyLFU admission filter (spec §4.I): a count-min sketch with a Bloom
//! doorkeeper, deciding whether an incoming key deserves to evict an
//! existing one. No corpus module implements this; built directly from the
//! spec's description, in the teacher's plain-data-plus-`Mutex` style.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const SKETCH_SIZE: usize = 1 << 20;
const SKETCH_MASK: u64 = (SKETCH_SIZE - 1) as u64;
const HASH_PROBES: usize = 4;
const RESET_AFTER_OPS: u64 = 1 << 20;
const COUNTER_MAX: u8 = 15;

fn mix(key: &str, seed: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

struct CountMinSketch {
    counters: Vec<u8>,
}

impl CountMinSketch {
    fn new() -> Self {
        Self { counters: vec![0u8; SKETCH_SIZE] }
    }

    fn slots(key: &str) -> [usize; HASH_PROBES] {
        std::array::from_fn(|i| (mix(key, i as u64) & SKETCH_MASK) as usize)
    }

    fn increment(&mut self, key: &str) {
        for slot in Self::slots(key) {
            if self.counters[slot] < COUNTER_MAX {
                self.counters[slot] += 1;
            }
        }
    }

    fn estimate(&self, key: &str) -> u8 {
        Self::slots(key).into_iter().map(|slot| self.counters[slot]).min().unwrap_or(0)
    }

    fn halve(&mut self) {
        for counter in self.counters.iter_mut() {
            *counter >>= 1;
        }
    }
}

/// Bloom filter doorkeeper supporting `TestAndAdd`. Also usable standalone
/// as the cache façade's own existence filter (spec §4.K: "short-circuit
/// miss if the optional Bloom filter rejects the key").
pub(crate) struct Doorkeeper {
    bits: Vec<u64>,
    size: usize,
    hashes: u32,
}

impl Doorkeeper {
    pub(crate) fn new(size: usize, hashes: u32) -> Self {
        let size = size.max(1);
        Self { bits: vec![0u64; (size + 63) / 64], size, hashes: hashes.max(1) }
    }

    fn bit_index(&self, key: &str, i: u32) -> usize {
        (mix(key, i as u64 + 1000) as usize) % self.size
    }

    fn indices(&self, key: &str) -> Vec<usize> {
        (0..self.hashes).map(|i| self.bit_index(key, i)).collect()
    }

    /// Tests membership and marks the key seen; returns whether it was
    /// already present before this call.
    fn test_and_add(&mut self, key: &str) -> bool {
        let indices = self.indices(key);
        let all_set = indices.iter().all(|&idx| self.bits[idx / 64] & (1 << (idx % 64)) != 0);
        for idx in indices {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
        all_set
    }

    /// Read-only membership test; does not mark the key seen.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.indices(key).iter().all(|&idx| self.bits[idx / 64] & (1 << (idx % 64)) != 0)
    }

    /// Marks `key` seen without reporting prior membership.
    pub(crate) fn add(&mut self, key: &str) {
        for idx in self.indices(key) {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    CandidateUnseenAndWins,
    CandidateSeenAndWins,
    VictimWins,
}

struct Inner {
    sketch: CountMinSketch,
    doorkeeper: Doorkeeper,
    ops_since_reset: u64,
}

pub struct TinyLfu {
    inner: Mutex<Inner>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl TinyLfu {
    pub fn new(bloom_size: usize, bloom_hashes: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sketch: CountMinSketch::new(),
                doorkeeper: Doorkeeper::new(bloom_size, bloom_hashes),
                ops_since_reset: 0,
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Records a cache touch, aging the sketch every `2^20` operations.
    pub fn touch(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sketch.increment(key);
        inner.ops_since_reset += 1;
        if inner.ops_since_reset >= RESET_AFTER_OPS {
            inner.sketch.halve();
            inner.ops_since_reset = 0;
        }
    }

    /// `admit(candidate, victim)`. An unseen candidate must clear the
    /// victim's estimate by more than 1; a previously seen candidate only
    /// needs to meet or exceed it.
    pub fn admit(&self, candidate: &str, victim: &str) -> (bool, AdmitReason) {
        let mut inner = self.inner.lock().unwrap();
        let seen_before = inner.doorkeeper.test_and_add(candidate);
        let candidate_est = inner.sketch.estimate(candidate);
        let victim_est = inner.sketch.estimate(victim);

        let (admitted, reason) = if !seen_before {
            if candidate_est > victim_est + 1 {
                (true, AdmitReason::CandidateUnseenAndWins)
            } else {
                (false, AdmitReason::VictimWins)
            }
        } else if candidate_est >= victim_est {
            (true, AdmitReason::CandidateSeenAndWins)
        } else {
            (false, AdmitReason::VictimWins)
        };

        drop(inner);
        if admitted {
            self.admitted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
        (admitted, reason)
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sketch = CountMinSketch::new();
        inner.doorkeeper.clear();
        inner.ops_since_reset = 0;
    }
}
