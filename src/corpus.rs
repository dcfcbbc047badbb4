//! Seed corpus with energy based scheduling.
//!
//! A corpus is owned by the job fuzzing it, so it carries no locking.

use crate::{mutation::RngType, utils::sha1_hex};
use chrono::{DateTime, Utc};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub const INITIAL_ENERGY: u64 = 100;
pub const MAX_ENERGY: u64 = 10_000;
/// Energy gained per newly reached location.
pub const COVERAGE_GAIN: u64 = 25;
/// Coverage score promoting a seed to golden.
pub const GOLDEN_COVERAGE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedSource {
    Manual,
    Generated,
    Minimized,
    Mutated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMetadata {
    pub source: SeedSource,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub id: String,
    #[serde(with = "crate::utils::hex_bytes")]
    pub content: Vec<u8>,
    /// Sha1 of content, the identity of the seed.
    pub hash: String,
    pub added_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub coverage_score: u64,
    pub crash_count: u64,
    pub energy: u64,
    pub is_golden: bool,
    pub metadata: SeedMetadata,
}

impl Seed {
    pub fn new(content: Vec<u8>, source: SeedSource, parent_id: Option<String>) -> Self {
        let hash = sha1_hex(&content);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hash,
            added_at: Utc::now(),
            last_used: None,
            execution_count: 0,
            coverage_score: 0,
            crash_count: 0,
            energy: INITIAL_ENERGY,
            is_golden: false,
            metadata: SeedMetadata {
                source,
                parent_id,
                tags: Vec::new(),
                size: content.len(),
            },
            content,
        }
    }

    /// Updates counters and energy after one execution derived from this seed.
    pub fn record(&mut self, new_locations: u64, crashed: bool) {
        self.execution_count += 1;
        self.last_used = Some(Utc::now());
        if new_locations != 0 {
            self.coverage_score += new_locations;
            self.energy = (self.energy + COVERAGE_GAIN * new_locations).min(MAX_ENERGY);
        } else {
            self.energy = (self.energy - self.energy / 16).max(1);
        }
        if crashed {
            self.crash_count += 1;
        }
        if self.crash_count != 0 || self.coverage_score >= GOLDEN_COVERAGE {
            self.is_golden = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Corpus {
    seeds: Vec<Seed>,
    by_hash: FxHashMap<String, usize>,
    cap: usize,
}

impl Corpus {
    pub fn new(cap: usize) -> Self {
        Self {
            seeds: Vec::new(),
            by_hash: FxHashMap::default(),
            cap: cap.max(1),
        }
    }

    /// Corpus of operator supplied inputs.
    pub fn with_inputs<I, T>(inputs: I, cap: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        let mut c = Self::new(cap);
        for i in inputs {
            c.add(Seed::new(i.into(), SeedSource::Manual, None));
        }
        c
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    pub fn get(&self, id: &str) -> Option<&Seed> {
        self.seeds.iter().find(|s| s.id == id)
    }

    pub fn contains_content(&self, content: &[u8]) -> bool {
        self.by_hash.contains_key(&sha1_hex(content))
    }

    /// Adds `seed` unless a seed with the same content exists, returns its id if added.
    /// Exceeding the cap prunes the lowest energy seed that is not golden.
    pub fn add(&mut self, seed: Seed) -> Option<String> {
        if self.by_hash.contains_key(&seed.hash) {
            return None;
        }
        let id = seed.id.clone();
        self.by_hash.insert(seed.hash.clone(), self.seeds.len());
        self.seeds.push(seed);
        if self.seeds.len() > self.cap {
            if let Some(pruned) = self.prune() {
                log::debug!("corpus: pruned seed {} (energy {})", pruned.id, pruned.energy);
            }
        }
        self.get(&id).map(|s| s.id.clone())
    }

    /// Explicit removal.
    pub fn remove(&mut self, id: &str) -> Option<Seed> {
        let idx = self.seeds.iter().position(|s| s.id == id)?;
        Some(self.remove_at(idx))
    }

    fn remove_at(&mut self, idx: usize) -> Seed {
        let seed = self.seeds.swap_remove(idx);
        self.by_hash.remove(&seed.hash);
        if let Some(moved) = self.seeds.get(idx) {
            self.by_hash.insert(moved.hash.clone(), idx);
        }
        seed
    }

    fn prune(&mut self) -> Option<Seed> {
        let idx = self
            .seeds
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_golden)
            .min_by_key(|(_, s)| (s.energy, s.added_at))
            .map(|(i, _)| i)?;
        Some(self.remove_at(idx))
    }

    /// Picks a seed with probability proportional to its energy.
    pub fn select(&self, rng: &mut RngType) -> Option<&Seed> {
        if self.is_empty() {
            return None;
        }
        let mut sum = 0;
        let prefix = self
            .seeds
            .iter()
            .map(|s| {
                sum += s.energy.max(1);
                sum
            })
            .collect::<Vec<_>>();
        Some(&self.seeds[choose_weighted(rng, &prefix)])
    }

    pub fn record_execution(&mut self, id: &str, new_locations: u64, crashed: bool) {
        if let Some(s) = self.seeds.iter_mut().find(|s| s.id == id) {
            s.record(new_locations, crashed);
        }
    }

    pub fn golden(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter().filter(|s| s.is_golden)
    }
}

/// Index into the prefix sums `weights` chosen proportionally to each step.
fn choose_weighted(rng: &mut RngType, weights: &[u64]) -> usize {
    let max = weights[weights.len() - 1];
    let n = rng.gen_range(0..max);
    match weights.binary_search(&n) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}
