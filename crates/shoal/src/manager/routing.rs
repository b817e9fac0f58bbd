//! Pool selection
//!
//! [`RoutingIndex`] is a min-heap of pool loads with lazy deletion: every
//! update pushes a fresh entry stamped with a new generation, and entries
//! whose generation no longer matches are skipped when they reach the top.
//! Lookup and update are O(log n); a rebuild is O(n).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::PoolId;

/// How a task without a usable affinity picks its pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Pool with the fewest executing plus waiting tasks
    #[default]
    LeastLoaded,
    /// Registration order, skipping pools that do not accept tasks
    RoundRobin,
    /// Uniformly random start, probing forward past unroutable pools
    Random,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeastLoaded => write!(f, "least_loaded"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "least_loaded" => Ok(Self::LeastLoaded),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexEntry {
    load: usize,
    pool_id: PoolId,
    generation: u64,
}

/// Min-heap of routable pools keyed by current load
#[derive(Debug, Default)]
pub struct RoutingIndex {
    heap: BinaryHeap<Reverse<IndexEntry>>,
    live: HashMap<PoolId, (usize, u64)>,
    next_generation: u64,
    dirty: bool,
}

impl RoutingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routable pools in the index
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, pool_id: &PoolId) -> bool {
        self.live.contains_key(pool_id)
    }

    pub fn load_of(&self, pool_id: &PoolId) -> Option<usize> {
        self.live.get(pool_id).map(|(load, _)| *load)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Loads changed out of band; the next routing call must rebuild first
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Insert a pool or set its load
    pub fn upsert(&mut self, pool_id: PoolId, load: usize) {
        let generation = self.bump_generation();
        self.live.insert(pool_id.clone(), (load, generation));
        self.heap.push(Reverse(IndexEntry {
            load,
            pool_id,
            generation,
        }));
        self.maybe_compact();
    }

    /// Stop routing to `pool_id`. Its heap entries go stale.
    pub fn remove(&mut self, pool_id: &PoolId) -> bool {
        self.live.remove(pool_id).is_some()
    }

    /// Take the least-loaded pool and count one more task against it
    pub fn acquire_least_loaded(&mut self) -> Option<PoolId> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            let current = self.live.get(&entry.pool_id).copied();
            if current != Some((entry.load, entry.generation)) {
                continue;
            }
            self.upsert(entry.pool_id.clone(), entry.load + 1);
            return Some(entry.pool_id);
        }
        None
    }

    /// Count one more task against a pool picked by another strategy
    pub fn reserve(&mut self, pool_id: &PoolId) {
        if let Some(load) = self.load_of(pool_id) {
            self.upsert(pool_id.clone(), load + 1);
        }
    }

    /// Replace the whole index in O(n). Clears the dirty flag.
    pub fn rebuild<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (PoolId, usize)>,
    {
        self.live.clear();
        let mut heap = Vec::new();
        for (pool_id, load) in entries {
            let generation = self.bump_generation();
            self.live.insert(pool_id.clone(), (load, generation));
            heap.push(Reverse(IndexEntry {
                load,
                pool_id,
                generation,
            }));
        }
        self.heap = BinaryHeap::from(heap);
        self.dirty = false;
    }

    /// Live entries sorted by pool id
    pub fn snapshot(&self) -> Vec<(PoolId, usize)> {
        let mut entries: Vec<(PoolId, usize)> = self
            .live
            .iter()
            .map(|(pool_id, (load, _))| (pool_id.clone(), *load))
            .collect();
        entries.sort();
        entries
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Drop stale entries once they outnumber live ones
    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + 16 {
            return;
        }
        let live: Vec<(PoolId, usize)> = self
            .live
            .iter()
            .map(|(pool_id, (load, _))| (pool_id.clone(), *load))
            .collect();
        let dirty = self.dirty;
        self.rebuild(live);
        self.dirty = dirty;
    }
}
