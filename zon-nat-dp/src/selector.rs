//! Instance selection for a service that has no conversion yet.

use crate::maps::BoundedHashMap;
use log::warn;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    net::Ipv4Addr,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};
use zon_nat_common::{InstanceList, MAX_INSTANCES, MAX_SERVICES};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Uniform pseudo-random pick per decision
    #[default]
    Random,
    /// Rotating per-service cursor
    RoundRobin,
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "round-robin" | "round_robin" | "rr" => Ok(Self::RoundRobin),
            _ => Err(format!("unknown selection mode '{}'", s)),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::RoundRobin => write!(f, "round-robin"),
        }
    }
}

static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // One generator per selector and worker thread
    static RNGS: RefCell<HashMap<u64, StdRng>> = RefCell::new(HashMap::new());
}

/// Random picks without shared state on the packet path. Each thread
/// draws from its own generator, the first thread to pick uses the seed
/// as is and later ones derive theirs from it.
struct RandomSource {
    id: u64,
    seed: Option<u64>,
    streams: AtomicU64,
}

impl RandomSource {
    fn new(seed: Option<u64>) -> Self {
        Self {
            id: NEXT_SELECTOR_ID.fetch_add(1, Ordering::Relaxed),
            seed,
            streams: AtomicU64::new(0),
        }
    }

    fn new_rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let stream = self.streams.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(stream))
            }
            None => StdRng::from_entropy(),
        }
    }

    fn next_u32(&self) -> u32 {
        RNGS.with(|rngs| {
            rngs.borrow_mut()
                .entry(self.id)
                .or_insert_with(|| self.new_rng())
                .gen()
        })
    }
}

impl Drop for RandomSource {
    fn drop(&mut self) {
        // Other threads drop theirs when they exit
        let _ = RNGS.try_with(|rngs| rngs.borrow_mut().remove(&self.id));
    }
}

enum Strategy {
    Random(RandomSource),
    RoundRobin(BoundedHashMap<u32, u32>),
}

pub struct Selector {
    strategy: Strategy,
}

impl Selector {
    pub fn new(mode: SelectionMode, seed: Option<u64>) -> Self {
        match mode {
            SelectionMode::Random => Self::random(seed),
            SelectionMode::RoundRobin => Self::round_robin(),
        }
    }

    /// Random selection, reproducible when `seed` is set.
    pub fn random(seed: Option<u64>) -> Self {
        Self {
            strategy: Strategy::Random(RandomSource::new(seed)),
        }
    }

    pub fn round_robin() -> Self {
        Self {
            strategy: Strategy::RoundRobin(BoundedHashMap::with_max_entries(
                "ZN_RR_CURSORS",
                MAX_SERVICES,
            )),
        }
    }

    pub fn mode(&self) -> SelectionMode {
        match self.strategy {
            Strategy::Random(_) => SelectionMode::Random,
            Strategy::RoundRobin(_) => SelectionMode::RoundRobin,
        }
    }

    /// Picks one instance of `list` for `service`, None for an empty list.
    pub fn select(&self, service: u32, list: &InstanceList) -> Option<u32> {
        if list.is_empty() {
            return None;
        }

        let index = match &self.strategy {
            Strategy::Random(rng) => rng.next_u32() as usize % list.len() % MAX_INSTANCES,
            Strategy::RoundRobin(cursors) => {
                let cursor = cursors
                    .update(service, |c| c.map_or(0, |c| c.wrapping_add(1)))
                    .unwrap_or_else(|e| {
                        warn!(
                            "[sel] no cursor for {}, {}, using first instance",
                            Ipv4Addr::from(service),
                            e
                        );
                        0
                    });
                cursor as usize % list.len()
            }
        };

        list.as_slice().get(index).copied()
    }
}
