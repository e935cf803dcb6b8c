use std::sync::atomic::{AtomicU64, Ordering};
use zon_nat_common::stats;

static STATS_NAMES: [&str; stats::MAX as usize] = [
    "packets",
    "forward_unmodified",
    "forward_modified",
    "drop",
    "parse_errors",
    "unsupported",
    "session_hits",
    "session_misses",
    "registry_misses",
    "session_error_update",
    "rewrite_errors",
    "ingoing_untracked",
    "notify_lost",
];

pub struct Stats {
    counters: [AtomicU64; stats::MAX as usize],
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline(always)]
    pub fn inc(&self, stat_idx: u32) {
        if let Some(ctr) = self.counters.get(stat_idx as usize) {
            ctr.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, stat_idx: u32) -> u64 {
        self.counters
            .get(stat_idx as usize)
            .map_or(0, |ctr| ctr.load(Ordering::Relaxed))
    }

    pub fn as_str(stat_idx: u32) -> &'static str {
        STATS_NAMES.get(stat_idx as usize).copied().unwrap_or("unknown")
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        (0..stats::MAX)
            .map(|idx| (Self::as_str(idx), self.get(idx)))
            .collect()
    }
}
