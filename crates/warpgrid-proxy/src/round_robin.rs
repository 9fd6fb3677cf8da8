//! Round-robin selection over an application's live exports.
//!
//! Every snapshot is shuffled on arrival so that hosts receiving the
//! same snapshot do not all start on the same instance.

use std::sync::Mutex;

use rand::seq::SliceRandom;
use tracing::debug;
use warpgrid_registry::ExportDetails;

struct Pool {
    exports: Vec<ExportDetails>,
    cursor: usize,
}

/// Thread-safe round-robin pool of exports.
pub struct RoundRobinExports {
    pool: Mutex<Pool>,
}

impl RoundRobinExports {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Pool {
                exports: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Replace the pool with a shuffled copy of `exports` and restart the cycle.
    pub fn set(&self, mut exports: Vec<ExportDetails>) {
        exports.shuffle(&mut rand::rng());
        let mut pool = self.pool.lock().expect("pool lock");
        debug!(count = exports.len(), "export pool replaced");
        pool.exports = exports;
        pool.cursor = 0;
    }

    /// The next export in the cycle, or `None` when the pool is empty.
    pub fn next(&self) -> Option<ExportDetails> {
        let mut pool = self.pool.lock().expect("pool lock");
        if pool.exports.is_empty() {
            return None;
        }
        let idx = pool.cursor % pool.exports.len();
        pool.cursor = (idx + 1) % pool.exports.len();
        Some(pool.exports[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.pool.lock().expect("pool lock").exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoundRobinExports {
    fn default() -> Self {
        Self::new()
    }
}
