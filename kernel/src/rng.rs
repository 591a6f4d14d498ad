// Copyright (c) 2025 vivo Mobile Communication Co., Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The process-wide random source. Seeded once from the wall clock at
//! program start; every random choice (random scheduler, divergence
//! runs, memo sampling) draws from this single generator so a recorded
//! seed reproduces a run.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct Rng {
    inner: Mutex<StdRng>,
}

impl Rng {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Bernoulli draw with the given probability of `true`.
    pub fn choice(&self, true_rate: f64) -> bool {
        self.inner.lock().gen::<f64>() < true_rate
    }

    /// Uniform draw from `0..n`. `n` must be nonzero.
    pub fn below(&self, n: usize) -> usize {
        self.inner.lock().gen_range(0..n)
    }
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_runs_repeat() {
        let a = Rng::with_seed(7);
        let b = Rng::with_seed(7);
        for _ in 0..16 {
            assert_eq!(a.below(100), b.below(100));
        }
    }

    #[test]
    fn choice_extremes() {
        let rng = Rng::with_seed(1);
        assert!(!rng.choice(0.0));
        assert!(rng.choice(1.0));
    }
}
