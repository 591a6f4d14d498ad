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

use crate::ThreadId;
use std::collections::BTreeMap;
use std::fmt;

/// A Lamport-style vector clock mapping thread ids to logical time.
/// Components that were never incremented read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    clocks: BTreeMap<ThreadId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, thd: ThreadId) -> u64 {
        self.clocks.get(&thd).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, thd: ThreadId) {
        *self.clocks.entry(thd).or_insert(0) += 1;
    }

    /// Component-wise maximum with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        for (&thd, &clk) in &other.clocks {
            let slot = self.clocks.entry(thd).or_insert(0);
            if *slot < clk {
                *slot = clk;
            }
        }
    }

    /// True iff every component of `self` is <= the corresponding
    /// component of `other` and at least one is strictly less.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for (&thd, &clk) in &self.clocks {
            let o = other.value(thd);
            if clk > o {
                return false;
            }
            if clk < o {
                strictly_less = true;
            }
        }
        for (&thd, &clk) in &other.clocks {
            if self.value(thd) < clk {
                strictly_less = true;
            }
        }
        strictly_less
    }

    pub fn happens_after(&self, other: &VectorClock) -> bool {
        other.happens_before(self)
    }

    pub fn equals(&self, other: &VectorClock) -> bool {
        // normalize out explicit zeros before comparing
        self.clocks
            .iter()
            .filter(|(_, &c)| c != 0)
            .eq(other.clocks.iter().filter(|(_, &c)| c != 0))
    }

    /// Neither ordered before nor after.
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !self.happens_after(other) && !self.equals(other)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (thd, clk) in &self.clocks {
            write!(f, "{}:{} ", thd, clk)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_basics() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(1);
        b.increment(1);
        b.increment(2);
        assert!(a.happens_before(&b));
        assert!(b.happens_after(&a));
        assert!(!b.happens_before(&a));
        assert!(!a.concurrent(&b));
    }

    #[test]
    fn concurrent_clocks() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(1);
        b.increment(2);
        assert!(a.concurrent(&b));
        assert!(!a.happens_before(&b));
    }

    #[test]
    fn join_is_componentwise_max() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(1);
        a.increment(1);
        b.increment(1);
        b.increment(2);
        a.join(&b);
        assert_eq!(a.value(1), 2);
        assert_eq!(a.value(2), 1);
    }

    #[test]
    fn monotone_under_increment() {
        let mut a = VectorClock::new();
        a.increment(7);
        let before = a.clone();
        a.increment(7);
        assert!(before.happens_before(&a));
    }
}
