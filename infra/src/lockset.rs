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

use crate::Address;
use std::collections::BTreeMap;
use std::fmt;

/// The multiset of lock addresses a thread currently holds. Nested
/// acquisition of the same address increments the depth; a release
/// decrements it and the entry disappears when the depth reaches zero.
///
/// Atomic instruction regions use the bitwise complement of the target
/// address as a pseudo-lock key so a read-modify-write pair behaves
/// like a single lock-protected unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    locks: BTreeMap<Address, u32>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: Address) {
        *self.locks.entry(addr).or_insert(0) += 1;
    }

    pub fn remove(&mut self, addr: Address) {
        if let Some(depth) = self.locks.get_mut(&addr) {
            *depth -= 1;
            if *depth == 0 {
                self.locks.remove(&addr);
            }
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.locks.contains_key(&addr)
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// True iff `self` and `other` share no lock.
    pub fn disjoint(&self, other: &LockSet) -> bool {
        self.locks.keys().all(|a| !other.contains(*a))
    }

    /// True iff no lock of `self` is held in both `other1` and `other2`.
    /// This models "a common lock covering two distinct remote accesses":
    /// such a lock would pin the remote pair together and forbid the
    /// reordering under test.
    pub fn disjoint2(&self, other1: &LockSet, other2: &LockSet) -> bool {
        self.locks
            .keys()
            .all(|a| !(other1.contains(*a) && other2.contains(*a)))
    }

    /// Multiset equality.
    pub fn matches(&self, other: &LockSet) -> bool {
        self.locks == other.locks
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (addr, depth) in &self.locks {
            write!(f, "{:#x}*{} ", addr, depth)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_depth() {
        let mut ls = LockSet::new();
        ls.add(0x10);
        ls.add(0x10);
        ls.remove(0x10);
        assert!(ls.contains(0x10));
        ls.remove(0x10);
        assert!(ls.is_empty());
    }

    #[test]
    fn disjointness() {
        let mut a = LockSet::new();
        let mut b = LockSet::new();
        a.add(1);
        b.add(2);
        assert!(a.disjoint(&b));
        b.add(1);
        assert!(!a.disjoint(&b));
    }

    #[test]
    fn disjoint_with_both() {
        let mut a = LockSet::new();
        let mut b = LockSet::new();
        let mut c = LockSet::new();
        a.add(1);
        b.add(1);
        // lock 1 held at b but not at c: the remote pair released it
        assert!(a.disjoint2(&b, &c));
        c.add(1);
        // lock 1 held across both remote accesses
        assert!(!a.disjoint2(&b, &c));
    }

    #[test]
    fn multiset_equality() {
        let mut a = LockSet::new();
        let mut b = LockSet::new();
        a.add(5);
        a.add(5);
        b.add(5);
        assert!(!a.matches(&b));
        b.add(5);
        assert!(a.matches(&b));
    }
}
