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

/// Tracks which address regions the analyzers are allowed to inspect.
/// Regions come from image data/bss sections and the allocator family.
/// The filter is a coarse gate only; it says nothing about sharing.
#[derive(Debug, Default)]
pub struct RegionFilter {
    regions: BTreeMap<Address, u64>, // start -> size
}

impl RegionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a region. An insertion overlapping an existing region is
    /// silently dropped; the host occasionally replays allocations.
    pub fn add_region(&mut self, addr: Address, size: u64) {
        if size == 0 {
            return;
        }
        if self.locate(addr).is_some() || self.locate(addr + size - 1).is_some() {
            return;
        }
        // an existing region starting inside [addr, addr+size) also overlaps
        if self
            .regions
            .range(addr..addr.saturating_add(size))
            .next()
            .is_some()
        {
            return;
        }
        self.regions.insert(addr, size);
    }

    /// Remove the region starting exactly at `addr` and return its size
    /// so the caller can tear down per-address metadata. Returns 0 when
    /// no such region exists.
    pub fn remove_region(&mut self, addr: Address) -> u64 {
        self.regions.remove(&addr).unwrap_or(0)
    }

    /// True iff `addr` lies in no known region, i.e. the access must be
    /// skipped.
    pub fn filter(&self, addr: Address) -> bool {
        self.locate(addr).is_none()
    }

    fn locate(&self, addr: Address) -> Option<(Address, u64)> {
        let (&start, &size) = self.regions.range(..=addr).next_back()?;
        if addr < start + size {
            Some((start, size))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_queries() {
        let mut f = RegionFilter::new();
        f.add_region(0x1000, 0x100);
        assert!(!f.filter(0x1000));
        assert!(!f.filter(0x10ff));
        assert!(f.filter(0x1100));
        assert!(f.filter(0xfff));
    }

    #[test]
    fn overlapping_add_is_ignored() {
        let mut f = RegionFilter::new();
        f.add_region(0x1000, 0x100);
        f.add_region(0x1080, 0x100); // overlaps, dropped
        assert!(f.filter(0x1110));
        assert_eq!(f.remove_region(0x1080), 0);
        assert_eq!(f.remove_region(0x1000), 0x100);
        assert!(f.filter(0x1000));
    }

    #[test]
    fn remove_returns_size() {
        let mut f = RegionFilter::new();
        f.add_region(0x2000, 64);
        assert_eq!(f.remove_region(0x2000), 64);
        assert_eq!(f.remove_region(0x2000), 0);
    }
}
