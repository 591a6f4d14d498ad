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

//! Self-contained building blocks shared by the analysis and scheduling
//! crates: vector clocks, lock sets, the address region filter and the
//! semaphore the execution controller parks threads on.

pub mod filter;
pub mod lockset;
pub mod sem;
pub mod vclock;

/// A monitored memory address, as reported by the instrumentation host.
pub type Address = u64;

/// A runtime thread identifier. Only valid within a single run; the
/// scheduler model derives its own cross-run-stable uids from these.
pub type ThreadId = u32;

/// A per-thread dynamic instruction counter supplied by the host.
/// Monotonic, and allowed to wrap.
pub type Timestamp = u64;

/// Distance between two per-thread clock values. Clocks wrap, so the
/// distance is computed modulo the clock width.
#[inline]
pub fn clock_distance(start: Timestamp, end: Timestamp) -> Timestamp {
    end.wrapping_sub(start)
}

/// Align `addr` down to a multiple of `unit` (a power of two).
#[inline]
pub fn unit_down_align(addr: Address, unit: Address) -> Address {
    addr & !(unit - 1)
}

/// Align `addr` up to a multiple of `unit` (a power of two).
#[inline]
pub fn unit_up_align(addr: Address, unit: Address) -> Address {
    addr.wrapping_add(unit - 1) & !(unit - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(unit_down_align(0x1003, 4), 0x1000);
        assert_eq!(unit_up_align(0x1001, 4), 0x1004);
        assert_eq!(unit_up_align(0x1004, 4), 0x1004);
    }

    #[test]
    fn clock_distance_wraps() {
        assert_eq!(clock_distance(10, 14), 4);
        assert_eq!(clock_distance(Timestamp::MAX, 3), 4);
    }
}
