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

//! Per-address access histories for the predictor. Each monitored
//! address keeps, per thread, an ordered list of vector-clock buckets;
//! all accesses made at the same clock value share a bucket. Buckets
//! are compressed and garbage collected to bound memory.

use crate::iroot::EventType;
use crate::static_info::InstId;
use std::collections::HashMap;
use weft_infra::lockset::LockSet;
use weft_infra::vclock::VectorClock;
use weft_infra::{ThreadId, Timestamp};

/// How many appends a bucket can take since its last compression
/// before it is compressed again.
const COMPRESS_THRESHOLD: usize = 70;

#[derive(Debug, Clone)]
pub struct PredAccess {
    pub clk: Timestamp,
    pub etype: EventType,
    pub inst: InstId,
    pub ls: LockSet,
}

impl PredAccess {
    pub fn new(clk: Timestamp, etype: EventType, inst: InstId, ls: &LockSet) -> Self {
        Self {
            clk,
            etype,
            inst,
            ls: ls.clone(),
        }
    }

    pub fn is_read(&self) -> bool {
        self.etype == EventType::MemRead
    }

    pub fn is_write(&self) -> bool {
        self.etype == EventType::MemWrite
    }

    pub fn is_lock(&self) -> bool {
        self.etype == EventType::MutexLock
    }

    pub fn is_unlock(&self) -> bool {
        self.etype == EventType::MutexUnlock
    }
}

pub type AccessVec = Vec<PredAccess>;
pub type PerThreadAccesses = Vec<(VectorClock, AccessVec)>;

#[derive(Debug, Default)]
pub struct AccessHistory {
    pub access_map: HashMap<ThreadId, PerThreadAccesses>,
    last_gc_size: HashMap<ThreadId, usize>,
}

impl AccessHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_vc(&self, thd: ThreadId) -> Option<&VectorClock> {
        self.access_map.get(&thd)?.last().map(|(vc, _)| vc)
    }

    pub fn last_access(&self, thd: ThreadId) -> Option<&PredAccess> {
        let (_, accesses) = self.access_map.get(&thd)?.last()?;
        accesses.last()
    }

    /// Append an access under `vc`, opening a new bucket when the
    /// clock advanced. Returns true iff a new bucket was opened (the
    /// caller then considers a GC pass).
    pub fn append(&mut self, thd: ThreadId, vc: &VectorClock, access: PredAccess) -> bool {
        let per_thd = self.access_map.entry(thd).or_default();
        match per_thd.last_mut() {
            None => {
                per_thd.push((vc.clone(), vec![access]));
                self.last_gc_size.insert(thd, 0);
                true
            }
            Some((last_vc, last_vec)) if last_vc.equals(vc) => {
                last_vec.push(access);
                self.maybe_compress(thd);
                false
            }
            Some((last_vc, last_vec)) => {
                debug_assert!(last_vc.happens_before(vc));
                compress(last_vec);
                per_thd.push((vc.clone(), vec![access]));
                self.last_gc_size.insert(thd, 0);
                true
            }
        }
    }

    /// Same as [`append`](Self::append) but without compression or GC
    /// bookkeeping; mutex histories stay small by construction.
    pub fn append_plain(&mut self, thd: ThreadId, vc: &VectorClock, access: PredAccess) {
        let per_thd = self.access_map.entry(thd).or_default();
        match per_thd.last_mut() {
            Some((last_vc, last_vec)) if last_vc.equals(vc) => last_vec.push(access),
            Some((last_vc, _)) => {
                debug_assert!(last_vc.happens_before(vc));
                per_thd.push((vc.clone(), vec![access]));
            }
            None => per_thd.push((vc.clone(), vec![access])),
        }
    }

    fn maybe_compress(&mut self, thd: ThreadId) {
        let last_gc = self.last_gc_size.get(&thd).copied().unwrap_or(0);
        let per_thd = self.access_map.get_mut(&thd).unwrap();
        let last_vec = &mut per_thd.last_mut().unwrap().1;
        if last_vec.len() < last_gc || last_vec.len() - last_gc < COMPRESS_THRESHOLD {
            return;
        }
        compress(last_vec);
        self.last_gc_size.insert(thd, last_vec.len());
    }

    /// Discard, per thread, every bucket prefix that happens before all
    /// other threads' current clocks and all other threads' most recent
    /// bucket clocks; nothing can reorder against those anymore.
    pub fn gc(&mut self, curr_vcs: &HashMap<ThreadId, VectorClock>) {
        let last_bucket_vcs: HashMap<ThreadId, VectorClock> = self
            .access_map
            .iter()
            .filter_map(|(&thd, per_thd)| per_thd.last().map(|(vc, _)| (thd, vc.clone())))
            .collect();

        for (&thd, per_thd) in self.access_map.iter_mut() {
            let mut cut = None;
            for idx in (0..per_thd.len()).rev() {
                let vc = &per_thd[idx].0;
                let mut collect = true;
                for (&other, other_vc) in curr_vcs {
                    if other == thd {
                        continue;
                    }
                    if !vc.happens_before(other_vc) {
                        collect = false;
                        break;
                    }
                    if let Some(last_vc) = last_bucket_vcs.get(&other) {
                        if !vc.happens_before(last_vc) {
                            collect = false;
                            break;
                        }
                    }
                }
                if collect {
                    cut = Some(idx);
                    break;
                }
            }
            if let Some(cut) = cut {
                per_thd.drain(..cut);
            }
        }
    }
}

/// Keep only the most recent access of each `(type, inst, lockset)`
/// combination, preserving temporal order.
fn compress(access_vec: &mut AccessVec) {
    let mut kept: Vec<PredAccess> = Vec::new();
    for access in access_vec.drain(..).rev() {
        let duplicate = kept
            .iter()
            .any(|k| k.etype == access.etype && k.inst == access.inst && k.ls.matches(&access.ls));
        if !duplicate {
            kept.push(access);
        }
    }
    kept.reverse();
    *access_vec = kept;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc(clk: Timestamp, etype: EventType, inst: InstId) -> PredAccess {
        PredAccess::new(clk, etype, inst, &LockSet::new())
    }

    #[test]
    fn buckets_split_on_clock_advance() {
        let mut h = AccessHistory::new();
        let mut vc = VectorClock::new();
        vc.increment(1);
        assert!(h.append(1, &vc, acc(1, EventType::MemRead, 7)));
        assert!(!h.append(1, &vc, acc(2, EventType::MemRead, 7)));
        vc.increment(1);
        assert!(h.append(1, &vc, acc(3, EventType::MemWrite, 8)));
        assert_eq!(h.access_map[&1].len(), 2);
        assert_eq!(h.last_access(1).unwrap().inst, 8);
    }

    #[test]
    fn compress_dedupes_but_keeps_order() {
        let mut v = vec![
            acc(1, EventType::MemRead, 7),
            acc(2, EventType::MemWrite, 8),
            acc(3, EventType::MemRead, 7),
        ];
        compress(&mut v);
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].inst, 8);
        assert_eq!(v[1].inst, 7);
        assert_eq!(v[1].clk, 3);
    }

    #[test]
    fn compress_respects_lockset_differences() {
        let mut ls = LockSet::new();
        ls.add(0x40);
        let mut v = vec![
            acc(1, EventType::MemRead, 7),
            PredAccess::new(2, EventType::MemRead, 7, &ls),
        ];
        compress(&mut v);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn gc_drops_fully_ordered_prefixes() {
        let mut h = AccessHistory::new();
        let mut vc1 = VectorClock::new();
        vc1.increment(1);
        h.append(1, &vc1, acc(1, EventType::MemWrite, 7));
        vc1.increment(1);
        h.append(1, &vc1, acc(2, EventType::MemWrite, 7));

        // thread 2's current clock dominates everything of thread 1
        let mut vc2 = vc1.clone();
        vc2.increment(2);
        let mut curr = HashMap::new();
        curr.insert(1u32, vc1.clone());
        curr.insert(2u32, vc2);

        h.gc(&curr);
        // the newest bucket survives
        assert_eq!(h.access_map[&1].len(), 1);
        assert_eq!(h.last_access(1).unwrap().clk, 2);
    }
}
