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

//! The iRoot predictor. Where the observer only mines dependencies
//! that actually happened, the predictor walks per-address access
//! histories under happens-before and lock-set reasoning to find
//! dependencies that could happen in an alternate feasible
//! interleaving of the same run.

mod history;

pub use history::PredAccess;

use crate::event::{Analyzer, Descriptor};
use crate::iroot::{EventType, IRootDb, IdiomType};
use crate::knob::Knob;
use crate::memo::Memo;
use crate::sinst::SharedInstDb;
use crate::static_info::{InstId, StaticInfo};
use history::AccessHistory;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use weft_infra::lockset::LockSet;
use weft_infra::vclock::VectorClock;
use weft_infra::{clock_distance, unit_down_align, unit_up_align, Address, ThreadId, Timestamp};

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        const SYS_ACCEPT: i32 = libc::SYS_accept as i32;
        const SYS_SELECT: i32 = libc::SYS_select as i32;
        const SYS_PSELECT6: i32 = libc::SYS_pselect6 as i32;
        const SYS_RT_SIGTIMEDWAIT: i32 = libc::SYS_rt_sigtimedwait as i32;
    } else {
        // x86_64 syscall numbers; the host delivers raw numbers and
        // only instruments x86_64 targets anyway
        const SYS_ACCEPT: i32 = 43;
        const SYS_SELECT: i32 = 23;
        const SYS_PSELECT6: i32 = 270;
        const SYS_RT_SIGTIMEDWAIT: i32 = 128;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const SIG_INT: i32 = libc::SIGINT;
        const SIG_ALRM: i32 = libc::SIGALRM;
    } else {
        const SIG_INT: i32 = 2;
        const SIG_ALRM: i32 = 14;
    }
}

#[derive(Debug, Default)]
struct MemMeta {
    shared: bool,
    last_access_thd: Option<ThreadId>,
    history: Option<AccessHistory>,
}

#[derive(Debug, Default)]
struct MutexMeta {
    history: AccessHistory,
}

#[derive(Debug, Default)]
struct CondMeta {
    wait_table: HashMap<ThreadId, VectorClock>,
    signal_table: HashMap<ThreadId, VectorClock>,
}

/// Barrier waits are double buffered: one table collects the arriving
/// generation while the other drains the departing one.
#[derive(Debug)]
struct BarrierMeta {
    wait_table1: HashMap<ThreadId, (VectorClock, bool)>,
    wait_table2: HashMap<ThreadId, (VectorClock, bool)>,
    pre_using_table1: bool,
    post_using_table1: bool,
}

impl Default for BarrierMeta {
    fn default() -> Self {
        Self {
            wait_table1: HashMap::new(),
            wait_table2: HashMap::new(),
            pre_using_table1: true,
            post_using_table1: true,
        }
    }
}

#[derive(Debug)]
enum Meta {
    Mem(MemMeta),
    Mutex(MutexMeta),
    Cond(CondMeta),
    Barrier(BarrierMeta),
}

/// A dynamic event: one side of a predicted Idiom-1 dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DynEvent {
    thd: ThreadId,
    etype: EventType,
    inst: InstId,
}

/// The clock interval over which a dependency partner was seen.
#[derive(Debug, Clone, Copy)]
struct DynRange {
    start: Timestamp,
    end: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LocalPair {
    prev_etype: EventType,
    prev_inst: InstId,
    curr_etype: EventType,
    curr_inst: InstId,
    same_addr: bool,
    thd: ThreadId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DeadlockPair {
    prev_inst: InstId,
    prev_addr: Address,
    curr_inst: InstId,
    curr_addr: Address,
    thd: ThreadId,
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    clk: Timestamp,
    addr: Address,
    etype: EventType,
    inst: InstId,
}

#[derive(Debug, Default)]
struct LocalInfo {
    access_map: HashMap<ThreadId, VecDeque<LocalEntry>>,
    pair_db: HashSet<LocalPair>,
    dyn_event_map: HashMap<DynEvent, HashMap<DynEvent, DynRange>>,
    r_dyn_event_map: HashMap<DynEvent, HashMap<DynEvent, DynRange>>,
}

#[derive(Default)]
struct State {
    filter: weft_infra::filter::RegionFilter,
    meta_map: HashMap<Address, Meta>,
    curr_vc: HashMap<ThreadId, VectorClock>,
    exit_vc: HashMap<ThreadId, VectorClock>,
    curr_ls: HashMap<ThreadId, LockSet>,
    monitored: HashMap<ThreadId, bool>,
    async_map: HashMap<ThreadId, bool>,
    async_start: HashMap<ThreadId, Timestamp>,
    local: LocalInfo,
    deadlock_pair_db: HashSet<DeadlockPair>,
}

/// A predicted Idiom-1 dependency `src -> dst`, pending memoization.
struct Emission {
    src_thd: ThreadId,
    src: PredAccess,
    dst_thd: ThreadId,
    dst: PredAccess,
}

pub struct Predictor {
    state: Mutex<State>,
    sinfo: Arc<Mutex<StaticInfo>>,
    iroot_db: Arc<Mutex<IRootDb>>,
    memo: Arc<Mutex<Memo>>,
    sinst_db: Arc<Mutex<SharedInstDb>>,
    sync_only: bool,
    unit_size: Address,
    complex_idioms: bool,
    vw: u64,
    racy_only: bool,
    predict_deadlock: bool,
}

impl Predictor {
    pub fn register(knob: &mut Knob) {
        knob.register_bool("enable_predictor", "whether enable the iroot predictor", "0");
        knob.register_bool(
            "sync_only",
            "whether only monitor synchronization accesses",
            "0",
        );
        knob.register_bool("complex_idioms", "whether target complex idioms", "0");
        knob.register_bool(
            "racy_only",
            "whether only consider sync and racy memory dependencies",
            "0",
        );
        knob.register_bool(
            "predict_deadlock",
            "whether predict and trigger deadlocks (experimental)",
            "0",
        );
        knob.register_int("unit_size", "the monitoring granularity in bytes", "4");
        knob.register_int("vw", "the vulnerability window (# dynamic inst)", "1000");
    }

    pub fn enabled(knob: &Knob) -> bool {
        knob.value_bool("enable_predictor")
    }

    pub fn new(
        knob: &Knob,
        sinfo: Arc<Mutex<StaticInfo>>,
        iroot_db: Arc<Mutex<IRootDb>>,
        memo: Arc<Mutex<Memo>>,
        sinst_db: Arc<Mutex<SharedInstDb>>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            sinfo,
            iroot_db,
            memo,
            sinst_db,
            sync_only: knob.value_bool("sync_only"),
            unit_size: knob.value_int("unit_size") as Address,
            complex_idioms: knob.value_bool("complex_idioms"),
            vw: knob.value_int("vw") as u64,
            racy_only: knob.value_bool("racy_only"),
            predict_deadlock: knob.value_bool("predict_deadlock"),
        }
    }

    // ---- region bookkeeping ----

    fn alloc_addr_region(&self, addr: Address, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.state.lock().filter.add_region(addr, size);
    }

    fn free_addr_region(&self, addr: Address) {
        if addr == 0 {
            return;
        }
        let mut state = self.state.lock();
        let size = state.filter.remove_region(addr);
        let start = unit_down_align(addr, self.unit_size);
        let end = unit_up_align(addr + size, self.unit_size);
        let mut iaddr = start;
        while iaddr < end {
            if state.meta_map.contains_key(&iaddr) {
                // the last accesses of this meta can still pair with
                // future accesses; sweep successors before dropping it
                let emissions = self.sweep_meta_successors(&state, iaddr);
                for e in &emissions {
                    self.update_memo(&mut state, e);
                }
                state.meta_map.remove(&iaddr);
            }
            iaddr += self.unit_size;
        }
    }

    // ---- lock-set feasibility ----

    fn check_lockset(
        &self,
        curr: &PredAccess,
        curr_prev: Option<&PredAccess>,
        rmt: &PredAccess,
        rmt_next: Option<&PredAccess>,
    ) -> bool {
        if self.racy_only && !curr.ls.disjoint(&rmt.ls) {
            return false;
        }
        if curr.ls.is_empty() || rmt.ls.is_empty() {
            return true;
        }
        if curr.ls.disjoint(&rmt.ls) {
            return true;
        }
        match (curr_prev, rmt_next) {
            (None, None) => true,
            (Some(curr_prev), None) => rmt.ls.disjoint2(&curr.ls, &curr_prev.ls),
            (None, Some(rmt_next)) => curr.ls.disjoint2(&rmt.ls, &rmt_next.ls),
            (Some(curr_prev), Some(rmt_next)) => {
                curr.ls.disjoint2(&rmt.ls, &rmt_next.ls)
                    && rmt.ls.disjoint2(&curr.ls, &curr_prev.ls)
            }
        }
    }

    // ---- async tagging ----

    fn check_async(state: &State, thd: ThreadId) -> bool {
        state.async_map.get(&thd).copied().unwrap_or(false)
    }

    fn check_async_at(state: &State, thd: ThreadId, clk: Timestamp) -> bool {
        if !Self::check_async(state, thd) {
            return false;
        }
        let start = state.async_start.get(&thd).copied().unwrap_or(0);
        clk > start
    }

    // ---- memoization ----

    fn update_memo(&self, state: &mut State, e: &Emission) {
        let mut db = self.iroot_db.lock();
        let e0 = db.get_event(e.src.inst, e.src.etype);
        let e1 = db.get_event(e.dst.inst, e.dst.etype);
        let iroot = db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
        drop(db);
        let mut memo = self.memo.lock();
        memo.predicted(iroot);
        if Self::check_async_at(state, e.src_thd, e.src.clk)
            || Self::check_async_at(state, e.dst_thd, e.dst.clk)
        {
            memo.set_async(iroot);
        }
        drop(memo);
        if self.complex_idioms {
            self.update_dyn_event_map(state, e);
        }
    }

    fn update_dyn_event_map(&self, state: &mut State, e: &Emission) {
        let src = DynEvent {
            thd: e.src_thd,
            etype: e.src.etype,
            inst: e.src.inst,
        };
        let dst = DynEvent {
            thd: e.dst_thd,
            etype: e.dst.etype,
            inst: e.dst.inst,
        };
        let range_map = state.local.dyn_event_map.entry(src).or_default();
        range_map
            .entry(dst)
            .and_modify(|r| r.end = e.dst.clk)
            .or_insert(DynRange {
                start: e.dst.clk,
                end: e.dst.clk,
            });
        let r_range_map = state.local.r_dyn_event_map.entry(dst).or_default();
        r_range_map
            .entry(src)
            .and_modify(|r| r.end = e.src.clk)
            .or_insert(DynRange {
                start: e.src.clk,
                end: e.src.clk,
            });
    }

    // ---- the history walks ----

    /// Walk one remote thread's history backwards from the present and
    /// collect (a) direct predictions against concurrent accesses and
    /// (b) the precedent boundary and candidate for the feasibility
    /// pass. `curr_is_read` restricts partners to writes.
    #[allow(clippy::too_many_arguments)]
    fn walk_mem_preds(
        &self,
        history: &AccessHistory,
        monitored: &HashMap<ThreadId, bool>,
        curr_thd: ThreadId,
        curr_vc: &VectorClock,
        curr: &PredAccess,
        curr_last: Option<&(VectorClock, PredAccess)>,
        curr_is_read: bool,
        emissions: &mut Vec<Emission>,
    ) {
        let mut precedent_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();
        let mut candidate_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();

        for (&thd, per_thd) in &history.access_map {
            if thd == curr_thd {
                continue;
            }
            let thd_monitored = monitored.get(&thd).copied().unwrap_or(false);
            let mut recent: Option<&PredAccess> = None;
            let mut first_reached = false;

            'buckets: for (vc, accesses) in per_thd.iter().rev() {
                if vc.happens_after(curr_vc) {
                    crate::fatal!("access history bucket after the current access");
                } else if vc.happens_before(curr_vc) {
                    for access in accesses.iter().rev() {
                        if !first_reached {
                            let can_candidate = access.is_write() || !curr_is_read;
                            if can_candidate && thd_monitored {
                                if let Some(recent) = recent {
                                    let ordered_out = curr_last
                                        .map_or(false, |(lvc, _)| vc.happens_before(lvc));
                                    if !ordered_out
                                        && self.check_lockset(
                                            curr,
                                            curr_last.map(|(_, a)| a),
                                            access,
                                            Some(recent),
                                        )
                                    {
                                        candidate_map
                                            .insert(thd, (vc.clone(), access.clone()));
                                    }
                                }
                            }
                            if access.is_write() {
                                precedent_map.insert(thd, (vc.clone(), access.clone()));
                                break 'buckets;
                            }
                            first_reached = true;
                        } else if access.is_write() {
                            precedent_map.insert(thd, (vc.clone(), access.clone()));
                            break 'buckets;
                        }
                        recent = Some(access);
                    }
                } else {
                    // concurrent bucket: every qualifying access is a
                    // directly feasible predecessor
                    for access in accesses.iter().rev() {
                        if thd_monitored && (access.is_write() || !curr_is_read) {
                            if let Some(recent) = recent {
                                if self.check_lockset(
                                    curr,
                                    curr_last.map(|(_, a)| a),
                                    access,
                                    Some(recent),
                                ) {
                                    emissions.push(Emission {
                                        src_thd: thd,
                                        src: access.clone(),
                                        dst_thd: curr_thd,
                                        dst: curr.clone(),
                                    });
                                }
                            }
                        }
                        recent = Some(access);
                    }
                }
            }
        }

        // a candidate survives only if no other thread's precedent sits
        // between it and the current access
        for (thd, (vc, access)) in &candidate_map {
            let feasible = !precedent_map.iter().any(|(other, (inner_vc, _))| {
                other != thd && vc.happens_before(inner_vc)
            });
            if feasible {
                emissions.push(Emission {
                    src_thd: *thd,
                    src: access.clone(),
                    dst_thd: curr_thd,
                    dst: curr.clone(),
                });
            }
        }
    }

    /// The time-reversed walk: find feasible successors of `curr`,
    /// which is this thread's most recent (or final) access.
    #[allow(clippy::too_many_arguments)]
    fn walk_mem_succs(
        &self,
        history: &AccessHistory,
        monitored: &HashMap<ThreadId, bool>,
        curr_thd: ThreadId,
        curr_vc: &VectorClock,
        curr: &PredAccess,
        curr_next: Option<&PredAccess>,
        curr_is_read: bool,
        emissions: &mut Vec<Emission>,
    ) {
        if !monitored.get(&curr_thd).copied().unwrap_or(false) {
            return;
        }
        let mut successive_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();
        let mut candidate_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();

        for (&thd, per_thd) in &history.access_map {
            if thd == curr_thd {
                continue;
            }
            let thd_monitored = monitored.get(&thd).copied().unwrap_or(false);
            let mut recent: Option<&PredAccess> = None;
            let mut first_reached = false;

            'buckets: for (vc, accesses) in per_thd.iter() {
                if vc.happens_before(curr_vc) {
                    // cannot be a successor; only track recency
                    for access in accesses.iter() {
                        recent = Some(access);
                    }
                } else if vc.happens_after(curr_vc) {
                    for access in accesses.iter() {
                        if !first_reached {
                            let can_candidate = access.is_write() || !curr_is_read;
                            if can_candidate
                                && thd_monitored
                                && self.check_lockset(access, recent, curr, curr_next)
                            {
                                candidate_map.insert(thd, (vc.clone(), access.clone()));
                            }
                            if access.is_write() {
                                successive_map.insert(thd, (vc.clone(), access.clone()));
                                break 'buckets;
                            }
                            first_reached = true;
                        } else if access.is_write() {
                            successive_map.insert(thd, (vc.clone(), access.clone()));
                            break 'buckets;
                        }
                        recent = Some(access);
                    }
                } else {
                    for access in accesses.iter() {
                        if thd_monitored
                            && (access.is_write() || !curr_is_read)
                            && self.check_lockset(access, recent, curr, curr_next)
                        {
                            emissions.push(Emission {
                                src_thd: curr_thd,
                                src: curr.clone(),
                                dst_thd: thd,
                                dst: access.clone(),
                            });
                        }
                        recent = Some(access);
                    }
                }
            }
        }

        for (thd, (vc, access)) in &candidate_map {
            let feasible = !successive_map.iter().any(|(other, (inner_vc, _))| {
                other != thd && vc.happens_after(inner_vc)
            });
            if feasible {
                emissions.push(Emission {
                    src_thd: curr_thd,
                    src: curr.clone(),
                    dst_thd: *thd,
                    dst: access.clone(),
                });
            }
        }
    }

    /// Predecessor walk for a lock acquisition. The search in each
    /// remote thread stops at its first earlier access: a lock blocks
    /// the reordering, an unlock is the candidate dependency source.
    fn walk_mutex_preds(
        &self,
        history: &AccessHistory,
        monitored: &HashMap<ThreadId, bool>,
        curr_thd: ThreadId,
        curr_vc: &VectorClock,
        curr: &PredAccess,
        curr_last: Option<&(VectorClock, PredAccess)>,
        emissions: &mut Vec<Emission>,
    ) {
        let mut precedent_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();
        let mut candidate_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();

        for (&thd, per_thd) in &history.access_map {
            if thd == curr_thd {
                continue;
            }
            let thd_monitored = monitored.get(&thd).copied().unwrap_or(false);
            let mut recent_lock: Option<&PredAccess> = None;

            'buckets: for (vc, accesses) in per_thd.iter().rev() {
                if vc.happens_after(curr_vc) {
                    crate::fatal!("mutex history bucket after the current lock");
                } else if vc.happens_before(curr_vc) {
                    if let Some(access) = accesses.last() {
                        if !access.is_lock() {
                            if thd_monitored {
                                if let Some(recent_lock) = recent_lock {
                                    let ordered_out = curr_last
                                        .map_or(false, |(lvc, _)| vc.happens_before(lvc));
                                    if !ordered_out
                                        && self.check_lockset(
                                            curr,
                                            curr_last.map(|(_, a)| a),
                                            access,
                                            Some(recent_lock),
                                        )
                                    {
                                        candidate_map
                                            .insert(thd, (vc.clone(), access.clone()));
                                    }
                                }
                            }
                        }
                        precedent_map.insert(thd, (vc.clone(), access.clone()));
                    }
                    break 'buckets;
                } else {
                    for access in accesses.iter().rev() {
                        if access.is_lock() {
                            recent_lock = Some(access);
                        } else if thd_monitored {
                            if let Some(recent_lock) = recent_lock {
                                if self.check_lockset(
                                    curr,
                                    curr_last.map(|(_, a)| a),
                                    access,
                                    Some(recent_lock),
                                ) {
                                    emissions.push(Emission {
                                        src_thd: thd,
                                        src: access.clone(),
                                        dst_thd: curr_thd,
                                        dst: curr.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        for (thd, (vc, access)) in &candidate_map {
            let feasible = !precedent_map.iter().any(|(other, (inner_vc, _))| {
                other != thd && vc.happens_before(inner_vc)
            });
            if feasible {
                emissions.push(Emission {
                    src_thd: *thd,
                    src: access.clone(),
                    dst_thd: curr_thd,
                    dst: curr.clone(),
                });
            }
        }
    }

    /// Successor walk for an unlock (at the next own lock, thread exit
    /// or meta teardown).
    fn walk_mutex_succs(
        &self,
        history: &AccessHistory,
        monitored: &HashMap<ThreadId, bool>,
        curr_thd: ThreadId,
        curr_vc: &VectorClock,
        curr: &PredAccess,
        curr_next: Option<&PredAccess>,
        emissions: &mut Vec<Emission>,
    ) {
        if !monitored.get(&curr_thd).copied().unwrap_or(false) {
            return;
        }
        let mut successive_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();
        let mut candidate_map: HashMap<ThreadId, (VectorClock, PredAccess)> = HashMap::new();

        for (&thd, per_thd) in &history.access_map {
            if thd == curr_thd {
                continue;
            }
            let thd_monitored = monitored.get(&thd).copied().unwrap_or(false);
            let mut recent_unlock: Option<&PredAccess> = None;

            'buckets: for (vc, accesses) in per_thd.iter() {
                if vc.happens_before(curr_vc) {
                    for access in accesses.iter() {
                        if access.is_unlock() {
                            recent_unlock = Some(access);
                        }
                    }
                } else if vc.happens_after(curr_vc) {
                    if let Some(access) = accesses.first() {
                        if !access.is_unlock()
                            && thd_monitored
                            && self.check_lockset(access, recent_unlock, curr, curr_next)
                        {
                            candidate_map.insert(thd, (vc.clone(), access.clone()));
                        }
                        successive_map.insert(thd, (vc.clone(), access.clone()));
                    }
                    break 'buckets;
                } else {
                    for access in accesses.iter() {
                        if access.is_unlock() {
                            recent_unlock = Some(access);
                        } else if thd_monitored
                            && self.check_lockset(access, recent_unlock, curr, curr_next)
                        {
                            emissions.push(Emission {
                                src_thd: curr_thd,
                                src: curr.clone(),
                                dst_thd: thd,
                                dst: access.clone(),
                            });
                        }
                    }
                }
            }
        }

        for (thd, (vc, access)) in &candidate_map {
            let feasible = !successive_map.iter().any(|(other, (inner_vc, _))| {
                other != thd && vc.happens_after(inner_vc)
            });
            if feasible {
                emissions.push(Emission {
                    src_thd: curr_thd,
                    src: curr.clone(),
                    dst_thd: *thd,
                    dst: access.clone(),
                });
            }
        }
    }

    // ---- memory access handling ----

    /// The location becomes interesting once a second thread touches it
    /// or its instruction is known shared; histories only exist from
    /// that point on.
    fn check_shared(&self, state: &mut State, thd: ThreadId, inst: InstId, addr: Address) -> bool {
        let shared_inst = self.sinst_db.lock().shared(inst);
        let meta = match state.meta_map.entry(addr).or_insert_with(|| Meta::Mem(MemMeta::default()))
        {
            Meta::Mem(meta) => meta,
            _ => return false, // sync variable
        };
        if meta.shared {
            return true;
        }
        if shared_inst {
            meta.history = Some(AccessHistory::new());
            meta.shared = true;
            return true;
        }
        match meta.last_access_thd {
            None => {
                meta.last_access_thd = Some(thd);
                false
            }
            Some(last) if last == thd => false,
            Some(_) => {
                meta.history = Some(AccessHistory::new());
                meta.shared = true;
                true
            }
        }
    }

    fn update_for_mem(
        &self,
        state: &mut State,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        addr: Address,
        etype: EventType,
    ) {
        let curr_vc = state.curr_vc.get(&thd).cloned().unwrap_or_default();
        let curr = PredAccess::new(clk, etype, inst, &state.curr_ls[&thd]);
        let monitored_self = state.monitored.get(&thd).copied().unwrap_or(false);
        let is_read = etype == EventType::MemRead;

        let mut emissions = Vec::new();
        {
            let history = match state.meta_map.get(&addr) {
                Some(Meta::Mem(meta)) => match &meta.history {
                    Some(history) => history,
                    None => return,
                },
                _ => return,
            };
            if monitored_self {
                let curr_last = history
                    .last_vc(thd)
                    .cloned()
                    .zip(history.last_access(thd).cloned());

                self.walk_mem_preds(
                    history,
                    &state.monitored,
                    thd,
                    &curr_vc,
                    &curr,
                    curr_last.as_ref(),
                    is_read,
                    &mut emissions,
                );

                // the new access bounds this thread's previous one; its
                // successors can be resolved now
                if let Some((last_vc, last_access)) = &curr_last {
                    self.walk_mem_succs(
                        history,
                        &state.monitored,
                        thd,
                        last_vc,
                        last_access,
                        Some(&curr),
                        last_access.is_read(),
                        &mut emissions,
                    );
                }
            }
        }

        for e in &emissions {
            self.update_memo(state, e);
        }

        if monitored_self && self.complex_idioms {
            self.update_local_info(state, thd, &curr, addr);
        }

        if let Some(Meta::Mem(meta)) = state.meta_map.get_mut(&addr) {
            if let Some(history) = &mut meta.history {
                let opened_bucket = history.append(thd, &curr_vc, curr);
                if opened_bucket {
                    history.gc(&state.curr_vc);
                }
            }
        }
    }

    // ---- local pair tracking for complex idioms ----

    fn valid_pair(prev: EventType, curr: EventType) -> bool {
        !matches!(
            (prev, curr),
            (EventType::MutexLock, EventType::MutexUnlock)
                | (EventType::MutexLock, EventType::MutexLock)
                | (EventType::MutexUnlock, EventType::MutexUnlock)
        )
    }

    fn update_local_info(&self, state: &mut State, thd: ThreadId, curr: &PredAccess, addr: Address) {
        if !curr.etype.is_sync() && !self.sinst_db.lock().shared(curr.inst) {
            return; // provably thread-local instruction
        }

        let curr_clk = curr.clk;
        let mut pairs = Vec::new();
        let mut deadlock_pairs = Vec::new();
        {
            let access_list = state.local.access_map.entry(thd).or_default();

            let mut touched: HashSet<Address> = HashSet::new();
            for entry in access_list.iter().rev() {
                if clock_distance(entry.clk, curr_clk) >= self.vw {
                    break;
                }
                if !touched.insert(entry.addr) {
                    continue;
                }
                if entry.clk != curr_clk {
                    if Self::valid_pair(entry.etype, curr.etype) {
                        pairs.push(LocalPair {
                            prev_etype: entry.etype,
                            prev_inst: entry.inst,
                            curr_etype: curr.etype,
                            curr_inst: curr.inst,
                            same_addr: entry.addr == addr,
                            thd,
                        });
                    }
                    if self.predict_deadlock
                        && curr.etype == EventType::MutexLock
                        && entry.etype == EventType::MutexLock
                        && entry.addr != addr
                    {
                        deadlock_pairs.push(DeadlockPair {
                            prev_inst: entry.inst,
                            prev_addr: entry.addr,
                            curr_inst: curr.inst,
                            curr_addr: addr,
                            thd,
                        });
                    }
                }
                if entry.addr == addr {
                    break;
                }
            }

            while let Some(front) = access_list.front() {
                if clock_distance(front.clk, curr_clk) >= self.vw {
                    access_list.pop_front();
                } else {
                    break;
                }
            }
            access_list.push_back(LocalEntry {
                clk: curr_clk,
                addr,
                etype: curr.etype,
                inst: curr.inst,
            });
        }
        state.local.pair_db.extend(pairs);
        state.deadlock_pair_db.extend(deadlock_pairs);
    }

    // ---- mutex handling ----

    fn ensure_mutex_meta(&self, state: &mut State, addr: Address) {
        let slot = state
            .meta_map
            .entry(addr)
            .or_insert_with(|| Meta::Mutex(MutexMeta::default()));
        if !matches!(slot, Meta::Mutex(_)) {
            // the address was first seen as plain data; re-type it
            *slot = Meta::Mutex(MutexMeta::default());
        }
    }

    fn update_for_lock(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        self.ensure_mutex_meta(state, addr);
        let curr_vc = state.curr_vc.get(&thd).cloned().unwrap_or_default();
        let curr = PredAccess::new(clk, EventType::MutexLock, inst, &state.curr_ls[&thd]);
        let monitored_self = state.monitored.get(&thd).copied().unwrap_or(false);

        let mut emissions = Vec::new();
        if monitored_self {
            let history = match state.meta_map.get(&addr) {
                Some(Meta::Mutex(meta)) => &meta.history,
                _ => unreachable!(),
            };
            let curr_last = history
                .last_vc(thd)
                .cloned()
                .zip(history.last_access(thd).cloned());
            debug_assert!(curr_last.as_ref().map_or(true, |(_, a)| a.is_unlock()));

            self.walk_mutex_preds(
                history,
                &state.monitored,
                thd,
                &curr_vc,
                &curr,
                curr_last.as_ref(),
                &mut emissions,
            );

            if let Some((last_vc, last_access)) = &curr_last {
                self.walk_mutex_succs(
                    history,
                    &state.monitored,
                    thd,
                    last_vc,
                    last_access,
                    Some(&curr),
                    &mut emissions,
                );
            }
        }

        for e in &emissions {
            self.update_memo(state, e);
        }

        if monitored_self && self.complex_idioms {
            self.update_local_info(state, thd, &curr, addr);
        }

        state.curr_ls.get_mut(&thd).unwrap().add(addr);
        self.append_mutex_access(state, thd, &curr_vc, addr, curr);
    }

    fn update_for_unlock(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        self.ensure_mutex_meta(state, addr);
        let curr_vc = state.curr_vc.get(&thd).cloned().unwrap_or_default();
        state.curr_ls.get_mut(&thd).unwrap().remove(addr);
        let curr = PredAccess::new(clk, EventType::MutexUnlock, inst, &state.curr_ls[&thd]);

        if state.monitored.get(&thd).copied().unwrap_or(false) && self.complex_idioms {
            self.update_local_info(state, thd, &curr, addr);
        }

        self.append_mutex_access(state, thd, &curr_vc, addr, curr);
    }

    fn append_mutex_access(
        &self,
        state: &mut State,
        thd: ThreadId,
        vc: &VectorClock,
        addr: Address,
        access: PredAccess,
    ) {
        if let Some(Meta::Mutex(meta)) = state.meta_map.get_mut(&addr) {
            meta.history.append_plain(thd, vc, access);
        }
    }

    /// Resolve the final successors of the last accesses recorded in a
    /// meta. Used at meta teardown for every thread, and at thread exit
    /// for the exiting one.
    fn sweep_meta_successors(&self, state: &State, addr: Address) -> Vec<Emission> {
        let mut emissions = Vec::new();
        match state.meta_map.get(&addr) {
            Some(Meta::Mem(meta)) => {
                if let Some(history) = &meta.history {
                    let thds: Vec<ThreadId> = history.access_map.keys().copied().collect();
                    for thd in thds {
                        if let Some((vc, access)) =
                            history.last_vc(thd).cloned().zip(history.last_access(thd).cloned())
                        {
                            self.walk_mem_succs(
                                history,
                                &state.monitored,
                                thd,
                                &vc,
                                &access,
                                None,
                                access.is_read(),
                                &mut emissions,
                            );
                        }
                    }
                }
            }
            Some(Meta::Mutex(meta)) => {
                let thds: Vec<ThreadId> = meta.history.access_map.keys().copied().collect();
                for thd in thds {
                    if let Some((vc, access)) = meta
                        .history
                        .last_vc(thd)
                        .cloned()
                        .zip(meta.history.last_access(thd).cloned())
                    {
                        if access.is_unlock() {
                            self.walk_mutex_succs(
                                &meta.history,
                                &state.monitored,
                                thd,
                                &vc,
                                &access,
                                None,
                                &mut emissions,
                            );
                        }
                    }
                }
            }
            _ => {}
        }
        emissions
    }

    fn sweep_thread_successors(&self, state: &State, thd: ThreadId) -> Vec<Emission> {
        let mut emissions = Vec::new();
        for meta in state.meta_map.values() {
            match meta {
                Meta::Mem(meta) => {
                    if let Some(history) = &meta.history {
                        if let Some((vc, access)) =
                            history.last_vc(thd).cloned().zip(history.last_access(thd).cloned())
                        {
                            self.walk_mem_succs(
                                history,
                                &state.monitored,
                                thd,
                                &vc,
                                &access,
                                None,
                                access.is_read(),
                                &mut emissions,
                            );
                        }
                    }
                }
                Meta::Mutex(meta) => {
                    if let Some((vc, access)) = meta
                        .history
                        .last_vc(thd)
                        .cloned()
                        .zip(meta.history.last_access(thd).cloned())
                    {
                        if access.is_unlock() {
                            self.walk_mutex_succs(
                                &meta.history,
                                &state.monitored,
                                thd,
                                &vc,
                                &access,
                                None,
                                &mut emissions,
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        emissions
    }

    // ---- the exit-time complex idiom sweep ----

    fn predict_complex_iroots(&self, state: &State) {
        log::debug!(
            "local pairs = {}, dyn events = {}, reverse dyn events = {}",
            state.local.pair_db.len(),
            state.local.dyn_event_map.len(),
            state.local.r_dyn_event_map.len()
        );

        for pair in &state.local.pair_db {
            let curr_event = DynEvent {
                thd: pair.thd,
                etype: pair.curr_etype,
                inst: pair.curr_inst,
            };
            let prev_event = DynEvent {
                thd: pair.thd,
                etype: pair.prev_etype,
                inst: pair.prev_inst,
            };

            let succs = match state.local.dyn_event_map.get(&prev_event) {
                Some(map) => map,
                None => continue,
            };
            let preds = match state.local.r_dyn_event_map.get(&curr_event) {
                Some(map) => map,
                None => continue,
            };

            let curr_async = Self::check_async(state, pair.thd);

            if pair.same_addr {
                for (se, sr) in succs {
                    let mut idiom2_exists = false;
                    for (pe, pr) in preds {
                        if pe.thd == se.thd && sr.start <= pr.end {
                            self.predict(
                                IdiomType::Idiom3,
                                &[
                                    (prev_event.inst, prev_event.etype),
                                    (se.inst, se.etype),
                                    (pe.inst, pe.etype),
                                    (curr_event.inst, curr_event.etype),
                                ],
                                curr_async
                                    || Self::check_async_at(state, se.thd, sr.end)
                                    || Self::check_async_at(state, pe.thd, pr.end),
                            );
                        }
                        if !idiom2_exists
                            && pe.thd == se.thd
                            && pe.etype == se.etype
                            && pe.inst == se.inst
                            && sr.start <= pr.end
                            && pr.start <= sr.end
                        {
                            idiom2_exists = true;
                        }
                    }
                    if idiom2_exists {
                        self.predict(
                            IdiomType::Idiom2,
                            &[
                                (prev_event.inst, prev_event.etype),
                                (se.inst, se.etype),
                                (curr_event.inst, curr_event.etype),
                            ],
                            curr_async || Self::check_async_at(state, se.thd, sr.end),
                        );
                    }
                }
            } else {
                for (se, sr) in succs {
                    for (pe, pr) in preds {
                        if pe.thd != se.thd {
                            continue;
                        }
                        if sr.start <= pr.end {
                            self.predict(
                                IdiomType::Idiom4,
                                &[
                                    (prev_event.inst, prev_event.etype),
                                    (se.inst, se.etype),
                                    (pe.inst, pe.etype),
                                    (curr_event.inst, curr_event.etype),
                                ],
                                curr_async
                                    || Self::check_async_at(state, se.thd, sr.end)
                                    || Self::check_async_at(state, pe.thd, pr.end),
                            );
                        }
                        if pr.start <= sr.end {
                            // the crossed shape needs the mirrored pair
                            // to be a real local pair in the remote
                            // thread
                            let remote_pair = LocalPair {
                                prev_etype: pe.etype,
                                prev_inst: pe.inst,
                                curr_etype: se.etype,
                                curr_inst: se.inst,
                                same_addr: false,
                                thd: se.thd,
                            };
                            if state.local.pair_db.contains(&remote_pair) {
                                self.predict(
                                    IdiomType::Idiom5,
                                    &[
                                        (prev_event.inst, prev_event.etype),
                                        (se.inst, se.etype),
                                        (pe.inst, pe.etype),
                                        (curr_event.inst, curr_event.etype),
                                    ],
                                    curr_async
                                        || Self::check_async_at(state, se.thd, sr.end)
                                        || Self::check_async_at(state, pe.thd, pr.end),
                                );
                            }
                        }
                    }
                }
            }
        }

        if self.predict_deadlock {
            for outer in &state.deadlock_pair_db {
                for inner in &state.deadlock_pair_db {
                    if outer.thd != inner.thd
                        && outer.curr_addr == inner.prev_addr
                        && outer.prev_addr == inner.curr_addr
                    {
                        self.predict(
                            IdiomType::Idiom5,
                            &[
                                (outer.prev_inst, EventType::MutexLock),
                                (inner.curr_inst, EventType::MutexLock),
                                (inner.prev_inst, EventType::MutexLock),
                                (outer.curr_inst, EventType::MutexLock),
                            ],
                            false,
                        );
                    }
                }
            }
        }
    }

    fn predict(&self, idiom: IdiomType, events: &[(InstId, EventType)], is_async: bool) {
        let mut db = self.iroot_db.lock();
        let ids: Vec<_> = events
            .iter()
            .map(|&(inst, etype)| db.get_event(inst, etype))
            .collect();
        let iroot = db.get_iroot(idiom, &ids);
        drop(db);
        let mut memo = self.memo.lock();
        memo.predicted(iroot);
        if is_async {
            memo.set_async(iroot);
        }
    }

    fn for_each_unit(&self, addr: Address, size: u64, mut f: impl FnMut(Address)) {
        let start = unit_down_align(addr, self.unit_size);
        let end = unit_up_align(addr + size, self.unit_size);
        let mut iaddr = start;
        while iaddr < end {
            f(iaddr);
            iaddr += self.unit_size;
        }
    }
}

impl Analyzer for Predictor {
    fn desc(&self) -> Descriptor {
        let mut desc = Descriptor::new();
        if !self.sync_only {
            desc.hook_before_mem = true;
        }
        desc.hook_syscall = true;
        desc.hook_signal = true;
        desc.hook_atomic_inst = true;
        desc.hook_pthread_func = true;
        desc.hook_malloc_func = true;
        desc.track_inst_count = true;
        desc
    }

    fn program_exit(&self) {
        if self.complex_idioms {
            let state = self.state.lock();
            self.predict_complex_iroots(&state);
        }
    }

    fn image_load(
        &self,
        _image: crate::static_info::ImageId,
        low_addr: Address,
        high_addr: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
        debug_assert!(low_addr != 0 && high_addr > low_addr);
        if data_start != 0 {
            self.alloc_addr_region(data_start, data_size);
        }
        if bss_start != 0 {
            self.alloc_addr_region(bss_start, bss_size);
        }
    }

    fn image_unload(
        &self,
        _image: crate::static_info::ImageId,
        _low_addr: Address,
        _high_addr: Address,
        data_start: Address,
        _data_size: u64,
        bss_start: Address,
        _bss_size: u64,
    ) {
        if data_start != 0 {
            self.free_addr_region(data_start);
        }
        if bss_start != 0 {
            self.free_addr_region(bss_start);
        }
    }

    fn syscall_entry(&self, thd: ThreadId, clk: Timestamp, syscall_num: i32) {
        if matches!(
            syscall_num,
            n if n == SYS_ACCEPT || n == SYS_SELECT || n == SYS_PSELECT6 || n == SYS_RT_SIGTIMEDWAIT
        ) {
            let mut state = self.state.lock();
            if !state.async_map.get(&thd).copied().unwrap_or(false) {
                state.async_map.insert(thd, true);
                state.async_start.insert(thd, clk);
            }
        }
    }

    fn signal_received(&self, thd: ThreadId, clk: Timestamp, signal_num: i32) {
        if signal_num == SIG_INT || signal_num == SIG_ALRM {
            let mut state = self.state.lock();
            if !state.async_map.get(&thd).copied().unwrap_or(false) {
                state.async_map.insert(thd, true);
                state.async_start.insert(thd, clk);
            }
        }
    }

    fn thread_start(&self, thd: ThreadId, parent: Option<ThreadId>) {
        let mut state = self.state.lock();
        let mut vc = VectorClock::new();
        vc.increment(thd);
        if let Some(parent) = parent {
            if let Some(parent_vc) = state.curr_vc.get_mut(&parent) {
                vc.join(parent_vc);
                parent_vc.increment(parent);
            }
        }
        state.curr_vc.insert(thd, vc);
        state.curr_ls.insert(thd, LockSet::new());
        // TODO: selective monitoring
        state.monitored.insert(thd, true);
        state.async_map.insert(thd, false);
    }

    fn thread_exit(&self, thd: ThreadId, _clk: Timestamp) {
        let mut state = self.state.lock();
        let emissions = self.sweep_thread_successors(&state, thd);
        for e in &emissions {
            self.update_memo(&mut state, e);
        }
        if let Some(vc) = state.curr_vc.remove(&thd) {
            state.exit_vc.insert(thd, vc);
        }
        state.curr_ls.remove(&thd);
    }

    fn before_mem_read(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock();
        if state.filter.filter(addr) {
            return;
        }
        self.for_each_unit(addr, size, |iaddr| {
            if self.check_shared(&mut state, thd, inst, iaddr) {
                self.update_for_mem(&mut state, thd, clk, inst, iaddr, EventType::MemRead);
            }
        });
    }

    fn before_mem_write(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock();
        if state.filter.filter(addr) {
            return;
        }
        self.for_each_unit(addr, size, |iaddr| {
            if self.check_shared(&mut state, thd, inst, iaddr) {
                self.update_for_mem(&mut state, thd, clk, inst, iaddr, EventType::MemWrite);
            }
        });
    }

    fn before_atomic_inst(&self, thd: ThreadId, _clk: Timestamp, inst: InstId, kind: &str, addr: Address) {
        // heuristic lock discovery inside libc: a locked DEC is an
        // unlock, a locked CMPXCHG is a lock
        if !self
            .sinfo
            .lock()
            .inst_image(inst)
            .map_or(false, |img| img.is_libc())
        {
            return;
        }
        let mut state = self.state.lock();
        let ls = state.curr_ls.entry(thd).or_default();
        if kind == "DEC" {
            debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
            ls.remove(addr);
        }
        // bracket the atomic region so its read and write stay one unit
        ls.add(!addr);
    }

    fn after_atomic_inst(&self, thd: ThreadId, _clk: Timestamp, inst: InstId, kind: &str, addr: Address) {
        if !self
            .sinfo
            .lock()
            .inst_image(inst)
            .map_or(false, |img| img.is_libc())
        {
            return;
        }
        let mut state = self.state.lock();
        let ls = state.curr_ls.entry(thd).or_default();
        ls.remove(!addr);
        if kind == "CMPXCHG" {
            debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
            ls.add(addr);
        }
    }

    fn after_pthread_join(&self, thd: ThreadId, _clk: Timestamp, _inst: InstId, child: ThreadId) {
        let mut state = self.state.lock();
        if let Some(child_vc) = state.exit_vc.get(&child).cloned() {
            if let Some(vc) = state.curr_vc.get_mut(&thd) {
                vc.join(&child_vc);
            }
        }
    }

    fn after_pthread_mutex_lock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        self.update_for_lock(&mut state, thd, clk, inst, addr);
    }

    fn before_pthread_mutex_unlock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        self.update_for_unlock(&mut state, thd, clk, inst, addr);
    }

    fn before_pthread_cond_signal(&self, thd: ThreadId, _clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        self.update_for_notify(&mut state, thd, addr);
    }

    fn before_pthread_cond_broadcast(&self, thd: ThreadId, _clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        self.update_for_notify(&mut state, thd, addr);
    }

    fn before_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_unlock(&mut state, thd, clk, inst, mutex_addr);
        self.update_before_wait(&mut state, thd, cond_addr);
    }

    fn after_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_after_wait(&mut state, thd, cond_addr);
        self.update_for_lock(&mut state, thd, clk, inst, mutex_addr);
    }

    fn before_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_unlock(&mut state, thd, clk, inst, mutex_addr);
        self.update_before_wait(&mut state, thd, cond_addr);
    }

    fn after_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_after_wait(&mut state, thd, cond_addr);
        self.update_for_lock(&mut state, thd, clk, inst, mutex_addr);
    }

    fn before_pthread_barrier_wait(&self, thd: ThreadId, _clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        self.update_before_barrier(&mut state, thd, addr);
    }

    fn after_pthread_barrier_wait(&self, thd: ThreadId, _clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        self.update_after_barrier(&mut state, thd, addr);
    }

    fn after_malloc(&self, _thd: ThreadId, _clk: Timestamp, _inst: InstId, size: u64, addr: Address) {
        self.alloc_addr_region(addr, size);
    }

    fn after_calloc(
        &self,
        _thd: ThreadId,
        _clk: Timestamp,
        _inst: InstId,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
        self.alloc_addr_region(addr, nmemb * size);
    }

    fn before_realloc(
        &self,
        _thd: ThreadId,
        _clk: Timestamp,
        _inst: InstId,
        ori_addr: Address,
        _size: u64,
    ) {
        self.free_addr_region(ori_addr);
    }

    fn after_realloc(
        &self,
        _thd: ThreadId,
        _clk: Timestamp,
        _inst: InstId,
        _ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
        self.alloc_addr_region(new_addr, size);
    }

    fn before_free(&self, _thd: ThreadId, _clk: Timestamp, _inst: InstId, addr: Address) {
        self.free_addr_region(addr);
    }

    fn after_valloc(&self, _thd: ThreadId, _clk: Timestamp, _inst: InstId, size: u64, addr: Address) {
        self.alloc_addr_region(addr, size);
    }
}

impl Predictor {
    // ---- condition variables and barriers (vector clock plumbing) ----

    fn cond_meta<'a>(&self, state: &'a mut State, addr: Address) -> &'a mut CondMeta {
        let slot = state
            .meta_map
            .entry(addr)
            .or_insert_with(|| Meta::Cond(CondMeta::default()));
        if !matches!(slot, Meta::Cond(_)) {
            *slot = Meta::Cond(CondMeta::default());
        }
        match slot {
            Meta::Cond(meta) => meta,
            _ => unreachable!(),
        }
    }

    fn barrier_meta<'a>(&self, state: &'a mut State, addr: Address) -> &'a mut BarrierMeta {
        let slot = state
            .meta_map
            .entry(addr)
            .or_insert_with(|| Meta::Barrier(BarrierMeta::default()));
        if !matches!(slot, Meta::Barrier(_)) {
            *slot = Meta::Barrier(BarrierMeta::default());
        }
        match slot {
            Meta::Barrier(meta) => meta,
            _ => unreachable!(),
        }
    }

    fn update_for_notify(&self, state: &mut State, thd: ThreadId, addr: Address) {
        let mut vc = match state.curr_vc.get(&thd) {
            Some(vc) => vc.clone(),
            None => return,
        };
        let meta = self.cond_meta(state, addr);
        for waiter_vc in meta.wait_table.values() {
            vc.join(waiter_vc);
        }
        let waiters: Vec<ThreadId> = meta.wait_table.keys().copied().collect();
        for waiter in waiters {
            meta.signal_table.insert(waiter, vc.clone());
        }
        vc.increment(thd);
        state.curr_vc.insert(thd, vc);
    }

    fn update_before_wait(&self, state: &mut State, thd: ThreadId, addr: Address) {
        let vc = match state.curr_vc.get(&thd) {
            Some(vc) => vc.clone(),
            None => return,
        };
        self.cond_meta(state, addr).wait_table.insert(thd, vc);
        state.curr_vc.get_mut(&thd).unwrap().increment(thd);
    }

    fn update_after_wait(&self, state: &mut State, thd: ThreadId, addr: Address) {
        let meta = self.cond_meta(state, addr);
        meta.wait_table.remove(&thd);
        let joined = meta.signal_table.remove(&thd);
        if let Some(signal_vc) = joined {
            // a timed wait can wake without a signal; only a signalled
            // wake orders after the notifier
            state.curr_vc.get_mut(&thd).unwrap().join(&signal_vc);
        }
    }

    fn update_before_barrier(&self, state: &mut State, thd: ThreadId, addr: Address) {
        let vc = match state.curr_vc.get(&thd) {
            Some(vc) => vc.clone(),
            None => return,
        };
        let meta = self.barrier_meta(state, addr);
        let table = if meta.pre_using_table1 {
            &mut meta.wait_table1
        } else {
            &mut meta.wait_table2
        };
        table.insert(thd, (vc, false));
    }

    fn update_after_barrier(&self, state: &mut State, thd: ThreadId, addr: Address) {
        let mut vc = match state.curr_vc.get(&thd) {
            Some(vc) => vc.clone(),
            None => return,
        };
        let meta = self.barrier_meta(state, addr);
        let table = if meta.post_using_table1 {
            &mut meta.wait_table1
        } else {
            &mut meta.wait_table2
        };

        let mut all_flagged = true;
        let mut all_not_flagged = true;
        for (&waiter, (waiter_vc, flagged)) in table.iter_mut() {
            if waiter == thd {
                debug_assert!(!*flagged);
                *flagged = true;
            } else if !*flagged {
                all_flagged = false;
            } else {
                all_not_flagged = false;
            }
            vc.join(waiter_vc);
        }
        vc.increment(thd);
        state.curr_vc.insert(thd, vc);

        let meta = self.barrier_meta(state, addr);
        if all_not_flagged {
            // first departure of this generation: arrivals go to the
            // other table from now on
            meta.pre_using_table1 = !meta.pre_using_table1;
        }
        if all_flagged {
            // last departure: recycle the table
            let table = if meta.post_using_table1 {
                &mut meta.wait_table1
            } else {
                &mut meta.wait_table2
            };
            table.clear();
            meta.post_using_table1 = !meta.post_using_table1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knob::Knob;

    fn make_predictor(args: &[&str]) -> Predictor {
        let mut knob = Knob::new();
        Predictor::register(&mut knob);
        knob.parse(args.iter().map(|s| s.to_string()));
        Predictor::new(
            &knob,
            Arc::new(Mutex::new(StaticInfo::new())),
            Arc::new(Mutex::new(IRootDb::new())),
            Arc::new(Mutex::new(Memo::new())),
            Arc::new(Mutex::new(SharedInstDb::new())),
        )
    }

    fn mark_shared(p: &Predictor, insts: &[InstId]) {
        let mut db = p.sinst_db.lock();
        for &inst in insts {
            db.set_shared(inst);
        }
    }

    fn idiom1_predicted(p: &Predictor, src: (InstId, EventType), dst: (InstId, EventType)) -> bool {
        let mut db = p.iroot_db.lock();
        let e0 = db.get_event(src.0, src.1);
        let e1 = db.get_event(dst.0, dst.1);
        let iroot = db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
        drop(db);
        p.memo.lock().get(iroot).map_or(false, |e| e.predicted)
    }

    fn run_locked_write_read(p: &Predictor) {
        // A: lock(m); x=1; unlock(m).  B: lock(m); r=x; unlock(m).
        mark_shared(p, &[10, 20]);
        p.alloc_addr_region(0x1000, 0x100);
        p.thread_start(1, None);
        p.thread_start(2, Some(1));

        p.after_pthread_mutex_lock(1, 1, 5, 0x40);
        p.before_mem_write(1, 2, 10, 0x1000, 4);
        p.before_pthread_mutex_unlock(1, 3, 6, 0x40);

        p.after_pthread_mutex_lock(2, 1, 7, 0x40);
        p.before_mem_read(2, 2, 20, 0x1000, 4);
        p.before_pthread_mutex_unlock(2, 3, 8, 0x40);

        p.thread_exit(1, 4);
        p.thread_exit(2, 4);
    }

    #[test]
    fn lock_protected_pair_is_predicted_after_release() {
        let p = make_predictor(&["--enable_predictor=1"]);
        run_locked_write_read(&p);
        // the write->read dependency is feasible: the common lock is
        // released between the two critical sections
        assert!(idiom1_predicted(
            &p,
            (10, EventType::MemWrite),
            (20, EventType::MemRead)
        ));
    }

    #[test]
    fn racy_only_rejects_lock_covered_pairs() {
        let p = make_predictor(&["--enable_predictor=1", "--racy_only=1"]);
        run_locked_write_read(&p);
        // the memory pair shares the lock, so it is not a race; the
        // unlock->lock dependencies on the mutex itself still qualify
        assert!(!idiom1_predicted(
            &p,
            (10, EventType::MemWrite),
            (20, EventType::MemRead)
        ));
        assert!(idiom1_predicted(
            &p,
            (6, EventType::MutexUnlock),
            (7, EventType::MutexLock)
        ));
    }

    #[test]
    fn unordered_write_read_is_predicted() {
        let p = make_predictor(&["--enable_predictor=1"]);
        mark_shared(&p, &[10, 20]);
        p.alloc_addr_region(0x1000, 0x100);
        p.thread_start(1, None);
        p.thread_start(2, Some(1));

        p.before_mem_write(1, 1, 10, 0x1000, 4);
        p.before_mem_read(2, 1, 20, 0x1000, 4);
        p.thread_exit(1, 2);
        p.thread_exit(2, 2);

        assert!(idiom1_predicted(
            &p,
            (10, EventType::MemWrite),
            (20, EventType::MemRead)
        ));
    }

    #[test]
    fn created_thread_is_ordered_after_parent() {
        // parent writes before creating the child; the child's read is
        // ordered by thread creation, nothing is concurrent
        let p = make_predictor(&["--enable_predictor=1"]);
        mark_shared(&p, &[10, 20]);
        p.alloc_addr_region(0x1000, 0x100);
        p.thread_start(1, None);
        p.before_mem_write(1, 1, 10, 0x1000, 4);
        p.thread_start(2, Some(1));
        p.before_mem_read(2, 1, 20, 0x1000, 4);

        // the remote write is a precedent (RAW boundary), and with no
        // "recent" access beyond it there is no candidate either
        let memo = p.memo.lock();
        assert_eq!(memo.total_predicted(), 0);
    }
}
