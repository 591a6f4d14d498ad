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

//! The execution controller for systematic testing. Application
//! threads run freely between schedule points; at a schedule point a
//! thread records the action it wants to take, parks on its permission
//! semaphore and waits for the scheduler thread to hand it the floor.
//! All shared state lives behind one kernel lock.

use crate::knob::Knob;
use crate::race::RaceDb;
use crate::static_info::{ImageId, InstId, StaticInfo};
use crate::systematic::program::{
    ActionIdx, Execution, ObjectKey, Operation, Program, StateIdx, ThreadUid,
};
use crate::systematic::scheduler::{self, Scheduler};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use weft_infra::sem::Semaphore;
use weft_infra::{unit_down_align, unit_up_align, Address, ThreadId};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub const EBUSY: i32 = libc::EBUSY;
        pub const ETIMEDOUT: i32 = libc::ETIMEDOUT;
    } else {
        pub const EBUSY: i32 = 16;
        pub const ETIMEDOUT: i32 = 110;
    }
}

#[derive(Debug, Default)]
struct JoinInfo {
    exit: bool,
    wait_queue: Vec<ThreadId>,
}

#[derive(Debug, Default)]
struct MutexInfo {
    holder: Option<ThreadId>,
    wait_queue: Vec<ThreadId>,
    /// Threads that issued a lock and are runnable at their schedule
    /// point; a successful grab sends them to the wait queue.
    ready_map: BTreeMap<ThreadId, bool>,
}

#[derive(Debug, Default, Clone)]
struct WaitInfo {
    timed: bool,
    broadcasted: bool,
    signal_set: BTreeSet<u32>,
}

#[derive(Debug, Default)]
struct CondInfo {
    curr_signal_id: u32,
    wait_map: BTreeMap<ThreadId, WaitInfo>,
}

#[derive(Debug, Default)]
struct BarrierInfo {
    count: u32,
    wait_queue: Vec<ThreadId>,
}

#[derive(Debug, Clone, Copy)]
enum RegionOrigin {
    Static {
        image: ImageId,
    },
    Dynamic {
        creator: ThreadUid,
        creator_inst: InstId,
        creator_idx: u32,
    },
}

#[derive(Debug)]
struct Region {
    addr: Address,
    size: u64,
    origin: RegionOrigin,
    mutex_info: HashMap<Address, MutexInfo>,
    cond_info: HashMap<Address, CondInfo>,
    barrier_info: HashMap<Address, BarrierInfo>,
}

impl Region {
    fn new(addr: Address, size: u64, origin: RegionOrigin) -> Self {
        Self {
            addr,
            size,
            origin,
            mutex_info: HashMap::new(),
            cond_info: HashMap::new(),
            barrier_info: HashMap::new(),
        }
    }
}

pub struct Kernel {
    pub program: Program,
    pub execution: Execution,
    thread_table: HashMap<ThreadId, ThreadUid>,
    thread_reverse: HashMap<ThreadUid, ThreadId>,
    perm_sems: HashMap<ThreadId, Arc<Semaphore>>,
    action_table: HashMap<ThreadId, ActionIdx>,
    enable_table: HashMap<ThreadId, bool>,
    active_table: HashMap<ThreadId, bool>,
    race_active_table: HashMap<ThreadId, bool>,
    thread_creation: HashMap<ThreadId, u32>,
    creation_info: HashMap<(ThreadId, InstId), u32>,
    region_table: BTreeMap<Address, Region>,
    join_info: HashMap<ThreadId, JoinInfo>,
    main_thread: Option<ThreadId>,
    next_state_ready: bool,
    program_exiting: bool,
}

impl Kernel {
    fn find_region_mut(&mut self, iaddr: Address) -> Option<&mut Region> {
        let (_, region) = self.region_table.range_mut(..=iaddr).next_back()?;
        if iaddr >= region.addr && iaddr < region.addr + region.size {
            Some(region)
        } else {
            None
        }
    }

    fn mutex_info_mut(&mut self, iaddr: Address) -> &mut MutexInfo {
        match self.find_region_mut(iaddr) {
            Some(region) => region.mutex_info.entry(iaddr).or_default(),
            None => crate::fatal!("mutex at {:#x} is outside every known region", iaddr),
        }
    }

    fn cond_info_mut(&mut self, iaddr: Address) -> &mut CondInfo {
        match self.find_region_mut(iaddr) {
            Some(region) => region.cond_info.entry(iaddr).or_default(),
            None => crate::fatal!("cond at {:#x} is outside every known region", iaddr),
        }
    }

    fn barrier_info_mut(&mut self, iaddr: Address) -> &mut BarrierInfo {
        match self.find_region_mut(iaddr) {
            Some(region) => region.barrier_info.entry(iaddr).or_default(),
            None => crate::fatal!("barrier at {:#x} is outside every known region", iaddr),
        }
    }

    fn object_for(&mut self, iaddr: Address) -> ObjectKey {
        let (origin, base) = match self.find_region_mut(iaddr) {
            Some(region) => (region.origin, region.addr),
            None => crate::fatal!("address {:#x} is outside every known region", iaddr),
        };
        match origin {
            RegionOrigin::Static { image } => ObjectKey::Static {
                image,
                offset: iaddr - base,
            },
            RegionOrigin::Dynamic {
                creator,
                creator_inst,
                creator_idx,
            } => ObjectKey::Dynamic {
                creator,
                creator_inst,
                creator_idx,
                offset: iaddr - base,
            },
        }
    }

    fn set_enabled(&mut self, tid: ThreadId, enabled: bool) {
        self.enable_table.insert(tid, enabled);
    }

    fn is_enabled(&self, tid: ThreadId) -> bool {
        self.enable_table.get(&tid).copied().unwrap_or(false)
    }
}

pub struct Controller {
    kernel: Mutex<Kernel>,
    next_state_sem: Semaphore,
    sinfo: Arc<Mutex<StaticInfo>>,
    race_db: Option<Arc<Mutex<RaceDb>>>,
    sched_app: bool,
    sched_race: bool,
    unit_size: Address,
    cpu: i64,
    realtime_priority: i64,
    program_out: PathBuf,
}

type Guard<'a> = MutexGuard<'a, Kernel>;

impl Controller {
    pub fn register(knob: &mut Knob) {
        knob.register_bool(
            "sched_app",
            "whether only schedule operations from the application",
            "1",
        );
        knob.register_bool(
            "sched_race",
            "whether schedule racy memory operations (for racy programs)",
            "0",
        );
        knob.register_int("cpu", "specify which cpu to run on", "0");
        knob.register_int("unit_size", "the monitoring granularity in bytes", "4");
        knob.register_int(
            "realtime_priority",
            "the realtime priority on which all the user thread should be run",
            "1",
        );
        knob.register_str("program_in", "the input database for the modeled program", "program.db");
        knob.register_str(
            "program_out",
            "the output database for the modeled program",
            "program.db",
        );
        knob.register_str("race_in", "the input race database path", "race.db");
        knob.register_str("race_out", "the output race database path", "race.db");
    }

    pub fn new(knob: &Knob, sinfo: Arc<Mutex<StaticInfo>>) -> Self {
        let sched_race = knob.value_bool("sched_race");
        let race_db = if sched_race {
            Some(Arc::new(Mutex::new(RaceDb::load(
                knob.value_str("race_in").as_ref(),
            ))))
        } else {
            None
        };
        let program = Program::load(knob.value_str("program_in").as_ref());
        Self {
            kernel: Mutex::new(Kernel {
                program,
                execution: Execution::new(),
                thread_table: HashMap::new(),
                thread_reverse: HashMap::new(),
                perm_sems: HashMap::new(),
                action_table: HashMap::new(),
                enable_table: HashMap::new(),
                active_table: HashMap::new(),
                race_active_table: HashMap::new(),
                thread_creation: HashMap::new(),
                creation_info: HashMap::new(),
                region_table: BTreeMap::new(),
                join_info: HashMap::new(),
                main_thread: None,
                next_state_ready: false,
                program_exiting: false,
            }),
            next_state_sem: Semaphore::new(0),
            sinfo,
            race_db,
            sched_app: knob.value_bool("sched_app"),
            sched_race,
            unit_size: knob.value_int("unit_size") as Address,
            cpu: knob.value_int("cpu"),
            realtime_priority: knob.value_int("realtime_priority"),
            program_out: PathBuf::from(knob.value_str("program_out")),
        }
    }

    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut kernel = self.kernel.lock();
        f(&mut kernel)
    }

    /// Number of threads currently parked at a schedule point.
    pub fn parked_threads(&self) -> usize {
        let kernel = self.kernel.lock();
        kernel
            .action_table
            .keys()
            .filter(|tid| !kernel.active_table.get(tid).copied().unwrap_or(false))
            .count()
    }

    pub fn program_exiting(&self) -> bool {
        self.kernel.lock().program_exiting
    }

    // ---- lifecycle ----

    pub fn program_start(&self, scheduler: &mut dyn Scheduler) {
        self.set_affinity();
        self.set_sched_policy();
        scheduler.program_start(self);
    }

    pub fn program_exit(&self, scheduler: &mut dyn Scheduler) {
        scheduler.program_exit(self);
        let kernel = self.kernel.lock();
        crate::persist::save_or_warn(&self.program_out, &kernel.program, "program");
    }

    /// The scheduler thread's body: wait for the first schedule point,
    /// build the initial state and explore until termination.
    pub fn scheduler_thread(&self, scheduler: &mut dyn Scheduler) {
        let kernel = self.kernel.lock();
        let mut kernel = self.wait_for_next_state(kernel);
        let init_state = self.create_state(&mut kernel);
        drop(kernel);
        scheduler::run(scheduler, self, init_state);
        if !self.kernel.lock().program_exiting {
            warn!("program deadlock: no enabled thread but program not exiting");
        }
    }

    pub fn thread_start(&self, tid: ThreadId, parent: Option<ThreadId>) {
        let mut k = self.kernel.lock();
        let uid = match parent {
            None => {
                debug_assert!(k.main_thread.is_none());
                k.main_thread = Some(tid);
                k.program.get_main_thread()
            }
            Some(parent) => {
                let parent_uid = match k.thread_table.get(&parent) {
                    Some(&uid) => uid,
                    None => crate::fatal!("child of unknown thread {}", parent),
                };
                let creator_idx = {
                    let slot = k.thread_creation.entry(parent).or_insert(0);
                    *slot += 1;
                    *slot
                };
                k.program.get_thread(parent_uid, creator_idx)
            }
        };
        k.thread_table.insert(tid, uid);
        k.thread_reverse.insert(uid, tid);
        k.perm_sems.insert(tid, Arc::new(Semaphore::new(0)));
        k.enable_table.insert(tid, true);
        k.active_table.insert(tid, true);
        k.race_active_table.insert(tid, false);
        k.thread_creation.entry(tid).or_insert(0);
    }

    pub fn thread_exit(&self, tid: ThreadId) {
        let mut k = self.kernel.lock();
        // wake the joiners
        let waiters = {
            let info = k.join_info.entry(tid).or_default();
            info.exit = true;
            std::mem::take(&mut info.wait_queue)
        };
        for t in waiters {
            debug_assert!(!k.is_enabled(t));
            k.set_enabled(t, true);
        }
        k.set_enabled(tid, false);
        k.active_table.insert(tid, false);
        k.race_active_table.insert(tid, false);
        self.schedule_on_exit(&mut k, tid);
    }

    // ---- the schedule point protocol ----

    fn create_action(
        &self,
        k: &mut Kernel,
        tid: ThreadId,
        iaddr: Option<Address>,
        op: Operation,
        inst: Option<InstId>,
    ) -> ActionIdx {
        let thd = match k.thread_table.get(&tid) {
            Some(&uid) => uid,
            None => crate::fatal!("schedule point from unknown thread {}", tid),
        };
        let obj = iaddr.map(|iaddr| {
            let key = k.object_for(iaddr);
            k.program.get_object(key)
        });
        k.execution.create_action(thd, obj, op, inst)
    }

    /// The heart of the protocol: record the intended action, make sure
    /// the scheduler learns a state is ready, park until granted.
    fn schedule<'a>(
        &'a self,
        mut k: Guard<'a>,
        tid: ThreadId,
        iaddr: Option<Address>,
        op: Operation,
        inst: Option<InstId>,
    ) -> (Guard<'a>, ActionIdx) {
        let action = self.create_action(&mut k, tid, iaddr, op, inst);
        k.action_table.insert(tid, action);
        if !k.next_state_ready {
            // first thread to park: let the other runnable threads
            // reach their schedule points too before the scheduler
            // snapshots the state
            k.next_state_ready = true;
            drop(k);
            for _ in 0..2 {
                std::thread::yield_now();
            }
            k = self.kernel.lock();
            self.next_state_sem.post();
        }
        k.active_table.insert(tid, false);
        let perm = Arc::clone(&k.perm_sems[&tid]);
        drop(k);
        perm.wait();
        let mut k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        k.active_table.insert(tid, true);
        k.action_table.remove(&tid);
        (k, action)
    }

    fn schedule_on_exit(&self, k: &mut Kernel, tid: ThreadId) {
        if k.active_table.values().any(|&active| active) {
            return;
        }
        if k.main_thread == Some(tid) {
            k.program_exiting = true;
        }
        k.next_state_ready = true;
        self.next_state_sem.post();
    }

    fn wait_for_next_state<'a>(&'a self, k: Guard<'a>) -> Guard<'a> {
        drop(k);
        self.next_state_sem.wait();
        let mut k = self.kernel.lock();
        debug_assert!(k.next_state_ready);
        k.next_state_ready = false;
        k
    }

    fn create_state(&self, k: &mut Kernel) -> StateIdx {
        let state = k.execution.create_state();

        if self.sched_race {
            // a thread inside a racy region preempts normal scheduling
            let mut racer = None;
            for (&tid, &active) in &k.race_active_table {
                if active && k.is_enabled(tid) {
                    racer = Some(tid);
                    break;
                }
            }
            if let Some(tid) = racer {
                if let Some(&action) = k.action_table.get(&tid) {
                    let thd = k.execution.action(action).thd;
                    k.execution.state_mut(state).enabled.insert(thd, action);
                    return state;
                }
            }
        }

        let mut enabled: Vec<(ThreadUid, ActionIdx)> = Vec::new();
        for (&tid, &action) in &k.action_table {
            if k.is_enabled(tid) {
                enabled.push((k.thread_table[&tid], action));
            }
        }
        for (thd, action) in enabled {
            k.execution.state_mut(state).enabled.insert(thd, action);
        }
        state
    }

    /// Called by the scheduler: grant the floor to the chosen action's
    /// thread and wait for the next state to form.
    pub fn execute_action(&self, action: ActionIdx) -> StateIdx {
        let k = self.kernel.lock();
        let thd = k.execution.action(action).thd;
        let target = match k.thread_reverse.get(&thd) {
            Some(&tid) => tid,
            None => crate::fatal!("action of unmodeled thread {}", thd),
        };
        k.perm_sems[&target].post();
        let mut k = self.wait_for_next_state(k);
        self.create_state(&mut k)
    }

    // ---- modeled primitives ----

    pub fn thread_create(&self, tid: ThreadId, inst: InstId) {
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        let (k, _) = self.schedule(k, tid, None, Operation::ThreadCreate, Some(inst));
        drop(k);
    }

    pub fn thread_join(&self, tid: ThreadId, child: ThreadId, inst: InstId) {
        let mut k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        let exited = k.join_info.entry(child).or_default().exit;
        if !exited {
            k.set_enabled(tid, false);
            k.join_info.entry(child).or_default().wait_queue.push(tid);
        }
        let (k, _) = self.schedule(k, tid, None, Operation::ThreadJoin, Some(inst));
        drop(k);
    }

    pub fn mutex_trylock(&self, tid: ThreadId, addr: Address, inst: InstId) -> i32 {
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::MutexTryLock, Some(inst));

        let mut ret_val = 0;
        let to_disable: Vec<ThreadId> = {
            let info = k.mutex_info_mut(addr);
            if info.holder.is_some() {
                ret_val = EBUSY;
                Vec::new()
            } else {
                info.holder = Some(tid);
                let contenders: Vec<ThreadId> = info.ready_map.keys().copied().collect();
                info.wait_queue.extend(contenders.iter().copied());
                contenders
            }
        };
        for t in to_disable {
            debug_assert!(k.is_enabled(t));
            k.set_enabled(t, false);
        }
        ret_val
    }

    pub fn mutex_lock(&self, tid: ThreadId, addr: Address, inst: InstId) {
        let k = self.kernel.lock();
        let k = self.mutex_lock_locked(k, tid, addr, inst);
        drop(k);
    }

    fn mutex_lock_locked<'a>(
        &'a self,
        mut k: Guard<'a>,
        tid: ThreadId,
        addr: Address,
        inst: InstId,
    ) -> Guard<'a> {
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let holder = k.mutex_info_mut(addr).holder;
        if let Some(holder) = holder {
            debug_assert_ne!(holder, tid);
            k.set_enabled(tid, false);
            k.mutex_info_mut(addr).wait_queue.push(tid);
        }
        k.mutex_info_mut(addr).ready_map.insert(tid, false);

        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::MutexLock, Some(inst));

        // granted: grab the mutex and push the other ready contenders
        // back to waiting so their wakeup stays a scheduler decision
        let to_disable: Vec<ThreadId> = {
            let info = k.mutex_info_mut(addr);
            debug_assert!(info.holder.is_none());
            info.holder = Some(tid);
            info.ready_map.remove(&tid);
            let contenders: Vec<ThreadId> = info.ready_map.keys().copied().collect();
            info.wait_queue.extend(contenders.iter().copied());
            contenders
        };
        for t in to_disable {
            debug_assert!(k.is_enabled(t));
            k.set_enabled(t, false);
        }
        k
    }

    pub fn mutex_unlock(&self, tid: ThreadId, addr: Address, inst: InstId) {
        let k = self.kernel.lock();
        let k = self.mutex_unlock_locked(k, tid, addr, inst);
        drop(k);
    }

    fn mutex_unlock_locked<'a>(
        &'a self,
        k: Guard<'a>,
        tid: ThreadId,
        addr: Address,
        inst: InstId,
    ) -> Guard<'a> {
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::MutexUnlock, Some(inst));

        let waiters: Vec<ThreadId> = {
            let info = k.mutex_info_mut(addr);
            debug_assert_eq!(info.holder, Some(tid));
            info.holder = None;
            std::mem::take(&mut info.wait_queue)
        };
        for t in waiters {
            debug_assert!(!k.is_enabled(t));
            k.set_enabled(t, true);
        }
        k
    }

    pub fn cond_signal(&self, tid: ThreadId, addr: Address, inst: InstId) {
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::CondSignal, Some(inst));

        let to_enable: Vec<ThreadId> = {
            let info = k.cond_info_mut(addr);
            info.curr_signal_id += 1;
            let next_signal_id = info.curr_signal_id;
            let mut wake = Vec::new();
            for (&t, wait_info) in info.wait_map.iter_mut() {
                if !wait_info.broadcasted {
                    if !wait_info.timed && wait_info.signal_set.is_empty() {
                        wake.push(t);
                    }
                    wait_info.signal_set.insert(next_signal_id);
                }
            }
            wake
        };
        for t in to_enable {
            debug_assert!(!k.is_enabled(t));
            k.set_enabled(t, true);
        }
        drop(k);
    }

    pub fn cond_broadcast(&self, tid: ThreadId, addr: Address, inst: InstId) {
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::CondBroadcast, Some(inst));

        let to_enable: Vec<ThreadId> = {
            let info = k.cond_info_mut(addr);
            let mut wake = Vec::new();
            for (&t, wait_info) in info.wait_map.iter_mut() {
                if !wait_info.broadcasted {
                    if !wait_info.timed && wait_info.signal_set.is_empty() {
                        wake.push(t);
                    }
                    wait_info.broadcasted = true;
                    wait_info.signal_set.clear();
                }
            }
            wake
        };
        for t in to_enable {
            debug_assert!(!k.is_enabled(t));
            k.set_enabled(t, true);
        }
        drop(k);
    }

    pub fn cond_wait(&self, tid: ThreadId, cond_addr: Address, mutex_addr: Address, inst: InstId) {
        let k = self.kernel.lock();
        let k = self.mutex_unlock_locked(k, tid, mutex_addr, inst);
        let k = self.cond_wait_locked(k, tid, cond_addr, inst);
        let k = self.mutex_lock_locked(k, tid, mutex_addr, inst);
        drop(k);
    }

    fn cond_wait_locked<'a>(
        &'a self,
        mut k: Guard<'a>,
        tid: ThreadId,
        addr: Address,
        inst: InstId,
    ) -> Guard<'a> {
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        k.cond_info_mut(addr).wait_map.insert(tid, WaitInfo::default());
        k.set_enabled(tid, false);

        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::CondWait, Some(inst));

        self.consume_signal(&mut k, tid, addr);
        k
    }

    /// On wakeup from an un-broadcast wait, the waiter claims one
    /// signal id and revokes it from everyone else: a signal wakes
    /// exactly one thread.
    fn consume_signal(&self, k: &mut Kernel, tid: ThreadId, addr: Address) {
        let to_disable: Vec<ThreadId> = {
            let info = k.cond_info_mut(addr);
            let self_info = info.wait_map.get(&tid).cloned().unwrap_or_default();
            let mut sleepers = Vec::new();
            if !self_info.broadcasted {
                debug_assert!(!self_info.signal_set.is_empty());
                let signal_id = *self_info.signal_set.iter().next().unwrap();
                for (&t, wait_info) in info.wait_map.iter_mut() {
                    if t == tid || wait_info.broadcasted {
                        continue;
                    }
                    if wait_info.signal_set.remove(&signal_id)
                        && !wait_info.timed
                        && wait_info.signal_set.is_empty()
                    {
                        sleepers.push(t);
                    }
                }
            }
            info.wait_map.remove(&tid);
            sleepers
        };
        for t in to_disable {
            debug_assert!(k.is_enabled(t));
            k.set_enabled(t, false);
        }
    }

    pub fn cond_timedwait(
        &self,
        tid: ThreadId,
        cond_addr: Address,
        mutex_addr: Address,
        inst: InstId,
    ) -> i32 {
        let k = self.kernel.lock();
        let k = self.mutex_unlock_locked(k, tid, mutex_addr, inst);
        let (k, ret_val) = self.cond_timedwait_locked(k, tid, cond_addr, inst);
        let k = self.mutex_lock_locked(k, tid, mutex_addr, inst);
        drop(k);
        ret_val
    }

    fn cond_timedwait_locked<'a>(
        &'a self,
        mut k: Guard<'a>,
        tid: ThreadId,
        addr: Address,
        inst: InstId,
    ) -> (Guard<'a>, i32) {
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        k.cond_info_mut(addr).wait_map.insert(
            tid,
            WaitInfo {
                timed: true,
                ..WaitInfo::default()
            },
        );
        // a timed waiter stays enabled: the scheduler may fire the
        // timeout at any point

        let (mut k, action) = self.schedule(k, tid, Some(addr), Operation::CondTimedwait, Some(inst));

        let mut ret_val = 0;
        let self_info = k
            .cond_info_mut(addr)
            .wait_map
            .get(&tid)
            .cloned()
            .unwrap_or_default();
        if !self_info.broadcasted && self_info.signal_set.is_empty() {
            ret_val = ETIMEDOUT;
            k.execution.action_mut(action).yield_ = true;
            k.cond_info_mut(addr).wait_map.remove(&tid);
        } else {
            self.consume_signal(&mut k, tid, addr);
        }
        (k, ret_val)
    }

    pub fn barrier_init(&self, tid: ThreadId, addr: Address, count: u32, inst: InstId) {
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (mut k, _) = self.schedule(k, tid, Some(addr), Operation::BarrierInit, Some(inst));
        let info = k.barrier_info_mut(addr);
        debug_assert!(info.wait_queue.is_empty());
        info.count = count;
        drop(k);
    }

    pub fn barrier_wait(&self, tid: ThreadId, addr: Address, inst: InstId) {
        let mut k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        debug_assert_eq!(unit_down_align(addr, self.unit_size), addr);
        let (wake, block_self) = {
            let info = k.barrier_info_mut(addr);
            if (info.wait_queue.len() as u32) + 1 < info.count {
                info.wait_queue.push(tid);
                (Vec::new(), true)
            } else {
                (std::mem::take(&mut info.wait_queue), false)
            }
        };
        if block_self {
            k.set_enabled(tid, false);
        }
        for t in wake {
            debug_assert!(!k.is_enabled(t));
            k.set_enabled(t, true);
        }
        let (k, _) = self.schedule(k, tid, Some(addr), Operation::BarrierWait, Some(inst));
        drop(k);
    }

    /// Sleep, usleep and sched_yield become yield actions with no
    /// object when the active scheduler hooks them.
    pub fn yield_op(&self, tid: ThreadId, op: Operation, inst: InstId) {
        debug_assert!(matches!(
            op,
            Operation::Sleep | Operation::Usleep | Operation::SchedYield
        ));
        let k = self.kernel.lock();
        debug_assert!(k.is_enabled(tid));
        let (mut k, action) = self.schedule(k, tid, None, op, Some(inst));
        k.execution.action_mut(action).yield_ = true;
        drop(k);
    }

    // ---- racy memory operations ----

    fn common_lib_inst(&self, inst: InstId) -> bool {
        self.sinfo
            .lock()
            .inst_image(inst)
            .map_or(false, |img| img.is_common_lib())
    }

    pub fn racy_inst(&self, inst: InstId) -> bool {
        self.race_db
            .as_ref()
            .map_or(false, |db| db.lock().racy_inst(inst))
    }

    pub fn before_race_read(&self, tid: ThreadId, inst: InstId, addr: Address, size: u64) {
        self.race_access(tid, inst, addr, size, Operation::MemRead);
    }

    pub fn before_race_write(&self, tid: ThreadId, inst: InstId, addr: Address, size: u64) {
        self.race_access(tid, inst, addr, size, Operation::MemWrite);
    }

    fn race_access(&self, tid: ThreadId, inst: InstId, addr: Address, size: u64, op: Operation) {
        debug_assert!(self.sched_race);
        if self.sched_app && self.common_lib_inst(inst) {
            return;
        }
        let start = unit_down_align(addr, self.unit_size);
        let end = unit_up_align(addr + size, self.unit_size);
        let mut iaddr = start;
        while iaddr < end {
            let k = self.kernel.lock();
            let (mut k, _) = self.schedule(k, tid, Some(iaddr), op, Some(inst));
            k.race_active_table.insert(tid, true);
            drop(k);
            iaddr += self.unit_size;
        }
    }

    pub fn after_race_access(&self, tid: ThreadId, inst: InstId) {
        debug_assert!(self.sched_race);
        if self.sched_app && self.common_lib_inst(inst) {
            return;
        }
        self.kernel.lock().race_active_table.insert(tid, false);
    }

    // ---- region bookkeeping ----

    pub fn image_load(
        &self,
        image: ImageId,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
        let mut k = self.kernel.lock();
        if data_start != 0 {
            debug_assert!(data_size != 0);
            k.region_table.insert(
                data_start,
                Region::new(data_start, data_size, RegionOrigin::Static { image }),
            );
        }
        if bss_start != 0 {
            debug_assert!(bss_size != 0);
            k.region_table.insert(
                bss_start,
                Region::new(bss_start, bss_size, RegionOrigin::Static { image }),
            );
        }
    }

    pub fn image_unload(&self, data_start: Address, bss_start: Address) {
        let mut k = self.kernel.lock();
        if data_start != 0 {
            k.region_table.remove(&data_start);
        }
        if bss_start != 0 {
            k.region_table.remove(&bss_start);
        }
    }

    pub fn after_alloc(&self, tid: ThreadId, inst: InstId, addr: Address, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        let mut k = self.kernel.lock();
        let creator = match k.thread_table.get(&tid) {
            Some(&uid) => uid,
            None => crate::fatal!("allocation from unknown thread {}", tid),
        };
        let creator_idx = {
            let slot = k.creation_info.entry((tid, inst)).or_insert(0);
            *slot += 1;
            *slot
        };
        k.region_table.insert(
            addr,
            Region::new(
                addr,
                size,
                RegionOrigin::Dynamic {
                    creator,
                    creator_inst: inst,
                    creator_idx,
                },
            ),
        );
    }

    pub fn before_free(&self, addr: Address) {
        if addr == 0 {
            return;
        }
        self.kernel.lock().region_table.remove(&addr);
    }

    // ---- advisory determinism measures ----

    fn set_affinity(&self) {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
                let cpu = if self.cpu < 0 || self.cpu >= cpus { 0 } else { self.cpu };
                debug!("pinning to cpu{}", cpu);
                unsafe {
                    let mut set: libc::cpu_set_t = std::mem::zeroed();
                    libc::CPU_ZERO(&mut set);
                    libc::CPU_SET(cpu as usize, &mut set);
                    if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                        warn!("sched_setaffinity failed: {}", std::io::Error::last_os_error());
                    }
                }
            } else {
                debug!("cpu pinning not supported on this platform");
            }
        }
    }

    fn set_sched_policy(&self) {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                debug!("setting os sched policy to FIFO");
                let param = libc::sched_param {
                    sched_priority: self.realtime_priority as i32,
                };
                if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
                    // needs privileges; the search is still correct,
                    // only noisier
                    warn!("sched_setscheduler failed: {}", std::io::Error::last_os_error());
                }
            } else {
                debug!("realtime scheduling not supported on this platform");
            }
        }
    }
}
