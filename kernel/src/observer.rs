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

//! The iRoot observer. Mines idiom instances from the dependencies that
//! actually occurred in the monitored run: cross-thread
//! last-writer/last-reader/last-unlocker dependencies give Idiom-1, and
//! a per-thread window of recent accesses combines them into the
//! complex idioms.

use crate::event::{Analyzer, Descriptor};
use crate::iroot::{EventType, IRootDb, IdiomType};
use crate::knob::Knob;
use crate::memo::Memo;
use crate::sinst::SharedInstDb;
use crate::static_info::InstId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use weft_infra::{clock_distance, unit_down_align, unit_up_align, Address, ThreadId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Access {
    thd: ThreadId,
    clk: Timestamp,
    etype: EventType,
    inst: InstId,
}

#[derive(Debug, Clone, Copy)]
struct Reader {
    valid: bool,
    access: Access,
}

#[derive(Debug, Default)]
struct MemMeta {
    last_writer: Option<Access>,
    last_readers: HashMap<ThreadId, Reader>,
}

#[derive(Debug, Default)]
struct MutexMeta {
    last_unlocker: Option<Access>,
}

#[derive(Debug)]
enum Meta {
    Mem(MemMeta),
    Mutex(MutexMeta),
}

#[derive(Debug, Clone)]
struct SuccEntry {
    succ: Access,
    local_prev: Vec<Access>,
}

#[derive(Debug)]
struct Entry {
    addr: Address,
    access: Access,
    succs: Vec<SuccEntry>,
}

#[derive(Debug, Default)]
struct LocalInfo {
    entries: BTreeMap<Timestamp, Vec<Entry>>,
}

#[derive(Default)]
struct State {
    filter: weft_infra::filter::RegionFilter,
    meta_map: HashMap<Address, Meta>,
    local_info: HashMap<ThreadId, LocalInfo>,
}

pub struct Observer {
    state: Mutex<State>,
    iroot_db: Arc<Mutex<IRootDb>>,
    memo: Arc<Mutex<Memo>>,
    sinst_db: Option<Arc<Mutex<SharedInstDb>>>,
    sync_only: bool,
    complex_idioms: bool,
    unit_size: Address,
    vw: u64,
    idiom_enabled: [bool; 5],
}

impl Observer {
    pub fn register(knob: &mut Knob) {
        knob.register_bool("enable_observer", "whether enable the iroot observer", "0");
        knob.register_bool(
            "sync_only",
            "whether only monitor synchronization accesses",
            "0",
        );
        knob.register_bool("complex_idioms", "whether target complex idioms", "0");
        knob.register_int("unit_size", "the monitoring granularity in bytes", "4");
        knob.register_int("vw", "the vulnerability window (# dynamic inst)", "1000");
        knob.register_bool("type1", "whether monitor idiom-1 iroots", "1");
        knob.register_bool("type2", "whether monitor idiom-2 iroots", "1");
        knob.register_bool("type3", "whether monitor idiom-3 iroots", "1");
        knob.register_bool("type4", "whether monitor idiom-4 iroots", "1");
        knob.register_bool("type5", "whether monitor idiom-5 iroots", "1");
    }

    pub fn enabled(knob: &Knob) -> bool {
        knob.value_bool("enable_observer")
    }

    pub fn new(
        knob: &Knob,
        iroot_db: Arc<Mutex<IRootDb>>,
        memo: Arc<Mutex<Memo>>,
        sinst_db: Option<Arc<Mutex<SharedInstDb>>>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            iroot_db,
            memo,
            sinst_db,
            sync_only: knob.value_bool("sync_only"),
            complex_idioms: knob.value_bool("complex_idioms"),
            unit_size: knob.value_int("unit_size") as Address,
            vw: knob.value_int("vw") as u64,
            idiom_enabled: [
                knob.value_bool("type1"),
                knob.value_bool("type2"),
                knob.value_bool("type3"),
                knob.value_bool("type4"),
                knob.value_bool("type5"),
            ],
        }
    }

    fn idiom_on(&self, idiom: IdiomType) -> bool {
        self.idiom_enabled[idiom as usize]
    }

    fn any_complex_on(&self) -> bool {
        self.complex_idioms && self.idiom_enabled[1..].iter().any(|&on| on)
    }

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
            state.meta_map.remove(&iaddr);
            iaddr += self.unit_size;
        }
    }

    /// Emit an Idiom-1 iRoot for every predecessor of `curr`.
    fn update_iroots(&self, curr: &Access, preds: &[Access]) {
        if !self.idiom_on(IdiomType::Idiom1) {
            return;
        }
        for pred in preds {
            let mut db = self.iroot_db.lock();
            let e0 = db.get_event(pred.inst, pred.etype);
            let e1 = db.get_event(curr.inst, curr.etype);
            let iroot = db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
            drop(db);
            self.memo.lock().observed(iroot);
        }
    }

    fn observe(&self, idiom: IdiomType, events: &[(InstId, EventType)]) {
        let mut db = self.iroot_db.lock();
        let ids: Vec<_> = events
            .iter()
            .map(|&(inst, etype)| db.get_event(inst, etype))
            .collect();
        let iroot = db.get_iroot(idiom, &ids);
        drop(db);
        self.memo.lock().observed(iroot);
    }

    /// Combine the current dependency with the remembered window of
    /// recent local accesses into complex idiom instances.
    fn check_complex_idioms(
        &self,
        curr: &Access,
        preds: &[Access],
        prev_access: &Access,
        succs: &[SuccEntry],
        same_addr: bool,
    ) {
        if preds.is_empty() || succs.is_empty() {
            return;
        }

        if same_addr {
            for pa in preds {
                let mut idiom2_exists = false;
                for se in succs {
                    let sa = &se.succ;
                    if sa.thd == pa.thd && sa.clk < pa.clk && self.idiom_on(IdiomType::Idiom3) {
                        // remote pair (sa; pa) straddled by the local
                        // pair (prev_access; curr)
                        self.observe(
                            IdiomType::Idiom3,
                            &[
                                (prev_access.inst, prev_access.etype),
                                (sa.inst, sa.etype),
                                (pa.inst, pa.etype),
                                (curr.inst, curr.etype),
                            ],
                        );
                    }
                    if !idiom2_exists
                        && sa.thd == pa.thd
                        && sa.clk == pa.clk
                        && sa.etype == pa.etype
                        && sa.inst == pa.inst
                    {
                        idiom2_exists = true;
                    }
                }
                if idiom2_exists && self.idiom_on(IdiomType::Idiom2) {
                    // the same remote event is both a successor of the
                    // local prev and a predecessor of curr
                    self.observe(
                        IdiomType::Idiom2,
                        &[
                            (prev_access.inst, prev_access.etype),
                            (pa.inst, pa.etype),
                            (curr.inst, curr.etype),
                        ],
                    );
                }
            }
        } else {
            for pa in preds {
                for se in succs {
                    let sa = &se.succ;
                    if sa.thd != pa.thd {
                        continue;
                    }
                    if sa.clk < pa.clk {
                        if self.idiom_on(IdiomType::Idiom4) {
                            self.observe(
                                IdiomType::Idiom4,
                                &[
                                    (prev_access.inst, prev_access.etype),
                                    (sa.inst, sa.etype),
                                    (pa.inst, pa.etype),
                                    (curr.inst, curr.etype),
                                ],
                            );
                        }
                    } else if sa.clk > pa.clk
                        && clock_distance(pa.clk, sa.clk) < self.vw
                        && self.idiom_on(IdiomType::Idiom5)
                    {
                        // the remote pair overlaps the local pair in a
                        // crossed way; require evidence that pa really
                        // preceded sa in the remote window
                        let crossed = se
                            .local_prev
                            .iter()
                            .any(|p| p.clk == pa.clk && p.etype == pa.etype && p.inst == pa.inst);
                        if crossed {
                            let e0 = (prev_access.inst, prev_access.etype);
                            let e1 = (sa.inst, sa.etype);
                            let e2 = (pa.inst, pa.etype);
                            let e3 = (curr.inst, curr.etype);
                            self.observe(IdiomType::Idiom5, &[e0, e1, e2, e3]);
                            self.observe(IdiomType::Idiom5, &[e2, e3, e0, e1]);
                        }
                    }
                }
            }
        }
    }

    fn update_local_info(&self, state: &mut State, curr: &Access, addr: Address, preds: &[Access]) {
        if !curr.etype.is_sync() {
            if let Some(sinst_db) = &self.sinst_db {
                if !sinst_db.lock().shared(curr.inst) {
                    return; // provably thread-local instruction
                }
            }
        }

        let curr_time = curr.clk;

        // walk recent local accesses most-recent-first, one entry per
        // distinct address, within the vulnerability window
        let mut touched: HashSet<Address> = HashSet::new();
        let mut local_prev: Vec<Access> = Vec::new();
        {
            let li = state.local_info.entry(curr.thd).or_default();
            'outer: for (&time, entries) in li.entries.iter().rev() {
                if clock_distance(time, curr_time) >= self.vw {
                    break;
                }
                for entry in entries.iter().rev() {
                    if !touched.insert(entry.addr) {
                        continue;
                    }
                    if time != curr_time {
                        local_prev.push(entry.access);
                        self.check_complex_idioms(
                            curr,
                            preds,
                            &entry.access,
                            &entry.succs,
                            entry.addr == addr,
                        );
                    }
                    if entry.addr == addr {
                        break 'outer;
                    }
                }
            }
        }

        // record curr as a successor of each predecessor so a later
        // access in the predecessor's thread can see it
        for pred in preds {
            if let Some(li) = state.local_info.get_mut(&pred.thd) {
                if let Some(entries) = li.entries.get_mut(&pred.clk) {
                    for entry in entries.iter_mut() {
                        if entry.addr == addr
                            && entry.access.etype == pred.etype
                            && entry.access.inst == pred.inst
                        {
                            entry.succs.push(SuccEntry {
                                succ: *curr,
                                local_prev: local_prev.clone(),
                            });
                        }
                    }
                }
            }
        }

        // evict entries that fell out of the window, then remember curr
        let li = state.local_info.entry(curr.thd).or_default();
        while let Some((&time, _)) = li.entries.iter().next() {
            if clock_distance(time, curr_time) >= self.vw {
                li.entries.remove(&time);
            } else {
                break;
            }
        }
        li.entries.entry(curr_time).or_default().push(Entry {
            addr,
            access: *curr,
            succs: Vec::new(),
        });
    }

    fn update_for_read(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let curr = Access {
            thd,
            clk,
            etype: EventType::MemRead,
            inst,
        };
        let mut preds = Vec::new();

        let meta = match state.meta_map.entry(addr).or_insert_with(|| Meta::Mem(MemMeta::default()))
        {
            Meta::Mem(meta) => meta,
            Meta::Mutex(_) => return, // access to a sync variable
        };

        // RAW: only when this thread has no valid local reader
        let local_reader_valid = meta.last_readers.get(&thd).map_or(false, |r| r.valid);
        if !local_reader_valid {
            if let Some(writer) = meta.last_writer {
                if writer.thd != thd {
                    preds.push(writer);
                }
            }
        }

        self.update_iroots(&curr, &preds);

        if self.any_complex_on() {
            self.update_local_info(state, &curr, addr, &preds);
        }

        let meta = match state.meta_map.get_mut(&addr) {
            Some(Meta::Mem(meta)) => meta,
            _ => return,
        };
        meta.last_readers.insert(
            thd,
            Reader {
                valid: true,
                access: curr,
            },
        );
    }

    fn update_for_write(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let curr = Access {
            thd,
            clk,
            etype: EventType::MemWrite,
            inst,
        };
        let mut preds = Vec::new();

        let meta = match state.meta_map.entry(addr).or_insert_with(|| Meta::Mem(MemMeta::default()))
        {
            Meta::Mem(meta) => meta,
            Meta::Mutex(_) => return,
        };

        // WAR against all valid last readers; WAW only when none exist
        let mut war_exists = false;
        for reader in meta.last_readers.values() {
            if reader.valid {
                if reader.access.thd != thd {
                    preds.push(reader.access);
                }
                war_exists = true;
            }
        }
        if !war_exists {
            if let Some(writer) = meta.last_writer {
                if writer.thd != thd {
                    preds.push(writer);
                }
            }
        }

        self.update_iroots(&curr, &preds);

        if self.any_complex_on() {
            self.update_local_info(state, &curr, addr, &preds);
        }

        let meta = match state.meta_map.get_mut(&addr) {
            Some(Meta::Mem(meta)) => meta,
            _ => return,
        };
        meta.last_writer = Some(curr);
        // a write erases the local-reader shadow for every thread
        for reader in meta.last_readers.values_mut() {
            reader.valid = false;
        }
    }

    fn mutex_meta<'a>(&self, state: &'a mut State, addr: Address) -> &'a mut MutexMeta {
        let slot = state
            .meta_map
            .entry(addr)
            .or_insert_with(|| Meta::Mutex(MutexMeta::default()));
        if matches!(slot, Meta::Mem(_)) {
            // the address was first used as data; re-type the slot
            *slot = Meta::Mutex(MutexMeta::default());
        }
        match slot {
            Meta::Mutex(meta) => meta,
            Meta::Mem(_) => unreachable!(),
        }
    }

    fn update_for_lock(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let curr = Access {
            thd,
            clk,
            etype: EventType::MutexLock,
            inst,
        };
        let mut preds = Vec::new();
        let meta = self.mutex_meta(state, addr);
        if let Some(unlocker) = meta.last_unlocker {
            if unlocker.thd != thd {
                preds.push(unlocker);
            }
        }

        self.update_iroots(&curr, &preds);

        if self.any_complex_on() {
            self.update_local_info(state, &curr, addr, &preds);
        }
    }

    fn update_for_unlock(&self, state: &mut State, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let curr = Access {
            thd,
            clk,
            etype: EventType::MutexUnlock,
            inst,
        };
        let preds = Vec::new();

        if self.any_complex_on() {
            self.update_local_info(state, &curr, addr, &preds);
        }

        let meta = self.mutex_meta(state, addr);
        meta.last_unlocker = Some(curr);
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

impl Analyzer for Observer {
    fn desc(&self) -> Descriptor {
        let mut desc = Descriptor::new();
        if !self.sync_only {
            desc.hook_before_mem = true;
        }
        desc.hook_pthread_func = true;
        desc.hook_malloc_func = true;
        desc.track_inst_count = true;
        desc
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

    fn thread_start(&self, thd: ThreadId, _parent: Option<ThreadId>) {
        self.state.lock().local_info.insert(thd, LocalInfo::default());
    }

    fn thread_exit(&self, thd: ThreadId, _clk: Timestamp) {
        self.state.lock().local_info.remove(&thd);
    }

    fn before_mem_read(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock();
        if state.filter.filter(addr) {
            return;
        }
        self.for_each_unit(addr, size, |iaddr| {
            self.update_for_read(&mut state, thd, clk, inst, iaddr);
        });
    }

    fn before_mem_write(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock();
        if state.filter.filter(addr) {
            return;
        }
        self.for_each_unit(addr, size, |iaddr| {
            self.update_for_write(&mut state, thd, clk, inst, iaddr);
        });
    }

    fn after_pthread_mutex_lock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        let iaddr = unit_down_align(addr, self.unit_size);
        debug_assert_eq!(iaddr, addr);
        self.update_for_lock(&mut state, thd, clk, inst, iaddr);
    }

    fn before_pthread_mutex_unlock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
        let mut state = self.state.lock();
        let iaddr = unit_down_align(addr, self.unit_size);
        debug_assert_eq!(iaddr, addr);
        self.update_for_unlock(&mut state, thd, clk, inst, iaddr);
    }

    fn before_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        _cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_unlock(&mut state, thd, clk, inst, mutex_addr);
    }

    fn after_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        _cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_lock(&mut state, thd, clk, inst, mutex_addr);
    }

    fn before_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        _cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_unlock(&mut state, thd, clk, inst, mutex_addr);
    }

    fn after_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        _cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock();
        self.update_for_lock(&mut state, thd, clk, inst, mutex_addr);
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
