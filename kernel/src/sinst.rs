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

//! The shared-instruction detector. A small per-address state machine
//! classifies instructions as thread-local or shared; the predictor
//! consults the shared set to keep provably thread-local accesses out
//! of its histories.

use crate::error::Result;
use crate::event::{Analyzer, Descriptor};
use crate::knob::Knob;
use crate::static_info::InstId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use weft_infra::filter::RegionFilter;
use weft_infra::{unit_down_align, unit_up_align, Address, ThreadId, Timestamp};

/// The process-wide set of instructions known to touch shared state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SharedInstDb {
    shared: BTreeSet<InstId>,
}

impl SharedInstDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shared(&mut self, inst: InstId) {
        self.shared.insert(inst);
    }

    pub fn shared(&self, inst: InstId) -> bool {
        self.shared.contains(&inst)
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn load(path: &Path) -> Self {
        crate::persist::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }
}

#[derive(Debug, Default)]
struct Meta {
    shared: bool,
    has_write: bool,
    multi_read: bool,
    last_thd: Option<ThreadId>,
    insts: HashSet<InstId>,
}

#[derive(Default)]
struct State {
    meta_table: HashMap<Address, Meta>,
    filter: RegionFilter,
}

pub struct SharedInstAnalyzer {
    state: Mutex<State>,
    db: Arc<Mutex<SharedInstDb>>,
    unit_size: Address,
}

impl SharedInstAnalyzer {
    pub fn register(knob: &mut Knob) {
        knob.register_bool("enable_sinst", "whether enable the shared inst analyzer", "0");
        knob.register_int("unit_size", "the monitoring granularity in bytes", "4");
    }

    pub fn enabled(knob: &Knob) -> bool {
        knob.value_bool("enable_sinst")
    }

    pub fn new(knob: &Knob, db: Arc<Mutex<SharedInstDb>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            db,
            unit_size: knob.value_int("unit_size") as Address,
        }
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
            state.meta_table.remove(&iaddr);
            iaddr += self.unit_size;
        }
    }

    fn update(&self, thd: ThreadId, inst: InstId, addr: Address, size: u64, is_write: bool) {
        let mut state = self.state.lock();
        if state.filter.filter(addr) {
            return;
        }
        let start = unit_down_align(addr, self.unit_size);
        let end = unit_up_align(addr + size, self.unit_size);
        let mut iaddr = start;
        while iaddr < end {
            let meta = state.meta_table.entry(iaddr).or_default();
            if meta.shared {
                self.db.lock().set_shared(inst);
            } else {
                meta.insts.insert(inst);
                meta.has_write |= is_write;
                let cross_thread = meta.last_thd.map_or(false, |last| last != thd);
                let goes_shared = if is_write {
                    // a remote write, or a write after reads from
                    // several threads, makes the location shared
                    cross_thread || meta.multi_read
                } else {
                    cross_thread && meta.has_write
                };
                if goes_shared {
                    meta.shared = true;
                    let mut db = self.db.lock();
                    for &i in &meta.insts {
                        db.set_shared(i);
                    }
                    meta.insts.clear();
                } else {
                    if cross_thread {
                        // remote read of a never-written location
                        meta.multi_read = true;
                    }
                    meta.last_thd = Some(thd);
                }
            }
            iaddr += self.unit_size;
        }
    }
}

impl Analyzer for SharedInstAnalyzer {
    fn desc(&self) -> Descriptor {
        let mut desc = Descriptor::new();
        desc.hook_before_mem = true;
        desc.hook_malloc_func = true;
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

    fn before_mem_read(&self, thd: ThreadId, _clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.update(thd, inst, addr, size, false);
    }

    fn before_mem_write(&self, thd: ThreadId, _clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.update(thd, inst, addr, size, true);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SharedInstAnalyzer {
        let mut knob = Knob::new();
        SharedInstAnalyzer::register(&mut knob);
        let a = SharedInstAnalyzer::new(&knob, Arc::new(Mutex::new(SharedInstDb::new())));
        a.alloc_addr_region(0x1000, 0x100);
        a
    }

    #[test]
    fn remote_write_marks_shared() {
        let a = analyzer();
        a.before_mem_read(1, 1, 10, 0x1000, 4);
        a.before_mem_write(2, 1, 11, 0x1000, 4);
        let db = a.db.lock();
        assert!(db.shared(10));
        assert!(db.shared(11));
    }

    #[test]
    fn single_thread_stays_local() {
        let a = analyzer();
        a.before_mem_read(1, 1, 10, 0x1000, 4);
        a.before_mem_write(1, 2, 11, 0x1000, 4);
        a.before_mem_read(1, 3, 12, 0x1000, 4);
        assert!(a.db.lock().is_empty());
    }

    #[test]
    fn multi_read_then_local_write_marks_shared() {
        let a = analyzer();
        a.before_mem_read(1, 1, 10, 0x1000, 4);
        a.before_mem_read(2, 1, 11, 0x1000, 4);
        // no write yet, reads alone stay local
        assert!(a.db.lock().is_empty());
        a.before_mem_write(2, 2, 12, 0x1000, 4);
        let db = a.db.lock();
        assert!(db.shared(10) && db.shared(11) && db.shared(12));
    }

    #[test]
    fn remote_read_after_write_marks_shared() {
        let a = analyzer();
        a.before_mem_write(1, 1, 10, 0x1000, 4);
        a.before_mem_read(2, 1, 11, 0x1000, 4);
        let db = a.db.lock();
        assert!(db.shared(10) && db.shared(11));
    }

    #[test]
    fn later_accesses_to_shared_meta_mark_directly() {
        let a = analyzer();
        a.before_mem_write(1, 1, 10, 0x1000, 4);
        a.before_mem_write(2, 1, 11, 0x1000, 4);
        a.before_mem_read(3, 1, 12, 0x1000, 4);
        assert!(a.db.lock().shared(12));
    }

    #[test]
    fn filtered_addresses_are_skipped() {
        let a = analyzer();
        a.before_mem_write(1, 1, 10, 0x9000, 4);
        a.before_mem_write(2, 2, 11, 0x9000, 4);
        assert!(a.db.lock().is_empty());
    }

    #[test]
    fn free_clears_meta() {
        let a = analyzer();
        a.before_mem_write(1, 1, 10, 0x1000, 4);
        a.before_free(1, 2, 99, 0x1000);
        // fresh region, fresh state machine
        a.alloc_addr_region(0x1000, 0x100);
        a.before_mem_write(2, 3, 11, 0x1000, 4);
        assert!(a.db.lock().is_empty());
    }
}
