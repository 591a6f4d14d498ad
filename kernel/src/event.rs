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

//! The boundary to the dynamic binary instrumentation host. The host
//! delivers a totally ordered per-thread stream of callbacks; an
//! [`Analyzer`] observes them without controlling the execution. Each
//! analyzer advertises the hooks it needs through a [`Descriptor`] so
//! the host can instrument only what is used.

use crate::static_info::InstId;
use weft_infra::{Address, ThreadId, Timestamp};

/// Which instrumentation hooks an analyzer needs.
#[derive(Debug, Default, Clone)]
pub struct Descriptor {
    pub hook_before_mem: bool,
    pub hook_after_mem: bool,
    pub hook_atomic_inst: bool,
    pub hook_pthread_func: bool,
    pub hook_yield_func: bool,
    pub hook_malloc_func: bool,
    pub hook_call_return: bool,
    pub hook_syscall: bool,
    pub hook_signal: bool,
    pub track_inst_count: bool,
    pub track_call_stack: bool,
    pub skip_stack_access: bool,
}

impl Descriptor {
    pub fn new() -> Self {
        Self {
            // thread-local stack accesses are excluded by the host by
            // default; analyzers opt out explicitly
            skip_stack_access: true,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: &Descriptor) {
        self.hook_before_mem |= other.hook_before_mem;
        self.hook_after_mem |= other.hook_after_mem;
        self.hook_atomic_inst |= other.hook_atomic_inst;
        self.hook_pthread_func |= other.hook_pthread_func;
        self.hook_yield_func |= other.hook_yield_func;
        self.hook_malloc_func |= other.hook_malloc_func;
        self.hook_call_return |= other.hook_call_return;
        self.hook_syscall |= other.hook_syscall;
        self.hook_signal |= other.hook_signal;
        self.track_inst_count |= other.track_inst_count;
        self.track_call_stack |= other.track_call_stack;
        self.skip_stack_access &= other.skip_stack_access;
    }
}

/// A profiling observer over the host's event stream. All callbacks
/// default to no-ops; implementations override what they care about.
/// Every callback carries the runtime thread id and that thread's
/// dynamic instruction clock.
#[allow(unused_variables)]
pub trait Analyzer {
    fn desc(&self) -> Descriptor;

    fn program_start(&self) {}
    fn program_exit(&self) {}

    fn image_load(
        &self,
        image: crate::static_info::ImageId,
        low_addr: Address,
        high_addr: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
    }
    fn image_unload(
        &self,
        image: crate::static_info::ImageId,
        low_addr: Address,
        high_addr: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
    }

    fn syscall_entry(&self, thd: ThreadId, clk: Timestamp, syscall_num: i32) {}
    fn syscall_exit(&self, thd: ThreadId, clk: Timestamp, syscall_num: i32) {}
    fn signal_received(&self, thd: ThreadId, clk: Timestamp, signal_num: i32) {}

    fn thread_start(&self, thd: ThreadId, parent: Option<ThreadId>) {}
    fn thread_exit(&self, thd: ThreadId, clk: Timestamp) {}

    fn before_mem_read(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
    }
    fn after_mem_read(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
    }
    fn before_mem_write(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
    }
    fn after_mem_write(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address, size: u64) {
    }

    fn before_atomic_inst(&self, thd: ThreadId, clk: Timestamp, inst: InstId, kind: &str, addr: Address) {
    }
    fn after_atomic_inst(&self, thd: ThreadId, clk: Timestamp, inst: InstId, kind: &str, addr: Address) {
    }

    fn before_call(&self, thd: ThreadId, clk: Timestamp, inst: InstId, target: Address) {}
    fn after_call(&self, thd: ThreadId, clk: Timestamp, inst: InstId, target: Address, ret: Address) {
    }
    fn before_return(&self, thd: ThreadId, clk: Timestamp, inst: InstId, target: Address) {}
    fn after_return(&self, thd: ThreadId, clk: Timestamp, inst: InstId, target: Address) {}

    fn before_pthread_create(&self, thd: ThreadId, clk: Timestamp, inst: InstId) {}
    fn after_pthread_create(&self, thd: ThreadId, clk: Timestamp, inst: InstId, child: ThreadId) {}
    fn before_pthread_join(&self, thd: ThreadId, clk: Timestamp, inst: InstId, child: ThreadId) {}
    fn after_pthread_join(&self, thd: ThreadId, clk: Timestamp, inst: InstId, child: ThreadId) {}

    fn before_pthread_mutex_trylock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_mutex_trylock(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        addr: Address,
        ret_val: i32,
    ) {
    }
    fn before_pthread_mutex_lock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_mutex_lock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {}
    fn before_pthread_mutex_unlock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_mutex_unlock(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }

    fn before_pthread_cond_signal(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_cond_signal(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn before_pthread_cond_broadcast(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_cond_broadcast(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn before_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn after_pthread_cond_wait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn before_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn after_pthread_cond_timedwait(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }

    fn before_pthread_barrier_init(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        addr: Address,
        count: u32,
    ) {
    }
    fn after_pthread_barrier_init(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        addr: Address,
        count: u32,
    ) {
    }
    fn before_pthread_barrier_wait(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_pthread_barrier_wait(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {
    }

    fn before_malloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, size: u64) {}
    fn after_malloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, size: u64, addr: Address) {}
    fn before_calloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, nmemb: u64, size: u64) {}
    fn after_calloc(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
    }
    fn before_realloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, ori_addr: Address, size: u64) {
    }
    fn after_realloc(
        &self,
        thd: ThreadId,
        clk: Timestamp,
        inst: InstId,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
    }
    fn before_free(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {}
    fn after_free(&self, thd: ThreadId, clk: Timestamp, inst: InstId, addr: Address) {}
    fn before_valloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, size: u64) {}
    fn after_valloc(&self, thd: ThreadId, clk: Timestamp, inst: InstId, size: u64, addr: Address) {}
}
