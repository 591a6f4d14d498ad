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

//! Runtime call-stack tracking. The signature is a sum over the stacked
//! instructions' ids, so it is stable across runs of the same program.

use crate::static_info::InstId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use weft_infra::{Address, ThreadId};

pub type Signature = u64;

#[derive(Debug, Default)]
pub struct CallStack {
    insts: Vec<InstId>,
    targets: Vec<Address>,
    signature: Signature,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn depth(&self) -> usize {
        self.insts.len()
    }

    pub fn on_call(&mut self, inst: InstId, ret: Address) {
        self.insts.push(inst);
        self.targets.push(ret);
        self.signature = self.signature.wrapping_add(inst as Signature);
    }

    /// Pop up to and including the frame whose return target matches.
    /// An unmatched target is ignored: the host's wrapper stubs return
    /// through addresses that never appeared as call sites.
    pub fn on_return(&mut self, target: Address) {
        let mut new_size = self.insts.len();
        let mut new_signature = self.signature;
        let mut found = false;

        for idx in (0..self.insts.len()).rev() {
            new_size -= 1;
            new_signature = new_signature.wrapping_sub(self.insts[idx] as Signature);
            if self.targets[idx] == target {
                found = true;
                break;
            }
        }

        if found {
            self.insts.truncate(new_size);
            self.targets.truncate(new_size);
            self.signature = new_signature;
        }
    }
}

/// Per-thread call stacks, shared between analyzers.
#[derive(Debug, Default)]
pub struct CallStackInfo {
    stacks: Mutex<HashMap<ThreadId, Arc<Mutex<CallStack>>>>,
}

impl CallStackInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack(&self, thd: ThreadId) -> Arc<Mutex<CallStack>> {
        let mut stacks = self.stacks.lock();
        Arc::clone(stacks.entry(thd).or_default())
    }

    pub fn remove(&self, thd: ThreadId) {
        self.stacks.lock().remove(&thd);
    }
}

impl crate::event::Analyzer for CallStackInfo {
    fn desc(&self) -> crate::event::Descriptor {
        let mut desc = crate::event::Descriptor::new();
        desc.hook_call_return = true;
        desc.track_call_stack = true;
        desc
    }

    fn after_call(
        &self,
        thd: ThreadId,
        _clk: weft_infra::Timestamp,
        inst: InstId,
        _target: Address,
        ret: Address,
    ) {
        self.stack(thd).lock().on_call(inst, ret);
    }

    fn after_return(
        &self,
        thd: ThreadId,
        _clk: weft_infra::Timestamp,
        _inst: InstId,
        target: Address,
    ) {
        self.stack(thd).lock().on_return(target);
    }

    fn thread_exit(&self, thd: ThreadId, _clk: weft_infra::Timestamp) {
        self.remove(thd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_return_pairs() {
        let mut cs = CallStack::new();
        cs.on_call(1, 0x100);
        cs.on_call(2, 0x200);
        assert_eq!(cs.depth(), 2);
        assert_eq!(cs.signature(), 3);
        cs.on_return(0x200);
        assert_eq!(cs.depth(), 1);
        assert_eq!(cs.signature(), 1);
    }

    #[test]
    fn stub_return_is_ignored() {
        let mut cs = CallStack::new();
        cs.on_call(1, 0x100);
        cs.on_return(0xdead);
        assert_eq!(cs.depth(), 1);
        assert_eq!(cs.signature(), 1);
    }

    #[test]
    fn return_unwinds_skipped_frames() {
        let mut cs = CallStack::new();
        cs.on_call(1, 0x100);
        cs.on_call(2, 0x200);
        cs.on_call(3, 0x300);
        // longjmp-style unwind straight to the outer frame
        cs.on_return(0x100);
        assert_eq!(cs.depth(), 0);
        assert_eq!(cs.signature(), 0);
    }
}
