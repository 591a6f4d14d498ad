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

//! The cross-run-stable model of the scheduled program: threads,
//! objects, actions, states and executions. Thread and object uids are
//! content addressed (derived from who created what, in which order),
//! so identical runs assign identical uids and past executions stay
//! comparable.

use crate::error::Result;
use crate::static_info::{ImageId, InstId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use weft_infra::Address;

pub type ThreadUid = u32;
pub type ObjectUid = u32;
pub type ActionIdx = usize;
pub type StateIdx = usize;

pub const MAIN_THREAD_UID: ThreadUid = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thread {
    pub uid: ThreadUid,
    /// `None` for the main thread.
    pub creator: Option<ThreadUid>,
    /// This thread is the `creator_idx`-th child of its creator.
    pub creator_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKey {
    /// An object in an image's data or bss section.
    Static { image: ImageId, offset: Address },
    /// A heap object, identified by who allocated it where.
    Dynamic {
        creator: ThreadUid,
        creator_inst: InstId,
        creator_idx: u32,
        offset: Address,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Object {
    pub uid: ObjectUid,
    pub key: ObjectKey,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Program {
    threads: BTreeMap<ThreadUid, Thread>,
    objects: BTreeMap<ObjectUid, Object>,
    #[serde(skip)]
    thread_index: HashMap<(ThreadUid, u32), ThreadUid>,
    #[serde(skip)]
    object_index: HashMap<ObjectKey, ObjectUid>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// The main thread always has uid 1.
    pub fn get_main_thread(&mut self) -> ThreadUid {
        if !self.threads.contains_key(&MAIN_THREAD_UID) {
            debug_assert!(self.threads.is_empty());
            self.threads.insert(
                MAIN_THREAD_UID,
                Thread {
                    uid: MAIN_THREAD_UID,
                    creator: None,
                    creator_idx: 0,
                },
            );
        }
        MAIN_THREAD_UID
    }

    /// The `creator_idx`-th thread created by `creator`.
    pub fn get_thread(&mut self, creator: ThreadUid, creator_idx: u32) -> ThreadUid {
        if let Some(&uid) = self.thread_index.get(&(creator, creator_idx)) {
            return uid;
        }
        let uid = self.threads.keys().next_back().copied().unwrap_or(0) + 1;
        self.threads.insert(
            uid,
            Thread {
                uid,
                creator: Some(creator),
                creator_idx,
            },
        );
        self.thread_index.insert((creator, creator_idx), uid);
        uid
    }

    pub fn get_object(&mut self, key: ObjectKey) -> ObjectUid {
        if let Some(&uid) = self.object_index.get(&key) {
            return uid;
        }
        let uid = self.objects.keys().next_back().copied().unwrap_or(0) + 1;
        self.objects.insert(uid, Object { uid, key });
        self.object_index.insert(key, uid);
        uid
    }

    pub fn find_thread(&self, uid: ThreadUid) -> Option<&Thread> {
        self.threads.get(&uid)
    }

    pub fn find_object(&self, uid: ObjectUid) -> Option<&Object> {
        self.objects.get(&uid)
    }

    pub fn load(path: &Path) -> Self {
        let mut program: Program = match crate::persist::load(path) {
            Some(program) => program,
            None => return Program::new(),
        };
        program.rebuild_index();
        program
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }

    fn rebuild_index(&mut self) {
        self.thread_index = self
            .threads
            .values()
            .filter_map(|t| t.creator.map(|c| ((c, t.creator_idx), t.uid)))
            .collect();
        self.object_index = self.objects.values().map(|o| (o.key, o.uid)).collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    ThreadStart,
    ThreadEnd,
    ThreadCreate,
    ThreadJoin,
    MutexLock,
    MutexUnlock,
    MutexTryLock,
    CondWait,
    CondSignal,
    CondBroadcast,
    CondTimedwait,
    BarrierInit,
    BarrierWait,
    MemRead,
    MemWrite,
    Sleep,
    Usleep,
    SchedYield,
}

impl Operation {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// One observable operation by a thread, possibly on an object. The
/// counters `tc` (per-thread ordinal) and `oc` (per-object write
/// ordinal) are stamped when the action becomes enabled and make the
/// tuple unique within its execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Action {
    pub idx: ActionIdx,
    pub thd: ThreadUid,
    pub obj: Option<ObjectUid>,
    pub op: Operation,
    pub inst: Option<InstId>,
    pub tc: u64,
    pub oc: u64,
    pub yield_: bool,
}

impl Action {
    /// Whether executing the action advances the modeled state of its
    /// object. Reads do not.
    pub fn is_write(&self) -> bool {
        self.op != Operation::MemRead
    }

    pub fn is_yield(&self) -> bool {
        self.yield_
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub idx: StateIdx,
    pub enabled: BTreeMap<ThreadUid, ActionIdx>,
    pub taken: Option<ActionIdx>,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn is_enabled(&self, thd: ThreadUid) -> bool {
        self.enabled.contains_key(&thd)
    }

    pub fn find_enabled(&self, thd: ThreadUid) -> Option<ActionIdx> {
        self.enabled.get(&thd).copied()
    }
}

/// One run of the modeled program: the arena of its actions and the
/// sequence of states. Actions and states refer to each other by index
/// only.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Execution {
    actions: Vec<Action>,
    states: Vec<State>,
}

impl Execution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_action(
        &mut self,
        thd: ThreadUid,
        obj: Option<ObjectUid>,
        op: Operation,
        inst: Option<InstId>,
    ) -> ActionIdx {
        let idx = self.actions.len();
        self.actions.push(Action {
            idx,
            thd,
            obj,
            op,
            inst,
            tc: 0,
            oc: 0,
            yield_: false,
        });
        idx
    }

    pub fn create_state(&mut self) -> StateIdx {
        let idx = self.states.len();
        self.states.push(State {
            idx,
            enabled: BTreeMap::new(),
            taken: None,
        });
        idx
    }

    pub fn action(&self, idx: ActionIdx) -> &Action {
        &self.actions[idx]
    }

    pub fn action_mut(&mut self, idx: ActionIdx) -> &mut Action {
        &mut self.actions[idx]
    }

    pub fn state(&self, idx: StateIdx) -> &State {
        &self.states[idx]
    }

    pub fn state_mut(&mut self, idx: StateIdx) -> &mut State {
        &mut self.states[idx]
    }

    pub fn find_state(&self, idx: StateIdx) -> Option<&State> {
        self.states.get(idx)
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// The taken actions of all states strictly before `state_idx`,
    /// oldest first.
    pub fn prefix_taken(&self, state_idx: StateIdx) -> Vec<Action> {
        self.states[..state_idx.min(self.states.len())]
            .iter()
            .filter_map(|s| s.taken.map(|idx| self.actions[idx]))
            .collect()
    }

    pub fn load(path: &Path) -> Self {
        crate::persist::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_deterministic() {
        let build = || {
            let mut p = Program::new();
            let main = p.get_main_thread();
            let t2 = p.get_thread(main, 1);
            let t3 = p.get_thread(main, 2);
            let o1 = p.get_object(ObjectKey::Static {
                image: 1,
                offset: 0x10,
            });
            let o2 = p.get_object(ObjectKey::Dynamic {
                creator: t2,
                creator_inst: 5,
                creator_idx: 1,
                offset: 0,
            });
            (main, t2, t3, o1, o2)
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn same_creation_site_is_same_entity() {
        let mut p = Program::new();
        let main = p.get_main_thread();
        assert_eq!(p.get_thread(main, 1), p.get_thread(main, 1));
        let key = ObjectKey::Static {
            image: 2,
            offset: 0x20,
        };
        assert_eq!(p.get_object(key), p.get_object(key));
    }

    #[test]
    fn prefix_taken_skips_untaken_states() {
        let mut e = Execution::new();
        let a0 = e.create_action(1, Some(1), Operation::MutexLock, Some(1));
        let s0 = e.create_state();
        e.state_mut(s0).enabled.insert(1, a0);
        e.state_mut(s0).taken = Some(a0);
        let s1 = e.create_state();
        assert_eq!(e.prefix_taken(s1).len(), 1);
        assert_eq!(e.prefix_taken(s0).len(), 0);
    }
}
