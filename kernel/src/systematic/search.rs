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

//! The DFS search stack that persists across runs. Each node remembers
//! which thread it selected, which threads still need exploring and
//! which are exhausted, plus a snapshot of the enabled actions used
//! only to detect replay divergence.

use crate::error::Result;
use crate::systematic::program::{Execution, Operation, State, ThreadUid};
use crate::static_info::InstId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// What identifies an enabled action for divergence checking: the
/// cross-run-stable parts of the tuple, without the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfo {
    pub thd: ThreadUid,
    pub obj: Option<u32>,
    pub op: Operation,
    pub inst: Option<InstId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchNode {
    pub sel: Option<ThreadUid>,
    backtrack: BTreeSet<ThreadUid>,
    done: BTreeSet<ThreadUid>,
    enabled: BTreeMap<ThreadUid, ActionInfo>,
}

impl SearchNode {
    pub fn is_backtrack(&self, thd: ThreadUid) -> bool {
        self.backtrack.contains(&thd)
    }

    pub fn is_done(&self, thd: ThreadUid) -> bool {
        self.done.contains(&thd)
    }

    pub fn add_backtrack(&mut self, thd: ThreadUid) {
        self.backtrack.insert(thd);
    }

    pub fn add_done(&mut self, thd: ThreadUid) {
        self.done.insert(thd);
    }

    /// A node is finished when every thread in its backtrack set has
    /// been explored.
    pub fn finished(&self) -> bool {
        self.backtrack.iter().all(|thd| self.done.contains(thd))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SearchInfo {
    done: bool,
    num_runs: u32,
    stack: Vec<SearchNode>,
    #[serde(skip)]
    cursor: usize,
}

impl SearchInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn num_runs(&self) -> u32 {
        self.num_runs
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn node(&self, idx: usize) -> &SearchNode {
        &self.stack[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut SearchNode {
        &mut self.stack[idx]
    }

    /// Advance to the node for the current schedule point, creating a
    /// fresh one past the stored stack. Returns `None` on divergence:
    /// the replayed state no longer matches the recorded snapshot.
    pub fn next_node(&mut self, state: &State, execution: &Execution) -> Option<usize> {
        debug_assert!(self.cursor <= self.stack.len());
        if self.cursor == self.stack.len() {
            let mut node = SearchNode::default();
            for (&thd, &action_idx) in &state.enabled {
                let action = execution.action(action_idx);
                node.enabled.insert(
                    thd,
                    ActionInfo {
                        thd: action.thd,
                        obj: action.obj,
                        op: action.op,
                        inst: action.inst,
                    },
                );
            }
            self.stack.push(node);
        } else if !self.check_divergence(self.cursor, state, execution) {
            return None;
        }
        let idx = self.cursor;
        self.cursor += 1;
        Some(idx)
    }

    fn check_divergence(&self, idx: usize, state: &State, execution: &Execution) -> bool {
        let node = &self.stack[idx];
        if node.enabled.len() != state.enabled.len() {
            return false;
        }
        for (thd, info) in &node.enabled {
            let action_idx = match state.enabled.get(thd) {
                Some(&idx) => idx,
                None => return false,
            };
            let action = execution.action(action_idx);
            if info.thd != action.thd
                || info.obj != action.obj
                || info.op != action.op
                || info.inst != action.inst
            {
                return false;
            }
        }
        true
    }

    /// Pop every trailing finished node and count the run. An empty
    /// stack means the DFS is exhausted.
    pub fn update_for_next(&mut self) {
        while let Some(node) = self.stack.last() {
            if !node.finished() {
                break;
            }
            self.stack.pop();
        }
        if self.stack.is_empty() {
            self.done = true;
        }
        self.num_runs += 1;
        log::debug!(
            "search info: done = {}, stack size = {}, runs = {}",
            self.done,
            self.stack.len(),
            self.num_runs
        );
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

    fn state_with(execution: &mut Execution, thds: &[ThreadUid]) -> State {
        let idx = execution.create_state();
        for &thd in thds {
            let a = execution.create_action(thd, Some(1), Operation::MutexLock, Some(1));
            execution.state_mut(idx).enabled.insert(thd, a);
        }
        execution.state(idx).clone()
    }

    #[test]
    fn fresh_nodes_snapshot_enabled() {
        let mut execution = Execution::new();
        let state = state_with(&mut execution, &[1, 2]);
        let mut info = SearchInfo::new();
        let idx = info.next_node(&state, &execution).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(info.stack_size(), 1);
        assert_eq!(info.node(0).enabled.len(), 2);
    }

    #[test]
    fn divergence_is_detected() {
        let mut execution = Execution::new();
        let state = state_with(&mut execution, &[1, 2]);
        let mut info = SearchInfo::new();
        let idx = info.next_node(&state, &execution).unwrap();
        info.node_mut(idx).add_backtrack(1);
        info.node_mut(idx).add_backtrack(2);
        info.node_mut(idx).add_done(2);
        info.update_for_next();
        assert!(!info.done());

        // next run: replay with a different enabled set
        let mut info2: SearchInfo =
            bincode::deserialize(&bincode::serialize(&info).unwrap()).unwrap();
        // only thread 1 shows up this time
        let mut execution2 = Execution::new();
        let diverged = state_with(&mut execution2, &[1]);
        assert!(info2.next_node(&diverged, &execution2).is_none());
    }

    #[test]
    fn finished_nodes_pop_and_search_completes() {
        let mut execution = Execution::new();
        let state = state_with(&mut execution, &[1]);
        let mut info = SearchInfo::new();
        let idx = info.next_node(&state, &execution).unwrap();
        info.node_mut(idx).add_backtrack(1);
        info.node_mut(idx).add_done(1);
        info.update_for_next();
        assert!(info.done());
        assert_eq!(info.num_runs(), 1);
    }
}
