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

//! The CHESS scheduler: depth-first systematic exploration with
//! iterative preemption bounding, fair control, and stateful partial
//! order reduction. Each program run replays the stored prefix, takes
//! one new decision at the frontier, and persists the grown search
//! stack for the next run.

use crate::knob::Knob;
use crate::rng::Rng;
use crate::systematic::controller::Controller;
use crate::systematic::fair::FairControl;
use crate::systematic::program::{Action, ActionIdx, Execution, State, StateIdx, ThreadUid};
use crate::systematic::random::pick_next_random;
use crate::systematic::scheduler::{self, CounterTables, Scheduler};
use crate::systematic::search::SearchInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct VisitedState {
    hash_val: u64,
    preemptions: u32,
    exec_id: u32,
    state_idx: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PorInfo {
    num_execs: u32,
    visited: Vec<VisitedState>,
}

pub struct ChessScheduler {
    fair_enable: bool,
    pb_enable: bool,
    por_enable: bool,
    pb_limit: u32,
    abort_diverge: bool,
    search_in: PathBuf,
    search_out: PathBuf,
    por_info_path: PathBuf,

    rng: Arc<Rng>,
    counters: CounterTables,
    search_info: SearchInfo,
    prefix_size: usize,
    fair_ctrl: FairControl,

    divergence: bool,
    useless: bool,
    curr_action: Option<Action>,
    curr_preemptions: u32,

    curr_hash: u64,
    visited_states: HashMap<u64, Vec<VisitedState>>,
    curr_visited: Vec<VisitedState>,
    loaded_execs: HashMap<u32, Execution>,
    curr_exec_id: u32,
}

impl ChessScheduler {
    pub fn register(knob: &mut Knob) {
        knob.register_bool(
            "enable_chess_scheduler",
            "whether use the CHESS scheduler",
            "0",
        );
        knob.register_bool("fair", "whether enable the fair control module", "1");
        knob.register_bool("pb", "whether enable preemption bound search", "1");
        knob.register_bool("por", "whether enable partial order reduction", "1");
        knob.register_bool(
            "abort_diverge",
            "whether abort when divergence happens",
            "1",
        );
        knob.register_int(
            "pb_limit",
            "the maximum number of preemption an execution can have",
            "2",
        );
        knob.register_str(
            "search_in",
            "the input file that contains the search information",
            "search.db",
        );
        knob.register_str(
            "search_out",
            "the output file that contains the search information",
            "search.db",
        );
        knob.register_str(
            "por_info_path",
            "the dir path that stores the partial order reduction information",
            "por-info",
        );
    }

    pub fn enabled(knob: &Knob) -> bool {
        knob.value_bool("enable_chess_scheduler")
    }

    pub fn new(knob: &Knob, rng: Arc<Rng>) -> Self {
        Self {
            fair_enable: knob.value_bool("fair"),
            pb_enable: knob.value_bool("pb"),
            por_enable: knob.value_bool("por"),
            pb_limit: knob.value_int("pb_limit").max(0) as u32,
            abort_diverge: knob.value_bool("abort_diverge"),
            search_in: PathBuf::from(knob.value_str("search_in")),
            search_out: PathBuf::from(knob.value_str("search_out")),
            por_info_path: PathBuf::from(knob.value_str("por_info_path")),
            rng,
            counters: CounterTables::new(),
            search_info: SearchInfo::new(),
            prefix_size: 0,
            fair_ctrl: FairControl::new(),
            divergence: false,
            useless: false,
            curr_action: None,
            curr_preemptions: 0,
            curr_hash: 0,
            visited_states: HashMap::new(),
            curr_visited: Vec::new(),
            loaded_execs: HashMap::new(),
            curr_exec_id: 0,
        }
    }

    /// Load the persisted search state. Returns false when the search
    /// is already exhausted and there is nothing left to run.
    pub fn setup(&mut self) -> bool {
        self.search_info = SearchInfo::load(&self.search_in);
        if self.search_info.done() {
            log::info!("search done");
            return false;
        }
        self.prefix_size = self.search_info.stack_size();
        log::debug!("prefix size = {}", self.prefix_size);
        true
    }

    pub fn search_done(&self) -> bool {
        self.search_info.done()
    }

    pub fn num_runs(&self) -> u32 {
        self.search_info.num_runs()
    }

    fn is_frontier(&self, node_idx: usize) -> bool {
        node_idx + 1 == self.prefix_size
    }

    fn is_prefix(&self, node_idx: usize) -> bool {
        !self.is_frontier(node_idx) && node_idx < self.prefix_size
    }

    fn is_preemptive_choice(&self, state: &State, action: &Action) -> bool {
        match &self.curr_action {
            Some(curr) => state.is_enabled(curr.thd) && action.thd != curr.thd,
            None => false,
        }
    }

    // ---- preemption bound ----

    fn pb_update(&mut self, state: &State, action: &Action) {
        if self.is_preemptive_choice(state, action) {
            self.curr_preemptions += 1;
            log::debug!("preemption {}", self.curr_preemptions);
        }
    }

    fn pb_enabled(&self, state: &State, action: &Action) -> bool {
        if self.is_preemptive_choice(state, action) && self.curr_preemptions + 1 > self.pb_limit {
            return false;
        }
        true
    }

    // ---- partial order reduction ----

    fn hash_action(action: &Action) -> u64 {
        debug_assert!(action.obj.is_some() && action.inst.is_some());
        (action.thd as u64)
            ^ ((action.obj.unwrap_or(0) as u64) << 2)
            ^ (action.op.code() << 5)
            ^ ((action.inst.unwrap_or(0) as u64) << 7)
            ^ (action.tc << 13)
            ^ (action.oc << 23)
    }

    fn por_load(&mut self) {
        let info: PorInfo =
            crate::persist::load(&self.por_info_path.join("info")).unwrap_or_default();
        self.curr_exec_id = info.num_execs + 1;
        for vs in info.visited {
            self.visited_states.entry(vs.hash_val).or_default().push(vs);
        }
    }

    fn por_save(&mut self, ctrl: &Controller) {
        let mut info = PorInfo {
            num_execs: self.curr_exec_id,
            visited: Vec::new(),
        };
        for vec in self.visited_states.values() {
            info.visited.extend(vec.iter().copied());
        }
        info.visited.extend(self.curr_visited.iter().copied());
        crate::persist::save_or_warn(&self.por_info_path.join("info"), &info, "por info");

        // the execution itself, for later prefix comparisons
        let exec_path = self.por_info_path.join(self.curr_exec_id.to_string());
        ctrl.with_kernel(|k| {
            crate::persist::save_or_warn(&exec_path, &k.execution, "execution");
        });
    }

    fn por_update(&mut self, state: &State, action: &Action) {
        // transparent actions do not touch modeled state
        if action.obj.is_none() {
            return;
        }
        self.curr_hash ^= Self::hash_action(action);
        self.curr_visited.push(VisitedState {
            hash_val: self.curr_hash,
            preemptions: self.curr_preemptions,
            exec_id: self.curr_exec_id,
            state_idx: state.idx + 1,
        });
    }

    fn por_visited(&mut self, ctrl: &Controller, state: &State, action: &Action) -> bool {
        if action.obj.is_none() {
            return false;
        }
        let new_hash = self.curr_hash ^ Self::hash_action(action);
        let mut new_preemptions = self.curr_preemptions;
        if self.is_preemptive_choice(state, action) {
            new_preemptions += 1;
        }
        let matches = match self.visited_states.get(&new_hash) {
            Some(matches) => matches.clone(),
            None => return false,
        };
        for vs in matches {
            if vs.preemptions > new_preemptions {
                continue;
            }
            let exec_path = self.por_info_path.join(vs.exec_id.to_string());
            let vs_exec = self
                .loaded_execs
                .entry(vs.exec_id)
                .or_insert_with(|| {
                    log::debug!("loading execution {}", vs.exec_id);
                    Execution::load(&exec_path)
                });
            if vs_exec.find_state(vs.state_idx).is_none() {
                continue;
            }
            log::debug!("matching hash found, val = {:#x}", new_hash);
            if Self::por_state_match(ctrl, state, action, vs_exec, vs.state_idx) {
                return true;
            }
        }
        false
    }

    /// Two states match when there is a one-to-one correspondence of
    /// `(thread, object, op, inst, tc, oc)` tuples between the two
    /// prefixes, ignoring transparent actions. Thread and object uids
    /// are stable across runs, so this is meaningful against past
    /// executions.
    fn por_state_match(
        ctrl: &Controller,
        state: &State,
        action: &Action,
        vs_exec: &Execution,
        vs_state_idx: usize,
    ) -> bool {
        let mut vs_table: HashMap<u64, Vec<Action>> = HashMap::new();
        for a in vs_exec.prefix_taken(vs_state_idx) {
            if a.obj.is_none() {
                continue;
            }
            vs_table.entry(Self::hash_action(&a)).or_default().push(a);
        }

        let mut prefix = ctrl.with_kernel(|k| k.execution.prefix_taken(state.idx));
        prefix.push(*action);
        for a in prefix {
            if a.obj.is_none() {
                continue;
            }
            let bucket = match vs_table.get_mut(&Self::hash_action(&a)) {
                Some(bucket) => bucket,
                None => return false,
            };
            let pos = bucket.iter().position(|vs_a| {
                a.thd == vs_a.thd
                    && a.obj == vs_a.obj
                    && a.op == vs_a.op
                    && a.inst == vs_a.inst
                    && a.tc == vs_a.tc
                    && a.oc == vs_a.oc
            });
            match pos {
                Some(pos) => {
                    bucket.swap_remove(pos);
                }
                None => return false,
            }
        }
        true
    }

    // ---- run modes ----

    fn random_to_termination(&mut self, ctrl: &Controller, mut state: StateIdx) {
        while !ctrl.with_kernel(|k| k.execution.state(state).is_terminal()) {
            let action = match pick_next_random(ctrl, state, &self.rng) {
                Some(action) => action,
                None => break,
            };
            self.curr_action = Some(ctrl.with_kernel(|k| *k.execution.action(action)));
            state = scheduler::execute(&mut self.counters, ctrl, state, action);
        }
    }

    fn divergence_run(&mut self, ctrl: &Controller, state: StateIdx) {
        log::warn!("replay divergence at state {}", state);
        self.divergence = true;
        if self.abort_diverge {
            crate::fatal!("divergence with abort_diverge set");
        }
        self.random_to_termination(ctrl, state);
    }

    fn useless_run(&mut self, ctrl: &Controller, state: StateIdx) {
        log::info!("useless run: every choice is pruned");
        self.useless = true;
        self.random_to_termination(ctrl, state);
    }

    fn pick_next(
        &mut self,
        ctrl: &Controller,
        node_idx: usize,
        state: &State,
    ) -> Option<ActionIdx> {
        // replay the stored selection on the prefix
        if self.is_prefix(node_idx) {
            let sel = self.search_info.node(node_idx).sel;
            let action = sel.and_then(|thd| state.find_enabled(thd));
            if action.is_none() {
                crate::fatal!("prefix selection is not enabled");
            }
            return action;
        }

        let enabled: Vec<(ThreadUid, ActionIdx, Action)> = ctrl.with_kernel(|k| {
            state
                .enabled
                .iter()
                .map(|(&thd, &idx)| (thd, idx, *k.execution.action(idx)))
                .collect()
        });

        // first pass: prune choices that are unfair, would exceed the
        // preemption budget, or lead to a visited state
        for (thd, _, action) in &enabled {
            if self.search_info.node(node_idx).is_done(*thd) {
                continue;
            }
            if self.fair_enable && !self.fair_ctrl.enabled(state, *thd) {
                log::debug!("fair pruned thread {}", thd);
                self.search_info.node_mut(node_idx).add_done(*thd);
                continue;
            }
            if self.pb_enable && !self.pb_enabled(state, action) {
                log::debug!("preemption bound pruned thread {}", thd);
                self.search_info.node_mut(node_idx).add_done(*thd);
                continue;
            }
            if self.por_enable && self.por_visited(ctrl, state, action) {
                log::debug!("por pruned thread {}", thd);
                self.search_info.node_mut(node_idx).add_done(*thd);
            }
        }

        // second pass: favor non-preemptive choices
        let mut next: Option<(ActionIdx, Action)> = None;
        for (thd, idx, action) in &enabled {
            if self.search_info.node(node_idx).is_done(*thd) {
                continue;
            }
            match &next {
                None => next = Some((*idx, *action)),
                Some(_) => {
                    if !self.is_preemptive_choice(state, action) {
                        next = Some((*idx, *action));
                    }
                }
            }
        }
        next.map(|(idx, _)| idx)
    }

    fn fair_update(&mut self, ctrl: &Controller, state: &State) {
        if state.idx == 0 {
            return;
        }
        let (prev_state, taken) = ctrl.with_kernel(|k| {
            let prev = k.execution.state(state.idx - 1).clone();
            let taken = prev.taken.map(|idx| *k.execution.action(idx));
            (prev, taken)
        });
        if let Some(taken) = taken {
            self.fair_ctrl.update(&prev_state, &taken, state);
        }
    }
}

impl Scheduler for ChessScheduler {
    fn name(&self) -> &'static str {
        "chess"
    }

    fn program_start(&mut self, _ctrl: &Controller) {
        if self.pb_enable {
            self.curr_preemptions = 0;
        }
        if self.por_enable {
            self.curr_hash = 0;
            self.por_load();
        }
    }

    fn program_exit(&mut self, ctrl: &Controller) {
        if self.por_enable && !self.divergence && !self.useless {
            self.por_save(ctrl);
        }
        if !self.divergence {
            self.search_info.update_for_next();
            if let Err(e) = self.search_info.save(&self.search_out) {
                log::warn!("failed to save search info: {}", e);
            }
        }
    }

    fn explore(&mut self, ctrl: &Controller, init_state: StateIdx) {
        let mut state_idx = init_state;
        loop {
            let state = ctrl.with_kernel(|k| k.execution.state(state_idx).clone());
            if state.is_terminal() {
                break;
            }
            let node_idx =
                match ctrl.with_kernel(|k| self.search_info.next_node(&state, &k.execution)) {
                    Some(idx) => idx,
                    None => {
                        self.divergence_run(ctrl, state_idx);
                        return;
                    }
                };
            // every enabled thread is a branch to explore; record that
            // once, the first time this node is at or past the frontier
            if !self.is_prefix(node_idx) {
                for &thd in state.enabled.keys() {
                    self.search_info.node_mut(node_idx).add_backtrack(thd);
                }
            }
            if self.fair_enable {
                self.fair_update(ctrl, &state);
            }
            let action_idx = match self.pick_next(ctrl, node_idx, &state) {
                Some(idx) => idx,
                None => {
                    self.useless_run(ctrl, state_idx);
                    return;
                }
            };
            let action = ctrl.with_kernel(|k| *k.execution.action(action_idx));
            self.search_info.node_mut(node_idx).sel = Some(action.thd);
            if !self.is_prefix(node_idx) {
                self.search_info.node_mut(node_idx).add_done(action.thd);
            }
            if self.pb_enable {
                self.pb_update(&state, &action);
            }
            if self.por_enable {
                self.por_update(&state, &action);
            }
            self.curr_action = Some(action);
            state_idx = scheduler::execute(&mut self.counters, ctrl, state_idx, action_idx);
        }
    }

    fn counters(&mut self) -> &mut CounterTables {
        &mut self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systematic::program::{Operation, Program};

    fn action_with(tc: u64, oc: u64) -> Action {
        let mut e = Execution::new();
        let idx = e.create_action(1, Some(2), Operation::MutexLock, Some(3));
        let a = e.action_mut(idx);
        a.tc = tc;
        a.oc = oc;
        *e.action(idx)
    }

    #[test]
    fn hash_mixes_counters() {
        let a = action_with(1, 1);
        let b = action_with(2, 1);
        let c = action_with(1, 2);
        assert_ne!(ChessScheduler::hash_action(&a), ChessScheduler::hash_action(&b));
        assert_ne!(ChessScheduler::hash_action(&a), ChessScheduler::hash_action(&c));
    }

    #[test]
    fn hash_join_is_order_insensitive() {
        // xor-joining makes the running hash depend on the set of
        // actions, not the order, which is what por wants
        let a = ChessScheduler::hash_action(&action_with(1, 1));
        let b = ChessScheduler::hash_action(&action_with(2, 2));
        assert_eq!(a ^ b, b ^ a);
    }

    #[test]
    fn uids_keep_hashes_stable_across_programs() {
        let mut p1 = Program::new();
        let mut p2 = Program::new();
        let m1 = p1.get_main_thread();
        let m2 = p2.get_main_thread();
        assert_eq!(p1.get_thread(m1, 1), p2.get_thread(m2, 1));
    }
}
