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

//! Fair schedule control after Musuvathi and Qadeer ("Fair stateless
//! model checking", PLDI 2008). A thread that yields hands relative
//! priority to the threads it starved; the scheduler then refuses to
//! pick it while any of those are runnable.

use crate::systematic::program::{Action, State, ThreadUid};
use std::collections::{BTreeMap, BTreeSet};

type ThreadSet = BTreeSet<ThreadUid>;

#[derive(Debug, Default)]
pub struct FairControl {
    /// E[t]: threads continuously enabled since t's last yield.
    e: BTreeMap<ThreadUid, ThreadSet>,
    /// D[t]: threads disabled by t's transitions since t's last yield.
    d: BTreeMap<ThreadUid, ThreadSet>,
    /// S[t]: threads scheduled since t's last yield.
    s: BTreeMap<ThreadUid, ThreadSet>,
    /// The priority relation: `(t, u)` means t runs only when u is
    /// disabled.
    p: Vec<(ThreadUid, ThreadUid)>,
}

impl FairControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether picking `thd` at `state` respects the priority relation.
    pub fn enabled(&self, state: &State, thd: ThreadUid) -> bool {
        !self
            .p
            .iter()
            .any(|&(low, high)| low == thd && state.is_enabled(high))
    }

    /// Account for the transition from `prev_state` (whose taken action
    /// is `taken`) into `curr_state`.
    pub fn update(&mut self, prev_state: &State, taken: &Action, curr_state: &State) {
        let t = taken.thd;

        // t ran, so drop every edge that kept others below t
        self.p.retain(|&(_, high)| high != t);

        // E[u] loses the threads that are no longer enabled
        for eu in self.e.values_mut() {
            eu.retain(|&thd| curr_state.is_enabled(thd));
        }

        // D[t] gains the threads t's transition disabled
        let dt = self.d.entry(t).or_default();
        for &thd in prev_state.enabled.keys() {
            if !curr_state.is_enabled(thd) {
                dt.insert(thd);
            }
        }

        // S[u] notes that t was scheduled
        for su in self.s.values_mut() {
            su.insert(t);
        }
        self.s.entry(t).or_default().insert(t);

        if taken.is_yield() {
            // the starved set: continuously enabled or disabled by t,
            // minus everything that got a turn
            let et = self.e.entry(t).or_default().clone();
            let dt = self.d.entry(t).or_default().clone();
            let st = self.s.entry(t).or_default().clone();
            let mut h: ThreadSet = et.union(&dt).copied().collect();
            for thd in &st {
                h.remove(thd);
            }
            for thd in h {
                if !self.p.contains(&(t, thd)) {
                    self.p.push((t, thd));
                }
            }
            // reset the per-thread books for t
            let et = self.e.entry(t).or_default();
            et.clear();
            et.extend(curr_state.enabled.keys().copied());
            self.d.entry(t).or_default().clear();
            self.s.entry(t).or_default().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systematic::program::{Execution, Operation};

    fn make_state(execution: &mut Execution, thds: &[ThreadUid]) -> State {
        let idx = execution.create_state();
        for &thd in thds {
            let a = execution.create_action(thd, None, Operation::SchedYield, Some(1));
            execution.state_mut(idx).enabled.insert(thd, a);
        }
        execution.state(idx).clone()
    }

    fn yield_action(execution: &mut Execution, thd: ThreadUid) -> Action {
        let idx = execution.create_action(thd, None, Operation::SchedYield, Some(1));
        execution.action_mut(idx).yield_ = true;
        *execution.action(idx)
    }

    #[test]
    fn spinning_thread_loses_priority() {
        let mut execution = Execution::new();
        let mut fair = FairControl::new();

        // threads 1 and 2 enabled; 1 yields without 2 being scheduled
        let prev = make_state(&mut execution, &[1, 2]);
        let taken = yield_action(&mut execution, 1);
        let curr = make_state(&mut execution, &[1, 2]);
        // E[1] must already contain 2 for it to be starved
        fair.e.entry(1).or_default().insert(2);
        fair.update(&prev, &taken, &curr);

        // now 1 may only run when 2 is disabled
        assert!(!fair.enabled(&curr, 1));
        assert!(fair.enabled(&curr, 2));

        // once 2 runs, the edge is dropped
        let taken2 = *execution.action(execution.state(curr.idx).enabled[&2]);
        let next = make_state(&mut execution, &[1, 2]);
        fair.update(&curr, &taken2, &next);
        assert!(fair.enabled(&next, 1));
    }

    #[test]
    fn scheduled_threads_are_not_starved() {
        let mut execution = Execution::new();
        let mut fair = FairControl::new();

        let prev = make_state(&mut execution, &[1, 2]);
        // 2 got scheduled since 1's last yield
        fair.e.entry(1).or_default().insert(2);
        fair.s.entry(1).or_default().insert(2);
        let taken = yield_action(&mut execution, 1);
        let curr = make_state(&mut execution, &[1, 2]);
        fair.update(&prev, &taken, &curr);

        assert!(fair.enabled(&curr, 1));
    }

    #[test]
    fn non_yield_transitions_add_no_edges() {
        let mut execution = Execution::new();
        let mut fair = FairControl::new();
        let prev = make_state(&mut execution, &[1, 2]);
        let taken = *execution.action(execution.state(prev.idx).enabled[&1]);
        let curr = make_state(&mut execution, &[1, 2]);
        fair.update(&prev, &taken, &curr);
        assert!(fair.enabled(&curr, 1));
        assert!(fair.enabled(&curr, 2));
    }
}
