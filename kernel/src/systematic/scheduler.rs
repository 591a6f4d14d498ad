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

//! The scheduler abstraction shared by the CHESS and random schedulers,
//! plus the counter stamping that makes every executed action's
//! `(thread, object, op, inst, tc, oc)` tuple unique and stable.

use crate::systematic::controller::Controller;
use crate::systematic::program::{ActionIdx, ObjectUid, StateIdx, ThreadUid};
use std::collections::HashMap;

pub trait Scheduler {
    fn name(&self) -> &'static str;
    fn program_start(&mut self, ctrl: &Controller);
    fn program_exit(&mut self, ctrl: &Controller);
    fn explore(&mut self, ctrl: &Controller, init_state: StateIdx);
    fn counters(&mut self) -> &mut CounterTables;
}

/// Drive a scheduler over one run, starting from the initial state.
pub fn run(scheduler: &mut dyn Scheduler, ctrl: &Controller, init_state: StateIdx) {
    stamp_counters(scheduler.counters(), ctrl, init_state);
    scheduler.explore(ctrl, init_state);
}

/// The per-thread and per-object ordinals of the actions executed so
/// far in this run.
#[derive(Debug, Default)]
pub struct CounterTables {
    tc: HashMap<ThreadUid, u64>,
    oc: HashMap<ObjectUid, u64>,
}

impl CounterTables {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stamp tentative counters onto every enabled action of a state.
/// `tc` is always the next per-thread ordinal; `oc` advances only for
/// actions that modify their object.
pub fn stamp_counters(counters: &CounterTables, ctrl: &Controller, state: StateIdx) {
    ctrl.with_kernel(|k| {
        let enabled: Vec<ActionIdx> = k.execution.state(state).enabled.values().copied().collect();
        for idx in enabled {
            let action = *k.execution.action(idx);
            if let Some(obj) = action.obj {
                let tc = counters.tc.get(&action.thd).copied().unwrap_or(0);
                let oc = counters.oc.get(&obj).copied().unwrap_or(0);
                let slot = k.execution.action_mut(idx);
                slot.tc = tc + 1;
                slot.oc = if slot.is_write() { oc + 1 } else { oc };
            }
        }
    });
}

/// Execute `action` out of `state`: persist the chosen action's
/// counters, mark it taken, hand the floor to its thread and stamp the
/// resulting state.
pub fn execute(
    counters: &mut CounterTables,
    ctrl: &Controller,
    state: StateIdx,
    action: ActionIdx,
) -> StateIdx {
    ctrl.with_kernel(|k| {
        let a = *k.execution.action(action);
        if let Some(obj) = a.obj {
            counters.tc.insert(a.thd, a.tc);
            counters.oc.insert(obj, a.oc);
        }
        k.execution.state_mut(state).taken = Some(action);
    });
    let next = ctrl.execute_action(action);
    stamp_counters(counters, ctrl, next);
    next
}
