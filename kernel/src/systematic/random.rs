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

//! The random scheduler: an unbiased pick among the enabled threads at
//! every schedule point. Useful as a baseline and for shaking out
//! schedule-sensitive failures without systematic state.

use crate::knob::Knob;
use crate::rng::Rng;
use crate::systematic::controller::Controller;
use crate::systematic::program::{ActionIdx, StateIdx};
use crate::systematic::scheduler::{self, CounterTables, Scheduler};
use std::sync::Arc;

pub struct RandomScheduler {
    rng: Arc<Rng>,
    counters: CounterTables,
}

impl RandomScheduler {
    pub fn register(knob: &mut Knob) {
        knob.register_bool(
            "enable_random_scheduler",
            "whether use the random scheduler",
            "0",
        );
    }

    pub fn enabled(knob: &Knob) -> bool {
        knob.value_bool("enable_random_scheduler")
    }

    pub fn new(rng: Arc<Rng>) -> Self {
        Self {
            rng,
            counters: CounterTables::new(),
        }
    }
}

/// Reservoir pick over the enabled actions of a state.
pub fn pick_next_random(ctrl: &Controller, state: StateIdx, rng: &Rng) -> Option<ActionIdx> {
    ctrl.with_kernel(|k| {
        let mut target = None;
        let mut counter = 1usize;
        for &action in k.execution.state(state).enabled.values() {
            if rng.choice(1.0 / counter as f64) {
                target = Some(action);
            }
            counter += 1;
        }
        target
    })
}

impl Scheduler for RandomScheduler {
    fn name(&self) -> &'static str {
        "random"
    }

    fn program_start(&mut self, _ctrl: &Controller) {}

    fn program_exit(&mut self, _ctrl: &Controller) {}

    fn explore(&mut self, ctrl: &Controller, init_state: StateIdx) {
        let mut state = init_state;
        while !ctrl.with_kernel(|k| k.execution.state(state).is_terminal()) {
            let action = match pick_next_random(ctrl, state, &self.rng) {
                Some(action) => action,
                None => break,
            };
            state = scheduler::execute(&mut self.counters, ctrl, state, action);
        }
    }

    fn counters(&mut self) -> &mut CounterTables {
        &mut self.counters
    }
}
