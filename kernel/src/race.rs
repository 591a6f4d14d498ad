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

//! The racy-instruction database. Produced by an external race
//! detector; the systematic controller consults it in `sched_race` mode
//! to turn racy memory operations into schedule points.

use crate::error::Result;
use crate::static_info::InstId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RaceDb {
    racy_insts: BTreeSet<InstId>,
}

impl RaceDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_racy_inst(&mut self, inst: InstId) {
        self.racy_insts.insert(inst);
    }

    pub fn racy_inst(&self, inst: InstId) -> bool {
        self.racy_insts.contains(&inst)
    }

    pub fn load(path: &Path) -> Self {
        crate::persist::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }
}
