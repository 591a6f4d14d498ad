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

//! iRoots: instances of the interleaving idioms. An iRoot event is an
//! instruction paired with an access type; an iRoot is an idiom kind
//! plus an ordered tuple of events. The database interns both so every
//! distinct iRoot exists exactly once and has a stable id.

use crate::error::Result;
use crate::static_info::InstId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub type EventId = u32;
pub type IRootId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdiomType {
    Idiom1,
    Idiom2,
    Idiom3,
    Idiom4,
    Idiom5,
}

impl IdiomType {
    pub const ALL: [IdiomType; 5] = [
        IdiomType::Idiom1,
        IdiomType::Idiom2,
        IdiomType::Idiom3,
        IdiomType::Idiom4,
        IdiomType::Idiom5,
    ];

    pub fn arity(self) -> usize {
        match self {
            IdiomType::Idiom1 => 2,
            IdiomType::Idiom2 => 3,
            IdiomType::Idiom3 | IdiomType::Idiom4 | IdiomType::Idiom5 => 4,
        }
    }
}

/// The access type of an iRoot event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    MemRead,
    MemWrite,
    MutexLock,
    MutexUnlock,
}

impl EventType {
    pub fn is_sync(self) -> bool {
        matches!(self, EventType::MutexLock | EventType::MutexUnlock)
    }

    pub fn is_read(self) -> bool {
        self == EventType::MemRead
    }

    pub fn is_write(self) -> bool {
        self == EventType::MemWrite
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IRootEvent {
    pub id: EventId,
    pub inst: InstId,
    pub etype: EventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IRoot {
    pub id: IRootId,
    pub idiom: IdiomType,
    pub events: Vec<EventId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IRootDb {
    events: BTreeMap<EventId, IRootEvent>,
    iroots: BTreeMap<IRootId, IRoot>,
    #[serde(skip)]
    event_index: HashMap<(InstId, EventType), EventId>,
    #[serde(skip)]
    iroot_index: HashMap<(IdiomType, Vec<EventId>), IRootId>,
}

impl IRootDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern the event `(inst, etype)`.
    pub fn get_event(&mut self, inst: InstId, etype: EventType) -> EventId {
        if let Some(&id) = self.event_index.get(&(inst, etype)) {
            return id;
        }
        let id = self.events.keys().next_back().copied().unwrap_or(0) + 1;
        self.events.insert(id, IRootEvent { id, inst, etype });
        self.event_index.insert((inst, etype), id);
        id
    }

    /// Intern the iRoot `(idiom, events)`. The tuple order matters.
    pub fn get_iroot(&mut self, idiom: IdiomType, events: &[EventId]) -> IRootId {
        debug_assert_eq!(events.len(), idiom.arity());
        let key = (idiom, events.to_vec());
        if let Some(&id) = self.iroot_index.get(&key) {
            return id;
        }
        let id = self.iroots.keys().next_back().copied().unwrap_or(0) + 1;
        self.iroots.insert(
            id,
            IRoot {
                id,
                idiom,
                events: events.to_vec(),
            },
        );
        self.iroot_index.insert(key, id);
        id
    }

    pub fn find_event(&self, id: EventId) -> Option<&IRootEvent> {
        self.events.get(&id)
    }

    pub fn find_iroot(&self, id: IRootId) -> Option<&IRoot> {
        self.iroots.get(&id)
    }

    pub fn idiom_of(&self, id: IRootId) -> Option<IdiomType> {
        self.iroots.get(&id).map(|r| r.idiom)
    }

    pub fn num_iroots(&self) -> usize {
        self.iroots.len()
    }

    pub fn load(path: &Path) -> Self {
        let mut db: IRootDb = match crate::persist::load(path) {
            Some(db) => db,
            None => return IRootDb::new(),
        };
        db.rebuild_index();
        db
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }

    fn rebuild_index(&mut self) {
        self.event_index = self
            .events
            .values()
            .map(|e| ((e.inst, e.etype), e.id))
            .collect();
        self.iroot_index = self
            .iroots
            .values()
            .map(|r| ((r.idiom, r.events.clone()), r.id))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_interned() {
        let mut db = IRootDb::new();
        let a = db.get_event(10, EventType::MemWrite);
        let b = db.get_event(10, EventType::MemWrite);
        let c = db.get_event(10, EventType::MemRead);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn iroots_are_interned_by_tuple() {
        let mut db = IRootDb::new();
        let w = db.get_event(1, EventType::MemWrite);
        let r = db.get_event(2, EventType::MemRead);
        let x = db.get_iroot(IdiomType::Idiom1, &[w, r]);
        let y = db.get_iroot(IdiomType::Idiom1, &[w, r]);
        let z = db.get_iroot(IdiomType::Idiom1, &[r, w]);
        assert_eq!(x, y);
        assert_ne!(x, z);
        assert_eq!(db.num_iroots(), 2);
    }
}
