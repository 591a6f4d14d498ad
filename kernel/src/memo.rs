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

//! The memoization database: which iRoots have been observed, which are
//! predicted, which have been exposed by the active tester, and which
//! remain candidates worth testing. All flag updates are monotonic
//! or-ins, so inserting the same iRoot any number of times is the same
//! as inserting it once.

use crate::error::Result;
use crate::iroot::{IRootDb, IRootId, IdiomType};
use crate::rng::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoEntry {
    pub observed: bool,
    pub predicted: bool,
    pub exposed: bool,
    pub async_: bool,
    pub candidate: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Memo {
    entries: BTreeMap<IRootId, MemoEntry>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, iroot: IRootId) -> &mut MemoEntry {
        self.entries.entry(iroot).or_default()
    }

    /// The observer saw this iRoot in the actual interleaving.
    pub fn observed(&mut self, iroot: IRootId) {
        self.entry(iroot).observed = true;
    }

    /// The predictor derived this iRoot from a feasible reordering.
    /// Unexposed predictions become testing candidates.
    pub fn predicted(&mut self, iroot: IRootId) {
        let entry = self.entry(iroot);
        entry.predicted = true;
        if !entry.exposed {
            entry.candidate = true;
        }
    }

    /// A constituent thread depends on asynchronous external events;
    /// such iRoots get a lower testing priority.
    pub fn set_async(&mut self, iroot: IRootId) {
        self.entry(iroot).async_ = true;
    }

    /// The active tester managed to expose this iRoot.
    pub fn set_exposed(&mut self, iroot: IRootId) {
        let entry = self.entry(iroot);
        entry.exposed = true;
        entry.candidate = false;
    }

    pub fn get(&self, iroot: IRootId) -> Option<MemoEntry> {
        self.entries.get(&iroot).copied()
    }

    /// Pick a candidate for testing, preferring synchronous ones.
    /// `idiom` restricts the choice to one idiom kind.
    pub fn choose_for_test(&self, db: &IRootDb, idiom: Option<IdiomType>) -> Option<IRootId> {
        let candidates = || {
            self.entries.iter().filter(|(id, e)| {
                e.candidate && idiom.map_or(true, |want| db.idiom_of(**id) == Some(want))
            })
        };
        candidates()
            .find(|(_, e)| !e.async_)
            .or_else(|| candidates().next())
            .map(|(&id, _)| id)
    }

    /// Keep at most `num` randomly chosen candidates of `idiom`; the
    /// rest lose their candidate flag.
    pub fn sample_candidate(&mut self, db: &IRootDb, idiom: IdiomType, num: usize, rng: &Rng) {
        let mut pool: Vec<IRootId> = self
            .entries
            .iter()
            .filter(|(id, e)| e.candidate && db.idiom_of(**id) == Some(idiom))
            .map(|(&id, _)| id)
            .collect();
        while pool.len() > num {
            let victim = pool.swap_remove(rng.below(pool.len()));
            self.entries.get_mut(&victim).unwrap().candidate = false;
        }
    }

    pub fn total_candidate(&self) -> usize {
        self.entries.values().filter(|e| e.candidate).count()
    }

    pub fn total_predicted(&self) -> usize {
        self.entries.values().filter(|e| e.predicted).count()
    }

    pub fn total_observed(&self, db: &IRootDb, idiom: IdiomType) -> usize {
        self.count_by_idiom(db, idiom, |e| e.observed)
    }

    pub fn total_exposed(&self, db: &IRootDb, idiom: IdiomType) -> usize {
        self.count_by_idiom(db, idiom, |e| e.exposed)
    }

    fn count_by_idiom(
        &self,
        db: &IRootDb,
        idiom: IdiomType,
        pred: impl Fn(&MemoEntry) -> bool,
    ) -> usize {
        self.entries
            .iter()
            .filter(|(id, e)| pred(e) && db.idiom_of(**id) == Some(idiom))
            .count()
    }

    /// Or-in all flags from another memo (e.g. one produced by a
    /// parallel prediction run).
    pub fn merge(&mut self, other: &Memo) {
        for (&id, o) in &other.entries {
            let entry = self.entry(id);
            entry.observed |= o.observed;
            entry.predicted |= o.predicted;
            entry.exposed |= o.exposed;
            entry.async_ |= o.async_;
            entry.candidate |= o.candidate;
        }
    }

    /// Recompute candidates after a merge: a candidate is a predicted,
    /// not-yet-exposed iRoot.
    pub fn refine_candidate(&mut self) {
        for entry in self.entries.values_mut() {
            entry.candidate = entry.predicted && !entry.exposed;
        }
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
    use crate::iroot::EventType;

    fn db_with_iroot(idiom: IdiomType) -> (IRootDb, IRootId) {
        let mut db = IRootDb::new();
        let w = db.get_event(1, EventType::MemWrite);
        let r = db.get_event(2, EventType::MemRead);
        let events: Vec<_> = [w, r, w, r].into_iter().take(idiom.arity()).collect();
        let iroot = db.get_iroot(idiom, &events);
        (db, iroot)
    }

    #[test]
    fn insertion_is_idempotent() {
        let (db, iroot) = db_with_iroot(IdiomType::Idiom1);
        let mut memo = Memo::new();
        memo.observed(iroot);
        let once = memo.get(iroot).unwrap();
        for _ in 0..5 {
            memo.observed(iroot);
        }
        let many = memo.get(iroot).unwrap();
        assert_eq!(once.observed, many.observed);
        assert_eq!(memo.total_observed(&db, IdiomType::Idiom1), 1);
    }

    #[test]
    fn predicted_becomes_candidate_until_exposed() {
        let (db, iroot) = db_with_iroot(IdiomType::Idiom1);
        let mut memo = Memo::new();
        memo.predicted(iroot);
        assert_eq!(memo.choose_for_test(&db, None), Some(iroot));
        memo.set_exposed(iroot);
        assert_eq!(memo.choose_for_test(&db, None), None);
        // a later prediction of an exposed iroot stays non-candidate
        memo.predicted(iroot);
        assert_eq!(memo.total_candidate(), 0);
    }

    #[test]
    fn async_candidates_have_lower_priority() {
        let mut db = IRootDb::new();
        let w = db.get_event(1, EventType::MemWrite);
        let r = db.get_event(2, EventType::MemRead);
        let a = db.get_iroot(IdiomType::Idiom1, &[w, r]);
        let b = db.get_iroot(IdiomType::Idiom1, &[r, w]);
        let mut memo = Memo::new();
        memo.predicted(a);
        memo.set_async(a);
        memo.predicted(b);
        assert_eq!(memo.choose_for_test(&db, Some(IdiomType::Idiom1)), Some(b));
    }

    #[test]
    fn merge_then_refine() {
        let (_db, iroot) = db_with_iroot(IdiomType::Idiom2);
        let mut a = Memo::new();
        let mut b = Memo::new();
        b.predicted(iroot);
        b.set_exposed(iroot);
        a.predicted(iroot);
        a.merge(&b);
        a.refine_candidate();
        let entry = a.get(iroot).unwrap();
        assert!(entry.predicted && entry.exposed && !entry.candidate);
    }
}
