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

//! Scenario tests for the iRoot observer: small synthetic event
//! streams with known idiom content.

use parking_lot::Mutex;
use std::sync::Arc;
use weft_kernel::event::Analyzer;
use weft_kernel::iroot::{EventType, IRootDb, IRootId, IdiomType};
use weft_kernel::knob::Knob;
use weft_kernel::memo::Memo;
use weft_kernel::observer::Observer;

const X: u64 = 0x1000;
const Y: u64 = 0x1004;

struct Fixture {
    observer: Observer,
    iroot_db: Arc<Mutex<IRootDb>>,
    memo: Arc<Mutex<Memo>>,
}

fn fixture(args: &[&str]) -> Fixture {
    let mut knob = Knob::new();
    Observer::register(&mut knob);
    knob.parse(args.iter().map(|s| s.to_string()));
    let iroot_db = Arc::new(Mutex::new(IRootDb::new()));
    let memo = Arc::new(Mutex::new(Memo::new()));
    let observer = Observer::new(&knob, Arc::clone(&iroot_db), Arc::clone(&memo), None);
    observer.image_load(1, 0x400000, 0x500000, 0x1000, 0x1000, 0, 0);
    observer.thread_start(1, None);
    observer.thread_start(2, Some(1));
    Fixture {
        observer,
        iroot_db,
        memo,
    }
}

impl Fixture {
    fn iroot(&self, idiom: IdiomType, events: &[(u32, EventType)]) -> IRootId {
        let mut db = self.iroot_db.lock();
        let ids: Vec<_> = events
            .iter()
            .map(|&(inst, etype)| db.get_event(inst, etype))
            .collect();
        db.get_iroot(idiom, &ids)
    }

    fn observed(&self, idiom: IdiomType, events: &[(u32, EventType)]) -> bool {
        let iroot = self.iroot(idiom, events);
        self.memo.lock().get(iroot).map_or(false, |e| e.observed)
    }

    fn total(&self, idiom: IdiomType) -> usize {
        self.memo.lock().total_observed(&self.iroot_db.lock(), idiom)
    }
}

#[test]
fn remote_write_read_gives_one_idiom1() {
    let f = fixture(&["--enable_observer=1"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_read(2, 1, 20, X, 4);

    assert!(f.observed(
        IdiomType::Idiom1,
        &[(10, EventType::MemWrite), (20, EventType::MemRead)]
    ));
    assert_eq!(f.total(IdiomType::Idiom1), 1);
    assert_eq!(f.total(IdiomType::Idiom2), 0);
}

#[test]
fn interleaved_read_between_writes_gives_idiom2() {
    // A: x=1 .. x=2, with B's read landing in between
    let f = fixture(&["--enable_observer=1", "--complex_idioms=1"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_read(2, 1, 20, X, 4);
    f.observer.before_mem_write(1, 2, 11, X, 4);

    assert!(f.observed(
        IdiomType::Idiom2,
        &[
            (10, EventType::MemWrite),
            (20, EventType::MemRead),
            (11, EventType::MemWrite),
        ]
    ));
    assert_eq!(f.total(IdiomType::Idiom2), 1);
    // the two direct dependencies are idiom-1 instances
    assert_eq!(f.total(IdiomType::Idiom1), 2);
}

#[test]
fn remote_read_pair_inside_write_pair_gives_idiom3() {
    let f = fixture(&["--enable_observer=1", "--complex_idioms=1"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_read(2, 1, 20, X, 4);
    f.observer.before_mem_read(2, 2, 21, X, 4);
    f.observer.before_mem_write(1, 2, 11, X, 4);

    assert!(f.observed(
        IdiomType::Idiom3,
        &[
            (10, EventType::MemWrite),
            (20, EventType::MemRead),
            (21, EventType::MemRead),
            (11, EventType::MemWrite),
        ]
    ));
}

#[test]
fn cross_address_pairs_give_idiom4() {
    // local pair on x then y straddles the remote pair on x
    let f = fixture(&["--enable_observer=1", "--complex_idioms=1"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_read(2, 1, 20, X, 4);
    f.observer.before_mem_read(2, 2, 21, Y, 4);
    f.observer.before_mem_write(1, 2, 11, Y, 4);

    assert!(f.observed(
        IdiomType::Idiom4,
        &[
            (10, EventType::MemWrite),
            (20, EventType::MemRead),
            (21, EventType::MemRead),
            (11, EventType::MemWrite),
        ]
    ));
}

#[test]
fn crossed_write_pairs_give_symmetric_idiom5() {
    // A: x= then y= ; B: y= then x= , observed crossing each other
    let f = fixture(&["--enable_observer=1", "--complex_idioms=1"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_write(2, 1, 20, Y, 4);
    f.observer.before_mem_write(1, 2, 11, Y, 4);
    f.observer.before_mem_write(2, 2, 21, X, 4);

    let e0 = (20, EventType::MemWrite);
    let e1 = (11, EventType::MemWrite);
    let e2 = (10, EventType::MemWrite);
    let e3 = (21, EventType::MemWrite);
    assert!(f.observed(IdiomType::Idiom5, &[e0, e1, e2, e3]));
    assert!(f.observed(IdiomType::Idiom5, &[e2, e3, e0, e1]));
    assert_eq!(f.total(IdiomType::Idiom5), 2);
}

#[test]
fn disabled_idioms_are_not_reported() {
    let f = fixture(&["--enable_observer=1", "--complex_idioms=1", "--type2=0"]);
    f.observer.before_mem_write(1, 1, 10, X, 4);
    f.observer.before_mem_read(2, 1, 20, X, 4);
    f.observer.before_mem_write(1, 2, 11, X, 4);
    assert_eq!(f.total(IdiomType::Idiom2), 0);
}

#[test]
fn unlock_lock_dependency_is_idiom1() {
    let f = fixture(&["--enable_observer=1"]);
    f.observer.after_pthread_mutex_lock(1, 1, 30, X);
    f.observer.before_pthread_mutex_unlock(1, 2, 31, X);
    f.observer.after_pthread_mutex_lock(2, 1, 32, X);

    assert!(f.observed(
        IdiomType::Idiom1,
        &[(31, EventType::MutexUnlock), (32, EventType::MutexLock)]
    ));
}

#[test]
fn freed_region_stops_reporting() {
    let f = fixture(&["--enable_observer=1"]);
    f.observer.after_malloc(1, 1, 5, 16, 0x9000);
    f.observer.before_mem_write(1, 2, 10, 0x9000, 4);
    f.observer.before_free(1, 3, 6, 0x9000);
    // accesses to freed memory are filtered
    f.observer.before_mem_read(2, 1, 20, 0x9000, 4);
    assert_eq!(f.total(IdiomType::Idiom1), 0);
}
