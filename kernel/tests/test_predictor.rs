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

//! Scenario tests for the iRoot predictor, including the complex-idiom
//! sweep that runs at program exit.

use parking_lot::Mutex;
use std::sync::Arc;
use weft_kernel::event::Analyzer;
use weft_kernel::iroot::{EventType, IRootDb, IRootId, IdiomType};
use weft_kernel::knob::Knob;
use weft_kernel::memo::Memo;
use weft_kernel::predictor::Predictor;
use weft_kernel::sinst::SharedInstDb;
use weft_kernel::static_info::StaticInfo;

const X: u64 = 0x1000;

struct Fixture {
    predictor: Predictor,
    iroot_db: Arc<Mutex<IRootDb>>,
    memo: Arc<Mutex<Memo>>,
}

fn fixture(args: &[&str], shared_insts: &[u32]) -> Fixture {
    let mut knob = Knob::new();
    Predictor::register(&mut knob);
    knob.parse(args.iter().map(|s| s.to_string()));
    let iroot_db = Arc::new(Mutex::new(IRootDb::new()));
    let memo = Arc::new(Mutex::new(Memo::new()));
    let sinst_db = Arc::new(Mutex::new(SharedInstDb::new()));
    {
        let mut db = sinst_db.lock();
        for &inst in shared_insts {
            db.set_shared(inst);
        }
    }
    let predictor = Predictor::new(
        &knob,
        Arc::new(Mutex::new(StaticInfo::new())),
        Arc::clone(&iroot_db),
        Arc::clone(&memo),
        sinst_db,
    );
    predictor.image_load(1, 0x400000, 0x500000, 0x1000, 0x1000, 0, 0);
    predictor.thread_start(1, None);
    predictor.thread_start(2, Some(1));
    Fixture {
        predictor,
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

    fn predicted(&self, idiom: IdiomType, events: &[(u32, EventType)]) -> bool {
        let iroot = self.iroot(idiom, events);
        self.memo.lock().get(iroot).map_or(false, |e| e.predicted)
    }
}

#[test]
fn locked_sections_predict_the_cross_section_dependency() {
    // A: lock(m); x=1; unlock(m).  B: lock(m); r=x; unlock(m).
    // Feasible because the lock is released between the sections.
    let f = fixture(&["--enable_predictor=1"], &[10, 20]);
    let p = &f.predictor;
    p.after_pthread_mutex_lock(1, 1, 5, 0x1040);
    p.before_mem_write(1, 2, 10, X, 4);
    p.before_pthread_mutex_unlock(1, 3, 6, 0x1040);
    p.after_pthread_mutex_lock(2, 1, 7, 0x1040);
    p.before_mem_read(2, 2, 20, X, 4);
    p.before_pthread_mutex_unlock(2, 3, 8, 0x1040);
    p.thread_exit(1, 4);
    p.thread_exit(2, 4);

    assert!(f.predicted(
        IdiomType::Idiom1,
        &[(10, EventType::MemWrite), (20, EventType::MemRead)]
    ));
}

#[test]
fn exit_sweep_predicts_idiom2_from_clock_ranges() {
    // A: x=1 ; x=2 within the window.  B: r=x concurrent with both.
    let f = fixture(
        &["--enable_predictor=1", "--complex_idioms=1"],
        &[10, 11, 20],
    );
    let p = &f.predictor;
    p.before_mem_write(1, 1, 10, X, 4);
    p.before_mem_read(2, 1, 20, X, 4);
    p.before_mem_write(1, 2, 11, X, 4);
    p.thread_exit(1, 3);
    p.thread_exit(2, 2);
    p.program_exit();

    assert!(f.predicted(
        IdiomType::Idiom2,
        &[
            (10, EventType::MemWrite),
            (20, EventType::MemRead),
            (11, EventType::MemWrite),
        ]
    ));
}

#[test]
fn join_orders_out_the_child_accesses() {
    // the child writes, exits and is joined; the parent's read is
    // ordered after the write, so nothing can reorder
    let f = fixture(&["--enable_predictor=1"], &[10, 20]);
    let p = &f.predictor;
    p.before_mem_write(2, 1, 10, X, 4);
    p.thread_exit(2, 2);
    p.after_pthread_join(1, 1, 9, 2);
    p.before_mem_read(1, 2, 20, X, 4);
    p.thread_exit(1, 3);

    assert!(!f.predicted(
        IdiomType::Idiom1,
        &[(20, EventType::MemRead), (10, EventType::MemWrite)]
    ));
}

#[test]
fn thread_local_instructions_stay_out_of_histories() {
    // nothing marked shared: accesses from one thread only never
    // create a history, and no predictions appear
    let f = fixture(&["--enable_predictor=1"], &[]);
    let p = &f.predictor;
    p.before_mem_write(1, 1, 10, X, 4);
    p.before_mem_write(1, 2, 11, X, 4);
    p.thread_exit(1, 3);
    assert_eq!(f.memo.lock().total_predicted(), 0);
}

#[test]
fn deadlock_pass_pairs_mirrored_lock_orders() {
    let f = fixture(
        &[
            "--enable_predictor=1",
            "--complex_idioms=1",
            "--predict_deadlock=1",
        ],
        &[],
    );
    let p = &f.predictor;
    let m1 = 0x1040;
    let m2 = 0x1080;
    // A takes m1 then m2; B takes m2 then m1
    p.after_pthread_mutex_lock(1, 1, 30, m1);
    p.after_pthread_mutex_lock(1, 2, 31, m2);
    p.before_pthread_mutex_unlock(1, 3, 32, m2);
    p.before_pthread_mutex_unlock(1, 4, 33, m1);
    p.after_pthread_mutex_lock(2, 1, 40, m2);
    p.after_pthread_mutex_lock(2, 2, 41, m1);
    p.before_pthread_mutex_unlock(2, 3, 42, m1);
    p.before_pthread_mutex_unlock(2, 4, 43, m2);
    p.thread_exit(1, 5);
    p.thread_exit(2, 5);
    p.program_exit();

    assert!(f.predicted(
        IdiomType::Idiom5,
        &[
            (30, EventType::MutexLock),
            (41, EventType::MutexLock),
            (40, EventType::MutexLock),
            (31, EventType::MutexLock),
        ]
    ));
}
