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

//! Round-trip tests for the persisted databases: what is saved loads
//! back equal, and absent files load as fresh state.

use weft_kernel::iroot::{EventType, IRootDb, IdiomType};
use weft_kernel::memo::Memo;
use weft_kernel::race::RaceDb;
use weft_kernel::sinst::SharedInstDb;
use weft_kernel::static_info::{OpcodeClass, StaticInfo};
use weft_kernel::systematic::program::{Execution, ObjectKey, Operation, Program};

#[test]
fn static_info_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sinfo.db");

    let mut sinfo = StaticInfo::new();
    let app = sinfo.get_image("/bin/app");
    let libc = sinfo.get_image("/lib/libc-2.31.so");
    let w = sinfo.get_inst(app, 0x10, OpcodeClass::Write);
    let r = sinfo.get_inst(app, 0x14, OpcodeClass::Read);
    sinfo.save(&path).unwrap();

    let mut loaded = StaticInfo::load(&path);
    assert_eq!(loaded.find_inst(w).unwrap().offset, 0x10);
    assert_eq!(loaded.find_inst(r).unwrap().opcode, OpcodeClass::Read);
    assert!(loaded.find_image(libc).unwrap().is_libc());
    // interning picks up where the saved run stopped
    assert_eq!(loaded.get_image("/bin/app"), app);
    assert_eq!(loaded.get_inst(app, 0x18, OpcodeClass::Read), r + 1);
}

#[test]
fn iroot_db_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iroot.db");

    let mut db = IRootDb::new();
    let e0 = db.get_event(1, EventType::MemWrite);
    let e1 = db.get_event(2, EventType::MemRead);
    let iroot = db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
    db.save(&path).unwrap();

    let mut loaded = IRootDb::load(&path);
    assert_eq!(loaded.num_iroots(), 1);
    assert_eq!(loaded.get_event(1, EventType::MemWrite), e0);
    assert_eq!(loaded.get_iroot(IdiomType::Idiom1, &[e0, e1]), iroot);
    assert_eq!(loaded.find_iroot(iroot).unwrap().idiom, IdiomType::Idiom1);
}

#[test]
fn memo_round_trips_and_inserts_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memo.db");

    let mut db = IRootDb::new();
    let e0 = db.get_event(1, EventType::MemWrite);
    let e1 = db.get_event(2, EventType::MemRead);
    let iroot = db.get_iroot(IdiomType::Idiom1, &[e0, e1]);

    let mut memo = Memo::new();
    for _ in 0..3 {
        memo.observed(iroot);
        memo.predicted(iroot);
    }
    memo.save(&path).unwrap();

    let loaded = Memo::load(&path);
    let entry = loaded.get(iroot).unwrap();
    assert!(entry.observed && entry.predicted && entry.candidate);
    assert_eq!(loaded.total_observed(&db, IdiomType::Idiom1), 1);
    assert_eq!(loaded.total_predicted(), 1);
}

#[test]
fn program_round_trips_with_stable_uids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.db");

    let mut program = Program::new();
    let main = program.get_main_thread();
    let child = program.get_thread(main, 1);
    let obj = program.get_object(ObjectKey::Dynamic {
        creator: child,
        creator_inst: 7,
        creator_idx: 1,
        offset: 8,
    });
    program.save(&path).unwrap();

    let mut loaded = Program::load(&path);
    assert_eq!(loaded.get_main_thread(), main);
    assert_eq!(loaded.get_thread(main, 1), child);
    assert_eq!(
        loaded.get_object(ObjectKey::Dynamic {
            creator: child,
            creator_inst: 7,
            creator_idx: 1,
            offset: 8,
        }),
        obj
    );
    assert_eq!(loaded.find_thread(child).unwrap().creator, Some(main));
}

#[test]
fn execution_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exec.db");

    let mut execution = Execution::new();
    let a0 = execution.create_action(1, Some(1), Operation::MutexLock, Some(3));
    execution.action_mut(a0).tc = 1;
    execution.action_mut(a0).oc = 1;
    let s0 = execution.create_state();
    execution.state_mut(s0).enabled.insert(1, a0);
    execution.state_mut(s0).taken = Some(a0);
    let _s1 = execution.create_state();
    execution.save(&path).unwrap();

    let loaded = Execution::load(&path);
    assert_eq!(loaded.num_states(), 2);
    let action = loaded.action(a0);
    assert_eq!(action.op, Operation::MutexLock);
    assert_eq!((action.tc, action.oc), (1, 1));
    assert_eq!(loaded.state(s0).taken, Some(a0));
    assert_eq!(loaded.prefix_taken(1).len(), 1);
}

#[test]
fn shared_inst_and_race_dbs_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let mut sinst = SharedInstDb::new();
    sinst.set_shared(4);
    sinst.set_shared(9);
    sinst.save(&dir.path().join("sinst.db")).unwrap();
    let loaded = SharedInstDb::load(&dir.path().join("sinst.db"));
    assert!(loaded.shared(4) && loaded.shared(9) && !loaded.shared(5));

    let mut race = RaceDb::new();
    race.set_racy_inst(11);
    race.save(&dir.path().join("race.db")).unwrap();
    let loaded = RaceDb::load(&dir.path().join("race.db"));
    assert!(loaded.racy_inst(11) && !loaded.racy_inst(12));
}

#[test]
fn absent_or_corrupt_files_load_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.db");
    assert_eq!(IRootDb::load(&missing).num_iroots(), 0);

    let corrupt = dir.path().join("bad.db");
    std::fs::write(&corrupt, b"not a database").unwrap();
    assert_eq!(Program::load(&corrupt).find_thread(1).map(|t| t.uid), None);
    assert_eq!(Memo::load(&corrupt).total_predicted(), 0);
}
