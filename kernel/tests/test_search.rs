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

//! End-to-end tests for the CHESS controller/scheduler pair: two real
//! application threads run against the scheduler thread, one run per
//! invocation, with the search state persisted between runs.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use weft_kernel::knob::Knob;
use weft_kernel::rng::Rng;
use weft_kernel::static_info::StaticInfo;
use weft_kernel::systematic::chess::ChessScheduler;
use weft_kernel::systematic::controller::Controller;
use weft_kernel::systematic::program::Operation;
use weft_kernel::systematic::search::SearchInfo;

const MUTEX: u64 = 0x1000;
const DATA_START: u64 = 0x1000;
const DATA_SIZE: u64 = 0x1000;

fn make_knob(dir: &Path, extra: &[&str]) -> Knob {
    let mut knob = Knob::new();
    Controller::register(&mut knob);
    ChessScheduler::register(&mut knob);
    let mut args = vec![
        "--enable_chess_scheduler=1".to_string(),
        "--abort_diverge=0".to_string(),
        format!("--search_in={}", dir.join("search.db").display()),
        format!("--search_out={}", dir.join("search.db").display()),
        format!("--por_info_path={}", dir.join("por-info").display()),
        format!("--program_in={}", dir.join("program.db").display()),
        format!("--program_out={}", dir.join("program.db").display()),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    knob.parse(args);
    knob
}

fn wait_parked(ctrl: &Controller, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctrl.parked_threads() < n {
        assert!(Instant::now() < deadline, "threads never reached a schedule point");
        thread::sleep(Duration::from_millis(1));
    }
}

/// One program run: returns (search exhausted before the run, runs so
/// far). `second_yields` lets divergence tests vary thread 2's behavior.
fn run_once(dir: &Path, extra: &[&str], second_yields: bool) -> (bool, u32) {
    let knob = make_knob(dir, extra);
    let sinfo = Arc::new(parking_lot::Mutex::new(StaticInfo::new()));
    let ctrl = Arc::new(Controller::new(&knob, sinfo));
    let mut chess = ChessScheduler::new(&knob, Arc::new(Rng::with_seed(7)));
    if !chess.setup() {
        return (true, chess.num_runs());
    }
    ctrl.program_start(&mut chess);
    ctrl.image_load(1, DATA_START, DATA_SIZE, 0, 0);

    // threads are registered up front so creation ordinals do not
    // depend on startup timing
    ctrl.thread_start(1, None);
    ctrl.thread_start(2, Some(1));

    let c1 = Arc::clone(&ctrl);
    let t1 = thread::spawn(move || {
        c1.mutex_lock(1, MUTEX, 11);
        c1.mutex_unlock(1, MUTEX, 12);
        c1.thread_exit(1);
    });
    let c2 = Arc::clone(&ctrl);
    let t2 = thread::spawn(move || {
        if second_yields {
            c2.yield_op(2, Operation::SchedYield, 23);
        } else {
            c2.mutex_lock(2, MUTEX, 21);
            c2.mutex_unlock(2, MUTEX, 22);
        }
        c2.thread_exit(2);
    });

    wait_parked(&ctrl, 2);
    ctrl.scheduler_thread(&mut chess);
    t1.join().unwrap();
    t2.join().unwrap();
    ctrl.program_exit(&mut chess);
    (false, chess.num_runs())
}

fn drive_to_done(dir: &Path, extra: &[&str], max_runs: u32) -> u32 {
    for _ in 0..max_runs + 1 {
        let (was_done, runs) = run_once(dir, extra, false);
        if was_done {
            return runs;
        }
    }
    panic!("search did not finish within {} runs", max_runs);
}

#[test]
fn lock_pair_explores_both_orderings() {
    let dir = tempfile::tempdir().unwrap();
    let runs = drive_to_done(dir.path(), &[], 8);
    assert_eq!(runs, 2);
}

#[test]
fn zero_preemption_bound_still_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let bounded = drive_to_done(dir.path(), &["--pb_limit=0"], 8);

    let dir2 = tempfile::tempdir().unwrap();
    let unbounded = drive_to_done(dir2.path(), &["--pb_limit=2"], 8);

    // both lock orderings are reachable without preemptions, so the
    // bound cannot grow the search
    assert!(bounded <= unbounded);
    assert!(bounded >= 1);
}

#[test]
fn divergence_leaves_search_state_untouched() {
    let dir = tempfile::tempdir().unwrap();

    let (was_done, _) = run_once(dir.path(), &[], false);
    assert!(!was_done);
    let before = std::fs::read(dir.path().join("search.db")).unwrap();
    let runs_before = SearchInfo::load(&dir.path().join("search.db")).num_runs();
    assert_eq!(runs_before, 1);

    // the program changed under the tool: thread 2 now yields instead
    // of locking, so the recorded enabled snapshot no longer matches
    let (was_done, _) = run_once(dir.path(), &[], true);
    assert!(!was_done);

    let after = std::fs::read(dir.path().join("search.db")).unwrap();
    assert_eq!(before, after);
    let info = SearchInfo::load(&dir.path().join("search.db"));
    assert_eq!(info.num_runs(), 1);
    assert!(!info.done());
}

#[test]
fn prefix_replay_matches_recorded_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    // drive the same program to completion; every run after the first
    // replays a stored prefix, and a snapshot mismatch would turn it
    // into a divergence run that never persists
    let runs = drive_to_done(dir.path(), &[], 8);
    assert_eq!(runs, 2);
    let info = SearchInfo::load(&dir.path().join("search.db"));
    assert!(info.done());
    assert_eq!(info.stack_size(), 0);
}
