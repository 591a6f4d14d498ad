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

//! The offline maintenance tool. It owns the persisted databases
//! between instrumented runs: inspecting and sampling memoized iRoots,
//! merging memo files from parallel prediction runs, and reporting
//! search progress.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use weft_kernel::iroot::{IRootDb, IdiomType};
use weft_kernel::knob::Knob;
use weft_kernel::logger;
use weft_kernel::memo::Memo;
use weft_kernel::rng::Rng;
use weft_kernel::static_info::StaticInfo;
use weft_kernel::systematic::chess::ChessScheduler;
use weft_kernel::systematic::controller::Controller;
use weft_kernel::systematic::random::RandomScheduler;
use weft_kernel::systematic::search::SearchInfo;
use weft_kernel::{observer::Observer, predictor::Predictor, sinst::SharedInstAnalyzer};

fn register_all(knob: &mut Knob) {
    knob.register_str("sinfo_in", "the input static info database path", "sinfo.db");
    knob.register_str("sinfo_out", "the output static info database path", "sinfo.db");
    knob.register_str("iroot_in", "the input iroot database path", "iroot.db");
    knob.register_str("iroot_out", "the output iroot database path", "iroot.db");
    knob.register_str("memo_in", "the input memoization database path", "memo.db");
    knob.register_str("memo_out", "the output memoization database path", "memo.db");
    knob.register_str("operation", "the operation to perform", "list");
    knob.register_str("arg", "the argument to the operation", "null");
    knob.register_str("path", "the path argument to the operation", "null");
    knob.register_int("num", "the integer argument to the operation", "0");

    // component knobs, so every recognized option is visible to list
    SharedInstAnalyzer::register(knob);
    Observer::register(knob);
    Predictor::register(knob);
    Controller::register(knob);
    ChessScheduler::register(knob);
    RandomScheduler::register(knob);
}

fn parse_idiom(arg: &str) -> Option<IdiomType> {
    match arg {
        "1" => Some(IdiomType::Idiom1),
        "2" => Some(IdiomType::Idiom2),
        "3" => Some(IdiomType::Idiom3),
        "4" => Some(IdiomType::Idiom4),
        "5" => Some(IdiomType::Idiom5),
        _ => None,
    }
}

fn main() -> ExitCode {
    logger::logger_init();

    let mut knob = Knob::new();
    register_all(&mut knob);
    knob.parse(std::env::args().skip(1));

    // initialization order matters: static info first, then the
    // databases layered on top of it
    let sinfo = Arc::new(parking_lot::Mutex::new(StaticInfo::load(
        knob.value_str("sinfo_in").as_ref(),
    )));
    let iroot_db = IRootDb::load(knob.value_str("iroot_in").as_ref());
    let mut memo = Memo::load(knob.value_str("memo_in").as_ref());
    let rng = Rng::new();

    let operation = knob.value_str("operation");
    let arg = knob.value_str("arg");
    let mut read_only = false;

    match operation.as_str() {
        "list" => {
            read_only = true;
            println!("Usage: weft --operation=OP [options]\n");
            println!("Available operations:");
            for op in [
                "list",
                "has_candidate",
                "sample_candidate",
                "total_candidate",
                "total_exposed",
                "total_predicted",
                "apply",
                "search_status",
            ] {
                println!("  {}", op);
            }
            println!("\nRecognized options:");
            for (name, help, default) in knob.describe() {
                println!("  --{}  {} (default: {})", name, help, default);
            }
        }
        "has_candidate" => {
            read_only = true;
            let idiom = parse_idiom(&arg);
            let found = memo.choose_for_test(&iroot_db, idiom).is_some();
            println!("{}", if found { 1 } else { 0 });
        }
        "sample_candidate" => match parse_idiom(&arg) {
            Some(idiom) => {
                let num = knob.value_int("num").max(0) as usize;
                memo.sample_candidate(&iroot_db, idiom, num, &rng);
            }
            None => {
                eprintln!("please specify an idiom");
                return ExitCode::FAILURE;
            }
        },
        "total_candidate" => {
            read_only = true;
            println!("{}", memo.total_candidate());
        }
        "total_exposed" => {
            read_only = true;
            let totals: Vec<String> = IdiomType::ALL
                .iter()
                .map(|&idiom| memo.total_exposed(&iroot_db, idiom).to_string())
                .collect();
            println!("{}", totals.join(" "));
        }
        "total_predicted" => {
            read_only = true;
            println!("{}", memo.total_predicted());
        }
        "apply" => {
            let path = PathBuf::from(knob.value_str("path"));
            let other = Memo::load(&path);
            memo.merge(&other);
            memo.refine_candidate();
        }
        "search_status" => {
            read_only = true;
            let search = SearchInfo::load(knob.value_str("search_in").as_ref());
            println!(
                "done = {}, runs = {}, stack = {}",
                search.done(),
                search.num_runs(),
                search.stack_size()
            );
        }
        other => {
            log::warn!("operation {:?} is not known", other);
            read_only = true;
        }
    }

    if !read_only {
        weft_kernel::persist::save_or_warn(
            knob.value_str("iroot_out").as_ref(),
            &iroot_db,
            "iroot database",
        );
        if let Err(e) = memo.save(knob.value_str("memo_out").as_ref()) {
            log::warn!("failed to save memo: {}", e);
        }
        if let Err(e) = sinfo.lock().save(knob.value_str("sinfo_out").as_ref()) {
            log::warn!("failed to save static info: {}", e);
        }
    }

    ExitCode::SUCCESS
}
