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

//! weft is a dynamic analysis framework for concurrency bugs. It
//! observes multithreaded programs through a binary instrumentation
//! host and either mines atomicity-violation idioms from the observed
//! run, predicts them from feasible reorderings, or systematically
//! explores thread interleavings under a controlled scheduler.

pub mod callstack;
pub mod error;
pub mod event;
pub mod iroot;
pub mod knob;
pub mod logger;
pub mod memo;
pub mod observer;
pub mod persist;
pub mod predictor;
pub mod race;
pub mod rng;
pub mod sinst;
pub mod static_info;
pub mod systematic;
