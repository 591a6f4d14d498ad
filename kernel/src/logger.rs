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

use log::{LevelFilter, Metadata, Record};
use parking_lot::Mutex;
use std::io::Write;

static LOGGER_MUTEX: Mutex<()> = Mutex::new(());

struct Logger;

pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

///set max log level
pub fn set_max_level(level: LogLevel) {
    match level {
        LogLevel::Trace => log::set_max_level(LevelFilter::Trace),
        LogLevel::Debug => log::set_max_level(LevelFilter::Debug),
        LogLevel::Info => log::set_max_level(LevelFilter::Info),
        LogLevel::Warn => log::set_max_level(LevelFilter::Warn),
        LogLevel::Error => log::set_max_level(LevelFilter::Error),
    }
}

/// log init
pub fn logger_init() {
    static LOGGER: Logger = Logger {};
    #[cfg(debug_assertions)]
    log::set_max_level(LevelFilter::Debug);
    #[cfg(not(debug_assertions))]
    log::set_max_level(LevelFilter::Warn);
    // a second init (e.g. from tests) keeps the first logger
    let _ = log::set_logger(&LOGGER);
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tid = std::thread::current().id();
        let _guard = LOGGER_MUTEX.lock();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{:?}][{}] {}", tid, record.level(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().lock().flush();
    }
}

/// Report an internal invariant violation, flush the log, and abort.
/// Reserved for conditions that leave the analysis state meaningless.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        log::logger().flush();
        std::process::abort();
    }};
}
