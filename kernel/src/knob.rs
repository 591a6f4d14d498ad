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

//! The named-option registry. Every component registers the knobs it
//! owns (a name, a help line and a string default) before the command
//! line is parsed; afterwards it queries values by name. All values are
//! strings on the wire; typed accessors parse on demand.

use clap::{Arg, ArgAction, Command};
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct KnobDef {
    help: String,
    default: String,
}

#[derive(Debug, Default)]
pub struct Knob {
    defs: HashMap<String, KnobDef>,
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl Knob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_bool(&mut self, name: &str, help: &str, default: &str) {
        self.register(name, help, default);
    }

    pub fn register_int(&mut self, name: &str, help: &str, default: &str) {
        self.register(name, help, default);
    }

    pub fn register_str(&mut self, name: &str, help: &str, default: &str) {
        self.register(name, help, default);
    }

    fn register(&mut self, name: &str, help: &str, default: &str) {
        // several components may own the same knob (e.g. unit_size);
        // the first registration wins
        if self.defs.contains_key(name) {
            return;
        }
        self.defs.insert(
            name.to_string(),
            KnobDef {
                help: help.to_string(),
                default: default.to_string(),
            },
        );
        self.order.push(name.to_string());
    }

    /// Parse `--name=value` style arguments. Options that were never
    /// registered are dropped with a log entry; they are never fatal.
    pub fn parse<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = vec!["weft".to_string()];
        for arg in args {
            let arg: String = arg.into();
            let name = arg
                .strip_prefix("--")
                .map(|rest| rest.split('=').next().unwrap_or(rest));
            match name {
                Some(name) if self.defs.contains_key(name) => known.push(arg),
                _ => warn!("ignoring unknown option: {}", arg),
            }
        }

        let mut cmd = Command::new("weft").no_binary_name(false);
        for name in &self.order {
            let def = &self.defs[name];
            cmd = cmd.arg(
                Arg::new(name.clone())
                    .long(name.clone())
                    .help(def.help.clone())
                    .default_value(def.default.clone())
                    .action(ArgAction::Set)
                    .num_args(1),
            );
        }
        match cmd.try_get_matches_from(known) {
            Ok(matches) => {
                for name in &self.order {
                    if let Some(value) = matches.get_one::<String>(name) {
                        self.values.insert(name.clone(), value.clone());
                    }
                }
            }
            Err(e) => warn!("option parsing failed, keeping defaults: {}", e),
        }
    }

    fn raw(&self, name: &str) -> &str {
        if let Some(value) = self.values.get(name) {
            return value;
        }
        match self.defs.get(name) {
            Some(def) => &def.default,
            None => {
                crate::fatal!("query of unregistered option: {}", name);
            }
        }
    }

    pub fn value_bool(&self, name: &str) -> bool {
        let raw = self.raw(name);
        raw == "1" || raw.eq_ignore_ascii_case("true")
    }

    pub fn value_int(&self, name: &str) -> i64 {
        let raw = self.raw(name);
        match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("bad integer for option {}: {:?}, using 0", name, raw);
                0
            }
        }
    }

    pub fn value_str(&self, name: &str) -> String {
        self.raw(name).to_string()
    }

    /// One `(name, help, default)` row per registered knob, in
    /// registration order. Used by the binary's `list` operation.
    pub fn describe(&self) -> Vec<(String, String, String)> {
        self.order
            .iter()
            .map(|name| {
                let def = &self.defs[name];
                (name.clone(), def.help.clone(), def.default.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knob() -> Knob {
        let mut k = Knob::new();
        k.register_bool("enable_observer", "whether enable the iroot observer", "0");
        k.register_int("unit_size", "the monitoring granularity in bytes", "4");
        k.register_str("memo_in", "the input memoization database path", "memo.db");
        k
    }

    #[test]
    fn defaults_apply() {
        let k = knob();
        assert!(!k.value_bool("enable_observer"));
        assert_eq!(k.value_int("unit_size"), 4);
        assert_eq!(k.value_str("memo_in"), "memo.db");
    }

    #[test]
    fn parse_overrides() {
        let mut k = knob();
        k.parse(["--enable_observer=1", "--unit_size=8"]);
        assert!(k.value_bool("enable_observer"));
        assert_eq!(k.value_int("unit_size"), 8);
        assert_eq!(k.value_str("memo_in"), "memo.db");
    }

    #[test]
    fn unknown_options_are_ignored() {
        let mut k = knob();
        k.parse(["--no_such_option=1", "--unit_size=16"]);
        assert_eq!(k.value_int("unit_size"), 16);
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut k = knob();
        k.register_int("unit_size", "again", "8");
        assert_eq!(k.value_int("unit_size"), 4);
    }
}
