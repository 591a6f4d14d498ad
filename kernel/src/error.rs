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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds of the framework. Internal invariant violations do not
/// surface here; those abort via [`crate::logger::fatal`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persist(#[from] bincode::Error),

    #[error("replay diverged at schedule point {0}")]
    Divergence(usize),

    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("invalid option value for {name}: {value}")]
    BadOptionValue { name: String, value: String },
}
