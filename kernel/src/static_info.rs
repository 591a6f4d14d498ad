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

//! The static program entities: loaded images and instructions. Ids are
//! assigned in first-encounter order and persisted, which makes them
//! stable across runs of the same program.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub type ImageId = u32;
pub type InstId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpcodeClass {
    Read,
    Write,
    AtomicRmw,
    Call,
    Return,
    Other,
}

const COMMON_LIB_NAMES: &[&str] = &[
    "libc",
    "libpthread",
    "ld-linux",
    "ld-2.",
    "libstdc++",
    "libm",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub path: String,
}

impl Image {
    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Whether this image is a common system library. The schedulers use
    /// this to pass library-internal operations through unscheduled.
    pub fn is_common_lib(&self) -> bool {
        let name = self.file_name();
        COMMON_LIB_NAMES.iter().any(|lib| name.starts_with(lib))
    }

    pub fn is_libc(&self) -> bool {
        self.file_name().starts_with("libc")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Inst {
    pub id: InstId,
    pub image: ImageId,
    pub offset: u64,
    pub opcode: OpcodeClass,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StaticInfo {
    images: BTreeMap<ImageId, Image>,
    insts: BTreeMap<InstId, Inst>,
    #[serde(skip)]
    image_index: HashMap<String, ImageId>,
    #[serde(skip)]
    inst_index: HashMap<(ImageId, u64), InstId>,
}

impl StaticInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the image for `path`.
    pub fn get_image(&mut self, path: &str) -> ImageId {
        if let Some(&id) = self.image_index.get(path) {
            return id;
        }
        let id = self.images.keys().next_back().copied().unwrap_or(0) + 1;
        self.images.insert(
            id,
            Image {
                id,
                path: path.to_string(),
            },
        );
        self.image_index.insert(path.to_string(), id);
        id
    }

    pub fn find_image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    /// Look up or create the instruction at `(image, offset)`.
    pub fn get_inst(&mut self, image: ImageId, offset: u64, opcode: OpcodeClass) -> InstId {
        if let Some(&id) = self.inst_index.get(&(image, offset)) {
            return id;
        }
        let id = self.insts.keys().next_back().copied().unwrap_or(0) + 1;
        self.insts.insert(
            id,
            Inst {
                id,
                image,
                offset,
                opcode,
            },
        );
        self.inst_index.insert((image, offset), id);
        id
    }

    pub fn find_inst(&self, id: InstId) -> Option<&Inst> {
        self.insts.get(&id)
    }

    /// Refresh the opcode class once the host has decoded the
    /// instruction (it may first be seen through a call stub).
    pub fn update_opcode(&mut self, id: InstId, opcode: OpcodeClass) {
        if let Some(inst) = self.insts.get_mut(&id) {
            inst.opcode = opcode;
        }
    }

    pub fn inst_image(&self, id: InstId) -> Option<&Image> {
        let inst = self.find_inst(id)?;
        self.find_image(inst.image)
    }

    pub fn load(path: &Path) -> Self {
        let mut info: StaticInfo = match crate::persist::load(path) {
            Some(info) => info,
            None => return StaticInfo::new(),
        };
        info.rebuild_index();
        info
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::persist::save(path, self)
    }

    fn rebuild_index(&mut self) {
        self.image_index = self
            .images
            .values()
            .map(|img| (img.path.clone(), img.id))
            .collect();
        self.inst_index = self
            .insts
            .values()
            .map(|inst| ((inst.image, inst.offset), inst.id))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_first_encounter_ordered() {
        let mut sinfo = StaticInfo::new();
        let app = sinfo.get_image("/bin/app");
        let libc = sinfo.get_image("/lib/libc-2.31.so");
        assert_eq!(app, 1);
        assert_eq!(libc, 2);
        assert_eq!(sinfo.get_image("/bin/app"), app);

        let i1 = sinfo.get_inst(app, 0x10, OpcodeClass::Write);
        let i2 = sinfo.get_inst(app, 0x14, OpcodeClass::Read);
        assert_eq!(i1, 1);
        assert_eq!(i2, 2);
        assert_eq!(sinfo.get_inst(app, 0x10, OpcodeClass::Write), i1);
    }

    #[test]
    fn common_lib_detection() {
        let mut sinfo = StaticInfo::new();
        let libc = sinfo.get_image("/lib/x86_64/libc-2.31.so");
        let app = sinfo.get_image("/home/u/app");
        assert!(sinfo.find_image(libc).unwrap().is_common_lib());
        assert!(sinfo.find_image(libc).unwrap().is_libc());
        assert!(!sinfo.find_image(app).unwrap().is_common_lib());
    }
}
