// This file is part of Astarte.
//
// Copyright 2024 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! In memory implementation of the storage backend.
//!
//! Nothing is persisted, so cached properties are lost on restart. Useful for
//! tests and for devices without a writable flash partition.

use std::collections::HashMap;
use std::convert::Infallible;

use super::NvRecords;

/// Volatile record storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: HashMap<u16, Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvRecords for MemoryStore {
    type Err = Infallible;

    fn read(&self, id: u16) -> Result<Option<Vec<u8>>, Self::Err> {
        Ok(self.records.get(&id).cloned())
    }

    fn write(&mut self, id: u16, data: &[u8]) -> Result<(), Self::Err> {
        self.records.insert(id, data.to_vec());

        Ok(())
    }

    fn delete(&mut self, id: u16) -> Result<(), Self::Err> {
        self.records.remove(&id);

        Ok(())
    }
}
