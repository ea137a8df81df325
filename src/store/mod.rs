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

//! Namespaced key value storage over a record oriented non volatile backend.
//!
//! The backend exposes numbered records of a log structured store. The layout
//! is: record 0 holds the number of stored triples, and the triple `k` is
//! spread over the records `3k + 1`, `3k + 2` and `3k + 3` holding namespace,
//! key and value. Deletions compact the table by swapping the last triple
//! into the hole.

use std::error::Error as StdError;

pub use self::memory::MemoryStore;
pub use self::properties::{PropertyCache, StoredProp};

pub mod memory;
pub mod properties;

/// Error returned by a store operation.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backend failed to read or write a record.
    #[error("couldn't access the storage backend")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
    /// The entry is not present in the store.
    #[error("entry not found")]
    NotFound,
    /// All the available records are in use.
    #[error("storage is full")]
    Full,
    /// A stored record doesn't have the expected shape.
    #[error("corrupted store: {0}")]
    Corrupted(&'static str),
    /// Couldn't encode or decode a stored property value.
    #[error("couldn't convert the stored property")]
    Payload(#[from] crate::payload::PayloadError),
}

impl StoreError {
    fn backend<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Record oriented non volatile storage.
///
/// Implementations are expected to persist whole records addressed by a
/// numeric id, like a flash backed log structured store does. Records are
/// read back exactly as written.
#[cfg_attr(test, mockall::automock(type Err = std::io::Error;))]
pub trait NvRecords {
    /// Reason for a failed backend operation.
    type Err: StdError + Send + Sync + 'static;

    /// Reads the record with the given id, or [`None`] if it was never
    /// written.
    fn read(&self, id: u16) -> Result<Option<Vec<u8>>, Self::Err>;

    /// Writes the record with the given id, overwriting the previous value.
    fn write(&mut self, id: u16, data: &[u8]) -> Result<(), Self::Err>;

    /// Deletes the record with the given id.
    fn delete(&mut self, id: u16) -> Result<(), Self::Err>;
}

const COUNT_RECORD: u16 = 0;

/// Namespaced `(key, value)` store layered over a [`NvRecords`] backend.
#[derive(Debug, Clone)]
pub struct KvStore<B> {
    backend: B,
}

impl<B> KvStore<B>
where
    B: NvRecords,
{
    /// Creates the store over the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Number of stored triples.
    fn count(&self) -> Result<u32, StoreError> {
        let Some(data) = self
            .backend
            .read(COUNT_RECORD)
            .map_err(StoreError::backend)?
        else {
            return Ok(0);
        };

        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| StoreError::Corrupted("invalid count record"))?;

        Ok(u32::from_le_bytes(bytes))
    }

    fn write_count(&mut self, count: u32) -> Result<(), StoreError> {
        self.backend
            .write(COUNT_RECORD, &count.to_le_bytes())
            .map_err(StoreError::backend)
    }

    fn records_of(index: u32) -> Result<(u16, u16, u16), StoreError> {
        let base = index
            .checked_mul(3)
            .and_then(|r| r.checked_add(1))
            .filter(|r| r + 2 <= u32::from(u16::MAX))
            .ok_or(StoreError::Full)?;

        let base = base as u16;

        Ok((base, base + 1, base + 2))
    }

    fn read_record(&self, id: u16) -> Result<Vec<u8>, StoreError> {
        self.backend
            .read(id)
            .map_err(StoreError::backend)?
            .ok_or(StoreError::Corrupted("missing record"))
    }

    /// Index of the triple matching namespace and key.
    fn position(&self, namespace: &str, key: &str) -> Result<Option<u32>, StoreError> {
        let count = self.count()?;

        for index in 0..count {
            let (ns_record, key_record, _) = Self::records_of(index)?;

            if self.read_record(ns_record)? != namespace.as_bytes() {
                continue;
            }

            if self.read_record(key_record)? == key.as_bytes() {
                return Ok(Some(index));
            }
        }

        Ok(None)
    }

    /// Stores a value, overwriting in place when the `(namespace, key)` pair
    /// is already present.
    pub fn insert(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if let Some(index) = self.position(namespace, key)? {
            let (_, _, value_record) = Self::records_of(index)?;

            return self
                .backend
                .write(value_record, value)
                .map_err(StoreError::backend);
        }

        let count = self.count()?;
        let (ns_record, key_record, value_record) = Self::records_of(count)?;

        self.backend
            .write(ns_record, namespace.as_bytes())
            .map_err(StoreError::backend)?;
        self.backend
            .write(key_record, key.as_bytes())
            .map_err(StoreError::backend)?;
        self.backend
            .write(value_record, value)
            .map_err(StoreError::backend)?;

        self.write_count(count + 1)
    }

    /// Returns the value stored for the `(namespace, key)` pair.
    pub fn find(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(index) = self.position(namespace, key)? else {
            return Ok(None);
        };

        let (_, _, value_record) = Self::records_of(index)?;

        self.read_record(value_record).map(Some)
    }

    /// Deletes the `(namespace, key)` pair, compacting the table.
    ///
    /// The last triple is swapped into the hole left by the deleted one.
    pub fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let index = self
            .position(namespace, key)?
            .ok_or(StoreError::NotFound)?;

        let count = self.count()?;
        let last = count - 1;

        if index != last {
            let (ns_from, key_from, value_from) = Self::records_of(last)?;
            let (ns_to, key_to, value_to) = Self::records_of(index)?;

            for (from, to) in [(ns_from, ns_to), (key_from, key_to), (value_from, value_to)] {
                let data = self.read_record(from)?;

                self.backend.write(to, &data).map_err(StoreError::backend)?;
            }
        }

        let (ns_record, key_record, value_record) = Self::records_of(last)?;
        for record in [ns_record, key_record, value_record] {
            self.backend.delete(record).map_err(StoreError::backend)?;
        }

        self.write_count(last)
    }

    /// Iterates over the keys of a namespace, in storage order.
    pub fn iter_keys<'a>(&'a self, namespace: &'a str) -> KeyIter<'a, B> {
        KeyIter {
            store: self,
            namespace,
            index: 0,
            failed: false,
        }
    }
}

/// Iterator over the keys of a namespace.
#[derive(Debug)]
pub struct KeyIter<'a, B> {
    store: &'a KvStore<B>,
    namespace: &'a str,
    index: u32,
    failed: bool,
}

impl<B> Iterator for KeyIter<'_, B>
where
    B: NvRecords,
{
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let count = match self.store.count() {
                Ok(count) => count,
                Err(err) => {
                    self.failed = true;

                    return Some(Err(err));
                }
            };

            if self.index >= count {
                return None;
            }

            let index = self.index;
            self.index += 1;

            let key = self.read_key_at(index);

            match key {
                Ok(Some(key)) => return Some(Ok(key)),
                Ok(None) => continue,
                Err(err) => {
                    self.failed = true;

                    return Some(Err(err));
                }
            }
        }
    }
}

impl<B> KeyIter<'_, B>
where
    B: NvRecords,
{
    fn read_key_at(&self, index: u32) -> Result<Option<String>, StoreError> {
        let (ns_record, key_record, _) = KvStore::<B>::records_of(index)?;

        if self.store.read_record(ns_record)? != self.namespace.as_bytes() {
            return Ok(None);
        }

        let key = self.store.read_record(key_record)?;

        String::from_utf8(key)
            .map(Some)
            .map_err(|_| StoreError::Corrupted("key is not valid UTF-8"))
    }
}
