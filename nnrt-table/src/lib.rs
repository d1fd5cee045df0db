// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Configuration table: for each address space, the list of network
//! configurations the engine may run, indexed by NNID.
//!
//! The table is built by the owner before the engine is pointed at it and is
//! treated as read-only afterwards. NNIDs are handed out in attachment order
//! and never reused; there is no detach.

extern crate alloc;

use alloc::vec::Vec;
use log::{error, info, trace};
use nnrt_shared::{words_for_bytes, Asid, Nnid, WORD_BYTES};

mod config;
mod io;

pub use config::{elements_per_block, ConfigBuffer, NetworkConfig, BLOCK_BYTES};
pub use io::{IoQueue, IoRegion, IO_QUEUE_DEPTH};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TableError {
    AddressSpaceOutOfRange,
    CapacityExceeded,
    SourceUnreadable,
    EmptyConfiguration,
}

/// The source failed mid-read; partial data is discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceError;

/// Byte stream a configuration blob is read from.
pub trait ConfigSource {
    /// Reads up to |buf.len()| bytes. Ok(0) marks the end of the blob.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;
}

impl ConfigSource for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let count = core::cmp::min(buf.len(), self.len());
        let (head, tail) = self.split_at(count);
        buf[..count].copy_from_slice(head);
        *self = tail;
        Ok(count)
    }
}

/// Adapts any std reader (e.g. a file) to [ConfigSource].
#[cfg(feature = "std")]
pub struct StdSource<R>(pub R);

#[cfg(feature = "std")]
impl<R: std::io::Read> ConfigSource for StdSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        loop {
            match self.0.read(buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                result => return result.map_err(|_| SourceError),
            }
        }
    }
}

/// Configurations and I/O state for one address space.
#[derive(Debug)]
pub struct AddressSpaceEntry {
    capacity: usize,
    configs: Vec<NetworkConfig>,
    io: IoRegion,
}

impl AddressSpaceEntry {
    fn new(capacity: usize) -> Self {
        AddressSpaceEntry {
            capacity,
            configs: Vec::with_capacity(capacity),
            io: IoRegion::default(),
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn valid_count(&self) -> usize { self.configs.len() }
    pub fn is_full(&self) -> bool { self.configs.len() == self.capacity }
    pub fn configs(&self) -> &[NetworkConfig] { &self.configs }
    pub fn config(&self, nnid: Nnid) -> Option<&NetworkConfig> {
        self.configs.get(nnid as usize)
    }
    pub fn io(&self) -> &IoRegion { &self.io }
    pub fn io_mut(&mut self) -> &mut IoRegion { &mut self.io }

    fn append(&mut self, config: NetworkConfig) -> Nnid {
        let nnid = self.configs.len() as Nnid;
        self.configs.push(config);
        nnid
    }
}

pub struct ConfigTable {
    entries: Vec<AddressSpaceEntry>,
    configs_per_space: usize,
}

impl ConfigTable {
    /// Creates a table with |num_address_spaces| empty rows, each able to
    /// hold |configs_per_space| configurations.
    pub fn new(num_address_spaces: usize, configs_per_space: usize) -> Self {
        ConfigTable {
            entries: (0..num_address_spaces)
                .map(|_| AddressSpaceEntry::new(configs_per_space))
                .collect(),
            configs_per_space,
        }
    }

    pub fn num_address_spaces(&self) -> usize { self.entries.len() }
    pub fn configs_per_space(&self) -> usize { self.configs_per_space }

    pub fn entry(&self, asid: Asid) -> Option<&AddressSpaceEntry> {
        self.entries.get(asid as usize)
    }
    pub fn entry_mut(&mut self, asid: Asid) -> Option<&mut AddressSpaceEntry> {
        self.entries.get_mut(asid as usize)
    }

    pub fn config(&self, asid: Asid, nnid: Nnid) -> Option<&NetworkConfig> {
        self.entry(asid)?.config(nnid)
    }

    /// Number of configurations attached to |asid| (0 if out of range).
    pub fn valid_count(&self, asid: Asid) -> usize {
        self.entry(asid).map_or(0, |e| e.valid_count())
    }

    // Returns the row for |asid| if another configuration fits in it.
    fn writable_entry(&mut self, asid: Asid) -> Result<&mut AddressSpaceEntry, TableError> {
        let entry = self
            .entries
            .get_mut(asid as usize)
            .ok_or(TableError::AddressSpaceOutOfRange)?;
        if entry.is_full() {
            return Err(TableError::CapacityExceeded);
        }
        Ok(entry)
    }

    /// Reads a configuration blob from |source| into a block-aligned buffer
    /// and attaches it to |asid|. A trailing partial word is zero-padded.
    pub fn attach_from_source<S: ConfigSource + ?Sized>(
        &mut self,
        asid: Asid,
        source: &mut S,
    ) -> Result<Nnid, TableError> {
        let entry = self.writable_entry(asid)?;

        let mut bytes = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let count = source.read(&mut chunk).map_err(|_| {
                error!("asid {}: configuration source read failed", asid);
                TableError::SourceUnreadable
            })?;
            if count == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..count]);
        }
        if bytes.is_empty() {
            return Err(TableError::EmptyConfiguration);
        }

        let mut words = Vec::with_capacity(words_for_bytes(bytes.len()));
        for chunk in bytes.chunks(WORD_BYTES) {
            let mut word = [0u8; WORD_BYTES];
            word[..chunk.len()].copy_from_slice(chunk);
            words.push(u64::from_le_bytes(word));
        }
        Ok(Self::append_words(entry, asid, &words))
    }

    /// Attaches a configuration already resident in memory; the words are
    /// copied.
    pub fn attach_from_buffer(&mut self, asid: Asid, words: &[u64]) -> Result<Nnid, TableError> {
        let entry = self.writable_entry(asid)?;
        if words.is_empty() {
            return Err(TableError::EmptyConfiguration);
        }
        Ok(Self::append_words(entry, asid, words))
    }

    /// Attaches a zero-sized entry with no buffer. Only useful to provoke
    /// the engine's zero-size rejection.
    pub fn attach_placeholder(&mut self, asid: Asid) -> Result<Nnid, TableError> {
        let entry = self.writable_entry(asid)?;
        let nnid = entry.append(NetworkConfig::placeholder());
        trace!("asid {} nnid {}: placeholder", asid, nnid);
        Ok(nnid)
    }

    fn append_words(entry: &mut AddressSpaceEntry, asid: Asid, words: &[u64]) -> Nnid {
        let config = NetworkConfig::from_words(words);
        trace!(
            "asid {}: {} words, {} elements/block at {:#x?}",
            asid,
            config.size(),
            config.elements_per_block(),
            config.handle()
        );
        entry.append(config)
    }

    /// Releases every configuration buffer and I/O region.
    pub fn destroy(self) {
        trace!(
            "destroy table: {} address spaces, {} configurations",
            self.entries.len(),
            self.entries.iter().map(|e| e.valid_count()).sum::<usize>()
        );
    }

    pub fn debug_state(&self) {
        info!(
            target: "",
            "Config table: {} address spaces x {} configurations",
            self.entries.len(),
            self.configs_per_space
        );
        for (asid, entry) in self.entries.iter().enumerate() {
            info!(target: "", "  asid {}: {}/{} valid", asid, entry.valid_count(), entry.capacity());
            for (nnid, config) in entry.configs().iter().enumerate() {
                match config.handle() {
                    Some(handle) => info!(
                        target: "",
                        "    nnid {}: {} words, {} elements/block @ {:#x}",
                        nnid,
                        config.size(),
                        config.elements_per_block(),
                        handle
                    ),
                    None => info!(target: "", "    nnid {}: placeholder", nnid),
                }
            }
            info!(
                target: "",
                "    io: status {:#x} input {}/{} output {}/{}",
                entry.io().status,
                entry.io().input.len(),
                IO_QUEUE_DEPTH,
                entry.io().output.len(),
                IO_QUEUE_DEPTH
            );
        }
    }
}

#[cfg(feature = "std")]
impl ConfigTable {
    /// Attaches the configuration stored in the file at |path|.
    pub fn attach_from_path<P: AsRef<std::path::Path>>(
        &mut self,
        asid: Asid,
        path: P,
    ) -> Result<Nnid, TableError> {
        // Check the row first so a bad asid is reported as such.
        self.writable_entry(asid)?;
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            error!("{}: {}", path.as_ref().display(), e);
            TableError::SourceUnreadable
        })?;
        self.attach_from_source(asid, &mut StdSource(file))
    }
}
