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

//! Block-aligned network configuration storage.

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::mem::{align_of, size_of};
use nnrt_shared::{round_up, WORD_BYTES};
use static_assertions::const_assert_eq;

/// Block-transfer granularity of the engine's memory port (one L2 line).
/// Configuration buffers start on this boundary.
pub const BLOCK_BYTES: usize = 128;

const WORDS_PER_BLOCK: usize = BLOCK_BYTES / WORD_BYTES;

#[repr(C, align(128))]
#[derive(Clone, Copy)]
struct Block([u64; WORDS_PER_BLOCK]);

// Block must be exactly one padding-free transfer unit.
const_assert_eq!(size_of::<Block>(), BLOCK_BYTES);
const_assert_eq!(align_of::<Block>(), BLOCK_BYTES);

/// Owned, block-aligned copy of a configuration blob. The engine is handed
/// the buffer's [handle](ConfigBuffer::handle); nothing else about the
/// memory leaks out.
pub struct ConfigBuffer {
    blocks: Vec<Block>,
    len: usize, // in words
}

impl ConfigBuffer {
    pub fn from_words(words: &[u64]) -> Self {
        let num_blocks = round_up(words.len(), WORDS_PER_BLOCK) / WORDS_PER_BLOCK;
        let mut buffer = ConfigBuffer {
            blocks: vec![Block([0; WORDS_PER_BLOCK]); num_blocks],
            len: words.len(),
        };
        buffer.words_mut().copy_from_slice(words);
        buffer
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn words(&self) -> &[u64] {
        debug_assert!(self.len <= self.blocks.len() * WORDS_PER_BLOCK);
        // SAFETY: `blocks` is one allocation of padding-free `[u64;
        // WORDS_PER_BLOCK]` arrays (asserted above the type), so it is a
        // contiguous, initialized, u64-aligned run of
        // `blocks.len() * WORDS_PER_BLOCK` words. `from_words` sizes `blocks`
        // by rounding `len` up to whole blocks and neither field changes
        // afterwards, so `len <= blocks.len() * WORDS_PER_BLOCK` holds and the
        // slice stays in bounds. The borrow of `self` keeps `blocks` alive.
        unsafe { core::slice::from_raw_parts(self.blocks.as_ptr().cast::<u64>(), self.len) }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        debug_assert!(self.len <= self.blocks.len() * WORDS_PER_BLOCK);
        // SAFETY: as in `words`; the exclusive borrow of `self` makes this
        // the only live view of `blocks`.
        unsafe { core::slice::from_raw_parts_mut(self.blocks.as_mut_ptr().cast::<u64>(), self.len) }
    }

    /// Engine-visible address of the first word.
    pub fn handle(&self) -> usize { self.blocks.as_ptr() as usize }
}

impl fmt::Debug for ConfigBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConfigBuffer {{ handle: {:#x}, words: {} }}", self.handle(), self.len)
    }
}

/// Decodes the elements-per-block field, bits [5:4] of the header word.
pub fn elements_per_block(header: u64) -> usize { 1 << (((header >> 4) & 0x3) + 2) }

/// One attached network.
#[derive(Debug)]
pub struct NetworkConfig {
    size: usize,
    elements_per_block: usize,
    buffer: Option<ConfigBuffer>,
}

impl NetworkConfig {
    pub(crate) fn from_words(words: &[u64]) -> Self {
        NetworkConfig {
            size: words.len(),
            elements_per_block: elements_per_block(words[0]),
            buffer: Some(ConfigBuffer::from_words(words)),
        }
    }

    /// A zero-sized entry with no backing memory. Opening a transaction on
    /// it makes the engine fail fast, which is what fault-injection wants.
    pub(crate) fn placeholder() -> Self {
        NetworkConfig {
            size: 0,
            elements_per_block: 0,
            buffer: None,
        }
    }

    /// Size in 64-bit words.
    pub fn size(&self) -> usize { self.size }

    /// Zero for placeholders.
    pub fn elements_per_block(&self) -> usize { self.elements_per_block }

    pub fn is_placeholder(&self) -> bool { self.buffer.is_none() }

    pub fn words(&self) -> &[u64] {
        match &self.buffer {
            Some(buffer) => buffer.words(),
            None => &[],
        }
    }

    pub fn handle(&self) -> Option<usize> { self.buffer.as_ref().map(|b| b.handle()) }
}
