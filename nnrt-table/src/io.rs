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

//! Per-address-space I/O region: a status word and a pair of bounded word
//! queues the engine uses for memory-mapped transfers.

use alloc::collections::VecDeque;

pub const IO_QUEUE_DEPTH: usize = 16;

/// FIFO holding at most [IO_QUEUE_DEPTH] words.
#[derive(Debug, Default, PartialEq)]
pub struct IoQueue(VecDeque<u64>);

impl IoQueue {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn is_full(&self) -> bool { self.0.len() == IO_QUEUE_DEPTH }

    /// Hands |word| back when the queue is full.
    pub fn push(&mut self, word: u64) -> Result<(), u64> {
        if self.is_full() {
            return Err(word);
        }
        self.0.push_back(word);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u64> { self.0.pop_front() }
}

#[derive(Debug, Default, PartialEq)]
pub struct IoRegion {
    pub status: u64,
    pub input: IoQueue,
    pub output: IoQueue,
}
