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

#![cfg_attr(not(test), no_std)]

// Types shared by the configuration table, the transaction client and the
// scheduler. Nothing in here talks to the engine.

use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod fixed;
pub mod params;

pub use params::EngineParams;
pub use params::ParamError;

/// Address-space identifier; selects a row of the configuration table.
pub type Asid = u16;

/// Network identifier; index of a configuration within an address space,
/// assigned in attachment order starting at 0.
pub type Nnid = u32;

/// Transaction identifier handed out by the engine when a transaction is
/// opened. Only meaningful until the transaction's outputs are drained.
pub type Tid = u16;

/// A single fixed-point data word exchanged with the engine.
pub type Element = i32;

/// Width of a configuration word in bytes.
pub const WORD_BYTES: usize = core::mem::size_of::<u64>();

/// How the engine treats a transaction's data stream.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum LearningMode {
    Feedforward = 0,
    /// Expected outputs precede the inputs in the stream.
    TrainIncremental = 1,
    TrainBatch = 2,
}
impl fmt::Display for LearningMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LearningMode::Feedforward => write!(f, "feedforward"),
            LearningMode::TrainIncremental => write!(f, "train-incremental"),
            LearningMode::TrainBatch => write!(f, "train-batch"),
        }
    }
}

/// Per-transaction engine registers written before the first data element.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Register {
    BatchItems = 0,
    LearningRate = 1,
    WeightDecayLambda = 2,
}

/// Number of whole configuration words needed to hold |bytes|.
pub fn words_for_bytes(bytes: usize) -> usize { round_up(bytes, WORD_BYTES) / WORD_BYTES }

pub fn round_up(a: usize, b: usize) -> usize {
    match a % b {
        0 => a,
        rem => a + (b - rem),
    }
}
