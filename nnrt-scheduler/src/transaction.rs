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

use alloc::vec::Vec;
use nnrt_shared::{Element, LearningMode, Nnid, Register, Tid};

/// One unit of work for the scheduler: a network, the element stream to
/// feed it and room for its outputs.
#[derive(Clone, Debug)]
pub struct Transaction {
    nnid: Nnid,
    mode: LearningMode,
    stream: Vec<Element>,
    train_outputs: usize,
    registers: Vec<(Register, u32)>,
    output_count: usize,
    outputs: Vec<Element>,
    tid: Option<Tid>,
}

impl Transaction {
    fn new(nnid: Nnid, mode: LearningMode, stream: Vec<Element>, output_count: usize) -> Self {
        Transaction {
            nnid,
            mode,
            stream,
            train_outputs: 0,
            registers: Vec::new(),
            output_count,
            outputs: Vec::with_capacity(output_count),
            tid: None,
        }
    }

    pub fn feedforward(nnid: Nnid, inputs: &[Element], output_count: usize) -> Self {
        Transaction::new(nnid, LearningMode::Feedforward, inputs.to_vec(), output_count)
    }

    /// Expected outputs are streamed ahead of the inputs.
    pub fn train_incremental(nnid: Nnid, inputs: &[Element], expected_outputs: &[Element]) -> Self {
        let mut stream = Vec::with_capacity(expected_outputs.len() + inputs.len());
        stream.extend_from_slice(expected_outputs);
        stream.extend_from_slice(inputs);
        let mut transaction = Transaction::new(
            nnid,
            LearningMode::TrainIncremental,
            stream,
            expected_outputs.len(),
        );
        transaction.train_outputs = expected_outputs.len();
        transaction
    }

    pub fn train_batch(nnid: Nnid, inputs: &[Element], output_count: usize) -> Self {
        Transaction::new(nnid, LearningMode::TrainBatch, inputs.to_vec(), output_count)
    }

    /// Queues a register write ahead of the first data element.
    pub fn with_register(mut self, register: Register, value: u32) -> Self {
        self.registers.push((register, value));
        self
    }

    pub fn nnid(&self) -> Nnid { self.nnid }
    pub fn mode(&self) -> LearningMode { self.mode }
    pub fn stream(&self) -> &[Element] { &self.stream }
    pub fn train_outputs(&self) -> usize { self.train_outputs }
    pub fn registers(&self) -> &[(Register, u32)] { &self.registers }
    pub fn output_count(&self) -> usize { self.output_count }
    pub fn outputs(&self) -> &[Element] { &self.outputs }

    /// TID the engine assigned on the last run, if it got that far.
    pub fn tid(&self) -> Option<Tid> { self.tid }

    pub fn is_complete(&self) -> bool { self.outputs.len() == self.output_count }

    pub(crate) fn input_count(&self) -> usize { self.stream.len() - self.train_outputs }

    pub(crate) fn reset(&mut self) {
        self.outputs.clear();
        self.tid = None;
    }

    pub(crate) fn set_tid(&mut self, tid: Tid) { self.tid = Some(tid); }

    pub(crate) fn push_output(&mut self, value: Element) { self.outputs.push(value); }
}
