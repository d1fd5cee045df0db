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

//! Single-transaction protocol on top of a [Channel]: open, register and
//! data writes with backpressure retries, and output reads.
//!
//! Transient exit codes (QueueBusy on writes, NotDone on reads) reissue the
//! identical request; a retried write never advances the caller's cursor.
//! Every other non-Ok code is returned as `ClientError::Engine` untouched.
//! A bare Ok answer to an open or a read means the engine will deliver the
//! TID assignment or data word later; the blocking calls step the engine
//! until it shows up. Retry and wait loops give up after
//! `ClientConfig::retry_limit` attempts.

extern crate alloc;

use alloc::vec::Vec;
use log::{info, trace, warn};
use nnrt_interface::{Channel, ClientError, EngineId, ExitCode, Request, Response, ResponseKind};
use nnrt_shared::{Element, LearningMode, Nnid, Register, Tid};

#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// Attempts per element before a transient code becomes
    /// `RetryLimitExceeded`.
    pub retry_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self { Self { retry_limit: 1 << 16 } }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStatus {
    Accepted,
    /// Queue full; nothing was consumed.
    Busy,
}

/// Outcome of one read attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadStatus {
    /// The TID-tagged data response.
    Data(Response),
    /// Read taken; the data response arrives through
    /// [poll_response](TransactionClient::poll_response).
    Deferred,
    NotDone,
}

/// Statistics on non-happy-path events.
#[derive(Debug, Default)]
pub struct Statistics {
    pub busy_retries: u64,
    pub not_done_polls: u64,
    pub fatal_codes: u64,
    pub deferred_responses: u64,
}

/// Outcome of [TransactionClient::run_compare].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompareReport {
    pub samples: usize,
    pub mismatches: usize,
    pub first_mismatch: Option<usize>,
}

pub struct TransactionClient<C: Channel> {
    channel: C,
    config: ClientConfig,
    statistics: Statistics,
}

impl<C: Channel> TransactionClient<C> {
    pub fn new(channel: C) -> Self { Self::with_config(channel, ClientConfig::default()) }

    pub fn with_config(channel: C, config: ClientConfig) -> Self {
        TransactionClient {
            channel,
            config,
            statistics: Statistics::default(),
        }
    }

    pub fn channel(&self) -> &C { &self.channel }
    pub fn channel_mut(&mut self) -> &mut C { &mut self.channel }
    pub fn into_inner(self) -> C { self.channel }
    pub fn config(&self) -> &ClientConfig { &self.config }
    pub fn statistics(&self) -> &Statistics { &self.statistics }

    fn issue(&mut self, request: Request) -> Response {
        let response = self.channel.issue(request);
        trace!("{:?} -> {:?}", request, response);
        response
    }

    // Maps a non-transient code to its error, counting it.
    fn fatal(&mut self, code: ExitCode) -> ClientError {
        self.statistics.fatal_codes += 1;
        warn!("engine returned {:?}", code);
        ClientError::Engine(code)
    }

    /// Capability query; K is `transaction_table_entries`.
    pub fn engine_id(&mut self) -> EngineId { self.channel.engine_id() }

    pub fn is_done(&mut self, tid: Tid) -> bool { self.channel.is_done(tid) }

    /// Lets the engine run one step with nothing presented.
    pub fn idle(&mut self) { self.channel.step() }

    /// Takes the oldest response the engine delivered on its own time.
    pub fn poll_response(&mut self) -> Option<Response> {
        let response = self.channel.poll_response()?;
        trace!("deferred {:?}", response);
        self.statistics.deferred_responses += 1;
        Some(response)
    }

    // Steps the engine until a deferred response arrives.
    fn await_deferred(&mut self) -> Result<Response, ClientError> {
        for _ in 0..self.config.retry_limit {
            if let Some(response) = self.poll_response() {
                return match response.exit_code() {
                    ExitCode::Ok => Ok(response),
                    code => Err(self.fatal(code)),
                };
            }
            self.channel.step();
        }
        warn!("no deferred response after {} steps", self.config.retry_limit);
        Err(ClientError::RetryLimitExceeded)
    }

    /// Issues a new-transaction request and returns the engine's immediate
    /// answer: the TID assignment, or a bare Ok status when the assignment
    /// is deferred. Never retried.
    pub fn issue_open(
        &mut self,
        nnid: Nnid,
        mode: LearningMode,
        train_outputs: u16,
    ) -> Result<Response, ClientError> {
        let response = self.issue(Request::new_transaction(nnid, mode, train_outputs));
        match response.exit_code() {
            ExitCode::Ok => Ok(response),
            code => Err(self.fatal(code)),
        }
    }

    /// Opens a transaction on |nnid| and returns its TID. |train_outputs|
    /// is the number of expected outputs leading the stream (incremental
    /// training only).
    pub fn open(
        &mut self,
        nnid: Nnid,
        mode: LearningMode,
        train_outputs: u16,
    ) -> Result<Tid, ClientError> {
        let mut response = self.issue_open(nnid, mode, train_outputs)?;
        if response.response_kind() == Some(ResponseKind::Status) {
            response = self.await_deferred()?;
        }
        match response.response_kind() {
            Some(ResponseKind::Tid) => Ok(response.tid()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a per-transaction register. Must precede the first data write.
    pub fn write_register(
        &mut self,
        tid: Tid,
        register: Register,
        value: u32,
    ) -> Result<(), ClientError> {
        match self.issue(Request::write_register(tid, register, value)).exit_code() {
            ExitCode::Ok => Ok(()),
            code => Err(self.fatal(code)),
        }
    }

    /// One write attempt. Busy means the element was not taken and the same
    /// write must be presented again.
    pub fn try_write(
        &mut self,
        tid: Tid,
        value: Element,
        is_last: bool,
    ) -> Result<WriteStatus, ClientError> {
        match self.issue(Request::write_data(tid, value, is_last)).exit_code() {
            ExitCode::Ok => Ok(WriteStatus::Accepted),
            ExitCode::QueueBusy => {
                self.statistics.busy_retries += 1;
                Ok(WriteStatus::Busy)
            }
            code => Err(self.fatal(code)),
        }
    }

    /// Writes one element, retrying while the input queue is full. |is_last|
    /// starts execution.
    pub fn write(&mut self, tid: Tid, value: Element, is_last: bool) -> Result<(), ClientError> {
        for _ in 0..self.config.retry_limit {
            if self.try_write(tid, value, is_last)? == WriteStatus::Accepted {
                return Ok(());
            }
        }
        warn!("tid {}: input queue stayed full for {} attempts", tid, self.config.retry_limit);
        Err(ClientError::RetryLimitExceeded)
    }

    /// Writes |values| without the last flag, so execution does not start.
    pub fn write_sequence_except_last(
        &mut self,
        tid: Tid,
        values: &[Element],
    ) -> Result<(), ClientError> {
        for value in values {
            self.write(tid, *value, false)?;
        }
        Ok(())
    }

    pub fn write_last(&mut self, tid: Tid, value: Element) -> Result<(), ClientError> {
        self.write(tid, value, true)
    }

    /// Writes the whole input stream, flagging the final element.
    pub fn write_all(&mut self, tid: Tid, values: &[Element]) -> Result<(), ClientError> {
        let (last, rest) = values.split_last().ok_or(ClientError::EmptyInput)?;
        self.write_sequence_except_last(tid, rest)?;
        self.write_last(tid, *last)
    }

    /// Incremental training stream: expected outputs first, then inputs.
    pub fn write_train_incremental(
        &mut self,
        tid: Tid,
        inputs: &[Element],
        expected_outputs: &[Element],
    ) -> Result<(), ClientError> {
        if inputs.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        self.write_sequence_except_last(tid, expected_outputs)?;
        self.write_all(tid, inputs)
    }

    /// One read attempt.
    pub fn try_read(&mut self, tid: Tid) -> Result<ReadStatus, ClientError> {
        let response = self.issue(Request::read_data(tid));
        match response.exit_code() {
            ExitCode::Ok => match response.response_kind() {
                Some(ResponseKind::Data) => Ok(ReadStatus::Data(response)),
                Some(ResponseKind::Status) => Ok(ReadStatus::Deferred),
                _ => Err(ClientError::UnexpectedResponse),
            },
            ExitCode::NotDone => {
                self.statistics.not_done_polls += 1;
                Ok(ReadStatus::NotDone)
            }
            code => Err(self.fatal(code)),
        }
    }

    /// Reads |count| outputs of |tid|, polling through NotDone.
    pub fn read(&mut self, tid: Tid, count: usize) -> Result<Vec<Element>, ClientError> {
        let mut outputs = Vec::with_capacity(count);
        let mut attempts = 0;
        while outputs.len() < count {
            if attempts == self.config.retry_limit {
                warn!("tid {}: output {} not ready after {} polls", tid, outputs.len(), attempts);
                return Err(ClientError::RetryLimitExceeded);
            }
            let response = match self.try_read(tid)? {
                ReadStatus::Data(response) => response,
                ReadStatus::Deferred => self.await_deferred()?,
                ReadStatus::NotDone => {
                    attempts += 1;
                    continue;
                }
            };
            if response.response_kind() != Some(ResponseKind::Data) || response.tid() != tid {
                return Err(ClientError::UnexpectedResponse);
            }
            outputs.push(response.element());
            attempts = 0;
        }
        Ok(outputs)
    }

    /// Transactions cannot be cancelled once opened.
    pub fn kill(&mut self, tid: Tid) -> Result<(), ClientError> {
        warn!("tid {}: cancellation is not supported", tid);
        Err(ClientError::CancellationUnsupported)
    }

    /// Runs |inputs| through |nnid| and returns |output_count| outputs.
    pub fn feedforward(
        &mut self,
        nnid: Nnid,
        inputs: &[Element],
        output_count: usize,
    ) -> Result<Vec<Element>, ClientError> {
        if inputs.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let tid = self.open(nnid, LearningMode::Feedforward, 0)?;
        self.write_all(tid, inputs)?;
        self.read(tid, output_count)
    }

    /// One incremental training step; returns the outputs the network
    /// produced for |inputs| before the update.
    pub fn train_incremental(
        &mut self,
        nnid: Nnid,
        inputs: &[Element],
        expected_outputs: &[Element],
    ) -> Result<Vec<Element>, ClientError> {
        if inputs.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let train_outputs =
            u16::try_from(expected_outputs.len()).map_err(|_| ClientError::TooManyOutputs)?;
        let tid = self.open(nnid, LearningMode::TrainIncremental, train_outputs)?;
        self.write_train_incremental(tid, inputs, expected_outputs)?;
        self.read(tid, expected_outputs.len())
    }

    /// Feeds every sample through |nnid| and compares against |expected|.
    /// |inputs| and |expected| hold samples back to back; samples without a
    /// full counterpart are ignored.
    pub fn run_compare(
        &mut self,
        nnid: Nnid,
        inputs: &[Element],
        expected: &[Element],
        num_inputs: usize,
        num_outputs: usize,
    ) -> Result<CompareReport, ClientError> {
        if num_inputs == 0 || num_outputs == 0 {
            return Err(ClientError::EmptyInput);
        }
        let mut report = CompareReport::default();
        for (index, (sample, want)) in inputs
            .chunks_exact(num_inputs)
            .zip(expected.chunks_exact(num_outputs))
            .enumerate()
        {
            let got = self.feedforward(nnid, sample, num_outputs)?;
            if got != want {
                trace!("sample {}: got {:?} expected {:?}", index, got, want);
                report.mismatches += 1;
                report.first_mismatch.get_or_insert(index);
            }
            report.samples += 1;
        }
        Ok(report)
    }

    /// Feedforward over many samples, keeping the engine full: up to K
    /// transactions are opened and written up to their last element, then
    /// started back to back and drained in order.
    pub fn feedforward_primed(
        &mut self,
        nnid: Nnid,
        samples: &[&[Element]],
        output_count: usize,
    ) -> Result<Vec<Vec<Element>>, ClientError> {
        if samples.iter().any(|s| s.is_empty()) {
            return Err(ClientError::EmptyInput);
        }
        let k = (self.engine_id().transaction_table_entries() as usize).max(1);
        let mut outputs = Vec::with_capacity(samples.len());
        for batch in samples.chunks(k) {
            let mut primed = Vec::with_capacity(batch.len());
            for sample in batch {
                let tid = self.open(nnid, LearningMode::Feedforward, 0)?;
                let (last, rest) = sample.split_last().ok_or(ClientError::EmptyInput)?;
                self.write_sequence_except_last(tid, rest)?;
                primed.push((tid, *last));
            }
            for (tid, last) in &primed {
                self.write_last(*tid, *last)?;
            }
            for (tid, _) in &primed {
                outputs.push(self.read(*tid, output_count)?);
            }
        }
        Ok(outputs)
    }

    pub fn debug_state(&self) {
        info!(target: "", "Transaction client: {:?}", self.config);
        info!(target: "", "{:?}", self.statistics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;

    /// Replays canned responses and records what was asked. Deferred
    /// responses become pollable once the channel has stepped the given
    /// number of times.
    #[derive(Default)]
    struct ScriptedChannel {
        responses: VecDeque<Response>,
        deferred: VecDeque<(usize, Response)>,
        requests: Vec<Request>,
        steps: usize,
    }

    impl ScriptedChannel {
        fn with(responses: &[Response]) -> Self {
            ScriptedChannel {
                responses: responses.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn deferring(mut self, deferred: &[(usize, Response)]) -> Self {
            self.deferred = deferred.iter().copied().collect();
            self
        }
    }

    impl Channel for ScriptedChannel {
        fn issue(&mut self, request: Request) -> Response {
            self.requests.push(request);
            self.responses
                .pop_front()
                .unwrap_or_else(|| Response::status(ExitCode::BadRequest))
        }
        fn step(&mut self) { self.steps += 1; }
        fn poll_response(&mut self) -> Option<Response> {
            match self.deferred.front() {
                Some((after, _)) if *after <= self.steps => self.deferred.pop_front().map(|(_, r)| r),
                _ => None,
            }
        }
        fn engine_id(&mut self) -> EngineId { EngineId::new().with_transaction_table_entries(2) }
        fn is_done(&mut self, _tid: Tid) -> bool { true }
    }

    fn ok() -> Response { Response::status(ExitCode::Ok) }
    fn busy() -> Response { Response::status(ExitCode::QueueBusy) }
    fn not_done() -> Response { Response::status(ExitCode::NotDone) }

    #[test]
    fn open_returns_assigned_tid() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[Response::tid_assigned(0, 41)]));
        assert_eq!(client.open(3, LearningMode::TrainBatch, 0), Ok(41));
        let request = client.channel().requests[0];
        assert_eq!(request.new_request().nnid(), 3);
        assert_eq!(request.new_request().mode(), 2);
    }

    #[test]
    fn open_is_not_retried() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[busy(), Response::tid_assigned(0, 1)]));
        assert_eq!(
            client.open(0, LearningMode::Feedforward, 0),
            Err(ClientError::Engine(ExitCode::QueueBusy))
        );
        assert_eq!(client.channel().requests.len(), 1);
    }

    #[test]
    fn open_rejects_wrong_response_kind() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[Response::data_out(0, 1, 1)]));
        assert_eq!(
            client.open(0, LearningMode::Feedforward, 0),
            Err(ClientError::UnexpectedResponse)
        );
    }

    #[test]
    fn open_waits_for_deferred_tid() {
        let channel = ScriptedChannel::with(&[ok()]).deferring(&[(3, Response::tid_assigned(0, 12))]);
        let mut client = TransactionClient::new(channel);
        assert_eq!(client.open(0, LearningMode::Feedforward, 0), Ok(12));
        assert_eq!(client.channel().steps, 3);
        assert_eq!(client.channel().requests.len(), 1);
        assert_eq!(client.statistics().deferred_responses, 1);
    }

    #[test]
    fn deferred_tid_that_never_arrives() {
        let config = ClientConfig { retry_limit: 4 };
        let mut client = TransactionClient::with_config(ScriptedChannel::with(&[ok()]), config);
        assert_eq!(
            client.open(0, LearningMode::Feedforward, 0),
            Err(ClientError::RetryLimitExceeded)
        );
        assert_eq!(client.channel().steps, 4);
    }

    #[test]
    fn busy_write_reissues_identical_request() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[busy(), busy(), ok(), ok()]));
        client.write_all(5, &[10, 20]).unwrap();
        let requests = &client.channel().requests;
        assert_eq!(requests.len(), 4);
        // The first element went out three times, bit for bit.
        assert_eq!(requests[0], requests[1]);
        assert_eq!(requests[1], requests[2]);
        assert_eq!(requests[2], Request::write_data(5, 10, false));
        assert_eq!(requests[3], Request::write_data(5, 20, true));
        assert_eq!(client.statistics().busy_retries, 2);
    }

    #[test]
    fn write_gives_up_after_retry_limit() {
        let config = ClientConfig { retry_limit: 3 };
        let mut client =
            TransactionClient::with_config(ScriptedChannel::with(&[busy(), busy(), busy(), ok()]), config);
        assert_eq!(client.write(1, 1, true), Err(ClientError::RetryLimitExceeded));
        assert_eq!(client.channel().requests.len(), 3);
    }

    #[test]
    fn fatal_write_code_passes_through() {
        let mut client =
            TransactionClient::new(ScriptedChannel::with(&[ok(), Response::status(ExitCode::InvalidNetworkId)]));
        assert_eq!(
            client.write_all(1, &[1, 2, 3]),
            Err(ClientError::Engine(ExitCode::InvalidNetworkId))
        );
        assert_eq!(client.channel().requests.len(), 2);
        assert_eq!(client.statistics().fatal_codes, 1);
    }

    #[test]
    fn empty_stream_is_rejected_before_issuing() {
        let mut client = TransactionClient::new(ScriptedChannel::default());
        assert_eq!(client.write_all(1, &[]), Err(ClientError::EmptyInput));
        assert_eq!(client.write_train_incremental(1, &[], &[1]), Err(ClientError::EmptyInput));
        assert!(client.channel().requests.is_empty());
    }

    #[test]
    fn train_incremental_writes_expected_outputs_first() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[ok(); 4]));
        client.write_train_incremental(2, &[7, 8], &[100, 200]).unwrap();
        let values: Vec<(Element, bool)> = client
            .channel()
            .requests
            .iter()
            .map(|r| (r.element(), r.op() == Some(nnrt_interface::UserOp::WriteDataLast)))
            .collect();
        assert_eq!(values, [(100, false), (200, false), (7, false), (8, true)]);
    }

    #[test]
    fn read_polls_through_not_done() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[
            not_done(),
            not_done(),
            Response::data_out(0, 4, -1),
            not_done(),
            Response::data_out(0, 4, 9),
        ]));
        assert_eq!(client.read(4, 2), Ok(vec![-1, 9]));
        assert_eq!(client.statistics().not_done_polls, 3);
        assert!(client.channel().requests.iter().all(|r| *r == Request::read_data(4)));
    }

    #[test]
    fn read_collects_deferred_data() {
        let channel = ScriptedChannel::with(&[not_done(), ok(), ok()])
            .deferring(&[(1, Response::data_out(0, 4, -1)), (1, Response::data_out(0, 4, 9))]);
        let mut client = TransactionClient::new(channel);
        assert_eq!(client.read(4, 2), Ok(vec![-1, 9]));
        assert_eq!(client.channel().requests.len(), 3);
        assert_eq!(client.statistics().deferred_responses, 2);
    }

    #[test]
    fn deferred_data_for_another_tid_is_rejected() {
        let channel = ScriptedChannel::with(&[ok()]).deferring(&[(0, Response::data_out(0, 5, 1))]);
        let mut client = TransactionClient::new(channel);
        assert_eq!(client.read(4, 1), Err(ClientError::UnexpectedResponse));
    }

    #[test]
    fn read_rejects_foreign_tid() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[Response::data_out(0, 8, 1)]));
        assert_eq!(client.read(4, 1), Err(ClientError::UnexpectedResponse));
    }

    #[test]
    fn read_retry_limit() {
        let config = ClientConfig { retry_limit: 2 };
        let mut client = TransactionClient::with_config(ScriptedChannel::with(&[not_done(); 5]), config);
        assert_eq!(client.read(1, 1), Err(ClientError::RetryLimitExceeded));
        assert_eq!(client.channel().requests.len(), 2);
    }

    #[test]
    fn register_write_layout() {
        let mut client = TransactionClient::new(ScriptedChannel::with(&[ok()]));
        client.write_register(6, Register::BatchItems, 32).unwrap();
        assert_eq!(client.channel().requests[0], Request::write_register(6, Register::BatchItems, 32));
    }

    #[test]
    fn kill_always_fails() {
        let mut client = TransactionClient::new(ScriptedChannel::default());
        assert_eq!(client.kill(0), Err(ClientError::CancellationUnsupported));
        assert!(client.channel().requests.is_empty());
    }

    #[test]
    fn idle_steps_the_engine() {
        let mut client = TransactionClient::new(ScriptedChannel::default());
        client.idle();
        client.idle();
        assert_eq!(client.channel().steps, 2);
        assert_eq!(client.engine_id().transaction_table_entries(), 2);
    }
}
