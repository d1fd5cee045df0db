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

//! Software stand-in for the neural-network engine.
//!
//! Implements the engine side of the instruction interface closely enough to
//! exercise the runtime: a K-entry transaction table, per-transaction input
//! queues drained through one shared port, a fixed execution latency, and
//! the engine's fatal checks on open. The "network" sums its inputs.
//!
//! By default every request is answered on the spot. The engine can also be
//! told to acknowledge opens and reads with a bare Ok and deliver the TID
//! assignment or data word later through [Channel::poll_response]; data
//! delays are per TID, so words for different transactions can overtake
//! each other.
//!
//! Network configurations follow a fake layout: word 0 is the usual header
//! (elements per block in bits [5:4]); the low 16 bits of word 1 give the
//! number of outputs. See [network_config].

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{info, trace, warn};
use nnrt_interface::{Channel, EngineId, ExitCode, Request, Response, ResponseKind, Supervisor, UserOp};
use nnrt_shared::{Asid, Element, EngineParams, LearningMode, Nnid, ParamError, Register, Tid};
use nnrt_table::ConfigTable;

/// Builds a configuration the fake engine accepts.
pub fn network_config(elements_per_block: usize, num_outputs: u16) -> Vec<u64> {
    let code = elements_per_block.trailing_zeros().saturating_sub(2) as u64 & 0x3;
    vec![code << 4, num_outputs as u64]
}

/// What the fake network produces for |inputs|.
pub fn expected_outputs(inputs: &[Element], num_outputs: usize) -> Vec<Element> {
    let sum = inputs.iter().fold(0 as Element, |acc, x| acc.wrapping_add(*x));
    (0..num_outputs).map(|i| sum.wrapping_add(i as Element)).collect()
}

#[derive(Debug, PartialEq)]
enum Phase {
    Writing,
    Executing(u64), // steps left
    Done,
}

#[derive(Debug)]
struct EngineTransaction {
    tid: Tid,
    nnid: Nnid,
    mode: LearningMode,
    train_outputs: usize,
    num_outputs: usize,
    registers: [Option<u32>; 3],
    queue: VecDeque<Element>,
    consumed: Vec<Element>,
    last_seen: bool,
    phase: Phase,
    outputs: VecDeque<Element>,
}

impl EngineTransaction {
    // Expected outputs lead the stream for incremental training.
    fn inputs(&self) -> &[Element] {
        match self.mode {
            LearningMode::TrainIncremental => &self.consumed[self.train_outputs.min(self.consumed.len())..],
            _ => &self.consumed,
        }
    }
}

/// Counters for test assertions.
#[derive(Debug, Default)]
pub struct Statistics {
    pub busy_responses: u32,
    pub not_done_responses: u32,
    pub fatal_responses: u32,
    pub peak_resident: usize,
    /// Most TID assignments produced but not yet delivered at once.
    pub peak_deferred_tids: usize,
}

pub struct FakeEngine {
    params: EngineParams,
    id: EngineId,
    table: Option<Arc<ConfigTable>>,
    asid: Option<Asid>,
    transactions: Vec<Option<EngineTransaction>>,
    next_tid: Tid,
    tid_stride: Tid,
    cycle: u64,
    input_queue_depth: usize,
    drain_interval: u64,
    latency: u64,
    forced_busy: u32,
    tid_delay: Option<u64>,
    data_delay: Option<fn(Tid) -> u64>,
    deferred: VecDeque<(u64, Response)>, // (due cycle, response)
    history: Vec<Request>,
    deliveries: Vec<Response>,
    statistics: Statistics,
}

impl FakeEngine {
    /// Fails when |params| cannot be reported through the capability word.
    pub fn new(params: EngineParams) -> Result<Self, ParamError> {
        let id = EngineId::try_from(&params)?;
        Ok(FakeEngine::build(params, id))
    }

    fn build(params: EngineParams, id: EngineId) -> Self {
        FakeEngine {
            transactions: (0..params.transaction_table_entries).map(|_| None).collect(),
            params,
            id,
            table: None,
            asid: None,
            next_tid: 0,
            tid_stride: 1,
            cycle: 0,
            input_queue_depth: 4,
            drain_interval: 1,
            latency: 2,
            forced_busy: 0,
            tid_delay: None,
            data_delay: None,
            deferred: VecDeque::new(),
            history: Vec::new(),
            deliveries: Vec::new(),
            statistics: Statistics::default(),
        }
    }

    /// Engine sized from a `(KEY,VALUE)` parameter file.
    pub fn from_parameter_file(text: &str) -> Result<Self, ParamError> {
        FakeEngine::new(EngineParams::parse(text)?)
    }

    /// Engine with |k| transaction-table entries and otherwise default
    /// parameters.
    pub fn with_capacity(k: u16) -> Self {
        let params = EngineParams {
            transaction_table_entries: k.into(),
            ..Default::default()
        };
        // Every default fits its capability field.
        let id = EngineId::new()
            .with_elements_per_block(4)
            .with_num_pes(4)
            .with_cache_entries(4)
            .with_transaction_table_entries(k);
        FakeEngine::build(params, id)
    }

    pub fn with_input_queue_depth(mut self, depth: usize) -> Self {
        self.input_queue_depth = depth;
        self
    }

    /// The shared input port moves one element every |interval| steps.
    pub fn with_drain_interval(mut self, interval: u64) -> Self {
        self.drain_interval = interval.max(1);
        self
    }

    /// Steps between the last input landing and outputs being readable.
    pub fn with_latency(mut self, steps: u64) -> Self {
        self.latency = steps;
        self
    }

    /// Spaces out assigned TIDs so they never line up with slot indices.
    pub fn with_tid_stride(mut self, stride: Tid) -> Self {
        self.tid_stride = stride.max(1);
        self
    }

    /// Opens are acknowledged with a bare Ok; the TID assignment follows
    /// |steps| steps later. Assignments keep their open order.
    pub fn with_deferred_tids(mut self, steps: u64) -> Self {
        self.tid_delay = Some(steps);
        self
    }

    /// Reads of finished transactions are acknowledged with a bare Ok; the
    /// data word for a TID follows |delay(tid)| steps later.
    pub fn with_deferred_data(mut self, delay: fn(Tid) -> u64) -> Self {
        self.data_delay = Some(delay);
        self
    }

    /// The next |count| data writes are refused with QueueBusy.
    pub fn force_busy(&mut self, count: u32) { self.forced_busy += count; }

    pub fn params(&self) -> &EngineParams { &self.params }
    pub fn cycle(&self) -> u64 { self.cycle }
    pub fn history(&self) -> &[Request] { &self.history }
    /// Deferred responses, in the order they were handed out.
    pub fn deliveries(&self) -> &[Response] { &self.deliveries }
    pub fn statistics(&self) -> &Statistics { &self.statistics }

    /// Transactions currently held in the transaction table.
    pub fn resident(&self) -> usize { self.transactions.iter().flatten().count() }

    /// Register values written to |tid|, by register number.
    pub fn registers(&self, tid: Tid) -> Option<[Option<u32>; 3]> {
        self.find(tid).map(|t| t.registers)
    }

    fn find(&self, tid: Tid) -> Option<&EngineTransaction> {
        self.transactions.iter().flatten().find(|t| t.tid == tid)
    }

    fn find_mut(&mut self, tid: Tid) -> Option<&mut EngineTransaction> {
        self.transactions.iter_mut().flatten().find(|t| t.tid == tid)
    }

    fn tick(&mut self) {
        self.cycle += 1;
        if self.cycle % self.drain_interval == 0 {
            // One shared input port: the first transaction with queued input
            // gets it this step.
            if let Some(t) = self
                .transactions
                .iter_mut()
                .flatten()
                .find(|t| !t.queue.is_empty())
            {
                if let Some(element) = t.queue.pop_front() {
                    t.consumed.push(element);
                }
            }
        }
        let latency = self.latency;
        for t in self.transactions.iter_mut().flatten() {
            match t.phase {
                Phase::Writing if t.last_seen && t.queue.is_empty() => {
                    t.phase = Phase::Executing(latency);
                }
                Phase::Executing(0) => {
                    t.outputs = expected_outputs(t.inputs(), t.num_outputs).into();
                    t.phase = Phase::Done;
                    trace!("tid {} done at cycle {}", t.tid, self.cycle);
                }
                Phase::Executing(left) => t.phase = Phase::Executing(left - 1),
                _ => {}
            }
        }
    }

    fn active_asid(&self) -> Asid { self.asid.unwrap_or(0) }

    // A TID stays taken while a response carrying it is undelivered.
    fn allocate_tid(&mut self) -> Tid {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(self.tid_stride);
            if self.find(tid).is_none() && !self.deferred.iter().any(|(_, r)| r.tid() == tid) {
                return tid;
            }
        }
    }

    // Answers on the spot, or queues |response| and acknowledges with Ok.
    fn respond(&mut self, response: Response, delay: Option<u64>) -> Response {
        match delay {
            Some(steps) => {
                self.deferred.push_back((self.cycle + steps, response));
                Response::status(ExitCode::Ok)
            }
            None => response,
        }
    }

    fn open(&mut self, request: &Request) -> Result<Response, ExitCode> {
        let payload = request.new_request();
        let nnid = payload.nnid();
        let (asid, table) = match (self.asid, self.table.as_ref()) {
            (Some(asid), Some(table)) => (asid, table),
            _ => return Err(ExitCode::NoActiveAddressSpace),
        };
        let entry = table.entry(asid).ok_or(ExitCode::NoActiveAddressSpace)?;
        let config = entry.config(nnid).ok_or(ExitCode::InvalidNetworkId)?;
        if config.size() == 0 {
            return Err(ExitCode::ZeroSizeNetwork);
        }
        if config.elements_per_block() != self.params.elements_per_block {
            return Err(ExitCode::InvalidBlockEncoding);
        }
        let num_outputs = config.words().get(1).map_or(1, |w| (w & 0xffff) as usize);
        let mode = LearningMode::try_from(payload.mode()).map_err(|_| ExitCode::BadRequest)?;
        let index = self
            .transactions
            .iter()
            .position(|t| t.is_none())
            .ok_or(ExitCode::BadRequest)?;

        let tid = self.allocate_tid();
        self.transactions[index] = Some(EngineTransaction {
            tid,
            nnid,
            mode,
            train_outputs: payload.train_outputs() as usize,
            num_outputs,
            registers: [None; 3],
            queue: VecDeque::new(),
            consumed: Vec::new(),
            last_seen: false,
            phase: Phase::Writing,
            outputs: VecDeque::new(),
        });
        self.statistics.peak_resident = self.statistics.peak_resident.max(self.resident());
        trace!("open nnid {} ({}) -> tid {}", nnid, mode, tid);
        let response = self.respond(Response::tid_assigned(asid, tid), self.tid_delay);
        let deferred_tids = self
            .deferred
            .iter()
            .filter(|(_, r)| r.response_kind() == Some(ResponseKind::Tid))
            .count();
        self.statistics.peak_deferred_tids = self.statistics.peak_deferred_tids.max(deferred_tids);
        Ok(response)
    }

    fn write_register(&mut self, request: &Request) -> Result<Response, ExitCode> {
        let payload = request.register();
        let register = Register::try_from(payload.register()).map_err(|_| ExitCode::BadRequest)?;
        let t = self.find_mut(request.tid()).ok_or(ExitCode::BadRequest)?;
        if t.phase != Phase::Writing || t.last_seen {
            return Err(ExitCode::BadRequest);
        }
        t.registers[u32::from(register) as usize] = Some(payload.value());
        Ok(Response::status(ExitCode::Ok))
    }

    fn write(&mut self, request: &Request, is_last: bool) -> Result<Response, ExitCode> {
        let t = self.find(request.tid()).ok_or(ExitCode::BadRequest)?;
        if t.phase != Phase::Writing || t.last_seen {
            return Err(ExitCode::BadRequest);
        }
        let queue_full = t.queue.len() >= self.input_queue_depth;
        if self.forced_busy > 0 || queue_full {
            self.forced_busy = self.forced_busy.saturating_sub(1);
            self.statistics.busy_responses += 1;
            return Ok(Response::status(ExitCode::QueueBusy));
        }
        let t = self.find_mut(request.tid()).ok_or(ExitCode::BadRequest)?;
        t.queue.push_back(request.element());
        t.last_seen = is_last;
        Ok(Response::status(ExitCode::Ok))
    }

    fn read(&mut self, request: &Request) -> Result<Response, ExitCode> {
        let asid = self.active_asid();
        let tid = request.tid();
        let index = self
            .transactions
            .iter()
            .position(|t| matches!(t, Some(t) if t.tid == tid))
            .ok_or(ExitCode::BadRequest)?;
        let slot = &mut self.transactions[index];
        let Some(t) = slot.as_mut() else {
            return Err(ExitCode::BadRequest);
        };
        if t.phase != Phase::Done {
            self.statistics.not_done_responses += 1;
            return Ok(Response::status(ExitCode::NotDone));
        }
        let value = t.outputs.pop_front().ok_or(ExitCode::BadRequest)?;
        if t.outputs.is_empty() {
            trace!("tid {} (nnid {}) drained; entry freed", tid, t.nnid);
            *slot = None;
        }
        let delay = self.data_delay.map(|delay| delay(tid));
        Ok(self.respond(Response::data_out(asid, tid, value), delay))
    }

    pub fn debug_state(&self) {
        info!(target: "", "Fake engine at cycle {}, asid {:?}:", self.cycle, self.asid);
        for t in self.transactions.iter().flatten() {
            info!(
                target: "",
                "  tid {} nnid {} {:?} queued {} consumed {} outputs {}",
                t.tid,
                t.nnid,
                t.phase,
                t.queue.len(),
                t.consumed.len(),
                t.outputs.len()
            );
        }
        info!(target: "", "  {} deferred responses undelivered", self.deferred.len());
        info!(target: "", "{:?}", self.statistics);
    }
}

impl Channel for FakeEngine {
    fn issue(&mut self, request: Request) -> Response {
        self.tick();
        self.history.push(request);
        let result = match request.op() {
            Some(UserOp::NewRequest) => self.open(&request),
            Some(UserOp::WriteRegister) => self.write_register(&request),
            Some(UserOp::WriteData) => self.write(&request, false),
            Some(UserOp::WriteDataLast) => self.write(&request, true),
            Some(UserOp::ReadData) => self.read(&request),
            None => Err(ExitCode::BadRequest),
        };
        result.unwrap_or_else(|code| {
            warn!("{:?} rejected: {:?}", request, code);
            self.statistics.fatal_responses += 1;
            Response::status(code)
        })
    }

    fn step(&mut self) { self.tick(); }

    fn poll_response(&mut self) -> Option<Response> {
        let cycle = self.cycle;
        let index = self.deferred.iter().position(|(due, _)| *due <= cycle)?;
        let (_, response) = self.deferred.remove(index)?;
        self.deliveries.push(response);
        Some(response)
    }

    fn engine_id(&mut self) -> EngineId { self.id }

    fn is_done(&mut self, tid: Tid) -> bool {
        self.find(tid).map_or(false, |t| t.phase == Phase::Done)
    }
}

impl Supervisor for FakeEngine {
    fn set_active_address_space(&mut self, asid: Asid) -> Option<Asid> { self.asid.replace(asid) }

    fn set_config_table(&mut self, table: Arc<ConfigTable>) { self.table = Some(table); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_network(num_outputs: u16) -> FakeEngine {
        let mut table = ConfigTable::new(1, 2);
        table
            .attach_from_buffer(0, &network_config(4, num_outputs))
            .unwrap();
        let mut engine = FakeEngine::with_capacity(2);
        engine.set_config_table(Arc::new(table));
        engine.set_active_address_space(0);
        engine
    }

    fn open(engine: &mut FakeEngine) -> Tid {
        let response = engine.issue(Request::new_transaction(0, LearningMode::Feedforward, 0));
        assert_eq!(response.exit_code(), ExitCode::Ok);
        response.tid()
    }

    #[test]
    fn config_helper_encodes_block_size() {
        assert_eq!(network_config(4, 3), vec![0x00, 3]);
        assert_eq!(network_config(32, 1), vec![0x30, 1]);
    }

    #[test]
    fn full_transaction() {
        let mut engine = engine_with_network(2);
        let tid = open(&mut engine);
        assert_eq!(engine.issue(Request::write_data(tid, 3, false)).exit_code(), ExitCode::Ok);
        assert_eq!(engine.issue(Request::write_data(tid, 4, true)).exit_code(), ExitCode::Ok);
        assert_eq!(engine.issue(Request::read_data(tid)).exit_code(), ExitCode::NotDone);
        while !engine.is_done(tid) {
            engine.step();
        }
        let first = engine.issue(Request::read_data(tid));
        assert_eq!((first.tid(), first.element()), (tid, 7));
        assert_eq!(engine.issue(Request::read_data(tid)).element(), 8);
        // Drained transactions leave the table.
        assert_eq!(engine.resident(), 0);
        assert_eq!(engine.issue(Request::read_data(tid)).exit_code(), ExitCode::BadRequest);
    }

    #[test]
    fn table_full_is_fatal() {
        let mut engine = engine_with_network(1);
        open(&mut engine);
        open(&mut engine);
        let response = engine.issue(Request::new_transaction(0, LearningMode::Feedforward, 0));
        assert_eq!(response.exit_code(), ExitCode::BadRequest);
    }

    #[test]
    fn open_checks() {
        let mut engine = FakeEngine::with_capacity(1);
        let request = Request::new_transaction(0, LearningMode::Feedforward, 0);
        assert_eq!(engine.issue(request).exit_code(), ExitCode::NoActiveAddressSpace);

        let mut table = ConfigTable::new(1, 3);
        table.attach_placeholder(0).unwrap();
        table.attach_from_buffer(0, &network_config(16, 1)).unwrap();
        engine.set_config_table(Arc::new(table));
        engine.set_active_address_space(0);
        assert_eq!(engine.issue(request).exit_code(), ExitCode::ZeroSizeNetwork);
        let request = Request::new_transaction(1, LearningMode::Feedforward, 0);
        assert_eq!(engine.issue(request).exit_code(), ExitCode::InvalidBlockEncoding);
        let request = Request::new_transaction(2, LearningMode::Feedforward, 0);
        assert_eq!(engine.issue(request).exit_code(), ExitCode::InvalidNetworkId);
        assert_eq!(engine.set_active_address_space(5), Some(0));
        let request = Request::new_transaction(1, LearningMode::Feedforward, 0);
        assert_eq!(engine.issue(request).exit_code(), ExitCode::NoActiveAddressSpace);
    }

    #[test]
    fn full_queue_pushes_back() {
        let mut engine = engine_with_network(1)
            .with_input_queue_depth(1)
            .with_drain_interval(1000);
        let tid = open(&mut engine);
        assert_eq!(engine.issue(Request::write_data(tid, 1, false)).exit_code(), ExitCode::Ok);
        assert_eq!(engine.issue(Request::write_data(tid, 2, true)).exit_code(), ExitCode::QueueBusy);
        assert_eq!(engine.statistics().busy_responses, 1);
    }

    #[test]
    fn forced_busy_then_accept() {
        let mut engine = engine_with_network(1);
        let tid = open(&mut engine);
        engine.force_busy(2);
        let write = Request::write_data(tid, 1, true);
        assert_eq!(engine.issue(write).exit_code(), ExitCode::QueueBusy);
        assert_eq!(engine.issue(write).exit_code(), ExitCode::QueueBusy);
        assert_eq!(engine.issue(write).exit_code(), ExitCode::Ok);
    }

    #[test]
    fn deferred_tids_keep_open_order() {
        let mut engine = engine_with_network(1).with_deferred_tids(2);
        for _ in 0..2 {
            let ack = engine.issue(Request::new_transaction(0, LearningMode::Feedforward, 0));
            assert_eq!(ack, Response::status(ExitCode::Ok));
        }
        assert_eq!(engine.statistics().peak_deferred_tids, 2);
        // The first assignment is due two steps after its open.
        assert_eq!(engine.poll_response(), None);
        engine.step();
        let first = engine.poll_response().unwrap();
        assert_eq!((first.response_kind(), first.tid()), (Some(ResponseKind::Tid), 0));
        assert_eq!(engine.poll_response(), None);
        engine.step();
        assert_eq!(engine.poll_response().map(|r| r.tid()), Some(1));
        assert_eq!(engine.deliveries().len(), 2);
    }

    #[test]
    fn deferred_data_overtakes_across_tids() {
        let mut engine = engine_with_network(1)
            .with_latency(0)
            .with_deferred_data(|tid| if tid == 0 { 5 } else { 1 });
        let slow = open(&mut engine);
        let fast = open(&mut engine);
        engine.issue(Request::write_data(slow, 1, true));
        engine.issue(Request::write_data(fast, 2, true));
        while !(engine.is_done(slow) && engine.is_done(fast)) {
            engine.step();
        }
        assert_eq!(engine.issue(Request::read_data(slow)), Response::status(ExitCode::Ok));
        assert_eq!(engine.issue(Request::read_data(fast)), Response::status(ExitCode::Ok));
        // Both entries drained; their TIDs stay reserved until delivery.
        assert_eq!(engine.resident(), 0);
        assert_eq!(engine.allocate_tid(), 2);
        let mut delivered = Vec::new();
        for _ in 0..5 {
            engine.step();
            delivered.extend(core::iter::from_fn(|| engine.poll_response()));
        }
        let words: Vec<(Tid, Element)> = delivered.iter().map(|r| (r.tid(), r.element())).collect();
        assert_eq!(words, [(fast, 2), (slow, 1)]);
    }

    #[test]
    fn capacity_shortcut_matches_params() {
        let mut engine = FakeEngine::with_capacity(3);
        let params = EngineParams {
            transaction_table_entries: 3,
            ..Default::default()
        };
        assert_eq!(engine.engine_id().raw(), EngineId::try_from(&params).unwrap().raw());
        let wide = EngineParams {
            elements_per_block: 512,
            ..Default::default()
        };
        assert_eq!(
            FakeEngine::new(wide).err(),
            Some(ParamError::OutOfRange("ELEMENTS_PER_BLOCK"))
        );
    }

    #[test]
    fn parameter_file_sizes_table() {
        let mut engine =
            FakeEngine::from_parameter_file("(TRANSACTION_TABLE_NUM_ENTRIES,3)\n(ELEMENTS_PER_BLOCK,8)")
                .unwrap();
        let id = engine.engine_id();
        assert_eq!(id.transaction_table_entries(), 3);
        assert_eq!(id.elements_per_block(), 8);
    }
}
