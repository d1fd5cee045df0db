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

//! Multiplexes a batch of transactions over the engine's K transaction
//! slots.
//!
//! The scheduler keeps a pool of `min(batch, K)` action slots and advances
//! exactly one of them per step, so at most one request is presented at a
//! time. The engine may answer an open or a read on the spot or acknowledge
//! it with a bare Ok and deliver the answer in a later step; slots whose
//! answer is still owed wait while the others keep working. Responses are
//! routed two ways: TID assignments come back in the order the opens were
//! issued and are matched against a FIFO of slots waiting for one; data
//! responses carry their TID and are routed through a map. Any fatal
//! response aborts the whole batch.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{error, info, trace};
use nnrt_client::{ReadStatus, TransactionClient, WriteStatus};
use nnrt_interface::{Channel, ClientError, Response, ResponseKind};
use nnrt_shared::{Asid, Tid};
use nnrt_table::ConfigTable;

mod slot;
mod transaction;

pub use slot::{ActionSlot, SlotState};
pub use transaction::Transaction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerError {
    /// The client hit a fatal exit code or gave up retrying.
    Client(ClientError),
    CycleBudgetExceeded,
    /// A response of unknown kind, or data for a TID nobody owns.
    UnrecognizedResponse,
    SlotStateInconsistent,
    /// Transaction |n| names a network the active address space lacks.
    UnknownNetwork(usize),
    /// Transaction |n| has no inputs or expects no outputs.
    EmptyTransaction(usize),
    NoEngineCapacity,
}

impl From<ClientError> for SchedulerError {
    fn from(err: ClientError) -> SchedulerError { SchedulerError::Client(err) }
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Steps a run may take before it is abandoned.
    pub cycle_budget: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self { Self { cycle_budget: 1 << 24 } }
}

/// What one run took.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    pub cycles: u64,
    pub completed: usize,
    /// Most slots simultaneously holding an engine entry.
    pub peak_active: usize,
    pub busy_retries: u64,
    pub not_done_polls: u64,
    pub idle_steps: u64,
    /// Most opens simultaneously waiting on their TID assignment.
    pub peak_awaiting_tid: usize,
    pub deferred_responses: u64,
}

/// Statistics on non-happy-path events, across runs.
#[derive(Debug, Default)]
struct Statistics {
    runs: u32,
    failed_runs: u32,
    busy_retries: u64,
    not_done_polls: u64,
}

// Per-run bookkeeping.
struct Run<'t> {
    transactions: &'t mut [Transaction],
    slots: Vec<ActionSlot>,
    next_pending: usize,
    awaiting_tid: VecDeque<usize>,
    routes: BTreeMap<Tid, usize>,
    inbound: VecDeque<Response>,
    cursor: usize,
    report: RunReport,
}

impl<'t> Run<'t> {
    fn new(transactions: &'t mut [Transaction], pool_size: usize) -> Self {
        Run {
            transactions,
            slots: (0..pool_size).map(|_| ActionSlot::new()).collect(),
            next_pending: 0,
            awaiting_tid: VecDeque::new(),
            routes: BTreeMap::new(),
            inbound: VecDeque::new(),
            cursor: 0,
            report: RunReport::default(),
        }
    }

    // Hands pending transactions to idle slots. Returns false once every
    // slot is idle and nothing is left to hand out.
    fn refill(&mut self) -> bool {
        let mut busy = false;
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::Unused && self.next_pending < self.transactions.len() {
                slot.assign(self.next_pending);
                self.next_pending += 1;
            }
            busy |= slot.state != SlotState::Unused;
        }
        busy
    }

    // Round-robin over slots with something to present.
    fn pick(&mut self) -> Option<usize> {
        let n = self.slots.len();
        let index = (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&i| self.slots[i].state.is_actionable())?;
        self.cursor = (index + 1) % n;
        Some(index)
    }

    fn slot_transaction(&self, index: usize) -> Result<usize, SchedulerError> {
        self.slots[index]
            .transaction
            .ok_or(SchedulerError::SlotStateInconsistent)
    }

    fn slot_tid(&self, index: usize) -> Result<Tid, SchedulerError> {
        self.slots[index].tid.ok_or(SchedulerError::SlotStateInconsistent)
    }

    // Presents slot |index|'s next request.
    fn act<C: Channel>(
        &mut self,
        client: &mut TransactionClient<C>,
        index: usize,
    ) -> Result<(), SchedulerError> {
        let t = self.slot_transaction(index)?;
        match self.slots[index].state {
            SlotState::NewWrite => {
                let transaction = &self.transactions[t];
                // Checked before the run started.
                let train_outputs = u16::try_from(transaction.train_outputs())
                    .map_err(|_| ClientError::TooManyOutputs)?;
                let response =
                    client.issue_open(transaction.nnid(), transaction.mode(), train_outputs)?;
                self.slots[index].transition(index, SlotState::NewWriteWait);
                self.awaiting_tid.push_back(index);
                let awaiting = self.awaiting_tid.len();
                self.report.peak_awaiting_tid = self.report.peak_awaiting_tid.max(awaiting);
                // A bare status means the assignment comes later.
                if response.response_kind() != Some(ResponseKind::Status) {
                    self.inbound.push_back(response);
                }
            }
            SlotState::Write => {
                let tid = self.slot_tid(index)?;
                let transaction = &self.transactions[t];
                let slot = &mut self.slots[index];
                if let Some(&(register, value)) = transaction.registers().get(slot.registers_written)
                {
                    client.write_register(tid, register, value)?;
                    slot.registers_written += 1;
                    return Ok(());
                }
                let value = *transaction
                    .stream()
                    .get(slot.cursor)
                    .ok_or(SchedulerError::SlotStateInconsistent)?;
                let is_last = slot.cursor + 1 == transaction.stream().len();
                match client.try_write(tid, value, is_last)? {
                    WriteStatus::Accepted => {
                        slot.cursor += 1;
                        if is_last {
                            slot.transition(index, SlotState::Executing);
                        }
                    }
                    WriteStatus::Busy => self.report.busy_retries += 1,
                }
            }
            SlotState::Read => {
                let tid = self.slot_tid(index)?;
                let status = client.try_read(tid)?;
                if status == ReadStatus::NotDone {
                    self.report.not_done_polls += 1;
                    return Ok(());
                }
                if let ReadStatus::Data(response) = status {
                    self.inbound.push_back(response);
                }
                let slot = &mut self.slots[index];
                slot.reads_issued += 1;
                if slot.reads_issued == self.transactions[t].output_count() {
                    slot.transition(index, SlotState::ReadWait);
                }
            }
            _ => return Err(SchedulerError::SlotStateInconsistent),
        }
        Ok(())
    }

    fn collect_deferred<C: Channel>(&mut self, client: &mut TransactionClient<C>) {
        while let Some(response) = client.poll_response() {
            self.report.deferred_responses += 1;
            self.inbound.push_back(response);
        }
    }

    // EXECUTING -> READ once the engine reports the TID finished.
    fn promote_finished<C: Channel>(&mut self, client: &mut TransactionClient<C>) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Executing {
                if let Some(tid) = slot.tid {
                    if client.is_done(tid) {
                        slot.transition(index, SlotState::Read);
                    }
                }
            }
        }
    }

    fn route(&mut self, response: Response) -> Result<(), SchedulerError> {
        match response.response_kind() {
            Some(ResponseKind::Tid) => {
                let tid = response.tid();
                let index = self
                    .awaiting_tid
                    .pop_front()
                    .ok_or(SchedulerError::UnrecognizedResponse)?;
                if self.slots[index].state != SlotState::NewWriteWait
                    || self.routes.contains_key(&tid)
                {
                    error!("tid {} assigned to slot {} in {:?}", tid, index, self.slots[index].state);
                    return Err(SchedulerError::SlotStateInconsistent);
                }
                let t = self.slot_transaction(index)?;
                self.transactions[t].set_tid(tid);
                self.routes.insert(tid, index);
                let slot = &mut self.slots[index];
                slot.tid = Some(tid);
                slot.transition(index, SlotState::Write);
            }
            Some(ResponseKind::Data) => {
                let tid = response.tid();
                let index = *self
                    .routes
                    .get(&tid)
                    .ok_or(SchedulerError::UnrecognizedResponse)?;
                if !matches!(self.slots[index].state, SlotState::Read | SlotState::ReadWait) {
                    return Err(SchedulerError::SlotStateInconsistent);
                }
                let t = self.slot_transaction(index)?;
                let transaction = &mut self.transactions[t];
                transaction.push_output(response.element());
                if transaction.is_complete() {
                    trace!("transaction {} (tid {}) complete", t, tid);
                    self.routes.remove(&tid);
                    self.slots[index].release();
                    self.report.completed += 1;
                }
            }
            _ => {
                error!("unroutable {:?}", response);
                return Err(SchedulerError::UnrecognizedResponse);
            }
        }
        Ok(())
    }

    fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.holds_engine_entry())
            .count()
    }
}

pub struct Scheduler<C: Channel> {
    client: TransactionClient<C>,
    table: Arc<ConfigTable>,
    asid: Asid,
    config: SchedulerConfig,
    statistics: Statistics,
}

impl<C: Channel> Scheduler<C> {
    /// |table| and |asid| must match what the engine was bound to through
    /// the supervisor.
    pub fn new(client: TransactionClient<C>, table: Arc<ConfigTable>, asid: Asid) -> Self {
        Self::with_config(client, table, asid, SchedulerConfig::default())
    }

    pub fn with_config(
        client: TransactionClient<C>,
        table: Arc<ConfigTable>,
        asid: Asid,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            client,
            table,
            asid,
            config,
            statistics: Statistics::default(),
        }
    }

    pub fn client(&self) -> &TransactionClient<C> { &self.client }
    pub fn client_mut(&mut self) -> &mut TransactionClient<C> { &mut self.client }
    pub fn into_client(self) -> TransactionClient<C> { self.client }

    // Rejects transactions that cannot possibly run, before anything is
    // presented to the engine.
    fn validate(&self, transactions: &[Transaction]) -> Result<(), SchedulerError> {
        for (index, transaction) in transactions.iter().enumerate() {
            if transaction.input_count() == 0 || transaction.output_count() == 0 {
                return Err(SchedulerError::EmptyTransaction(index));
            }
            if u16::try_from(transaction.train_outputs()).is_err() {
                return Err(ClientError::TooManyOutputs.into());
            }
            if self.table.config(self.asid, transaction.nnid()).is_none() {
                return Err(SchedulerError::UnknownNetwork(index));
            }
        }
        Ok(())
    }

    /// Runs every transaction to completion, filling in its outputs. On
    /// error the batch is abandoned; transactions already opened on the
    /// engine are not cleaned up.
    pub fn run(&mut self, transactions: &mut [Transaction]) -> Result<RunReport, SchedulerError> {
        self.statistics.runs += 1;
        let result = self.run_batch(transactions);
        match &result {
            Ok(report) => {
                self.statistics.busy_retries += report.busy_retries;
                self.statistics.not_done_polls += report.not_done_polls;
            }
            Err(e) => {
                error!("run of {} transactions failed: {:?}", transactions.len(), e);
                self.statistics.failed_runs += 1;
            }
        }
        result
    }

    fn run_batch(&mut self, transactions: &mut [Transaction]) -> Result<RunReport, SchedulerError> {
        self.validate(transactions)?;
        let k = self.client.engine_id().transaction_table_entries() as usize;
        if k == 0 && !transactions.is_empty() {
            return Err(SchedulerError::NoEngineCapacity);
        }
        for transaction in transactions.iter_mut() {
            transaction.reset();
        }

        let pool_size = core::cmp::min(transactions.len(), k);
        trace!("{} transactions over {} slots", transactions.len(), pool_size);
        let mut run = Run::new(transactions, pool_size);
        while run.refill() {
            if run.report.cycles >= self.config.cycle_budget {
                return Err(SchedulerError::CycleBudgetExceeded);
            }
            match run.pick() {
                Some(index) => run.act(&mut self.client, index)?,
                None => {
                    self.client.idle();
                    run.report.idle_steps += 1;
                }
            }
            run.report.cycles += 1;
            run.report.peak_active = run.report.peak_active.max(run.active());
            debug_assert!(run.active() <= k);

            run.collect_deferred(&mut self.client);
            run.promote_finished(&mut self.client);
            while let Some(response) = run.inbound.pop_front() {
                run.route(response)?;
            }
        }
        Ok(run.report)
    }

    pub fn debug_state(&self) {
        info!(target: "", "Scheduler: asid {} {:?}", self.asid, self.config);
        info!(target: "", "{:?}", self.statistics);
        self.client.debug_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake_engine::{expected_outputs, network_config, FakeEngine};
    use nnrt_interface::{EngineId, ExitCode, Request, Supervisor};

    fn table() -> Arc<ConfigTable> {
        let mut table = ConfigTable::new(1, 2);
        table.attach_from_buffer(0, &network_config(4, 1)).unwrap();
        table.attach_placeholder(0).unwrap();
        Arc::new(table)
    }

    fn scheduler(k: u16) -> Scheduler<FakeEngine> {
        let table = table();
        let mut engine = FakeEngine::with_capacity(k);
        engine.set_config_table(table.clone());
        engine.set_active_address_space(0);
        Scheduler::new(TransactionClient::new(engine), table, 0)
    }

    /// Answers every open with a response of a kind nobody knows.
    struct GarbledEngine(FakeEngine);
    impl Channel for GarbledEngine {
        fn issue(&mut self, request: Request) -> Response {
            let response = self.0.issue(request);
            match response.response_kind() {
                Some(ResponseKind::Tid) => response.with_kind(3),
                _ => response,
            }
        }
        fn step(&mut self) { self.0.step() }
        fn poll_response(&mut self) -> Option<Response> { self.0.poll_response() }
        fn engine_id(&mut self) -> EngineId { self.0.engine_id() }
        fn is_done(&mut self, tid: Tid) -> bool { self.0.is_done(tid) }
    }

    #[test]
    fn round_robin_pick() {
        let mut transactions = vec![Transaction::feedforward(0, &[1], 1); 3];
        let mut run = Run::new(&mut transactions, 3);
        assert!(run.refill());
        assert_eq!(run.pick(), Some(0));
        assert_eq!(run.pick(), Some(1));
        run.slots[2].state = SlotState::Executing;
        assert_eq!(run.pick(), Some(0));
        assert_eq!(run.pick(), Some(1));
    }

    #[test]
    fn empty_batch_finishes_immediately() {
        let mut scheduler = scheduler(2);
        let report = scheduler.run(&mut []).unwrap();
        assert_eq!(report, RunReport::default());
    }

    #[test]
    fn single_transaction() {
        let mut scheduler = scheduler(2);
        let mut batch = [Transaction::feedforward(0, &[4, 5, 6], 1)];
        let report = scheduler.run(&mut batch).unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.peak_active, 1);
        assert_eq!(batch[0].outputs(), &expected_outputs(&[4, 5, 6], 1)[..]);
        assert!(batch[0].tid().is_some());
    }

    #[test]
    fn fatal_code_aborts_batch() {
        let mut scheduler = scheduler(2);
        let mut batch = [
            Transaction::feedforward(0, &[1], 1),
            Transaction::feedforward(1, &[1], 1),
        ];
        assert_eq!(
            scheduler.run(&mut batch),
            Err(SchedulerError::Client(ClientError::Engine(ExitCode::ZeroSizeNetwork)))
        );
        assert_eq!(scheduler.statistics.failed_runs, 1);
    }

    #[test]
    fn unrecognized_response_aborts_batch() {
        let table = table();
        let mut engine = FakeEngine::with_capacity(1);
        engine.set_config_table(table.clone());
        engine.set_active_address_space(0);
        let mut scheduler = Scheduler::new(TransactionClient::new(GarbledEngine(engine)), table, 0);
        let mut batch = [Transaction::feedforward(0, &[1], 1)];
        assert_eq!(scheduler.run(&mut batch), Err(SchedulerError::UnrecognizedResponse));
    }

    #[test]
    fn tid_assignments_pair_with_waiting_slots_in_order() {
        let mut transactions = vec![Transaction::feedforward(0, &[1], 1); 3];
        let mut run = Run::new(&mut transactions, 3);
        run.refill();
        for index in [2, 0, 1] {
            run.slots[index].transition(index, SlotState::NewWriteWait);
            run.awaiting_tid.push_back(index);
        }
        for tid in [40, 41, 42] {
            run.route(Response::tid_assigned(0, tid)).unwrap();
        }
        let tids: Vec<Option<Tid>> = run.slots.iter().map(|s| s.tid).collect();
        assert_eq!(tids, [Some(41), Some(42), Some(40)]);
        assert_eq!(transactions[2].tid(), Some(40));
    }

    #[test]
    fn data_is_routed_by_tid_not_arrival() {
        let mut transactions = vec![Transaction::feedforward(0, &[1], 2); 2];
        let mut run = Run::new(&mut transactions, 2);
        run.refill();
        for (index, tid) in [(0, 8), (1, 3)] {
            run.slots[index].tid = Some(tid);
            run.slots[index].state = SlotState::ReadWait;
            run.routes.insert(tid, index);
        }
        for (tid, value) in [(3, 30), (8, 80), (3, 31), (8, 81)] {
            run.route(Response::data_out(0, tid, value)).unwrap();
        }
        assert_eq!(run.report.completed, 2);
        assert_eq!(transactions[0].outputs(), &[80, 81]);
        assert_eq!(transactions[1].outputs(), &[30, 31]);
        let mut transactions = vec![Transaction::feedforward(0, &[1], 1)];
        let mut run = Run::new(&mut transactions, 1);
        assert_eq!(
            run.route(Response::data_out(0, 5, 1)),
            Err(SchedulerError::UnrecognizedResponse)
        );
    }

    #[test]
    fn rejects_before_touching_engine() {
        let mut scheduler = scheduler(2);
        let mut batch = [
            Transaction::feedforward(0, &[1], 1),
            Transaction::feedforward(2, &[1], 1),
        ];
        assert_eq!(scheduler.run(&mut batch), Err(SchedulerError::UnknownNetwork(1)));
        let mut batch = [Transaction::feedforward(0, &[], 1)];
        assert_eq!(scheduler.run(&mut batch), Err(SchedulerError::EmptyTransaction(0)));
        let mut batch = [Transaction::train_incremental(0, &[], &[1])];
        assert_eq!(scheduler.run(&mut batch), Err(SchedulerError::EmptyTransaction(0)));
        assert!(scheduler.client().channel().history().is_empty());
    }

    #[test]
    fn zero_capacity_engine() {
        let table = table();
        let mut scheduler = Scheduler::new(TransactionClient::new(FakeEngine::with_capacity(0)), table, 0);
        let mut batch = [Transaction::feedforward(0, &[1], 1)];
        assert_eq!(scheduler.run(&mut batch), Err(SchedulerError::NoEngineCapacity));
    }
}
