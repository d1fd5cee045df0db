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

use log::trace;
use nnrt_shared::Tid;

/// Where an action slot is in the life of its transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Unused,
    /// Holds a transaction that has not been opened yet.
    NewWrite,
    /// Open issued; waiting for the TID-assignment response.
    NewWriteWait,
    Write,
    Executing,
    Read,
    /// Every read issued; waiting for the last data response.
    ReadWait,
}

impl SlotState {
    /// States that have something to present to the engine.
    pub fn is_actionable(self) -> bool {
        matches!(self, SlotState::NewWrite | SlotState::Write | SlotState::Read)
    }

    /// States that occupy an engine transaction-table entry. The engine
    /// takes the entry when it accepts the open, before the TID is known.
    pub fn holds_engine_entry(self) -> bool {
        !matches!(self, SlotState::Unused | SlotState::NewWrite)
    }
}

#[derive(Debug)]
pub struct ActionSlot {
    pub state: SlotState,
    /// Index of the transaction in the caller's batch.
    pub transaction: Option<usize>,
    pub tid: Option<Tid>,
    pub registers_written: usize,
    pub cursor: usize,
    pub reads_issued: usize,
}

impl ActionSlot {
    pub const fn new() -> Self {
        ActionSlot {
            state: SlotState::Unused,
            transaction: None,
            tid: None,
            registers_written: 0,
            cursor: 0,
            reads_issued: 0,
        }
    }

    pub fn assign(&mut self, transaction: usize) {
        *self = ActionSlot {
            state: SlotState::NewWrite,
            transaction: Some(transaction),
            ..ActionSlot::new()
        };
    }

    pub fn release(&mut self) { *self = ActionSlot::new(); }

    pub fn transition(&mut self, index: usize, to: SlotState) {
        trace!("slot {} ({:?}): {:?} -> {:?}", index, self.tid, self.state, to);
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_clears_cursors() {
        let mut slot = ActionSlot::new();
        slot.cursor = 3;
        slot.tid = Some(7);
        slot.assign(5);
        assert_eq!(slot.state, SlotState::NewWrite);
        assert_eq!(slot.transaction, Some(5));
        assert_eq!((slot.tid, slot.cursor), (None, 0));
    }

    #[test]
    fn engine_entry_states() {
        let held: Vec<SlotState> = [
            SlotState::Unused,
            SlotState::NewWrite,
            SlotState::NewWriteWait,
            SlotState::Write,
            SlotState::Executing,
            SlotState::Read,
            SlotState::ReadWait,
        ]
        .into_iter()
        .filter(|s| s.holds_engine_entry())
        .collect();
        assert_eq!(
            held,
            [
                SlotState::NewWriteWait,
                SlotState::Write,
                SlotState::Executing,
                SlotState::Read,
                SlotState::ReadWait
            ]
        );
    }
}
