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

//! Request/response framing for the engine's instruction interface.
//!
//! Every request is a `funct` field plus two 64-bit operands; every response
//! is a single 64-bit word whose low bits hold the exit code. Field widths
//! are fixed per engine build.

use crate::ExitCode;
use core::fmt;
use modular_bitfield::prelude::*;
use nnrt_shared::{Element, LearningMode, Nnid, Register, Tid};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::{assert_eq_size, const_assert_eq};

pub const RESP_CODE_WIDTH: u32 = 4;
pub const RESP_KIND_WIDTH: u32 = 2;
pub const ASID_WIDTH: u32 = 10;
pub const TID_WIDTH: u32 = 16;
pub const ELEMENT_WIDTH: u32 = 32;

const_assert_eq!(
    RESP_CODE_WIDTH + RESP_KIND_WIDTH + ASID_WIDTH + TID_WIDTH + ELEMENT_WIDTH,
    u64::BITS
);

bitflags::bitflags! {
    /// Sub-function bits of a user request.
    pub struct Funct: u8 {
        const WRITE = 0b001;
        const NEW   = 0b010;
        const LAST  = 0b100;
    }
}

/// User-level operations, keyed by their `funct` encoding.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum UserOp {
    ReadData = 0,      // !WRITE
    WriteData = 1,     // WRITE
    NewRequest = 3,    // WRITE | NEW
    WriteDataLast = 5, // WRITE | LAST
    WriteRegister = 7, // WRITE | NEW | LAST
}

/// rs2 of a new-transaction request.
#[bitfield(bits = 64)]
pub struct NewRequestPayload {
    pub nnid: B32,
    pub train_outputs: B16,
    pub mode: B2,
    #[skip]
    __: B14,
}

/// rs2 of a register write.
#[bitfield(bits = 64)]
pub struct RegisterPayload {
    pub value: B32,
    pub register: B32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    pub funct: Funct,
    /// TID for everything but new-transaction requests.
    pub rs1: u64,
    pub rs2: u64,
}

impl Request {
    pub fn new_transaction(nnid: Nnid, mode: LearningMode, train_outputs: u16) -> Self {
        let payload = NewRequestPayload::new()
            .with_nnid(nnid)
            .with_train_outputs(train_outputs)
            .with_mode(mode.into());
        Request {
            funct: Funct::WRITE | Funct::NEW,
            rs1: 0,
            rs2: u64::from_le_bytes(payload.into_bytes()),
        }
    }

    pub fn write_register(tid: Tid, register: Register, value: u32) -> Self {
        let payload = RegisterPayload::new()
            .with_value(value)
            .with_register(register.into());
        Request {
            funct: Funct::WRITE | Funct::NEW | Funct::LAST,
            rs1: tid.into(),
            rs2: u64::from_le_bytes(payload.into_bytes()),
        }
    }

    pub fn write_data(tid: Tid, value: Element, is_last: bool) -> Self {
        let mut funct = Funct::WRITE;
        funct.set(Funct::LAST, is_last);
        Request {
            funct,
            rs1: tid.into(),
            rs2: value as u32 as u64,
        }
    }

    pub fn read_data(tid: Tid) -> Self {
        Request {
            funct: Funct::empty(),
            rs1: tid.into(),
            rs2: 0,
        }
    }

    /// None for funct encodings the engine does not implement.
    pub fn op(&self) -> Option<UserOp> { UserOp::try_from(self.funct.bits()).ok() }

    pub fn tid(&self) -> Tid { self.rs1 as Tid }

    pub fn element(&self) -> Element { self.rs2 as u32 as Element }

    pub fn new_request(&self) -> NewRequestPayload {
        NewRequestPayload::from_bytes(self.rs2.to_le_bytes())
    }

    pub fn register(&self) -> RegisterPayload { RegisterPayload::from_bytes(self.rs2.to_le_bytes()) }
}

/// What a response's payload carries.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ResponseKind {
    /// Exit code only (writes, refused reads).
    Status = 0,
    /// Answer to a new-transaction request; TID-assignment responses come
    /// back in request order.
    Tid = 1,
    /// One output element, tagged with its transaction's TID.
    Data = 2,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub code: B4,
    pub kind: B2,
    pub asid: B10,
    pub tid: B16,
    pub data: B32,
}
assert_eq_size!(Response, u64);

impl Response {
    pub fn from_raw(raw: u64) -> Self { Response::from_bytes(raw.to_le_bytes()) }
    pub fn raw(&self) -> u64 { u64::from_le_bytes(self.into_bytes()) }

    pub fn status(code: ExitCode) -> Self {
        Response::new()
            .with_code(code.into())
            .with_kind(ResponseKind::Status.into())
    }

    pub fn tid_assigned(asid: u16, tid: Tid) -> Self {
        Response::new()
            .with_kind(ResponseKind::Tid.into())
            .with_asid(asid)
            .with_tid(tid)
    }

    pub fn data_out(asid: u16, tid: Tid, value: Element) -> Self {
        Response::new()
            .with_kind(ResponseKind::Data.into())
            .with_asid(asid)
            .with_tid(tid)
            .with_data(value as u32)
    }

    pub fn exit_code(&self) -> ExitCode { ExitCode::from(self.code()) }

    /// None for a kind this build does not know.
    pub fn response_kind(&self) -> Option<ResponseKind> { ResponseKind::try_from(self.kind()).ok() }

    pub fn element(&self) -> Element { self.data() as Element }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Response {{ code: {:?}, kind: {}, asid: {}, tid: {}, data: {:#x} }}",
            self.exit_code(),
            self.kind(),
            self.asid(),
            self.tid(),
            self.data()
        )
    }
}

/// Capability word read from the engine's identification register.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct EngineId {
    pub elements_per_block: B8,
    pub num_pes: B16,
    pub cache_entries: B16,
    #[skip]
    __: B8,
    pub transaction_table_entries: B16,
}

impl EngineId {
    pub fn from_raw(raw: u64) -> Self { EngineId::from_bytes(raw.to_le_bytes()) }
    pub fn raw(&self) -> u64 { u64::from_le_bytes(self.into_bytes()) }
}

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "EngineId {{ elements_per_block: {}, num_pes: {}, cache_entries: {}, transaction_table_entries: {} }}",
            self.elements_per_block(),
            self.num_pes(),
            self.cache_entries(),
            self.transaction_table_entries()
        )
    }
}
