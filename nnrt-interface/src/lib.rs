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

//! Interface between the runtime and a neural-network engine: wire framing,
//! exit codes, and the collaborator traits a backend implements.

extern crate alloc;

use alloc::sync::Arc;
use nnrt_shared::{Asid, EngineParams, ParamError, Tid};
use nnrt_table::ConfigTable;
use num_enum::{FromPrimitive, IntoPrimitive};

mod wire;
pub use wire::*;

/// Exit code carried in the low bits of every response.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum ExitCode {
    Ok = 0,
    /// Input queue full; the identical request may be reissued.
    QueueBusy,
    /// Output not ready; the identical request may be reissued.
    NotDone,
    BadRequest,
    NoActiveAddressSpace,
    InvalidNetworkId,
    ZeroSizeNetwork,
    InvalidBlockEncoding,
    #[default]
    Unknown = 15,
}

impl ExitCode {
    /// Transient codes are retried by the client; everything else but Ok is
    /// fatal to the transaction.
    pub fn is_transient(self) -> bool { matches!(self, ExitCode::QueueBusy | ExitCode::NotDone) }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientError {
    /// The engine rejected a request; the code is passed through untouched.
    Engine(ExitCode),
    /// The engine answered with the wrong kind of response.
    UnexpectedResponse,
    /// A transient code persisted past the configured attempt budget.
    RetryLimitExceeded,
    EmptyInput,
    /// More expected outputs than the new-request payload can describe.
    TooManyOutputs,
    CancellationUnsupported,
}

impl ClientError {
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            ClientError::Engine(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitCode> for ClientError {
    fn from(code: ExitCode) -> ClientError { ClientError::Engine(code) }
}

impl From<ExitCode> for Result<(), ClientError> {
    fn from(code: ExitCode) -> Result<(), ClientError> {
        if code == ExitCode::Ok {
            Ok(())
        } else {
            Err(ClientError::Engine(code))
        }
    }
}

impl TryFrom<&EngineParams> for EngineId {
    type Error = ParamError;

    fn try_from(params: &EngineParams) -> Result<EngineId, ParamError> {
        let field = |key: &'static str, value: usize| {
            u16::try_from(value).map_err(|_| ParamError::OutOfRange(key))
        };
        Ok(EngineId::new()
            .with_elements_per_block(
                u8::try_from(params.elements_per_block)
                    .map_err(|_| ParamError::OutOfRange("ELEMENTS_PER_BLOCK"))?,
            )
            .with_num_pes(field("NUM_PES", params.num_pes)?)
            .with_cache_entries(field("CACHE_NUM_ENTRIES", params.cache_entries)?)
            .with_transaction_table_entries(field(
                "TRANSACTION_TABLE_NUM_ENTRIES",
                params.transaction_table_entries,
            )?))
    }
}

/// Request/response path to the engine. Each call to
/// [issue](Channel::issue) costs the engine one step.
///
/// The response returned by `issue` is the engine's immediate answer. An
/// engine may instead acknowledge an open or a read with a Status Ok and
/// produce the TID assignment or data word some steps later; those arrive
/// through [poll_response](Channel::poll_response), oldest first.
pub trait Channel {
    fn issue(&mut self, request: Request) -> Response;

    /// Advances the engine one step without presenting a request.
    fn step(&mut self);

    /// Takes the oldest deferred response, if one has been produced.
    fn poll_response(&mut self) -> Option<Response>;

    fn engine_id(&mut self) -> EngineId;

    /// True once transaction |tid| has finished executing and its outputs
    /// can be read.
    fn is_done(&mut self, tid: Tid) -> bool;
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn issue(&mut self, request: Request) -> Response { (**self).issue(request) }
    fn step(&mut self) { (**self).step() }
    fn poll_response(&mut self) -> Option<Response> { (**self).poll_response() }
    fn engine_id(&mut self) -> EngineId { (**self).engine_id() }
    fn is_done(&mut self, tid: Tid) -> bool { (**self).is_done(tid) }
}

/// Privileged controls. Must be exercised before any transaction is opened.
pub trait Supervisor {
    /// Selects the address space later requests execute in. Returns the
    /// previously active one.
    fn set_active_address_space(&mut self, asid: Asid) -> Option<Asid>;

    /// Points the engine at a populated table. The table is read-only from
    /// here on.
    fn set_config_table(&mut self, table: Arc<ConfigTable>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip_unknown() {
        assert_eq!(ExitCode::from(0u8), ExitCode::Ok);
        assert_eq!(ExitCode::from(7u8), ExitCode::InvalidBlockEncoding);
        assert_eq!(ExitCode::from(9u8), ExitCode::Unknown);
        assert!(ExitCode::QueueBusy.is_transient());
        assert!(!ExitCode::BadRequest.is_transient());
    }

    #[test]
    fn exit_code_into_result() {
        assert_eq!(Result::<(), ClientError>::from(ExitCode::Ok), Ok(()));
        assert_eq!(
            Result::<(), ClientError>::from(ExitCode::ZeroSizeNetwork),
            Err(ClientError::Engine(ExitCode::ZeroSizeNetwork))
        );
        assert_eq!(ClientError::RetryLimitExceeded.exit_code(), None);
    }

    #[test]
    fn engine_id_from_params() {
        let params = EngineParams {
            transaction_table_entries: 6,
            elements_per_block: 16,
            ..Default::default()
        };
        let id = EngineId::try_from(&params).unwrap();
        assert_eq!(id.transaction_table_entries(), 6);
        assert_eq!(id.elements_per_block(), 16);
    }

    #[test]
    fn engine_id_rejects_values_that_would_truncate() {
        let wide_blocks = EngineParams {
            elements_per_block: 256,
            ..Default::default()
        };
        assert_eq!(
            EngineId::try_from(&wide_blocks).map(|id| id.raw()),
            Err(ParamError::OutOfRange("ELEMENTS_PER_BLOCK"))
        );
        let deep_table = EngineParams {
            transaction_table_entries: 1 << 16,
            ..Default::default()
        };
        assert_eq!(
            EngineId::try_from(&deep_table).map(|id| id.raw()),
            Err(ParamError::OutOfRange("TRANSACTION_TABLE_NUM_ENTRIES"))
        );
    }
}
