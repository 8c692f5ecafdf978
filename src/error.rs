// RUNIC: Deterministic execution kernel for replayable UTXO-embedded state machines
//
// SPDX-License-Identifier: Apache-2.0
//
// Designed in 2023-2025 by Dr Maxim Orlovsky <orlovsky@ubideco.org>
// Written in 2024-2025 by Dr Maxim Orlovsky <orlovsky@ubideco.org>
//
// Copyright (C) 2023-2024 LNP/BP Standards Association, Switzerland.
// Copyright (C) 2024-2025 Laboratories for Ubiquitous Deterministic Computing (UBIDECO),
//                         Institute for Distributed and Cognitive Systems (InDCS), Switzerland.
// Copyright (C) 2023-2025 Dr Maxim Orlovsky.
// All rights under the above copyrights are reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//        http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Error taxonomy of the kernel.
//!
//! Errors are grouped into the eight kinds a protocol boundary must discriminate: argument,
//! rule violation, worldview, serialization, execution, trust, timeout and external. All of
//! them are cloneable: an error raised inside a recorded call is stored on the record and
//! re-thrown by every subsequent membrane trap until the outermost frame unwinds.

use crate::codec::CodecError;

/// Invalid data passed by the caller at an API entry point.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ArgumentError {
    /// invalid argument: {0}
    Invalid(String),

    /// {0} is a reserved word
    Reserved(String),

    /// invalid location: {0}
    BadLocation(String),

    /// unknown creation {0}
    UnknownCreation(String),
}

/// A membrane rule was violated by user code.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum RuleError {
    /// cannot set {0}: the creation is immutable
    Immutable(String),

    /// cannot set binding {0}
    SetBinding(String),

    /// cannot delete binding {0}
    DeleteBinding(String),

    /// cannot read binding {0}: {1}
    ReadBinding(String, String),

    /// cannot access private property {0}
    PrivateGet(String),

    /// cannot call private method {0}
    PrivateCall(String),

    /// cannot set {0}: updates must run inside a method
    OutsideMethod(String),

    /// cannot define {0}: the descriptor is not allowed
    BadDescriptor(String),

    /// preventExtensions is not allowed on creations
    PreventExtensions,

    /// {0} is final and may not be overridden
    FinalMethod(String),

    /// cannot update {0}: the creation was destroyed
    Destroyed(String),

    /// cannot write to {0} while it is being published in another transaction
    PendingPublish(String),

    /// sidekick functions may not update state
    SidekickUpdate,

    /// berries may not be updated after pluck
    BerryUpdate,
}

/// Two purportedly-same creations disagree about their location.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum WorldviewError {
    /// inconsistent worldview: {origin} was used at {a} and at {b}
    Inconsistent {
        origin: String,
        a: String,
        b: String,
    },
}

/// Replay or recorded-call failure.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ExecutionError {
    /// metadata mismatch in {0}
    MetadataMismatch(String),

    /// {0} is not a function
    NotAFunction(String),

    /// method time travel on {0}
    MethodTimeTravel(String),

    /// time travel for {0}
    TimeTravel(String),

    /// invalid exec entry: {0}
    BadExec(String),

    /// async return values are not serializable
    AsyncReturn,

    /// {0}
    Failed(String),
}

/// Replayed source is not on the trust list.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("cannot deploy or upgrade code from untrusted transaction {txid} (while {during})")]
pub struct TrustError {
    pub txid: String,
    pub during: String,
}

/// A cooperative deadline expired.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum TimeoutError {
    /// {op} timed out
    Expired { op: String },

    /// {op} timed out while processing {txid}
    ExpiredTx { op: String, txid: String },
}

/// A collaborator (blockchain, purse, owner, cache, state server) failed.
///
/// Where the raw failure admits a well-known cause the error carries the hint instead of the
/// raw message: a transaction without inputs means the purse is not funded; missing inputs
/// mean a UTXO was spent in another transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ExternalError {
    /// blockchain fetch failed: {0}
    Fetch(String),

    /// broadcast failed: {0}
    Broadcast(String),

    /// cache failure: {0}
    Cache(String),

    /// attempt to overwrite immutable cache entry {0}
    CacheImmutable(String),

    /// owner failed to sign: {0}
    Sign(String),

    /// purse failed to pay: {0}
    Pay(String),

    /// tx has no inputs: purse not funded
    NotFunded,

    /// {location} was spent in another transaction{detail}
    Spent { location: String, detail: String },

    /// state server failure: {0}
    State(String),
}

/// Top-level kernel error.
///
/// # Nota bene
///
/// `Internal` indicates a kernel invariant breach: a bug in this crate, never in user code.
#[derive(Clone, PartialEq, Debug, Display, Error, From)]
#[display(inner)]
pub enum KernelError {
    #[from]
    Argument(ArgumentError),

    #[from]
    Rule(RuleError),

    #[from]
    Worldview(WorldviewError),

    #[from]
    Codec(CodecError),

    #[from]
    Execution(ExecutionError),

    #[from]
    Trust(TrustError),

    #[from]
    Timeout(TimeoutError),

    #[from]
    External(ExternalError),

    /// internal kernel error: {0}
    #[display("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Wraps an arbitrary message as an execution failure.
    pub fn execution(msg: impl ToString) -> Self { ExecutionError::Failed(msg.to_string()).into() }

    /// Wraps an arbitrary message as an argument failure.
    pub fn argument(msg: impl ToString) -> Self { ArgumentError::Invalid(msg.to_string()).into() }

    /// Wraps an arbitrary message as an internal invariant breach.
    pub fn internal(msg: impl ToString) -> Self { KernelError::Internal(msg.to_string()) }
}
