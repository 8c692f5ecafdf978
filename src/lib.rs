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

//! Deterministic execution kernel for replayable UTXO-embedded state machines.
//!
//! On-chain artifacts ("creations") are replayable state machines carried by Bitcoin-style
//! UTXO transactions: classes and their instances ("jigs") hold identity, ownership and a
//! monotonic version across transactions; berries are read-only data plucked from foreign
//! protocols. Every transaction publishes an OP_RETURN metadata record alongside its spent
//! and minted UTXOs, and any observer replaying that record through this kernel reproduces
//! identical post-state hashes.
//!
//! The crate is organized the way the data flows:
//!
//! - [`value`]/[`codec`]/[`deep`] — the sandbox value model and its deterministic
//!   `$`-tagged JSON wire form;
//! - [`creation`]/[`dynamic`]/[`logic`]/[`membrane`] — creations, their upgradable
//!   implementations, and the rule-enforcing access layer;
//! - [`record`]/[`snapshot`]/[`action`] — the live action log with rollback;
//! - [`commit`]/[`metadata`]/[`tx`] — canonical serialization, state hashing and the
//!   partial-transaction assembly;
//! - [`kernel`]/[`env`]/[`mock`] — the process facade, replay/sync entry points and the
//!   external collaborators.

#![deny(
    unsafe_code,
    dead_code,
    unused_variables,
    unused_mut,
    unused_imports,
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case
)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
extern crate amplify;

pub mod action;
pub mod codec;
pub mod commit;
pub mod creation;
pub mod deep;
pub mod dynamic;
pub mod env;
pub mod error;
pub mod kernel;
pub mod location;
pub mod logic;
pub mod membrane;
pub mod metadata;
pub mod mock;
mod publish;
pub mod queue;
pub mod record;
mod replay;
pub mod set;
pub mod snapshot;
mod sync;
pub mod timeout;
pub mod tx;
pub mod value;

pub use action::{Action, DeployEntry, Op};
pub use codec::{decode, encode, CodecError, Json};
pub use commit::{Commit, CommitStatus, STATE_VERSION};
pub use creation::{is_binding, Bindings, CodeBody, Creation, CreationId, Creations, Kind, BINDING_KEYS};
pub use deep::{deep_clone, deep_replace, deep_visit};
pub use dynamic::Dynamic;
pub use env::{Blockchain, Cache, OwnerWallet, Parent, Purse, RawLock, StateServer};
pub use error::{
    ArgumentError, ExecutionError, ExternalError, KernelError, RuleError, TimeoutError, TrustError,
    WorldviewError,
};
pub use kernel::{DeploySpec, Kernel, KernelOpts};
pub use location::{Location, Slot};
pub use logic::{ClassLogic, ClassRegistry, LogicKind, SCRIPT_LOCK_NAME, SCRIPT_LOCK_SRC};
pub use membrane::{Accessor, CallCtx, Rules, FINAL_METHODS, MAX_SATOSHIS};
pub use metadata::{ExecEntry, Metadata, MetadataError, PROTOCOL_PREFIX, PROTOCOL_VERSION};
pub use mock::{MemoryCache, Mockchain, MockOwner, MockPurse};
pub use record::Record;
pub use set::CreationSet;
pub use snapshot::{FullState, Snapshot};
pub use timeout::Timeout;
pub use tx::{Tx, TxError, TxIn, TxOut};
pub use value::{deep_equal, Body, Heap, HeapObj, ObjId, Value};
