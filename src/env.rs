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

//! External collaborators.
//!
//! The kernel is deterministic and self-contained; everything with side effects on the
//! outside world — chain access, wallets, payment, caching — is consumed through the traits
//! in this module. These calls are the only suspension points of the execution model:
//! between any two of them the kernel's invariants are fully restored.

use std::fmt::Debug;

use crate::codec::Json;
use crate::error::ExternalError;

/// A lock descriptor: the owner-binding capability.
///
/// `script` is the locking script the lock compiles to; `domain` is the maximal size in
/// bytes of an unlocking script satisfying it, used for fee estimation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawLock {
    pub script: Vec<u8>,
    pub domain: usize,
}

/// Previous outputs being spent, passed to the purse and owner for fee and signature
/// calculation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Parent {
    pub script: Vec<u8>,
    pub satoshis: u64,
}

/// Chain access.
pub trait Blockchain: Debug {
    /// Network identifier (`main`, `test`, `mock`, …).
    ///
    /// # Blocking I/O
    ///
    /// This call MUST NOT perform any I/O operations and MUST BE non-blocking.
    fn network(&self) -> &str;

    /// Fetches a raw transaction by txid.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn fetch(&mut self, txid: &str) -> Result<String, ExternalError>;

    /// Broadcasts a raw transaction, returning its txid.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn broadcast(&mut self, rawtx: &str) -> Result<String, ExternalError>;

    /// Whether (and where) an output was spent: the spending txid, or `None` while unspent.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn spends(&mut self, txid: &str, vout: u32) -> Result<Option<String>, ExternalError>;
}

/// Key owner: supplies fresh locks for new creations and signs jig inputs.
pub trait OwnerWallet: Debug {
    /// A fresh lock for the next unowned creation.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn next_owner(&mut self) -> Result<RawLock, ExternalError>;

    /// Signs the jig inputs of a raw transaction.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn sign(&mut self, rawtx: &str, parents: &[Parent], locks: &[RawLock]) -> Result<String, ExternalError>;
}

/// Payment provider: funds transactions with fee inputs and change outputs.
pub trait Purse: Debug {
    /// Adds payment inputs and change outputs. Everything already present in the partial
    /// transaction must be preserved field-by-field.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn pay(&mut self, rawtx: &str, parents: &[Parent]) -> Result<String, ExternalError>;

    /// Notification that a paid transaction was broadcast.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn broadcast(&mut self, rawtx: &str) -> Result<(), ExternalError> {
        let _ = rawtx;
        Ok(())
    }

    /// Notification that a paid transaction will never be broadcast, releasing its UTXOs.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn cancel(&mut self, rawtx: &str) -> Result<(), ExternalError> {
        let _ = rawtx;
        Ok(())
    }
}

/// Key/value store for verified states and transactions.
///
/// # Nota bene
///
/// Keys under the `jig://`, `tx://` and `berry://` schemes are immutable: re-setting one
/// with a different value must be rejected with [`ExternalError::CacheImmutable`].
pub trait Cache: Debug {
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn get(&mut self, key: &str) -> Result<Option<Json>, ExternalError>;

    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn set(&mut self, key: &str, value: Json) -> Result<(), ExternalError>;
}

/// Optional remote state provider, consulted before replaying history on load.
pub trait StateServer: Debug {
    /// Pre-verified state for a location, if the server knows it.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn state(&mut self, location: &str) -> Result<Option<Json>, ExternalError>;

    /// Broadcast notification, letting the server index the transaction early.
    ///
    /// # Blocking I/O
    ///
    /// This call MAY BE blocking.
    fn broadcast(&mut self, rawtx: &str) -> Result<(), ExternalError> {
        let _ = rawtx;
        Ok(())
    }
}
