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

//! Serialization queues.
//!
//! Two sections of the publish pipeline must never interleave across commits: initial-owner
//! assignment (so concurrent commits cannot form a cycle through newly-deployed owner
//! classes) and pay→sign→broadcast (so the purse can reuse UTXOs while its spent-set is
//! eventually consistent). On the single-threaded kernel a section runs to completion before
//! the next begins by construction; the queue's job is to *detect* re-entry — which in
//! synchronous code means unbounded recursion — and fail it instead of deadlocking.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::KernelError;

#[derive(Clone, Debug)]
pub struct SerialQueue {
    name: &'static str,
    busy: Rc<Cell<bool>>,
}

/// Exclusive occupancy of a queue; releases on drop, on every exit path.
#[derive(Debug)]
pub struct QueueTicket {
    busy: Rc<Cell<bool>>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) { self.busy.set(false); }
}

impl SerialQueue {
    pub fn new(name: &'static str) -> Self { SerialQueue { name, busy: Rc::new(Cell::new(false)) } }

    /// Enters the serialized section.
    pub fn acquire(&self) -> Result<QueueTicket, KernelError> {
        if self.busy.replace(true) {
            return Err(KernelError::internal(format!("{} queue re-entered", self.name)));
        }
        Ok(QueueTicket { busy: self.busy.clone() })
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    #[test]
    fn serializes_and_releases() {
        let queue = SerialQueue::new("purse");
        let ticket = queue.acquire().unwrap();
        assert!(queue.acquire().is_err());
        drop(ticket);
        assert!(queue.acquire().is_ok());
    }
}
