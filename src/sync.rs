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

//! Forward sync: follow the spend chain to a creation's latest state.
//!
//! For each spend of the creation's current outpoint, the spending transaction is fetched,
//! its metadata extracted, and replayed with the creation pinned as the jig to sync — so the
//! live creation itself moves to its post-state. The loop ends when no spend remains or the
//! creation was destroyed. Optionally the sync recurses into inner creations, once per
//! origin.

use std::collections::HashSet;

use crate::creation::CreationId;
use crate::deep::deep_visit;
use crate::error::{ArgumentError, KernelError, RuleError};
use crate::kernel::Kernel;
use crate::location::{Location, Slot};
use crate::metadata::Metadata;
use crate::timeout::Timeout;
use crate::tx::Tx;
use crate::value::Value;

impl Kernel {
    /// Resolves a creation to its latest on-chain state. With `inner`, every creation
    /// reachable from its properties is synced too, deduplicated by origin.
    pub fn sync(&mut self, id: CreationId, inner: bool) -> Result<(), KernelError> {
        if self.atomic {
            return Err(ArgumentError::Invalid(
                "sync is not allowed while a transaction is being assembled".into(),
            )
            .into());
        }
        let timeout = Timeout::new("sync", self.opts().timeout);
        sync_one(self, id, &timeout)?;
        if !inner {
            return Ok(());
        }
        let mut seen: HashSet<String> = HashSet::new();
        if let Some(origin) = self.creations.origin_of(id) {
            seen.insert(origin.to_string());
        }
        let mut queue = inner_creations(self, id);
        while let Some(next) = queue.pop() {
            let Some(origin) = self.creations.origin_of(next).map(Location::to_string) else {
                continue;
            };
            if !seen.insert(origin) {
                continue;
            }
            sync_one(self, next, &timeout)?;
            queue.extend(inner_creations(self, next));
        }
        Ok(())
    }
}

fn inner_creations(kernel: &Kernel, id: CreationId) -> Vec<CreationId> {
    let mut found = vec![];
    let root = Value::Obj(kernel.creations.get(id).props);
    deep_visit(&kernel.heap, &root, &mut |value| {
        if let Some(c) = value.as_creation() {
            found.push(c);
        }
    });
    if let Some(class) = kernel.creations.get(id).class {
        found.push(class);
    }
    found
}

fn sync_one(kernel: &mut Kernel, id: CreationId, timeout: &Timeout) -> Result<(), KernelError> {
    loop {
        timeout.check()?;
        match kernel.creations.location_of(id).cloned() {
            Some(Location::Record { .. }) => {
                return Err(RuleError::PendingPublish(kernel.creations.name_of(id)).into())
            }
            Some(Location::Tx { txid, slot: Slot::Output, index }) => {
                // location index n sits at vout n + 1, behind the metadata output
                let Some(spender) = kernel.chain.spends(&txid, index + 1)? else {
                    return Ok(());
                };
                let rawtx = kernel.chain.fetch(&spender)?;
                let tx = Tx::from_hex(&rawtx)
                    .map_err(|e| KernelError::execution(format!("spending transaction does not parse: {e}")))?;
                let metadata = Metadata::from_tx(&tx, 0)
                    .map_err(|e| KernelError::execution(format!("{spender}: {e}")))?;
                crate::replay::replay(kernel, &tx, &metadata, Some(id), true)?;
            }
            // destroyed, native, berry or error states have no spend chain to follow
            _ => return Ok(()),
        }
    }
}
