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

//! Publication: pipeline steps 11–14.
//!
//! After the commit is built (steps 1–10 in [`crate::commit`]), publication optionally
//! pre-verifies the freshly-built metadata by replaying it against the partial transaction,
//! then pays, signs and broadcasts through the external collaborators — serialized by the
//! purse queue — and finally rewrites `record://` locations into their `<txid>`-qualified
//! forms and writes the per-creation states into the cache.

use log::{debug, warn};

use crate::commit::{self, Commit, CommitStatus};
use crate::creation::CreationId;
use crate::env::{Parent, RawLock};
use crate::error::{ExternalError, KernelError};
use crate::kernel::Kernel;
use crate::location::{Location, Slot};
use crate::record::Record;
use crate::timeout::Timeout;
use crate::tx::Tx;

/// Publishes a finished record. On failure the record is handed back so the caller can roll
/// it back with the failure reason.
pub(crate) fn publish_record(kernel: &mut Kernel, record: Record) -> Result<String, (Record, KernelError)> {
    let mut commit = Commit::new(kernel, record);
    match publish_commit(kernel, &mut commit) {
        Ok(txid) => Ok(txid),
        Err(error) => {
            commit.status = CommitStatus::Failed;
            Err((commit.record, error))
        }
    }
}

pub(crate) fn publish_commit(kernel: &mut Kernel, commit: &mut Commit) -> Result<String, KernelError> {
    let timeout = Timeout::new("publish", kernel.opts().timeout);
    commit::build(kernel, commit, None, &timeout)?;
    commit.status = CommitStatus::Publishing;

    let metadata = commit
        .metadata
        .clone()
        .ok_or_else(|| KernelError::internal("commit built without metadata"))?;
    let partial = commit
        .partial
        .clone()
        .ok_or_else(|| KernelError::internal("commit built without a partial tx"))?;

    // Step 11: self-check by replaying our own metadata against our own partial tx.
    if kernel.opts().preverify {
        crate::replay::replay(kernel, &partial, &metadata, None, false).map_err(|error| {
            warn!("preverify failed before broadcast: {error}");
            error
        })?;
    } else {
        warn!("preverify disabled; broadcasting without self-check");
    }
    timeout.check()?;

    // Step 12: pay, sign, broadcast — serialized by the purse queue.
    let (parents, locks) = input_parents(kernel, commit)?;
    let _ticket = kernel.purse_queue.acquire()?;
    let partial_hex = partial.to_hex();
    let paid_hex = kernel.purse.pay(&partial_hex, &parents)?;
    let signed_hex = kernel.wallet.sign(&paid_hex, &parents, &locks)?;
    let signed = Tx::from_hex(&signed_hex)
        .map_err(|e| KernelError::execution(format!("paid transaction does not parse: {e}")))?;
    check_paid(&partial, &signed)?;
    timeout.check()?;

    let txid = match kernel.chain.broadcast(&signed_hex) {
        Ok(txid) => txid,
        Err(error) => {
            if let Err(cancel) = kernel.purse.cancel(&signed_hex) {
                warn!("purse cancel failed after broadcast error: {cancel}");
            }
            return Err(enrich_broadcast_error(kernel, commit, &signed, error));
        }
    };
    if let Err(error) = kernel.purse.broadcast(&signed_hex) {
        warn!("purse broadcast notification failed: {error}");
    }
    if let Some(server) = kernel.state_server.as_mut() {
        if let Err(error) = server.broadcast(&signed_hex) {
            warn!("state server broadcast notification failed: {error}");
        }
    }

    // Steps 13–14: finalize locations, cache states.
    finalize_locations(kernel, commit, &txid);
    cache_states(kernel, commit, &txid, &signed_hex);
    commit.status = CommitStatus::Published;
    debug!("published {txid}");
    Ok(txid)
}

/// Previous-output data for the purse and owner, from the inputs' pre-states.
fn input_parents(kernel: &Kernel, commit: &Commit) -> Result<(Vec<Parent>, Vec<RawLock>), KernelError> {
    let mut parents = vec![];
    let mut locks = vec![];
    for id in commit.record.inputs.iter() {
        let snap = commit
            .record
            .snapshots
            .get(&id)
            .ok_or_else(|| KernelError::internal("input without a snapshot"))?;
        let owner = snap
            .bindings
            .owner
            .clone()
            .ok_or_else(|| KernelError::internal("input without a pre-state owner"))?;
        let lock = kernel
            .value_lock(&owner)
            .ok_or_else(|| KernelError::execution("input owner is not a lock"))?;
        parents.push(Parent {
            script: lock.script.clone(),
            satoshis: snap.bindings.satoshis.unwrap_or(0),
        });
        locks.push(lock);
    }
    Ok((parents, locks))
}

/// The paid and signed transaction must match the partial one in every field outside
/// payment inputs (appended) and change outputs (appended); input scripts are free, they
/// carry the signatures.
fn check_paid(partial: &Tx, signed: &Tx) -> Result<(), KernelError> {
    let fail = |what: &str| KernelError::execution(format!("payment altered the transaction: {what}"));
    if signed.version != partial.version || signed.locktime != partial.locktime {
        return Err(fail("version or lock time"));
    }
    if signed.inputs.len() < partial.inputs.len() || signed.outputs.len() < partial.outputs.len() {
        return Err(fail("inputs or outputs dropped"));
    }
    for (k, expected) in partial.inputs.iter().enumerate() {
        let got = &signed.inputs[k];
        if got.prev_txid != expected.prev_txid
            || got.prev_vout != expected.prev_vout
            || got.sequence != expected.sequence
        {
            return Err(fail(&format!("input {k}")));
        }
    }
    for (k, expected) in partial.outputs.iter().enumerate() {
        if &signed.outputs[k] != expected {
            return Err(fail(&format!("output {k}")));
        }
    }
    Ok(())
}

/// Adds double-spend context to a broadcast failure: which input was spent, and — when the
/// conflicting state is already known locally — by what.
fn enrich_broadcast_error(
    kernel: &mut Kernel,
    commit: &Commit,
    signed: &Tx,
    error: ExternalError,
) -> KernelError {
    if signed.inputs.is_empty() {
        return ExternalError::NotFunded.into();
    }
    let jig_inputs = commit.record.inputs.len().min(signed.inputs.len());
    for input in &signed.inputs[..jig_inputs] {
        let Ok(Some(spender)) = kernel.chain.spends(&input.prev_txid, input.prev_vout) else {
            continue;
        };
        let location =
            Location::output(&input.prev_txid, input.prev_vout.saturating_sub(1)).to_string();
        let known = kernel
            .by_location
            .iter()
            .find(|(loc, _)| loc.starts_with(&spender))
            .map(|(loc, id)| format!("; now {} at {loc}", kernel.creations.name_of(*id)));
        let detail = format!(" in {spender}{}", known.unwrap_or_default());
        return ExternalError::Spent { location, detail }.into();
    }
    error.into()
}

/// Step 13: `record://` locations become `<txid>_o<n>` / `<txid>_d<n>` on every output and
/// delete; origins that were still record-scoped follow.
pub(crate) fn finalize_locations(kernel: &mut Kernel, commit: &mut Commit, txid: &str) {
    // location indices count non-metadata outputs: base outputs first, then jigs
    let vrun = commit.base.outputs.len() as u32;
    let outputs: Vec<CreationId> = commit.record.outputs.iter().collect();
    for (k, id) in outputs.into_iter().enumerate() {
        let location = Location::Tx {
            txid: txid.to_string(),
            slot: Slot::Output,
            index: vrun + k as u32,
        };
        finalize_one(kernel, id, location);
    }
    let deletes: Vec<CreationId> = commit.record.deletes.iter().collect();
    for (n, id) in deletes.into_iter().enumerate() {
        let location = Location::Tx { txid: txid.to_string(), slot: Slot::Deleted, index: n as u32 };
        finalize_one(kernel, id, location);
    }
}

fn finalize_one(kernel: &mut Kernel, id: CreationId, location: Location) {
    let bindings = &mut kernel.creations.get_mut(id).bindings;
    let fresh = bindings.origin.as_ref().is_some_and(Location::is_record);
    if fresh {
        bindings.origin = Some(location.clone());
    }
    bindings.location = Some(location.clone());
    kernel.by_location.insert(location.to_string(), id);
}

/// Step 14: writes `jig://<location> → state` for every output and delete, plus the raw
/// transaction under `tx://<txid>`. Cache failures only warn: the chain already carries the
/// truth.
pub(crate) fn cache_states(kernel: &mut Kernel, commit: &Commit, txid: &str, rawtx: &str) {
    if let Err(error) = kernel
        .cache
        .set(&format!("tx://{txid}"), serde_json::Value::String(rawtx.to_string()))
    {
        warn!("caching tx://{txid} failed: {error}");
    }
    for (id, state) in &commit.states {
        let Some(location) = kernel.creations.location_of(*id) else { continue };
        let key = format!("jig://{location}");
        if let Err(error) = kernel.cache.set(&key, state.clone()) {
            warn!("caching {key} failed: {error}");
        }
    }
}
