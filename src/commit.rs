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

//! Commits: a finalized record plus everything derived from it on the way to the wire.
//!
//! The functions here implement steps 1–10 of the publish pipeline — owner assignment,
//! output scripts, the time-travel check, UTXO finalization, the master list, state capture,
//! state hashing, the exec rewrite, metadata assembly and the partial transaction. The same
//! code path is driven by original publication and by replay verification, which is what
//! makes the bit-compare law hold: both sides capture states with same-commit references in
//! txid-less form.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap};
use sha2::{Digest, Sha256};

use crate::action::Action;
use crate::codec::{encode, CodecError, Json};
use crate::creation::{CreationId, Kind};
use crate::error::{ExecutionError, KernelError};
use crate::kernel::Kernel;
use crate::location::{Location, Slot};
use crate::metadata::{ExecEntry, Metadata, PROTOCOL_VERSION};
use crate::record::Record;
use crate::timeout::Timeout;
use crate::tx::{Tx, TxIn, TxOut};
use crate::value::Value;

/// Version tag written into every captured state.
pub const STATE_VERSION: &str = "01";

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CommitStatus {
    Building,
    Publishing,
    Published,
    Failed,
}

pub struct Commit {
    pub record: Record,
    pub app: String,
    pub version: u8,
    pub base: Tx,
    pub status: CommitStatus,

    pub master: Vec<CreationId>,
    pub states: IndexMap<CreationId, Json>,
    pub hashes: IndexMap<CreationId, String>,
    pub scripts: Vec<Vec<u8>>,
    pub metadata: Option<Metadata>,
    pub partial: Option<Tx>,
}

impl Commit {
    pub fn new(kernel: &Kernel, record: Record) -> Self {
        Commit {
            record,
            app: kernel.opts().app.clone(),
            version: PROTOCOL_VERSION,
            base: Tx::default(),
            status: CommitStatus::Building,
            master: vec![],
            states: IndexMap::new(),
            hashes: IndexMap::new(),
            scripts: vec![],
            metadata: None,
            partial: None,
        }
    }

    pub fn with_base(mut self, base: Tx) -> Self {
        self.base = base;
        self
    }
}

pub(crate) fn hash_state(state: &Json) -> String {
    let text = serde_json::to_string(state).unwrap_or_default();
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Runs pipeline steps 1–10 on a commit. `expected_cre` carries the published initial-owner
/// list during replay; `None` asks the owner collaborator instead.
pub(crate) fn build(
    kernel: &mut Kernel,
    commit: &mut Commit,
    expected_cre: Option<&[Json]>,
    timeout: &Timeout,
) -> Result<(), KernelError> {
    assign_owners(kernel, commit, expected_cre)?;
    timeout.check()?;
    generate_scripts(kernel, commit)?;
    timeout.check()?;
    check_no_time_travel(kernel, commit)?;
    finalize_utxos(kernel, commit)?;
    build_master(commit);
    capture_states(kernel, commit)?;
    timeout.check()?;
    hash_states(commit);
    let exec = build_exec(kernel, commit)?;
    assemble(kernel, commit, exec)?;
    timeout.check()?;
    Ok(())
}

/// Step 1: every created creation without a user-set owner gets a fresh lock. The pass runs
/// twice so that owners which are themselves creations stabilize, and any creation reached
/// through an owner value lands in the refs.
fn assign_owners(
    kernel: &mut Kernel,
    commit: &mut Commit,
    expected_cre: Option<&[Json]>,
) -> Result<(), KernelError> {
    let _ticket = kernel.owner_queue.acquire()?;
    for _round in 0..2 {
        let creates: Vec<_> = commit.record.creates.iter().collect();
        for (index, id) in creates.into_iter().enumerate() {
            if kernel.creations.get(id).bindings.owner.is_some() {
                continue;
            }
            let owner_value = match expected_cre {
                Some(cre) => {
                    let encoded = cre.get(index).ok_or_else(|| {
                        KernelError::from(ExecutionError::MetadataMismatch("cre.length".into()))
                    })?;
                    decode_owner(kernel, &commit.record, encoded)?
                }
                None => {
                    let lock = kernel.wallet.next_owner()?;
                    kernel.lock_value(&lock)
                }
            };
            {
                let _admin = kernel.admin_guard();
                let claimed = kernel.claim(id, owner_value)?;
                kernel.creations.get_mut(id).bindings.owner = Some(claimed);
            }
            let owner = kernel.creations.get(id).bindings.owner.clone().expect("just set");
            let record = &mut commit.record;
            let mut referenced = vec![];
            crate::deep::deep_visit(&kernel.heap, &owner, &mut |v| {
                if let Some(c) = v.as_creation() {
                    referenced.push(c);
                }
            });
            for c in referenced {
                if !record.creates.contains_identity(c) {
                    record.read(&kernel.creations, c)?;
                }
            }
        }
        commit.record.recompute(&kernel.creations)?;
        commit.record.assign_locations(&mut kernel.creations)?;
    }
    Ok(())
}

fn decode_owner(kernel: &mut Kernel, record: &Record, encoded: &Json) -> Result<Value, KernelError> {
    // same-commit references arrive txid-less; resolve them against the record's slots
    let mut by_location: HashMap<String, CreationId> = HashMap::new();
    for (n, id) in record.outputs.iter().enumerate() {
        by_location.insert(format!("_o{n}"), id);
    }
    for (n, id) in record.deletes.iter().enumerate() {
        by_location.insert(format!("_d{n}"), id);
    }
    for id in record.known() {
        if let Some(loc) = kernel.creations.location_of(id) {
            by_location.insert(loc.to_string(), id);
        }
    }
    by_location.insert(
        format!("native://{}", crate::logic::SCRIPT_LOCK_NAME),
        kernel.script_lock,
    );
    let value = crate::codec::decode(&mut kernel.heap, encoded, &mut |payload| {
        let loc = payload
            .as_str()
            .ok_or_else(|| CodecError::BadRef(payload.to_string()))?;
        by_location
            .get(loc)
            .map(|&id| Value::Creation(id))
            .ok_or_else(|| CodecError::BadRef(loc.to_string()))
    })?;
    Ok(value)
}

/// Step 2: serialize every output's lock into its locking script.
fn generate_scripts(kernel: &mut Kernel, commit: &mut Commit) -> Result<(), KernelError> {
    commit.scripts.clear();
    for id in commit.record.outputs.iter().collect::<Vec<_>>() {
        let owner = kernel
            .creations
            .get(id)
            .bindings
            .owner
            .clone()
            .ok_or_else(|| KernelError::internal("output without an owner"))?;
        let lock = kernel
            .value_lock(&owner)
            .ok_or_else(|| KernelError::execution("owner value is not a lock"))?;
        commit.scripts.push(lock.script);
    }
    Ok(())
}

/// Step 3: builds the refmap (origin → location, nonce) over the refs and rejects any
/// pre-state older than a reference to the same origin.
fn check_no_time_travel(kernel: &Kernel, commit: &Commit) -> Result<(), KernelError> {
    let mut refmap: HashMap<Location, u64> = HashMap::new();
    for id in commit.record.refs.iter() {
        if let Some(origin) = kernel.creations.origin_of(id).filter(|o| o.is_global()) {
            refmap.insert(origin.clone(), kernel.creations.get(id).bindings.nonce);
        }
    }
    for id in commit.record.known() {
        let Some(snap) = commit.record.snapshots.get(&id) else { continue };
        let Some(origin) = snap.bindings.origin.clone().filter(|o| o.is_global()) else {
            continue;
        };
        if let Some(&ref_nonce) = refmap.get(&origin) {
            if snap.bindings.nonce < ref_nonce {
                return Err(ExecutionError::TimeTravel(origin.to_string()).into());
            }
        }
    }
    Ok(())
}

/// Step 4: defaults missing UTXO bindings on outputs and asserts deleted creations are
/// fully emptied.
fn finalize_utxos(kernel: &mut Kernel, commit: &Commit) -> Result<(), KernelError> {
    for id in commit.record.outputs.iter() {
        let bindings = &mut kernel.creations.get_mut(id).bindings;
        if bindings.satoshis.is_none() {
            bindings.satoshis = Some(0);
        }
        match &bindings.owner {
            Some(Value::Null) | None => {
                return Err(KernelError::internal("output with an empty owner"))
            }
            Some(_) => {}
        }
    }
    for id in commit.record.deletes.iter() {
        let bindings = &kernel.creations.get(id).bindings;
        if !bindings.is_destroyed() {
            return Err(KernelError::internal("deleted creation with live UTXO bindings"));
        }
    }
    Ok(())
}

/// Step 5: deterministic master list — inputs, then refs, then creates, in insertion order.
fn build_master(commit: &mut Commit) {
    commit.master = commit
        .record
        .inputs
        .iter()
        .chain(commit.record.refs.iter())
        .chain(commit.record.creates.iter())
        .collect();
}

/// `$jig` hook rendering a creation as its location string, with same-commit slots txid-less.
fn state_ref(kernel: &Kernel, record_id: &str, id: CreationId) -> Result<Json, CodecError> {
    let location = kernel
        .creations
        .location_of(id)
        .ok_or_else(|| CodecError::BadRef("creation without a location".into()))?;
    match location {
        Location::Record { record, slot, index } if record == record_id => {
            Ok(json!({ "$jig": format!("{}{index}", slot.marker()) }))
        }
        loc if loc.is_global() => Ok(json!({ "$jig": loc.to_string() })),
        loc => Err(CodecError::BadRef(loc.to_string())),
    }
}

/// Captures one creation's deterministic state: `{cls?, kind, props, src?, version}` with
/// the bindings leading the props in canonical order.
fn creation_state(kernel: &mut Kernel, record_id: &str, id: CreationId) -> Result<Json, KernelError> {
    let creation = kernel.creations.get(id);
    let kind = creation.kind;
    let class = creation.class;
    let props_root = creation.props;
    let bindings = creation.bindings.clone();
    let src = creation.code.as_ref().map(|code| code.src.clone());

    let mut state = JsonMap::new();
    if let Some(class) = class {
        state.insert("cls".into(), state_ref(kernel, record_id, class)?);
    }
    state.insert("kind".into(), json!(kind.state_name()));

    let mut props = JsonMap::new();
    let partial = |loc: &Location| match loc {
        Location::Record { slot, index, record } if record == record_id => {
            format!("{}{index}", slot.marker())
        }
        other => other.to_string(),
    };
    let location = bindings
        .location
        .as_ref()
        .ok_or_else(|| KernelError::internal("captured creation without a location"))?;
    props.insert("location".into(), json!(partial(location)));
    props.insert("nonce".into(), json!(bindings.nonce));
    let origin = bindings
        .origin
        .as_ref()
        .ok_or_else(|| KernelError::internal("captured creation without an origin"))?;
    props.insert("origin".into(), json!(partial(origin)));
    if kernel.creations.get(id).rules.has_utxo {
        let owner = bindings
            .owner
            .as_ref()
            .ok_or_else(|| KernelError::internal("captured creation without an owner"))?;
        let owner_json = encode(&kernel.heap, owner, &mut |c| state_ref(kernel, record_id, c))?;
        props.insert("owner".into(), owner_json);
        props.insert("satoshis".into(), json!(bindings.satoshis.unwrap_or(0)));
    }
    let user = encode(&kernel.heap, &Value::Obj(props_root), &mut |c| {
        state_ref(kernel, record_id, c)
    })?;
    if let Json::Object(user) = user {
        for (key, value) in user {
            props.insert(key, value);
        }
    }
    state.insert("props".into(), Json::Object(props));
    if let Some(src) = src {
        state.insert("src".into(), json!(src));
    }
    state.insert("version".into(), json!(STATE_VERSION));
    Ok(Json::Object(state))
}

/// Berry state: no UTXO bindings, no location (the location embeds this state's hash).
pub(crate) fn berry_state(kernel: &mut Kernel, berry: CreationId) -> Result<Json, KernelError> {
    let creation = kernel.creations.get(berry);
    let class = creation.class.ok_or_else(|| KernelError::internal("berry without a class"))?;
    let props_root = creation.props;
    let mut state = JsonMap::new();
    state.insert("cls".into(), state_ref(kernel, "", class)?);
    state.insert("kind".into(), json!(Kind::Berry.state_name()));
    let user = encode(&kernel.heap, &Value::Obj(props_root), &mut |c| state_ref(kernel, "", c))?;
    state.insert("props".into(), user);
    state.insert("version".into(), json!(STATE_VERSION));
    Ok(Json::Object(state))
}

/// Step 6: captures the state of every output and delete.
fn capture_states(kernel: &mut Kernel, commit: &mut Commit) -> Result<(), KernelError> {
    commit.states.clear();
    let record_id = commit.record.id.clone();
    let targets: Vec<_> = commit
        .record
        .outputs
        .iter()
        .chain(commit.record.deletes.iter())
        .collect();
    for id in targets {
        let state = creation_state(kernel, &record_id, id)?;
        commit.states.insert(id, state);
    }
    Ok(())
}

/// Step 7: SHA-256 over the deterministic JSON of each state, hex-encoded; keyed by
/// creation so completion order cannot matter.
fn hash_states(commit: &mut Commit) {
    commit.hashes = commit
        .states
        .iter()
        .map(|(id, state)| (*id, hash_state(state)))
        .collect();
}

fn master_ref(master: &[CreationId], id: CreationId) -> Result<Json, CodecError> {
    master
        .iter()
        .position(|&m| m == id)
        .map(|idx| json!({ "$jig": idx }))
        .ok_or_else(|| CodecError::BadRef(format!("creation not in master list: {}", id.0)))
}

pub(crate) fn encode_args(kernel: &mut Kernel, master: &[CreationId], args: &[Value]) -> Result<Json, KernelError> {
    let array = kernel.new_array(args.to_vec());
    Ok(encode(&kernel.heap, &array, &mut |c| master_ref(master, c))?)
}

/// Step 8: rewrites every action into its wire `{op, data}` form with master-list indices.
fn build_exec(kernel: &mut Kernel, commit: &Commit) -> Result<Vec<ExecEntry>, KernelError> {
    let master = commit.master.clone();
    let mut exec = Vec::with_capacity(commit.record.actions.len());
    for action in commit.record.actions.clone() {
        let entry = match action {
            Action::Deploy(entries) => {
                let mut data = Vec::with_capacity(entries.len() * 2);
                for entry in entries {
                    data.push(json!(entry.src));
                    data.push(encode(&kernel.heap, &entry.props, &mut |c| master_ref(&master, c))?);
                }
                ExecEntry { op: crate::action::Op::Deploy, data: Json::Array(data) }
            }
            Action::Upgrade { target, src, props } => {
                let data = vec![
                    master_ref(&master, target)?,
                    json!(src),
                    encode(&kernel.heap, &props, &mut |c| master_ref(&master, c))?,
                ];
                ExecEntry { op: crate::action::Op::Upgrade, data: Json::Array(data) }
            }
            Action::New { class, args } => {
                let data = vec![master_ref(&master, class)?, encode_args(kernel, &master, &args)?];
                ExecEntry { op: crate::action::Op::New, data: Json::Array(data) }
            }
            Action::Call { target, method, args } => {
                let data = vec![
                    master_ref(&master, target)?,
                    json!(method),
                    encode_args(kernel, &master, &args)?,
                ];
                ExecEntry { op: crate::action::Op::Call, data: Json::Array(data) }
            }
        };
        exec.push(entry);
    }
    Ok(exec)
}

/// Steps 9–10: metadata object and partial transaction.
fn assemble(kernel: &mut Kernel, commit: &mut Commit, exec: Vec<ExecEntry>) -> Result<(), KernelError> {
    let refs = commit
        .record
        .refs
        .iter()
        .map(|id| {
            kernel
                .creations
                .location_of(id)
                .map(Location::to_string)
                .ok_or_else(|| KernelError::internal("ref without a location"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let out = commit
        .record
        .outputs
        .iter()
        .map(|id| commit.hashes[&id].clone())
        .collect();
    let del = commit
        .record
        .deletes
        .iter()
        .map(|id| commit.hashes[&id].clone())
        .collect();
    let cre = commit
        .record
        .creates
        .iter()
        .map(|id| {
            let owner = kernel
                .creations
                .get(id)
                .bindings
                .owner
                .clone()
                .ok_or_else(|| KernelError::internal("created creation without an owner"))?;
            let record_id = commit.record.id.clone();
            Ok(encode(&kernel.heap, &owner, &mut |c| state_ref(kernel, &record_id, c))?)
        })
        .collect::<Result<Vec<_>, KernelError>>()?;

    let metadata = Metadata {
        app: commit.app.clone(),
        version: commit.version,
        base: commit.base.to_hex(),
        vrun: commit.base.outputs.len() as u32,
        inputs: commit.record.inputs.len(),
        refs,
        out,
        del,
        cre,
        exec,
    };

    let mut tx = commit.base.clone();
    tx.outputs
        .insert(0, TxOut { satoshis: 0, script: metadata.op_return_script() });
    for id in commit.record.inputs.iter().collect::<Vec<_>>() {
        let snap = commit
            .record
            .snapshots
            .get(&id)
            .ok_or_else(|| KernelError::internal("input without a snapshot"))?;
        let Some(Location::Tx { txid, slot: Slot::Output, index }) = snap.bindings.location.clone()
        else {
            return Err(KernelError::internal("input pre-state is not a spendable output"));
        };
        // location index n is the nth non-metadata output: vout n + 1
        tx.inputs.push(TxIn {
            prev_txid: txid,
            prev_vout: index + 1,
            script: vec![],
            sequence: 0xffff_ffff,
        });
    }
    let dust = kernel.opts().dust;
    for (k, id) in commit.record.outputs.iter().enumerate() {
        let satoshis = kernel.creations.get(id).bindings.satoshis.unwrap_or(0);
        tx.outputs.push(TxOut {
            satoshis: satoshis.max(dust),
            script: commit.scripts[k].clone(),
        });
    }

    commit.metadata = Some(metadata);
    commit.partial = Some(tx);
    Ok(())
}
