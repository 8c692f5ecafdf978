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

//! Replay and verification.
//!
//! Given a transaction and its metadata record, replay rehydrates the referenced creations,
//! re-drives every exec entry through the same membrane the publisher used, rebuilds the
//! commit through the same pipeline steps 1–10, and compares the resulting metadata to the
//! published one by deterministic JSON equality. Any difference aborts with a metadata
//! mismatch naming the diverging field.
//!
//! Replayed creations are fresh arena entries, never the caller's live ones — with the
//! single exception of a jig pinned by forward sync, which replaces the matching input and
//! is thereby moved to its post-state.

use std::mem;

use log::{debug, warn};

use crate::action::{Action, DeployEntry, Op};
use crate::codec::{decode, CodecError, Json};
use crate::commit::{self, Commit, STATE_VERSION};
use crate::creation::{Bindings, CodeBody, Creation, CreationId, Kind};
use crate::dynamic::Dynamic;
use crate::error::{ArgumentError, ExecutionError, ExternalError, KernelError};
use crate::kernel::Kernel;
use crate::location::Location;
use crate::logic::LogicKind;
use crate::membrane::{own_graph, Accessor, Rules};
use crate::metadata::{first_difference, Metadata};
use crate::record::Record;
use crate::timeout::Timeout;
use crate::tx::Tx;
use crate::value::{Body, Value};

fn bad_exec(msg: impl ToString) -> KernelError { ExecutionError::BadExec(msg.to_string()).into() }

/// Replays a transaction's metadata and verifies it reproduces bit-identically.
///
/// With `publish` set, the replayed creations get their final `<txid>`-qualified locations
/// and their states are written to the cache; without it (preverify) everything stays
/// record-scoped and is discarded.
pub(crate) fn replay(
    kernel: &mut Kernel,
    tx: &Tx,
    metadata: &Metadata,
    jig_to_sync: Option<CreationId>,
    publish: bool,
) -> Result<Vec<CreationId>, KernelError> {
    let txid = tx.txid();
    let timeout = Timeout::new("replay", kernel.opts().timeout).with_txid(&txid);

    // Step 1: executable source requires trust.
    if metadata
        .exec
        .iter()
        .any(|e| matches!(e.op, Op::Deploy | Op::Upgrade))
    {
        kernel.assert_trusted(&txid, "replay")?;
    }

    // Step 2: load inputs by spent outpoint, refs by location.
    let mut inputs = vec![];
    for k in 0..metadata.inputs {
        let input = tx
            .inputs
            .get(k)
            .ok_or_else(|| bad_exec(format!("transaction lacks input {k}")))?;
        if input.prev_vout == 0 {
            return Err(bad_exec(format!("input {k} spends a metadata output")));
        }
        let location = Location::output(&input.prev_txid, input.prev_vout - 1);
        let id = match jig_to_sync {
            Some(sync) if kernel.creations.location_of(sync) == Some(&location) => sync,
            _ => materialize(kernel, &location.to_string(), &timeout)?,
        };
        inputs.push(id);
    }
    let mut refs = vec![];
    for location in &metadata.refs {
        refs.push(materialize(kernel, location, &timeout)?);
    }
    timeout.check()?;
    unify_loaded(kernel, &inputs, &refs);

    // Steps 3–6: fresh replay-mode record; worldview; sets; execution.
    let record_id = kernel.next_record_id();
    let saved = mem::replace(&mut kernel.record, Record::new(record_id, false, true));
    let executed = replay_exec(kernel, metadata, &inputs, &refs, &timeout);
    let record = mem::replace(&mut kernel.record, saved);

    let mut commit = Commit::new(kernel, record);
    commit.app = metadata.app.clone();
    commit.version = metadata.version;
    if !metadata.base.is_empty() {
        commit.base = Tx::from_hex(&metadata.base)
            .map_err(|e| bad_exec(format!("metadata base does not parse: {e}")))?;
    }

    if let Err(error) = executed {
        commit
            .record
            .rollback(&mut kernel.creations, &mut kernel.heap, None);
        return Err(error);
    }

    // Steps 7–8: rebuild through the publish pipeline and bit-compare.
    commit::build(kernel, &mut commit, Some(&metadata.cre), &timeout)?;
    let built = commit
        .metadata
        .as_ref()
        .ok_or_else(|| KernelError::internal("replay commit without metadata"))?;
    if let Some(path) = first_difference(&built.payload_json(), &metadata.payload_json()) {
        warn!("metadata mismatch at {path} while replaying {txid}");
        debug!("published: {}", metadata.payload_json());
        debug!("replayed:  {}", built.payload_json());
        return Err(ExecutionError::MetadataMismatch(path).into());
    }
    let partial = commit
        .partial
        .clone()
        .ok_or_else(|| KernelError::internal("replay commit without a partial tx"))?;
    compare_tx(&partial, tx, metadata)?;
    timeout.check()?;

    let replayed: Vec<CreationId> = commit
        .record
        .outputs
        .iter()
        .chain(commit.record.deletes.iter())
        .collect();

    // Step 9: finalize and cache when the transaction is on chain.
    if publish {
        crate::publish::finalize_locations(kernel, &mut commit, &txid);
        crate::publish::cache_states(kernel, &commit, &txid, &tx.to_hex());
    }
    Ok(replayed)
}

/// Unifies the loaded worldview: class pointers and stored creation references inside the
/// inputs and refs are re-pointed at the single representative of their origin, refs first
/// (the metadata names the intended state). A genuinely stale reference keeps its old nonce
/// and is rejected later by the commit's refmap.
fn unify_loaded(kernel: &mut Kernel, inputs: &[CreationId], refs: &[CreationId]) {
    let mut canonical: std::collections::HashMap<Location, CreationId> = std::collections::HashMap::new();
    for &id in refs.iter().chain(inputs.iter()) {
        if let Some(origin) = kernel.creations.origin_of(id).filter(|o| o.is_global()) {
            canonical.entry(origin.clone()).or_insert(id);
        }
    }
    let resolve = |creations: &crate::creation::Creations,
                   canonical: &std::collections::HashMap<Location, CreationId>,
                   id: CreationId|
     -> Option<CreationId> {
        let origin = creations.origin_of(id).filter(|o| o.is_global())?;
        let canon = *canonical.get(origin)?;
        (canon != id).then_some(canon)
    };
    for &id in inputs.iter().chain(refs.iter()) {
        if let Some(class) = kernel.creations.get(id).class {
            if let Some(canon) = resolve(&kernel.creations, &canonical, class) {
                kernel.creations.get_mut(id).class = Some(canon);
            }
        }
        let root = Value::Obj(kernel.creations.get(id).props);
        let creations = &kernel.creations;
        crate::deep::deep_replace(&mut kernel.heap, root, &mut |value, _| {
            let inner = value.as_creation()?;
            resolve(creations, &canonical, inner).map(Value::Creation)
        });
    }
}

/// Compares the rebuilt partial transaction against the published one: metadata script,
/// jig scripts, satoshi floors and input outpoints must all agree.
fn compare_tx(partial: &Tx, actual: &Tx, metadata: &Metadata) -> Result<(), KernelError> {
    let mismatch = |what: String| -> KernelError {
        warn!("transaction mismatch at {what}");
        ExecutionError::MetadataMismatch(what).into()
    };
    if actual.outputs.len() < partial.outputs.len() {
        return Err(mismatch("outputs.length".into()));
    }
    if actual.outputs[0].script != partial.outputs[0].script {
        return Err(mismatch("outputs.0.script".into()));
    }
    let first_jig = 1 + metadata.vrun as usize;
    for k in first_jig..partial.outputs.len() {
        if actual.outputs[k].script != partial.outputs[k].script {
            return Err(mismatch(format!("outputs.{k}.script")));
        }
        if actual.outputs[k].satoshis < partial.outputs[k].satoshis {
            return Err(mismatch(format!("outputs.{k}.satoshis")));
        }
    }
    if actual.inputs.len() < partial.inputs.len() {
        return Err(mismatch("inputs.length".into()));
    }
    for (k, expected) in partial.inputs.iter().enumerate() {
        if actual.inputs[k].prev_txid != expected.prev_txid
            || actual.inputs[k].prev_vout != expected.prev_vout
        {
            return Err(mismatch(format!("inputs.{k}")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Exec

fn master_at(kernel: &Kernel, inputs: &[CreationId], refs: &[CreationId]) -> Vec<CreationId> {
    inputs
        .iter()
        .chain(refs.iter())
        .copied()
        .chain(kernel.record.creates.iter())
        .collect()
}

fn jig_index(json: &Json) -> Result<usize, KernelError> {
    let obj = json
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| bad_exec("expected a $jig reference"))?;
    obj.get("$jig")
        .and_then(Json::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| bad_exec("expected a $jig reference"))
}

fn master_creation(
    kernel: &Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    json: &Json,
) -> Result<CreationId, KernelError> {
    let master = master_at(kernel, inputs, refs);
    let idx = jig_index(json)?;
    master
        .get(idx)
        .copied()
        .ok_or_else(|| bad_exec(format!("$jig index {idx} out of range")))
}

fn decode_value(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    json: &Json,
) -> Result<Value, KernelError> {
    let master = master_at(kernel, inputs, refs);
    Ok(decode(&mut kernel.heap, json, &mut |payload| {
        let idx = payload
            .as_u64()
            .ok_or_else(|| CodecError::BadRef(payload.to_string()))? as usize;
        master
            .get(idx)
            .map(|&id| Value::Creation(id))
            .ok_or_else(|| CodecError::BadRef(format!("$jig index {idx} out of range")))
    })?)
}

pub(crate) fn decode_args(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    json: &Json,
) -> Result<Vec<Value>, KernelError> {
    if !json.is_array() {
        return Err(bad_exec("arguments must be an array"));
    }
    let value = decode_value(kernel, inputs, refs, json)?;
    let Some(obj) = value.as_obj() else {
        return Err(bad_exec("arguments must decode to an array"));
    };
    match &kernel.heap.obj(obj).body {
        Body::Array { elems, .. } => elems
            .iter()
            .map(|e| e.clone().ok_or_else(|| bad_exec("argument hole")))
            .collect(),
        _ => Err(bad_exec("arguments must decode to an array")),
    }
}

fn replay_exec(
    kernel: &mut Kernel,
    metadata: &Metadata,
    inputs: &[CreationId],
    refs: &[CreationId],
    timeout: &Timeout,
) -> Result<(), KernelError> {
    // Steps 4–5: unified worldview; inputs become updates, refs become reads.
    for &id in inputs {
        kernel
            .record
            .update(&kernel.creations, &mut kernel.heap, id)?;
    }
    for &id in refs {
        kernel.record.read(&kernel.creations, id)?;
    }

    for entry in &metadata.exec {
        timeout.check()?;
        let data = entry
            .data
            .as_array()
            .ok_or_else(|| bad_exec("exec data must be an array"))?
            .clone();
        match entry.op {
            Op::Deploy => exec_deploy(kernel, inputs, refs, &data)?,
            Op::Upgrade => exec_upgrade(kernel, inputs, refs, &data)?,
            Op::New => exec_new(kernel, inputs, refs, &data)?,
            Op::Call => exec_call(kernel, inputs, refs, &data)?,
        };
    }
    if let Some(error) = kernel.record.error.clone() {
        return Err(error);
    }
    Ok(())
}

fn exec_deploy(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    data: &[Json],
) -> Result<(), KernelError> {
    if data.is_empty() || data.len() % 2 != 0 {
        return Err(bad_exec("DEPLOY data must be [src, props] pairs"));
    }
    let _admin = kernel.admin_guard();
    let mut ids = vec![];
    for pair in data.chunks(2) {
        let src = pair[0]
            .as_str()
            .ok_or_else(|| bad_exec("DEPLOY source must be a string"))?;
        if !pair[1].is_object() {
            return Err(bad_exec("DEPLOY props must be an object"));
        }
        let logic = kernel.registry.resolve(src)?;
        let props = kernel.heap.object();
        let rules = match logic.kind() {
            LogicKind::Class => Rules::code(),
            LogicKind::Sidekick => Rules::sidekick(),
        };
        let id = kernel.creations.alloc(Creation {
            kind: Kind::Code,
            native: false,
            bindings: Bindings::unbound(),
            props,
            class: None,
            code: Some(CodeBody {
                name: logic.name().to_string(),
                src: src.to_string(),
                dynamic: Dynamic::new(logic),
            }),
            rules,
        });
        kernel.heap.obj_mut(props).owner = Some(id);
        kernel.record.create(&kernel.creations, &mut kernel.heap, id)?;
        ids.push(id);
    }
    let mut entries = vec![];
    for (pair, &id) in data.chunks(2).zip(&ids) {
        let decoded = decode_value(kernel, inputs, refs, &pair[1])?;
        let Some(obj) = decoded.as_obj() else {
            return Err(bad_exec("DEPLOY props must decode to an object"));
        };
        // the action keeps its own snapshot; the live props must not share handles with it
        let snapshot = crate::deep::deep_clone(&mut kernel.heap, &decoded);
        own_graph(&mut kernel.heap, &decoded, id, false);
        kernel.creations.get_mut(id).props = obj;
        entries.push(DeployEntry {
            code: id,
            src: pair[0].as_str().expect("validated above").to_string(),
            props: snapshot,
        });
    }
    kernel
        .record
        .action(&mut kernel.creations, Action::Deploy(entries))
}

fn exec_upgrade(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    data: &[Json],
) -> Result<(), KernelError> {
    let [target, src, props] = data else {
        return Err(bad_exec("UPGRADE data must be [ref, src, props]"));
    };
    let target = master_creation(kernel, inputs, refs, target)?;
    let src = src
        .as_str()
        .ok_or_else(|| bad_exec("UPGRADE source must be a string"))?;
    if !props.is_object() {
        return Err(bad_exec("UPGRADE props must be an object"));
    }
    let creation = kernel.creations.get(target);
    if creation.native || creation.code.is_none() {
        return Err(bad_exec("UPGRADE target is not deployed code"));
    }
    let logic = kernel.registry.resolve(src)?;
    let _admin = kernel.admin_guard();
    kernel
        .record
        .update(&kernel.creations, &mut kernel.heap, target)?;
    let decoded = decode_value(kernel, inputs, refs, props)?;
    let Some(obj) = decoded.as_obj() else {
        return Err(bad_exec("UPGRADE props must decode to an object"));
    };
    let snapshot = crate::deep::deep_clone(&mut kernel.heap, &decoded);
    own_graph(&mut kernel.heap, &decoded, target, false);
    let code = kernel
        .creations
        .get_mut(target)
        .code
        .as_mut()
        .expect("checked above");
    code.dynamic.swap(logic.clone())?;
    code.src = src.to_string();
    code.name = logic.name().to_string();
    kernel.creations.get_mut(target).props = obj;
    kernel.record.action(
        &mut kernel.creations,
        Action::Upgrade { target, src: src.to_string(), props: snapshot },
    )
}

fn exec_new(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    data: &[Json],
) -> Result<(), KernelError> {
    let [class, args] = data else {
        return Err(bad_exec("NEW data must be [classRef, args]"));
    };
    let class = master_creation(kernel, inputs, refs, class)?;
    let args = decode_args(kernel, inputs, refs, args)?;
    kernel.instantiate(Accessor::Host, class, args).map(|_| ())
}

fn exec_call(
    kernel: &mut Kernel,
    inputs: &[CreationId],
    refs: &[CreationId],
    data: &[Json],
) -> Result<(), KernelError> {
    let [target, method, args] = data else {
        return Err(bad_exec("CALL data must be [targetRef, method, args]"));
    };
    let target = master_creation(kernel, inputs, refs, target)?;
    let method = method
        .as_str()
        .ok_or_else(|| bad_exec("CALL method must be a string"))?
        .to_string();
    let args = decode_args(kernel, inputs, refs, args)?;
    kernel
        .method_call(Accessor::Host, target, &method, args)
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Materialization

/// Builds a fresh creation for a location, from the cache, the state server, or by fetching
/// and replaying the transaction that produced it.
pub(crate) fn materialize(
    kernel: &mut Kernel,
    location_str: &str,
    timeout: &Timeout,
) -> Result<CreationId, KernelError> {
    timeout.check()?;
    if let Some(&id) = kernel.hydrating.get(location_str) {
        return Ok(id);
    }
    let location: Location = location_str.parse()?;
    match &location {
        Location::Native(_) => kernel
            .by_location
            .get(location_str)
            .copied()
            .ok_or_else(|| ArgumentError::UnknownCreation(location_str.to_string()).into()),
        Location::Berry { .. } => {
            let key = format!("berry://{location_str}");
            match kernel.cache.get(&key)? {
                Some(state) => hydrate_state(kernel, &location, &state, timeout),
                None => Err(ExternalError::State(format!("berry state not cached: {location_str}")).into()),
            }
        }
        Location::Tx { txid, .. } => {
            let key = format!("jig://{location_str}");
            if let Some(state) = kernel.cache.get(&key)? {
                return hydrate_state(kernel, &location, &state, timeout);
            }
            if let Some(server) = kernel.state_server.as_mut() {
                if let Some(state) = server.state(location_str)? {
                    let _ = kernel.cache.set(&key, state.clone());
                    return hydrate_state(kernel, &location, &state, timeout);
                }
            }
            let txid = txid.clone();
            let rawtx = kernel.chain.fetch(&txid)?;
            let tx = Tx::from_hex(&rawtx)
                .map_err(|e| KernelError::execution(format!("fetched transaction does not parse: {e}")))?;
            let metadata = Metadata::from_tx(&tx, 0)
                .map_err(|e| KernelError::execution(format!("{txid}: {e}")))?;
            let replayed = replay(kernel, &tx, &metadata, None, true)?;
            replayed
                .into_iter()
                .find(|&id| kernel.creations.location_of(id) == Some(&location))
                .ok_or_else(|| ArgumentError::BadLocation(location_str.to_string()).into())
        }
        _ => Err(ArgumentError::BadLocation(location_str.to_string()).into()),
    }
}

fn state_field<'j>(state: &'j Json, key: &str) -> Result<&'j Json, KernelError> {
    state
        .get(key)
        .ok_or_else(|| KernelError::execution(format!("cached state lacks `{key}`")))
}

/// Rebuilds a creation from a cached state without executing anything. Cache entries are
/// pre-verified, so the trust list is not consulted.
fn hydrate_state(
    kernel: &mut Kernel,
    location: &Location,
    state: &Json,
    timeout: &Timeout,
) -> Result<CreationId, KernelError> {
    let version = state_field(state, "version")?;
    if version.as_str() != Some(STATE_VERSION) {
        return Err(KernelError::execution(format!("unknown state version {version}")));
    }
    let kind = match state_field(state, "kind")?.as_str() {
        Some("code") => Kind::Code,
        Some("jig") => Kind::Jig,
        Some("berry") => Kind::Berry,
        other => return Err(KernelError::execution(format!("unknown state kind {other:?}"))),
    };
    let txid = location.txid().unwrap_or_default().to_string();
    let resolve = move |loc: &str| -> String {
        if loc.starts_with("_o") || loc.starts_with("_d") {
            format!("{txid}{loc}")
        } else {
            loc.to_string()
        }
    };

    // pre-allocate so that self-referential states terminate
    let props_root = kernel.heap.object();
    let id = kernel.creations.alloc(Creation {
        kind,
        native: false,
        bindings: Bindings::unbound(),
        props: props_root,
        class: None,
        code: None,
        rules: match kind {
            Kind::Berry => Rules::berry(),
            _ => Rules::jig(),
        },
    });
    kernel.heap.obj_mut(props_root).owner = Some(id);
    kernel.hydrating.insert(location.to_string(), id);
    let result = hydrate_body(kernel, id, location, state, kind, &resolve, timeout);
    kernel.hydrating.remove(&location.to_string());
    result?;
    Ok(id)
}

fn hydrate_body(
    kernel: &mut Kernel,
    id: CreationId,
    location: &Location,
    state: &Json,
    kind: Kind,
    resolve: &dyn Fn(&str) -> String,
    timeout: &Timeout,
) -> Result<(), KernelError> {
    if kind == Kind::Code {
        let src = state_field(state, "src")?
            .as_str()
            .ok_or_else(|| KernelError::execution("state src must be a string"))?
            .to_string();
        let logic = kernel.registry.resolve(&src)?;
        let rules = match logic.kind() {
            LogicKind::Class => Rules::code(),
            LogicKind::Sidekick => Rules::sidekick(),
        };
        let creation = kernel.creations.get_mut(id);
        creation.rules = rules;
        creation.code = Some(CodeBody {
            name: logic.name().to_string(),
            src,
            dynamic: Dynamic::new(logic),
        });
    } else {
        let cls = state_field(state, "cls")?;
        let cls_loc = cls
            .get("$jig")
            .and_then(Json::as_str)
            .ok_or_else(|| KernelError::execution("state cls must be a $jig location"))?;
        let class = materialize(kernel, &resolve(cls_loc), timeout)?;
        kernel.creations.get_mut(id).class = Some(class);
    }

    let props = state_field(state, "props")?
        .as_object()
        .ok_or_else(|| KernelError::execution("state props must be an object"))?
        .clone();

    let mut bindings = Bindings::unbound();
    if kind == Kind::Berry {
        bindings.origin = Some(location.clone());
        bindings.location = Some(location.clone());
    } else {
        let loc = props
            .get("location")
            .and_then(Json::as_str)
            .ok_or_else(|| KernelError::execution("state props lack a location"))?;
        bindings.location = Some(resolve(loc).parse()?);
        bindings.nonce = props
            .get("nonce")
            .and_then(Json::as_u64)
            .ok_or_else(|| KernelError::execution("state props lack a nonce"))?;
        let origin = props
            .get("origin")
            .and_then(Json::as_str)
            .ok_or_else(|| KernelError::execution("state props lack an origin"))?;
        bindings.origin = Some(resolve(origin).parse()?);
        if let Some(owner) = props.get("owner") {
            let value = decode_state_value(kernel, owner, resolve, timeout)?;
            let _admin = kernel.admin_guard();
            let claimed = kernel.claim(id, value)?;
            bindings.owner = Some(claimed);
        }
        if let Some(satoshis) = props.get("satoshis") {
            bindings.satoshis = Some(
                satoshis
                    .as_u64()
                    .ok_or_else(|| KernelError::execution("state satoshis must be an integer"))?,
            );
        }
    }

    let mut user = serde_json::Map::new();
    for (key, value) in props {
        if kind != Kind::Berry && crate::creation::BINDING_KEYS.contains(&key.as_str()) {
            continue;
        }
        user.insert(key, value);
    }
    let decoded = decode_state_value(kernel, &Json::Object(user), resolve, timeout)?;
    let Some(obj) = decoded.as_obj() else {
        return Err(KernelError::execution("state props must decode to an object"));
    };
    own_graph(&mut kernel.heap, &decoded, id, false);
    let creation = kernel.creations.get_mut(id);
    creation.props = obj;
    creation.bindings = bindings;
    Ok(())
}

fn decode_state_value(
    kernel: &mut Kernel,
    json: &Json,
    resolve: &dyn Fn(&str) -> String,
    timeout: &Timeout,
) -> Result<Value, KernelError> {
    // two passes: collect referenced locations, materialize them, then decode
    let mut locations = vec![];
    collect_jig_locations(json, &mut locations);
    let mut resolved = std::collections::HashMap::new();
    for loc in locations {
        let absolute = resolve(&loc);
        let id = materialize(kernel, &absolute, timeout)?;
        resolved.insert(loc, id);
    }
    Ok(decode(&mut kernel.heap, json, &mut |payload| {
        let loc = payload
            .as_str()
            .ok_or_else(|| CodecError::BadRef(payload.to_string()))?;
        resolved
            .get(loc)
            .map(|&id| Value::Creation(id))
            .ok_or_else(|| CodecError::BadRef(loc.to_string()))
    })?)
}

fn collect_jig_locations(json: &Json, out: &mut Vec<String>) {
    match json {
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some(Json::String(loc)) = map.get("$jig") {
                    out.push(loc.clone());
                    return;
                }
            }
            for value in map.values() {
                collect_jig_locations(value, out);
            }
        }
        Json::Array(elems) => {
            for value in elems {
                collect_jig_locations(value, out);
            }
        }
        _ => {}
    }
}

impl Kernel {
    /// Imports a raw transaction: extracts its metadata record, replays it, verifies the
    /// result bit-exactly and materializes its outputs.
    pub fn import(&mut self, rawtx: &str) -> Result<Vec<CreationId>, KernelError> {
        if self.atomic {
            return Err(ArgumentError::Invalid(
                "import is not allowed while a transaction is being assembled".into(),
            )
            .into());
        }
        let tx = Tx::from_hex(rawtx)
            .map_err(|e| KernelError::execution(format!("imported transaction does not parse: {e}")))?;
        let metadata = Metadata::from_tx(&tx, 0)
            .map_err(|e| KernelError::execution(e.to_string()))?;
        replay(self, &tx, &metadata, None, true)
    }

    /// Materializes a creation from a location: from the cache (trust bypass), the state
    /// server, or by fetching and replaying its transaction.
    pub fn load(&mut self, location: &str) -> Result<CreationId, KernelError> {
        if self.atomic {
            return Err(ArgumentError::Invalid(
                "load is not allowed while a transaction is being assembled".into(),
            )
            .into());
        }
        let timeout = Timeout::new("load", self.opts().timeout);
        if let Some(&id) = self.by_location.get(location) {
            if self.creations.location_of(id).map(Location::to_string).as_deref() == Some(location) {
                return Ok(id);
            }
        }
        let id = materialize(self, location, &timeout)?;
        self.by_location.insert(location.to_string(), id);
        Ok(id)
    }
}
