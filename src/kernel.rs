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

//! The kernel: arenas, the current record, collaborators and the public operation surface.
//!
//! All protocol logic runs on one task. The kernel owns the heap and creation arenas, the
//! globally-current record, the process-scoped admin flag and trust list, and the external
//! collaborators. User operations (deploy, call, new, upgrade, destroy, auth, pluck) open a
//! record scope, drive the membrane, and auto-publish when the outermost scope closes.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, DeployEntry};
use crate::creation::{Bindings, CodeBody, Creation, CreationId, Creations, Kind};
use crate::deep::{deep_clone, deep_visit};
use crate::dynamic::Dynamic;
use crate::env::{Blockchain, Cache, OwnerWallet, Purse, RawLock, StateServer};
use crate::error::{ArgumentError, KernelError, RuleError, TrustError};
use crate::location::Location;
use crate::logic::{ClassRegistry, LogicKind, ScriptLockLogic, SCRIPT_LOCK_NAME, SCRIPT_LOCK_SRC};
use crate::membrane::{Accessor, CallCtx, Rules};
use crate::queue::SerialQueue;
use crate::record::Record;
use crate::value::{Body, Heap, Value};

/// Kernel configuration.
#[derive(Clone, Debug)]
pub struct KernelOpts {
    /// Application tag written into every metadata record.
    pub app: String,
    /// Minimal satoshis of a jig output.
    pub dust: u64,
    /// Deadline applied to each externally-initiated operation.
    pub timeout: Duration,
    /// Self-replay every commit before broadcasting it.
    pub preverify: bool,
}

impl Default for KernelOpts {
    fn default() -> Self {
        KernelOpts {
            app: String::new(),
            dust: 546,
            timeout: Duration::from_secs(30),
            preverify: true,
        }
    }
}

/// One class (or sidekick function) to deploy.
#[derive(Clone, Debug, Default)]
pub struct DeploySpec {
    pub src: String,
    /// Named creation dependencies, stored under the code's `deps` property.
    pub deps: Vec<(String, CreationId)>,
    /// Initial own properties.
    pub props: Vec<(String, Value)>,
}

impl DeploySpec {
    pub fn new(src: impl ToString) -> Self { DeploySpec { src: src.to_string(), ..Default::default() } }

    pub fn dep(mut self, name: impl ToString, id: CreationId) -> Self {
        self.deps.push((name.to_string(), id));
        self
    }

    pub fn prop(mut self, name: impl ToString, value: Value) -> Self {
        self.props.push((name.to_string(), value));
        self
    }
}

pub struct Kernel {
    pub(crate) heap: Heap,
    pub(crate) creations: Creations,
    pub(crate) record: Record,
    pub(crate) registry: ClassRegistry,

    pub(crate) chain: Box<dyn Blockchain>,
    pub(crate) wallet: Box<dyn OwnerWallet>,
    pub(crate) purse: Box<dyn Purse>,
    pub(crate) cache: Box<dyn Cache>,
    pub(crate) state_server: Option<Box<dyn StateServer>>,

    pub(crate) opts: KernelOpts,
    pub(crate) trust: HashSet<String>,
    pub(crate) admin: Rc<Cell<bool>>,
    pub(crate) atomic: bool,

    pub(crate) owner_queue: SerialQueue,
    pub(crate) purse_queue: SerialQueue,

    pub(crate) record_seq: u64,
    pub(crate) script_lock: CreationId,
    /// Published/loaded creations by their current location string.
    pub(crate) by_location: HashMap<String, CreationId>,
    /// Locations being hydrated right now; lets self-referential states terminate.
    pub(crate) hydrating: HashMap<String, CreationId>,
}

/// Restores the admin flag on every exit path.
pub(crate) struct AdminGuard {
    flag: Rc<Cell<bool>>,
    prev: bool,
}

impl Drop for AdminGuard {
    fn drop(&mut self) { self.flag.set(self.prev); }
}

impl Kernel {
    pub fn new(
        chain: Box<dyn Blockchain>,
        wallet: Box<dyn OwnerWallet>,
        purse: Box<dyn Purse>,
        cache: Box<dyn Cache>,
        opts: KernelOpts,
    ) -> Self {
        let mut heap = Heap::new();
        let mut creations = Creations::default();
        let mut registry = ClassRegistry::new();
        registry.install(SCRIPT_LOCK_SRC, Arc::new(ScriptLockLogic));

        let props = heap.object();
        let script_lock = creations.alloc(Creation {
            kind: Kind::Code,
            native: true,
            bindings: Bindings::native(SCRIPT_LOCK_NAME),
            props,
            class: None,
            code: Some(CodeBody {
                name: SCRIPT_LOCK_NAME.to_string(),
                src: SCRIPT_LOCK_SRC.to_string(),
                dynamic: Dynamic::new(Arc::new(ScriptLockLogic)),
            }),
            rules: Rules::native(),
        });
        heap.obj_mut(props).owner = Some(script_lock);

        let mut by_location = HashMap::new();
        by_location.insert(format!("native://{SCRIPT_LOCK_NAME}"), script_lock);

        Kernel {
            heap,
            creations,
            record: Record::new("r00000000", true, false),
            registry,
            chain,
            wallet,
            purse,
            cache,
            state_server: None,
            opts,
            trust: HashSet::new(),
            admin: Rc::new(Cell::new(false)),
            atomic: false,
            owner_queue: SerialQueue::new("owner"),
            purse_queue: SerialQueue::new("purse"),
            record_seq: 0,
            script_lock,
            by_location,
            hydrating: HashMap::new(),
        }
    }

    pub fn with_state_server(mut self, server: Box<dyn StateServer>) -> Self {
        self.state_server = Some(server);
        self
    }

    #[inline]
    pub fn registry_mut(&mut self) -> &mut ClassRegistry { &mut self.registry }

    #[inline]
    pub fn opts(&self) -> &KernelOpts { &self.opts }

    // ------------------------------------------------------------------
    // Trust

    /// Adds a txid (or the `"*"` wildcard) to the trust list.
    pub fn trust(&mut self, txid: impl ToString) { self.trust.insert(txid.to_string()); }

    pub fn is_trusted(&self, txid: &str) -> bool {
        self.trust.contains("*") || self.trust.contains(txid)
    }

    pub(crate) fn assert_trusted(&self, txid: &str, during: &str) -> Result<(), KernelError> {
        if self.is_trusted(txid) {
            return Ok(());
        }
        Err(TrustError { txid: txid.to_string(), during: during.to_string() }.into())
    }

    // ------------------------------------------------------------------
    // Admin & scopes

    #[inline]
    pub(crate) fn is_admin(&self) -> bool { self.admin.get() }

    /// Asserts the admin bypass for the duration of the returned guard; restored on all exit
    /// paths, including unwinding.
    pub(crate) fn admin_guard(&self) -> AdminGuard {
        let prev = self.admin.replace(true);
        AdminGuard { flag: self.admin.clone(), prev }
    }

    pub(crate) fn next_record_id(&mut self) -> String {
        self.record_seq += 1;
        format!("r{:08}", self.record_seq)
    }

    fn assert_not_atomic(&self, op: &str) -> Result<(), KernelError> {
        if self.atomic {
            return Err(ArgumentError::Invalid(format!("{op} is not allowed while a transaction is being assembled")).into());
        }
        Ok(())
    }

    /// Opens a record scope around `f`; on the outermost close, commits and publishes (or
    /// rolls everything back if `f` failed).
    pub(crate) fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        self.record.begin();
        let result = f(self);
        let finished = self.record.end();
        match result {
            Ok(value) => {
                if finished {
                    if let Some(error) = self.record.error.clone() {
                        self.reset_record(None);
                        return Err(error);
                    }
                    self.finish_record()?;
                }
                Ok(value)
            }
            Err(error) => {
                if finished {
                    self.reset_record(None);
                }
                Err(error)
            }
        }
    }

    /// Discards the current record, rolling back every snapshotted creation.
    fn reset_record(&mut self, poison: Option<&str>) {
        let id = self.next_record_id();
        let autopublish = self.record.autopublish;
        let mut old = mem::replace(&mut self.record, Record::new(id, autopublish, false));
        old.rollback(&mut self.creations, &mut self.heap, poison);
    }

    /// Converts a finished record into a commit and publishes it.
    fn finish_record(&mut self) -> Result<(), KernelError> {
        if self.record.actions.is_empty() || !self.record.autopublish || self.record.replaying {
            return Ok(());
        }
        let id = self.next_record_id();
        let record = mem::replace(&mut self.record, Record::new(id, true, false));
        match crate::publish::publish_record(self, record) {
            Ok(_txid) => Ok(()),
            Err((mut record, error)) => {
                record.rollback(&mut self.creations, &mut self.heap, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    /// Assembles a multi-action transaction: every action recorded inside `f` lands in one
    /// record, published once at the end. Operations that would spawn or observe other
    /// records (load, sync, pluck) are blocked for the duration.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        self.assert_not_atomic("transaction")?;
        self.atomic = true;
        let result = self.transact(f);
        self.atomic = false;
        result
    }

    // ------------------------------------------------------------------
    // Top-level operations

    /// Deploys one or more classes as a single DEPLOY action.
    pub fn deploy(&mut self, specs: Vec<DeploySpec>) -> Result<Vec<CreationId>, KernelError> {
        if specs.is_empty() {
            return Err(ArgumentError::Invalid("nothing to deploy".into()).into());
        }
        self.transact(|kernel| {
            let _admin = kernel.admin_guard();
            let mut ids = Vec::with_capacity(specs.len());
            let mut entries = Vec::with_capacity(specs.len());
            for spec in &specs {
                let logic = kernel.registry.resolve(&spec.src)?;
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
                        src: spec.src.clone(),
                        dynamic: Dynamic::new(logic),
                    }),
                    rules,
                });
                kernel.heap.obj_mut(props).owner = Some(id);
                kernel.record.create(&kernel.creations, &mut kernel.heap, id)?;
                ids.push(id);
            }
            for (spec, &id) in specs.iter().zip(&ids) {
                let props = kernel.creations.get(id).props;
                if !spec.deps.is_empty() {
                    let deps = kernel.heap.object();
                    for (name, dep) in &spec.deps {
                        kernel.record.read(&kernel.creations, *dep)?;
                        if let Some(map) = kernel.heap.obj_mut(deps).body.props_mut() {
                            map.insert(name.clone(), Value::Creation(*dep));
                        }
                    }
                    kernel.heap.obj_mut(deps).owner = Some(id);
                    if let Some(map) = kernel.heap.obj_mut(props).body.props_mut() {
                        map.insert("deps".into(), Value::Obj(deps));
                    }
                }
                for (name, value) in &spec.props {
                    kernel.assert_serializable(value)?;
                    let claimed = kernel.claim(id, value.clone())?;
                    kernel.record_reads_of(&claimed)?;
                    if let Some(map) = kernel.heap.obj_mut(props).body.props_mut() {
                        map.insert(name.clone(), claimed);
                    }
                }
                let snapshot = deep_clone(&mut kernel.heap, &Value::Obj(props));
                entries.push(DeployEntry {
                    code: id,
                    src: spec.src.clone(),
                    props: snapshot,
                });
            }
            kernel
                .record
                .action(&mut kernel.creations, Action::Deploy(entries))?;
            Ok(ids)
        })
    }

    /// Upgrades a deployed class to new source and properties.
    pub fn upgrade(
        &mut self,
        target: CreationId,
        src: impl ToString,
        props: Vec<(String, Value)>,
    ) -> Result<(), KernelError> {
        let src = src.to_string();
        self.transact(|kernel| {
            let creation = kernel.creations.get(target);
            if creation.native || creation.code.is_none() {
                return Err(ArgumentError::Invalid("upgrade target is not deployed code".into()).into());
            }
            if creation.bindings.is_destroyed() {
                return Err(RuleError::Destroyed(kernel.creations.name_of(target)).into());
            }
            let logic = kernel.registry.resolve(&src)?;
            let _admin = kernel.admin_guard();
            kernel
                .record
                .update(&kernel.creations, &mut kernel.heap, target)?;

            let code = kernel.creations.get_mut(target).code.as_mut().expect("checked above");
            code.dynamic.swap(logic.clone())?;
            code.src = src.clone();
            code.name = logic.name().to_string();

            let fresh = kernel.heap.object();
            kernel.heap.obj_mut(fresh).owner = Some(target);
            kernel.creations.get_mut(target).props = fresh;
            for (name, value) in &props {
                kernel.assert_serializable(value)?;
                let claimed = kernel.claim(target, value.clone())?;
                kernel.record_reads_of(&claimed)?;
                if let Some(map) = kernel.heap.obj_mut(fresh).body.props_mut() {
                    map.insert(name.clone(), claimed);
                }
            }
            let snapshot = deep_clone(&mut kernel.heap, &Value::Obj(fresh));
            kernel.record.action(
                &mut kernel.creations,
                Action::Upgrade { target, src, props: snapshot },
            )?;
            Ok(())
        })
    }

    /// Instantiates a jig (the NEW action).
    pub fn new_jig(&mut self, class: CreationId, args: Vec<Value>) -> Result<CreationId, KernelError> {
        self.transact(|kernel| {
            let value = kernel.instantiate(Accessor::Host, class, args)?;
            value
                .as_creation()
                .ok_or_else(|| KernelError::internal("instantiate did not return a creation"))
        })
    }

    /// Calls a method from outside the sandbox.
    pub fn call(
        &mut self,
        target: CreationId,
        method: impl ToString,
        args: Vec<Value>,
    ) -> Result<Value, KernelError> {
        let method = method.to_string();
        self.transact(|kernel| kernel.method_call(Accessor::Host, target, &method, args))
    }

    /// Destroys a creation: empties its UTXO bindings, terminally.
    pub fn destroy(&mut self, target: CreationId) -> Result<(), KernelError> {
        self.call(target, "destroy", vec![]).map(|_| ())
    }

    /// Forces a creation into the next transaction's inputs without changing its state.
    pub fn auth(&mut self, target: CreationId) -> Result<(), KernelError> {
        self.call(target, "auth", vec![]).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Binding access (host side)

    fn bindings_of(&self, id: CreationId) -> &Bindings { &self.creations.get(id).bindings }

    pub fn location_of(&self, id: CreationId) -> Result<String, KernelError> {
        self.bindings_of(id)
            .location
            .as_ref()
            .map(Location::to_string)
            .ok_or_else(|| RuleError::ReadBinding("location".into(), "undetermined".into()).into())
    }

    pub fn origin_of(&self, id: CreationId) -> Result<String, KernelError> {
        self.bindings_of(id)
            .origin
            .as_ref()
            .map(Location::to_string)
            .ok_or_else(|| RuleError::ReadBinding("origin".into(), "undetermined".into()).into())
    }

    pub fn nonce_of(&self, id: CreationId) -> u64 { self.bindings_of(id).nonce }

    pub fn owner_of(&self, id: CreationId) -> Result<Value, KernelError> {
        self.bindings_of(id)
            .owner
            .clone()
            .ok_or_else(|| RuleError::ReadBinding("owner".into(), "undetermined".into()).into())
    }

    pub fn satoshis_of(&self, id: CreationId) -> Result<u64, KernelError> {
        self.bindings_of(id)
            .satoshis
            .ok_or_else(|| RuleError::ReadBinding("satoshis".into(), "undetermined".into()).into())
    }

    /// Origin-equality `instanceof`.
    pub fn instance_of(&self, id: CreationId, class: CreationId) -> bool {
        self.creations.instance_of(id, class)
    }

    /// Reads a property of a creation from outside the sandbox.
    pub fn get(&mut self, target: CreationId, key: &str) -> Result<Value, KernelError> {
        self.prop_get(Accessor::Host, Value::Creation(target), key)
    }

    // ------------------------------------------------------------------
    // Value construction (host side)

    pub fn new_object(&mut self, pairs: Vec<(&str, Value)>) -> Value {
        let id = self.heap.object();
        for (key, value) in pairs {
            if let Some(props) = self.heap.obj_mut(id).body.props_mut() {
                props.insert(key.to_string(), value);
            }
        }
        Value::Obj(id)
    }

    pub fn new_array(&mut self, elems: Vec<Value>) -> Value {
        let id = self.heap.array();
        if let Body::Array { elems: slots, .. } = &mut self.heap.obj_mut(id).body {
            slots.extend(elems.into_iter().map(Some));
        }
        Value::Obj(id)
    }

    pub fn new_bytes(&mut self, data: Vec<u8>) -> Value {
        let id = self.heap.bytes(data);
        Value::Obj(id)
    }

    #[inline]
    pub fn heap(&self) -> &Heap { &self.heap }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap { &mut self.heap }

    // ------------------------------------------------------------------
    // Locks

    /// Renders a raw lock as an owner value: an arbitrary instance of the native
    /// `ScriptLock` class.
    pub(crate) fn lock_value(&mut self, lock: &RawLock) -> Value {
        let obj = self.heap.arbitrary(self.script_lock);
        let script = self.heap.bytes(lock.script.clone());
        if let Some(props) = self.heap.obj_mut(obj).body.props_mut() {
            props.insert("domain".into(), Value::Number(lock.domain as f64));
            props.insert("script".into(), Value::Obj(script));
        }
        Value::Obj(obj)
    }

    /// Extracts the raw lock from an owner value, when it is a `ScriptLock` instance.
    pub(crate) fn value_lock(&self, owner: &Value) -> Option<RawLock> {
        let obj = owner.as_obj()?;
        let Body::Object { class: Some(class), props } = &self.heap.obj(obj).body else {
            return None;
        };
        let same = *class == self.script_lock
            || self.creations.origin_of(*class) == self.creations.origin_of(self.script_lock);
        if !same {
            return None;
        }
        let domain = props.get("domain")?.as_number()? as usize;
        let script = match &self.heap.obj(props.get("script")?.as_obj()?).body {
            Body::Bytes(data) => data.clone(),
            _ => return None,
        };
        Some(RawLock { script, domain })
    }

    /// Records reads of every creation referenced inside a value graph.
    pub(crate) fn record_reads_of(&mut self, value: &Value) -> Result<(), KernelError> {
        let mut found = vec![];
        deep_visit(&self.heap, value, &mut |v| {
            if let Some(id) = v.as_creation() {
                found.push(id);
            }
        });
        for id in found {
            if !self.record.creates.contains_identity(id) {
                self.record.read(&self.creations, id)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Berries

    /// Plucks a berry: constructs an immutable read-only creation through the class's
    /// `pluck` logic. No write actions are allowed; nothing is recorded on the current
    /// record.
    pub fn pluck(&mut self, class: CreationId, path: &str) -> Result<CreationId, KernelError> {
        self.assert_not_atomic("pluck")?;
        let creation = self.creations.get(class);
        if creation.code.is_none() {
            return Err(ArgumentError::Invalid("pluck class is not code".into()).into());
        }
        let class_location = creation.bindings.location.clone();
        let logic = self
            .creations
            .logic(class)
            .ok_or_else(|| KernelError::from(ArgumentError::Invalid("pluck class has no logic".into())))?;

        let props = self.heap.object();
        let berry = self.creations.alloc(Creation {
            kind: Kind::Berry,
            native: false,
            bindings: Bindings::unbound(),
            props,
            class: Some(class),
            code: None,
            rules: Rules::berry_init(),
        });
        self.heap.obj_mut(props).owner = Some(berry);

        // run the pluck in a throwaway record so that any write action is detectable
        let scratch = Record::new(self.next_record_id(), false, false);
        let saved = mem::replace(&mut self.record, scratch);
        self.record.push(berry);
        let result = logic.pluck(&mut CallCtx::new(self, berry), path);
        self.record.pop();
        let scratch = mem::replace(&mut self.record, saved);
        result?;
        if !scratch.actions.is_empty()
            || !scratch.updates.is_empty()
            || !scratch.deletes.is_empty()
        {
            return Err(RuleError::BerryUpdate.into());
        }
        for obj in scratch.pending {
            self.heap.obj_mut(obj).pending = false;
        }

        // freeze and address the berry
        self.creations.get_mut(berry).rules = Rules::berry();
        let state = crate::commit::berry_state(self, berry)?;
        let hash = crate::commit::hash_state(&state);
        let location = match class_location {
            Some(Location::Tx { txid, slot: crate::location::Slot::Output, index }) => {
                Location::Berry { txid, index, path: path.to_string(), hash }
            }
            _ => Location::Native(format!("{}?berry={path}", self.creations.name_of(class))),
        };
        let bindings = &mut self.creations.get_mut(berry).bindings;
        bindings.origin = Some(location.clone());
        bindings.location = Some(location.clone());
        self.by_location.insert(location.to_string(), berry);
        let _ = self.cache.set(&format!("berry://{location}"), state);
        Ok(berry)
    }
}
