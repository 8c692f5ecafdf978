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

//! The membrane: every access to a creation or one of its owned inner objects goes through
//! the trap methods in this module, which enforce access, mutation, serializability and
//! record-keeping rules.
//!
//! There is no proxy type: heap objects carry their owning creation, and the traps are
//! explicit kernel methods driven either by the host (through [`Kernel`](crate::kernel::Kernel)
//! operations) or by method bodies (through [`CallCtx`]). A process-scoped admin flag
//! disables all rules for the kernel's own internals, scoped to a guard restored on every
//! exit path.

use std::collections::HashMap;

use crate::action::Action;
use crate::creation::{is_binding, Bindings, Creation, CreationId, Kind};
use crate::deep::{deep_clone, deep_replace};
use crate::error::{ArgumentError, ExecutionError, KernelError, RuleError, WorldviewError};
use crate::kernel::Kernel;
use crate::location::Location;
use crate::value::{Body, Heap, ObjId, Value};

/// Method names that may never be overridden or assigned.
pub const FINAL_METHODS: [&str; 2] = ["destroy", "auth"];

/// Maximal satoshis assignable to a single creation.
pub const MAX_SATOSHIS: u64 = 2_100_000_000_000_000;

/// Per-creation rule set controlling what the traps allow and record.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Rules {
    /// All writes rejected (berries after pluck, natives, sidekick code).
    pub immutable: bool,
    /// `_`-prefix privacy enforced.
    pub privacy: bool,
    /// Owner/satoshis binding slots present.
    pub has_utxo: bool,
    /// Reads are recorded on the current record.
    pub record_reads: bool,
    /// Updates are recorded (and snapshotted) on the current record.
    pub record_updates: bool,
    /// Crossing calls emit CALL actions; off means passthrough.
    pub record_calls: bool,
    /// Updates may only run inside one of the creation's own methods.
    pub smart: bool,
}

impl Rules {
    pub fn code() -> Self {
        Rules {
            immutable: false,
            privacy: true,
            has_utxo: true,
            record_reads: true,
            record_updates: true,
            record_calls: true,
            smart: true,
        }
    }

    pub fn jig() -> Self { Rules::code() }

    /// A berry while its `pluck` initializer runs: writable by itself, nothing recorded.
    pub fn berry_init() -> Self {
        Rules {
            immutable: false,
            privacy: true,
            has_utxo: false,
            record_reads: false,
            record_updates: false,
            record_calls: false,
            smart: true,
        }
    }

    pub fn berry() -> Self { Rules { immutable: true, ..Rules::berry_init() } }

    /// Stateless deployed functions: immutable, passthrough calls.
    pub fn sidekick() -> Self {
        Rules {
            immutable: true,
            privacy: true,
            has_utxo: true,
            record_reads: true,
            record_updates: false,
            record_calls: false,
            smart: false,
        }
    }

    pub fn native() -> Self {
        Rules {
            immutable: true,
            privacy: false,
            has_utxo: false,
            record_reads: false,
            record_updates: false,
            record_calls: false,
            smart: false,
        }
    }
}

/// Who is performing an access: the host (outside the sandbox) or a creation's method.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Accessor {
    Host,
    Creation(CreationId),
}

/// Where a property access lands.
enum Place {
    /// An unowned heap object: plain data, no rules.
    Free(ObjId),
    /// A creation or one of its owned inner objects.
    Rooted {
        root: CreationId,
        obj: ObjId,
        /// Whether the access targets the creation itself (bindings live only there).
        is_root: bool,
    },
}

/// Claims ownership over every reachable unowned object; returns the claimed handles.
pub(crate) fn own_graph(heap: &mut Heap, value: &Value, owner: CreationId, pending: bool) -> Vec<ObjId> {
    let mut claimed = vec![];
    let mut stack = vec![value.clone()];
    let mut seen = std::collections::HashSet::new();
    while let Some(value) = stack.pop() {
        let Some(id) = value.as_obj() else { continue };
        if !seen.insert(id) {
            continue;
        }
        match heap.obj(id).owner {
            None => {
                let obj = heap.obj_mut(id);
                obj.owner = Some(owner);
                obj.pending = pending;
                claimed.push(id);
            }
            Some(own) if own == owner => {}
            Some(_) => continue,
        }
        match &heap.obj(id).body {
            Body::Object { props, .. } => stack.extend(props.values().cloned()),
            Body::Array { elems, props } => {
                stack.extend(elems.iter().flatten().cloned());
                stack.extend(props.values().cloned());
            }
            Body::Set { entries, props } => {
                stack.extend(entries.iter().cloned());
                stack.extend(props.values().cloned());
            }
            Body::Map { entries, props } => {
                for (k, v) in entries {
                    stack.push(k.clone());
                    stack.push(v.clone());
                }
                stack.extend(props.values().cloned());
            }
            Body::Bytes(_) => {}
        }
    }
    claimed
}

/// Execution context handed to method bodies: the only way user logic touches the world.
pub struct CallCtx<'k> {
    kernel: &'k mut Kernel,
    receiver: CreationId,
}

impl<'k> CallCtx<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, receiver: CreationId) -> Self {
        CallCtx { kernel, receiver }
    }

    #[inline]
    pub fn receiver(&self) -> CreationId { self.receiver }

    #[inline]
    pub fn this(&self) -> Value { Value::Creation(self.receiver) }

    /// The creation (if any) directly below the receiver on the call stack.
    pub fn caller(&self) -> Option<CreationId> { self.kernel.record.caller() }

    pub fn get(&mut self, target: &Value, key: &str) -> Result<Value, KernelError> {
        self.kernel
            .prop_get(Accessor::Creation(self.receiver), target.clone(), key)
    }

    pub fn get_this(&mut self, key: &str) -> Result<Value, KernelError> {
        let this = self.this();
        self.get(&this, key)
    }

    pub fn set(&mut self, target: &Value, key: &str, value: Value) -> Result<(), KernelError> {
        self.kernel
            .prop_set(Accessor::Creation(self.receiver), target.clone(), key, value)
    }

    pub fn set_this(&mut self, key: &str, value: Value) -> Result<(), KernelError> {
        let this = self.this();
        self.set(&this, key, value)
    }

    pub fn delete(&mut self, target: &Value, key: &str) -> Result<(), KernelError> {
        self.kernel
            .prop_delete(Accessor::Creation(self.receiver), target.clone(), key)
    }

    pub fn delete_this(&mut self, key: &str) -> Result<(), KernelError> {
        let this = self.this();
        self.delete(&this, key)
    }

    pub fn call(&mut self, target: CreationId, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.kernel
            .method_call(Accessor::Creation(self.receiver), target, method, args)
    }

    pub fn call_this(&mut self, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.call(self.receiver, method, args)
    }

    pub fn new_jig(&mut self, class: CreationId, args: Vec<Value>) -> Result<Value, KernelError> {
        self.kernel
            .instantiate(Accessor::Creation(self.receiver), class, args)
    }

    pub fn destroy(&mut self, target: CreationId) -> Result<(), KernelError> {
        self.call(target, "destroy", vec![]).map(|_| ())
    }

    pub fn auth(&mut self, target: CreationId) -> Result<(), KernelError> {
        self.call(target, "auth", vec![]).map(|_| ())
    }

    pub fn instance_of(&self, value: &Value, class: CreationId) -> bool {
        match value {
            Value::Creation(id) => self.kernel.creations.instance_of(*id, class),
            Value::Obj(obj) => match &self.kernel.heap.obj(*obj).body {
                Body::Object { class: Some(own), .. } => {
                    *own == class
                        || self.kernel.creations.origin_of(*own) == self.kernel.creations.origin_of(class)
                }
                _ => false,
            },
            _ => false,
        }
    }

    // value construction

    pub fn object(&mut self) -> Value { Value::Obj(self.kernel.heap.object()) }

    pub fn object_with(&mut self, pairs: Vec<(&str, Value)>) -> Value {
        self.kernel.new_object(pairs)
    }

    pub fn array(&mut self, elems: Vec<Value>) -> Value { self.kernel.new_array(elems) }

    pub fn set_new(&mut self) -> Value { Value::Obj(self.kernel.heap.set()) }

    pub fn map_new(&mut self) -> Value { Value::Obj(self.kernel.heap.map()) }

    pub fn bytes(&mut self, data: Vec<u8>) -> Value { self.kernel.new_bytes(data) }

    pub fn set_add(&mut self, set: &Value, member: Value) -> Result<bool, KernelError> {
        let Some(id) = set.as_obj() else {
            return Err(ArgumentError::Invalid("set_add target is not a set".into()).into());
        };
        self.touch(id)?;
        Ok(self.kernel.heap.set_add(id, member))
    }

    pub fn map_set(&mut self, map: &Value, key: Value, value: Value) -> Result<(), KernelError> {
        let Some(id) = map.as_obj() else {
            return Err(ArgumentError::Invalid("map_set target is not a map".into()).into());
        };
        self.touch(id)?;
        self.kernel.heap.map_set(id, key, value);
        Ok(())
    }

    pub fn array_push(&mut self, array: &Value, value: Value) -> Result<(), KernelError> {
        let Some(id) = array.as_obj() else {
            return Err(ArgumentError::Invalid("array_push target is not an array".into()).into());
        };
        self.touch(id)?;
        if let Body::Array { elems, .. } = &mut self.kernel.heap.obj_mut(id).body {
            elems.push(Some(value));
        }
        Ok(())
    }

    /// Pre-flight for container mutation helpers: owned containers go through the same
    /// update rules as property writes.
    fn touch(&mut self, obj: ObjId) -> Result<(), KernelError> {
        let Some(root) = self.kernel.heap.obj(obj).owner else { return Ok(()) };
        self.kernel
            .assert_updatable(Accessor::Creation(self.receiver), root)?;
        if self.kernel.creations.get(root).rules.record_updates {
            self.kernel
                .record
                .update(&self.kernel.creations, &mut self.kernel.heap, root)?;
        }
        Ok(())
    }
}

impl Kernel {
    fn place(&self, target: &Value) -> Result<Place, KernelError> {
        match target {
            Value::Creation(id) => Ok(Place::Rooted {
                root: *id,
                obj: self.creations.get(*id).props,
                is_root: true,
            }),
            Value::Obj(obj) => Ok(match self.heap.obj(*obj).owner {
                Some(root) => Place::Rooted { root, obj: *obj, is_root: false },
                None => Place::Free(*obj),
            }),
            other => Err(ArgumentError::Invalid(format!("cannot access properties of {}", other.type_name())).into()),
        }
    }

    fn rethrow(&self) -> Result<(), KernelError> {
        match (&self.record.error, self.is_admin()) {
            (Some(error), false) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    /// A creation whose first publish failed carries `error://` bindings forever; it stays
    /// observable but rejects every further use.
    fn assert_not_poisoned(&self, id: CreationId) -> Result<(), KernelError> {
        if let Some(Location::Error(reason)) = &self.creations.get(id).bindings.location {
            return Err(KernelError::execution(format!(
                "{} failed to publish: {reason}",
                self.creations.name_of(id)
            )));
        }
        Ok(())
    }

    /// Family relation for privacy: a creation, its class, its instances, and same-class
    /// siblings may access each other's privates.
    fn family(&self, accessor: CreationId, target: CreationId) -> bool {
        accessor == target
            || self.creations.class_of(accessor) == self.creations.class_of(target)
            || accessor == self.creations.class_of(target)
            || self.creations.class_of(accessor) == target
    }

    fn raw_get(&self, obj: ObjId, key: &str) -> Value {
        match &self.heap.obj(obj).body {
            Body::Array { elems, props } => {
                if key == "length" {
                    return Value::Number(elems.len() as f64);
                }
                if let Ok(n) = key.parse::<usize>() {
                    return elems.get(n).cloned().flatten().unwrap_or(Value::Undefined);
                }
                props.get(key).cloned().unwrap_or(Value::Undefined)
            }
            Body::Bytes(data) => {
                if key == "length" {
                    return Value::Number(data.len() as f64);
                }
                match key.parse::<usize>() {
                    Ok(n) => data
                        .get(n)
                        .map(|b| Value::Number(*b as f64))
                        .unwrap_or(Value::Undefined),
                    Err(_) => Value::Undefined,
                }
            }
            body => body
                .props()
                .and_then(|props| props.get(key))
                .cloned()
                .unwrap_or(Value::Undefined),
        }
    }

    fn raw_set(&mut self, obj: ObjId, key: &str, value: Value) -> Result<(), KernelError> {
        if crate::codec::RESERVED_KEYS.contains(&key) {
            return Err(ArgumentError::Reserved(key.to_string()).into());
        }
        match &mut self.heap.obj_mut(obj).body {
            Body::Array { elems, props } => {
                if key == "length" {
                    let n = value.as_number().unwrap_or(f64::NAN);
                    if n.fract() != 0.0 || n < 0.0 {
                        return Err(ArgumentError::Invalid("invalid array length".into()).into());
                    }
                    elems.resize(n as usize, None);
                    return Ok(());
                }
                if let Ok(n) = key.parse::<usize>() {
                    if elems.len() <= n {
                        elems.resize(n + 1, None);
                    }
                    elems[n] = Some(value);
                    return Ok(());
                }
                props.insert(key.to_string(), value);
                Ok(())
            }
            Body::Bytes(data) => {
                let (Ok(n), Some(byte)) = (key.parse::<usize>(), value.as_number()) else {
                    return Err(ArgumentError::Invalid("byte arrays only take indexed bytes".into()).into());
                };
                if byte.fract() != 0.0 || !(0.0..=255.0).contains(&byte) || n >= data.len() {
                    return Err(ArgumentError::Invalid("invalid byte assignment".into()).into());
                }
                data[n] = byte as u8;
                Ok(())
            }
            body => {
                body.props_mut()
                    .expect("props on non-bytes bodies")
                    .insert(key.to_string(), value);
                Ok(())
            }
        }
    }

    pub(crate) fn binding_value(&self, id: CreationId, key: &str) -> Result<Value, KernelError> {
        let undetermined =
            |key: &str| KernelError::from(RuleError::ReadBinding(key.into(), "undetermined".into()));
        let bindings = &self.creations.get(id).bindings;
        match key {
            "location" => bindings
                .location
                .as_ref()
                .map(|l| Value::String(l.to_string()))
                .ok_or_else(|| undetermined(key)),
            "origin" => bindings
                .origin
                .as_ref()
                .map(|l| Value::String(l.to_string()))
                .ok_or_else(|| undetermined(key)),
            "nonce" => Ok(Value::Number(bindings.nonce as f64)),
            "owner" if self.creations.get(id).rules.has_utxo => {
                bindings.owner.clone().ok_or_else(|| undetermined(key))
            }
            "satoshis" if self.creations.get(id).rules.has_utxo => bindings
                .satoshis
                .map(|n| Value::Number(n as f64))
                .ok_or_else(|| undetermined(key)),
            _ => Ok(Value::Undefined),
        }
    }

    // ------------------------------------------------------------------
    // get / set / delete traps

    pub(crate) fn prop_get(&mut self, who: Accessor, target: Value, key: &str) -> Result<Value, KernelError> {
        self.rethrow()?;
        match self.place(&target)? {
            Place::Free(obj) => Ok(self.raw_get(obj, key)),
            Place::Rooted { root, obj, is_root } => {
                let rules = self.creations.get(root).rules;
                let admin = self.is_admin();
                if is_root && is_binding(key) && !admin {
                    return match who {
                        Accessor::Creation(c) if c != root => Ok(Value::Undefined),
                        _ => self.binding_value(root, key),
                    };
                }
                let value = self.raw_get(obj, key);
                if !admin
                    && rules.privacy
                    && key.starts_with('_')
                    && !matches!(value, Value::Undefined)
                {
                    if let Accessor::Creation(c) = who {
                        if !self.family(c, root) {
                            return Err(RuleError::PrivateGet(key.to_string()).into());
                        }
                    }
                }
                if rules.record_reads && !admin {
                    self.record.read(&self.creations, root)?;
                }
                Ok(value)
            }
        }
    }

    /// Common mutation preconditions for a rooted place.
    pub(crate) fn assert_updatable(&self, who: Accessor, root: CreationId) -> Result<(), KernelError> {
        if self.is_admin() {
            return Ok(());
        }
        let creation = self.creations.get(root);
        let rules = creation.rules;
        if creation.bindings.is_destroyed() {
            return Err(RuleError::Destroyed(self.creations.name_of(root)).into());
        }
        self.assert_not_poisoned(root)?;
        if rules.immutable {
            return Err(RuleError::Immutable(self.creations.name_of(root)).into());
        }
        if rules.smart {
            match who {
                Accessor::Creation(c) if c == root => {}
                Accessor::Creation(c) if self.creations.get(c).is_sidekick() => {
                    return Err(RuleError::SidekickUpdate.into())
                }
                Accessor::Creation(_) | Accessor::Host => {
                    return Err(RuleError::OutsideMethod(self.creations.name_of(root)).into())
                }
            }
        }
        Ok(())
    }

    pub(crate) fn prop_set(
        &mut self,
        who: Accessor,
        target: Value,
        key: &str,
        value: Value,
    ) -> Result<(), KernelError> {
        self.rethrow()?;
        match self.place(&target)? {
            Place::Free(obj) => self.raw_set(obj, key, value),
            Place::Rooted { root, obj, is_root } => {
                if self.is_admin() {
                    let claimed = self.claim(root, value)?;
                    return self.raw_set(obj, key, claimed);
                }
                self.assert_updatable(who, root)?;
                if FINAL_METHODS.contains(&key) {
                    return Err(RuleError::FinalMethod(key.to_string()).into());
                }
                if is_root && is_binding(key) {
                    return self.binding_set(root, key, value);
                }
                self.assert_serializable(&value)?;
                if self.creations.get(root).rules.record_updates {
                    self.record
                        .update(&self.creations, &mut self.heap, root)?;
                }
                let claimed = self.claim(root, value)?;
                self.record_reads_of(&claimed)?;
                self.raw_set(obj, key, claimed)
            }
        }
    }

    /// UTXO bindings (owner, satoshis) are assignable from inside methods and unbind the
    /// creation; location bindings never are.
    fn binding_set(&mut self, root: CreationId, key: &str, value: Value) -> Result<(), KernelError> {
        if !self.creations.get(root).rules.has_utxo || matches!(key, "location" | "origin" | "nonce") {
            return Err(RuleError::SetBinding(key.to_string()).into());
        }
        match key {
            "owner" => {
                if matches!(value, Value::Null | Value::Undefined) {
                    return Err(RuleError::SetBinding("owner".to_string()).into());
                }
                self.assert_serializable(&value)?;
                self.record.update(&self.creations, &mut self.heap, root)?;
                let claimed = self.claim(root, value)?;
                self.record_reads_of(&claimed)?;
                self.creations.get_mut(root).bindings.owner = Some(claimed);
            }
            "satoshis" => {
                let n = value.as_number().unwrap_or(f64::NAN);
                if n.fract() != 0.0 || !(0.0..=MAX_SATOSHIS as f64).contains(&n) {
                    return Err(ArgumentError::Invalid("satoshis must be a non-negative integer".into()).into());
                }
                self.record.update(&self.creations, &mut self.heap, root)?;
                self.creations.get_mut(root).bindings.satoshis = Some(n as u64);
            }
            _ => unreachable!("binding_set called for non-binding"),
        }
        self.record.unbound.add(&self.creations, root)?;
        Ok(())
    }

    pub(crate) fn prop_delete(&mut self, who: Accessor, target: Value, key: &str) -> Result<(), KernelError> {
        self.rethrow()?;
        match self.place(&target)? {
            Place::Free(obj) => {
                if let Some(props) = self.heap.obj_mut(obj).body.props_mut() {
                    props.shift_remove(key);
                }
                Ok(())
            }
            Place::Rooted { root, obj, is_root } => {
                if !self.is_admin() {
                    self.assert_updatable(who, root)?;
                    if is_root && is_binding(key) {
                        return Err(RuleError::DeleteBinding(key.to_string()).into());
                    }
                    if FINAL_METHODS.contains(&key) {
                        return Err(RuleError::FinalMethod(key.to_string()).into());
                    }
                    if self.creations.get(root).rules.record_updates {
                        self.record.update(&self.creations, &mut self.heap, root)?;
                    }
                }
                if let Some(props) = self.heap.obj_mut(obj).body.props_mut() {
                    props.shift_remove(key);
                }
                Ok(())
            }
        }
    }

    /// Always rejected on membrane targets: freezing a creation would make replay-time
    /// claims unverifiable.
    pub fn prevent_extensions(&mut self, _target: CreationId) -> Result<(), KernelError> {
        Err(RuleError::PreventExtensions.into())
    }

    // ------------------------------------------------------------------
    // Ownership claims

    /// Claims a value for a creation: primitives by value, creations by reference, foreign
    /// owned objects by deep clone (stripping their membranes), unowned objects by adoption
    /// (pending while a method runs).
    pub(crate) fn claim(&mut self, owner: CreationId, value: Value) -> Result<Value, KernelError> {
        let Some(obj) = value.as_obj() else { return Ok(value) };
        match self.heap.obj(obj).owner {
            Some(own) if own == owner => Ok(value),
            Some(_) => {
                let cloned = deep_clone(&mut self.heap, &value);
                own_graph(&mut self.heap, &cloned, owner, false);
                Ok(cloned)
            }
            None => {
                let pending = !self.record.stack.is_empty();
                let claimed = own_graph(&mut self.heap, &value, owner, pending);
                if pending {
                    self.record.pending.extend(claimed);
                }
                Ok(value)
            }
        }
    }

    /// Validates and seals every pending claim once the outermost crossing call completed.
    pub(crate) fn finalize_pending(&mut self) -> Result<(), KernelError> {
        let pending = std::mem::take(&mut self.record.pending);
        for obj in &pending {
            self.assert_serializable(&Value::Obj(*obj))?;
        }
        for obj in pending {
            self.heap.obj_mut(obj).pending = false;
        }
        Ok(())
    }

    /// The serializable universe: primitives, plain objects/arrays, sets, maps, byte
    /// arrays, arbitrary objects whose class is deployed code, and creation references.
    /// Reserved keys reject anywhere in the graph.
    pub(crate) fn assert_serializable(&self, value: &Value) -> Result<(), KernelError> {
        let mut stack = vec![value.clone()];
        let mut seen = std::collections::HashSet::new();
        while let Some(value) = stack.pop() {
            let Some(id) = value.as_obj() else { continue };
            if !seen.insert(id) {
                continue;
            }
            let body = &self.heap.obj(id).body;
            if let Body::Object { class: Some(class), .. } = body {
                if self.creations.get(*class).code.is_none() {
                    return Err(KernelError::Codec(crate::codec::CodecError::Unsupported(
                        "arbitrary object of a non-code class".into(),
                    )));
                }
            }
            if let Some(props) = body.props() {
                for key in props.keys() {
                    if crate::codec::RESERVED_KEYS.contains(&key.as_str()) {
                        return Err(ArgumentError::Reserved(key.clone()).into());
                    }
                }
                stack.extend(props.values().cloned());
            }
            match body {
                Body::Array { elems, .. } => stack.extend(elems.iter().flatten().cloned()),
                Body::Set { entries, .. } => stack.extend(entries.iter().cloned()),
                Body::Map { entries, .. } => {
                    for (k, v) in entries {
                        stack.push(k.clone());
                        stack.push(v.clone());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worldview unification

    /// Resolves same-origin duplicates among the arguments to the record's view, failing on
    /// location disagreement.
    fn unify_args(&mut self, receiver: CreationId, args: Vec<Value>) -> Result<Vec<Value>, KernelError> {
        let mut world: HashMap<Location, (CreationId, Option<Location>)> = HashMap::new();
        for id in std::iter::once(receiver).chain(self.record.known()) {
            if let Some(origin) = self.creations.origin_of(id).filter(|o| o.is_global()) {
                let location = self.creations.location_of(id).cloned();
                world.entry(origin.clone()).or_insert((id, location));
            }
        }
        let mut failure: Option<WorldviewError> = None;
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let unified = deep_replace(&mut self.heap, arg, &mut |value, _| {
                let id = value.as_creation()?;
                let origin = self.creations.origin_of(id).filter(|o| o.is_global())?.clone();
                let location = self.creations.location_of(id).cloned();
                match world.get(&origin) {
                    Some((canon, canon_loc)) if *canon != id => {
                        if *canon_loc == location {
                            Some(Value::Creation(*canon))
                        } else {
                            let show = |l: &Option<Location>| {
                                l.as_ref().map(Location::to_string).unwrap_or_else(|| "?".into())
                            };
                            failure.get_or_insert(WorldviewError::Inconsistent {
                                origin: origin.to_string(),
                                a: show(canon_loc),
                                b: show(&location),
                            });
                            None
                        }
                    }
                    Some(_) => None,
                    None => {
                        world.insert(origin, (id, location));
                        None
                    }
                }
            });
            out.push(unified);
        }
        match failure {
            Some(error) => Err(error.into()),
            None => Ok(out),
        }
    }

    // ------------------------------------------------------------------
    // Calls

    pub(crate) fn method_call(
        &mut self,
        who: Accessor,
        target: CreationId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, KernelError> {
        self.rethrow()?;
        match method {
            "destroy" => return self.destroy_trap(target),
            "auth" => return self.auth_trap(target),
            _ => {}
        }
        let creation = self.creations.get(target);
        let rules = creation.rules;
        let name = self.creations.name_of(target);
        if creation.bindings.is_destroyed() {
            return Err(RuleError::Destroyed(name).into());
        }
        self.assert_not_poisoned(target)?;
        let logic = self
            .creations
            .logic(target)
            .ok_or_else(|| KernelError::from(ExecutionError::NotAFunction(name.clone())))?;
        if !logic.methods().contains(&method) {
            return Err(ExecutionError::NotAFunction(format!("{name}.{method}")).into());
        }

        let crossing = who != Accessor::Creation(target);
        if crossing && rules.privacy && method.starts_with('_') {
            let allowed = match who {
                Accessor::Creation(c) => self.family(c, target),
                Accessor::Host => false,
            };
            if !allowed {
                return Err(RuleError::PrivateCall(method.to_string()).into());
            }
        }

        if !crossing {
            // internal dispatch: no stack frame, no recording
            return logic.call(&mut CallCtx::new(self, target), method, &args);
        }

        if !rules.record_calls {
            // passthrough: sidekicks, berries, natives
            let result = logic.call(&mut CallCtx::new(self, target), method, &args)?;
            self.assert_serializable(&result)?;
            return Ok(result);
        }

        let top_level = self.record.stack.is_empty();
        let args = self.unify_args(target, args)?;
        let action_args = top_level
            .then(|| args.iter().map(|a| deep_clone(&mut self.heap, a)).collect::<Vec<_>>());

        // pin the exact class state the dispatch resolves through
        let class = self.creations.class_of(target);
        if class != target && !self.creations.get(class).native {
            self.record.read(&self.creations, class)?;
        }

        self.record.push(target);
        let result = logic.call(&mut CallCtx::new(self, target), method, &args);
        self.record.pop();
        let value = match result {
            Ok(value) => value,
            Err(error) => return Err(self.record.throw(error)),
        };
        // a pure call leaves the receiver a reference; a mutating one already spent it
        let touched = self.record.updates.contains_identity(target)
            || self.record.creates.contains_identity(target)
            || self.record.deletes.contains_identity(target)
            || self.record.auths.contains_identity(target);
        if !touched {
            self.record.read(&self.creations, target)?;
        }
        // a protocol error raised in a nested frame survives even if user code caught it
        if let Some(error) = self.record.error.clone() {
            return Err(error);
        }
        self.assert_serializable(&value)?;
        if self.record.stack.is_empty() {
            self.finalize_pending()?;
        }
        if let Some(action_args) = action_args {
            self.record.action(
                &mut self.creations,
                Action::Call { target, method: method.to_string(), args: action_args },
            )?;
        }
        Ok(value)
    }

    /// NEW: instantiates a jig of a class and runs its initializer with the fresh jig as
    /// receiver. Emits the NEW action when invoked at the top level.
    pub(crate) fn instantiate(
        &mut self,
        _who: Accessor,
        class: CreationId,
        args: Vec<Value>,
    ) -> Result<Value, KernelError> {
        self.rethrow()?;
        let creation = self.creations.get(class);
        if creation.kind != Kind::Code || creation.code.is_none() {
            return Err(ArgumentError::Invalid("only classes can be instantiated".into()).into());
        }
        if creation.is_sidekick() {
            return Err(ArgumentError::Invalid("functions cannot be instantiated".into()).into());
        }
        if creation.bindings.is_destroyed() {
            return Err(RuleError::Destroyed(self.creations.name_of(class)).into());
        }
        let logic = self
            .creations
            .logic(class)
            .ok_or_else(|| KernelError::internal("class without logic"))?;

        let props = self.heap.object();
        let jig = self.creations.alloc(Creation {
            kind: Kind::Jig,
            native: false,
            bindings: Bindings::unbound(),
            props,
            class: Some(class),
            code: None,
            rules: Rules::jig(),
        });
        self.heap.obj_mut(props).owner = Some(jig);

        let top_level = self.record.stack.is_empty();
        let args = self.unify_args(jig, args)?;
        let action_args = top_level
            .then(|| args.iter().map(|a| deep_clone(&mut self.heap, a)).collect::<Vec<_>>());

        self.record.read(&self.creations, class)?;
        self.record.create(&self.creations, &mut self.heap, jig)?;
        self.record.push(jig);
        let result = logic.init(&mut CallCtx::new(self, jig), &args);
        self.record.pop();
        if let Err(error) = result {
            return Err(self.record.throw(error));
        }
        if let Some(error) = self.record.error.clone() {
            return Err(error);
        }
        if self.record.stack.is_empty() {
            self.finalize_pending()?;
        }
        if let Some(action_args) = action_args {
            self.record
                .action(&mut self.creations, Action::New { class, args: action_args })?;
        }
        Ok(Value::Creation(jig))
    }

    fn destroy_trap(&mut self, target: CreationId) -> Result<Value, KernelError> {
        let creation = self.creations.get(target);
        match creation.kind {
            Kind::Berry => return Err(RuleError::BerryUpdate.into()),
            _ if creation.native => {
                return Err(RuleError::Immutable(self.creations.name_of(target)).into())
            }
            _ => {}
        }
        if creation.bindings.is_destroyed() {
            // terminal state; destroying again is a no-op
            return Ok(Value::Creation(target));
        }
        let top_level = self.record.stack.is_empty();
        self.record
            .delete(&mut self.creations, &mut self.heap, target)?;
        if top_level {
            self.record.action(
                &mut self.creations,
                Action::Call { target, method: "destroy".into(), args: vec![] },
            )?;
        }
        Ok(Value::Creation(target))
    }

    fn auth_trap(&mut self, target: CreationId) -> Result<Value, KernelError> {
        let creation = self.creations.get(target);
        match creation.kind {
            Kind::Berry => return Err(RuleError::BerryUpdate.into()),
            _ if creation.native => {
                return Err(RuleError::Immutable(self.creations.name_of(target)).into())
            }
            _ => {}
        }
        let top_level = self.record.stack.is_empty();
        self.record.auth(&self.creations, &mut self.heap, target)?;
        if top_level {
            self.record.action(
                &mut self.creations,
                Action::Call { target, method: "auth".into(), args: vec![] },
            )?;
        }
        Ok(Value::Creation(target))
    }
}
