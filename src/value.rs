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

//! Sandbox value model.
//!
//! Rich values live in an arena ([`Heap`]) and are addressed by integer handles ([`ObjId`]);
//! a [`Value`] is either a primitive or such a handle. Handle equality is value identity,
//! which is what the membrane's claim tracking and the codec's `$dup` deduplication key on.
//!
//! Heap objects additionally carry membrane state: the creation owning them (if any) and a
//! pending-claim flag for values assigned inside a method but not yet finalized.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::creation::CreationId;

/// Handle of a heap-allocated object.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObjId(pub(crate) u32);

impl ObjId {
    #[inline]
    pub fn index(self) -> usize { self.0 as usize }
}

/// A sandbox value: primitive, heap handle, or creation reference.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Obj(ObjId),
    Creation(CreationId),
}

impl Value {
    pub fn string(s: impl ToString) -> Self { Value::String(s.to_string()) }

    pub fn number(n: impl Into<f64>) -> Self { Value::Number(n.into()) }

    #[inline]
    pub fn is_primitive(&self) -> bool { !matches!(self, Value::Obj(_) | Value::Creation(_)) }

    pub fn as_obj(&self) -> Option<ObjId> {
        match self {
            Value::Obj(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_creation(&self) -> Option<CreationId> {
        match self {
            Value::Creation(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Obj(_) => "object",
            Value::Creation(_) => "creation",
        }
    }

    /// Strict identity equality: primitives by value (`NaN` unequal to itself, `-0` equal to
    /// `0`), objects and creations by handle.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Creation(a), Value::Creation(b)) => a == b,
            _ => false,
        }
    }

    /// Key equality for set members and map keys: like [`Value::strict_eq`], except `NaN`
    /// equals `NaN`.
    pub fn key_eq(&self, other: &Value) -> bool {
        if let (Value::Number(a), Value::Number(b)) = (self, other) {
            return a == b || (a.is_nan() && b.is_nan());
        }
        self.strict_eq(other)
    }
}

/// Body of a heap object.
#[derive(Clone, Debug)]
pub enum Body {
    /// Plain string-keyed object; `class` is set for arbitrary instances of a Code creation.
    Object {
        class: Option<CreationId>,
        props: IndexMap<String, Value>,
    },

    /// Array with dense slots (`None` marks a hole) plus non-index properties.
    Array {
        elems: Vec<Option<Value>>,
        props: IndexMap<String, Value>,
    },

    /// Insertion-ordered set plus own properties.
    Set {
        entries: Vec<Value>,
        props: IndexMap<String, Value>,
    },

    /// Insertion-ordered map plus own properties.
    Map {
        entries: Vec<(Value, Value)>,
        props: IndexMap<String, Value>,
    },

    /// Byte array.
    Bytes(Vec<u8>),
}

impl Body {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Body::Object { .. } => "object",
            Body::Array { .. } => "array",
            Body::Set { .. } => "set",
            Body::Map { .. } => "map",
            Body::Bytes(_) => "bytes",
        }
    }

    /// Own string-keyed properties, for the variants that carry them.
    pub fn props(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Body::Object { props, .. }
            | Body::Array { props, .. }
            | Body::Set { props, .. }
            | Body::Map { props, .. } => Some(props),
            Body::Bytes(_) => None,
        }
    }

    pub fn props_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Body::Object { props, .. }
            | Body::Array { props, .. }
            | Body::Set { props, .. }
            | Body::Map { props, .. } => Some(props),
            Body::Bytes(_) => None,
        }
    }
}

/// A heap slot: the object body plus membrane state.
#[derive(Clone, Debug)]
pub struct HeapObj {
    pub body: Body,
    /// Creation owning this object, if it was claimed.
    pub owner: Option<CreationId>,
    /// Claimed inside a method but not yet finalized.
    pub pending: bool,
}

/// Arena of sandbox objects.
///
/// Handles are never freed: records are transaction-scoped and short-lived, and rollback
/// re-points creations at snapshot roots rather than destroying slots.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    slots: Vec<HeapObj>,
}

impl Heap {
    pub fn new() -> Self { Heap::default() }

    pub fn alloc(&mut self, body: Body) -> ObjId {
        let id = ObjId(self.slots.len() as u32);
        self.slots.push(HeapObj { body, owner: None, pending: false });
        id
    }

    #[inline]
    pub fn obj(&self, id: ObjId) -> &HeapObj { &self.slots[id.index()] }

    #[inline]
    pub fn obj_mut(&mut self, id: ObjId) -> &mut HeapObj { &mut self.slots[id.index()] }

    pub fn object(&mut self) -> ObjId { self.alloc(Body::Object { class: None, props: IndexMap::new() }) }

    pub fn arbitrary(&mut self, class: CreationId) -> ObjId {
        self.alloc(Body::Object { class: Some(class), props: IndexMap::new() })
    }

    pub fn array(&mut self) -> ObjId { self.alloc(Body::Array { elems: Vec::new(), props: IndexMap::new() }) }

    pub fn set(&mut self) -> ObjId { self.alloc(Body::Set { entries: Vec::new(), props: IndexMap::new() }) }

    pub fn map(&mut self) -> ObjId { self.alloc(Body::Map { entries: Vec::new(), props: IndexMap::new() }) }

    pub fn bytes(&mut self, data: Vec<u8>) -> ObjId { self.alloc(Body::Bytes(data)) }

    pub fn owner_of(&self, value: &Value) -> Option<CreationId> {
        value.as_obj().and_then(|id| self.obj(id).owner)
    }

    /// Adds a member to a set, deduplicating by key equality. Returns whether it was added.
    pub fn set_add(&mut self, set: ObjId, value: Value) -> bool {
        let Body::Set { entries, .. } = &mut self.obj_mut(set).body else { return false };
        if entries.iter().any(|e| e.key_eq(&value)) {
            return false;
        }
        entries.push(value);
        true
    }

    /// Inserts a key/value pair into a map, replacing the value on key equality.
    pub fn map_set(&mut self, map: ObjId, key: Value, value: Value) {
        let Body::Map { entries, .. } = &mut self.obj_mut(map).body else { return };
        for (k, v) in entries.iter_mut() {
            if k.key_eq(&key) {
                *v = value;
                return;
            }
        }
        entries.push((key, value));
    }

    pub fn map_get(&self, map: ObjId, key: &Value) -> Option<Value> {
        let Body::Map { entries, .. } = &self.obj(map).body else { return None };
        entries.iter().find(|(k, _)| k.key_eq(key)).map(|(_, v)| v.clone())
    }
}

/// Structural deep equality over two values of one heap.
///
/// `NaN` is equal to `NaN`, `-0` is distinct from `0`, byte arrays compare by content,
/// cycles are handled by tracking visited handle pairs.
pub fn deep_equal(heap: &Heap, a: &Value, b: &Value) -> bool {
    fn eq(heap: &Heap, a: &Value, b: &Value, seen: &mut HashSet<(ObjId, ObjId)>) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                (x == y && x.is_sign_positive() == y.is_sign_positive()) || (x.is_nan() && y.is_nan())
            }
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y || !seen.insert((*x, *y)) {
                    return true;
                }
                body_eq(heap, &heap.obj(*x).body, &heap.obj(*y).body, seen)
            }
            _ => a.strict_eq(b),
        }
    }

    fn props_eq(
        heap: &Heap,
        a: &IndexMap<String, Value>,
        b: &IndexMap<String, Value>,
        seen: &mut HashSet<(ObjId, ObjId)>,
    ) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b)
                .all(|((ka, va), (kb, vb))| ka == kb && eq(heap, va, vb, seen))
    }

    fn body_eq(heap: &Heap, a: &Body, b: &Body, seen: &mut HashSet<(ObjId, ObjId)>) -> bool {
        match (a, b) {
            (
                Body::Object { class: ca, props: pa },
                Body::Object { class: cb, props: pb },
            ) => ca == cb && props_eq(heap, pa, pb, seen),
            (
                Body::Array { elems: ea, props: pa },
                Body::Array { elems: eb, props: pb },
            ) => {
                ea.len() == eb.len()
                    && ea.iter().zip(eb).all(|(x, y)| match (x, y) {
                        (Some(x), Some(y)) => eq(heap, x, y, seen),
                        (None, None) => true,
                        _ => false,
                    })
                    && props_eq(heap, pa, pb, seen)
            }
            (
                Body::Set { entries: ea, props: pa },
                Body::Set { entries: eb, props: pb },
            ) => {
                ea.len() == eb.len()
                    && ea.iter().zip(eb).all(|(x, y)| eq(heap, x, y, seen))
                    && props_eq(heap, pa, pb, seen)
            }
            (
                Body::Map { entries: ea, props: pa },
                Body::Map { entries: eb, props: pb },
            ) => {
                ea.len() == eb.len()
                    && ea
                        .iter()
                        .zip(eb)
                        .all(|((ka, va), (kb, vb))| eq(heap, ka, kb, seen) && eq(heap, va, vb, seen))
                    && props_eq(heap, pa, pb, seen)
            }
            (Body::Bytes(x), Body::Bytes(y)) => x == y,
            _ => false,
        }
    }

    eq(heap, a, b, &mut HashSet::new())
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    #[test]
    fn identity_vs_structure() {
        let mut heap = Heap::new();
        let a = heap.object();
        let b = heap.object();
        assert!(!Value::Obj(a).strict_eq(&Value::Obj(b)));
        assert!(deep_equal(&heap, &Value::Obj(a), &Value::Obj(b)));
    }

    #[test]
    fn number_semantics() {
        let heap = Heap::new();
        assert!(!Value::Number(f64::NAN).strict_eq(&Value::Number(f64::NAN)));
        assert!(Value::Number(f64::NAN).key_eq(&Value::Number(f64::NAN)));
        assert!(Value::Number(-0.0).strict_eq(&Value::Number(0.0)));
        assert!(!deep_equal(&heap, &Value::Number(-0.0), &Value::Number(0.0)));
        assert!(deep_equal(&heap, &Value::Number(f64::NAN), &Value::Number(f64::NAN)));
    }

    #[test]
    fn set_dedup_by_key() {
        let mut heap = Heap::new();
        let set = heap.set();
        assert!(heap.set_add(set, Value::Number(f64::NAN)));
        assert!(!heap.set_add(set, Value::Number(f64::NAN)));
        assert!(heap.set_add(set, Value::Number(1.0)));
        let Body::Set { entries, .. } = &heap.obj(set).body else { unreachable!() };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn cyclic_equality_terminates() {
        let mut heap = Heap::new();
        let a = heap.object();
        let b = heap.object();
        if let Body::Object { props, .. } = &mut heap.obj_mut(a).body {
            props.insert("self".into(), Value::Obj(a));
        }
        if let Body::Object { props, .. } = &mut heap.obj_mut(b).body {
            props.insert("self".into(), Value::Obj(b));
        }
        assert!(deep_equal(&heap, &Value::Obj(a), &Value::Obj(b)));
    }
}
