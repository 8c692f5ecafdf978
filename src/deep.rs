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

//! Ownership-aware deep traversal: clone, visit, replace.
//!
//! All three walks share the same traversal rules: own properties in insertion order, array
//! slots, set members, map key/value pairs, and the class reference of arbitrary objects.
//! Creations are never descended into or cloned; they pass through as references. Cycles are
//! handled by a visited set (clone: source-to-destination map; replace: replacement map).

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::value::{Body, Heap, ObjId, Value};

/// Produces a structurally-equal, freshly-allocated copy of a value graph.
///
/// Cloned objects carry no membrane state: owners and pending flags are reset, which is what
/// the ownership-claim path relies on when it strips another creation's membranes.
pub fn deep_clone(heap: &mut Heap, value: &Value) -> Value {
    fn clone_val(heap: &mut Heap, value: &Value, map: &mut HashMap<ObjId, ObjId>) -> Value {
        let Some(src) = value.as_obj() else { return value.clone() };
        if let Some(dst) = map.get(&src) {
            return Value::Obj(*dst);
        }
        let body = heap.obj(src).body.clone();
        let dst = heap.alloc(Body::Object { class: None, props: IndexMap::new() });
        map.insert(src, dst);
        let body = match body {
            Body::Object { class, props } => Body::Object {
                class,
                props: props
                    .into_iter()
                    .map(|(k, v)| (k, clone_val(heap, &v, map)))
                    .collect(),
            },
            Body::Array { elems, props } => Body::Array {
                elems: elems
                    .into_iter()
                    .map(|e| e.map(|v| clone_val(heap, &v, map)))
                    .collect(),
                props: props
                    .into_iter()
                    .map(|(k, v)| (k, clone_val(heap, &v, map)))
                    .collect(),
            },
            Body::Set { entries, props } => Body::Set {
                entries: entries.iter().map(|v| clone_val(heap, v, map)).collect(),
                props: props
                    .into_iter()
                    .map(|(k, v)| (k, clone_val(heap, &v, map)))
                    .collect(),
            },
            Body::Map { entries, props } => Body::Map {
                entries: entries
                    .iter()
                    .map(|(k, v)| (clone_val(heap, k, map), clone_val(heap, v, map)))
                    .collect(),
                props: props
                    .into_iter()
                    .map(|(k, v)| (k, clone_val(heap, &v, map)))
                    .collect(),
            },
            Body::Bytes(data) => Body::Bytes(data),
        };
        heap.obj_mut(dst).body = body;
        Value::Obj(dst)
    }

    clone_val(heap, value, &mut HashMap::new())
}

/// Visits every node of a value graph exactly once per identity, including the root, set
/// members, map keys and values, and class references of arbitrary objects.
pub fn deep_visit(heap: &Heap, value: &Value, f: &mut impl FnMut(&Value)) {
    fn visit(heap: &Heap, value: &Value, f: &mut impl FnMut(&Value), seen: &mut HashSet<ObjId>) {
        f(value);
        let Some(id) = value.as_obj() else { return };
        if !seen.insert(id) {
            return;
        }
        match &heap.obj(id).body {
            Body::Object { class, props } => {
                if let Some(class) = class {
                    visit(heap, &Value::Creation(*class), f, seen);
                }
                for v in props.values() {
                    visit(heap, v, f, seen);
                }
            }
            Body::Array { elems, props } => {
                for v in elems.iter().flatten() {
                    visit(heap, v, f, seen);
                }
                for v in props.values() {
                    visit(heap, v, f, seen);
                }
            }
            Body::Set { entries, props } => {
                for v in entries {
                    visit(heap, v, f, seen);
                }
                for v in props.values() {
                    visit(heap, v, f, seen);
                }
            }
            Body::Map { entries, props } => {
                for (k, v) in entries {
                    visit(heap, k, f, seen);
                    visit(heap, v, f, seen);
                }
                for v in props.values() {
                    visit(heap, v, f, seen);
                }
            }
            Body::Bytes(_) => {}
        }
    }

    visit(heap, value, f, &mut HashSet::new())
}

/// Rewrites a value graph in place.
///
/// The replacer receives each node and a descend flag (initially `true`); returning
/// `Some(new)` substitutes the node, and clearing the flag opts the (possibly substituted)
/// node out of further recursion. Object identity of non-replaced nodes is preserved: their
/// children are rewritten in place. Returns the (possibly substituted) root.
pub fn deep_replace(
    heap: &mut Heap,
    value: Value,
    f: &mut impl FnMut(&Value, &mut bool) -> Option<Value>,
) -> Value {
    fn replace(
        heap: &mut Heap,
        value: Value,
        f: &mut impl FnMut(&Value, &mut bool) -> Option<Value>,
        seen: &mut HashMap<ObjId, Value>,
    ) -> Value {
        if let Some(id) = value.as_obj() {
            if let Some(done) = seen.get(&id) {
                return done.clone();
            }
        }
        let mut descend = true;
        let replaced = f(&value, &mut descend).unwrap_or(value.clone());
        if let Some(src) = value.as_obj() {
            seen.insert(src, replaced.clone());
        }
        if !descend {
            return replaced;
        }
        let Some(id) = replaced.as_obj() else { return replaced };
        if !value.strict_eq(&replaced) {
            if let Some(done) = seen.get(&id) {
                return done.clone();
            }
            seen.insert(id, replaced.clone());
        }

        match &heap.obj(id).body {
            Body::Object { class, props } => {
                let class = *class;
                let keys: Vec<String> = props.keys().cloned().collect();
                if let Some(cls) = class {
                    let mut d = true;
                    if let Some(Value::Creation(new)) = f(&Value::Creation(cls), &mut d) {
                        if let Body::Object { class, .. } = &mut heap.obj_mut(id).body {
                            *class = Some(new);
                        }
                    }
                }
                for key in keys {
                    let Some(child) = heap.obj(id).body.props().and_then(|p| p.get(&key)).cloned()
                    else {
                        continue;
                    };
                    let new = replace(heap, child, f, seen);
                    if let Some(props) = heap.obj_mut(id).body.props_mut() {
                        props.insert(key, new);
                    }
                }
            }
            Body::Array { elems, props } => {
                let len = elems.len();
                let keys: Vec<String> = props.keys().cloned().collect();
                for n in 0..len {
                    let Body::Array { elems, .. } = &heap.obj(id).body else { break };
                    let Some(Some(child)) = elems.get(n).cloned() else { continue };
                    let new = replace(heap, child, f, seen);
                    if let Body::Array { elems, .. } = &mut heap.obj_mut(id).body {
                        elems[n] = Some(new);
                    }
                }
                for key in keys {
                    let Some(child) = heap.obj(id).body.props().and_then(|p| p.get(&key)).cloned()
                    else {
                        continue;
                    };
                    let new = replace(heap, child, f, seen);
                    if let Some(props) = heap.obj_mut(id).body.props_mut() {
                        props.insert(key, new);
                    }
                }
            }
            Body::Set { entries, props } => {
                let len = entries.len();
                let keys: Vec<String> = props.keys().cloned().collect();
                for n in 0..len {
                    let Body::Set { entries, .. } = &heap.obj(id).body else { break };
                    let child = entries[n].clone();
                    let new = replace(heap, child, f, seen);
                    if let Body::Set { entries, .. } = &mut heap.obj_mut(id).body {
                        entries[n] = new;
                    }
                }
                for key in keys {
                    let Some(child) = heap.obj(id).body.props().and_then(|p| p.get(&key)).cloned()
                    else {
                        continue;
                    };
                    let new = replace(heap, child, f, seen);
                    if let Some(props) = heap.obj_mut(id).body.props_mut() {
                        props.insert(key, new);
                    }
                }
            }
            Body::Map { entries, props } => {
                let len = entries.len();
                let keys: Vec<String> = props.keys().cloned().collect();
                for n in 0..len {
                    let Body::Map { entries, .. } = &heap.obj(id).body else { break };
                    let (k, v) = entries[n].clone();
                    let nk = replace(heap, k, f, seen);
                    let nv = replace(heap, v, f, seen);
                    if let Body::Map { entries, .. } = &mut heap.obj_mut(id).body {
                        entries[n] = (nk, nv);
                    }
                }
                for key in keys {
                    let Some(child) = heap.obj(id).body.props().and_then(|p| p.get(&key)).cloned()
                    else {
                        continue;
                    };
                    let new = replace(heap, child, f, seen);
                    if let Some(props) = heap.obj_mut(id).body.props_mut() {
                        props.insert(key, new);
                    }
                }
            }
            Body::Bytes(_) => {}
        }
        replaced
    }

    replace(heap, value, f, &mut HashMap::new())
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;
    use crate::creation::CreationId;
    use crate::value::deep_equal;

    #[test]
    fn clone_preserves_structure_and_cycles() {
        let mut heap = Heap::new();
        let root = heap.object();
        let inner = heap.set();
        heap.set_add(inner, Value::Number(f64::NAN));
        if let Body::Object { props, .. } = &mut heap.obj_mut(root).body {
            props.insert("s".into(), Value::Obj(inner));
            props.insert("me".into(), Value::Obj(root));
            props.insert("jig".into(), Value::Creation(CreationId(7)));
        }
        let cloned = deep_clone(&mut heap, &Value::Obj(root));
        let cid = cloned.as_obj().unwrap();
        assert_ne!(cid, root);
        assert!(deep_equal(&heap, &Value::Obj(root), &cloned));
        // cycle points at the clone, not the source
        let Body::Object { props, .. } = &heap.obj(cid).body else { unreachable!() };
        assert!(props["me"].strict_eq(&Value::Obj(cid)));
        // creations pass through
        assert!(props["jig"].strict_eq(&Value::Creation(CreationId(7))));
    }

    #[test]
    fn visit_covers_all_nodes_once() {
        let mut heap = Heap::new();
        let root = heap.map();
        heap.map_set(root, Value::string("k"), Value::Obj(root));
        let mut objs = 0;
        deep_visit(&heap, &Value::Obj(root), &mut |v| {
            if v.as_obj().is_some() {
                objs += 1
            }
        });
        assert_eq!(objs, 1);
    }

    #[test]
    fn replace_substitutes_creations() {
        let mut heap = Heap::new();
        let root = heap.array();
        if let Body::Array { elems, .. } = &mut heap.obj_mut(root).body {
            elems.push(Some(Value::Creation(CreationId(1))));
            elems.push(Some(Value::Number(2.0)));
        }
        let out = deep_replace(&mut heap, Value::Obj(root), &mut |v, _| match v {
            Value::Creation(CreationId(1)) => Some(Value::Creation(CreationId(9))),
            _ => None,
        });
        assert!(out.strict_eq(&Value::Obj(root)));
        let Body::Array { elems, .. } = &heap.obj(root).body else { unreachable!() };
        assert!(elems[0].as_ref().unwrap().strict_eq(&Value::Creation(CreationId(9))));
    }

    #[test]
    fn replace_opt_out_stops_recursion() {
        let mut heap = Heap::new();
        let root = heap.object();
        let inner = heap.object();
        if let Body::Object { props, .. } = &mut heap.obj_mut(inner).body {
            props.insert("n".into(), Value::Number(1.0));
        }
        if let Body::Object { props, .. } = &mut heap.obj_mut(root).body {
            props.insert("inner".into(), Value::Obj(inner));
        }
        deep_replace(&mut heap, Value::Obj(root), &mut |v, descend| {
            if v.as_obj() == Some(inner) {
                *descend = false;
            }
            if let Value::Number(_) = v {
                Some(Value::Number(9.0))
            } else {
                None
            }
        });
        let Body::Object { props, .. } = &heap.obj(inner).body else { unreachable!() };
        assert!(props["n"].strict_eq(&Value::Number(1.0)));
    }
}
