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

//! Deterministic `$`-tagged JSON codec.
//!
//! Encodes any serializable sandbox value into JSON consisting only of `null`, `bool`, finite
//! `number`, `string`, `array`, `object`, plus single-key tagged objects for everything plain
//! JSON cannot express:
//!
//! | Tag | Represents |
//! |---|---|
//! | `$und` | undefined |
//! | `$nan`, `$inf`, `$ninf`, `$n0` | non-finite numbers and negative zero |
//! | `$set`, `$map` | sets and maps (with optional `props`) |
//! | `$ui8a` | byte arrays (base64) |
//! | `$jig` | creation references, resolved through caller hooks |
//! | `$arb` | arbitrary objects, with their class under `T` |
//! | `$obj` | objects whose first key begins with `$` |
//! | `$arr` | sparse or keyed arrays |
//! | `$dup` | shared references, by encoded path |
//!
//! Object key order is insertion order on both sides. The second time any non-primitive is
//! seen it is emitted as `$dup` with the path of its first *encoded* occurrence. The codec is
//! ignorant of creation identity: `$jig` payloads go through the caller-supplied hooks.

use std::collections::HashMap;

use base64::prelude::*;
use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Number};

use crate::creation::CreationId;
use crate::value::{Body, Heap, ObjId, Value};

/// Wire JSON tree. Key order is insertion order (`preserve_order`).
pub type Json = serde_json::Value;

pub const RESERVED_KEYS: [&str; 2] = ["constructor", "prototype"];

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CodecError {
    /// cannot encode {0}
    Unsupported(String),

    /// {0} is a reserved key
    ReservedKey(String),

    /// malformed {0} tag
    BadTag(String),

    /// duplicate path [{0}] does not resolve
    BadDupPath(String),

    /// cannot resolve creation reference {0}
    BadRef(String),

    /// cannot decode {0}
    Decode(String),
}

/// Segment of an encoded-tree path.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum Seg {
    Key(String),
    Idx(usize),
}

impl Seg {
    fn to_json(&self) -> Json {
        match self {
            Seg::Key(k) => json!(k),
            Seg::Idx(n) => json!(n),
        }
    }

    fn from_json(json: &Json) -> Result<Seg, CodecError> {
        match json {
            Json::String(s) => Ok(Seg::Key(s.clone())),
            Json::Number(n) => n
                .as_u64()
                .map(|n| Seg::Idx(n as usize))
                .ok_or_else(|| CodecError::BadTag("$dup".into())),
            _ => Err(CodecError::BadTag("$dup".into())),
        }
    }
}

/// Renders a finite float as a canonical JSON number: integral values are emitted without a
/// fractional part so that `1` never round-trips into `1.0`.
pub(crate) fn json_number(n: f64) -> Option<Number> {
    if !n.is_finite() {
        return None;
    }
    const SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= SAFE && !(n == 0.0 && n.is_sign_negative()) {
        return Some(Number::from(n as i64));
    }
    Number::from_f64(n)
}

fn check_key(key: &str) -> Result<(), CodecError> {
    if RESERVED_KEYS.contains(&key) {
        return Err(CodecError::ReservedKey(key.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Encoder

struct Encoder<'h, 'f> {
    heap: &'h Heap,
    save_ref: &'f mut dyn FnMut(CreationId) -> Result<Json, CodecError>,
    obj_paths: HashMap<ObjId, Vec<Seg>>,
    creation_paths: HashMap<CreationId, Vec<Seg>>,
    path: Vec<Seg>,
}

/// Encodes a sandbox value into its deterministic wire form.
///
/// `save_ref` renders a creation reference into its `$jig` payload (a master-list index or a
/// location string, depending on the wire context).
pub fn encode(
    heap: &Heap,
    value: &Value,
    save_ref: &mut dyn FnMut(CreationId) -> Result<Json, CodecError>,
) -> Result<Json, CodecError> {
    let mut enc = Encoder {
        heap,
        save_ref,
        obj_paths: HashMap::new(),
        creation_paths: HashMap::new(),
        path: Vec::new(),
    };
    enc.value(value)
}

impl Encoder<'_, '_> {
    fn dup(path: &[Seg]) -> Json {
        json!({ "$dup": path.iter().map(Seg::to_json).collect::<Vec<_>>() })
    }

    fn value(&mut self, value: &Value) -> Result<Json, CodecError> {
        match value {
            Value::Undefined => Ok(json!({ "$und": 1 })),
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(json!(b)),
            Value::Number(n) => Ok(match json_number(*n) {
                Some(num) => Json::Number(num),
                None if n.is_nan() => json!({ "$nan": 1 }),
                None if *n > 0.0 => json!({ "$inf": 1 }),
                None if *n < 0.0 => json!({ "$ninf": 1 }),
                None => json!({ "$n0": 1 }),
            }),
            Value::String(s) => Ok(json!(s)),
            Value::Creation(id) => {
                if let Some(path) = self.creation_paths.get(id) {
                    return Ok(Self::dup(path));
                }
                self.creation_paths.insert(*id, self.path.clone());
                (self.save_ref)(*id)
            }
            Value::Obj(id) => {
                if let Some(path) = self.obj_paths.get(id) {
                    return Ok(Self::dup(path));
                }
                self.obj_paths.insert(*id, self.path.clone());
                self.object(*id)
            }
        }
    }

    fn at<T>(&mut self, seg: Seg, f: impl FnOnce(&mut Self) -> Result<T, CodecError>) -> Result<T, CodecError> {
        self.path.push(seg);
        let res = f(self);
        self.path.pop();
        res
    }

    fn props(&mut self, prefix: Option<&str>, props: &IndexMap<String, Value>) -> Result<JsonMap<String, Json>, CodecError> {
        let mut out = JsonMap::new();
        for (key, value) in props {
            check_key(key)?;
            let encoded = match prefix {
                Some(p) => self.at(Seg::Key(p.to_string()), |enc| {
                    enc.at(Seg::Key(key.clone()), |enc| enc.value(value))
                })?,
                None => self.at(Seg::Key(key.clone()), |enc| enc.value(value))?,
            };
            out.insert(key.clone(), encoded);
        }
        Ok(out)
    }

    fn object(&mut self, id: ObjId) -> Result<Json, CodecError> {
        match &self.heap.obj(id).body {
            Body::Bytes(data) => Ok(json!({ "$ui8a": BASE64_STANDARD.encode(data) })),

            Body::Object { class: Some(class), props } => {
                let props = props.clone();
                let inner = self.props(Some("$arb"), &props)?;
                let t = self.at(Seg::Key("T".into()), |enc| enc.value(&Value::Creation(*class)))?;
                let mut out = JsonMap::new();
                out.insert("$arb".into(), Json::Object(inner));
                out.insert("T".into(), t);
                Ok(Json::Object(out))
            }

            Body::Object { class: None, props } => {
                let props = props.clone();
                let dollar = props.keys().next().is_some_and(|k| k.starts_with('$'));
                if dollar {
                    let inner = self.props(Some("$obj"), &props)?;
                    Ok(json!({ "$obj": Json::Object(inner) }))
                } else {
                    Ok(Json::Object(self.props(None, &props)?))
                }
            }

            Body::Array { elems, props } => {
                let elems = elems.clone();
                let props = props.clone();
                let dense = props.is_empty() && elems.iter().all(Option::is_some);
                if dense {
                    let mut out = Vec::with_capacity(elems.len());
                    for (n, elem) in elems.iter().enumerate() {
                        let elem = elem.as_ref().ok_or_else(|| CodecError::Unsupported("array hole".into()))?;
                        out.push(self.at(Seg::Idx(n), |enc| enc.value(elem))?);
                    }
                    Ok(Json::Array(out))
                } else {
                    let mut inner = JsonMap::new();
                    for (n, elem) in elems.iter().enumerate() {
                        let Some(elem) = elem else { continue };
                        let key = n.to_string();
                        let encoded = self.at(Seg::Key("$arr".into()), |enc| {
                            enc.at(Seg::Key(key.clone()), |enc| enc.value(elem))
                        })?;
                        inner.insert(key, encoded);
                    }
                    for (key, value) in self.props(Some("$arr"), &props)? {
                        inner.insert(key, value);
                    }
                    Ok(json!({ "$arr": Json::Object(inner) }))
                }
            }

            Body::Set { entries, props } => {
                let entries = entries.clone();
                let props = props.clone();
                let mut members = Vec::with_capacity(entries.len());
                for (n, entry) in entries.iter().enumerate() {
                    let encoded = self.at(Seg::Key("$set".into()), |enc| {
                        enc.at(Seg::Idx(n), |enc| enc.value(entry))
                    })?;
                    members.push(encoded);
                }
                let mut out = JsonMap::new();
                out.insert("$set".into(), Json::Array(members));
                if !props.is_empty() {
                    out.insert("props".into(), Json::Object(self.props(Some("props"), &props)?));
                }
                Ok(Json::Object(out))
            }

            Body::Map { entries, props } => {
                let entries = entries.clone();
                let props = props.clone();
                let mut pairs = Vec::with_capacity(entries.len());
                for (n, (key, value)) in entries.iter().enumerate() {
                    let pair = self.at(Seg::Key("$map".into()), |enc| {
                        enc.at(Seg::Idx(n), |enc| {
                            let k = enc.at(Seg::Idx(0), |enc| enc.value(key))?;
                            let v = enc.at(Seg::Idx(1), |enc| enc.value(value))?;
                            Ok(Json::Array(vec![k, v]))
                        })
                    })?;
                    pairs.push(pair);
                }
                let mut out = JsonMap::new();
                out.insert("$map".into(), Json::Array(pairs));
                if !props.is_empty() {
                    out.insert("props".into(), Json::Object(self.props(Some("props"), &props)?));
                }
                Ok(Json::Object(out))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder

struct Decoder<'h, 'f> {
    heap: &'h mut Heap,
    load_ref: &'f mut dyn FnMut(&Json) -> Result<Value, CodecError>,
    decoded: HashMap<Vec<Seg>, Value>,
    path: Vec<Seg>,
}

/// Decodes a wire JSON tree back into a sandbox value.
///
/// `load_ref` resolves a `$jig` payload into a value (normally a creation reference).
pub fn decode(
    heap: &mut Heap,
    json: &Json,
    load_ref: &mut dyn FnMut(&Json) -> Result<Value, CodecError>,
) -> Result<Value, CodecError> {
    let mut dec = Decoder { heap, load_ref, decoded: HashMap::new(), path: Vec::new() };
    dec.value(json)
}

impl Decoder<'_, '_> {
    fn at<T>(&mut self, seg: Seg, f: impl FnOnce(&mut Self) -> Result<T, CodecError>) -> Result<T, CodecError> {
        self.path.push(seg);
        let res = f(self);
        self.path.pop();
        res
    }

    fn register(&mut self, value: Value) -> Value {
        self.decoded.insert(self.path.clone(), value.clone());
        value
    }

    fn flag(json: &Json, tag: &str) -> Result<(), CodecError> {
        match json.as_i64() {
            Some(1) => Ok(()),
            _ => Err(CodecError::BadTag(tag.to_string())),
        }
    }

    fn value(&mut self, json: &Json) -> Result<Value, CodecError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => {
                let n = n.as_f64().ok_or_else(|| CodecError::Decode("number".into()))?;
                if !n.is_finite() {
                    return Err(CodecError::Decode("bare non-finite number".into()));
                }
                Ok(Value::Number(n))
            }
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(elems) => {
                let id = self.heap.array();
                self.register(Value::Obj(id));
                for (n, elem) in elems.iter().enumerate() {
                    let value = self.at(Seg::Idx(n), |dec| dec.value(elem))?;
                    if let Body::Array { elems, .. } = &mut self.heap.obj_mut(id).body {
                        elems.push(Some(value));
                    }
                }
                Ok(Value::Obj(id))
            }
            Json::Object(map) => self.object(map),
        }
    }

    fn plain_props(&mut self, id: ObjId, prefix: Option<&str>, map: &JsonMap<String, Json>) -> Result<(), CodecError> {
        for (key, child) in map {
            check_key(key)?;
            let value = match prefix {
                Some(p) => self.at(Seg::Key(p.to_string()), |dec| {
                    dec.at(Seg::Key(key.clone()), |dec| dec.value(child))
                })?,
                None => self.at(Seg::Key(key.clone()), |dec| dec.value(child))?,
            };
            if let Some(props) = self.heap.obj_mut(id).body.props_mut() {
                props.insert(key.clone(), value);
            }
        }
        Ok(())
    }

    fn object(&mut self, map: &JsonMap<String, Json>) -> Result<Value, CodecError> {
        let first = map.keys().next().map(String::as_str);
        let Some(tag) = first.filter(|k| k.starts_with('$')) else {
            // plain object
            let id = self.heap.object();
            self.register(Value::Obj(id));
            self.plain_props(id, None, map)?;
            return Ok(Value::Obj(id));
        };
        let payload = &map[tag];
        let arity_ok = |max: usize| -> Result<(), CodecError> {
            if map.len() > max {
                return Err(CodecError::BadTag(tag.to_string()));
            }
            Ok(())
        };
        match tag {
            "$und" => {
                arity_ok(1)?;
                Self::flag(payload, tag)?;
                Ok(Value::Undefined)
            }
            "$nan" => {
                arity_ok(1)?;
                Self::flag(payload, tag)?;
                Ok(Value::Number(f64::NAN))
            }
            "$inf" => {
                arity_ok(1)?;
                Self::flag(payload, tag)?;
                Ok(Value::Number(f64::INFINITY))
            }
            "$ninf" => {
                arity_ok(1)?;
                Self::flag(payload, tag)?;
                Ok(Value::Number(f64::NEG_INFINITY))
            }
            "$n0" => {
                arity_ok(1)?;
                Self::flag(payload, tag)?;
                Ok(Value::Number(-0.0))
            }
            "$ui8a" => {
                arity_ok(1)?;
                let b64 = payload.as_str().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                let data = BASE64_STANDARD
                    .decode(b64)
                    .map_err(|_| CodecError::BadTag(tag.to_string()))?;
                let id = self.heap.bytes(data);
                Ok(self.register(Value::Obj(id)))
            }
            "$jig" => {
                arity_ok(1)?;
                let value = (self.load_ref)(payload)?;
                Ok(self.register(value))
            }
            "$dup" => {
                arity_ok(1)?;
                let segs = payload
                    .as_array()
                    .ok_or_else(|| CodecError::BadTag(tag.to_string()))?
                    .iter()
                    .map(Seg::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                self.decoded.get(&segs).cloned().ok_or_else(|| {
                    let path = segs
                        .iter()
                        .map(|s| match s {
                            Seg::Key(k) => k.clone(),
                            Seg::Idx(n) => n.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(",");
                    CodecError::BadDupPath(path)
                })
            }
            "$obj" => {
                arity_ok(1)?;
                let inner = payload.as_object().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                let id = self.heap.object();
                self.register(Value::Obj(id));
                self.plain_props(id, Some("$obj"), inner)?;
                Ok(Value::Obj(id))
            }
            "$arb" => {
                arity_ok(2)?;
                let inner = payload.as_object().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                let t = map.get("T").ok_or_else(|| CodecError::BadTag(tag.to_string()))?;
                let id = self.heap.object();
                self.register(Value::Obj(id));
                let class = self.at(Seg::Key("T".into()), |dec| dec.value(t))?;
                let Value::Creation(class) = class else {
                    return Err(CodecError::BadTag(tag.to_string()));
                };
                if let Body::Object { class: slot, .. } = &mut self.heap.obj_mut(id).body {
                    *slot = Some(class);
                }
                self.plain_props(id, Some("$arb"), inner)?;
                Ok(Value::Obj(id))
            }
            "$arr" => {
                arity_ok(1)?;
                let inner = payload.as_object().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                let id = self.heap.array();
                self.register(Value::Obj(id));
                for (key, child) in inner {
                    let value = self.at(Seg::Key("$arr".into()), |dec| {
                        dec.at(Seg::Key(key.clone()), |dec| dec.value(child))
                    })?;
                    match key.parse::<usize>() {
                        Ok(n) => {
                            if let Body::Array { elems, .. } = &mut self.heap.obj_mut(id).body {
                                if elems.len() <= n {
                                    elems.resize(n + 1, None);
                                }
                                elems[n] = Some(value);
                            }
                        }
                        Err(_) => {
                            check_key(key)?;
                            if let Some(props) = self.heap.obj_mut(id).body.props_mut() {
                                props.insert(key.clone(), value);
                            }
                        }
                    }
                }
                Ok(Value::Obj(id))
            }
            "$set" => {
                arity_ok(2)?;
                let members = payload.as_array().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                if map.len() == 2 && !map.contains_key("props") {
                    return Err(CodecError::BadTag(tag.to_string()));
                }
                let id = self.heap.set();
                self.register(Value::Obj(id));
                for (n, member) in members.iter().enumerate() {
                    let value = self.at(Seg::Key("$set".into()), |dec| {
                        dec.at(Seg::Idx(n), |dec| dec.value(member))
                    })?;
                    if let Body::Set { entries, .. } = &mut self.heap.obj_mut(id).body {
                        entries.push(value);
                    }
                }
                if let Some(props) = map.get("props").and_then(Json::as_object) {
                    self.plain_props(id, Some("props"), props)?;
                }
                Ok(Value::Obj(id))
            }
            "$map" => {
                arity_ok(2)?;
                let pairs = payload.as_array().ok_or_else(|| CodecError::BadTag(tag.into()))?;
                if map.len() == 2 && !map.contains_key("props") {
                    return Err(CodecError::BadTag(tag.to_string()));
                }
                let id = self.heap.map();
                self.register(Value::Obj(id));
                for (n, pair) in pairs.iter().enumerate() {
                    let (key, value) = self.at(Seg::Key("$map".into()), |dec| {
                        dec.at(Seg::Idx(n), |dec| {
                            let pair = pair
                                .as_array()
                                .filter(|p| p.len() == 2)
                                .ok_or_else(|| CodecError::BadTag("$map".into()))?;
                            let k = dec.at(Seg::Idx(0), |dec| dec.value(&pair[0]))?;
                            let v = dec.at(Seg::Idx(1), |dec| dec.value(&pair[1]))?;
                            Ok((k, v))
                        })
                    })?;
                    if let Body::Map { entries, .. } = &mut self.heap.obj_mut(id).body {
                        entries.push((key, value));
                    }
                }
                if let Some(props) = map.get("props").and_then(Json::as_object) {
                    self.plain_props(id, Some("props"), props)?;
                }
                Ok(Value::Obj(id))
            }
            other => Err(CodecError::BadTag(other.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;
    use crate::value::deep_equal;

    fn no_refs(_: CreationId) -> Result<Json, CodecError> {
        Err(CodecError::Unsupported("creation".into()))
    }

    fn roundtrip(heap: &mut Heap, value: &Value) -> Value {
        let json = encode(heap, value, &mut no_refs).unwrap();
        decode(heap, &json, &mut |_| Err(CodecError::BadRef("none".into()))).unwrap()
    }

    #[test]
    fn primitives() {
        let mut heap = Heap::new();
        assert_eq!(encode(&heap, &Value::Null, &mut no_refs).unwrap(), Json::Null);
        assert_eq!(encode(&heap, &Value::Undefined, &mut no_refs).unwrap(), json!({"$und": 1}));
        assert_eq!(encode(&heap, &Value::Number(f64::NAN), &mut no_refs).unwrap(), json!({"$nan": 1}));
        assert_eq!(
            encode(&heap, &Value::Number(f64::INFINITY), &mut no_refs).unwrap(),
            json!({"$inf": 1})
        );
        assert_eq!(
            encode(&heap, &Value::Number(f64::NEG_INFINITY), &mut no_refs).unwrap(),
            json!({"$ninf": 1})
        );
        assert_eq!(encode(&heap, &Value::Number(-0.0), &mut no_refs).unwrap(), json!({"$n0": 1}));
        assert_eq!(encode(&heap, &Value::Number(3.0), &mut no_refs).unwrap(), json!(3));
        assert_eq!(encode(&heap, &Value::Number(1.5), &mut no_refs).unwrap(), json!(1.5));
        let back = roundtrip(&mut heap, &Value::Number(-0.0));
        assert!(deep_equal(&heap, &back, &Value::Number(-0.0)));
    }

    #[test]
    fn dollar_first_key_wraps_in_obj() {
        let mut heap = Heap::new();
        let id = heap.object();
        if let Body::Object { props, .. } = &mut heap.obj_mut(id).body {
            props.insert("$x".into(), Value::Number(1.0));
        }
        let json = encode(&heap, &Value::Obj(id), &mut no_refs).unwrap();
        assert_eq!(json, json!({"$obj": {"$x": 1}}));
        let back = roundtrip(&mut heap, &Value::Obj(id));
        assert!(deep_equal(&heap, &back, &Value::Obj(id)));
    }

    #[test]
    fn sparse_array_uses_arr_tag() {
        let mut heap = Heap::new();
        let id = heap.array();
        if let Body::Array { elems, .. } = &mut heap.obj_mut(id).body {
            elems.push(Some(Value::Number(1.0)));
            elems.push(None);
            elems.push(Some(Value::Number(3.0)));
        }
        let json = encode(&heap, &Value::Obj(id), &mut no_refs).unwrap();
        assert_eq!(json, json!({"$arr": {"0": 1, "2": 3}}));
        let back = roundtrip(&mut heap, &Value::Obj(id));
        assert!(deep_equal(&heap, &back, &Value::Obj(id)));
    }

    #[test]
    fn reserved_keys_reject() {
        let mut heap = Heap::new();
        let id = heap.object();
        if let Body::Object { props, .. } = &mut heap.obj_mut(id).body {
            props.insert("constructor".into(), Value::Number(1.0));
        }
        assert_eq!(
            encode(&heap, &Value::Obj(id), &mut no_refs),
            Err(CodecError::ReservedKey("constructor".into()))
        );
    }

    #[test]
    fn shared_references_dedup() {
        let mut heap = Heap::new();
        let shared = heap.object();
        let root = heap.object();
        if let Body::Object { props, .. } = &mut heap.obj_mut(root).body {
            props.insert("a".into(), Value::Obj(shared));
            props.insert("b".into(), Value::Obj(shared));
        }
        let json = encode(&heap, &Value::Obj(root), &mut no_refs).unwrap();
        assert_eq!(json, json!({"a": {}, "b": {"$dup": ["a"]}}));
        let back = roundtrip(&mut heap, &Value::Obj(root));
        let id = back.as_obj().unwrap();
        let Body::Object { props, .. } = &heap.obj(id).body else { unreachable!() };
        // reference equality preserved after decode
        assert!(props["a"].strict_eq(&props["b"]));
    }

    #[test]
    fn dangling_dup_rejects() {
        let mut heap = Heap::new();
        let json = json!({"a": {"$dup": ["zzz"]}});
        let res = decode(&mut heap, &json, &mut |_| Err(CodecError::BadRef("none".into())));
        assert_eq!(res, Err(CodecError::BadDupPath("zzz".into())));
    }

    #[test]
    fn jig_refs_resolve_through_hooks() {
        let mut heap = Heap::new();
        let root = heap.array();
        if let Body::Array { elems, .. } = &mut heap.obj_mut(root).body {
            elems.push(Some(Value::Creation(CreationId(4))));
            elems.push(Some(Value::Creation(CreationId(4))));
        }
        let json = encode(&heap, &Value::Obj(root), &mut |id| Ok(json!({ "$jig": id.0 }))).unwrap();
        assert_eq!(json, json!([{"$jig": 4}, {"$dup": [0]}]));
        let back = decode(&mut heap, &json, &mut |payload| {
            let n = payload.as_u64().ok_or_else(|| CodecError::BadRef("index".into()))?;
            Ok(Value::Creation(CreationId(n as u32)))
        })
        .unwrap();
        let id = back.as_obj().unwrap();
        let Body::Array { elems, .. } = &heap.obj(id).body else { unreachable!() };
        assert!(elems[0].as_ref().unwrap().strict_eq(&Value::Creation(CreationId(4))));
        assert!(elems[1].as_ref().unwrap().strict_eq(&Value::Creation(CreationId(4))));
    }

    #[test]
    fn cyclic_graph_roundtrip() {
        // encode {a: -0, b: Set(NaN), c: bytes([0,1,255]), d: self}
        let mut heap = Heap::new();
        let root = heap.object();
        let set = heap.set();
        heap.set_add(set, Value::Number(f64::NAN));
        let bytes = heap.bytes(vec![0, 1, 255]);
        if let Body::Object { props, .. } = &mut heap.obj_mut(root).body {
            props.insert("a".into(), Value::Number(-0.0));
            props.insert("b".into(), Value::Obj(set));
            props.insert("c".into(), Value::Obj(bytes));
            props.insert("d".into(), Value::Obj(root));
        }
        let json = encode(&heap, &Value::Obj(root), &mut no_refs).unwrap();
        assert_eq!(
            json,
            json!({
                "a": {"$n0": 1},
                "b": {"$set": [{"$nan": 1}]},
                "c": {"$ui8a": "AAH/"},
                "d": {"$dup": []},
            })
        );
        let back = roundtrip(&mut heap, &Value::Obj(root));
        assert!(deep_equal(&heap, &back, &Value::Obj(root)));
        let id = back.as_obj().unwrap();
        let Body::Object { props, .. } = &heap.obj(id).body else { unreachable!() };
        // decoded.d === decoded
        assert!(props["d"].strict_eq(&Value::Obj(id)));
    }

    #[test]
    fn unknown_tag_rejects() {
        let mut heap = Heap::new();
        let res = decode(&mut heap, &json!({"$wat": 1}), &mut |_| Err(CodecError::BadRef("none".into())));
        assert_eq!(res, Err(CodecError::BadTag("$wat".into())));
    }

    #[test]
    fn map_with_object_keys() {
        let mut heap = Heap::new();
        let map = heap.map();
        let key = heap.array();
        heap.map_set(map, Value::Obj(key), Value::string("v"));
        let json = encode(&heap, &Value::Obj(map), &mut no_refs).unwrap();
        assert_eq!(json, json!({"$map": [[[], "v"]]}));
        let back = roundtrip(&mut heap, &Value::Obj(map));
        assert!(deep_equal(&heap, &back, &Value::Obj(map)));
    }
}
