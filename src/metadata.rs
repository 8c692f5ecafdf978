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

//! Wire metadata and the OP_RETURN envelope.
//!
//! The metadata record is published as the first output of every protocol transaction:
//!
//! ```text
//! OP_FALSE OP_RETURN "run" <version byte> <app string> <json metadata>
//! ```
//!
//! The embedded JSON carries exactly six fields in order — `in`, `ref`, `out`, `del`,
//! `cre`, `exec`; `app`, `version`, `vrun` and `base` are carried outside the push. Unknown
//! version bytes reject, as does any push beyond the fourth.

use serde_json::json;

use crate::action::Op;
use crate::codec::Json;
use crate::tx::{Tx, TxOut};

/// ASCII prefix of the OP_RETURN envelope.
pub const PROTOCOL_PREFIX: &[u8] = b"run";

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x05;

const OP_FALSE: u8 = 0x00;
const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum MetadataError {
    /// transaction carries no metadata record
    NotProtocol,

    /// unknown protocol version {0:#04x}
    UnknownVersion(u8),

    /// metadata record has too many pushes
    TooManyPushes,

    /// malformed metadata: {0}
    Malformed(String),
}

/// One wire exec entry: `{op, data}`.
#[derive(Clone, PartialEq, Debug)]
pub struct ExecEntry {
    pub op: Op,
    pub data: Json,
}

impl ExecEntry {
    pub fn to_json(&self) -> Json { json!({ "op": self.op.to_string(), "data": self.data }) }
}

/// The full metadata of one commit.
#[derive(Clone, PartialEq, Debug)]
pub struct Metadata {
    pub app: String,
    pub version: u8,
    /// Base transaction, hex. Its outputs (beyond the OP_RETURN slot) come first.
    pub base: String,
    /// Number of base-transaction outputs preceding the jig outputs.
    pub vrun: u32,
    /// Number of jig inputs (the first `in` inputs of the transaction).
    pub inputs: usize,
    /// Pre-state locations of read-only references.
    pub refs: Vec<String>,
    /// State hashes of outputs, in commit order.
    pub out: Vec<String>,
    /// State hashes of deleted creations, in commit order.
    pub del: Vec<String>,
    /// Encoded initial owners of created creations.
    pub cre: Vec<Json>,
    pub exec: Vec<ExecEntry>,
}

impl Metadata {
    /// The six-field payload embedded in the OP_RETURN push, in exact field order.
    pub fn payload_json(&self) -> Json {
        json!({
            "in": self.inputs,
            "ref": self.refs,
            "out": self.out,
            "del": self.del,
            "cre": self.cre,
            "exec": self.exec.iter().map(ExecEntry::to_json).collect::<Vec<_>>(),
        })
    }

    /// The complete metadata object, including the stripped fields.
    pub fn to_json(&self) -> Json {
        let mut full = json!({
            "app": self.app,
            "version": self.version,
            "base": self.base,
            "vrun": self.vrun,
        });
        if let (Json::Object(full), Json::Object(payload)) = (&mut full, self.payload_json()) {
            full.extend(payload);
        }
        full
    }

    /// Builds the OP_RETURN script embedding this metadata.
    pub fn op_return_script(&self) -> Vec<u8> {
        let payload = serde_json::to_string(&self.payload_json()).unwrap_or_default();
        let mut script = vec![OP_FALSE, OP_RETURN];
        push_data(&mut script, PROTOCOL_PREFIX);
        push_data(&mut script, &[self.version]);
        push_data(&mut script, self.app.as_bytes());
        push_data(&mut script, payload.as_bytes());
        script
    }

    /// Extracts the metadata record from a transaction's first output.
    ///
    /// `vrun` cannot be recovered from the push (it is carried outside); callers replaying a
    /// transaction built over a base supply it, everyone else passes 0.
    pub fn from_tx(tx: &Tx, vrun: u32) -> Result<Metadata, MetadataError> {
        let script = tx
            .outputs
            .first()
            .map(|out: &TxOut| out.script.as_slice())
            .ok_or(MetadataError::NotProtocol)?;
        let pushes = parse_op_return(script)?;
        let [prefix, version, app, payload] = pushes.as_slice() else {
            return Err(MetadataError::NotProtocol);
        };
        if prefix.as_slice() != PROTOCOL_PREFIX {
            return Err(MetadataError::NotProtocol);
        }
        let version = match version.as_slice() {
            [v] if *v == PROTOCOL_VERSION => *v,
            [v] => return Err(MetadataError::UnknownVersion(*v)),
            _ => return Err(MetadataError::NotProtocol),
        };
        let app = String::from_utf8(app.clone())
            .map_err(|_| MetadataError::Malformed("app is not utf-8".into()))?;
        let payload: Json = serde_json::from_slice(payload)
            .map_err(|e| MetadataError::Malformed(format!("json: {e}")))?;
        let mut metadata = Self::from_payload(&payload)?;
        metadata.app = app;
        metadata.version = version;
        metadata.vrun = vrun;
        Ok(metadata)
    }

    /// Parses the six-field payload with strict shape validation.
    pub fn from_payload(payload: &Json) -> Result<Metadata, MetadataError> {
        let bad = |msg: &str| MetadataError::Malformed(msg.to_string());
        let obj = payload.as_object().ok_or_else(|| bad("payload is not an object"))?;
        let expected = ["in", "ref", "out", "del", "cre", "exec"];
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        if keys != expected {
            return Err(bad("wrong field set or order"));
        }
        let inputs = obj["in"].as_u64().ok_or_else(|| bad("in"))? as usize;
        let strings = |key: &str| -> Result<Vec<String>, MetadataError> {
            obj[key]
                .as_array()
                .ok_or_else(|| bad(key))?
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| bad(key)))
                .collect()
        };
        let refs = strings("ref")?;
        let out = strings("out")?;
        let del = strings("del")?;
        for hash in out.iter().chain(&del) {
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad("state hash"));
            }
        }
        let cre = obj["cre"].as_array().ok_or_else(|| bad("cre"))?.clone();
        let exec = obj["exec"]
            .as_array()
            .ok_or_else(|| bad("exec"))?
            .iter()
            .map(|entry| {
                let entry = entry.as_object().ok_or_else(|| bad("exec entry"))?;
                if entry.len() != 2 {
                    return Err(bad("exec entry"));
                }
                let op = entry
                    .get("op")
                    .and_then(Json::as_str)
                    .and_then(|s| s.parse::<Op>().ok())
                    .ok_or_else(|| bad("exec op"))?;
                let data = entry.get("data").ok_or_else(|| bad("exec data"))?;
                if !data.is_array() {
                    return Err(bad("exec data"));
                }
                Ok(ExecEntry { op, data: data.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Metadata {
            app: String::new(),
            version: PROTOCOL_VERSION,
            base: String::new(),
            vrun: 0,
            inputs,
            refs,
            out,
            del,
            cre,
            exec,
        })
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(0x00),
        len @ 1..=75 => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 76..=255 => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 256..=65535 => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

fn take<'a>(rest: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], MetadataError> {
    let end = pos.checked_add(len).ok_or(MetadataError::NotProtocol)?;
    let slice = rest.get(*pos..end).ok_or(MetadataError::NotProtocol)?;
    *pos = end;
    Ok(slice)
}

fn parse_op_return(script: &[u8]) -> Result<Vec<Vec<u8>>, MetadataError> {
    let rest = script
        .strip_prefix(&[OP_FALSE, OP_RETURN])
        .ok_or(MetadataError::NotProtocol)?;
    let mut pushes = Vec::new();
    let mut pos = 0;
    while pos < rest.len() {
        if pushes.len() == 4 {
            return Err(MetadataError::TooManyPushes);
        }
        let opcode = rest[pos];
        pos += 1;
        let len = match opcode {
            0x00 => 0,
            1..=75 => opcode as usize,
            OP_PUSHDATA1 => take(rest, &mut pos, 1)?[0] as usize,
            OP_PUSHDATA2 => {
                u16::from_le_bytes(take(rest, &mut pos, 2)?.try_into().expect("2 bytes")) as usize
            }
            OP_PUSHDATA4 => {
                u32::from_le_bytes(take(rest, &mut pos, 4)?.try_into().expect("4 bytes")) as usize
            }
            _ => return Err(MetadataError::NotProtocol),
        };
        pushes.push(take(rest, &mut pos, len)?.to_vec());
    }
    Ok(pushes)
}

/// First difference between two JSON trees, as a dotted path, for divergence diagnostics.
pub fn first_difference(a: &Json, b: &Json) -> Option<String> {
    fn walk(a: &Json, b: &Json, path: &mut Vec<String>) -> Option<String> {
        match (a, b) {
            (Json::Object(x), Json::Object(y)) => {
                for key in x.keys().chain(y.keys()) {
                    match (x.get(key), y.get(key)) {
                        (Some(va), Some(vb)) => {
                            path.push(key.clone());
                            if let Some(hit) = walk(va, vb, path) {
                                return Some(hit);
                            }
                            path.pop();
                        }
                        _ => return Some(format!("{}.{key}", path.join("."))),
                    }
                }
                None
            }
            (Json::Array(x), Json::Array(y)) => {
                if x.len() != y.len() {
                    return Some(format!("{}.length", path.join(".")));
                }
                for (n, (va, vb)) in x.iter().zip(y).enumerate() {
                    path.push(n.to_string());
                    if let Some(hit) = walk(va, vb, path) {
                        return Some(hit);
                    }
                    path.pop();
                }
                None
            }
            _ if a == b => None,
            _ => Some(path.join(".")),
        }
    }
    walk(a, b, &mut Vec::new())
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;
    use serde_json::json;

    fn sample() -> Metadata {
        Metadata {
            app: "demo".into(),
            version: PROTOCOL_VERSION,
            base: String::new(),
            vrun: 0,
            inputs: 1,
            refs: vec!["native://ScriptLock".into()],
            out: vec!["ab".repeat(32)],
            del: vec![],
            cre: vec![],
            exec: vec![ExecEntry { op: Op::Call, data: json!([{"$jig": 0}, "set", [7]]) }],
        }
    }

    fn wrap(metadata: &Metadata) -> Tx {
        Tx {
            outputs: vec![TxOut { satoshis: 0, script: metadata.op_return_script() }],
            ..Tx::default()
        }
    }

    #[test]
    fn op_return_roundtrip() {
        let metadata = sample();
        let parsed = Metadata::from_tx(&wrap(&metadata), 0).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn payload_field_order() {
        let payload = sample().payload_json();
        let order: Vec<String> = payload.as_object().unwrap().keys().cloned().collect();
        assert_eq!(order, ["in", "ref", "out", "del", "cre", "exec"]);
        assert!(serde_json::to_string(&payload).unwrap().starts_with(r#"{"in":1,"ref":["#));
    }

    #[test]
    fn unknown_version_rejects() {
        let mut metadata = sample();
        metadata.version = 0x06;
        assert_eq!(Metadata::from_tx(&wrap(&metadata), 0), Err(MetadataError::UnknownVersion(0x06)));
    }

    #[test]
    fn fifth_push_rejects() {
        let metadata = sample();
        let mut script = metadata.op_return_script();
        script.push(0x01);
        script.push(0xff);
        let tx = Tx { outputs: vec![TxOut { satoshis: 0, script }], ..Tx::default() };
        assert_eq!(Metadata::from_tx(&tx, 0), Err(MetadataError::TooManyPushes));
    }

    #[test]
    fn wrong_field_order_rejects() {
        let payload = json!({"ref": [], "in": 0, "out": [], "del": [], "cre": [], "exec": []});
        assert!(Metadata::from_payload(&payload).is_err());
    }

    #[test]
    fn difference_paths() {
        let a = json!({"out": ["aa", "bb"], "in": 1});
        let b = json!({"out": ["aa", "bc"], "in": 1});
        assert_eq!(first_difference(&a, &b), Some("out.1".into()));
        assert_eq!(first_difference(&a, &a), None);
    }
}
