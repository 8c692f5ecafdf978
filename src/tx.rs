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

//! Minimal UTXO-transaction codec.
//!
//! The full transaction builder is an external concern; the kernel only needs to assemble
//! partial transactions, compare paid ones field-by-field, extract the metadata output and
//! compute txids. Scripts are opaque byte strings. Serialization is the classic layout:
//! little-endian version, varint-counted inputs (reversed txid, vout, script, sequence),
//! varint-counted outputs (value, script), lock time; txid is double-SHA256 of those bytes,
//! hex-encoded in reversed byte order.

use sha2::{Digest, Sha256};

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum TxError {
    /// transaction is not valid hex
    BadHex,

    /// truncated transaction
    Truncated,

    /// trailing bytes after transaction
    Trailing,

    /// invalid txid {0}
    BadTxid(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    /// Txid of the previous transaction, in display (reversed) hex.
    pub prev_txid: String,
    pub prev_vout: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    pub satoshis: u64,
    pub script: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tx {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Default for Tx {
    fn default() -> Self { Tx { version: 1, inputs: vec![], outputs: vec![], locktime: 0 } }
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], TxError> {
        let end = self.pos.checked_add(len).ok_or(TxError::Truncated)?;
        if end > self.data.len() {
            return Err(TxError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, TxError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, TxError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn varint(&mut self) -> Result<u64, TxError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")) as u64,
            0xfe => u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")) as u64,
            0xff => u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")),
            n => n as u64,
        })
    }
}

impl Tx {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            let mut txid = hex::decode(&input.prev_txid).unwrap_or_else(|_| vec![0; 32]);
            txid.reverse();
            out.extend_from_slice(&txid);
            out.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_varint(&mut out, input.script.len() as u64);
            out.extend_from_slice(&input.script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.satoshis.to_le_bytes());
            write_varint(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn to_hex(&self) -> String { hex::encode(self.to_bytes()) }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TxError> {
        let mut r = Reader { data, pos: 0 };
        let version = r.u32()?;
        let n_inputs = r.varint()?;
        let mut inputs = Vec::with_capacity(n_inputs.min(1024) as usize);
        for _ in 0..n_inputs {
            let mut txid = r.take(32)?.to_vec();
            txid.reverse();
            let prev_txid = hex::encode(txid);
            let prev_vout = r.u32()?;
            let len = r.varint()? as usize;
            let script = r.take(len)?.to_vec();
            let sequence = r.u32()?;
            inputs.push(TxIn { prev_txid, prev_vout, script, sequence });
        }
        let n_outputs = r.varint()?;
        let mut outputs = Vec::with_capacity(n_outputs.min(1024) as usize);
        for _ in 0..n_outputs {
            let satoshis = r.u64()?;
            let len = r.varint()? as usize;
            let script = r.take(len)?.to_vec();
            outputs.push(TxOut { satoshis, script });
        }
        let locktime = r.u32()?;
        if r.pos != data.len() {
            return Err(TxError::Trailing);
        }
        Ok(Tx { version, inputs, outputs, locktime })
    }

    pub fn from_hex(rawtx: &str) -> Result<Self, TxError> {
        let data = hex::decode(rawtx).map_err(|_| TxError::BadHex)?;
        Self::from_bytes(&data)
    }

    /// Txid in display hex: double-SHA256 of the serialization, byte-reversed.
    pub fn txid(&self) -> String {
        let once = Sha256::digest(self.to_bytes());
        let mut twice = Sha256::digest(once).to_vec();
        twice.reverse();
        hex::encode(twice)
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    fn sample() -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxIn {
                prev_txid: "11".repeat(32),
                prev_vout: 1,
                script: vec![0xde, 0xad],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![
                TxOut { satoshis: 0, script: vec![0x00, 0x6a] },
                TxOut { satoshis: 546, script: vec![0x51] },
            ],
            locktime: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let tx = sample();
        let parsed = Tx::from_hex(&tx.to_hex()).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn txid_is_stable() {
        let tx = sample();
        assert_eq!(tx.txid(), tx.txid());
        assert_eq!(tx.txid().len(), 64);
        let mut other = sample();
        other.outputs[1].satoshis += 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn truncation_rejects() {
        let mut bytes = sample().to_bytes();
        bytes.pop();
        assert_eq!(Tx::from_bytes(&bytes), Err(TxError::Truncated));
        bytes.push(0);
        bytes.push(0);
        assert_eq!(Tx::from_bytes(&bytes), Err(TxError::Trailing));
    }
}
