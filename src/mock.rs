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

//! In-memory collaborators for tests and local experimentation.
//!
//! [`Mockchain`] keeps broadcast transactions and a spend index in memory and rejects
//! double-spends the way a real node would; [`MemoryCache`] enforces the immutable-scheme
//! contract; [`MockOwner`] hands out deterministic locks; [`MockPurse`] appends one funding
//! input and a change output without touching anything already present.

use std::collections::HashMap;

use crate::codec::Json;
use crate::env::{Blockchain, Cache, OwnerWallet, Parent, Purse, RawLock};
use crate::error::ExternalError;
use crate::tx::{Tx, TxIn, TxOut};

#[derive(Clone, Debug, Default)]
pub struct Mockchain {
    txs: HashMap<String, String>,
    spends: HashMap<(String, u32), String>,
}

impl Mockchain {
    /// Number of broadcast transactions.
    pub fn tx_count(&self) -> usize { self.txs.len() }
}

impl Blockchain for Mockchain {
    fn network(&self) -> &str { "mock" }

    fn fetch(&mut self, txid: &str) -> Result<String, ExternalError> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| ExternalError::Fetch(format!("unknown transaction {txid}")))
    }

    fn broadcast(&mut self, rawtx: &str) -> Result<String, ExternalError> {
        let tx = Tx::from_hex(rawtx).map_err(|e| ExternalError::Broadcast(e.to_string()))?;
        if tx.outputs.is_empty() {
            return Err(ExternalError::Broadcast("transaction has no outputs".into()));
        }
        let txid = tx.txid();
        for input in &tx.inputs {
            let outpoint = (input.prev_txid.clone(), input.prev_vout);
            match self.spends.get(&outpoint) {
                Some(spender) if *spender != txid => {
                    return Err(ExternalError::Broadcast(format!(
                        "missing inputs: {}:{} was spent",
                        input.prev_txid, input.prev_vout
                    )))
                }
                _ => {}
            }
        }
        for input in &tx.inputs {
            self.spends
                .insert((input.prev_txid.clone(), input.prev_vout), txid.clone());
        }
        self.txs.insert(txid.clone(), rawtx.to_string());
        Ok(txid)
    }

    fn spends(&mut self, txid: &str, vout: u32) -> Result<Option<String>, ExternalError> {
        Ok(self.spends.get(&(txid.to_string(), vout)).cloned())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<String, Json>,
}

impl MemoryCache {
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

const IMMUTABLE_SCHEMES: [&str; 3] = ["jig://", "tx://", "berry://"];

impl Cache for MemoryCache {
    fn get(&mut self, key: &str) -> Result<Option<Json>, ExternalError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Json) -> Result<(), ExternalError> {
        if IMMUTABLE_SCHEMES.iter().any(|scheme| key.starts_with(scheme)) {
            if let Some(present) = self.entries.get(key) {
                if *present != value {
                    return Err(ExternalError::CacheImmutable(key.to_string()));
                }
                return Ok(());
            }
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Hands out one distinct, deterministic lock per call.
#[derive(Clone, Debug, Default)]
pub struct MockOwner {
    next: u8,
}

impl OwnerWallet for MockOwner {
    fn next_owner(&mut self) -> Result<RawLock, ExternalError> {
        self.next = self.next.wrapping_add(1);
        // OP_TRUE plus a discriminating byte; mock scripts never get executed
        Ok(RawLock { script: vec![0x51, self.next], domain: 73 })
    }

    fn sign(&mut self, rawtx: &str, _parents: &[Parent], _locks: &[RawLock]) -> Result<String, ExternalError> {
        Ok(rawtx.to_string())
    }
}

/// Funds transactions from an endless pretend UTXO set.
#[derive(Clone, Debug, Default)]
pub struct MockPurse {
    next: u32,
}

impl Purse for MockPurse {
    fn pay(&mut self, rawtx: &str, _parents: &[Parent]) -> Result<String, ExternalError> {
        let mut tx = Tx::from_hex(rawtx).map_err(|e| ExternalError::Pay(e.to_string()))?;
        self.next += 1;
        let funding = format!("{:064x}", 0xfee0_0000_u64 as u128 + self.next as u128);
        tx.inputs.push(TxIn {
            prev_txid: funding,
            prev_vout: 0,
            script: vec![],
            sequence: 0xffff_ffff,
        });
        tx.outputs.push(TxOut { satoshis: 10_000, script: vec![0x6f, 0x01] });
        Ok(tx.to_hex())
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;
    use serde_json::json;

    #[test]
    fn mockchain_roundtrip_and_double_spend() {
        let mut chain = Mockchain::default();
        let genesis = Tx {
            outputs: vec![TxOut { satoshis: 546, script: vec![0x51] }],
            ..Tx::default()
        };
        let txid = chain.broadcast(&genesis.to_hex()).unwrap();
        assert_eq!(chain.fetch(&txid).unwrap(), genesis.to_hex());
        assert_eq!(chain.spends(&txid, 0).unwrap(), None);

        let spend = Tx {
            inputs: vec![TxIn { prev_txid: txid.clone(), prev_vout: 0, script: vec![], sequence: 0 }],
            outputs: vec![TxOut { satoshis: 546, script: vec![0x52] }],
            ..Tx::default()
        };
        let spender = chain.broadcast(&spend.to_hex()).unwrap();
        assert_eq!(chain.spends(&txid, 0).unwrap(), Some(spender));

        let conflict = Tx {
            inputs: vec![TxIn { prev_txid: txid.clone(), prev_vout: 0, script: vec![], sequence: 1 }],
            outputs: vec![TxOut { satoshis: 546, script: vec![0x53] }],
            ..Tx::default()
        };
        assert!(chain.broadcast(&conflict.to_hex()).is_err());
    }

    #[test]
    fn cache_immutability() {
        let mut cache = MemoryCache::default();
        cache.set("jig://abc_o1", json!({"n": 1})).unwrap();
        cache.set("jig://abc_o1", json!({"n": 1})).unwrap();
        assert_eq!(
            cache.set("jig://abc_o1", json!({"n": 2})),
            Err(ExternalError::CacheImmutable("jig://abc_o1".into()))
        );
        cache.set("trust://abc", json!(true)).unwrap();
        cache.set("trust://abc", json!(false)).unwrap();
    }

    #[test]
    fn purse_preserves_existing_fields() {
        let mut purse = MockPurse::default();
        let partial = Tx {
            outputs: vec![TxOut { satoshis: 0, script: vec![0x00, 0x6a] }],
            ..Tx::default()
        };
        let paid = Tx::from_hex(&purse.pay(&partial.to_hex(), &[]).unwrap()).unwrap();
        assert_eq!(paid.outputs[0], partial.outputs[0]);
        assert_eq!(paid.inputs.len(), 1);
        assert_eq!(paid.outputs.len(), 2);
    }
}
