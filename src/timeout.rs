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

//! Cooperative deadlines.
//!
//! Every externally-initiated operation (publish, load, replay, sync) carries a [`Timeout`]
//! consulted between pipeline steps and at every collaborator call. Wall-clock time is used
//! only to *abort* work, never to influence produced bytes, so determinism is unaffected.

use std::time::{Duration, Instant};

use crate::error::TimeoutError;

#[derive(Clone, Debug)]
pub struct Timeout {
    op: String,
    txid: Option<String>,
    start: Instant,
    limit: Duration,
}

impl Timeout {
    pub fn new(op: impl ToString, limit: Duration) -> Self {
        Timeout { op: op.to_string(), txid: None, start: Instant::now(), limit }
    }

    /// Attaches the transaction being processed, for error context.
    pub fn with_txid(mut self, txid: impl ToString) -> Self {
        self.txid = Some(txid.to_string());
        self
    }

    #[inline]
    pub fn op(&self) -> &str { &self.op }

    /// Errors once the deadline has passed. Cheap; called between steps and at suspension
    /// points.
    pub fn check(&self) -> Result<(), TimeoutError> {
        if self.start.elapsed() <= self.limit {
            return Ok(());
        }
        Err(match &self.txid {
            Some(txid) => TimeoutError::ExpiredTx { op: self.op.clone(), txid: txid.clone() },
            None => TimeoutError::Expired { op: self.op.clone() },
        })
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    #[test]
    fn expires() {
        let timeout = Timeout::new("load", Duration::ZERO).with_txid("ab");
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            timeout.check(),
            Err(TimeoutError::ExpiredTx { op: "load".into(), txid: "ab".into() })
        );
        assert!(Timeout::new("load", Duration::from_secs(60)).check().is_ok());
    }
}
