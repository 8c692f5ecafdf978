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

//! Location URIs.
//!
//! Every creation is addressed by a location URI. The grammar covers six encoded forms:
//!
//! - `native://<Name>` — built-in creations not deployed on chain;
//! - `<txid>_o<n>` — the n-th non-metadata output of a transaction;
//! - `<txid>_d<n>` — the n-th delete slot (destroyed creations);
//! - `record://<recordId>_o<n>` / `record://<recordId>_d<n>` — live, pre-publication;
//! - `error://<message>` — poisoned state after a failed publish;
//! - `<txid>_o<n>?berry=<query>&hash=<h>` — berry locations.
//!
//! Partial forms `_o<n>` / `_d<n>` (txid-less) appear inside captured states, where they
//! refer to slots of the same commit.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use crate::error::ArgumentError;

/// Discriminates output slots from delete slots in a single transaction or record.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Slot {
    Output,
    Deleted,
}

impl Slot {
    pub fn marker(self) -> &'static str {
        match self {
            Slot::Output => "_o",
            Slot::Deleted => "_d",
        }
    }
}

/// Parsed form of a location URI.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Location {
    /// Built-in creation, never deployed on chain.
    Native(String),

    /// Slot of a published transaction.
    Tx { txid: String, slot: Slot, index: u32 },

    /// Slot of a not-yet-published record.
    Record { record: String, slot: Slot, index: u32 },

    /// Same-commit slot reference, used only inside captured states.
    Partial { slot: Slot, index: u32 },

    /// Poisoned binding after a failed first publish.
    Error(String),

    /// Berry plucked through the code published at the given output.
    Berry {
        txid: String,
        index: u32,
        path: String,
        hash: String,
    },
}

impl Location {
    pub fn output(txid: impl ToString, index: u32) -> Self {
        Location::Tx { txid: txid.to_string(), slot: Slot::Output, index }
    }

    pub fn deleted(txid: impl ToString, index: u32) -> Self {
        Location::Tx { txid: txid.to_string(), slot: Slot::Deleted, index }
    }

    pub fn record(record: impl ToString, slot: Slot, index: u32) -> Self {
        Location::Record { record: record.to_string(), slot, index }
    }

    /// Whether the location belongs to a published transaction (including berries).
    pub fn is_published(&self) -> bool { matches!(self, Location::Tx { .. } | Location::Berry { .. }) }

    /// Whether the location identifies the creation globally (anything except `record://`,
    /// `error://` and partial forms).
    pub fn is_global(&self) -> bool {
        matches!(self, Location::Native(_) | Location::Tx { .. } | Location::Berry { .. })
    }

    pub fn is_record(&self) -> bool { matches!(self, Location::Record { .. }) }

    pub fn is_error(&self) -> bool { matches!(self, Location::Error(_)) }

    pub fn txid(&self) -> Option<&str> {
        match self {
            Location::Tx { txid, .. } | Location::Berry { txid, .. } => Some(txid),
            _ => None,
        }
    }

    /// The record id for `record://` locations.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Location::Record { record, .. } => Some(record),
            _ => None,
        }
    }

    /// Renders the location for a captured state: slots of the commit being captured are
    /// emitted txid-less so that state hashes agree between publication (txid unknown) and
    /// replay (txid known).
    pub fn to_state_string(&self, own: Option<&str>) -> String {
        match (self, own) {
            (Location::Tx { txid, slot, index }, Some(own)) if txid == own => {
                format!("{}{index}", slot.marker())
            }
            (Location::Record { slot, index, .. }, _) => format!("{}{index}", slot.marker()),
            _ => self.to_string(),
        }
    }

    /// Resolves a partial state location against the transaction it was captured in.
    pub fn absolute(self, txid: &str) -> Self {
        match self {
            Location::Partial { slot, index } => Location::Tx { txid: txid.to_string(), slot, index },
            other => other,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Location::Native(name) => write!(f, "native://{name}"),
            Location::Tx { txid, slot, index } => write!(f, "{txid}{}{index}", slot.marker()),
            Location::Record { record, slot, index } => {
                write!(f, "record://{record}{}{index}", slot.marker())
            }
            Location::Partial { slot, index } => write!(f, "{}{index}", slot.marker()),
            Location::Error(msg) => write!(f, "error://{msg}"),
            Location::Berry { txid, index, path, hash } => {
                write!(f, "{txid}_o{index}?berry={path}&hash={hash}")
            }
        }
    }
}

fn is_txid(s: &str) -> bool { s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) }

fn split_slot(s: &str) -> Option<(&str, Slot, u32)> {
    let (at, slot) = match (s.rfind("_o"), s.rfind("_d")) {
        (Some(o), Some(d)) if o > d => (o, Slot::Output),
        (Some(o), None) => (o, Slot::Output),
        (_, Some(d)) => (d, Slot::Deleted),
        (None, None) => return None,
    };
    let index = s[at + 2..].parse().ok()?;
    Some((&s[..at], slot, index))
}

impl FromStr for Location {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ArgumentError::BadLocation(s.to_string());

        if let Some(name) = s.strip_prefix("native://") {
            if name.is_empty() {
                return Err(bad());
            }
            return Ok(Location::Native(name.to_string()));
        }
        if let Some(msg) = s.strip_prefix("error://") {
            return Ok(Location::Error(msg.to_string()));
        }
        if let Some(rest) = s.strip_prefix("record://") {
            let (record, slot, index) = split_slot(rest).ok_or_else(bad)?;
            if record.is_empty() {
                return Err(bad());
            }
            return Ok(Location::Record { record: record.to_string(), slot, index });
        }
        if let Some((head, query)) = s.split_once('?') {
            let (txid, slot, index) = split_slot(head).ok_or_else(bad)?;
            if slot != Slot::Output || !is_txid(txid) {
                return Err(bad());
            }
            let rest = query.strip_prefix("berry=").ok_or_else(bad)?;
            let (path, hash) = rest.rsplit_once("&hash=").ok_or_else(bad)?;
            return Ok(Location::Berry {
                txid: txid.to_string(),
                index,
                path: path.to_string(),
                hash: hash.to_string(),
            });
        }
        let (txid, slot, index) = split_slot(s).ok_or_else(bad)?;
        if txid.is_empty() {
            return Ok(Location::Partial { slot, index });
        }
        if !is_txid(txid) {
            return Err(bad());
        }
        Ok(Location::Tx { txid: txid.to_string(), slot, index })
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    const TXID: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn roundtrip() {
        for s in [
            "native://ScriptLock",
            &format!("{TXID}_o2"),
            &format!("{TXID}_d0"),
            "record://r00000001_o0",
            "record://r00000001_d3",
            "_o1",
            "error://deploy failed",
            &format!("{TXID}_o0?berry=abc/def&hash=00ff"),
        ] {
            let loc: Location = s.parse().unwrap();
            assert_eq!(loc.to_string(), *s);
        }
    }

    #[test]
    fn rejects_garbage() {
        for s in ["", "native://", "nottxid_o1", "record://_o1", &format!("{TXID}_x1")] {
            assert!(Location::from_str(s).is_err(), "{s}");
        }
    }

    #[test]
    fn state_rendering() {
        let loc = Location::output(TXID, 1);
        assert_eq!(loc.to_state_string(Some(TXID)), "_o1");
        assert_eq!(loc.to_state_string(Some("ff")), format!("{TXID}_o1"));
        let rec = Location::record("r1", Slot::Deleted, 0);
        assert_eq!(rec.to_state_string(None), "_d0");
        assert_eq!("_o1".parse::<Location>().unwrap().absolute(TXID), Location::output(TXID, 1));
    }
}
