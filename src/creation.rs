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

//! Creations: code, jig instances and berries.
//!
//! Creations live in an arena and are addressed by [`CreationId`]; the id is the observable
//! identity used by user code, and stays stable across upgrades. Each creation carries the
//! five protocol bindings (`origin`, `location`, `nonce`, `owner`, `satoshis`), a root
//! properties object on the heap, and — for code — its source plus the live [`Dynamic`]
//! implementation container.

use std::sync::Arc;

use crate::dynamic::Dynamic;
use crate::location::Location;
use crate::logic::{ClassLogic, LogicKind};
use crate::membrane::Rules;
use crate::value::{ObjId, Value};

/// Handle of a creation in the arena.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CreationId(pub(crate) u32);

impl CreationId {
    #[inline]
    pub fn index(self) -> usize { self.0 as usize }
}

/// The three creation kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Kind {
    Code,
    Jig,
    Berry,
}

impl Kind {
    pub fn state_name(self) -> &'static str {
        match self {
            Kind::Code => "code",
            Kind::Jig => "jig",
            Kind::Berry => "berry",
        }
    }
}

/// Property names reserved for the protocol bindings, in their canonical state order.
pub const BINDING_KEYS: [&str; 5] = ["location", "nonce", "origin", "owner", "satoshis"];

pub fn is_binding(key: &str) -> bool { BINDING_KEYS.contains(&key) }

/// The five protocol bindings.
///
/// `None` means undetermined: a fresh creation has no location, no owner and no satoshis
/// until its record assigns them. A destroyed creation holds `owner = Some(Null)` and
/// `satoshis = Some(0)` — terminal by invariant.
#[derive(Clone, Debug)]
pub struct Bindings {
    pub origin: Option<Location>,
    pub location: Option<Location>,
    pub nonce: u64,
    pub owner: Option<Value>,
    pub satoshis: Option<u64>,
}

impl Bindings {
    pub fn unbound() -> Self {
        Bindings { origin: None, location: None, nonce: 0, owner: None, satoshis: None }
    }

    pub fn native(name: &str) -> Self {
        let loc = Location::Native(name.to_string());
        Bindings {
            origin: Some(loc.clone()),
            location: Some(loc),
            nonce: 0,
            owner: None,
            satoshis: None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(&self.owner, Some(Value::Null)) && self.satoshis == Some(0)
    }

    /// Whether the creation has ever been assigned a global or record location.
    pub fn is_deployed(&self) -> bool { self.location.is_some() }
}

/// Code-specific state: the deployed source and its live implementation.
#[derive(Clone, Debug)]
pub struct CodeBody {
    pub name: String,
    pub src: String,
    pub dynamic: Dynamic,
}

/// One creation arena entry.
#[derive(Clone, Debug)]
pub struct Creation {
    pub kind: Kind,
    pub native: bool,
    pub bindings: Bindings,
    /// Root owned-properties object; its heap owner is this creation.
    pub props: ObjId,
    /// Class of a jig or berry instance.
    pub class: Option<CreationId>,
    pub code: Option<CodeBody>,
    pub rules: Rules,
}

impl Creation {
    pub fn is_sidekick(&self) -> bool {
        self.code
            .as_ref()
            .is_some_and(|code| code.dynamic.kind() == LogicKind::Sidekick)
    }
}

/// Arena of all creations known to a kernel.
#[derive(Clone, Debug, Default)]
pub struct Creations {
    slots: Vec<Creation>,
}

impl Creations {
    pub fn alloc(&mut self, creation: Creation) -> CreationId {
        let id = CreationId(self.slots.len() as u32);
        self.slots.push(creation);
        id
    }

    #[inline]
    pub fn get(&self, id: CreationId) -> &Creation { &self.slots[id.index()] }

    #[inline]
    pub fn get_mut(&mut self, id: CreationId) -> &mut Creation { &mut self.slots[id.index()] }

    pub fn iter(&self) -> impl Iterator<Item = (CreationId, &Creation)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(n, c)| (CreationId(n as u32), c))
    }

    /// Resolves the live logic of a code creation, or of an instance's class.
    pub fn logic(&self, id: CreationId) -> Option<Arc<dyn ClassLogic>> {
        let creation = self.get(id);
        let code = match (&creation.code, creation.class) {
            (Some(code), _) => code,
            (None, Some(class)) => self.get(class).code.as_ref()?,
            _ => return None,
        };
        Some(code.dynamic.inner().clone())
    }

    /// Class of a creation: itself for code, its class for instances. Stable across upgrades.
    pub fn class_of(&self, id: CreationId) -> CreationId { self.get(id).class.unwrap_or(id) }

    /// Display name: the code name, or the class name for instances.
    pub fn name_of(&self, id: CreationId) -> String {
        let creation = self.get(id);
        match (&creation.code, creation.class) {
            (Some(code), _) => code.name.clone(),
            (None, Some(class)) => self.name_of(class),
            _ => String::from("?"),
        }
    }

    pub fn location_of(&self, id: CreationId) -> Option<&Location> {
        self.get(id).bindings.location.as_ref()
    }

    pub fn origin_of(&self, id: CreationId) -> Option<&Location> { self.get(id).bindings.origin.as_ref() }

    /// Origin-equality `instanceof`: whether `id` is an instance of the class `class`,
    /// comparing class identities by origin so that different states of one class match.
    pub fn instance_of(&self, id: CreationId, class: CreationId) -> bool {
        let Some(own) = self.get(id).class else { return false };
        if own == class {
            return true;
        }
        match (self.origin_of(own), self.origin_of(class)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
