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

//! Insertion-ordered creation set with origin-keyed uniqueness.
//!
//! Membership is first checked by identity, then by origin: two creations are "the same" iff
//! their origins are equal. If a same-origin creation is already present at a *different*
//! location, the worldview is inconsistent and the operation fails — this is the global
//! uniqueness guarantee preventing two states of one creation from being used in one
//! operation. Creations whose origin is not yet global (`record://`, `error://`, unset)
//! match only by identity.

use std::collections::HashMap;

use indexmap::IndexSet;

use crate::creation::{CreationId, Creations};
use crate::location::Location;
use crate::error::WorldviewError;

#[derive(Clone, Debug, Default)]
pub struct CreationSet {
    entries: IndexSet<CreationId>,
    by_origin: HashMap<Location, CreationId>,
}

impl CreationSet {
    pub fn new() -> Self { CreationSet::default() }

    #[inline]
    pub fn len(&self) -> usize { self.entries.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Iterates members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = CreationId> + '_ { self.entries.iter().copied() }

    /// Position of a member in insertion order.
    pub fn index_of(&self, id: CreationId) -> Option<usize> { self.entries.get_index_of(&id) }

    /// Identity-only membership, without the origin check.
    pub fn contains_identity(&self, id: CreationId) -> bool { self.entries.contains(&id) }

    fn global_origin(creations: &Creations, id: CreationId) -> Option<Location> {
        creations.origin_of(id).filter(|o| o.is_global()).cloned()
    }

    fn check(
        &self,
        creations: &Creations,
        id: CreationId,
        origin: &Location,
        present: CreationId,
    ) -> Result<CreationId, WorldviewError> {
        let a = creations.location_of(present);
        let b = creations.location_of(id);
        if a == b {
            return Ok(present);
        }
        let show = |l: Option<&Location>| l.map(Location::to_string).unwrap_or_else(|| "?".into());
        Err(WorldviewError::Inconsistent { origin: origin.to_string(), a: show(a), b: show(b) })
    }

    /// Membership by identity, then by origin.
    ///
    /// Same origin at a different location is an inconsistent worldview, not a miss.
    pub fn has(&self, creations: &Creations, id: CreationId) -> Result<bool, WorldviewError> {
        if self.entries.contains(&id) {
            return Ok(true);
        }
        let Some(origin) = Self::global_origin(creations, id) else {
            return Ok(false);
        };
        match self.by_origin.get(&origin) {
            Some(&present) => self.check(creations, id, &origin, present).map(|_| true),
            None => Ok(false),
        }
    }

    /// Resolves a creation to the member representing the same on-chain entity, if any.
    pub fn get(&self, creations: &Creations, id: CreationId) -> Result<Option<CreationId>, WorldviewError> {
        if self.entries.contains(&id) {
            return Ok(Some(id));
        }
        let Some(origin) = Self::global_origin(creations, id) else {
            return Ok(None);
        };
        match self.by_origin.get(&origin) {
            Some(&present) => self.check(creations, id, &origin, present).map(Some),
            None => Ok(None),
        }
    }

    /// Adds a creation. Returns `true` if the set changed.
    pub fn add(&mut self, creations: &Creations, id: CreationId) -> Result<bool, WorldviewError> {
        if self.has(creations, id)? {
            return Ok(false);
        }
        if let Some(origin) = Self::global_origin(creations, id) {
            self.by_origin.insert(origin, id);
        }
        Ok(self.entries.insert(id))
    }

    /// Re-registers a member's origin after its bindings changed (publication finalize).
    pub fn reindex(&mut self, creations: &Creations) {
        self.by_origin.clear();
        for &id in &self.entries {
            if let Some(origin) = Self::global_origin(creations, id) {
                self.by_origin.insert(origin, id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_origin.clear();
    }
}

impl FromIterator<CreationId> for CreationSet {
    /// Builds a set by identity only; callers needing origin checks use [`CreationSet::add`].
    fn from_iter<T: IntoIterator<Item = CreationId>>(iter: T) -> Self {
        CreationSet { entries: iter.into_iter().collect(), by_origin: HashMap::new() }
    }
}
