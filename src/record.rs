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

//! The live action log of one transaction in progress.
//!
//! A record accumulates top-level actions and the sets they imply, maintains the call stack
//! and per-creation pre-images, and assigns `record://` locations after every action. The
//! derived sets are recomputed from scratch each time, in a stable order:
//!
//! ```text
//! inputs  = (updates ∪ auths ∪ deletes) \ creates
//! outputs = (inputs ∪ creates) \ deletes
//! refs    = reads \ inputs \ outputs \ deletes
//! ```

use indexmap::IndexMap;

use crate::action::Action;
use crate::creation::{CreationId, Creations};
use crate::error::{KernelError, RuleError};
use crate::location::{Location, Slot};
use crate::set::CreationSet;
use crate::snapshot::Snapshot;
use crate::value::{Heap, ObjId, Value};

#[derive(Clone, Debug)]
pub struct Record {
    pub id: String,
    pub actions: Vec<Action>,

    pub creates: CreationSet,
    pub reads: CreationSet,
    pub updates: CreationSet,
    pub deletes: CreationSet,
    pub auths: CreationSet,
    /// Creations whose UTXO bindings will be re-determined by this record.
    pub unbound: CreationSet,

    // derived
    pub inputs: CreationSet,
    pub outputs: CreationSet,
    pub refs: CreationSet,

    pub stack: Vec<CreationId>,
    pub snapshots: IndexMap<CreationId, Snapshot>,
    /// Heap objects claimed during the current outer call, awaiting finalization.
    pub pending: Vec<ObjId>,
    /// Records this one depends on (read across a still-publishing record).
    pub upstream: Vec<String>,

    pub depth: u32,
    pub autopublish: bool,
    pub replaying: bool,
    /// A protocol error raised inside a recorded call; re-thrown by every trap until the
    /// outermost frame unwinds and rolls back.
    pub error: Option<KernelError>,
}

impl Record {
    pub fn new(id: impl ToString, autopublish: bool, replaying: bool) -> Self {
        Record {
            id: id.to_string(),
            actions: vec![],
            creates: CreationSet::new(),
            reads: CreationSet::new(),
            updates: CreationSet::new(),
            deletes: CreationSet::new(),
            auths: CreationSet::new(),
            unbound: CreationSet::new(),
            inputs: CreationSet::new(),
            outputs: CreationSet::new(),
            refs: CreationSet::new(),
            stack: vec![],
            snapshots: IndexMap::new(),
            pending: vec![],
            upstream: vec![],
            depth: 0,
            autopublish,
            replaying,
            error: None,
        }
    }

    pub fn begin(&mut self) { self.depth += 1; }

    /// Closes a nested scope; returns `true` when the outermost scope ended.
    pub fn end(&mut self) -> bool {
        debug_assert!(self.depth > 0, "unbalanced record scope");
        self.depth = self.depth.saturating_sub(1);
        self.depth == 0
    }

    pub fn push(&mut self, id: CreationId) { self.stack.push(id); }

    pub fn pop(&mut self) -> Option<CreationId> { self.stack.pop() }

    /// The creation directly below the top of the stack: the caller of the current method.
    pub fn caller(&self) -> Option<CreationId> {
        (self.stack.len() >= 2).then(|| self.stack[self.stack.len() - 2])
    }

    /// Stores a protocol error (first one wins) and returns the one to propagate.
    pub fn throw(&mut self, error: KernelError) -> KernelError {
        self.error.get_or_insert(error).clone()
    }

    /// Ensures a pre-image exists; upgrades a bindings-only capture to full when the
    /// creation is about to be mutated (legal only while its properties are still
    /// untouched). The originally-captured bindings are kept: location assignment may
    /// already have moved the live ones into record space.
    pub fn snapshot(&mut self, creations: &Creations, heap: &mut Heap, id: CreationId, full: bool) {
        match self.snapshots.get(&id) {
            Some(snap) if snap.is_full() || !full => {}
            Some(snap) => {
                let bindings = snap.bindings.clone();
                let mut snap = Snapshot::full(creations, heap, id);
                snap.bindings = bindings;
                self.snapshots.insert(id, snap);
            }
            None => {
                let snap = if full {
                    Snapshot::full(creations, heap, id)
                } else {
                    Snapshot::bindings_only(creations, id)
                };
                self.snapshots.insert(id, snap);
            }
        }
    }

    /// Registers a creation being created by this record.
    pub fn create(&mut self, creations: &Creations, heap: &mut Heap, id: CreationId) -> Result<(), KernelError> {
        if creations.get(id).native {
            return Err(KernelError::internal("cannot create a native creation"));
        }
        if self.creates.has(creations, id)? {
            return Ok(());
        }
        self.link(creations, id, false)?;
        self.snapshot(creations, heap, id, true);
        self.creates.add(creations, id)?;
        self.unbound.add(creations, id)?;
        Ok(())
    }

    pub fn read(&mut self, creations: &Creations, id: CreationId) -> Result<(), KernelError> {
        if self.reads.has(creations, id)? {
            return Ok(());
        }
        self.link(creations, id, true)?;
        if !self.snapshots.contains_key(&id) {
            self.snapshots.insert(id, Snapshot::bindings_only(creations, id));
        }
        self.reads.add(creations, id)?;
        Ok(())
    }

    /// Registers a state update. Creations created by this record need no update entry:
    /// they are outputs already.
    pub fn update(&mut self, creations: &Creations, heap: &mut Heap, id: CreationId) -> Result<(), KernelError> {
        if self.creates.has(creations, id)? {
            return Ok(());
        }
        if !creations.get(id).bindings.is_deployed() {
            return Err(KernelError::internal("update of an unbound creation"));
        }
        self.link(creations, id, false)?;
        self.snapshot(creations, heap, id, true);
        self.updates.add(creations, id)?;
        self.auth_callers(creations, id)?;
        Ok(())
    }

    /// Registers a destroy: empties the UTXO bindings; terminal.
    pub fn delete(
        &mut self,
        creations: &mut Creations,
        heap: &mut Heap,
        id: CreationId,
    ) -> Result<(), KernelError> {
        if self.deletes.has(creations, id)? {
            return Ok(());
        }
        if !self.creates.has(creations, id)? && !creations.get(id).bindings.is_deployed() {
            return Err(KernelError::internal("delete of an unbound creation"));
        }
        self.link(creations, id, false)?;
        self.snapshot(creations, heap, id, true);
        let bindings = &mut creations.get_mut(id).bindings;
        bindings.owner = Some(Value::Null);
        bindings.satoshis = Some(0);
        self.deletes.add(creations, id)?;
        self.unbound.add(creations, id)?;
        self.auth_callers(creations, id)?;
        Ok(())
    }

    /// Forces a creation into the inputs without a state change.
    pub fn auth(&mut self, creations: &Creations, heap: &mut Heap, id: CreationId) -> Result<(), KernelError> {
        if self.creates.has(creations, id)? || self.auths.has(creations, id)? {
            return Ok(());
        }
        if creations.get(id).bindings.is_destroyed() {
            return Err(RuleError::Destroyed(creations.name_of(id)).into());
        }
        self.link(creations, id, false)?;
        self.snapshot(creations, heap, id, false);
        self.auths.add(creations, id)?;
        Ok(())
    }

    /// If a method on A changed B, A — as the causer — must be authorized as an input: every
    /// creation on the stack other than the target (and not created here) gets an auth.
    fn auth_callers(&mut self, creations: &Creations, target: CreationId) -> Result<(), KernelError> {
        for caller in self.stack.clone() {
            if caller == target || self.creates.has(creations, caller)? {
                continue;
            }
            if !self.auths.has(creations, caller)? {
                self.snapshots
                    .entry(caller)
                    .or_insert_with(|| Snapshot::bindings_only(creations, caller));
                self.auths.add(creations, caller)?;
            }
        }
        Ok(())
    }

    /// Guards cross-record usage: a creation still held by another, unpublished record may
    /// be read (adding that record to the upstream dependencies) but never written.
    fn link(&mut self, creations: &Creations, id: CreationId, readonly: bool) -> Result<(), KernelError> {
        let Some(location) = creations.location_of(id) else { return Ok(()) };
        let Some(record) = location.record_id() else { return Ok(()) };
        if record == self.id {
            return Ok(());
        }
        if !readonly {
            return Err(RuleError::PendingPublish(creations.name_of(id)).into());
        }
        if !self.upstream.iter().any(|r| r == record) {
            self.upstream.push(record.to_string());
        }
        Ok(())
    }

    /// Appends a top-level action: asserts an empty stack, recomputes the derived sets and
    /// reassigns `record://` locations and nonces.
    pub fn action(&mut self, creations: &mut Creations, action: Action) -> Result<(), KernelError> {
        if !self.stack.is_empty() {
            return Err(KernelError::internal("action with a non-empty call stack"));
        }
        self.actions.push(action);
        self.recompute(creations)?;
        self.assign_locations(creations)
    }

    /// Recomputes inputs/outputs/refs from the base sets, in their stable order.
    ///
    /// Subtraction is by identity: the base sets already enforced the worldview law within
    /// themselves, and a stale reference sharing an origin with an input must survive into
    /// the refs so that the commit-time refmap can reject it as time travel.
    pub fn recompute(&mut self, creations: &Creations) -> Result<(), KernelError> {
        let mut inputs = CreationSet::new();
        for id in self.updates.iter().chain(self.auths.iter()).chain(self.deletes.iter()) {
            if !self.creates.contains_identity(id) {
                inputs.add(creations, id)?;
            }
        }
        let mut outputs = CreationSet::new();
        for id in inputs.iter().chain(self.creates.iter()) {
            if !self.deletes.contains_identity(id) {
                outputs.add(creations, id)?;
            }
        }
        let mut refs = CreationSet::new();
        for id in self.reads.iter() {
            if !inputs.contains_identity(id)
                && !outputs.contains_identity(id)
                && !self.deletes.contains_identity(id)
            {
                refs.add(creations, id)?;
            }
        }
        self.inputs = inputs;
        self.outputs = outputs;
        self.refs = refs;
        Ok(())
    }

    fn assign_slot(&self, creations: &mut Creations, id: CreationId, slot: Slot, index: u32) {
        let pre_nonce = self
            .snapshots
            .get(&id)
            .map(|snap| snap.bindings.nonce)
            .unwrap_or(creations.get(id).bindings.nonce);
        let location = Location::record(&self.id, slot, index);
        let bindings = &mut creations.get_mut(id).bindings;
        bindings.nonce = pre_nonce + 1;
        let fresh = match &bindings.origin {
            None => true,
            Some(origin) => origin.is_record(),
        };
        if fresh {
            bindings.origin = Some(location.clone());
        }
        bindings.location = Some(location);
    }

    /// Assigns `record://<id>_o<n>` / `_d<n>` locations and bumps nonces, idempotently
    /// (nonce is always pre-state + 1, recomputed from the snapshot).
    pub fn assign_locations(&mut self, creations: &mut Creations) -> Result<(), KernelError> {
        for (n, id) in self.outputs.iter().collect::<Vec<_>>().into_iter().enumerate() {
            self.assign_slot(creations, id, Slot::Output, n as u32);
        }
        for (n, id) in self.deletes.iter().collect::<Vec<_>>().into_iter().enumerate() {
            self.assign_slot(creations, id, Slot::Deleted, n as u32);
        }
        Ok(())
    }

    /// Every creation this record knows about, in set order (creates, reads, updates,
    /// deletes, auths), deduplicated by identity.
    pub fn known(&self) -> Vec<CreationId> {
        let mut seen = std::collections::HashSet::new();
        self.creates
            .iter()
            .chain(self.reads.iter())
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
            .chain(self.auths.iter())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Rolls back every snapshotted creation; `poison` carries the publish-failure reason
    /// that turns first-deploy bindings into `error://`.
    pub fn rollback(&mut self, creations: &mut Creations, heap: &mut Heap, poison: Option<&str>) {
        for (id, snap) in self.snapshots.clone().iter().rev() {
            snap.restore(creations, heap, *id, poison);
        }
        self.pending.clear();
    }
}
