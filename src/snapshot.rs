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

//! Pre-images and rollback.
//!
//! A snapshot captures either only the five bindings (enough for pure reads) or the full
//! pre-image: deep-cloned owned properties plus, for code, source text and the live
//! implementation container. Rollback restores the capture; a failed first publish poisons
//! the creation's `origin`/`location` to `error://<reason>` — permanently observable but
//! unusable. Native code is never rolled back.

use crate::creation::{Bindings, CreationId, Creations};
use crate::deep::deep_clone;
use crate::dynamic::Dynamic;
use crate::location::Location;
use crate::membrane::own_graph;
use crate::value::{Heap, ObjId, Value};

/// Full-state part of a snapshot.
#[derive(Clone, Debug)]
pub struct FullState {
    /// Deep-cloned root of the owned properties, unowned until restored.
    pub props: ObjId,
    pub src: Option<String>,
    pub dynamic: Option<Dynamic>,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub bindings: Bindings,
    pub full: Option<FullState>,
}

impl Snapshot {
    /// Captures only the bindings; sufficient when the creation will merely be read.
    pub fn bindings_only(creations: &Creations, id: CreationId) -> Self {
        Snapshot { bindings: creations.get(id).bindings.clone(), full: None }
    }

    /// Captures the full pre-image: bindings plus a deep clone of the owned properties, and
    /// for code the source and implementation container.
    pub fn full(creations: &Creations, heap: &mut Heap, id: CreationId) -> Self {
        let creation = creations.get(id);
        let props = deep_clone(heap, &Value::Obj(creation.props))
            .as_obj()
            .expect("clone of an object is an object");
        Snapshot {
            bindings: creation.bindings.clone(),
            full: Some(FullState {
                props,
                src: creation.code.as_ref().map(|code| code.src.clone()),
                dynamic: creation.code.as_ref().map(|code| code.dynamic.clone()),
            }),
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool { self.full.is_some() }

    /// Whether the creation had never been deployed when captured.
    pub fn was_undeployed(&self) -> bool { self.bindings.location.is_none() }

    /// Restores the captured state onto the creation.
    ///
    /// With `poison` set and a first-deploy capture, the bindings become
    /// `error://<reason>` instead of reverting to the undeployed state.
    pub fn restore(&self, creations: &mut Creations, heap: &mut Heap, id: CreationId, poison: Option<&str>) {
        if creations.get(id).native {
            return;
        }
        let mut bindings = self.bindings.clone();
        if let Some(reason) = poison {
            if self.was_undeployed() {
                let error = Location::Error(reason.to_string());
                bindings.origin = Some(error.clone());
                bindings.location = Some(error);
            }
        }
        if let Some(full) = &self.full {
            let props = deep_clone(heap, &Value::Obj(full.props));
            own_graph(heap, &props, id, false);
            let creation = creations.get_mut(id);
            creation.props = props.as_obj().expect("clone of an object is an object");
            if let (Some(code), Some(dynamic)) = (creation.code.as_mut(), &full.dynamic) {
                code.dynamic = dynamic.clone();
                if let Some(src) = &full.src {
                    code.src = src.clone();
                }
            }
        }
        creations.get_mut(id).bindings = bindings;
    }
}
