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

//! Executable class behavior.
//!
//! Deployed code carries its source text on chain; what the kernel actually runs is a
//! [`ClassLogic`] trait object resolved from that source through the process-level
//! [`ClassRegistry`]. The source text is identity and trust data — two deployments with the
//! same source dispatch to the same logic, which is what makes replay deterministic.
//!
//! Method bodies never touch the heap or the creation arena directly: they receive a
//! [`CallCtx`](crate::membrane::CallCtx) exposing exactly the membrane traps.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{ExecutionError, KernelError};
use crate::membrane::CallCtx;
use crate::value::Value;

/// Discriminates deployable code kinds: stateful classes and stateless sidekick functions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LogicKind {
    Class,
    Sidekick,
}

/// Behavior of a deployed class or function.
///
/// Implementations must be deterministic: same receiver state and arguments, same effects.
/// Anything observable the body does goes through the [`CallCtx`] traps and is therefore
/// recorded and replayed.
pub trait ClassLogic: Debug + Send + Sync {
    /// The class (or function) name as it appears in deploy metadata.
    fn name(&self) -> &str;

    fn kind(&self) -> LogicKind { LogicKind::Class }

    /// Public API surface: method names, including `_`-private ones.
    fn methods(&self) -> &[&'static str] { &[] }

    /// Dispatches a method call.
    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, args: &[Value]) -> Result<Value, KernelError>;

    /// Constructor body, run by NEW with the fresh jig as receiver.
    fn init(&self, ctx: &mut CallCtx<'_>, args: &[Value]) -> Result<(), KernelError> {
        let _ = (ctx, args);
        Ok(())
    }

    /// Berry constructor: builds the berry's properties from a path. Read-only; the membrane
    /// rejects writes to anything but the fresh berry itself.
    fn pluck(&self, ctx: &mut CallCtx<'_>, path: &str) -> Result<(), KernelError> {
        let _ = (ctx, path);
        Err(ExecutionError::NotAFunction(format!("{}.pluck", self.name())).into())
    }
}

/// Maps deployed source text to its executable behavior.
///
/// The registry is the kernel's stand-in for a source compiler: installing a logic under a
/// source string declares "this is what that source does". Replaying a transaction whose
/// source has no installed logic fails, independently of the trust list.
#[derive(Clone, Debug, Default)]
pub struct ClassRegistry {
    by_src: HashMap<String, Arc<dyn ClassLogic>>,
}

impl ClassRegistry {
    pub fn new() -> Self { ClassRegistry::default() }

    pub fn install(&mut self, src: impl ToString, logic: Arc<dyn ClassLogic>) {
        self.by_src.insert(src.to_string(), logic);
    }

    pub fn resolve(&self, src: &str) -> Result<Arc<dyn ClassLogic>, KernelError> {
        self.by_src.get(src).cloned().ok_or_else(|| {
            ExecutionError::Failed(format!("no class logic installed for source `{}`", abbrev(src))).into()
        })
    }

    pub fn contains(&self, src: &str) -> bool { self.by_src.contains_key(src) }
}

fn abbrev(src: &str) -> String {
    const LIMIT: usize = 40;
    if src.len() <= LIMIT {
        return src.to_string();
    }
    let cut = src
        .char_indices()
        .take_while(|(pos, _)| *pos < LIMIT)
        .last()
        .map(|(pos, c)| pos + c.len_utf8())
        .unwrap_or(0);
    format!("{}…", &src[..cut])
}

/// Native raw-script lock: the built-in owner lock shipped by the kernel.
///
/// Owners are arbitrary serializable lock instances; this one holds a locking script as
/// bytes plus the maximal unlocking-script size (`domain`) used for fee estimation.
#[derive(Clone, Debug, Default)]
pub struct ScriptLockLogic;

pub const SCRIPT_LOCK_NAME: &str = "ScriptLock";
pub const SCRIPT_LOCK_SRC: &str = "native class ScriptLock";

impl ClassLogic for ScriptLockLogic {
    fn name(&self) -> &str { SCRIPT_LOCK_NAME }

    fn methods(&self) -> &[&'static str] { &["script", "domain"] }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, _args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "script" => ctx.get_this("script"),
            "domain" => ctx.get_this("domain"),
            other => Err(ExecutionError::NotAFunction(format!("ScriptLock.{other}")).into()),
        }
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;

    #[test]
    fn registry_resolves_by_source() {
        let mut registry = ClassRegistry::new();
        assert!(!registry.contains(SCRIPT_LOCK_SRC));
        registry.install(SCRIPT_LOCK_SRC, Arc::new(ScriptLockLogic));
        assert!(registry.contains(SCRIPT_LOCK_SRC));
        assert_eq!(registry.resolve(SCRIPT_LOCK_SRC).unwrap().name(), "ScriptLock");
        assert!(registry.resolve("class Unknown {}").is_err());
    }

    #[test]
    fn abbreviation_is_char_safe() {
        let long = "é".repeat(60);
        assert!(abbrev(&long).ends_with('…'));
        assert_eq!(abbrev("short"), "short");
    }
}
