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

//! Upgradable type container.
//!
//! A code creation's observable identity (its [`CreationId`](crate::creation::CreationId)
//! and class-of relationships) stays stable while the inner implementation is swapped by an
//! upgrade. Instances store only the id; method dispatch always reads the current inner
//! logic through the creation arena, so instances created before a swap expose the new
//! methods afterwards, and class-of equality holds independently of swaps.

use std::sync::Arc;

use crate::error::{ArgumentError, KernelError};
use crate::logic::{ClassLogic, LogicKind};

/// Container holding the live implementation of a code creation.
#[derive(Clone, Debug)]
pub struct Dynamic {
    inner: Arc<dyn ClassLogic>,
    extensible: bool,
}

impl Dynamic {
    pub fn new(inner: Arc<dyn ClassLogic>) -> Self { Dynamic { inner, extensible: true } }

    #[inline]
    pub fn inner(&self) -> &Arc<dyn ClassLogic> { &self.inner }

    #[inline]
    pub fn kind(&self) -> LogicKind { self.inner.kind() }

    #[inline]
    pub fn is_extensible(&self) -> bool { self.extensible }

    /// Freezes the container: once non-extensible, every future inner is forced
    /// non-extensible too (the swap keeps the flag).
    pub fn prevent_extensions(&mut self) { self.extensible = false; }

    /// Swaps the inner implementation, keeping outer identity stable.
    ///
    /// Classes can only be upgraded to classes and functions to functions.
    pub fn swap(&mut self, inner: Arc<dyn ClassLogic>) -> Result<(), KernelError> {
        if self.inner.kind() != inner.kind() {
            let msg = match self.inner.kind() {
                LogicKind::Class => "classes can only be upgraded to classes",
                LogicKind::Sidekick => "functions can only be upgraded to functions",
            };
            return Err(ArgumentError::Invalid(msg.to_string()).into());
        }
        self.inner = inner;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]
    use super::*;
    use crate::membrane::CallCtx;
    use crate::value::Value;

    #[derive(Debug)]
    struct Logic(&'static str, LogicKind, &'static [&'static str]);

    impl ClassLogic for Logic {
        fn name(&self) -> &str { self.0 }
        fn kind(&self) -> LogicKind { self.1 }
        fn methods(&self) -> &[&'static str] { self.2 }
        fn call(&self, _: &mut CallCtx<'_>, _: &str, _: &[Value]) -> Result<Value, KernelError> {
            Ok(Value::Undefined)
        }
    }

    #[test]
    fn swap_exposes_new_methods() {
        let mut dynamic = Dynamic::new(Arc::new(Logic("A", LogicKind::Class, &["f"])));
        assert_eq!(dynamic.inner().methods(), &["f"]);
        dynamic.swap(Arc::new(Logic("A2", LogicKind::Class, &["f", "g"]))).unwrap();
        assert_eq!(dynamic.inner().methods(), &["f", "g"]);
    }

    #[test]
    fn kind_mismatch_rejects() {
        let mut dynamic = Dynamic::new(Arc::new(Logic("A", LogicKind::Class, &[])));
        assert!(dynamic.swap(Arc::new(Logic("f", LogicKind::Sidekick, &[]))).is_err());
    }

    #[test]
    fn non_extensible_sticks_across_swaps() {
        let mut dynamic = Dynamic::new(Arc::new(Logic("A", LogicKind::Class, &[])));
        dynamic.prevent_extensions();
        dynamic.swap(Arc::new(Logic("A2", LogicKind::Class, &[]))).unwrap();
        assert!(!dynamic.is_extensible());
    }
}
