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

//! Top-level actions.
//!
//! Four opcodes with fixed data shapes; these shapes are the one place where replay must be
//! byte-identical to publication:
//!
//! | Op | Data |
//! |---|---|
//! | `DEPLOY` | `[src₁, props₁, src₂, props₂, …]` |
//! | `UPGRADE` | `[targetRef, src, props]` |
//! | `NEW` | `[classRef, args]` |
//! | `CALL` | `[targetRef, methodName, args]` |
//!
//! `*Ref` values are `$jig`-tagged indices into the commit's master list. Actions are only
//! appended at the top level, with an empty call stack; nested calls never emit actions.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use crate::creation::CreationId;
use crate::error::ArgumentError;
use crate::value::Value;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Op {
    Deploy,
    Upgrade,
    New,
    Call,
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Deploy => "DEPLOY",
            Op::Upgrade => "UPGRADE",
            Op::New => "NEW",
            Op::Call => "CALL",
        })
    }
}

impl FromStr for Op {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPLOY" => Ok(Op::Deploy),
            "UPGRADE" => Ok(Op::Upgrade),
            "NEW" => Ok(Op::New),
            "CALL" => Ok(Op::Call),
            other => Err(ArgumentError::Invalid(format!("unknown opcode {other}"))),
        }
    }
}

/// One deployed code entry of a DEPLOY action.
///
/// `props` is a deep clone of the code's own properties taken at action time (minus
/// bindings, minus presets), so later state changes cannot retroactively alter the action.
#[derive(Clone, Debug)]
pub struct DeployEntry {
    pub code: CreationId,
    pub src: String,
    pub props: Value,
}

/// A recorded top-level action, still referencing live creations; the wire rewrite to
/// master-list indices happens at commit.
#[derive(Clone, Debug)]
pub enum Action {
    Deploy(Vec<DeployEntry>),
    Upgrade {
        target: CreationId,
        src: String,
        props: Value,
    },
    New {
        class: CreationId,
        args: Vec<Value>,
    },
    Call {
        target: CreationId,
        method: String,
        args: Vec<Value>,
    },
}

impl Action {
    pub fn op(&self) -> Op {
        match self {
            Action::Deploy(_) => Op::Deploy,
            Action::Upgrade { .. } => Op::Upgrade,
            Action::New { .. } => Op::New,
            Action::Call { .. } => Op::Call,
        }
    }
}
