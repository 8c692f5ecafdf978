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

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use runic::{
    Blockchain, Cache, CallCtx, ClassLogic, ClassRegistry, ExecutionError, ExternalError, Json,
    Kernel, KernelError, KernelOpts, LogicKind, MemoryCache, Mockchain, MockOwner, MockPurse,
    Value,
};

/// A mock chain shareable between a publishing and a verifying kernel.
#[derive(Clone, Debug, Default)]
pub struct SharedChain(pub Rc<RefCell<Mockchain>>);

impl SharedChain {
    pub fn tx_count(&self) -> usize { self.0.borrow().tx_count() }
}

impl Blockchain for SharedChain {
    fn network(&self) -> &str { "mock" }

    fn fetch(&mut self, txid: &str) -> Result<String, ExternalError> {
        self.0.borrow_mut().fetch(txid)
    }

    fn broadcast(&mut self, rawtx: &str) -> Result<String, ExternalError> {
        self.0.borrow_mut().broadcast(rawtx)
    }

    fn spends(&mut self, txid: &str, vout: u32) -> Result<Option<String>, ExternalError> {
        self.0.borrow_mut().spends(txid, vout)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SharedCache(pub Rc<RefCell<MemoryCache>>);

impl Cache for SharedCache {
    fn get(&mut self, key: &str) -> Result<Option<Json>, ExternalError> {
        self.0.borrow_mut().get(key)
    }

    fn set(&mut self, key: &str, value: Json) -> Result<(), ExternalError> {
        self.0.borrow_mut().set(key, value)
    }
}

pub fn kernel_on(chain: SharedChain, cache: SharedCache) -> Kernel {
    let opts = KernelOpts { app: "runic-test".into(), ..Default::default() };
    let mut kernel = Kernel::new(
        Box::new(chain),
        Box::new(MockOwner::default()),
        Box::new(MockPurse::default()),
        Box::new(cache),
        opts,
    );
    install(kernel.registry_mut());
    kernel
}

pub fn kernel() -> Kernel { kernel_on(SharedChain::default(), SharedCache::default()) }

// ---------------------------------------------------------------------------
// Test classes

pub const COUNTER_SRC: &str =
    "class Counter { static set(n) { this.n = n } static inc() { this.n = this.n + 1 } }";
pub const COUNTER_V2_SRC: &str =
    "class Counter { static set(n) { this.n = n } static inc() { this.n = this.n + 1 } static dec() { this.n = this.n - 1 } }";
pub const TOKEN_SRC: &str =
    "class Token extends Jig { init(amount) { this.amount = amount } topup(n) { this.amount = this.amount + n } fund() { this.satoshis = 1000 } overfund() { this.satoshis = 1.5 } }";
pub const KEEPER_SRC: &str =
    "class Keeper extends Jig { keep() { const o = { k: 1 }; this.o = o; return this.o === o } }";
pub const SECRETIVE_SRC: &str = "class Secretive extends Jig { _secret() { return 42 } }";
pub const POKER_SRC: &str =
    "class Poker extends Jig { poke(b) { return b._secret() } corrupt(b) { b.n = 666 } steal(b) { this.loot = b.o } }";

fn not_a_function(class: &str, method: &str) -> KernelError {
    ExecutionError::NotAFunction(format!("{class}.{method}")).into()
}

fn arg(args: &[Value], n: usize) -> Value { args.get(n).cloned().unwrap_or(Value::Undefined) }

#[derive(Debug)]
pub struct CounterLogic {
    pub with_dec: bool,
}

impl ClassLogic for CounterLogic {
    fn name(&self) -> &str { "Counter" }

    fn methods(&self) -> &[&'static str] {
        if self.with_dec {
            &["set", "inc", "dec"]
        } else {
            &["set", "inc"]
        }
    }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "set" => {
                ctx.set_this("n", arg(args, 0))?;
                Ok(Value::Undefined)
            }
            "inc" | "dec" => {
                let n = ctx.get_this("n")?.as_number().unwrap_or(0.0);
                let delta = if method == "inc" { 1.0 } else { -1.0 };
                ctx.set_this("n", Value::Number(n + delta))?;
                Ok(Value::Undefined)
            }
            other => Err(not_a_function("Counter", other)),
        }
    }
}

#[derive(Debug)]
pub struct TokenLogic;

impl ClassLogic for TokenLogic {
    fn name(&self) -> &str { "Token" }

    fn methods(&self) -> &[&'static str] { &["topup", "fund", "overfund"] }

    fn init(&self, ctx: &mut CallCtx<'_>, args: &[Value]) -> Result<(), KernelError> {
        ctx.set_this("amount", arg(args, 0))
    }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "topup" => {
                let amount = ctx.get_this("amount")?.as_number().unwrap_or(0.0);
                let add = arg(args, 0).as_number().unwrap_or(0.0);
                ctx.set_this("amount", Value::Number(amount + add))?;
                Ok(Value::Undefined)
            }
            "fund" => {
                ctx.set_this("satoshis", Value::Number(1000.0))?;
                Ok(Value::Undefined)
            }
            "overfund" => {
                ctx.set_this("satoshis", Value::Number(1.5))?;
                Ok(Value::Undefined)
            }
            other => Err(not_a_function("Token", other)),
        }
    }
}

#[derive(Debug)]
pub struct KeeperLogic;

impl ClassLogic for KeeperLogic {
    fn name(&self) -> &str { "Keeper" }

    fn methods(&self) -> &[&'static str] { &["keep"] }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, _args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "keep" => {
                let o = ctx.object_with(vec![("k", Value::Number(1.0))]);
                ctx.set_this("o", o.clone())?;
                let back = ctx.get_this("o")?;
                Ok(Value::Bool(back.strict_eq(&o)))
            }
            other => Err(not_a_function("Keeper", other)),
        }
    }
}

#[derive(Debug)]
pub struct SecretiveLogic;

impl ClassLogic for SecretiveLogic {
    fn name(&self) -> &str { "Secretive" }

    fn methods(&self) -> &[&'static str] { &["_secret"] }

    fn call(&self, _ctx: &mut CallCtx<'_>, method: &str, _args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "_secret" => Ok(Value::Number(42.0)),
            other => Err(not_a_function("Secretive", other)),
        }
    }
}

#[derive(Debug)]
pub struct PokerLogic;

impl ClassLogic for PokerLogic {
    fn name(&self) -> &str { "Poker" }

    fn methods(&self) -> &[&'static str] { &["poke", "corrupt", "steal"] }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "poke" => {
                let target = args
                    .first()
                    .and_then(Value::as_creation)
                    .ok_or_else(|| KernelError::argument("poke needs a jig"))?;
                ctx.call(target, "_secret", vec![])
            }
            "corrupt" => {
                ctx.set(&arg(args, 0), "n", Value::Number(666.0))?;
                Ok(Value::Undefined)
            }
            "steal" => {
                let o = ctx.get(&arg(args, 0), "o")?;
                ctx.set_this("loot", o)?;
                Ok(Value::Undefined)
            }
            other => Err(not_a_function("Poker", other)),
        }
    }
}

pub const FRUIT_SRC: &str =
    "class Fruit extends Berry { init(path) { this.path = path } }";

/// A berry class: plucks read-only records identified by a path.
#[derive(Debug)]
pub struct FruitLogic;

impl ClassLogic for FruitLogic {
    fn name(&self) -> &str { "Fruit" }

    fn call(&self, _ctx: &mut CallCtx<'_>, method: &str, _args: &[Value]) -> Result<Value, KernelError> {
        Err(not_a_function("Fruit", method))
    }

    fn pluck(&self, ctx: &mut CallCtx<'_>, path: &str) -> Result<(), KernelError> {
        ctx.set_this("path", Value::string(path))
    }
}

/// A deployed sidekick function; attempts to mutate its argument.
#[derive(Debug)]
pub struct ClobberLogic;

pub const CLOBBER_SRC: &str = "function clobber(x) { x.n = 0 }";

impl ClassLogic for ClobberLogic {
    fn name(&self) -> &str { "clobber" }

    fn kind(&self) -> LogicKind { LogicKind::Sidekick }

    fn methods(&self) -> &[&'static str] { &["call"] }

    fn call(&self, ctx: &mut CallCtx<'_>, method: &str, args: &[Value]) -> Result<Value, KernelError> {
        match method {
            "call" => {
                ctx.set(&arg(args, 0), "n", Value::Number(0.0))?;
                Ok(Value::Undefined)
            }
            other => Err(not_a_function("clobber", other)),
        }
    }
}

pub fn install(registry: &mut ClassRegistry) {
    registry.install(COUNTER_SRC, Arc::new(CounterLogic { with_dec: false }));
    registry.install(COUNTER_V2_SRC, Arc::new(CounterLogic { with_dec: true }));
    registry.install(TOKEN_SRC, Arc::new(TokenLogic));
    registry.install(KEEPER_SRC, Arc::new(KeeperLogic));
    registry.install(SECRETIVE_SRC, Arc::new(SecretiveLogic));
    registry.install(POKER_SRC, Arc::new(PokerLogic));
    registry.install(FRUIT_SRC, Arc::new(FruitLogic));
    registry.install(CLOBBER_SRC, Arc::new(ClobberLogic));
}
