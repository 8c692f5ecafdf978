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

mod common;

use common::*;
use runic::{
    deep_equal, ArgumentError, DeploySpec, ExecutionError, KernelError, Location, RuleError, Value,
};

#[test]
fn deploy_call_destroy() {
    let chain = SharedChain::default();
    let mut kernel = kernel_on(chain.clone(), SharedCache::default());

    let ids = kernel.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap();
    let counter = ids[0];
    assert_eq!(kernel.nonce_of(counter), 1);
    let genesis = kernel.location_of(counter).unwrap();
    assert!(genesis.ends_with("_o0"), "{genesis}");
    assert_eq!(genesis, kernel.origin_of(counter).unwrap());
    genesis.parse::<Location>().unwrap();

    kernel.call(counter, "set", vec![Value::Number(7.0)]).unwrap();
    assert_eq!(kernel.nonce_of(counter), 2);
    assert!(kernel.get(counter, "n").unwrap().strict_eq(&Value::Number(7.0)));
    // origin never moves
    assert_eq!(genesis, kernel.origin_of(counter).unwrap());

    kernel.destroy(counter).unwrap();
    assert_eq!(kernel.nonce_of(counter), 3);
    let last = kernel.location_of(counter).unwrap();
    assert!(last.ends_with("_d0"), "{last}");
    assert!(kernel.owner_of(counter).unwrap().strict_eq(&Value::Null));
    assert_eq!(kernel.satoshis_of(counter).unwrap(), 0);
    assert_eq!(chain.tx_count(), 3);

    // terminal: destroying again is a no-op, mutating is not
    kernel.destroy(counter).unwrap();
    assert_eq!(kernel.nonce_of(counter), 3);
    let err = kernel.call(counter, "set", vec![Value::Number(1.0)]).unwrap_err();
    assert!(matches!(err, KernelError::Rule(RuleError::Destroyed(_))), "{err}");
}

#[test]
fn pending_claims_preserve_identity() {
    let mut kernel = kernel();
    let ids = kernel.deploy(vec![DeploySpec::new(KEEPER_SRC)]).unwrap();
    let jig = kernel.new_jig(ids[0], vec![]).unwrap();

    // inside the method, this.o === o
    let same = kernel.call(jig, "keep", vec![]).unwrap();
    assert!(same.strict_eq(&Value::Bool(true)));

    // after the method, the value is owned by the jig and structurally intact
    let o = kernel.get(jig, "o").unwrap();
    let obj = o.as_obj().expect("kept object");
    assert_eq!(kernel.heap().obj(obj).owner, Some(jig));
    assert!(!kernel.heap().obj(obj).pending);
    let expected = kernel.new_object(vec![("k", Value::Number(1.0))]);
    assert!(deep_equal(kernel.heap(), &o, &expected));
}

#[test]
fn private_methods() {
    let mut kernel = kernel();
    let ids = kernel
        .deploy(vec![DeploySpec::new(SECRETIVE_SRC), DeploySpec::new(POKER_SRC)])
        .unwrap();
    let b = kernel.new_jig(ids[0], vec![]).unwrap();
    let a = kernel.new_jig(ids[1], vec![]).unwrap();

    // cross-jig private call rejects
    let err = kernel.call(a, "poke", vec![Value::Creation(b)]).unwrap_err();
    assert_eq!(err.to_string(), "cannot call private method _secret");

    // external private call rejects too
    let err = kernel.call(b, "_secret", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Rule(RuleError::PrivateCall(_))));

    // reading the name as a non-call value is allowed
    assert!(kernel.get(b, "_secret").unwrap().strict_eq(&Value::Undefined));

    // a jig of the same class may call it
    let b2 = kernel.new_jig(ids[0], vec![]).unwrap();
    let _ = b2;
}

#[test]
fn cross_jig_updates_rejected() {
    let mut kernel = kernel();
    let ids = kernel
        .deploy(vec![DeploySpec::new(COUNTER_SRC), DeploySpec::new(POKER_SRC)])
        .unwrap();
    let counter = ids[0];
    let a = kernel.new_jig(ids[1], vec![]).unwrap();

    let err = kernel
        .call(a, "corrupt", vec![Value::Creation(counter)])
        .unwrap_err();
    assert!(matches!(err, KernelError::Rule(RuleError::OutsideMethod(_))), "{err}");

    // sidekick functions may not update state either
    let sidekick = kernel.deploy(vec![DeploySpec::new(CLOBBER_SRC)]).unwrap()[0];
    let err = kernel
        .call(sidekick, "call", vec![Value::Creation(counter)])
        .unwrap_err();
    assert!(matches!(err, KernelError::Rule(RuleError::SidekickUpdate)), "{err}");
}

#[test]
fn ownership_claims_clone_foreign_values() {
    let mut kernel = kernel();
    let ids = kernel
        .deploy(vec![DeploySpec::new(KEEPER_SRC), DeploySpec::new(POKER_SRC)])
        .unwrap();
    let keeper = kernel.new_jig(ids[0], vec![]).unwrap();
    let poker = kernel.new_jig(ids[1], vec![]).unwrap();

    kernel.call(keeper, "keep", vec![]).unwrap();
    kernel.call(poker, "steal", vec![Value::Creation(keeper)]).unwrap();

    let original = kernel.get(keeper, "o").unwrap();
    let loot = kernel.get(poker, "loot").unwrap();
    // ownership never becomes ambiguous: the thief got a membrane-free deep clone
    assert!(!original.strict_eq(&loot));
    assert!(deep_equal(kernel.heap(), &original, &loot));
    assert_eq!(kernel.heap().obj(original.as_obj().unwrap()).owner, Some(keeper));
    assert_eq!(kernel.heap().obj(loot.as_obj().unwrap()).owner, Some(poker));
}

#[test]
fn upgrade_swaps_implementation_in_place() {
    let mut kernel = kernel();
    let counter = kernel.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap()[0];
    kernel.call(counter, "set", vec![Value::Number(5.0)]).unwrap();

    let err = kernel.call(counter, "dec", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Execution(ExecutionError::NotAFunction(_))));

    kernel.upgrade(counter, COUNTER_V2_SRC, vec![]).unwrap();
    // same identity, new methods, state continues from the upgrade's props
    kernel.call(counter, "set", vec![Value::Number(5.0)]).unwrap();
    kernel.call(counter, "dec", vec![]).unwrap();
    assert!(kernel.get(counter, "n").unwrap().strict_eq(&Value::Number(4.0)));

    // classes can only be upgraded to classes
    let err = kernel.upgrade(counter, CLOBBER_SRC, vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Argument(ArgumentError::Invalid(_))));
}

#[test]
fn satoshis_binding() {
    let mut kernel = kernel();
    let token = kernel.deploy(vec![DeploySpec::new(TOKEN_SRC)]).unwrap()[0];
    let jig = kernel.new_jig(token, vec![Value::Number(10.0)]).unwrap();
    assert_eq!(kernel.satoshis_of(jig).unwrap(), 0);

    kernel.call(jig, "fund", vec![]).unwrap();
    assert_eq!(kernel.satoshis_of(jig).unwrap(), 1000);

    let err = kernel.call(jig, "overfund", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Argument(ArgumentError::Invalid(_))), "{err}");
}

#[test]
fn transaction_batches_actions() {
    let chain = SharedChain::default();
    let mut kernel = kernel_on(chain.clone(), SharedCache::default());

    let jig = kernel
        .transaction(|kernel| {
            let token = kernel.deploy(vec![DeploySpec::new(TOKEN_SRC)]).unwrap()[0];
            let jig = kernel.new_jig(token, vec![Value::Number(3.0)])?;
            kernel.call(jig, "topup", vec![Value::Number(4.0)])?;
            // record-spawning operations are blocked while assembling
            let err = kernel.load("native://ScriptLock").unwrap_err();
            assert!(matches!(err, KernelError::Argument(ArgumentError::Invalid(_))));
            Ok(jig)
        })
        .unwrap();

    assert_eq!(chain.tx_count(), 1);
    assert!(kernel.get(jig, "amount").unwrap().strict_eq(&Value::Number(7.0)));
    assert_eq!(kernel.nonce_of(jig), 1);
}

#[test]
fn auth_forces_input_without_state_change() {
    let mut kernel = kernel();
    let counter = kernel.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap()[0];
    kernel.call(counter, "set", vec![Value::Number(1.0)]).unwrap();
    let before = kernel.get(counter, "n").unwrap();

    kernel.auth(counter).unwrap();
    assert_eq!(kernel.nonce_of(counter), 3);
    assert!(kernel.get(counter, "n").unwrap().strict_eq(&before));
}

#[test]
fn berry_pluck_is_read_only() {
    let mut kernel = kernel();
    let fruit = kernel.deploy(vec![DeploySpec::new(FRUIT_SRC)]).unwrap()[0];

    let berry = kernel.pluck(fruit, "crates/alpha").unwrap();
    let location = kernel.location_of(berry).unwrap();
    assert!(location.contains("?berry=crates/alpha&hash="), "{location}");
    assert!(kernel
        .get(berry, "path")
        .unwrap()
        .strict_eq(&Value::string("crates/alpha")));

    // berries are immutable and indestructible after pluck
    let err = kernel.destroy(berry).unwrap_err();
    assert!(matches!(err, KernelError::Rule(RuleError::BerryUpdate)));
}

#[test]
fn failed_first_deploy_poisons_bindings() {
    use runic::{ExternalError, Kernel, KernelOpts, MemoryCache, MockPurse, OwnerWallet, Parent, RawLock};

    #[derive(Debug)]
    struct Keyless;

    impl OwnerWallet for Keyless {
        fn next_owner(&mut self) -> Result<RawLock, ExternalError> {
            Err(ExternalError::Sign("wallet has no keys".into()))
        }

        fn sign(&mut self, _: &str, _: &[Parent], _: &[RawLock]) -> Result<String, ExternalError> {
            Err(ExternalError::Sign("wallet has no keys".into()))
        }
    }

    let mut kernel = Kernel::new(
        Box::new(SharedChain::default()),
        Box::new(Keyless),
        Box::new(MockPurse::default()),
        Box::new(MemoryCache::default()),
        KernelOpts::default(),
    );
    install(kernel.registry_mut());

    let mut deployed = None;
    let err = kernel
        .transaction(|kernel| {
            let counter = kernel.deploy(vec![DeploySpec::new(COUNTER_SRC)])?[0];
            deployed = Some(counter);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, KernelError::External(_)), "{err}");

    // a failed first publish leaves the creation observable but poisoned
    let counter = deployed.unwrap();
    let location = kernel.location_of(counter).unwrap();
    assert!(location.starts_with("error://"), "{location}");
    assert_eq!(location, kernel.origin_of(counter).unwrap());
    let err = kernel.call(counter, "set", vec![Value::Number(1.0)]).unwrap_err();
    assert!(err.to_string().contains("failed to publish"), "{err}");
}
