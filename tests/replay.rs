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
    Blockchain, DeploySpec, ExecutionError, KernelError, Metadata, Tx, Value,
};

fn txid_of(location: &str) -> String { location.split('_').next().unwrap().to_string() }

/// Publishes a Token jig worth 5, then a topup to 9, on a fresh chain. Returns the chain
/// and the jig's locations after each step.
fn published_token() -> (SharedChain, String, String) {
    let chain = SharedChain::default();
    let mut publisher = kernel_on(chain.clone(), SharedCache::default());
    let token = publisher.deploy(vec![DeploySpec::new(TOKEN_SRC)]).unwrap()[0];
    let jig = publisher.new_jig(token, vec![Value::Number(5.0)]).unwrap();
    let first = publisher.location_of(jig).unwrap();
    publisher.call(jig, "topup", vec![Value::Number(4.0)]).unwrap();
    let second = publisher.location_of(jig).unwrap();
    (chain, first, second)
}

#[test]
fn load_reproduces_state() {
    let (chain, first, second) = published_token();

    let mut verifier = kernel_on(chain, SharedCache::default());
    verifier.trust("*");

    let old = verifier.load(&first).unwrap();
    assert!(verifier.get(old, "amount").unwrap().strict_eq(&Value::Number(5.0)));
    assert_eq!(verifier.nonce_of(old), 1);

    let new = verifier.load(&second).unwrap();
    assert!(verifier.get(new, "amount").unwrap().strict_eq(&Value::Number(9.0)));
    assert_eq!(verifier.nonce_of(new), 2);
    // same entity, different states
    assert_eq!(verifier.origin_of(old).unwrap(), verifier.origin_of(new).unwrap());
}

#[test]
fn cached_state_bypasses_trust() {
    let chain = SharedChain::default();
    let cache = SharedCache::default();
    let mut publisher = kernel_on(chain.clone(), cache.clone());
    let counter = publisher.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap()[0];
    publisher.call(counter, "set", vec![Value::Number(3.0)]).unwrap();
    let location = publisher.location_of(counter).unwrap();

    // same cache, no trust list: pre-verified states load without replay
    let mut verifier = kernel_on(chain.clone(), cache);
    let copy = verifier.load(&location).unwrap();
    assert!(verifier.get(copy, "n").unwrap().strict_eq(&Value::Number(3.0)));

    // a fresh cache forces a replay, which demands trust
    let mut untrusting = kernel_on(chain, SharedCache::default());
    let err = untrusting.load(&location).unwrap_err();
    assert!(matches!(err, KernelError::Trust(_)), "{err}");
}

#[test]
fn replay_reproduces_bit_identical_metadata() {
    let (chain, _, second) = published_token();
    let rawtx = chain.0.borrow_mut().fetch(&txid_of(&second)).unwrap();

    let mut verifier = kernel_on(chain, SharedCache::default());
    verifier.trust("*");
    let replayed = verifier.import(&rawtx).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(verifier.location_of(replayed[0]).unwrap(), second);
    assert!(verifier.get(replayed[0], "amount").unwrap().strict_eq(&Value::Number(9.0)));
}

#[test]
fn metadata_divergence_rejects() {
    let (chain, first, _) = published_token();
    let rawtx = chain.0.borrow_mut().fetch(&txid_of(&first)).unwrap();
    let tx = Tx::from_hex(&rawtx).unwrap();

    // flip one nibble of out[0] and rebuild the metadata record
    let mut metadata = Metadata::from_tx(&tx, 0).unwrap();
    let flipped = if metadata.out[0].starts_with('a') { "b" } else { "a" };
    metadata.out[0].replace_range(0..1, flipped);
    let mut tampered = tx.clone();
    tampered.outputs[0].script = metadata.op_return_script();

    let mut verifier = kernel_on(chain, SharedCache::default());
    verifier.trust("*");
    let err = verifier.import(&tampered.to_hex()).unwrap_err();
    let KernelError::Execution(ExecutionError::MetadataMismatch(path)) = err else {
        panic!("expected a metadata mismatch, got {err}");
    };
    assert_eq!(path, "out.0");
}

#[test]
fn untrusted_replay_rejects() {
    let (chain, first, _) = published_token();
    let rawtx = chain.0.borrow_mut().fetch(&txid_of(&first)).unwrap();

    let mut verifier = kernel_on(chain, SharedCache::default());
    let err = verifier.import(&rawtx).unwrap_err();
    assert!(matches!(err, KernelError::Trust(_)), "{err}");
}

#[test]
fn forward_sync_follows_spends() {
    let (chain, first, second) = published_token();

    let mut verifier = kernel_on(chain, SharedCache::default());
    verifier.trust("*");
    let jig = verifier.load(&first).unwrap();
    assert_eq!(verifier.nonce_of(jig), 1);

    verifier.sync(jig, false).unwrap();
    assert_eq!(verifier.location_of(jig).unwrap(), second);
    assert_eq!(verifier.nonce_of(jig), 2);
    assert!(verifier.get(jig, "amount").unwrap().strict_eq(&Value::Number(9.0)));

    // already at the tip: syncing again changes nothing
    verifier.sync(jig, true).unwrap();
    assert_eq!(verifier.location_of(jig).unwrap(), second);
}

#[test]
fn reference_time_travel_rejects() {
    let mut kernel = kernel();
    let counter = kernel.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap()[0];
    let genesis = kernel.location_of(counter).unwrap();
    kernel.call(counter, "set", vec![Value::Number(1.0)]).unwrap();

    // the class at nonce 1, resurrected next to its nonce-2 self
    let old = kernel.load(&genesis).unwrap();
    assert_eq!(kernel.nonce_of(old), 1);
    assert_eq!(kernel.nonce_of(counter), 2);

    let err = kernel
        .transaction(|kernel| {
            kernel.get(counter, "n")?;
            kernel.call(old, "set", vec![Value::Number(5.0)])?;
            Ok(())
        })
        .unwrap_err();
    assert!(
        matches!(err, KernelError::Execution(ExecutionError::TimeTravel(_))),
        "{err}"
    );
}

#[test]
fn destroy_replays() {
    let chain = SharedChain::default();
    let mut publisher = kernel_on(chain.clone(), SharedCache::default());
    let counter = publisher.deploy(vec![DeploySpec::new(COUNTER_SRC)]).unwrap()[0];
    publisher.destroy(counter).unwrap();
    let last = publisher.location_of(counter).unwrap();
    assert!(last.ends_with("_d0"));

    let mut verifier = kernel_on(chain, SharedCache::default());
    verifier.trust("*");
    let copy = verifier.load(&last).unwrap();
    assert!(verifier.owner_of(copy).unwrap().strict_eq(&Value::Null));
    assert_eq!(verifier.satoshis_of(copy).unwrap(), 0);
    assert_eq!(verifier.nonce_of(copy), 2);
}
