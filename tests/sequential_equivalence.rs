// Copyright (c) 2025 Syncset Contributors
//
// Single-threaded round-trip property: under any sequence of insert,
// remove and contains calls from one thread, every variant must behave
// exactly like a sequential sorted map.

use std::collections::BTreeMap;
use syncset::core::{ConcurrentSet, Key, Value};
use syncset::hash::{
    ChainHash, ConcurrentCuckooHash, CuckooHash, OpenAddrHash, RefinableHash, StripedHash,
};
use syncset::list::{CoarseList, FineList, FomitchevList, HarrisList, LazyList};
use syncset::skiplist::{LazySkiplist, LockFreeSkiplist, PlainSkiplist};

const OPS: usize = 4000;
const KEY_SPACE: Key = 128;

fn drive(name: &str, set: &dyn ConcurrentSet, seed: u64) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut oracle: BTreeMap<Key, Value> = BTreeMap::new();

    for step in 0..OPS {
        let key = rng.i64(1..=KEY_SPACE);
        match rng.u8(0..3) {
            0 => {
                let val = rng.i64(..);
                let expected = !oracle.contains_key(&key);
                if expected {
                    oracle.insert(key, val);
                }
                assert_eq!(
                    set.insert(key, val),
                    expected,
                    "{name}: insert({key}) diverged at step {step}"
                );
            }
            1 => {
                assert_eq!(
                    set.remove(key),
                    oracle.remove(&key),
                    "{name}: remove({key}) diverged at step {step}"
                );
            }
            _ => {
                assert_eq!(
                    set.contains(key),
                    oracle.contains_key(&key),
                    "{name}: contains({key}) diverged at step {step}"
                );
            }
        }
        assert_eq!(set.len(), oracle.len(), "{name}: len diverged at step {step}");
    }

    // Drain through the oracle and confirm both end empty
    let keys: Vec<Key> = oracle.keys().copied().collect();
    for key in keys {
        assert_eq!(set.remove(key), oracle.remove(&key), "{name}: drain({key})");
    }
    assert_eq!(set.len(), 0, "{name}: residue after drain");
}

#[test]
fn lists_match_sequential_map() {
    drive("coarse-list", &CoarseList::new(), 0xC0A5);
    drive("fine-list", &FineList::new(), 0xF1FE);
    drive("lazy-list", &LazyList::new(), 0x1A2);
    drive("harris-list", &HarrisList::new(), 0x4A55);
    drive("fomitchev-list", &FomitchevList::new(), 0xF0F1);
}

#[test]
fn skiplists_match_sequential_map() {
    drive(
        "skiplist",
        &PlainSkiplist::new(4, Key::MIN, Key::MAX).unwrap(),
        0x5C1,
    );
    drive(
        "lazy-skiplist",
        &LazySkiplist::new(4, Key::MIN, Key::MAX).unwrap(),
        0x1A25,
    );
    drive(
        "lockfree-skiplist",
        &LockFreeSkiplist::new(4, Key::MIN, Key::MAX).unwrap(),
        0x1F5C,
    );
}

#[test]
fn hashes_match_sequential_map() {
    drive("chain-hash", &ChainHash::new(2).unwrap(), 0xC4A1);
    drive("open-addr-hash", &OpenAddrHash::new(3).unwrap(), 0x0A4);
    drive("striped-hash", &StripedHash::new(2).unwrap(), 0x5741);
    drive("refinable-hash", &RefinableHash::new(2).unwrap(), 0x4EF1);
    drive("cuckoo-hash", &CuckooHash::new(2).unwrap(), 0xC3C0);
    drive(
        "concurrent-cuckoo-hash",
        &ConcurrentCuckooHash::new(2, 4, 2).unwrap(),
        0xCC4A,
    );
}
