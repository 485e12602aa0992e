//! Property tests: determinism under permutation, codec round-trips,
//! idempotence.

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

use plait_core::{ActorId, Backend, Change, Document, ObjId, ScalarValue};

#[derive(Clone, Debug)]
enum Action {
    Set { doc: usize, key: usize, value: i64 },
    Del { doc: usize, key: usize },
    Inc { doc: usize, by: i64 },
    Merge { src: usize, dst: usize },
}

const KEYS: [&str; 4] = ["swallows", "wrens", "robins", "larks"];

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..3usize, 0..KEYS.len(), -100i64..100).prop_map(|(doc, key, value)| Action::Set {
            doc,
            key,
            value
        }),
        (0..3usize, 0..KEYS.len()).prop_map(|(doc, key)| Action::Del { doc, key }),
        (0..3usize, -10i64..10).prop_map(|(doc, by)| Action::Inc { doc, by }),
        (0..3usize, 0..3usize).prop_map(|(src, dst)| Action::Merge { src, dst }),
    ]
}

/// Drive three replicas through a script and return every change created.
fn run_script(script: &[Action]) -> Vec<Change> {
    let mut docs = [
        Document::with_actor(ActorId::from_bytes(vec![1]).unwrap()),
        Document::with_actor(ActorId::from_bytes(vec![2]).unwrap()),
        Document::with_actor(ActorId::from_bytes(vec![3]).unwrap()),
    ];
    // Every replica starts from a common counter so Inc always has a
    // target.
    docs[0]
        .change(None, |tx| {
            tx.set(&ObjId::Root, "clicks", ScalarValue::Counter(0))
        })
        .unwrap();
    let seed = docs[0].clone();
    for doc in docs.iter_mut().skip(1) {
        doc.merge(&seed).unwrap();
    }

    for action in script {
        match action {
            Action::Set { doc, key, value } => {
                let (key, value) = (KEYS[*key], *value);
                docs[*doc]
                    .change(None, |tx| tx.set(&ObjId::Root, key, value))
                    .unwrap();
            }
            Action::Del { doc, key } => {
                let key = KEYS[*key];
                // Deleting an absent key is a frontend error; skip those.
                if docs[*doc].get(&ObjId::Root, key).is_some() {
                    docs[*doc]
                        .change(None, |tx| tx.delete(&ObjId::Root, key))
                        .unwrap();
                }
            }
            Action::Inc { doc, by } => {
                let by = *by;
                docs[*doc]
                    .change(None, |tx| tx.increment(&ObjId::Root, "clicks", by))
                    .unwrap();
            }
            Action::Merge { src, dst } => {
                if src != dst {
                    let snapshot = docs[*src].clone();
                    docs[*dst].merge(&snapshot).unwrap();
                }
            }
        }
    }

    // Gather the complete history by merging everything into replica 0.
    let (head, rest) = docs.split_at_mut(1);
    for doc in rest.iter() {
        head[0].merge(doc).unwrap();
    }
    head[0]
        .backend()
        .get_all_changes()
        .into_iter()
        .map(|stored| stored.change.clone())
        .collect()
}

fn apply_one_by_one(changes: &[Change]) -> Backend {
    let mut backend = Backend::new();
    for change in changes {
        backend.apply_changes(vec![change.clone()]).unwrap();
    }
    backend
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn permuted_application_converges(script in proptest::collection::vec(action(), 1..25)) {
        let changes = run_script(&script);
        let reference = apply_one_by_one(&changes);
        let reference_bytes = reference.save();

        for seed in 0..4u64 {
            let mut shuffled = changes.clone();
            shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
            let backend = apply_one_by_one(&shuffled);
            prop_assert_eq!(backend.get_heads(), reference.get_heads());
            prop_assert_eq!(backend.save(), reference_bytes.clone());
            prop_assert_eq!(backend.pending_changes(), 0);
        }
    }

    #[test]
    fn changes_round_trip_and_hashes_are_stable(script in proptest::collection::vec(action(), 1..15)) {
        for change in run_script(&script) {
            let decoded = Change::decode(&change.encode()).unwrap();
            prop_assert_eq!(&decoded, &change);
            prop_assert_eq!(decoded.hash(), change.hash());
        }
    }

    #[test]
    fn save_load_is_lossless(script in proptest::collection::vec(action(), 1..20)) {
        let changes = run_script(&script);
        let backend = apply_one_by_one(&changes);
        let saved = backend.save();
        let loaded = Backend::load(&saved).unwrap();
        prop_assert_eq!(loaded.get_heads(), backend.get_heads());
        prop_assert_eq!(loaded.save(), saved);
    }

    #[test]
    fn reapplying_changes_is_idempotent(script in proptest::collection::vec(action(), 1..15)) {
        let changes = run_script(&script);
        let mut backend = apply_one_by_one(&changes);
        let saved = backend.save();
        let patch = backend.apply_changes(changes).unwrap();
        prop_assert!(patch.is_empty());
        prop_assert_eq!(backend.save(), saved);
    }
}
