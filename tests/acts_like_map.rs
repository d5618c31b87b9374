//! In these tests, we make sure the trie works as a HashMap in a single threaded context, and
//! sometimes in multithreaded too.
//!
//! To do that we simply generate a series of inserts, lookups, updates and deletions and try
//! them on both maps. They need to return the same things. The snapshot tests additionally
//! fork the trie (and clone the model map) somewhere in the middle and check that the two
//! sides never contaminate each other.
//!
//! Furthermore, each test is run in several instances, with keys in differently sized
//! universe. The small ones likely generate only short hashes, but are more likely to reuse
//! the same value.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use proptest::collection::vec;
use proptest::prelude::*;
use rayon::prelude::*;
use snaptrie::SnapMap;

#[derive(Debug, Clone)]
enum Instruction<K> {
    Lookup(K),
    Remove(K),
    Insert(K, usize),
    /// Exercises the unified mutator ‒ bumps the value if the key is present.
    Bump(K),
}

impl<K> Instruction<K>
where
    K: Arbitrary + Clone + Debug + Eq + Hash + 'static,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            any::<K>().prop_map(Lookup),
            any::<K>().prop_map(Remove),
            any::<(K, usize)>().prop_map(|(k, v)| Insert(k, v)),
            any::<K>().prop_map(Bump),
        ]
    }

    fn apply(
        self,
        trie: &SnapMap<K, usize>,
        model: &mut HashMap<K, usize>,
    ) -> Result<(), TestCaseError> {
        use Instruction::*;

        match self {
            Lookup(key) => {
                let expected = model.get(&key);
                let found = trie.get(&key);
                prop_assert_eq!(expected, found.as_ref().map(|e| e.value()));
            }
            Remove(key) => {
                let expected = model.remove(&key);
                let found = trie.remove(&key);
                prop_assert_eq!(expected.as_ref(), found.as_ref().map(|e| e.value()));
            }
            Insert(key, value) => {
                let expected = model.insert(key.clone(), value);
                let found = trie.insert(key, value);
                prop_assert_eq!(expected.as_ref(), found.as_ref().map(|e| e.value()));
            }
            Bump(key) => {
                let expected = model.get(&key).copied();
                let found = trie.update(key.clone(), |old| old.map(|v| v.wrapping_add(1)));
                prop_assert_eq!(expected.as_ref(), found.as_ref().map(|e| e.value()));
                if let Some(old) = expected {
                    model.insert(key, old.wrapping_add(1));
                }
            }
        }
        Ok(())
    }

    fn run(instructions: Vec<Self>) -> Result<(), TestCaseError> {
        let trie = SnapMap::new();
        let mut model = HashMap::new();
        for ins in instructions {
            ins.apply(&trie, &mut model)?;
        }
        prop_assert_eq!(model.len(), trie.len());
        Ok(())
    }
}

fn matches_model<K>(
    trie: &SnapMap<K, usize>,
    model: &HashMap<K, usize>,
) -> Result<(), TestCaseError>
where
    K: Clone + Debug + Eq + Hash + 'static,
{
    prop_assert_eq!(model.len(), trie.len());
    for (k, v) in model {
        let entry = trie.get(k);
        prop_assert_eq!(Some(v), entry.as_ref().map(|e| e.value()));
    }
    Ok(())
}

fn insert_parallel_test<T: Clone + Hash + Eq + Send + Sync + 'static>(
    values: Vec<T>,
) -> Result<(), TestCaseError> {
    let set: HashSet<_> = values.iter().cloned().collect();
    let trie = SnapMap::new();
    values.into_par_iter().for_each(|v| {
        trie.insert(v, ());
    });
    for v in set {
        prop_assert!(trie.get(&v).is_some());
    }

    Ok(())
}

proptest! {
    #[test]
    fn small_keys(instructions in vec(Instruction::<u8>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn mid_keys(instructions in vec(Instruction::<u16>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn large_keys(instructions in vec(Instruction::<usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn string_keys(instructions in vec(Instruction::<String>::strategy(), 1..100)) {
        Instruction::run(instructions)?;
    }

    /// Mutating the original must not leak into a snapshot taken before.
    #[test]
    fn snapshot_isolation(
        before in vec(Instruction::<u8>::strategy(), 1..1_000),
        after in vec(Instruction::<u8>::strategy(), 1..1_000),
    ) {
        let trie = SnapMap::new();
        let mut model = HashMap::new();
        for ins in before {
            ins.apply(&trie, &mut model)?;
        }
        let frozen = trie.snapshot();
        let frozen_model = model.clone();
        for ins in after {
            ins.apply(&trie, &mut model)?;
        }
        // The fork still matches the model from the moment it was taken...
        matches_model(&frozen, &frozen_model)?;
        // ...and the source matches the live model.
        matches_model(&trie, &model)?;
    }

    /// And the other way around ‒ mutating the snapshot leaves the source alone.
    #[test]
    fn mutated_snapshot_leaves_source(
        base in vec(Instruction::<u8>::strategy(), 1..1_000),
        on_copy in vec(Instruction::<u8>::strategy(), 1..1_000),
    ) {
        let trie = SnapMap::new();
        let mut model = HashMap::new();
        for ins in base {
            ins.apply(&trie, &mut model)?;
        }
        let copy = trie.snapshot();
        let mut copy_model = model.clone();
        for ins in on_copy {
            ins.apply(&copy, &mut copy_model)?;
        }
        matches_model(&trie, &model)?;
        matches_model(&copy, &copy_model)?;
    }

    #[test]
    fn insert_all_large(values in vec(any::<usize>(), 1..10_000)) {
        // Make them unique
        let set: HashSet<_> = values.iter().cloned().collect();
        let trie = SnapMap::new();
        for v in values {
            trie.insert(v, ());
        }
        for v in set {
            prop_assert!(trie.get(&v).is_some());
        }
    }

    #[test]
    fn insert_all_small_parallel(values in vec(any::<u8>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_mid_parallel(values in vec(any::<u16>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_large_parallel(values in vec(any::<usize>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }
}
