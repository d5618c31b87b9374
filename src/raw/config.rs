use std::borrow::Borrow;
use std::hash::Hash;
use std::marker::PhantomData;

/// Describes what the trie stores and how it is keyed.
///
/// The payload is what actually sits in the leaves ‒ a bare value for sets, a key-value handle
/// for maps. The `Clone` bound on it is load-bearing rather than a convenience: besides the
/// retry loops, payloads get duplicated whenever a snapshot forces a path to be re-tagged into
/// a new generation, whenever compaction pulls a lone leaf one level up, and when
/// [`map_payloads`][super::Raw::map_payloads] rebuilds a whole trie. Wrappers keep all of that
/// cheap by storing `Arc` handles as their payloads.
///
/// `Borrow` ties the payload back to the key it is filed under, so lookups can compare without
/// building a payload first.
// TODO: Allow our own hash, returning something else than just u64. Then the level constants
// would move here too.
pub trait Config {
    /// The unit stored in the leaves.
    type Payload: Clone + Borrow<Self::Key>;
    /// What the payload is hashed and compared by.
    type Key: Hash + Eq;
}

/// The configuration for set-like usage ‒ the stored value is its own key.
pub struct Trivial<T>(PhantomData<T>);

impl<T> Config for Trivial<T>
where
    T: Clone + Hash + Eq,
{
    type Payload = T;
    type Key = T;
}
