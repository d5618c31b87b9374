//! The [`SnapSet`] and other related structures.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;

use crate::raw::config::Trivial as TrivialConfig;
use crate::raw::{self, Raw};

/// A concurrent lock-free set with constant-time snapshots.
///
/// Note that values returned by looking up (or inserting or removing) are always copied using
/// the `Clone` trait. Therefore, the set is best suited for types that are cheap to copy (eg.
/// `u64` or `IpAddr`). Types that are expensive to clone or not `Clone` at all can be wrapped
/// in an `Arc` (eg. `Arc<str>`).
///
/// ```rust
/// use snaptrie::SnapSet;
/// use crossbeam_utils::thread;
///
/// let set = SnapSet::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         set.insert("hello");
///     });
///     s.spawn(|_| {
///         set.insert("world");
///     });
/// }).unwrap();
///
/// assert_eq!(Some("hello"), set.get("hello"));
/// assert_eq!(Some("world"), set.get("world"));
/// assert_eq!(None, set.get("universe"));
/// set.remove("world");
/// assert_eq!(None, set.get("world"));
/// ```
///
/// ```rust
/// use snaptrie::SnapSet;
///
/// let set: SnapSet<usize> = SnapSet::new();
///
/// set.insert(0);
/// let frozen = set.snapshot();
/// set.insert(1);
///
/// assert!(set.contains(&1));
/// assert!(!frozen.contains(&1));
/// assert_eq!(1, frozen.len());
/// ```
pub struct SnapSet<T, S = RandomState>
where
    T: Clone + Hash + Eq + 'static,
{
    raw: Raw<TrivialConfig<T>, S>,
}

impl<T> SnapSet<T, RandomState>
where
    T: Clone + Hash + Eq + 'static,
{
    /// Creates a new empty set.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<T, S> SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
    S: BuildHasher,
{
    /// Creates a new empty set with the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    /// Inserts a new value into the set.
    ///
    /// It returns the previous value, if any was present.
    pub fn insert(&self, value: T) -> Option<T> {
        let pin = crossbeam_epoch::pin();
        self.raw
            .update(&value, |_| Some(value.clone()), &pin)
            .cloned()
    }

    /// Looks up a value in the set.
    ///
    /// This creates a copy of the original value.
    pub fn get<Q>(&self, key: &Q) -> Option<T>
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).cloned()
    }

    /// Checks if a value identified by the given key is present in the set.
    ///
    /// Note that by the time you can act on it, the presence of the value can change (eg.
    /// other thread can add or remove it in the meantime).
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).is_some()
    }

    /// Removes a value identified by the given key from the set, returning it if it was
    /// present.
    pub fn remove<Q>(&self, key: &Q) -> Option<T>
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.update(key, |_| None, &pin).cloned()
    }

    /// Removes all values in one atomic step.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.raw.clear(&pin);
    }
}

impl<T, S> SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
    S: Clone,
{
    /// Forks off an independent copy of the set in constant time.
    ///
    /// The copy and the original share structure behind the scenes, but neither observes the
    /// other's subsequent changes.
    pub fn snapshot(&self) -> Self {
        Self {
            raw: self.raw.snapshot(),
        }
    }

    /// Counts the values, as of one consistent moment of the set.
    pub fn len(&self) -> usize {
        let snap = self.raw.snapshot();
        let pin = crossbeam_epoch::pin();
        snap.reduce(0, |_, count| count + 1, |_| false, &pin)
    }
}

impl<T, S> SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
{
    /// Checks if the set is currently empty.
    ///
    /// Inherently racy when other threads write ‒ the answer may be stale before it can be
    /// used.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns an iterator over copies of the values.
    ///
    /// The iterator observes the live set, so values added or removed while it runs may or may
    /// not show up. Iterate a [`snapshot`][SnapSet::snapshot] for an exact point-in-time view.
    pub fn iter(&self) -> Iter<T, S> {
        Iter {
            inner: raw::iterator::Iter::new(&self.raw),
        }
    }
}

/// The iterator of the [`SnapSet`].
///
/// See the [`iter`][SnapSet::iter] method for details.
pub struct Iter<'a, T, S>
where
    T: Clone + Hash + Eq + 'static,
{
    inner: raw::iterator::Iter<'a, TrivialConfig<T>, S>,
}

impl<'a, T, S> Iterator for Iter<'a, T, S>
where
    T: Clone + Hash + Eq + 'static,
{
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.inner.next().cloned()
    }
}

impl<T> Default for SnapSet<T, RandomState>
where
    T: Clone + Hash + Eq + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> Debug for SnapSet<T, S>
where
    T: Debug + Clone + Hash + Eq + 'static,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_set().entries(self.iter()).finish()
    }
}

/// Cloning *is* the snapshot ‒ constant time no matter the size.
impl<T, S> Clone for SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
    S: Clone,
{
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

impl<'a, T, S> IntoIterator for &'a SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
{
    type Item = T;
    type IntoIter = Iter<'a, T, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, S> Extend<T> for &'a SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
    S: BuildHasher,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        for value in iter {
            self.insert(value);
        }
    }
}

impl<T, S> Extend<T> for SnapSet<T, S>
where
    T: Clone + Hash + Eq + 'static,
    S: BuildHasher,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut me: &SnapSet<_, _> = self;
        me.extend(iter);
    }
}

impl<T> FromIterator<T> for SnapSet<T>
where
    T: Clone + Hash + Eq + 'static,
{
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut me = SnapSet::new();
        me.extend(iter);
        me
    }
}
