//! The [`SnapMap`][crate::SnapMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::raw::config::Config;
use crate::raw::{self, Raw};

/// An element stored inside the [`SnapMap`].
///
/// Or, more precisely, the [`Arc`] handles to these are stored in there. The handles are shared
/// freely ‒ between callers and the map, between a map and its snapshots, even between several
/// unrelated maps.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Element<K, V: ?Sized> {
    key: K,
    value: V,
}

impl<K, V> Element<K, V> {
    /// Creates a new element with given key and value.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

impl<K, V: ?Sized> Element<K, V> {
    /// Provides access to the key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Provides access to the value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

struct MapPayload<K, V: ?Sized>(Arc<Element<K, V>>);

impl<K, V: ?Sized> Clone for MapPayload<K, V> {
    fn clone(&self) -> Self {
        MapPayload(Arc::clone(&self.0))
    }
}

impl<K, V: ?Sized> Borrow<K> for MapPayload<K, V> {
    fn borrow(&self) -> &K {
        self.0.key()
    }
}

struct MapConfig<K, V: ?Sized>(PhantomData<(K, V)>);

impl<K, V> Config for MapConfig<K, V>
where
    V: ?Sized + 'static,
    K: Hash + Eq + 'static,
{
    type Payload = MapPayload<K, V>;
    type Key = K;
}

/// The iterator of the [`SnapMap`].
///
/// See the [`iter`][SnapMap::iter] method for details.
pub struct Iter<'a, K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    inner: raw::iterator::Iter<'a, MapConfig<K, V>, S>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    type Item = Arc<Element<K, V>>;
    fn next(&mut self) -> Option<Arc<Element<K, V>>> {
        self.inner.next().map(|p| Arc::clone(&p.0))
    }
}

/// A concurrent lock-free map with constant-time snapshots.
///
/// Multiple threads insert, remove and look things up without ever blocking each other. On top
/// of the usual operations, [`snapshot`][SnapMap::snapshot] forks the whole map in constant
/// time ‒ the fork and the original afterwards live their own lives, sharing (and lazily
/// un-sharing) structure behind the scenes. [`Clone`] does the same thing, so cloning is cheap
/// no matter how big the map is.
///
/// The data is stored as [`Arc<Element<K, V>>`][Element]. This allows returning handles to the
/// held entries cheaply even if the data is large or impossible to clone, which has several
/// consequences:
///
/// * It is sometimes less convenient to use.
/// * It allows the values to be `?Sized` ‒ trait objects or slices can be stored as the values
///   (not the keys).
/// * Entries can be shared between multiple maps and snapshots.
///
/// Iteration returns (cloned) handles to the elements and observes the live map, so entries
/// modified while it runs may or may not be seen. The aggregated reads
/// ([`len`][SnapMap::len], [`fold`][SnapMap::fold], [`for_each`][SnapMap::for_each],
/// [`any`][SnapMap::any], [`all`][SnapMap::all], [`reduce`][SnapMap::reduce]) instead take an
/// internal snapshot first and answer for one single moment of the map's history.
///
/// # Examples
///
/// ```rust
/// use snaptrie::SnapMap;
/// use crossbeam_utils::thread;
///
/// let map = SnapMap::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(1, *map.get("hello").unwrap().value());
/// assert_eq!(2, *map.get("world").unwrap().value());
/// ```
///
/// ```rust
/// use snaptrie::SnapMap;
///
/// let map = SnapMap::new();
/// map.insert("answer", 42);
///
/// let frozen = map.snapshot();
/// map.insert("question", 0);
///
/// assert!(frozen.get("question").is_none());
/// assert_eq!(2, map.len());
/// assert_eq!(1, frozen.len());
/// ```
pub struct SnapMap<K, V, S = RandomState>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    raw: Raw<MapConfig<K, V>, S>,
}

impl<K, V> SnapMap<K, V>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    /// Inserts a new element.
    ///
    /// Any previous element with the same key is replaced and returned.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<Element<K, V>>> {
        self.insert_element(Arc::new(Element::new(key, value)))
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + 'static,
    V: 'static,
    S: BuildHasher,
{
    /// Applies a closure to the value under a key and stores its result there.
    ///
    /// This merges insertion, modification and removal into one atomic step: the closure gets
    /// the current value (`None` when absent) and whatever it returns becomes the new state of
    /// the key (`None` removes). Returns the element previously stored under the key.
    ///
    /// # Quirks
    ///
    /// When several threads race on the same part of the map, the losing update is re-run, so
    /// the closure may be called several times (each time with the then-current value). It
    /// must be pure ‒ observable side effects would be repeated.
    ///
    /// ```rust
    /// use snaptrie::SnapMap;
    ///
    /// let map = SnapMap::new();
    /// map.update("counter", |old| Some(old.copied().unwrap_or(0) + 1));
    /// map.update("counter", |old| Some(old.copied().unwrap_or(0) + 1));
    /// assert_eq!(2, *map.get("counter").unwrap().value());
    /// map.update("counter", |_| None);
    /// assert!(map.get("counter").is_none());
    /// ```
    pub fn update<F>(&self, key: K, f: F) -> Option<Arc<Element<K, V>>>
    where
        F: Fn(Option<&V>) -> Option<V>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .update(
                &key,
                |prev| {
                    f(prev.map(|p| p.0.value()))
                        .map(|value| MapPayload(Arc::new(Element::new(key.clone(), value))))
                },
                &pin,
            )
            .map(|p| Arc::clone(&p.0))
    }

    /// Applies a closure to every entry, removing those it maps to `None`.
    ///
    /// This transforms the map in place. Entries inserted by other threads while the pass runs
    /// may or may not be visited, and as with [`update`][SnapMap::update], contention can make
    /// the closure run more than once over an entry ‒ it must be pure and idempotent.
    pub fn filter_map<F>(&self, f: F)
    where
        F: Fn(&K, &V) -> Option<V>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.filter_map(
            |p| {
                f(p.0.key(), p.0.value())
                    .map(|value| MapPayload(Arc::new(Element::new(p.0.key().clone(), value))))
            },
            &pin,
        );
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + 'static,
    V: ?Sized + 'static,
    S: BuildHasher + Clone,
{
    /// Produces a new map with the same keys and transformed values.
    ///
    /// The result is built from a single consistent moment of this map and is completely
    /// independent of it. The two maps use the same hasher, so the new one has the same shape.
    pub fn map<W, F>(&self, f: F) -> SnapMap<K, W, S>
    where
        W: 'static,
        F: Fn(&K, &V) -> W,
    {
        SnapMap {
            raw: self.raw.map_payloads::<MapConfig<K, W>, _>(|p| {
                MapPayload(Arc::new(Element::new(
                    p.0.key().clone(),
                    f(p.0.key(), p.0.value()),
                )))
            }),
        }
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
    S: BuildHasher,
{
    /// Creates a new empty map, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    /// Inserts a new element.
    ///
    /// This acts the same as [insert][SnapMap::insert], but takes the already created element.
    /// It can be used when:
    ///
    /// * `V: ?Sized`.
    /// * The same element should go into multiple maps.
    pub fn insert_element(&self, element: Arc<Element<K, V>>) -> Option<Arc<Element<K, V>>> {
        let pin = crossbeam_epoch::pin();
        self.raw
            .update(
                element.key(),
                |_| Some(MapPayload(Arc::clone(&element))),
                &pin,
            )
            .map(|p| Arc::clone(&p.0))
    }

    /// Looks up an element.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Element<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).map(|r| Arc::clone(&r.0))
    }

    /// Checks if an element with the given key is present.
    ///
    /// Note that by the time the result can be acted on, another thread may have added or
    /// removed the element.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).is_some()
    }

    /// Removes an element identified by the given key, returning it.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Element<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.update(key, |_| None, &pin).map(|r| Arc::clone(&r.0))
    }

    /// Removes all elements in one atomic step.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.raw.clear(&pin);
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
    S: Clone,
{
    /// Forks off an independent copy of the map in constant time.
    ///
    /// The copy shares structure with the original behind the scenes; either side quietly
    /// un-shares the parts it writes to later. Neither ever observes the other's subsequent
    /// changes.
    pub fn snapshot(&self) -> Self {
        Self {
            raw: self.raw.snapshot(),
        }
    }

    /// Folds all entries into an accumulator, with an early exit.
    ///
    /// `halt` is asked after each step; once it answers true, the current accumulator is
    /// returned right away. The fold runs over an internal snapshot, so it sees one consistent
    /// moment of the map.
    pub fn reduce<A, F, H>(&self, init: A, mut f: F, halt: H) -> A
    where
        F: FnMut(&K, &V, A) -> A,
        H: FnMut(&A) -> bool,
    {
        let snap = self.raw.snapshot();
        let pin = crossbeam_epoch::pin();
        snap.reduce(init, |p, acc| f(p.0.key(), p.0.value(), acc), halt, &pin)
    }

    /// Folds all entries into an accumulator.
    ///
    /// Sees one consistent moment of the map, like [`reduce`][SnapMap::reduce].
    pub fn fold<A, F>(&self, init: A, f: F) -> A
    where
        F: FnMut(&K, &V, A) -> A,
    {
        self.reduce(init, f, |_| false)
    }

    /// Runs a closure over all entries of one consistent moment of the map.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        self.fold((), |k, v, ()| f(k, v))
    }

    /// Counts the elements.
    ///
    /// The count belongs to one consistent moment of the map, though it may be outdated by the
    /// time it can be used.
    pub fn len(&self) -> usize {
        self.fold(0, |_, _, count| count + 1)
    }

    /// Checks if any entry satisfies the predicate. Stops at the first hit.
    pub fn any<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.reduce(false, |k, v, _| pred(k, v), |found| *found)
    }

    /// Checks if all entries satisfy the predicate. Stops at the first miss.
    pub fn all<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.reduce(true, |k, v, _| pred(k, v), |ok| !*ok)
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    /// Checks if the map is currently empty.
    ///
    /// Note that due to the nature of a concurrent map, this is inherently racy ‒ another
    /// thread may add or remove elements between the call and acting on the result.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns an iterator through the elements of the map.
    ///
    /// The iterator walks the live map, so it is only weakly consistent ‒ concurrently
    /// modified entries may or may not be observed. For an exact point-in-time walk, take a
    /// [`snapshot`][SnapMap::snapshot] first and iterate that.
    pub fn iter(&self) -> Iter<K, V, S> {
        Iter {
            inner: raw::iterator::Iter::new(&self.raw),
        }
    }
}

impl<K, V> Default for SnapMap<K, V>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for SnapMap<K, V, S>
where
    K: Debug + Hash + Eq + 'static,
    V: Debug + ?Sized + 'static,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut d = fmt.debug_map();
        for n in self {
            let val: &&V = &n.value();
            d.entry(n.key() as &dyn Debug, val);
        }
        d.finish()
    }
}

/// Cloning *is* the snapshot ‒ constant time, structure shared, both sides independent from
/// then on.
impl<K, V, S> Clone for SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
    S: Clone,
{
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

impl<'a, K, V, S> IntoIterator for &'a SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    type Item = Arc<Element<K, V>>;
    type IntoIter = Iter<'a, K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<Arc<Element<K, V>>> for &'a SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Element<K, V>>>,
    {
        for n in iter {
            self.insert_element(n);
        }
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        self.extend(iter.into_iter().map(|(k, v)| Arc::new(Element::new(k, v))));
    }
}

impl<K, V, S> Extend<Arc<Element<K, V>>> for SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Element<K, V>>>,
    {
        let mut me: &SnapMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for SnapMap<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &SnapMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<Arc<Element<K, V>>> for SnapMap<K, V>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Arc<Element<K, V>>>,
    {
        let mut me = SnapMap::new();
        me.extend(iter);
        me
    }
}

impl<K, V> FromIterator<(K, V)> for SnapMap<K, V>
where
    K: Hash + Eq + 'static,
    V: 'static,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = SnapMap::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "parallel")]
impl<'a, K, V, S> ParallelExtend<Arc<Element<K, V>>> for &'a SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: ?Sized + Send + Sync + 'static,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Element<K, V>>>,
    {
        par_iter.into_par_iter().for_each(|n| {
            self.insert_element(n);
        });
    }
}

#[cfg(feature = "parallel")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    S: BuildHasher + Sync,
    V: Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        self.par_extend(
            par_iter
                .into_par_iter()
                .map(|(k, v)| Arc::new(Element::new(k, v))),
        );
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<Arc<Element<K, V>>> for SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: ?Sized + Send + Sync + 'static,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Element<K, V>>>,
    {
        let mut me: &SnapMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<(K, V)> for SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    S: BuildHasher + Sync,
    V: Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &SnapMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "parallel")]
impl<K, V> FromParallelIterator<Arc<Element<K, V>>> for SnapMap<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: ?Sized + Send + Sync + 'static,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = Arc<Element<K, V>>>,
    {
        let mut me = SnapMap::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(feature = "parallel")]
impl<K, V> FromParallelIterator<(K, V)> for SnapMap<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = SnapMap::new();
        me.par_extend(par_iter);
        me
    }
}
