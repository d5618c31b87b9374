#![allow(dead_code)] // Allow the unused structs

//! Compile fail tests
//!
//! Implemented in a minimal way, as doc tests in a hidden module. These all circle around the
//! snapshot machinery: a fork is an independent owned handle, so everything borrowed through it
//! dies with it, no matter how much structure it still shares with the original.

/// A snapshot is a full handle of its own, so it is only as thread-safe as the payloads in it.
///
/// ```compile_fail
/// use std::rc::Rc;
///
/// use snaptrie::SnapMap;
/// use crossbeam_utils::thread;
///
/// let map: SnapMap<usize, Rc<usize>> = SnapMap::new();
/// let snap = map.snapshot();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         drop(snap);
///     });
/// }).unwrap();
/// ```
///
/// With Arc it is fine to ship the fork off to another thread.
///
/// ```
/// use std::sync::Arc;
///
/// use snaptrie::SnapMap;
/// use crossbeam_utils::thread;
///
/// let map: SnapMap<usize, Arc<usize>> = SnapMap::new();
/// let snap = map.snapshot();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         drop(snap);
///     });
/// }).unwrap();
/// assert!(map.is_empty());
/// ```
struct SnapshotNotSendForFree;

/// Borrows handed out by the raw interface are tied to the handle they came from. Dropping a
/// fork invalidates them even though the original still keeps all the shared structure alive.
///
/// ```compile_fail
/// use std::collections::hash_map::RandomState;
///
/// use snaptrie::raw::config::Trivial;
/// use snaptrie::raw::Raw;
///
/// let map: Raw<Trivial<usize>, RandomState> = Raw::with_hasher(RandomState::default());
/// let pin = crossbeam_epoch::pin();
/// let snap = map.snapshot();
/// let element = snap.get(&42, &pin);
/// drop(snap);
/// // Must not outlive the fork it was read from
/// assert!(element.is_none());
/// ```
///
/// Keeping the fork around makes the same thing fine.
///
/// ```
/// use std::collections::hash_map::RandomState;
///
/// use snaptrie::raw::config::Trivial;
/// use snaptrie::raw::Raw;
///
/// let map: Raw<Trivial<usize>, RandomState> = Raw::with_hasher(RandomState::default());
/// let pin = crossbeam_epoch::pin();
/// let snap = map.snapshot();
/// let element = snap.get(&42, &pin);
/// assert!(element.is_none());
/// ```
struct BorrowDiesWithTheFork;

/// The closure given to `update` sees the previous value only for the duration of one call.
/// The reference can go away as soon as the swap commits (or loses), so it must not escape.
///
/// ```compile_fail
/// use std::cell::Cell;
///
/// use snaptrie::SnapMap;
///
/// let map: SnapMap<usize, usize> = SnapMap::new();
/// let smuggled: Cell<Option<&usize>> = Cell::new(None);
/// map.update(42, |prev| {
///     smuggled.set(prev);
///     None
/// });
/// ```
///
/// Copying the value out instead is fine.
///
/// ```
/// use std::cell::Cell;
///
/// use snaptrie::SnapMap;
///
/// let map: SnapMap<usize, usize> = SnapMap::new();
/// let seen: Cell<Option<usize>> = Cell::new(None);
/// map.update(42, |prev| {
///     seen.set(prev.copied());
///     None
/// });
/// assert_eq!(None, seen.get());
/// ```
struct UpdateCantLeakThePreviousValue;

/// An iterator pins the structure it walks, but not the handle ‒ the handle must stay alive,
/// fork or not.
///
/// ```compile_fail
/// use std::collections::hash_map::RandomState;
///
/// use snaptrie::raw::config::Trivial;
/// use snaptrie::raw::iterator::Iter;
/// use snaptrie::raw::Raw;
///
/// let map: Raw<Trivial<usize>, RandomState> = Raw::with_hasher(RandomState::default());
/// let snap = map.snapshot();
/// let mut iter = Iter::new(&snap);
/// let element = iter.next();
/// drop(snap);
/// // Must not outlive the fork being walked
/// assert!(element.is_none());
/// ```
///
/// We are not allowed to drop the iterator either, its pin backs the borrow.
///
/// ```compile_fail
/// use std::collections::hash_map::RandomState;
///
/// use snaptrie::raw::config::Trivial;
/// use snaptrie::raw::iterator::Iter;
/// use snaptrie::raw::Raw;
///
/// let map: Raw<Trivial<usize>, RandomState> = Raw::with_hasher(RandomState::default());
/// let snap = map.snapshot();
/// let mut iter = Iter::new(&snap);
/// let element = iter.next();
/// drop(iter);
/// // Must not outlive the iterator
/// assert!(element.is_none());
/// ```
///
/// With both the fork and the iterator alive, everything is fine.
/// ```
/// use std::collections::hash_map::RandomState;
///
/// use snaptrie::raw::config::Trivial;
/// use snaptrie::raw::iterator::Iter;
/// use snaptrie::raw::Raw;
///
/// let map: Raw<Trivial<usize>, RandomState> = Raw::with_hasher(RandomState::default());
/// let snap = map.snapshot();
/// let mut iter = Iter::new(&snap);
/// let element = iter.next();
/// assert!(element.is_none());
/// ```
struct IterNeedsTheForkAlive;
