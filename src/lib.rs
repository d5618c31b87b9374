#![doc(html_root_url = "https://docs.rs/snaptrie/0.1.0/snaptrie/")]

//! A concurrent lock-free hash trie with constant-time snapshots.
//!
//! # The data structure
//!
//! The crate provides a map (and a set) based on a 32-way hash array mapped trie. Levels of the
//! trie consume 5-bit slices of the key's hash; each occupied level is a bitmap-compressed node
//! holding only the present slots. All operations are lock-free ‒ no reader or writer ever
//! waits for another thread, and every mutation is a single atomic swap of one node deep in the
//! structure.
//!
//! What makes it different from other concurrent maps is [`snapshot`][SnapMap::snapshot]: the
//! whole map can be forked in constant time. The fork and the original keep sharing structure
//! internally, each quietly copying the small part it writes to later, so both can continue to
//! be read *and modified* independently at full speed. Consistent aggregates
//! ([`len`][SnapMap::len], [`fold`][SnapMap::fold], ...) are built on top of that ‒ they
//! snapshot first and then walk a world that can no longer change.
//!
//! This works by tagging every internal indirection node with a generation. A fork refreshes
//! the generations of both handles; a write commits only if the node it targets carries the
//! writer's own generation, and otherwise first re-tags the nodes on its path, which is what
//! un-shares the structure. Nodes of a foreign generation are never written through, which is
//! exactly why a privately held snapshot is immutable.
//!
//! # The flavours
//!
//! * [`SnapMap`] is a map storing [`Arc<Element<K, V>>`][map::Element] handles. Lookups return
//!   cheap handle clones, values may be unsized, and entries can be shared between maps.
//! * [`SnapSet`] keeps plain values and returns copies of them.
//! * [`raw`] contains the underlying engine, exposed for building other wrappers on top.
//!
//! # Example
//!
//! ```rust
//! use snaptrie::SnapMap;
//!
//! let map = SnapMap::new();
//! map.insert("apple", 3);
//! map.insert("pear", 5);
//!
//! // A constant-time fork. From here on, the two are independent.
//! let frozen = map.snapshot();
//! map.insert("plum", 7);
//! map.remove("apple");
//!
//! assert_eq!(2, map.len());
//! assert_eq!(2, frozen.len());
//! assert_eq!(3, *frozen.get("apple").unwrap().value());
//! assert!(frozen.get("plum").is_none());
//! ```
//!
//! # Features
//!
//! * `parallel`: implementations of rayon's `ParallelExtend` and `FromParallelIterator` for
//!   the map.
//!
//! # Limitations
//!
//! * Iteration over a live map is only weakly consistent ‒ entries changed mid-walk may or may
//!   not be observed. Iterate a snapshot when that matters.
//! * Memory of removed entries is reclaimed through [crossbeam's epochs][crossbeam_epoch], so
//!   it is freed a short moment after the removal, not immediately.
//! * The closures passed to [`update`][SnapMap::update] and
//!   [`filter_map`][SnapMap::filter_map] can be re-run when threads contend and therefore must
//!   be pure.

pub mod map;
pub mod raw;
pub mod set;

pub use crate::map::SnapMap;
pub use crate::set::SnapSet;

#[cfg(doctest)]
mod tests;
