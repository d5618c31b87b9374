//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *trie itself*, but the printing part is exposed
//! as potentially useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crossbeam_epoch::{Guard, Shared};

use super::config::Config;
use super::{Branch, Main, Raw, State};
#[cfg(test)]
use super::{HASH_BITS, LEVEL_BITS};

impl<C, S> Raw<C, S>
where
    C: Config,
{
    // Hack: &mut to make sure nobody else is touching the trie right now, which also makes the
    // unprotected guard and relaxed loads legal.
    /// Panics if some structural rule is broken ‒ bitmap out of sync with the array, a
    /// tombstone or a collision list at the root, a collision list above the maximum depth or
    /// with fewer than two entries.
    ///
    /// Leftover tombstones below the root are fine here; the algorithm leaves them around on
    /// purpose and cleans them up lazily.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&mut self) {
        let pin = unsafe { crossbeam_epoch::unprotected() };
        check_state::<C>(self.root.state(pin), 0, true, false);
    }

    /// Like [`assert_invariants`][Raw::assert_invariants], but additionally requires the trie
    /// to be fully compacted ‒ no tombstone anywhere and no level that should have been
    /// contracted away.
    ///
    /// Only use in tests where all the lazy cleanup provably had a chance to happen.
    #[cfg(test)]
    pub(crate) fn assert_compacted(&mut self) {
        let pin = unsafe { crossbeam_epoch::unprotected() };
        check_state::<C>(self.root.state(pin), 0, true, true);
    }

    fn print_state(state: Shared<State<C>>, fmt: &mut Formatter, pin: &Guard) -> FmtResult
    where
        C::Payload: Debug,
    {
        let s = unsafe { state.deref() };
        match &s.main {
            Main::Cn(cn) => {
                write!(fmt, "({:08x}:", cn.bmp)?;
                for branch in cn.branches.iter() {
                    match branch {
                        Branch::Leaf(l) => write!(fmt, " {:?}", l)?,
                        Branch::Node(child) => {
                            write!(fmt, " ")?;
                            Self::print_state(child.state(pin), fmt, pin)?;
                        }
                    }
                }
                write!(fmt, " )")
            }
            Main::Tomb(None) => write!(fmt, "†"),
            Main::Tomb(Some(l)) => write!(fmt, "†{:?}", l),
            Main::List(leaves) => write!(fmt, "{:?}", leaves),
        }
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        C::Payload: Debug,
    {
        let pin = crossbeam_epoch::pin();
        Self::print_state(self.root.state(&pin), fmt, &pin)
    }
}

/// Returns the number of leaves reachable below the state.
#[cfg(test)]
fn check_state<C: Config>(
    state: Shared<State<C>>,
    shift: usize,
    is_root: bool,
    compacted: bool,
) -> usize {
    let pin = unsafe { crossbeam_epoch::unprotected() };
    let s = unsafe { state.deref() };
    match &s.main {
        Main::Cn(cn) => {
            assert!(shift < HASH_BITS, "branching below the hash width");
            assert_eq!(
                cn.bmp.count_ones() as usize,
                cn.branches.len(),
                "bitmap out of sync with the array"
            );
            let mut leaves = 0;
            let mut inner = false;
            for branch in cn.branches.iter() {
                match branch {
                    Branch::Leaf(_) => leaves += 1,
                    Branch::Node(child) => {
                        inner = true;
                        leaves +=
                            check_state::<C>(child.state(pin), shift + LEVEL_BITS, false, compacted);
                    }
                }
            }
            if compacted && !is_root {
                assert!(
                    leaves > 1 || inner,
                    "this level should have been contracted away"
                );
            }
            leaves
        }
        Main::Tomb(leaf) => {
            assert!(!is_root, "tombstone at the root");
            assert!(!compacted, "tombstone left reachable");
            leaf.iter().count()
        }
        Main::List(leaves) => {
            assert!(!is_root, "collision list at the root");
            assert!(shift >= HASH_BITS, "collision list above the maximum depth");
            assert!(leaves.len() >= 2, "collision list with {} entries", leaves.len());
            leaves.len()
        }
    }
}

/// A pretty-printing wrapper around the raw trie.
///
/// Wrapping the raw trie in this prints the whole node structure ‒ bitmaps, tombstones,
/// collision lists and the leaves in them.
pub struct PrintShape<'a, C, S>(pub &'a Raw<C, S>)
where
    C: Config;

impl<C, S> Display for PrintShape<'_, C, S>
where
    C: Config,
    C::Payload: Debug,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}
