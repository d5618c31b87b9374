//! Traversal through the live structure.
//!
//! Both the borrowing [`Iter`] and the internal fold live here. They walk whatever structure
//! they observe ‒ consistency is exactly that of the trie walked. Callers that want a stable
//! view run these over a fresh [`snapshot`][super::Raw::snapshot], which is frozen by
//! construction for whoever holds it privately.

use std::marker::PhantomData;
use std::mem;

use arrayvec::ArrayVec;
use crossbeam_epoch::{Guard, Shared};

use super::config::Config;
use super::{Branch, Main, Raw, State, MAX_LEVELS};

unsafe fn extend_lifetime<'a, 'b, T: 'a + 'b>(s: Shared<'a, T>) -> Shared<'b, T> {
    mem::transmute(s)
}

struct Level<'a, C: Config> {
    state: Shared<'a, State<C>>,
    idx: usize,
}

// Notes about the lifetimes:
// The 'a here is actually a lie. The real requirements are:
// * We must not outlive the trie we walk (dropping it destroys the nodes outright).
// * The stored pointers must not outlive the pin we hold.
// * Moving us (and the pin) around is fine ‒ the pointers don't point into the pin, only its
//   destructor matters.
//
// The constructor ties our lifetime to the trie, and the pin lives inside us, so dropping us in
// any order keeps both requirements. What can't be expressed is "borrowed from a field of
// self", hence the extend_lifetime transmute when storing freshly loaded pointers. We must be
// careful to never hand out a reference with the full 'a lifetime.
pub struct Iter<'a, C, S>
where
    C: Config,
{
    pin: Guard,
    levels: ArrayVec<[Level<'a, C>; MAX_LEVELS + 1]>,
    _map: PhantomData<&'a Raw<C, S>>,
}

impl<'a, C, S> Iter<'a, C, S>
where
    C: Config,
{
    pub fn new<'m: 'a>(map: &'m Raw<C, S>) -> Self {
        let pin = crossbeam_epoch::pin();
        let state = map.root.state(&pin);
        let state = unsafe { extend_lifetime(state) };
        let mut levels = ArrayVec::new();
        levels.push(Level { state, idx: 0 });
        Iter {
            pin,
            levels,
            _map: PhantomData,
        }
    }

    // Not an iterator because this borrows out of the iterator itself (and effectively its
    // pin).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&C::Payload> {
        loop {
            let top = self.levels.last_mut()?;
            let state = top.state;
            let s = unsafe { state.deref() };
            match &s.main {
                Main::Cn(cn) if top.idx < cn.branches.len() => {
                    let idx = top.idx;
                    top.idx += 1;
                    match &cn.branches[idx] {
                        Branch::Leaf(l) => return Some(l),
                        Branch::Node(child) => {
                            let state = child.state(&self.pin);
                            let state = unsafe { extend_lifetime(state) };
                            self.levels.push(Level { state, idx: 0 });
                        }
                    }
                }
                // A tombstone is a slot whose one leaf wasn't absorbed by the parent yet; it
                // still counts as present, so yield it (once).
                Main::Tomb(Some(l)) if top.idx == 0 => {
                    top.idx = 1;
                    return Some(l);
                }
                Main::List(leaves) if top.idx < leaves.len() => {
                    let idx = top.idx;
                    top.idx += 1;
                    return Some(&leaves[idx]);
                }
                // Exhausted this node (or found a dead tombstone).
                _ => {
                    self.levels.pop();
                }
            }
        }
    }
}

impl<C, S> Raw<C, S>
where
    C: Config,
{
    /// Folds every payload into an accumulator, with an optional early exit.
    ///
    /// `halt` is consulted after every application of `f`; once it answers true the current
    /// accumulator is returned right away. Tombstones are read through instead of cleaned, so
    /// the walk works even over frozen (old generation) structure.
    pub fn reduce<A, F, H>(&self, init: A, mut f: F, mut halt: H, pin: &Guard) -> A
    where
        F: FnMut(&C::Payload, A) -> A,
        H: FnMut(&A) -> bool,
    {
        let state = self.root.state(pin);
        reduce_state(state, init, &mut f, &mut halt, pin).0
    }
}

fn reduce_state<'g, C, A, F, H>(
    state: Shared<'g, State<C>>,
    mut acc: A,
    f: &mut F,
    halt: &mut H,
    pin: &'g Guard,
) -> (A, bool)
where
    C: Config,
    F: FnMut(&C::Payload, A) -> A,
    H: FnMut(&A) -> bool,
{
    let s = unsafe { state.deref() };
    match &s.main {
        Main::Cn(cn) => {
            for branch in cn.branches.iter() {
                match branch {
                    Branch::Leaf(l) => {
                        acc = f(l, acc);
                        if halt(&acc) {
                            return (acc, true);
                        }
                    }
                    Branch::Node(child) => {
                        let (below, stop) = reduce_state(child.state(pin), acc, f, halt, pin);
                        acc = below;
                        if stop {
                            return (acc, true);
                        }
                    }
                }
            }
            (acc, false)
        }
        Main::Tomb(Some(l)) => {
            acc = f(l, acc);
            let stop = halt(&acc);
            (acc, stop)
        }
        Main::Tomb(None) => (acc, false),
        Main::List(leaves) => {
            for l in leaves {
                acc = f(l, acc);
                if halt(&acc) {
                    return (acc, true);
                }
            }
            (acc, false)
        }
    }
}
