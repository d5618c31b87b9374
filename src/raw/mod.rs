//! The core implementation of the snapshottable concurrent trie.
//!
//! This module contains the [`Raw`][crate::raw::Raw] type, which is the engine of all the data
//! structures in this crate. It is exposed to allow wrapping it into further APIs, but is
//! probably not the best thing for general use.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use smallvec::SmallVec;

pub mod config;
pub mod debug;
pub mod iterator;

use self::config::Config;

// All directly written, some things are not const fn yet :-(. But tested below.
pub(crate) const LEVEL_BITS: usize = 5;
pub(crate) const LEVEL_MASK: u64 = 0b1_1111;
pub(crate) const LEVEL_CELLS: usize = 32;
pub(crate) const HASH_BITS: usize = mem::size_of::<u64>() * 8;
pub(crate) const MAX_LEVELS: usize = (HASH_BITS + LEVEL_BITS - 1) / LEVEL_BITS;

/// A generation token.
///
/// Two tokens are equal exactly when they are the same allocation ‒ the token carries no content
/// at all, the address is the identity. Unlike a numeric counter this can't overflow or run into
/// ABA trouble, because the allocator won't hand the address out again while anything still
/// points at it.
pub(crate) struct Gen(Arc<GenTag>);

struct GenTag;

impl Gen {
    fn new() -> Self {
        Gen(Arc::new(GenTag))
    }
}

impl Clone for Gen {
    fn clone(&self) -> Self {
        Gen(Arc::clone(&self.0))
    }
}

impl PartialEq for Gen {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Gen {}

// The collision list is reached only once the whole hash is used up, so in practice it holds two
// elements, rarely a couple more. SmallVec keeps those inline without a second allocation.
pub(crate) type Leaves<C> = SmallVec<[<C as Config>::Payload; 2]>;

/// One slot of a [`CNode`] ‒ either a leaf payload stored directly, or a pointer one level down.
pub(crate) enum Branch<C: Config> {
    Leaf(C::Payload),
    Node(Arc<INode<C>>),
}

impl<C: Config> Clone for Branch<C> {
    fn clone(&self) -> Self {
        match self {
            Branch::Leaf(l) => Branch::Leaf(l.clone()),
            Branch::Node(n) => Branch::Node(Arc::clone(n)),
        }
    }
}

/// The compressed branching node ‒ a bitmap of occupied slots plus an array of just those slots,
/// packed in bitmap order.
pub(crate) struct CNode<C: Config> {
    pub(crate) bmp: u32,
    pub(crate) branches: Box<[Branch<C>]>,
}

impl<C: Config> CNode<C> {
    fn empty() -> Self {
        CNode {
            bmp: 0,
            branches: Box::new([]),
        }
    }

    /// The packed index of the slot selected by `flag`.
    fn position(&self, flag: u32) -> usize {
        (self.bmp & flag.wrapping_sub(1)).count_ones() as usize
    }

    /// A copy with a new branch spliced in at the given position.
    fn inserted(&self, flag: u32, pos: usize, branch: Branch<C>) -> Self {
        let mut branches = Vec::with_capacity(self.branches.len() + 1);
        branches.extend_from_slice(&self.branches[..pos]);
        branches.push(branch);
        branches.extend_from_slice(&self.branches[pos..]);
        CNode {
            bmp: self.bmp | flag,
            branches: branches.into_boxed_slice(),
        }
    }

    /// A copy with the branch at the given position replaced.
    fn updated(&self, pos: usize, branch: Branch<C>) -> Self {
        let mut branches = self.branches.to_vec();
        branches[pos] = branch;
        CNode {
            bmp: self.bmp,
            branches: branches.into_boxed_slice(),
        }
    }

    /// A copy with the slot removed from both the array and the bitmap.
    fn removed(&self, flag: u32, pos: usize) -> Self {
        let mut branches = Vec::with_capacity(self.branches.len() - 1);
        branches.extend_from_slice(&self.branches[..pos]);
        branches.extend_from_slice(&self.branches[pos + 1..]);
        CNode {
            bmp: self.bmp & !flag,
            branches: branches.into_boxed_slice(),
        }
    }
}

impl<C: Config> Clone for CNode<C> {
    fn clone(&self) -> Self {
        CNode {
            bmp: self.bmp,
            branches: self.branches.clone(),
        }
    }
}

/// The main node held by an I-node.
pub(crate) enum Main<C: Config> {
    /// A branching level.
    Cn(CNode<C>),
    /// A tombstone ‒ this subtree collapsed to at most one leaf and the parent has to absorb it
    /// before anything else proceeds below this point.
    Tomb(Option<C::Payload>),
    /// Leaves whose hashes collide through every level.
    List(Leaves<C>),
}

impl<C: Config> Clone for Main<C> {
    fn clone(&self) -> Self {
        match self {
            Main::Cn(cn) => Main::Cn(cn.clone()),
            Main::Tomb(l) => Main::Tomb(l.clone()),
            Main::List(ls) => Main::List(ls.clone()),
        }
    }
}

/// What the single atomic pointer of an I-node points at.
///
/// The generation rides in the same allocation as the main node and the record is immutable once
/// published. One compare-and-set of the pointer therefore covers both words: a commit succeeds
/// only if neither the content nor the generation moved under us.
pub(crate) struct State<C: Config> {
    pub(crate) gen: Gen,
    pub(crate) main: Main<C>,
}

/// The indirection node ‒ the only mutable cell in the whole structure.
pub(crate) struct INode<C: Config> {
    state: Atomic<State<C>>,
}

impl<C: Config> INode<C> {
    fn new(main: Main<C>, gen: Gen) -> Self {
        INode {
            state: Atomic::new(State { gen, main }),
        }
    }

    fn state<'g>(&self, pin: &'g Guard) -> Shared<'g, State<C>> {
        self.state.load(Ordering::Acquire, pin)
    }
}

impl<C: Config> Drop for INode<C> {
    fn drop(&mut self) {
        // We have unique access here and the pointer is neither null nor shared with another
        // I-node, so the state can go right away instead of through an epoch. Child I-nodes are
        // reference counted and take care of themselves.
        let state = mem::replace(&mut self.state, Atomic::null());
        drop(unsafe { state.into_owned() });
    }
}

/// The bitmap bit selecting the slot for `hash` at the level starting at bit `shift`.
fn flag(hash: u64, shift: usize) -> u32 {
    debug_assert!(shift < HASH_BITS);
    1 << ((hash >> shift) & LEVEL_MASK)
}

/// The generational double compare-single-swap.
///
/// Commits `main` into `inode` if and only if the node still holds exactly `old` and `old`'s
/// generation is `gen`. Both conditions collapse into the single pointer swap ‒ a state record
/// never changes once published, so observing the old pointer means observing its generation
/// too. The generation condition aborts mutations that raced with a snapshot and would
/// otherwise write into structure the snapshot now shares.
fn gen_dcss<'g, C: Config>(
    inode: &INode<C>,
    old: Shared<'g, State<C>>,
    main: Main<C>,
    gen: &Gen,
    pin: &'g Guard,
) -> bool {
    if unsafe { old.deref() }.gen != *gen {
        return false;
    }
    let new = Owned::new(State {
        gen: gen.clone(),
        main,
    });
    // Orderings: the new state needs publishing. On failure there's nothing to acquire, we
    // already know everything about the old value.
    let result = inode
        .state
        .compare_and_set(old, new, (Ordering::Release, Ordering::Relaxed), pin);
    match result {
        Ok(_) => {
            // Unlinked now; destroy once concurrent readers let go of their pins.
            unsafe { pin.defer_destroy(old) };
            true
        }
        // The Err case carries our new state back and drops it, nothing leaks.
        Err(_) => false,
    }
}

/// Turns a collapsed child back into a plain branch ‒ a tombed or lone leaf gets pulled up, a
/// dead subtree is dropped, anything still alive stays as it is.
fn resurrect<C: Config>(branch: &Branch<C>, pin: &Guard) -> Option<Branch<C>> {
    match branch {
        Branch::Node(child) => match &unsafe { child.state(pin).deref() }.main {
            Main::Tomb(Some(l)) => Some(Branch::Leaf(l.clone())),
            Main::Tomb(None) => None,
            Main::List(ls) if ls.len() == 1 => Some(Branch::Leaf(ls[0].clone())),
            Main::List(ls) if ls.is_empty() => None,
            _ => Some(branch.clone()),
        },
        Branch::Leaf(_) => Some(branch.clone()),
    }
}

/// Rebuilds a C-node without its dead children and contracts the result.
fn compress<C: Config>(cn: &CNode<C>, shift: usize, pin: &Guard) -> Main<C> {
    let mut bmp = 0;
    let mut branches = Vec::with_capacity(cn.branches.len());
    // Walk the set bits LSB first; `pos` is the matching packed index.
    let mut left = cn.bmp;
    let mut pos = 0;
    while left != 0 {
        let slot = left & left.wrapping_neg();
        left &= left - 1;
        if let Some(branch) = resurrect(&cn.branches[pos], pin) {
            bmp |= slot;
            branches.push(branch);
        }
        pos += 1;
    }
    contract(
        CNode {
            bmp,
            branches: branches.into_boxed_slice(),
        },
        shift,
    )
}

/// The vertical contraction rule: below the root, a level left with nothing or with a single
/// leaf becomes a tombstone for the parent to absorb. The root level never contracts.
fn contract<C: Config>(cn: CNode<C>, shift: usize) -> Main<C> {
    if shift == 0 || cn.branches.len() > 1 {
        return Main::Cn(cn);
    }
    let CNode { bmp, branches } = cn;
    match branches.into_vec().pop() {
        None => Main::Tomb(None),
        Some(Branch::Leaf(l)) => Main::Tomb(Some(l)),
        // An inner node can't be pulled a level up ‒ that would shift its hash prefix.
        Some(node) => Main::Cn(CNode {
            bmp,
            branches: Box::new([node]),
        }),
    }
}

/// Builds the branch holding two leaves whose hashes agree on everything below `shift`, nesting
/// further levels (or ending in a collision list) as needed. Every I-node minted on the way is
/// tagged with the generation of the operation asking for it.
fn pair_branch<C: Config>(
    a: C::Payload,
    ahash: u64,
    b: C::Payload,
    bhash: u64,
    shift: usize,
    gen: &Gen,
) -> Branch<C> {
    let main = pair_main::<C>(a, ahash, b, bhash, shift, gen);
    Branch::Node(Arc::new(INode::new(main, gen.clone())))
}

fn pair_main<C: Config>(
    a: C::Payload,
    ahash: u64,
    b: C::Payload,
    bhash: u64,
    shift: usize,
    gen: &Gen,
) -> Main<C> {
    if shift >= HASH_BITS {
        // Ran out of hash bits ‒ a genuine collision.
        let mut leaves = Leaves::<C>::new();
        leaves.push(a);
        leaves.push(b);
        return Main::List(leaves);
    }
    let aflag = flag(ahash, shift);
    let bflag = flag(bhash, shift);
    if aflag == bflag {
        let below = pair_branch::<C>(a, ahash, b, bhash, shift + LEVEL_BITS, gen);
        Main::Cn(CNode {
            bmp: aflag,
            branches: Box::new([below]),
        })
    } else {
        let (first, second) = if aflag < bflag { (a, b) } else { (b, a) };
        Main::Cn(CNode {
            bmp: aflag | bflag,
            branches: Box::new([Branch::Leaf(first), Branch::Leaf(second)]),
        })
    }
}

enum Lookup<'g, P> {
    Found(&'g P),
    Nothing,
    /// The structure moved under the operation; redo it from the root.
    Restart,
}

enum Updated<'g, P> {
    /// Committed (or proved to be a no-op). Holds the payload previously stored under the key.
    Done(Option<&'g P>),
    Restart,
}

/// The raw snapshottable hash trie.
///
/// This is the low level data structure providing the lock-free operations over some payload
/// values, but no convenient interface. It exists to keep the single implementation of the core
/// algorithm in one place and let thin wrappers turn it into different user-facing flavours.
///
/// The types stored inside and the keying of them are described by the [`Config`] type
/// parameter.
///
/// As a general rule, methods here take a [`crossbeam_epoch`] [`Guard`] and hand out borrowed
/// payloads valid for as long as the guard is held. This includes methods that remove things ‒
/// another thread might still be looking at a removed value, so it is destroyed only after all
/// current pins are gone and until then borrows of it stay valid.
///
/// The one capability setting this apart from an ordinary concurrent map is
/// [`snapshot`][Raw::snapshot], a constant-time fork. Every indirection node carries a
/// generation token besides its content; a fork gives both handles fresh generations and every
/// write afterwards copies the indirection nodes on its path out of the shared generation
/// before it may commit, so neither side can perturb the other.
///
/// For details of the internal implementation and correctness arguments, see the comments in
/// the source code (they probably don't belong into API documentation).
pub struct Raw<C: Config, S> {
    hash_builder: S,
    root: INode<C>,
}

impl<C, S> Raw<C, S>
where
    C: Config,
    S: BuildHasher,
{
    /// Constructs an empty instance from the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        // Internal sanity check; if this ever fires, the constants above drifted apart.
        assert_eq!(
            LEVEL_CELLS,
            1 << LEVEL_BITS,
            "BUG: level constants out of sync"
        );
        Self {
            hash_builder,
            // The root always holds a C-node, possibly an empty one. It never gets tombed and
            // never contracts away.
            root: INode::new(Main::Cn(CNode::empty()), Gen::new()),
        }
    }

    /// Access to the hasher instance.
    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    /// Computes a hash (using the stored hasher) of a key.
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// The generation the next operation should run under.
    fn root_gen(&self, pin: &Guard) -> Gen {
        unsafe { self.root.state(pin).deref() }.gen.clone()
    }

    /// Looks up a value.
    pub fn get<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
    {
        let hash = self.hash(key);
        loop {
            let gen = self.root_gen(pin);
            match self.lookup(&self.root, None, key, hash, 0, &gen, pin) {
                Lookup::Found(payload) => return Some(payload),
                Lookup::Nothing => return None,
                Lookup::Restart => (),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lookup<'g, Q>(
        &self,
        i: &INode<C>,
        parent: Option<&INode<C>>,
        key: &Q,
        hash: u64,
        shift: usize,
        gen: &Gen,
        pin: &'g Guard,
    ) -> Lookup<'g, C::Payload>
    where
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        C: 'g,
    {
        loop {
            let state = i.state(pin);
            let s = unsafe { state.deref() };
            if s.gen != *gen {
                // A snapshot moved the root on while we were underway.
                return Lookup::Restart;
            }
            match &s.main {
                Main::Cn(cn) => {
                    let flag = flag(hash, shift);
                    if cn.bmp & flag == 0 {
                        return Lookup::Nothing;
                    }
                    let pos = cn.position(flag);
                    match &cn.branches[pos] {
                        Branch::Leaf(l) => {
                            return if (*l).borrow().borrow() == key {
                                Lookup::Found(l)
                            } else {
                                Lookup::Nothing
                            };
                        }
                        Branch::Node(child) => {
                            if unsafe { child.state(pin).deref() }.gen == *gen {
                                return self.lookup(
                                    child,
                                    Some(i),
                                    key,
                                    hash,
                                    shift + LEVEL_BITS,
                                    gen,
                                    pin,
                                );
                            }
                            // The child still belongs to an older generation. Pull it into
                            // ours, then look at this level again.
                            if !self.regenerate(i, state, cn, pos, child, gen, pin) {
                                return Lookup::Restart;
                            }
                        }
                    }
                }
                Main::Tomb(_) => {
                    // A half-removed subtree in the way down. Compact it into the parent and
                    // redo the descent; the retry won't meet it again.
                    let parent = parent.expect("BUG: tombstone at the root");
                    self.clean(parent, shift - LEVEL_BITS, gen, pin);
                    return Lookup::Restart;
                }
                Main::List(leaves) => {
                    return match leaves.iter().find(|l| (*l).borrow().borrow() == key) {
                        Some(l) => Lookup::Found(l),
                        None => Lookup::Nothing,
                    };
                }
            }
        }
    }

    /// Replaces the child at `pos` with a copy tagged by `gen`.
    ///
    /// This is the copy-on-write half of the snapshot protocol. The child keeps its whole
    /// content, only the generation moves. The swap is guarded by the parent's state, so it
    /// can't bring back a slot some other thread changed in the meantime.
    #[allow(clippy::too_many_arguments)]
    fn regenerate<'g>(
        &self,
        i: &INode<C>,
        state: Shared<'g, State<C>>,
        cn: &CNode<C>,
        pos: usize,
        child: &INode<C>,
        gen: &Gen,
        pin: &'g Guard,
    ) -> bool {
        let main = unsafe { child.state(pin).deref() }.main.clone();
        let renewed = Branch::Node(Arc::new(INode::new(main, gen.clone())));
        gen_dcss(i, state, Main::Cn(cn.updated(pos, renewed)), gen, pin)
    }

    /// Compresses the C-node under `i`, absorbing tombstones and contracting sparse levels.
    ///
    /// The result of the swap is ignored. If it is lost, some other thread changed the node
    /// under our hands and whatever it produced is the state retries will see.
    fn clean(&self, i: &INode<C>, shift: usize, gen: &Gen, pin: &Guard) {
        let state = i.state(pin);
        if let Main::Cn(cn) = &unsafe { state.deref() }.main {
            let _ = gen_dcss(i, state, compress(cn, shift, pin), gen, pin);
        }
    }

    /// Absorbs the tombstone a just-finished dive left in `child`.
    ///
    /// Keeps trying while the parent still points at the tombed child. The propagation
    /// deliberately stops one level up ‒ if absorbing the child tombs the parent in turn, that
    /// tombstone is left for whatever operation walks through next.
    fn clean_parent(
        &self,
        parent: &INode<C>,
        child: &INode<C>,
        hash: u64,
        shift: usize,
        gen: &Gen,
        pin: &Guard,
    ) {
        loop {
            let pstate = parent.state(pin);
            let ps = unsafe { pstate.deref() };
            if ps.gen != *gen {
                return;
            }
            let cn = match &ps.main {
                Main::Cn(cn) => cn,
                _ => return,
            };
            let flag = flag(hash, shift);
            if cn.bmp & flag == 0 {
                return;
            }
            match &cn.branches[cn.position(flag)] {
                Branch::Node(cur) if ptr::eq(&**cur, child) => (),
                _ => return,
            }
            let tombed = matches!(&unsafe { child.state(pin).deref() }.main, Main::Tomb(_));
            if !tombed || gen_dcss(parent, pstate, compress(cn, shift, pin), gen, pin) {
                return;
            }
        }
    }

    /// Applies `f` to whatever the trie holds under `key` and stores the result.
    ///
    /// This is the single mutating primitive everything else builds on. `f` maps the previous
    /// value (`None` when the key is absent) to the new one (`None` removes). Returns the
    /// payload that was stored under the key before, if any.
    ///
    /// Under contention the operation retries and `f` runs once per attempt, so it must be
    /// pure. The payload it produces must answer to the same key, otherwise the placement in
    /// the trie would no longer match the hashes.
    pub fn update<'r, 's, 'p, Q, F>(
        &'s self,
        key: &Q,
        f: F,
        pin: &'p Guard,
    ) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        F: Fn(Option<&C::Payload>) -> Option<C::Payload>,
    {
        let hash = self.hash(key);
        loop {
            let gen = self.root_gen(pin);
            match self.apply(&self.root, None, key, hash, 0, &f, &gen, pin) {
                Updated::Done(previous) => return previous,
                Updated::Restart => (),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply<'g, Q, F>(
        &self,
        i: &INode<C>,
        parent: Option<&INode<C>>,
        key: &Q,
        hash: u64,
        shift: usize,
        f: &F,
        gen: &Gen,
        pin: &'g Guard,
    ) -> Updated<'g, C::Payload>
    where
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        F: Fn(Option<&C::Payload>) -> Option<C::Payload>,
        C: 'g,
    {
        loop {
            let state = i.state(pin);
            let s = unsafe { state.deref() };
            if s.gen != *gen {
                return Updated::Restart;
            }
            match &s.main {
                Main::Cn(cn) => {
                    let flag = flag(hash, shift);
                    let pos = cn.position(flag);
                    if cn.bmp & flag == 0 {
                        // Nothing under this key yet.
                        return match f(None) {
                            None => Updated::Done(None),
                            Some(payload) => {
                                let new = cn.inserted(flag, pos, Branch::Leaf(payload));
                                if gen_dcss(i, state, Main::Cn(new), gen, pin) {
                                    Updated::Done(None)
                                } else {
                                    Updated::Restart
                                }
                            }
                        };
                    }
                    match &cn.branches[pos] {
                        Branch::Node(child) => {
                            if unsafe { child.state(pin).deref() }.gen != *gen {
                                if self.regenerate(i, state, cn, pos, child, gen, pin) {
                                    continue;
                                }
                                return Updated::Restart;
                            }
                            return self.apply(
                                child,
                                Some(i),
                                key,
                                hash,
                                shift + LEVEL_BITS,
                                f,
                                gen,
                                pin,
                            );
                        }
                        Branch::Leaf(old) if (*old).borrow().borrow() == key => {
                            return match f(Some(old)) {
                                Some(payload) => {
                                    let new = cn.updated(pos, Branch::Leaf(payload));
                                    if gen_dcss(i, state, Main::Cn(new), gen, pin) {
                                        Updated::Done(Some(old))
                                    } else {
                                        Updated::Restart
                                    }
                                }
                                None => {
                                    let new = contract(cn.removed(flag, pos), shift);
                                    let tombed = matches!(new, Main::Tomb(_));
                                    if !gen_dcss(i, state, new, gen, pin) {
                                        Updated::Restart
                                    } else {
                                        if tombed {
                                            // We just tombed ourselves; have the level above
                                            // absorb it before reporting back.
                                            let parent =
                                                parent.expect("BUG: contraction at the root");
                                            self.clean_parent(
                                                parent,
                                                i,
                                                hash,
                                                shift - LEVEL_BITS,
                                                gen,
                                                pin,
                                            );
                                        }
                                        Updated::Done(Some(old))
                                    }
                                }
                            };
                        }
                        Branch::Leaf(other) => {
                            // A different key lives in the slot. If there's something to
                            // insert, push both leaves one level down.
                            return match f(None) {
                                None => Updated::Done(None),
                                Some(payload) => {
                                    let other_hash = self.hash((*other).borrow());
                                    let pair = pair_branch::<C>(
                                        other.clone(),
                                        other_hash,
                                        payload,
                                        hash,
                                        shift + LEVEL_BITS,
                                        gen,
                                    );
                                    let new = cn.updated(pos, pair);
                                    if gen_dcss(i, state, Main::Cn(new), gen, pin) {
                                        Updated::Done(None)
                                    } else {
                                        Updated::Restart
                                    }
                                }
                            };
                        }
                    }
                }
                Main::Tomb(_) => {
                    let parent = parent.expect("BUG: tombstone at the root");
                    self.clean(parent, shift - LEVEL_BITS, gen, pin);
                    return Updated::Restart;
                }
                Main::List(leaves) => {
                    let previous = leaves.iter().find(|l| (*l).borrow().borrow() == key);
                    let next = f(previous);
                    if previous.is_none() && next.is_none() {
                        return Updated::Done(None);
                    }
                    let mut rebuilt = leaves
                        .iter()
                        .filter(|l| (*l).borrow().borrow() != key)
                        .cloned()
                        .collect::<Leaves<C>>();
                    if let Some(payload) = next {
                        rebuilt.push(payload);
                    }
                    let tombed = rebuilt.len() < 2;
                    let main = match rebuilt.len() {
                        0 => Main::Tomb(None),
                        1 => Main::Tomb(rebuilt.pop()),
                        _ => Main::List(rebuilt),
                    };
                    if !gen_dcss(i, state, main, gen, pin) {
                        return Updated::Restart;
                    }
                    if tombed {
                        let parent = parent.expect("BUG: collision list at the root");
                        self.clean_parent(parent, i, hash, shift - LEVEL_BITS, gen, pin);
                    }
                    return Updated::Done(previous);
                }
            }
        }
    }

    /// Atomically resets the trie to empty.
    pub fn clear(&self, pin: &Guard) {
        loop {
            let state = self.root.state(pin);
            let gen = unsafe { state.deref() }.gen.clone();
            if gen_dcss(&self.root, state, Main::Cn(CNode::empty()), &gen, pin) {
                return;
            }
        }
    }

    /// Structurally rebuilds the whole trie with every payload transformed.
    ///
    /// Runs over a private snapshot, so the result corresponds to a single moment of the
    /// source. The new trie shares nothing with the old one and lives in one fresh generation.
    pub fn map_payloads<D, F>(&self, f: F) -> Raw<D, S>
    where
        S: Clone,
        D: Config<Key = C::Key>,
        F: Fn(&C::Payload) -> D::Payload,
    {
        let snap = self.snapshot();
        let pin = crossbeam_epoch::pin();
        let gen = Gen::new();
        let main = map_main::<C, D, F>(
            &unsafe { snap.root.state(&pin).deref() }.main,
            &f,
            &gen,
            &pin,
        );
        Raw {
            hash_builder: snap.hash_builder,
            root: INode::new(main, gen),
        }
    }

    /// Applies `f` to every entry in place, dropping the entries mapped to `None`.
    ///
    /// Each level commits separately, so the pass as a whole is not atomic ‒ entries inserted
    /// concurrently may or may not be visited. A lost swap redoes the affected level, which can
    /// hand an entry to `f` more than once; `f` must be pure and idempotent.
    pub fn filter_map<F>(&self, f: F, pin: &Guard)
    where
        F: Fn(&C::Payload) -> Option<C::Payload>,
    {
        loop {
            let gen = self.root_gen(pin);
            if self.filter_at(&self.root, 0, &f, &gen, pin) {
                return;
            }
        }
    }

    /// One level of the in-place transform. Returns false when the generation moved and the
    /// whole pass has to restart from the root.
    fn filter_at<F>(&self, i: &INode<C>, shift: usize, f: &F, gen: &Gen, pin: &Guard) -> bool
    where
        F: Fn(&C::Payload) -> Option<C::Payload>,
    {
        'level: loop {
            let state = i.state(pin);
            let s = unsafe { state.deref() };
            if s.gen != *gen {
                return false;
            }
            let cn = match &s.main {
                Main::Cn(cn) => cn,
                // Someone collapsed us mid-pass; the caller absorbs the leftover leaf and
                // filters it as part of its own level.
                Main::Tomb(_) => return true,
                Main::List(leaves) => {
                    let mut rebuilt = leaves.iter().filter_map(f).collect::<Leaves<C>>();
                    let main = match rebuilt.len() {
                        0 => Main::Tomb(None),
                        1 => Main::Tomb(rebuilt.pop()),
                        _ => Main::List(rebuilt),
                    };
                    if gen_dcss(i, state, main, gen, pin) {
                        return true;
                    }
                    continue 'level;
                }
            };
            // First deal with every child I-node ‒ stale generations, tombstones left over
            // from earlier removals, and the recursion itself. After this pass a tombed child
            // can only hold a leaf that already went through `f`.
            for (pos, branch) in cn.branches.iter().enumerate() {
                if let Branch::Node(child) = branch {
                    let cs = unsafe { child.state(pin).deref() };
                    if cs.gen != *gen {
                        if self.regenerate(i, state, cn, pos, child, gen, pin) {
                            continue 'level;
                        }
                        return false;
                    }
                    if let Main::Tomb(_) = cs.main {
                        // A leftover from before this pass; absorb it so its leaf goes through
                        // `f` as part of our own level.
                        self.clean(i, shift, gen, pin);
                        continue 'level;
                    }
                    if !self.filter_at(child, shift + LEVEL_BITS, f, gen, pin) {
                        return false;
                    }
                }
            }
            // Then rebuild this level: filter own leaves, absorb children the dive collapsed.
            let mut bmp = 0;
            let mut branches = Vec::with_capacity(cn.branches.len());
            let mut left = cn.bmp;
            let mut pos = 0;
            while left != 0 {
                let slot = left & left.wrapping_neg();
                left &= left - 1;
                match &cn.branches[pos] {
                    Branch::Leaf(l) => {
                        if let Some(mapped) = f(l) {
                            bmp |= slot;
                            branches.push(Branch::Leaf(mapped));
                        }
                    }
                    Branch::Node(child) => match &unsafe { child.state(pin).deref() }.main {
                        // Collapsed by the dive above ‒ the leaf inside is already transformed.
                        Main::Tomb(Some(l)) => {
                            bmp |= slot;
                            branches.push(Branch::Leaf(l.clone()));
                        }
                        Main::Tomb(None) => (),
                        _ => {
                            bmp |= slot;
                            branches.push(Branch::Node(Arc::clone(child)));
                        }
                    },
                }
                pos += 1;
            }
            let rebuilt = contract(
                CNode {
                    bmp,
                    branches: branches.into_boxed_slice(),
                },
                shift,
            );
            if gen_dcss(i, state, rebuilt, gen, pin) {
                return true;
            }
        }
    }
}

impl<C, S> Raw<C, S>
where
    C: Config,
{
    /// Checks for emptiness.
    ///
    /// Inherently racy in the presence of writers ‒ the answer may be stale by the time it can
    /// be acted upon.
    pub fn is_empty(&self) -> bool {
        let pin = crossbeam_epoch::pin();
        match &unsafe { self.root.state(&pin).deref() }.main {
            Main::Cn(cn) => cn.bmp == 0,
            _ => unreachable!("BUG: root must hold a C-node"),
        }
    }

    /// Forks off an independent handle sharing all the current structure.
    ///
    /// Constant time. Both handles stay fully usable; each side copies an indirection node the
    /// first time it writes through it, so neither observes the other's later changes. The
    /// source receives a fresh generation as well ‒ that aborts any mutation which was already
    /// in flight when the fork happened before it can commit at the old root.
    pub fn snapshot(&self) -> Self
    where
        S: Clone,
    {
        let pin = crossbeam_epoch::pin();
        loop {
            let state = self.root.state(&pin);
            let s = unsafe { state.deref() };
            let bumped = Owned::new(State {
                gen: Gen::new(),
                main: s.main.clone(),
            });
            let swapped = self.root.state.compare_and_set(
                state,
                bumped,
                (Ordering::Release, Ordering::Relaxed),
                &pin,
            );
            if swapped.is_ok() {
                unsafe { pin.defer_destroy(state) };
                return Self {
                    hash_builder: self.hash_builder.clone(),
                    root: INode::new(s.main.clone(), Gen::new()),
                };
            }
        }
    }
}

fn map_main<C, D, F>(main: &Main<C>, f: &F, gen: &Gen, pin: &Guard) -> Main<D>
where
    C: Config,
    D: Config<Key = C::Key>,
    F: Fn(&C::Payload) -> D::Payload,
{
    match main {
        Main::Cn(cn) => {
            let branches = cn
                .branches
                .iter()
                .map(|branch| match branch {
                    Branch::Leaf(l) => Branch::Leaf(f(l)),
                    Branch::Node(child) => {
                        let below = map_main::<C, D, F>(
                            &unsafe { child.state(pin).deref() }.main,
                            f,
                            gen,
                            pin,
                        );
                        Branch::Node(Arc::new(INode::new(below, gen.clone())))
                    }
                })
                .collect::<Vec<_>>();
            Main::Cn(CNode {
                bmp: cn.bmp,
                branches: branches.into_boxed_slice(),
            })
        }
        Main::Tomb(l) => Main::Tomb(l.as_ref().map(f)),
        Main::List(ls) => Main::List(ls.iter().map(f).collect()),
    }
}
