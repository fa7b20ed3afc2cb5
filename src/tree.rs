//! The concurrent crit-bit tree.
//!
//! # Concurrency Protocol
//!
//! All three operations share one optimistic root-to-leaf walk that takes
//! no locks: at each branch the key's bit at the branch's `(byte, bitmask)`
//! position picks a child slot, until a leaf is reached. A remove that is
//! splicing a branch out clears that branch's child slots while holding its
//! lock; a walker that observes the cleared (null) slot restarts from the
//! root rather than dereferencing it.
//!
//! Mutations lock at most two branches, always top-down:
//!
//! 1. Lock the landing leaf's grandfather (when one exists) and re-validate
//!    that its child slot still points at the father. Any concurrent splice
//!    of the father breaks this link, so a stale walk is detected here.
//! 2. Lock the father and re-validate that its child slot still points at
//!    the landing leaf.
//! 3. With both links proven current, swing a single child pointer: insert
//!    publishes a freshly built branch over the landing leaf; remove points
//!    the grandfather directly at the leaf's sibling.
//!
//! Either validation failure releases the locks and restarts the whole
//! operation. Contention is fully absorbed by this retry loop; only
//! semantically meaningful outcomes (duplicate, not-found) cross the API
//! boundary.
//!
//! # Memory Reclamation
//!
//! Readers hold no locks, so a spliced-out node may still be under a
//! concurrent walk when the remove completes. Every traversal runs inside
//! a [`seize`] guard, and remove retires unlinked nodes through
//! [`Guard::defer_retire`]: the collector frees a node only after all
//! guards that were active at retire time have exited. Readers never
//! observe freed memory, and the validate-after-lock step cannot suffer
//! ABA, because a node observed during a walk cannot be recycled while the
//! walker's guard is live.

use std::fmt;
use std::ptr;
use std::sync::atomic::Ordering as AtomicOrdering;

use seize::{Collector, Guard, LocalGuard};

use crate::mask::MaskTable;
use crate::node::{Branch, Leaf, Node};
use crate::retry::RetryCounter;

// ============================================================================
//  DuplicateKey
// ============================================================================

/// Error returned by insert when the key is already present.
///
/// Carries the rejected payload back to the caller; the tree is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey<V>(pub V);

impl<V> fmt::Display for DuplicateKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key is already present in the tree")
    }
}

impl<V: fmt::Debug> std::error::Error for DuplicateKey<V> {}

// ============================================================================
//  CritbitTree
// ============================================================================

/// A concurrent crit-bit trie over `[u8; KEY_LEN]` keys.
///
/// The tree is bootstrapped with two permanent sentinel leaves (key
/// all-zeroes, and all-zeroes with byte 0 set to 1) joined under the root
/// branch. Sentinels guarantee that every removable entry has both a
/// father and a grandfather branch, which is what the two-level locking
/// protocol relies on. Their keys are reserved: lookups miss them, remove
/// reports not-found, and insert rejects them as duplicates.
///
/// `KEY_LEN` must be in `1..=256`; [`CritbitTree::new`] panics otherwise.
pub struct CritbitTree<V, const KEY_LEN: usize = 32> {
    /// Memory reclamation collector; guards enter here.
    collector: Collector,
    /// Byte-XOR to crit-bit-mask table. Read-only after construction.
    masks: MaskTable,
    /// Permanent root branch. Never replaced and never retired: a leaf
    /// hanging directly off the root is always a sentinel, and sentinels
    /// are never spliced out.
    root: Box<Node<V, KEY_LEN>>,
}

// An `&CritbitTree` lets any thread insert, remove, and eventually drop V
// values, so Sync requires `V: Send` on top of `V: Sync`. The explicit
// impls replace the structural ones, which would not carry that bound.
unsafe impl<V: Send, const KEY_LEN: usize> Send for CritbitTree<V, KEY_LEN> {}
unsafe impl<V: Send + Sync, const KEY_LEN: usize> Sync for CritbitTree<V, KEY_LEN> {}

/// Where a root-to-leaf walk landed, plus the linkage the mutation
/// protocols re-validate under lock.
struct Descent<'g, V, const KEY_LEN: usize> {
    /// The landing leaf.
    leaf: &'g Leaf<V, KEY_LEN>,
    /// Pointer identity of the landing leaf, for link re-validation.
    leaf_ptr: *mut Node<V, KEY_LEN>,
    /// Branch whose `son(f_dir)` slot held the landing leaf.
    father: &'g Branch<V, KEY_LEN>,
    /// Direction taken at the father.
    f_dir: usize,
    /// Absent exactly when the father is the root branch.
    grandfather: Option<Grandfather<'g, V, KEY_LEN>>,
}

struct Grandfather<'g, V, const KEY_LEN: usize> {
    branch: &'g Branch<V, KEY_LEN>,
    /// The father as loaded from `branch.son(dir)`, for re-validation.
    father_ptr: *mut Node<V, KEY_LEN>,
    /// Direction taken at the grandfather.
    dir: usize,
}

/// Reclamation callback for retired nodes: drop the box.
///
/// # Safety
///
/// `ptr` must originate from `Box::into_raw`, be unlinked from the tree,
/// and be retired at most once. The collector invokes this only after
/// every guard active at retire time has exited.
unsafe fn reclaim_node<V, const KEY_LEN: usize>(
    ptr: *mut Node<V, KEY_LEN>,
    _collector: &Collector,
) {
    // SAFETY: per the contract above we are the sole owner now.
    unsafe { drop(Box::from_raw(ptr)) };
}

#[inline]
fn bump(counter: Option<&RetryCounter>) {
    if let Some(counter) = counter {
        counter.record();
    }
}

impl<V, const KEY_LEN: usize> CritbitTree<V, KEY_LEN> {
    /// Create a tree holding only the two bootstrap sentinels.
    ///
    /// Builds the crit-bit mask table and the two-sentinel bootstrap; the
    /// tree is ready for concurrent use as soon as `new` returns.
    ///
    /// # Panics
    ///
    /// Panics if `KEY_LEN` is 0 or exceeds 256 (branch byte indices are
    /// stored in a `u8`).
    #[must_use]
    pub fn new() -> Self {
        assert!((1..=256).contains(&KEY_LEN), "KEY_LEN must be in 1..=256");

        let masks = MaskTable::new();

        let low_key = [0u8; KEY_LEN];
        let mut high_key = [0u8; KEY_LEN];
        high_key[0] = 1;

        let low = Box::into_raw(Box::new(Node::Leaf(Leaf::sentinel(low_key))));
        let high = Box::into_raw(Box::new(Node::Leaf(Leaf::sentinel(high_key))));

        let (byte, bitmask) = masks.locate(&low_key, &high_key);
        let root = Branch::new(byte, bitmask);
        root.link_sons(root.direction(&low_key), low, high);

        Self {
            collector: Collector::new(),
            masks,
            root: Box::new(Node::Branch(root)),
        }
    }

    /// Enter a protected region and return a guard.
    ///
    /// The guard pins reclamation: any node reachable while it is live
    /// stays allocated until it is dropped. Take one guard per batch of
    /// operations to amortize the entry cost.
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Insert an entry, using an explicit guard.
    ///
    /// Returns `Err(DuplicateKey(value))` and leaves the tree unchanged if
    /// the key is already present, handing the payload back to the caller.
    /// The restart events of this call are recorded into `counter` if one
    /// is supplied.
    ///
    /// # Errors
    ///
    /// [`DuplicateKey`] when an entry (or a reserved sentinel) with this
    /// key already exists.
    pub fn insert_with_guard(
        &self,
        key: &[u8; KEY_LEN],
        value: V,
        counter: Option<&RetryCounter>,
        guard: &LocalGuard<'_>,
    ) -> Result<(), DuplicateKey<V>> {
        let leaf_ptr = Box::into_raw(Box::new(Node::Leaf(Leaf::new(*key, value))));

        loop {
            let descent = self.descend(key, counter, guard);

            if descent.leaf.key == *key {
                // Never published; reclaim directly and hand the payload back.
                // SAFETY: `leaf_ptr` came from `Box::into_raw` above and was
                // never stored into the tree.
                let node = unsafe { Box::from_raw(leaf_ptr) };
                let Node::Leaf(leaf) = *node else {
                    unreachable!("insert allocates a leaf node")
                };
                let Some(value) = leaf.value else {
                    unreachable!("freshly built leaves carry a payload")
                };
                return Err(DuplicateKey(value));
            }

            let gf_guard = match &descent.grandfather {
                Some(gf) => {
                    let held = gf.branch.lock.lock();
                    let current = gf.branch.son(gf.dir).load(AtomicOrdering::Acquire);
                    if !ptr::eq(current, gf.father_ptr) {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("grandfather->father link lost; retrying insert");
                        drop(held);
                        bump(counter);
                        continue;
                    }
                    Some(held)
                }
                None => None,
            };

            let f_guard = descent.father.lock.lock();
            let current = descent.father.son(descent.f_dir).load(AtomicOrdering::Acquire);
            if !ptr::eq(current, descent.leaf_ptr) {
                #[cfg(feature = "tracing")]
                tracing::trace!("father->leaf link lost; retrying insert");
                drop(f_guard);
                drop(gf_guard);
                bump(counter);
                continue;
            }

            // Both links proven current. Build the new branch over the
            // landing leaf and publish it with a single pointer swing.
            let (byte, bitmask) = self.masks.locate(key, &descent.leaf.key);
            let branch = Branch::new(byte, bitmask);
            branch.link_sons(branch.direction(key), leaf_ptr, descent.leaf_ptr);
            let branch_ptr = Box::into_raw(Box::new(Node::Branch(branch)));

            descent
                .father
                .son(descent.f_dir)
                .store(branch_ptr, AtomicOrdering::Release);

            drop(f_guard);
            drop(gf_guard);
            return Ok(());
        }
    }

    /// Look an entry up, using an explicit guard. Lock-free; never blocks.
    ///
    /// The returned reference stays valid for the guard's lifetime: a
    /// concurrent remove of the same key unlinks the leaf but cannot free
    /// it until the guard is dropped.
    #[must_use]
    pub fn find_with_guard<'g>(
        &'g self,
        key: &[u8; KEY_LEN],
        counter: Option<&RetryCounter>,
        guard: &'g LocalGuard<'_>,
    ) -> Option<&'g V> {
        let descent = self.descend(key, counter, guard);
        if descent.leaf.key == *key {
            // Sentinels match their reserved keys but report no payload.
            descent.leaf.value.as_ref()
        } else {
            None
        }
    }

    /// Remove an entry, using an explicit guard.
    ///
    /// Returns `true` if the key was present and is now unlinked, `false`
    /// if no such entry exists. The spliced-out leaf and its father branch
    /// are retired to the collector and freed once no guard can still
    /// reach them.
    pub fn remove_with_guard(
        &self,
        key: &[u8; KEY_LEN],
        counter: Option<&RetryCounter>,
        guard: &LocalGuard<'_>,
    ) -> bool {
        loop {
            let descent = self.descend(key, counter, guard);

            if descent.leaf.key != *key {
                return false;
            }

            // A leaf hanging directly off the root is one of the two
            // bootstrap sentinels; those are fixtures, not entries.
            let Some(gf) = descent.grandfather else {
                return false;
            };

            let gf_guard = gf.branch.lock.lock();
            let current = gf.branch.son(gf.dir).load(AtomicOrdering::Acquire);
            if !ptr::eq(current, gf.father_ptr) {
                #[cfg(feature = "tracing")]
                tracing::trace!("grandfather->father link lost; retrying remove");
                drop(gf_guard);
                bump(counter);
                continue;
            }

            let f_guard = descent.father.lock.lock();
            let current = descent.father.son(descent.f_dir).load(AtomicOrdering::Acquire);
            if !ptr::eq(current, descent.leaf_ptr) {
                #[cfg(feature = "tracing")]
                tracing::trace!("father->leaf link lost; retrying remove");
                drop(f_guard);
                drop(gf_guard);
                bump(counter);
                continue;
            }

            // The sibling is stable and non-null while the father's lock is
            // held: only a remove holding this lock ever clears it.
            let sibling = descent
                .father
                .son(1 - descent.f_dir)
                .load(AtomicOrdering::Acquire);
            gf.branch.son(gf.dir).store(sibling, AtomicOrdering::Release);

            // Clearing the slots is what concurrent walkers restart on.
            descent
                .father
                .son(descent.f_dir)
                .store(ptr::null_mut(), AtomicOrdering::Release);
            descent
                .father
                .son(1 - descent.f_dir)
                .store(ptr::null_mut(), AtomicOrdering::Release);

            drop(f_guard);
            drop(gf_guard);

            #[cfg(feature = "tracing")]
            tracing::debug!("leaf and father branch spliced out; retiring both");

            // SAFETY: both nodes were unlinked above while holding the
            // father's and grandfather's locks, so no new walk can reach
            // them; walks already holding them are pinned by their guards,
            // which is exactly what defer_retire waits out.
            unsafe {
                guard.defer_retire(gf.father_ptr, reclaim_node);
                guard.defer_retire(descent.leaf_ptr, reclaim_node);
            }

            return true;
        }
    }

    /// Insert with a guard taken for just this call.
    ///
    /// # Errors
    ///
    /// [`DuplicateKey`] when an entry with this key already exists.
    pub fn insert(&self, key: &[u8; KEY_LEN], value: V) -> Result<(), DuplicateKey<V>> {
        let guard = self.guard();
        self.insert_with_guard(key, value, None, &guard)
    }

    /// Clone out an entry's payload, with a guard taken for just this call.
    #[must_use]
    pub fn get(&self, key: &[u8; KEY_LEN]) -> Option<V>
    where
        V: Clone,
    {
        let guard = self.guard();
        self.find_with_guard(key, None, &guard).cloned()
    }

    /// Whether an entry with this key exists.
    #[must_use]
    pub fn contains(&self, key: &[u8; KEY_LEN]) -> bool {
        let guard = self.guard();
        self.find_with_guard(key, None, &guard).is_some()
    }

    /// Remove with a guard taken for just this call.
    pub fn remove(&self, key: &[u8; KEY_LEN]) -> bool {
        let guard = self.guard();
        self.remove_with_guard(key, None, &guard)
    }

    /// Number of entries, by full traversal. The two bootstrap sentinels
    /// are not counted.
    ///
    /// The traversal takes no locks: concurrent mutation yields an
    /// approximate snapshot, which is fine for the diagnostic purpose.
    /// Run it at quiescence for an exact count.
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = self.guard();
        let root = self.root_branch();
        let low = root.son(0).load(AtomicOrdering::Acquire);
        let high = root.son(1).load(AtomicOrdering::Acquire);
        // SAFETY: both pointers were loaded from live slots while `guard`
        // is active, so every node reachable from them stays allocated for
        // the duration of the count.
        let leaves =
            unsafe { Self::count_leaves(low, &guard) + Self::count_leaves(high, &guard) };
        // A count racing a splice can transiently miss a subtree, hence
        // saturating rather than plain subtraction of the two sentinels.
        leaves.saturating_sub(2)
    }

    /// Whether the tree holds no entries beyond the bootstrap sentinels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    //  Internal
    // ========================================================================

    fn root_branch(&self) -> &Branch<V, KEY_LEN> {
        match self.root.as_ref() {
            Node::Branch(branch) => branch,
            Node::Leaf(_) => unreachable!("the root is built as a branch and never replaced"),
        }
    }

    /// The shared optimistic walk: follow the key's bits from the root to
    /// a leaf, tracking the last two branches and the directions taken.
    ///
    /// Takes no locks. A null child slot means a remove is mid-splice
    /// somewhere on the path; the walk restarts from the root and records
    /// the restart.
    fn descend<'g>(
        &'g self,
        key: &[u8; KEY_LEN],
        counter: Option<&RetryCounter>,
        _guard: &'g LocalGuard<'_>,
    ) -> Descent<'g, V, KEY_LEN> {
        let root = self.root_branch();

        loop {
            let mut grandfather: Option<Grandfather<'g, V, KEY_LEN>> = None;
            let mut father: &'g Branch<V, KEY_LEN> = root;
            let mut f_dir = father.direction(key);
            let mut child = father.son(f_dir).load(AtomicOrdering::Acquire);

            loop {
                if child.is_null() {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("walk hit a cleared child slot; restarting from the root");
                    bump(counter);
                    break;
                }

                // SAFETY: non-null child slots point at live nodes. The
                // node cannot be freed while this walk runs: retirement is
                // deferred past every guard active when it happens, and
                // `_guard` was entered before the pointer was loaded.
                let node: &'g Node<V, KEY_LEN> = unsafe { &*child };

                match node {
                    Node::Leaf(leaf) => {
                        return Descent {
                            leaf,
                            leaf_ptr: child,
                            father,
                            f_dir,
                            grandfather,
                        };
                    }
                    Node::Branch(branch) => {
                        grandfather = Some(Grandfather {
                            branch: father,
                            father_ptr: child,
                            dir: f_dir,
                        });
                        father = branch;
                        f_dir = branch.direction(key);
                        child = father.son(f_dir).load(AtomicOrdering::Acquire);
                    }
                }
            }
        }
    }

    /// Recursively count leaves reachable from `node`. Null slots (an
    /// in-progress splice) count as empty subtrees.
    ///
    /// # Safety
    ///
    /// `node` must be null or have been loaded from a live child slot
    /// while `guard` was active.
    unsafe fn count_leaves(node: *mut Node<V, KEY_LEN>, guard: &LocalGuard<'_>) -> usize {
        if node.is_null() {
            return 0;
        }
        // SAFETY: per the contract, `node` is live and pinned by `guard`.
        match unsafe { &*node } {
            Node::Leaf(_) => 1,
            Node::Branch(branch) => {
                let low = branch.son(0).load(AtomicOrdering::Acquire);
                let high = branch.son(1).load(AtomicOrdering::Acquire);
                // SAFETY: loaded from live slots under the same guard.
                unsafe { Self::count_leaves(low, guard) + Self::count_leaves(high, guard) }
            }
        }
    }
}

impl<V, const KEY_LEN: usize> Default for CritbitTree<V, KEY_LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const KEY_LEN: usize> fmt::Debug for CritbitTree<V, KEY_LEN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CritbitTree")
            .field("key_len", &KEY_LEN)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl<V, const KEY_LEN: usize> Drop for CritbitTree<V, KEY_LEN> {
    fn drop(&mut self) {
        // Unique access: no guards are outstanding. Free everything still
        // reachable from the root; nodes retired by earlier removes are
        // unreachable from here and are freed by the collector's own drop.
        let mut stack: Vec<*mut Node<V, KEY_LEN>> = Vec::with_capacity(64);
        if let Node::Branch(root) = self.root.as_ref() {
            stack.push(root.son(0).load(AtomicOrdering::Relaxed));
            stack.push(root.son(1).load(AtomicOrdering::Relaxed));
        }

        while let Some(ptr) = stack.pop() {
            if ptr.is_null() {
                continue;
            }
            // SAFETY: every reachable node was created via Box::into_raw
            // and, with a single path from the root to each node, is
            // visited exactly once.
            let node = unsafe { Box::from_raw(ptr) };
            if let Node::Branch(branch) = node.as_ref() {
                stack.push(branch.son(0).load(AtomicOrdering::Relaxed));
                stack.push(branch.son(1).load(AtomicOrdering::Relaxed));
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
