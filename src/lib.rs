//! # `critbit`
//!
//! A concurrent ordered index over fixed-length binary keys, built as a
//! crit-bit (binary PATRICIA) trie.
//!
//! Internal branch nodes carry only a `(byte index, bit mask)` routing pair
//! identifying the single bit that separates their two subtrees; no key
//! material is duplicated into branches. Lookups are lock-free. Inserts and
//! removes lock at most two branches (the landing leaf's father and
//! grandfather), validate the links they depend on, and restart the whole
//! operation when a concurrent structural change invalidates them.
//!
//! | Operation | Concurrency |
//! |-----------|-------------|
//! | `find`    | Lock-free walk, never blocks |
//! | `insert`  | Lock-coupled (father + grandfather), retry on conflict |
//! | `remove`  | Lock-coupled splice, retry on conflict |
//! | `len`     | Unlocked diagnostic traversal |
//!
//! ## Thread Safety
//!
//! [`CritbitTree<V>`] is `Send + Sync` when `V: Send + Sync`. Concurrent
//! access uses the guard-based API:
//!
//! ```rust
//! use critbit::CritbitTree;
//!
//! let tree: CritbitTree<u64> = CritbitTree::new();
//! let guard = tree.guard();
//!
//! let key = [7u8; 32];
//! tree.insert_with_guard(&key, 42, None, &guard).unwrap();
//! assert_eq!(tree.find_with_guard(&key, None, &guard), Some(&42));
//! assert!(tree.remove_with_guard(&key, None, &guard));
//! ```
//!
//! Removed nodes are reclaimed through the [`seize`] collector: removal
//! unlinks a node and retires it, and the collector frees it only after
//! every guard that was active at retire time has exited. Readers therefore
//! never dereference freed memory, and nothing is leaked.
//!
//! ## Key Constraints
//!
//! - Keys are fixed-length byte arrays; the length is the `KEY_LEN` const
//!   parameter (default 32, i.e. 256-bit keys) and must be in `1..=256`.
//! - The all-zeroes key and the key `[1, 0, 0, ...]` are reserved: the tree
//!   is bootstrapped with two permanent sentinel leaves under those keys so
//!   that every removable entry has both a father and a grandfather branch.
//!
//! ## Contention Observability
//!
//! Every operation accepts an optional [`RetryCounter`]. The counter is
//! bumped once per optimistic restart (a cleared child slot observed
//! mid-walk, or a link validation that failed after locking). It is purely
//! diagnostic: contention is always absorbed by retrying, never surfaced as
//! an error, and there is no retry cap.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod lock;
mod mask;
mod node;
pub mod retry;
pub mod tree;

pub use retry::RetryCounter;
pub use tree::{CritbitTree, DuplicateKey};
