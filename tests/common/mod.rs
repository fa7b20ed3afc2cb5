//! Shared test utilities: tracing subscriber setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ...
//! }
//! ```
//!
//! The filter comes from `RUST_LOG` and defaults to `info`. Build with
//! `--features tracing` to see the tree's own restart and splice events:
//!
//! ```bash
//! RUST_LOG=critbit=trace cargo test --features tracing --test stress_tests
//! ```

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Ensures the subscriber is only installed once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with console output.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Decimal-formatted numeric key, zero-padded to full width.
///
/// Formatted keys start with ASCII digits, so they can never collide with
/// the tree's two reserved sentinel keys.
pub fn num_key(i: usize) -> [u8; 32] {
    let mut key = [0u8; 32];
    let text = format!("{i:020}");
    key[..text.len()].copy_from_slice(text.as_bytes());
    key
}
