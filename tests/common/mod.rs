//! Common test utilities.
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
//! Set `RUST_LOG` (e.g. `RUST_LOG=artree=trace`) and enable the crate's
//! `tracing` feature to see restart and restructure events.

#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the tracing subscriber. Safe to call from every test; only
/// the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
