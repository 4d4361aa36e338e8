//! Pure domain logic shared by the try-on orchestration crates.
//!
//! Nothing in this crate performs I/O. It owns the two on-disk workflow
//! graph encodings, the normalizer that turns either of them into the
//! canonical graph accepted by the execution backend, and the error
//! types those operations produce.

pub mod error;
pub mod graph;
pub mod types;
