//! src/prefetch/common/mod.rs
//!
//! Utilities shared by the prefetch worker and batch loaders.

pub mod thread;
