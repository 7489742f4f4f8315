//! # Sigil Storage
//!
//! Storage abstraction layer for Sigil backends.
//!
//! Provides the [`StorageBackend`] trait the CA core persists its records
//! through, plus an in-memory backend for tests and ephemeral use.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod memory;

pub use backend::StorageBackend;
pub use error::StorageError;
pub use memory::MemoryBackend;
