//! # Arbor Storage
//!
//! Byte-level backends underneath the Arbor node log.
//!
//! A backend is an append-only byte sink with random reads. It knows nothing
//! about nodes, records or commits; `arbor_core` frames and interprets
//! everything it writes.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral databases and tests
//! - [`FileBackend`] - a single file, held under an exclusive advisory lock
//!
//! ## Example
//!
//! ```rust
//! use arbor_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"node").unwrap();
//! assert_eq!(backend.read_at(offset, 4).unwrap(), b"node");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
