//! # Arbor Core
//!
//! Copy-on-write object storage for Arbor.
//!
//! This crate provides:
//! - A block arena addressed by opaque references, with copy-on-write and
//!   version-based reclamation ([`Allocator`])
//! - Cluster B+trees storing objects as columnar leaves keyed by [`ObjKey`]
//!   ([`ClusterTree`])
//! - Cascading deletes across link graphs ([`CascadeState`])
//! - An ordered tree primitive ([`BPlusTree`]) and the per-object
//!   dictionaries built on it ([`Dictionary`])
//! - Tables, single-writer transactions and a crash-safe node log
//!   ([`Database`])
//!
//! ## Example
//!
//! ```rust
//! use arbor_core::{ColumnType, Config, Database, Mixed};
//!
//! let db = Database::open_in_memory(Config::default()).unwrap();
//! let wt = db.begin_write().unwrap();
//! let items = wt.group().add_table("items").unwrap();
//! let attrs = items.add_column("attrs", ColumnType::Dictionary, true).unwrap();
//! let obj = items.create_object().unwrap();
//! let mut dict = items.dictionary(obj, attrs).unwrap();
//! dict.insert("Hello", 9).unwrap();
//! let rt = wt.commit_and_continue_as_read().unwrap();
//!
//! assert_eq!(dict.get("Hello").unwrap(), Mixed::from(9));
//! assert_eq!(rt.table("items").unwrap().size().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod alloc;
pub mod bptree;
pub mod cluster;
mod config;
pub mod dictionary;
mod error;
pub mod persist;
mod schema;
pub mod table;
mod transaction;
mod types;
mod value;

pub use alloc::{Allocator, Block, InnerNode, ParentLink, Ref, Slot, SlotLink};
pub use bptree::{BPlusTree, LeafValue};
pub use cluster::{CascadeState, Cluster, ClusterInner, ClusterNode, ClusterTree, State};
pub use config::{Config, MIN_NODE_MAX};
pub use dictionary::{ConstDictionary, Dictionary, Entry};
pub use error::{CoreError, CoreResult};
pub use persist::{LogRecord, NodeLog, Recovered};
pub use schema::{ColumnSpec, ColumnStorage, ColumnType, TableSchema};
pub use table::{Group, Table};
pub use transaction::{Database, ReadTransaction, WriteTransaction};
pub use types::{ColKey, ObjKey, TableKey, Version};
pub use value::{Mixed, Timestamp};
