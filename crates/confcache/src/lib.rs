//! Foundational, allocation- and I/O-facing primitives shared by every
//! configuration kind: file loading, content-addressed object dedup, the
//! category bitset, the prefix tree used to index DNS names, and the
//! `Config`/`ConfigBuilder` pair that wires them all to a root directory.
//!
//! `confcore` builds the reload engine, worker pool and concrete
//! configuration kinds on top of this crate, the same way the teacher's
//! `sled` builds a tree on top of `pagecache`.

mod category_bitset;
mod conf_loader;
mod config;
mod error;
mod object_hash;
mod prefix_tree;

pub use category_bitset::{CategoryBitset, IDSTR_MAX_LEN};
pub use conf_loader::{ConfLoader, LoadInfo, StatSnapshot, ALLOW_NUL, CHOMP, SKIP_COMMENTS, SKIP_EMPTY};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use object_hash::ObjectHash;
pub use prefix_tree::PrefixTree;
