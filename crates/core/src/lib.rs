//! The `logd` storage engine.
//!
//! A diff-based, transactional, versioned document store. Clients send
//! patches (structured diffs) against named paths in a virtual document
//! tree; the engine assigns each accepted patch a globally monotonic
//! commit number, appends it durably to a double-buffered write-ahead
//! log, updates the in-memory path index, and makes the resulting state
//! readable at any commit number.
//!
//! ```no_run
//! use logd_core::{Engine, Options, PatchRequest};
//! use logd_value::Node;
//!
//! # fn main() -> logd_core::Result<()> {
//! let engine = Engine::open("/var/lib/logd", Options::default())?;
//! let result = engine.commit_one(
//!     PatchRequest::new("/users/alice", Node::object([("name", Node::string("Alice"))]))?,
//!     None,
//! )?;
//! let state = engine.read_state_at("/users/alice", result.commit.unwrap(), None)?;
//! assert!(state.is_some());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod compact;
pub mod engine;
pub mod error;
pub mod index;
pub mod schema;
pub mod scope;
pub mod segment;
pub mod seq;
pub mod tx;

mod lock_file;
mod state;

pub use crate::cache::CacheConfig;
pub use crate::compact::{CompactionConfig, CompactionOutcome};
pub use crate::engine::{
    CommitNotification, Engine, Options, PatchRequest, Patcher, SchemaResolver, StatsSnapshot,
};
pub use crate::error::{Error, ErrorKind, Result, TxError};
pub use crate::segment::SegmentRef;
pub use crate::tx::{Tx, TxResult};

pub use logd_dlog::{FileId, ScopeId, SchemaMarker, SchemaState};
pub use logd_value::{KindedPath, Node, PathSeg};
