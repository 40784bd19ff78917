#![forbid(unsafe_code)]
#![deny(clippy::all, deprecated)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::module_inception,
    clippy::similar_names,
    clippy::too_many_lines
)]

//! # doclite - an embeddable document database
//!
//! doclite is a single-file document database written in Rust with a
//! MongoDB-compatible command surface. It stores schemaless BSON
//! documents in named collections, maintains secondary B+Tree indexes,
//! and supports multi-document transactions with two-phase locking,
//! deadlock detection, and undo-log rollback.
//!
//! ## Features
//!
//! - **Single-file storage**: all data lives in one file of 16 KiB
//!   pages behind a caching pager
//! - **B+Tree everywhere**: collection data, secondary indexes, and the
//!   catalog share one paged B+Tree implementation
//! - **Transactions**: shared/exclusive locking with wait queues,
//!   deadlock detection on a wait-for graph, and reverse-order undo
//! - **Logical sessions**: per-session monotonic transaction numbers
//!   with TTL expiry
//! - **Batched cursors**: server-side iteration state with `getMore`
//!   and `killCursors` semantics
//!
//! ## Quick Start
//!
//! ```no_run
//! use doclite::{doc, Config, Database, SessionContext};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), doclite::DbError> {
//! let db = Database::open("my_database.db", Config::default())?;
//! let ctx = SessionContext::none();
//!
//! let id = db.insert_one("users", doc! { "name": "ada", "age": 36 }, &ctx).await?;
//! let found = db.find_by_id("users", &id, &ctx).await?;
//! assert!(found.is_some());
//!
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **API layer** (`api`): the `Database` handle driving commands
//!   through locks, transactions, and the catalog
//! - **Storage layer** (`core::storage`): the pager and the paged
//!   B+Tree with overflow chains
//! - **Catalog layer** (`core::catalog`): persistent collection
//!   metadata and the per-collection data/index glue
//! - **Index layer** (`core::index`): order-preserving key encoding and
//!   atomic cross-index maintenance
//! - **Transaction layer** (`core::transaction`): the lock manager and
//!   the transaction manager
//! - **Session and cursor layers** (`core::session`, `core::cursor`):
//!   logical sessions and batched iteration state, both TTL-swept

pub mod api;
pub mod core;

// Public API exports
pub use api::Database;
pub use crate::core::bson::{Document, ObjectId, Value};
pub use crate::core::common::DbError;
pub use crate::core::config::Config;
pub use crate::core::cursor::CursorBatch;
pub use crate::core::session::SessionContext;
