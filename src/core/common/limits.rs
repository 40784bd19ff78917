//! Hard limits of the engine.

use std::time::Duration;

/// Maximum size of a single encoded document.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum nesting depth of a document.
pub const MAX_BSON_DEPTH: usize = 100;

/// Maximum size of a single wire message.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Maximum number of indexes on one collection.
pub const MAX_INDEXES_PER_COLLECTION: usize = 64;

/// Maximum number of fields in a compound index key.
pub const MAX_COMPOUND_INDEX_KEYS: usize = 32;

/// Maximum encoded size of an index entry key.
pub const MAX_INDEX_KEY_SIZE: usize = 1024;

/// Cursors idle longer than this are killed by the sweep.
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(10 * 60);

/// Sessions idle longer than this are removed by the sweep.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Default timeout for lock acquisition and transactions.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of documents returned per cursor batch.
pub const DEFAULT_BATCH_SIZE: usize = 101;

/// Upper bound on a requested batch size.
pub const MAX_BATCH_SIZE: usize = 100_000;
