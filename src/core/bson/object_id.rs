//! ObjectId generation.
//!
//! Layout: 4-byte big-endian unix timestamp, 5 random bytes fixed per
//! process, 3-byte incrementing counter seeded randomly.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use rand::Rng;

static PROCESS_BYTES: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

/// A 12-byte unique document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generates a fresh id.
    #[must_use]
    pub fn new() -> Self {
        let process = PROCESS_BYTES.get_or_init(|| rand::thread_rng().gen());
        let counter = COUNTER.get_or_init(|| AtomicU32::new(rand::thread_rng().gen()));

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let seconds = Utc::now().timestamp() as u32;
        let count = counter.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(process);
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// The embedded creation timestamp in unix seconds.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
