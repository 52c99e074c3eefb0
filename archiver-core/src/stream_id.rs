//! Identity of a single listener connection instance

use std::fmt;
use std::num::NonZeroUsize;
use uuid::Uuid;

use crate::error::{ArchiverError, ArchiverResult};
use crate::types::now_nanos;

/// Comparable part of a stream identity: creation time plus random token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub created_at: i64,
    pub token: Uuid,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.created_at)
    }
}

/// Identity of one listener connection.
///
/// Two identities are equal when their keys are equal; the pair count only
/// sizes the comparison buffer of the gating queue.
#[derive(Clone, Debug)]
pub struct StreamIdentity {
    key: IdentityKey,
    pair_count: NonZeroUsize,
}

impl StreamIdentity {
    /// Create an identity stamped with the current time and a fresh token
    pub fn new(pairs: &[String]) -> ArchiverResult<Self> {
        Self::with_timestamp(now_nanos(), pairs)
    }

    /// Create an identity with an explicit creation timestamp (nanoseconds)
    pub fn with_timestamp(created_at: i64, pairs: &[String]) -> ArchiverResult<Self> {
        let pair_count = NonZeroUsize::new(pairs.len()).ok_or(ArchiverError::InvalidIdentity)?;
        Ok(Self {
            key: IdentityKey {
                created_at,
                token: Uuid::new_v4(),
            },
            pair_count,
        })
    }

    pub fn key(&self) -> IdentityKey {
        self.key
    }

    pub fn created_at(&self) -> i64 {
        self.key.created_at
    }

    /// Number of pairs the connection was opened with; never zero
    pub fn pair_count(&self) -> usize {
        self.pair_count.get()
    }
}

impl PartialEq for StreamIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for StreamIdentity {}

impl std::hash::Hash for StreamIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}
