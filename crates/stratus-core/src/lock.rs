//! Advisory lock records.

use serde::{Deserialize, Serialize};

use crate::task::JobKey;

/// The resource an advisory lock protects. Today always a job key.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LockKey(pub JobKey);

/// An advisory lock held by a user over a [`LockKey`].
///
/// The token is opaque to the holder and must be echoed back on every
/// mutating call against the locked key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub key: LockKey,
    pub token: String,
    pub user: String,
    pub timestamp_ms: u64,
}
