//! Advisory lock manager.
//!
//! Locks are cooperative: they never block the scheduler itself, but
//! every mutating RPC that touches a job validates the caller's held
//! token against the lock store before proceeding.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use stratus_core::{Clock, Lock, LockKey};
use stratus_storage::Storage;

use crate::error::LockError;

pub struct LockManager {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Acquire a lock on `key` for `user`. Fails if any lock exists.
    pub fn acquire(&self, key: LockKey, user: &str) -> Result<Lock, LockError> {
        self.storage.write(|txn| {
            if let Some(existing) = txn.stores().locks.fetch(&key) {
                return Err(LockError::AlreadyLocked {
                    key: key.0.to_string(),
                    holder: existing.user.clone(),
                });
            }
            let lock = Lock {
                key: key.clone(),
                token: Uuid::new_v4().to_string(),
                user: user.to_string(),
                timestamp_ms: self.clock.now_ms(),
            };
            txn.save_lock(lock.clone())?;
            info!(key = %lock.key.0, user, "lock acquired");
            Ok(lock)
        })
    }

    /// Release `lock` iff its token matches the held lock.
    pub fn release(&self, lock: &Lock) -> Result<(), LockError> {
        self.storage.write(|txn| {
            match txn.stores().locks.fetch(&lock.key) {
                None => Err(LockError::NotLocked(lock.key.0.to_string())),
                Some(held) if held.token != lock.token => {
                    Err(LockError::TokenMismatch(lock.key.0.to_string()))
                }
                Some(_) => {
                    txn.remove_lock(&lock.key)?;
                    info!(key = %lock.key.0, "lock released");
                    Ok(())
                }
            }
        })
    }

    /// Succeeds when no lock exists on `key`; otherwise the supplied
    /// token must match exactly.
    pub fn assert_not_locked(
        &self,
        key: &LockKey,
        held_token: Option<&str>,
    ) -> Result<(), LockError> {
        self.storage.read(|stores| {
            match stores.locks.fetch(key) {
                None => Ok(()),
                Some(lock) if Some(lock.token.as_str()) == held_token => Ok(()),
                Some(_) => Err(LockError::TokenMismatch(key.0.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{FakeClock, JobKey};

    fn manager() -> LockManager {
        LockManager::new(
            Arc::new(Storage::in_memory().unwrap()),
            Arc::new(FakeClock::at(1_000)),
        )
    }

    fn key() -> LockKey {
        LockKey(JobKey::new("r", "e", "j"))
    }

    #[test]
    fn acquire_release_acquire_roundtrip() {
        let locks = manager();
        let lock = locks.acquire(key(), "alice").unwrap();
        locks.release(&lock).unwrap();
        locks.acquire(key(), "bob").unwrap();
    }

    #[test]
    fn double_acquire_names_the_holder() {
        let locks = manager();
        locks.acquire(key(), "alice").unwrap();
        match locks.acquire(key(), "bob") {
            Err(LockError::AlreadyLocked { holder, .. }) => assert_eq!(holder, "alice"),
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[test]
    fn release_requires_matching_token() {
        let locks = manager();
        let lock = locks.acquire(key(), "alice").unwrap();
        let mut forged = lock.clone();
        forged.token = "forged".to_string();

        assert!(matches!(
            locks.release(&forged),
            Err(LockError::TokenMismatch(_))
        ));
        // The real token still works.
        locks.release(&lock).unwrap();
        assert!(matches!(
            locks.release(&lock),
            Err(LockError::NotLocked(_))
        ));
    }

    #[test]
    fn validation_passes_without_a_lock() {
        let locks = manager();
        locks.assert_not_locked(&key(), None).unwrap();
        locks.assert_not_locked(&key(), Some("anything")).unwrap();
    }

    #[test]
    fn validation_enforces_the_held_token() {
        let locks = manager();
        let lock = locks.acquire(key(), "alice").unwrap();

        locks
            .assert_not_locked(&key(), Some(lock.token.as_str()))
            .unwrap();
        assert!(matches!(
            locks.assert_not_locked(&key(), None),
            Err(LockError::TokenMismatch(_))
        ));
        assert!(matches!(
            locks.assert_not_locked(&key(), Some("stale")),
            Err(LockError::TokenMismatch(_))
        ));
    }
}
