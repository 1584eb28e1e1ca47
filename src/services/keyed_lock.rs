// services/keyed_lock.rs
//
// Per-key mutual exclusion for checkout creation. This is a process-local
// primitive: it serializes attempts within one running instance only. For
// multi-instance deployments the `DistributedLock` trait below has a
// Mongo-backed implementation that piggybacks on the same conditional-write
// idea as the capacity counter.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{self, doc};
use mongodb::{Collection, Database};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct LockStats {
    pub current_waiters: u64,
    pub total_acquisitions: u64,
    pub avg_wait_ms: f64,
}

#[derive(Default)]
pub struct KeyedLock {
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    waiters: AtomicU64,
    acquisitions: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` while holding the lock for `key`.
    ///
    /// A second caller for the same key waits for the current holder to
    /// finish (success or failure) and gets `LockTimeout` if the wait
    /// exceeds `timeout_ms`. A failed `op` does not poison the key.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, timeout_ms: u64, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entry = {
            let mut map = self.entries.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let acquired = tokio::time::timeout(Duration::from_millis(timeout_ms), entry.lock()).await;
        self.waiters.fetch_sub(1, Ordering::Relaxed);

        let guard = match acquired {
            Ok(guard) => guard,
            Err(_) => {
                self.collect(key, &entry).await;
                return Err(AppError::LockTimeout(key.to_string()));
            }
        };

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        let result = op().await;
        drop(guard);

        self.collect(key, &entry).await;
        result
    }

    // Drop the map entry once nobody else holds a handle to it, so keys
    // seen once do not accumulate forever.
    async fn collect(&self, key: &str, entry: &Arc<Mutex<()>>) {
        let mut map = self.entries.lock().await;
        if let Some(current) = map.get(key) {
            // one count for the map, one for our handle
            if Arc::ptr_eq(current, entry) && Arc::strong_count(current) == 2 {
                map.remove(key);
            }
        }
    }

    pub fn stats(&self) -> LockStats {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        let total_wait = self.total_wait_micros.load(Ordering::Relaxed);
        LockStats {
            current_waiters: self.waiters.load(Ordering::Relaxed),
            total_acquisitions: acquisitions,
            avg_wait_ms: if acquisitions == 0 {
                0.0
            } else {
                (total_wait as f64 / acquisitions as f64) / 1000.0
            },
        }
    }
}

/// Cross-instance lock seam. The in-memory `KeyedLock` is the default for
/// single-instance deployments; `MongoLock` provides the shared-store
/// implementation behind the same acquire/release contract.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `key` for at most `ttl`. Returns false when another
    /// holder currently owns it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<()>;
}

pub struct MongoLock {
    locks: Collection<bson::Document>,
}

impl MongoLock {
    pub fn new(db: &Database) -> Self {
        Self {
            locks: db.collection("locks"),
        }
    }
}

#[async_trait]
impl DistributedLock for MongoLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = bson::DateTime::from_chrono(
            now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        );

        // Take the key if it is absent or its previous holder expired. A
        // concurrent holder makes the upsert collide on _id, which is the
        // "lock busy" signal.
        let result = self
            .locks
            .update_one(
                doc! {
                    "_id": key,
                    "expires_at": { "$lt": bson::DateTime::from_chrono(now) },
                },
                doc! { "$set": { "expires_at": expires_at } },
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.locks.delete_one(doc! { "_id": key }).await?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn serializes_same_key() {
        let lock = Arc::new(KeyedLock::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("purchase:u1:o1", 5_000, || async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(lock.stats().total_acquisitions, 8);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let lock = Arc::new(KeyedLock::new());
        let started = Instant::now();

        let a = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("purchase:u1:o1", 1_000, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
            })
        };
        let b = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("purchase:u2:o1", 1_000, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // serial execution would need >= 100ms
        assert!(started.elapsed() < Duration::from_millis(95));
    }

    #[tokio::test]
    async fn waiter_times_out_without_blocking_others() {
        let lock = Arc::new(KeyedLock::new());

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("k", 1_000, || async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = lock
            .with_lock("k", 30, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockTimeout(_)));

        // the original holder and a fresh waiter are unaffected
        holder.await.unwrap().unwrap();
        lock.with_lock("k", 1_000, || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn failed_operation_does_not_poison_key() {
        let lock = KeyedLock::new();

        let err: Result<()> = lock
            .with_lock("k", 100, || async {
                Err(AppError::service("boom"))
            })
            .await;
        assert!(err.is_err());

        lock.with_lock("k", 100, || async { Ok(()) }).await.unwrap();
        assert_eq!(lock.stats().total_acquisitions, 2);
    }

    #[tokio::test]
    async fn entries_are_collected_when_idle() {
        let lock = KeyedLock::new();
        for i in 0..32 {
            lock.with_lock(&format!("k{}", i), 100, || async { Ok(()) })
                .await
                .unwrap();
        }
        assert!(lock.entries.lock().await.is_empty());
    }
}
