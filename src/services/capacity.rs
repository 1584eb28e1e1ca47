// services/capacity.rs
//
// Limited-slot capacity as a storage-level conditional increment. The
// guard lives in the update filter, not in any process lock, so the
// counter stays correct even if checkout serialization were bypassed.
use async_trait::async_trait;
use mongodb::bson::{doc, oid::ObjectId, Bson};
use mongodb::{Collection, Database};

use crate::errors::Result;
use crate::models::offering::Offering;

#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Increment the offering's slot counter only while it is below
    /// `limit`. A missing counter counts as zero. Returns false when the
    /// slots are full.
    async fn try_reserve_slot(&self, offering_id: &ObjectId, limit: i64) -> Result<bool>;

    /// Unconditional decrement, used when a pending purchase holding a
    /// slot is cancelled or superseded. Read paths clamp negatives to 0;
    /// the cancel/create race is a documented edge case, not corrected
    /// here.
    async fn release_slot(&self, offering_id: &ObjectId) -> Result<()>;
}

pub struct MongoCapacityStore {
    offerings: Collection<Offering>,
}

impl MongoCapacityStore {
    pub fn new(db: &Database) -> Self {
        Self {
            offerings: db.collection("offerings"),
        }
    }
}

#[async_trait]
impl CapacityStore for MongoCapacityStore {
    async fn try_reserve_slot(&self, offering_id: &ObjectId, limit: i64) -> Result<bool> {
        let filter = doc! {
            "_id": offering_id,
            "$or": [
                { "limited_slot_count": { "$exists": false } },
                { "limited_slot_count": Bson::Null },
                { "limited_slot_count": { "$lt": limit } },
            ],
        };
        let update = doc! { "$inc": { "limited_slot_count": 1 } };

        let matched = self.offerings.find_one_and_update(filter, update).await?;
        Ok(matched.is_some())
    }

    async fn release_slot(&self, offering_id: &ObjectId) -> Result<()> {
        self.offerings
            .update_one(
                doc! { "_id": offering_id },
                doc! { "$inc": { "limited_slot_count": -1 } },
            )
            .await?;
        Ok(())
    }
}

/// In-memory store with the same contract, for racing reservations
/// without a database.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryCapacityStore {
    pub counts: tokio::sync::Mutex<std::collections::HashMap<ObjectId, i64>>,
}

#[cfg(test)]
#[async_trait]
impl CapacityStore for InMemoryCapacityStore {
    async fn try_reserve_slot(&self, offering_id: &ObjectId, limit: i64) -> Result<bool> {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(*offering_id).or_insert(0);
        if *count < limit {
            *count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_slot(&self, offering_id: &ObjectId) -> Result<()> {
        let mut counts = self.counts.lock().await;
        *counts.entry(*offering_id).or_insert(0) -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn exactly_k_of_n_reservations_succeed() {
        let store = Arc::new(InMemoryCapacityStore::default());
        let offering = ObjectId::new();
        let (n, k) = (24, 5i64);

        let mut handles = Vec::new();
        for _ in 0..n {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve_slot(&offering, k).await.unwrap()
            }));
        }

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, k);
        assert_eq!(*store.counts.lock().await.get(&offering).unwrap(), k);
    }

    #[tokio::test]
    async fn release_frees_one_slot() {
        let store = InMemoryCapacityStore::default();
        let offering = ObjectId::new();

        assert!(store.try_reserve_slot(&offering, 1).await.unwrap());
        assert!(!store.try_reserve_slot(&offering, 1).await.unwrap());

        store.release_slot(&offering).await.unwrap();
        assert!(store.try_reserve_slot(&offering, 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_unconditional() {
        // The documented cancel/create race: a release below zero is not
        // corrected at the store level.
        let store = InMemoryCapacityStore::default();
        let offering = ObjectId::new();

        store.release_slot(&offering).await.unwrap();
        assert_eq!(*store.counts.lock().await.get(&offering).unwrap(), -1);
    }
}
