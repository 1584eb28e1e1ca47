// services/store.rs
//
// Persistence seam shared by checkout and webhook reconciliation. The
// conditional writes that the payment invariants rest on (pending-only
// status transitions, consume-once promo codes) live here, behind one
// trait, so the transition logic can be exercised against the in-memory
// implementation without a database.
use async_trait::async_trait;
use mongodb::bson::{self, doc, oid::ObjectId};
use mongodb::{Collection, Database};
use tracing::warn;

use crate::errors::Result;
use crate::models::donation::{Donation, DonationStatus};
use crate::models::donation_transaction::DonationTransaction;
use crate::models::offering::Offering;
use crate::models::promo_code::PromoCode;
use crate::models::purchase::{Purchase, PurchaseStatus};

/// Partial update applied to a donation row. Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct DonationUpdate {
    pub status: Option<DonationStatus>,
    pub gateway_customer_id: Option<String>,
    pub gateway_subscription_id: Option<String>,
    pub last_gift_date: Option<bson::DateTime>,
    pub next_payment_date: Option<bson::DateTime>,
}

impl DonationUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.gateway_customer_id.is_none()
            && self.gateway_subscription_id.is_none()
            && self.last_gift_date.is_none()
            && self.next_payment_date.is_none()
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn offering_by_id(&self, id: ObjectId) -> Result<Option<Offering>>;

    async fn purchase_for_user(&self, id: ObjectId, user_id: &str) -> Result<Option<Purchase>>;
    async fn purchase_by_session(&self, session_id: &str) -> Result<Option<Purchase>>;
    async fn purchase_by_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Purchase>>;
    async fn purchase_by_status(
        &self,
        user_id: &str,
        offering_id: &ObjectId,
        status: PurchaseStatus,
    ) -> Result<Option<Purchase>>;
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<()>;
    async fn delete_purchase(&self, id: ObjectId) -> Result<()>;
    async fn set_purchase_session(&self, id: ObjectId, session_id: &str) -> Result<()>;

    /// Conditional `pending -> cancelled`. Returns false when the row was
    /// no longer pending; callers must not release resources in that case.
    async fn cancel_purchase(&self, id: ObjectId) -> Result<bool>;

    /// Conditional `pending -> completed`, stamping the purchase date and
    /// the gateway payment intent. Returns false when the row was no
    /// longer pending.
    async fn complete_purchase(&self, id: ObjectId, payment_intent: Option<&str>) -> Result<bool>;

    async fn promo_by_code(&self, code: &str) -> Result<Option<PromoCode>>;

    /// Mark a promo code used by `user_id`. Conditional on `used: false`
    /// so a raced double consumption is a no-op; returns the code document
    /// when this call was the one that consumed it.
    async fn consume_promo(&self, code: &str, user_id: &str) -> Result<Option<PromoCode>>;

    async fn insert_donation(&self, donation: &Donation) -> Result<()>;
    async fn donation_by_id(&self, id: ObjectId) -> Result<Option<Donation>>;
    async fn donation_by_subscription(&self, subscription_id: &str) -> Result<Option<Donation>>;
    async fn update_donation(&self, id: ObjectId, update: DonationUpdate) -> Result<()>;

    async fn ledger_row_exists(&self, payment_intent_id: &str) -> Result<bool>;
    async fn insert_ledger_row(&self, row: DonationTransaction) -> Result<()>;
}

pub struct MongoPaymentStore {
    db: Database,
}

impl MongoPaymentStore {
    pub fn new(db: &Database) -> Self {
        Self { db: db.clone() }
    }

    fn offerings(&self) -> Collection<Offering> {
        self.db.collection("offerings")
    }

    fn purchases(&self) -> Collection<Purchase> {
        self.db.collection("purchases")
    }

    fn promo_codes(&self) -> Collection<PromoCode> {
        self.db.collection("promo_codes")
    }

    fn donations(&self) -> Collection<Donation> {
        self.db.collection("donations")
    }

    fn transactions(&self) -> Collection<DonationTransaction> {
        self.db.collection("donation_transactions")
    }
}

fn purchase_status_str(status: PurchaseStatus) -> &'static str {
    match status {
        PurchaseStatus::Pending => "pending",
        PurchaseStatus::Completed => "completed",
        PurchaseStatus::Failed => "failed",
        PurchaseStatus::Cancelled => "cancelled",
        PurchaseStatus::Refunded => "refunded",
    }
}

fn donation_status_str(status: DonationStatus) -> &'static str {
    match status {
        DonationStatus::Pending => "pending",
        DonationStatus::Active => "active",
        DonationStatus::Completed => "completed",
        DonationStatus::Failed => "failed",
        DonationStatus::OnHold => "on_hold",
        DonationStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl PaymentStore for MongoPaymentStore {
    async fn offering_by_id(&self, id: ObjectId) -> Result<Option<Offering>> {
        Ok(self.offerings().find_one(doc! { "_id": id }).await?)
    }

    async fn purchase_for_user(&self, id: ObjectId, user_id: &str) -> Result<Option<Purchase>> {
        Ok(self
            .purchases()
            .find_one(doc! { "_id": id, "user_id": user_id })
            .await?)
    }

    async fn purchase_by_session(&self, session_id: &str) -> Result<Option<Purchase>> {
        Ok(self
            .purchases()
            .find_one(doc! { "gateway_session_id": session_id })
            .await?)
    }

    async fn purchase_by_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Purchase>> {
        Ok(self
            .purchases()
            .find_one(doc! { "gateway_session_id": session_id, "user_id": user_id })
            .await?)
    }

    async fn purchase_by_status(
        &self,
        user_id: &str,
        offering_id: &ObjectId,
        status: PurchaseStatus,
    ) -> Result<Option<Purchase>> {
        Ok(self
            .purchases()
            .find_one(doc! {
                "user_id": user_id,
                "offering_id": offering_id,
                "status": purchase_status_str(status),
            })
            .await?)
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> Result<()> {
        self.purchases().insert_one(purchase).await?;
        Ok(())
    }

    async fn delete_purchase(&self, id: ObjectId) -> Result<()> {
        self.purchases().delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    async fn set_purchase_session(&self, id: ObjectId, session_id: &str) -> Result<()> {
        self.purchases()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "gateway_session_id": session_id } },
            )
            .await?;
        Ok(())
    }

    async fn cancel_purchase(&self, id: ObjectId) -> Result<bool> {
        let result = self
            .purchases()
            .update_one(
                doc! { "_id": id, "status": "pending" },
                doc! { "$set": { "status": "cancelled" } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn complete_purchase(&self, id: ObjectId, payment_intent: Option<&str>) -> Result<bool> {
        let mut set = doc! {
            "status": "completed",
            "purchase_date": bson::DateTime::now(),
        };
        if let Some(pi) = payment_intent {
            set.insert("gateway_payment_intent_id", pi);
        }
        let result = self
            .purchases()
            .update_one(doc! { "_id": id, "status": "pending" }, doc! { "$set": set })
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn promo_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        Ok(self.promo_codes().find_one(doc! { "code": code }).await?)
    }

    async fn consume_promo(&self, code: &str, user_id: &str) -> Result<Option<PromoCode>> {
        let consumed = self
            .promo_codes()
            .find_one_and_update(
                doc! { "code": code, "used": false },
                doc! { "$set": {
                    "used": true,
                    "used_by": user_id,
                    "used_at": bson::DateTime::now(),
                } },
            )
            .await?;

        if consumed.is_none() {
            warn!("Promo code {} was already consumed", code);
        }
        Ok(consumed)
    }

    async fn insert_donation(&self, donation: &Donation) -> Result<()> {
        self.donations().insert_one(donation).await?;
        Ok(())
    }

    async fn donation_by_id(&self, id: ObjectId) -> Result<Option<Donation>> {
        Ok(self.donations().find_one(doc! { "_id": id }).await?)
    }

    async fn donation_by_subscription(&self, subscription_id: &str) -> Result<Option<Donation>> {
        Ok(self
            .donations()
            .find_one(doc! { "gateway_subscription_id": subscription_id })
            .await?)
    }

    async fn update_donation(&self, id: ObjectId, update: DonationUpdate) -> Result<()> {
        let mut set = doc! {};
        if let Some(status) = update.status {
            set.insert("status", donation_status_str(status));
        }
        if let Some(customer) = update.gateway_customer_id {
            set.insert("gateway_customer_id", customer);
        }
        if let Some(subscription) = update.gateway_subscription_id {
            set.insert("gateway_subscription_id", subscription);
        }
        if let Some(last_gift) = update.last_gift_date {
            set.insert("last_gift_date", last_gift);
        }
        if let Some(next_payment) = update.next_payment_date {
            set.insert("next_payment_date", next_payment);
        }
        if set.is_empty() {
            return Ok(());
        }
        self.donations()
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await?;
        Ok(())
    }

    async fn ledger_row_exists(&self, payment_intent_id: &str) -> Result<bool> {
        Ok(self
            .transactions()
            .find_one(doc! { "gateway_payment_intent_id": payment_intent_id })
            .await?
            .is_some())
    }

    async fn insert_ledger_row(&self, row: DonationTransaction) -> Result<()> {
        self.transactions().insert_one(&row).await?;
        Ok(())
    }
}

/// Same contract over hash maps, for exercising the transition logic in
/// tests.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryPaymentStore {
    pub offerings: tokio::sync::Mutex<std::collections::HashMap<ObjectId, Offering>>,
    pub purchases: tokio::sync::Mutex<std::collections::HashMap<ObjectId, Purchase>>,
    pub promo_codes: tokio::sync::Mutex<std::collections::HashMap<String, PromoCode>>,
    pub donations: tokio::sync::Mutex<std::collections::HashMap<ObjectId, Donation>>,
    pub ledger: tokio::sync::Mutex<Vec<DonationTransaction>>,
}

#[cfg(test)]
#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn offering_by_id(&self, id: ObjectId) -> Result<Option<Offering>> {
        Ok(self.offerings.lock().await.get(&id).cloned())
    }

    async fn purchase_for_user(&self, id: ObjectId, user_id: &str) -> Result<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .await
            .get(&id)
            .filter(|p| p.user_id == user_id)
            .cloned())
    }

    async fn purchase_by_session(&self, session_id: &str) -> Result<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .await
            .values()
            .find(|p| p.gateway_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn purchase_by_session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .await
            .values()
            .find(|p| {
                p.gateway_session_id.as_deref() == Some(session_id) && p.user_id == user_id
            })
            .cloned())
    }

    async fn purchase_by_status(
        &self,
        user_id: &str,
        offering_id: &ObjectId,
        status: PurchaseStatus,
    ) -> Result<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .await
            .values()
            .find(|p| {
                p.user_id == user_id && p.offering_id == *offering_id && p.status == status
            })
            .cloned())
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> Result<()> {
        let id = purchase.id.unwrap_or_else(ObjectId::new);
        self.purchases.lock().await.insert(id, purchase.clone());
        Ok(())
    }

    async fn delete_purchase(&self, id: ObjectId) -> Result<()> {
        self.purchases.lock().await.remove(&id);
        Ok(())
    }

    async fn set_purchase_session(&self, id: ObjectId, session_id: &str) -> Result<()> {
        if let Some(p) = self.purchases.lock().await.get_mut(&id) {
            p.gateway_session_id = Some(session_id.to_string());
        }
        Ok(())
    }

    async fn cancel_purchase(&self, id: ObjectId) -> Result<bool> {
        let mut purchases = self.purchases.lock().await;
        match purchases.get_mut(&id) {
            Some(p) if p.status == PurchaseStatus::Pending => {
                p.status = PurchaseStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_purchase(&self, id: ObjectId, payment_intent: Option<&str>) -> Result<bool> {
        let mut purchases = self.purchases.lock().await;
        match purchases.get_mut(&id) {
            Some(p) if p.status == PurchaseStatus::Pending => {
                p.status = PurchaseStatus::Completed;
                p.purchase_date = Some(bson::DateTime::now());
                if let Some(pi) = payment_intent {
                    p.gateway_payment_intent_id = Some(pi.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn promo_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        Ok(self.promo_codes.lock().await.get(code).cloned())
    }

    async fn consume_promo(&self, code: &str, user_id: &str) -> Result<Option<PromoCode>> {
        let mut codes = self.promo_codes.lock().await;
        match codes.get_mut(code) {
            Some(promo) if !promo.used => {
                promo.used = true;
                promo.used_by = Some(user_id.to_string());
                promo.used_at = Some(bson::DateTime::now());
                Ok(Some(promo.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_donation(&self, donation: &Donation) -> Result<()> {
        let id = donation.id.unwrap_or_else(ObjectId::new);
        self.donations.lock().await.insert(id, donation.clone());
        Ok(())
    }

    async fn donation_by_id(&self, id: ObjectId) -> Result<Option<Donation>> {
        Ok(self.donations.lock().await.get(&id).cloned())
    }

    async fn donation_by_subscription(&self, subscription_id: &str) -> Result<Option<Donation>> {
        Ok(self
            .donations
            .lock()
            .await
            .values()
            .find(|d| d.gateway_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn update_donation(&self, id: ObjectId, update: DonationUpdate) -> Result<()> {
        let mut donations = self.donations.lock().await;
        if let Some(d) = donations.get_mut(&id) {
            if let Some(status) = update.status {
                d.status = status;
            }
            if let Some(customer) = update.gateway_customer_id {
                d.gateway_customer_id = Some(customer);
            }
            if let Some(subscription) = update.gateway_subscription_id {
                d.gateway_subscription_id = Some(subscription);
            }
            if let Some(last_gift) = update.last_gift_date {
                d.last_gift_date = Some(last_gift);
            }
            if let Some(next_payment) = update.next_payment_date {
                d.next_payment_date = Some(next_payment);
            }
        }
        Ok(())
    }

    async fn ledger_row_exists(&self, payment_intent_id: &str) -> Result<bool> {
        Ok(self
            .ledger
            .lock()
            .await
            .iter()
            .any(|row| row.gateway_payment_intent_id.as_deref() == Some(payment_intent_id)))
    }

    async fn insert_ledger_row(&self, row: DonationTransaction) -> Result<()> {
        self.ledger.lock().await.push(row);
        Ok(())
    }
}
