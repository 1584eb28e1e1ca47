// services/checkout_service.rs
//
// Checkout creation protocol. One attempt per (user, offering) runs at a
// time: pre-lock validation, keyed lock, supersede of the stale pending
// attempt, slot reservation, pricing, then either local zero-cost
// completion or a gateway session plus a pending row.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::{self, oid::ObjectId};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{info, warn};

use crate::dtos::checkout_dtos::{CheckoutResponse, CreateCheckoutRequest, CreateDonationRequest};
use crate::errors::{AppError, Result};
use crate::models::donation::{Donation, DonationStatus, DonationType};
use crate::models::offering::Offering;
use crate::models::promo_code::{PromoCode, PromoCodeType};
use crate::models::purchase::{BillingSnapshot, Purchase, PurchaseStatus};
use crate::models::user::Claims;
use crate::services::capacity::CapacityStore;
use crate::services::gateway_service::{PaymentGateway, SessionMode};
use crate::services::keyed_lock::{DistributedLock, KeyedLock};
use crate::services::notifier::{enqueue, NotificationJob, NotificationSender};
use crate::services::pricing::{self, Quote, MINIMUM_CHARGE_MINOR};
use crate::services::store::PaymentStore;

/// Long enough to cover a gateway round trip inside the lock.
pub const CHECKOUT_LOCK_TIMEOUT_MS: u64 = 10_000;

pub struct CheckoutService {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: Arc<KeyedLock>,
    /// Optional cross-instance lock taken inside the local one. The local
    /// lock alone is correct for a single instance; the capacity counter
    /// stays correct either way.
    shared_lock: Option<Arc<dyn DistributedLock>>,
    capacity: Arc<dyn CapacityStore>,
    notifier: NotificationSender,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: Arc<KeyedLock>,
        shared_lock: Option<Arc<dyn DistributedLock>>,
        capacity: Arc<dyn CapacityStore>,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            shared_lock,
            capacity,
            notifier,
        }
    }

    pub async fn create_checkout(
        &self,
        claims: &Claims,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutResponse> {
        let offering_id = ObjectId::parse_str(&request.offering_id)?;

        // Step 1: read-only validation, no lock yet.
        let offering = self
            .store
            .offering_by_id(offering_id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;
        if offering.full_price <= 0 {
            return Err(AppError::invalid_data("offering is free, nothing to purchase"));
        }

        let promo = match &request.promo_code {
            Some(code) => Some(self.resolve_promo(code, &claims.sub, &offering_id).await?),
            None => None,
        };

        if self
            .store
            .purchase_by_status(&claims.sub, &offering_id, PurchaseStatus::Completed)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyPurchased);
        }

        // Step 2: serialize attempts per (user, offering).
        let key = format!("purchase:{}:{}", claims.sub, offering_id.to_hex());
        self.locks
            .with_lock(&key, CHECKOUT_LOCK_TIMEOUT_MS, || {
                self.create_checkout_locked(
                    &key,
                    claims,
                    &offering,
                    promo,
                    request.limited_slot_requested,
                )
            })
            .await
    }

    async fn create_checkout_locked(
        &self,
        key: &str,
        claims: &Claims,
        offering: &Offering,
        promo: Option<PromoCode>,
        limited_slot_requested: bool,
    ) -> Result<CheckoutResponse> {
        if let Some(shared) = &self.shared_lock {
            if !shared
                .acquire(key, Duration::from_millis(CHECKOUT_LOCK_TIMEOUT_MS))
                .await?
            {
                return Err(AppError::LockTimeout(key.to_string()));
            }
            let result = self
                .create_checkout_inner(claims, offering, promo, limited_slot_requested)
                .await;
            if let Err(e) = shared.release(key).await {
                warn!("Failed to release shared lock {}: {}", key, e);
            }
            return result;
        }
        self.create_checkout_inner(claims, offering, promo, limited_slot_requested)
            .await
    }

    async fn create_checkout_inner(
        &self,
        claims: &Claims,
        offering: &Offering,
        promo: Option<PromoCode>,
        limited_slot_requested: bool,
    ) -> Result<CheckoutResponse> {
        let offering_id = offering.id.ok_or_else(|| AppError::service("offering without id"))?;

        // Step 3: supersede any stale pending attempt so this one can use
        // fresh options.
        if let Some(stale) = self
            .store
            .purchase_by_status(&claims.sub, &offering_id, PurchaseStatus::Pending)
            .await?
        {
            self.supersede_pending(&stale, &offering_id).await?;
        }

        // Step 4: reserve a limited slot before pricing.
        let mut limited_granted = false;
        let mut slot_reserved = false;
        if limited_slot_requested {
            if offering.limited_slot_discount.unwrap_or(0) <= 0 {
                return Err(AppError::invalid_data(
                    "offering has no limited-slot discount",
                ));
            }
            if let Some(limit) = offering.limited_slot_limit.filter(|l| *l > 0) {
                if !self.capacity.try_reserve_slot(&offering_id, limit).await? {
                    return Err(AppError::CapacityExhausted);
                }
                slot_reserved = true;
            }
            limited_granted = true;
        }

        // Step 5: pricing.
        let quote = pricing::quote(offering, limited_granted, promo.as_ref(), Utc::now());

        // Step 6: zero-cost purchases never touch the gateway.
        if quote.is_free() {
            return self
                .complete_free_purchase(claims, offering, &offering_id, quote, promo, slot_reserved)
                .await;
        }

        // Step 7: paid path.
        if quote.is_below_minimum() {
            return Err(AppError::PriceBelowMinimum {
                price: quote.final_price,
                minimum: MINIMUM_CHARGE_MINOR,
            });
        }

        let purchase_id = ObjectId::new();
        let order_number = generate_order_number();
        let metadata = purchase_metadata(&purchase_id, claims, &offering_id, &order_number, &quote, promo.as_ref());

        // Session before row: a leaked session expires on its own, while a
        // row without a session would be a dead pending purchase.
        let session = self
            .gateway
            .create_checkout_session(
                SessionMode::Payment,
                quote.final_price,
                &offering.name,
                &claims.email,
                &metadata,
            )
            .await?;

        let purchase = Purchase {
            id: Some(purchase_id),
            user_id: claims.sub.clone(),
            offering_id,
            order_number,
            status: PurchaseStatus::Pending,
            full_price: quote.full_price,
            fixed_discounts: quote.fixed_discounts.clone(),
            percent_discount: quote.percent_discount,
            final_price: quote.final_price,
            is_limited_slot_holder: slot_reserved,
            is_early_bird: quote.is_early_bird,
            promo_code: promo.as_ref().map(|p| p.code.clone()),
            gateway_session_id: Some(session.id.clone()),
            gateway_payment_intent_id: None,
            billing_snapshot: BillingSnapshot {
                name: claims.name.clone(),
                email: claims.email.clone(),
            },
            created_at: Utc::now(),
            purchase_date: None,
        };

        if let Err(e) = self.store.insert_purchase(&purchase).await {
            warn!(
                "Pending purchase persist failed after session {} was opened; session will lapse on its own: {}",
                session.id, e
            );
            return Err(e);
        }

        info!(
            "Pending purchase {} created for user {} (session {})",
            purchase_id.to_hex(),
            claims.sub,
            session.id
        );

        Ok(CheckoutResponse::Session {
            session_id: session.id,
            session_url: session.url.unwrap_or_default(),
        })
    }

    async fn complete_free_purchase(
        &self,
        claims: &Claims,
        offering: &Offering,
        offering_id: &ObjectId,
        quote: Quote,
        promo: Option<PromoCode>,
        slot_reserved: bool,
    ) -> Result<CheckoutResponse> {
        let purchase_id = ObjectId::new();
        let order_number = generate_order_number();

        let purchase = Purchase {
            id: Some(purchase_id),
            user_id: claims.sub.clone(),
            offering_id: *offering_id,
            order_number: order_number.clone(),
            status: PurchaseStatus::Completed,
            full_price: quote.full_price,
            fixed_discounts: quote.fixed_discounts,
            percent_discount: quote.percent_discount,
            final_price: 0,
            is_limited_slot_holder: slot_reserved,
            is_early_bird: quote.is_early_bird,
            promo_code: promo.as_ref().map(|p| p.code.clone()),
            gateway_session_id: None,
            gateway_payment_intent_id: None,
            billing_snapshot: BillingSnapshot {
                name: claims.name.clone(),
                email: claims.email.clone(),
            },
            created_at: Utc::now(),
            purchase_date: Some(bson::DateTime::now()),
        };
        self.store.insert_purchase(&purchase).await?;

        if let Some(code) = &promo {
            self.store.consume_promo(&code.code, &claims.sub).await?;
            if code.is_general() {
                enqueue(
                    &self.notifier,
                    NotificationJob::SharedPromoUsed {
                        code: code.code.clone(),
                        user_id: claims.sub.clone(),
                        offering_name: offering.name.clone(),
                    },
                );
            }
        }

        enqueue(
            &self.notifier,
            NotificationJob::PurchaseReceipt {
                user_id: claims.sub.clone(),
                email: claims.email.clone(),
                order_number: order_number.clone(),
                amount: 0,
            },
        );

        info!(
            "Zero-cost purchase {} completed for user {}",
            order_number, claims.sub
        );

        Ok(CheckoutResponse::Completed {
            completed_order_id: purchase_id.to_hex(),
            order_number,
        })
    }

    /// Expire-and-delete a stale pending attempt. A held slot is released
    /// so the fresh attempt can re-reserve it without double counting.
    async fn supersede_pending(&self, stale: &Purchase, offering_id: &ObjectId) -> Result<()> {
        if let Some(session_id) = &stale.gateway_session_id {
            if let Err(e) = self.gateway.expire_session(session_id).await {
                warn!(
                    "Could not expire superseded session {} (it will lapse on its own): {}",
                    session_id, e
                );
            }
        }
        if stale.is_limited_slot_holder {
            self.capacity.release_slot(offering_id).await?;
        }
        if let Some(id) = stale.id {
            self.store.delete_purchase(id).await?;
            info!("Superseded stale pending purchase {}", id.to_hex());
        }
        Ok(())
    }

    /// `GET /checkout/verify/:session_id` — 404 until the webhook lands.
    pub async fn verify_session(&self, user_id: &str, session_id: &str) -> Result<Purchase> {
        self.store
            .purchase_by_session_for_user(session_id, user_id)
            .await?
            .ok_or(AppError::DocumentNotFound)
    }

    /// Re-open a gateway session for an existing pending purchase.
    pub async fn retry(&self, claims: &Claims, purchase_id: &str) -> Result<CheckoutResponse> {
        let id = ObjectId::parse_str(purchase_id)?;
        let purchase = self
            .store
            .purchase_for_user(id, &claims.sub)
            .await?
            .ok_or(AppError::DocumentNotFound)?;

        if purchase.status != PurchaseStatus::Pending {
            return Err(AppError::invalid_data("only pending purchases can be retried"));
        }
        if self
            .store
            .purchase_by_status(&claims.sub, &purchase.offering_id, PurchaseStatus::Completed)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyPurchased);
        }

        let offering = self
            .store
            .offering_by_id(purchase.offering_id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;

        if let Some(old_session) = &purchase.gateway_session_id {
            if let Err(e) = self.gateway.expire_session(old_session).await {
                warn!("Could not expire session {} before retry: {}", old_session, e);
            }
        }

        let metadata = vec![
            ("kind".to_string(), "purchase".to_string()),
            ("purchase_id".to_string(), id.to_hex()),
            ("user_id".to_string(), claims.sub.clone()),
            ("offering_id".to_string(), purchase.offering_id.to_hex()),
            ("order_number".to_string(), purchase.order_number.clone()),
        ];
        let session = self
            .gateway
            .create_checkout_session(
                SessionMode::Payment,
                purchase.final_price,
                &offering.name,
                &claims.email,
                &metadata,
            )
            .await?;

        self.store.set_purchase_session(id, &session.id).await?;

        Ok(CheckoutResponse::Session {
            session_id: session.id,
            session_url: session.url.unwrap_or_default(),
        })
    }

    /// Cancel a pending purchase, releasing a held slot exactly once.
    pub async fn cancel(&self, claims: &Claims, purchase_id: &str) -> Result<Purchase> {
        let id = ObjectId::parse_str(purchase_id)?;
        let purchase = self
            .store
            .purchase_for_user(id, &claims.sub)
            .await?
            .ok_or(AppError::DocumentNotFound)?;

        if purchase.status != PurchaseStatus::Pending {
            return Err(AppError::invalid_data("only pending purchases can be cancelled"));
        }

        // Conditional transition is the exactly-once gate for the slot
        // release under concurrent cancels.
        if !self.store.cancel_purchase(id).await? {
            return Err(AppError::invalid_data("purchase is no longer pending"));
        }

        if purchase.is_limited_slot_holder {
            self.capacity.release_slot(&purchase.offering_id).await?;
        }

        if let Some(session_id) = &purchase.gateway_session_id {
            if let Err(e) = self.gateway.expire_session(session_id).await {
                warn!(
                    "Could not expire session {} of cancelled purchase (it will lapse on its own): {}",
                    session_id, e
                );
            }
        }

        info!("Purchase {} cancelled by user {}", id.to_hex(), claims.sub);

        self.store
            .purchase_for_user(id, &claims.sub)
            .await?
            .ok_or(AppError::DocumentNotFound)
    }

    /// Open a gateway session for a one-time or recurring donation. No
    /// lock or capacity involved; all state changes after this come from
    /// the webhook reconciler.
    pub async fn create_donation_checkout(
        &self,
        claims: &Claims,
        request: CreateDonationRequest,
    ) -> Result<CheckoutResponse> {
        if request.amount < MINIMUM_CHARGE_MINOR {
            return Err(AppError::PriceBelowMinimum {
                price: request.amount,
                minimum: MINIMUM_CHARGE_MINOR,
            });
        }

        let donation_id = ObjectId::new();
        let mode = match request.donation_type {
            DonationType::OneTime => SessionMode::Payment,
            DonationType::Monthly => SessionMode::Subscription,
        };
        let metadata = vec![
            ("kind".to_string(), "donation".to_string()),
            ("donation_id".to_string(), donation_id.to_hex()),
            ("user_id".to_string(), claims.sub.clone()),
        ];

        let product_name = match request.donation_type {
            DonationType::OneTime => "One-time gift",
            DonationType::Monthly => "Monthly gift",
        };
        let session = self
            .gateway
            .create_checkout_session(mode, request.amount, product_name, &claims.email, &metadata)
            .await?;

        let donation = Donation {
            id: Some(donation_id),
            user_id: claims.sub.clone(),
            amount: request.amount,
            donation_type: request.donation_type,
            status: DonationStatus::Pending,
            gateway_customer_id: None,
            gateway_subscription_id: None,
            last_gift_date: None,
            next_payment_date: None,
            end_date: request
                .end_date
                .map(|secs| bson::DateTime::from_millis(secs * 1000)),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_donation(&donation).await {
            warn!(
                "Pending donation persist failed after session {} was opened; session will lapse on its own: {}",
                session.id, e
            );
            return Err(e);
        }

        Ok(CheckoutResponse::Session {
            session_id: session.id,
            session_url: session.url.unwrap_or_default(),
        })
    }

    async fn resolve_promo(
        &self,
        code: &str,
        user_id: &str,
        offering_id: &ObjectId,
    ) -> Result<PromoCode> {
        let promo = self
            .store
            .promo_by_code(code)
            .await?
            .ok_or_else(|| AppError::promo("unknown code"))?;

        if promo.used {
            return Err(AppError::promo("code already used"));
        }
        if let Some(owner) = &promo.owner_user_id {
            if owner != user_id {
                return Err(AppError::promo("code belongs to another account"));
            }
        }
        // Staff codes carry an explicit allow-list; a staff code without
        // one is misconfigured and never applies.
        if promo.code_type == PromoCodeType::PercentStaff && promo.eligible_offering_ids.is_none() {
            return Err(AppError::promo("code has no eligible offerings"));
        }
        if !promo.applies_to(offering_id) {
            return Err(AppError::promo("code does not apply to this offering"));
        }

        Ok(promo)
    }
}

fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_uppercase();
    format!("KN-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

fn purchase_metadata(
    purchase_id: &ObjectId,
    claims: &Claims,
    offering_id: &ObjectId,
    order_number: &str,
    quote: &Quote,
    promo: Option<&PromoCode>,
) -> Vec<(String, String)> {
    let breakdown = serde_json::json!({
        "fixed": quote.fixed_discounts,
        "percent": quote.percent_discount,
        "full_price": quote.full_price,
    });

    let mut metadata = vec![
        ("kind".to_string(), "purchase".to_string()),
        ("purchase_id".to_string(), purchase_id.to_hex()),
        ("user_id".to_string(), claims.sub.clone()),
        ("offering_id".to_string(), offering_id.to_hex()),
        ("order_number".to_string(), order_number.to_string()),
        ("breakdown".to_string(), breakdown.to_string()),
    ];
    if let Some(code) = promo {
        metadata.push(("promo_code".to_string(), code.code.clone()));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::capacity::InMemoryCapacityStore;
    use crate::services::gateway_service::FakeGateway;
    use crate::services::store::InMemoryPaymentStore;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    fn claims() -> Claims {
        Claims {
            sub: "u1".to_string(),
            name: "Ana".to_string(),
            email: "ana@example.org".to_string(),
            exp: 0,
        }
    }

    fn offering(id: ObjectId, full_price: i64) -> Offering {
        Offering {
            id: Some(id),
            name: "Discipleship Intensive".to_string(),
            full_price,
            limited_slot_limit: None,
            limited_slot_discount: None,
            limited_slot_count: 0,
            early_bird_deadline: None,
            early_bird_discount: None,
            created_at: Utc::now(),
        }
    }

    fn service(
        store: Arc<InMemoryPaymentStore>,
        gateway: Arc<FakeGateway>,
        capacity: Arc<InMemoryCapacityStore>,
    ) -> CheckoutService {
        let (tx, _rx) = mpsc::channel(64);
        CheckoutService::new(
            store,
            gateway,
            Arc::new(KeyedLock::new()),
            None,
            capacity,
            tx,
        )
    }

    fn checkout_request(offering_id: &ObjectId, limited: bool) -> CreateCheckoutRequest {
        CreateCheckoutRequest {
            offering_id: offering_id.to_hex(),
            limited_slot_requested: limited,
            promo_code: None,
        }
    }

    #[test]
    fn order_numbers_have_date_and_suffix() {
        let n = generate_order_number();
        let parts: Vec<&str> = n.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "KN");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert_ne!(generate_order_number(), n);
    }

    #[tokio::test]
    async fn concurrent_attempts_converge_to_one_pending_row() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let gateway = Arc::new(FakeGateway::default());
        let offering_id = ObjectId::new();
        store
            .offerings
            .lock()
            .await
            .insert(offering_id, offering(offering_id, 10_000));

        let svc = Arc::new(service(
            store.clone(),
            gateway.clone(),
            Arc::new(InMemoryCapacityStore::default()),
        ));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.create_checkout(&claims(), checkout_request(&offering_id, false))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let purchases = store.purchases.lock().await;
        let pending = purchases
            .values()
            .filter(|p| p.status == PurchaseStatus::Pending)
            .count();
        assert_eq!(pending, 1);
        assert_eq!(purchases.len(), 1);
        // every earlier attempt's session was expired on supersede
        assert_eq!(gateway.sessions_opened.load(Ordering::SeqCst), 6);
        assert_eq!(gateway.expired_sessions.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn covering_promo_completes_without_gateway() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let gateway = Arc::new(FakeGateway::default());
        let offering_id = ObjectId::new();
        store
            .offerings
            .lock()
            .await
            .insert(offering_id, offering(offering_id, 5_000));
        store.promo_codes.lock().await.insert(
            "BUNDLE".to_string(),
            PromoCode {
                id: None,
                code: "BUNDLE".to_string(),
                code_type: PromoCodeType::FixedBundle,
                discount_amount: Some(5_000),
                discount_percent: None,
                owner_user_id: Some("u1".to_string()),
                eligible_offering_ids: None,
                used: false,
                used_by: None,
                used_at: None,
                created_at: Utc::now(),
            },
        );

        let svc = service(
            store.clone(),
            gateway.clone(),
            Arc::new(InMemoryCapacityStore::default()),
        );

        let response = svc
            .create_checkout(
                &claims(),
                CreateCheckoutRequest {
                    offering_id: offering_id.to_hex(),
                    limited_slot_requested: false,
                    promo_code: Some("BUNDLE".to_string()),
                },
            )
            .await
            .unwrap();

        assert!(matches!(response, CheckoutResponse::Completed { .. }));
        assert_eq!(gateway.sessions_opened.load(Ordering::SeqCst), 0);
        let purchases = store.purchases.lock().await;
        let row = purchases.values().next().unwrap();
        assert_eq!(row.status, PurchaseStatus::Completed);
        assert_eq!(row.final_price, 0);
        assert!(store.promo_codes.lock().await.get("BUNDLE").unwrap().used);
    }

    #[tokio::test]
    async fn cancel_releases_slot_exactly_once() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let gateway = Arc::new(FakeGateway::default());
        let capacity = Arc::new(InMemoryCapacityStore::default());
        let offering_id = ObjectId::new();
        let mut off = offering(offering_id, 10_000);
        off.limited_slot_limit = Some(5);
        off.limited_slot_discount = Some(2_000);
        store.offerings.lock().await.insert(offering_id, off);

        let svc = service(store.clone(), gateway.clone(), capacity.clone());

        svc.create_checkout(&claims(), checkout_request(&offering_id, true))
            .await
            .unwrap();
        assert_eq!(*capacity.counts.lock().await.get(&offering_id).unwrap(), 1);

        let id = *store.purchases.lock().await.keys().next().unwrap();
        let cancelled = svc.cancel(&claims(), &id.to_hex()).await.unwrap();
        assert_eq!(cancelled.status, PurchaseStatus::Cancelled);
        assert_eq!(*capacity.counts.lock().await.get(&offering_id).unwrap(), 0);

        // second cancel is rejected and must not release again
        assert!(svc.cancel(&claims(), &id.to_hex()).await.is_err());
        assert_eq!(*capacity.counts.lock().await.get(&offering_id).unwrap(), 0);
    }
}
