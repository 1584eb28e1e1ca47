// services/reconciler.rs
//
// Consumes gateway webhook events and advances Purchase/Donation state.
// Delivery is at-least-once and unordered, so every handler is idempotent:
// ledger writes are keyed on the gateway payment-intent id, and status
// transitions only fire from the pending state. Notification jobs are
// queued and never influence the handler outcome; a state-mutation error
// propagates so the gateway redelivers.
use std::sync::Arc;

use chrono::Utc;
use mongodb::bson::{self, oid::ObjectId};
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};
use crate::models::donation::DonationStatus;
use crate::models::donation_transaction::{DonationTransaction, PaymentMethodInfo, TransactionStatus};
use crate::models::gateway_event::{
    CardDetails, CheckoutSessionObject, GatewayEvent, InvoiceObject, SubscriptionObject,
    EVENT_CHECKOUT_SESSION_COMPLETED, EVENT_INVOICE_PAYMENT_FAILED,
    EVENT_INVOICE_PAYMENT_SUCCEEDED, EVENT_SUBSCRIPTION_DELETED, EVENT_SUBSCRIPTION_UPDATED,
};
use crate::models::purchase::PurchaseStatus;
use crate::services::gateway_service::PaymentGateway;
use crate::services::notifier::{enqueue, NotificationJob, NotificationSender};
use crate::services::store::{DonationUpdate, PaymentStore};

pub struct WebhookReconciler {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: NotificationSender,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
        }
    }

    pub async fn process(&self, event: &GatewayEvent) -> Result<()> {
        info!("Processing gateway event {} ({})", event.id, event.event_type);
        match event.event_type.as_str() {
            EVENT_CHECKOUT_SESSION_COMPLETED => {
                self.on_checkout_session_completed(event.object_as()?).await
            }
            EVENT_INVOICE_PAYMENT_SUCCEEDED => {
                self.on_invoice_payment_succeeded(event.object_as()?).await
            }
            EVENT_INVOICE_PAYMENT_FAILED => self.on_invoice_payment_failed(event.object_as()?).await,
            EVENT_SUBSCRIPTION_UPDATED => self.on_subscription_updated(event.object_as()?).await,
            EVENT_SUBSCRIPTION_DELETED => self.on_subscription_deleted(event.object_as()?).await,
            other => {
                debug!("Ignoring gateway event type {}", other);
                Ok(())
            }
        }
    }

    async fn on_checkout_session_completed(&self, session: CheckoutSessionObject) -> Result<()> {
        match session.metadata.get("kind").map(String::as_str) {
            Some("donation") => self.complete_donation_session(session).await,
            _ => self.complete_purchase_session(session).await,
        }
    }

    async fn complete_purchase_session(&self, session: CheckoutSessionObject) -> Result<()> {
        let purchase = match self.store.purchase_by_session(&session.id).await? {
            Some(p) => p,
            None => {
                // Session with no local row: either it leaked before the
                // pending row persisted or the row was superseded. Nothing
                // to reconcile.
                warn!("No purchase found for completed session {}", session.id);
                return Ok(());
            }
        };

        match purchase.status {
            PurchaseStatus::Pending => {}
            PurchaseStatus::Completed => {
                debug!("Purchase {} already completed, duplicate delivery", session.id);
                return Ok(());
            }
            other => {
                // Cancelled is terminal; the payment landed on a session
                // that outlived its row (expire is best-effort). Needs a
                // refund, not a resurrection.
                warn!(
                    "Payment received for purchase {} in state {:?}; leaving it untouched",
                    purchase.order_number, other
                );
                return Ok(());
            }
        }

        let ledger_written = match &session.payment_intent {
            Some(pi) if self.store.ledger_row_exists(pi).await? => false,
            _ => {
                self.store
                    .insert_ledger_row(DonationTransaction {
                        id: None,
                        donation_id: None,
                        user_id: purchase.user_id.clone(),
                        amount: purchase.final_price,
                        transaction_type: "purchase".to_string(),
                        status: TransactionStatus::Completed,
                        gateway_payment_intent_id: session.payment_intent.clone(),
                        failure_reason: None,
                        payment_method: payment_method_info(session.payment_method_details.as_ref()),
                        gift_date: Utc::now(),
                    })
                    .await?;
                true
            }
        };

        let purchase_id = purchase
            .id
            .ok_or_else(|| AppError::service("purchase without id"))?;
        if !self
            .store
            .complete_purchase(purchase_id, session.payment_intent.as_deref())
            .await?
        {
            warn!(
                "Purchase {} left the pending state mid-reconcile, completion skipped",
                purchase.order_number
            );
            return Ok(());
        }

        // Paid purchases consume their promo code only once payment is
        // confirmed.
        if let Some(code) = &purchase.promo_code {
            if let Some(consumed) = self.store.consume_promo(code, &purchase.user_id).await? {
                if consumed.is_general() {
                    enqueue(
                        &self.notifier,
                        NotificationJob::SharedPromoUsed {
                            code: consumed.code.clone(),
                            user_id: purchase.user_id.clone(),
                            offering_name: purchase.offering_id.to_hex(),
                        },
                    );
                }
            }
        }

        enqueue(
            &self.notifier,
            NotificationJob::PurchaseReceipt {
                user_id: purchase.user_id.clone(),
                email: purchase.billing_snapshot.email.clone(),
                order_number: purchase.order_number.clone(),
                amount: purchase.final_price,
            },
        );

        info!(
            "Purchase {} completed via session {} (ledger written: {})",
            purchase.order_number, session.id, ledger_written
        );
        Ok(())
    }

    async fn complete_donation_session(&self, session: CheckoutSessionObject) -> Result<()> {
        let donation_id = session
            .metadata
            .get("donation_id")
            .ok_or_else(|| AppError::invalid_data("donation session without donation_id"))?;
        let donation_id = ObjectId::parse_str(donation_id)?;
        let donation = self
            .store
            .donation_by_id(donation_id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;

        if session.mode == "subscription" {
            let subscription_id = session
                .subscription
                .as_deref()
                .ok_or_else(|| AppError::invalid_data("subscription session without subscription"))?;

            self.store
                .update_donation(
                    donation_id,
                    DonationUpdate {
                        status: Some(DonationStatus::Active),
                        gateway_subscription_id: Some(subscription_id.to_string()),
                        gateway_customer_id: session.customer.clone(),
                        ..Default::default()
                    },
                )
                .await?;

            // The gateway emits a separate invoice.payment_succeeded for
            // the first charge; writing a ledger row here would
            // double-count it.
            if let Some(end_date) = donation.end_date {
                self.gateway
                    .cancel_subscription_at(subscription_id, end_date.timestamp_millis() / 1000)
                    .await?;
            }

            info!(
                "Donation {} activated with subscription {}",
                donation_id.to_hex(),
                subscription_id
            );
            return Ok(());
        }

        // One-time gift paid directly in the session.
        if let Some(pi) = &session.payment_intent {
            if self.store.ledger_row_exists(pi).await? {
                debug!("Duplicate delivery for one-time donation {}", donation_id.to_hex());
                return Ok(());
            }
        }

        self.store
            .insert_ledger_row(DonationTransaction {
                id: None,
                donation_id: Some(donation_id),
                user_id: donation.user_id.clone(),
                amount: donation.amount,
                transaction_type: "one_time".to_string(),
                status: TransactionStatus::Completed,
                gateway_payment_intent_id: session.payment_intent.clone(),
                failure_reason: None,
                payment_method: payment_method_info(session.payment_method_details.as_ref()),
                gift_date: Utc::now(),
            })
            .await?;

        self.store
            .update_donation(
                donation_id,
                DonationUpdate {
                    status: Some(DonationStatus::Completed),
                    last_gift_date: Some(bson::DateTime::now()),
                    gateway_customer_id: session.customer.clone(),
                    ..Default::default()
                },
            )
            .await?;

        enqueue(
            &self.notifier,
            NotificationJob::DonationReceipt {
                user_id: donation.user_id.clone(),
                amount: donation.amount,
                first_gift: donation.last_gift_date.is_none(),
            },
        );
        Ok(())
    }

    async fn on_invoice_payment_succeeded(&self, invoice: InvoiceObject) -> Result<()> {
        let subscription_id = match &invoice.subscription {
            Some(id) => id,
            None => {
                // One-time charges are settled through the checkout
                // session event, not invoices.
                debug!("Invoice {} has no subscription, nothing to reconcile", invoice.id);
                return Ok(());
            }
        };

        // A missing donation usually means this invoice outran the
        // session-completed event; failing here lets the gateway redeliver
        // after the binding lands.
        let donation = self
            .store
            .donation_by_subscription(subscription_id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;
        let donation_id = donation.id.ok_or_else(|| AppError::service("donation without id"))?;

        if let Some(pi) = &invoice.payment_intent {
            if self.store.ledger_row_exists(pi).await? {
                debug!("Duplicate invoice delivery for payment intent {}", pi);
                return Ok(());
            }
        }

        // Selects receipt wording only; correctness rests on the ledger
        // guard above.
        let first_gift = donation.last_gift_date.is_none();

        self.store
            .insert_ledger_row(DonationTransaction {
                id: None,
                donation_id: Some(donation_id),
                user_id: donation.user_id.clone(),
                amount: invoice.amount_paid,
                transaction_type: "recurring".to_string(),
                status: TransactionStatus::Completed,
                gateway_payment_intent_id: invoice.payment_intent.clone(),
                failure_reason: None,
                payment_method: payment_method_info(invoice.payment_method_details.as_ref()),
                gift_date: Utc::now(),
            })
            .await?;

        let update = DonationUpdate {
            last_gift_date: Some(bson::DateTime::now()),
            // implicit recovery: a later successful invoice reactivates
            status: (donation.status == DonationStatus::Failed).then_some(DonationStatus::Active),
            ..Default::default()
        };
        self.store.update_donation(donation_id, update).await?;

        enqueue(
            &self.notifier,
            NotificationJob::DonationReceipt {
                user_id: donation.user_id.clone(),
                amount: invoice.amount_paid,
                first_gift,
            },
        );

        info!(
            "Recorded recurring gift of {} for donation {}",
            invoice.amount_paid,
            donation_id.to_hex()
        );
        Ok(())
    }

    async fn on_invoice_payment_failed(&self, invoice: InvoiceObject) -> Result<()> {
        let subscription_id = match &invoice.subscription {
            Some(id) => id,
            None => {
                debug!("Failed invoice {} has no subscription", invoice.id);
                return Ok(());
            }
        };

        let donation = self
            .store
            .donation_by_subscription(subscription_id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;
        let donation_id = donation.id.ok_or_else(|| AppError::service("donation without id"))?;

        self.store
            .update_donation(
                donation_id,
                DonationUpdate {
                    status: Some(DonationStatus::Failed),
                    ..Default::default()
                },
            )
            .await?;

        let reason = failure_reason(&invoice);

        // Without a payment intent there is nothing to deduplicate
        // against, so the transition happens but no ledger row is written.
        if let Some(pi) = &invoice.payment_intent {
            if !self.store.ledger_row_exists(pi).await? {
                self.store
                    .insert_ledger_row(DonationTransaction {
                        id: None,
                        donation_id: Some(donation_id),
                        user_id: donation.user_id.clone(),
                        amount: invoice.amount_due,
                        transaction_type: "recurring".to_string(),
                        status: TransactionStatus::Failed,
                        gateway_payment_intent_id: Some(pi.clone()),
                        failure_reason: Some(reason.clone()),
                        payment_method: payment_method_info(invoice.payment_method_details.as_ref()),
                        gift_date: Utc::now(),
                    })
                    .await?;
            }
        }

        enqueue(
            &self.notifier,
            NotificationJob::PaymentFailed {
                user_id: donation.user_id.clone(),
                reason,
            },
        );
        Ok(())
    }

    async fn on_subscription_updated(&self, subscription: SubscriptionObject) -> Result<()> {
        let donation = self
            .store
            .donation_by_subscription(&subscription.id)
            .await?
            .ok_or(AppError::DocumentNotFound)?;
        let donation_id = donation.id.ok_or_else(|| AppError::service("donation without id"))?;

        if donation.status == DonationStatus::Cancelled {
            // terminal; late updates are no-ops
            return Ok(());
        }

        let target = subscription_target_status(&subscription);
        let update = DonationUpdate {
            status: (donation.status != target).then_some(target),
            next_payment_date: subscription
                .current_period_end
                .map(|end| bson::DateTime::from_millis(end * 1000)),
            ..Default::default()
        };
        if update.is_empty() {
            return Ok(());
        }

        self.store.update_donation(donation_id, update).await?;
        Ok(())
    }

    async fn on_subscription_deleted(&self, subscription: SubscriptionObject) -> Result<()> {
        let donation = match self.store.donation_by_subscription(&subscription.id).await? {
            Some(d) => d,
            None => {
                warn!("Deleted subscription {} has no donation", subscription.id);
                return Ok(());
            }
        };
        let donation_id = donation.id.ok_or_else(|| AppError::service("donation without id"))?;

        if donation.status == DonationStatus::Cancelled {
            debug!(
                "Donation for subscription {} already cancelled, duplicate delivery",
                subscription.id
            );
            return Ok(());
        }

        self.store
            .update_donation(
                donation_id,
                DonationUpdate {
                    status: Some(DonationStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await?;

        enqueue(
            &self.notifier,
            NotificationJob::DonationCancelled {
                user_id: donation.user_id.clone(),
            },
        );
        info!("Donation cancelled for subscription {}", subscription.id);
        Ok(())
    }
}

/// Map the gateway's pause/resume signal onto our donation states.
fn subscription_target_status(subscription: &SubscriptionObject) -> DonationStatus {
    let paused = subscription.pause_collection.is_some()
        || subscription.status.as_deref() == Some("paused");
    if paused {
        DonationStatus::OnHold
    } else {
        DonationStatus::Active
    }
}

fn failure_reason(invoice: &InvoiceObject) -> String {
    invoice
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| "payment failed".to_string())
}

fn payment_method_info(details: Option<&CardDetails>) -> Option<PaymentMethodInfo> {
    details.map(|d| PaymentMethodInfo {
        brand: d.brand.clone(),
        last4: d.last4.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::donation::{Donation, DonationType};
    use crate::models::gateway_event::PauseCollection;
    use crate::models::purchase::{BillingSnapshot, Purchase};
    use crate::services::gateway_service::FakeGateway;
    use crate::services::store::InMemoryPaymentStore;
    use tokio::sync::mpsc;

    fn parse_event(json: &str) -> GatewayEvent {
        serde_json::from_str(json).unwrap()
    }

    fn reconciler(
        store: Arc<InMemoryPaymentStore>,
    ) -> (WebhookReconciler, mpsc::Receiver<NotificationJob>) {
        let (tx, rx) = mpsc::channel(16);
        let gateway = Arc::new(FakeGateway::default());
        (WebhookReconciler::new(store, gateway, tx), rx)
    }

    fn purchase(id: ObjectId, status: PurchaseStatus, session_id: &str) -> Purchase {
        Purchase {
            id: Some(id),
            user_id: "u1".to_string(),
            offering_id: ObjectId::new(),
            order_number: "KN-20260830-AAAABBBB".to_string(),
            status,
            full_price: 10_000,
            fixed_discounts: Vec::new(),
            percent_discount: None,
            final_price: 10_000,
            is_limited_slot_holder: false,
            is_early_bird: false,
            promo_code: None,
            gateway_session_id: Some(session_id.to_string()),
            gateway_payment_intent_id: None,
            billing_snapshot: BillingSnapshot {
                name: "Ana".to_string(),
                email: "ana@example.org".to_string(),
            },
            created_at: Utc::now(),
            purchase_date: None,
        }
    }

    fn donation(id: ObjectId, status: DonationStatus, subscription_id: &str) -> Donation {
        Donation {
            id: Some(id),
            user_id: "u1".to_string(),
            amount: 2_500,
            donation_type: DonationType::Monthly,
            status,
            gateway_customer_id: Some("cus_1".to_string()),
            gateway_subscription_id: Some(subscription_id.to_string()),
            last_gift_date: None,
            next_payment_date: None,
            end_date: None,
            created_at: Utc::now(),
        }
    }

    fn purchase_session_event(session_id: &str, payment_intent: &str) -> GatewayEvent {
        parse_event(&format!(
            r#"{{
                "id": "evt_p",
                "type": "checkout.session.completed",
                "data": {{ "object": {{
                    "id": "{}",
                    "mode": "payment",
                    "payment_intent": "{}",
                    "payment_status": "paid",
                    "metadata": {{ "kind": "purchase" }}
                }} }}
            }}"#,
            session_id, payment_intent
        ))
    }

    fn recurring_invoice_event(subscription_id: &str, payment_intent: &str) -> GatewayEvent {
        parse_event(&format!(
            r#"{{
                "id": "evt_i",
                "type": "invoice.payment_succeeded",
                "data": {{ "object": {{
                    "id": "in_1",
                    "subscription": "{}",
                    "payment_intent": "{}",
                    "amount_paid": 2500
                }} }}
            }}"#,
            subscription_id, payment_intent
        ))
    }

    #[test]
    fn parses_checkout_session_event() {
        let event = parse_event(
            r#"{
                "id": "evt_1",
                "type": "checkout.session.completed",
                "data": { "object": {
                    "id": "cs_123",
                    "mode": "subscription",
                    "customer": "cus_9",
                    "subscription": "sub_7",
                    "payment_intent": null,
                    "payment_status": "paid",
                    "metadata": { "kind": "donation", "donation_id": "66c0ffee66c0ffee66c0ffee" }
                } }
            }"#,
        );
        assert_eq!(event.event_type, EVENT_CHECKOUT_SESSION_COMPLETED);

        let session: CheckoutSessionObject = event.object_as().unwrap();
        assert_eq!(session.mode, "subscription");
        assert_eq!(session.subscription.as_deref(), Some("sub_7"));
        assert!(session.payment_intent.is_none());
        assert_eq!(session.metadata.get("kind").unwrap(), "donation");
    }

    #[test]
    fn parses_invoice_event_with_unknown_fields() {
        let event = parse_event(
            r#"{
                "id": "evt_2",
                "type": "invoice.payment_succeeded",
                "data": { "object": {
                    "id": "in_1",
                    "subscription": "sub_7",
                    "payment_intent": "pi_42",
                    "amount_paid": 2500,
                    "hosted_invoice_url": "https://example.org/i/in_1",
                    "lines": { "data": [] }
                } }
            }"#,
        );
        let invoice: InvoiceObject = event.object_as().unwrap();
        assert_eq!(invoice.amount_paid, 2500);
        assert_eq!(invoice.payment_intent.as_deref(), Some("pi_42"));
        assert_eq!(invoice.amount_due, 0);
    }

    #[test]
    fn pause_signal_maps_to_on_hold() {
        let sub = SubscriptionObject {
            id: "sub_7".to_string(),
            status: Some("active".to_string()),
            pause_collection: Some(PauseCollection {
                behavior: Some("void".to_string()),
            }),
            current_period_end: Some(1_900_000_000),
        };
        assert_eq!(subscription_target_status(&sub), DonationStatus::OnHold);
    }

    #[test]
    fn resume_signal_maps_to_active() {
        let sub = SubscriptionObject {
            id: "sub_7".to_string(),
            status: Some("active".to_string()),
            pause_collection: None,
            current_period_end: None,
        };
        assert_eq!(subscription_target_status(&sub), DonationStatus::Active);
    }

    #[test]
    fn paused_status_without_pause_collection_still_holds() {
        let sub = SubscriptionObject {
            id: "sub_7".to_string(),
            status: Some("paused".to_string()),
            pause_collection: None,
            current_period_end: None,
        };
        assert_eq!(subscription_target_status(&sub), DonationStatus::OnHold);
    }

    #[test]
    fn failure_reason_prefers_gateway_message() {
        let invoice: InvoiceObject = serde_json::from_str(
            r#"{
                "id": "in_2",
                "subscription": "sub_7",
                "payment_intent": "pi_43",
                "amount_due": 2500,
                "last_payment_error": { "message": "Your card was declined.", "code": "card_declined" }
            }"#,
        )
        .unwrap();
        assert_eq!(failure_reason(&invoice), "Your card was declined.");

        let bare: InvoiceObject = serde_json::from_str(
            r#"{ "id": "in_3", "subscription": "sub_7" }"#,
        )
        .unwrap();
        assert_eq!(failure_reason(&bare), "payment failed");
    }

    #[tokio::test]
    async fn pending_purchase_completes_with_ledger_and_receipt() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let id = ObjectId::new();
        store
            .purchases
            .lock()
            .await
            .insert(id, purchase(id, PurchaseStatus::Pending, "cs_1"));
        let (rec, mut rx) = reconciler(store.clone());

        rec.process(&purchase_session_event("cs_1", "pi_1"))
            .await
            .unwrap();

        let row = store.purchases.lock().await.get(&id).cloned().unwrap();
        assert_eq!(row.status, PurchaseStatus::Completed);
        assert_eq!(row.gateway_payment_intent_id.as_deref(), Some("pi_1"));
        assert!(row.purchase_date.is_some());
        assert_eq!(store.ledger.lock().await.len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            NotificationJob::PurchaseReceipt { .. }
        ));
    }

    #[tokio::test]
    async fn late_payment_does_not_resurrect_cancelled_purchase() {
        // The session outlives the row when expire fails at cancel time; a
        // payment on it must not flip cancelled back to completed.
        let store = Arc::new(InMemoryPaymentStore::default());
        let id = ObjectId::new();
        store
            .purchases
            .lock()
            .await
            .insert(id, purchase(id, PurchaseStatus::Cancelled, "cs_1"));
        let (rec, mut rx) = reconciler(store.clone());

        rec.process(&purchase_session_event("cs_1", "pi_1"))
            .await
            .unwrap();

        let row = store.purchases.lock().await.get(&id).cloned().unwrap();
        assert_eq!(row.status, PurchaseStatus::Cancelled);
        assert!(row.gateway_payment_intent_id.is_none());
        assert!(store.ledger.lock().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_invoice_delivery_writes_one_ledger_row() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let id = ObjectId::new();
        store
            .donations
            .lock()
            .await
            .insert(id, donation(id, DonationStatus::Active, "sub_1"));
        let (rec, mut rx) = reconciler(store.clone());

        let event = recurring_invoice_event("sub_1", "pi_9");
        rec.process(&event).await.unwrap();
        rec.process(&event).await.unwrap();

        assert_eq!(store.ledger.lock().await.len(), 1);
        let row = store.donations.lock().await.get(&id).cloned().unwrap();
        assert!(row.last_gift_date.is_some());
        // one receipt, not two
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deleted_event_on_cancelled_donation_is_a_silent_no_op() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let id = ObjectId::new();
        store
            .donations
            .lock()
            .await
            .insert(id, donation(id, DonationStatus::Cancelled, "sub_1"));
        let (rec, mut rx) = reconciler(store.clone());

        let event = parse_event(
            r#"{
                "id": "evt_d",
                "type": "customer.subscription.deleted",
                "data": { "object": { "id": "sub_1", "status": "canceled" } }
            }"#,
        );
        rec.process(&event).await.unwrap();

        let row = store.donations.lock().await.get(&id).cloned().unwrap();
        assert_eq!(row.status, DonationStatus::Cancelled);
        assert!(rx.try_recv().is_err());
    }
}
