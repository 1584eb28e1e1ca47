// services/notifier.rs
//
// Decoupled notification queue. State mutations enqueue a job and move
// on; a worker task owns delivery (in-app notification document plus the
// email/push hand-off). Delivery failure is logged and dropped, never fed
// back into payment state.
use mongodb::bson::DateTime as BsonDateTime;
use mongodb::{Collection, Database};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::Result;
use crate::models::notification::Notification;

pub type NotificationSender = mpsc::Sender<NotificationJob>;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum NotificationJob {
    PurchaseReceipt {
        user_id: String,
        email: String,
        order_number: String,
        amount: i64,
    },
    DonationReceipt {
        user_id: String,
        amount: i64,
        first_gift: bool,
    },
    PaymentFailed {
        user_id: String,
        reason: String,
    },
    SharedPromoUsed {
        code: String,
        user_id: String,
        offering_name: String,
    },
    DonationCancelled {
        user_id: String,
    },
}

/// Best-effort enqueue. A full queue drops the job with a warning; the
/// caller's state transition is already committed and must not care.
pub fn enqueue(tx: &NotificationSender, job: NotificationJob) {
    if let Err(e) = tx.try_send(job) {
        warn!("Notification queue full, dropping job: {}", e);
    }
}

pub fn spawn_notification_worker(db: Database) -> NotificationSender {
    let (tx, mut rx) = mpsc::channel::<NotificationJob>(QUEUE_DEPTH);

    tokio::spawn(async move {
        info!("Notification worker started");
        while let Some(job) = rx.recv().await {
            if let Err(e) = deliver(&db, &job).await {
                warn!("Notification delivery failed (dropped): {}", e);
            }
        }
        info!("Notification worker stopped");
    });

    tx
}

async fn deliver(db: &Database, job: &NotificationJob) -> Result<()> {
    let (user_id, kind, title, body) = match job {
        NotificationJob::PurchaseReceipt {
            user_id,
            email,
            order_number,
            amount,
        } => {
            // Email rendering/sending is an external collaborator; the
            // hand-off is the log line.
            info!(
                "Dispatching purchase receipt to {} for order {} ({} minor units)",
                email, order_number, amount
            );
            (
                user_id.clone(),
                "purchase_receipt",
                "Purchase confirmed".to_string(),
                format!("Your order {} is confirmed.", order_number),
            )
        }
        NotificationJob::DonationReceipt {
            user_id,
            amount,
            first_gift,
        } => {
            let body = if *first_gift {
                format!("Thank you for your first gift of {} minor units!", amount)
            } else {
                format!("Thank you for your gift of {} minor units.", amount)
            };
            (user_id.clone(), "donation_receipt", "Gift received".to_string(), body)
        }
        NotificationJob::PaymentFailed { user_id, reason } => (
            user_id.clone(),
            "payment_failed",
            "Payment failed".to_string(),
            format!("Your recurring gift could not be processed: {}", reason),
        ),
        NotificationJob::SharedPromoUsed {
            code,
            user_id,
            offering_name,
        } => {
            info!(
                "Alerting administrators: shared promo {} used by {} on {}",
                code, user_id, offering_name
            );
            (
                "admin".to_string(),
                "shared_promo_used",
                "Shared promo code used".to_string(),
                format!("Code {} was redeemed by user {} for {}.", code, user_id, offering_name),
            )
        }
        NotificationJob::DonationCancelled { user_id } => (
            user_id.clone(),
            "donation_cancelled",
            "Recurring gift cancelled".to_string(),
            "Your recurring gift has been cancelled.".to_string(),
        ),
    };

    let collection: Collection<Notification> = db.collection("notifications");
    collection
        .insert_one(Notification {
            id: None,
            user_id,
            title,
            body,
            kind: kind.to_string(),
            read: false,
            created_at: BsonDateTime::now(),
        })
        .await?;

    Ok(())
}
