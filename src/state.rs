use std::sync::Arc;

use mongodb::Database;

use crate::services::checkout_service::CheckoutService;
use crate::services::gateway_service::GatewayService;
use crate::services::keyed_lock::KeyedLock;
use crate::services::notifier::NotificationSender;
use crate::services::reconciler::WebhookReconciler;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub locks: Arc<KeyedLock>,
    pub notifier: NotificationSender,
    pub gateway: Option<Arc<GatewayService>>,
    pub checkout: Option<Arc<CheckoutService>>,
    pub reconciler: Option<Arc<WebhookReconciler>>,
}

impl AppState {
    pub fn new(db: Database, locks: Arc<KeyedLock>, notifier: NotificationSender) -> Self {
        AppState {
            db,
            locks,
            notifier,
            gateway: None,
            checkout: None,
            reconciler: None,
        }
    }

    pub fn with_gateway(
        mut self,
        gateway: Arc<GatewayService>,
        checkout: Arc<CheckoutService>,
        reconciler: Arc<WebhookReconciler>,
    ) -> Self {
        self.gateway = Some(gateway);
        self.checkout = Some(checkout);
        self.reconciler = Some(reconciler);
        self
    }
}
