pub mod capacity;
pub mod checkout_service;
pub mod gateway_service;
pub mod keyed_lock;
pub mod notifier;
pub mod pricing;
pub mod reconciler;
pub mod store;
