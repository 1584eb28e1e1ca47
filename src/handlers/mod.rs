pub(crate) mod checkout_handlers;
pub(crate) mod donation_handlers;
pub(crate) mod webhook_handlers;
