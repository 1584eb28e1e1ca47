pub(crate) mod checkout;
pub(crate) mod donations;
pub(crate) mod webhooks;
