pub mod donation;
pub mod donation_transaction;
pub mod gateway_event;
pub mod notification;
pub mod offering;
pub mod promo_code;
pub mod purchase;
pub mod user;
