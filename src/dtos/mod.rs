pub mod checkout_dtos;
