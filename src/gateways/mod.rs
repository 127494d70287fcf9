pub mod http;
pub mod paypal;
pub mod paystack;
pub mod registry;
pub mod traits;
