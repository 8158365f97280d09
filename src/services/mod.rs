pub mod openrouter;
pub mod provisioning;
pub mod stripe;
