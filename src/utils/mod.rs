pub mod jwt;
pub mod user_locks;
pub mod webhook_signature;
