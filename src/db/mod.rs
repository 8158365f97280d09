pub mod ledger_repository;
pub mod postgres_ledger_repository;
pub mod postgres_stripe_event_log_repository;
pub mod stripe_event_log_repository;

#[cfg(test)]
pub mod mock_db;
#[cfg(test)]
pub mod mock_stripe_event_log_repository;
