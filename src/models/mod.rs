pub mod billing_event;
pub mod ledger;
pub mod plan;
