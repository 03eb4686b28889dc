pub mod attempt_locks;
pub mod attempt_service;
pub mod blob_store;
pub mod classifier;
pub mod clock;
pub mod grading_service;
pub mod identity_service;
pub mod ledger_service;
pub mod pg_store;
pub mod review_service;
pub mod risk_service;
pub mod store;
