pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::config::RuntimePolicy;
use crate::services::{
    attempt_locks::AttemptLocks,
    attempt_service::AttemptService,
    blob_store::BlobStore,
    classifier::ClassifierChain,
    clock::Clock,
    identity_service::IdentityService,
    ledger_service::LedgerService,
    review_service::ReviewService,
    store::{AttemptStore, ExamCatalog},
};

#[derive(Clone)]
pub struct AppState {
    pub attempts: AttemptService,
    pub reviews: ReviewService,
    pub blobs: Arc<dyn BlobStore>,
    /// Name of the persistence backend, reported by `/health`.
    pub backend: &'static str,
}

/// Ports the services are wired against.
pub struct Ports {
    pub store: Arc<dyn AttemptStore>,
    pub catalog: Arc<dyn ExamCatalog>,
    pub blobs: Arc<dyn BlobStore>,
    pub classifiers: ClassifierChain,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(ports: Ports, policy: RuntimePolicy, backend: &'static str) -> Self {
        let Ports {
            store,
            catalog,
            blobs,
            classifiers,
            clock,
        } = ports;
        let locks = Arc::new(AttemptLocks::new());

        let ledger = LedgerService::new(store.clone(), blobs.clone(), clock.clone(), policy.clone());
        let identity = IdentityService::new(
            store.clone(),
            blobs.clone(),
            classifiers,
            ledger.clone(),
            clock.clone(),
            policy.clone(),
        );
        let attempts = AttemptService::new(
            store.clone(),
            catalog.clone(),
            ledger,
            identity,
            clock.clone(),
            locks.clone(),
            policy.clone(),
        );
        let reviews = ReviewService::new(store, catalog, blobs.clone(), clock, locks, policy);

        Self {
            attempts,
            reviews,
            blobs,
            backend,
        }
    }
}
