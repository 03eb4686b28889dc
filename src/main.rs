use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use exam_proctor_backend::{
    config::{get_config, init_config, Config, StoreBackend},
    database::pool::create_pool,
    middleware::{auth::RoleGate, cors::cors_layer},
    models::exam::Exam,
    routes::{api_router, RouterSettings},
    services::{
        blob_store::{BlobStore, LocalBlobStore},
        classifier::ClassifierChain,
        clock::{Clock, SystemClock},
        pg_store::PgStore,
        store::{AttemptStore, ExamCatalog, MemoryStore},
    },
    AppState, Ports,
};
use reqwest::Client;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_stores(config: &Config) -> anyhow::Result<(Arc<dyn AttemptStore>, Arc<dyn ExamCatalog>)> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database_url, config.db_max_connections).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            let store = Arc::new(PgStore::new(pool));
            let attempts: Arc<dyn AttemptStore> = store.clone();
            let catalog: Arc<dyn ExamCatalog> = store;
            Ok((attempts, catalog))
        }
        StoreBackend::Memory => {
            tracing::warn!("running on the in-memory store; data is lost on restart");
            let store = Arc::new(MemoryStore::new());
            if let Some(path) = &config.seed_exams_file {
                let raw = tokio::fs::read_to_string(path).await?;
                let exams: Vec<Exam> = serde_json::from_str(&raw)?;
                info!(count = exams.len(), path = %path, "seeding exam catalog");
                for exam in exams {
                    store.put_exam(exam).await;
                }
            }
            let attempts: Arc<dyn AttemptStore> = store.clone();
            let catalog: Arc<dyn ExamCatalog> = store;
            Ok((attempts, catalog))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_config()?;
    let config = get_config();
    init_tracing(config.log_json);

    let (store, catalog) = build_stores(config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    tokio::fs::create_dir_all(&config.uploads_dir).await?;
    info!("Storing evidence under: {}", config.uploads_dir);
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        config.uploads_dir.clone(),
        config.public_base_url.clone(),
        config.url_signing_secret.clone(),
        clock.clone(),
    ));

    let http_client = Client::builder().timeout(Duration::from_secs(60)).build()?;
    let policy = config.policy();
    let classifiers = ClassifierChain::from_config(
        http_client,
        &config.openai_api_key,
        &config.classifier_models,
        policy.classifier_timeout,
    );

    let backend = match config.store_backend {
        StoreBackend::Postgres => "postgres",
        StoreBackend::Memory => "memory",
    };
    let app_state = AppState::new(
        Ports {
            store,
            catalog,
            blobs,
            classifiers,
            clock,
        },
        policy,
        backend,
    );

    {
        let attempts = app_state.attempts.clone();
        let every = Duration::from_secs(config.timeout_sweep_secs.max(1));
        tokio::spawn(async move {
            loop {
                match attempts.finalize_expired().await {
                    Ok(0) => {}
                    Ok(closed) => info!(closed, "timeout sweep finalized attempts"),
                    Err(e) => tracing::error!(error = ?e, "timeout sweep error"),
                }
                tokio::time::sleep(every).await;
            }
        });
    }

    let app = api_router(
        app_state,
        RouterSettings {
            public_rps: config.public_rps,
            review_rps: config.review_rps,
            reviewer_gate: RoleGate::reviewers(&config.jwt_secret),
        },
    )
    .layer(cors_layer(&config.cors_origins))
    .layer(TraceLayer::new_for_http())
    .layer(DefaultBodyLimit::max(20 * 1024 * 1024));

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
