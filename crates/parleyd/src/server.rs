//! HTTP server for parleyd.

use crate::admission::AdmissionController;
use crate::metrics::GatewayMetrics;
use crate::persist::{NullRecordSink, RecordSink, SqliteRecordSink};
use crate::routes;
use crate::session::SessionManager;
use crate::store::EphemeralStore;
use anyhow::Result;
use axum::Router;
use parley_common::config::GatewayConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::info;

/// How often idle rate-ledger entries are pruned.
const ADMISSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub admission: Arc<AdmissionController>,
    pub store: Arc<EphemeralStore>,
    pub sessions: Arc<SessionManager>,
    pub metrics: GatewayMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = GatewayMetrics::new();
        let admission = AdmissionController::new(config.limits.clone());
        let store = EphemeralStore::new(config.store);

        let sink: Arc<dyn RecordSink> = if config.persist.sqlite_path.is_empty() {
            info!("Chat record persistence disabled; records are logged only");
            Arc::new(NullRecordSink)
        } else {
            Arc::new(SqliteRecordSink::open(Path::new(&config.persist.sqlite_path))?)
        };

        let sessions = SessionManager::new(&config, Arc::clone(&store), sink, metrics.clone());

        Ok(Self {
            config,
            admission,
            store,
            sessions,
            metrics,
            start_time: Instant::now(),
        })
    }
}

/// Run the HTTP server until the process is stopped.
pub async fn run(state: AppState) -> Result<()> {
    let state = Arc::new(state);

    EphemeralStore::spawn_sweeper(Arc::clone(&state.store));
    spawn_admission_cleanup(Arc::clone(&state.admission));

    let app = Router::new()
        .merge(routes::chat_routes())
        .merge(routes::ops_routes())
        .with_state(Arc::clone(&state))
        .layer(TraceLayer::new_for_http());

    let addr = &state.config.server.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_admission_cleanup(admission: Arc<AdmissionController>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ADMISSION_CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            admission.cleanup();
        }
    });
}
