use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use clap::Args;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{telemetry, RoundArgs};
use crate::coordinator::{ClientRegistry, Coordinator, FitClient, Progress, RoundRecord};
use crate::error::{FlError, Result};
use crate::model::{default_device, init_parameters, LinearValidator, LocalDataset};
use crate::params::{load_checkpoint, ParameterSet};
use crate::types::*;

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[arg(long, env = "FL_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,
    /// Central validation set used by every round
    #[arg(long, env = "FL_VALIDATION_DATA")]
    pub validation: PathBuf,
    #[command(flatten)]
    pub rounds: RoundArgs,
}

/// A client process reached over HTTP.
pub struct RemoteClient {
    id: String,
    url: String,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(id: Uuid, url: String, http: reqwest::Client) -> Self {
        Self { id: id.to_string(), url: url.trim_end_matches('/').to_string(), http }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FitClient for RemoteClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fit(&self, parameters: Arc<ParameterSet>, config: FitConfig) -> Result<ClientResult> {
        let body = FitRequest { parameters: (*parameters).clone(), config };
        let resp = self.http.post(format!("{}/fit", self.url)).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let reason = resp.text().await.unwrap_or_default();
            return Err(FlError::Incompatible { client: self.url.clone(), reason });
        }
        if !status.is_success() {
            let reason = resp.text().await.unwrap_or_default();
            return Err(FlError::Transport(format!("{} answered {status}: {reason}", self.url)));
        }
        Ok(resp.json::<ClientResult>().await?)
    }
}

#[derive(Clone)]
pub struct ServerState {
    registry: Arc<ClientRegistry<RemoteClient>>,
    progress: Arc<RwLock<Progress>>,
    http: reqwest::Client,
}

impl ServerState {
    pub fn new(registry: Arc<ClientRegistry<RemoteClient>>, progress: Arc<RwLock<Progress>>) -> Self {
        Self { registry, progress, http: reqwest::Client::new() }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/clients/:id", delete(unregister))
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/model", get(model))
        .with_state(state)
}

pub async fn run(args: ServerArgs) -> anyhow::Result<()> {
    let validation = LocalDataset::load(&args.validation)?;
    let initial = match &args.rounds.resume {
        Some(path) => load_checkpoint(path).with_context(|| format!("resuming from {}", path.display()))?,
        None => init_parameters(validation.dim, validation.classes, args.rounds.seed),
    };
    let validator = Arc::new(LinearValidator::new(validation, default_device()));
    let (telemetry, metrics_writer) = telemetry(args.rounds.metrics_file.clone()).await?;

    let registry = Arc::new(ClientRegistry::new());
    let coordinator = Coordinator::new(
        registry.clone(),
        args.rounds.strategy(validator),
        telemetry,
        args.rounds.round_config(),
    );
    let app = router(ServerState::new(registry, coordinator.progress()));

    let listener = TcpListener::bind(args.bind).await?;
    info!("Federated server listening on {}", listener.local_addr()?);
    let http = tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await });

    let outcome = coordinator.run(args.rounds.rounds, args.rounds.min_clients, initial).await;
    http.abort();
    drop(coordinator);
    if let Some(writer) = metrics_writer {
        let _ = writer.await;
    }

    let summary = outcome?;
    for r in &summary.history {
        info!(
            round = r.round_number,
            clients = r.participating_client_count,
            outcome = ?r.outcome,
            map50 = r.validation_accuracy.map(|a| a.map50),
            "round summary"
        );
    }
    Ok(())
}

async fn register(State(state): State<ServerState>, Json(req): Json<RegisterRequest>) -> Json<RegisterResponse> {
    for stale in state.registry.snapshot().iter().filter(|c| c.url() == req.client_url.trim_end_matches('/')) {
        state.registry.remove(stale.id());
    }
    let client_id = Uuid::new_v4();
    info!(client = %client_id, url = %req.client_url, "client registered");
    state.registry.register(RemoteClient::new(client_id, req.client_url, state.http.clone()));
    Json(RegisterResponse { client_id })
}

async fn unregister(State(state): State<ServerState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.registry.remove(&id.to_string()) {
        info!(client = %id, "client left");
        StatusCode::NO_CONTENT
    } else {
        warn!(client = %id, "unknown client tried to leave");
        StatusCode::NOT_FOUND
    }
}

async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let p = state.progress.read();
    Json(StatusResponse {
        phase: p.phase,
        round: p.round,
        connected_clients: state.registry.len(),
        last_accuracy: p.last_accuracy,
    })
}

async fn history(State(state): State<ServerState>) -> Json<Vec<RoundRecord>> {
    Json(state.progress.read().history.clone())
}

async fn model(State(state): State<ServerState>) -> std::result::Result<Json<ParameterSet>, StatusCode> {
    let global = state.progress.read().global.clone();
    match global {
        Some(params) => Ok(Json((*params).clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}
