use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use clap::Args;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::agent::{ClientAgent, LocalTrainer};
use crate::config::{telemetry, TrainArgs};
use crate::model::{default_device, LinearTrainer, LocalDataset};
use crate::params::ParameterSet;
use crate::types::*;

#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    #[arg(long, env = "FL_BIND", default_value = "127.0.0.1:9090")]
    pub bind: SocketAddr,
    /// Coordinator to register with, e.g. http://127.0.0.1:8080
    #[arg(long, env = "FL_SERVER")]
    pub server: Option<String>,
    /// URL the coordinator should use to reach this client; defaults to http://<bind>
    #[arg(long, env = "FL_ADVERTISE")]
    pub advertise: Option<String>,
    #[arg(long, env = "CLIENT_ID", default_value = "client_1")]
    pub id: String,
    /// Private training data, never sent anywhere
    #[arg(long, env = "FL_DATA")]
    pub data: PathBuf,
    #[command(flatten)]
    pub train: TrainArgs,
    #[arg(long, env = "FL_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,
}

pub struct ClientState<T> {
    agent: Arc<ClientAgent<T>>,
}

impl<T> Clone for ClientState<T> {
    fn clone(&self) -> Self {
        Self { agent: self.agent.clone() }
    }
}

pub fn router<T: LocalTrainer>(agent: Arc<ClientAgent<T>>) -> Router {
    Router::new()
        .route("/fit", post(fit::<T>))
        .route("/parameters", get(parameters::<T>))
        .with_state(ClientState { agent })
}

pub async fn run(args: ClientArgs) -> anyhow::Result<()> {
    let dataset = LocalDataset::load(&args.data)?;
    info!(client = %args.id, samples = dataset.len(), "loaded local dataset");
    let trainer = LinearTrainer::new(dataset, args.train.batch_size, args.train.learning_rate, default_device());
    let (telemetry, _metrics_writer) = telemetry(args.metrics_file.clone()).await?;
    let agent = Arc::new(ClientAgent::new(args.id.clone(), trainer, telemetry));

    let listener = TcpListener::bind(args.bind).await?;
    let local = listener.local_addr()?;
    info!("Client listening on {local}");

    if let Some(srv) = &args.server {
        let advertise = args.advertise.clone().unwrap_or_else(|| format!("http://{local}"));
        let body = RegisterRequest { client_url: advertise };
        let resp = reqwest::Client::new()
            .post(format!("{}/register", srv.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let registered: RegisterResponse = resp.json().await?;
        info!(client_id = %registered.client_id, "Registered with server {srv}");
    }

    axum::serve(listener, router(agent).into_make_service()).await?;
    Ok(())
}

async fn fit<T: LocalTrainer>(
    State(state): State<ClientState<T>>,
    Json(req): Json<FitRequest>,
) -> Result<Json<ClientResult>, (StatusCode, String)> {
    match state.agent.fit(&req.parameters, req.config).await {
        Ok(result) => Ok(Json(result)),
        Err(e) if e.is_fatal() => {
            warn!(round = req.config.round_number, "rejecting parameters: {e}");
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn parameters<T: LocalTrainer>(State(state): State<ClientState<T>>) -> Result<Json<ParameterSet>, StatusCode> {
    state.agent.parameters().map(Json).ok_or(StatusCode::NOT_FOUND)
}
