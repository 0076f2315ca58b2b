use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::ParameterSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub client_id: Uuid,
}

/// Per-round configuration sent along with the global parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub round_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRequest {
    pub parameters: ParameterSet,
    pub config: FitConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub train_loss: f32,
    pub train_seconds: f64,
}

/// One client's contribution to a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResult {
    pub parameters: ParameterSet,
    /// Aggregation weight: the number of local samples trained on.
    pub sample_count: u64,
    pub round_number: u32,
    #[serde(default)]
    pub metrics: FitMetrics,
}

/// Detection-style accuracy. `map50` is the figure the drift check compares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Accuracy {
    pub map50: f64,
    pub map50_95: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Training,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub phase: Phase,
    pub round: u32,
    pub connected_clients: usize,
    pub last_accuracy: Option<Accuracy>,
}
