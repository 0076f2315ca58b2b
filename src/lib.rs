//! Federated averaging across remote clients, with validation-based rollback of regressing rounds.

pub mod agent;
pub mod aggregate;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod drift;
pub mod error;
pub mod model;
pub mod params;
pub mod server;
pub mod strategy;
pub mod telemetry;
pub mod types;

pub use aggregate::aggregate;
pub use coordinator::{ClientRegistry, Coordinator, CoordinatorState, FitClient, RoundConfig, RoundRecord, RunSummary};
pub use drift::{DriftDecision, DriftGuard, DriftState};
pub use error::{FlError, Result};
pub use params::{ModelSpec, ParameterSet, TensorData};
pub use strategy::{RoundOutcome, Strategy, StrategyKind, Validator};
pub use types::{Accuracy, ClientResult, FitConfig};
