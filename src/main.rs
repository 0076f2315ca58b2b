use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use fedguard::agent::ClientAgent;
use fedguard::client::{self, ClientArgs};
use fedguard::config::{telemetry, RoundArgs, TrainArgs};
use fedguard::model::{default_device, init_parameters, LinearTrainer, LinearValidator, LocalDataset};
use fedguard::server::{self, ServerArgs};
use fedguard::{ClientRegistry, ClientResult, Coordinator, FitClient, FitConfig, ParameterSet};

#[derive(Parser)]
#[command(version, about = "Federated averaging server and clients with drift rollback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the round coordinator and wait for clients to register
    Server(ServerArgs),
    /// Serve local training for one private dataset
    Client(ClientArgs),
    /// Simulate a whole federation in one process on synthetic data
    Demo(DemoArgs),
}

#[derive(Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 3)]
    clients: usize,
    #[arg(long, default_value_t = 200)]
    samples: usize,
    #[arg(long, default_value_t = 8)]
    dim: usize,
    #[arg(long, default_value_t = 4)]
    classes: usize,
    #[arg(long, default_value_t = 0.3)]
    spread: f32,
    /// From this round on, the first client trains on mislabelled data and overstates its sample count
    #[arg(long)]
    sabotage_round: Option<u32>,
    #[command(flatten)]
    rounds: RoundArgs,
    #[command(flatten)]
    train: TrainArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();
    match Cli::parse().command {
        Commands::Server(args) => server::run(args).await,
        Commands::Client(args) => client::run(args).await,
        Commands::Demo(args) => demo(args).await,
    }
}

/// An in-process client that switches to poisoned labels from a given round.
struct DemoClient {
    agent: ClientAgent<LinearTrainer>,
    poisoned: Option<(u32, ClientAgent<LinearTrainer>)>,
}

impl FitClient for DemoClient {
    fn id(&self) -> &str {
        self.agent.id()
    }

    async fn fit(&self, parameters: Arc<ParameterSet>, config: FitConfig) -> fedguard::Result<ClientResult> {
        match &self.poisoned {
            Some((from, poisoned)) if config.round_number >= *from => {
                info!(client = self.agent.id(), round = config.round_number, "training on shifted labels");
                let mut result = poisoned.fit(&parameters, config).await?;
                result.sample_count *= 10;
                Ok(result)
            }
            _ => self.agent.fit(&parameters, config).await,
        }
    }
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let device = default_device();
    let (telemetry, metrics_writer) = telemetry(args.rounds.metrics_file.clone()).await?;

    let registry = Arc::new(ClientRegistry::new());
    for i in 0..args.clients {
        let id = format!("client_{}", i + 1);
        let data = LocalDataset::synthetic(i as u64 + 1, args.samples, args.dim, args.classes, args.spread);
        let trainer = |data| LinearTrainer::new(data, args.train.batch_size, args.train.learning_rate, device.clone());
        let poisoned = args.sabotage_round.filter(|_| i == 0).map(|from| {
            (from, ClientAgent::new(id.clone(), trainer(data.with_shifted_labels()), telemetry.clone()))
        });
        registry.register(DemoClient { agent: ClientAgent::new(id, trainer(data), telemetry.clone()), poisoned });
    }

    let validation = LocalDataset::synthetic(10_000, args.samples, args.dim, args.classes, args.spread);
    let validator = Arc::new(LinearValidator::new(validation, device));
    let mut config = args.rounds.round_config();
    config.client_wait = Duration::from_secs(0);
    let coordinator = Coordinator::new(registry, args.rounds.strategy(validator), telemetry, config);

    let initial = init_parameters(args.dim, args.classes, args.rounds.seed);
    let summary = coordinator.run(args.rounds.rounds, args.rounds.min_clients, initial).await?;
    drop(coordinator);
    if let Some(writer) = metrics_writer {
        let _ = writer.await;
    }

    for r in &summary.history {
        let map50 = r.validation_accuracy.map(|a| format!("{:5.2}%", 100. * a.map50)).unwrap_or_else(|| "-".into());
        println!(
            "round {:3}  clients {:2}  failed {:2}  {:>6}  mAP@0.5 {map50}  {:?}",
            r.round_number, r.participating_client_count, r.failure_count, format!("{:.2}s", r.duration_seconds), r.outcome
        );
    }
    if let Some(acc) = summary.accuracy {
        println!("final accepted mAP@0.5: {:5.2}%", 100. * acc);
    }
    println!("total FL runtime: {:.2} seconds", summary.total_seconds);
    Ok(())
}
