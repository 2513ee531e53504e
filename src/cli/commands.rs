//! CLI command definitions for opportunity-forge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{self, AppState};
use crate::client::ApiClient;
use crate::metrics;
use crate::opportunity::{Competition, OpportunityCandidate, OpportunityFilter};
use crate::pipeline::{
    scorer_from_config, PipelineComponents, PipelineConfig, PipelineOrchestrator, PipelineRunner,
};
use crate::storage::open_repository;

/// Default server address for client commands.
const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Opportunity discovery pipeline with a verifiable proof log.
#[derive(Parser)]
#[command(name = "opportunity-forge")]
#[command(about = "Drive business opportunities through a staged, audited pipeline")]
#[command(version)]
#[command(
    long_about = "opportunity-forge scores candidate opportunities through ordered stages, tracks the agents doing the work and records every transition in an append-only proof log.\n\nExample usage:\n  opportunity-forge serve --config forge.yaml\n  opportunity-forge submit --title \"Marina studios\" --description \"Short lets\" --market Dubai --source scan"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override its values.
    #[arg(short, long, global = true, env = "OPPORTUNITY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server URL used by client commands.
    #[arg(long, global = true, env = "OPPORTUNITY_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline and its HTTP API.
    Serve(ServeArgs),

    /// Submit a candidate opportunity.
    Submit(SubmitArgs),

    /// List opportunities.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Read a range of the proof log.
    Proof(ProofArgs),

    /// Mark a proof entry verified.
    Verify(VerifyArgs),

    /// Reject an opportunity.
    Reject(RejectArgs),

    /// Show agent statuses.
    Agents,

    /// Show stages and resident counts.
    Stages,

    /// Check server health.
    Health,

    /// Print the effective configuration as YAML.
    Config,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind, overriding the configuration.
    #[arg(short, long)]
    pub bind: Option<String>,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub description: String,

    #[arg(long)]
    pub market: String,

    /// Where the opportunity was found.
    #[arg(long)]
    pub source: String,

    /// Competition level (low, medium, high).
    #[arg(long)]
    pub competition: Option<Competition>,

    /// Free-form revenue estimate.
    #[arg(long)]
    pub revenue: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only opportunities currently in this stage.
    #[arg(long)]
    pub stage: Option<String>,

    /// Only validated (or only unvalidated) opportunities.
    #[arg(long)]
    pub validated: Option<bool>,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ProofArgs {
    /// First position (1-based, inclusive).
    #[arg(long, default_value = "1")]
    pub from: u64,

    /// End position (exclusive). Reads to the end when unset.
    #[arg(long)]
    pub to: Option<u64>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Proof entry id.
    pub id: Uuid,
}

#[derive(Parser, Debug)]
pub struct RejectArgs {
    /// Opportunity id.
    pub id: Uuid,

    #[arg(long)]
    pub reason: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI args and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(cli.config.as_deref(), args).await,
        Commands::Config => run_config_command(cli.config.as_deref()),
        Commands::Submit(args) => run_submit_command(&cli.server, args).await,
        Commands::List(args) => run_list_command(&cli.server, args).await,
        Commands::Proof(args) => run_proof_command(&cli.server, args).await,
        Commands::Verify(args) => run_verify_command(&cli.server, args).await,
        Commands::Reject(args) => run_reject_command(&cli.server, args).await,
        Commands::Agents => run_agents_command(&cli.server).await,
        Commands::Stages => run_stages_command(&cli.server).await,
        Commands::Health => run_health_command(&cli.server).await,
    }
}

/// Loads the configuration file if given, then applies environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let base = match path {
        Some(path) => PipelineConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))?,
        None => PipelineConfig::default(),
    };
    Ok(base.with_env_overrides(|key| std::env::var(key).ok())?)
}

// ============================================================================
// Server
// ============================================================================

async fn run_serve_command(config_path: Option<&Path>, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    metrics::init_metrics()?;

    let repository = open_repository(config.database_url.as_deref()).await?;
    if config.database_url.is_none() {
        warn!("DATABASE_URL not set; state will not survive a restart");
    }

    let components = PipelineComponents::open(&config, repository).await?;
    let scorer = scorer_from_config(&config)?;
    let orchestrator = Arc::new(PipelineOrchestrator::new(&config, components, scorer));

    let mut runner = PipelineRunner::new(
        Arc::clone(&orchestrator),
        config.tick_interval(),
        config.shutdown_timeout(),
    );
    runner.start()?;

    let listener = TcpListener::bind(&config.bind_address).await?;
    let served = api::serve(listener, AppState::new(orchestrator), shutdown_signal()).await;

    if let Err(e) = runner.shutdown().await {
        warn!(error = %e, "Pipeline runner did not shut down cleanly");
    }
    served?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn run_config_command(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

// ============================================================================
// Client commands
// ============================================================================

async fn run_submit_command(server: &str, args: SubmitArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let mut candidate = OpportunityCandidate::new(args.title, args.description, args.market, args.source);
    if let Some(competition) = args.competition {
        candidate = candidate.with_competition(competition);
    }
    if let Some(revenue) = args.revenue {
        candidate = candidate.with_revenue_potential(revenue);
    }

    let opportunity = client.create_opportunity(&candidate).await?;
    println!("Created {} in stage '{}'", opportunity.id, opportunity.stage);
    Ok(())
}

async fn run_list_command(server: &str, args: ListArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let filter = OpportunityFilter {
        stage: args.stage,
        validated: args.validated,
    };
    let opportunities = client.fetch_opportunities(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&opportunities)?);
        return Ok(());
    }

    if opportunities.is_empty() {
        println!("No opportunities found");
        return Ok(());
    }
    println!("{:<36}  {:<12}  {:>5}  {:<9}  TITLE", "ID", "STAGE", "SCORE", "VALIDATED");
    for opp in &opportunities {
        println!(
            "{:<36}  {:<12}  {:>5.2}  {:<9}  {}",
            opp.id, opp.stage, opp.score, opp.validated, opp.title
        );
    }
    Ok(())
}

async fn run_proof_command(server: &str, args: ProofArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let entries = client.proof_range(args.from, args.to).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{}  {}  {:<24}  {:<14}  {}{}",
            entry.timestamp.to_rfc3339(),
            entry.id,
            entry.action,
            entry.agent,
            entry.result,
            if entry.verified { "  [verified]" } else { "" }
        );
    }
    println!("{} entries", entries.len());
    Ok(())
}

async fn run_verify_command(server: &str, args: VerifyArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let response = client.verify_proof(args.id).await?;
    if response.newly_verified {
        println!("Verified {}", args.id);
    } else {
        println!("{} was already verified", args.id);
    }
    Ok(())
}

async fn run_reject_command(server: &str, args: RejectArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let opportunity = client.reject_opportunity(args.id, &args.reason).await?;
    println!(
        "Rejected {}: {}",
        opportunity.id,
        opportunity.rejection_reason.unwrap_or_default()
    );
    Ok(())
}

async fn run_agents_command(server: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    for agent in client.agents().await? {
        println!(
            "{:<10}  {:<10}  {:>3}%  {}",
            agent.agent_id,
            agent.status,
            agent.progress,
            agent.current_task.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_stages_command(server: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    for stage in client.stages().await? {
        println!("{:<12}  {:<20}  {}", stage.id, stage.name, stage.opportunities);
    }
    Ok(())
}

async fn run_health_command(server: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(server)?;
    let health = client.health().await?;
    println!(
        "{} (version {}, {})",
        health.status,
        health.version,
        health.timestamp.to_rfc3339()
    );
    Ok(())
}
