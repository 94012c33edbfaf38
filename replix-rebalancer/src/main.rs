//! Replix Rebalancer Service
//!
//! Runs one rebalancing batch against a source endpoint:
//! - Scans eligible rules (live tables or weekly lock dump)
//! - Picks a new target per rule under tier policy
//! - Derives child rules within the byte and file budgets

use anyhow::Context;
use clap::Parser;
use replix_metadata::{Database, DbConfig};
use replix_rebalancer::{
    CatalogFreeSpace, FileLockDumpFeed, HttpLockDumpFeed, LockDumpFeed, Orchestrator,
    RebalanceMode, RebalanceRequest, RebalancerConfig, Scanner, TargetSelector,
    WeightedEndpointSelector,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replix-rebalancer")]
#[command(about = "Move replication rules off a storage endpoint")]
struct Cli {
    /// Source endpoint to rebalance
    #[arg(long)]
    rse: String,

    /// Maximum bytes to relocate
    #[arg(long, default_value = "1000000000")]
    max_bytes: u64,

    /// Maximum files to relocate
    #[arg(long)]
    max_files: Option<u64>,

    /// Select targets without creating rules
    #[arg(long)]
    dry_run: bool,

    /// Endpoints that must not receive data
    #[arg(long)]
    exclude_expression: Option<String>,

    /// Endpoints data is forced to
    #[arg(long)]
    force_expression: Option<String>,

    /// Candidate source: standard or decommission
    #[arg(long, default_value = "standard")]
    mode: RebalanceMode,

    /// Priority of derived rules (0-5)
    #[arg(long, default_value = "3")]
    priority: i32,

    /// Source replica expression of derived rules
    #[arg(long)]
    source_replica_expression: Option<String>,

    /// Comment set on derived rules
    #[arg(long)]
    comment: Option<String>,

    /// Activity of derived rules, instead of the parent's
    #[arg(long, env = "REPLIX_ACTIVITY")]
    activity: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long, env = "REPLIX_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn request(&self) -> RebalanceRequest {
        RebalanceRequest {
            source_endpoint: self.rse.clone(),
            max_bytes: self.max_bytes,
            max_files: self.max_files,
            dry_run: self.dry_run,
            exclude_expression: self.exclude_expression.clone(),
            force_expression: self.force_expression.clone(),
            mode: self.mode,
            priority: self.priority,
            source_replica_expression: self.source_replica_expression.clone(),
            comment: self.comment.clone(),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

fn build_feed(config: &RebalancerConfig) -> anyhow::Result<Arc<dyn LockDumpFeed>> {
    let feed: Arc<dyn LockDumpFeed> = match &config.dumps_dir {
        Some(dir) => Arc::new(FileLockDumpFeed::new(dir)),
        None => Arc::new(
            HttpLockDumpFeed::new(&config.dumps_location).context("Failed to build HTTP client")?,
        ),
    };
    Ok(feed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = RebalancerConfig::from_env()?;
    if cli.activity.is_some() {
        config.activity = cli.activity.clone();
    }

    let request = cli.request();
    info!(
        rse = %request.source_endpoint,
        mode = %request.mode,
        max_bytes = request.max_bytes,
        max_files = ?request.max_files,
        dry_run = request.dry_run,
        "Starting replix rebalancer"
    );

    let db = Database::new(DbConfig {
        url: config.database_url.clone(),
        ..Default::default()
    })
    .await
    .context("Failed to connect to database")?;
    db.migrate().await?;
    let catalog = Arc::new(db);

    let scanner = Scanner::new(catalog.clone(), config.eligibility_policy())
        .with_feed(build_feed(&config)?);
    let selector =
        WeightedEndpointSelector::new(CatalogFreeSpace::new(catalog.clone()), config.selector_seed);
    let targets = TargetSelector::new(catalog.clone(), selector);
    let orchestrator =
        Orchestrator::new(catalog, scanner, targets).with_activity(config.activity.clone());

    let report = match orchestrator.run(&request).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Rebalance aborted");
            return Err(e.into());
        }
    };

    info!(summary = %report.summary(), "Rebalance finished");
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_table());
    }

    Ok(())
}
