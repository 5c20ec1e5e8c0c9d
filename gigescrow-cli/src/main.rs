//! gigescrow - operator entry point for the escrow engine
//!
//! ```bash
//! # Run the node and the expiry sweeper until Ctrl-C
//! GIGESCROW_ENCRYPTION_KEY=... gigescrow run
//!
//! # Apply the bundled schema
//! GIGESCROW_DATABASE__URL=postgres://... gigescrow migrate
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gigescrow_engine::{
    condition::ConditionGenerator,
    config::EngineConfig,
    ledger::{find_check_by_invoice_id, is_valid_address, JsonRpcLedgerClient, LedgerClient, ObjectType},
    node::EscrowNode,
    store::PgStore,
};

#[derive(Parser)]
#[command(name = "gigescrow")]
#[command(version, about = "Milestone escrow coordination on a native-escrow ledger", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults to ./gigescrow.toml when present
    #[arg(short, long, global = true, env = "GIGESCROW_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node with the background expiry sweep until Ctrl-C
    Run,

    /// Run a single expiry sweep and exit
    Sweep,

    /// Print a fresh condition/fulfillment pair
    Condition,

    /// List the escrow objects an account owns on the ledger
    LedgerEscrows {
        /// Owner account address
        owner: String,
    },

    /// List the checks an account owns, or the one carrying an invoice id
    LedgerChecks {
        /// Owner account address
        owner: String,

        /// Only the check created with this invoice id
        #[arg(long)]
        invoice_id: Option<String>,
    },

    /// Submit a signed transaction blob and wait for validation
    Submit {
        /// Hex-encoded signed transaction
        blob: String,
    },

    /// Apply the bundled database schema
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Condition => {
            let pair = ConditionGenerator::new().generate();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "condition": pair.condition,
                    "fulfillment": pair.fulfillment,
                }))?
            );
        }
        Commands::Run => run(load_config(cli.config.as_deref())?).await?,
        Commands::Sweep => {
            let node = EscrowNode::new(load_config(cli.config.as_deref())?).await?;
            let report = node.sweep_now().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            node.shutdown().await?;
        }
        Commands::LedgerEscrows { owner } => {
            if !is_valid_address(&owner) {
                bail!("'{owner}' is not a valid ledger address");
            }
            let ledger = connect_ledger(&load_config(cli.config.as_deref())?).await?;
            let objects = ledger.get_account_objects(&owner, ObjectType::Escrow).await?;
            println!("{}", serde_json::to_string_pretty(&objects)?);
            ledger.disconnect().await?;
        }
        Commands::LedgerChecks { owner, invoice_id } => {
            if !is_valid_address(&owner) {
                bail!("'{owner}' is not a valid ledger address");
            }
            let ledger = connect_ledger(&load_config(cli.config.as_deref())?).await?;
            match invoice_id {
                Some(invoice_id) => {
                    let check = find_check_by_invoice_id(&ledger, &owner, &invoice_id).await?;
                    println!("{}", serde_json::to_string_pretty(&check)?);
                }
                None => {
                    let objects = ledger.get_account_objects(&owner, ObjectType::Check).await?;
                    println!("{}", serde_json::to_string_pretty(&objects)?);
                }
            }
            ledger.disconnect().await?;
        }
        Commands::Submit { blob } => {
            let ledger = connect_ledger(&load_config(cli.config.as_deref())?).await?;
            let outcome = ledger.submit_and_wait(&blob).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            ledger.disconnect().await?;
        }
        Commands::Migrate => {
            let config = load_config(cli.config.as_deref())?;
            let db = config
                .database
                .as_ref()
                .context("migrate needs a [database] section or GIGESCROW_DATABASE__URL")?;
            let store = PgStore::connect(db).await?;
            store.migrate().await?;
            store.close().await;
            info!("Migrations applied to {}", db.url_masked());
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    let config = EngineConfig::load(path).context("failed to load configuration")?;
    info!("Loaded configuration: {:?}", config);
    Ok(config)
}

async fn connect_ledger(config: &EngineConfig) -> anyhow::Result<JsonRpcLedgerClient> {
    let ledger = JsonRpcLedgerClient::new(config.ledger.clone())?;
    ledger
        .connect()
        .await
        .with_context(|| format!("ledger at {} is not reachable", config.ledger.endpoint))?;
    Ok(ledger)
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let node = EscrowNode::new(config).await?;
    node.start_sweeper().await;

    let health = node.health_check().await?;
    if health.healthy {
        info!("Escrow node is healthy");
    } else {
        for issue in &health.issues {
            warn!("Health issue: {}", issue);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    node.shutdown().await?;
    Ok(())
}
