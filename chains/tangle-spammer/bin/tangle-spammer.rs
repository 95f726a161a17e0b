use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use core_logic::{setup_logger, Node, TxStore, SPAM_RESULT_TARGET};
use dotenv::dotenv;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tangle_spammer::controller::{default_tag, DEFAULT_MESSAGE};
use tangle_spammer::ternary::random_trytes;
use tangle_spammer::{available_pow_types, best_pow, pow_by_name, FileConfig, Spammer};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    /// Node URL; repeat for several nodes. Overrides the config file.
    #[arg(short, long)]
    node: Vec<String>,

    /// Stop after this many seconds.
    #[arg(short, long)]
    timeout: Option<u64>,

    /// SQLite file for the transaction store.
    #[arg(long)]
    db: Option<String>,

    /// Hash function, see `pows`.
    #[arg(long)]
    pow: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spam until Ctrl+C or the timeout.
    Run,
    /// List available hash functions.
    Pows,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    if let Some(Commands::Pows) = args.command {
        for name in available_pow_types() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut file = if Path::new(&args.config).exists() {
        FileConfig::from_path(&args.config).context("Failed to load config")?
    } else {
        FileConfig::default()
    };

    if !args.node.is_empty() {
        file.nodes = args.node.iter().map(|url| Node::new(url, false)).collect();
    } else if file.nodes.is_empty() {
        if let Ok(url) = env::var("TANGLE_SPAMMER_NODE") {
            file.nodes.push(Node::new(url, false));
        }
    }
    if let Some(timeout) = args.timeout {
        file.timeout_secs = timeout;
    }
    file.verbose |= args.verbose;

    let _log_guard = setup_logger(file.verbose);

    let pow = match args.pow.as_deref().or(file.pow.as_deref()) {
        Some(name) => pow_by_name(name)?,
        None => best_pow(),
    };
    if file.tag.is_empty() {
        file.tag = default_tag(pow.name());
    }
    if file.message.is_empty() {
        file.message = DEFAULT_MESSAGE.to_string();
    }
    let database = args.db.clone().or_else(|| file.database.clone());

    let config = file
        .into_spammer_config(&random_trytes(81))
        .context("Invalid configuration")?;

    let nodes: Vec<String> = config.nodes.iter().map(|n| n.to_string()).collect();
    info!(target: SPAM_RESULT_TARGET, "Nodes: {}", nodes.join(", "));
    info!(
        target: SPAM_RESULT_TARGET,
        "PoW: {} | MWM: {} | depth: {} | strategy: {}",
        pow.name(),
        config.mwm,
        config.depth,
        config.strategy
    );
    info!(target: SPAM_RESULT_TARGET, "Destination: {}", config.destination_address);

    let mut spammer = Spammer::new(config, pow);
    if let Some(path) = database {
        let store = TxStore::new(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path))?;
        spammer = spammer.with_store(Arc::new(store));
    }
    let spammer = Arc::new(spammer);

    let signal_target = Arc::clone(&spammer);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, stopping...");
            if let Err(e) = signal_target.stop() {
                error!("Failed to stop spammer: {:#}", e);
            }
        }
    });

    spammer.start().await?;

    let summary = spammer.summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
