use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use flood::address::RemoteAddress;
use flood::config::ProfileRegistry;
use flood::infrastructure::{database, storage};
use flood::services::copy::run_copy;
use flood::services::ingest::Ingestor;
use flood::services::ledger::Ledger;
use flood::services::uploader::{RetryPolicy, Uploader};
use flood::stage::StageTree;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// AWS-credentials-syntax file holding the upload profiles
    #[arg(short, long)]
    credentials: PathBuf,

    /// Server root containing the five stage directories
    #[arg(short = 'd', long)]
    server_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run continuously, uploading files as they arrive in the inbox
    Server,
    /// Stage a local file or directory for upload to s3://profile/bucket/key
    Copy {
        source: PathBuf,
        destination: String,
        #[arg(short, long)]
        recursive: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flood=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration errors are the only process-fatal class.
    let registry = ProfileRegistry::from_credentials_file(&args.credentials).await?;
    info!("🚀 Starting flood with {} profile(s)", registry.len());

    let tree = StageTree::new(&args.server_root);

    match args.command {
        Command::Server => run_server(tree, registry).await,
        Command::Copy {
            source,
            destination,
            recursive,
        } => {
            tree.ensure_layout(&registry).await?;
            let destination = RemoteAddress::parse_uri(&destination)?;
            run_copy(&tree, &registry, &source, &destination, recursive).await?;
            Ok(())
        }
    }
}

async fn run_server(tree: StageTree, registry: ProfileRegistry) -> anyhow::Result<()> {
    let pool = database::setup_database().await?;
    let stores = storage::setup_stores(&registry).await;

    // Anything half-copied when we last died is discarded; copy mode
    // retries from the untouched source.
    tree.purge_staging().await?;
    tree.ensure_layout(&registry).await?;

    let uploader = Arc::new(Uploader::new(
        stores,
        Ledger::new(pool),
        tree.clone(),
        RetryPolicy::default(),
    ));
    let ingestor = Ingestor::new(tree, uploader);

    // Drain crash leftovers before admitting anything new.
    ingestor.recover().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watcher = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            if let Err(e) = ingestor.watch(shutdown_rx).await {
                error!("❌ Inbox watcher failed: {}", e);
            }
        })
    };

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    let _ = watcher.await;

    info!("👋 flood exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
