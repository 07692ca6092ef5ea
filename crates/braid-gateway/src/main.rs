use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use braid_core::config::PeerConfig;
use braid_core::lightning::rpc::WalletRpcClient;
use braid_core::mint::HttpMintClient;
use braid_core::relay::http::HttpRelayClient;
use braid_core::relay::rpc::PeerNode;
use braid_core::store::ProofDb;
use braid_core::tracker::ProofStateTracker;
use braid_core::wallet::Wallet;
use braid_gateway::GatewayNode;

#[derive(Parser)]
#[command(name = "braid-gateway")]
struct Cli {
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this peer's public key.
    Pk,
    /// Print the stored proof balance.
    Balance,
    /// Accept a token into the local store (gateway liquidity top-up).
    ReceiveToken { token: String },
    /// Run the gateway.
    Serve,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt().init();
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = PeerConfig::from_file(&cli.config)?;
    let keys = config.derive_keys()?;

    if let Commands::Pk = cli.command {
        println!("{}", keys.public);
        return Ok(());
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open proof database")?;
    let db = ProofDb::new(pool);
    db.init_schema().await?;

    let mint = Arc::new(HttpMintClient::new(&config.mint_url)?);
    let wallet = Arc::new(Wallet::new(
        keys.clone(),
        &config.mint_url,
        mint.clone(),
        db,
    ));

    match cli.command {
        Commands::Pk => unreachable!("handled above"),
        Commands::Balance => {
            println!("{} sat", wallet.balance().await?);
            Ok(())
        }
        Commands::ReceiveToken { token } => {
            let amount = wallet.receive_token(&token, None).await?;
            println!("received {amount} sat");
            Ok(())
        }
        Commands::Serve => {
            let lightning_url = config
                .lightning_rpc_url
                .as_deref()
                .ok_or_else(|| anyhow!("gateway config needs lightning_rpc_url"))?;
            let lightning = Arc::new(
                WalletRpcClient::new(lightning_url)
                    .map_err(|e| anyhow!("lightning setup failed: {e}"))?,
            );

            let transport = Arc::new(
                HttpRelayClient::new(&config.relay_url, keys.public)
                    .map_err(|e| anyhow!("relay setup failed: {e}"))?,
            );
            let node = PeerNode::new(transport, keys.public);
            let (tracker, spent_events) =
                ProofStateTracker::new(mint, Duration::from_secs(10));

            let gateway = GatewayNode::new(
                &config.name,
                keys,
                wallet,
                node,
                lightning,
                tracker,
                Duration::from_secs(config.request_timeout_secs),
                config.invoice_expiry_secs,
            );
            gateway.start(spent_events).await?;
            info!("gateway {} serving as {}", config.name, gateway.public_key());

            // The work happens on the spawned tasks; park this one.
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
