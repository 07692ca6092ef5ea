use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use braid_core::config::PeerConfig;
use braid_core::mint::HttpMintClient;
use braid_core::relay::http::HttpRelayClient;
use braid_core::relay::rpc::PeerNode;
use braid_core::store::ProofDb;
use braid_core::wallet::Wallet;
use braid_dealer::DealerNode;

#[derive(Parser)]
#[command(name = "braid-dealer")]
struct Cli {
    #[arg(long, default_value = "dealer.toml")]
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
    /// Accept a token into the local store.
    ReceiveToken { token: String },
    /// Run the dealer.
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
    let wallet = Arc::new(Wallet::new(keys.clone(), &config.mint_url, mint, db));

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
            let transport = Arc::new(
                HttpRelayClient::new(&config.relay_url, keys.public)
                    .map_err(|e| anyhow!("relay setup failed: {e}"))?,
            );
            let node = PeerNode::new(transport, keys.public);
            let dealer = DealerNode::new(
                &config.name,
                keys,
                wallet,
                node,
                config.fee_sat,
                Duration::from_secs(config.request_timeout_secs),
            );
            dealer.start().await?;
            info!("dealer {} serving as {}", config.name, dealer.public_key());

            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
