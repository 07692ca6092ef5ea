use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use braid_core::config::PeerConfig;
use braid_core::crypto::pubkey_from_hex;
use braid_core::mint::HttpMintClient;
use braid_core::relay::http::HttpRelayClient;
use braid_core::relay::rpc::PeerNode;
use braid_core::store::ProofDb;
use braid_core::wallet::Wallet;
use braid_payer::PayerNode;

#[derive(Parser)]
#[command(name = "braid-payer")]
struct Cli {
    #[arg(long, default_value = "payer.toml")]
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
    /// Query another peer's info record.
    Info { pubkey: String },
    /// Accept a token into the local store.
    ReceiveToken { token: String },
    /// Receive value over lightning via a gateway and a dealer.
    Receive {
        amount: u64,
        gateway: String,
        dealer: String,
    },
    /// Pay a lightning invoice through a gateway.
    Pay {
        invoice: String,
        gateway: String,
        amount: Option<u64>,
    },
    /// Sweep expired outbound contracts back into the store.
    Reclaim,
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

    let transport = Arc::new(HttpRelayClient::new(&config.relay_url, keys.public)
        .map_err(|e| anyhow!("relay setup failed: {e}"))?);
    let node = PeerNode::new(transport, keys.public);
    let payer = PayerNode::new(
        &config.name,
        keys,
        wallet,
        node,
        Duration::from_secs(config.request_timeout_secs),
    );
    payer.start().await?;

    match cli.command {
        Commands::Pk => unreachable!("handled above"),
        Commands::Balance => {
            println!("{} sat", payer.balance().await?);
        }
        Commands::Info { pubkey } => {
            let info = payer.peer_info(pubkey_from_hex(&pubkey)?).await?;
            println!(
                "{} ({}) at {}",
                info.name, info.peer_type, info.timestamp
            );
        }
        Commands::ReceiveToken { token } => {
            let amount = payer.receive_token(&token).await?;
            println!("received {amount} sat");
        }
        Commands::Receive {
            amount,
            gateway,
            dealer,
        } => {
            let gateway = pubkey_from_hex(&gateway)?;
            let dealer = pubkey_from_hex(&dealer)?;
            let (invoice, completion) = payer.receive(amount, gateway, dealer).await?;
            println!("pay this invoice to complete the receive:");
            println!("{invoice}");

            let wait = Duration::from_secs(config.invoice_expiry_secs + 60);
            let received = tokio::time::timeout(wait, completion)
                .await
                .map_err(|_| anyhow!("timed out waiting for the swap to settle"))?
                .map_err(|_| anyhow!("flow abandoned before settling"))?;
            println!("received {received} sat");
        }
        Commands::Pay {
            invoice,
            gateway,
            amount,
        } => {
            let gateway = pubkey_from_hex(&gateway)?;
            let receipt = payer.pay(&invoice, gateway, amount).await?;
            println!("paid; preimage {}", hex::encode(receipt.preimage));
            println!("lightning fees: {} sat", receipt.fees_paid);
        }
        Commands::Reclaim => {
            let amount = payer.reclaim().await?;
            println!("reclaimed {amount} sat");
        }
    }
    Ok(())
}
