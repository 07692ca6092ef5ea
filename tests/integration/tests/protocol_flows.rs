//! End-to-end protocol scenarios over an in-memory relay, an in-process
//! mint, and a fake lightning backend, with all three peers running in one
//! process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use secp256k1::PublicKey;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;

use braid_core::contract::{SigFlag, SpendConditions};
use braid_core::crypto::{random_preimage, random_secret_key, sha256};
use braid_core::error::BraidError;
use braid_core::lightning::backend::LightningBackend;
use braid_core::mint::MintConnector;
use braid_core::outputs::{blinded_messages, create_outputs, OutputLock};
use braid_core::protocol::{unix_now, PayInvoiceParams, PeerType, METHOD_PAY_INVOICE};
use braid_core::relay::memory::MemoryRelay;
use braid_core::relay::rpc::{MethodHandler, PeerNode, RpcError, CODE_BAD_PARAMS};
use braid_core::store::ProofDb;
use braid_core::swap::{sign_swap_sig_all, SwapRequest};
use braid_core::token::Token;
use braid_core::tracker::ProofStateTracker;
use braid_core::wallet::{PeerKeys, Wallet};
use braid_dealer::DealerNode;
use braid_gateway::GatewayNode;
use braid_integration::lightning::FakeLightning;
use braid_integration::mint::TestMint;
use braid_payer::PayerNode;

const PAYER_FUNDS: u64 = 100;
const GATEWAY_FUNDS: u64 = 1000;
const FEE: u64 = 2;

struct TestNet {
    mint: Arc<TestMint>,
    lightning: Arc<FakeLightning>,
    relay: Arc<MemoryRelay>,
    payer: Arc<PayerNode>,
    payer_wallet: Arc<Wallet>,
    gateway: Arc<GatewayNode>,
    gateway_wallet: Arc<Wallet>,
    dealer_wallet: Arc<Wallet>,
    gateway_key: PublicKey,
    dealer_key: PublicKey,
}

struct NetOptions {
    invoice_expiry_secs: u64,
    request_timeout: Duration,
    dealer_vanishes: bool,
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions {
            invoice_expiry_secs: 3600,
            request_timeout: Duration::from_secs(10),
            dealer_vanishes: false,
        }
    }
}

async fn fresh_wallet(mint: &Arc<TestMint>, keys: &PeerKeys) -> Arc<Wallet> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    let db = ProofDb::new(pool);
    db.init_schema().await.expect("schema");
    Arc::new(Wallet::new(
        keys.clone(),
        TestMint::url(),
        mint.clone(),
        db,
    ))
}

async fn fund(mint: &Arc<TestMint>, wallet: &Wallet, owner: &PublicKey, amount: u64) {
    let proofs = mint.issue_to(owner, amount);
    wallet.db().save_proofs(&proofs).await.expect("funding");
}

/// Dealer wrapper that answers fee requests but goes dark on the swap.
struct VanishingDealer {
    inner: Arc<DealerNode>,
}

#[async_trait::async_trait]
impl MethodHandler for VanishingDealer {
    async fn handle(
        &self,
        from: PublicKey,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        if method == braid_core::protocol::METHOD_SWAP_HTLC {
            std::future::pending::<()>().await;
        }
        self.inner.handle(from, method, params).await
    }
}

struct NullHandler;

#[async_trait::async_trait]
impl MethodHandler for NullHandler {
    async fn handle(
        &self,
        _from: PublicKey,
        method: &str,
        _params: Value,
    ) -> std::result::Result<Value, RpcError> {
        Err(RpcError::unknown_method(method))
    }
}

async fn spawn_net(options: NetOptions) -> TestNet {
    let mint = TestMint::new();
    let lightning = FakeLightning::new();
    let relay = MemoryRelay::new();

    let payer_keys = PeerKeys::new(random_secret_key());
    let gateway_keys = PeerKeys::new(random_secret_key());
    let dealer_keys = PeerKeys::new(random_secret_key());

    let payer_wallet = fresh_wallet(&mint, &payer_keys).await;
    let gateway_wallet = fresh_wallet(&mint, &gateway_keys).await;
    let dealer_wallet = fresh_wallet(&mint, &dealer_keys).await;

    fund(&mint, &payer_wallet, &payer_keys.public, PAYER_FUNDS).await;
    fund(&mint, &gateway_wallet, &gateway_keys.public, GATEWAY_FUNDS).await;

    let payer_node = PeerNode::new(
        Arc::new(relay.endpoint(payer_keys.public).await),
        payer_keys.public,
    );
    let gateway_node = PeerNode::new(
        Arc::new(relay.endpoint(gateway_keys.public).await),
        gateway_keys.public,
    );
    let dealer_node = PeerNode::new(
        Arc::new(relay.endpoint(dealer_keys.public).await),
        dealer_keys.public,
    );

    let payer = PayerNode::new(
        "alice",
        payer_keys.clone(),
        payer_wallet.clone(),
        payer_node,
        options.request_timeout,
    );
    payer.start().await.expect("payer serves");

    let (tracker, spent_events) =
        ProofStateTracker::new(mint.clone(), Duration::from_millis(200));
    let gateway = GatewayNode::new(
        "gigi",
        gateway_keys.clone(),
        gateway_wallet.clone(),
        gateway_node.clone(),
        lightning.clone(),
        tracker,
        options.request_timeout,
        options.invoice_expiry_secs,
    );
    gateway.start(spent_events).await.expect("gateway serves");

    let dealer = DealerNode::new(
        "dave",
        dealer_keys.clone(),
        dealer_wallet.clone(),
        dealer_node.clone(),
        FEE,
        options.request_timeout,
    );
    if options.dealer_vanishes {
        dealer_node
            .serve(Arc::new(VanishingDealer {
                inner: dealer.clone(),
            }))
            .await
            .expect("vanishing dealer serves");
    } else {
        dealer.start().await.expect("dealer serves");
    }

    // Let the spawned listeners subscribe before any event fires.
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestNet {
        mint,
        lightning,
        relay,
        payer,
        payer_wallet,
        gateway,
        gateway_wallet,
        dealer_wallet,
        gateway_key: gateway_keys.public,
        dealer_key: dealer_keys.public,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_happy_path() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    let invoice = net
        .lightning
        .make_invoice(21, "coffee", 3600, None)
        .await?;
    let receipt = net
        .payer
        .pay(&invoice.payment_request, net.gateway_key, None)
        .await?;

    assert_eq!(sha256(&receipt.preimage), invoice.payment_hash);
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS - 21);
    assert_eq!(net.gateway.balance().await?, GATEWAY_FUNDS + 21);
    assert_eq!(net.lightning.sent_sat(), 21);

    // The settled contract left no refund entry behind.
    assert_eq!(net.payer.reclaim().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn send_amount_mismatch_is_rejected() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;
    let invoice = net
        .lightning
        .make_invoice(21, "coffee", 3600, None)
        .await?;

    let err = net
        .payer
        .pay(&invoice.payment_request, net.gateway_key, Some(42))
        .await
        .unwrap_err();
    assert!(matches!(err, BraidError::Amount(_)));
    // Nothing was committed.
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn send_payment_hash_mismatch_refunds_after_locktime() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    let invoice = net
        .lightning
        .make_invoice(21, "coffee", 3600, None)
        .await?;

    // A hashlocked token committed to the wrong hash.
    let wrong_hash = sha256(&random_preimage());
    let token = net
        .payer_wallet
        .send_htlc(
            21,
            wrong_hash,
            SpendConditions {
                sig_flag: SigFlag::SigInputs,
                pubkeys: vec![net.gateway_key],
                n_sigs: Some(1),
                locktime: Some(unix_now() + 2),
                refund_keys: vec![net.payer.public_key()],
                n_sigs_refund: Some(1),
            },
        )
        .await?;
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS - 21);

    let probe_keys = PeerKeys::new(random_secret_key());
    let probe = PeerNode::new(
        Arc::new(net.relay.endpoint(probe_keys.public).await),
        probe_keys.public,
    );
    probe.serve(Arc::new(NullHandler)).await?;

    let err = probe
        .call::<_, braid_core::protocol::PayInvoiceResult>(
            net.gateway_key,
            METHOD_PAY_INVOICE,
            &PayInvoiceParams {
                invoice: invoice.payment_request.clone(),
                token: token.encode()?,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    match err {
        BraidError::Rpc { code, .. } => assert_eq!(code, CODE_BAD_PARAMS),
        other => panic!("unexpected error: {other}"),
    }

    // The gateway never paid or claimed anything.
    assert_eq!(net.lightning.sent_sat(), 0);
    assert_eq!(net.gateway.balance().await?, GATEWAY_FUNDS);

    // After the locktime the committed value comes back.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(net.payer.reclaim().await?, 21);
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_happy_path() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    let (invoice, completion) = net
        .payer
        .receive(21, net.gateway_key, net.dealer_key)
        .await?;

    // The invoice is for the amount plus the dealer fee.
    let parsed: Bolt11Invoice = invoice.parse().unwrap();
    assert_eq!(parsed.amount_milli_satoshis(), Some((21 + FEE) * 1000));

    net.lightning.pay_external(&invoice);

    let received = tokio::time::timeout(Duration::from_secs(15), completion)
        .await
        .expect("flow settles in time")
        .expect("flow completed");
    assert_eq!(received, 21);

    assert_eq!(net.payer.balance().await?, PAYER_FUNDS + 21);
    assert_eq!(net.dealer_wallet.balance().await?, FEE);
    assert_eq!(net.gateway.balance().await?, GATEWAY_FUNDS - 21 - FEE);
    assert_eq!(net.lightning.received_sat(), 21 + FEE);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_payment_notifications_run_one_swap() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    let (invoice, completion) = net
        .payer
        .receive(21, net.gateway_key, net.dealer_key)
        .await?;
    net.lightning.pay_external(&invoice);
    tokio::time::timeout(Duration::from_secs(15), completion)
        .await
        .expect("flow settles in time")
        .expect("flow completed");

    let swaps_after_flow = net.mint.swap_count();

    let parsed: Bolt11Invoice = invoice.parse().unwrap();
    net.lightning
        .resend_notification(parsed.payment_hash().to_byte_array());
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(net.mint.swap_count(), swaps_after_flow);
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS + 21);
    assert_eq!(net.dealer_wallet.balance().await?, FEE);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_with_dealer_dropout_refunds_gateway() -> Result<()> {
    let net = spawn_net(NetOptions {
        invoice_expiry_secs: 1,
        request_timeout: Duration::from_secs(1),
        dealer_vanishes: true,
    })
    .await;

    let (invoice, completion) = net
        .payer
        .receive(21, net.gateway_key, net.dealer_key)
        .await?;
    net.lightning.pay_external(&invoice);

    // The gateway mints, the dealer never answers, the invoice expires.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(net.gateway.balance().await?, GATEWAY_FUNDS - 21 - FEE);

    let reclaimed = net.gateway.reclaim_expired().await?;
    assert_eq!(reclaimed, 21 + FEE);
    assert_eq!(net.gateway.balance().await?, GATEWAY_FUNDS);

    // Neither counterparty ended up with value.
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS);
    assert_eq!(net.dealer_wallet.balance().await?, 0);
    drop(completion);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_output_commitment_is_rejected() -> Result<()> {
    let mint = TestMint::new();
    let keys = PeerKeys::new(random_secret_key());
    let preimage = random_preimage();
    let payment_hash = sha256(&preimage);

    let conditions = SpendConditions {
        sig_flag: SigFlag::SigAll,
        pubkeys: vec![keys.public],
        n_sigs: Some(1),
        locktime: Some(unix_now() + 3600),
        refund_keys: vec![keys.public],
        n_sigs_refund: Some(1),
    };
    let secret = braid_core::contract::ContractSecret::htlc(&payment_hash, conditions);
    let inputs = vec![
        mint.issue_proof(&secret.to_string(), 16),
        mint.issue_proof(
            &braid_core::contract::ContractSecret::htlc(
                &payment_hash,
                secret.conditions.clone(),
            )
            .to_string(),
            4,
        ),
    ];

    let lock = OutputLock::P2pk {
        owner: keys.public,
        conditions: SpendConditions::default(),
    };
    let outputs = create_outputs(20, mint.keyset_id(), &lock)?;
    let mut request = SwapRequest {
        inputs,
        outputs: blinded_messages(&outputs),
    };
    sign_swap_sig_all(&keys.secret, &mut request, Some(preimage))?;

    // One bit of one output commitment flipped after signing.
    let mut tampered = request.clone();
    tampered.outputs[0].b = random_secret_key().public_key(secp256k1::global::SECP256K1);
    let err = mint.swap(tampered).await.unwrap_err();
    assert!(matches!(err, BraidError::Mint { code: 10003, .. }));

    // The untampered request still goes through.
    mint.swap(request).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_token_handoff() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    // A sends 5 sat locked to the dealer's key; only the dealer can
    // receive it.
    let proofs = net
        .payer_wallet
        .mint_locked(
            5,
            &OutputLock::P2pk {
                owner: net.dealer_key,
                conditions: SpendConditions::default(),
            },
        )
        .await?;
    let token = Token::new(TestMint::url(), "sat", proofs);
    let encoded = token.encode()?;

    let err = net
        .gateway_wallet
        .receive_token(&encoded, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BraidError::Token(_)));

    let received = net.dealer_wallet.receive_token(&encoded, None).await?;
    assert_eq!(received, 5);
    assert_eq!(net.payer.balance().await?, PAYER_FUNDS - 5);
    assert_eq!(net.dealer_wallet.balance().await?, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_answer_info() -> Result<()> {
    let net = spawn_net(NetOptions::default()).await;

    let info = net.payer.peer_info(net.gateway_key).await?;
    assert_eq!(info.peer_type, PeerType::Gateway);
    assert_eq!(info.name, "gigi");

    let info = net.payer.peer_info(net.dealer_key).await?;
    assert_eq!(info.peer_type, PeerType::Dealer);
    Ok(())
}
