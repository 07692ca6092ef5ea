//! Peer G: turns settled lightning payments into hashlocked mint value for
//! the receive flow, and settles hashlocked tokens over lightning for the
//! send flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use secp256k1::PublicKey;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

use braid_core::contract::{SecretKind, SigFlag, SpendConditions};
use braid_core::error::{BraidError, Result};
use braid_core::lightning::backend::LightningBackend;
use braid_core::lightning::settlement::PaymentListener;
use braid_core::lightning::types::PaymentReceivedEvent;
use braid_core::outputs::OutputLock;
use braid_core::proof::{BlindedMessage, Proof};
use braid_core::protocol::{
    InfoResult, MakeInvoiceParams, MakeInvoiceResult, PayInvoiceParams, PayInvoiceResult,
    PeerType, SwapHtlcParams, SwapHtlcResult, unix_now, METHOD_INFO, METHOD_MAKE_INVOICE,
    METHOD_PAY_INVOICE, METHOD_SWAP_HTLC,
};
use braid_core::relay::rpc::{parse_params, MethodHandler, PeerNode, RpcError};
use braid_core::swap::{sign_swap_sig_all, SwapRequest};
use braid_core::token::Token;
use braid_core::tracker::{ProofStateTracker, SetSpent};
use braid_core::wallet::{PeerKeys, Wallet};

/// A receive flow the gateway is carrying, keyed by the authoritative
/// invoice payment hash. `request_preimage_hash` is the payer's correlation
/// value and is echoed back unchanged.
struct PendingReceive {
    payer: PublicKey,
    dealer: PublicKey,
    outputs: Vec<BlindedMessage>,
    request_preimage_hash: String,
    amount: u64,
    expires_at: u64,
    htlc: Option<Vec<Proof>>,
    created_at: u64,
}

pub struct GatewayNode {
    name: String,
    keys: PeerKeys,
    wallet: Arc<Wallet>,
    node: Arc<PeerNode>,
    lightning: Arc<dyn LightningBackend>,
    tracker: Arc<ProofStateTracker>,
    pending: Mutex<HashMap<String, PendingReceive>>,
    request_timeout: Duration,
    invoice_expiry_secs: u64,
}

impl GatewayNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        keys: PeerKeys,
        wallet: Arc<Wallet>,
        node: Arc<PeerNode>,
        lightning: Arc<dyn LightningBackend>,
        tracker: Arc<ProofStateTracker>,
        request_timeout: Duration,
        invoice_expiry_secs: u64,
    ) -> Arc<Self> {
        Arc::new(GatewayNode {
            name: name.into(),
            keys,
            wallet,
            node,
            lightning,
            tracker,
            pending: Mutex::new(HashMap::new()),
            request_timeout,
            invoice_expiry_secs,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    pub async fn balance(&self) -> Result<u64> {
        self.wallet.balance().await
    }

    pub async fn receive_token(&self, token: &str) -> Result<u64> {
        self.wallet.receive_token(token, None).await
    }

    /// Start serving: the relay dispatch loop, the payment listener, the
    /// proof-state tracker, and the locktime reclaim sweep. `spent_events`
    /// is the receiver half of this gateway's tracker.
    pub async fn start(self: &Arc<Self>, spent_events: mpsc::Receiver<SetSpent>) -> Result<()> {
        self.node.serve(self.clone() as Arc<dyn MethodHandler>).await?;

        let (listener, receiver) = PaymentListener::new();
        tokio::spawn(PaymentListener::run(
            self.lightning.clone(),
            listener.sender(),
        ));
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.consume_payments(receiver).await;
        });

        self.tracker.spawn();
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.consume_spent(spent_events).await;
        });

        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if let Err(e) = gateway.reclaim_expired().await {
                    error!("reclaim sweep failed: {e}");
                }
                gateway.sweep_stale().await;
            }
        });

        Ok(())
    }

    /// A tracked set going fully spent means the dealer ran the swap; the
    /// flow is settled regardless of whether its response reached us.
    pub async fn consume_spent(self: &Arc<Self>, mut events: mpsc::Receiver<SetSpent>) {
        while let Some(event) = events.recv().await {
            info!(
                "hashlocked outputs for {} were spent at the mint",
                event.key
            );
            self.pending.lock().await.remove(&event.key);
        }
    }

    /// Consume deduplicated settlement events and drive the dealer swap for
    /// each matching pending receive.
    pub async fn consume_payments(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<PaymentReceivedEvent>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_payment(event).await {
                        error!("receive flow failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("payment consumer lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// One settled invoice: mint the hashlocked outputs, sign the output
    /// commitment, and hand the swap to the dealer.
    pub async fn handle_payment(&self, event: PaymentReceivedEvent) -> Result<()> {
        let payment_hash = hex::encode(event.payment_hash);
        let (dealer, payer, outputs, request_preimage_hash, amount, expires_at) = {
            let pending = self.pending.lock().await;
            let Some(entry) = pending.get(&payment_hash) else {
                info!("settled invoice {payment_hash} matches no pending receive");
                return Ok(());
            };
            if entry.htlc.is_some() {
                info!("receive {payment_hash} already in flight");
                return Ok(());
            }
            (
                entry.dealer,
                entry.payer,
                entry.outputs.clone(),
                entry.request_preimage_hash.clone(),
                entry.amount,
                entry.expires_at,
            )
        };

        let conditions = SpendConditions {
            sig_flag: SigFlag::SigAll,
            pubkeys: vec![self.keys.public],
            n_sigs: Some(1),
            locktime: Some(expires_at),
            refund_keys: vec![self.keys.public],
            n_sigs_refund: Some(1),
        };
        let proofs = self
            .wallet
            .mint_locked(
                amount,
                &OutputLock::Htlc {
                    payment_hash: event.payment_hash,
                    conditions,
                },
            )
            .await?;
        info!("minted {amount} sat hashlocked to invoice {payment_hash}");

        {
            let mut pending = self.pending.lock().await;
            if let Some(entry) = pending.get_mut(&payment_hash) {
                entry.htlc = Some(proofs.clone());
            }
        }
        let ys: Vec<PublicKey> = proofs
            .iter()
            .map(|p| p.y())
            .collect::<Result<_>>()?;
        self.tracker.track(payment_hash.clone(), ys).await;

        let mut request = SwapRequest {
            inputs: proofs,
            outputs,
        };
        sign_swap_sig_all(&self.keys.secret, &mut request, Some(event.preimage))?;
        let SwapRequest { inputs, outputs } = request;

        let keyset = self.wallet.active_keyset().await?;
        let token = Token::new(self.wallet.mint_url().to_string(), keyset.unit, inputs);

        let outcome: Result<SwapHtlcResult> = self
            .node
            .call(
                dealer,
                METHOD_SWAP_HTLC,
                &SwapHtlcParams {
                    token: token.encode()?,
                    blinded_messages: outputs,
                    request_preimage_hash,
                    preimage: hex::encode(event.preimage),
                    payer_pubkey: payer,
                },
                self.request_timeout,
            )
            .await;

        match outcome {
            Ok(result) if result.success => {
                info!("dealer completed swap for invoice {payment_hash}");
                self.pending.lock().await.remove(&payment_hash);
                self.tracker.untrack(&payment_hash).await;
                Ok(())
            }
            Ok(_) => Err(BraidError::Protocol(
                "dealer declined the swap".to_string(),
            )),
            // The contract stays pending; the locktime sweep recovers it.
            Err(e) => Err(e),
        }
    }

    /// Refund-path sweep: reclaim hashlocked value whose invoice expired
    /// without the dealer completing the swap.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let now = unix_now();
        let expired: Vec<(String, Vec<Proof>)> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .filter_map(|(key, entry)| {
                    entry.htlc.clone().map(|proofs| (key.clone(), proofs))
                })
                .collect()
        };

        let mut reclaimed = 0u64;
        for (payment_hash, proofs) in expired {
            match self.wallet.reclaim_proofs(proofs).await {
                Ok(amount) => {
                    reclaimed += amount;
                    info!("reclaimed {amount} sat from abandoned receive {payment_hash}");
                }
                Err(BraidError::Mint { code, detail }) => {
                    info!(
                        "receive {payment_hash} already settled elsewhere (mint {code}: {detail})"
                    );
                }
                Err(e) => {
                    error!("reclaim of {payment_hash} failed: {e}");
                    continue;
                }
            }
            self.pending.lock().await.remove(&payment_hash);
            self.tracker.untrack(&payment_hash).await;
        }
        Ok(reclaimed)
    }

    /// Drop entries that never minted and whose invoice is long expired.
    async fn sweep_stale(&self) {
        let now = unix_now();
        self.pending.lock().await.retain(|_, entry| {
            entry.htlc.is_some() || entry.expires_at + 3600 > now
        });
    }

    async fn handle_make_invoice(
        &self,
        from: PublicKey,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: MakeInvoiceParams = parse_params(params)?;
        if params.blinded_messages.is_empty() {
            return Err(RpcError::bad_params("no blinded outputs"));
        }
        let committed: u64 = params.blinded_messages.iter().map(|m| m.amount).sum();
        if committed != params.amount {
            return Err(RpcError::bad_params(format!(
                "outputs commit {committed} sat but the invoice is for {} sat",
                params.amount
            )));
        }
        let hodl_hash: [u8; 32] = hex::decode(&params.preimage_hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| RpcError::bad_params("preimage_hash must be 32 bytes of hex"))?;

        let invoice = self
            .lightning
            .make_invoice(
                params.amount,
                &format!("braid receive {}", &params.preimage_hash[..8]),
                self.invoice_expiry_secs,
                Some(hodl_hash),
            )
            .await
            .map_err(|e| RpcError::handler_failure(format!("invoice creation failed: {e}")))?;

        let payment_hash = hex::encode(invoice.payment_hash);
        info!(
            "created {} sat invoice {payment_hash} for receive {}",
            params.amount, params.preimage_hash
        );
        self.pending.lock().await.insert(
            payment_hash,
            PendingReceive {
                payer: from,
                dealer: params.dealer_pubkey,
                outputs: params.blinded_messages,
                request_preimage_hash: params.preimage_hash,
                amount: params.amount,
                expires_at: invoice.expires_at,
                htlc: None,
                created_at: unix_now(),
            },
        );

        serde_json::to_value(MakeInvoiceResult {
            invoice: invoice.payment_request,
        })
        .map_err(|e| RpcError::handler_failure(e.to_string()))
    }

    async fn handle_pay_invoice(
        &self,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: PayInvoiceParams = parse_params(params)?;
        let invoice: Bolt11Invoice = params
            .invoice
            .parse()
            .map_err(|e| RpcError::bad_params(format!("invalid invoice: {e}")))?;
        let payment_hash: [u8; 32] = invoice.payment_hash().to_byte_array();
        let amount = invoice
            .amount_milli_satoshis()
            .map(|msat| msat / 1000)
            .ok_or_else(|| RpcError::bad_params("invoice carries no amount"))?;

        let token = Token::decode(&params.token)
            .map_err(|e| RpcError::bad_params(format!("invalid token: {e}")))?;
        if token.mint_url != self.wallet.mint_url() {
            return Err(RpcError::bad_params("token is for a foreign mint"));
        }
        if token.total_amount() != amount {
            return Err(RpcError::bad_params(format!(
                "token carries {} sat but the invoice is for {amount} sat",
                token.total_amount()
            )));
        }

        let expected_hash = hex::encode(payment_hash);
        let now = unix_now();
        for proof in &token.proofs {
            let contract = proof
                .contract()
                .map_err(|e| RpcError::bad_params(format!("malformed contract: {e}")))?;
            if contract.kind != SecretKind::Htlc {
                return Err(RpcError::bad_params("proof is not hashlocked"));
            }
            if contract.data != expected_hash {
                return Err(RpcError::bad_params(
                    "contract hash does not match the invoice payment hash",
                ));
            }
            if !contract.conditions.pubkeys.contains(&self.keys.public) {
                return Err(RpcError::bad_params("contract is not locked to this gateway"));
            }
            if contract.conditions.locktime.is_some_and(|t| t <= now) {
                return Err(RpcError::bad_params("contract is already refundable"));
            }
        }

        let payment = self
            .lightning
            .pay_invoice(&params.invoice)
            .await
            .map_err(|e| RpcError::handler_failure(format!("payment failed: {e}")))?;
        info!("paid invoice {expected_hash} over lightning");

        // The preimage is ours now; a claim hiccup is recoverable locally
        // and must not cost the payer their proof-of-payment.
        if let Err(e) = self
            .wallet
            .claim_htlc_token(&token, payment.preimage)
            .await
        {
            error!("failed to claim hashlocked token after paying: {e}");
        }

        serde_json::to_value(PayInvoiceResult {
            preimage: hex::encode(payment.preimage),
            fees_paid: payment.fee_msat / 1000,
        })
        .map_err(|e| RpcError::handler_failure(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MethodHandler for GatewayNode {
    async fn handle(
        &self,
        from: PublicKey,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            METHOD_INFO => serde_json::to_value(InfoResult {
                peer_type: PeerType::Gateway,
                name: self.name.clone(),
                timestamp: unix_now(),
            })
            .map_err(|e| RpcError::handler_failure(e.to_string())),
            METHOD_MAKE_INVOICE => self.handle_make_invoice(from, params).await,
            METHOD_PAY_INVOICE => self.handle_pay_invoice(params).await,
            other => Err(RpcError::unknown_method(other)),
        }
    }
}
