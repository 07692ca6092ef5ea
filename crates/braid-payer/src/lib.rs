//! Peer A: initiates receive and send flows and accepts the dealer's
//! forwarded blinded signatures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use secp256k1::PublicKey;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use braid_core::contract::{SecretKind, SigFlag, SpendConditions};
use braid_core::crypto::{random_preimage, sha256};
use braid_core::error::{BraidError, Result};
use braid_core::outputs::{blinded_messages, create_outputs, unblind_outputs, OutputData, OutputLock};
use braid_core::proof::total_amount;
use braid_core::protocol::{
    BlindedSignaturesParams, BlindedSignaturesResult, DealerFeeParams, DealerFeeResult,
    InfoResult, MakeInvoiceParams, MakeInvoiceResult, PayInvoiceParams, PayInvoiceResult,
    PeerType, unix_now, METHOD_BLINDED_SIGNATURES, METHOD_INFO, METHOD_MAKE_INVOICE,
    METHOD_PAY_INVOICE, METHOD_REQUEST_DEALER_FEE,
};
use braid_core::relay::rpc::{parse_params, MethodHandler, PeerNode, RpcError};
use braid_core::wallet::{PeerKeys, Wallet};

/// An in-flight receive flow, keyed by the preimage hash we asked the
/// gateway to bind the invoice to.
struct PendingHtlcRequest {
    outputs: Vec<OutputData>,
    amount: u64,
    dealer: PublicKey,
    created_at: u64,
    done: Option<oneshot::Sender<u64>>,
}

#[derive(Debug)]
pub struct PayReceipt {
    pub preimage: [u8; 32],
    pub fees_paid: u64,
}

pub struct PayerNode {
    name: String,
    keys: PeerKeys,
    wallet: Arc<Wallet>,
    node: Arc<PeerNode>,
    pending: Mutex<HashMap<String, PendingHtlcRequest>>,
    request_timeout: Duration,
}

impl PayerNode {
    pub fn new(
        name: impl Into<String>,
        keys: PeerKeys,
        wallet: Arc<Wallet>,
        node: Arc<PeerNode>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(PayerNode {
            name: name.into(),
            keys,
            wallet,
            node,
            pending: Mutex::new(HashMap::new()),
            request_timeout,
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.node.serve(self.clone() as Arc<dyn MethodHandler>).await
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

    pub async fn reclaim(&self) -> Result<u64> {
        self.wallet.reclaim_expired_htlcs().await
    }

    pub async fn peer_info(&self, peer: PublicKey) -> Result<InfoResult> {
        self.node
            .call(peer, METHOD_INFO, &Value::Null, self.request_timeout)
            .await
    }

    /// Kick off a receive flow: negotiate the dealer fee, commit our own
    /// blinded outputs, and ask the gateway for an invoice. The returned
    /// channel resolves with the received amount once the dealer forwards
    /// our blinded signatures.
    pub async fn receive(
        &self,
        amount: u64,
        gateway: PublicKey,
        dealer: PublicKey,
    ) -> Result<(String, oneshot::Receiver<u64>)> {
        if amount == 0 {
            return Err(BraidError::Amount("amount must be positive".to_string()));
        }
        self.sweep_stale().await;

        let preimage = random_preimage();
        let preimage_hash = hex::encode(sha256(&preimage));

        let fee: DealerFeeResult = self
            .node
            .call(
                dealer,
                METHOD_REQUEST_DEALER_FEE,
                &DealerFeeParams {
                    preimage_hash: preimage_hash.clone(),
                    amount,
                },
                self.request_timeout,
            )
            .await?;
        info!("dealer quoted {} sat flat fee", fee.fee_amount);

        let keyset = self.wallet.active_keyset().await?;
        let outputs = create_outputs(
            amount,
            &keyset.id,
            &OutputLock::P2pk {
                owner: self.keys.public,
                conditions: SpendConditions::default(),
            },
        )?;

        let (done, completion) = oneshot::channel();
        self.pending.lock().await.insert(
            preimage_hash.clone(),
            PendingHtlcRequest {
                outputs: outputs.clone(),
                amount,
                dealer,
                created_at: unix_now(),
                done: Some(done),
            },
        );

        let mut combined = fee.blinded_messages.clone();
        combined.extend(blinded_messages(&outputs));

        let invoice: Result<MakeInvoiceResult> = self
            .node
            .call(
                gateway,
                METHOD_MAKE_INVOICE,
                &MakeInvoiceParams {
                    amount: amount + fee.fee_amount,
                    preimage_hash: preimage_hash.clone(),
                    blinded_messages: combined,
                    dealer_pubkey: dealer,
                },
                self.request_timeout,
            )
            .await;

        match invoice {
            Ok(result) => Ok((result.invoice, completion)),
            Err(e) => {
                self.pending.lock().await.remove(&preimage_hash);
                Err(e)
            }
        }
    }

    /// Pay a lightning invoice through the gateway with a hashlocked token.
    pub async fn pay(
        &self,
        raw_invoice: &str,
        gateway: PublicKey,
        amount_override: Option<u64>,
    ) -> Result<PayReceipt> {
        let invoice: Bolt11Invoice = raw_invoice
            .parse()
            .map_err(|e| BraidError::Protocol(format!("invalid invoice: {e}")))?;
        let payment_hash: [u8; 32] = invoice.payment_hash().to_byte_array();

        let invoice_amount = invoice.amount_milli_satoshis().map(|msat| msat / 1000);
        let amount = match (invoice_amount, amount_override) {
            (Some(invoice_amount), Some(chosen)) if invoice_amount != chosen => {
                return Err(BraidError::Amount(format!(
                    "invoice is for {invoice_amount} sat, not {chosen} sat"
                )));
            }
            (Some(invoice_amount), _) => invoice_amount,
            (None, Some(chosen)) => chosen,
            (None, None) => {
                return Err(BraidError::Amount(
                    "invoice carries no amount and none was given".to_string(),
                ));
            }
        };
        if amount == 0 {
            return Err(BraidError::Amount("amount must be positive".to_string()));
        }

        let expires_at =
            (invoice.duration_since_epoch() + invoice.expiry_time()).as_secs();
        let conditions = SpendConditions {
            sig_flag: SigFlag::SigInputs,
            pubkeys: vec![gateway],
            n_sigs: Some(1),
            locktime: Some(expires_at),
            refund_keys: vec![self.keys.public],
            n_sigs_refund: Some(1),
        };

        let token = self
            .wallet
            .send_htlc(amount, payment_hash, conditions)
            .await?;
        info!("committed {amount} sat to hashlocked contract");

        let result: PayInvoiceResult = self
            .node
            .call(
                gateway,
                METHOD_PAY_INVOICE,
                &PayInvoiceParams {
                    invoice: raw_invoice.to_string(),
                    token: token.encode()?,
                },
                self.request_timeout,
            )
            .await?;

        let preimage: [u8; 32] = hex::decode(&result.preimage)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| BraidError::Crypto("gateway returned malformed preimage".to_string()))?;
        if sha256(&preimage) != payment_hash {
            // The contract stays recorded; the refund path reclaims it.
            return Err(BraidError::Crypto(
                "gateway returned preimage for the wrong hash".to_string(),
            ));
        }

        self.wallet.settle_pending_htlc(&payment_hash).await?;
        Ok(PayReceipt {
            preimage,
            fees_paid: result.fees_paid,
        })
    }

    /// Drop receive-flow state older than a day; those invoices are long
    /// expired.
    async fn sweep_stale(&self) {
        let cutoff = unix_now().saturating_sub(24 * 3600);
        self.pending
            .lock()
            .await
            .retain(|_, entry| entry.created_at >= cutoff);
    }

    async fn handle_blinded_signatures(
        &self,
        from: PublicKey,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: BlindedSignaturesParams = parse_params(params)?;

        let mut entry = {
            let mut pending = self.pending.lock().await;
            pending
                .remove(&params.preimage_hash)
                .ok_or_else(|| RpcError::handler_failure("no pending request for preimage hash"))?
        };
        if from != entry.dealer {
            self.pending.lock().await.insert(params.preimage_hash, entry);
            return Err(RpcError::handler_failure(
                "signatures forwarded by unexpected peer",
            ));
        }

        let keyset = self
            .wallet
            .active_keyset()
            .await
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;
        let proofs = unblind_outputs(&entry.outputs, &params.signatures, &keyset)
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;

        for proof in &proofs {
            let contract = proof
                .contract()
                .map_err(|e| RpcError::handler_failure(e.to_string()))?;
            if contract.kind != SecretKind::P2pk
                || contract.locking_pubkey().ok() != Some(self.keys.public)
            {
                return Err(RpcError::handler_failure(
                    "proof is locked to an unexpected key",
                ));
            }
        }

        self.wallet
            .db()
            .save_proofs(&proofs)
            .await
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;

        let total = total_amount(&proofs);
        info!(
            "receive flow {} settled for {total} sat ({} expected)",
            params.preimage_hash, entry.amount
        );
        if let Some(done) = entry.done.take() {
            let _ = done.send(total);
        }

        serde_json::to_value(BlindedSignaturesResult {
            success: true,
            total_amount: total,
        })
        .map_err(|e| RpcError::handler_failure(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MethodHandler for PayerNode {
    async fn handle(
        &self,
        from: PublicKey,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            METHOD_INFO => serde_json::to_value(InfoResult {
                peer_type: PeerType::Payer,
                name: self.name.clone(),
                timestamp: unix_now(),
            })
            .map_err(|e| RpcError::handler_failure(e.to_string())),
            METHOD_BLINDED_SIGNATURES => self.handle_blinded_signatures(from, params).await,
            other => {
                warn!("rejecting unsupported method {other:?}");
                Err(RpcError::unknown_method(other))
            }
        }
    }
}
