//! Peer D: quotes a flat fee for receive flows, executes the gateway's
//! hashlocked swap at the mint, keeps its fee share, and forwards the
//! payer's blinded signatures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secp256k1::PublicKey;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use braid_core::contract::{SecretKind, SpendConditions};
use braid_core::crypto::sha256;
use braid_core::error::{BraidError, Result};
use braid_core::outputs::{blinded_messages, create_outputs, unblind_outputs, OutputData, OutputLock};
use braid_core::proof::total_amount;
use braid_core::protocol::{
    BlindedSignaturesParams, BlindedSignaturesResult, DealerFeeParams, DealerFeeResult,
    InfoResult, PeerType, SwapHtlcParams, SwapHtlcResult, unix_now, METHOD_BLINDED_SIGNATURES,
    METHOD_INFO, METHOD_REQUEST_DEALER_FEE, METHOD_SWAP_HTLC,
};
use braid_core::relay::rpc::{parse_params, MethodHandler, PeerNode, RpcError};
use braid_core::swap::SwapRequest;
use braid_core::token::Token;
use braid_core::wallet::{PeerKeys, Wallet};

/// A quoted fee waiting for its swap, keyed by the payer's preimage hash.
struct PendingDealerFee {
    outputs: Vec<OutputData>,
    amount: u64,
    payer: PublicKey,
    created_at: u64,
}

pub struct DealerNode {
    name: String,
    keys: PeerKeys,
    wallet: Arc<Wallet>,
    node: Arc<PeerNode>,
    fee_sat: u64,
    request_timeout: Duration,
    pending: Mutex<HashMap<String, PendingDealerFee>>,
}

impl DealerNode {
    pub fn new(
        name: impl Into<String>,
        keys: PeerKeys,
        wallet: Arc<Wallet>,
        node: Arc<PeerNode>,
        fee_sat: u64,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(DealerNode {
            name: name.into(),
            keys,
            wallet,
            node,
            fee_sat,
            request_timeout,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    pub async fn balance(&self) -> Result<u64> {
        self.wallet.balance().await
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.node.serve(self.clone() as Arc<dyn MethodHandler>).await?;

        let dealer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(300)).await;
                dealer.sweep_stale().await;
            }
        });
        Ok(())
    }

    /// Quotes expire after an hour; the payer retries from scratch.
    async fn sweep_stale(&self) {
        let cutoff = unix_now().saturating_sub(3600);
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.created_at >= cutoff);
        let dropped = before - pending.len();
        if dropped > 0 {
            info!("dropped {dropped} stale fee quotes");
        }
    }

    async fn handle_request_dealer_fee(
        &self,
        from: PublicKey,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: DealerFeeParams = parse_params(params)?;
        if params.amount == 0 {
            return Err(RpcError::bad_params("amount must be positive"));
        }
        let valid_hash = hex::decode(&params.preimage_hash)
            .map(|bytes| bytes.len() == 32)
            .unwrap_or(false);
        if !valid_hash {
            return Err(RpcError::bad_params("preimage_hash must be 32 bytes of hex"));
        }

        let keyset = self
            .wallet
            .active_keyset()
            .await
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;
        let outputs = create_outputs(
            self.fee_sat,
            &keyset.id,
            &OutputLock::P2pk {
                owner: self.keys.public,
                conditions: SpendConditions::default(),
            },
        )
        .map_err(|e| RpcError::handler_failure(e.to_string()))?;

        let messages = blinded_messages(&outputs);
        let replaced = self
            .pending
            .lock()
            .await
            .insert(
                params.preimage_hash.clone(),
                PendingDealerFee {
                    outputs,
                    amount: self.fee_sat,
                    payer: from,
                    created_at: unix_now(),
                },
            )
            .is_some();
        if replaced {
            warn!(
                "replacing earlier fee quote for {}",
                params.preimage_hash
            );
        }
        info!(
            "quoted {} sat fee for receive {} of {} sat",
            self.fee_sat, params.preimage_hash, params.amount
        );

        serde_json::to_value(DealerFeeResult {
            fee_amount: self.fee_sat,
            blinded_messages: messages,
        })
        .map_err(|e| RpcError::handler_failure(e.to_string()))
    }

    async fn handle_swap_htlc(
        &self,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: SwapHtlcParams = parse_params(params)?;

        let (fee_outputs, payer, quoted_fee) = {
            let pending = self.pending.lock().await;
            let entry = pending
                .get(&params.request_preimage_hash)
                .ok_or_else(|| RpcError::handler_failure("no fee quote for this flow"))?;
            (entry.outputs.clone(), entry.payer, entry.amount)
        };
        if payer != params.payer_pubkey {
            return Err(RpcError::bad_params(
                "payer key does not match the fee quote",
            ));
        }

        let preimage: [u8; 32] = hex::decode(&params.preimage)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| RpcError::bad_params("preimage must be 32 bytes of hex"))?;
        let preimage_digest = hex::encode(sha256(&preimage));

        let token = Token::decode(&params.token)
            .map_err(|e| RpcError::bad_params(format!("invalid token: {e}")))?;
        if token.mint_url != self.wallet.mint_url() {
            return Err(RpcError::bad_params("token is for a foreign mint"));
        }
        for proof in &token.proofs {
            let contract = proof
                .contract()
                .map_err(|e| RpcError::bad_params(format!("malformed contract: {e}")))?;
            if contract.kind != SecretKind::Htlc {
                return Err(RpcError::bad_params("input is not hashlocked"));
            }
            if contract.data != preimage_digest {
                return Err(RpcError::bad_params(
                    "preimage does not resolve the hashlock",
                ));
            }
        }

        let ours = blinded_messages(&fee_outputs);
        if params.blinded_messages.len() < ours.len()
            || params.blinded_messages[..ours.len()] != ours[..]
        {
            return Err(RpcError::bad_params(
                "output list does not start with the quoted fee outputs",
            ));
        }
        let outputs_total: u64 = params.blinded_messages.iter().map(|m| m.amount).sum();
        if outputs_total != total_amount(&token.proofs) {
            return Err(RpcError::bad_params("swap amounts are unbalanced"));
        }

        let mut inputs = token.proofs;
        let mut witness = inputs[0]
            .parse_witness()
            .map_err(|e| RpcError::bad_params(format!("malformed witness: {e}")))?
            .unwrap_or_default();
        witness.preimage = Some(params.preimage.clone());
        inputs[0]
            .set_witness(&witness)
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;

        let response = self
            .wallet
            .mint()
            .swap(SwapRequest {
                inputs,
                outputs: params.blinded_messages.clone(),
            })
            .await
            .map_err(|e| match e {
                BraidError::Mint { code, detail } => {
                    RpcError::handler_failure(format!("mint rejected swap ({code}): {detail}"))
                }
                other => RpcError::handler_failure(other.to_string()),
            })?;

        if response.signatures.len() != params.blinded_messages.len() {
            return Err(RpcError::handler_failure(
                "mint returned a short signature list",
            ));
        }
        let (fee_sigs, payer_sigs) = response.signatures.split_at(ours.len());

        let keyset = self
            .wallet
            .active_keyset()
            .await
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;
        let fee_proofs = unblind_outputs(&fee_outputs, fee_sigs, &keyset)
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;
        self.wallet
            .db()
            .save_proofs(&fee_proofs)
            .await
            .map_err(|e| RpcError::handler_failure(e.to_string()))?;
        info!(
            "kept {} sat of the quoted {quoted_fee} sat fee for receive {}",
            total_amount(&fee_proofs),
            params.request_preimage_hash
        );

        self.pending
            .lock()
            .await
            .remove(&params.request_preimage_hash);

        // Forward the payer's share. A lost forward is not fatal: the payer
        // can observe the spend at the mint and recover with its retained
        // blinding factors.
        let forward: Result<BlindedSignaturesResult> = self
            .node
            .call(
                payer,
                METHOD_BLINDED_SIGNATURES,
                &BlindedSignaturesParams {
                    preimage_hash: params.request_preimage_hash.clone(),
                    signatures: payer_sigs.to_vec(),
                },
                self.request_timeout,
            )
            .await;
        match forward {
            Ok(result) => info!(
                "forwarded {} sat in signatures to payer ({} confirmed)",
                result.total_amount, result.success
            ),
            Err(e) => error!("failed to forward signatures to payer: {e}"),
        }

        serde_json::to_value(SwapHtlcResult { success: true })
            .map_err(|e| RpcError::handler_failure(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MethodHandler for DealerNode {
    async fn handle(
        &self,
        from: PublicKey,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            METHOD_INFO => serde_json::to_value(InfoResult {
                peer_type: PeerType::Dealer,
                name: self.name.clone(),
                timestamp: unix_now(),
            })
            .map_err(|e| RpcError::handler_failure(e.to_string())),
            METHOD_REQUEST_DEALER_FEE => self.handle_request_dealer_fee(from, params).await,
            METHOD_SWAP_HTLC => self.handle_swap_htlc(params).await,
            other => Err(RpcError::unknown_method(other)),
        }
    }
}
