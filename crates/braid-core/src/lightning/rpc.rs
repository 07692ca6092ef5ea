//! JSON-RPC client for a wallet-connect-style lightning wallet: two request
//! methods plus a long-polled notification feed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::lightning::backend::{LightningBackend, PaymentStream};
use crate::lightning::error::LightningError;
use crate::lightning::types::{LnInvoice, LnPayment, PaymentReceivedEvent};

#[derive(Serialize)]
struct RpcCall<'a> {
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcReply {
    result: Option<Value>,
    error: Option<RpcReplyError>,
}

#[derive(Deserialize)]
struct RpcReplyError {
    message: String,
}

#[derive(Serialize)]
struct MakeInvoiceParams {
    amount_sat: u64,
    memo: String,
    expiry_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_hash: Option<String>,
}

#[derive(Serialize)]
struct PayInvoiceParams<'a> {
    invoice: &'a str,
}

#[derive(Deserialize)]
struct NotificationBatch {
    next: u64,
    #[serde(default)]
    events: Vec<PaymentReceivedEvent>,
}

pub struct WalletRpcClient {
    base_url: String,
    client: reqwest::Client,
}

impl WalletRpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LightningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LightningError::NodeUnavailable(e.to_string()))?;
        Ok(WalletRpcClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LightningError> {
        let url = format!("{}/rpc", self.base_url);
        let reply: RpcReply = self
            .client
            .post(&url)
            .json(&RpcCall { method, params })
            .send()
            .await
            .map_err(|e| LightningError::NodeUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| LightningError::NodeUnavailable(e.to_string()))?;

        if let Some(error) = reply.error {
            return Err(LightningError::PaymentFailed(error.message));
        }
        let result = reply
            .result
            .ok_or_else(|| LightningError::NodeUnavailable("empty rpc reply".to_string()))?;
        serde_json::from_value(result)
            .map_err(|e| LightningError::NodeUnavailable(format!("malformed rpc reply: {e}")))
    }
}

#[async_trait::async_trait]
impl LightningBackend for WalletRpcClient {
    async fn make_invoice(
        &self,
        amount_sat: u64,
        memo: &str,
        expiry_secs: u64,
        hodl_payment_hash: Option<[u8; 32]>,
    ) -> Result<LnInvoice, LightningError> {
        let params = MakeInvoiceParams {
            amount_sat,
            memo: memo.to_string(),
            expiry_secs,
            payment_hash: hodl_payment_hash.map(hex::encode),
        };
        let params =
            serde_json::to_value(params).map_err(|e| LightningError::NodeUnavailable(e.to_string()))?;
        self.call("make_invoice", params)
            .await
            .map_err(|e| match e {
                LightningError::PaymentFailed(m) => LightningError::InvoiceCreationFailed(m),
                other => other,
            })
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<LnPayment, LightningError> {
        let params = serde_json::to_value(PayInvoiceParams {
            invoice: payment_request,
        })
        .map_err(|e| LightningError::NodeUnavailable(e.to_string()))?;
        self.call("pay_invoice", params).await
    }

    async fn subscribe_payments(&self) -> Result<PaymentStream, LightningError> {
        let (tx, rx) = mpsc::channel(32);
        let client = self.client.clone();
        let base_url = self.base_url.clone();

        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                let url = format!("{base_url}/notifications?since={cursor}");
                let batch = async {
                    client
                        .get(&url)
                        .send()
                        .await?
                        .json::<NotificationBatch>()
                        .await
                }
                .await;

                match batch {
                    Ok(batch) => {
                        cursor = batch.next;
                        for event in batch.events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("notification poll failed: {e}");
                        if tx
                            .send(Err(LightningError::StreamError(e.to_string())))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
