//! Relay client over plain HTTP: publish into the bus, long-poll the own
//! inbox. The relay itself is an external service; this is just its wire
//! shape.

use std::time::Duration;

use secp256k1::PublicKey;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::relay::transport::{Envelope, EnvelopeStream, RelayError, RelayTransport};

#[derive(Deserialize)]
struct InboxBatch {
    next: u64,
    #[serde(default)]
    messages: Vec<Envelope>,
}

pub struct HttpRelayClient {
    base_url: String,
    client: reqwest::Client,
    public_key: PublicKey,
}

impl HttpRelayClient {
    pub fn new(base_url: impl Into<String>, public_key: PublicKey) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        Ok(HttpRelayClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            public_key,
        })
    }
}

#[async_trait::async_trait]
impl RelayTransport for HttpRelayClient {
    async fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        let url = format!("{}/publish", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| RelayError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::Delivery(format!(
                "relay returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn incoming(&self) -> Result<EnvelopeStream, RelayError> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let recipient = self.public_key;

        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                let url = format!("{base_url}/inbox/{recipient}?since={cursor}");
                let batch = async { client.get(&url).send().await?.json::<InboxBatch>().await }
                    .await;

                match batch {
                    Ok(batch) => {
                        cursor = batch.next;
                        for envelope in batch.messages {
                            if tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("inbox poll failed: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
