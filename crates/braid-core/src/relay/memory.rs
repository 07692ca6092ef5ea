//! In-process relay used by the tests and local multi-peer runs: a mailbox
//! per registered key, lossy toward unknown recipients like the real bus.

use std::collections::HashMap;
use std::sync::Arc;

use secp256k1::PublicKey;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::relay::transport::{Envelope, EnvelopeStream, RelayError, RelayTransport};

#[derive(Default)]
pub struct MemoryRelay {
    inboxes: Mutex<HashMap<PublicKey, mpsc::Sender<Envelope>>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryRelay::default())
    }

    /// Register `peer` and return its endpoint. Re-registering replaces the
    /// previous mailbox.
    pub async fn endpoint(self: &Arc<Self>, peer: PublicKey) -> MemoryEndpoint {
        let (tx, rx) = mpsc::channel(64);
        self.inboxes.lock().await.insert(peer, tx);
        MemoryEndpoint {
            relay: self.clone(),
            receiver: Mutex::new(Some(rx)),
        }
    }
}

pub struct MemoryEndpoint {
    relay: Arc<MemoryRelay>,
    receiver: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

#[async_trait::async_trait]
impl RelayTransport for MemoryEndpoint {
    async fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        let inboxes = self.relay.inboxes.lock().await;
        match inboxes.get(&envelope.to) {
            Some(tx) => {
                if tx.send(envelope).await.is_err() {
                    debug!("recipient mailbox closed; dropping message");
                }
            }
            None => debug!("no mailbox for recipient; dropping message"),
        }
        Ok(())
    }

    async fn incoming(&self) -> Result<EnvelopeStream, RelayError> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::Subscription("inbox already consumed".to_string()))?;
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }
}
