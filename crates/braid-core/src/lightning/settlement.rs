//! Fan-out of incoming-payment notifications. One task owns the backend
//! stream, survives stream loss, and deduplicates redelivered events by
//! preimage before broadcasting.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::lightning::backend::LightningBackend;
use crate::lightning::error::LightningError;
use crate::lightning::types::PaymentReceivedEvent;

pub struct PaymentListener {
    sender: broadcast::Sender<PaymentReceivedEvent>,
}

impl PaymentListener {
    pub fn new() -> (Self, broadcast::Receiver<PaymentReceivedEvent>) {
        let (sender, receiver) = broadcast::channel(32);
        (PaymentListener { sender }, receiver)
    }

    pub fn sender(&self) -> broadcast::Sender<PaymentReceivedEvent> {
        self.sender.clone()
    }

    pub async fn run(
        backend: Arc<dyn LightningBackend>,
        sender: broadcast::Sender<PaymentReceivedEvent>,
    ) {
        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        loop {
            let mut stream = match backend.subscribe_payments().await {
                Ok(s) => s,
                Err(e) => {
                    error!("payment stream subscribe error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            loop {
                match stream.next().await {
                    Some(Ok(event)) => {
                        if seen.insert(event.preimage) {
                            let _ = sender.send(event);
                        } else {
                            debug!(
                                "dropping duplicate payment notification for hash {}",
                                hex::encode(event.payment_hash)
                            );
                        }
                    }
                    Some(Err(e)) => {
                        error!("payment stream item error: {e}");
                        break;
                    }
                    None => break,
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// Block until a settlement for `payment_hash` arrives or the timeout hits.
pub async fn wait_for_payment(
    receiver: &mut broadcast::Receiver<PaymentReceivedEvent>,
    payment_hash: &[u8; 32],
    timeout_secs: u64,
) -> Result<PaymentReceivedEvent, LightningError> {
    let duration = Duration::from_secs(timeout_secs);
    let result = timeout(duration, async {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.payment_hash == *payment_hash {
                        return Ok(event);
                    }
                }
                Err(e) => {
                    return Err::<PaymentReceivedEvent, LightningError>(
                        LightningError::StreamError(e.to_string()),
                    );
                }
            }
        }
    })
    .await;

    match result {
        Ok(Ok(event)) => Ok(event),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LightningError::StreamError(
            "payment wait timed out".to_string(),
        )),
    }
}
