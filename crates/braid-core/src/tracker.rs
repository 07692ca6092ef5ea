//! Watches sets of proofs at the mint and fires once a whole set is spent,
//! carrying along any preimage the spending witness revealed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use secp256k1::PublicKey;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::contract::Witness;
use crate::error::Result;
use crate::mint::{MintConnector, ProofState};

/// Every proof of the tracked set transitioned to SPENT.
#[derive(Clone, Debug, PartialEq)]
pub struct SetSpent {
    pub key: String,
    pub preimage: Option<String>,
}

struct WatchSet {
    remaining: HashSet<String>,
    ys: Vec<PublicKey>,
    preimage: Option<String>,
}

pub struct ProofStateTracker {
    mint: Arc<dyn MintConnector>,
    sets: Mutex<HashMap<String, WatchSet>>,
    events: mpsc::Sender<SetSpent>,
    poll_interval: Duration,
}

impl ProofStateTracker {
    pub fn new(
        mint: Arc<dyn MintConnector>,
        poll_interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<SetSpent>) {
        let (events, receiver) = mpsc::channel(32);
        let tracker = Arc::new(ProofStateTracker {
            mint,
            sets: Mutex::new(HashMap::new()),
            events,
            poll_interval,
        });
        (tracker, receiver)
    }

    pub async fn track(&self, key: impl Into<String>, ys: Vec<PublicKey>) {
        let remaining = ys.iter().map(|y| y.to_string()).collect();
        self.sets.lock().await.insert(
            key.into(),
            WatchSet {
                remaining,
                ys,
                preimage: None,
            },
        );
    }

    pub async fn untrack(&self, key: &str) {
        self.sets.lock().await.remove(key);
    }

    pub async fn is_tracked(&self, key: &str) -> bool {
        self.sets.lock().await.contains_key(key)
    }

    /// Run the poll loop until the tracker is dropped. Idles while nothing
    /// is tracked; a failed poll is retried on the next tick.
    pub fn spawn(self: &Arc<Self>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.poll_once().await {
                    warn!("proof state poll failed: {e}");
                }
            }
        });
    }

    pub async fn poll_once(&self) -> Result<()> {
        let union: Vec<PublicKey> = {
            let sets = self.sets.lock().await;
            let mut seen = HashSet::new();
            sets.values()
                .flat_map(|set| set.ys.iter().copied())
                .filter(|y| seen.insert(y.to_string()))
                .collect()
        };
        if union.is_empty() {
            return Ok(());
        }

        let updates = self.mint.check_state(union).await?;

        let mut completed = Vec::new();
        {
            let mut sets = self.sets.lock().await;
            for update in updates {
                if update.state != ProofState::Spent {
                    continue;
                }
                let y = update.y.to_string();
                let preimage = update
                    .witness
                    .as_deref()
                    .and_then(|raw| Witness::decode(raw).ok())
                    .and_then(|witness| witness.preimage);

                for set in sets.values_mut() {
                    if set.remaining.remove(&y) {
                        if let Some(preimage) = &preimage {
                            set.preimage.get_or_insert_with(|| preimage.clone());
                        }
                    }
                }
            }

            let done: Vec<String> = sets
                .iter()
                .filter(|(_, set)| set.remaining.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            for key in done {
                if let Some(set) = sets.remove(&key) {
                    completed.push(SetSpent {
                        key,
                        preimage: set.preimage,
                    });
                }
            }
        }

        for event in completed {
            let _ = self.events.send(event).await;
        }
        Ok(())
    }
}
