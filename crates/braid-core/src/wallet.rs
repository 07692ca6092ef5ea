//! Wallet-level operations shared by the peers: everything that turns
//! stored proofs into locked outputs and mint signatures back into stored
//! proofs.

use std::sync::Arc;

use secp256k1::global::SECP256K1;
use secp256k1::{PublicKey, SecretKey};
use tokio::sync::Mutex;
use tracing::info;

use crate::contract::{SecretKind, SpendConditions};
use crate::error::{BraidError, Result};
use crate::mint::{Keyset, MintConnector};
use crate::outputs::{blinded_messages, create_outputs, unblind_outputs, OutputLock};
use crate::proof::{total_amount, Proof};
use crate::protocol::unix_now;
use crate::store::{PendingHtlc, ProofDb};
use crate::swap::{sign_inputs, SwapRequest};
use crate::token::Token;

#[derive(Clone)]
pub struct PeerKeys {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl PeerKeys {
    pub fn new(secret: SecretKey) -> Self {
        let public = secret.public_key(SECP256K1);
        PeerKeys { secret, public }
    }
}

pub struct Wallet {
    keys: PeerKeys,
    mint_url: String,
    mint: Arc<dyn MintConnector>,
    db: ProofDb,
    keyset: Mutex<Option<Keyset>>,
}

impl Wallet {
    pub fn new(
        keys: PeerKeys,
        mint_url: impl Into<String>,
        mint: Arc<dyn MintConnector>,
        db: ProofDb,
    ) -> Self {
        Wallet {
            keys,
            mint_url: mint_url.into(),
            mint,
            db,
            keyset: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    pub fn mint_url(&self) -> &str {
        &self.mint_url
    }

    pub fn mint(&self) -> Arc<dyn MintConnector> {
        self.mint.clone()
    }

    pub fn db(&self) -> &ProofDb {
        &self.db
    }

    /// The keyset in use, seeded from the local cache and fetched from the
    /// mint on a cache miss.
    pub async fn active_keyset(&self) -> Result<Keyset> {
        let mut guard = self.keyset.lock().await;
        if let Some(keyset) = guard.as_ref() {
            return Ok(keyset.clone());
        }

        let cached = self.db.load_keysets().await?;
        let keyset = match cached.into_iter().next() {
            Some(keyset) => keyset,
            None => {
                let fetched = self.mint.keysets().await?;
                let keyset = fetched
                    .first()
                    .cloned()
                    .ok_or_else(|| BraidError::Protocol("mint has no keysets".to_string()))?;
                self.db.upsert_keysets(&fetched).await?;
                keyset
            }
        };
        *guard = Some(keyset.clone());
        Ok(keyset)
    }

    pub async fn balance(&self) -> Result<u64> {
        self.db.balance().await
    }

    fn self_lock(&self) -> OutputLock {
        OutputLock::P2pk {
            owner: self.keys.public,
            conditions: SpendConditions::default(),
        }
    }

    /// Accept an incoming token: satisfy its locks, swap the proofs into
    /// fresh outputs locked to this wallet, and store them.
    pub async fn receive_token(&self, raw: &str, unlock_key: Option<&SecretKey>) -> Result<u64> {
        let token = Token::decode(raw)?;
        if token.mint_url != self.mint_url {
            return Err(BraidError::Token(format!(
                "token is for foreign mint {}",
                token.mint_url
            )));
        }

        let mut inputs = token.proofs;
        let amount = total_amount(&inputs);

        // Sign whatever the locks demand. Plain secrets pass through
        // unsigned.
        for input in inputs.iter_mut() {
            let Ok(contract) = input.contract() else {
                continue;
            };
            match contract.kind {
                SecretKind::P2pk => {
                    let owner = contract.locking_pubkey()?;
                    let key = if owner == self.keys.public {
                        &self.keys.secret
                    } else if let Some(key) = unlock_key {
                        if key.public_key(SECP256K1) != owner {
                            return Err(BraidError::Token(
                                "unlock key does not match the proof lock".to_string(),
                            ));
                        }
                        key
                    } else {
                        return Err(BraidError::Token(
                            "token is locked to another key".to_string(),
                        ));
                    };
                    sign_inputs(key, std::slice::from_mut(input), None)?;
                }
                SecretKind::Htlc => {
                    return Err(BraidError::Token(
                        "hashlocked tokens cannot be received directly".to_string(),
                    ));
                }
            }
        }

        let keyset = self.active_keyset().await?;
        let outputs = create_outputs(amount, &keyset.id, &self.self_lock())?;
        let response = self
            .mint
            .swap(SwapRequest {
                inputs,
                outputs: blinded_messages(&outputs),
            })
            .await?;

        let proofs = unblind_outputs(&outputs, &response.signatures, &keyset)?;
        self.db.save_proofs(&proofs).await?;
        info!("received {amount} sat");
        Ok(amount)
    }

    /// Swap own proofs into `amount` of outputs under `lock` plus self-locked
    /// change. Inputs and change settle against the store in one
    /// transaction; the locked proofs are returned to the caller, who owns
    /// their fate.
    pub async fn mint_locked(&self, amount: u64, lock: &OutputLock) -> Result<Vec<Proof>> {
        let keyset = self.active_keyset().await?;
        let mut inputs = self.db.select_for_spend(amount).await?;
        let change = total_amount(&inputs) - amount;

        let locked_outputs = create_outputs(amount, &keyset.id, lock)?;
        let change_outputs = if change > 0 {
            create_outputs(change, &keyset.id, &self.self_lock())?
        } else {
            Vec::new()
        };

        sign_inputs(&self.keys.secret, &mut inputs, None)?;

        let mut outputs = blinded_messages(&locked_outputs);
        outputs.extend(blinded_messages(&change_outputs));
        let response = self
            .mint
            .swap(SwapRequest {
                inputs: inputs.clone(),
                outputs,
            })
            .await?;

        let split = locked_outputs.len();
        if response.signatures.len() != split + change_outputs.len() {
            return Err(BraidError::Protocol(format!(
                "mint returned {} signatures for {} outputs",
                response.signatures.len(),
                split + change_outputs.len()
            )));
        }
        let locked = unblind_outputs(&locked_outputs, &response.signatures[..split], &keyset)?;
        let change_proofs =
            unblind_outputs(&change_outputs, &response.signatures[split..], &keyset)?;

        self.db.swap_commit(&inputs, &change_proofs).await?;
        Ok(locked)
    }

    /// Build an outbound hashlocked token for a pay flow and record it for
    /// the refund path.
    pub async fn send_htlc(
        &self,
        amount: u64,
        payment_hash: [u8; 32],
        conditions: SpendConditions,
    ) -> Result<Token> {
        let locktime = conditions
            .locktime
            .unwrap_or_else(|| unix_now() + 24 * 3600);
        let lock = OutputLock::Htlc {
            payment_hash,
            conditions,
        };
        let proofs = self.mint_locked(amount, &lock).await?;

        self.db
            .insert_pending_htlc(&PendingHtlc {
                payment_hash: hex::encode(payment_hash),
                proofs: proofs.clone(),
                amount,
                locktime,
            })
            .await?;

        let keyset = self.active_keyset().await?;
        Ok(Token::new(self.mint_url.clone(), keyset.unit, proofs))
    }

    /// Gateway side of a pay flow: satisfy an incoming HTLC with the
    /// preimage plus our signature and fold its value into the store.
    pub async fn claim_htlc_token(&self, token: &Token, preimage: [u8; 32]) -> Result<u64> {
        let mut inputs = token.proofs.clone();
        let amount = total_amount(&inputs);

        sign_inputs(&self.keys.secret, &mut inputs, Some(preimage))?;

        let keyset = self.active_keyset().await?;
        let outputs = create_outputs(amount, &keyset.id, &self.self_lock())?;
        let response = self
            .mint
            .swap(SwapRequest {
                inputs,
                outputs: blinded_messages(&outputs),
            })
            .await?;

        let proofs = unblind_outputs(&outputs, &response.signatures, &keyset)?;
        self.db.save_proofs(&proofs).await?;
        Ok(amount)
    }

    /// Swap proofs we hold a refund path on back into self-locked proofs.
    /// The refund signature set is this wallet's own key.
    pub async fn reclaim_proofs(&self, proofs: Vec<Proof>) -> Result<u64> {
        let mut inputs = proofs;
        let amount = total_amount(&inputs);

        for input in inputs.iter_mut() {
            // Drop any stale witness before signing the refund path.
            input.witness = None;
        }
        sign_inputs(&self.keys.secret, &mut inputs, None)?;

        let keyset = self.active_keyset().await?;
        let outputs = create_outputs(amount, &keyset.id, &self.self_lock())?;
        let response = self
            .mint
            .swap(SwapRequest {
                inputs,
                outputs: blinded_messages(&outputs),
            })
            .await?;

        let proofs = unblind_outputs(&outputs, &response.signatures, &keyset)?;
        self.db.save_proofs(&proofs).await?;
        Ok(amount)
    }

    /// Sweep expired outbound HTLCs back into the store. Entries whose
    /// locktime has not passed are left alone; entries the counterparty
    /// already claimed fail their swap and are dropped.
    pub async fn reclaim_expired_htlcs(&self) -> Result<u64> {
        let now = unix_now();
        let mut reclaimed = 0u64;
        for pending in self.db.list_pending_htlcs().await? {
            if pending.locktime > now {
                continue;
            }
            match self.reclaim_proofs(pending.proofs.clone()).await {
                Ok(amount) => {
                    reclaimed += amount;
                    self.db.remove_pending_htlc(&pending.payment_hash).await?;
                    info!(
                        "reclaimed {amount} sat from expired contract {}",
                        pending.payment_hash
                    );
                }
                Err(BraidError::Mint { code, detail }) => {
                    // Already spent by the counterparty; nothing to recover.
                    info!(
                        "contract {} not reclaimable (mint {code}: {detail})",
                        pending.payment_hash
                    );
                    self.db.remove_pending_htlc(&pending.payment_hash).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Confirm an outbound HTLC was claimed by the counterparty; the refund
    /// entry is no longer needed.
    pub async fn settle_pending_htlc(&self, payment_hash: &[u8; 32]) -> Result<()> {
        self.db
            .remove_pending_htlc(&hex::encode(payment_hash))
            .await
    }
}
