//! Blinded-output construction: denomination split, fresh contract secrets
//! and blinding factors, and the unblinding of the mint's signatures back
//! into proofs.

use secp256k1::{PublicKey, SecretKey};

use crate::contract::{ContractSecret, SpendConditions};
use crate::crypto::{blind_message, unblind_signature, verify_dleq};
use crate::error::{BraidError, Result};
use crate::mint::Keyset;
use crate::proof::{BlindSignature, BlindedMessage, Proof, ProofDleq};

/// A locally retained output: the blinded message handed to the mint plus
/// everything needed to unblind its signature. Whoever drops `r` forfeits
/// the ability to claim.
#[derive(Clone, Debug)]
pub struct OutputData {
    pub blinded: BlindedMessage,
    pub secret: String,
    pub r: SecretKey,
}

/// The lock each constructed output carries.
#[derive(Clone, Debug)]
pub enum OutputLock {
    P2pk {
        owner: PublicKey,
        conditions: SpendConditions,
    },
    Htlc {
        payment_hash: [u8; 32],
        conditions: SpendConditions,
    },
}

impl OutputLock {
    fn fresh_secret(&self) -> ContractSecret {
        match self {
            OutputLock::P2pk { owner, conditions } => {
                ContractSecret::p2pk(owner, conditions.clone())
            }
            OutputLock::Htlc {
                payment_hash,
                conditions,
            } => ContractSecret::htlc(payment_hash, conditions.clone()),
        }
    }
}

/// Power-of-two split, smallest denomination first.
pub fn split_amount(amount: u64) -> Vec<u64> {
    (0..64)
        .filter(|bit| amount & (1 << bit) != 0)
        .map(|bit| 1 << bit)
        .collect()
}

/// Build one freshly-nonced, freshly-blinded output per denomination of
/// `amount`. The returned order is the denomination order and must be
/// preserved through the swap.
pub fn create_outputs(amount: u64, keyset_id: &str, lock: &OutputLock) -> Result<Vec<OutputData>> {
    if amount == 0 {
        return Err(BraidError::Amount("amount must be positive".to_string()));
    }

    let mut outputs = Vec::new();
    for denomination in split_amount(amount) {
        let secret = lock.fresh_secret().to_string();
        let (b, r) = blind_message(secret.as_bytes(), None)?;
        outputs.push(OutputData {
            blinded: BlindedMessage {
                amount: denomination,
                id: keyset_id.to_string(),
                b,
            },
            secret,
            r,
        });
    }
    Ok(outputs)
}

pub fn blinded_messages(outputs: &[OutputData]) -> Vec<BlindedMessage> {
    outputs.iter().map(|o| o.blinded.clone()).collect()
}

/// Pair the mint's signatures with the retained outputs, position by
/// position, and unblind into proofs. Discrete-log-equality proofs are
/// verified when the mint attaches them and retained on the proof.
pub fn unblind_outputs(
    outputs: &[OutputData],
    signatures: &[BlindSignature],
    keyset: &Keyset,
) -> Result<Vec<Proof>> {
    if outputs.len() != signatures.len() {
        return Err(BraidError::Protocol(format!(
            "expected {} blinded signatures, got {}",
            outputs.len(),
            signatures.len()
        )));
    }

    let mut proofs = Vec::with_capacity(outputs.len());
    for (output, signature) in outputs.iter().zip(signatures) {
        if output.blinded.amount != signature.amount {
            return Err(BraidError::Protocol(format!(
                "signature amount {} does not match output amount {}",
                signature.amount, output.blinded.amount
            )));
        }
        let mint_key = keyset.key_for(signature.amount)?;

        let dleq = match &signature.dleq {
            Some(dleq) => {
                let e = parse_scalar(&dleq.e)?;
                let s = parse_scalar(&dleq.s)?;
                verify_dleq(&output.blinded.b, &signature.c, &e, &s, mint_key)?;
                Some(ProofDleq {
                    e: dleq.e.clone(),
                    s: dleq.s.clone(),
                    r: hex::encode(output.r.secret_bytes()),
                })
            }
            None => None,
        };

        let c = unblind_signature(&signature.c, &output.r, mint_key)?;
        proofs.push(Proof {
            id: signature.id.clone(),
            amount: signature.amount,
            secret: output.secret.clone(),
            c,
            witness: None,
            dleq,
        });
    }
    Ok(proofs)
}

fn parse_scalar(raw: &str) -> Result<SecretKey> {
    let bytes =
        hex::decode(raw).map_err(|_| BraidError::Crypto("scalar is not hex".to_string()))?;
    SecretKey::from_slice(&bytes).map_err(|e| BraidError::Crypto(format!("invalid scalar: {e}")))
}
