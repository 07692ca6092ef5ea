use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::contract::{ContractSecret, Witness};
use crate::crypto::hash_to_curve;
use crate::error::Result;

/// A spendable unit. `y()` is its canonical identity at the mint and in the
/// local store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub id: String,
    pub amount: u64,
    pub secret: String,
    #[serde(rename = "C")]
    pub c: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<ProofDleq>,
}

impl Proof {
    pub fn y(&self) -> Result<PublicKey> {
        hash_to_curve(self.secret.as_bytes())
    }

    pub fn contract(&self) -> Result<ContractSecret> {
        self.secret.parse()
    }

    pub fn parse_witness(&self) -> Result<Option<Witness>> {
        match &self.witness {
            Some(raw) => Ok(Some(Witness::decode(raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_witness(&mut self, witness: &Witness) -> Result<()> {
        self.witness = Some(witness.encode()?);
        Ok(())
    }
}

pub fn total_amount(proofs: &[Proof]) -> u64 {
    proofs.iter().map(|p| p.amount).sum()
}

/// Discrete-log-equality proof retained on a stored proof; `r` is the
/// blinding factor it was verified under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofDleq {
    pub e: String,
    pub s: String,
    pub r: String,
}

/// Discrete-log-equality proof as returned by the mint on a blinded
/// signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureDleq {
    pub e: String,
    pub s: String,
}

/// A blinded point submitted to the mint for signing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlindedMessage {
    pub amount: u64,
    pub id: String,
    #[serde(rename = "B_")]
    pub b: PublicKey,
}

/// The mint's signature over a blinded point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlindSignature {
    pub amount: u64,
    pub id: String,
    #[serde(rename = "C_")]
    pub c: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<SignatureDleq>,
}
