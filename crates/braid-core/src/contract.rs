//! The two lock contracts carried inside proof secrets, their tag encoding,
//! and the witness envelope that satisfies them.

use std::fmt;
use std::str::FromStr;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{pubkey_from_hex, random_nonce};
use crate::error::{BraidError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretKind {
    P2pk,
    Htlc,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::P2pk => "P2PK",
            SecretKind::Htlc => "HTLC",
        }
    }
}

impl FromStr for SecretKind {
    type Err = BraidError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "P2PK" => Ok(SecretKind::P2pk),
            "HTLC" => Ok(SecretKind::Htlc),
            other => Err(BraidError::Contract(format!("unknown secret kind {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigFlag {
    #[default]
    SigInputs,
    SigAll,
}

impl SigFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigFlag::SigInputs => "SIG_INPUTS",
            SigFlag::SigAll => "SIG_ALL",
        }
    }
}

impl FromStr for SigFlag {
    type Err = BraidError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SIG_INPUTS" => Ok(SigFlag::SigInputs),
            "SIG_ALL" => Ok(SigFlag::SigAll),
            other => Err(BraidError::Contract(format!("unknown sigflag {other:?}"))),
        }
    }
}

/// Locking conditions shared by both contract kinds, mapped to and from the
/// tag arrays of the secret encoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpendConditions {
    pub sig_flag: SigFlag,
    pub pubkeys: Vec<PublicKey>,
    pub n_sigs: Option<u64>,
    pub locktime: Option<u64>,
    pub refund_keys: Vec<PublicKey>,
    pub n_sigs_refund: Option<u64>,
}

impl SpendConditions {
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![vec![
            "sigflag".to_string(),
            self.sig_flag.as_str().to_string(),
        ]];
        if !self.pubkeys.is_empty() {
            let mut tag = vec!["pubkeys".to_string()];
            tag.extend(self.pubkeys.iter().map(|k| k.to_string()));
            tags.push(tag);
        }
        if let Some(n) = self.n_sigs {
            tags.push(vec!["n_sigs".to_string(), n.to_string()]);
        }
        if let Some(t) = self.locktime {
            tags.push(vec!["locktime".to_string(), t.to_string()]);
        }
        if !self.refund_keys.is_empty() {
            let mut tag = vec!["refund".to_string()];
            tag.extend(self.refund_keys.iter().map(|k| k.to_string()));
            tags.push(tag);
        }
        if let Some(n) = self.n_sigs_refund {
            tags.push(vec!["n_sigs_refund".to_string(), n.to_string()]);
        }
        tags
    }

    pub fn from_tags(tags: &[Vec<String>]) -> Result<Self> {
        let mut conditions = SpendConditions::default();
        for tag in tags {
            let Some(name) = tag.first() else {
                return Err(BraidError::Contract("empty tag".to_string()));
            };
            match name.as_str() {
                "sigflag" => {
                    conditions.sig_flag = tag_value(tag)?.parse()?;
                }
                "pubkeys" => {
                    conditions.pubkeys = tag[1..]
                        .iter()
                        .map(|s| pubkey_from_hex(s))
                        .collect::<Result<_>>()?;
                }
                "n_sigs" => {
                    conditions.n_sigs = Some(parse_numeric(tag)?);
                }
                "locktime" => {
                    conditions.locktime = Some(parse_numeric(tag)?);
                }
                "refund" => {
                    conditions.refund_keys = tag[1..]
                        .iter()
                        .map(|s| pubkey_from_hex(s))
                        .collect::<Result<_>>()?;
                }
                "n_sigs_refund" => {
                    conditions.n_sigs_refund = Some(parse_numeric(tag)?);
                }
                // Unknown tags are carried by the secret string itself and do
                // not affect our spend paths.
                _ => {}
            }
        }
        Ok(conditions)
    }

    /// Signatures required on the primary spend path.
    pub fn required_sigs(&self) -> u64 {
        self.n_sigs.unwrap_or(1).max(1)
    }

    pub fn required_refund_sigs(&self) -> u64 {
        self.n_sigs_refund.unwrap_or(1).max(1)
    }
}

fn tag_value(tag: &[String]) -> Result<&str> {
    tag.get(1)
        .map(|s| s.as_str())
        .ok_or_else(|| BraidError::Contract(format!("tag {:?} has no value", tag[0])))
}

fn parse_numeric(tag: &[String]) -> Result<u64> {
    tag_value(tag)?
        .parse()
        .map_err(|_| BraidError::Contract(format!("tag {:?} is not a numeric string", tag[0])))
}

/// A well-known secret: `["P2PK"|"HTLC", {nonce, data, tags}]`, stringified.
///
/// `data` is the owner pubkey (P2PK) or the 32-byte payment hash (HTLC),
/// hex in both cases.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractSecret {
    pub kind: SecretKind,
    pub nonce: String,
    pub data: String,
    pub conditions: SpendConditions,
}

#[derive(Serialize, Deserialize)]
struct SecretBody {
    nonce: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<Vec<String>>>,
}

impl ContractSecret {
    pub fn p2pk(owner: &PublicKey, conditions: SpendConditions) -> Self {
        ContractSecret {
            kind: SecretKind::P2pk,
            nonce: random_nonce(),
            data: owner.to_string(),
            conditions,
        }
    }

    pub fn htlc(payment_hash: &[u8; 32], conditions: SpendConditions) -> Self {
        ContractSecret {
            kind: SecretKind::Htlc,
            nonce: random_nonce(),
            data: hex::encode(payment_hash),
            conditions,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nonce.is_empty() {
            return Err(BraidError::Contract("empty nonce".to_string()));
        }
        match self.kind {
            SecretKind::P2pk => {
                pubkey_from_hex(&self.data)
                    .map_err(|_| BraidError::Contract("data is not a public key".to_string()))?;
            }
            SecretKind::Htlc => {
                self.payment_hash()?;
            }
        }
        Ok(())
    }

    /// The 32-byte hash an HTLC preimage must resolve to.
    pub fn payment_hash(&self) -> Result<[u8; 32]> {
        if self.kind != SecretKind::Htlc {
            return Err(BraidError::Contract(
                "not a hashlocked contract".to_string(),
            ));
        }
        let bytes = hex::decode(&self.data)
            .map_err(|_| BraidError::Contract("data is not hex".to_string()))?;
        bytes
            .try_into()
            .map_err(|_| BraidError::Contract("data is not 32 bytes".to_string()))
    }

    /// The key a P2PK contract is locked to.
    pub fn locking_pubkey(&self) -> Result<PublicKey> {
        if self.kind != SecretKind::P2pk {
            return Err(BraidError::Contract("not a pay-to-pubkey contract".to_string()));
        }
        pubkey_from_hex(&self.data)
    }
}

impl fmt::Display for ContractSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = SecretBody {
            nonce: self.nonce.clone(),
            data: self.data.clone(),
            tags: Some(self.conditions.to_tags()),
        };
        let value = (self.kind.as_str(), body);
        let encoded = serde_json::to_string(&value).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for ContractSecret {
    type Err = BraidError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, body): (String, SecretBody) = serde_json::from_str(s)
            .map_err(|e| BraidError::Contract(format!("malformed secret: {e}")))?;
        let secret = ContractSecret {
            kind: kind.parse()?,
            nonce: body.nonce,
            data: body.data,
            conditions: SpendConditions::from_tags(body.tags.as_deref().unwrap_or_default())?,
        };
        secret.validate()?;
        Ok(secret)
    }
}

/// Witness envelope: signatures plus the HTLC preimage when spending the
/// hashlock path. Stored stringified on the proof.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
}

impl Witness {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| BraidError::Contract(format!("malformed witness: {e}")))
    }
}
