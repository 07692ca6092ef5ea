use std::collections::BTreeMap;
use std::time::Duration;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};
use crate::swap::{SwapRequest, SwapResponse};

/// One denomination table of the mint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keyset {
    pub id: String,
    pub unit: String,
    pub keys: BTreeMap<u64, PublicKey>,
}

impl Keyset {
    pub fn key_for(&self, amount: u64) -> Result<&PublicKey> {
        self.keys.get(&amount).ok_or_else(|| {
            BraidError::Protocol(format!("keyset {} has no key for amount {amount}", self.id))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofState {
    #[serde(rename = "UNSPENT")]
    Unspent,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SPENT")]
    Spent,
}

/// Per-proof state pushed by the mint, keyed by `Y`. A witness observed at
/// spend time rides along and may reveal an HTLC preimage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofStateUpdate {
    #[serde(rename = "Y")]
    pub y: PublicKey,
    pub state: ProofState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
}

/// The mint surface this system consumes. Swaps are atomic on the mint side;
/// mint errors come back verbatim as `BraidError::Mint`.
#[async_trait::async_trait]
pub trait MintConnector: Send + Sync + 'static {
    async fn keysets(&self) -> Result<Vec<Keyset>>;

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse>;

    async fn check_state(&self, ys: Vec<PublicKey>) -> Result<Vec<ProofStateUpdate>>;
}

#[derive(Deserialize)]
struct KeysResponse {
    keysets: Vec<Keyset>,
}

#[derive(Serialize)]
struct CheckStateRequest {
    #[serde(rename = "Ys")]
    ys: Vec<PublicKey>,
}

#[derive(Deserialize)]
struct CheckStateResponse {
    states: Vec<ProofStateUpdate>,
}

#[derive(Deserialize)]
struct MintErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    detail: String,
}

pub struct HttpMintClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMintClient {
    /// Swaps can take a while on a busy mint; the client-wide timeout is
    /// sized for them rather than for the cheap lookups.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(HttpMintClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn surface_error(response: reqwest::Response) -> BraidError {
        let status = response.status().as_u16() as i64;
        match response.json::<MintErrorBody>().await {
            Ok(body) if !body.detail.is_empty() => BraidError::Mint {
                code: if body.code != 0 { body.code } else { status },
                detail: body.detail,
            },
            _ => BraidError::Mint {
                code: status,
                detail: "mint request failed".to_string(),
            },
        }
    }
}

#[async_trait::async_trait]
impl MintConnector for HttpMintClient {
    async fn keysets(&self) -> Result<Vec<Keyset>> {
        let url = format!("{}/v1/keys", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::surface_error(response).await);
        }
        let body: KeysResponse = response.json().await?;
        Ok(body.keysets)
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse> {
        let url = format!("{}/v1/swap", self.base_url);
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(Self::surface_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn check_state(&self, ys: Vec<PublicKey>) -> Result<Vec<ProofStateUpdate>> {
        let url = format!("{}/v1/checkstate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&CheckStateRequest { ys })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::surface_error(response).await);
        }
        let body: CheckStateResponse = response.json().await?;
        Ok(body.states)
    }
}
