use std::path::Path;

use bip39::Mnemonic;
use bitcoin::bip32::Xpriv;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{BraidError, Result};
use crate::wallet::PeerKeys;

fn default_fee_sat() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_invoice_expiry_secs() -> u64 {
    3600
}

/// Per-peer configuration, loaded from a TOML file. `lightning_rpc_url` is
/// only meaningful for the gateway; `fee_sat` only for the dealer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub mint_url: String,
    pub relay_url: String,
    pub db_path: String,
    pub seed_phrase: String,
    #[serde(default)]
    pub lightning_rpc_url: Option<String>,
    #[serde(default = "default_fee_sat")]
    pub fee_sat: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_invoice_expiry_secs")]
    pub invoice_expiry_secs: u64,
}

impl PeerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BraidError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: PeerConfig = toml::from_str(&data).map_err(|e| {
            BraidError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BraidError::Config("name must not be empty".to_string()));
        }
        if self.mint_url.is_empty() {
            return Err(BraidError::Config("mint_url must not be empty".to_string()));
        }
        if self.relay_url.is_empty() {
            return Err(BraidError::Config("relay_url must not be empty".to_string()));
        }
        if self.seed_phrase.is_empty() {
            return Err(BraidError::Config(
                "seed_phrase must not be empty".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(BraidError::Config(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Long-term peer identity from the seed phrase: BIP39 seed into a
    /// BIP32 master key.
    pub fn derive_keys(&self) -> Result<PeerKeys> {
        let mnemonic = Mnemonic::parse(self.seed_phrase.trim())
            .map_err(|e| BraidError::Config(format!("invalid seed phrase: {e}")))?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let master = Xpriv::new_master(Network::Bitcoin, seed.as_ref())
            .map_err(|e| BraidError::Config(format!("key derivation failed: {e}")))?;
        Ok(PeerKeys::new(master.private_key))
    }
}
