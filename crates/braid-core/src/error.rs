use thiserror::Error;

#[derive(Debug, Error)]
pub enum BraidError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid contract: {0}")]
    Contract(String),

    #[error("invalid token: {0}")]
    Token(String),

    #[error("invalid amount: {0}")]
    Amount(String),

    #[error("insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("mint error {code}: {detail}")]
    Mint { code: i64, detail: String },

    #[error("request to {peer} timed out after {seconds}s")]
    Timeout { peer: String, seconds: u64 },

    #[error("peer error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("relay error: {0}")]
    Relay(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<secp256k1::Error> for BraidError {
    fn from(e: secp256k1::Error) -> Self {
        BraidError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BraidError>;
