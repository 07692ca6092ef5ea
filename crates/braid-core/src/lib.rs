pub mod config;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod lightning;
pub mod mint;
pub mod outputs;
pub mod proof;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod swap;
pub mod token;
pub mod tracker;
pub mod wallet;
