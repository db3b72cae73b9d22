pub(crate) mod rest_client;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChainServiceError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("service connectivity: {0}")]
    ServiceConnectivity(String),

    #[error("http status {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("{0}")]
    Generic(String),
}

impl From<reqwest::Error> for ChainServiceError {
    fn from(err: reqwest::Error) -> Self {
        ChainServiceError::ServiceConnectivity(err.to_string())
    }
}

impl From<bitcoin::address::ParseError> for ChainServiceError {
    fn from(err: bitcoin::address::ParseError) -> Self {
        ChainServiceError::InvalidAddress(err.to_string())
    }
}

/// Confirmation state of a transaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_time: Option<u64>,
}

/// An unspent output of a watched address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: TxStatus,
}

/// Fee estimates in sat/vB for various confirmation targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedFees {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}

/// Access to the bitcoin chain through an esplora/mempool style backend.
#[async_trait::async_trait]
pub trait BitcoinChainService: Send + Sync {
    /// Returns the unspent outputs of the given address.
    async fn get_address_utxos(&self, address: String) -> Result<Vec<Utxo>, ChainServiceError>;

    /// Returns the confirmation status of the given transaction.
    async fn get_transaction_status(&self, txid: String) -> Result<TxStatus, ChainServiceError>;

    /// Returns the raw transaction in hex.
    async fn get_transaction_hex(&self, txid: String) -> Result<String, ChainServiceError>;

    /// Broadcasts a raw transaction. Succeeds when the backend already knows
    /// the transaction.
    async fn broadcast_transaction(&self, tx_hex: String) -> Result<Txid, ChainServiceError>;

    /// Returns current fee estimates.
    async fn recommended_fees(&self) -> Result<RecommendedFees, ChainServiceError>;
}
