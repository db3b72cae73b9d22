use breez_sdk_common::{
    error::ServiceConnectivityError, input::ParseError, lnurl::error::LnurlError,
};
use serde::{Deserialize, Serialize};

use crate::{chain::ChainServiceError, models::Fee, node::NodeError, persist::StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("chain service error: {0}")]
    ChainServiceError(#[from] ChainServiceError),

    #[error("node service error: {0}")]
    NodeServiceError(#[from] NodeError),

    #[error("insufficient funds: have {available_sats} sats, need {required_sats} sats")]
    InsufficientFunds {
        available_sats: u64,
        required_sats: u64,
    },

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error(
        "Deposit claim fee exceeds for utxo: {tx}:{vout} with max fee: {max_fee} and actual fee sat: {actual_fee}"
    )]
    DepositClaimFeeExceeded {
        tx: String,
        vout: u32,
        max_fee: Fee,
        actual_fee: u64,
    },

    #[error("Missing utxo: {tx}:{vout}")]
    MissingUtxo { tx: String, vout: u32 },

    #[error("lnurl error: {0}")]
    LnurlError(String),

    #[error("{0}")]
    Generic(String),
}

impl From<LnurlError> for SdkError {
    fn from(err: LnurlError) -> Self {
        SdkError::LnurlError(err.to_string())
    }
}

impl From<ParseError> for SdkError {
    fn from(err: ParseError) -> Self {
        SdkError::InvalidInput(err.to_string())
    }
}

impl From<ServiceConnectivityError> for SdkError {
    fn from(err: ServiceConnectivityError) -> Self {
        SdkError::NetworkError(err.to_string())
    }
}

impl From<bitcoin::address::ParseError> for SdkError {
    fn from(err: bitcoin::address::ParseError) -> Self {
        SdkError::InvalidInput(err.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for SdkError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        SdkError::Generic(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Generic(err.to_string())
    }
}

impl From<String> for SdkError {
    fn from(err: String) -> Self {
        SdkError::Generic(err)
    }
}

impl From<&str> for SdkError {
    fn from(err: &str) -> Self {
        SdkError::Generic(err.to_string())
    }
}

/// Why an automatic or manual deposit claim failed. Stored with the deposit
/// so the failure can be surfaced to the user.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
pub enum DepositClaimError {
    #[error(
        "Deposit claim fee exceeded for tx: {tx}, vout: {vout}, max_fee: {max_fee}, actual_fee: {actual_fee}"
    )]
    DepositClaimFeeExceeded {
        tx: String,
        vout: u32,
        max_fee: Fee,
        actual_fee: u64,
    },

    #[error("Missing utxo for tx: {tx}, vout: {vout}")]
    MissingUtxo { tx: String, vout: u32 },

    #[error("{message}")]
    Generic { message: String },
}

impl From<DepositClaimError> for SdkError {
    fn from(err: DepositClaimError) -> Self {
        match err {
            DepositClaimError::DepositClaimFeeExceeded {
                tx,
                vout,
                max_fee,
                actual_fee,
            } => SdkError::DepositClaimFeeExceeded {
                tx,
                vout,
                max_fee,
                actual_fee,
            },
            DepositClaimError::MissingUtxo { tx, vout } => SdkError::MissingUtxo { tx, vout },
            DepositClaimError::Generic { message } => SdkError::Generic(message),
        }
    }
}

impl From<SdkError> for DepositClaimError {
    fn from(err: SdkError) -> Self {
        match err {
            SdkError::DepositClaimFeeExceeded {
                tx,
                vout,
                max_fee,
                actual_fee,
            } => DepositClaimError::DepositClaimFeeExceeded {
                tx,
                vout,
                max_fee,
                actual_fee,
            },
            SdkError::MissingUtxo { tx, vout } => DepositClaimError::MissingUtxo { tx, vout },
            _ => DepositClaimError::Generic {
                message: err.to_string(),
            },
        }
    }
}
