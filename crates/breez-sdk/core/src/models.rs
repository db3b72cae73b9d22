use std::str::FromStr;

use breez_sdk_common::{
    input::Bolt11InvoiceDetails,
    lnurl::pay::{LnurlPayRequestDetails, SuccessAction, SuccessActionProcessed},
    network::BitcoinNetwork,
};
use serde::{Deserialize, Serialize};

use crate::SdkError;

pub use crate::error::DepositClaimError;

/// The direction of a payment as seen from this wallet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Send,
    Receive,
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentType::Send => write!(f, "send"),
            PaymentType::Receive => write!(f, "receive"),
        }
    }
}

impl FromStr for PaymentType {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(PaymentType::Send),
            "receive" => Ok(PaymentType::Receive),
            _ => Err(SdkError::Generic(format!("Invalid payment type: {s}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    /// Whether the payment can no longer change state.
    pub fn is_final(self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Completed => write!(f, "completed"),
            PaymentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(SdkError::Generic(format!("Invalid payment status: {s}"))),
        }
    }
}

/// The payment rail a payment was made on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Lightning,
    Deposit,
    Withdraw,
    Unknown,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::Lightning => write!(f, "lightning"),
            PaymentMethod::Deposit => write!(f, "deposit"),
            PaymentMethod::Withdraw => write!(f, "withdraw"),
            PaymentMethod::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lightning" => Ok(PaymentMethod::Lightning),
            "deposit" => Ok(PaymentMethod::Deposit),
            "withdraw" => Ok(PaymentMethod::Withdraw),
            "unknown" => Ok(PaymentMethod::Unknown),
            _ => Err(SdkError::Generic(format!("Invalid payment method: {s}"))),
        }
    }
}

/// Rail-specific payment details.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PaymentDetails {
    Lightning {
        description: Option<String>,
        preimage: Option<String>,
        invoice: String,
        payment_hash: String,
        destination_pubkey: String,
        lnurl_pay_info: Option<LnurlPayInfo>,
    },
    Withdraw {
        tx_id: String,
    },
    Deposit {
        tx_id: String,
        vout: u32,
    },
}

/// A single payment made or received by the wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    /// Unique identifier: the payment hash for lightning payments, the
    /// transaction id for on-chain payments.
    pub id: String,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    /// Amount in satoshis, excluding fees.
    pub amount: u64,
    /// Fees paid in satoshis.
    pub fees: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    pub method: PaymentMethod,
    pub details: Option<PaymentDetails>,
}

/// A fee, either absolute or relative to transaction size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fee {
    Fixed { amount: u64 },
    Rate { sat_per_vbyte: u64 },
}

impl Fee {
    /// Resolves the fee to satoshis for a transaction of the given virtual size.
    pub fn to_sats(&self, tx_vsize: u64) -> u64 {
        match self {
            Fee::Fixed { amount } => *amount,
            Fee::Rate { sat_per_vbyte } => sat_per_vbyte.saturating_mul(tx_vsize),
        }
    }
}

impl std::fmt::Display for Fee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fee::Fixed { amount } => write!(f, "Fixed: {amount}"),
            Fee::Rate { sat_per_vbyte } => write!(f, "Rate: {sat_per_vbyte}"),
        }
    }
}

/// An on-chain deposit to the wallet's static deposit address that has not
/// been claimed yet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositInfo {
    pub txid: String,
    pub vout: u32,
    pub amount_sats: u64,
    pub refund_tx: Option<String>,
    pub refund_tx_id: Option<String>,
    pub claim_error: Option<DepositClaimError>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl From<Network> for BitcoinNetwork {
    fn from(network: Network) -> Self {
        bitcoin::Network::from(network).into()
    }
}

impl From<bitcoin::Network> for Network {
    fn from(network: bitcoin::Network) -> Self {
        match network {
            bitcoin::Network::Testnet | bitcoin::Network::Testnet4 => Network::Testnet,
            bitcoin::Network::Signet => Network::Signet,
            bitcoin::Network::Regtest => Network::Regtest,
            _ => Network::Mainnet,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Api key used to authenticate against the node service.
    pub api_key: Option<String>,
    pub network: Network,
    /// Interval in seconds between background wallet syncs.
    pub sync_interval_secs: u32,
    /// Upper bound on the fee paid when automatically claiming deposits.
    /// When `None`, deposits are not claimed automatically.
    pub max_deposit_claim_fee: Option<Fee>,
    /// When set, the domain used to display lightning addresses.
    pub lnurl_domain: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetInfoRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetInfoResponse {
    pub balance_sats: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncWalletRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncWalletResponse {}

/// How the wallet should be paid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReceivePaymentMethod {
    /// The wallet's static on-chain deposit address.
    BitcoinAddress,
    Bolt11Invoice {
        description: String,
        amount_sats: Option<u64>,
    },
    /// A BIP21 uri combining the deposit address and a bolt11 invoice.
    Bip21 {
        description: String,
        amount_sats: Option<u64>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceivePaymentRequest {
    pub payment_method: ReceivePaymentMethod,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceivePaymentResponse {
    pub payment_request: String,
    pub fee_sats: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareSendPaymentRequest {
    pub payment_request: String,
    /// Amount in satoshis. Must be set for amountless payment requests,
    /// ignored when the payment request carries an amount.
    pub amount_sats: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SendPaymentMethod {
    Bolt11Invoice {
        invoice_details: Bolt11InvoiceDetails,
        fee_sats: u64,
    },
    BitcoinAddress {
        address: String,
        fee_sats: u64,
    },
}

impl SendPaymentMethod {
    pub fn fee_sats(&self) -> u64 {
        match self {
            SendPaymentMethod::Bolt11Invoice { fee_sats, .. }
            | SendPaymentMethod::BitcoinAddress { fee_sats, .. } => *fee_sats,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareSendPaymentResponse {
    pub payment_method: SendPaymentMethod,
    pub amount_sats: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendPaymentRequest {
    pub prepare_response: PrepareSendPaymentResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendPaymentResponse {
    pub payment: Payment,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListPaymentsRequest {
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListPaymentsResponse {
    pub payments: Vec<Payment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPaymentRequest {
    pub payment_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPaymentResponse {
    pub payment: Payment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimDepositRequest {
    pub txid: String,
    pub vout: u32,
    /// Overrides the configured maximum claim fee for this claim.
    pub max_fee: Option<Fee>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimDepositResponse {
    pub payment: Payment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundDepositRequest {
    pub txid: String,
    pub vout: u32,
    pub destination_address: String,
    pub fee: Fee,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundDepositResponse {
    pub tx_id: String,
    pub tx_hex: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListUnclaimedDepositsRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListUnclaimedDepositsResponse {
    pub deposits: Vec<DepositInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareLnurlPayRequest {
    pub amount_sats: u64,
    pub pay_request: LnurlPayRequestDetails,
    pub comment: Option<String>,
    /// Validates that the success action url matches the callback domain.
    /// Defaults to `true` when unset.
    pub validate_success_action_url: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareLnurlPayResponse {
    pub amount_sats: u64,
    pub comment: Option<String>,
    pub pay_request: LnurlPayRequestDetails,
    pub fee_sats: u64,
    pub invoice_details: Bolt11InvoiceDetails,
    pub success_action: Option<SuccessAction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnurlPayRequest {
    pub prepare_response: PrepareLnurlPayResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnurlPayResponse {
    pub payment: Payment,
    pub success_action: Option<SuccessActionProcessed>,
}

/// Metadata about the LNURL-pay flow a lightning payment originated from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnurlPayInfo {
    pub ln_address: Option<String>,
    pub comment: Option<String>,
    pub domain: Option<String>,
    pub metadata: Option<String>,
    pub processed_success_action: Option<SuccessActionProcessed>,
    pub raw_success_action: Option<SuccessAction>,
}

impl LnurlPayInfo {
    /// Extracts the `text/plain` entry from the LUD-06 metadata array.
    pub fn extract_description(&self) -> Option<String> {
        let metadata = self.metadata.as_ref()?;
        let entries: Vec<Vec<serde_json::Value>> = serde_json::from_str(metadata).ok()?;
        entries.iter().find_map(|entry| match entry.as_slice() {
            [key, value] if key.as_str() == Some("text/plain") => {
                value.as_str().map(ToString::to_string)
            }
            _ => None,
        })
    }
}

/// Hook allowing the host application to receive the sdk's log stream.
pub trait Logger: Send + Sync {
    fn log(&self, l: LogEntry);
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub line: String,
    pub level: String,
}
