pub(crate) mod rest_client;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("service connectivity: {0}")]
    ServiceConnectivity(String),

    #[error("http status {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("{0}")]
    Generic(String),
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::ServiceConnectivity(err.to_string())
    }
}

/// A bolt11 invoice issued by the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInvoice {
    pub bolt11: String,
    pub payment_hash: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// State of an outgoing payment as reported by the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePayment {
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub fee_sats: u64,
    pub status: NodePaymentStatus,
}

/// The lightning node backing the wallet. Holds the wallet's channel
/// liquidity and executes payments on its behalf.
#[async_trait::async_trait]
pub trait NodeService: Send + Sync {
    /// Creates a bolt11 invoice. `amount_sats` of `None` creates an
    /// amountless invoice.
    async fn create_invoice(
        &self,
        amount_sats: Option<u64>,
        description: Option<String>,
    ) -> Result<NodeInvoice, NodeError>;

    /// Estimates the routing fee for paying the given invoice.
    async fn send_fee_estimate(
        &self,
        invoice: &str,
        amount_sats: Option<u64>,
    ) -> Result<u64, NodeError>;

    /// Pays the given invoice, spending at most `max_fee_sats` on routing
    /// fees. `amount_sats` must be set for amountless invoices.
    async fn pay_invoice(
        &self,
        invoice: &str,
        amount_sats: Option<u64>,
        max_fee_sats: u64,
    ) -> Result<NodePayment, NodeError>;

    /// Returns the current state of an outgoing payment.
    async fn payment_status(&self, payment_hash: &str) -> Result<NodePayment, NodeError>;
}
