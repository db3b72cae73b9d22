pub(crate) mod sqlite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::DepositClaimError,
    models::{DepositInfo, ListPaymentsRequest, LnurlPayInfo, Payment},
};

const TX_CACHE_KEY: &str = "tx_cache";
const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Underline implementation error: {0}")]
    Implementation(String),

    #[error("Failed to initialize database: {0}")]
    InitializationError(String),

    #[error("Failed to serialize/deserialize data: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Deposit mutation applied when a claim fails or a refund is issued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateDepositPayload {
    ClaimError {
        error: DepositClaimError,
    },
    Refund {
        refund_txid: String,
        refund_tx: String,
    },
}

/// Metadata attached to a payment after it completes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub lnurl_pay_info: Option<LnurlPayInfo>,
    pub lnurl_description: Option<String>,
}

/// Persistent storage backing the wallet.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Fetches a cached item by key, `None` when absent.
    async fn get_cached_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Inserts or replaces a cached item.
    async fn set_cached_item(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Deletes a cached item. Deleting an absent key is not an error.
    async fn delete_cached_item(&self, key: &str) -> Result<(), StorageError>;

    /// Lists payments newest first.
    async fn list_payments(
        &self,
        request: ListPaymentsRequest,
    ) -> Result<Vec<Payment>, StorageError>;

    /// Inserts a payment, replacing any existing payment with the same id.
    async fn insert_payment(&self, payment: Payment) -> Result<(), StorageError>;

    /// Attaches metadata to a payment.
    async fn set_payment_metadata(
        &self,
        payment_id: &str,
        metadata: PaymentMetadata,
    ) -> Result<(), StorageError>;

    async fn get_payment_by_id(&self, id: &str) -> Result<Option<Payment>, StorageError>;

    /// Looks up a lightning payment by its bolt11 invoice.
    async fn get_payment_by_invoice(&self, invoice: &str)
    -> Result<Option<Payment>, StorageError>;

    /// Records an unclaimed deposit. Inserting the same outpoint twice is a
    /// no-op.
    async fn add_deposit(&self, txid: &str, vout: u32, amount_sats: u64)
    -> Result<(), StorageError>;

    async fn delete_deposit(&self, txid: &str, vout: u32) -> Result<(), StorageError>;

    async fn list_deposits(&self) -> Result<Vec<DepositInfo>, StorageError>;

    async fn update_deposit(
        &self,
        txid: &str,
        vout: u32,
        payload: UpdateDepositPayload,
    ) -> Result<(), StorageError>;
}

#[derive(Serialize, Deserialize)]
struct CachedTx {
    raw_tx: String,
}

/// Typed helpers over the storage item cache.
pub(crate) struct ObjectCacheRepository {
    storage: Arc<dyn Storage>,
}

impl ObjectCacheRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn save_tx(&self, txid: &str, raw_tx: String) -> Result<(), StorageError> {
        let value = serde_json::to_string(&CachedTx { raw_tx })?;
        self.storage
            .set_cached_item(&format!("{TX_CACHE_KEY}-{txid}"), value)
            .await
    }

    pub async fn fetch_tx(&self, txid: &str) -> Result<Option<String>, StorageError> {
        let Some(value) = self
            .storage
            .get_cached_item(&format!("{TX_CACHE_KEY}-{txid}"))
            .await?
        else {
            return Ok(None);
        };
        let cached: CachedTx = serde_json::from_str(&value)?;
        Ok(Some(cached.raw_tx))
    }

    pub async fn save_last_sync_time(&self, timestamp: u64) -> Result<(), StorageError> {
        self.storage
            .set_cached_item(LAST_SYNC_TIME_KEY, timestamp.to_string())
            .await
    }

    pub async fn fetch_last_sync_time(&self) -> Result<Option<u64>, StorageError> {
        let Some(value) = self.storage.get_cached_item(LAST_SYNC_TIME_KEY).await? else {
            return Ok(None);
        };
        Ok(value.parse().ok())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod tests {
    use super::*;
    use crate::models::{PaymentDetails, PaymentMethod, PaymentStatus, PaymentType};

    pub fn create_payment(id: &str, timestamp: u64) -> Payment {
        Payment {
            id: id.to_string(),
            payment_type: PaymentType::Send,
            status: PaymentStatus::Completed,
            amount: 1000,
            fees: 2,
            timestamp,
            method: PaymentMethod::Lightning,
            details: Some(PaymentDetails::Lightning {
                description: Some("test payment".to_string()),
                preimage: Some("1234".to_string()),
                invoice: format!("lnbc-{id}"),
                payment_hash: id.to_string(),
                destination_pubkey: "02abc".to_string(),
                lnurl_pay_info: None,
            }),
        }
    }

    pub async fn test_cached_items(storage: Box<dyn Storage>) {
        assert_eq!(storage.get_cached_item("missing").await.unwrap(), None);

        storage
            .set_cached_item("key", "value".to_string())
            .await
            .unwrap();
        assert_eq!(
            storage.get_cached_item("key").await.unwrap(),
            Some("value".to_string())
        );

        storage
            .set_cached_item("key", "value2".to_string())
            .await
            .unwrap();
        assert_eq!(
            storage.get_cached_item("key").await.unwrap(),
            Some("value2".to_string())
        );

        storage.delete_cached_item("key").await.unwrap();
        assert_eq!(storage.get_cached_item("key").await.unwrap(), None);
        storage.delete_cached_item("key").await.unwrap();
    }

    pub async fn test_payments(storage: Box<dyn Storage>) {
        assert!(storage.get_payment_by_id("missing").await.unwrap().is_none());

        let older = create_payment("payment-1", 100);
        let newer = create_payment("payment-2", 200);
        storage.insert_payment(older.clone()).await.unwrap();
        storage.insert_payment(newer.clone()).await.unwrap();

        // Re-inserting the same id must not create a second row.
        storage.insert_payment(older.clone()).await.unwrap();

        let payments = storage
            .list_payments(ListPaymentsRequest::default())
            .await
            .unwrap();
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].id, "payment-2");
        assert_eq!(payments[1].id, "payment-1");

        let limited = storage
            .list_payments(ListPaymentsRequest {
                offset: Some(1),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "payment-1");

        let by_id = storage.get_payment_by_id("payment-1").await.unwrap();
        assert_eq!(by_id.unwrap().id, "payment-1");

        let by_invoice = storage
            .get_payment_by_invoice("lnbc-payment-2")
            .await
            .unwrap();
        assert_eq!(by_invoice.unwrap().id, "payment-2");
        assert!(
            storage
                .get_payment_by_invoice("lnbc-missing")
                .await
                .unwrap()
                .is_none()
        );
    }

    pub async fn test_listing_is_stable_across_equal_timestamps(storage: Box<dyn Storage>) {
        for id in ["pay-a", "pay-b", "pay-c"] {
            storage.insert_payment(create_payment(id, 500)).await.unwrap();
        }

        let all = storage
            .list_payments(ListPaymentsRequest::default())
            .await
            .unwrap();
        let ids: Vec<String> = all.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, ["pay-c", "pay-b", "pay-a"]);

        // Pagination walks the same order without skips or repeats.
        let mut paged = Vec::new();
        for offset in 0..3u32 {
            let page = storage
                .list_payments(ListPaymentsRequest {
                    offset: Some(offset),
                    limit: Some(1),
                })
                .await
                .unwrap();
            assert_eq!(page.len(), 1);
            paged.push(page[0].id.clone());
        }
        assert_eq!(paged, ids);
    }

    pub async fn test_payment_metadata(storage: Box<dyn Storage>) {
        let payment = create_payment("payment-meta", 100);
        storage.insert_payment(payment).await.unwrap();
        storage
            .set_payment_metadata(
                "payment-meta",
                PaymentMetadata {
                    lnurl_pay_info: Some(LnurlPayInfo {
                        ln_address: Some("user@domain.com".to_string()),
                        comment: None,
                        domain: Some("domain.com".to_string()),
                        metadata: None,
                        processed_success_action: None,
                        raw_success_action: None,
                    }),
                    lnurl_description: Some("described".to_string()),
                },
            )
            .await
            .unwrap();

        let payment = storage
            .get_payment_by_id("payment-meta")
            .await
            .unwrap()
            .unwrap();
        let Some(PaymentDetails::Lightning { lnurl_pay_info, .. }) = payment.details else {
            panic!("expected lightning details");
        };
        assert_eq!(
            lnurl_pay_info.unwrap().ln_address,
            Some("user@domain.com".to_string())
        );
    }

    pub async fn test_unclaimed_deposits_crud(storage: Box<dyn Storage>) {
        storage.add_deposit("txid_1", 0, 5000).await.unwrap();
        storage.add_deposit("txid_1", 1, 2000).await.unwrap();
        // Idempotent on the same outpoint.
        storage.add_deposit("txid_1", 0, 5000).await.unwrap();

        let deposits = storage.list_deposits().await.unwrap();
        assert_eq!(deposits.len(), 2);

        storage
            .update_deposit(
                "txid_1",
                0,
                super::UpdateDepositPayload::ClaimError {
                    error: DepositClaimError::Generic {
                        message: "claim failed".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        let deposits = storage.list_deposits().await.unwrap();
        let deposit = deposits
            .iter()
            .find(|d| d.txid == "txid_1" && d.vout == 0)
            .unwrap();
        assert!(deposit.claim_error.is_some());

        storage.delete_deposit("txid_1", 0).await.unwrap();
        let deposits = storage.list_deposits().await.unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].vout, 1);
    }

    pub async fn test_deposit_refunds(storage: Box<dyn Storage>) {
        storage.add_deposit("txid_refund", 0, 7000).await.unwrap();
        storage
            .update_deposit(
                "txid_refund",
                0,
                super::UpdateDepositPayload::Refund {
                    refund_txid: "refund_tx_id_456".to_string(),
                    refund_tx: "0200000001abcd1234".to_string(),
                },
            )
            .await
            .unwrap();

        let deposits = storage.list_deposits().await.unwrap();
        let deposit = deposits.iter().find(|d| d.txid == "txid_refund").unwrap();
        assert_eq!(deposit.refund_tx_id.as_deref(), Some("refund_tx_id_456"));
        assert_eq!(deposit.refund_tx.as_deref(), Some("0200000001abcd1234"));
    }
}
