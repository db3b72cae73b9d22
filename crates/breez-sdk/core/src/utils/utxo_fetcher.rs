use std::{str::FromStr, sync::Arc};

use bitcoin::{Transaction, Txid, consensus::encode::deserialize_hex};

use crate::{
    SdkError,
    chain::BitcoinChainService,
    models::DepositInfo,
    persist::{ObjectCacheRepository, Storage},
};

/// A deposit utxo together with its full funding transaction.
pub(crate) struct DetailedUtxo {
    pub tx: Transaction,
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
}

impl From<&DetailedUtxo> for DepositInfo {
    fn from(utxo: &DetailedUtxo) -> Self {
        DepositInfo {
            txid: utxo.txid.to_string(),
            vout: utxo.vout,
            amount_sats: utxo.value,
            refund_tx: None,
            refund_tx_id: None,
            claim_error: None,
        }
    }
}

/// Fetches deposit transactions from the chain service, caching the raw
/// transaction hex in storage. Deposit transactions are immutable so cache
/// entries never expire.
pub(crate) struct CachedUtxoFetcher {
    chain_service: Arc<dyn BitcoinChainService>,
    cache: ObjectCacheRepository,
}

impl CachedUtxoFetcher {
    pub fn new(chain_service: Arc<dyn BitcoinChainService>, storage: Arc<dyn Storage>) -> Self {
        Self {
            chain_service,
            cache: ObjectCacheRepository::new(storage),
        }
    }

    pub async fn fetch_detailed_utxo(
        &self,
        txid: &str,
        vout: u32,
    ) -> Result<DetailedUtxo, SdkError> {
        let raw_tx = match self.cache.fetch_tx(txid).await? {
            Some(raw_tx) => raw_tx,
            None => {
                let raw_tx = self
                    .chain_service
                    .get_transaction_hex(txid.to_string())
                    .await?;
                self.cache.save_tx(txid, raw_tx.clone()).await?;
                raw_tx
            }
        };

        let tx: Transaction = deserialize_hex(&raw_tx)
            .map_err(|e| SdkError::Generic(format!("Invalid transaction hex: {e}")))?;
        let output = tx
            .output
            .get(vout as usize)
            .ok_or_else(|| SdkError::MissingUtxo {
                tx: txid.to_string(),
                vout,
            })?;
        let value = output.value.to_sat();
        let txid = Txid::from_str(txid)
            .map_err(|e| SdkError::Generic(format!("Invalid txid: {e}")))?;
        Ok(DetailedUtxo {
            tx,
            txid,
            vout,
            value,
        })
    }
}
