use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use super::utxo_fetcher::{CachedUtxoFetcher, DetailedUtxo};
use crate::{SdkError, chain::BitcoinChainService, persist::Storage};

/// Reconciles the unclaimed deposits table with the deposit address utxo set
/// reported by the chain service.
pub(crate) struct DepositChainSyncer {
    chain_service: Arc<dyn BitcoinChainService>,
    storage: Arc<dyn Storage>,
    utxo_fetcher: CachedUtxoFetcher,
    deposit_address: String,
}

impl DepositChainSyncer {
    pub fn new(
        chain_service: Arc<dyn BitcoinChainService>,
        storage: Arc<dyn Storage>,
        deposit_address: String,
    ) -> Self {
        let utxo_fetcher = CachedUtxoFetcher::new(Arc::clone(&chain_service), Arc::clone(&storage));
        Self {
            chain_service,
            storage,
            utxo_fetcher,
            deposit_address,
        }
    }

    /// Returns the deposit utxos that are currently claimable: on-chain,
    /// recorded in storage, and not part of a pending refund.
    pub async fn sync(&self) -> Result<Vec<DetailedUtxo>, SdkError> {
        let utxos = self
            .chain_service
            .get_address_utxos(self.deposit_address.clone())
            .await?;

        let mut chain_utxos: HashMap<String, DetailedUtxo> = HashMap::new();
        for utxo in utxos {
            let detailed = match self
                .utxo_fetcher
                .fetch_detailed_utxo(&utxo.txid, utxo.vout)
                .await
            {
                Ok(detailed) => detailed,
                Err(e) => {
                    warn!("Failed to fetch deposit tx {}: {e}", utxo.txid);
                    continue;
                }
            };
            self.storage
                .add_deposit(&utxo.txid, utxo.vout, detailed.value)
                .await?;
            chain_utxos.insert(format!("{}:{}", utxo.txid, utxo.vout), detailed);
        }

        let mut refunded_keys = Vec::new();
        for deposit in self.storage.list_deposits().await? {
            let key = format!("{}:{}", deposit.txid, deposit.vout);
            if let Some(refund_tx_id) = &deposit.refund_tx_id {
                refunded_keys.push(key);
                let status = self
                    .chain_service
                    .get_transaction_status(refund_tx_id.clone())
                    .await?;
                if status.confirmed {
                    debug!("Refund {refund_tx_id} confirmed, removing deposit {}", deposit.txid);
                    self.storage
                        .delete_deposit(&deposit.txid, deposit.vout)
                        .await?;
                }
            } else if !chain_utxos.contains_key(&key) {
                // The utxo is gone from the chain view, so it was spent.
                debug!("Deposit {key} no longer unspent, removing");
                self.storage
                    .delete_deposit(&deposit.txid, deposit.vout)
                    .await?;
            }
        }

        Ok(chain_utxos
            .into_iter()
            .filter(|(key, _)| !refunded_keys.contains(key))
            .map(|(_, utxo)| utxo)
            .collect())
    }
}
