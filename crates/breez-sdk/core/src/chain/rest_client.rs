use std::{str::FromStr, sync::OnceLock, time::Duration};

use bitcoin::{Address, Network, Transaction, Txid, consensus::encode::deserialize_hex};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{BitcoinChainService, ChainServiceError, RecommendedFees, TxStatus, Utxo};
use crate::models::Credentials;

const RETRYABLE_ERROR_CODES: [StatusCode; 3] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::SERVICE_UNAVAILABLE,
];
const BASE_BACKOFF_MILLIS: Duration = Duration::from_millis(256);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// Error fragments esplora/bitcoind return when a broadcast transaction is
// already known. Broadcasting such a transaction is treated as success.
const ALREADY_KNOWN_ERRORS: [&str; 3] = [
    "already in block chain",
    "Transaction already in mempool",
    "txn-already-known",
];

/// [`BitcoinChainService`] backed by an esplora/mempool REST api.
pub struct RestClientChainService {
    base_url: String,
    network: Network,
    client: OnceLock<Client>,
    max_retries: usize,
    credentials: Option<Credentials>,
}

impl RestClientChainService {
    pub fn new(
        base_url: String,
        network: Network,
        max_retries: usize,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            base_url,
            network,
            client: OnceLock::new(),
            max_retries,
            credentials,
        }
    }

    fn get_client(&self) -> Result<&Client, ChainServiceError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(self.client.get_or_init(|| client))
    }

    async fn get_response_text(&self, path: &str) -> Result<String, ChainServiceError> {
        let url = format!("{}{}", self.base_url, path);
        info!("Making GET request to: {url}");
        let response = self.get_with_retry(&url).await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChainServiceError::HttpError {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body)
    }

    async fn get_response_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ChainServiceError> {
        let body = self.get_response_text(path).await?;
        serde_json::from_str(&body).map_err(|e| ChainServiceError::Generic(e.to_string()))
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ChainServiceError> {
        let mut attempts = 0;
        let mut delay = BASE_BACKOFF_MILLIS;
        loop {
            let mut request = self.get_client()?.get(url);
            if let Some(credentials) = &self.credentials {
                request = request.basic_auth(&credentials.username, Some(&credentials.password));
            }
            let response = request.send().await?;
            match response {
                resp if attempts < self.max_retries && is_status_retryable(resp.status()) => {
                    debug!("Retrying {url} after {delay:?}, status: {}", resp.status());
                    tokio::time::sleep(delay).await;
                    attempts = attempts.saturating_add(1);
                    delay = delay.saturating_mul(2);
                }
                resp => return Ok(resp),
            }
        }
    }
}

#[async_trait::async_trait]
impl BitcoinChainService for RestClientChainService {
    async fn get_address_utxos(&self, address: String) -> Result<Vec<Utxo>, ChainServiceError> {
        Address::from_str(&address)?.require_network(self.network)?;
        self.get_response_json(&format!("/address/{address}/utxo"))
            .await
    }

    async fn get_transaction_status(&self, txid: String) -> Result<TxStatus, ChainServiceError> {
        self.get_response_json(&format!("/tx/{txid}/status")).await
    }

    async fn get_transaction_hex(&self, txid: String) -> Result<String, ChainServiceError> {
        self.get_response_text(&format!("/tx/{txid}/hex")).await
    }

    async fn broadcast_transaction(&self, tx_hex: String) -> Result<Txid, ChainServiceError> {
        let tx: Transaction = deserialize_hex(&tx_hex)
            .map_err(|e| ChainServiceError::Generic(format!("Invalid transaction hex: {e}")))?;

        let url = format!("{}/tx", self.base_url);
        info!("Broadcasting transaction to: {url}");
        let mut request = self.get_client()?.post(&url).body(tx_hex);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Txid::from_str(body.trim())
                .map_err(|e| ChainServiceError::Generic(format!("Invalid txid response: {e}")));
        }

        if ALREADY_KNOWN_ERRORS.iter().any(|e| body.contains(e)) {
            debug!("Transaction already known to the backend: {body}");
            return Ok(tx.compute_txid());
        }

        Err(ChainServiceError::HttpError {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn recommended_fees(&self) -> Result<RecommendedFees, ChainServiceError> {
        self.get_response_json("/v1/fees/recommended").await
    }
}

fn is_status_retryable(status: StatusCode) -> bool {
    RETRYABLE_ERROR_CODES.contains(&status)
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::encode::serialize_hex;

    use super::*;

    fn utxo_fixture() -> &'static str {
        r#"[
            {"txid":"277bbdc31b8a1b1b9e4496b9e64d078805e519eeeaf932b1e3b37b48bbff4deb","vout":1,"status":{"confirmed":true,"block_height":811353,"block_hash":"000000000000000000030a7ec4c4188a9c9f19d1ba62c67a57bf1e2d5f0c8b65","block_time":1695973433},"value":24201},
            {"txid":"3a3774437b5a09e4f2a777e58e3e0b5b8ad95c53b4e985ce39be6cb054cb8c23","vout":0,"status":{"confirmed":true,"block_height":811405,"block_hash":"00000000000000000003292bbea70bdbaaed5ad3bd1bcc2851bb90fe872e4efc","block_time":1696004375},"value":30236},
            {"txid":"5f2712d4b1b2dee2a1c7ed18e8e41ebbecc6dcbdbca6eaf532ec9b423cd9c9a6","vout":0,"status":{"confirmed":true,"block_height":811353,"block_hash":"000000000000000000030a7ec4c4188a9c9f19d1ba62c67a57bf1e2d5f0c8b65","block_time":1695973433},"value":5155},
            {"txid":"7cb441087dd28bdfeeb79c9c8a5b7e4b38b8a4c3f33b2e2a3a34e0dcdf8a76d1","vout":1,"status":{"confirmed":false},"value":6127},
            {"txid":"4654a83d2a2397dcdf1b278e12c578827a7d0c32eb1f7a40f5b1b59a51d7d6a5","vout":0,"status":{"confirmed":true,"block_height":811399,"block_hash":"0000000000000000000133f5e4c3c1ddbbd2d129e4e3b6f3a2b2a77e27a44a07","block_time":1696001373},"value":22190}
        ]"#
    }

    #[tokio::test]
    async fn test_get_address_utxos() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/address/1wiz18xYmhRX6xStj2b9t1rwWX4GKUgpv/utxo",
            )
            .with_status(200)
            .with_body(utxo_fixture())
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let utxos = service
            .get_address_utxos("1wiz18xYmhRX6xStj2b9t1rwWX4GKUgpv".to_string())
            .await
            .unwrap();

        assert_eq!(utxos.len(), 5);
        assert_eq!(
            utxos[0].txid,
            "277bbdc31b8a1b1b9e4496b9e64d078805e519eeeaf932b1e3b37b48bbff4deb"
        );
        assert_eq!(utxos[0].value, 24201);
        assert!(utxos[0].status.confirmed);
        assert_eq!(utxos[0].status.block_height, Some(811_353));
        assert!(!utxos[3].status.confirmed);
        assert_eq!(utxos[3].status.block_height, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_address_utxos_invalid_address() {
        let server = mockito::Server::new_async().await;
        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let result = service
            .get_address_utxos("not-an-address".to_string())
            .await;
        assert!(matches!(result, Err(ChainServiceError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tx/abc/hex")
            .with_status(500)
            .with_body("boom")
            .expect(3)
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 2, None);
        let result = service.get_transaction_hex("abc".to_string()).await;
        assert!(matches!(
            result,
            Err(ChainServiceError::HttpError { status: 500, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_retry_on_client_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tx/abc/hex")
            .with_status(404)
            .with_body("Transaction not found")
            .expect(1)
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let result = service.get_transaction_hex("abc".to_string()).await;
        assert!(matches!(
            result,
            Err(ChainServiceError::HttpError { status: 404, .. })
        ));
        mock.assert_async().await;
    }

    fn dummy_tx() -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    #[tokio::test]
    async fn test_broadcast_already_known() {
        let mut server = mockito::Server::new_async().await;
        let tx = dummy_tx();
        let mock = server
            .mock("POST", "/tx")
            .with_status(400)
            .with_body(
                r#"sendrawtransaction RPC error: {"code":-27,"message":"Transaction already in mempool"}"#,
            )
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let txid = service
            .broadcast_transaction(serialize_hex(&tx))
            .await
            .unwrap();
        assert_eq!(txid, tx.compute_txid());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_broadcast_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tx")
            .with_status(400)
            .with_body("bad-txns-inputs-missingorspent")
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let result = service.broadcast_transaction(serialize_hex(&dummy_tx())).await;
        assert!(matches!(
            result,
            Err(ChainServiceError::HttpError { status: 400, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_recommended_fees() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(
                r#"{"fastestFee":32,"halfHourFee":20,"hourFee":12,"economyFee":5,"minimumFee":1}"#,
            )
            .create_async()
            .await;

        let service = RestClientChainService::new(server.url(), Network::Bitcoin, 3, None);
        let fees = service.recommended_fees().await.unwrap();
        assert_eq!(fees.fastest_fee, 32);
        assert_eq!(fees.half_hour_fee, 20);
        assert_eq!(fees.minimum_fee, 1);
        mock.assert_async().await;
    }
}
