use std::{sync::OnceLock, time::Duration};

use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::info;

use super::{NodeError, NodeInvoice, NodePayment, NodeService};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct CreateInvoicePayload {
    amount_sats: Option<u64>,
    description: Option<String>,
}

#[derive(Serialize)]
struct PayInvoicePayload<'a> {
    invoice: &'a str,
    amount_sats: Option<u64>,
    max_fee_sats: u64,
}

#[derive(Deserialize)]
struct FeeEstimateResponse {
    fee_sats: u64,
}

/// [`NodeService`] talking to a remote lightning node over its REST api.
pub struct RestClientNodeService {
    base_url: String,
    api_key: Option<String>,
    client: OnceLock<Client>,
}

impl RestClientNodeService {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: OnceLock::new(),
        }
    }

    fn get_client(&self) -> Result<&Client, NodeError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(self.client.get_or_init(|| client))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NodeError> {
        let url = format!("{}{}", self.base_url, path);
        info!("Making GET request to: {url}");
        let mut request = self.get_client()?.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, NodeError> {
        let url = format!("{}{}", self.base_url, path);
        info!("Making POST request to: {url}");
        let mut request = self.get_client()?.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NodeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(NodeError::HttpError {
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|e| NodeError::Generic(e.to_string()))
    }
}

#[async_trait::async_trait]
impl NodeService for RestClientNodeService {
    async fn create_invoice(
        &self,
        amount_sats: Option<u64>,
        description: Option<String>,
    ) -> Result<NodeInvoice, NodeError> {
        self.post_json(
            "/v1/invoices",
            &CreateInvoicePayload {
                amount_sats,
                description,
            },
        )
        .await
    }

    async fn send_fee_estimate(
        &self,
        invoice: &str,
        amount_sats: Option<u64>,
    ) -> Result<u64, NodeError> {
        let mut path = format!("/v1/payments/estimate?invoice={invoice}");
        if let Some(amount) = amount_sats {
            path = format!("{path}&amount_sats={amount}");
        }
        let response: FeeEstimateResponse = self.get_json(&path).await?;
        Ok(response.fee_sats)
    }

    async fn pay_invoice(
        &self,
        invoice: &str,
        amount_sats: Option<u64>,
        max_fee_sats: u64,
    ) -> Result<NodePayment, NodeError> {
        self.post_json(
            "/v1/payments",
            &PayInvoicePayload {
                invoice,
                amount_sats,
                max_fee_sats,
            },
        )
        .await
    }

    async fn payment_status(&self, payment_hash: &str) -> Result<NodePayment, NodeError> {
        self.get_json(&format!("/v1/payments/{payment_hash}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodePaymentStatus;

    #[tokio::test]
    async fn test_create_invoice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/invoices")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(r#"{"bolt11":"lnbc1...","payment_hash":"abcd"}"#)
            .create_async()
            .await;

        let service = RestClientNodeService::new(server.url(), Some("test-key".to_string()));
        let invoice = service
            .create_invoice(Some(1000), Some("coffee".to_string()))
            .await
            .unwrap();
        assert_eq!(invoice.bolt11, "lnbc1...");
        assert_eq!(invoice.payment_hash, "abcd");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pay_invoice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payments")
            .with_status(200)
            .with_body(
                r#"{"payment_hash":"abcd","preimage":"ef01","fee_sats":3,"status":"completed"}"#,
            )
            .create_async()
            .await;

        let service = RestClientNodeService::new(server.url(), None);
        let payment = service.pay_invoice("lnbc1...", None, 10).await.unwrap();
        assert_eq!(payment.status, NodePaymentStatus::Completed);
        assert_eq!(payment.preimage.as_deref(), Some("ef01"));
        assert_eq!(payment.fee_sats, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_payment_status_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/abcd")
            .with_status(404)
            .with_body("payment not found")
            .create_async()
            .await;

        let service = RestClientNodeService::new(server.url(), None);
        let result = service.payment_status("abcd").await;
        assert!(matches!(
            result,
            Err(NodeError::HttpError { status: 404, .. })
        ));
        mock.assert_async().await;
    }
}
