use std::{
    collections::HashMap,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use bitcoin::{
    Address, Amount, Denomination,
    consensus::encode::serialize_hex,
    hashes::{Hash, sha256},
};
use breez_sdk_common::{
    input::{Bolt11InvoiceDetails, InputType},
    invoice::validate_network,
    lnurl::pay::{
        AesSuccessActionDataDecrypted, AesSuccessActionDataResult, LnurlPayRequestDetails,
        SuccessAction, SuccessActionProcessed, ValidatedCallbackResponse, validate_lnurl_pay,
    },
    rest::RestClient,
};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{
    SdkError,
    chain::{BitcoinChainService, ChainServiceError},
    events::{EventEmitter, EventListener, SdkEvent},
    models::{
        ClaimDepositRequest, ClaimDepositResponse, Config, DepositInfo, Fee, GetInfoRequest,
        GetInfoResponse, GetPaymentRequest, GetPaymentResponse, ListPaymentsRequest,
        ListPaymentsResponse, ListUnclaimedDepositsRequest, ListUnclaimedDepositsResponse,
        LnurlPayInfo, LnurlPayRequest, LnurlPayResponse, Network, Payment, PaymentDetails,
        PaymentMethod, PaymentStatus, PaymentType, PrepareLnurlPayRequest, PrepareLnurlPayResponse,
        PrepareSendPaymentRequest, PrepareSendPaymentResponse, ReceivePaymentMethod,
        ReceivePaymentRequest, ReceivePaymentResponse, RefundDepositRequest, RefundDepositResponse,
        SendPaymentMethod, SendPaymentRequest, SendPaymentResponse, SyncWalletRequest,
        SyncWalletResponse,
    },
    node::{NodePaymentStatus, NodeService},
    persist::{
        ObjectCacheRepository, PaymentMetadata, Storage, StorageError, UpdateDepositPayload,
        sqlite::SqliteStorage,
    },
    utils,
    utils::{
        deposit_chain_syncer::DepositChainSyncer,
        utxo_fetcher::{CachedUtxoFetcher, DetailedUtxo},
    },
    wallet::{CLAIM_TX_VSIZE, DepositWallet},
};

/// Estimated virtual size of an on-chain withdrawal (two inputs, two
/// outputs, p2wpkh).
const WITHDRAW_TX_VSIZE: u64 = 209;

const WAKEUP_INTERVAL: Duration = Duration::from_secs(10);

/// Parses an input string into a recognized payment request type.
pub async fn parse_input(input: &str) -> Result<InputType, SdkError> {
    Ok(breez_sdk_common::input::parse(input, None).await?)
}

pub fn default_config(network: Network) -> Config {
    Config {
        api_key: None,
        network,
        sync_interval_secs: 60,
        max_deposit_claim_fee: None,
        lnurl_domain: None,
    }
}

pub fn default_storage(data_dir: &str) -> Result<SqliteStorage, SdkError> {
    Ok(SqliteStorage::new(PathBuf::from(data_dir))?)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SyncType {
    Full,
    PaymentsOnly,
}

/// The wallet engine. Construct it through [`crate::SdkBuilder`].
#[derive(Clone)]
pub struct BreezSdk {
    pub(crate) config: Config,
    pub(crate) wallet: Arc<DepositWallet>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) chain_service: Arc<dyn BitcoinChainService>,
    pub(crate) node_service: Arc<dyn NodeService>,
    pub(crate) lnurl_client: Arc<dyn RestClient>,
    pub(crate) event_emitter: Arc<EventEmitter>,
    pub(crate) shutdown_sender: watch::Sender<()>,
    pub(crate) shutdown_receiver: watch::Receiver<()>,
    pub(crate) sync_trigger: broadcast::Sender<SyncType>,
    pub(crate) deposit_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl BreezSdk {
    /// Starts the background sync loop and schedules an initial sync.
    pub(crate) fn start(&self) {
        self.periodic_sync();
        if let Err(e) = self.sync_trigger.send(SyncType::Full) {
            debug!("Failed to schedule initial sync: {e}");
        }
    }

    fn periodic_sync(&self) {
        let sdk = self.clone();
        let mut shutdown_receiver = self.shutdown_receiver.clone();
        let mut sync_trigger_receiver = self.sync_trigger.subscribe();
        let sync_interval = Duration::from_secs(u64::from(self.config.sync_interval_secs));
        tokio::spawn(async move {
            let mut last_full_sync = Instant::now();
            loop {
                tokio::select! {
                    _ = shutdown_receiver.changed() => {
                        info!("Background sync loop shutting down");
                        return;
                    }
                    trigger = sync_trigger_receiver.recv() => {
                        let mut sync_type = match trigger {
                            Ok(sync_type) => sync_type,
                            Err(broadcast::error::RecvError::Lagged(_)) => SyncType::Full,
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                        // Coalesce triggers that piled up while a sync ran.
                        while let Ok(extra) = sync_trigger_receiver.try_recv() {
                            if extra == SyncType::Full {
                                sync_type = SyncType::Full;
                            }
                        }
                        if let Err(e) = sdk.sync_wallet_internal(sync_type).await {
                            error!("Wallet sync failed: {e}");
                        }
                        if sync_type == SyncType::Full {
                            last_full_sync = Instant::now();
                        }
                    }
                    () = tokio::time::sleep(WAKEUP_INTERVAL) => {
                        if last_full_sync.elapsed() >= sync_interval {
                            let _ = sdk.sync_trigger.send(SyncType::Full);
                        }
                    }
                }
            }
        });
    }

    async fn sync_wallet_internal(&self, sync_type: SyncType) -> Result<(), SdkError> {
        let start = Instant::now();
        if sync_type == SyncType::Full {
            self.check_and_claim_deposits().await?;
        }
        self.sync_pending_payments().await?;
        ObjectCacheRepository::new(Arc::clone(&self.storage))
            .save_last_sync_time(utils::now())
            .await?;
        info!("Wallet sync completed in {:?}", start.elapsed());
        self.event_emitter.emit(&SdkEvent::Synced).await;
        Ok(())
    }

    async fn check_and_claim_deposits(&self) -> Result<(), SdkError> {
        let syncer = DepositChainSyncer::new(
            Arc::clone(&self.chain_service),
            Arc::clone(&self.storage),
            self.wallet.deposit_address().to_string(),
        );
        let claimable = syncer.sync().await?;

        let mut claimed = Vec::new();
        let mut unclaimed = Vec::new();
        for utxo in claimable {
            let Some(max_fee) = self.config.max_deposit_claim_fee.clone() else {
                unclaimed.push(DepositInfo::from(&utxo));
                continue;
            };
            match self.claim_utxo(&utxo, Some(max_fee)).await {
                Ok(_) => claimed.push(DepositInfo::from(&utxo)),
                Err(e) => {
                    warn!("Failed to claim deposit {}:{}: {e}", utxo.txid, utxo.vout);
                    let error = crate::error::DepositClaimError::from(e);
                    if let Err(e) = self
                        .storage
                        .update_deposit(
                            &utxo.txid.to_string(),
                            utxo.vout,
                            UpdateDepositPayload::ClaimError {
                                error: error.clone(),
                            },
                        )
                        .await
                    {
                        error!("Failed to record claim error: {e}");
                    }
                    let mut info = DepositInfo::from(&utxo);
                    info.claim_error = Some(error);
                    unclaimed.push(info);
                }
            }
        }

        if !claimed.is_empty() {
            self.event_emitter
                .emit(&SdkEvent::ClaimedDeposits {
                    claimed_deposits: claimed,
                })
                .await;
        }
        if !unclaimed.is_empty() {
            self.event_emitter
                .emit(&SdkEvent::UnclaimedDeposits {
                    unclaimed_deposits: unclaimed,
                })
                .await;
        }
        Ok(())
    }

    async fn sync_pending_payments(&self) -> Result<(), SdkError> {
        let payments = self
            .storage
            .list_payments(ListPaymentsRequest::default())
            .await?;
        for payment in payments
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Pending)
        {
            let updated = match payment.method {
                PaymentMethod::Lightning => self.resolve_pending_lightning(payment).await,
                PaymentMethod::Withdraw => self.resolve_pending_withdraw(payment).await,
                _ => None,
            };
            if let Some(updated) = updated {
                self.storage.insert_payment(updated.clone()).await?;
                self.event_emitter
                    .emit(&SdkEvent::from_payment(updated))
                    .await;
            }
        }
        Ok(())
    }

    async fn resolve_pending_lightning(&self, payment: Payment) -> Option<Payment> {
        let Some(PaymentDetails::Lightning { payment_hash, .. }) = &payment.details else {
            return None;
        };
        let node_payment = match self.node_service.payment_status(payment_hash).await {
            Ok(node_payment) => node_payment,
            Err(e) => {
                warn!("Failed to resolve pending payment {}: {e}", payment.id);
                return None;
            }
        };
        let status = payment_status_from_node(node_payment.status);
        if status == payment.status {
            return None;
        }
        let mut updated = payment;
        updated.status = status;
        updated.fees = node_payment.fee_sats;
        if let Some(PaymentDetails::Lightning { preimage, .. }) = &mut updated.details {
            if preimage.is_none() {
                preimage.clone_from(&node_payment.preimage);
            }
        }
        Some(updated)
    }

    async fn resolve_pending_withdraw(&self, payment: Payment) -> Option<Payment> {
        let Some(PaymentDetails::Withdraw { tx_id }) = &payment.details else {
            return None;
        };
        match self.chain_service.get_transaction_status(tx_id.clone()).await {
            Ok(status) if status.confirmed => {
                let mut updated = payment;
                updated.status = PaymentStatus::Completed;
                Some(updated)
            }
            Ok(_) => None,
            // A withdraw the chain backend has never seen was interrupted
            // before broadcast; failing it releases the reserved balance.
            Err(ChainServiceError::HttpError { status: 404, .. }) => {
                let mut updated = payment;
                updated.status = PaymentStatus::Failed;
                Some(updated)
            }
            Err(e) => {
                warn!("Failed to resolve pending withdraw {}: {e}", payment.id);
                None
            }
        }
    }

    /// Registers a listener for [`SdkEvent`]s, returning its id.
    pub async fn add_event_listener(&self, listener: Box<dyn EventListener>) -> String {
        self.event_emitter.add_listener(listener).await
    }

    pub async fn remove_event_listener(&self, id: &str) -> bool {
        self.event_emitter.remove_listener(id).await
    }

    /// Stops the background sync loop.
    pub fn disconnect(&self) -> Result<(), SdkError> {
        self.shutdown_sender
            .send(())
            .map_err(|_| SdkError::Generic("Sdk is already disconnected".to_string()))?;
        Ok(())
    }

    /// Requests a wallet sync. The sync itself runs on the background loop.
    pub fn sync_wallet(&self, _request: SyncWalletRequest) -> Result<SyncWalletResponse, SdkError> {
        self.sync_trigger
            .send(SyncType::Full)
            .map_err(|_| SdkError::Generic("Background sync loop is not running".to_string()))?;
        Ok(SyncWalletResponse {})
    }

    /// Returns wallet info. The balance is recomputed from stored payments
    /// on every call.
    pub async fn get_info(&self, _request: GetInfoRequest) -> Result<GetInfoResponse, SdkError> {
        Ok(GetInfoResponse {
            balance_sats: self.calculate_balance().await?,
        })
    }

    async fn calculate_balance(&self) -> Result<u64, SdkError> {
        let payments = self
            .storage
            .list_payments(ListPaymentsRequest::default())
            .await?;
        let mut balance: u64 = 0;
        for payment in payments {
            match (payment.payment_type, payment.status) {
                (PaymentType::Receive, PaymentStatus::Completed) => {
                    balance = balance.saturating_add(payment.amount);
                }
                (PaymentType::Send, PaymentStatus::Completed | PaymentStatus::Pending) => {
                    balance = balance
                        .saturating_sub(payment.amount)
                        .saturating_sub(payment.fees);
                }
                _ => {}
            }
        }
        Ok(balance)
    }

    pub async fn list_payments(
        &self,
        request: ListPaymentsRequest,
    ) -> Result<ListPaymentsResponse, SdkError> {
        Ok(ListPaymentsResponse {
            payments: self.storage.list_payments(request).await?,
        })
    }

    pub async fn get_payment(
        &self,
        request: GetPaymentRequest,
    ) -> Result<GetPaymentResponse, SdkError> {
        let payment = self
            .storage
            .get_payment_by_id(&request.payment_id)
            .await?
            .ok_or_else(|| {
                SdkError::Generic(format!("Payment not found: {}", request.payment_id))
            })?;
        Ok(GetPaymentResponse { payment })
    }

    pub async fn receive_payment(
        &self,
        request: ReceivePaymentRequest,
    ) -> Result<ReceivePaymentResponse, SdkError> {
        let payment_request = match request.payment_method {
            ReceivePaymentMethod::BitcoinAddress => self.wallet.deposit_address().to_string(),
            ReceivePaymentMethod::Bolt11Invoice {
                description,
                amount_sats,
            } => {
                self.node_service
                    .create_invoice(amount_sats, Some(description))
                    .await?
                    .bolt11
            }
            ReceivePaymentMethod::Bip21 {
                description,
                amount_sats,
            } => {
                let address = self.wallet.deposit_address();
                let invoice = self
                    .node_service
                    .create_invoice(amount_sats, Some(description))
                    .await?
                    .bolt11;
                let mut params = Vec::new();
                if let Some(amount) = amount_sats {
                    params.push(format!(
                        "amount={}",
                        Amount::from_sat(amount).to_string_in(Denomination::Bitcoin)
                    ));
                }
                params.push(format!("lightning={invoice}"));
                format!("bitcoin:{address}?{}", params.join("&"))
            }
        };
        Ok(ReceivePaymentResponse {
            payment_request,
            fee_sats: 0,
        })
    }

    /// Parses and validates a payment request, resolving LNURL-pay and
    /// lightning addresses to a bolt11 invoice, and estimates the fee.
    pub async fn prepare_send_payment(
        &self,
        request: PrepareSendPaymentRequest,
    ) -> Result<PrepareSendPaymentResponse, SdkError> {
        let input = parse_input(&request.payment_request).await?;
        self.prepare_send_input(input, request.amount_sats).await
    }

    async fn prepare_send_input(
        &self,
        input: InputType,
        amount_sats: Option<u64>,
    ) -> Result<PrepareSendPaymentResponse, SdkError> {
        match input {
            InputType::Bolt11Invoice(details) => {
                self.prepare_send_bolt11(details, amount_sats).await
            }
            InputType::LnurlPay(pay_request) => {
                self.prepare_send_lnurl(&pay_request, amount_sats).await
            }
            InputType::LightningAddress(details) => {
                self.prepare_send_lnurl(&details.pay_request, amount_sats)
                    .await
            }
            InputType::BitcoinAddress(details) => {
                self.prepare_send_onchain(details.address, amount_sats).await
            }
            InputType::Bip21(details) => {
                let amount_sats = amount_sats.or(details.amount_sat);
                for method in &details.payment_methods {
                    if let InputType::Bolt11Invoice(invoice_details) = method {
                        return self
                            .prepare_send_bolt11(invoice_details.clone(), amount_sats)
                            .await;
                    }
                }
                for method in &details.payment_methods {
                    if let InputType::BitcoinAddress(address_details) = method {
                        return self
                            .prepare_send_onchain(address_details.address.clone(), amount_sats)
                            .await;
                    }
                }
                Err(SdkError::InvalidInput(
                    "Uri contains no supported payment method".to_string(),
                ))
            }
        }
    }

    async fn prepare_send_bolt11(
        &self,
        details: Bolt11InvoiceDetails,
        amount_sats: Option<u64>,
    ) -> Result<PrepareSendPaymentResponse, SdkError> {
        validate_network(&details, self.config.network.into())
            .map_err(|e| SdkError::InvalidInput(e.to_string()))?;
        let invoice_amount_sats = details.amount_msat.map(|msat| msat.div_ceil(1000));
        let amount_sats = match (invoice_amount_sats, amount_sats) {
            (Some(invoice_amount), Some(requested)) if requested != invoice_amount => {
                return Err(SdkError::InvalidAmount(
                    "Requested amount does not match the invoice amount".to_string(),
                ));
            }
            (Some(invoice_amount), _) => invoice_amount,
            (None, Some(requested)) => requested,
            (None, None) => {
                return Err(SdkError::InvalidAmount(
                    "Amount is required when paying an amountless invoice".to_string(),
                ));
            }
        };
        let amountless = invoice_amount_sats.is_none();
        let fee_sats = self
            .node_service
            .send_fee_estimate(
                &details.invoice.bolt11,
                amountless.then_some(amount_sats),
            )
            .await?;
        self.ensure_sufficient_balance(amount_sats, fee_sats).await?;
        Ok(PrepareSendPaymentResponse {
            payment_method: SendPaymentMethod::Bolt11Invoice {
                invoice_details: details,
                fee_sats,
            },
            amount_sats,
        })
    }

    async fn prepare_send_lnurl(
        &self,
        pay_request: &LnurlPayRequestDetails,
        amount_sats: Option<u64>,
    ) -> Result<PrepareSendPaymentResponse, SdkError> {
        let amount_sats = amount_sats.ok_or_else(|| {
            SdkError::InvalidAmount("Amount is required for lnurl payments".to_string())
        })?;
        let data = self
            .resolve_lnurl_invoice(pay_request, amount_sats, &None, None)
            .await?;
        let details = breez_sdk_common::input::parse_invoice(&data.pr).ok_or_else(|| {
            SdkError::LnurlError("Lnurl endpoint returned an invalid invoice".to_string())
        })?;
        self.prepare_send_bolt11(details, None).await
    }

    async fn resolve_lnurl_invoice(
        &self,
        pay_request: &LnurlPayRequestDetails,
        amount_sats: u64,
        comment: &Option<String>,
        validate_success_action_url: Option<bool>,
    ) -> Result<breez_sdk_common::lnurl::pay::CallbackResponse, SdkError> {
        let amount_msat = amount_sats.saturating_mul(1000);
        let response = validate_lnurl_pay(
            self.lnurl_client.as_ref(),
            amount_msat,
            comment,
            pay_request,
            self.config.network.into(),
            validate_success_action_url,
        )
        .await?;
        match response {
            ValidatedCallbackResponse::EndpointError { data } => {
                Err(SdkError::LnurlError(data.reason))
            }
            ValidatedCallbackResponse::EndpointSuccess { data } => Ok(data),
        }
    }

    async fn prepare_send_onchain(
        &self,
        address: String,
        amount_sats: Option<u64>,
    ) -> Result<PrepareSendPaymentResponse, SdkError> {
        let amount_sats = amount_sats.ok_or_else(|| {
            SdkError::InvalidAmount("Amount is required for on-chain payments".to_string())
        })?;
        let fees = self.chain_service.recommended_fees().await?;
        let fee_sats = Fee::Rate {
            sat_per_vbyte: fees.half_hour_fee,
        }
        .to_sats(WITHDRAW_TX_VSIZE);
        self.ensure_sufficient_balance(amount_sats, fee_sats).await?;
        Ok(PrepareSendPaymentResponse {
            payment_method: SendPaymentMethod::BitcoinAddress { address, fee_sats },
            amount_sats,
        })
    }

    async fn ensure_sufficient_balance(
        &self,
        amount_sats: u64,
        fee_sats: u64,
    ) -> Result<(), SdkError> {
        let available_sats = self.calculate_balance().await?;
        let required_sats = amount_sats.saturating_add(fee_sats);
        if required_sats > available_sats {
            return Err(SdkError::InsufficientFunds {
                available_sats,
                required_sats,
            });
        }
        Ok(())
    }

    /// Executes a previously prepared payment.
    pub async fn send_payment(
        &self,
        request: SendPaymentRequest,
    ) -> Result<SendPaymentResponse, SdkError> {
        let payment = self.send_payment_internal(request, false).await?;
        Ok(SendPaymentResponse { payment })
    }

    async fn send_payment_internal(
        &self,
        request: SendPaymentRequest,
        suppress_event: bool,
    ) -> Result<Payment, SdkError> {
        let amount_sats = request.prepare_response.amount_sats;
        match request.prepare_response.payment_method {
            SendPaymentMethod::Bolt11Invoice {
                invoice_details,
                fee_sats,
            } => {
                self.send_bolt11_payment(&invoice_details, amount_sats, fee_sats, suppress_event)
                    .await
            }
            SendPaymentMethod::BitcoinAddress { address, fee_sats } => {
                self.send_onchain_payment(&address, amount_sats, fee_sats, suppress_event)
                    .await
            }
        }
    }

    async fn send_bolt11_payment(
        &self,
        invoice_details: &Bolt11InvoiceDetails,
        amount_sats: u64,
        fee_sats: u64,
        suppress_event: bool,
    ) -> Result<Payment, SdkError> {
        let bolt11 = invoice_details.invoice.bolt11.clone();
        // Re-sending the same invoice returns the existing payment instead of
        // paying twice.
        if let Some(existing) = self.storage.get_payment_by_invoice(&bolt11).await? {
            if existing.status != PaymentStatus::Failed {
                debug!("Invoice already paid or in flight, returning payment {}", existing.id);
                return Ok(existing);
            }
        }

        let mut payment = Payment {
            id: invoice_details.payment_hash.clone(),
            payment_type: PaymentType::Send,
            status: PaymentStatus::Pending,
            amount: amount_sats,
            fees: fee_sats,
            timestamp: utils::now(),
            method: PaymentMethod::Lightning,
            details: Some(PaymentDetails::Lightning {
                description: invoice_details.description.clone(),
                preimage: None,
                invoice: bolt11.clone(),
                payment_hash: invoice_details.payment_hash.clone(),
                destination_pubkey: invoice_details.payee_pubkey.clone(),
                lnurl_pay_info: None,
            }),
        };
        // Persisted before the node call so an interrupted send is still
        // tracked and resolved by the next sync.
        self.storage.insert_payment(payment.clone()).await?;

        let amountless = invoice_details.amount_msat.is_none();
        let result = self
            .node_service
            .pay_invoice(&bolt11, amountless.then_some(amount_sats), fee_sats)
            .await;

        match result {
            Ok(node_payment) if node_payment.status != NodePaymentStatus::Failed => {
                payment.status = payment_status_from_node(node_payment.status);
                payment.fees = node_payment.fee_sats;
                if let Some(PaymentDetails::Lightning { preimage, .. }) = &mut payment.details {
                    preimage.clone_from(&node_payment.preimage);
                }
                self.storage.insert_payment(payment.clone()).await?;
                if !suppress_event {
                    self.event_emitter
                        .emit(&SdkEvent::from_payment(payment.clone()))
                        .await;
                }
                let _ = self.sync_trigger.send(SyncType::PaymentsOnly);
                Ok(payment)
            }
            Ok(_) => {
                self.fail_payment(payment, suppress_event).await?;
                Err(SdkError::PaymentFailed(
                    "Payment rejected by the node".to_string(),
                ))
            }
            Err(e) => {
                self.fail_payment(payment, suppress_event).await?;
                Err(SdkError::PaymentFailed(e.to_string()))
            }
        }
    }

    async fn fail_payment(
        &self,
        mut payment: Payment,
        suppress_event: bool,
    ) -> Result<(), SdkError> {
        payment.status = PaymentStatus::Failed;
        self.storage.insert_payment(payment.clone()).await?;
        if !suppress_event {
            self.event_emitter
                .emit(&SdkEvent::from_payment(payment))
                .await;
        }
        Ok(())
    }

    async fn send_onchain_payment(
        &self,
        address: &str,
        amount_sats: u64,
        fee_sats: u64,
        suppress_event: bool,
    ) -> Result<Payment, SdkError> {
        let destination = Address::from_str(address)?
            .require_network(self.config.network.into())?;

        let claim_address = self.wallet.claim_address().to_string();
        let utxos = self.chain_service.get_address_utxos(claim_address).await?;
        let fetcher =
            CachedUtxoFetcher::new(Arc::clone(&self.chain_service), Arc::clone(&self.storage));
        let mut spendable = Vec::new();
        for utxo in utxos {
            let detailed = fetcher.fetch_detailed_utxo(&utxo.txid, utxo.vout).await?;
            spendable.push((detailed.tx, detailed.vout));
        }

        let tx = self
            .wallet
            .build_withdraw_tx(&spendable, &destination, amount_sats, fee_sats)?;
        let tx_id = tx.compute_txid().to_string();
        let mut payment = Payment {
            id: tx_id.clone(),
            payment_type: PaymentType::Send,
            status: PaymentStatus::Pending,
            amount: amount_sats,
            fees: fee_sats,
            timestamp: utils::now(),
            method: PaymentMethod::Withdraw,
            details: Some(PaymentDetails::Withdraw { tx_id }),
        };
        self.storage.insert_payment(payment.clone()).await?;

        match self
            .chain_service
            .broadcast_transaction(serialize_hex(&tx))
            .await
        {
            Ok(_) => {
                payment.status = PaymentStatus::Completed;
                self.storage.insert_payment(payment.clone()).await?;
                if !suppress_event {
                    self.event_emitter
                        .emit(&SdkEvent::from_payment(payment.clone()))
                        .await;
                }
                let _ = self.sync_trigger.send(SyncType::PaymentsOnly);
                Ok(payment)
            }
            Err(e) => {
                self.fail_payment(payment, suppress_event).await?;
                Err(SdkError::PaymentFailed(e.to_string()))
            }
        }
    }

    /// Resolves an LNURL-pay request into a payable invoice, as per LUD-06.
    pub async fn prepare_lnurl_pay(
        &self,
        request: PrepareLnurlPayRequest,
    ) -> Result<PrepareLnurlPayResponse, SdkError> {
        let data = self
            .resolve_lnurl_invoice(
                &request.pay_request,
                request.amount_sats,
                &request.comment,
                request.validate_success_action_url,
            )
            .await?;
        let prepare_response = self
            .prepare_send_payment(PrepareSendPaymentRequest {
                payment_request: data.pr.clone(),
                amount_sats: None,
            })
            .await?;
        let SendPaymentMethod::Bolt11Invoice {
            invoice_details,
            fee_sats,
        } = prepare_response.payment_method
        else {
            return Err(SdkError::LnurlError(
                "Lnurl endpoint returned an unexpected payment request".to_string(),
            ));
        };
        Ok(PrepareLnurlPayResponse {
            amount_sats: request.amount_sats,
            comment: request.comment,
            pay_request: request.pay_request,
            fee_sats,
            invoice_details,
            success_action: data.success_action,
        })
    }

    /// Pays a prepared LNURL-pay invoice and processes its success action.
    pub async fn lnurl_pay(&self, request: LnurlPayRequest) -> Result<LnurlPayResponse, SdkError> {
        let prepare = request.prepare_response;
        let mut payment = self
            .send_payment_internal(
                SendPaymentRequest {
                    prepare_response: PrepareSendPaymentResponse {
                        payment_method: SendPaymentMethod::Bolt11Invoice {
                            invoice_details: prepare.invoice_details.clone(),
                            fee_sats: prepare.fee_sats,
                        },
                        amount_sats: prepare.amount_sats,
                    },
                },
                true,
            )
            .await?;

        let success_action = process_success_action(&payment, prepare.success_action.as_ref());
        let lnurl_pay_info = LnurlPayInfo {
            ln_address: prepare.pay_request.address.clone(),
            comment: prepare.comment.clone(),
            domain: Some(prepare.pay_request.domain.clone()),
            metadata: Some(prepare.pay_request.metadata_str.clone()),
            processed_success_action: success_action.clone(),
            raw_success_action: prepare.success_action.clone(),
        };
        let lnurl_description = lnurl_pay_info.extract_description();
        self.storage
            .set_payment_metadata(
                &payment.id,
                PaymentMetadata {
                    lnurl_pay_info: Some(lnurl_pay_info.clone()),
                    lnurl_description,
                },
            )
            .await?;
        if let Some(PaymentDetails::Lightning { lnurl_pay_info: info, .. }) = &mut payment.details {
            *info = Some(lnurl_pay_info);
        }
        self.event_emitter
            .emit(&SdkEvent::from_payment(payment.clone()))
            .await;
        Ok(LnurlPayResponse {
            payment,
            success_action,
        })
    }

    pub async fn list_unclaimed_deposits(
        &self,
        _request: ListUnclaimedDepositsRequest,
    ) -> Result<ListUnclaimedDepositsResponse, SdkError> {
        Ok(ListUnclaimedDepositsResponse {
            deposits: self.storage.list_deposits().await?,
        })
    }

    /// Claims a deposit by sweeping it into the wallet. `max_fee` in the
    /// request overrides the configured maximum.
    pub async fn claim_deposit(
        &self,
        request: ClaimDepositRequest,
    ) -> Result<ClaimDepositResponse, SdkError> {
        let deposit = self
            .storage
            .list_deposits()
            .await?
            .into_iter()
            .find(|d| d.txid == request.txid && d.vout == request.vout)
            .ok_or_else(|| SdkError::MissingUtxo {
                tx: request.txid.clone(),
                vout: request.vout,
            })?;
        if let Some(refund_tx_id) = deposit.refund_tx_id {
            return Err(SdkError::Generic(format!(
                "Deposit {}:{} has a pending refund {refund_tx_id}",
                request.txid, request.vout
            )));
        }

        let fetcher =
            CachedUtxoFetcher::new(Arc::clone(&self.chain_service), Arc::clone(&self.storage));
        let utxo = fetcher
            .fetch_detailed_utxo(&request.txid, request.vout)
            .await?;
        let max_fee = request
            .max_fee
            .or_else(|| self.config.max_deposit_claim_fee.clone());
        match self.claim_utxo(&utxo, max_fee).await {
            Ok(payment) => {
                self.event_emitter
                    .emit(&SdkEvent::ClaimedDeposits {
                        claimed_deposits: vec![DepositInfo::from(&utxo)],
                    })
                    .await;
                let _ = self.sync_trigger.send(SyncType::PaymentsOnly);
                Ok(ClaimDepositResponse { payment })
            }
            Err(e) => {
                let error = crate::error::DepositClaimError::from(e);
                self.storage
                    .update_deposit(
                        &request.txid,
                        request.vout,
                        UpdateDepositPayload::ClaimError {
                            error: error.clone(),
                        },
                    )
                    .await?;
                Err(error.into())
            }
        }
    }

    async fn claim_utxo(
        &self,
        utxo: &DetailedUtxo,
        max_fee: Option<Fee>,
    ) -> Result<Payment, SdkError> {
        let txid = utxo.txid.to_string();
        let _guard = self.deposit_lock(&txid, utxo.vout).await;

        // A crash between broadcast and delete leaves the deposit row behind;
        // the retry returns the recorded claim instead of sweeping again.
        if let Some(existing) = self.find_claim_payment(&txid, utxo.vout).await? {
            self.storage.delete_deposit(&txid, utxo.vout).await?;
            return Ok(existing);
        }

        let fees = self.chain_service.recommended_fees().await?;
        let actual_fee = fees.fastest_fee.saturating_mul(CLAIM_TX_VSIZE);
        if let Some(max_fee) = max_fee {
            if actual_fee > max_fee.to_sats(CLAIM_TX_VSIZE) {
                return Err(SdkError::DepositClaimFeeExceeded {
                    tx: txid,
                    vout: utxo.vout,
                    max_fee,
                    actual_fee,
                });
            }
        }

        let tx = self.wallet.build_claim_tx(&utxo.tx, utxo.vout, actual_fee)?;
        let claim_txid = self
            .chain_service
            .broadcast_transaction(serialize_hex(&tx))
            .await?;
        let payment = Payment {
            id: claim_txid.to_string(),
            payment_type: PaymentType::Receive,
            status: PaymentStatus::Completed,
            amount: utxo.value.saturating_sub(actual_fee),
            fees: actual_fee,
            timestamp: utils::now(),
            method: PaymentMethod::Deposit,
            details: Some(PaymentDetails::Deposit {
                tx_id: txid.clone(),
                vout: utxo.vout,
            }),
        };
        // The payment is recorded before the deposit row is dropped so an
        // interruption in between never loses the funds from history.
        self.storage.insert_payment(payment.clone()).await?;
        self.storage.delete_deposit(&txid, utxo.vout).await?;
        Ok(payment)
    }

    /// Sends a deposit back to `destination_address`. The refund is recorded
    /// before broadcasting; the deposit row remains visible until a
    /// subsequent sync sees the refund confirm.
    pub async fn refund_deposit(
        &self,
        request: RefundDepositRequest,
    ) -> Result<RefundDepositResponse, SdkError> {
        let _guard = self.deposit_lock(&request.txid, request.vout).await;

        let fetcher =
            CachedUtxoFetcher::new(Arc::clone(&self.chain_service), Arc::clone(&self.storage));
        let utxo = fetcher
            .fetch_detailed_utxo(&request.txid, request.vout)
            .await?;
        let destination = Address::from_str(&request.destination_address)?
            .require_network(self.config.network.into())?;
        let fee_sats = request.fee.to_sats(CLAIM_TX_VSIZE);
        let tx = self
            .wallet
            .build_refund_tx(&utxo.tx, utxo.vout, &destination, fee_sats)?;
        let tx_hex = serialize_hex(&tx);
        let tx_id = tx.compute_txid().to_string();

        self.storage
            .update_deposit(
                &request.txid,
                request.vout,
                UpdateDepositPayload::Refund {
                    refund_txid: tx_id.clone(),
                    refund_tx: tx_hex.clone(),
                },
            )
            .await?;
        self.chain_service.broadcast_transaction(tx_hex.clone()).await?;
        Ok(RefundDepositResponse { tx_id, tx_hex })
    }

    async fn find_claim_payment(
        &self,
        txid: &str,
        vout: u32,
    ) -> Result<Option<Payment>, SdkError> {
        let payments = self
            .storage
            .list_payments(ListPaymentsRequest::default())
            .await?;
        Ok(payments.into_iter().find(|p| {
            matches!(
                &p.details,
                Some(PaymentDetails::Deposit { tx_id, vout: v }) if tx_id == txid && *v == vout
            )
        }))
    }

    async fn deposit_lock(&self, txid: &str, vout: u32) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.deposit_locks.lock().await;
            // Entries with no outstanding guard are pruned on the next
            // acquisition, keeping the map bounded by concurrent claims.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(format!("{txid}:{vout}")).or_default())
        };
        lock.lock_owned().await
    }
}

fn payment_status_from_node(status: NodePaymentStatus) -> PaymentStatus {
    match status {
        NodePaymentStatus::Pending => PaymentStatus::Pending,
        NodePaymentStatus::Completed => PaymentStatus::Completed,
        NodePaymentStatus::Failed => PaymentStatus::Failed,
    }
}

fn process_success_action(
    payment: &Payment,
    success_action: Option<&SuccessAction>,
) -> Option<SuccessActionProcessed> {
    let success_action = success_action?;
    match success_action {
        SuccessAction::Message { data } => Some(SuccessActionProcessed::Message {
            data: data.clone(),
        }),
        SuccessAction::Url { data } => Some(SuccessActionProcessed::Url { data: data.clone() }),
        SuccessAction::Aes { data } => {
            let Some(PaymentDetails::Lightning {
                preimage: Some(preimage),
                ..
            }) = &payment.details
            else {
                return Some(SuccessActionProcessed::Aes {
                    result: AesSuccessActionDataResult::ErrorStatus {
                        reason: "Payment has no preimage".to_string(),
                    },
                });
            };
            let result = match sha256::Hash::from_str(preimage) {
                Ok(key) => {
                    let decrypted: Result<AesSuccessActionDataDecrypted, _> =
                        (data, key.as_byte_array()).try_into();
                    match decrypted {
                        Ok(data) => AesSuccessActionDataResult::Decrypted { data },
                        Err(e) => AesSuccessActionDataResult::ErrorStatus {
                            reason: e.to_string(),
                        },
                    }
                }
                Err(e) => AesSuccessActionDataResult::ErrorStatus {
                    reason: e.to_string(),
                },
            };
            Some(SuccessActionProcessed::Aes { result })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use bitcoin::{
        OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
        absolute::LockTime, consensus::encode::deserialize_hex, transaction::Version,
    };
    use breez_sdk_common::{
        input::parse_invoice,
        lnurl::pay::AesSuccessActionData,
        test_utils::mock_rest_client::MockRestClient,
    };
    use tempdir::TempDir;

    use super::*;
    use crate::{
        chain::{ChainServiceError, RecommendedFees, TxStatus, Utxo},
        models::{DepositInfo, ListPaymentsRequest, Payment},
        node::{NodeError, NodeInvoice, NodePayment},
        persist::tests::create_payment,
    };

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const INVOICE: &str = "lnbc110n1p38q3gtpp5ypz09jrd8p993snjwnm68cph4ftwp22le34xd4r8ftspwshxhmnsdqqxqyjw5qcqpxsp5htlg8ydpywvsa7h3u4hdn77ehs4z4e844em0apjyvmqfkzqhhd2q9qgsqqqyssqszpxzxt9uuqzymr7zxcdccj5g69s8q7zzjs7sgxn9ejhnvdh6gqjcy22mss2yexunagm5r2gqczh8k24cwrqml3njskm548aruhpwssq9nvrvz";

    struct MockChainService {
        utxos: StdMutex<Vec<Utxo>>,
        txs: StdMutex<HashMap<String, String>>,
        tx_status: StdMutex<HashMap<String, TxStatus>>,
        fees: StdMutex<RecommendedFees>,
        log: Arc<StdMutex<Vec<String>>>,
        utxo_delay: StdMutex<Duration>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        utxo_calls: AtomicUsize,
    }

    impl MockChainService {
        fn new(log: Arc<StdMutex<Vec<String>>>) -> Self {
            Self {
                utxos: StdMutex::new(Vec::new()),
                txs: StdMutex::new(HashMap::new()),
                tx_status: StdMutex::new(HashMap::new()),
                fees: StdMutex::new(RecommendedFees {
                    fastest_fee: 1,
                    half_hour_fee: 1,
                    hour_fee: 1,
                    economy_fee: 1,
                    minimum_fee: 1,
                }),
                log,
                utxo_delay: StdMutex::new(Duration::ZERO),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                utxo_calls: AtomicUsize::new(0),
            }
        }

        fn add_tx(&self, tx: &Transaction) {
            self.txs
                .lock()
                .unwrap()
                .insert(tx.compute_txid().to_string(), serialize_hex(tx));
        }

        fn set_fastest_fee(&self, sat_per_vbyte: u64) {
            self.fees.lock().unwrap().fastest_fee = sat_per_vbyte;
        }

        fn confirm_tx(&self, txid: &str) {
            self.tx_status.lock().unwrap().insert(
                txid.to_string(),
                TxStatus {
                    confirmed: true,
                    block_height: Some(100),
                    block_time: Some(1_700_000_000),
                },
            );
        }
    }

    #[async_trait::async_trait]
    impl BitcoinChainService for MockChainService {
        async fn get_address_utxos(
            &self,
            _address: String,
        ) -> Result<Vec<Utxo>, ChainServiceError> {
            self.log.lock().unwrap().push("get_address_utxos".to_string());
            self.utxo_calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let delay = *self.utxo_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.utxos.lock().unwrap().clone())
        }

        async fn get_transaction_status(
            &self,
            txid: String,
        ) -> Result<TxStatus, ChainServiceError> {
            if let Some(status) = self.tx_status.lock().unwrap().get(&txid) {
                return Ok(status.clone());
            }
            if self.txs.lock().unwrap().contains_key(&txid) {
                return Ok(TxStatus::default());
            }
            Err(ChainServiceError::HttpError {
                status: 404,
                message: "Transaction not found".to_string(),
            })
        }

        async fn get_transaction_hex(&self, txid: String) -> Result<String, ChainServiceError> {
            self.txs
                .lock()
                .unwrap()
                .get(&txid)
                .cloned()
                .ok_or_else(|| ChainServiceError::Generic(format!("unknown tx {txid}")))
        }

        async fn broadcast_transaction(&self, tx_hex: String) -> Result<Txid, ChainServiceError> {
            self.log.lock().unwrap().push("broadcast".to_string());
            let tx: Transaction = deserialize_hex(&tx_hex)
                .map_err(|e| ChainServiceError::Generic(e.to_string()))?;
            Ok(tx.compute_txid())
        }

        async fn recommended_fees(&self) -> Result<RecommendedFees, ChainServiceError> {
            Ok(self.fees.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct MockNodeService {
        pay_response: Option<NodePayment>,
        fee_estimate: u64,
        pay_calls: AtomicUsize,
        log: Option<Arc<StdMutex<Vec<String>>>>,
    }

    #[async_trait::async_trait]
    impl NodeService for MockNodeService {
        async fn create_invoice(
            &self,
            _amount_sats: Option<u64>,
            _description: Option<String>,
        ) -> Result<NodeInvoice, NodeError> {
            Ok(NodeInvoice {
                bolt11: "lnbcmockinvoice".to_string(),
                payment_hash: "a".repeat(64),
            })
        }

        async fn send_fee_estimate(
            &self,
            _invoice: &str,
            _amount_sats: Option<u64>,
        ) -> Result<u64, NodeError> {
            Ok(self.fee_estimate)
        }

        async fn pay_invoice(
            &self,
            _invoice: &str,
            _amount_sats: Option<u64>,
            _max_fee_sats: u64,
        ) -> Result<NodePayment, NodeError> {
            if let Some(log) = &self.log {
                log.lock().unwrap().push("pay_invoice".to_string());
            }
            self.pay_calls.fetch_add(1, Ordering::SeqCst);
            self.pay_response
                .clone()
                .ok_or_else(|| NodeError::PaymentFailed("no route found".to_string()))
        }

        async fn payment_status(&self, _payment_hash: &str) -> Result<NodePayment, NodeError> {
            self.pay_response
                .clone()
                .ok_or_else(|| NodeError::Generic("unknown payment".to_string()))
        }
    }

    struct RecordingStorage {
        inner: SqliteStorage,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Storage for RecordingStorage {
        async fn get_cached_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_cached_item(key).await
        }

        async fn set_cached_item(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.inner.set_cached_item(key, value).await
        }

        async fn delete_cached_item(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete_cached_item(key).await
        }

        async fn list_payments(
            &self,
            request: ListPaymentsRequest,
        ) -> Result<Vec<Payment>, StorageError> {
            self.inner.list_payments(request).await
        }

        async fn insert_payment(&self, payment: Payment) -> Result<(), StorageError> {
            self.log.lock().unwrap().push("insert_payment".to_string());
            self.inner.insert_payment(payment).await
        }

        async fn set_payment_metadata(
            &self,
            payment_id: &str,
            metadata: PaymentMetadata,
        ) -> Result<(), StorageError> {
            self.inner.set_payment_metadata(payment_id, metadata).await
        }

        async fn get_payment_by_id(&self, id: &str) -> Result<Option<Payment>, StorageError> {
            self.inner.get_payment_by_id(id).await
        }

        async fn get_payment_by_invoice(
            &self,
            invoice: &str,
        ) -> Result<Option<Payment>, StorageError> {
            self.inner.get_payment_by_invoice(invoice).await
        }

        async fn add_deposit(
            &self,
            txid: &str,
            vout: u32,
            amount_sats: u64,
        ) -> Result<(), StorageError> {
            self.inner.add_deposit(txid, vout, amount_sats).await
        }

        async fn delete_deposit(&self, txid: &str, vout: u32) -> Result<(), StorageError> {
            self.log.lock().unwrap().push("delete_deposit".to_string());
            self.inner.delete_deposit(txid, vout).await
        }

        async fn list_deposits(&self) -> Result<Vec<DepositInfo>, StorageError> {
            self.inner.list_deposits().await
        }

        async fn update_deposit(
            &self,
            txid: &str,
            vout: u32,
            payload: UpdateDepositPayload,
        ) -> Result<(), StorageError> {
            self.log.lock().unwrap().push("update_deposit".to_string());
            self.inner.update_deposit(txid, vout, payload).await
        }
    }

    struct TestSdk {
        sdk: BreezSdk,
        chain: Arc<MockChainService>,
        node: Arc<MockNodeService>,
        log: Arc<StdMutex<Vec<String>>>,
        _temp_dir: TempDir,
    }

    fn build_sdk(network: Network, mut node: MockNodeService) -> TestSdk {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = Arc::new(MockChainService::new(Arc::clone(&log)));
        node.log = Some(Arc::clone(&log));
        let node = Arc::new(node);

        let temp_dir = TempDir::new("sdk_test").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(RecordingStorage {
            inner: SqliteStorage::new(temp_dir.path().to_path_buf()).unwrap(),
            log: Arc::clone(&log),
        });
        let seed = bip39::Mnemonic::parse(MNEMONIC).unwrap().to_seed("");
        let wallet = Arc::new(DepositWallet::new(&seed, network.into()).unwrap());
        let (shutdown_sender, shutdown_receiver) = watch::channel(());
        let sdk = BreezSdk {
            config: default_config(network),
            wallet,
            storage,
            chain_service: Arc::clone(&chain) as Arc<dyn BitcoinChainService>,
            node_service: Arc::clone(&node) as Arc<dyn NodeService>,
            lnurl_client: Arc::new(MockRestClient::new()),
            event_emitter: Arc::new(EventEmitter::new()),
            shutdown_sender,
            shutdown_receiver,
            sync_trigger: broadcast::channel(30).0,
            deposit_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        TestSdk {
            sdk,
            chain,
            node,
            log,
            _temp_dir: temp_dir,
        }
    }

    fn bolt11_prepare_response(fee_sats: u64) -> PrepareSendPaymentResponse {
        let details = parse_invoice(INVOICE).unwrap();
        let amount_sats = details.amount_msat.unwrap().div_ceil(1000);
        PrepareSendPaymentResponse {
            payment_method: SendPaymentMethod::Bolt11Invoice {
                invoice_details: details,
                fee_sats,
            },
            amount_sats,
        }
    }

    fn funding_tx(script_pubkey: ScriptBuf, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            }],
        }
    }

    #[tokio::test]
    async fn test_send_payment_same_invoice_pays_once() {
        let node = MockNodeService {
            pay_response: Some(NodePayment {
                payment_hash: "a".repeat(64),
                preimage: Some("11".repeat(32)),
                fee_sats: 1,
                status: NodePaymentStatus::Completed,
            }),
            fee_estimate: 1,
            ..Default::default()
        };
        let t = build_sdk(Network::Mainnet, node);

        let first = t
            .sdk
            .send_payment(SendPaymentRequest {
                prepare_response: bolt11_prepare_response(1),
            })
            .await
            .unwrap();
        let second = t
            .sdk
            .send_payment(SendPaymentRequest {
                prepare_response: bolt11_prepare_response(1),
            })
            .await
            .unwrap();

        assert_eq!(first.payment.id, second.payment.id);
        assert_eq!(first.payment.status, PaymentStatus::Completed);
        assert_eq!(t.node.pay_calls.load(Ordering::SeqCst), 1);
        let payments = t
            .sdk
            .list_payments(ListPaymentsRequest::default())
            .await
            .unwrap()
            .payments;
        assert_eq!(payments.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_is_tracked_across_the_node_call() {
        let node = MockNodeService {
            fee_estimate: 1,
            ..Default::default()
        };
        let t = build_sdk(Network::Mainnet, node);

        let result = t
            .sdk
            .send_payment(SendPaymentRequest {
                prepare_response: bolt11_prepare_response(1),
            })
            .await;
        assert!(matches!(result, Err(SdkError::PaymentFailed(_))));

        // The payment is on record before the node is asked to pay, and the
        // failure is recorded afterwards.
        let log = t.log.lock().unwrap().clone();
        assert_eq!(log, ["insert_payment", "pay_invoice", "insert_payment"]);

        let payments = t
            .sdk
            .list_payments(ListPaymentsRequest::default())
            .await
            .unwrap()
            .payments;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_claim_deposit_records_payment_before_removing_deposit() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        let funding = funding_tx(t.sdk.wallet.deposit_address().script_pubkey(), 10_000);
        t.chain.add_tx(&funding);
        let txid = funding.compute_txid().to_string();
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();

        let response = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: txid.clone(),
                vout: 0,
                max_fee: Some(Fee::Fixed { amount: 200 }),
            })
            .await
            .unwrap();

        assert_eq!(response.payment.status, PaymentStatus::Completed);
        assert_eq!(response.payment.amount, 10_000 - 110);
        assert_eq!(response.payment.fees, 110);

        let log = t.log.lock().unwrap().clone();
        let insert_pos = log.iter().position(|l| l == "insert_payment").unwrap();
        let delete_pos = log.iter().position(|l| l == "delete_deposit").unwrap();
        assert!(insert_pos < delete_pos);

        assert!(t.sdk.storage.list_deposits().await.unwrap().is_empty());
        assert!(
            t.sdk
                .storage
                .get_payment_by_id(&response.payment.id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_claim_deposit_over_max_fee_keeps_deposit() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        t.chain.set_fastest_fee(10);
        let funding = funding_tx(t.sdk.wallet.deposit_address().script_pubkey(), 10_000);
        t.chain.add_tx(&funding);
        let txid = funding.compute_txid().to_string();
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();

        let result = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: txid.clone(),
                vout: 0,
                max_fee: Some(Fee::Fixed { amount: 1000 }),
            })
            .await;
        assert!(matches!(
            result,
            Err(SdkError::DepositClaimFeeExceeded { actual_fee: 1100, .. })
        ));

        let deposits = t.sdk.storage.list_deposits().await.unwrap();
        assert_eq!(deposits.len(), 1);
        assert!(deposits[0].claim_error.is_some());
        assert!(!t.log.lock().unwrap().iter().any(|l| l == "broadcast"));
    }

    #[tokio::test]
    async fn test_balance_is_recomputed_from_payments() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        assert_eq!(
            t.sdk.get_info(GetInfoRequest {}).await.unwrap().balance_sats,
            0
        );

        let mut receive = create_payment("receive-1", 100);
        receive.payment_type = PaymentType::Receive;
        receive.amount = 10_000;
        receive.fees = 0;
        t.sdk.storage.insert_payment(receive).await.unwrap();
        assert_eq!(
            t.sdk.get_info(GetInfoRequest {}).await.unwrap().balance_sats,
            10_000
        );

        let mut sent = create_payment("send-1", 200);
        sent.amount = 2_000;
        sent.fees = 10;
        t.sdk.storage.insert_payment(sent).await.unwrap();

        // Pending sends already reduce the balance.
        let mut pending = create_payment("send-2", 300);
        pending.status = PaymentStatus::Pending;
        pending.amount = 1_000;
        pending.fees = 5;
        t.sdk.storage.insert_payment(pending).await.unwrap();
        assert_eq!(
            t.sdk.get_info(GetInfoRequest {}).await.unwrap().balance_sats,
            6_985
        );

        // Failed sends do not.
        let mut failed = create_payment("send-3", 400);
        failed.status = PaymentStatus::Failed;
        failed.amount = 50_000;
        t.sdk.storage.insert_payment(failed).await.unwrap();
        assert_eq!(
            t.sdk.get_info(GetInfoRequest {}).await.unwrap().balance_sats,
            6_985
        );
    }

    #[tokio::test]
    async fn test_refund_deposit_is_recorded_before_broadcast() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        let funding = funding_tx(t.sdk.wallet.deposit_address().script_pubkey(), 10_000);
        t.chain.add_tx(&funding);
        let txid = funding.compute_txid().to_string();
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();

        let destination = t.sdk.wallet.claim_address().to_string();
        let response = t
            .sdk
            .refund_deposit(RefundDepositRequest {
                txid: txid.clone(),
                vout: 0,
                destination_address: destination,
                fee: Fee::Fixed { amount: 500 },
            })
            .await
            .unwrap();

        let log = t.log.lock().unwrap().clone();
        let update_pos = log.iter().position(|l| l == "update_deposit").unwrap();
        let broadcast_pos = log.iter().position(|l| l == "broadcast").unwrap();
        assert!(update_pos < broadcast_pos);

        // The deposit stays visible until the refund confirms.
        let deposits = t.sdk.storage.list_deposits().await.unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].refund_tx_id.as_deref(), Some(response.tx_id.as_str()));

        let tx: Transaction = deserialize_hex(&response.tx_hex).unwrap();
        assert_eq!(tx.output[0].value.to_sat(), 9_500);
    }

    #[tokio::test]
    async fn test_sync_requests_coalesce_and_never_overlap() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        *t.chain.utxo_delay.lock().unwrap() = Duration::from_millis(50);

        t.sdk.start();
        for _ in 0..5 {
            t.sdk.sync_wallet(SyncWalletRequest {}).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(t.chain.max_active.load(Ordering::SeqCst), 1);
        let calls = t.chain.utxo_calls.load(Ordering::SeqCst);
        assert!(
            (1..=3).contains(&calls),
            "expected coalesced syncs, got {calls}"
        );
        t.sdk.disconnect().unwrap();
    }

    #[tokio::test]
    async fn test_prepare_send_rejects_amount_contradicting_invoice() {
        let node = MockNodeService {
            fee_estimate: 1,
            ..Default::default()
        };
        let t = build_sdk(Network::Mainnet, node);

        let result = t
            .sdk
            .prepare_send_payment(PrepareSendPaymentRequest {
                payment_request: INVOICE.to_string(),
                amount_sats: Some(999),
            })
            .await;
        assert!(matches!(result, Err(SdkError::InvalidAmount(_))));

        // The invoice is for 11 sats; a matching amount passes the check and
        // proceeds to the balance check.
        let result = t
            .sdk
            .prepare_send_payment(PrepareSendPaymentRequest {
                payment_request: INVOICE.to_string(),
                amount_sats: Some(11),
            })
            .await;
        assert!(matches!(result, Err(SdkError::InsufficientFunds { .. })));
    }

    fn pending_withdraw_payment(tx_id: &str, amount: u64) -> Payment {
        Payment {
            id: tx_id.to_string(),
            payment_type: PaymentType::Send,
            status: PaymentStatus::Pending,
            amount,
            fees: 10,
            timestamp: 100,
            method: PaymentMethod::Withdraw,
            details: Some(PaymentDetails::Withdraw {
                tx_id: tx_id.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_pending_withdraws_are_resolved_on_sync() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());

        let mut receive = create_payment("receive-1", 100);
        receive.payment_type = PaymentType::Receive;
        receive.amount = 10_000;
        receive.fees = 0;
        t.sdk.storage.insert_payment(receive).await.unwrap();

        // One withdraw confirmed on chain, one the chain has never seen
        // because the send was interrupted before its broadcast.
        let confirmed_tx = funding_tx(t.sdk.wallet.claim_address().script_pubkey(), 1_000);
        t.chain.add_tx(&confirmed_tx);
        let confirmed_txid = confirmed_tx.compute_txid().to_string();
        t.chain.confirm_tx(&confirmed_txid);
        t.sdk
            .storage
            .insert_payment(pending_withdraw_payment(&confirmed_txid, 1_000))
            .await
            .unwrap();

        let unknown_txid = "9".repeat(64);
        t.sdk
            .storage
            .insert_payment(pending_withdraw_payment(&unknown_txid, 2_000))
            .await
            .unwrap();

        t.sdk
            .sync_wallet_internal(SyncType::PaymentsOnly)
            .await
            .unwrap();

        let confirmed = t
            .sdk
            .storage
            .get_payment_by_id(&confirmed_txid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Completed);
        let unknown = t
            .sdk
            .storage
            .get_payment_by_id(&unknown_txid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unknown.status, PaymentStatus::Failed);

        // Only the surviving withdraw reserves balance.
        assert_eq!(
            t.sdk.get_info(GetInfoRequest {}).await.unwrap().balance_sats,
            10_000 - 1_010
        );
    }

    #[tokio::test]
    async fn test_claim_retry_after_crash_returns_recorded_payment() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        let funding = funding_tx(t.sdk.wallet.deposit_address().script_pubkey(), 10_000);
        t.chain.add_tx(&funding);
        let txid = funding.compute_txid().to_string();
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();

        let first = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: txid.clone(),
                vout: 0,
                max_fee: Some(Fee::Fixed { amount: 200 }),
            })
            .await
            .unwrap();

        // A crash between broadcast and delete leaves the deposit row in
        // place; a retry at a different fee rate must not sweep again.
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();
        t.chain.set_fastest_fee(2);
        let second = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: txid.clone(),
                vout: 0,
                max_fee: Some(Fee::Fixed { amount: 400 }),
            })
            .await
            .unwrap();

        assert_eq!(first.payment.id, second.payment.id);
        assert_eq!(second.payment.fees, 110);
        let broadcasts = t
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == "broadcast")
            .count();
        assert_eq!(broadcasts, 1);
        assert!(t.sdk.storage.list_deposits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_rejected_while_a_refund_is_pending() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        let funding = funding_tx(t.sdk.wallet.deposit_address().script_pubkey(), 10_000);
        t.chain.add_tx(&funding);
        let txid = funding.compute_txid().to_string();
        t.sdk.storage.add_deposit(&txid, 0, 10_000).await.unwrap();

        let destination = t.sdk.wallet.claim_address().to_string();
        t.sdk
            .refund_deposit(RefundDepositRequest {
                txid: txid.clone(),
                vout: 0,
                destination_address: destination,
                fee: Fee::Fixed { amount: 500 },
            })
            .await
            .unwrap();

        let result = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: txid.clone(),
                vout: 0,
                max_fee: None,
            })
            .await;
        assert!(matches!(result, Err(SdkError::Generic(_))));

        // Only the refund was broadcast.
        let broadcasts = t
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == "broadcast")
            .count();
        assert_eq!(broadcasts, 1);

        // An outpoint that was never recorded as a deposit is rejected too.
        let result = t
            .sdk
            .claim_deposit(ClaimDepositRequest {
                txid: "0".repeat(64),
                vout: 3,
                max_fee: None,
            })
            .await;
        assert!(matches!(result, Err(SdkError::MissingUtxo { .. })));
    }

    #[tokio::test]
    async fn test_deposit_locks_are_pruned_after_release() {
        let t = build_sdk(Network::Regtest, MockNodeService::default());
        for i in 0..10 {
            let guard = t.sdk.deposit_lock(&format!("tx-{i}"), 0).await;
            drop(guard);
        }
        assert!(t.sdk.deposit_locks.lock().await.len() <= 1);
    }

    #[test]
    fn test_process_success_action_message_passthrough() {
        let payment = create_payment("success-action", 100);
        let action = SuccessAction::Message {
            data: breez_sdk_common::lnurl::pay::MessageSuccessActionData {
                message: "thanks".to_string(),
            },
        };
        let processed = process_success_action(&payment, Some(&action));
        assert!(matches!(
            processed,
            Some(SuccessActionProcessed::Message { data }) if data.message == "thanks"
        ));
    }

    #[test]
    fn test_process_aes_success_action_without_preimage() {
        let mut payment = create_payment("aes-no-preimage", 100);
        if let Some(PaymentDetails::Lightning { preimage, .. }) = &mut payment.details {
            *preimage = None;
        }
        let action = SuccessAction::Aes {
            data: AesSuccessActionData {
                description: "code".to_string(),
                ciphertext: "aGVsbG8=".to_string(),
                iv: "aXZpdml2aXZpdml2aQ==".to_string(),
            },
        };
        let processed = process_success_action(&payment, Some(&action));
        assert!(matches!(
            processed,
            Some(SuccessActionProcessed::Aes {
                result: AesSuccessActionDataResult::ErrorStatus { .. }
            })
        ));
    }
}
