mod chain;
mod error;
mod events;
mod logger;
mod models;
mod node;
mod persist;
mod sdk;
mod sdk_builder;
mod utils;
mod wallet;

pub use breez_sdk_common::input::{
    Bip21Details, BitcoinAddressDetails, Bolt11Invoice, Bolt11InvoiceDetails, InputType,
    LightningAddressDetails, ParseError, parse_invoice,
};
pub use breez_sdk_common::rest::{ReqwestRestClient, RestClient};
pub use breez_sdk_common::lnurl::pay::{
    AesSuccessActionDataDecrypted, AesSuccessActionDataResult, LnurlPayRequestDetails,
    MessageSuccessActionData, SuccessAction, SuccessActionProcessed, UrlSuccessActionData,
};

pub use crate::{
    chain::{BitcoinChainService, ChainServiceError, RecommendedFees, TxStatus, Utxo},
    error::{DepositClaimError, SdkError},
    events::{EventEmitter, EventListener, SdkEvent},
    logger::init_logging,
    models::*,
    node::{NodeError, NodeInvoice, NodePayment, NodePaymentStatus, NodeService},
    persist::{PaymentMetadata, Storage, StorageError, UpdateDepositPayload, sqlite::SqliteStorage},
    sdk::{BreezSdk, default_config, default_storage, parse_input},
    sdk_builder::SdkBuilder,
};

#[cfg(feature = "test-utils")]
pub use crate::persist::tests as storage_tests;
