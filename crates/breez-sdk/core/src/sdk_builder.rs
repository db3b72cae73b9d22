use std::{collections::HashMap, sync::Arc};

use breez_sdk_common::rest::{ReqwestRestClient, RestClient};
use tokio::sync::{Mutex, broadcast, watch};

use crate::{
    BreezSdk, SdkError,
    chain::{BitcoinChainService, rest_client::RestClientChainService},
    events::EventEmitter,
    models::{Config, Credentials, Network},
    node::{NodeService, rest_client::RestClientNodeService},
    persist::Storage,
    wallet::DepositWallet,
};

const CHAIN_SERVICE_MAX_RETRIES: usize = 5;

/// Assembles a [`BreezSdk`] from a config, a mnemonic and a storage backend,
/// with optional overrides for the backing services.
pub struct SdkBuilder {
    config: Config,
    mnemonic: String,
    storage: Arc<dyn Storage>,
    chain_service: Option<Arc<dyn BitcoinChainService>>,
    node_service: Option<Arc<dyn NodeService>>,
    lnurl_client: Option<Arc<dyn RestClient>>,
}

impl SdkBuilder {
    pub fn new(config: Config, mnemonic: String, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            mnemonic,
            storage,
            chain_service: None,
            node_service: None,
            lnurl_client: None,
        }
    }

    #[must_use]
    pub fn with_chain_service(mut self, chain_service: Arc<dyn BitcoinChainService>) -> Self {
        self.chain_service = Some(chain_service);
        self
    }

    /// Points the sdk at an esplora/mempool style chain backend.
    #[must_use]
    pub fn with_rest_chain_service(
        mut self,
        url: String,
        credentials: Option<Credentials>,
    ) -> Self {
        self.chain_service = Some(Arc::new(RestClientChainService::new(
            url,
            self.config.network.into(),
            CHAIN_SERVICE_MAX_RETRIES,
            credentials,
        )));
        self
    }

    #[must_use]
    pub fn with_node_service(mut self, node_service: Arc<dyn NodeService>) -> Self {
        self.node_service = Some(node_service);
        self
    }

    #[must_use]
    pub fn with_lnurl_client(mut self, lnurl_client: Arc<dyn RestClient>) -> Self {
        self.lnurl_client = Some(lnurl_client);
        self
    }

    /// Builds the sdk and starts its background sync loop. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<BreezSdk, SdkError> {
        let mnemonic = bip39::Mnemonic::parse(self.mnemonic.as_str())
            .map_err(|e| SdkError::InvalidInput(format!("Invalid mnemonic: {e}")))?;
        let seed = mnemonic.to_seed("");
        let wallet = Arc::new(DepositWallet::new(&seed, self.config.network.into())?);

        let chain_service = match self.chain_service {
            Some(chain_service) => chain_service,
            None => Arc::new(default_chain_service(&self.config)),
        };
        let node_service = match self.node_service {
            Some(node_service) => node_service,
            None => Arc::new(RestClientNodeService::new(
                default_node_url(self.config.network).to_string(),
                self.config.api_key.clone(),
            )),
        };
        let lnurl_client = match self.lnurl_client {
            Some(lnurl_client) => lnurl_client,
            None => Arc::new(ReqwestRestClient::new()?),
        };

        let (shutdown_sender, shutdown_receiver) = watch::channel(());
        let sdk = BreezSdk {
            config: self.config,
            wallet,
            storage: self.storage,
            chain_service,
            node_service,
            lnurl_client,
            event_emitter: Arc::new(EventEmitter::new()),
            shutdown_sender,
            shutdown_receiver,
            sync_trigger: broadcast::channel(30).0,
            deposit_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        sdk.start();
        Ok(sdk)
    }
}

fn default_chain_service(config: &Config) -> RestClientChainService {
    let (url, credentials) = match config.network {
        Network::Mainnet => ("https://blockstream.info/api".to_string(), None),
        Network::Testnet => ("https://blockstream.info/testnet/api".to_string(), None),
        Network::Signet => ("https://blockstream.info/signet/api".to_string(), None),
        Network::Regtest => {
            let credentials = match (
                std::env::var("CHAIN_SERVICE_USERNAME"),
                std::env::var("CHAIN_SERVICE_PASSWORD"),
            ) {
                (Ok(username), Ok(password)) => Some(Credentials { username, password }),
                _ => None,
            };
            ("http://localhost:3000".to_string(), credentials)
        }
    };
    RestClientChainService::new(
        url,
        config.network.into(),
        CHAIN_SERVICE_MAX_RETRIES,
        credentials,
    )
}

fn default_node_url(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "https://node.breez.technology",
        Network::Testnet | Network::Signet => "https://node-testnet.breez.technology",
        Network::Regtest => "http://localhost:8080",
    }
}
