use std::ops::Not;

use bitcoin::{Address, Denomination, address::NetworkUnchecked};
use lightning::bolt11_invoice::Bolt11InvoiceDescriptionRef;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use tracing::debug;

use crate::{
    input::{
        Bip21Extra, ExternalInputParser, LnurlRequestDetails, ParseError, PaymentRequestSource,
    },
    lnurl::{error::LnurlError, pay::LnurlPayRequestDetails},
    rest::{ReqwestRestClient, RestClient, parse_json},
};

use super::{
    Bip21Details, BitcoinAddressDetails, Bolt11InvoiceDetails, Bolt11RouteHint, Bolt11RouteHintHop,
    InputType, LightningAddressDetails, error::Bip21Error,
};

const BIP_21_PREFIX: &str = "bitcoin:";
const LIGHTNING_PREFIX: &str = "lightning:";
const LIGHTNING_PREFIX_LEN: usize = LIGHTNING_PREFIX.len();
const LNURL_HRP: &str = "lnurl";

/// RFC 3986 unreserved characters stay as-is, everything else is percent-encoded.
const URL_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub async fn parse(
    input: &str,
    external_input_parsers: Option<Vec<ExternalInputParser>>,
) -> Result<InputType, ParseError> {
    let rest_client = ReqwestRestClient::new().map_err(ParseError::ServiceConnectivity)?;
    InputParser::new(rest_client, external_input_parsers)
        .parse(input)
        .await
}

pub fn parse_invoice(input: &str) -> Option<Bolt11InvoiceDetails> {
    parse_bolt11(input, &PaymentRequestSource::default())
}

pub struct InputParser<C> {
    rest_client: C,
    external_input_parsers: Option<Vec<ExternalInputParser>>,
}

impl<C> InputParser<C>
where
    C: RestClient + Send + Sync,
{
    pub fn new(rest_client: C, external_input_parsers: Option<Vec<ExternalInputParser>>) -> Self {
        InputParser {
            rest_client,
            external_input_parsers,
        }
    }

    pub async fn parse(&self, input: &str) -> Result<InputType, ParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ParseError::EmptyInput);
        }

        if let Some(input_type) = self.parse_core(input).await? {
            return Ok(input_type);
        }

        if let Some(input_type) = self.parse_external_input(input).await? {
            return Ok(input_type);
        }

        Err(ParseError::InvalidInput)
    }

    pub async fn parse_core(&self, input: &str) -> Result<Option<InputType>, ParseError> {
        if input.contains('@')
            && let Some(lightning_address) = self.parse_lightning_address(input).await
        {
            return Ok(Some(InputType::LightningAddress(lightning_address)));
        }

        if has_bip_21_prefix(input) {
            let source = PaymentRequestSource {
                bip_21_uri: Some(input.to_string()),
            };
            if let Some(bip_21) = parse_bip_21(input, &source)? {
                return Ok(Some(InputType::Bip21(bip_21)));
            }
        }

        let source = PaymentRequestSource::default();
        if let Some(input_type) = self.parse_lightning(input, &source).await? {
            return Ok(Some(input_type));
        }

        if let Some(address) = parse_bitcoin_address(input, &source) {
            return Ok(Some(InputType::BitcoinAddress(address)));
        }

        Ok(None)
    }

    async fn parse_lightning(
        &self,
        input: &str,
        source: &PaymentRequestSource,
    ) -> Result<Option<InputType>, ParseError> {
        let input = if has_lightning_prefix(input) {
            &input[LIGHTNING_PREFIX_LEN..]
        } else {
            input
        };

        if let Some(bolt11) = parse_bolt11(input, source) {
            return Ok(Some(InputType::Bolt11Invoice(bolt11)));
        }

        if let Some(lnurl) = self.parse_lnurl(input, source).await? {
            return Ok(Some(lnurl));
        }

        Ok(None)
    }

    async fn parse_lightning_address(&self, input: &str) -> Option<LightningAddressDetails> {
        if !input.contains('@') {
            return None;
        }

        let (user, domain) = input.strip_prefix('₿').unwrap_or(input).split_once('@')?;

        // It is safe to downcase the domains since they are case-insensitive.
        // https://www.rfc-editor.org/rfc/rfc3986#section-3.2.2
        let (user, domain) = (user.to_lowercase(), domain.to_lowercase());

        if !user
            .chars()
            .all(|c| c.is_alphanumeric() || ['-', '_', '.'].contains(&c))
        {
            return None;
        }

        // Use http:// for Tor or local domains (latter being commonly used for testing)
        let scheme = if has_extension(&domain, "onion") || is_local_domain(&domain) {
            "http://"
        } else {
            "https://"
        };

        let Ok(url) = url::Url::parse(&format!("{scheme}{domain}/.well-known/lnurlp/{user}"))
        else {
            return None;
        };

        let input_type = self
            .resolve_lnurl(&url, &PaymentRequestSource::default())
            .await
            .ok()?;

        let address = format!("{user}@{domain}");
        match input_type {
            InputType::LnurlPay(pay_request) => Some(LightningAddressDetails {
                address: address.clone(),
                pay_request: LnurlPayRequestDetails {
                    address: Some(address),
                    ..pay_request
                },
            }),
            _ => None,
        }
    }

    async fn parse_lnurl(
        &self,
        input: &str,
        source: &PaymentRequestSource,
    ) -> Result<Option<InputType>, LnurlError> {
        let mut input = match bech32::decode(input) {
            Ok((hrp, data)) => {
                let hrp = hrp.to_lowercase();
                if hrp != LNURL_HRP {
                    return Ok(None);
                }

                match String::from_utf8(data) {
                    Ok(decoded) => decoded,
                    Err(_) => return Ok(None),
                }
            }
            Err(_) => input.to_string(),
        };

        // Treat lnurlp: and lnurlp:// the same, to cover both vendor implementations
        // https://github.com/lnbits/lnbits/pull/762#issue-1309702380
        if has_prefix(&input, "lnurlp:") && !has_prefix(&input, "lnurlp://") {
            input = replace_prefix(&input, "lnurlp:", "lnurlp://");
        }

        let Ok(parsed_url) = url::Url::parse(&input) else {
            return Ok(None);
        };

        let host = match parsed_url.host() {
            Some(domain) => domain.to_string(),
            None => return Ok(None),
        };

        let mut url = parsed_url.clone();
        match parsed_url.scheme() {
            "http" => {
                // Allow http for .onion domains and local domains (for testing)
                if !has_extension(&host, "onion") && !is_local_domain(&host) {
                    return Err(LnurlError::HttpSchemeWithoutOnionDomain);
                }
            }
            "https" => {
                if has_extension(&host, "onion") {
                    return Err(LnurlError::HttpsSchemeWithOnionDomain);
                }
            }
            "lnurlp" => {
                let new_scheme = if has_extension(&host, "onion") {
                    "http"
                } else {
                    "https"
                };
                url = url::Url::parse(&replace_prefix(&input, "lnurlp", new_scheme))
                    .map_err(|_| LnurlError::General("failed to rewrite lnurl scheme".to_string()))?;
            }
            &_ => return Err(LnurlError::UnknownScheme),
        }

        Ok(Some(self.resolve_lnurl(&url, source).await?))
    }

    async fn resolve_lnurl(
        &self,
        url: &url::Url,
        _source: &PaymentRequestSource,
    ) -> Result<InputType, LnurlError> {
        let response = self.rest_client.get(url.to_string(), None).await?;
        let lnurl_data: LnurlRequestDetails =
            parse_json(&response.body).map_err(|e| LnurlError::InvalidResponse(e.to_string()))?;
        let domain = url.host().ok_or(LnurlError::MissingDomain)?.to_string();
        match lnurl_data {
            LnurlRequestDetails::PayRequest { pay_request } => {
                Ok(InputType::LnurlPay(LnurlPayRequestDetails {
                    domain,
                    url: url.to_string(),
                    ..pay_request
                }))
            }
            LnurlRequestDetails::Error {
                error_details: error,
            } => Err(LnurlError::EndpointError(error.reason)),
        }
    }

    async fn parse_external_input(&self, input: &str) -> Result<Option<InputType>, ParseError> {
        let Some(external_input_parsers) = &self.external_input_parsers else {
            return Ok(None);
        };

        for parser in external_input_parsers {
            // Check regex
            let re = Regex::new(&parser.input_regex)?;
            if re.is_match(input).not() {
                continue;
            }

            // Build URL
            let urlsafe_input = utf8_percent_encode(input, URL_SAFE).to_string();
            let parser_url = parser.parser_url.replacen("<input>", &urlsafe_input, 1);

            // Make request
            let response = self
                .rest_client
                .get(parser_url.clone(), None)
                .await
                .map_err(ParseError::ServiceConnectivity)?;
            let body = &response.body;

            // Try to parse as LnurlRequestDetails
            if let Ok(lnurl_data) = parse_json::<LnurlRequestDetails>(body) {
                let domain = url::Url::parse(&parser_url)
                    .ok()
                    .and_then(|url| url.host_str().map(ToString::to_string))
                    .unwrap_or_default();
                let input_type = lnurl_data.try_into()?;
                let input_type = match input_type {
                    // Modify the LnUrlPay payload by adding the domain of the LNURL endpoint
                    InputType::LnurlPay(pay_request) => {
                        InputType::LnurlPay(LnurlPayRequestDetails {
                            domain,
                            ..pay_request
                        })
                    }
                    _ => input_type,
                };
                return Ok(Some(input_type));
            }

            // Check other input types
            if let Ok(input_type) = self.parse_core(body).await {
                return Ok(input_type);
            }
        }

        Ok(None)
    }
}

fn format_short_channel_id(id: u64) -> String {
    let block_num = (id >> 40) as u32;
    let tx_num = ((id >> 16) & 0x00FF_FFFF) as u32;
    let tx_out = (id & 0xFFFF) as u16;
    format!("{block_num}x{tx_num}x{tx_out}")
}

fn has_bip_21_prefix(input: &str) -> bool {
    has_prefix(input, BIP_21_PREFIX)
}

fn has_extension(input: &str, extension: &str) -> bool {
    std::path::Path::new(input)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Check if the domain is a local domain (for testing purposes)
fn is_local_domain(host: &str) -> bool {
    host.starts_with("127.0.0.1") || host.starts_with("localhost")
}

fn has_lightning_prefix(input: &str) -> bool {
    has_prefix(input, LIGHTNING_PREFIX)
}

fn has_prefix(input: &str, prefix: &str) -> bool {
    if input.len() < prefix.len() {
        return false;
    }

    input[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn replace_prefix(input: &str, prefix: &str, new_prefix: &str) -> String {
    if !has_prefix(input, prefix) {
        return String::from(input);
    }

    format!("{}{}", new_prefix, &input[prefix.len()..])
}

fn parse_bip_21(
    input: &str,
    source: &PaymentRequestSource,
) -> Result<Option<Bip21Details>, Bip21Error> {
    if !has_bip_21_prefix(input) {
        return Ok(None);
    }

    debug!("Parsing bip 21: {input}");
    let uri = input.to_string();
    let input = &input[BIP_21_PREFIX.len()..];
    let mut bip_21 = Bip21Details {
        uri,
        ..Default::default()
    };

    let (address, params) = match input.find('?') {
        Some(pos) => (&input[..pos], Some(&input[(pos.saturating_add(1))..])),
        None => (input, None),
    };

    if !address.is_empty() {
        let address = parse_bitcoin_address(address, source).ok_or(Bip21Error::InvalidAddress)?;
        bip_21
            .payment_methods
            .push(InputType::BitcoinAddress(address));
    }

    if let Some(params) = params {
        for param in params.split('&') {
            let pos = param.find('=').ok_or(Bip21Error::MissingEquals)?;
            let original_key_string = param[..pos].to_lowercase();
            let original_key = original_key_string.as_str();
            let value = &param[(pos.saturating_add(1))..];
            let (key, is_required) = if let Some(stripped) = original_key.strip_prefix("req-") {
                (stripped, true)
            } else {
                (original_key, false)
            };

            parse_bip21_key(source, &mut bip_21, original_key, value, key, is_required)?;
        }
    }

    if bip_21.payment_methods.is_empty() {
        return Err(Bip21Error::NoPaymentMethods);
    }

    Ok(Some(bip_21))
}

fn parse_bip21_key(
    source: &PaymentRequestSource,
    bip_21: &mut Bip21Details,
    original_key: &str,
    value: &str,
    key: &str,
    is_required: bool,
) -> Result<(), Bip21Error> {
    match key {
        "amount" if bip_21.amount_sat.is_some() => {
            return Err(Bip21Error::multiple_params(key));
        }
        "amount" => {
            bip_21.amount_sat = Some(
                bitcoin::Amount::from_str_in(value, Denomination::Bitcoin)
                    .map_err(|_| Bip21Error::InvalidAmount)?
                    .to_sat(),
            );
        }
        "label" if bip_21.label.is_some() => {
            return Err(Bip21Error::multiple_params(key));
        }
        "label" => {
            bip_21.label =
                Some(percent_decode(value).map_err(Bip21Error::invalid_parameter_func("label"))?);
        }
        "lightning" => {
            let bolt11 = parse_bolt11(value, source);
            match bolt11 {
                Some(bolt11) => bip_21
                    .payment_methods
                    .push(InputType::Bolt11Invoice(bolt11)),
                None => return Err(Bip21Error::invalid_parameter("lightning")),
            }
        }
        "message" if bip_21.message.is_some() => {
            return Err(Bip21Error::multiple_params(key));
        }
        "message" => {
            bip_21.message =
                Some(percent_decode(value).map_err(Bip21Error::invalid_parameter_func("message"))?);
        }
        extra_key => {
            if is_required {
                return Err(Bip21Error::UnknownRequiredParameter(extra_key.to_string()));
            }

            bip_21.extras.push(Bip21Extra {
                key: original_key.to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

fn percent_decode(value: &str) -> Result<String, std::str::Utf8Error> {
    Ok(percent_decode_str(value).decode_utf8()?.into_owned())
}

fn parse_bitcoin_address(
    input: &str,
    source: &PaymentRequestSource,
) -> Option<BitcoinAddressDetails> {
    if input.is_empty() {
        return None;
    }

    let address: Address<NetworkUnchecked> = input.parse().ok()?;
    let network = match 1 {
        _ if address.is_valid_for_network(bitcoin::Network::Bitcoin) => bitcoin::Network::Bitcoin,
        _ if address.is_valid_for_network(bitcoin::Network::Regtest) => bitcoin::Network::Regtest,
        _ if address.is_valid_for_network(bitcoin::Network::Signet) => bitcoin::Network::Signet,
        _ if address.is_valid_for_network(bitcoin::Network::Testnet) => bitcoin::Network::Testnet,
        _ if address.is_valid_for_network(bitcoin::Network::Testnet4) => bitcoin::Network::Testnet4,
        _ => return None,
    }
    .into();
    Some(BitcoinAddressDetails {
        address: address.assume_checked().to_string(),
        network,
        source: source.clone(),
    })
}

fn parse_bolt11(input: &str, source: &PaymentRequestSource) -> Option<Bolt11InvoiceDetails> {
    let bolt11: lightning::bolt11_invoice::Bolt11Invoice = match input.parse() {
        Ok(invoice) => invoice,
        Err(_) => return None,
    };

    Some(Bolt11InvoiceDetails {
        amount_msat: bolt11.amount_milli_satoshis(),
        description: match bolt11.description() {
            Bolt11InvoiceDescriptionRef::Direct(description) => Some(description.to_string()),
            Bolt11InvoiceDescriptionRef::Hash(_) => None,
        },
        description_hash: match bolt11.description() {
            Bolt11InvoiceDescriptionRef::Direct(_) => None,
            Bolt11InvoiceDescriptionRef::Hash(sha256) => Some(sha256.0.to_string()),
        },
        expiry: bolt11.expiry_time().as_secs(),
        invoice: super::Bolt11Invoice {
            bolt11: input.to_string(),
            source: source.clone(),
        },
        min_final_cltv_expiry_delta: bolt11.min_final_cltv_expiry_delta(),
        network: bolt11.network().into(),
        payee_pubkey: bolt11.get_payee_pub_key().to_string(),
        payment_hash: bolt11.payment_hash().to_string(),
        payment_secret: hex::encode(bolt11.payment_secret().0),
        routing_hints: bolt11
            .route_hints()
            .into_iter()
            .map(|hint| Bolt11RouteHint {
                hops: hint
                    .0
                    .into_iter()
                    .map(|hop| Bolt11RouteHintHop {
                        src_node_id: hop.src_node_id.to_string(),
                        short_channel_id: format_short_channel_id(hop.short_channel_id),
                        fees_base_msat: hop.fees.base_msat,
                        fees_proportional_millionths: hop.fees.proportional_millionths,
                        cltv_expiry_delta: hop.cltv_expiry_delta,
                        htlc_minimum_msat: hop.htlc_minimum_msat,
                        htlc_maximum_msat: hop.htlc_maximum_msat,
                    })
                    .collect(),
            })
            .collect(),
        timestamp: bolt11.duration_since_epoch().as_secs(),
    })
}
