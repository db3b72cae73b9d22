use std::str::FromStr;

use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
    absolute::LockTime,
    bip32::{DerivationPath, Xpriv},
    hashes::Hash,
    key::Secp256k1,
    secp256k1::{All, Message, SecretKey},
    sighash::SighashCache,
    transaction::Version,
};

use crate::SdkError;

/// Outputs below this value are not worth creating.
const DUST_LIMIT_SATS: u64 = 546;

/// Estimated virtual size of a single-input, single-output p2wpkh spend.
pub(crate) const CLAIM_TX_VSIZE: u64 = 110;

struct DerivedKey {
    key: SecretKey,
    pubkey: CompressedPublicKey,
}

/// Keys for the wallet's on-chain deposit flow, derived from the wallet
/// mnemonic along BIP84. The deposit key backs the static deposit address,
/// the claim key holds funds swept from it.
pub struct DepositWallet {
    secp: Secp256k1<All>,
    deposit: DerivedKey,
    claim: DerivedKey,
    network: Network,
}

impl DepositWallet {
    pub fn new(seed: &[u8], network: Network) -> Result<Self, SdkError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)
            .map_err(|e| SdkError::Generic(format!("Failed to derive master key: {e}")))?;
        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        let deposit = Self::derive_key(&secp, &master, coin_type, 0)?;
        let claim = Self::derive_key(&secp, &master, coin_type, 1)?;
        Ok(Self {
            secp,
            deposit,
            claim,
            network,
        })
    }

    fn derive_key(
        secp: &Secp256k1<All>,
        master: &Xpriv,
        coin_type: u32,
        index: u32,
    ) -> Result<DerivedKey, SdkError> {
        let path = DerivationPath::from_str(&format!("m/84'/{coin_type}'/0'/0/{index}"))
            .map_err(|e| SdkError::Generic(format!("Invalid derivation path: {e}")))?;
        let derived = master
            .derive_priv(secp, &path)
            .map_err(|e| SdkError::Generic(format!("Failed to derive key: {e}")))?;
        let key = derived.private_key;
        let pubkey = CompressedPublicKey(key.public_key(secp));
        Ok(DerivedKey { key, pubkey })
    }

    /// The wallet's static deposit address.
    pub fn deposit_address(&self) -> Address {
        Address::p2wpkh(&self.deposit.pubkey, self.network)
    }

    /// The address claimed deposits are swept to.
    pub fn claim_address(&self) -> Address {
        Address::p2wpkh(&self.claim.pubkey, self.network)
    }

    /// Builds and signs a transaction sweeping a deposit utxo to the claim
    /// address, with the fee subtracted from the utxo value.
    pub fn build_claim_tx(
        &self,
        utxo_tx: &Transaction,
        vout: u32,
        fee_sats: u64,
    ) -> Result<Transaction, SdkError> {
        self.build_deposit_spend_tx(utxo_tx, vout, self.claim_address().script_pubkey(), fee_sats)
    }

    /// Builds and signs a transaction sending a deposit utxo back to the
    /// given destination, with the fee subtracted from the utxo value.
    pub fn build_refund_tx(
        &self,
        utxo_tx: &Transaction,
        vout: u32,
        destination: &Address,
        fee_sats: u64,
    ) -> Result<Transaction, SdkError> {
        self.build_deposit_spend_tx(utxo_tx, vout, destination.script_pubkey(), fee_sats)
    }

    fn build_deposit_spend_tx(
        &self,
        utxo_tx: &Transaction,
        vout: u32,
        destination: ScriptBuf,
        fee_sats: u64,
    ) -> Result<Transaction, SdkError> {
        let txid = utxo_tx.compute_txid();
        let prev_output = utxo_tx
            .output
            .get(vout as usize)
            .ok_or(SdkError::MissingUtxo {
                tx: txid.to_string(),
                vout,
            })?;
        let deposit_script = self.deposit_address().script_pubkey();
        if prev_output.script_pubkey != deposit_script {
            return Err(SdkError::Generic(format!(
                "Utxo {txid}:{vout} does not pay to the deposit address"
            )));
        }

        let value = prev_output
            .value
            .to_sat()
            .checked_sub(fee_sats)
            .filter(|value| *value >= DUST_LIMIT_SATS)
            .ok_or_else(|| {
                SdkError::InvalidAmount(format!(
                    "Fee of {fee_sats} sat leaves no spendable output from utxo {txid}:{vout}"
                ))
            })?;

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(txid, vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: destination,
            }],
        };

        let witness = self.sign_p2wpkh_input(&tx, 0, prev_output, &self.deposit)?;
        tx.input[0].witness = witness;
        Ok(tx)
    }

    /// Builds and signs a withdrawal spending claim utxos to `destination`.
    /// Inputs are selected in the given order until `amount_sats` plus
    /// `fee_sats` is covered. Change below the dust limit is given up to fees.
    pub fn build_withdraw_tx(
        &self,
        utxos: &[(Transaction, u32)],
        destination: &Address,
        amount_sats: u64,
        fee_sats: u64,
    ) -> Result<Transaction, SdkError> {
        if amount_sats < DUST_LIMIT_SATS {
            return Err(SdkError::InvalidAmount(format!(
                "Withdrawal amount {amount_sats} sat is below the dust limit"
            )));
        }

        let claim_script = self.claim_address().script_pubkey();
        let required = amount_sats.saturating_add(fee_sats);
        let mut selected: Vec<(&Transaction, u32, &TxOut)> = Vec::new();
        let mut selected_total: u64 = 0;
        let mut available: u64 = 0;
        for (utxo_tx, vout) in utxos {
            let prev_output =
                utxo_tx
                    .output
                    .get(*vout as usize)
                    .ok_or(SdkError::MissingUtxo {
                        tx: utxo_tx.compute_txid().to_string(),
                        vout: *vout,
                    })?;
            if prev_output.script_pubkey != claim_script {
                continue;
            }
            available = available.saturating_add(prev_output.value.to_sat());
            if selected_total < required {
                selected.push((utxo_tx, *vout, prev_output));
                selected_total = selected_total.saturating_add(prev_output.value.to_sat());
            }
        }
        if selected_total < required {
            return Err(SdkError::InsufficientFunds {
                available_sats: available,
                required_sats: required,
            });
        }

        let mut output = vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: destination.script_pubkey(),
        }];
        let change = selected_total.saturating_sub(required);
        if change >= DUST_LIMIT_SATS {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: claim_script,
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|(utxo_tx, vout, _)| TxIn {
                    previous_output: OutPoint::new(utxo_tx.compute_txid(), *vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output,
        };

        let witnesses = selected
            .iter()
            .enumerate()
            .map(|(index, (_, _, prev_output))| {
                self.sign_p2wpkh_input(&tx, index, prev_output, &self.claim)
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }
        Ok(tx)
    }

    fn sign_p2wpkh_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOut,
        key: &DerivedKey,
    ) -> Result<Witness, SdkError> {
        let sighash = SighashCache::new(tx)
            .p2wpkh_signature_hash(
                input_index,
                &prev_output.script_pubkey,
                prev_output.value,
                EcdsaSighashType::All,
            )
            .map_err(|e| SdkError::Generic(format!("Failed to compute sighash: {e}")))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = bitcoin::ecdsa::Signature {
            signature: self.secp.sign_ecdsa_low_r(&message, &key.key),
            sighash_type: EcdsaSighashType::All,
        };
        Ok(Witness::p2wpkh(&signature, &key.pubkey.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wallet(network: Network) -> DepositWallet {
        let mnemonic = bip39::Mnemonic::parse(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        DepositWallet::new(&mnemonic.to_seed(""), network).unwrap()
    }

    fn funding_tx(wallet: &DepositWallet, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: wallet.deposit_address().script_pubkey(),
            }],
        }
    }

    #[test]
    fn test_deposit_address_derivation() {
        // First BIP84 external address for the all-"abandon" mnemonic.
        let wallet = test_wallet(Network::Bitcoin);
        assert_eq!(
            wallet.deposit_address().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            wallet.claim_address().to_string(),
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn test_build_claim_tx() {
        let wallet = test_wallet(Network::Regtest);
        let funding = funding_tx(&wallet, 10_000);
        let tx = wallet.build_claim_tx(&funding, 0, 500).unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.txid, funding.compute_txid());
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 9_500);
        assert_eq!(
            tx.output[0].script_pubkey,
            wallet.claim_address().script_pubkey()
        );
        // Signature plus compressed pubkey.
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_build_refund_tx() {
        let wallet = test_wallet(Network::Regtest);
        let funding = funding_tx(&wallet, 10_000);
        let destination = wallet.claim_address();
        let tx = wallet.build_refund_tx(&funding, 0, &destination, 1000).unwrap();
        assert_eq!(tx.output[0].value.to_sat(), 9_000);
    }

    #[test]
    fn test_claim_rejects_dust_output() {
        let wallet = test_wallet(Network::Regtest);
        let funding = funding_tx(&wallet, 1_000);
        assert!(matches!(
            wallet.build_claim_tx(&funding, 0, 600),
            Err(SdkError::InvalidAmount(_))
        ));
        assert!(matches!(
            wallet.build_claim_tx(&funding, 0, 2_000),
            Err(SdkError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_claim_rejects_missing_utxo() {
        let wallet = test_wallet(Network::Regtest);
        let funding = funding_tx(&wallet, 10_000);
        assert!(matches!(
            wallet.build_claim_tx(&funding, 5, 500),
            Err(SdkError::MissingUtxo { .. })
        ));
    }

    fn claim_funding_tx(wallet: &DepositWallet, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: wallet.claim_address().script_pubkey(),
            }],
        }
    }

    #[test]
    fn test_build_withdraw_tx_with_change() {
        let wallet = test_wallet(Network::Regtest);
        let utxos = vec![
            (claim_funding_tx(&wallet, 8_000), 0),
            (claim_funding_tx(&wallet, 5_000), 0),
        ];
        let destination = wallet.deposit_address();
        let tx = wallet
            .build_withdraw_tx(&utxos, &destination, 9_000, 300)
            .unwrap();

        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 9_000);
        // Change back to the claim address: 13000 - 9000 - 300.
        assert_eq!(tx.output[1].value.to_sat(), 3_700);
        assert_eq!(
            tx.output[1].script_pubkey,
            wallet.claim_address().script_pubkey()
        );
        assert!(tx.input.iter().all(|input| input.witness.len() == 2));
    }

    #[test]
    fn test_build_withdraw_tx_insufficient_funds() {
        let wallet = test_wallet(Network::Regtest);
        let utxos = vec![(claim_funding_tx(&wallet, 5_000), 0)];
        let destination = wallet.deposit_address();
        assert!(matches!(
            wallet.build_withdraw_tx(&utxos, &destination, 9_000, 300),
            Err(SdkError::InsufficientFunds {
                available_sats: 5_000,
                required_sats: 9_300,
            })
        ));
    }

    #[test]
    fn test_claim_rejects_foreign_utxo() {
        let wallet = test_wallet(Network::Regtest);
        let mut funding = funding_tx(&wallet, 10_000);
        funding.output[0].script_pubkey = wallet.claim_address().script_pubkey();
        assert!(wallet.build_claim_tx(&funding, 0, 500).is_err());
    }
}
