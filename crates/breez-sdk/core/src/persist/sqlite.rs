use std::{path::PathBuf, str::FromStr};

use rusqlite::{
    Connection, OptionalExtension, Row, ToSql, named_params, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value, ValueRef},
};
use rusqlite_migration::{M, Migrations};

use super::{PaymentMetadata, Storage, StorageError, UpdateDepositPayload};
use crate::{
    error::DepositClaimError,
    models::{
        DepositInfo, ListPaymentsRequest, LnurlPayInfo, Payment, PaymentDetails, PaymentMethod,
        PaymentStatus, PaymentType,
    },
};

const DEFAULT_DB_FILENAME: &str = "storage.sql";

/// [`Storage`] implementation on top of a local sqlite database.
pub struct SqliteStorage {
    db_dir: PathBuf,
}

impl SqliteStorage {
    pub fn new(db_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&db_dir)
            .map_err(|e| StorageError::InitializationError(e.to_string()))?;
        let storage = Self { db_dir };
        storage.migrate()?;
        Ok(storage)
    }

    fn get_connection(&self) -> Result<Connection, StorageError> {
        let connection = Connection::open(self.db_dir.join(DEFAULT_DB_FILENAME))?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "FULL")?;
        Ok(connection)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let migrations =
            Migrations::new(Self::current_migrations().into_iter().map(M::up).collect());
        let mut connection = self.get_connection()?;
        migrations.to_latest(&mut connection)?;
        Ok(())
    }

    fn current_migrations() -> Vec<&'static str> {
        vec![
            "CREATE TABLE payments (
                id TEXT PRIMARY KEY,
                payment_type TEXT NOT NULL,
                status TEXT NOT NULL,
                amount INTEGER NOT NULL,
                fees INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                method TEXT NOT NULL,
                withdraw_tx_id TEXT,
                deposit_tx_id TEXT
            );",
            "CREATE TABLE payment_details_lightning (
                payment_id TEXT PRIMARY KEY REFERENCES payments(id) ON DELETE CASCADE,
                description TEXT,
                preimage TEXT,
                invoice TEXT NOT NULL,
                payment_hash TEXT NOT NULL,
                destination_pubkey TEXT NOT NULL,
                lnurl_pay_info TEXT
            );
            CREATE INDEX idx_payment_details_lightning_invoice
                ON payment_details_lightning(invoice);",
            "CREATE TABLE payment_metadata (
                payment_id TEXT PRIMARY KEY,
                lnurl_pay_info TEXT,
                lnurl_description TEXT
            );",
            "CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
            "CREATE TABLE unclaimed_deposits (
                txid TEXT NOT NULL,
                vout INTEGER NOT NULL,
                amount_sats INTEGER NOT NULL,
                refund_tx TEXT,
                refund_tx_id TEXT,
                claim_error TEXT,
                PRIMARY KEY (txid, vout)
            );",
            "ALTER TABLE payments ADD COLUMN deposit_vout INTEGER;",
        ]
    }

    fn map_payment(row: &Row<'_>) -> Result<Payment, rusqlite::Error> {
        let id: String = row.get(0)?;
        let payment_type: String = row.get(1)?;
        let status: String = row.get(2)?;
        let method: String = row.get(6)?;
        let withdraw_tx_id: Option<String> = row.get(7)?;
        let deposit_tx_id: Option<String> = row.get(8)?;
        let invoice: Option<String> = row.get(10)?;

        let details = if let Some(invoice) = invoice {
            Some(PaymentDetails::Lightning {
                preimage: row.get(9)?,
                invoice,
                payment_hash: row.get(11)?,
                destination_pubkey: row.get(12)?,
                description: row.get(13)?,
                lnurl_pay_info: row.get(14)?,
            })
        } else if let Some(tx_id) = withdraw_tx_id {
            Some(PaymentDetails::Withdraw { tx_id })
        } else if let Some(tx_id) = deposit_tx_id {
            let vout: Option<u32> = row.get(15)?;
            Some(PaymentDetails::Deposit {
                tx_id,
                vout: vout.unwrap_or(0),
            })
        } else {
            None
        };

        Ok(Payment {
            id,
            payment_type: PaymentType::from_str(&payment_type)
                .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?,
            status: PaymentStatus::from_str(&status)
                .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?,
            amount: row.get(3)?,
            fees: row.get(4)?,
            timestamp: row.get(5)?,
            method: PaymentMethod::from_str(&method)
                .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?,
            details,
        })
    }

    const PAYMENT_SELECT: &'static str = "SELECT
            p.id,
            p.payment_type,
            p.status,
            p.amount,
            p.fees,
            p.timestamp,
            p.method,
            p.withdraw_tx_id,
            p.deposit_tx_id,
            l.preimage,
            l.invoice,
            l.payment_hash,
            l.destination_pubkey,
            COALESCE(l.description, pm.lnurl_description) AS description,
            COALESCE(l.lnurl_pay_info, pm.lnurl_pay_info) AS lnurl_pay_info,
            p.deposit_vout
        FROM payments p
        LEFT JOIN payment_details_lightning l ON l.payment_id = p.id
        LEFT JOIN payment_metadata pm ON pm.payment_id = p.id";

    fn map_deposit(row: &Row<'_>) -> Result<DepositInfo, rusqlite::Error> {
        Ok(DepositInfo {
            txid: row.get(0)?,
            vout: row.get(1)?,
            amount_sats: row.get(2)?,
            refund_tx: row.get(3)?,
            refund_tx_id: row.get(4)?,
            claim_error: row.get(5)?,
        })
    }
}

#[async_trait::async_trait]
impl Storage for SqliteStorage {
    async fn get_cached_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let connection = self.get_connection()?;
        let value = connection
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_cached_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        connection.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    async fn delete_cached_item(&self, key: &str) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        connection.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn list_payments(
        &self,
        request: ListPaymentsRequest,
    ) -> Result<Vec<Payment>, StorageError> {
        let connection = self.get_connection()?;
        // Secondary id key keeps pagination stable across equal timestamps.
        let query = format!(
            "{} ORDER BY p.timestamp DESC, p.id DESC LIMIT :limit OFFSET :offset",
            Self::PAYMENT_SELECT
        );
        let mut statement = connection.prepare(&query)?;
        let payments = statement
            .query_map(
                named_params! {
                    ":limit": request.limit.map_or(-1, i64::from),
                    ":offset": i64::from(request.offset.unwrap_or(0)),
                },
                Self::map_payment,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    async fn insert_payment(&self, payment: Payment) -> Result<(), StorageError> {
        let mut connection = self.get_connection()?;
        let tx = connection.transaction()?;

        let (withdraw_tx_id, deposit_tx_id, deposit_vout) = match &payment.details {
            Some(PaymentDetails::Withdraw { tx_id }) => (Some(tx_id.clone()), None, None),
            Some(PaymentDetails::Deposit { tx_id, vout }) => {
                (None, Some(tx_id.clone()), Some(*vout))
            }
            _ => (None, None, None),
        };

        tx.execute(
            "INSERT OR REPLACE INTO payments
                (id, payment_type, status, amount, fees, timestamp, method,
                 withdraw_tx_id, deposit_tx_id, deposit_vout)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                payment.id,
                payment.payment_type.to_string(),
                payment.status.to_string(),
                payment.amount,
                payment.fees,
                payment.timestamp,
                payment.method.to_string(),
                withdraw_tx_id,
                deposit_tx_id,
                deposit_vout,
            ],
        )?;

        if let Some(PaymentDetails::Lightning {
            description,
            preimage,
            invoice,
            payment_hash,
            destination_pubkey,
            lnurl_pay_info,
        }) = &payment.details
        {
            tx.execute(
                "INSERT OR REPLACE INTO payment_details_lightning
                    (payment_id, description, preimage, invoice, payment_hash,
                     destination_pubkey, lnurl_pay_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    payment.id,
                    description,
                    preimage,
                    invoice,
                    payment_hash,
                    destination_pubkey,
                    lnurl_pay_info,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn set_payment_metadata(
        &self,
        payment_id: &str,
        metadata: PaymentMetadata,
    ) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        connection.execute(
            "INSERT OR REPLACE INTO payment_metadata
                (payment_id, lnurl_pay_info, lnurl_description)
             VALUES (?1, ?2, ?3)",
            params![
                payment_id,
                metadata.lnurl_pay_info,
                metadata.lnurl_description
            ],
        )?;
        Ok(())
    }

    async fn get_payment_by_id(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        let connection = self.get_connection()?;
        let query = format!("{} WHERE p.id = ?1", Self::PAYMENT_SELECT);
        let payment = connection
            .query_row(&query, params![id], Self::map_payment)
            .optional()?;
        Ok(payment)
    }

    async fn get_payment_by_invoice(
        &self,
        invoice: &str,
    ) -> Result<Option<Payment>, StorageError> {
        let connection = self.get_connection()?;
        let query = format!("{} WHERE l.invoice = ?1", Self::PAYMENT_SELECT);
        let payment = connection
            .query_row(&query, params![invoice], Self::map_payment)
            .optional()?;
        Ok(payment)
    }

    async fn add_deposit(
        &self,
        txid: &str,
        vout: u32,
        amount_sats: u64,
    ) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        connection.execute(
            "INSERT OR IGNORE INTO unclaimed_deposits (txid, vout, amount_sats)
             VALUES (?1, ?2, ?3)",
            params![txid, vout, amount_sats],
        )?;
        Ok(())
    }

    async fn delete_deposit(&self, txid: &str, vout: u32) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        connection.execute(
            "DELETE FROM unclaimed_deposits WHERE txid = ?1 AND vout = ?2",
            params![txid, vout],
        )?;
        Ok(())
    }

    async fn list_deposits(&self) -> Result<Vec<DepositInfo>, StorageError> {
        let connection = self.get_connection()?;
        let mut statement = connection.prepare(
            "SELECT txid, vout, amount_sats, refund_tx, refund_tx_id, claim_error
             FROM unclaimed_deposits",
        )?;
        let deposits = statement
            .query_map([], Self::map_deposit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(deposits)
    }

    async fn update_deposit(
        &self,
        txid: &str,
        vout: u32,
        payload: UpdateDepositPayload,
    ) -> Result<(), StorageError> {
        let connection = self.get_connection()?;
        match payload {
            UpdateDepositPayload::ClaimError { error } => {
                connection.execute(
                    "UPDATE unclaimed_deposits SET claim_error = ?1
                     WHERE txid = ?2 AND vout = ?3",
                    params![error, txid, vout],
                )?;
            }
            UpdateDepositPayload::Refund {
                refund_txid,
                refund_tx,
            } => {
                connection.execute(
                    "UPDATE unclaimed_deposits SET refund_tx_id = ?1, refund_tx = ?2
                     WHERE txid = ?3 AND vout = ?4",
                    params![refund_txid, refund_tx, txid, vout],
                )?;
            }
        }
        Ok(())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Implementation(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for StorageError {
    fn from(err: rusqlite_migration::Error) -> Self {
        StorageError::InitializationError(err.to_string())
    }
}

impl ToSql for LnurlPayInfo {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>, rusqlite::Error> {
        let json = serde_json::to_string(self)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::Owned(Value::Text(json)))
    }
}

impl FromSql for LnurlPayInfo {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let json = value.as_str()?;
        serde_json::from_str(json).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for DepositClaimError {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>, rusqlite::Error> {
        let json = serde_json::to_string(self)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::Owned(Value::Text(json)))
    }
}

impl FromSql for DepositClaimError {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let json = value.as_str()?;
        serde_json::from_str(json).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
