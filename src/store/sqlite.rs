//! SQLite implementation of TransactionStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::domain::{Transaction, TransactionStatus};
use crate::ports::{StoreError, StoreResult, TransactionStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    amount INTEGER NOT NULL,
    currency TEXT NOT NULL,
    product_id TEXT NOT NULL,
    seller_id TEXT NOT NULL,
    buyer_id TEXT NOT NULL,
    is_digital INTEGER NOT NULL,
    handoff_code TEXT NOT NULL,
    status TEXT NOT NULL,
    payment_method_id TEXT,
    created_at TEXT NOT NULL,
    confirmed_at TEXT,
    handoff_verified_at TEXT
)
"#;

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    amount: i64,
    currency: String,
    product_id: String,
    seller_id: String,
    buyer_id: String,
    is_digital: bool,
    handoff_code: String,
    status: String,
    payment_method_id: Option<String>,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    handoff_verified_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        let status = self
            .status
            .parse::<TransactionStatus>()
            .map_err(StoreError::Corrupt)?;
        Ok(Transaction {
            id: self.id,
            amount: self.amount,
            currency: self.currency,
            product_id: self.product_id,
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            is_digital: self.is_digital,
            handoff_code: self.handoff_code,
            status,
            payment_method_id: self.payment_method_id,
            created_at: self.created_at,
            confirmed_at: self.confirmed_at,
            handoff_verified_at: self.handoff_verified_at,
        })
    }
}

/// SQLite-backed transaction store.
#[derive(Clone)]
pub struct SqliteTransactionStore {
    pool: SqlitePool,
}

impl SqliteTransactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `database_url` and ensures
    /// the schema exists.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for SqliteTransactionStore {
    async fn put(&self, tx: &Transaction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, amount, currency, product_id, seller_id, buyer_id,
                is_digital, handoff_code, status, payment_method_id,
                created_at, confirmed_at, handoff_verified_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(&tx.product_id)
        .bind(&tx.seller_id)
        .bind(&tx.buyer_id)
        .bind(tx.is_digital)
        .bind(&tx.handoff_code)
        .bind(tx.status.as_str())
        .bind(&tx.payment_method_id)
        .bind(tx.created_at)
        .bind(tx.confirmed_at)
        .bind(tx.handoff_verified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn update_if_status(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> StoreResult<bool> {
        // Conditional write on the prior status; a concurrent transition
        // makes this a no-op rather than a double-applied transition.
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = ?1,
                payment_method_id = ?2,
                confirmed_at = ?3,
                handoff_verified_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(tx.status.as_str())
        .bind(&tx.payment_method_id)
        .bind(tx.confirmed_at)
        .bind(tx.handoff_verified_at)
        .bind(&tx.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
