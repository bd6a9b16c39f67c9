use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, AccountStatus, Cents, NewTransaction, Transaction, TransactionId,
    TransactionType, ledger_now,
};

use super::locks::AccountLocks;
use super::{LedgerStore, MIGRATION_001_INITIAL, UnitOfWork};

const ACCOUNT_COLUMNS: &str =
    "id, balance, initial_balance, status, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, amount, type, timestamp, resulting_balance";

/// SQLite-backed ledger store.
///
/// Exclusivity is per account: a unit holds an in-process lock on its account
/// and only opens a database transaction for its final writes. Those writes
/// are guarded by the row's `version`, so a change made through another
/// process between the read and the write fails the unit instead of being
/// overwritten.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    locks: AccountLocks,
}

impl SqliteStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: AccountLocks::default(),
        }
    }

    /// Connect to an existing database.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        Self::open(config, false).await
    }

    /// Initialize a database (create if missing, then migrate).
    pub async fn init(config: &LedgerConfig) -> Result<Self> {
        let store = Self::open(config, true).await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn open(config: &LedgerConfig, create_if_missing: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("Invalid database URL: {}", config.database_url))?
            .create_if_missing(create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!(url = %config.database_url, "connected to ledger database");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// The underlying pool, for maintenance and fault-injection in tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_account(row: &SqliteRow) -> Result<Account> {
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Account {
            id: AccountId(row.get("id")),
            balance: row.get("balance"),
            initial_balance: row.get("initial_balance"),
            status: AccountStatus::from_str(&status_str)
                .ok_or_else(|| anyhow!("Invalid account status: {}", status_str))?,
            version: row.get("version"),
            created_at: decode_timestamp(&created_at_str).context("Invalid created_at")?,
            updated_at: decode_timestamp(&updated_at_str).context("Invalid updated_at")?,
        })
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
        let kind_str: String = row.get("type");
        let timestamp_str: String = row.get("timestamp");

        Ok(Transaction {
            id: TransactionId(row.get("id")),
            account_id: AccountId(row.get("account_id")),
            amount: row.get("amount"),
            kind: TransactionType::from_str(&kind_str)
                .ok_or_else(|| anyhow!("Invalid transaction type: {}", kind_str))?,
            timestamp: decode_timestamp(&timestamp_str).context("Invalid timestamp")?,
            resulting_balance: row.get("resulting_balance"),
        })
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so that text order is time order.
fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[async_trait]
impl LedgerStore for SqliteStore {
    type Unit = SqliteUnit;

    async fn create_account(&self, initial_balance: Cents) -> Result<Account> {
        let at = encode_timestamp(ledger_now());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO accounts (balance, initial_balance, status, version, created_at, updated_at)
            VALUES (?, ?, 'active', 0, ?, ?)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(initial_balance)
        .bind(initial_balance)
        .bind(&at)
        .bind(&at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to save account")?;

        Self::row_to_account(&row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn list_transactions(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE account_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(account_id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn begin(&self) -> Result<SqliteUnit> {
        Ok(SqliteUnit {
            pool: self.pool.clone(),
            locks: self.locks.clone(),
            tx: None,
            guard: None,
            held: None,
            stamp: None,
        })
    }
}

/// The account a unit holds, as read under its lock.
struct Held {
    account: Account,
    /// Version the next guarded write must find on the row.
    version: i64,
}

/// A unit of work over a [`SqliteStore`].
///
/// Reads happen under the account lock without a database transaction. The
/// first write opens one and claims the row; dropping the unit without a
/// commit rolls that transaction back and releases the lock.
pub struct SqliteUnit {
    pool: SqlitePool,
    locks: AccountLocks,
    /// Declared before `guard` so a dropped unit rolls back before it
    /// releases the account.
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    guard: Option<OwnedMutexGuard<()>>,
    held: Option<Held>,
    /// Timestamp shared by every write in this unit, fixed on first use.
    stamp: Option<DateTime<Utc>>,
}

impl SqliteUnit {
    fn held(&self, id: AccountId) -> Result<&Held> {
        match &self.held {
            Some(held) if held.account.id == id => Ok(held),
            _ => bail!("Account {} is not held by this unit of work", id),
        }
    }

    fn stamp(&mut self, id: AccountId) -> Result<DateTime<Utc>> {
        if let Some(at) = self.stamp {
            return Ok(at);
        }
        let at = self.held(id)?.account.next_timestamp(ledger_now());
        self.stamp = Some(at);
        Ok(at)
    }

    /// The unit's write transaction, opened on first use, and the version
    /// the row carries inside it.
    ///
    /// Opening starts with a write so SQLite's write lock is taken up front,
    /// with the busy timeout applying while it waits. The claim only matches
    /// if the row still has the version read under the account lock.
    async fn write_tx(
        &mut self,
        id: AccountId,
    ) -> Result<(i64, &mut sqlx::Transaction<'static, Sqlite>)> {
        let read_version = self.held(id)?.version;

        if self.tx.is_none() {
            let mut tx = self
                .pool
                .begin()
                .await
                .context("Failed to begin unit of work")?;

            let claimed = sqlx::query(
                "UPDATE accounts SET version = version + 1 WHERE id = ? AND version = ?",
            )
            .bind(id.0)
            .bind(read_version)
            .execute(&mut *tx)
            .await
            .context("Failed to claim account")?;

            if claimed.rows_affected() != 1 {
                bail!("Account {} changed outside this unit of work", id);
            }

            self.tx = Some(tx);
            if let Some(held) = self.held.as_mut() {
                held.version = read_version + 1;
            }
        }

        let version = self.held(id)?.version;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| anyhow!("Unit of work has no open transaction"))?;
        Ok((version, tx))
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnit {
    async fn acquire_for_update(&mut self, id: AccountId) -> Result<Option<Account>> {
        if let Some(held) = &self.held {
            bail!("Unit of work already holds account {}", held.account.id);
        }

        let guard = self.locks.lock(id).await?;

        // Read the authoritative row only once the lock is held.
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to acquire account")?;

        let Some(row) = row else {
            drop(guard);
            self.locks.release_unused(id)?;
            return Ok(None);
        };
        let account = SqliteStore::row_to_account(&row)?;

        self.guard = Some(guard);
        self.held = Some(Held {
            version: account.version,
            account: account.clone(),
        });
        Ok(Some(account))
    }

    async fn replay_entries(&mut self, account_id: AccountId) -> Result<Vec<Transaction>> {
        self.held(account_id)?;

        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE account_id = ?
            ORDER BY timestamp, id
            "#
        );
        let rows = match self.tx.as_mut() {
            Some(tx) => {
                sqlx::query(&query)
                    .bind(account_id.0)
                    .fetch_all(&mut **tx)
                    .await
            }
            None => {
                sqlx::query(&query)
                    .bind(account_id.0)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to load ledger entries")?;

        rows.iter().map(SqliteStore::row_to_transaction).collect()
    }

    async fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction> {
        let at = self.stamp(entry.account_id)?;
        let (_, tx) = self.write_tx(entry.account_id).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO transactions (account_id, amount, type, timestamp, resulting_balance)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(entry.account_id.0)
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(encode_timestamp(at))
        .bind(entry.resulting_balance)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to save transaction")?;

        Ok(entry.into_transaction(TransactionId(row.get("id")), at))
    }

    async fn update_balance(&mut self, id: AccountId, balance: Cents) -> Result<()> {
        let at = self.stamp(id)?;
        let (version, tx) = self.write_tx(id).await?;

        let result = sqlx::query(
            "UPDATE accounts SET balance = ?, updated_at = ? WHERE id = ? AND version = ?",
        )
        .bind(balance)
        .bind(encode_timestamp(at))
        .bind(id.0)
        .bind(version)
        .execute(&mut **tx)
        .await
        .context("Failed to update account balance")?;

        if result.rows_affected() != 1 {
            bail!("Account {} changed while held by this unit of work", id);
        }
        Ok(())
    }

    async fn set_status(&mut self, id: AccountId, status: AccountStatus) -> Result<Account> {
        let at = self.stamp(id)?;
        let (version, tx) = self.write_tx(id).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts
            SET status = ?, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(encode_timestamp(at))
        .bind(id.0)
        .bind(version)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to update account status")?;

        match row {
            Some(row) => SqliteStore::row_to_account(&row),
            None => bail!("Account {} changed while held by this unit of work", id),
        }
    }

    async fn commit(self) -> Result<()> {
        if let Some(tx) = self.tx {
            tx.commit().await.context("Failed to commit unit of work")?;
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        if let Some(tx) = self.tx {
            tx.rollback()
                .await
                .context("Failed to roll back unit of work")?;
        }
        Ok(())
    }
}
