use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use postgres::{error::SqlState, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use ledgerd_core::{
    storage::parse_decimal, Account, AccountId, AccountRef, AccountStore, CreateAccountCommand,
    LedgerSession, Movement, StorageBackend, StorageError, Transaction, TransactionId,
    TransactionRequest, TransactionStore, UnitOfWork,
};

pub use postgres::Config;

type Manager = PostgresConnectionManager<NoTls>;

const TRANSACTION_COLUMNS: &str = "
    SELECT t.id, t.operation, t.amount::TEXT, t.created_at,
           t.account1, a1.name, t.account2, a2.name
    FROM transactions t
    JOIN accounts a1 ON a1.id = t.account1
    LEFT JOIN accounts a2 ON a2.id = t.account2";

/// Isolation for units of work. Under `REPEATABLE READ` and `SERIALIZABLE`
/// a `FOR UPDATE` that waited on a concurrent commit fails with SQLSTATE
/// 40001, which surfaces as `StorageError::Conflict` and is not retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], " ").as_str() {
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub isolation: IsolationLevel,
    pub lock_timeout: Duration,
    /// Upper bound on open connections. Callers beyond it wait up to
    /// `connection_timeout` and then fail.
    pub max_connections: u32,
    pub connection_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            lock_timeout: Duration::from_secs(5),
            max_connections: 16,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// PostgreSQL backend. Each unit of work checks out its own pooled
/// connection, so units run concurrently and row locks
/// (`SELECT ... FOR UPDATE`) arbitrate.
pub struct PostgresStorage {
    pool: Pool<Manager>,
    options: PostgresOptions,
    unit_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        let config = Config::from_str(connection_string)
            .map_err(|e| StorageError::Other(format!("invalid PostgreSQL connection string: {}", e)))?;
        Self::connect(config, PostgresOptions::default())
    }

    pub fn connect(config: Config, options: PostgresOptions) -> Result<Self, StorageError> {
        if options.max_connections == 0 {
            return Err(StorageError::Other("max_connections must be at least 1".to_string()));
        }
        if options.connection_timeout.is_zero() {
            return Err(StorageError::Other("connection_timeout must be positive".to_string()));
        }

        let pool = Pool::builder()
            .max_size(options.max_connections)
            .min_idle(Some(1))
            .connection_timeout(options.connection_timeout)
            .build(PostgresConnectionManager::new(config, NoTls))
            .map_err(pool_error)?;

        let storage = Self {
            pool,
            options,
            unit_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        tracing::debug!(
            isolation = %storage.options.isolation,
            max_connections = storage.options.max_connections,
            "PostgreSQL storage opened"
        );
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.checkout()?
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                balance NUMERIC NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id BIGSERIAL PRIMARY KEY,
                account1 BIGINT NOT NULL REFERENCES accounts(id),
                account2 BIGINT REFERENCES accounts(id),
                amount NUMERIC NOT NULL,
                operation TEXT NOT NULL
                    CHECK (operation IN ('deposit', 'withdrawal', 'transfer')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_transactions_account1
                ON transactions(account1);

            CREATE INDEX IF NOT EXISTS idx_pg_transactions_account2
                ON transactions(account2);

            CREATE INDEX IF NOT EXISTS idx_pg_transactions_created_at
                ON transactions(created_at);
            ",
            )
            .map_err(storage_error)?;
        Ok(())
    }

    fn checkout(&self) -> Result<PooledConnection<Manager>, StorageError> {
        self.pool.get().map_err(pool_error)
    }
}

impl StorageBackend for PostgresStorage {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let mut conn = self.checkout()?;
        let start = format!(
            "BEGIN ISOLATION LEVEL {}; SET LOCAL lock_timeout = '{}ms';",
            self.options.isolation.as_sql(),
            self.options.lock_timeout.as_millis()
        );
        if let Err(e) = conn.batch_execute(&start) {
            // Leaves no transaction open if SET LOCAL failed after BEGIN.
            let _ = conn.batch_execute("ROLLBACK");
            return Err(storage_error(e));
        }
        let unit_id = self.unit_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(unit_id, "PostgreSQL transaction started");
        Ok(Box::new(PostgresSession {
            conn,
            unit_id,
            in_transaction: true,
        }))
    }

    fn session(&self) -> Result<Box<dyn LedgerSession + '_>, StorageError> {
        Ok(Box::new(PostgresSession {
            conn: self.checkout()?,
            unit_id: 0,
            in_transaction: false,
        }))
    }
}

/// A pooled connection, optionally inside a transaction. The connection goes
/// back to the pool when the session is dropped.
pub struct PostgresSession {
    conn: PooledConnection<Manager>,
    unit_id: u64,
    in_transaction: bool,
}

impl PostgresSession {
    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::NoActiveTransaction);
        }
        self.in_transaction = false;
        self.conn.batch_execute(sql).map_err(storage_error)
    }

    fn query_transactions(&mut self, filter: Option<AccountId>) -> Result<Vec<Transaction>, StorageError> {
        let rows = match filter {
            Some(id) => self.conn.query(
                &format!(
                    "{} WHERE t.account1 = $1 OR t.account2 = $1 ORDER BY t.created_at DESC, t.id DESC",
                    TRANSACTION_COLUMNS
                ),
                &[&id.0],
            ),
            None => self.conn.query(
                &format!("{} ORDER BY t.created_at DESC, t.id DESC", TRANSACTION_COLUMNS),
                &[],
            ),
        }
        .map_err(storage_error)?;

        rows.iter().map(row_to_transaction).collect()
    }
}

fn row_to_transaction(row: &Row) -> Result<Transaction, StorageError> {
    let operation: String = row.get(1);
    let amount: String = row.get(2);
    let account1 = AccountRef::named(AccountId(row.get(4)), row.get::<_, String>(5));
    let account2 = row.get::<_, Option<i64>>(6).map(|id| AccountRef {
        id: AccountId(id),
        name: row.get(7),
    });
    Ok(Transaction {
        id: TransactionId(row.get(0)),
        movement: Movement::from_columns(&operation, account1, account2)?,
        amount: parse_decimal(&amount)?,
        created_at: row.get::<_, OffsetDateTime>(3),
    })
}

impl AccountStore for PostgresSession {
    fn account_must_exist(&mut self, id: AccountId) -> Result<(), StorageError> {
        let row = self
            .conn
            .query_opt("SELECT 1 FROM accounts WHERE id = $1", &[&id.0])
            .map_err(storage_error)?;
        row.map(|_| ()).ok_or(StorageError::AccountNotFound(id))
    }

    fn account_name_exists(&mut self, name: &str) -> Result<bool, StorageError> {
        let row = self
            .conn
            .query_one("SELECT EXISTS (SELECT 1 FROM accounts WHERE name = $1)", &[&name])
            .map_err(storage_error)?;
        Ok(row.get(0))
    }

    fn create_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        let row = self
            .conn
            .query_one(
                "INSERT INTO accounts (name, balance) VALUES ($1, $2::TEXT::NUMERIC) RETURNING id",
                &[&command.name, &command.balance.to_string()],
            )
            .map_err(storage_error)?;
        Ok(Account {
            id: AccountId(row.get(0)),
            name: command.name.clone(),
            balance: command.balance,
        })
    }

    fn get_balance(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        let row = self
            .conn
            .query_opt("SELECT balance::TEXT FROM accounts WHERE id = $1", &[&id.0])
            .map_err(storage_error)?
            .ok_or(StorageError::AccountNotFound(id))?;
        parse_decimal(row.get(0))
    }

    fn get_balance_for_update(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        if !self.in_transaction {
            return Err(StorageError::NoActiveTransaction);
        }
        let row = self
            .conn
            .query_opt("SELECT balance::TEXT FROM accounts WHERE id = $1 FOR UPDATE", &[&id.0])
            .map_err(storage_error)?
            .ok_or(StorageError::AccountNotFound(id))?;
        parse_decimal(row.get(0))
    }

    fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<(), StorageError> {
        let updated = self
            .conn
            .execute(
                "UPDATE accounts SET balance = $1::TEXT::NUMERIC WHERE id = $2",
                &[&balance.to_string(), &id.0],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(StorageError::AccountNotFound(id));
        }
        Ok(())
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        let row = self
            .conn
            .query_opt("SELECT id, name, balance::TEXT FROM accounts WHERE id = $1", &[&id.0])
            .map_err(storage_error)?
            .ok_or(StorageError::AccountNotFound(id))?;
        Ok(Account {
            id: AccountId(row.get(0)),
            name: row.get(1),
            balance: parse_decimal(row.get(2))?,
        })
    }
}

impl TransactionStore for PostgresSession {
    fn save_transaction(&mut self, request: &TransactionRequest) -> Result<Transaction, StorageError> {
        let account1 = request.primary_account();
        let account2 = request.counterparty();
        let row = self
            .conn
            .query_one(
                "INSERT INTO transactions (account1, account2, amount, operation)
                 VALUES ($1, $2, $3::TEXT::NUMERIC, $4)
                 RETURNING id, created_at",
                &[
                    &account1.0,
                    &account2.map(|a| a.0),
                    &request.amount().to_string(),
                    &request.operation().as_str(),
                ],
            )
            .map_err(storage_error)?;

        Ok(Transaction {
            id: TransactionId(row.get(0)),
            movement: Movement::from_columns(
                request.operation().as_str(),
                AccountRef::new(account1),
                account2.map(AccountRef::new),
            )?,
            amount: request.amount(),
            created_at: row.get(1),
        })
    }

    fn list_transactions(&mut self) -> Result<Vec<Transaction>, StorageError> {
        self.query_transactions(None)
    }

    fn list_transactions_for_account(&mut self, id: AccountId) -> Result<Vec<Transaction>, StorageError> {
        self.query_transactions(Some(id))
    }
}

impl UnitOfWork for PostgresSession {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::debug!(unit_id = self.unit_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(unit_id = self.unit_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.finish("ROLLBACK") {
                tracing::warn!(unit_id = self.unit_id, error = %e, "PostgreSQL rollback on drop failed");
            }
        }
    }
}

fn storage_error(e: postgres::Error) -> StorageError {
    let message = describe(&e);
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => StorageError::UniqueViolation(message),
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => StorageError::LockTimeout(message),
        Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE || *code == SqlState::T_R_DEADLOCK_DETECTED => {
            StorageError::Conflict(message)
        }
        _ => StorageError::Other(message),
    }
}

/// Renders server errors as `SEVERITY CODE: message (detail)`.
fn describe(e: &postgres::Error) -> String {
    if let Some(db) = e.as_db_error() {
        let mut message = format!("{} {}: {}", db.severity(), db.code().code(), db.message());
        if let Some(detail) = db.detail() {
            message.push_str(&format!(" ({})", detail));
        }
        return message;
    }
    match std::error::Error::source(e) {
        Some(source) => format!("{}: {}", e, source),
        None => e.to_string(),
    }
}

fn pool_error(e: r2d2::Error) -> StorageError {
    StorageError::Other(format!("no PostgreSQL connection available: {}", e))
}
