use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use ledgerd_core::{
    storage::parse_decimal, Account, AccountId, AccountRef, AccountStore, CreateAccountCommand,
    LedgerSession, Movement, StorageBackend, StorageError, Transaction, TransactionId,
    TransactionRequest, TransactionStore, UnitOfWork,
};

const TRANSACTION_COLUMNS: &str = "
    SELECT t.id, t.operation, t.amount, t.created_at, t.account1, a1.name, t.account2, a2.name
    FROM transactions t
    JOIN accounts a1 ON a1.id = t.account1
    LEFT JOIN accounts a2 ON a2.id = t.account2";

/// SQLite backend. All units of work share one connection, so they run one
/// after another; `BEGIN IMMEDIATE` additionally keeps other processes out of
/// the database file while a unit of work is open.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    unit_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::open(path, Duration::from_secs(5))
    }

    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(storage_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(storage_error)?;
        conn.busy_timeout(busy_timeout).map_err(storage_error)?;

        let storage = Self {
            conn: Mutex::new(conn),
            unit_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        tracing::debug!(path, "SQLite storage opened");
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                balance TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account1 INTEGER NOT NULL,
                account2 INTEGER,
                amount TEXT NOT NULL,
                operation TEXT NOT NULL
                    CHECK (operation IN ('deposit', 'withdrawal', 'transfer')),
                created_at INTEGER NOT NULL,
                FOREIGN KEY (account1) REFERENCES accounts(id),
                FOREIGN KEY (account2) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_account1
                ON transactions(account1);

            CREATE INDEX IF NOT EXISTS idx_transactions_account2
                ON transactions(account2);

            CREATE INDEX IF NOT EXISTS idx_transactions_created_at
                ON transactions(created_at);
            ",
        )
        .map_err(storage_error)?;
        Ok(())
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for SqliteStorage {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let conn = self.connection();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(storage_error)?;
        let unit_id = self.unit_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(unit_id, "SQLite transaction started");
        Ok(Box::new(SqliteSession {
            conn,
            unit_id,
            in_transaction: true,
        }))
    }

    fn session(&self) -> Result<Box<dyn LedgerSession + '_>, StorageError> {
        Ok(Box::new(SqliteSession {
            conn: self.connection(),
            unit_id: 0,
            in_transaction: false,
        }))
    }
}

pub struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
    unit_id: u64,
    in_transaction: bool,
}

impl<'a> SqliteSession<'a> {
    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::NoActiveTransaction);
        }
        self.in_transaction = false;
        self.conn.execute_batch(sql).map_err(storage_error)
    }

    fn query_transactions(&self, filter: Option<AccountId>) -> Result<Vec<Transaction>, StorageError> {
        let query = match filter {
            Some(_) => format!(
                "{} WHERE t.account1 = ?1 OR t.account2 = ?1 ORDER BY t.created_at DESC, t.id DESC",
                TRANSACTION_COLUMNS
            ),
            None => format!("{} ORDER BY t.created_at DESC, t.id DESC", TRANSACTION_COLUMNS),
        };

        let mut stmt = self.conn.prepare(&query).map_err(storage_error)?;

        let row_mapper = |row: &rusqlite::Row| -> rusqlite::Result<RawTransaction> {
            Ok(RawTransaction {
                id: row.get(0)?,
                operation: row.get(1)?,
                amount: row.get(2)?,
                created_at: row.get(3)?,
                account1: row.get(4)?,
                account1_name: row.get(5)?,
                account2: row.get(6)?,
                account2_name: row.get(7)?,
            })
        };

        let rows: Vec<RawTransaction> = match filter {
            Some(id) => stmt
                .query_map(params![id.0], row_mapper)
                .map_err(storage_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_error)?,
            None => stmt
                .query_map([], row_mapper)
                .map_err(storage_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_error)?,
        };

        rows.into_iter().map(RawTransaction::into_transaction).collect()
    }
}

struct RawTransaction {
    id: i64,
    operation: String,
    amount: String,
    created_at: i64,
    account1: i64,
    account1_name: String,
    account2: Option<i64>,
    account2_name: Option<String>,
}

impl RawTransaction {
    fn into_transaction(self) -> Result<Transaction, StorageError> {
        let account1 = AccountRef::named(AccountId(self.account1), self.account1_name);
        let account2 = self.account2.map(|id| AccountRef {
            id: AccountId(id),
            name: self.account2_name,
        });
        Ok(Transaction {
            id: TransactionId(self.id),
            movement: Movement::from_columns(&self.operation, account1, account2)?,
            amount: parse_decimal(&self.amount)?,
            created_at: nanos_to_datetime(self.created_at)?,
        })
    }
}

impl<'a> AccountStore for SqliteSession<'a> {
    fn account_must_exist(&mut self, id: AccountId) -> Result<(), StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts WHERE id = ?1", params![id.0], |row| row.get(0))
            .map_err(storage_error)?;
        if count == 0 {
            return Err(StorageError::AccountNotFound(id));
        }
        Ok(())
    }

    fn account_name_exists(&mut self, name: &str) -> Result<bool, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts WHERE name = ?1", params![name], |row| row.get(0))
            .map_err(storage_error)?;
        Ok(count > 0)
    }

    fn create_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        self.conn
            .execute(
                "INSERT INTO accounts (name, balance) VALUES (?1, ?2)",
                params![command.name, command.balance.to_string()],
            )
            .map_err(storage_error)?;
        Ok(Account {
            id: AccountId(self.conn.last_insert_rowid()),
            name: command.name.clone(),
            balance: command.balance,
        })
    }

    fn get_balance(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        let balance: Option<String> = self
            .conn
            .query_row("SELECT balance FROM accounts WHERE id = ?1", params![id.0], |row| row.get(0))
            .optional()
            .map_err(storage_error)?;
        match balance {
            Some(balance) => parse_decimal(&balance),
            None => Err(StorageError::AccountNotFound(id)),
        }
    }

    fn get_balance_for_update(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        // The open BEGIN IMMEDIATE already holds the database write lock.
        if !self.in_transaction {
            return Err(StorageError::NoActiveTransaction);
        }
        self.get_balance(id)
    }

    fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<(), StorageError> {
        let updated = self
            .conn
            .execute(
                "UPDATE accounts SET balance = ?1 WHERE id = ?2",
                params![balance.to_string(), id.0],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(StorageError::AccountNotFound(id));
        }
        Ok(())
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        let row: Option<(i64, String, String)> = self
            .conn
            .query_row(
                "SELECT id, name, balance FROM accounts WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage_error)?;
        let (id, name, balance) = row.ok_or(StorageError::AccountNotFound(id))?;
        Ok(Account {
            id: AccountId(id),
            name,
            balance: parse_decimal(&balance)?,
        })
    }
}

impl<'a> TransactionStore for SqliteSession<'a> {
    fn save_transaction(&mut self, request: &TransactionRequest) -> Result<Transaction, StorageError> {
        let account1 = request.primary_account();
        let account2 = request.counterparty();
        let now = datetime_to_nanos(OffsetDateTime::now_utc());

        let (id, created_at): (i64, i64) = self
            .conn
            .query_row(
                "INSERT INTO transactions (account1, account2, amount, operation, created_at)
                 VALUES (?1, ?2, ?3, ?4, MAX(?5, (SELECT COALESCE(MAX(created_at), 0) FROM transactions)))
                 RETURNING id, created_at",
                params![
                    account1.0,
                    account2.map(|a| a.0),
                    request.amount().to_string(),
                    request.operation().as_str(),
                    now
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(storage_error)?;

        Ok(Transaction {
            id: TransactionId(id),
            movement: Movement::from_columns(
                request.operation().as_str(),
                AccountRef::new(account1),
                account2.map(AccountRef::new),
            )?,
            amount: request.amount(),
            created_at: nanos_to_datetime(created_at)?,
        })
    }

    fn list_transactions(&mut self) -> Result<Vec<Transaction>, StorageError> {
        self.query_transactions(None)
    }

    fn list_transactions_for_account(&mut self, id: AccountId) -> Result<Vec<Transaction>, StorageError> {
        self.query_transactions(Some(id))
    }
}

impl<'a> UnitOfWork for SqliteSession<'a> {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::debug!(unit_id = self.unit_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(unit_id = self.unit_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl<'a> Drop for SqliteSession<'a> {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.finish("ROLLBACK") {
                tracing::warn!(unit_id = self.unit_id, error = %e, "SQLite rollback on drop failed");
            }
        }
    }
}

fn storage_error(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StorageError::UniqueViolation(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked =>
        {
            StorageError::LockTimeout(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn datetime_to_nanos(dt: OffsetDateTime) -> i64 {
    dt.unix_timestamp_nanos() as i64
}

fn nanos_to_datetime(nanos: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .map_err(|e| StorageError::CorruptRow(format!("invalid created_at {}: {}", nanos, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create(storage: &SqliteStorage, name: &str, balance: Decimal) -> AccountId {
        let mut uow = storage.begin().unwrap();
        let account = uow
            .create_account(&CreateAccountCommand { name: name.to_string(), balance })
            .unwrap();
        uow.commit().unwrap();
        account.id
    }

    #[test]
    fn test_sqlite_basic_operations() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let bank = create(&storage, "bank", dec!(100.25));

        let mut session = storage.session().unwrap();
        session.account_must_exist(bank).unwrap();
        assert!(session.account_name_exists("bank").unwrap());
        assert!(!session.account_name_exists("vault").unwrap());

        let account = session.get_account(bank).unwrap();
        assert_eq!(account.name, "bank");
        assert_eq!(account.balance, dec!(100.25));

        assert!(matches!(
            session.get_account(AccountId(999)),
            Err(StorageError::AccountNotFound(AccountId(999)))
        ));
        assert!(matches!(
            session.get_balance_for_update(bank),
            Err(StorageError::NoActiveTransaction)
        ));
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let bank = create(&storage, "bank", dec!(100));

        let mut uow = storage.begin().unwrap();
        assert_eq!(uow.get_balance_for_update(bank).unwrap(), dec!(100));
        uow.set_balance(bank, dec!(40)).unwrap();
        uow.save_transaction(&TransactionRequest::Withdrawal { account: bank, amount: dec!(60) })
            .unwrap();
        uow.rollback().unwrap();

        let mut session = storage.session().unwrap();
        assert_eq!(session.get_balance(bank).unwrap(), dec!(100), "Balance should be unchanged after rollback");
        assert!(session.list_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_drop_rolls_back() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let bank = create(&storage, "bank", dec!(10));

        {
            let mut uow = storage.begin().unwrap();
            uow.set_balance(bank, dec!(0)).unwrap();
        }

        let mut session = storage.session().unwrap();
        assert_eq!(session.get_balance(bank).unwrap(), dec!(10));
    }

    #[test]
    fn test_sqlite_unique_name() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        create(&storage, "bank", dec!(0));

        let mut uow = storage.begin().unwrap();
        let result = uow.create_account(&CreateAccountCommand { name: "bank".to_string(), balance: dec!(5) });
        assert!(matches!(result, Err(StorageError::UniqueViolation(_))));
    }

    #[test]
    fn test_sqlite_transactions_newest_first() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let alice = create(&storage, "alice", dec!(100));
        let bob = create(&storage, "bob", dec!(0));

        let mut uow = storage.begin().unwrap();
        let first = uow
            .save_transaction(&TransactionRequest::Transfer { from: alice, to: bob, amount: dec!(10) })
            .unwrap();
        let second = uow
            .save_transaction(&TransactionRequest::Deposit { account: alice, amount: dec!(5) })
            .unwrap();
        assert!(second.created_at >= first.created_at);
        uow.commit().unwrap();

        let mut session = storage.session().unwrap();
        let all = session.list_transactions().unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let for_bob = session.list_transactions_for_account(bob).unwrap();
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].movement.account1().name.as_deref(), Some("alice"));
        assert_eq!(for_bob[0].movement.account2().and_then(|a| a.name.as_deref()), Some("bob"));
        assert_eq!(for_bob[0].amount, dec!(10));
    }
}
