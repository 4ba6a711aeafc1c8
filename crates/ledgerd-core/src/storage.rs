use std::str::FromStr;

use rust_decimal::Decimal;

use crate::models::{
    read::Transaction, write::{CreateAccountCommand, TransactionRequest}, Account, AccountId,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

/// Account rows. Every method runs inside whatever unit of work (or plain
/// session) the implementor represents.
pub trait AccountStore {
    fn account_must_exist(&mut self, id: AccountId) -> Result<(), StorageError>;
    fn account_name_exists(&mut self, name: &str) -> Result<bool, StorageError>;
    fn create_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError>;
    fn get_balance(&mut self, id: AccountId) -> Result<Decimal, StorageError>;
    /// Reads the balance and takes an exclusive lock on the account row that
    /// is held until the enclosing unit of work commits or rolls back.
    fn get_balance_for_update(&mut self, id: AccountId) -> Result<Decimal, StorageError>;
    fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<(), StorageError>;
    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError>;
}

/// Append-only transaction log.
pub trait TransactionStore {
    fn save_transaction(&mut self, request: &TransactionRequest) -> Result<Transaction, StorageError>;
    /// Newest first by creation time, ties broken by id.
    fn list_transactions(&mut self) -> Result<Vec<Transaction>, StorageError>;
    fn list_transactions_for_account(&mut self, id: AccountId) -> Result<Vec<Transaction>, StorageError>;
}

pub trait LedgerSession: AccountStore + TransactionStore {}

impl<T: AccountStore + TransactionStore + ?Sized> LedgerSession for T {}

/// A session whose writes become visible together on commit. Dropping an
/// unfinished unit of work rolls it back.
pub trait UnitOfWork: LedgerSession {
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

pub trait StorageBackend: Send + Sync {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError>;
    /// Autocommit session for read-only queries.
    fn session(&self) -> Result<Box<dyn LedgerSession + '_>, StorageError>;
}

pub fn parse_decimal(value: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(value).map_err(|e| StorageError::CorruptRow(format!("invalid decimal {:?}: {}", value, e)))
}
