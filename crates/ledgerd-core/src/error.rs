use rust_decimal::Decimal;
use thiserror::Error;

use crate::{
    models::{AccountId, Operation},
    storage::StorageError,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("account id is missing")]
    AccountIdMissing,
    #[error("{0} does not take a second account")]
    UnexpectedSecondAccount(Operation),
    #[error("not enough balance on account {account}: available {available}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        available: Decimal,
        requested: Decimal,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("cannot transfer from account {0} to itself")]
    SelfTransfer(AccountId),
    #[error("balance overflow on account {0}")]
    BalanceOverflow(AccountId),
    #[error("account already exists: {0}")]
    AccountNameTaken(String),
    #[error("initial balance must not be negative, got {0}")]
    NegativeInitialBalance(Decimal),
    #[error("account name must not be empty")]
    EmptyAccountName,
    #[error("persistence failure: {0}")]
    Persistence(StorageError),
}

impl LedgerError {
    /// True for failures caused by the request itself rather than the store.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, LedgerError::Persistence(_))
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AccountNotFound(id) => LedgerError::AccountNotFound(id),
            other => LedgerError::Persistence(other),
        }
    }
}
