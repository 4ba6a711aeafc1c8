pub mod api;
pub mod config;
pub mod service;
pub mod storage;

pub use ledgerd_core::{
    Account, AccountDetails, AccountId, CreateAccountCommand, LedgerError, Operation, Transaction,
    TransactionId, TransactionInput, TransactionRequest,
};
pub use service::LedgerService;
