//! Core types, storage traits and the transaction engine for ledgerd.
//!
//! Storage backends live in their own crates and implement
//! [`StorageBackend`]; the [`LedgerEngine`] only sees the
//! [`AccountStore`] and [`TransactionStore`] traits of an open unit of work.

pub mod engine;
pub mod error;
pub mod models;
pub mod storage;

pub use engine::LedgerEngine;
pub use error::LedgerError;
pub use models::{Account, AccountId, AccountRef, Operation, TransactionId};
pub use models::read::{AccountDetails, Movement, Transaction};
pub use models::write::{CreateAccountCommand, TransactionInput, TransactionRequest};
pub use storage::{AccountStore, LedgerSession, StorageBackend, StorageError, TransactionStore, UnitOfWork};
