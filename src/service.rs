use std::{sync::Arc, time::Instant};

use ledgerd_core::{
    Account, AccountDetails, AccountId, CreateAccountCommand, LedgerEngine, LedgerError, Transaction,
    TransactionRequest,
};
use rust_decimal::Decimal;

use crate::storage::{AccountStore, StorageBackend, StorageError, TransactionStore, UnitOfWork};

/// Entry point for everything that reads or changes the ledger. Each write
/// runs in its own unit of work that is committed on success and rolled
/// back on any error.
#[derive(Clone)]
pub struct LedgerService {
    storage: Arc<dyn StorageBackend>,
}

impl LedgerService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn create_account(&self, command: CreateAccountCommand) -> Result<Account, LedgerError> {
        let name = command.name.trim().to_string();
        if name.is_empty() {
            return Err(LedgerError::EmptyAccountName);
        }
        if command.balance < Decimal::ZERO {
            return Err(LedgerError::NegativeInitialBalance(command.balance));
        }
        let command = CreateAccountCommand { name, balance: command.balance };

        let account = self.in_unit_of_work("create_account", |uow| {
            if uow.account_name_exists(&command.name)? {
                return Err(LedgerError::AccountNameTaken(command.name.clone()));
            }
            // A concurrent insert can still win between the check and ours.
            uow.create_account(&command).map_err(|e| match e {
                StorageError::UniqueViolation(_) => LedgerError::AccountNameTaken(command.name.clone()),
                other => other.into(),
            })
        })?;

        tracing::info!(account_id = %account.id, name = %account.name, "Account created");
        Ok(account)
    }

    pub fn get_account(&self, id: AccountId) -> Result<AccountDetails, LedgerError> {
        let mut session = self.storage.session()?;
        let account = session.get_account(id)?;
        let transactions = session.list_transactions_for_account(id)?;
        Ok(AccountDetails { account, transactions })
    }

    pub fn execute(&self, request: TransactionRequest) -> Result<Transaction, LedgerError> {
        let operation = request.operation().as_str();
        let started = Instant::now();

        let result = self.in_unit_of_work(operation, |uow| LedgerEngine::new(uow).execute(&request));

        metrics::histogram!(
            "ledgerd_transaction_duration_seconds",
            started.elapsed().as_secs_f64(),
            "operation" => operation
        );
        match &result {
            Ok(transaction) => {
                metrics::increment_counter!("ledgerd_transactions_total", "operation" => operation, "outcome" => "ok");
                tracing::info!(
                    transaction_id = %transaction.id,
                    operation,
                    amount = %transaction.amount,
                    "Transaction committed"
                );
            }
            Err(e) => {
                let outcome = if e.is_client_error() { "rejected" } else { "failed" };
                metrics::increment_counter!("ledgerd_transactions_total", "operation" => operation, "outcome" => outcome);
            }
        }
        result
    }

    pub fn list_transactions(&self) -> Result<Vec<Transaction>, LedgerError> {
        let mut session = self.storage.session()?;
        LedgerEngine::new(session.as_mut()).list_transactions()
    }

    pub fn list_transactions_for_account(&self, id: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        let mut session = self.storage.session()?;
        LedgerEngine::new(session.as_mut()).list_transactions_for_account(id)
    }

    fn in_unit_of_work<T, F>(&self, operation: &'static str, work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        let mut uow = self.storage.begin()?;
        match work(uow.as_mut()) {
            Ok(value) => {
                uow.commit().map_err(|e| {
                    tracing::error!(operation, error = %e, "Commit failed");
                    LedgerError::from(e)
                })?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = uow.rollback() {
                    tracing::warn!(operation, error = %rollback, "Rollback failed");
                }
                if e.is_client_error() {
                    tracing::debug!(operation, error = %e, "Operation rejected");
                } else {
                    tracing::error!(operation, error = %e, "Operation failed");
                }
                Err(e)
            }
        }
    }
}
