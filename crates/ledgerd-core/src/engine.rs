use rust_decimal::Decimal;

use crate::{
    error::LedgerError,
    models::{read::Transaction, write::TransactionRequest, AccountId},
    storage::{AccountStore, TransactionStore},
};

/// Runs deposits, withdrawals and transfers against a store that is already
/// inside a unit of work. The engine never commits; on error the caller must
/// roll the unit of work back.
pub struct LedgerEngine<'s, S: ?Sized> {
    store: &'s mut S,
}

impl<'s, S> LedgerEngine<'s, S>
where
    S: AccountStore + TransactionStore + ?Sized,
{
    pub fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    pub fn execute(&mut self, request: &TransactionRequest) -> Result<Transaction, LedgerError> {
        if let Err(e) = self.validate(request) {
            tracing::debug!(operation = %request.operation(), error = %e, "Transaction rejected");
            return Err(e);
        }

        match *request {
            TransactionRequest::Deposit { account, amount } => self.deposit(account, amount)?,
            TransactionRequest::Withdrawal { account, amount } => self.withdraw(account, amount)?,
            TransactionRequest::Transfer { from, to, amount } => self.transfer(from, to, amount)?,
        }

        let transaction = self.store.save_transaction(request)?;
        tracing::debug!(
            transaction_id = %transaction.id,
            operation = %transaction.operation(),
            "Transaction recorded"
        );
        Ok(transaction)
    }

    pub fn list_transactions(&mut self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.list_transactions()?)
    }

    pub fn list_transactions_for_account(&mut self, account: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.list_transactions_for_account(account)?)
    }

    fn validate(&mut self, request: &TransactionRequest) -> Result<(), LedgerError> {
        let amount = request.amount();
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.store.account_must_exist(request.primary_account())?;

        if let Some(to) = request.counterparty() {
            if to == request.primary_account() {
                return Err(LedgerError::SelfTransfer(to));
            }
            self.store.account_must_exist(to)?;
        }

        Ok(())
    }

    fn deposit(&mut self, account: AccountId, amount: Decimal) -> Result<(), LedgerError> {
        let balance = self.store.get_balance_for_update(account)?;
        let updated = balance
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow(account))?;
        self.store.set_balance(account, updated)?;
        tracing::debug!(%account, %balance, %updated, "Deposit applied");
        Ok(())
    }

    fn withdraw(&mut self, account: AccountId, amount: Decimal) -> Result<(), LedgerError> {
        let balance = self.store.get_balance_for_update(account)?;
        if balance < amount {
            tracing::debug!(%account, available = %balance, requested = %amount, "Insufficient balance");
            return Err(LedgerError::InsufficientBalance {
                account,
                available: balance,
                requested: amount,
            });
        }
        self.store.set_balance(account, balance - amount)?;
        tracing::debug!(%account, %balance, updated = %(balance - amount), "Withdrawal applied");
        Ok(())
    }

    fn transfer(&mut self, from: AccountId, to: AccountId, amount: Decimal) -> Result<(), LedgerError> {
        // Lower id first, whichever side initiates, so opposing transfers
        // between the same pair queue on the same row instead of deadlocking.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        tracing::debug!(%first, %second, "Locking transfer accounts");
        let first_balance = self.store.get_balance_for_update(first)?;
        let second_balance = self.store.get_balance_for_update(second)?;

        let (from_balance, to_balance) = if first == from {
            (first_balance, second_balance)
        } else {
            (second_balance, first_balance)
        };

        if from_balance < amount {
            tracing::debug!(account = %from, available = %from_balance, requested = %amount, "Insufficient balance");
            return Err(LedgerError::InsufficientBalance {
                account: from,
                available: from_balance,
                requested: amount,
            });
        }
        let to_updated = to_balance
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow(to))?;

        self.store.set_balance(from, from_balance - amount)?;
        self.store.set_balance(to, to_updated)?;
        tracing::debug!(%from, %to, %amount, "Transfer applied");
        Ok(())
    }
}
