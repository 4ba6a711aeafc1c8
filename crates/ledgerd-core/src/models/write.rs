use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::LedgerError;

use super::{AccountId, Operation};

/// Transaction request as it arrives over the wire: an operation tag plus an
/// optional second account that only transfers may carry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionInput {
    pub operation: Operation,
    pub account1: AccountId,
    #[serde(default)]
    pub account2: Option<AccountId>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRequest {
    Deposit { account: AccountId, amount: Decimal },
    Withdrawal { account: AccountId, amount: Decimal },
    Transfer { from: AccountId, to: AccountId, amount: Decimal },
}

impl TransactionRequest {
    pub fn operation(&self) -> Operation {
        match self {
            TransactionRequest::Deposit { .. } => Operation::Deposit,
            TransactionRequest::Withdrawal { .. } => Operation::Withdrawal,
            TransactionRequest::Transfer { .. } => Operation::Transfer,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            TransactionRequest::Deposit { amount, .. }
            | TransactionRequest::Withdrawal { amount, .. }
            | TransactionRequest::Transfer { amount, .. } => *amount,
        }
    }

    /// Recipient of a deposit, source of a withdrawal, sender of a transfer.
    pub fn primary_account(&self) -> AccountId {
        match self {
            TransactionRequest::Deposit { account, .. }
            | TransactionRequest::Withdrawal { account, .. } => *account,
            TransactionRequest::Transfer { from, .. } => *from,
        }
    }

    pub fn counterparty(&self) -> Option<AccountId> {
        match self {
            TransactionRequest::Transfer { to, .. } => Some(*to),
            _ => None,
        }
    }
}

impl TryFrom<TransactionInput> for TransactionRequest {
    type Error = LedgerError;

    fn try_from(input: TransactionInput) -> Result<Self, Self::Error> {
        match (input.operation, input.account2) {
            (Operation::Deposit, None) => Ok(TransactionRequest::Deposit {
                account: input.account1,
                amount: input.amount,
            }),
            (Operation::Withdrawal, None) => Ok(TransactionRequest::Withdrawal {
                account: input.account1,
                amount: input.amount,
            }),
            (Operation::Transfer, Some(to)) => Ok(TransactionRequest::Transfer {
                from: input.account1,
                to,
                amount: input.amount,
            }),
            (Operation::Transfer, None) => Err(LedgerError::AccountIdMissing),
            (operation, Some(_)) => Err(LedgerError::UnexpectedSecondAccount(operation)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateAccountCommand {
    pub name: String,
    #[serde(default)]
    pub balance: Decimal,
}
