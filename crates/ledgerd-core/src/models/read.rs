use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use time::OffsetDateTime;

use crate::storage::StorageError;

use super::{Account, AccountId, AccountRef, Operation, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Movement {
    Deposit { account: AccountRef },
    Withdrawal { account: AccountRef },
    Transfer { from: AccountRef, to: AccountRef },
}

impl Movement {
    /// Rebuilds a movement from its stored columns, rejecting rows whose
    /// second account does not match the operation.
    pub fn from_columns(
        operation: &str,
        account1: AccountRef,
        account2: Option<AccountRef>,
    ) -> Result<Movement, StorageError> {
        let operation: Operation = operation.parse().map_err(StorageError::CorruptRow)?;
        match (operation, account2) {
            (Operation::Deposit, None) => Ok(Movement::Deposit { account: account1 }),
            (Operation::Withdrawal, None) => Ok(Movement::Withdrawal { account: account1 }),
            (Operation::Transfer, Some(to)) => Ok(Movement::Transfer { from: account1, to }),
            (operation, _) => Err(StorageError::CorruptRow(format!(
                "{} row for account {} has an inconsistent second account",
                operation, account1.id
            ))),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Movement::Deposit { .. } => Operation::Deposit,
            Movement::Withdrawal { .. } => Operation::Withdrawal,
            Movement::Transfer { .. } => Operation::Transfer,
        }
    }

    pub fn account1(&self) -> &AccountRef {
        match self {
            Movement::Deposit { account } | Movement::Withdrawal { account } => account,
            Movement::Transfer { from, .. } => from,
        }
    }

    pub fn account2(&self) -> Option<&AccountRef> {
        match self {
            Movement::Transfer { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub movement: Movement,
    pub amount: Decimal,
    pub created_at: OffsetDateTime,
}

impl Transaction {
    pub fn operation(&self) -> Operation {
        self.movement.operation()
    }

    pub fn involves(&self, account: AccountId) -> bool {
        self.movement.account1().id == account
            || self.movement.account2().map(|a| a.id) == Some(account)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionWire<'a> {
    id: TransactionId,
    account1: &'a AccountRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    account2: Option<&'a AccountRef>,
    amount: Decimal,
    operation: Operation,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TransactionWire {
            id: self.id,
            account1: self.movement.account1(),
            account2: self.movement.account2(),
            amount: self.amount,
            operation: self.operation(),
            created_at: self.created_at,
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountDetails {
    pub account: Account,
    pub transactions: Vec<Transaction>,
}
