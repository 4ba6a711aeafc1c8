use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use ledgerd::{
    storage::{AccountStore, StorageBackend, StorageError, TransactionStore, UnitOfWork},
    Account, AccountId, CreateAccountCommand, LedgerError, LedgerService, Operation, Transaction,
    TransactionInput, TransactionRequest,
};
use ledgerd_core::LedgerEngine;
use ledgerd_memory::InMemoryStorage;
use ledgerd_postgres::PostgresStorage;
use ledgerd_sqlite::SqliteStorage;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn memory_backend() -> Arc<dyn StorageBackend> {
    Arc::new(InMemoryStorage::new())
}

fn sqlite_backend() -> Arc<dyn StorageBackend> {
    Arc::new(SqliteStorage::new(":memory:").expect("Failed to open SQLite"))
}

/// Uses the database named by `LEDGERD_TEST_POSTGRES_URL`, or returns `None`
/// so the test is skipped.
fn postgres_backend() -> Option<Arc<dyn StorageBackend>> {
    let Ok(url) = std::env::var("LEDGERD_TEST_POSTGRES_URL") else {
        eprintln!("LEDGERD_TEST_POSTGRES_URL not set, skipping");
        return None;
    };
    Some(Arc::new(PostgresStorage::new(&url).expect("Failed to connect to PostgreSQL")))
}

/// Account names for scenarios that also run against a persistent database.
fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
    format!("{}-{}-{}", prefix, nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn open_account(service: &LedgerService, name: &str, balance: Decimal) -> Account {
    service
        .create_account(CreateAccountCommand { name: name.to_string(), balance })
        .expect("Failed to create account")
}

fn balance(service: &LedgerService, id: AccountId) -> Decimal {
    service.get_account(id).expect("Failed to load account").account.balance
}

fn ids(transactions: &[Transaction]) -> Vec<i64> {
    transactions.iter().map(|t| t.id.0).collect()
}

/// Delegates to a real unit of work but fails the n-th balance write.
struct FaultyStore<'a> {
    inner: &'a mut dyn UnitOfWork,
    fail_on_write: usize,
    writes: usize,
}

impl AccountStore for FaultyStore<'_> {
    fn account_must_exist(&mut self, id: AccountId) -> Result<(), StorageError> {
        self.inner.account_must_exist(id)
    }

    fn account_name_exists(&mut self, name: &str) -> Result<bool, StorageError> {
        self.inner.account_name_exists(name)
    }

    fn create_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        self.inner.create_account(command)
    }

    fn get_balance(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        self.inner.get_balance(id)
    }

    fn get_balance_for_update(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        self.inner.get_balance_for_update(id)
    }

    fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<(), StorageError> {
        self.writes += 1;
        if self.writes == self.fail_on_write {
            return Err(StorageError::Other("simulated write failure".to_string()));
        }
        self.inner.set_balance(id, balance)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.inner.get_account(id)
    }
}

impl TransactionStore for FaultyStore<'_> {
    fn save_transaction(&mut self, request: &TransactionRequest) -> Result<Transaction, StorageError> {
        self.inner.save_transaction(request)
    }

    fn list_transactions(&mut self) -> Result<Vec<Transaction>, StorageError> {
        self.inner.list_transactions()
    }

    fn list_transactions_for_account(&mut self, id: AccountId) -> Result<Vec<Transaction>, StorageError> {
        self.inner.list_transactions_for_account(id)
    }
}

fn example_scenario(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, "A", dec!(100));
    let b = open_account(&service, "B", dec!(0));

    let err = service
        .execute(TransactionRequest::Withdrawal { account: a.id, amount: dec!(150) })
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance { account, available, requested }
            if account == a.id && available == dec!(100) && requested == dec!(150)
    ));
    assert_eq!(balance(&service, a.id), dec!(100));

    let transfer = service
        .execute(TransactionRequest::Transfer { from: a.id, to: b.id, amount: dec!(40) })
        .unwrap();
    assert_eq!(transfer.operation(), Operation::Transfer);
    assert_eq!(transfer.amount, dec!(40));
    assert_eq!(balance(&service, a.id), dec!(60));
    assert_eq!(balance(&service, b.id), dec!(40));

    service
        .execute(TransactionRequest::Deposit { account: b.id, amount: dec!(10) })
        .unwrap();
    assert_eq!(balance(&service, b.id), dec!(50));

    let for_a = service.list_transactions_for_account(a.id).unwrap();
    assert_eq!(ids(&for_a), vec![transfer.id.0]);
}

fn rejected_requests(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, "A", dec!(10));

    let missing = service
        .execute(TransactionRequest::Deposit { account: AccountId(9999), amount: dec!(1) })
        .unwrap_err();
    assert!(matches!(missing, LedgerError::AccountNotFound(AccountId(9999))));

    let missing_target = service
        .execute(TransactionRequest::Transfer { from: a.id, to: AccountId(9999), amount: dec!(1) })
        .unwrap_err();
    assert!(matches!(missing_target, LedgerError::AccountNotFound(AccountId(9999))));

    let no_target = TransactionRequest::try_from(TransactionInput {
        operation: Operation::Transfer,
        account1: a.id,
        account2: None,
        amount: dec!(1),
    })
    .unwrap_err();
    assert!(matches!(no_target, LedgerError::AccountIdMissing));

    assert!(matches!(
        service.execute(TransactionRequest::Transfer { from: a.id, to: a.id, amount: dec!(1) }),
        Err(LedgerError::SelfTransfer(_))
    ));
    assert!(matches!(
        service.execute(TransactionRequest::Deposit { account: a.id, amount: dec!(0) }),
        Err(LedgerError::InvalidAmount(_))
    ));

    assert_eq!(balance(&service, a.id), dec!(10));
    assert!(service.list_transactions().unwrap().is_empty());
}

fn withdraw_entire_balance(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, "A", dec!(25.50));

    service
        .execute(TransactionRequest::Withdrawal { account: a.id, amount: dec!(25.50) })
        .unwrap();
    assert_eq!(balance(&service, a.id), Decimal::ZERO);

    assert!(matches!(
        service.execute(TransactionRequest::Withdrawal { account: a.id, amount: dec!(0.01) }),
        Err(LedgerError::InsufficientBalance { .. })
    ));
}

fn fault_on_second_write_rolls_back(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage.clone());
    let a = open_account(&service, "A", dec!(100));
    let b = open_account(&service, "B", dec!(5));

    {
        let mut uow = storage.begin().unwrap();
        let mut faulty = FaultyStore { inner: uow.as_mut(), fail_on_write: 2, writes: 0 };
        let err = LedgerEngine::new(&mut faulty)
            .execute(&TransactionRequest::Transfer { from: a.id, to: b.id, amount: dec!(30) })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(StorageError::Other(_))));
        assert_eq!(faulty.writes, 2);
        uow.rollback().unwrap();
    }

    assert_eq!(balance(&service, a.id), dec!(100));
    assert_eq!(balance(&service, b.id), dec!(5));
    assert!(service.list_transactions().unwrap().is_empty());
}

fn listing_is_ordered_and_stable(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, "A", dec!(100));
    let b = open_account(&service, "B", dec!(0));
    let c = open_account(&service, "C", dec!(0));

    let first = service
        .execute(TransactionRequest::Transfer { from: a.id, to: b.id, amount: dec!(10) })
        .unwrap();
    let second = service
        .execute(TransactionRequest::Deposit { account: c.id, amount: dec!(7) })
        .unwrap();
    let third = service
        .execute(TransactionRequest::Transfer { from: b.id, to: a.id, amount: dec!(3) })
        .unwrap();

    let all = service.list_transactions().unwrap();
    assert_eq!(ids(&all), vec![third.id.0, second.id.0, first.id.0]);
    for pair in all.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }

    let for_b = service.list_transactions_for_account(b.id).unwrap();
    assert_eq!(ids(&for_b), vec![third.id.0, first.id.0]);
    assert!(for_b.iter().all(|t| t.involves(b.id)));
    assert_eq!(for_b[0].movement.account1().name.as_deref(), Some("B"));

    let again = service.list_transactions_for_account(b.id).unwrap();
    assert_eq!(for_b, again, "Repeated reads without writes should be identical");

    assert!(service.list_transactions_for_account(AccountId(424242)).unwrap().is_empty());
}

fn opposite_transfers_do_not_deadlock(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, &unique_name("A"), dec!(1000));
    let b = open_account(&service, &unique_name("B"), dec!(1000));

    std::thread::scope(|scope| {
        for (from, to) in [(a.id, b.id), (b.id, a.id)] {
            let service = service.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    service
                        .execute(TransactionRequest::Transfer { from, to, amount: dec!(1) })
                        .expect("Transfer should not fail");
                }
            });
        }
    });

    assert_eq!(balance(&service, a.id), dec!(1000));
    assert_eq!(balance(&service, b.id), dec!(1000));
    assert_eq!(service.list_transactions_for_account(a.id).unwrap().len(), 100);
}

fn concurrent_deposits_are_not_lost(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let a = open_account(&service, &unique_name("A"), dec!(0));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let service = service.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    service
                        .execute(TransactionRequest::Deposit { account: a.id, amount: dec!(1.5) })
                        .expect("Deposit should not fail");
                }
            });
        }
    });

    assert_eq!(balance(&service, a.id), dec!(150));
}

fn duplicate_account_names(storage: Arc<dyn StorageBackend>) {
    let service = LedgerService::new(storage);
    let first = open_account(&service, "bank", dec!(1));

    let err = service
        .create_account(CreateAccountCommand { name: "bank".to_string(), balance: dec!(2) })
        .unwrap_err();
    assert!(matches!(err, LedgerError::AccountNameTaken(name) if name == "bank"));

    let details = service.get_account(first.id).unwrap();
    assert_eq!(details.account.balance, dec!(1));
    assert!(matches!(service.get_account(AccountId(31337)), Err(LedgerError::AccountNotFound(_))));
}

macro_rules! backend_tests {
    ($backend:ident) => {
        paste::paste! {
            #[test]
            fn [<test_ $backend _example_scenario>]() {
                example_scenario([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _rejected_requests>]() {
                rejected_requests([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _withdraw_entire_balance>]() {
                withdraw_entire_balance([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _fault_on_second_write_rolls_back>]() {
                fault_on_second_write_rolls_back([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _listing_is_ordered_and_stable>]() {
                listing_is_ordered_and_stable([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _opposite_transfers_do_not_deadlock>]() {
                opposite_transfers_do_not_deadlock([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _concurrent_deposits_are_not_lost>]() {
                concurrent_deposits_are_not_lost([<$backend _backend>]());
            }

            #[test]
            fn [<test_ $backend _duplicate_account_names>]() {
                duplicate_account_names([<$backend _backend>]());
            }
        }
    };
}

backend_tests!(memory);
backend_tests!(sqlite);

#[test]
fn test_postgres_opposite_transfers_do_not_deadlock() {
    let Some(storage) = postgres_backend() else { return };
    opposite_transfers_do_not_deadlock(storage);
}

#[test]
fn test_postgres_concurrent_deposits_are_not_lost() {
    let Some(storage) = postgres_backend() else { return };
    concurrent_deposits_are_not_lost(storage);
}

#[derive(Debug, Clone)]
enum Op {
    Deposit(usize, u32),
    Withdrawal(usize, u32),
    Transfer(usize, usize, u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, 1..500u32).prop_map(|(a, amount)| Op::Deposit(a, amount)),
        (0..3usize, 1..500u32).prop_map(|(a, amount)| Op::Withdrawal(a, amount)),
        (0..3usize, 0..3usize, 1..500u32).prop_map(|(a, b, amount)| Op::Transfer(a, b, amount)),
    ]
}

proptest! {
    #[test]
    fn test_balances_are_conserved(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let service = LedgerService::new(memory_backend());
        let accounts: Vec<AccountId> = ["A", "B", "C"]
            .iter()
            .map(|name| open_account(&service, name, dec!(100)).id)
            .collect();

        let mut expected_total = dec!(300);
        for op in ops {
            let request = match op {
                Op::Deposit(a, amount) => TransactionRequest::Deposit { account: accounts[a], amount: Decimal::from(amount) },
                Op::Withdrawal(a, amount) => TransactionRequest::Withdrawal { account: accounts[a], amount: Decimal::from(amount) },
                Op::Transfer(a, b, amount) => TransactionRequest::Transfer { from: accounts[a], to: accounts[b], amount: Decimal::from(amount) },
            };
            match service.execute(request) {
                Ok(_) => match request {
                    TransactionRequest::Deposit { amount, .. } => expected_total += amount,
                    TransactionRequest::Withdrawal { amount, .. } => expected_total -= amount,
                    TransactionRequest::Transfer { .. } => {}
                },
                Err(e) => prop_assert!(e.is_client_error(), "unexpected failure: {}", e),
            }
        }

        let balances: Vec<Decimal> = accounts.iter().map(|id| balance(&service, *id)).collect();
        prop_assert!(balances.iter().all(|b| *b >= Decimal::ZERO));
        prop_assert_eq!(balances.iter().copied().sum::<Decimal>(), expected_total);
    }
}
