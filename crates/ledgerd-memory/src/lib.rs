//! In-memory storage backend for ledgerd.
//!
//! Committed state sits behind a `RwLock`. Each unit of work buffers its
//! writes and applies them on commit. Row locks live in a separate lock
//! table so that a lock-acquiring read blocks other units of work until the
//! holder finishes, exactly like `SELECT ... FOR UPDATE`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Condvar, Mutex, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use rust_decimal::Decimal;
use time::OffsetDateTime;

use ledgerd_core::{
    Account, AccountId, AccountRef, AccountStore, CreateAccountCommand, LedgerSession, Movement,
    StorageBackend, StorageError, Transaction, TransactionId, TransactionRequest, TransactionStore,
    UnitOfWork,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type UnitId = u64;

#[derive(Clone)]
struct TransactionRow {
    id: TransactionId,
    request: TransactionRequest,
    created_at: OffsetDateTime,
}

#[derive(Default)]
struct LedgerState {
    accounts: BTreeMap<AccountId, Account>,
    transactions: Vec<TransactionRow>,
    // Names of accounts created by units of work that have not finished yet.
    reserved_names: HashSet<String>,
}

impl LedgerState {
    fn name_taken(&self, name: &str) -> bool {
        self.reserved_names.contains(name) || self.accounts.values().any(|a| a.name == name)
    }
}

pub struct InMemoryStorage {
    state: RwLock<LedgerState>,
    row_locks: Mutex<HashMap<AccountId, UnitId>>,
    row_released: Condvar,
    account_seq: AtomicI64,
    transaction_seq: AtomicI64,
    unit_counter: AtomicU64,
    last_created_at: Mutex<OffsetDateTime>,
    lock_timeout: Duration,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            row_locks: Mutex::new(HashMap::new()),
            row_released: Condvar::new(),
            account_seq: AtomicI64::new(1),
            transaction_seq: AtomicI64::new(1),
            unit_counter: AtomicU64::new(1),
            last_created_at: Mutex::new(OffsetDateTime::UNIX_EPOCH),
            lock_timeout,
        }
    }

    fn open_unit(&self) -> MemoryUnitOfWork<'_> {
        MemoryUnitOfWork {
            storage: self,
            unit_id: self.unit_counter.fetch_add(1, Ordering::SeqCst),
            balances: HashMap::new(),
            new_accounts: Vec::new(),
            new_transactions: Vec::new(),
            held_locks: Vec::new(),
            finished: false,
        }
    }

    fn next_created_at(&self) -> OffsetDateTime {
        let mut last = self.last_created_at.lock().unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc();
        if now > *last {
            *last = now;
        }
        *last
    }
}

impl StorageBackend for InMemoryStorage {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageError> {
        let unit = self.open_unit();
        tracing::debug!(unit_id = unit.unit_id, "Memory unit of work started");
        Ok(Box::new(unit))
    }

    fn session(&self) -> Result<Box<dyn LedgerSession + '_>, StorageError> {
        // A session is a unit of work that is never committed, so anything it
        // writes is discarded on drop.
        Ok(Box::new(self.open_unit()))
    }
}

pub struct MemoryUnitOfWork<'a> {
    storage: &'a InMemoryStorage,
    unit_id: UnitId,
    balances: HashMap<AccountId, Decimal>,
    new_accounts: Vec<Account>,
    new_transactions: Vec<TransactionRow>,
    held_locks: Vec<AccountId>,
    finished: bool,
}

impl<'a> MemoryUnitOfWork<'a> {
    fn ensure_active(&self) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::NoActiveTransaction);
        }
        Ok(())
    }

    fn lookup(&self, id: AccountId) -> Result<Account, StorageError> {
        let mut account = match self.new_accounts.iter().find(|a| a.id == id) {
            Some(account) => account.clone(),
            None => {
                let state = self.storage.state.read().unwrap_or_else(PoisonError::into_inner);
                state.accounts.get(&id).cloned().ok_or(StorageError::AccountNotFound(id))?
            }
        };
        if let Some(balance) = self.balances.get(&id) {
            account.balance = *balance;
        }
        Ok(account)
    }

    fn lock_row(&mut self, id: AccountId) -> Result<(), StorageError> {
        if self.held_locks.contains(&id) {
            return Ok(());
        }

        let deadline = Instant::now() + self.storage.lock_timeout;
        let mut locks = self.storage.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        while locks.contains_key(&id) {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(unit_id = self.unit_id, account = %id, "Row lock wait timed out");
                return Err(StorageError::LockTimeout(format!("account {}", id)));
            }
            let (guard, _) = self
                .storage
                .row_released
                .wait_timeout(locks, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            locks = guard;
        }
        locks.insert(id, self.unit_id);
        drop(locks);

        self.held_locks.push(id);
        tracing::debug!(unit_id = self.unit_id, account = %id, "Row lock acquired");
        Ok(())
    }

    fn release(&mut self) {
        if !self.new_accounts.is_empty() {
            let mut state = self.storage.state.write().unwrap_or_else(PoisonError::into_inner);
            for account in &self.new_accounts {
                state.reserved_names.remove(&account.name);
            }
        }
        if !self.held_locks.is_empty() {
            let mut locks = self.storage.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
            for id in self.held_locks.drain(..) {
                locks.remove(&id);
            }
            drop(locks);
            self.storage.row_released.notify_all();
        }
        self.new_accounts.clear();
        self.balances.clear();
        self.new_transactions.clear();
        self.finished = true;
    }

    fn resolve(&self, row: &TransactionRow, names: &HashMap<AccountId, String>) -> Transaction {
        let account_ref = |id: AccountId| AccountRef {
            id,
            name: names.get(&id).cloned(),
        };
        let movement = match row.request {
            TransactionRequest::Deposit { account, .. } => Movement::Deposit { account: account_ref(account) },
            TransactionRequest::Withdrawal { account, .. } => Movement::Withdrawal { account: account_ref(account) },
            TransactionRequest::Transfer { from, to, .. } => Movement::Transfer {
                from: account_ref(from),
                to: account_ref(to),
            },
        };
        Transaction {
            id: row.id,
            movement,
            amount: row.request.amount(),
            created_at: row.created_at,
        }
    }

    fn collect_transactions(&self, filter: Option<AccountId>) -> Vec<Transaction> {
        let state = self.storage.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: HashMap<AccountId, String> =
            state.accounts.values().map(|a| (a.id, a.name.clone())).collect();
        names.extend(self.new_accounts.iter().map(|a| (a.id, a.name.clone())));

        let mut rows: Vec<&TransactionRow> = state
            .transactions
            .iter()
            .chain(self.new_transactions.iter())
            .filter(|row| match filter {
                Some(id) => row.request.primary_account() == id || row.request.counterparty() == Some(id),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        rows.into_iter().map(|row| self.resolve(row, &names)).collect()
    }
}

impl<'a> AccountStore for MemoryUnitOfWork<'a> {
    fn account_must_exist(&mut self, id: AccountId) -> Result<(), StorageError> {
        self.lookup(id).map(|_| ())
    }

    fn account_name_exists(&mut self, name: &str) -> Result<bool, StorageError> {
        if self.new_accounts.iter().any(|a| a.name == name) {
            return Ok(true);
        }
        let state = self.storage.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.accounts.values().any(|a| a.name == name))
    }

    fn create_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        self.ensure_active()?;
        {
            let mut state = self.storage.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.name_taken(&command.name) {
                return Err(StorageError::UniqueViolation(format!("accounts.name = {}", command.name)));
            }
            state.reserved_names.insert(command.name.clone());
        }

        let account = Account {
            id: AccountId(self.storage.account_seq.fetch_add(1, Ordering::SeqCst)),
            name: command.name.clone(),
            balance: command.balance,
        };
        self.new_accounts.push(account.clone());
        Ok(account)
    }

    fn get_balance(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        Ok(self.lookup(id)?.balance)
    }

    fn get_balance_for_update(&mut self, id: AccountId) -> Result<Decimal, StorageError> {
        self.ensure_active()?;
        self.lookup(id)?;
        self.lock_row(id)?;
        Ok(self.lookup(id)?.balance)
    }

    fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<(), StorageError> {
        self.ensure_active()?;
        self.lookup(id)?;
        self.balances.insert(id, balance);
        Ok(())
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.lookup(id)
    }
}

impl<'a> TransactionStore for MemoryUnitOfWork<'a> {
    fn save_transaction(&mut self, request: &TransactionRequest) -> Result<Transaction, StorageError> {
        self.ensure_active()?;
        let row = TransactionRow {
            id: TransactionId(self.storage.transaction_seq.fetch_add(1, Ordering::SeqCst)),
            request: *request,
            created_at: self.storage.next_created_at(),
        };
        let transaction = self.resolve(&row, &HashMap::new());
        self.new_transactions.push(row);
        Ok(transaction)
    }

    fn list_transactions(&mut self) -> Result<Vec<Transaction>, StorageError> {
        Ok(self.collect_transactions(None))
    }

    fn list_transactions_for_account(&mut self, id: AccountId) -> Result<Vec<Transaction>, StorageError> {
        Ok(self.collect_transactions(Some(id)))
    }
}

impl<'a> UnitOfWork for MemoryUnitOfWork<'a> {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.ensure_active()?;
        {
            let mut state = self.storage.state.write().unwrap_or_else(PoisonError::into_inner);
            for account in self.new_accounts.drain(..) {
                state.reserved_names.remove(&account.name);
                state.accounts.insert(account.id, account);
            }
            for (id, balance) in self.balances.drain() {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.balance = balance;
                }
            }
            state.transactions.append(&mut self.new_transactions);
        }
        self.release();
        tracing::debug!(unit_id = self.unit_id, "Memory unit of work committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.ensure_active()?;
        self.release();
        tracing::debug!(unit_id = self.unit_id, "Memory unit of work rolled back");
        Ok(())
    }
}

impl<'a> Drop for MemoryUnitOfWork<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}
