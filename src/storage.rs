use std::sync::Arc;

use ledgerd_memory::InMemoryStorage;
use ledgerd_postgres::{IsolationLevel, PostgresOptions, PostgresStorage};
use ledgerd_sqlite::SqliteStorage;

use crate::config::{Backend, DatabaseConfig};

// Re-export core storage types so callers only need this crate
pub use ledgerd_core::storage::{
    AccountStore, LedgerSession, StorageBackend, StorageError, TransactionStore, UnitOfWork,
};

/// Opens the backend selected by `[database].backend`. Blocking: the
/// PostgreSQL client must not be created inside an async runtime.
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        Backend::Memory => Arc::new(InMemoryStorage::with_lock_timeout(config.lock_timeout())),
        Backend::Sqlite => Arc::new(SqliteStorage::open(&config.path, config.lock_timeout())?),
        Backend::Postgres => Arc::new(PostgresStorage::connect(
            postgres_config(config)?,
            PostgresOptions {
                isolation: config
                    .isolation
                    .parse::<IsolationLevel>()
                    .map_err(StorageError::Other)?,
                lock_timeout: config.lock_timeout(),
                max_connections: config.max_connections,
                connection_timeout: config.connection_timeout(),
            },
        )?),
    };
    tracing::info!(backend = ?config.backend, "Storage backend ready");
    Ok(storage)
}

fn postgres_config(config: &DatabaseConfig) -> Result<ledgerd_postgres::Config, StorageError> {
    if let Some(ref url) = config.url {
        return url
            .parse()
            .map_err(|e| StorageError::Other(format!("invalid PostgreSQL url: {}", e)));
    }

    let mut pg = ledgerd_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .user(&config.user)
        .dbname(&config.name);
    if let Some(ref password) = config.password {
        pg.password(password);
    }
    Ok(pg)
}
