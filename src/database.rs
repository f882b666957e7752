use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::info;

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::storage::{StatsSnapshot, StorageEngine};
use crate::table::schema::{Column, TableSchema};
use crate::table::table_storage::{RecordLocator, TableStorageManager};
use crate::table::value::Value;
use crate::transaction::lock_manager::LockMode;
use crate::transaction::manager::TransactionManager;
use crate::transaction::transaction::{IsolationLevel, UndoEntry};
use crate::types::TransactionId;
use crate::utils::HandyRwLock;
use std::time::Duration;

/// One open database: a paged file plus its table layer.
pub struct Database {
    pub name: String,
    engine: Arc<StorageEngine>,
    tables: TableStorageManager,
}

impl Database {
    pub fn tables(&self) -> &TableStorageManager {
        &self.tables
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }
}

/// Entry point tying the subsystems together: database files under one
/// data directory, the transaction manager, and transactional record
/// operations that keep locks, undo logging and index maintenance in
/// step.
///
/// Configuration comes in by value; there is no process-wide state.
pub struct DatabaseManager {
    config: DatabaseConfig,
    txn_manager: TransactionManager,
    current: RwLock<Option<Arc<Database>>>,
}

impl DatabaseManager {
    pub fn new(config: DatabaseConfig) -> DbResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let txn_manager = TransactionManager::new(
            config.stripe_count,
            Duration::from_millis(config.lock_timeout_ms),
        );
        info!("database manager started in {:?}", config.data_dir);
        Ok(Self {
            config,
            txn_manager,
            current: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    // ------------------------------------------------------------------
    // database lifecycle
    // ------------------------------------------------------------------

    fn database_path(&self, name: &str) -> DbResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(DbError::invalid(format!("bad database name '{}'", name)));
        }
        Ok(self.config.data_dir.join(format!("{}.db", name)))
    }

    pub fn create_database(&self, name: &str) -> DbResult<()> {
        let path = self.database_path(name)?;
        if path.exists() {
            return Err(DbError::DatabaseExists(name.to_string()));
        }
        // opening writes the file header; the engine closes right away
        StorageEngine::open(&path, &self.config)?;
        info!("database '{}' created", name);
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> DbResult<()> {
        let path = self.database_path(name)?;
        if !path.exists() {
            return Err(DbError::DatabaseNotFound(name.to_string()));
        }

        // close it first if it is the one in use
        let mut current = self.current.wl();
        if current.as_ref().map_or(false, |db| db.name == name) {
            *current = None;
        }
        drop(current);

        fs::remove_file(&path)?;
        info!("database '{}' dropped", name);
        Ok(())
    }

    pub fn use_database(&self, name: &str) -> DbResult<()> {
        let path = self.database_path(name)?;
        if !path.exists() {
            return Err(DbError::DatabaseNotFound(name.to_string()));
        }

        let engine = Arc::new(StorageEngine::open(&path, &self.config)?);
        let tables = TableStorageManager::new(Arc::clone(&engine))?;
        *self.current.wl() = Some(Arc::new(Database {
            name: name.to_string(),
            engine,
            tables,
        }));
        info!("using database '{}'", name);
        Ok(())
    }

    pub fn list_databases(&self) -> DbResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "db") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn current_database(&self) -> DbResult<Arc<Database>> {
        self.current
            .rl()
            .clone()
            .ok_or_else(|| DbError::invalid("no database in use"))
    }

    /// Flush the current database and release it.
    pub fn close(&self) -> DbResult<()> {
        if let Some(db) = self.current.wl().take() {
            db.tables.flush()?;
        }
        Ok(())
    }

    pub fn buffer_stats(&self) -> DbResult<StatsSnapshot> {
        Ok(self.current_database()?.engine.stats())
    }

    // ------------------------------------------------------------------
    // table surface (current database)
    // ------------------------------------------------------------------

    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> DbResult<()> {
        self.current_database()?.tables.create_table(name, columns)
    }

    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        self.current_database()?.tables.drop_table(name)
    }

    pub fn table_exists(&self, name: &str) -> DbResult<bool> {
        Ok(self.current_database()?.tables.table_exists(name))
    }

    pub fn get_table_metadata(&self, name: &str) -> DbResult<TableSchema> {
        self.current_database()?.tables.get_table_metadata(name)
    }

    pub fn create_index(&self, table: &str, column: &str) -> DbResult<()> {
        self.current_database()?.tables.create_index(table, column)
    }

    pub fn drop_index(&self, table: &str, column: &str) -> DbResult<()> {
        self.current_database()?.tables.drop_index(table, column)
    }

    pub fn index_exists(&self, table: &str, column: &str) -> DbResult<bool> {
        Ok(self.current_database()?.tables.index_exists(table, column))
    }

    pub fn scan_table(&self, name: &str) -> DbResult<Vec<RecordLocator>> {
        self.current_database()?.tables.scan_table(name)
    }

    /// Insert outside any transaction (no locks, no undo).
    pub fn insert_record_plain(
        &self,
        table: &str,
        values: &[Value],
    ) -> DbResult<RecordLocator> {
        self.current_database()?.tables.insert_record(table, values)
    }

    /// Update outside any transaction.
    pub fn update_record_plain(
        &self,
        table: &str,
        locator: RecordLocator,
        values: &[Value],
    ) -> DbResult<RecordLocator> {
        self.current_database()?
            .tables
            .update_record(table, locator, values)
    }

    /// Delete outside any transaction.
    pub fn delete_record_plain(&self, table: &str, locator: RecordLocator) -> DbResult<()> {
        self.current_database()?.tables.delete_record(table, locator)
    }

    pub fn get_record(&self, name: &str, locator: RecordLocator) -> DbResult<Option<Vec<Value>>> {
        self.current_database()?.tables.get_record(name, locator)
    }

    pub fn get_records(
        &self,
        name: &str,
        locators: &[RecordLocator],
    ) -> DbResult<Vec<Vec<Value>>> {
        self.current_database()?.tables.get_records(name, locators)
    }

    pub fn search_by_index(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> DbResult<Vec<RecordLocator>> {
        self.current_database()?
            .tables
            .search_by_index(table, column, value)
    }

    pub fn search_range_by_index(
        &self,
        table: &str,
        column: &str,
        lo: &Value,
        hi: &Value,
    ) -> DbResult<Vec<RecordLocator>> {
        self.current_database()?
            .tables
            .search_range_by_index(table, column, lo, hi)
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self, isolation: IsolationLevel) -> TransactionId {
        self.txn_manager.begin_transaction(isolation)
    }

    pub fn commit_transaction(&self, txn_id: TransactionId) -> DbResult<()> {
        self.txn_manager.commit_transaction(txn_id)
    }

    /// Roll the transaction back, reversing its recorded effects
    /// through the table layer.
    pub fn rollback_transaction(&self, txn_id: TransactionId) -> DbResult<()> {
        let entries = self.txn_manager.rollback_transaction(txn_id)?;
        self.apply_undo(&entries)
    }

    pub fn create_savepoint(&self, txn_id: TransactionId, name: &str) -> DbResult<()> {
        self.txn_manager.create_savepoint(txn_id, name)
    }

    /// Undo everything after the savepoint; the transaction stays
    /// ACTIVE.
    pub fn rollback_to_savepoint(&self, txn_id: TransactionId, name: &str) -> DbResult<()> {
        let entries = self.txn_manager.rollback_to_savepoint(txn_id, name)?;
        self.apply_undo(&entries)
    }

    pub fn acquire_lock(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
        wait: bool,
    ) -> DbResult<()> {
        self.txn_manager.acquire_lock(txn_id, resource, mode, wait)
    }

    pub fn release_lock(&self, txn_id: TransactionId, resource: &str) -> DbResult<()> {
        self.txn_manager.release_lock(txn_id, resource)
    }

    // ------------------------------------------------------------------
    // transactional record operations
    // ------------------------------------------------------------------

    fn row_resource(table: &str, locator: RecordLocator) -> String {
        format!("{}:{}:{}", table, locator.0, locator.1)
    }

    /// Insert under a transaction: the new row is locked exclusively
    /// and the undo log learns how to remove it again.
    pub fn insert_record(
        &self,
        txn_id: TransactionId,
        table: &str,
        values: &[Value],
    ) -> DbResult<RecordLocator> {
        let db = self.current_database()?;
        // fail early instead of leaving an orphan row behind
        if self.txn_manager.transaction_state(txn_id)? != crate::transaction::TransactionState::Active
        {
            return Err(DbError::TransactionNotActive(txn_id));
        }

        let locator = db.tables.insert_record(table, values)?;
        self.txn_manager.acquire_lock(
            txn_id,
            &Self::row_resource(table, locator),
            LockMode::Exclusive,
            true,
        )?;
        self.txn_manager.log_operation(
            txn_id,
            UndoEntry::Insert {
                table: table.to_string(),
                locator,
            },
        )?;
        Ok(locator)
    }

    /// Update under a transaction. Returns the (possibly relocated)
    /// locator.
    pub fn update_record(
        &self,
        txn_id: TransactionId,
        table: &str,
        locator: RecordLocator,
        values: &[Value],
    ) -> DbResult<RecordLocator> {
        let db = self.current_database()?;
        self.txn_manager.acquire_lock(
            txn_id,
            &Self::row_resource(table, locator),
            LockMode::Exclusive,
            true,
        )?;

        let old_values = db.tables.get_record(table, locator)?.ok_or_else(|| {
            DbError::invalid(format!(
                "update of deleted record at ({}, {}) in '{}'",
                locator.0, locator.1, table
            ))
        })?;

        let new_locator = db.tables.update_record(table, locator, values)?;
        if new_locator != locator {
            self.txn_manager.acquire_lock(
                txn_id,
                &Self::row_resource(table, new_locator),
                LockMode::Exclusive,
                true,
            )?;
        }
        self.txn_manager.log_operation(
            txn_id,
            UndoEntry::Update {
                table: table.to_string(),
                old_locator: locator,
                new_locator,
                old_values,
            },
        )?;
        Ok(new_locator)
    }

    /// Delete under a transaction; a no-op on an already-deleted slot.
    pub fn delete_record(
        &self,
        txn_id: TransactionId,
        table: &str,
        locator: RecordLocator,
    ) -> DbResult<()> {
        let db = self.current_database()?;
        self.txn_manager.acquire_lock(
            txn_id,
            &Self::row_resource(table, locator),
            LockMode::Exclusive,
            true,
        )?;

        let old_values = match db.tables.get_record(table, locator)? {
            Some(values) => values,
            None => return Ok(()),
        };
        db.tables.delete_record(table, locator)?;
        self.txn_manager.log_operation(
            txn_id,
            UndoEntry::Delete {
                table: table.to_string(),
                locator,
                old_values,
            },
        )?;
        Ok(())
    }

    /// Read under a transaction. Shared lock per the isolation level:
    /// READ_UNCOMMITTED reads without locking, READ_COMMITTED releases
    /// its lock right after the read, the higher levels keep it.
    pub fn read_record(
        &self,
        txn_id: TransactionId,
        table: &str,
        locator: RecordLocator,
    ) -> DbResult<Option<Vec<Value>>> {
        let db = self.current_database()?;
        let isolation = self.txn_manager.isolation_level(txn_id)?;
        let resource = Self::row_resource(table, locator);

        if isolation == IsolationLevel::ReadUncommitted {
            return db.tables.get_record(table, locator);
        }

        self.txn_manager
            .acquire_lock(txn_id, &resource, LockMode::Shared, true)?;
        let row = db.tables.get_record(table, locator);
        if isolation == IsolationLevel::ReadCommitted {
            self.txn_manager.release_lock(txn_id, &resource)?;
        }
        row
    }

    /// Replay undo entries (already newest-first) through the table
    /// layer.
    fn apply_undo(&self, entries: &[UndoEntry]) -> DbResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let db = self.current_database()?;
        for entry in entries {
            match entry {
                UndoEntry::Insert { table, locator } => {
                    db.tables.delete_record(table, *locator)?;
                }
                UndoEntry::Update {
                    table,
                    old_locator,
                    new_locator,
                    old_values,
                } => {
                    if new_locator == old_locator {
                        db.tables.update_record(table, *old_locator, old_values)?;
                    } else {
                        db.tables.delete_record(table, *new_locator)?;
                        db.tables.insert_record(table, old_values)?;
                    }
                }
                UndoEntry::Delete {
                    table, old_values, ..
                } => {
                    db.tables.insert_record(table, old_values)?;
                }
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> DbResult<()> {
        if let Some(db) = self.current.rl().as_ref() {
            db.tables.flush()?;
        }
        Ok(())
    }
}
