use std::sync::Arc;

use tempfile::TempDir;

use reldb::{
    Column, ColumnType, DatabaseConfig, DatabaseManager, StorageEngine, Value,
};

/// Set up logging once; tests call this first.
pub fn setup() {
    reldb::utils::init_log();
}

/// A manager with a scratch data directory and one database in use.
pub fn open_manager() -> (DatabaseManager, TempDir) {
    setup();
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::new(dir.path());
    let manager = DatabaseManager::new(config).unwrap();
    manager.create_database("test").unwrap();
    manager.use_database("test").unwrap();
    (manager, dir)
}

/// A standalone storage engine over a scratch file.
pub fn open_engine(pool_size: usize, shard_count: usize) -> (Arc<StorageEngine>, TempDir) {
    setup();
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        pool_size,
        shard_count,
        ..DatabaseConfig::new(dir.path())
    };
    let engine =
        Arc::new(StorageEngine::open(dir.path().join("engine.db"), &config).unwrap());
    (engine, dir)
}

/// The `t(id INTEGER, name VARCHAR(50))` shape used across suites.
pub fn id_name_columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Integer),
        Column::new("name", ColumnType::Varchar(50)).nullable(),
    ]
}

pub fn row(id: i32, name: &str) -> Vec<Value> {
    vec![Value::Integer(id), Value::Varchar(name.to_string())]
}
