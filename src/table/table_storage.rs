use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::error::{DbError, DbResult};
use crate::index::btree::BPlusTree;
use crate::index::key::{check_indexable, compose_key, encode_key, prefix_range};
use crate::index::node::IndexEntry;
use crate::index::IndexManager;
use crate::table::catalog::{Catalog, TableInfo};
use crate::table::schema::{Column, TableSchema};
use crate::table::table_page::{max_record_payload, TablePage};
use crate::table::value::{deserialize_record, serialize_record, validate_values, Value};
use crate::storage::StorageEngine;
use crate::types::{PageId, Pod, INVALID_PAGE_ID};
use crate::utils::HandyRwLock;

/// A record's address: page id plus in-page offset. Stable across
/// in-place updates; relocation changes it.
pub type RecordLocator = (PageId, u16);

/// Record-oriented interface over the buffer pool: tables as doubly
/// linked page chains of slotted pages, with secondary index
/// maintenance folded into every mutation.
pub struct TableStorageManager {
    engine: Arc<StorageEngine>,
    catalog: Catalog,
    index_manager: IndexManager,
    tables: RwLock<HashMap<String, TableInfo>>,
    next_table_id: AtomicI64,
}

impl TableStorageManager {
    /// Open the table layer over `engine`, recovering every table and
    /// index registered in the file's catalog.
    pub fn new(engine: Arc<StorageEngine>) -> DbResult<Self> {
        let catalog = Catalog::new(Arc::clone(&engine));
        let index_manager = IndexManager::new(Arc::clone(&engine));

        let mut tables = HashMap::new();
        for info in catalog.load()? {
            index_manager.load_table(&catalog, &info)?;
            tables.insert(info.schema.table_name.clone(), info);
        }
        let next_table_id = AtomicI64::new(catalog.max_table_id()? + 1);

        Ok(Self {
            engine,
            catalog,
            index_manager,
            tables: RwLock::new(tables),
            next_table_id,
        })
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.rl().contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.rl().keys().cloned().collect()
    }

    pub fn get_table_metadata(&self, name: &str) -> DbResult<TableSchema> {
        Ok(self.info(name)?.schema)
    }

    fn info(&self, name: &str) -> DbResult<TableInfo> {
        self.tables
            .rl()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn store_info(&self, info: TableInfo) {
        self.tables
            .wl()
            .insert(info.schema.table_name.clone(), info);
    }

    /// Run `f` against the pinned table page `page_id`; `dirty` tells
    /// the pool whether `f` mutates it.
    fn with_table_page<R>(
        &self,
        page_id: PageId,
        dirty: bool,
        f: impl FnOnce(&mut TablePage<'_>) -> DbResult<R>,
    ) -> DbResult<R> {
        let mut guard = self.engine.fetch_guard(page_id)?;
        let result = {
            let mut page = guard.write();
            let mut table_page = TablePage::new(&mut page);
            f(&mut table_page)
        };
        if dirty {
            guard.mark_dirty();
        }
        result
    }

    // ------------------------------------------------------------------
    // table lifecycle
    // ------------------------------------------------------------------

    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> DbResult<()> {
        if self.table_exists(name) {
            return Err(DbError::TableExists(name.to_string()));
        }

        let table_id = self.next_table_id.fetch_add(1, Ordering::Relaxed);
        let schema = TableSchema::new(table_id, name, columns)?;
        let info = self.catalog.create_table(&schema)?;
        self.index_manager.load_table(&self.catalog, &info)?;
        self.store_info(info);
        Ok(())
    }

    /// Free every data page, every index, and the catalog entries.
    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        let info = self.info(name)?;

        // data page chain first
        let mut current = info.first_data_page_id;
        while current != INVALID_PAGE_ID {
            let next = self.with_table_page(current, false, |tp| tp.next_page_id())?;
            self.engine.delete_page(current)?;
            current = next;
        }

        self.index_manager.drop_table_indexes(&self.catalog, &info)?;
        self.catalog.drop_table(name)?;
        self.tables.wl().remove(name);
        info!("table '{}' dropped", name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // record CRUD
    // ------------------------------------------------------------------

    /// Insert a row, returning its locator. Every index on the table
    /// learns the new record in the same logical step.
    pub fn insert_record(&self, name: &str, values: &[Value]) -> DbResult<RecordLocator> {
        let info = self.info(name)?;
        let row = validate_values(&info.schema, values)?;
        let payload = serialize_record(&info.schema, &row)?;

        let capacity = max_record_payload(self.engine.page_size());
        if payload.len() > capacity {
            return Err(DbError::RecordTooLarge {
                size: payload.len(),
                capacity,
            });
        }

        let locator = self.place_record(&info, &payload)?;
        self.index_insert_entries(name, &info.schema, &row, locator)?;
        Ok(locator)
    }

    /// Find a page with room (first fit along the chain) or grow the
    /// chain by one page at the tail.
    fn place_record(&self, info: &TableInfo, payload: &[u8]) -> DbResult<RecordLocator> {
        enum Outcome {
            Placed(u16),
            Next(PageId),
        }

        let mut current = info.first_data_page_id;
        let mut tail = INVALID_PAGE_ID;

        while current != INVALID_PAGE_ID {
            let mut guard = self.engine.fetch_guard(current)?;
            let result = {
                let mut page = guard.write();
                let mut table_page = TablePage::new(&mut page);
                match table_page.can_fit(payload.len()) {
                    Ok(true) => table_page.insert_record(payload).map(Outcome::Placed),
                    Ok(false) => table_page.next_page_id().map(Outcome::Next),
                    Err(e) => Err(e),
                }
            };
            // probing a full page leaves it clean
            if matches!(result, Ok(Outcome::Placed(_))) {
                guard.mark_dirty();
            }
            drop(guard);
            match result? {
                Outcome::Placed(offset) => return Ok((current, offset)),
                Outcome::Next(next) => {
                    tail = current;
                    current = next;
                }
            }
        }

        // no page had room: append a fresh one at the tail
        let mut guard = self.engine.new_guard()?;
        let page_id = guard.page_id();
        let offset = {
            let mut page = guard.write();
            let mut table_page = TablePage::init(&mut page);
            if tail != INVALID_PAGE_ID {
                table_page.set_prev_page_id(tail)?;
            }
            table_page.insert_record(payload)?
        };
        guard.mark_dirty();
        drop(guard);

        if tail != INVALID_PAGE_ID {
            self.with_table_page(tail, true, |tp| tp.set_next_page_id(page_id))?;
        } else {
            let mut updated = info.clone();
            updated.first_data_page_id = page_id;
            self.catalog.write_table_meta(&updated)?;
            self.store_info(updated);
        }
        debug!(
            "table '{}' grew data page {}",
            info.schema.table_name, page_id
        );
        Ok((page_id, offset))
    }

    /// Read the row at `locator`; `None` if the slot is tombstoned.
    pub fn get_record(
        &self,
        name: &str,
        locator: RecordLocator,
    ) -> DbResult<Option<Vec<Value>>> {
        let info = self.info(name)?;
        let (page_id, offset) = locator;

        let payload = self.with_table_page(page_id, false, |tp| tp.read_record(offset))?;
        match payload {
            Some(bytes) => {
                let mut reader = crate::io::ByteReader::new(&bytes);
                Ok(Some(deserialize_record(&info.schema, &mut reader)?))
            }
            None => {
                debug!(
                    "dangling locator ({}, {}) on table '{}'",
                    page_id, offset, name
                );
                Ok(None)
            }
        }
    }

    /// Batch read in input order, skipping tombstoned locators.
    pub fn get_records(
        &self,
        name: &str,
        locators: &[RecordLocator],
    ) -> DbResult<Vec<Vec<Value>>> {
        let mut rows = Vec::with_capacity(locators.len());
        for &locator in locators {
            if let Some(row) = self.get_record(name, locator)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Update the row at `locator`. Fits-in-place keeps the locator;
    /// otherwise the old slot is tombstoned and the row re-inserted,
    /// and the returned locator differs. Indexes follow either way.
    pub fn update_record(
        &self,
        name: &str,
        locator: RecordLocator,
        new_values: &[Value],
    ) -> DbResult<RecordLocator> {
        let info = self.info(name)?;
        let old_row = self.get_record(name, locator)?.ok_or_else(|| {
            DbError::invalid(format!(
                "update of deleted record at ({}, {}) in '{}'",
                locator.0, locator.1, name
            ))
        })?;

        let row = validate_values(&info.schema, new_values)?;
        let payload = serialize_record(&info.schema, &row)?;
        let (page_id, offset) = locator;

        let fitted = self.with_table_page(page_id, true, |tp| {
            match tp.overwrite_record(offset, &payload) {
                Ok(()) => Ok(true),
                Err(DbError::RecordTooLarge { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })?;

        if fitted {
            // refresh index entries for columns whose value changed
            for (column, tree) in self.index_manager.indexes_for_table(name) {
                let pos = info.schema.column_position(&column)?;
                if old_row[pos] == row[pos] {
                    continue;
                }
                let old_key = compose_key(encode_key(&old_row[pos])?, page_id, offset);
                let new_key = compose_key(encode_key(&row[pos])?, page_id, offset);
                let tree = tree.wl();
                tree.delete(&old_key)?;
                tree.insert(IndexEntry::new(new_key, page_id, offset))?;
            }
            return Ok(locator);
        }

        // relocation: drop old index entries, tombstone, re-insert
        self.index_delete_entries(name, &info.schema, &old_row, locator)?;
        self.with_table_page(page_id, true, |tp| {
            tp.mark_deleted(offset)?;
            Ok(())
        })?;
        let new_locator = self.place_record(&self.info(name)?, &payload)?;
        self.index_insert_entries(name, &info.schema, &row, new_locator)?;
        debug!(
            "record in '{}' relocated ({}, {}) -> ({}, {})",
            name, page_id, offset, new_locator.0, new_locator.1
        );
        Ok(new_locator)
    }

    /// Tombstone the row at `locator` and remove its index entries.
    /// Deleting an already-deleted slot is a no-op.
    pub fn delete_record(&self, name: &str, locator: RecordLocator) -> DbResult<()> {
        let info = self.info(name)?;
        let old_row = match self.get_record(name, locator)? {
            Some(row) => row,
            None => return Ok(()),
        };

        self.index_delete_entries(name, &info.schema, &old_row, locator)?;
        self.with_table_page(locator.0, true, |tp| {
            tp.mark_deleted(locator.1)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Locators of every live record, in page-chain order.
    pub fn scan_table(&self, name: &str) -> DbResult<Vec<RecordLocator>> {
        let info = self.info(name)?;
        let mut locators = Vec::new();
        let mut current = info.first_data_page_id;
        while current != INVALID_PAGE_ID {
            let (offsets, next) = self.with_table_page(current, false, |tp| {
                Ok((tp.live_offsets()?, tp.next_page_id()?))
            })?;
            locators.extend(offsets.into_iter().map(|o| (current, o)));
            current = next;
        }
        Ok(locators)
    }

    // ------------------------------------------------------------------
    // index management
    // ------------------------------------------------------------------

    /// Create a B+ tree on (table, column) and populate it from the
    /// existing rows.
    pub fn create_index(&self, table: &str, column: &str) -> DbResult<()> {
        let info = self.info(table)?;
        let (updated, tree) = self.index_manager.create_index(&self.catalog, &info, column)?;
        self.store_info(updated);

        let pos = info.schema.column_position(column)?;
        for locator in self.scan_table(table)? {
            if let Some(row) = self.get_record(table, locator)? {
                check_indexable(&row[pos])?;
                let key = compose_key(encode_key(&row[pos])?, locator.0, locator.1);
                tree.wl()
                    .insert(IndexEntry::new(key, locator.0, locator.1))?;
            }
        }
        Ok(())
    }

    pub fn drop_index(&self, table: &str, column: &str) -> DbResult<()> {
        let info = self.info(table)?;
        self.index_manager.drop_index(&self.catalog, &info, column)
    }

    pub fn index_exists(&self, table: &str, column: &str) -> bool {
        self.index_manager.index_exists(table, column)
    }

    pub fn get_index(&self, table: &str, column: &str) -> DbResult<Pod<BPlusTree>> {
        self.index_manager.get_index(table, column)
    }

    /// Locators of rows whose `column` equals `value`, via the index.
    pub fn search_by_index(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> DbResult<Vec<RecordLocator>> {
        let tree = self.get_index(table, column)?;
        let (lo, hi) = prefix_range(&encode_key(value)?);
        let entries = tree.rl().search_range(&lo, &hi)?;
        Ok(entries.into_iter().map(|e| (e.page_id, e.offset)).collect())
    }

    /// Locators of rows with `lo <= column <= hi`, via the index, in
    /// column order.
    pub fn search_range_by_index(
        &self,
        table: &str,
        column: &str,
        lo: &Value,
        hi: &Value,
    ) -> DbResult<Vec<RecordLocator>> {
        let tree = self.get_index(table, column)?;
        let (range_lo, _) = prefix_range(&encode_key(lo)?);
        let (_, range_hi) = prefix_range(&encode_key(hi)?);
        let entries = tree.rl().search_range(&range_lo, &range_hi)?;
        Ok(entries.into_iter().map(|e| (e.page_id, e.offset)).collect())
    }

    // ------------------------------------------------------------------
    // index maintenance
    // ------------------------------------------------------------------

    fn index_insert_entries(
        &self,
        table: &str,
        schema: &TableSchema,
        row: &[Value],
        locator: RecordLocator,
    ) -> DbResult<()> {
        for (column, tree) in self.index_manager.indexes_for_table(table) {
            let pos = schema.column_position(&column)?;
            check_indexable(&row[pos])?;
            let key = compose_key(encode_key(&row[pos])?, locator.0, locator.1);
            tree.wl()
                .insert(IndexEntry::new(key, locator.0, locator.1))?;
        }
        Ok(())
    }

    fn index_delete_entries(
        &self,
        table: &str,
        schema: &TableSchema,
        row: &[Value],
        locator: RecordLocator,
    ) -> DbResult<()> {
        for (column, tree) in self.index_manager.indexes_for_table(table) {
            let pos = schema.column_position(&column)?;
            let key = compose_key(encode_key(&row[pos])?, locator.0, locator.1);
            tree.wl().delete(&key)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> DbResult<()> {
        self.engine.flush_all_pages()
    }
}
