use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::info;

use crate::error::{DbError, DbResult};
use crate::index::btree::BPlusTree;
use crate::storage::StorageEngine;
use crate::table::catalog::{Catalog, IndexCatalogEntry, TableInfo};
use crate::types::Pod;
use crate::utils::HandyRwLock;

/// Catalog of open B+ trees, one per (table, column) pair.
///
/// The manager tracks the in-memory handles; durable registration
/// lives in the table's index catalog pages.
pub struct IndexManager {
    engine: Arc<StorageEngine>,
    // table name -> column name -> tree
    trees: RwLock<HashMap<String, HashMap<String, Pod<BPlusTree>>>>,
}

impl IndexManager {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Open handles for every index the catalog lists for `info`.
    pub fn load_table(&self, catalog: &Catalog, info: &TableInfo) -> DbResult<()> {
        let mut by_column = HashMap::new();
        for entry in catalog.list_indexes(info)? {
            let tree = BPlusTree::new(Arc::clone(&self.engine), entry.tree_meta_page_id);
            by_column.insert(entry.column, Arc::new(RwLock::new(tree)));
        }
        self.trees
            .wl()
            .insert(info.schema.table_name.clone(), by_column);
        Ok(())
    }

    pub fn index_exists(&self, table: &str, column: &str) -> bool {
        self.trees
            .rl()
            .get(table)
            .map_or(false, |columns| columns.contains_key(column))
    }

    pub fn get_index(&self, table: &str, column: &str) -> DbResult<Pod<BPlusTree>> {
        self.trees
            .rl()
            .get(table)
            .and_then(|columns| columns.get(column))
            .cloned()
            .ok_or_else(|| DbError::IndexNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    /// Every open index for the table, as (column, tree) pairs.
    pub fn indexes_for_table(&self, table: &str) -> Vec<(String, Pod<BPlusTree>)> {
        self.trees
            .rl()
            .get(table)
            .map(|columns| {
                columns
                    .iter()
                    .map(|(column, tree)| (column.clone(), Arc::clone(tree)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create and register an empty tree for (table, column). Returns
    /// the updated table info carrying the index catalog link.
    pub fn create_index(
        &self,
        catalog: &Catalog,
        info: &TableInfo,
        column: &str,
    ) -> DbResult<(TableInfo, Pod<BPlusTree>)> {
        let table = info.schema.table_name.as_str();
        if self.index_exists(table, column) {
            return Err(DbError::IndexExists {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        // unknown columns are rejected before any page is allocated
        info.schema.column_position(column)?;

        let meta_page_id = BPlusTree::allocate_meta(&self.engine)?;
        let tree = BPlusTree::new(Arc::clone(&self.engine), meta_page_id);
        tree.create()?;

        let updated = catalog.add_index(
            info,
            IndexCatalogEntry {
                column: column.to_string(),
                tree_meta_page_id: meta_page_id,
            },
        )?;

        let pod = Arc::new(RwLock::new(tree));
        self.trees
            .wl()
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), Arc::clone(&pod));
        info!("index created on {}.{}", table, column);
        Ok((updated, pod))
    }

    /// Drop the tree for (table, column): free its pages, its metadata
    /// page, and its catalog registration.
    pub fn drop_index(&self, catalog: &Catalog, info: &TableInfo, column: &str) -> DbResult<()> {
        let table = info.schema.table_name.as_str();
        let tree = self.get_index(table, column)?;
        tree.wl().drop_tree()?;

        let meta_page_id = catalog.remove_index(info, column)?;
        self.engine.delete_page(meta_page_id)?;

        if let Some(columns) = self.trees.wl().get_mut(table) {
            columns.remove(column);
        }
        info!("index dropped from {}.{}", table, column);
        Ok(())
    }

    /// Drop every index of a table (table drop path). The catalog
    /// chain pages are freed by the catalog itself.
    pub fn drop_table_indexes(&self, catalog: &Catalog, info: &TableInfo) -> DbResult<()> {
        let table = info.schema.table_name.as_str();
        for entry in catalog.list_indexes(info)? {
            if let Ok(tree) = self.get_index(table, &entry.column) {
                tree.wl().drop_tree()?;
            } else {
                // registered but never opened; open it just to free it
                let tree = BPlusTree::new(Arc::clone(&self.engine), entry.tree_meta_page_id);
                tree.drop_tree()?;
            }
            self.engine.delete_page(entry.tree_meta_page_id)?;
        }
        self.trees.wl().remove(table);
        Ok(())
    }

    /// Forget a table's handles without touching disk (database close).
    pub fn forget_table(&self, table: &str) {
        self.trees.wl().remove(table);
    }
}
