use std::sync::Arc;

use log::{debug, info};

use crate::error::{DbError, DbResult};
use crate::io::{ByteReader, ByteWriter};
use crate::storage::{PageHeader, PageType, StorageEngine, PAGE_HEADER_SIZE};
use crate::table::schema::TableSchema;
use crate::types::{PageId, INVALID_PAGE_ID};

/// Everything the catalog knows about one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub meta_page_id: PageId,
    pub first_data_page_id: PageId,
    pub first_index_page_id: PageId,
}

/// One registered index: the column it covers and the metadata page of
/// its B+ tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCatalogEntry {
    pub column: String,
    pub tree_meta_page_id: PageId,
}

/// On-disk catalog: the table registry chained from page 0's header
/// fields, one metadata page per table, and per-table chains of index
/// catalog pages.
pub struct Catalog {
    engine: Arc<StorageEngine>,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    table_id: i64,
    name: String,
    meta_page_id: PageId,
}

impl Catalog {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    // ------------------------------------------------------------------
    // raw system-page content
    // ------------------------------------------------------------------

    /// Read the content region (past the page header) of a system page.
    fn read_content(&self, page_id: PageId) -> DbResult<(PageHeader, Vec<u8>)> {
        let guard = self.engine.fetch_guard(page_id)?;
        let page = guard.read();
        let header = page.read_header()?;
        if header.page_type != PageType::System {
            return Err(DbError::corrupt(page_id, "not a system page"));
        }
        Ok((header, page.data()[PAGE_HEADER_SIZE..].to_vec()))
    }

    /// Replace the content region of a system page, preserving its
    /// header links.
    fn write_content(&self, page_id: PageId, content: &[u8]) -> DbResult<()> {
        let capacity = self.engine.page_size() - PAGE_HEADER_SIZE;
        if content.len() > capacity {
            return Err(DbError::RecordTooLarge {
                size: content.len(),
                capacity,
            });
        }

        let mut guard = self.engine.fetch_guard(page_id)?;
        {
            let mut page = guard.write();
            let region = &mut page.data_mut()[PAGE_HEADER_SIZE..];
            region.fill(0);
            region[..content.len()].copy_from_slice(content);
        }
        guard.mark_dirty();
        Ok(())
    }

    /// Allocate a fresh system page and return its id.
    fn allocate_system_page(&self) -> DbResult<PageId> {
        let mut guard = self.engine.new_guard()?;
        let page_id = guard.page_id();
        guard
            .write()
            .write_header(&PageHeader::new(PageType::System, page_id));
        guard.mark_dirty();
        Ok(page_id)
    }

    fn set_next_link(&self, page_id: PageId, next: PageId) -> DbResult<()> {
        let mut guard = self.engine.fetch_guard(page_id)?;
        {
            let mut page = guard.write();
            let mut header = page.read_header()?;
            header.next_page_id = next;
            page.write_header(&header);
        }
        guard.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // table registry
    // ------------------------------------------------------------------

    fn decode_registry(content: &[u8]) -> DbResult<Vec<RegistryEntry>> {
        let mut reader = ByteReader::new(content);
        let count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(RegistryEntry {
                table_id: reader.read_i64()?,
                name: reader.read_len_str()?,
                meta_page_id: reader.read_i32()?,
            });
        }
        Ok(entries)
    }

    fn encode_registry(entries: &[RegistryEntry]) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u32(entries.len() as u32);
        for entry in entries {
            writer.write_i64(entry.table_id);
            writer.write_len_str(&entry.name);
            writer.write_i32(entry.meta_page_id);
        }
        writer.into_bytes()
    }

    /// All (table, metadata page) registrations, walking the registry
    /// chain.
    fn registry_entries(&self) -> DbResult<Vec<(PageId, Vec<RegistryEntry>)>> {
        let mut pages = Vec::new();
        let mut current = self.engine.first_registry_page_id();
        while current != INVALID_PAGE_ID {
            let (header, content) = self.read_content(current)?;
            pages.push((current, Self::decode_registry(&content)?));
            current = header.next_page_id;
        }
        Ok(pages)
    }

    /// Load every table recorded in the file.
    pub fn load(&self) -> DbResult<Vec<TableInfo>> {
        let mut tables = Vec::new();
        for (_, entries) in self.registry_entries()? {
            for entry in entries {
                tables.push(self.read_table_meta(entry.meta_page_id)?);
            }
        }
        debug!("catalog loaded {} tables", tables.len());
        Ok(tables)
    }

    /// Highest table id in use, for allocator seeding.
    pub fn max_table_id(&self) -> DbResult<i64> {
        let mut max = 0;
        for (_, entries) in self.registry_entries()? {
            for entry in entries {
                max = max.max(entry.table_id);
            }
        }
        Ok(max)
    }

    /// Persist a new table: metadata page plus a registry entry.
    pub fn create_table(&self, schema: &TableSchema) -> DbResult<TableInfo> {
        let meta_page_id = self.allocate_system_page()?;
        let info = TableInfo {
            schema: schema.clone(),
            meta_page_id,
            first_data_page_id: INVALID_PAGE_ID,
            first_index_page_id: INVALID_PAGE_ID,
        };
        self.write_table_meta(&info)?;

        let entry = RegistryEntry {
            table_id: schema.table_id,
            name: schema.table_name.clone(),
            meta_page_id,
        };

        // append to the first registry page with room, extending the
        // chain when every page is full
        let capacity = self.engine.page_size() - PAGE_HEADER_SIZE;
        let pages = self.registry_entries()?;
        let mut appended = false;
        let mut last_page = INVALID_PAGE_ID;
        for (page_id, mut entries) in pages {
            last_page = page_id;
            entries.push(entry.clone());
            let content = Self::encode_registry(&entries);
            if content.len() <= capacity {
                self.write_content(page_id, &content)?;
                appended = true;
                break;
            }
        }
        if !appended {
            let page_id = self.allocate_system_page()?;
            self.write_content(page_id, &Self::encode_registry(&[entry]))?;
            if last_page == INVALID_PAGE_ID {
                self.engine.set_first_registry_page_id(page_id)?;
            } else {
                self.set_next_link(last_page, page_id)?;
            }
        }

        self.engine.set_table_count(self.engine.table_count() + 1)?;
        info!(
            "table '{}' registered (id {}, meta page {})",
            schema.table_name, schema.table_id, meta_page_id
        );
        Ok(info)
    }

    /// Remove a table's registration and free its metadata and index
    /// catalog pages. Data pages and index trees are the caller's to
    /// free first.
    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        for (page_id, mut entries) in self.registry_entries()? {
            if let Some(pos) = entries.iter().position(|e| e.name == name) {
                let entry = entries.remove(pos);
                self.write_content(page_id, &Self::encode_registry(&entries))?;

                // free the index catalog chain, then the metadata page
                let info = self.read_table_meta(entry.meta_page_id)?;
                let mut current = info.first_index_page_id;
                while current != INVALID_PAGE_ID {
                    let (header, _) = self.read_content(current)?;
                    self.engine.delete_page(current)?;
                    current = header.next_page_id;
                }
                self.engine.delete_page(entry.meta_page_id)?;

                self.engine.set_table_count(self.engine.table_count() - 1)?;
                info!("table '{}' dropped from the catalog", name);
                return Ok(());
            }
        }
        Err(DbError::TableNotFound(name.to_string()))
    }

    // ------------------------------------------------------------------
    // table metadata pages
    // ------------------------------------------------------------------

    fn read_table_meta(&self, meta_page_id: PageId) -> DbResult<TableInfo> {
        let (_, content) = self.read_content(meta_page_id)?;
        let mut reader = ByteReader::new(&content);
        let schema = TableSchema::decode(&mut reader)?;
        let first_data_page_id = reader.read_i32()?;
        let first_index_page_id = reader.read_i32()?;
        Ok(TableInfo {
            schema,
            meta_page_id,
            first_data_page_id,
            first_index_page_id,
        })
    }

    pub fn write_table_meta(&self, info: &TableInfo) -> DbResult<()> {
        let mut writer = ByteWriter::new();
        info.schema.encode(&mut writer);
        writer.write_i32(info.first_data_page_id);
        writer.write_i32(info.first_index_page_id);
        self.write_content(info.meta_page_id, &writer.into_bytes())
    }

    // ------------------------------------------------------------------
    // index catalog
    // ------------------------------------------------------------------

    fn decode_index_entries(content: &[u8]) -> DbResult<Vec<IndexCatalogEntry>> {
        let mut reader = ByteReader::new(content);
        let count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(IndexCatalogEntry {
                column: reader.read_len_str()?,
                tree_meta_page_id: reader.read_i32()?,
            });
        }
        Ok(entries)
    }

    fn encode_index_entries(entries: &[IndexCatalogEntry]) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u32(entries.len() as u32);
        for entry in entries {
            writer.write_len_str(&entry.column);
            writer.write_i32(entry.tree_meta_page_id);
        }
        writer.into_bytes()
    }

    /// Every index registered for the table.
    pub fn list_indexes(&self, info: &TableInfo) -> DbResult<Vec<IndexCatalogEntry>> {
        let mut all = Vec::new();
        let mut current = info.first_index_page_id;
        while current != INVALID_PAGE_ID {
            let (header, content) = self.read_content(current)?;
            all.extend(Self::decode_index_entries(&content)?);
            current = header.next_page_id;
        }
        Ok(all)
    }

    /// Register an index, growing the index catalog chain as needed.
    /// Returns the updated `TableInfo`.
    pub fn add_index(&self, info: &TableInfo, entry: IndexCatalogEntry) -> DbResult<TableInfo> {
        let capacity = self.engine.page_size() - PAGE_HEADER_SIZE;
        let mut updated = info.clone();

        let mut current = info.first_index_page_id;
        let mut last_page = INVALID_PAGE_ID;
        while current != INVALID_PAGE_ID {
            let (header, content) = self.read_content(current)?;
            let mut entries = Self::decode_index_entries(&content)?;
            entries.push(entry.clone());
            let encoded = Self::encode_index_entries(&entries);
            if encoded.len() <= capacity {
                self.write_content(current, &encoded)?;
                return Ok(updated);
            }
            last_page = current;
            current = header.next_page_id;
        }

        let page_id = self.allocate_system_page()?;
        self.write_content(page_id, &Self::encode_index_entries(&[entry]))?;
        if last_page == INVALID_PAGE_ID {
            updated.first_index_page_id = page_id;
            self.write_table_meta(&updated)?;
        } else {
            self.set_next_link(last_page, page_id)?;
        }
        Ok(updated)
    }

    /// Unregister the index on `column`, returning its tree metadata
    /// page id.
    pub fn remove_index(&self, info: &TableInfo, column: &str) -> DbResult<PageId> {
        let mut current = info.first_index_page_id;
        while current != INVALID_PAGE_ID {
            let (header, content) = self.read_content(current)?;
            let mut entries = Self::decode_index_entries(&content)?;
            if let Some(pos) = entries.iter().position(|e| e.column == column) {
                let removed = entries.remove(pos);
                self.write_content(current, &Self::encode_index_entries(&entries))?;
                return Ok(removed.tree_meta_page_id);
            }
            current = header.next_page_id;
        }
        Err(DbError::IndexNotFound {
            table: info.schema.table_name.clone(),
            column: column.to_string(),
        })
    }
}
