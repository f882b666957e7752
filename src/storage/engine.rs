use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;

use crate::config::DatabaseConfig;
use crate::error::DbResult;
use crate::storage::buffer_pool::{BufferPool, StatsSnapshot};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::Page;
use crate::storage::page_guard::PageGuard;
use crate::types::{PageId, Pod};

/// Top-level storage surface: one paged file fronted by the buffer
/// pool. Everything above this layer (tables, indexes, catalog) speaks
/// in pinned page handles.
pub struct StorageEngine {
    disk_manager: Arc<Mutex<DiskManager>>,
    buffer_pool: BufferPool,
    page_size: usize,
}

impl StorageEngine {
    /// Open or create the paged file at `path` with the pool geometry
    /// from `config`.
    pub fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> DbResult<Self> {
        let disk_manager = Arc::new(Mutex::new(DiskManager::open(path.as_ref(), config.page_size)?));
        let buffer_pool = BufferPool::new(
            config.pool_size,
            config.shard_count,
            Arc::clone(&disk_manager),
        )?;
        info!(
            "storage engine opened {:?} (page_size: {}, pool: {} frames / {} shards)",
            path.as_ref(),
            config.page_size,
            config.pool_size,
            config.shard_count
        );
        Ok(Self {
            disk_manager,
            buffer_pool,
            page_size: config.page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn new_page(&self) -> DbResult<Pod<Page>> {
        self.buffer_pool.new_page()
    }

    pub fn fetch_page(&self, page_id: PageId) -> DbResult<Pod<Page>> {
        self.buffer_pool.fetch_page(page_id)
    }

    /// Allocate a page behind a scoped guard: the pin drops with it.
    pub fn new_guard(&self) -> DbResult<PageGuard<'_>> {
        let page = self.buffer_pool.new_page()?;
        Ok(PageGuard::new(&self.buffer_pool, page))
    }

    /// Fetch a page behind a scoped guard: the pin drops with it.
    pub fn fetch_guard(&self, page_id: PageId) -> DbResult<PageGuard<'_>> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        Ok(PageGuard::new(&self.buffer_pool, page))
    }

    pub fn batch_fetch_pages(&self, ids: &[PageId]) -> DbResult<Vec<Pod<Page>>> {
        self.buffer_pool.batch_fetch_pages(ids)
    }

    pub fn prefetch_page(&self, page_id: PageId) -> DbResult<()> {
        self.buffer_pool.prefetch_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> DbResult<bool> {
        self.buffer_pool.unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> DbResult<bool> {
        self.buffer_pool.flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> DbResult<bool> {
        self.buffer_pool.delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> DbResult<()> {
        self.buffer_pool.flush_all_pages()?;
        self.disk_manager.lock().unwrap().sync()?;
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.buffer_pool.stats().snapshot()
    }

    // page-0 header fields shared with the catalog

    pub fn table_count(&self) -> u32 {
        self.disk_manager.lock().unwrap().table_count()
    }

    pub fn set_table_count(&self, count: u32) -> DbResult<()> {
        self.disk_manager.lock().unwrap().set_table_count(count)
    }

    pub fn first_registry_page_id(&self) -> PageId {
        self.disk_manager.lock().unwrap().first_registry_page_id()
    }

    pub fn set_first_registry_page_id(&self, page_id: PageId) -> DbResult<()> {
        self.disk_manager
            .lock()
            .unwrap()
            .set_first_registry_page_id(page_id)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // a leaked pin means some caller never released a page handle
        debug_assert_eq!(
            self.buffer_pool.total_pins(),
            0,
            "pages still pinned at shutdown"
        );
        let _ = self.buffer_pool.flush_all_pages();
        let _ = self.disk_manager.lock().unwrap().sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::HandyRwLock;
    use tempfile::tempdir;

    #[test]
    fn test_engine_round_trip() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::default();
        let path = dir.path().join("engine.db");

        let id;
        {
            let engine = StorageEngine::open(&path, &config).unwrap();
            let page = engine.new_page().unwrap();
            id = page.rl().get_id();
            page.wl().data_mut()[17] = 0x77;
            drop(page);
            engine.unpin_page(id, true).unwrap();
            engine.flush_all_pages().unwrap();
        }

        let engine = StorageEngine::open(&path, &config).unwrap();
        let page = engine.fetch_page(id).unwrap();
        assert_eq!(page.rl().data()[17], 0x77);
        drop(page);
        engine.unpin_page(id, false).unwrap();
    }
}
