use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::Page;
use crate::types::{PageId, Pod};
use crate::utils::HandyRwLock;

/// A pinned borrow of a buffer pool frame.
///
/// The pin taken at fetch time is released when the guard drops, so a
/// caller cannot leak it on an early return or panic. Dirtiness stays
/// explicit: call [`PageGuard::mark_dirty`] after mutating through
/// [`PageGuard::write`], exactly as `UnpinPage(id, is_dirty)` would be
/// told. Probing a page through `write` without mutating it leaves the
/// frame clean.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page: Pod<Page>,
    page_id: PageId,
    dirty: bool,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, page: Pod<Page>) -> Self {
        let page_id = page.rl().get_id();
        Self {
            pool,
            page,
            page_id,
            dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.rl()
    }

    pub fn write(&mut self) -> RwLockWriteGuard<'_, Page> {
        self.page.wl()
    }

    /// Record that the page content changed; the pin is released with
    /// `is_dirty = true`.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // unpin can only fail if the bookkeeping is already broken;
        // a Drop impl has nowhere to report that
        let _ = self.pool.unpin_page(self.page_id, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatabaseConfig;
    use crate::storage::engine::StorageEngine;
    use tempfile::tempdir;

    #[test]
    fn test_guard_releases_pin_on_drop() {
        let dir = tempdir().unwrap();
        let engine =
            StorageEngine::open(dir.path().join("guard.db"), &DatabaseConfig::default()).unwrap();

        let id = {
            let mut guard = engine.new_guard().unwrap();
            guard.write().data_mut()[40] = 0x11;
            guard.mark_dirty();
            guard.page_id()
        };

        // the pin is gone: the page can be deleted right away
        engine.delete_page(id).unwrap();
    }

    #[test]
    fn test_guard_dirtiness_is_explicit() {
        let dir = tempdir().unwrap();
        let engine =
            StorageEngine::open(dir.path().join("guard.db"), &DatabaseConfig::default()).unwrap();

        let id = {
            let mut guard = engine.new_guard().unwrap();
            guard.write().data_mut()[0] = 0xAA;
            guard.mark_dirty();
            guard.page_id()
        };
        engine.flush_all_pages().unwrap();

        // mutate through a guard that never marks dirty: the change
        // stays in memory but a flush writes nothing for this page
        {
            let mut guard = engine.fetch_guard(id).unwrap();
            guard.write().data_mut()[0] = 0xBB;
        }
        let written_before = engine.stats().pages_written;
        engine.flush_all_pages().unwrap();
        assert_eq!(engine.stats().pages_written, written_before);
    }
}
