use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::error::{DbError, DbResult};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::Page;
use crate::types::{PageId, Pod};
use crate::utils::HandyRwLock;

/// Performance counters, all updated with relaxed atomics.
#[derive(Default)]
pub struct BufferPoolStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub evictions: AtomicU64,
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
}

impl BufferPoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
        }
    }
}

/// An in-memory slot holding one cached page plus its bookkeeping.
struct Frame {
    page: Pod<Page>,
    pin_count: u32,
    dirty: bool,
    last_used: u64,
}

struct Shard {
    frames: HashMap<PageId, Frame>,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            frames: HashMap::new(),
            capacity,
        }
    }
}

/// Bounded page cache between the upper layers and the disk manager.
///
/// Frames are partitioned across power-of-two shards by
/// `page_id & (shard_count - 1)`; each shard is an independent LRU
/// domain behind its own mutex, so the single-shard configuration is
/// exactly the simple global-lock pool. A page is loaded while the
/// owning shard's mutex is held, which makes concurrent fetches of the
/// same page wait for the first load instead of issuing duplicate
/// reads.
pub struct BufferPool {
    shards: Vec<Mutex<Shard>>,
    shard_mask: usize,
    disk_manager: Arc<Mutex<DiskManager>>,
    page_size: usize,
    clock: AtomicU64,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// `shard_count` must be a power of two; each shard gets an equal
    /// split of `pool_size` frames (at least one).
    pub fn new(
        pool_size: usize,
        shard_count: usize,
        disk_manager: Arc<Mutex<DiskManager>>,
    ) -> DbResult<Self> {
        if pool_size == 0 {
            return Err(DbError::invalid("pool_size must be positive"));
        }
        if !shard_count.is_power_of_two() {
            return Err(DbError::invalid(format!(
                "shard_count {} is not a power of two",
                shard_count
            )));
        }

        let per_shard = std::cmp::max(1, pool_size / shard_count);
        let page_size = disk_manager.lock().unwrap().page_size();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();

        Ok(Self {
            shards,
            shard_mask: shard_count - 1,
            disk_manager,
            page_size,
            clock: AtomicU64::new(0),
            stats: BufferPoolStats::default(),
        })
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    pub fn pool_size(&self) -> usize {
        self.shards.len() * self.shards[0].lock().unwrap().capacity
    }

    fn shard_for(&self, page_id: PageId) -> &Mutex<Shard> {
        &self.shards[page_id as usize & self.shard_mask]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a fresh page on disk and return it pinned (count 1),
    /// zero-initialized and dirty.
    pub fn new_page(&self) -> DbResult<Pod<Page>> {
        let page_id = {
            let mut dm = self.disk_manager.lock().unwrap();
            dm.allocate_page()?
        };

        let mut shard = self.shard_for(page_id).lock().unwrap();
        self.make_room(&mut shard)?;

        let page = Arc::new(RwLock::new(Page::new(page_id, self.page_size)));
        shard.frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                dirty: true,
                last_used: self.tick(),
            },
        );
        debug!("new page {} pinned into pool", page_id);
        Ok(page)
    }

    /// Return the cached frame for `page_id`, loading it from disk on a
    /// miss. The pin count is incremented either way.
    pub fn fetch_page(&self, page_id: PageId) -> DbResult<Pod<Page>> {
        if page_id < 0 {
            return Err(DbError::PageNotFound(page_id));
        }

        let mut shard = self.shard_for(page_id).lock().unwrap();

        if let Some(frame) = shard.frames.get_mut(&page_id) {
            frame.pin_count += 1;
            frame.last_used = self.tick();
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&frame.page));
        }

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.make_room(&mut shard)?;

        // the shard stays locked across the read so a second fetch of
        // this page blocks instead of reading it twice
        let mut page = Page::new(page_id, self.page_size);
        {
            let mut dm = self.disk_manager.lock().unwrap();
            dm.read_page(page_id, page.data_mut())?;
        }
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

        let pod = Arc::new(RwLock::new(page));
        shard.frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&pod),
                pin_count: 1,
                dirty: false,
                last_used: self.tick(),
            },
        );
        Ok(pod)
    }

    /// Fetch several pages, returning frames in the order of `ids`.
    pub fn batch_fetch_pages(&self, ids: &[PageId]) -> DbResult<Vec<Pod<Page>>> {
        let mut frames = Vec::with_capacity(ids.len());
        for &id in ids {
            frames.push(self.fetch_page(id)?);
        }
        Ok(frames)
    }

    /// Warm the cache with `page_id` without pinning it. Single-page
    /// contracts are unaffected.
    pub fn prefetch_page(&self, page_id: PageId) -> DbResult<()> {
        if page_id < 0 {
            return Err(DbError::PageNotFound(page_id));
        }

        let mut shard = self.shard_for(page_id).lock().unwrap();
        if shard.frames.contains_key(&page_id) {
            return Ok(());
        }

        self.make_room(&mut shard)?;
        let mut page = Page::new(page_id, self.page_size);
        {
            let mut dm = self.disk_manager.lock().unwrap();
            dm.read_page(page_id, page.data_mut())?;
        }
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        shard.frames.insert(
            page_id,
            Frame {
                page: Arc::new(RwLock::new(page)),
                pin_count: 0,
                dirty: false,
                last_used: self.tick(),
            },
        );
        Ok(())
    }

    /// Drop one pin and accumulate the dirty flag. Unpinning never
    /// evicts by itself.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> DbResult<bool> {
        let mut shard = self.shard_for(page_id).lock().unwrap();
        let frame = shard
            .frames
            .get_mut(&page_id)
            .ok_or(DbError::PageNotFound(page_id))?;

        if frame.pin_count == 0 {
            return Err(DbError::invalid(format!(
                "unpin of page {} with pin count already 0",
                page_id
            )));
        }
        frame.pin_count -= 1;
        frame.dirty |= is_dirty;
        frame.last_used = self.tick();
        Ok(true)
    }

    /// Write the page through to disk if dirty. Pin count untouched.
    /// Returns whether a write happened.
    pub fn flush_page(&self, page_id: PageId) -> DbResult<bool> {
        let mut shard = self.shard_for(page_id).lock().unwrap();
        let frame = match shard.frames.get_mut(&page_id) {
            Some(f) => f,
            None => return Ok(false),
        };
        if !frame.dirty {
            return Ok(false);
        }

        {
            let page = frame.page.rl();
            let mut dm = self.disk_manager.lock().unwrap();
            dm.write_page(page_id, page.data())?;
        }
        frame.dirty = false;
        self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Evict `page_id` without flushing and return it to the disk
    /// manager's freelist. Fails on a pinned page.
    pub fn delete_page(&self, page_id: PageId) -> DbResult<bool> {
        {
            let mut shard = self.shard_for(page_id).lock().unwrap();
            if let Some(frame) = shard.frames.get(&page_id) {
                if frame.pin_count > 0 {
                    return Err(DbError::PagePinned(page_id));
                }
                shard.frames.remove(&page_id);
            }
        }

        let mut dm = self.disk_manager.lock().unwrap();
        dm.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Flush every dirty frame in every shard.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let dirty_ids: Vec<PageId> = shard
                .frames
                .iter()
                .filter(|(_, f)| f.dirty)
                .map(|(&id, _)| id)
                .collect();
            for id in dirty_ids {
                let frame = shard.frames.get_mut(&id).unwrap();
                {
                    let page = frame.page.rl();
                    let mut dm = self.disk_manager.lock().unwrap();
                    dm.write_page(id, page.data())?;
                }
                frame.dirty = false;
                self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Sum of pin counts across every frame. Zero at shutdown unless a
    /// caller leaked a pin.
    pub fn total_pins(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .unwrap()
                    .frames
                    .values()
                    .map(|f| f.pin_count as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    /// Number of resident pages, over all shards.
    pub fn resident_pages(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().frames.len()).sum()
    }

    /// Make space for one more frame in the shard, evicting the least
    /// recently used unpinned frame if the shard is at capacity.
    fn make_room(&self, shard: &mut Shard) -> DbResult<()> {
        if shard.frames.len() < shard.capacity {
            return Ok(());
        }

        let victim = shard
            .frames
            .iter()
            .filter(|(_, f)| f.pin_count == 0)
            .min_by_key(|(_, f)| f.last_used)
            .map(|(&id, _)| id)
            .ok_or(DbError::BufferFull)?;

        let frame = shard.frames.remove(&victim).unwrap();
        if frame.dirty {
            let page = frame.page.rl();
            let mut dm = self.disk_manager.lock().unwrap();
            dm.write_page(victim, page.data())?;
            self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("evicted page {} (dirty: {})", victim, frame.dirty);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_pool(pool_size: usize, shard_count: usize) -> (BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("test.db"), 512).unwrap();
        let pool = BufferPool::new(pool_size, shard_count, Arc::new(Mutex::new(dm))).unwrap();
        (pool, dir)
    }

    #[test]
    fn test_new_page_pinned_and_dirty() {
        let (pool, _dir) = new_pool(4, 1);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        assert_eq!(id, 1);
        assert_eq!(pool.total_pins(), 1);
        pool.unpin_page(id, false).unwrap();
        assert_eq!(pool.total_pins(), 0);
    }

    #[test]
    fn test_fetch_hit_and_miss_counters() {
        let (pool, _dir) = new_pool(4, 1);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        pool.unpin_page(id, true).unwrap();
        pool.flush_page(id).unwrap();

        let _again = pool.fetch_page(id).unwrap();
        pool.unpin_page(id, false).unwrap();

        let snapshot = pool.stats().snapshot();
        assert!(snapshot.cache_hits >= 1);
    }

    #[test]
    fn test_unpin_below_zero_rejected() {
        let (pool, _dir) = new_pool(4, 1);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        pool.unpin_page(id, false).unwrap();
        assert!(pool.unpin_page(id, false).is_err());
    }

    #[test]
    fn test_lru_eviction_order() {
        let (pool, _dir) = new_pool(4, 1);

        // fill the pool with four unpinned pages
        let mut ids = Vec::new();
        for _ in 0..4 {
            let page = pool.new_page().unwrap();
            let id = page.rl().get_id();
            pool.unpin_page(id, false).unwrap();
            ids.push(id);
        }

        // touch every page except the first, making ids[0] the LRU
        for &id in &ids[1..] {
            pool.fetch_page(id).unwrap();
            pool.unpin_page(id, false).unwrap();
        }

        // a fifth page forces exactly one eviction
        let page = pool.new_page().unwrap();
        pool.unpin_page(page.rl().get_id(), false).unwrap();

        assert_eq!(pool.stats().snapshot().evictions, 1);
        // the victim was ids[0]: fetching it again is a miss
        let misses_before = pool.stats().snapshot().cache_misses;
        pool.fetch_page(ids[0]).unwrap();
        pool.unpin_page(ids[0], false).unwrap();
        assert_eq!(pool.stats().snapshot().cache_misses, misses_before + 1);
    }

    #[test]
    fn test_all_pinned_is_buffer_full() {
        let (pool, _dir) = new_pool(2, 1);
        let _a = pool.new_page().unwrap();
        let _b = pool.new_page().unwrap();
        assert!(matches!(pool.new_page(), Err(DbError::BufferFull)));
    }

    #[test]
    fn test_dirty_page_flushed_on_eviction() {
        let (pool, _dir) = new_pool(1, 1);

        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        page.wl().data_mut()[100] = 0x42;
        drop(page);
        pool.unpin_page(id, true).unwrap();

        // loading a second page evicts and must flush the first
        let other = pool.new_page().unwrap();
        pool.unpin_page(other.rl().get_id(), false).unwrap();

        let back = pool.fetch_page(id).unwrap();
        assert_eq!(back.rl().data()[100], 0x42);
        pool.unpin_page(id, false).unwrap();
    }

    #[test]
    fn test_delete_pinned_page_fails() {
        let (pool, _dir) = new_pool(4, 1);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        assert!(matches!(pool.delete_page(id), Err(DbError::PagePinned(_))));
        pool.unpin_page(id, false).unwrap();
        pool.delete_page(id).unwrap();
    }

    #[test]
    fn test_sharded_pool_behaves_like_simple() {
        let (pool, _dir) = new_pool(16, 4);
        let mut ids = Vec::new();
        for i in 0..8u8 {
            let page = pool.new_page().unwrap();
            let id = page.rl().get_id();
            page.wl().data_mut()[0] = i;
            drop(page);
            pool.unpin_page(id, true).unwrap();
            ids.push(id);
        }
        pool.flush_all_pages().unwrap();

        for (i, &id) in ids.iter().enumerate() {
            let page = pool.fetch_page(id).unwrap();
            assert_eq!(page.rl().data()[0], i as u8);
            pool.unpin_page(id, false).unwrap();
        }
    }

    #[test]
    fn test_prefetch_does_not_pin() {
        let (pool, _dir) = new_pool(4, 1);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        page.wl().data_mut()[0] = 9;
        drop(page);
        pool.unpin_page(id, true).unwrap();
        pool.flush_all_pages().unwrap();

        // evict everything by filling the pool
        for _ in 0..4 {
            let p = pool.new_page().unwrap();
            pool.unpin_page(p.rl().get_id(), false).unwrap();
        }

        pool.prefetch_page(id).unwrap();
        assert_eq!(pool.total_pins(), 0);

        // now resident: fetching is a hit
        let hits_before = pool.stats().snapshot().cache_hits;
        let back = pool.fetch_page(id).unwrap();
        assert_eq!(back.rl().data()[0], 9);
        pool.unpin_page(id, false).unwrap();
        assert_eq!(pool.stats().snapshot().cache_hits, hits_before + 1);
    }

    #[test]
    fn test_concurrent_fetches() {
        use std::thread;

        let (pool, _dir) = new_pool(8, 4);
        let page = pool.new_page().unwrap();
        let id = page.rl().get_id();
        page.wl().data_mut()[0] = 0x5A;
        drop(page);
        pool.unpin_page(id, true).unwrap();

        let pool = Arc::new(pool);
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let page = pool.fetch_page(id).unwrap();
                    assert_eq!(page.rl().data()[0], 0x5A);
                    drop(page);
                    pool.unpin_page(id, false).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.total_pins(), 0);
    }
}
