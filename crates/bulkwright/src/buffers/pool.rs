use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::trace;

use super::BulkBuffer;

/// 📏 Smallest size class the byte pool bothers with. Anything smaller is cheaper to just allocate.
const MIN_SIZE_CLASS: usize = 1024;

fn default_max_items() -> usize {
    100
}

fn default_max_size_in_bytes() -> usize {
    // 🐘 64 MiB. Bigger than the biggest sane bulk batch, smaller than regret.
    64 * 1024 * 1024
}

fn default_initial_capacity() -> usize {
    64 * 1024
}

/// 🔧 Pool knobs. Lives under `[pool]` in the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// 🧺 Idle buffers kept per pool (and per size class in the byte pool).
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// 🐘 Byte storage above this capacity is dropped on return instead of hoarded.
    #[serde(default = "default_max_size_in_bytes")]
    pub max_size_in_bytes: usize,
    /// 🌱 Capacity a fresh buffer starts with when the byte pool has nothing to give.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_size_in_bytes: default_max_size_in_bytes(),
            initial_capacity: default_initial_capacity(),
        }
    }
}

/// 📊 A snapshot of pool counters. Cheap to take, instantly stale, like all metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub allocated: u64,
    pub idle_buffers: usize,
    pub byte_hits: u64,
    pub byte_misses: u64,
    pub byte_discarded: u64,
}

fn size_class_for_request(min_capacity: usize) -> usize {
    let wanted = min_capacity.max(MIN_SIZE_CLASS);
    wanted.checked_next_power_of_two().unwrap_or(wanted)
}

/// 📐 Largest power of two that fits inside `capacity`. A Vec filed under class N is
/// guaranteed to hold at least N bytes.
fn size_class_for_storage(capacity: usize) -> usize {
    1usize << (usize::BITS - 1 - capacity.leading_zeros())
}

/// ♻️ Recycles `Vec<u8>` storage, bucketed by power-of-two capacity.
#[derive(Debug)]
pub struct BytePool {
    classes: Mutex<BTreeMap<usize, Vec<Vec<u8>>>>,
    max_items: usize,
    max_size_in_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl BytePool {
    pub fn new(max_items: usize, max_size_in_bytes: usize) -> Self {
        Self {
            classes: Mutex::new(BTreeMap::new()),
            max_items,
            max_size_in_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// 🎣 An empty Vec with capacity for at least `min_capacity` bytes.
    ///
    /// Takes from the smallest non-empty class that fits, so storage that grew past the
    /// request on its last trip still gets handed out again.
    pub fn get(&self, min_capacity: usize) -> Vec<u8> {
        let class = size_class_for_request(min_capacity);
        let recycled = self
            .classes
            .lock()
            .range_mut(class..)
            .find_map(|(_, idle)| idle.pop());
        match recycled {
            Some(storage) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                storage
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(class)
            }
        }
    }

    /// 🔙 Hand storage back. Too small, too big, or too many of its kind: dropped.
    pub fn put(&self, mut storage: Vec<u8>) {
        let capacity = storage.capacity();
        if capacity < MIN_SIZE_CLASS || capacity > self.max_size_in_bytes {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!("🗑️ dropping {} byte storage instead of pooling it", capacity);
            return;
        }
        storage.clear();
        let class = size_class_for_storage(capacity);
        let mut classes = self.classes.lock();
        let idle = classes.entry(class).or_default();
        if idle.len() >= self.max_items {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        idle.push(storage);
    }

    pub fn idle(&self) -> usize {
        self.classes.lock().values().map(Vec::len).sum()
    }
}

/// 🧺 The bulk buffer pool. Wrap it in an `Arc` and call `acquire`.
#[derive(Debug)]
pub struct BulkBufferPool {
    idle: Mutex<Vec<BulkBuffer>>,
    bytes: BytePool,
    config: PoolConfig,
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

impl BulkBufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            bytes: BytePool::new(config.max_items, config.max_size_in_bytes),
            config,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    /// 🎟️ A reset buffer wrapped in a guard that returns it on drop.
    pub fn acquire(self: &Arc<Self>) -> PooledBulkBuffer {
        PooledBulkBuffer {
            pool: Arc::clone(self),
            buffer: Some(self.take()),
        }
    }

    /// 🎣 Unguarded acquire. Pair it with `give_back`, or let the buffer drop and
    /// accept that the pool will allocate a new one next time.
    pub fn take(&self) -> BulkBuffer {
        let recycled = self.idle.lock().pop();
        let mut buffer = recycled.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            BulkBuffer::new()
        });
        if buffer.capacity() == 0 {
            buffer.adopt_storage(self.bytes.get(self.config.initial_capacity));
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    /// 🔙 Reset the buffer and keep it around. Byte storage goes to the byte pool, the
    /// empty shell goes to the idle list.
    pub fn give_back(&self, mut buffer: BulkBuffer) {
        self.released.fetch_add(1, Ordering::Relaxed);
        buffer.reset();
        self.bytes.put(buffer.take_storage());
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_items {
            idle.push(buffer);
        }
        trace!(
            "🔙 buffer back in the pool: {} idle, {} acquired, {} released, {} allocated",
            idle.len(),
            self.acquired.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
            self.allocated.load(Ordering::Relaxed)
        );
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            idle_buffers: self.idle.lock().len(),
            byte_hits: self.bytes.hits.load(Ordering::Relaxed),
            byte_misses: self.bytes.misses.load(Ordering::Relaxed),
            byte_discarded: self.bytes.discarded.load(Ordering::Relaxed),
        }
    }
}

/// 🎟️ RAII handle for a pooled `BulkBuffer`. Derefs to the buffer, returns it on drop.
#[derive(Debug)]
pub struct PooledBulkBuffer {
    pool: Arc<BulkBufferPool>,
    buffer: Option<BulkBuffer>,
}

impl PooledBulkBuffer {
    /// 🪂 Keep the buffer and walk away from the pool. The pool will not miss it.
    pub fn detach(mut self) -> BulkBuffer {
        self.buffer.take().unwrap_or_default()
    }
}

impl Deref for PooledBulkBuffer {
    type Target = BulkBuffer;

    fn deref(&self) -> &BulkBuffer {
        // -- the Option is only None after detach() consumed self, so this arm is unreachable
        // -- in practice. An empty static stands in rather than a panic.
        match &self.buffer {
            Some(buffer) => buffer,
            None => &EMPTY,
        }
    }
}

impl DerefMut for PooledBulkBuffer {
    fn deref_mut(&mut self) -> &mut BulkBuffer {
        self.buffer.get_or_insert_with(BulkBuffer::new)
    }
}

impl Drop for PooledBulkBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}

static EMPTY: BulkBuffer = BulkBuffer::EMPTY;

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_pool(max_items: usize, max_size_in_bytes: usize) -> Arc<BulkBufferPool> {
        Arc::new(BulkBufferPool::new(PoolConfig {
            max_items,
            max_size_in_bytes,
            initial_capacity: 2048,
        }))
    }

    #[test]
    fn the_one_where_a_dropped_guard_comes_home_clean() {
        let pool = tiny_pool(4, 1024 * 1024);
        {
            let mut buffer = pool.acquire();
            buffer.queue = "orders".into();
            buffer.add("m1", b"{\"index\":{}}");
            buffer.set_response_status(0, 201);
        }

        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.idle_buffers, 1);

        let again = pool.acquire();
        assert!(again.is_empty());
        assert!(again.queue.is_empty());
        assert_eq!(again.message_count(), 0);
        assert!(again.message_status(false).is_empty());
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn the_one_where_storage_gets_recycled_by_size_class() {
        let pool = tiny_pool(4, 1024 * 1024);
        drop(pool.acquire());
        let _second = pool.acquire();

        let stats = pool.stats();
        assert_eq!(stats.byte_misses, 1);
        assert_eq!(stats.byte_hits, 1);
    }

    #[test]
    fn the_one_where_oversized_storage_is_not_hoarded() {
        let pool = tiny_pool(4, 4096);
        {
            let mut buffer = pool.acquire();
            buffer.write(&vec![b'x'; 64 * 1024]);
        }
        let stats = pool.stats();
        assert_eq!(stats.byte_discarded, 1);
        assert_eq!(pool.bytes.idle(), 0);
    }

    #[test]
    fn the_one_where_the_byte_pool_respects_its_item_cap() {
        let bytes = BytePool::new(1, 1024 * 1024);
        bytes.put(Vec::with_capacity(4096));
        bytes.put(Vec::with_capacity(4096));
        assert_eq!(bytes.idle(), 1);
        assert_eq!(bytes.discarded.load(Ordering::Relaxed), 1);

        let storage = bytes.get(3000);
        assert!(storage.capacity() >= 3000);
        assert!(storage.is_empty());
    }

    #[test]
    fn the_one_where_detach_skips_the_return_trip() {
        let pool = tiny_pool(4, 1024 * 1024);
        let mut guard = pool.acquire();
        guard.add("m1", b"{}");
        let owned = guard.detach();

        assert_eq!(owned.message_count(), 1);
        assert_eq!(pool.stats().released, 0);
    }

    #[test]
    fn the_one_where_grown_storage_gets_handed_out_again() {
        let pool = tiny_pool(4, 4 * 1024 * 1024);
        for _ in 0..5 {
            let mut buffer = pool.acquire();
            buffer.write(&vec![b'x'; 1024 * 1024]);
        }

        let stats = pool.stats();
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.byte_misses, 1);
        assert_eq!(stats.byte_hits, 4);
        assert!(pool.acquire().capacity() >= 1024 * 1024);
    }

    #[test]
    fn the_one_where_the_byte_pool_prefers_the_tightest_fit() {
        let bytes = BytePool::new(4, 1024 * 1024);
        bytes.put(Vec::with_capacity(256 * 1024));
        bytes.put(Vec::with_capacity(8 * 1024));

        assert_eq!(bytes.get(2048).capacity(), 8 * 1024);
        assert!(bytes.get(2048).capacity() >= 256 * 1024);
        assert!(bytes.get(2048).capacity() >= 2048);
        assert_eq!(bytes.hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn the_one_where_sixteen_threads_never_share_a_buffer() {
        let pool = tiny_pool(16, 1024 * 1024);
        std::thread::scope(|scope| {
            for worker in 0..16u8 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for round in 0..1000usize {
                        let mut buffer = pool.acquire();
                        assert!(buffer.is_empty());
                        let line = [b'a' + worker; 8];
                        buffer.add(&round.to_string(), &line);
                        std::thread::yield_now();
                        assert_eq!(buffer.as_bytes(), &line);
                        assert_eq!(buffer.message_count(), 1);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.acquired, 16_000);
        assert_eq!(stats.released, 16_000);
        assert!(stats.allocated <= 16);
        assert!(stats.idle_buffers <= 16);
    }

    #[test]
    fn the_one_where_size_classes_round_the_right_way() {
        assert_eq!(size_class_for_request(10), MIN_SIZE_CLASS);
        assert_eq!(size_class_for_request(3000), 4096);
        assert_eq!(size_class_for_storage(4096), 4096);
        assert_eq!(size_class_for_storage(5000), 4096);
    }
}
