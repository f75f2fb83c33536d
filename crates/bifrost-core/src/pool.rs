//! Generic object pools for hot-path carriers (queue items, plugin
//! pipelines, stream chunks). Production builds keep a plain free-list;
//! debug builds additionally track double-release and leaks with the
//! acquire-site backtrace retained for each live object.

use std::sync::Mutex;

#[cfg(debug_assertions)]
use std::backtrace::Backtrace;
#[cfg(debug_assertions)]
use std::collections::HashMap;

/// A poolable carrier. The release contract is that every field is cleared
/// (`reset`) by the caller before the object goes back; `is_reset` lets
/// debug builds verify it. `retained_bytes` reports internal buffer
/// capacity so oversized carriers can be dropped instead of cached.
pub trait PoolItem: Default + Send + 'static {
    fn reset(&mut self);

    fn is_reset(&self) -> bool {
        true
    }

    fn retained_bytes(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Free-list cap; excess releases are dropped.
    pub max_idle: usize,
    /// Carriers retaining more buffer capacity than this are not recycled.
    pub max_retained_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 256,
            max_retained_bytes: 64 * 1024,
        }
    }
}

pub struct ObjectPool<T: PoolItem> {
    config: PoolConfig,
    free: Mutex<Vec<Box<T>>>,
    #[cfg(debug_assertions)]
    live: Mutex<HashMap<usize, Backtrace>>,
}

impl<T: PoolItem> ObjectPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free: Mutex::new(Vec::new()),
            #[cfg(debug_assertions)]
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Pops a recycled carrier or allocates a fresh one. The caller owns the
    /// box until it is released; ownership transfer is what makes the pool
    /// safe for concurrent producers and consumers.
    pub fn acquire(&self) -> Box<T> {
        let item = self
            .free
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .unwrap_or_default();
        #[cfg(debug_assertions)]
        {
            let addr = &*item as *const T as usize;
            self.live
                .lock()
                .expect("pool lock poisoned")
                .insert(addr, Backtrace::capture());
        }
        item
    }

    pub fn release(&self, item: Box<T>) {
        debug_assert!(
            item.is_reset(),
            "carrier released to pool without being zeroed"
        );
        #[cfg(debug_assertions)]
        {
            let addr = &*item as *const T as usize;
            if self
                .live
                .lock()
                .expect("pool lock poisoned")
                .remove(&addr)
                .is_none()
            {
                tracing::warn!("release of a carrier this pool did not hand out (double release?)");
            }
        }
        if item.retained_bytes() > self.config.max_retained_bytes {
            return;
        }
        let mut free = self.free.lock().expect("pool lock poisoned");
        if free.len() < self.config.max_idle {
            free.push(item);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }

    /// Carriers currently handed out (debug builds only).
    #[cfg(debug_assertions)]
    pub fn outstanding(&self) -> usize {
        self.live.lock().expect("pool lock poisoned").len()
    }
}

#[cfg(debug_assertions)]
impl<T: PoolItem> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let live = self.live.lock().expect("pool lock poisoned");
        if !live.is_empty() {
            tracing::warn!(leaked = live.len(), "pool dropped with live carriers");
            for site in live.values() {
                tracing::debug!(acquired_at = %site, "leaked carrier");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        buf: Vec<u8>,
        tag: u32,
    }

    impl PoolItem for Scratch {
        fn reset(&mut self) {
            self.buf.clear();
            self.tag = 0;
        }

        fn is_reset(&self) -> bool {
            self.buf.is_empty() && self.tag == 0
        }

        fn retained_bytes(&self) -> usize {
            self.buf.capacity()
        }
    }

    #[test]
    fn recycles_released_carriers() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(PoolConfig::default());
        let mut a = pool.acquire();
        a.tag = 7;
        a.reset();
        pool.release(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire();
        assert_eq!(b.tag, 0);
        assert_eq!(pool.idle(), 0);
        let mut b = b;
        b.reset();
        pool.release(b);
    }

    #[test]
    fn oversized_buffers_are_not_recycled() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(PoolConfig {
            max_idle: 8,
            max_retained_bytes: 16,
        });
        let mut item = pool.acquire();
        item.buf.reserve(1024);
        item.reset();
        // reset() clears contents but keeps capacity, which is the point:
        // the capacity check decides recycling.
        pool.release(item);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn free_list_is_bounded() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(PoolConfig {
            max_idle: 2,
            max_retained_bytes: 1024,
        });
        let items: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        for mut item in items {
            item.reset();
            pool.release(item);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn tracks_outstanding_in_debug() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(PoolConfig::default());
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.outstanding(), 2);
        let (mut a, mut b) = (a, b);
        a.reset();
        b.reset();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn concurrent_acquire_release() {
        use std::sync::Arc;
        let pool = Arc::new(ObjectPool::<Scratch>::new(PoolConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let mut item = pool.acquire();
                    item.tag = 1;
                    item.reset();
                    pool.release(item);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        #[cfg(debug_assertions)]
        assert_eq!(pool.outstanding(), 0);
    }
}
