//! Fixed-size blocking object pool.
//!
//! A `BoundedPool` holds a fixed set of handles; `get` blocks until
//! one is free and hands back a [`PoolGuard`] that dereferences to the
//! handle and returns it on drop, so every exit path gives the handle
//! back. Returned handles are accepted as-is; whether a handle is
//! still usable is the caller's concern.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct PoolInner<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

pub struct BoundedPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for BoundedPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BoundedPool<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        let items: VecDeque<T> = items.into_iter().collect();
        let capacity = items.len();
        Self {
            inner: Arc::new(PoolInner {
                items: Mutex::new(items),
                available: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Check a handle out, blocking while none are free.
    pub fn get(&self) -> PoolGuard<T> {
        let mut items = self.inner.items.lock();
        let item = loop {
            if let Some(item) = items.pop_front() {
                break item;
            }
            self.inner.available.wait(&mut items);
        };
        PoolGuard {
            item: Some(item),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Remove every currently-free handle from the pool.
    pub fn drain(&self) -> Vec<T> {
        self.inner.items.lock().drain(..).collect()
    }
}

pub struct PoolGuard<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool guard already released")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pool guard already released")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.items.lock().push_back(item);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn checkout_and_return_balance() {
        let pool = BoundedPool::new(vec![1u32, 2, 3]);
        assert_eq!(pool.capacity(), 3);

        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.available() + 2, pool.capacity());

        drop(a);
        drop(b);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn guard_derefs_to_the_handle() {
        let pool = BoundedPool::new(vec![String::from("conn")]);
        let mut guard = pool.get();
        guard.push_str("-in-use");
        drop(guard);
        assert_eq!(pool.get().as_str(), "conn-in-use");
    }

    #[test]
    fn get_blocks_until_a_handle_returns() {
        let pool = BoundedPool::new(vec![0u8]);
        let held = pool.get();

        let contender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let guard = pool.get();
                *guard
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(contender.join().unwrap(), 0);
    }

    #[test]
    fn drain_empties_the_free_list() {
        let pool = BoundedPool::new(vec![1, 2, 3]);
        let held = pool.get();
        assert_eq!(pool.drain().len(), 2);
        drop(held);
        assert_eq!(pool.available(), 1);
    }
}
