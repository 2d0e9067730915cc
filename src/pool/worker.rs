//! Fixed-size worker pool.
//!
//! N threads are spawned up front and loop on a shared FIFO guarded by
//! a mutex and condition variable. Tasks start in submission order and
//! are never dropped; the queue is unbounded (each connection has at
//! most one task in flight, so the reactor is the natural limiter).
//! Dropping the pool drains the queue, then joins every worker.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    ready: Condvar,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        assert!(threads > 0, "worker pool needs at least one thread");
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("hearth-worker-{i}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        Ok(Self { shared, workers })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task and wake one idle worker. Tasks own their errors;
    /// nothing may unwind out of the closure.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Box::new(task));
        }
        self.shared.ready.notify_one();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.ready.wait(&mut state);
            }
        };
        task();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn runs_every_submitted_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(4).expect("spawn pool");
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn single_worker_preserves_submission_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pool = WorkerPool::new(1).expect("spawn pool");
        for i in 0..20 {
            let log = Arc::clone(&log);
            pool.submit(move || log.lock().unwrap().push(i));
        }
        drop(pool);
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn drop_drains_before_joining() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(2).expect("spawn pool");
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
