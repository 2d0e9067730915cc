//! Idle-connection timer: a binary min-heap of deadlines plus an
//! id -> index map, so per-connection entries can be extended or
//! dropped in O(log n). Deadlines use the monotonic clock; wall-clock
//! jumps never expire entries early.
//!
//! Callbacks run synchronously on the thread calling [`TimerHeap::tick`]
//! or [`TimerHeap::next_tick_ms`].

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::warn;

pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: RawFd,
    deadline: Instant,
    cb: TimeoutCallback,
}

pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: RawFd) -> bool {
        self.index.contains_key(&id)
    }

    /// Arm `id` to fire after `timeout`. An already-armed id has its
    /// deadline and callback replaced in place.
    pub fn add(&mut self, id: RawFd, timeout: Duration, cb: TimeoutCallback) {
        let deadline = Instant::now() + timeout;
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].deadline = deadline;
            self.heap[i].cb = cb;
            if !self.sift_down(i) {
                self.sift_up(i);
            }
        } else {
            let i = self.heap.len();
            self.heap.push(TimerNode { id, deadline, cb });
            self.index.insert(id, i);
            self.sift_up(i);
        }
    }

    /// Push an armed id's deadline out to now + `timeout`.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        let Some(&i) = self.index.get(&id) else {
            debug_assert!(false, "adjust on unknown timer id {id}");
            warn!(id, "adjust on unknown timer id");
            return;
        };
        self.heap[i].deadline = Instant::now() + timeout;
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    pub fn del(&mut self, id: RawFd) {
        let Some(&i) = self.index.get(&id) else {
            debug_assert!(false, "del on unknown timer id {id}");
            warn!(id, "del on unknown timer id");
            return;
        };
        self.remove_at(i);
    }

    /// Fire `id`'s callback now and drop the entry.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(&i) = self.index.get(&id) {
            let mut node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Fire every entry whose deadline has passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            let mut node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Fire due entries, then report the milliseconds until the next
    /// deadline (0 if already due again, -1 if the heap is empty).
    pub fn next_tick_ms(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            Some(root) => {
                let remaining = root.deadline.saturating_duration_since(Instant::now());
                i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX)
            }
            None => -1,
        }
    }

    /// Drop every entry without firing it.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i != last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop().expect("remove_at on empty heap");
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
        node
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].deadline <= self.heap[i].deadline {
                break;
            }
            self.swap_nodes(parent, i);
            i = parent;
        }
    }

    // Returns true if the node moved, so callers know to try the other
    // direction instead.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let mut child = 2 * i + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[i].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;

    fn recorder(log: &Arc<Mutex<Vec<RawFd>>>, id: RawFd) -> TimeoutCallback {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(id))
    }

    fn assert_valid(timer: &TimerHeap) {
        for i in 1..timer.heap.len() {
            let parent = (i - 1) / 2;
            assert!(timer.heap[parent].deadline <= timer.heap[i].deadline);
        }
        assert_eq!(timer.index.len(), timer.heap.len());
        for (i, node) in timer.heap.iter().enumerate() {
            assert_eq!(timer.index[&node.id], i);
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timer = TimerHeap::new();
        timer.add(3, Duration::from_millis(30), recorder(&log, 3));
        timer.add(1, Duration::from_millis(10), recorder(&log, 1));
        timer.add(2, Duration::from_millis(20), recorder(&log, 2));
        assert_valid(&timer);

        sleep(Duration::from_millis(50));
        timer.tick();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(timer.is_empty());
    }

    #[test]
    fn adjust_pushes_a_deadline_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timer = TimerHeap::new();
        timer.add(1, Duration::from_millis(10), recorder(&log, 1));
        timer.add(2, Duration::from_millis(20), recorder(&log, 2));
        timer.adjust(1, Duration::from_millis(200));
        assert_valid(&timer);

        sleep(Duration::from_millis(40));
        timer.tick();
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert!(timer.contains(1));
    }

    #[test]
    fn del_and_do_work() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TimerHeap::new();
        for id in 0..8 {
            let fired = Arc::clone(&fired);
            timer.add(
                id,
                Duration::from_secs(60),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        timer.del(4);
        assert_valid(&timer);
        assert!(!timer.contains(4));
        assert_eq!(timer.len(), 7);

        timer.do_work(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.contains(2));
        assert_valid(&timer);
    }

    #[test]
    fn re_adding_an_id_replaces_it() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timer = TimerHeap::new();
        timer.add(1, Duration::from_secs(60), recorder(&log, 99));
        timer.add(1, Duration::from_millis(5), recorder(&log, 1));
        assert_eq!(timer.len(), 1);
        assert_valid(&timer);

        sleep(Duration::from_millis(20));
        timer.tick();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn next_tick_never_underreports() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timer = TimerHeap::new();
        assert_eq!(timer.next_tick_ms(), -1);

        timer.add(1, Duration::from_millis(100), recorder(&log, 1));
        let ms = timer.next_tick_ms();
        assert!((0..=100).contains(&ms));
        assert!(log.lock().unwrap().is_empty());

        sleep(Duration::from_millis(120));
        assert_eq!(timer.next_tick_ms(), -1);
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }
}
