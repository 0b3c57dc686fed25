use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::core::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    name: String,
    rx: Receiver<Job>,
    target_threads: AtomicUsize,
    live_threads: AtomicUsize,
    queued: AtomicUsize,
    shutdown: AtomicBool,
}

/// Worker pool with an adjustable thread count. The compaction producer
/// retunes `set_num_threads` every round; excess workers drain out at their
/// next idle tick, missing ones are spawned on demand.
pub struct ThreadPool {
    tx: Sender<Job>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, num_threads: usize) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(PoolShared {
            name: name.into(),
            rx,
            target_threads: AtomicUsize::new(0),
            live_threads: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let pool = ThreadPool { tx, shared, handles: Mutex::new(Vec::new()) };
        pool.set_num_threads(num_threads);
        pool
    }

    pub fn num_threads(&self) -> usize {
        self.shared.target_threads.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn set_num_threads(&self, n: usize) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.shared.target_threads.store(n, Ordering::Release);
        let mut handles = self.handles.lock();
        while self.shared.live_threads.load(Ordering::Acquire) < n {
            self.shared.live_threads.fetch_add(1, Ordering::AcqRel);
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(shared.name.clone())
                .spawn(move || Self::worker_loop(shared))
                .expect("spawn pool worker");
            handles.push(handle);
        }
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            // Downsize: let surplus workers exit at an idle tick.
            let live = shared.live_threads.load(Ordering::Acquire);
            if live > shared.target_threads.load(Ordering::Acquire)
                && shared
                    .live_threads
                    .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            match shared.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(job) => {
                    shared.queued.fetch_sub(1, Ordering::AcqRel);
                    job();
                }
                Err(_) => continue,
            }
        }
        shared.live_threads.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::internal(format!("pool {} is shut down", self.shared.name)));
        }
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(Box::new(f))
            .map_err(|_| Error::internal(format!("pool {} rejected task", self.shared.name)))
    }

    /// Create a token that can wait for its own submissions to drain.
    pub fn new_token(self: &Arc<Self>) -> PoolToken {
        PoolToken {
            pool: self.clone(),
            pending: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Stop accepting work and join every worker. Jobs already running
    /// finish; queued jobs are dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        while self.shared.rx.try_recv().is_ok() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Fan-out handle: counts submissions and blocks in `wait` until each one
/// has run to completion.
pub struct PoolToken {
    pool: Arc<ThreadPool>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl PoolToken {
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pending = self.pending.clone();
        *pending.0.lock() += 1;
        let result = self.pool.submit(move || {
            f();
            let (count, cond) = &*pending;
            let mut count = count.lock();
            *count -= 1;
            if *count == 0 {
                cond.notify_all();
            }
        });
        if result.is_err() {
            let (count, cond) = &*self.pending;
            let mut count = count.lock();
            *count -= 1;
            if *count == 0 {
                cond.notify_all();
            }
        }
        result
    }

    pub fn wait(&self) {
        let (count, cond) = &*self.pending;
        let mut count = count.lock();
        while *count > 0 {
            cond.wait(&mut count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = ThreadPool::new("test-pool", 2);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        pool.shutdown();
    }

    #[test]
    fn test_token_wait_drains() {
        let pool = Arc::new(ThreadPool::new("token-pool", 3));
        let token = pool.new_token();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            token
                .submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        token.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = ThreadPool::new("dead-pool", 1);
        pool.shutdown();
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn test_resize() {
        let pool = ThreadPool::new("resize-pool", 1);
        assert_eq!(pool.num_threads(), 1);
        pool.set_num_threads(4);
        assert_eq!(pool.num_threads(), 4);
        pool.set_num_threads(2);
        assert_eq!(pool.num_threads(), 2);
        pool.shutdown();
    }
}
