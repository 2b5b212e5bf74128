//! Background writer pool
//!
//! A fixed set of named threads draining a flume queue of boxed jobs.
//! Write-backs, prefetches, expensive partial evictions and checkpoint
//! writes all run here so that I/O never happens under a broad lock.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: RwLock<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let (sender, receiver) = flume::unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                })?;
            workers.push(handle);
        }
        debug!("Started {} {} threads", threads, name);

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            pending,
        })
    }

    /// Queue a job; after shutdown the job runs on the calling thread
    pub(crate) fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = match self.sender.read().as_ref() {
            Some(sender) => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                match sender.send(job) {
                    Ok(()) => None,
                    Err(flume::SendError(job)) => {
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        Some(job)
                    }
                }
            }
            None => Some(job),
        };
        if let Some(job) = rejected {
            job();
        }
    }

    /// Jobs queued or running
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, drain the queue and join the workers
    pub(crate) fn shutdown(&self) {
        drop(self.sender.write().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("Writer thread panicked");
            }
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.lock().len())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new("test-writer", 2).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let (tx, rx) = flume::unbounded();

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        drop(tx);

        assert_eq!(rx.iter().count(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown();
    }

    #[test]
    fn test_execute_after_shutdown_runs_inline() {
        let pool = WorkerPool::new("test-writer", 1).unwrap();
        pool.shutdown();

        let caller = std::thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        pool.execute(move || {
            *slot.lock() = Some(std::thread::current().id());
        });

        assert_eq!(*ran_on.lock(), Some(caller));
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = WorkerPool::new("test-writer", 1).unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                std::thread::sleep(std::time::Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
