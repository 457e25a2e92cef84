use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue placement for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Jump the queue; probe tasks use this so a full queue of ordinary work
    /// does not skew probe timing.
    Front,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is at capacity.
    Full,
    /// The pool has shut down.
    Terminated,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Full => write!(f, "worker queue full"),
            SubmitError::Terminated => write!(f, "worker pool terminated"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// The worker-thread pool the poller submits probe tasks to.
pub trait TaskPool: Send + Sync {
    fn submit(&self, priority: Priority, job: Job) -> Result<(), SubmitError>;
}

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<Queue>,
    available: Condvar,
    capacity: usize,
}

/// Default `TaskPool`: a fixed set of threads draining a bounded queue.
///
/// Dropping the pool lets queued jobs drain, then joins every worker.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        });
        let threads = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("probe-worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn probe worker")
            })
            .collect();
        Self { shared, threads }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut q = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                if q.shutdown {
                    return;
                }
                q = shared.available.wait(q).unwrap();
            }
        };
        job();
    }
}

impl TaskPool for WorkerPool {
    fn submit(&self, priority: Priority, job: Job) -> Result<(), SubmitError> {
        {
            let mut q = self.shared.queue.lock().unwrap();
            if q.shutdown {
                return Err(SubmitError::Terminated);
            }
            if q.jobs.len() >= self.shared.capacity {
                return Err(SubmitError::Full);
            }
            match priority {
                Priority::Front => q.jobs.push_front(job),
                Priority::Normal => q.jobs.push_back(job),
            }
        }
        self.shared.available.notify_one();
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().unwrap().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool terminated");
    }
}
