use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::PageCompletion;
use crate::error::SyncError;
use crate::mutation::MutationCompletion;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads that run gateway calls off the owning thread.
pub struct Executor {
    spawner: Spawner,
    stop: Sender<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Cheap handle for queueing work on an [`Executor`].
#[derive(Clone)]
pub struct Spawner {
    jobs: Sender<Job>,
}

impl Executor {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (stop_tx, stop_rx) = unbounded::<()>();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let jobs = job_rx.clone();
            let stop = stop_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("feedsync-worker-{index}"))
                .spawn(move || worker(jobs, stop));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(error = %err, "failed to spawn worker thread"),
            }
        }

        Self {
            spawner: Spawner { jobs: job_tx },
            stop: stop_tx,
            handles,
        }
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
        debug!("executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Spawner {
    /// Queues `job`; returns false once the executor has shut down.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.send(Box::new(job)).is_ok()
    }
}

fn worker(jobs: Receiver<Job>, stop: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => {
                match msg {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }
        }
    }
}

/// Result of a gateway call, sent back to the owning thread.
pub(crate) enum Completion {
    Page(PageCompletion),
    Mutation(MutationCompletion),
}

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

enum Slot<T> {
    Pending,
    Ready(Result<T, SyncError>),
}

/// Shared completion slot for an asynchronous operation.
///
/// Clones observe the same slot, which is how de-duplicated requests hand the
/// same in-flight result to every caller. Only the owning thread settles it.
pub struct Ticket<T> {
    id: u64,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Ticket<T> {
    /// True when both tickets observe the same operation.
    pub fn same(&self, other: &Ticket<T>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Ready(_))
    }
}

impl<T: Clone> Ticket<T> {
    pub fn pending() -> Self {
        Self {
            id: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            slot: Arc::new(Mutex::new(Slot::Pending)),
        }
    }

    pub fn ready(result: Result<T, SyncError>) -> Self {
        let ticket = Self::pending();
        ticket.settle(result);
        ticket
    }

    /// Returns the outcome once settled. Never blocks.
    pub fn try_result(&self) -> Option<Result<T, SyncError>> {
        match &*self.slot.lock() {
            Slot::Pending => None,
            Slot::Ready(result) => Some(result.clone()),
        }
    }

    /// First settlement wins; later calls are ignored and return false.
    pub(crate) fn settle(&self, result: Result<T, SyncError>) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Ready(_)) {
            return false;
        }
        *slot = Slot::Ready(result);
        true
    }
}
