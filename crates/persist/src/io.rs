//! Background column IO.
//!
//! One worker thread executes store reads and writes fed by an urgent and a
//! background queue. Loaded bytes are decoded on the worker by a pure
//! [`ColumnDecoder`]; everything the owner thread must apply comes back as
//! an [`IntegrationTask`] drained with [`IoScheduler::drain_completed`].
//!
//! # Invariants
//! - Urgent jobs are always picked before background jobs.
//! - At most one write job is queued per chunk; newer bytes replace the
//!   pending ones.
//! - A chunk counts as having a pending write from submission until the
//!   store write returns.
//! - The worker never touches owner-thread state.

use crate::storage::{ColumnStore, StoreError};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use strata_common::ChunkPos;

/// Queue a job is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    Urgent,
    Background,
}

/// Sections decoded from one column, keyed by section y.
pub type DecodedColumn<S> = BTreeMap<i32, S>;

/// Pure decoding run on the worker thread.
pub trait ColumnDecoder<S>: Send + Sync {
    fn decode(&self, chunk: ChunkPos, bytes: &[u8]) -> Result<DecodedColumn<S>, StoreError>;
}

/// Work handed back to the owner thread.
#[derive(Debug)]
pub enum IntegrationTask<S> {
    /// A load finished. An empty map means the column is absent on disk.
    InstallColumn {
        chunk: ChunkPos,
        generation: u64,
        sections: DecodedColumn<S>,
    },
    LoadFailed {
        chunk: ChunkPos,
        generation: u64,
        error: StoreError,
    },
    WriteFailed { chunk: ChunkPos, error: StoreError },
}

#[derive(Debug)]
enum IoJob {
    Load { chunk: ChunkPos, generation: u64 },
    Write { chunk: ChunkPos },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared<S> {
    store: Arc<dyn ColumnStore>,
    decoder: Box<dyn ColumnDecoder<S>>,
    pending_writes: Mutex<HashMap<ChunkPos, Option<Vec<u8>>>>,
    /// Chunks whose bytes left `pending_writes` but are still being written.
    writing: Mutex<HashSet<ChunkPos>>,
    in_flight: Mutex<HashSet<(ChunkPos, u64)>>,
    cancelled: Mutex<HashSet<(ChunkPos, u64)>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl<S> Shared<S> {
    fn finish_job(&self) {
        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn run(&self, job: IoJob, done: &Sender<IntegrationTask<S>>) {
        match job {
            IoJob::Load { chunk, generation } => {
                if lock(&self.cancelled).remove(&(chunk, generation)) {
                    lock(&self.in_flight).remove(&(chunk, generation));
                    tracing::trace!(?chunk, generation, "skipping cancelled load");
                    return;
                }
                let task = match self.load(chunk) {
                    Ok(sections) => IntegrationTask::InstallColumn {
                        chunk,
                        generation,
                        sections,
                    },
                    Err(error) => IntegrationTask::LoadFailed {
                        chunk,
                        generation,
                        error,
                    },
                };
                let _ = done.send(task);
            }
            IoJob::Write { chunk } => {
                let data = {
                    let mut pending = lock(&self.pending_writes);
                    let Some(data) = pending.remove(&chunk) else {
                        return;
                    };
                    // mark before the queue lock is released
                    lock(&self.writing).insert(chunk);
                    data
                };
                let result = self.store.write(chunk, data.as_deref());
                lock(&self.writing).remove(&chunk);
                if let Err(error) = result {
                    tracing::error!(?chunk, %error, "background write failed");
                    let _ = done.send(IntegrationTask::WriteFailed { chunk, error });
                }
            }
        }
    }

    fn load(&self, chunk: ChunkPos) -> Result<DecodedColumn<S>, StoreError> {
        // a queued write is newer than whatever is on disk
        let pending = lock(&self.pending_writes).get(&chunk).cloned();
        let bytes = match pending {
            Some(data) => data,
            None => self.store.read(chunk)?,
        };
        match bytes {
            Some(bytes) => self.decoder.decode(chunk, &bytes),
            None => Ok(DecodedColumn::new()),
        }
    }
}

fn next_job(urgent: &Receiver<IoJob>, background: &Receiver<IoJob>) -> Option<IoJob> {
    if let Ok(job) = urgent.try_recv() {
        return Some(job);
    }
    select! {
        recv(urgent) -> job => job.ok().or_else(|| background.recv().ok()),
        recv(background) -> job => job.ok().or_else(|| urgent.recv().ok()),
    }
}

/// Single-worker IO queue for one column store.
pub struct IoScheduler<S: Send + 'static> {
    urgent: Option<Sender<IoJob>>,
    background: Option<Sender<IoJob>>,
    completed: Receiver<IntegrationTask<S>>,
    done: Sender<IntegrationTask<S>>,
    shared: Arc<Shared<S>>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> IoScheduler<S> {
    pub fn new(store: Arc<dyn ColumnStore>, decoder: Box<dyn ColumnDecoder<S>>) -> Self {
        let (urgent_tx, urgent_rx) = unbounded();
        let (background_tx, background_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        let shared = Arc::new(Shared {
            store,
            decoder,
            pending_writes: Mutex::new(HashMap::new()),
            writing: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker_done = done_tx.clone();
        let worker = std::thread::Builder::new()
            .name("strata-io".into())
            .spawn(move || {
                while let Some(job) = next_job(&urgent_rx, &background_rx) {
                    worker_shared.run(job, &worker_done);
                    worker_shared.finish_job();
                }
                tracing::debug!("io worker stopped");
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn io worker, jobs will run inline");
                None
            }
        };
        Self {
            urgent: Some(urgent_tx),
            background: Some(background_tx),
            completed: done_rx,
            done: done_tx,
            shared,
            worker,
        }
    }

    fn send(&self, job: IoJob, priority: IoPriority) {
        *lock(&self.shared.outstanding) += 1;
        let sender = match priority {
            IoPriority::Urgent => self.urgent.as_ref(),
            IoPriority::Background => self.background.as_ref(),
        };
        let job = match (sender, &self.worker) {
            (Some(tx), Some(_)) => match tx.send(job) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            _ => job,
        };
        // no worker: run on the caller's thread
        self.shared.run(job, &self.done);
        self.shared.finish_job();
    }

    /// Queue a column load. `generation` identifies this request so stale
    /// results can be recognised by the owner.
    pub fn submit_load(&self, chunk: ChunkPos, generation: u64, priority: IoPriority) {
        lock(&self.shared.in_flight).insert((chunk, generation));
        self.send(IoJob::Load { chunk, generation }, priority);
    }

    /// Queue a column write, coalescing with a pending write of the same chunk.
    pub fn submit_write(&self, chunk: ChunkPos, data: Option<Vec<u8>>, priority: IoPriority) {
        let superseded = lock(&self.shared.pending_writes)
            .insert(chunk, data)
            .is_some();
        if superseded {
            tracing::trace!(?chunk, "coalesced pending write");
            return;
        }
        self.send(IoJob::Write { chunk }, priority);
    }

    /// Discard the result of a load that has not been drained yet.
    pub fn cancel_load(&self, chunk: ChunkPos, generation: u64) {
        if lock(&self.shared.in_flight).contains(&(chunk, generation)) {
            lock(&self.shared.cancelled).insert((chunk, generation));
        }
    }

    /// Completed tasks, in completion order. Cancelled loads are dropped.
    pub fn drain_completed(&self) -> Vec<IntegrationTask<S>> {
        let mut out = Vec::new();
        for task in self.completed.try_iter() {
            let load = match &task {
                IntegrationTask::InstallColumn {
                    chunk, generation, ..
                }
                | IntegrationTask::LoadFailed {
                    chunk, generation, ..
                } => Some((*chunk, *generation)),
                IntegrationTask::WriteFailed { .. } => None,
            };
            if let Some(id) = load {
                lock(&self.shared.in_flight).remove(&id);
                if lock(&self.shared.cancelled).remove(&id) {
                    tracing::trace!(chunk = ?id.0, generation = id.1, "dropping cancelled load result");
                    continue;
                }
            }
            out.push(task);
        }
        out
    }

    /// Number of submitted jobs not yet finished by the worker.
    pub fn outstanding(&self) -> usize {
        *lock(&self.shared.outstanding)
    }

    /// Whether a write of `chunk` is queued or currently being performed.
    pub fn has_pending_write(&self, chunk: ChunkPos) -> bool {
        let pending = lock(&self.shared.pending_writes);
        pending.contains_key(&chunk) || lock(&self.shared.writing).contains(&chunk)
    }

    /// Block until every submitted job has run.
    pub fn wait_idle(&self) {
        let mut outstanding = lock(&self.shared.outstanding);
        while *outstanding > 0 {
            outstanding = self
                .shared
                .idle
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn store(&self) -> &Arc<dyn ColumnStore> {
        &self.shared.store
    }
}

impl<S: Send + 'static> Drop for IoScheduler<S> {
    fn drop(&mut self) {
        self.urgent.take();
        self.background.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("io worker panicked");
            }
        }
    }
}
