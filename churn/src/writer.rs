use crate::client::StoreClient;
use crate::doc_id::DocId;
use crate::error::{WriteFailure, WriteFailureKind};
use crate::utils::StartGate;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// A single write: the document id and the payload derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTask {
    doc_id: DocId,
    payload: Vec<u8>,
}

impl WriteTask {
    pub fn new(seq: u64, writer: usize) -> Self {
        Self {
            doc_id: DocId::new(seq, writer),
            payload: format!("{{\"test\":\"value{seq}\"}}").into_bytes(),
        }
    }

    #[inline]
    pub fn doc_id(&self) -> DocId {
        self.doc_id
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Append-only collection of captured failures, safe to push to from any writer.
#[derive(Debug, Default)]
pub(crate) struct FailureLog {
    entries: Mutex<Vec<WriteFailure>>,
}

impl FailureLog {
    // Append-only, so a poisoned log is still consistent.
    fn entries(&self) -> MutexGuard<'_, Vec<WriteFailure>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, failure: WriteFailure) {
        self.entries().push(failure);
    }

    pub(crate) fn snapshot(&self) -> Vec<WriteFailure> {
        self.entries().clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// State shared between a generator and its writer tasks.
#[derive(Debug)]
pub(crate) struct SharedState {
    /// Number of ids handed out so far, one per attempted write.
    id_source: AtomicU64,
    /// Number of writes acknowledged by the store.
    success_count: AtomicU64,
    stop_requested: AtomicBool,
    pub(crate) failures: FailureLog,
    pub(crate) start_gate: StartGate,
    write_limit: Option<u64>,
}

impl SharedState {
    pub(crate) fn new(write_limit: Option<u64>) -> Self {
        Self {
            id_source: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            failures: FailureLog::default(),
            start_gate: StartGate::new(false),
            write_limit,
        }
    }

    /// Claims the next id, or `None` once the write limit is exhausted.
    pub(crate) fn next_id(&self) -> Option<u64> {
        match self.write_limit {
            None => Some(self.id_source.fetch_add(1, Ordering::AcqRel) + 1),
            Some(limit) => self
                .id_source
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                    (issued < limit).then_some(issued + 1)
                })
                .ok()
                .map(|issued| issued + 1),
        }
    }

    #[inline]
    pub(crate) fn ids_issued(&self) -> u64 {
        self.id_source.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn successful_writes(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Exit notice a writer sends on the stop gate.
#[derive(Debug)]
pub(crate) struct WriterExit {
    pub(crate) writer: usize,
    pub(crate) attempts: u64,
    pub(crate) successes: u64,
}

/// Sends the exit notice when dropped, so a writer that panics is still counted as exited.
struct ExitGuard {
    writer: usize,
    attempts: u64,
    successes: u64,
    tx: flume::Sender<WriterExit>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        // The generator may already be gone, in which case nobody is waiting.
        let _ = self.tx.send(WriterExit {
            writer: self.writer,
            attempts: self.attempts,
            successes: self.successes,
        });
    }
}

/// One writer task of a [`WorkloadGenerator`](crate::WorkloadGenerator).
pub(crate) struct Writer<C> {
    pub(crate) index: usize,
    pub(crate) client: Arc<C>,
    pub(crate) collection: Arc<str>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) exit_tx: flume::Sender<WriterExit>,
}

impl<C: StoreClient> Writer<C> {
    /// Writes documents until a stop is requested or the id source is exhausted. A failed write
    /// is recorded and the loop moves on to the next id.
    pub(crate) async fn run(self) {
        let Writer {
            index,
            client,
            collection,
            shared,
            exit_tx,
        } = self;
        let mut exit = ExitGuard {
            writer: index,
            attempts: 0,
            successes: 0,
            tx: exit_tx,
        };

        shared.start_gate.wait().await;
        if shared.stop_requested() {
            debug!(writer = index, "stopped before start");
            return;
        }
        info!(writer = index, "starting writer");

        while !shared.stop_requested() {
            let Some(seq) = shared.next_id() else {
                debug!(writer = index, "write limit reached");
                break;
            };
            let task = WriteTask::new(seq, index);
            exit.attempts += 1;
            match client.write(&collection, task.doc_id(), task.payload()).await {
                Ok(()) => {
                    shared.success_count.fetch_add(1, Ordering::AcqRel);
                    exit.successes += 1;
                }
                Err(err) => {
                    warn!(writer = index, doc_id = %task.doc_id(), %err, "write failed");
                    shared.failures.push(WriteFailure {
                        writer: index,
                        doc_id: Some(task.doc_id()),
                        kind: WriteFailureKind::Store(err),
                    });
                }
            }
            // Writes against an in-process store can complete without ever suspending.
            tokio::task::yield_now().await;
        }
    }
}
