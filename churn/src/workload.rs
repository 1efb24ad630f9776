use crate::client::StoreClient;
use crate::config::DEFAULT_STOP_GRACE;
use crate::error::{HarnessError, HarnessResult, WriteFailure, WriteFailureKind};
use crate::writer::{SharedState, Writer, WriterExit};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Settings of a [`WorkloadGenerator`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkloadOptions {
    /// Number of concurrent writer tasks, at least 1.
    pub writers: usize,
    /// Release the writers as soon as they are spawned.
    pub auto_start: bool,
    /// Stop issuing ids once this many writes have been attempted.
    pub write_limit: Option<u64>,
    /// How long [`WorkloadGenerator::stop`] waits for the writers to drain.
    pub stop_grace: Duration,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            writers: 5,
            auto_start: true,
            write_limit: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl WorkloadOptions {
    pub fn with_writers(mut self, writers: usize) -> Self {
        self.writers = writers;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_write_limit(mut self, limit: u64) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// A pool of writer tasks continuously adding uniquely identified documents to a collection.
///
/// Writers are spawned on construction and wait for [`start`](Self::start) unless auto-started.
/// Each writer records its failures and keeps going, so the success counter keeps climbing even
/// while the store rejects some writes. [`stop`](Self::stop) drains every writer before it
/// returns; a generator dropped without being stopped aborts whatever is still running.
pub struct WorkloadGenerator {
    shared: Arc<SharedState>,
    handles: Vec<JoinHandle<()>>,
    exit_rx: flume::Receiver<WriterExit>,
    writer_count: usize,
    exited: usize,
    stop_grace: Duration,
    outcome: Option<HarnessResult<()>>,
}

impl WorkloadGenerator {
    /// Spawns `writer_count` writers against `collection` with default options otherwise.
    pub fn new<C: StoreClient>(
        client: Arc<C>,
        collection: impl Into<String>,
        writer_count: usize,
        auto_start: bool,
    ) -> HarnessResult<Self> {
        let options = WorkloadOptions::default()
            .with_writers(writer_count)
            .with_auto_start(auto_start);
        Self::spawn(client, collection, options)
    }

    /// Spawns the writer tasks on the current tokio runtime.
    pub fn spawn<C: StoreClient>(
        client: Arc<C>,
        collection: impl Into<String>,
        options: WorkloadOptions,
    ) -> HarnessResult<Self> {
        if options.writers == 0 {
            return Err(HarnessError::InvalidWriterCount);
        }
        let collection: Arc<str> = collection.into().into();
        let shared = Arc::new(SharedState::new(options.write_limit));
        let (exit_tx, exit_rx) = flume::unbounded();

        info!(writers = options.writers, %collection, "spawning writer tasks");
        let handles = (0..options.writers)
            .map(|index| {
                let writer = Writer {
                    index,
                    client: client.clone(),
                    collection: collection.clone(),
                    shared: shared.clone(),
                    exit_tx: exit_tx.clone(),
                };
                tokio::spawn(writer.run())
            })
            .collect();

        let generator = Self {
            shared,
            handles,
            exit_rx,
            writer_count: options.writers,
            exited: 0,
            stop_grace: options.stop_grace,
            outcome: None,
        };
        if options.auto_start {
            generator.start();
        }
        Ok(generator)
    }

    /// Releases the writers. Calling it again has no effect.
    pub fn start(&self) {
        if self.shared.start_gate.open() {
            info!(writers = self.writer_count, "releasing writers");
        }
    }

    /// Asks every writer to finish its in-flight write and exit, then waits for all of them.
    ///
    /// Fails with [`HarnessError::StopTimeout`] if the writers do not drain within the grace
    /// period, and with [`HarnessError::AggregateWriteFailure`] if any write failed during the
    /// run. Calling it again returns the first outcome.
    pub async fn stop(&mut self) -> HarnessResult<()> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.shared.request_stop();
        // Writers still parked on the start gate need to see the stop request.
        self.shared.start_gate.open();

        let outcome = self.drain().await;
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn drain(&mut self) -> HarnessResult<()> {
        let deadline = Instant::now() + self.stop_grace;
        while self.exited < self.writer_count {
            let next = tokio::time::timeout_at(deadline, self.exit_rx.recv_async()).await;
            match next {
                Ok(Ok(exit)) => {
                    self.exited += 1;
                    info!(
                        writer = exit.writer,
                        attempts = exit.attempts,
                        successes = exit.successes,
                        "writer stopped"
                    );
                }
                // Every sender is gone, nothing left to wait for.
                Ok(Err(_)) => break,
                Err(_) => {
                    let running = self.writer_count - self.exited;
                    error!(running, grace = ?self.stop_grace, "writers did not stop in time");
                    self.abort_writers();
                    return Err(HarnessError::StopTimeout {
                        grace: self.stop_grace,
                        running,
                    });
                }
            }
        }

        for (index, handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    let msg = panic_message(err.into_panic());
                    error!(writer = index, %msg, "writer panicked");
                    self.shared.failures.push(WriteFailure {
                        writer: index,
                        doc_id: None,
                        kind: WriteFailureKind::Panicked(msg),
                    });
                }
            }
        }

        info!(
            successful_writes = self.total_successful_writes(),
            ids_issued = self.ids_issued(),
            "all writers stopped"
        );
        self.assert_no_failures()
    }

    fn abort_writers(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    /// Number of writes the store acknowledged so far. Final once [`stop`](Self::stop) returns.
    #[inline]
    pub fn total_successful_writes(&self) -> u64 {
        self.shared.successful_writes()
    }

    /// Number of ids handed out, i.e. write attempts started.
    #[inline]
    pub fn ids_issued(&self) -> u64 {
        self.shared.ids_issued()
    }

    #[inline]
    pub fn writer_count(&self) -> usize {
        self.writer_count
    }

    /// Snapshot of the failures captured so far.
    pub fn failures(&self) -> Vec<WriteFailure> {
        self.shared.failures.snapshot()
    }

    /// Fails with [`HarnessError::AggregateWriteFailure`] if any write has failed so far. Does not
    /// wait for the writers.
    pub fn assert_no_failures(&self) -> HarnessResult<()> {
        if self.shared.failures.is_empty() {
            return Ok(());
        }
        Err(HarnessError::AggregateWriteFailure {
            failures: self.failures(),
        })
    }
}

impl Drop for WorkloadGenerator {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        warn!(
            writers = self.handles.len(),
            "workload generator dropped without stop(), aborting writers"
        );
        self.shared.request_stop();
        self.shared.start_gate.open();
        self.abort_writers();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map(|msg| msg.to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}
