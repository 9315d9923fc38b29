use crate::{
    deadline::Deadline,
    prober::{check_all, Probe},
    recovery::{self, RecoveryError},
    report::Report,
    store::{FileStore, StoreError},
    types::{FanOutConfig, ProbeError, QueueConfig, Set},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, Mutex,
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Intake is closed; the batch was written to the recovery file instead.
    #[error("service is shutting down, batch queued for restart")]
    Stopping,
    #[error("domain at position {0} is empty")]
    InvalidDomain(usize),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to persist pending batches: {0}")]
    Recovery(#[from] RecoveryError),
}

impl ServiceError {
    /// Worth retrying once the service is back.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            ServiceError::Stopping | ServiceError::Probe(ProbeError::Cancelled)
        )
    }
}

type Outcome = Result<Set, ServiceError>;

/// Where a finished batch goes. Batches restored after a restart have
/// nobody waiting for them.
#[derive(Debug)]
pub enum ResultSink {
    Waiting(oneshot::Sender<Outcome>),
    Detached,
}

impl ResultSink {
    /// At most once, never blocks. A caller that stopped listening just
    /// misses the notification; the stored record is unaffected.
    fn deliver(self, outcome: Outcome) {
        match self {
            ResultSink::Waiting(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("caller went away before the result was ready");
                }
            }
            ResultSink::Detached => {}
        }
    }
}

#[derive(Debug)]
struct Task {
    set: Set,
    sink: ResultSink,
}

struct Inner<P> {
    prober: P,
    store: FileStore,
    fan_out: FanOutConfig,
    config: QueueConfig,
    /// `None` once intake is closed. Holding the lock makes check-then-send atomic.
    intake: Mutex<Option<mpsc::Sender<Task>>>,
    backlog: Mutex<mpsc::Receiver<Task>>,
    workers: Mutex<JoinSet<()>>,
    halt: CancellationToken,
}

/// Bounded queue of batches in front of a fixed pool of workers.
pub struct LinkService<P: Probe> {
    inner: Arc<Inner<P>>,
}

impl<P: Probe> Clone for LinkService<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Probe> LinkService<P> {
    /// Restores leftovers from the recovery file, then starts the workers.
    pub async fn start(
        prober: P,
        store: FileStore,
        fan_out: FanOutConfig,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));

        restore(&config, &tx).await;

        let inner = Arc::new(Inner {
            prober,
            store,
            fan_out,
            intake: Mutex::new(Some(tx)),
            backlog: Mutex::new(rx),
            workers: Mutex::new(JoinSet::new()),
            halt: CancellationToken::new(),
            config,
        });

        {
            let mut workers = inner.workers.lock().await;
            for id in 0..inner.config.workers {
                workers.spawn(run_worker(Arc::clone(&inner), id));
            }
        }
        info!(workers = inner.config.workers, "link service started");

        Self { inner }
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.intake.lock().await.is_none()
    }

    /// Queues a batch and waits for a worker to check and store it.
    ///
    /// After [`shutdown`](Self::shutdown) has started this neither queues
    /// nor waits: the batch goes to the recovery file and the call returns
    /// [`ServiceError::Stopping`].
    pub async fn submit(&self, domains: Vec<String>) -> Result<Set, ServiceError> {
        if let Some(pos) = domains.iter().position(|d| d.trim().is_empty()) {
            return Err(ServiceError::InvalidDomain(pos));
        }

        let set = Set::from_domains(domains);
        let (tx, rx) = oneshot::channel();

        {
            let intake = self.inner.intake.lock().await;
            let queue = match intake.as_ref() {
                Some(q) => q,
                None => {
                    recovery::append(&self.inner.config.recovery_path, &[set]).await?;
                    info!("intake closed, batch saved for restart");
                    return Err(ServiceError::Stopping);
                }
            };

            let task = Task {
                set,
                sink: ResultSink::Waiting(tx),
            };
            if let Err(mpsc::error::SendError(task)) = queue.send(task).await {
                recovery::append(&self.inner.config.recovery_path, &[task.set]).await?;
                return Err(ServiceError::Stopping);
            }
        }

        // A dropped sender means the batch was snapshotted or abandoned at shutdown.
        rx.await.unwrap_or(Err(ServiceError::Stopping))
    }

    /// Renders the stored sets, optionally re-probing them first.
    pub async fn report(&self, numbers: &[u64], deadline: &Deadline) -> Result<Report, ServiceError> {
        let mut sets = Vec::with_capacity(numbers.len());

        for &number in numbers {
            let mut set = self.inner.store.find_by_number(number).await?;

            if self.inner.config.recheck_on_report {
                let statuses =
                    check_all(&self.inner.prober, &set.domains(), &self.inner.fan_out, deadline)
                        .await?;
                set.apply_statuses(&statuses);
            }

            sets.push(set);
        }

        Ok(Report::render(&sets))
    }

    /// Closes intake, waits up to `timeout` for the workers to drain the
    /// queue, and on timeout saves whatever is still queued.
    ///
    /// Batches a worker already picked up are not saved; they are cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServiceError> {
        info!("stopping queue");
        self.inner.intake.lock().await.take();

        info!("waiting for workers to finish");
        let finished = {
            let mut workers = self.inner.workers.lock().await;
            tokio::time::timeout(timeout, async {
                while let Some(res) = workers.join_next().await {
                    if let Err(e) = res {
                        error!(error = %e, "worker ended abnormally");
                    }
                }
            })
            .await
            .is_ok()
        };

        if finished {
            info!("workers finished gracefully");
            return Ok(());
        }

        warn!(?timeout, "workers did not finish in time, draining queue");

        // Held so closed-intake submissions cannot interleave with the snapshot.
        let _intake = self.inner.intake.lock().await;

        let pending: Vec<Set> = {
            let mut backlog = self.inner.backlog.lock().await;
            let mut sets = Vec::new();
            while let Ok(task) = backlog.try_recv() {
                sets.push(task.set);
            }
            sets
        };
        self.inner.halt.cancel();

        if pending.is_empty() {
            info!("no pending batches to persist");
            return Ok(());
        }

        recovery::append(&self.inner.config.recovery_path, &pending).await?;
        info!(count = pending.len(), "pending batches saved");
        Ok(())
    }
}

async fn restore(config: &QueueConfig, queue: &mpsc::Sender<Task>) {
    let path = &config.recovery_path;
    let sets = match recovery::load(path).await {
        Ok(sets) => sets,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load queue from file");
            return;
        }
    };

    if !sets.is_empty() {
        info!(count = sets.len(), "restoring batches from previous run");
    }

    for set in sets {
        let task = Task {
            set,
            sink: ResultSink::Detached,
        };
        match queue.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                warn!(links = task.set.links.len(), "queue is full, skipping restored batch")
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    if let Err(e) = recovery::remove(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove recovery file");
    }
}

async fn run_worker<P: Probe>(inner: Arc<Inner<P>>, id: usize) {
    loop {
        let task = {
            let mut backlog = inner.backlog.lock().await;
            backlog.recv().await
        };
        let Some(task) = task else { break };
        inner.process(task).await;
    }
    debug!(worker = id, "worker stopped");
}

impl<P: Probe> Inner<P> {
    async fn process(&self, task: Task) {
        let Task { mut set, sink } = task;

        // Fresh budget: time spent waiting in the queue does not count.
        let deadline = Deadline::with_cancel(self.config.batch_timeout, self.halt.child_token());

        let outcome = match check_all(&self.prober, &set.domains(), &self.fan_out, &deadline).await {
            Ok(statuses) => {
                set.apply_statuses(&statuses);
                match self.store.append(&mut set).await {
                    Ok(number) => {
                        info!(number, links = set.links.len(), "set stored");
                        Ok(set)
                    }
                    Err(e) => {
                        error!(error = %e, "failed to store set");
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, links = set.links.len(), "batch not stored");
                Err(e.into())
            }
        };

        sink.deliver(outcome);
    }
}
