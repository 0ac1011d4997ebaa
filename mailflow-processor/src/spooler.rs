//! The consumer pool
//!
//! Each worker loops `dequeue → process → enqueue routed branches → done`.
//! Routing hands mail over through the queue, so every hop is persisted
//! before the lease that produced it is acknowledged.

use std::{sync::Arc, time::Duration};

use mailflow_common::{Domain, Mail, Signal, internal, tracing};
use mailflow_queue::{Lease, MailQueue};
use tokio::{sync::broadcast, task::JoinSet};

use crate::{error::ProcessorError, mailet::MailetContext, registry::ProcessorRegistry};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Spooler {
    worker: Worker,
    workers: usize,
    shutdown_timeout: Duration,
}

/// Everything a single worker task needs
#[derive(Debug, Clone)]
struct Worker {
    queue: MailQueue,
    registry: Arc<ProcessorRegistry>,
    local_domains: Arc<[Domain]>,
}

impl Spooler {
    /// A pool with one worker per CPU
    #[must_use]
    pub fn new(queue: MailQueue, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            worker: Worker {
                queue,
                registry,
                local_domains: Arc::from([]),
            },
            workers: num_cpus::get().max(1),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_local_domains(mut self, local_domains: Arc<[Domain]>) -> Self {
        self.worker.local_domains = local_domains;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn queue(&self) -> &MailQueue {
        &self.worker.queue
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Process a single lease, as one worker iteration does
    ///
    /// # Errors
    /// See [`Spooler::serve`]
    pub async fn process(&self, lease: Lease) -> Result<(), ProcessorError> {
        self.worker.process(lease).await
    }

    /// Run the workers until a shutdown signal arrives
    ///
    /// On shutdown the queue is closed and workers finish the mail they hold.
    /// Workers still busy after the shutdown timeout are aborted; their leases
    /// roll back and the mail is picked up again after a restart.
    ///
    /// # Errors
    /// [`ProcessorError::Unroutable`] if a worker met a mail that even the
    /// error processor cannot route, or [`ProcessorError::Worker`] if a worker
    /// panicked
    #[tracing::instrument(level = "trace", skip_all, fields(workers = self.workers))]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ProcessorError> {
        internal!(level = INFO, "Spooler starting with {} workers", self.workers);

        let mut workers = JoinSet::new();
        for index in 0..self.workers {
            let worker = self.worker.clone();
            workers.spawn(async move { worker.run(index).await });
        }

        let result = tokio::select! {
            sig = shutdown.recv() => {
                match sig {
                    Ok(Signal::Shutdown | Signal::Finalised) => {
                        internal!(level = INFO, "Spooler received shutdown signal");
                    }
                    Err(e) => {
                        tracing::error!("Spooler shutdown channel error: {e}");
                    }
                }
                Ok(())
            }
            Some(joined) = workers.join_next() => flatten(joined),
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "Spooler worker stopped, shutting down");
        }

        self.worker.queue.close();

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = flatten(joined) {
                    tracing::error!(error = %e, "Spooler worker failed during shutdown");
                }
            }
        };

        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(
                "Shutdown timeout exceeded, {} workers still busy; their mail will be retried on restart",
                workers.len()
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        internal!(level = INFO, "Spooler shutdown complete");
        result
    }
}

fn flatten(
    joined: Result<Result<(), ProcessorError>, tokio::task::JoinError>,
) -> Result<(), ProcessorError> {
    joined.map_err(|e| ProcessorError::Worker(e.to_string()))?
}

impl Worker {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn run(self, index: usize) -> Result<(), ProcessorError> {
        internal!("Worker {} started", index);

        loop {
            let lease = match self.queue.dequeue().await {
                Ok(lease) => lease,
                Err(e) if e.is_closed() => {
                    internal!("Worker {} stopping, queue closed", index);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to dequeue mail, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            self.process(lease).await?;
        }
    }

    async fn process(&self, lease: Lease) -> Result<(), ProcessorError> {
        let (mail, handle) = lease.into_parts();
        let id = mail.id();
        let ctx = MailetContext::new(Arc::clone(&self.local_domains));

        let routed = match self.registry.process(mail, &ctx).await {
            Ok(routed) => routed,
            Err(e) => {
                tracing::error!(mail_id = %id, error = %e, "Rolling back mail that cannot be routed");
                if let Err(e) = handle.done(false).await {
                    tracing::error!(mail_id = %id, error = %e, "Failed to roll back lease");
                }
                return Err(e);
            }
        };

        // The mail keeping the leased id goes last: enqueueing it supersedes
        // the lease's records.
        let (original, branches): (Vec<Mail>, Vec<Mail>) =
            routed.into_iter().partition(|mail| mail.id() == id);
        let outgoing = ctx.take_outgoing();

        for mail in branches.iter().chain(&outgoing).chain(&original) {
            if let Err(e) = self.queue.enqueue(mail, Duration::ZERO).await {
                tracing::error!(
                    mail_id = %id,
                    branch = %mail.id(),
                    error = %e,
                    "Failed to enqueue routed mail, rolling back"
                );
                if let Err(e) = handle.done(false).await {
                    tracing::error!(mail_id = %id, error = %e, "Failed to roll back lease");
                }
                tokio::time::sleep(RETRY_DELAY).await;
                return Ok(());
            }
        }

        if let Err(e) = handle.done(true).await {
            tracing::error!(mail_id = %id, error = %e, "Failed to acknowledge mail");
        }

        Ok(())
    }
}
