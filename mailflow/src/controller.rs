use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context as _;
use mailflow_common::{Domain, Signal, internal, logging, tracing};
use mailflow_processor::{
    Factory, FactoryContext, MailboxStore, ProcessorConfig, ProcessorError, ProcessorRegistry,
    Spooler,
};
use mailflow_queue::{MailQueue, QueueConfig};
use ron::extensions::Extensions;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::ingress::Ingress;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

const fn default_shutdown_timeout() -> u64 {
    30
}

/// The whole server, as described by `mailflow.config.ron`
///
/// ```ron
/// Mailflow (
///     queue: File(path: "/var/spool/mailflow", sync: true),
///     workers: 4,
///     local_domains: ["example.com"],
///     processors: [
///         (name: "default", stages: [(match: "All", mailet: "Null")]),
///         (name: "error", stages: [(match: "All", mailet: "Bounce")]),
///     ],
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct Mailflow {
    #[serde(default)]
    queue: QueueConfig,

    /// Number of concurrent queue consumers (default: one per CPU)
    #[serde(default)]
    workers: Option<usize>,

    /// How long in-flight mail may take to finish on shutdown
    #[serde(default = "default_shutdown_timeout")]
    shutdown_timeout_secs: u64,

    /// Domains `HostIsLocal` treats as ours
    #[serde(default)]
    local_domains: Vec<String>,

    #[serde(default)]
    processors: Vec<ProcessorConfig>,

    /// State → processor aliases
    #[serde(default)]
    states: BTreeMap<String, String>,

    #[serde(skip)]
    mailbox_store: Option<Arc<dyn MailboxStore>>,
}

/// A started server: the spooler and the ingress feeding it
#[derive(Debug)]
pub struct Server {
    spooler: Spooler,
    ingress: Ingress,
}

impl Server {
    #[must_use]
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Drain the queue until `shutdown` fires
    ///
    /// # Errors
    /// See [`Spooler::serve`]
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ProcessorError> {
        self.spooler.serve(shutdown).await
    }
}

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Mailflow {
    /// Parse a configuration document
    ///
    /// # Errors
    /// If the document is not valid configuration
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        ron::Options::default()
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES | Extensions::IMPLICIT_SOME)
            .from_str(config)
            .context("Invalid configuration")
    }

    /// Read and parse the configuration file at `path`
    ///
    /// # Errors
    /// If the file cannot be read or is not valid configuration
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&config).with_context(|| format!("In {}", path.display()))
    }

    /// Deliver `LocalDelivery` mail through `store` unless a stage names a
    /// `root` directory
    #[must_use]
    pub fn with_mailbox_store(mut self, store: Arc<dyn MailboxStore>) -> Self {
        self.mailbox_store = Some(store);
        self
    }

    #[must_use]
    pub const fn workers(&self) -> Option<usize> {
        self.workers
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub const fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    #[must_use]
    pub fn processors(&self) -> &[ProcessorConfig] {
        &self.processors
    }

    /// Open the queue, recover what it holds, and build every processor
    ///
    /// # Errors
    /// If the queue cannot be opened or the processors are misconfigured
    pub async fn build(self) -> anyhow::Result<Server> {
        self.build_with(|_| {}).await
    }

    /// [`Mailflow::build`], letting the caller register extra matchers and
    /// mailets first
    ///
    /// # Errors
    /// See [`Mailflow::build`]
    pub async fn build_with<F>(self, register: F) -> anyhow::Result<Server>
    where
        F: FnOnce(&mut Factory) + Send,
    {
        let local_domains: Arc<[Domain]> =
            self.local_domains.iter().map(|d| Domain::new(d.as_str())).collect();

        let mut factory = Factory::with_builtins(FactoryContext {
            local_domains: Arc::clone(&local_domains),
            mailbox_store: self.mailbox_store.clone(),
        });
        register(&mut factory);

        let registry = ProcessorRegistry::from_config(&self.processors, &self.states, &factory)
            .context("Invalid processor configuration")?;
        internal!(level = INFO, "Loaded {} processors", registry.len());

        let store = self.queue.into_store().context("Failed to open queue store")?;
        let queue = MailQueue::open(store).await.context("Failed to recover queue")?;
        internal!(level = INFO, "Recovered {} queued mails", queue.size());

        let mut spooler = Spooler::new(queue.clone(), Arc::new(registry))
            .with_local_domains(local_domains)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));
        if let Some(workers) = self.workers {
            spooler = spooler.with_workers(workers);
        }

        Ok(Server {
            spooler,
            ingress: Ingress::new(queue),
        })
    }

    /// Run this controller, and everything it controls, until a signal stops it
    ///
    /// # Errors
    /// If startup fails, or the spooler stops on an unroutable mail
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!(level = INFO, "Controller running");

        let server = self.build().await?;

        // The spooler keeps running after the signal so it can drain
        let serve = server.serve(SHUTDOWN_BROADCAST.subscribe());
        tokio::pin!(serve);

        let ret = tokio::select! {
            r = &mut serve => r,
            r = shutdown() => {
                r?;
                serve.await
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret.map_err(anyhow::Error::from)
    }
}
