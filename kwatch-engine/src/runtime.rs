use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use kwatch_core::{EngineConfig, KindTag, ObjectKey, Resource};
use kwatch_queue::{default_rate_limiter, RateLimitingQueue};

use crate::cache::Indexer;
use crate::error::EngineError;
use crate::handler::{ErrorSink, Handler, TracingErrorSink};
use crate::informer::Informer;
use crate::ledger::ChangeLedger;
use crate::reconcile::{ReconcileStats, Reconciler};
use crate::source::{ListOptions, SourceAdapter};

/// One observed kind: where its objects come from and who reacts to them.
pub struct KindBinding<T: Resource> {
    kind: KindTag,
    source: Arc<dyn SourceAdapter<T>>,
    handler: Option<Arc<dyn Handler<T>>>,
}

impl<T: Resource> KindBinding<T> {
    pub fn new<S>(kind: impl Into<KindTag>, source: Arc<S>) -> Self
    where
        S: SourceAdapter<T> + 'static,
    {
        Self {
            kind: kind.into(),
            source,
            handler: None,
        }
    }

    pub fn with_handler<H>(mut self, handler: Arc<H>) -> Self
    where
        H: Handler<T> + 'static,
    {
        self.handler = Some(handler as Arc<dyn Handler<T>>);
        self
    }
}

/// Point-in-time counters for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatus {
    pub kind: KindTag,
    pub synced: bool,
    pub cached: usize,
    pub queued: usize,
    pub waiting: usize,
    pub handled: u64,
    pub skipped: u64,
    pub retried: u64,
    pub given_up: u64,
}

/// How one kind's watch ended.
#[derive(Debug, Clone, Serialize)]
pub struct KindOutcome {
    pub kind: KindTag,
    /// Fatal source error, if the kind stopped on its own.
    pub error: Option<String>,
    pub status: KindStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub kinds: Vec<KindOutcome>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &KindOutcome> {
        self.kinds.iter().filter(|outcome| outcome.error.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Install the global subscriber. Filtered by `RUST_LOG`, default `info`;
/// output goes to stderr. Later calls are no-ops.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

struct StartContext {
    config: EngineConfig,
    error_sink: Arc<dyn ErrorSink>,
    started_at: DateTime<Utc>,
    shutdown_tx: broadcast::Sender<()>,
}

trait StatusProbe: Send + Sync {
    fn status(&self) -> KindStatus;
    fn shut_down_queue(&self);
}

struct KindProbe<T: Resource> {
    kind: KindTag,
    indexer: Arc<Indexer<T>>,
    queue: Arc<RateLimitingQueue<ObjectKey>>,
    stats: Arc<ReconcileStats>,
}

impl<T: Resource> StatusProbe for KindProbe<T> {
    fn status(&self) -> KindStatus {
        KindStatus {
            kind: self.kind.clone(),
            synced: self.indexer.has_synced(),
            cached: self.indexer.len(),
            queued: self.queue.len(),
            waiting: self.queue.waiting_len(),
            handled: self.stats.handled(),
            skipped: self.stats.skipped(),
            retried: self.stats.retried(),
            given_up: self.stats.given_up(),
        }
    }

    fn shut_down_queue(&self) {
        self.queue.shut_down();
    }
}

struct KindHandle {
    kind: KindTag,
    probe: Arc<dyn StatusProbe>,
    informer: JoinHandle<Result<(), EngineError>>,
    workers: Vec<JoinHandle<()>>,
}

/// Type-erased binding, so kinds with different object types share one
/// engine.
trait Controller: Send {
    fn kind(&self) -> &KindTag;
    fn start(self: Box<Self>, ctx: &StartContext) -> KindHandle;
}

impl<T: Resource> Controller for KindBinding<T> {
    fn kind(&self) -> &KindTag {
        &self.kind
    }

    fn start(self: Box<Self>, ctx: &StartContext) -> KindHandle {
        let binding = *self;
        let config = &ctx.config;

        let queue = Arc::new(RateLimitingQueue::new(default_rate_limiter(&config.backoff)));
        let indexer = Arc::new(Indexer::new(binding.kind.clone()));
        let ledger = Arc::new(ChangeLedger::new());

        let mut reconciler = Reconciler::new(
            indexer.clone(),
            queue.clone(),
            ledger.clone(),
            ctx.started_at,
            config.max_retries,
        )
        .with_error_sink(ctx.error_sink.clone());
        match binding.handler {
            Some(handler) => reconciler = reconciler.with_handler(handler),
            None => tracing::warn!(kind = %binding.kind, "no handler bound; every change will be given up"),
        }
        let stats = reconciler.stats();
        let reconciler = Arc::new(reconciler);

        let informer = Informer {
            kind: binding.kind.clone(),
            source: binding.source,
            indexer: indexer.clone(),
            ledger,
            queue: queue.clone(),
            options: ListOptions {
                namespace: config.namespace_scope().map(str::to_owned),
            },
            relist: config.relist.clone(),
        };

        let informer_handle = {
            let queue = queue.clone();
            let shutdown_rx = ctx.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let result = informer.run(shutdown_rx).await;
                queue.shut_down();
                result
            })
        };

        let workers = (0..config.workers)
            .map(|worker| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.run_worker(worker).await })
            })
            .collect();

        tracing::info!(kind = %binding.kind, workers = config.workers, "watching kind");

        KindHandle {
            kind: binding.kind.clone(),
            probe: Arc::new(KindProbe {
                kind: binding.kind,
                indexer,
                queue,
                stats,
            }),
            informer: informer_handle,
            workers,
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    controllers: Vec<Box<dyn Controller>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    started_at: Option<DateTime<Utc>>,
}

impl EngineBuilder {
    pub fn watch<T: Resource>(mut self, binding: KindBinding<T>) -> Self {
        self.controllers.push(Box::new(binding));
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Override the instant that separates pre-existing objects from new
    /// ones. Defaults to the time of [`build`](Self::build).
    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        for (i, controller) in self.controllers.iter().enumerate() {
            if self.controllers[..i]
                .iter()
                .any(|earlier| earlier.kind() == controller.kind())
            {
                return Err(EngineError::DuplicateBinding(controller.kind().clone()));
            }
        }
        Ok(Engine {
            config: self.config,
            controllers: self.controllers,
            error_sink: self
                .error_sink
                .unwrap_or_else(|| Arc::new(TracingErrorSink)),
            started_at: self.started_at.unwrap_or_else(Utc::now),
        })
    }
}

/// A configured engine instance. Owns its start time and configuration;
/// nothing is shared between instances.
pub struct Engine {
    config: EngineConfig,
    controllers: Vec<Box<dyn Controller>>,
    error_sink: Arc<dyn ErrorSink>,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            controllers: Vec::new(),
            error_sink: None,
            started_at: None,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Spawn every enabled kind. Must be called from within a tokio runtime.
    pub fn start(self) -> RunningEngine {
        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let ctx = StartContext {
            config: self.config,
            error_sink: self.error_sink,
            started_at: self.started_at,
            shutdown_tx: shutdown_tx.clone(),
        };

        for kind in ctx.config.enabled_kinds() {
            if !self.controllers.iter().any(|c| c.kind() == &kind) {
                tracing::warn!(kind = %kind, "kind enabled in config but nothing is bound to it");
            }
        }

        let mut kinds = Vec::new();
        for controller in self.controllers {
            if !ctx.config.is_enabled(controller.kind()) {
                tracing::info!(kind = %controller.kind(), "kind disabled in config, not starting");
                continue;
            }
            kinds.push(controller.start(&ctx));
        }

        tracing::info!(kinds = kinds.len(), started_at = %ctx.started_at, "engine started");
        RunningEngine { shutdown_tx, kinds }
    }

    /// Run until `signal` resolves or every kind has stopped on its own.
    pub async fn run_until<F>(self, signal: F) -> Result<RunSummary, EngineError>
    where
        F: Future<Output = ()>,
    {
        let running = self.start();
        let handle = running.shutdown_handle();
        let wait = running.wait();
        tokio::pin!(wait);
        tokio::select! {
            result = &mut wait => return result,
            _ = signal => {
                tracing::info!("shutdown requested");
                handle.shut_down();
            }
        }
        wait.await
    }
}

/// Stops a running engine from anywhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
    probes: Vec<Arc<dyn StatusProbe>>,
}

impl ShutdownHandle {
    /// Stop every informer and close every queue. Workers finish their
    /// current delivery and drain ready keys; delayed retries are dropped.
    pub fn shut_down(&self) {
        let _ = self.shutdown_tx.send(());
        for probe in &self.probes {
            probe.shut_down_queue();
        }
    }
}

pub struct RunningEngine {
    shutdown_tx: broadcast::Sender<()>,
    kinds: Vec<KindHandle>,
}

impl RunningEngine {
    pub fn status(&self) -> Vec<KindStatus> {
        self.kinds.iter().map(|kind| kind.probe.status()).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            probes: self.kinds.iter().map(|kind| kind.probe.clone()).collect(),
        }
    }

    pub fn shut_down(&self) {
        self.shutdown_handle().shut_down();
    }

    /// Wait for every kind to stop. A kind whose source became unavailable
    /// is recorded in the summary rather than failing the whole run.
    pub async fn wait(self) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::default();
        for handle in self.kinds {
            let error = match handle.informer.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(err) => return Err(join_error(&handle.kind, "informer", err)),
            };
            for worker in handle.workers {
                worker
                    .await
                    .map_err(|err| join_error(&handle.kind, "worker", err))?;
            }
            summary.kinds.push(KindOutcome {
                kind: handle.kind,
                error,
                status: handle.probe.status(),
            });
        }
        tracing::info!(kinds = summary.kinds.len(), "engine stopped");
        Ok(summary)
    }
}

fn join_error(kind: &KindTag, role: &str, err: tokio::task::JoinError) -> EngineError {
    EngineError::Join {
        task: format!("{kind} {role}"),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kwatch_core::GenericObject;

    use super::*;
    use crate::memory::MemorySource;

    fn config(kinds: &[(&str, bool)]) -> EngineConfig {
        EngineConfig {
            kinds: kinds
                .iter()
                .map(|(name, on)| (name.to_string(), *on))
                .collect::<BTreeMap<_, _>>(),
            ..EngineConfig::default()
        }
    }

    fn source() -> Arc<MemorySource<GenericObject>> {
        Arc::new(MemorySource::new())
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let err = Engine::builder(config(&[("pod", true)]))
            .watch(KindBinding::new("pod", source()))
            .watch(KindBinding::new("Pod", source()))
            .build()
            .err()
            .expect("duplicate");
        assert!(matches!(err, EngineError::DuplicateBinding(kind) if kind == KindTag::from("pod")));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config(&[("pod", true)]);
        cfg.workers = 0;
        let err = Engine::builder(cfg).build().err().expect("invalid");
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn disabled_kinds_are_not_started() {
        let engine = Engine::builder(config(&[("pod", true), ("deployment", false)]))
            .watch(KindBinding::new("pod", source()))
            .watch(KindBinding::new("deployment", source()))
            .watch(KindBinding::new("service", source()))
            .build()
            .expect("build");

        let running = engine.start();
        let kinds: Vec<_> = running.status().into_iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![KindTag::from("pod")]);

        running.shut_down();
        let summary = running.wait().await.expect("wait");
        assert_eq!(summary.kinds.len(), 1);
        assert_eq!(summary.failed().count(), 0);
    }

    #[tokio::test]
    async fn run_until_returns_after_signal() {
        let engine = Engine::builder(config(&[("pod", true)]))
            .watch(KindBinding::new("pod", source()))
            .build()
            .expect("build");
        let summary = engine.run_until(async {}).await.expect("run");
        assert_eq!(summary.kinds.len(), 1);
        assert!(summary.kinds[0].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_returns_once_every_kind_has_stopped() {
        let failing = source();
        failing.fail_snapshots(u32::MAX);
        let engine = Engine::builder(config(&[("pod", true)]))
            .watch(KindBinding::new("pod", failing))
            .build()
            .expect("build");
        let summary = engine
            .run_until(std::future::pending::<()>())
            .await
            .expect("run");
        assert_eq!(summary.failed().count(), 1);
        assert_eq!(summary.kinds[0].status.handled, 0);
    }
}
