//! `kwatch replay`: drive the engine from a YAML fixture.
//!
//! The fixture's snapshot seeds an in-memory source; once the engine has
//! synced, its events are emitted in order. Every delivery the handler sees
//! is printed to stdout as one JSON line, followed by a summary line. Logs
//! go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use kwatch_core::{ChangeKind, ChangeNotification, GenericObject, KindTag};
use kwatch_engine::{
    init_tracing, Engine, Handler, HandlerError, KindBinding, KindOutcome, LogFormat,
    MemorySource, RunningEngine,
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Fixture file (YAML).
    pub fixture: PathBuf,

    /// Config file. Defaults to $KWATCH_CONFIG, then ~/.kwatch.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How long to let workers drain after the last event.
    #[arg(long, default_value_t = 200)]
    pub settle_ms: u64,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Plain)]
    pub log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Plain,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Plain => LogFormat::Plain,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Fixture {
    kind: String,
    /// Pins the engine start instant so creation suppression is
    /// reproducible.
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    snapshot: Vec<GenericObject>,
    #[serde(default)]
    events: Vec<FixtureEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureEvent {
    change: ChangeKind,
    object: GenericObject,
}

#[derive(Serialize)]
struct Delivery<'a> {
    change: ChangeKind,
    kind: &'a KindTag,
    key: String,
    resource_version: Option<&'a str>,
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    summary: &'a [KindOutcome],
}

/// Prints each delivery and always succeeds.
struct PrintHandler;

impl PrintHandler {
    fn print(&self, notification: &ChangeNotification, object: Option<&GenericObject>) -> Result<(), HandlerError> {
        let line = serde_json::to_string(&Delivery {
            change: notification.kind,
            kind: &notification.kind_tag,
            key: notification.key.to_string(),
            resource_version: object.map(|o| o.resource_version.as_str()),
        })
        .map_err(|err| HandlerError::Other(Box::new(err)))?;
        println!("{line}");
        Ok(())
    }
}

#[async_trait]
impl Handler<GenericObject> for PrintHandler {
    async fn on_create(&self, notification: &ChangeNotification, object: &GenericObject) -> Result<(), HandlerError> {
        self.print(notification, Some(object))
    }

    async fn on_update(&self, notification: &ChangeNotification, object: &GenericObject) -> Result<(), HandlerError> {
        self.print(notification, Some(object))
    }

    async fn on_delete(
        &self,
        notification: &ChangeNotification,
        object: Option<&GenericObject>,
    ) -> Result<(), HandlerError> {
        self.print(notification, object)
    }
}

impl ReplayArgs {
    pub fn run(self) -> Result<()> {
        init_tracing(self.log_format.into());
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start tokio runtime")?;
        runtime.block_on(self.replay())
    }

    async fn replay(self) -> Result<()> {
        let fixture = load_fixture(&self.fixture)?;
        let mut config = super::load_config(self.config.as_deref())?;

        let kind = KindTag::from(fixture.kind.as_str());
        if !config.kinds.keys().any(|name| name.eq_ignore_ascii_case(&kind.0)) {
            config.kinds.insert(kind.0.clone(), true);
        }

        let source = Arc::new(MemorySource::with_objects(fixture.snapshot));
        let mut builder = Engine::builder(config)
            .watch(KindBinding::new(kind, source.clone()).with_handler(Arc::new(PrintHandler)));
        if let Some(started_at) = fixture.started_at {
            builder = builder.started_at(started_at);
        }
        let engine = builder
            .build()
            .context("failed to build engine")?
            .start();

        wait_for_sync(&engine).await?;
        for event in fixture.events {
            source.emit(event.change, event.object);
        }
        tokio::time::sleep(Duration::from_millis(self.settle_ms)).await;

        engine.shut_down();
        let summary = engine.wait().await.context("engine did not stop cleanly")?;
        println!(
            "{}",
            serde_json::to_string(&SummaryLine {
                summary: &summary.kinds
            })
            .context("failed to serialize summary")?
        );

        if let Some(failed) = summary.failed().next() {
            bail!(
                "kind '{}' stopped: {}",
                failed.kind,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}

fn load_fixture(path: &Path) -> Result<Fixture> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse fixture {}", path.display()))
}

/// Events must not reach the source before the first snapshot is taken,
/// or they would be folded into it.
async fn wait_for_sync(engine: &RunningEngine) -> Result<()> {
    let synced = async {
        while !engine.status().iter().all(|status| status.synced) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(SYNC_TIMEOUT, synced)
        .await
        .context("timed out waiting for the initial snapshot")
}
