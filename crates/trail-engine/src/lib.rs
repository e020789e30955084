pub mod config;
pub mod error;
pub mod events;
pub mod pairing;
pub mod parser;
pub mod registry;
pub mod storage;
pub mod summary;
pub mod tail;
pub mod watcher;

pub use events::EventBus;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use trail_types::{
    config::TrailConfig,
    event::{EngineEvent, SessionEndReport},
    pricing::PricingTable,
    session::{HookSignal, SessionEndSignal, SessionRecord, SessionStartSignal},
    trace::TraceEvent,
};

use config::Layout;
use error::RegistryError;
use parser::TranscriptParser;
use registry::SessionRegistry;
use storage::{TraceWriter, WriteReport};
use summary::SessionSummary;
use watcher::{LiveWatcher, WatchOutcome, WatcherHandle, WatcherOptions, WatcherState};

/// Session lifecycle orchestrator. Owns the registry, the trace writer and
/// one live watcher per active session, and turns start/end signals into
/// registry records, live stats and stored trace events.
pub struct Engine {
    layout: Layout,
    pricing: Arc<PricingTable>,
    parser: TranscriptParser,
    registry: Arc<SessionRegistry>,
    writer: Arc<TraceWriter>,
    watcher_options: WatcherOptions,
    parse_timeout: Duration,
    watchers: Mutex<HashMap<String, WatcherHandle>>,
    /// Sessions with an end pass in flight.
    ending: std::sync::Mutex<HashSet<String>>,
    event_bus: EventBus,
}

impl Engine {
    /// Build an engine with storage resolved from `config`.
    pub fn new(config: &TrailConfig) -> Result<Self> {
        let layout = Layout::from_config(config)?;
        Ok(Self::with_layout(config, layout))
    }

    /// Build an engine that stores everything under `layout`.
    pub fn with_layout(config: &TrailConfig, layout: Layout) -> Self {
        let pricing = Arc::new(config::pricing_table(config));
        let parser = TranscriptParser::new(Arc::clone(&pricing), config.parser.pairing);

        Self {
            registry: Arc::new(SessionRegistry::new(layout.registry_path())),
            writer: Arc::new(TraceWriter::new(layout.clone())),
            layout,
            pricing,
            parser,
            watcher_options: WatcherOptions::from(&config.watcher),
            parse_timeout: Duration::from_secs(config.parser.timeout_secs),
            watchers: Mutex::new(HashMap::new()),
            ending: std::sync::Mutex::new(HashSet::new()),
            event_bus: EventBus::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn parser(&self) -> &TranscriptParser {
        &self.parser
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &TraceWriter {
        &self.writer
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    // ─── Signal entry points ──────────────────────────────────────────────────

    /// Decode and handle one raw hook payload. Failures are logged and never
    /// returned: the hook that sent the signal must not be failed by tracing.
    pub async fn handle_raw(&self, raw: &str) {
        match HookSignal::from_json(raw) {
            Ok(signal) => self.handle(signal).await,
            Err(e) => warn!(error = %e, "Ignoring invalid hook signal"),
        }
    }

    /// Handle a decoded signal, logging instead of returning failures.
    pub async fn handle(&self, signal: HookSignal) {
        let session_id = signal.session_id().to_string();
        if let Err(e) = self.dispatch(signal).await {
            error!(session_id = %session_id, "Hook signal failed: {e:#}");
        }
    }

    pub async fn dispatch(&self, signal: HookSignal) -> Result<()> {
        match signal {
            HookSignal::Start(start) => self.on_session_start(start).await.map(drop),
            HookSignal::End(end) => self.on_session_end(end).await.map(drop),
        }
    }

    /// Register the session and start its live watcher.
    pub async fn on_session_start(&self, signal: SessionStartSignal) -> Result<SessionRecord> {
        let record = self.register(&signal)?;
        self.start_watcher(&record).await;
        self.event_bus.publish(EngineEvent::SessionStarted {
            session_id: record.session_id.clone(),
        });
        info!(
            session_id = %record.session_id,
            source = %record.source,
            transcript = %record.transcript_path.display(),
            "Session started"
        );
        Ok(record)
    }

    /// Registry half of a session start, without a watcher. Used by one-shot
    /// hook invocations that do not outlive the signal.
    pub fn register(&self, signal: &SessionStartSignal) -> Result<SessionRecord, RegistryError> {
        self.registry
            .open(&signal.session_id, &signal.transcript_path, &signal.source)
    }

    /// Stop the watcher, run the authoritative parse, store its events and
    /// close the registry entry.
    pub async fn on_session_end(&self, signal: SessionEndSignal) -> Result<SessionEndReport> {
        let session_id = signal.session_id.as_str();
        // Held until the registry entry is closed, so an overlapping end for
        // the same session is rejected instead of parsing a second time.
        let _claim = self.claim_end(session_id)?;
        let record = self.registry.get(session_id)?;
        if let Some(record) = &record {
            if !record.is_active() {
                return Err(RegistryError::AlreadyClosed {
                    session_id: session_id.to_string(),
                }
                .into());
            }
        }
        let transcript = authoritative_transcript(record.as_ref(), &signal);

        let handle = self.watchers.lock().await.remove(session_id);
        let live = match handle {
            Some(mut handle) => handle.stop().await.map(|outcome| outcome.stats),
            None => None,
        };

        let pass = self.end_pass(session_id, &transcript).await;

        // The entry is closed even when the pass failed, so a broken
        // transcript cannot leave a session active forever.
        if record.is_some() {
            if let Err(e) = self.registry.close(session_id) {
                warn!(session_id, error = %e, "Failed to close registry entry");
            }
        } else {
            warn!(session_id, "Session end without a registry entry");
        }

        let (events, written) = pass?;

        if let Err(e) = storage::remove_live_stats(&self.layout.live_stats_path(session_id)) {
            debug!(session_id, error = %e, "Could not remove live stats");
        }

        let report = SessionEndReport {
            session_id: session_id.to_string(),
            events: events.len(),
            written: written.written,
            failed: written.failed,
            total: SessionSummary::from_events(session_id, &events).total,
            live,
        };
        info!(
            session_id,
            events = report.events,
            written = report.written,
            failed = report.failed,
            cost_usd = report.total.cost_usd,
            "Session ended"
        );
        self.event_bus.publish(EngineEvent::SessionEnded {
            report: report.clone(),
        });
        Ok(report)
    }

    fn claim_end(&self, session_id: &str) -> Result<EndClaim<'_>, RegistryError> {
        let mut ending = self.ending.lock().unwrap_or_else(PoisonError::into_inner);
        if !ending.insert(session_id.to_string()) {
            return Err(RegistryError::AlreadyClosed {
                session_id: session_id.to_string(),
            });
        }
        Ok(EndClaim {
            ending: &self.ending,
            session_id: session_id.to_string(),
        })
    }

    /// Full parse and write on a blocking thread, bounded by the parse
    /// timeout. If the timeout fires the thread is left to finish on its own.
    async fn end_pass(
        &self,
        session_id: &str,
        transcript: &Path,
    ) -> Result<(Vec<TraceEvent>, WriteReport)> {
        let parser = self.parser.clone();
        let writer = Arc::clone(&self.writer);
        let id = session_id.to_string();
        let path = transcript.to_path_buf();

        let task = tokio::task::spawn_blocking(move || {
            let events = parser.parse(&path, &id)?;
            let report = writer.write_all(&events);
            Ok::<_, error::ParseError>((events, report))
        });

        match tokio::time::timeout(self.parse_timeout, task).await {
            Err(_) => bail!(
                "End-of-session pass for {session_id} timed out after {}s",
                self.parse_timeout.as_secs()
            ),
            Ok(Err(join)) => Err(anyhow!(join).context("End-of-session pass aborted")),
            Ok(Ok(result)) => result.with_context(|| {
                format!("Failed to parse transcript {}", transcript.display())
            }),
        }
    }

    // ─── Watchers ─────────────────────────────────────────────────────────────

    async fn start_watcher(&self, record: &SessionRecord) {
        let mut watchers = self.watchers.lock().await;
        if let Some(existing) = watchers.get(&record.session_id) {
            if !existing.is_finished() {
                debug!(session_id = %record.session_id, "Watcher already running");
                return;
            }
        }

        let handle = LiveWatcher::new(
            &record.session_id,
            &record.transcript_path,
            self.layout.live_stats_path(&record.session_id),
            Arc::clone(&self.pricing),
            self.watcher_options.clone(),
        )
        .with_events(self.event_bus.clone())
        .spawn();
        watchers.insert(record.session_id.clone(), handle);
    }

    /// Restart watchers for every session the registry still lists as active.
    /// Returns how many sessions were resumed.
    pub async fn resume_active_sessions(&self) -> Result<usize> {
        let active = self
            .registry
            .active()
            .context("Failed to read session registry")?;
        for record in &active {
            self.start_watcher(record).await;
        }
        if !active.is_empty() {
            info!(count = active.len(), "Resumed live watchers");
        }
        Ok(active.len())
    }

    pub async fn watcher_state(&self, session_id: &str) -> Option<WatcherState> {
        self.watchers
            .lock()
            .await
            .get(session_id)
            .map(WatcherHandle::state)
    }

    /// Stop every watcher. Sessions stay active in the registry and can be
    /// resumed later. Calling this twice is harmless.
    pub async fn shutdown(&self) -> Vec<WatchOutcome> {
        let handles: Vec<_> = self.watchers.lock().await.drain().collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for (_, mut handle) in handles {
            if let Some(outcome) = handle.stop().await {
                outcomes.push(outcome);
            }
        }
        if !outcomes.is_empty() {
            info!(count = outcomes.len(), "Stopped live watchers");
        }
        outcomes
    }
}

struct EndClaim<'a> {
    ending: &'a std::sync::Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for EndClaim<'_> {
    fn drop(&mut self) {
        self.ending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

/// The registry's path wins over the signal's when both are known.
fn authoritative_transcript(record: Option<&SessionRecord>, signal: &SessionEndSignal) -> PathBuf {
    match record {
        Some(record) => {
            if record.transcript_path != signal.transcript_path {
                warn!(
                    session_id = %signal.session_id,
                    registered = %record.transcript_path.display(),
                    signalled = %signal.transcript_path.display(),
                    "Transcript path differs from registry; using registry"
                );
            }
            record.transcript_path.clone()
        }
        None => signal.transcript_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn engine(dir: &Path) -> Engine {
        let mut config = TrailConfig::default();
        config.watcher.poll_interval_ms = 20;
        config.watcher.fs_events = false;
        Engine::with_layout(&config, Layout::new(dir.join("traces")))
    }

    fn tool_line(tool: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": "2026-01-31T10:00:00Z",
            "message": {"model": "claude-sonnet-4-5-20250929",
                        "content": [{"type": "tool_use", "name": tool, "input": {}}],
                        "usage": {"input_tokens": 100, "output_tokens": 10}}
        })
        .to_string()
    }

    fn start(id: &str, transcript: &Path) -> SessionStartSignal {
        SessionStartSignal {
            session_id: id.into(),
            transcript_path: transcript.into(),
            source: "startup".into(),
        }
    }

    fn end(id: &str, transcript: &Path) -> SessionEndSignal {
        SessionEndSignal {
            session_id: id.into(),
            transcript_path: transcript.into(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn duplicate_end_does_not_write_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("t.jsonl");
        std::fs::write(&transcript, format!("{}\n", tool_line("Bash"))).unwrap();
        let engine = engine(tmp.path());

        engine.on_session_start(start("s1", &transcript)).await.unwrap();
        let report = engine.on_session_end(end("s1", &transcript)).await.unwrap();
        assert_eq!(report.written, 1);

        assert!(engine.on_session_end(end("s1", &transcript)).await.is_err());
        assert_eq!(engine.writer().read_session("s1").unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_ends_parse_once() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("t.jsonl");
        std::fs::write(&transcript, format!("{}\n", tool_line("Bash"))).unwrap();
        let engine = engine(tmp.path());
        engine.register(&start("s1", &transcript)).unwrap();

        let (a, b) = tokio::join!(
            engine.on_session_end(end("s1", &transcript)),
            engine.on_session_end(end("s1", &transcript))
        );
        assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);
        let rejected = a.err().or(b.err()).unwrap();
        assert!(matches!(
            rejected.downcast_ref::<RegistryError>(),
            Some(RegistryError::AlreadyClosed { .. })
        ));
        assert_eq!(engine.writer().read_session("s1").unwrap().len(), 1);
        assert!(!engine.registry().get("s1").unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn write_failure_still_ends_session() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("t.jsonl");
        std::fs::write(&transcript, format!("{}\n", tool_line("Bash"))).unwrap();
        let engine = engine(tmp.path());
        engine.register(&start("s1", &transcript)).unwrap();

        // A directory where the day's partition file belongs.
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        std::fs::create_dir_all(engine.layout().partition_path(date)).unwrap();

        let report = engine.on_session_end(end("s1", &transcript)).await.unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.written, 0);
        assert!(report.failed > 0);
        assert!(!engine.registry().get("s1").unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn failed_parse_still_closes_session() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("never-written.jsonl");
        let engine = engine(tmp.path());

        engine.on_session_start(start("s1", &transcript)).await.unwrap();
        let err = engine.on_session_end(end("s1", &transcript)).await.unwrap_err();
        assert!(format!("{err:#}").contains("never-written.jsonl"));

        let record = engine.registry().get("s1").unwrap().unwrap();
        assert!(!record.is_active());
        assert!(engine.watcher_state("s1").await.is_none());
    }

    #[tokio::test]
    async fn registry_path_wins_over_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("real.jsonl");
        std::fs::write(&transcript, format!("{}\n", tool_line("Read"))).unwrap();
        let engine = engine(tmp.path());

        engine.register(&start("s1", &transcript)).unwrap();
        let report = engine
            .on_session_end(end("s1", &tmp.path().join("bogus.jsonl")))
            .await
            .unwrap();
        assert_eq!(report.events, 1);
        assert!(report.live.is_none());
    }

    #[tokio::test]
    async fn invalid_signals_are_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());

        engine.handle_raw("not json").await;
        engine
            .handle_raw(r#"{"hook_event_name":"SessionStart","transcript_path":"/x"}"#)
            .await;
        engine
            .handle_raw(r#"{"hook_event_name":"SessionEnd","session_id":"ghost","transcript_path":"/nope"}"#)
            .await;
        assert!(engine.registry().latest().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_and_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = tmp.path().join("t.jsonl");
        let mut f = std::fs::File::create(&transcript).unwrap();
        writeln!(f, "{}", tool_line("Bash")).unwrap();
        let engine = engine(tmp.path());

        engine.on_session_start(start("s1", &transcript)).await.unwrap();
        let outcomes = engine.shutdown().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].stats.message_count, 1);
        assert!(engine.shutdown().await.is_empty());
        assert!(engine.registry().get("s1").unwrap().unwrap().is_active());

        assert_eq!(engine.resume_active_sessions().await.unwrap(), 1);
        assert_eq!(
            engine.watcher_state("s1").await.map(|s| matches!(s, WatcherState::Stopped(_))),
            Some(false)
        );
        engine.shutdown().await;
    }
}
