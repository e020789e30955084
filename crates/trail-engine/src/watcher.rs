//! Live watcher: one background task per active session that tails the
//! transcript and keeps a running token and cost total on disk.
//!
//! The watcher reads only newly appended complete lines (see [`LineTail`]),
//! prices each assistant message with the same primitive the full parser
//! uses, and rewrites the session's live stats file after every update. It
//! never writes trace events.
//!
//! Filesystem notifications are only a wake-up hint; a bounded poll interval
//! guarantees progress when they are unavailable or missed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trail_types::config::WatcherConfig;
use trail_types::event::{EngineEvent, StopReason};
use trail_types::live::LiveStats;
use trail_types::pricing::PricingTable;
use trail_types::transcript::TranscriptLine;

use crate::events::EventBus;
use crate::parser::priced_usage;
use crate::storage::write_live_stats;
use crate::tail::{LineTail, TailRead};

/// Floor for the poll interval so a zero in config cannot spin.
const MIN_POLL: Duration = Duration::from_millis(10);

const WAKE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Watching,
    Stopped(StopReason),
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub fs_events: bool,
    pub stop_on_truncate: bool,
}

impl From<&WatcherConfig> for WatcherOptions {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms).max(MIN_POLL),
            idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
            fs_events: config.fs_events,
            stop_on_truncate: config.stop_on_truncate,
        }
    }
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

/// Final totals and the reason the watcher stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOutcome {
    pub stats: LiveStats,
    pub reason: StopReason,
}

pub struct LiveWatcher {
    session_id: String,
    transcript: PathBuf,
    live_path: PathBuf,
    pricing: Arc<PricingTable>,
    options: WatcherOptions,
    events: Option<EventBus>,
}

impl LiveWatcher {
    pub fn new(
        session_id: impl Into<String>,
        transcript: impl Into<PathBuf>,
        live_path: impl Into<PathBuf>,
        pricing: Arc<PricingTable>,
        options: WatcherOptions,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            transcript: transcript.into(),
            live_path: live_path.into(),
            pricing,
            options,
            events: None,
        }
    }

    /// Publish `LiveUpdate` and `WatcherStopped` on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Run the watcher as a tokio task.
    pub fn spawn(self) -> WatcherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WatcherState::Starting);
        let session_id = self.session_id.clone();
        let task = tokio::spawn(self.run(stop_rx, state_tx));

        WatcherHandle {
            session_id,
            stop_tx,
            state_rx,
            task: Some(task),
            outcome: None,
        }
    }

    /// Watch until stopped. A dropped stop sender counts as a stop request.
    pub async fn run(
        self,
        mut stop_rx: watch::Receiver<bool>,
        state_tx: watch::Sender<WatcherState>,
    ) -> WatchOutcome {
        let mut tail = LineTail::new(&self.transcript);
        let mut stats = LiveStats::new(&self.session_id);

        // The original sender stays alive here so `recv` only resolves on a
        // real notification, never on a closed channel.
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(WAKE_CAPACITY);
        let _fs_watcher = if self.options.fs_events {
            match start_fs_watcher(&self.transcript, wake_tx.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    debug!(session_id = %self.session_id, error = %e, "File notifications unavailable; polling only");
                    None
                }
            }
        } else {
            None
        };

        state_tx.send_replace(WatcherState::Watching);
        info!(
            session_id = %self.session_id,
            transcript = %self.transcript.display(),
            "Live watcher started"
        );

        let mut seen_file = false;
        let mut stop_requested = false;
        let mut last_activity = Instant::now();

        let reason = loop {
            let stopping = stop_requested || *stop_rx.borrow_and_update();

            match tail.read_new_lines().await {
                Ok(TailRead::Lines(lines)) => {
                    seen_file = true;
                    if !lines.is_empty() {
                        last_activity = Instant::now();
                    }
                    self.consume(lines.iter().map(String::as_str), &mut stats).await;
                }
                Ok(TailRead::Truncated) => {
                    if self.options.stop_on_truncate {
                        break StopReason::TranscriptTruncated;
                    }
                    warn!(session_id = %self.session_id, "Transcript truncated; restarting totals");
                    stats = LiveStats::new(&self.session_id);
                    self.persist(&stats).await;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if seen_file {
                        break StopReason::TranscriptRemoved;
                    }
                    // Not created yet.
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Failed to read transcript");
                }
            }

            if stopping {
                if seen_file {
                    self.drain_remainder(&mut tail, &mut stats).await;
                }
                break StopReason::Requested;
            }

            if let Some(idle) = self.options.idle_timeout {
                if last_activity.elapsed() >= idle {
                    break StopReason::IdleTimeout;
                }
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        stop_requested = true;
                    }
                }
                Some(()) = wake_rx.recv() => {
                    while wake_rx.try_recv().is_ok() {}
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        };

        state_tx.send_replace(WatcherState::Stopped(reason));
        info!(
            session_id = %self.session_id,
            %reason,
            messages = stats.message_count,
            cost_usd = stats.cost_usd,
            "Live watcher stopped"
        );
        self.publish(EngineEvent::WatcherStopped {
            session_id: self.session_id.clone(),
            reason,
        });

        WatchOutcome { stats, reason }
    }

    /// Fold decoded lines into `stats`, persisting after every message that
    /// carried usage. Returns the number of such messages.
    async fn consume<'l>(
        &self,
        lines: impl IntoIterator<Item = &'l str>,
        stats: &mut LiveStats,
    ) -> usize {
        let mut updated = 0;
        for raw in lines {
            let Some(line) = TranscriptLine::decode(raw) else {
                continue;
            };
            let Some((usage, cost)) = priced_usage(&line, &self.pricing) else {
                continue;
            };
            stats.record(&usage, cost);
            updated += 1;

            self.persist(stats).await;
            self.publish(EngineEvent::LiveUpdate {
                stats: stats.clone(),
            });
        }
        updated
    }

    /// The session is over, so a final line without its newline is complete.
    async fn drain_remainder(&self, tail: &mut LineTail, stats: &mut LiveStats) {
        match tail.read_remainder().await {
            Ok(Some(line)) => {
                self.consume([line.as_str()], stats).await;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "No trailing line to drain");
            }
        }
    }

    async fn persist(&self, stats: &LiveStats) {
        if let Err(e) = write_live_stats(&self.live_path, stats).await {
            warn!(
                session_id = %self.session_id,
                path = %self.live_path.display(),
                error = %e,
                "Failed to write live stats"
            );
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Watch the transcript's directory and wake the loop on any event that
/// touches the transcript itself.
fn start_fs_watcher(path: &Path, wake: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let target = path.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|p| p == &target) {
                // Full means a wake-up is already queued.
                let _ = wake.try_send(());
            }
        }
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Owner's side of a running watcher.
pub struct WatcherHandle {
    session_id: String,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WatcherState>,
    task: Option<JoinHandle<WatchOutcome>>,
    outcome: Option<WatchOutcome>,
}

impl WatcherHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> WatcherState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state_rx.clone()
    }

    /// True once the watcher has stopped, whether asked to or on its own.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the watcher to stop and wait for it. Safe to call repeatedly and
    /// after the watcher already stopped by itself; later calls return the
    /// same outcome. `None` only if the task panicked.
    pub async fn stop(&mut self) -> Option<WatchOutcome> {
        if let Some(outcome) = &self.outcome {
            return Some(outcome.clone());
        }
        self.stop_tx.send_replace(true);

        let task = self.task.take()?;
        match task.await {
            Ok(outcome) => {
                self.outcome = Some(outcome.clone());
                Some(outcome)
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Live watcher task failed");
                None
            }
        }
    }
}
