use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use trail_engine::config::Layout;
use trail_engine::error::RegistryError;
use trail_engine::storage::read_live_stats;
use trail_engine::Engine;
use trail_types::config::TrailConfig;
use trail_types::event::EngineEvent;
use trail_types::live::LiveStats;
use trail_types::session::{HookSignal, SessionEndSignal, SessionStartSignal};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: tempfile::TempDir,
    transcript: PathBuf,
    engine: Engine,
    events: broadcast::Receiver<EngineEvent>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("project").join("session.jsonl");
        std::fs::create_dir_all(transcript.parent().unwrap()).unwrap();
        std::fs::write(&transcript, "").unwrap();

        let mut config = TrailConfig::default();
        config.watcher.poll_interval_ms = 20;
        let engine = Engine::with_layout(&config, Layout::new(dir.path().join("traces")));
        let events = engine.subscribe_events();

        Self {
            _dir: dir,
            transcript,
            engine,
            events,
        }
    }

    fn append(&self, line: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.transcript)
            .unwrap();
        writeln!(f, "{line}").unwrap();
    }

    fn start_signal(&self, id: &str) -> SessionStartSignal {
        SessionStartSignal {
            session_id: id.into(),
            transcript_path: self.transcript.clone(),
            source: "startup".into(),
        }
    }

    fn end_signal(&self, id: &str) -> SessionEndSignal {
        SessionEndSignal {
            session_id: id.into(),
            transcript_path: self.transcript.clone(),
            reason: Some("exit".into()),
        }
    }

    async fn next_live(&mut self) -> LiveStats {
        loop {
            match timeout(WAIT, self.events.recv()).await.unwrap().unwrap() {
                EngineEvent::LiveUpdate { stats } => return stats,
                _ => continue,
            }
        }
    }
}

fn assistant(ts: &str, tool: &str, input: u64, output: u64) -> String {
    serde_json::json!({
        "type": "assistant",
        "timestamp": ts,
        "sessionId": "s1",
        "message": {
            "id": format!("msg-{tool}"),
            "model": "claude-sonnet-4-5-20250929",
            "content": [
                {"type": "text", "text": "working on it"},
                {"type": "tool_use", "id": format!("toolu-{tool}"), "name": tool, "input": {"path": "src/main.rs"}}
            ],
            "usage": {
                "input_tokens": input,
                "output_tokens": output,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 0
            }
        }
    })
    .to_string()
}

fn live_path(engine: &Engine, id: &str) -> PathBuf {
    engine.layout().live_stats_path(id)
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn end_to_end_two_tool_session() {
    let mut h = Harness::new();
    h.engine.on_session_start(h.start_signal("s1")).await.unwrap();

    h.append(&assistant("2026-01-31T10:00:00Z", "FileRead", 1000, 500));
    let live = h.next_live().await;
    assert!(close(live.cost_usd, 0.0105));

    h.append(r#"{"type":"user","message":{"content":"thanks"}}"#);
    h.append(&assistant("2026-01-31T10:00:07Z", "FileWrite", 200, 100));
    let live = h.next_live().await;
    assert!(close(live.cost_usd, 0.0126));
    assert_eq!(live.message_count, 2);

    let on_disk = read_live_stats(&live_path(&h.engine, "s1")).unwrap().unwrap();
    assert!(close(on_disk.cost_usd, 0.0126));

    let report = h.engine.on_session_end(h.end_signal("s1")).await.unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.written, 2);
    assert_eq!(report.failed, 0);
    assert!(close(report.total.cost_usd, 0.0126));

    let stored = h.engine.writer().read_session("s1").unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].tool_name, "FileRead");
    assert!(close(stored[0].metrics.cost_usd, 0.0105));
    assert_eq!(stored[1].tool_name, "FileWrite");
    assert!(close(stored[1].metrics.cost_usd, 0.0021));
    assert!(stored.iter().all(|e| e.trace_id == "s1"));
    assert_ne!(stored[0].span_id, stored[1].span_id);

    let record = h.engine.registry().get("s1").unwrap().unwrap();
    assert!(record.ended_at.is_some());
    assert!(!live_path(&h.engine, "s1").exists());

    let registry_lines = std::fs::read_to_string(h.engine.layout().registry_path()).unwrap();
    assert_eq!(registry_lines.lines().count(), 2);
}

#[tokio::test]
async fn live_totals_match_final_pass() {
    let mut h = Harness::new();
    h.engine.on_session_start(h.start_signal("s1")).await.unwrap();

    let usages = [(1200, 40), (35, 900), (0, 12), (77_000, 3)];
    for (i, (input, output)) in usages.iter().enumerate() {
        h.append(&assistant("2026-01-31T11:00:00Z", &format!("Tool{i}"), *input, *output));
        if i % 2 == 0 {
            h.append("garbage that is not json");
        }
    }

    let report = h.engine.on_session_end(h.end_signal("s1")).await.unwrap();
    let live = report.live.clone().unwrap();

    assert_eq!(live.usage(), report.total.usage());
    assert!(close(live.cost_usd, report.total.cost_usd));
    assert_eq!(report.events, usages.len());
}

#[tokio::test]
async fn duplicate_start_keeps_one_active_record() {
    let h = Harness::new();
    h.engine.on_session_start(h.start_signal("s1")).await.unwrap();

    let err = h
        .engine
        .on_session_start(h.start_signal("s1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::AlreadyActive { .. })
    ));

    let active = h.engine.registry().active().unwrap();
    assert_eq!(active.len(), 1);
    let raw = std::fs::read_to_string(h.engine.layout().registry_path()).unwrap();
    assert_eq!(raw.lines().count(), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn raw_hook_signals_drive_the_lifecycle() {
    let h = Harness::new();
    h.append(&assistant("2026-01-31T12:00:00Z", "Bash", 10, 10));

    let path = h.transcript.display().to_string();
    let start = serde_json::json!({
        "hook_event_name": "SessionStart",
        "session_id": "s2",
        "transcript_path": path,
        "source": "resume",
        "cwd": "/work"
    })
    .to_string();
    let end = serde_json::json!({
        "hook_event_name": "SessionEnd",
        "session_id": "s2",
        "transcript_path": path,
        "reason": "logout"
    })
    .to_string();

    assert!(matches!(HookSignal::from_json(&start), Ok(HookSignal::Start(_))));
    h.engine.handle_raw(&start).await;
    h.engine.handle_raw(&end).await;

    let record = h.engine.registry().get("s2").unwrap().unwrap();
    assert_eq!(record.source, "resume");
    assert!(!record.is_active());
    assert_eq!(h.engine.writer().read_session("s2").unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_sessions_share_a_partition() {
    let h = Harness::new();
    let other: &Path = &h.transcript.with_file_name("other.jsonl");
    std::fs::write(other, format!("{}\n", assistant("2026-01-31T13:00:00Z", "Grep", 5, 5))).unwrap();
    h.append(&assistant("2026-01-31T13:00:00Z", "Glob", 5, 5));

    h.engine.on_session_start(h.start_signal("a")).await.unwrap();
    h.engine
        .on_session_start(SessionStartSignal {
            session_id: "b".into(),
            transcript_path: other.to_path_buf(),
            source: "startup".into(),
        })
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(
        h.engine.on_session_end(h.end_signal("a")),
        h.engine.on_session_end(SessionEndSignal {
            session_id: "b".into(),
            transcript_path: other.to_path_buf(),
            reason: None,
        })
    );
    assert_eq!(ra.unwrap().written, 1);
    assert_eq!(rb.unwrap().written, 1);

    let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
    assert_eq!(h.engine.writer().read_partition(date).unwrap().len(), 2);
}
