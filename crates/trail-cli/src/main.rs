use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use trail_engine::config::{self, Layout};
use trail_engine::parser::TranscriptParser;
use trail_engine::storage::{read_live_stats, TraceWriter};
use trail_engine::summary::SessionSummary;
use trail_engine::watcher::{LiveWatcher, WatcherOptions};
use trail_engine::{Engine, EventBus};
use trail_types::config::TrailConfig;
use trail_types::event::EngineEvent;
use trail_types::session::{validate_session_id, SessionEndSignal, SessionStartSignal};

#[derive(Parser)]
#[command(name = "trail", version, about = "Trail — token, cost and tool traces for agent sessions")]
struct Cli {
    /// Config file (defaults to ~/.trail/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// SessionStart hook: register the session described on stdin
    Start,
    /// SessionEnd hook: trace the transcript of the session described on stdin
    End,
    /// Run as a long-lived tracer fed newline-delimited hook payloads on stdin
    Run,
    /// Follow one transcript in the foreground, keeping its live stats current
    Watch {
        session_id: String,
        transcript: PathBuf,
    },
    /// Parse a transcript and print its trace events as JSON lines
    Parse {
        transcript: PathBuf,
        #[arg(long, default_value = "local")]
        session_id: String,
    },
    /// Summarize the stored traces of one session
    Summary { session_id: String },
    /// List active sessions and their live totals
    Status,
}

impl Commands {
    /// Hook entry points report failures in the log and still exit cleanly.
    fn is_hook(&self) -> bool {
        matches!(self, Commands::Start | Commands::End)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_ref());
    let level = loaded
        .as_ref()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let hook = cli.command.is_hook();
    let result = match loaded {
        Ok(cfg) => run(cli.command, cfg).await,
        Err(e) => Err(e),
    };

    match result {
        Err(e) if hook => {
            error!("{e:#}");
            Ok(())
        }
        other => other,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TrailConfig> {
    let path = match path {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };
    config::load_config(&path)
}

async fn run(command: Commands, cfg: TrailConfig) -> Result<()> {
    match command {
        Commands::Start => {
            let signal = SessionStartSignal::from_json(&read_stdin()?)?;
            let engine = Engine::new(&cfg)?;
            engine.register(&signal)?;
            Ok(())
        }
        Commands::End => {
            let signal = SessionEndSignal::from_json(&read_stdin()?)?;
            let engine = Engine::new(&cfg)?;
            engine.on_session_end(signal).await?;
            Ok(())
        }
        Commands::Run => run_tracer(&cfg).await,
        Commands::Watch {
            session_id,
            transcript,
        } => watch(&cfg, &session_id, transcript).await,
        Commands::Parse {
            transcript,
            session_id,
        } => {
            let parser = TranscriptParser::new(
                Arc::new(config::pricing_table(&cfg)),
                cfg.parser.pairing,
            );
            for event in parser.parse(&transcript, &session_id)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Commands::Summary { session_id } => {
            let writer = TraceWriter::new(Layout::from_config(&cfg)?);
            let events = writer.read_session(&session_id)?;
            print_summary(&SessionSummary::from_events(&session_id, &events));
            Ok(())
        }
        Commands::Status => status(&cfg),
    }
}

fn read_stdin() -> Result<String> {
    std::io::read_to_string(std::io::stdin()).context("Failed to read hook payload from stdin")
}

async fn run_tracer(cfg: &TrailConfig) -> Result<()> {
    let engine = Engine::new(cfg)?;
    if let Err(e) = engine.resume_active_sessions().await {
        warn!("Could not resume active sessions: {e:#}");
    }
    info!(traces = %engine.layout().traces_dir().display(), "Tracer running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        engine.handle_raw(&line).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read signal stream");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn watch(cfg: &TrailConfig, session_id: &str, transcript: PathBuf) -> Result<()> {
    validate_session_id(session_id)?;
    let layout = Layout::from_config(cfg)?;
    let bus = EventBus::new();
    let mut events = bus.subscribe();

    let mut handle = LiveWatcher::new(
        session_id,
        transcript,
        layout.live_stats_path(session_id),
        Arc::new(config::pricing_table(cfg)),
        WatcherOptions::from(&cfg.watcher),
    )
    .with_events(bus)
    .spawn();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::LiveUpdate { stats }) => {
                    println!(
                        "{} messages  in {} / out {} / cache w {} r {}  ${:.4}",
                        stats.message_count,
                        stats.input_tokens,
                        stats.output_tokens,
                        stats.cache_write_tokens,
                        stats.cache_read_tokens,
                        stats.cost_usd
                    );
                }
                Ok(EngineEvent::WatcherStopped { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(outcome) = handle.stop().await {
        println!(
            "Stopped ({}): {} messages, ${:.4}",
            outcome.reason, outcome.stats.message_count, outcome.stats.cost_usd
        );
    }
    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    println!("Session: {}", summary.session_id);
    if summary.events == 0 {
        println!("No stored trace events.");
        return;
    }
    println!("Events: {}", summary.events);
    if let Some(ms) = summary.wall_duration_ms() {
        println!("Duration: {:.1}s", ms as f64 / 1000.0);
    }
    let t = &summary.total;
    println!(
        "Tokens: in {} / out {} / cache w {} r {}",
        t.input_tokens, t.output_tokens, t.cache_write_tokens, t.cache_read_tokens
    );
    println!("Cost: ${:.4}", t.cost_usd);
    println!();
    for (tool, stat) in &summary.tools {
        let errors = if stat.errors > 0 {
            format!("  ({} failed)", stat.errors)
        } else {
            String::new()
        };
        println!("  {tool:<20} {:>4} calls  ${:.4}{errors}", stat.calls, stat.metrics.cost_usd);
    }
}

fn status(cfg: &TrailConfig) -> Result<()> {
    let engine = Engine::new(cfg)?;
    let active = engine.registry().active()?;
    println!("Trail v{}", env!("CARGO_PKG_VERSION"));
    println!("Traces: {}", engine.layout().traces_dir().display());
    if active.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    for record in active {
        let detail = live_detail(&engine.layout().live_stats_path(&record.session_id));
        println!(
            "{}  started {}  {}  [{}]",
            record.session_id,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            detail,
            record.source
        );
    }
    Ok(())
}

/// One session's live totals for `status`. A broken snapshot only affects
/// its own row.
fn live_detail(path: &Path) -> String {
    match read_live_stats(path) {
        Ok(Some(s)) => format!("{} messages, ${:.4}", s.message_count, s.cost_usd),
        Ok(None) => "no live stats".to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable live stats");
            "live stats unreadable".to_string()
        }
    }
}
