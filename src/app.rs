use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::activity::{GhostEvent, GhostKind};
use crate::config::{self, SyncConfig};
use crate::session::{SessionContext, SessionSnapshot};
use crate::source::{HttpSource, TelemetrySource};
use crate::supervisor::SessionSupervisor;
use crate::util::{
    format_cost, format_counts, format_local_time, format_tokens, human_duration, truncate_chars,
};

const WATCH_REDRAW_INTERVAL: Duration = Duration::from_millis(200);
const STATUS_MAX_PAGES: usize = 50;
const GHOST_PREVIEW_CHARS: usize = 96;
const DOCTOR_PING_SESSION: &str = "cascade-telemetry-doctor";

pub fn watch(config: &SyncConfig, base_url: &str, session_id: &str) -> Result<()> {
    let settings = config::runtime_settings(config);
    let source = HttpSource::new(base_url, config.request_timeout());
    let supervisor = SessionSupervisor::new(source, settings);
    let stop = install_stop_signal()?;

    println!("watching session {session_id} at {base_url}");
    println!("Press Ctrl+C to stop.");
    supervisor.supervise(Some(session_id));

    let mut last_revision = None;
    let mut next_ghost_seq = 0;
    let mut last_line = String::new();
    while !stop.load(Ordering::Relaxed) {
        if let Some(snapshot) = supervisor.snapshot_if_changed(last_revision) {
            last_revision = Some(snapshot.revision);
            for ghost in &snapshot.ghost_events {
                if ghost.seq < next_ghost_seq {
                    continue;
                }
                println!("  {}", ghost_line(ghost));
                next_ghost_seq = ghost.seq + 1;
            }
            let line = status_line(&snapshot);
            if line != last_line {
                println!("{line}");
                last_line = line;
            }
        }

        if !supervisor.is_polling() {
            println!("session finished; polling stopped");
            break;
        }
        thread::sleep(WATCH_REDRAW_INTERVAL);
    }

    supervisor.supervise(None);
    Ok(())
}

pub fn print_status(config: &SyncConfig, base_url: &str, session_id: &str, json: bool) -> Result<()> {
    let settings = config::runtime_settings(config);
    let source = HttpSource::new(base_url, config.request_timeout());
    let mut context = SessionContext::new(session_id, settings.ghost_retention);

    for _ in 0..STATUS_MAX_PAGES {
        let after = context.cursor().clone();
        let page = source
            .fetch_logs(session_id, after.as_str())
            .with_context(|| format!("failed to fetch logs for session {session_id}"))?;
        let has_rows = !page.rows.is_empty();
        let applied = context.apply_logs(page, Utc::now());
        debug!(appended = applied.merge.appended, cursor = %context.cursor(), "status page");
        if !has_rows || !applied.cursor_advanced {
            break;
        }
    }
    let checkpoints = source
        .fetch_checkpoints(session_id)
        .with_context(|| format!("failed to fetch checkpoints for session {session_id}"))?;
    context.apply_checkpoints(checkpoints);

    let snapshot = context.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_summary(&snapshot, base_url);
    Ok(())
}

pub fn doctor(config: &SyncConfig, base_url: &str) -> Result<u8> {
    let mut issues = 0u8;
    let settings = config::runtime_settings(config);

    println!("cascade-telemetry doctor");
    println!("config_path: {}", config::config_path().display());
    println!("base_url: {base_url}");
    println!("request_timeout: {}", human_duration(config.request_timeout()));
    println!("poll_interval: {}", human_duration(settings.poll_interval));
    println!("grace_period: {}", human_duration(settings.grace_period));
    println!("ghost_retention: {:?}", settings.ghost_retention);

    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        issues += 1;
        println!("[WARN] base_url does not look like an http(s) URL.");
    }

    let source = HttpSource::new(base_url, config.request_timeout());
    match source.ping(DOCTOR_PING_SESSION) {
        Ok(elapsed) => println!("[OK] checkpoints endpoint answered in {}.", human_duration(elapsed)),
        Err(err) => {
            issues += 1;
            println!("[WARN] engine not reachable: {}", err.display_chain());
        }
    }

    if issues == 0 {
        println!("doctor: healthy");
        Ok(0)
    } else {
        println!("doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn ghost_line(ghost: &GhostEvent) -> String {
    let cell = ghost.cell_name.as_deref().unwrap_or("-");
    match ghost.kind {
        GhostKind::ToolCall => {
            let tool = ghost.tool.as_deref().unwrap_or("tool");
            let args = ghost
                .arguments
                .as_ref()
                .filter(|args| !args.is_null())
                .map(|args| truncate_chars(&args.to_string(), GHOST_PREVIEW_CHARS))
                .unwrap_or_default();
            format!("[{cell}] -> {tool} {args}")
        }
        GhostKind::ToolResult => {
            let tool = ghost.tool.as_deref().unwrap_or("tool");
            let text = ghost.text.as_deref().unwrap_or_default();
            format!("[{cell}] <- {tool} {}", truncate_chars(text, GHOST_PREVIEW_CHARS))
        }
        GhostKind::Thinking => {
            let text = ghost.text.as_deref().unwrap_or_default();
            format!("[{cell}] .. {}", truncate_chars(text, GHOST_PREVIEW_CHARS))
        }
    }
}

fn status_line(snapshot: &SessionSnapshot) -> String {
    let orchestration = &snapshot.orchestration;
    let mut parts = vec![
        snapshot
            .status
            .map_or("pending", |status| status.label())
            .to_string(),
        orchestration.status.label().to_string(),
    ];
    if let Some(cell) = orchestration.current_cell.as_deref() {
        parts.push(format!("cell {cell}"));
    }
    if let Some(model) = orchestration.current_model.as_deref() {
        parts.push(model.to_string());
    }
    parts.push(format!("{} tokens", format_tokens(snapshot.stats.total_tokens())));
    parts.push(format_cost(orchestration.total_cost));
    if let Some(checkpoint) = snapshot.checkpoint.as_deref() {
        parts.push(format!("awaiting checkpoint {}", checkpoint.id));
    }
    if let Some(error) = snapshot.last_error.as_deref() {
        parts.push(format!("error: {}", truncate_chars(error, GHOST_PREVIEW_CHARS)));
    }
    parts.join(" | ")
}

fn print_summary(snapshot: &SessionSnapshot, base_url: &str) {
    let stats = &snapshot.stats;
    let orchestration = &snapshot.orchestration;

    println!("cascade-telemetry status");
    println!("base_url: {base_url}");
    println!(
        "session: {}",
        snapshot.session_id.as_deref().unwrap_or("-")
    );
    if let Some(cascade_id) = orchestration.cascade_id.as_deref() {
        println!("cascade: {cascade_id}");
    }
    println!(
        "status: {}",
        snapshot.status.map_or("unknown", |status| status.label())
    );
    println!("execution: {}", orchestration.status.label());
    println!(
        "cell: {}",
        orchestration.current_cell.as_deref().unwrap_or("-")
    );
    println!(
        "model: {}",
        orchestration.current_model.as_deref().unwrap_or("-")
    );
    println!("messages: {}", stats.message_count);
    println!(
        "tokens: {} in / {} out",
        format_tokens(stats.tokens_in),
        format_tokens(stats.tokens_out)
    );
    println!("cost: {}", format_cost(orchestration.total_cost));
    println!("started: {}", format_local_time(stats.start_time));
    println!("last_activity: {}", format_local_time(stats.last_activity_time));
    println!("tools: {}", format_counts(&snapshot.tool_counts));
    println!("roles: {}", format_counts(&stats.role_counts));
    match snapshot.checkpoint.as_deref() {
        Some(checkpoint) => println!(
            "checkpoint: {} ({}) pending",
            checkpoint.id,
            checkpoint.kind.as_deref().unwrap_or("checkpoint")
        ),
        None => println!("checkpoint: none pending"),
    }
    if let Some(error) = snapshot.echo.session_error.as_deref() {
        println!("session_error: {error}");
    }
    if !stats.recent_activity.is_empty() {
        println!("recent:");
        for activity in &stats.recent_activity {
            println!(
                "  - {:?} {} [{}]",
                activity.kind,
                activity.tool.as_deref().unwrap_or("-"),
                activity.cell.as_deref().unwrap_or("-")
            );
        }
    }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
