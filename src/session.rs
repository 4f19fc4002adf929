use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::activity::{ActivityFeed, GhostEvent, GhostRetention};
use crate::error::SyncError;
use crate::merge::{Cursor, MergeOutcome, merge_rows};
use crate::orchestration::{self, Orchestration};
use crate::record::{Checkpoint, LogRecord, LogsPage, SessionStatus};
use crate::stats::{self, SessionStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Logs,
    Checkpoints,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerEcho {
    pub session_error: Option<String>,
    pub cascade_analytics: Option<Value>,
    pub cell_analytics: Option<Value>,
    pub child_sessions: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub previous: Option<SessionStatus>,
    pub current: Option<SessionStatus>,
}

impl StatusTransition {
    pub fn finished(&self) -> bool {
        self.current.is_some_and(SessionStatus::is_finished)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogsApplied {
    pub merge: MergeOutcome,
    pub ghosts_added: usize,
    pub ghosts_evicted: usize,
    pub cursor_advanced: bool,
    pub status: Option<StatusTransition>,
}

#[derive(Debug)]
pub struct SessionContext {
    session_id: String,
    cursor: Cursor,
    seen_ids: HashSet<String>,
    log: Vec<LogRecord>,
    activity: ActivityFeed,
    stats: SessionStats,
    checkpoint: Option<Arc<Checkpoint>>,
    checkpoint_history: Vec<Checkpoint>,
    status: Option<SessionStatus>,
    total_cost: f64,
    cascade_id: Option<String>,
    echo: ServerEcho,
    orchestration: Orchestration,
    logs_error: Option<String>,
    checkpoints_error: Option<String>,
    revision: u64,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, retention: GhostRetention) -> Self {
        Self::with_revision(session_id, retention, 0)
    }

    pub(crate) fn with_revision(
        session_id: impl Into<String>,
        retention: GhostRetention,
        revision: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cursor: Cursor::epoch(),
            seen_ids: HashSet::new(),
            log: Vec::new(),
            activity: ActivityFeed::new(retention),
            stats: SessionStats::default(),
            checkpoint: None,
            checkpoint_history: Vec::new(),
            status: None,
            total_cost: 0.0,
            cascade_id: None,
            echo: ServerEcho::default(),
            orchestration: Orchestration::default(),
            logs_error: None,
            checkpoints_error: None,
            revision,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.status
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn log(&self) -> &[LogRecord] {
        &self.log
    }

    pub fn checkpoint(&self) -> Option<&Arc<Checkpoint>> {
        self.checkpoint.as_ref()
    }

    pub fn orchestration(&self) -> &Orchestration {
        &self.orchestration
    }

    // Rows are merged before the cursor moves.
    pub fn apply_logs(&mut self, page: LogsPage, now: DateTime<Utc>) -> LogsApplied {
        let LogsPage {
            rows,
            cursor,
            total_cost,
            session_status,
            session_error,
            cascade_id,
            cascade_analytics,
            cell_analytics,
            child_sessions,
        } = page;

        let batch: Vec<LogRecord> = rows.into_iter().map(LogRecord::from_value).collect();
        let merge = merge_rows(&mut self.log, &mut self.seen_ids, batch);
        let fresh = &self.log[merge.first_new..];
        let ghosts_added = self.activity.observe(fresh, now);
        let ghosts_evicted = self.activity.prune(now);
        self.stats = stats::accumulate(std::mem::take(&mut self.stats), fresh, now);

        let cursor_advanced = self.cursor.advance(cursor.as_deref());

        let echo = ServerEcho {
            session_error,
            cascade_analytics: cascade_analytics.or_else(|| self.echo.cascade_analytics.clone()),
            cell_analytics: cell_analytics.or_else(|| self.echo.cell_analytics.clone()),
            child_sessions: child_sessions.or_else(|| self.echo.child_sessions.clone()),
        };
        let mut echo_changed = echo != self.echo;
        self.echo = echo;
        if let Some(cost) = total_cost
            && cost != self.total_cost
        {
            self.total_cost = cost;
            echo_changed = true;
        }
        if cascade_id.is_some() && cascade_id != self.cascade_id {
            self.cascade_id = cascade_id;
            echo_changed = true;
        }

        let previous = self.status;
        if session_status.is_some() {
            self.status = session_status;
        }
        let status = (previous != self.status).then_some(StatusTransition {
            previous,
            current: self.status,
        });

        let error_cleared = self.logs_error.take().is_some();
        let orchestration_changed = self.refresh_orchestration();

        if merge.appended > 0
            || ghosts_evicted > 0
            || cursor_advanced
            || echo_changed
            || status.is_some()
            || error_cleared
            || orchestration_changed
        {
            self.revision += 1;
        }

        debug!(
            session_id = %self.session_id,
            appended = merge.appended,
            duplicates = merge.duplicates,
            unidentified = merge.unidentified,
            ghosts = ghosts_added,
            cursor = %self.cursor,
            "merged logs page"
        );

        LogsApplied {
            merge,
            ghosts_added,
            ghosts_evicted,
            cursor_advanced,
            status,
        }
    }

    // The pending Arc is only replaced when the pending id changes.
    pub fn apply_checkpoints(&mut self, checkpoints: Vec<Checkpoint>) -> bool {
        let pending = checkpoints.iter().find(|checkpoint| checkpoint.is_pending());
        let unchanged = match (self.checkpoint.as_deref(), pending) {
            (Some(current), Some(next)) => current.id == next.id,
            (None, None) => true,
            _ => false,
        };
        let replaced = !unchanged;
        if replaced {
            self.checkpoint = pending.cloned().map(Arc::new);
        }

        let history_changed = self.checkpoint_history != checkpoints;
        if history_changed {
            self.checkpoint_history = checkpoints;
        }
        let error_cleared = self.checkpoints_error.take().is_some();
        let orchestration_changed = self.refresh_orchestration();

        if replaced || history_changed || error_cleared || orchestration_changed {
            self.revision += 1;
        }
        replaced
    }

    pub fn record_error(&mut self, resource: Resource, err: &SyncError) -> bool {
        let message = err.display_chain();
        let slot = match resource {
            Resource::Logs => &mut self.logs_error,
            Resource::Checkpoints => &mut self.checkpoints_error,
        };
        if slot.as_deref() == Some(message.as_str()) {
            return false;
        }
        *slot = Some(message);
        self.revision += 1;
        true
    }

    pub fn clear_ghosts(&mut self) -> usize {
        let cleared = self.activity.clear_ghosts();
        if cleared > 0 {
            self.revision += 1;
        }
        cleared
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some(self.session_id.clone()),
            revision: self.revision,
            cursor: self.cursor.clone(),
            seen_ids: self.seen_ids.len(),
            log: self.log.clone(),
            ghost_events: self.activity.ghosts().iter().cloned().collect(),
            tool_counts: self.activity.tool_counts().clone(),
            stats: self.stats.clone(),
            orchestration: self.orchestration.clone(),
            status: self.status,
            checkpoint: self.checkpoint.clone(),
            checkpoint_history: self.checkpoint_history.clone(),
            echo: self.echo.clone(),
            last_error: self
                .logs_error
                .clone()
                .or_else(|| self.checkpoints_error.clone()),
        }
    }

    fn refresh_orchestration(&mut self) -> bool {
        let next = orchestration::resolve(
            &self.log,
            self.checkpoint.as_deref(),
            self.total_cost,
            self.cascade_id.as_deref(),
        );
        if next == self.orchestration {
            return false;
        }
        self.orchestration = next;
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub revision: u64,
    pub cursor: Cursor,
    pub seen_ids: usize,
    pub log: Vec<LogRecord>,
    pub ghost_events: Vec<GhostEvent>,
    pub tool_counts: BTreeMap<String, u64>,
    pub stats: SessionStats,
    pub orchestration: Orchestration,
    pub status: Option<SessionStatus>,
    pub checkpoint: Option<Arc<Checkpoint>>,
    pub checkpoint_history: Vec<Checkpoint>,
    #[serde(flatten)]
    pub echo: ServerEcho,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn unsupervised(revision: u64) -> Self {
        Self {
            revision,
            ..Self::default()
        }
    }
}
