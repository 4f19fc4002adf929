use serde::Serialize;

use crate::record::{Checkpoint, LogRecord, Role};

pub const TRAILING_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Thinking,
    ToolRunning,
    WaitingHuman,
}

impl ExecutionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::ToolRunning => "tool running",
            Self::WaitingHuman => "waiting for human",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Orchestration {
    pub status: ExecutionStatus,
    pub current_cell: Option<String>,
    pub current_model: Option<String>,
    pub total_cost: f64,
    pub cascade_id: Option<String>,
}

pub fn execution_status(log: &[LogRecord], pending: Option<&Checkpoint>) -> ExecutionStatus {
    if pending.is_some() {
        return ExecutionStatus::WaitingHuman;
    }

    let window = &log[log.len().saturating_sub(TRAILING_WINDOW)..];
    if window.iter().any(|row| row.role == Role::Tool) {
        ExecutionStatus::ToolRunning
    } else if window.iter().any(|row| row.role == Role::Assistant) {
        ExecutionStatus::Thinking
    } else {
        ExecutionStatus::Idle
    }
}

pub fn resolve(
    log: &[LogRecord],
    pending: Option<&Checkpoint>,
    total_cost: f64,
    cascade_id: Option<&str>,
) -> Orchestration {
    // Both fields come from this one row, even when it carries only one.
    let latest = log
        .iter()
        .rev()
        .find(|row| row.metrics.cell_name.is_some() || row.metrics.model.is_some());

    Orchestration {
        status: execution_status(log, pending),
        current_cell: latest.and_then(|row| row.metrics.cell_name.clone()),
        current_model: latest.and_then(|row| row.metrics.model.clone()),
        total_cost,
        cascade_id: cascade_id.map(ToString::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CheckpointStatus;
    use serde_json::{Value, json};

    fn rows(values: Vec<Value>) -> Vec<LogRecord> {
        values.into_iter().map(LogRecord::from_value).collect()
    }

    fn pending_checkpoint() -> Checkpoint {
        Checkpoint {
            id: "cp-1".to_string(),
            session_id: Some("s-1".to_string()),
            status: CheckpointStatus::Pending,
            kind: Some("approval".to_string()),
            cell_name: Some("review".to_string()),
            ui_spec: json!({}),
            created_at: None,
        }
    }

    #[test]
    fn empty_log_is_idle() {
        assert_eq!(execution_status(&[], None), ExecutionStatus::Idle);
    }

    #[test]
    fn tool_in_window_outranks_assistant() {
        let log = rows(vec![
            json!({"role": "assistant"}),
            json!({"role": "tool"}),
            json!({"role": "assistant"}),
        ]);
        assert_eq!(execution_status(&log, None), ExecutionStatus::ToolRunning);
    }

    #[test]
    fn rows_outside_window_are_ignored() {
        let mut values = vec![json!({"role": "tool"})];
        values.extend((0..TRAILING_WINDOW).map(|_| json!({"role": "assistant"})));
        assert_eq!(execution_status(&rows(values), None), ExecutionStatus::Thinking);

        let mut values = vec![json!({"role": "assistant"})];
        values.extend((0..TRAILING_WINDOW).map(|_| json!({"role": "user"})));
        assert_eq!(execution_status(&rows(values), None), ExecutionStatus::Idle);
    }

    #[test]
    fn pending_checkpoint_always_wins() {
        let checkpoint = pending_checkpoint();
        for log in [
            rows(vec![]),
            rows(vec![json!({"role": "tool"})]),
            rows(vec![json!({"role": "assistant"})]),
        ] {
            assert_eq!(
                execution_status(&log, Some(&checkpoint)),
                ExecutionStatus::WaitingHuman
            );
        }
    }

    #[test]
    fn cell_and_model_come_from_latest_carrying_row() {
        let log = rows(vec![
            json!({"role": "assistant", "cell_name": "plan", "model": "m-large"}),
            json!({"role": "tool", "cell_name": "search"}),
            json!({"role": "user"}),
        ]);
        let orchestration = resolve(&log, None, 0.1234, Some("cascade-9"));
        assert_eq!(orchestration.current_cell.as_deref(), Some("search"));
        assert_eq!(orchestration.current_model, None);
        assert_eq!(orchestration.total_cost, 0.1234);
        assert_eq!(orchestration.cascade_id.as_deref(), Some("cascade-9"));
        assert_eq!(orchestration.status, ExecutionStatus::ToolRunning);
    }
}
