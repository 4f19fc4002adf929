use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::activity::{FALLBACK_TOOL_NAME, tool_descriptor};
use crate::record::{LogRecord, Role};

pub const RECENT_ACTIVITY_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecentKind {
    ToolCall,
    ToolResult,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentActivity {
    pub kind: RecentKind,
    pub tool: Option<String>,
    pub cell: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: f64,
    pub cost: f64,
    pub role_counts: BTreeMap<String, u64>,
    pub model_usage: BTreeMap<String, u64>,
    pub model_costs: BTreeMap<String, f64>,
    pub recent_activity: VecDeque<RecentActivity>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_activity_time: Option<DateTime<Utc>>,
}

impl SessionStats {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in.saturating_add(self.tokens_out)
    }
}

// An empty batch returns `prior` untouched.
pub fn accumulate(prior: SessionStats, rows: &[LogRecord], now: DateTime<Utc>) -> SessionStats {
    if rows.is_empty() {
        return prior;
    }

    let mut stats = prior;
    for row in rows {
        let metrics = &row.metrics;
        stats.message_count += 1;
        stats.tokens_in = stats.tokens_in.saturating_add(metrics.tokens_in.unwrap_or(0));
        stats.tokens_out = stats.tokens_out.saturating_add(metrics.tokens_out.unwrap_or(0));
        stats.duration_ms += metrics.duration_ms.filter(|ms| *ms > 0.0).unwrap_or(0.0);
        let cost = metrics.cost.filter(|cost| *cost > 0.0);
        stats.cost += cost.unwrap_or(0.0);

        *stats
            .role_counts
            .entry(row.role.as_str().to_string())
            .or_insert(0) += 1;

        if let Some(model) = metrics.model.as_ref() {
            *stats.model_usage.entry(model.clone()).or_insert(0) += 1;
            if let Some(cost) = cost {
                *stats.model_costs.entry(model.clone()).or_insert(0.0) += cost;
            }
        }

        if let Some(activity) = recent_activity(row) {
            stats.recent_activity.push_back(activity);
            while stats.recent_activity.len() > RECENT_ACTIVITY_CAPACITY {
                stats.recent_activity.pop_front();
            }
        }
    }

    if stats.start_time.is_none() {
        stats.start_time = rows[0].metrics.timestamp.or(Some(now));
    }
    stats.last_activity_time = rows
        .iter()
        .rev()
        .find_map(|row| row.metrics.timestamp)
        .or(Some(now));
    stats
}

fn recent_activity(row: &LogRecord) -> Option<RecentActivity> {
    let (kind, tool) = match row.role {
        Role::Assistant if !row.content.is_malformed() => {
            (RecentKind::ToolCall, Some(tool_descriptor(row)?.tool))
        }
        Role::Tool => {
            let tool = if row.content.is_malformed() {
                None
            } else {
                tool_descriptor(row).map(|descriptor| descriptor.tool)
            };
            (
                RecentKind::ToolResult,
                Some(tool.unwrap_or_else(|| FALLBACK_TOOL_NAME.to_string())),
            )
        }
        Role::Render => (RecentKind::Checkpoint, None),
        _ => return None,
    };

    Some(RecentActivity {
        kind,
        tool,
        cell: row.metrics.cell_name.clone(),
        timestamp: row.metrics.timestamp,
    })
}
