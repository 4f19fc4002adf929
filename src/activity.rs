use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{LogRecord, Role, decode_value};
use crate::util::truncate_chars;

pub const THINKING_MIN_CHARS: usize = 50;
pub const FALLBACK_TOOL_NAME: &str = "tool";
const PREVIEW_CHARS: usize = 280;

pub const DEFAULT_BOUNDED_TTL_MS: u64 = 10_000;
pub const DEFAULT_BOUNDED_MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorSource {
    InlineTool,
    ToolCalls,
    MetadataToolName,
}

impl DescriptorSource {
    pub const PRIORITY: [Self; 3] = [Self::InlineTool, Self::ToolCalls, Self::MetadataToolName];

    fn attempt(self, record: &LogRecord) -> Option<ToolDescriptor> {
        let (tool, arguments) = match self {
            Self::InlineTool => {
                let content = record.content.structured()?;
                (
                    non_empty_str(content.get("tool")?)?,
                    first_of(content, &["arguments", "args", "input", "tool_input"]),
                )
            }
            Self::ToolCalls => {
                let inline = record
                    .content
                    .structured()
                    .and_then(|content| content.get("tool_calls"));
                let first = [record.tool_calls.as_ref(), inline]
                    .into_iter()
                    .flatten()
                    .find_map(|calls| decoded(calls).as_array()?.first().cloned())?;
                let first = decoded(&first);
                let function = first.get("function").unwrap_or(&Value::Null);
                let tool = ["name", "tool"]
                    .iter()
                    .find_map(|key| function.get(*key).or_else(|| first.get(*key)))
                    .and_then(non_empty_str)?;
                let arguments = match first_of(function, &["arguments"]) {
                    Value::Null => first_of(&first, &["arguments", "args", "input"]),
                    found => found,
                };
                (tool, arguments)
            }
            Self::MetadataToolName => {
                let metadata = record.metadata.as_ref()?;
                (
                    non_empty_str(metadata.get("tool_name")?)?,
                    first_of(metadata, &["arguments", "tool_args", "tool_input"]),
                )
            }
        };
        Some(ToolDescriptor {
            tool,
            arguments,
            source: self,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub tool: String,
    pub arguments: Value,
    pub source: DescriptorSource,
}

pub fn tool_descriptor(record: &LogRecord) -> Option<ToolDescriptor> {
    DescriptorSource::PRIORITY
        .iter()
        .find_map(|source| source.attempt(record))
}

fn decoded(value: &Value) -> Value {
    decode_value(value).unwrap_or_else(|| value.clone())
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

fn first_of(value: &Value, keys: &[&str]) -> Value {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|found| !found.is_null())
        .map(decoded)
        .unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GhostKind {
    ToolCall,
    ToolResult,
    Thinking,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: GhostKind,
    pub tool: Option<String>,
    pub arguments: Option<Value>,
    pub text: Option<String>,
}

pub fn classify(record: &LogRecord) -> Option<Classified> {
    if record.content.is_malformed() {
        return None;
    }

    match record.role {
        Role::Assistant => {
            if let Some(descriptor) = tool_descriptor(record) {
                return Some(Classified {
                    kind: GhostKind::ToolCall,
                    tool: Some(descriptor.tool),
                    arguments: Some(descriptor.arguments),
                    text: None,
                });
            }
            let text = record.content.text()?;
            if text.trim().chars().count() <= THINKING_MIN_CHARS {
                return None;
            }
            Some(Classified {
                kind: GhostKind::Thinking,
                tool: None,
                arguments: None,
                text: Some(truncate_chars(text.trim(), PREVIEW_CHARS)),
            })
        }
        Role::Tool => {
            let tool = tool_descriptor(record)
                .map(|descriptor| descriptor.tool)
                .unwrap_or_else(|| FALLBACK_TOOL_NAME.to_string());
            Some(Classified {
                kind: GhostKind::ToolResult,
                tool: Some(tool),
                arguments: None,
                text: record
                    .content
                    .text()
                    .map(|text| truncate_chars(text.trim(), PREVIEW_CHARS)),
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GhostEvent {
    pub seq: u64,
    pub kind: GhostKind,
    pub tool: Option<String>,
    pub arguments: Option<Value>,
    pub text: Option<String>,
    pub record_id: Option<String>,
    pub cell_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GhostRetention {
    #[default]
    Unbounded,
    Bounded { ttl_ms: u64, max_events: usize },
}

impl GhostRetention {
    pub fn bounded_default() -> Self {
        Self::Bounded {
            ttl_ms: DEFAULT_BOUNDED_TTL_MS,
            max_events: DEFAULT_BOUNDED_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFeed {
    retention: GhostRetention,
    ghosts: VecDeque<GhostEvent>,
    tool_counts: BTreeMap<String, u64>,
    next_seq: u64,
}

impl ActivityFeed {
    pub fn new(retention: GhostRetention) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, records: &[LogRecord], now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for record in records {
            let Some(classified) = classify(record) else {
                continue;
            };
            if let Some(tool) = classified.tool.as_ref() {
                *self.tool_counts.entry(tool.clone()).or_insert(0) += 1;
            }
            self.ghosts.push_back(GhostEvent {
                seq: self.next_seq,
                kind: classified.kind,
                tool: classified.tool,
                arguments: classified.arguments,
                text: classified.text,
                record_id: record.id.clone(),
                cell_name: record.metrics.cell_name.clone(),
                timestamp: record.metrics.timestamp,
                observed_at: now,
            });
            self.next_seq += 1;
            added += 1;
        }
        added
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let GhostRetention::Bounded { ttl_ms, max_events } = self.retention else {
            return 0;
        };
        let before = self.ghosts.len();
        let ttl = Duration::from_millis(ttl_ms);
        self.ghosts.retain(|ghost| {
            now.signed_duration_since(ghost.observed_at)
                .to_std()
                .map(|age| age <= ttl)
                .unwrap_or(true)
        });
        while self.ghosts.len() > max_events {
            self.ghosts.pop_front();
        }
        before - self.ghosts.len()
    }

    // Tool counts survive.
    pub fn clear_ghosts(&mut self) -> usize {
        let cleared = self.ghosts.len();
        self.ghosts.clear();
        cleared
    }

    pub fn ghosts(&self) -> &VecDeque<GhostEvent> {
        &self.ghosts
    }

    pub fn tool_counts(&self) -> &BTreeMap<String, u64> {
        &self.tool_counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(raw: Value) -> LogRecord {
        LogRecord::from_value(raw)
    }

    fn eighty_chars() -> String {
        "The page lists three candidate vendors; comparing their pricing tables next.."
            .chars()
            .chain(std::iter::repeat('.'))
            .take(80)
            .collect()
    }

    #[test]
    fn inline_tool_beats_tool_calls_and_metadata() {
        let row = record(json!({
            "role": "assistant",
            "content_json": json!({"tool": "browser", "arguments": {"url": "https://a"}}).to_string(),
            "tool_calls_json": json!([{"function": {"name": "search", "arguments": "{}"}}]).to_string(),
            "metadata_json": json!({"tool_name": "shell"}).to_string(),
        }));
        let descriptor = tool_descriptor(&row).expect("descriptor");
        assert_eq!(descriptor.tool, "browser");
        assert_eq!(descriptor.source, DescriptorSource::InlineTool);
        assert_eq!(descriptor.arguments, json!({"url": "https://a"}));
    }

    #[test]
    fn tool_calls_array_used_when_no_inline_tool() {
        let row = record(json!({
            "role": "assistant",
            "content": "calling search",
            "tool_calls": json!([
                {"function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}},
                {"function": {"name": "ignored"}}
            ]).to_string(),
        }));
        let descriptor = tool_descriptor(&row).expect("descriptor");
        assert_eq!(descriptor.tool, "search");
        assert_eq!(descriptor.source, DescriptorSource::ToolCalls);
        assert_eq!(descriptor.arguments, json!({"q": "rust"}));
    }

    #[test]
    fn metadata_tool_name_is_last_resort() {
        let row = record(json!({
            "role": "assistant",
            "content": "",
            "metadata": {"tool_name": "shell", "tool_args": {"cmd": "ls"}},
        }));
        let descriptor = tool_descriptor(&row).expect("descriptor");
        assert_eq!(descriptor.tool, "shell");
        assert_eq!(descriptor.source, DescriptorSource::MetadataToolName);
        assert_eq!(descriptor.arguments, json!({"cmd": "ls"}));
    }

    #[test]
    fn empty_tool_calls_column_falls_back_to_content() {
        let row = record(json!({
            "role": "assistant",
            "content": {"tool_calls": [{"function": {"name": "search"}}]},
            "tool_calls_json": "[]",
        }));
        let descriptor = tool_descriptor(&row).expect("descriptor");
        assert_eq!(descriptor.tool, "search");
        assert_eq!(descriptor.source, DescriptorSource::ToolCalls);
    }

    #[test]
    fn tool_results_recover_their_tool_name() {
        let rows = vec![
            record(json!({"role": "tool", "content": {"tool": "browser", "content": "page loaded"}})),
            record(json!({"role": "tool", "content": "ok",
                          "tool_calls": [{"function": {"name": "search"}}]})),
            record(json!({"role": "tool", "content": "done",
                          "metadata_json": json!({"tool_name": "shell"}).to_string()})),
        ];
        let mut feed = ActivityFeed::new(GhostRetention::Unbounded);
        assert_eq!(feed.observe(&rows, Utc::now()), 3);

        let tools: Vec<Option<&str>> = feed.ghosts().iter().map(|g| g.tool.as_deref()).collect();
        assert_eq!(tools, vec![Some("browser"), Some("search"), Some("shell")]);
        assert!(feed.ghosts().iter().all(|g| g.kind == GhostKind::ToolResult));
        assert_eq!(feed.ghosts()[0].text.as_deref(), Some("page loaded"));
        assert_eq!(feed.tool_counts().get("browser"), Some(&1));
        assert_eq!(feed.tool_counts().get("search"), Some(&1));
        assert_eq!(feed.tool_counts().get("shell"), Some(&1));
        assert_eq!(feed.tool_counts().get(FALLBACK_TOOL_NAME), None);
    }

    #[test]
    fn classifies_call_result_and_thinking_in_order() {
        let rows = vec![
            record(json!({"message_id": "a", "role": "assistant", "content": {"tool": "browser"}})),
            record(json!({"message_id": "b", "role": "tool", "content": "page loaded"})),
            record(json!({"message_id": "c", "role": "assistant", "content": eighty_chars()})),
        ];
        let mut feed = ActivityFeed::new(GhostRetention::Unbounded);
        let added = feed.observe(&rows, Utc::now());

        assert_eq!(added, 3);
        let kinds: Vec<GhostKind> = feed.ghosts().iter().map(|g| g.kind).collect();
        assert_eq!(
            kinds,
            vec![GhostKind::ToolCall, GhostKind::ToolResult, GhostKind::Thinking]
        );
        assert_eq!(feed.tool_counts().get("browser"), Some(&1));
        assert_eq!(feed.tool_counts().get(FALLBACK_TOOL_NAME), Some(&1));
        assert_eq!(feed.ghosts()[1].tool.as_deref(), Some(FALLBACK_TOOL_NAME));
    }

    #[test]
    fn short_assistant_text_and_other_roles_are_ignored() {
        let rows = vec![
            record(json!({"role": "assistant", "content": "ok"})),
            record(json!({"role": "user", "content": eighty_chars()})),
            record(json!({"role": "evaluator", "content": eighty_chars()})),
            record(json!({"role": "assistant", "content": "x".repeat(THINKING_MIN_CHARS)})),
        ];
        let mut feed = ActivityFeed::new(GhostRetention::Unbounded);
        assert_eq!(feed.observe(&rows, Utc::now()), 0);
        assert!(feed.ghosts().is_empty());
        assert!(feed.tool_counts().is_empty());
    }

    #[test]
    fn malformed_payload_is_not_classified() {
        let row = record(json!({"role": "tool", "content_json": "{\"tool\": browser}"}));
        assert!(row.content.is_malformed());
        assert_eq!(classify(&row), None);
    }

    #[test]
    fn bounded_retention_expires_and_caps() {
        let mut feed = ActivityFeed::new(GhostRetention::Bounded {
            ttl_ms: 1_000,
            max_events: 2,
        });
        let start = Utc::now();
        let rows: Vec<LogRecord> = (0..3)
            .map(|i| record(json!({"message_id": i, "role": "tool", "content": "done"})))
            .collect();

        feed.observe(&rows, start);
        assert_eq!(feed.prune(start), 1);
        assert_eq!(feed.ghosts().len(), 2);
        assert_eq!(feed.ghosts()[0].seq, 1);
        assert_eq!(feed.tool_counts().get(FALLBACK_TOOL_NAME), Some(&3));

        let evicted = feed.prune(start + chrono::Duration::milliseconds(1_500));
        assert_eq!(evicted, 2);
        assert!(feed.ghosts().is_empty());
    }

    #[test]
    fn unbounded_retention_keeps_everything() {
        let mut feed = ActivityFeed::new(GhostRetention::Unbounded);
        let start = Utc::now();
        let rows: Vec<LogRecord> = (0..150)
            .map(|i| record(json!({"message_id": i, "role": "tool", "content": "done"})))
            .collect();
        feed.observe(&rows, start);
        assert_eq!(feed.prune(start + chrono::Duration::days(1)), 0);
        assert_eq!(feed.ghosts().len(), 150);
    }

    #[test]
    fn clearing_ghosts_keeps_tool_counts() {
        let mut feed = ActivityFeed::new(GhostRetention::Unbounded);
        let rows = vec![record(json!({"role": "assistant", "content": {"tool": "browser"}}))];
        feed.observe(&rows, Utc::now());
        assert_eq!(feed.clear_ghosts(), 1);
        assert!(feed.ghosts().is_empty());
        assert_eq!(feed.tool_counts().get("browser"), Some(&1));
    }
}
