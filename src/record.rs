use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

// The engine double encodes some columns.
const MAX_DECODE_LAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    CheckpointWaiting,
    CheckpointResponded,
    CheckpointCancelled,
    Render,
    Evaluator,
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            "system" => Self::System,
            "checkpoint_waiting" => Self::CheckpointWaiting,
            "checkpoint_responded" => Self::CheckpointResponded,
            "checkpoint_cancelled" => Self::CheckpointCancelled,
            "render" => Self::Render,
            "evaluator" => Self::Evaluator,
            "" => Self::Other("unknown".to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
            Self::CheckpointWaiting => "checkpoint_waiting",
            Self::CheckpointResponded => "checkpoint_responded",
            Self::CheckpointCancelled => "checkpoint_cancelled",
            Self::Render => "render",
            Self::Evaluator => "evaluator",
            Self::Other(value) => value,
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodedPayload {
    Empty,
    Text(String),
    Structured(Value),
    Malformed(String),
}

impl DecodedPayload {
    pub fn decode(raw: &Value) -> Self {
        let mut current = raw.clone();
        for _ in 0..MAX_DECODE_LAYERS {
            let Value::String(text) = &current else {
                break;
            };
            let trimmed = text.trim();
            if !looks_encoded(trimmed) {
                break;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(inner) => current = inner,
                Err(err) => {
                    debug!(error = %err, "payload looked like JSON but failed to decode");
                    return Self::Malformed(text.clone());
                }
            }
        }

        match current {
            Value::Null => Self::Empty,
            Value::String(text) if text.trim().is_empty() => Self::Empty,
            Value::String(text) => Self::Text(text),
            other => Self::Structured(other),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    pub fn structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(value) => Some(value),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Structured(value) => extract_text(value),
            Self::Empty | Self::Malformed(_) => None,
        }
    }
}

fn looks_encoded(text: &str) -> bool {
    let wrapped = |open: char, close: char| text.starts_with(open) && text.ends_with(close);
    text.len() >= 2 && (wrapped('{', '}') || wrapped('[', ']') || wrapped('"', '"'))
}

fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(extract_text).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        Value::Object(map) => ["content", "text", "message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(extract_text)),
        _ => None,
    }
}

pub fn decode_value(raw: &Value) -> Option<Value> {
    match DecodedPayload::decode(raw) {
        DecodedPayload::Structured(value) => Some(value),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordMetrics {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub duration_ms: Option<f64>,
    pub cost: Option<f64>,
    pub model: Option<String>,
    pub cell_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: Option<String>,
    pub role: Role,
    pub content: DecodedPayload,
    pub tool_calls: Option<Value>,
    pub metadata: Option<Value>,
    pub metrics: RecordMetrics,
    pub raw: Value,
}

impl LogRecord {
    pub fn from_value(raw: Value) -> Self {
        let id = field(&raw, &["message_id", "id"]).and_then(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        let role = Role::parse(string_field(&raw, &["role"]).as_deref().unwrap_or(""));
        let content = field(&raw, &["content_json", "content"])
            .map(DecodedPayload::decode)
            .unwrap_or(DecodedPayload::Empty);
        let tool_calls = field(&raw, &["tool_calls_json", "tool_calls"]).and_then(decode_value);
        let metadata = field(&raw, &["metadata_json", "metadata"]).and_then(decode_value);

        let metrics = RecordMetrics {
            tokens_in: field(&raw, &["tokens_in"]).and_then(number_from_value).and_then(to_u64),
            tokens_out: field(&raw, &["tokens_out"]).and_then(number_from_value).and_then(to_u64),
            duration_ms: field(&raw, &["duration_ms"]).and_then(number_from_value),
            cost: field(&raw, &["cost"]).and_then(number_from_value),
            model: string_field(&raw, &["model"]),
            cell_name: string_field(&raw, &["cell_name", "cell"]),
            timestamp: field(&raw, &["timestamp_iso", "timestamp"]).and_then(timestamp_from_value),
        };

        Self {
            id,
            role,
            content,
            tool_calls,
            metadata,
            metrics,
            raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Responded,
    Cancelled,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: CheckpointStatus,
    #[serde(default, rename = "checkpoint_type", alias = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub cell_name: Option<String>,
    #[serde(default)]
    pub ui_spec: Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Checkpoint {
    pub fn from_value(raw: Value) -> Option<Self> {
        let mut checkpoint: Checkpoint = match serde_json::from_value(raw) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "skipping undecodable checkpoint entry");
                return None;
            }
        };
        if let Some(decoded) = decode_value(&checkpoint.ui_spec) {
            checkpoint.ui_spec = decoded;
        }
        Some(checkpoint)
    }

    pub fn is_pending(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Blocked,
    Completed,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsPage {
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub session_status: Option<SessionStatus>,
    #[serde(default)]
    pub session_error: Option<String>,
    #[serde(default)]
    pub cascade_id: Option<String>,
    #[serde(default)]
    pub cascade_analytics: Option<Value>,
    #[serde(default)]
    pub cell_analytics: Option<Value>,
    #[serde(default)]
    pub child_sessions: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointList {
    #[serde(default)]
    pub checkpoints: Vec<Value>,
}

impl CheckpointList {
    pub fn into_checkpoints(self) -> Vec<Checkpoint> {
        self.checkpoints
            .into_iter()
            .filter_map(Checkpoint::from_value)
            .collect()
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

fn field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| !value.is_null())
}

fn string_field(raw: &Value, keys: &[&str]) -> Option<String> {
    field(raw, keys)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

pub fn number_from_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn to_u64(value: f64) -> Option<u64> {
    (value >= 0.0).then(|| value.round() as u64)
}

fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_timestamp(text),
        Value::Number(_) => {
            let raw = number_from_value(value)?;
            // Values past ~2001-09 in milliseconds are larger than any
            // plausible seconds timestamp.
            let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn double_encoded_content_is_unwrapped() {
        let inner = json!({"tool": "browser", "arguments": {"url": "https://example.com"}});
        let once = Value::String(inner.to_string());
        let twice = Value::String(once.to_string());

        assert_eq!(DecodedPayload::decode(&once), DecodedPayload::Structured(inner.clone()));
        assert_eq!(DecodedPayload::decode(&twice), DecodedPayload::Structured(inner));
    }

    #[test]
    fn plain_text_is_not_treated_as_json() {
        let decoded = DecodedPayload::decode(&json!("[step 1] looking at the page"));
        assert_eq!(
            decoded,
            DecodedPayload::Text("[step 1] looking at the page".to_string())
        );
    }

    #[test]
    fn broken_json_is_flagged_malformed() {
        let decoded = DecodedPayload::decode(&json!("{\"tool\": \"browser\""));
        assert!(!decoded.is_malformed(), "unterminated object is plain text");

        let decoded = DecodedPayload::decode(&json!("{\"tool\": browser}"));
        assert!(decoded.is_malformed());
        assert_eq!(decoded.text(), None);
    }

    #[test]
    fn text_is_pulled_from_structured_content() {
        let decoded = DecodedPayload::decode(&json!([
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"}
        ]));
        assert_eq!(decoded.text().as_deref(), Some("first\nsecond"));

        let decoded = DecodedPayload::decode(&json!({"role": "assistant", "content": "hello"}));
        assert_eq!(decoded.text().as_deref(), Some("hello"));
    }

    #[test]
    fn record_fields_are_read_leniently() {
        let record = LogRecord::from_value(json!({
            "message_id": "m-1",
            "role": "assistant",
            "content_json": "\"hi\"",
            "tokens_in": "120",
            "tokens_out": 30,
            "cost": 0.0042,
            "duration_ms": "not a number",
            "model": "  gpt-x  ",
            "cell_name": "research",
            "timestamp_iso": "2026-02-09T16:33:13Z"
        }));

        assert_eq!(record.id.as_deref(), Some("m-1"));
        assert_eq!(record.role, Role::Assistant);
        assert_eq!(record.content, DecodedPayload::Text("hi".to_string()));
        assert_eq!(record.metrics.tokens_in, Some(120));
        assert_eq!(record.metrics.tokens_out, Some(30));
        assert_eq!(record.metrics.duration_ms, None);
        assert_eq!(record.metrics.model.as_deref(), Some("gpt-x"));
        assert_eq!(record.metrics.cell_name.as_deref(), Some("research"));
        assert!(record.metrics.timestamp.is_some());
    }

    #[test]
    fn record_without_id_or_role_is_still_built() {
        let record = LogRecord::from_value(json!({"content": "orphan"}));
        assert_eq!(record.id, None);
        assert_eq!(record.role, Role::Other("unknown".to_string()));
    }

    #[test]
    fn numeric_timestamps_accept_seconds_and_millis() {
        let seconds = timestamp_from_value(&json!(1_770_654_793.5)).expect("seconds");
        let millis = timestamp_from_value(&json!(1_770_654_793_500_i64)).expect("millis");
        assert_eq!(seconds, millis);
        assert!(parse_timestamp("2026-02-09 16:33:13.250").is_some());
    }

    #[test]
    fn checkpoint_list_skips_entries_without_id() {
        let list: CheckpointList = serde_json::from_value(json!({
            "checkpoints": [
                {"id": "cp-1", "status": "pending", "type": "approval", "ui_spec": "{\"title\":\"ok?\"}"},
                {"status": "pending"},
                {"id": "cp-0", "status": "something_new"}
            ]
        }))
        .expect("list");

        let checkpoints = list.into_checkpoints();
        assert_eq!(checkpoints.len(), 2);
        assert!(checkpoints[0].is_pending());
        assert_eq!(checkpoints[0].kind.as_deref(), Some("approval"));
        assert_eq!(checkpoints[0].ui_spec, json!({"title": "ok?"}));
        assert_eq!(checkpoints[1].status, CheckpointStatus::Unknown);
    }

    #[test]
    fn logs_page_tolerates_string_cost_and_unknown_status() {
        let page: LogsPage = serde_json::from_value(json!({
            "rows": [],
            "cursor": "2026-02-09 16:33:13",
            "total_cost": "0.1234",
            "session_status": "paused"
        }))
        .expect("page");

        assert_eq!(page.total_cost, Some(0.1234));
        assert_eq!(page.session_status, Some(SessionStatus::Unknown));
    }
}
