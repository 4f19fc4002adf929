use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::SyncError;
use crate::record::{Checkpoint, CheckpointList, LogsPage};

pub const LOGS_PATH: &str = "/api/logs";
pub const CHECKPOINTS_PATH: &str = "/api/checkpoints";

pub trait TelemetrySource: Send + Sync {
    fn fetch_logs(&self, session_id: &str, after: &str) -> Result<LogsPage, SyncError>;

    fn fetch_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, SyncError>;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    fn fetch_logs(&self, session_id: &str, after: &str) -> Result<LogsPage, SyncError> {
        (**self).fetch_logs(session_id, after)
    }

    fn fetch_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, SyncError> {
        (**self).fetch_checkpoints(session_id)
    }
}

pub struct HttpSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn ping(&self, session_id: &str) -> Result<Duration, SyncError> {
        let started = Instant::now();
        self.fetch_checkpoints(session_id)?;
        Ok(started.elapsed())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: &'static str,
        query: &[(&str, &str)],
    ) -> Result<T, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.agent.get(&url);
        for (key, value) in query {
            request = request.query(key, value);
        }

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(status, _) => SyncError::Status {
                url: url.clone(),
                status,
            },
            ureq::Error::Transport(transport) => SyncError::Transport {
                url: url.clone(),
                message: transport.to_string(),
            },
        })?;
        let body = response.into_string().map_err(|source| SyncError::Body {
            url: url.clone(),
            source,
        })?;
        trace!(%url, bytes = body.len(), "fetched {resource}");

        serde_json::from_str(&body).map_err(|source| SyncError::Decode { resource, source })
    }
}

impl TelemetrySource for HttpSource {
    fn fetch_logs(&self, session_id: &str, after: &str) -> Result<LogsPage, SyncError> {
        self.get_json(
            LOGS_PATH,
            "logs",
            &[("session_id", session_id), ("after", after)],
        )
    }

    fn fetch_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, SyncError> {
        let list: CheckpointList =
            self.get_json(CHECKPOINTS_PATH, "checkpoints", &[("session_id", session_id)])?;
        Ok(list.into_checkpoints())
    }
}
