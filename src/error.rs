use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to read response body from {url}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {resource} response")]
    Decode {
        resource: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub fn display_chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_chain_includes_decode_source() {
        let source = serde_json::from_str::<serde_json::Value>("{not json")
            .expect_err("invalid json");
        let err = SyncError::Decode {
            resource: "logs",
            source,
        };
        let text = err.display_chain();
        assert!(text.starts_with("failed to decode logs response: "));
        assert!(text.len() > "failed to decode logs response: ".len());
    }

    #[test]
    fn status_error_names_url_and_code() {
        let err = SyncError::Status {
            url: "http://localhost:5001/api/logs".to_string(),
            status: 502,
        };
        assert_eq!(
            err.display_chain(),
            "server returned HTTP 502 for http://localhost:5001/api/logs"
        );
    }
}
