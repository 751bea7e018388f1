//! One JSONL log line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A self-contained log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Profile the process runs for
    pub profile: String,

    /// Module path of the event
    pub target: String,

    /// Event message
    pub msg: String,

    /// Structured fields recorded with the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        level: impl Into<String>,
        profile: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            profile: profile.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    /// Attach structured fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Attach the span path.
    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_line() {
        let entry = LogEntry::new("info", "alice", "ipspace_core::profile", "Profile initialized")
            .with_fields(serde_json::json!({ "dag_cid": "bafy" }));

        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"profile\":\"alice\""));
        assert!(line.contains("\"dag_cid\":\"bafy\""));
        assert!(!line.contains("\"span\""));

        let parsed: LogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.msg, "Profile initialized");
    }
}
