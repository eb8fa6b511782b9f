//! One line of a node's JSONL log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single self-contained log record.
///
/// Appending whole lines keeps a file readable even if the process dies
/// mid-write; at worst the last line is truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Node that wrote the entry (the configured node name)
    pub node: String,

    /// Module path, e.g. `meshsync_core::sync::session`
    pub target: String,

    pub msg: String,

    /// Remote peer the event concerns, from the event or an enclosing span
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,

    /// Structured fields recorded with the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            peer: None,
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Look up a structured field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref()?.get(name)
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_line_format() {
        let entry = LogEntry::new("info", "north-gate", "meshsync_core::sync", "Peer authenticated")
            .with_fields(serde_json::json!({ "peer": "did:mesh:zAbc", "first_contact": true }));

        let json = entry.to_json_line().unwrap();
        assert!(!json.contains('\n'));
        assert!(json.contains("\"node\":\"north-gate\""));
        assert!(!json.contains("\"span\""));
        assert!(!json.contains("\"peer\""));

        let parsed = LogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.field("first_contact"), Some(&Value::Bool(true)));
    }
}
