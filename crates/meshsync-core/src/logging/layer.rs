//! Tracing layer that mirrors events into the node's JSONL file, plus the
//! subscriber setup shared by the CLI and tests.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{SyncError, SyncResult};

use super::entry::LogEntry;
use super::writer::NodeLogWriter;

/// Field name lifted out of events and spans into [`LogEntry::peer`].
const PEER_FIELD: &str = "peer";

/// Peer recorded on a span, kept in the span's extensions.
struct SpanPeer(String);

/// Writes every event it sees to a [`NodeLogWriter`].
pub struct JsonlLayer {
    writer: Arc<NodeLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let writer = NodeLogWriter::new(logs_dir, node)?;
        Ok(Self {
            writer: Arc::new(writer),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn node(&self) -> &str {
        self.writer.node()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(peer), Some(span)) = (visitor.peer(), ctx.span(id)) {
            span.extensions_mut().insert(SpanPeer(peer));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let mut peer = visitor.peer();

        let mut entry = LogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.node(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields.clone()));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let mut spans = Vec::new();
            for span in scope.from_root() {
                if let Some(SpanPeer(p)) = span.extensions().get::<SpanPeer>() {
                    // Innermost span wins, the event itself beats both
                    if visitor.fields.get(PEER_FIELD).is_none() {
                        peer = Some(p.clone());
                    }
                }
                spans.push(span.name());
            }
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }
        if let Some(peer) = peer {
            entry = entry.with_peer(peer);
        }

        // A failing log sink must never take the node down
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn peer(&self) -> Option<String> {
        match self.fields.get(PEER_FIELD)? {
            serde_json::Value::String(peer) => Some(peer.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

/// Composes console output, an env filter and the optional JSONL layer
/// into the global subscriber.
///
/// `RUST_LOG` wins over the builder's default filter when set.
pub struct LoggingBuilder {
    node: String,
    logs_dir: Option<PathBuf>,
    console_output: bool,
    default_filter: String,
}

impl LoggingBuilder {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            logs_dir: None,
            console_output: true,
            default_filter: "info".to_string(),
        }
    }

    /// Also write `<dir>/raw/<date>_<node>.jsonl`.
    pub fn logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }

    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Filter used when `RUST_LOG` is unset, e.g. `meshsync_core=debug`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Map a `-v` count to a filter level.
    pub fn verbosity(self, level: u8) -> Self {
        let filter = match level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        self.with_filter(filter)
    }

    pub fn build_layer(&self) -> std::io::Result<Option<JsonlLayer>> {
        self.logs_dir
            .as_ref()
            .map(|dir| JsonlLayer::new(dir, &self.node))
            .transpose()
    }

    /// Install the global subscriber. Returns the JSONL path when file
    /// logging is enabled.
    pub fn init(self) -> SyncResult<Option<PathBuf>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .map_err(|e| SyncError::Config(format!("Invalid log filter: {}", e)))?;

        let jsonl = self.build_layer()?;
        let path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(|e| SyncError::Config(format!("Logging already initialized: {}", e)))?;

        Ok(path)
    }
}

/// Console plus optional JSONL logging at the given `-v` level.
pub fn init_logging(
    node: &str,
    logs_dir: Option<&Path>,
    verbosity: u8,
) -> SyncResult<Option<PathBuf>> {
    let mut builder = LoggingBuilder::new(node).verbosity(verbosity);
    if let Some(dir) = logs_dir {
        builder = builder.logs_dir(dir);
    }
    builder.init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::read_entries;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_layer_captures_events() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let layer = JsonlLayer::new(&logs_dir, "test").unwrap();
        let log_path = layer.log_path().to_path_buf();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Test message");
            let span = tracing::info_span!("session", peer = "zAbc");
            let _guard = span.enter();
            tracing::warn!(count = 42, ok = false, "Warning with field");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let entries = read_entries(&logs_dir).unwrap();
        assert_eq!(entries[0].msg, "Test message");
        assert_eq!(entries[0].level, "info");
        assert_eq!(entries[0].node, "test");
        assert_eq!(entries[1].level, "warn");
        assert_eq!(entries[1].field("count"), Some(&serde_json::Value::from(42u64)));
        assert_eq!(entries[1].field("ok"), Some(&serde_json::Value::Bool(false)));
        assert_eq!(entries[1].span.as_deref(), Some("session"));
        assert_eq!(entries[0].peer, None);
        assert_eq!(entries[1].peer.as_deref(), Some("zAbc"));
    }

    #[test]
    fn test_event_peer_overrides_span_peer() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path(), "river-camp").unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("session", peer = "zOuter");
            let _outer = outer.enter();
            let inner = tracing::info_span!("bundles", peer = "zInner");
            let _inner = inner.enter();
            tracing::info!("Offered bundles");
            tracing::info!(peer = "zEvent", "Bundle delivered");
        });

        let entries = read_entries(temp.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.node == "river-camp"));
        let peers: Vec<_> = entries.iter().map(|e| e.peer.as_deref()).collect();
        assert!(peers.contains(&Some("zInner")));
        assert!(peers.contains(&Some("zEvent")));
        assert_eq!(entries[0].span.as_deref(), Some("session > bundles"));
    }

    #[test]
    fn test_builder_without_dir_has_no_layer() {
        let builder = LoggingBuilder::new("n").no_console();
        assert!(builder.build_layer().unwrap().is_none());

        let temp = TempDir::new().unwrap();
        let builder = LoggingBuilder::new("n").logs_dir(temp.path()).verbosity(3);
        assert_eq!(builder.default_filter, "trace");
        assert!(builder.build_layer().unwrap().is_some());
    }
}
