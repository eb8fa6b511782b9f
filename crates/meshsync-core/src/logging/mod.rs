//! Per-node logging
//!
//! Console output goes through `tracing_subscriber::fmt`; optionally every
//! event is also appended to a JSONL file so logs from several nodes on
//! one machine can be merged afterwards.
//!
//! ```text
//! logs/
//! └── raw/                      # one file per node per day
//!     ├── 2026-10-17_north-gate.jsonl
//!     └── 2026-10-17_river-camp.jsonl
//! ```
//!
//! ```bash
//! # Everything one node said about bundles, in order
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)[] | select(.node == "river-camp" and (.target | contains("dtn")))'
//! ```

mod entry;
mod layer;
mod writer;

pub use entry::LogEntry;
pub use layer::{init_logging, JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, NodeLogWriter};
