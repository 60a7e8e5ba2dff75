//! Structured event log
//!
//! Every lifecycle transition of an app (lookup, boot, ready, kill, shutdown,
//! ...) is recorded here as one JSON object per line. The log is bounded and
//! served verbatim by the `/events` admin endpoint.

use crate::linebuffer::LineBuffer;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Default)]
pub struct Events {
    events: LineBuffer,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and return the serialized line (including the trailing
    /// newline) so callers can mirror it elsewhere.
    pub fn add(&self, name: &str, fields: &[(&str, Value)]) -> String {
        let mut record = Map::with_capacity(fields.len() + 2);
        record.insert(
            "time".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        record.insert("event".to_string(), Value::String(name.to_string()));
        for (key, value) in fields {
            record.insert((*key).to_string(), value.clone());
        }

        let mut line = Value::Object(record).to_string();
        line.push('\n');

        debug!(event = name, "{}", line.trim_end());
        self.events.append(line.clone());
        line
    }

    /// All retained records, newline-delimited, oldest first
    pub fn contents(&self) -> String {
        self.events.contents()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Parsed records, oldest first (records that fail to parse are skipped)
    pub fn records(&self) -> Vec<Value> {
        self.events
            .lines()
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}
