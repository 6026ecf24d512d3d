//! Per-run NDJSON event writer.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use super::types::RunEvent;
use crate::truncate::preview;

/// Characters of an agent prompt kept in `item_started` arguments.
pub const PROMPT_PREVIEW_CHARS: usize = 200;

struct Inner {
    thread_id: String,
    sequence: AtomicU64,
    writer: Mutex<Box<dyn Write + Send>>,
}

/// Event sink for one run.
///
/// Cheap to clone; clones share the sequence counter and writer. A disabled
/// stream still hands out item ids but writes nothing.
#[derive(Clone)]
pub struct EventStream {
    inner: Option<Arc<Inner>>,
    items: Arc<AtomicU64>,
}

impl EventStream {
    pub fn disabled() -> Self {
        Self {
            inner: None,
            items: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                thread_id: Uuid::new_v4().to_string(),
                sequence: AtomicU64::new(0),
                writer: Mutex::new(writer),
            })),
            items: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stdout() -> Self {
        Self::to_writer(Box::new(std::io::stdout()))
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.inner.as_deref().map(|inner| inner.thread_id.as_str())
    }

    /// Next `item_<n>` id, unique within this run.
    pub fn next_item_id(&self) -> String {
        format!("item_{}", self.items.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Write one event line. Failures are logged and swallowed.
    pub fn emit(&self, event: RunEvent) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut line = match serde_json::to_value(&event) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                warn!(event = event.event_type(), error = %e, "Failed to encode event");
                return;
            }
        };
        line.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.insert(
            "sequence".into(),
            Value::from(inner.sequence.fetch_add(1, Ordering::SeqCst) + 1),
        );
        line.insert("thread_id".into(), Value::String(inner.thread_id.clone()));

        let encoded = match serde_json::to_string(&Value::Object(line)) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(event = event.event_type(), error = %e, "Failed to encode event");
                return;
            }
        };
        let mut writer = inner.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(writer, "{encoded}").and_then(|_| writer.flush()) {
            warn!(event = event.event_type(), error = %e, "Failed to write event");
        }
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Copy tool arguments for an event, replacing `prompt` with a short preview.
pub fn sanitize_tool_args(raw: &str) -> Value {
    let Ok(Value::Object(mut args)) = serde_json::from_str::<Value>(raw) else {
        return Value::Null;
    };
    if let Some(prompt) = args.remove("prompt") {
        if let Some(text) = prompt.as_str() {
            args.insert(
                "prompt_preview".into(),
                Value::String(preview(text, PROMPT_PREVIEW_CHARS)),
            );
        }
    }
    Value::Object(args)
}
