//! Response rewriting for passthrough requests
//!
//! The bundle loader creates every object in the ephemeral API server, which
//! assigns fresh UIDs, resource versions and timestamps. The loader keeps
//! the captured values in `kubelive.dev/original-*` annotations; the rules
//! here put them back so clients see the cluster as it was captured.
//!
//! Rules run in order over the decoded JSON document. A document no rule
//! changes is returned byte-identical, and anything that is not JSON passes
//! through untouched.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use kubelive_common::ORIGINAL_FIELD_ANNOTATION_PREFIX;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::upstream::ByteStream;

/// Metadata fields restored from `kubelive.dev/original-<suffix>` annotations
const RESTORED_FIELDS: &[(&str, &str)] = &[
    ("uid", "uid"),
    ("resource-version", "resourceVersion"),
    ("creation-timestamp", "creationTimestamp"),
    ("deletion-timestamp", "deletionTimestamp"),
];

/// A stateless transformation of a decoded Kubernetes API document
pub trait RewriteRule: Send + Sync {
    /// Rule name for diagnostics
    fn name(&self) -> &'static str;

    /// Rewrite `doc` in place, returning whether anything changed
    fn apply(&self, doc: &mut Value) -> bool;
}

/// Moves captured uid/resourceVersion/timestamps back into `metadata`
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOriginalMetadata;

impl RewriteRule for RestoreOriginalMetadata {
    fn name(&self) -> &'static str {
        "restore-original-metadata"
    }

    fn apply(&self, doc: &mut Value) -> bool {
        for_each_object(doc, restore_metadata)
    }
}

fn restore_metadata(object: &mut Map<String, Value>) -> bool {
    let Some(Value::Object(metadata)) = object.get_mut("metadata") else {
        return false;
    };
    let Some(Value::Object(annotations)) = metadata.get_mut("annotations") else {
        return false;
    };

    let mut restored = Vec::new();
    for (suffix, field) in RESTORED_FIELDS {
        let key = format!("{}{}", ORIGINAL_FIELD_ANNOTATION_PREFIX, suffix);
        if let Some(value) = annotations.remove(&key) {
            restored.push((*field, value));
        }
    }
    if restored.is_empty() {
        return false;
    }
    if annotations.is_empty() {
        metadata.remove("annotations");
    }
    for (field, value) in restored {
        metadata.insert(field.to_string(), value);
    }
    true
}

/// Drops `metadata.managedFields` written by the ephemeral server
#[derive(Clone, Copy, Debug, Default)]
pub struct StripManagedFields;

impl RewriteRule for StripManagedFields {
    fn name(&self) -> &'static str {
        "strip-managed-fields"
    }

    fn apply(&self, doc: &mut Value) -> bool {
        for_each_object(doc, |object| match object.get_mut("metadata") {
            Some(Value::Object(metadata)) => metadata.remove("managedFields").is_some(),
            _ => false,
        })
    }
}

/// Recomputes the `Age` column of server-side printed tables
///
/// The ephemeral server computes ages from the time objects were loaded;
/// this uses the restored `creationTimestamp` instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecomputeTableAge {
    now: Option<DateTime<Utc>>,
}

impl RecomputeTableAge {
    /// Ages relative to the current time
    pub fn new() -> Self {
        Self::default()
    }

    /// Ages relative to a fixed instant
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Some(now) }
    }
}

impl RewriteRule for RecomputeTableAge {
    fn name(&self) -> &'static str {
        "recompute-table-age"
    }

    fn apply(&self, doc: &mut Value) -> bool {
        if !is_table(doc) {
            return false;
        }
        let Some(age_column) = doc
            .get("columnDefinitions")
            .and_then(Value::as_array)
            .and_then(|columns| {
                columns
                    .iter()
                    .position(|c| c.get("name").and_then(Value::as_str) == Some("Age"))
            })
        else {
            return false;
        };

        let now = self.now.unwrap_or_else(Utc::now);
        let Some(rows) = doc.get_mut("rows").and_then(Value::as_array_mut) else {
            return false;
        };

        let mut changed = false;
        for row in rows {
            let Some(created) = row
                .pointer("/object/metadata/creationTimestamp")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            else {
                continue;
            };
            let age = Value::String(human_duration(now.signed_duration_since(created)));
            if let Some(cell) = row
                .get_mut("cells")
                .and_then(Value::as_array_mut)
                .and_then(|cells| cells.get_mut(age_column))
            {
                if *cell != age {
                    *cell = age;
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Format a duration the way kubectl prints ages
pub fn human_duration(duration: chrono::Duration) -> String {
    let seconds = duration.num_seconds();
    // Up to a second of clock skew counts as "now"
    if seconds < -1 {
        return "<invalid>".to_string();
    }
    if seconds < 0 {
        return "0s".to_string();
    }
    if seconds < 60 * 2 {
        return format!("{}s", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 10 {
        let s = seconds % 60;
        return if s == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m{}s", minutes, s)
        };
    }
    if minutes < 60 * 3 {
        return format!("{}m", minutes);
    }

    let hours = minutes / 60;
    if hours < 8 {
        let m = minutes % 60;
        return if m == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h{}m", hours, m)
        };
    }
    if hours < 48 {
        return format!("{}h", hours);
    }
    if hours < 24 * 8 {
        let h = hours % 24;
        return if h == 0 {
            format!("{}d", hours / 24)
        } else {
            format!("{}d{}h", hours / 24, h)
        };
    }
    if hours < 24 * 365 * 2 {
        return format!("{}d", hours / 24);
    }
    if hours < 24 * 365 * 8 {
        let days = (hours / 24) % 365;
        return if days == 0 {
            format!("{}y", hours / 24 / 365)
        } else {
            format!("{}y{}d", hours / 24 / 365, days)
        };
    }
    format!("{}y", hours / 24 / 365)
}

fn is_table(doc: &Value) -> bool {
    doc.get("kind").and_then(Value::as_str) == Some("Table")
        && doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .is_some_and(|v| v.starts_with("meta.k8s.io/"))
}

/// Visit the document itself, each `items[]` entry and each `rows[].object`
fn for_each_object<F>(doc: &mut Value, mut visit: F) -> bool
where
    F: FnMut(&mut Map<String, Value>) -> bool,
{
    let Value::Object(root) = doc else {
        return false;
    };

    let mut changed = visit(root);

    if let Some(Value::Array(items)) = root.get_mut("items") {
        for item in items.iter_mut() {
            if let Value::Object(item) = item {
                changed |= visit(item);
            }
        }
    }

    if let Some(Value::Array(rows)) = root.get_mut("rows") {
        for row in rows.iter_mut() {
            if let Some(Value::Object(object)) = row.get_mut("object") {
                changed |= visit(object);
            }
        }
    }

    changed
}

/// Ordered list of rewrite rules
#[derive(Clone, Default)]
pub struct RewriteChain {
    rules: Vec<Arc<dyn RewriteRule>>,
}

impl std::fmt::Debug for RewriteChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name()))
            .finish()
    }
}

impl RewriteChain {
    /// Chain with no rules; every body passes through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore captured metadata, drop managed fields, then fix table ages
    pub fn standard() -> Self {
        Self::new()
            .with_rule(RestoreOriginalMetadata)
            .with_rule(StripManagedFields)
            .with_rule(RecomputeTableAge::new())
    }

    /// Append a rule
    pub fn with_rule(mut self, rule: impl RewriteRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Whether the chain has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule in order, returning whether any changed `doc`
    pub fn apply(&self, doc: &mut Value) -> bool {
        let mut changed = false;
        for rule in &self.rules {
            if rule.apply(doc) {
                debug!(rule = rule.name(), "Rewrote response");
                changed = true;
            }
        }
        changed
    }

    /// Rewrite a buffered response body
    ///
    /// Returns `body` itself when it is not JSON, cannot be parsed, or no
    /// rule changed it.
    pub fn rewrite_body(&self, content_type: Option<&str>, body: Bytes) -> Bytes {
        if self.is_empty() || body.is_empty() || !is_json(content_type) {
            return body;
        }

        let mut doc: Value = match serde_json::from_slice(&body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "Upstream returned malformed JSON, passing through");
                return body;
            }
        };

        if !self.apply(&mut doc) {
            return body;
        }

        match serde_json::to_vec(&doc) {
            Ok(rewritten) => Bytes::from(rewritten),
            Err(e) => {
                warn!(error = %e, "Failed to serialize rewritten response, passing through");
                body
            }
        }
    }

    /// Rewrite the `object` of one newline-delimited watch event
    pub fn rewrite_watch_event(&self, line: Bytes) -> Bytes {
        let content = line.strip_suffix(b"\n").unwrap_or(&line[..]);
        if self.is_empty() || content.iter().all(u8::is_ascii_whitespace) {
            return line;
        }

        let mut event: Value = match serde_json::from_slice(content) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed watch event, passing through");
                return line;
            }
        };

        let changed = match event.get_mut("object") {
            Some(object) => self.apply(object),
            None => false,
        };
        if !changed {
            return line;
        }

        match serde_json::to_vec(&event) {
            Ok(mut rewritten) => {
                rewritten.push(b'\n');
                Bytes::from(rewritten)
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize rewritten watch event, passing through");
                line
            }
        }
    }
}

/// Whether a Content-Type names a JSON body (`application/json`, `…+json`)
pub fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

struct WatchState {
    upstream: ByteStream,
    buffer: BytesMut,
    done: bool,
    /// Upstream failure held back until the buffered tail is flushed
    error: Option<std::io::Error>,
}

/// Re-frame a watch stream into events and rewrite each one
///
/// Events are newline-delimited and may be split across chunks; each is
/// emitted as soon as its newline arrives. An upstream error ends the stream
/// after whatever was already buffered.
pub fn rewrite_watch_stream(chain: Arc<RewriteChain>, upstream: ByteStream) -> ByteStream {
    let state = WatchState {
        upstream,
        buffer: BytesMut::new(),
        done: false,
        error: None,
    };

    Box::pin(stream::unfold(state, move |mut state| {
        let chain = chain.clone();
        async move {
            loop {
                if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let line = state.buffer.split_to(pos + 1).freeze();
                    return Some((Ok(chain.rewrite_watch_event(line)), state));
                }
                if state.done {
                    if state.buffer.is_empty() {
                        return state.error.take().map(|e| (Err(e), state));
                    }
                    let rest = state.buffer.split().freeze();
                    return Some((Ok(chain.rewrite_watch_event(rest)), state));
                }
                match state.upstream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        state.error = Some(e);
                    }
                    None => state.done = true,
                }
            }
        }
    }))
}
