//! Trace/span instrumentation (spec §4.11). Every public handler opens a
//! root span; engine/db/webhook/workflow operations open children. Closing
//! a span pairs a `tracing` log line with a durable row in `_events`,
//! following the teacher's habit of logging a structured line at every
//! significant operation boundary.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::{BindValue, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanSource {
    Http,
    Engine,
    Auth,
    Webhook,
    Workflow,
    Storage,
    Db,
}

impl SpanSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Engine => "engine",
            Self::Auth => "auth",
            Self::Webhook => "webhook",
            Self::Workflow => "workflow",
            Self::Storage => "storage",
            Self::Db => "db",
        }
    }
}

pub struct Span {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    source: SpanSource,
    component: String,
    action: String,
    entity: Option<String>,
    record_id: Option<String>,
    user_id: Option<String>,
    metadata: Value,
    started_at: std::time::Instant,
}

impl Span {
    pub fn root(source: SpanSource, component: impl Into<String>, action: impl Into<String>) -> Self {
        let trace_id = Uuid::new_v4().to_string();
        Self::new(trace_id, None, source, component, action)
    }

    pub fn child(&self, source: SpanSource, component: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(self.trace_id.clone(), Some(self.span_id.clone()), source, component, action)
    }

    fn new(
        trace_id: String,
        parent_span_id: Option<String>,
        source: SpanSource,
        component: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            trace_id,
            span_id: Uuid::new_v4().to_string(),
            parent_span_id,
            source,
            component: component.into(),
            action: action.into(),
            entity: None,
            record_id: None,
            user_id: None,
            metadata: Value::Object(Default::default()),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn set_metadata(&mut self, metadata: Value) {
        self.metadata = metadata;
    }

    /// Persists the closed span as one `_events` row and emits the paired
    /// `tracing` log line. `status` is `"ok"` or `"error"` (spec §3).
    pub async fn close(self, store: &Store, status: &str) -> AppResult<i64> {
        let duration_ms = self.started_at.elapsed().as_millis() as i64;

        if status == "error" {
            tracing::error!(
                trace_id = %self.trace_id,
                component = %self.component,
                action = %self.action,
                duration_ms,
                "span closed with error"
            );
        } else {
            tracing::info!(
                trace_id = %self.trace_id,
                component = %self.component,
                action = %self.action,
                duration_ms,
                "span closed"
            );
        }

        let sql = "INSERT INTO _events \
            (id, trace_id, span_id, parent_span_id, event_type, source, component, action, entity, record_id, user_id, duration_ms, status, metadata, created_at) \
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

        let params = vec![
            BindValue::Uuid(Uuid::new_v4()),
            BindValue::Text(self.trace_id.clone()),
            BindValue::Text(self.span_id.clone()),
            self.parent_span_id
                .clone()
                .map(BindValue::Text)
                .unwrap_or(BindValue::Null),
            BindValue::Text("span_closed".to_string()),
            BindValue::Text(self.source.as_str().to_string()),
            BindValue::Text(self.component.clone()),
            BindValue::Text(self.action.clone()),
            self.entity.clone().map(BindValue::Text).unwrap_or(BindValue::Null),
            self.record_id.clone().map(BindValue::Text).unwrap_or(BindValue::Null),
            self.user_id.clone().map(BindValue::Text).unwrap_or(BindValue::Null),
            BindValue::I64(duration_ms),
            BindValue::Text(status.to_string()),
            BindValue::Json(self.metadata.clone()),
            BindValue::Timestamp(Utc::now()),
        ];

        store.exec(sql, &params).await?;
        Ok(duration_ms)
    }
}

/// Computes a percentile over an already-sorted slice of durations,
/// the dialect-agnostic fallback spec §4.11 calls for when the store
/// lacks native percentile support.
pub fn percentile_from_sorted(sorted_durations_ms: &[i64], percentile: f64) -> Option<i64> {
    if sorted_durations_ms.is_empty() {
        return None;
    }
    let rank = (percentile / 100.0) * (sorted_durations_ms.len() as f64 - 1.0);
    let index = rank.round().clamp(0.0, (sorted_durations_ms.len() - 1) as f64) as usize;
    Some(sorted_durations_ms[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_empty_slice_is_none() {
        assert_eq!(percentile_from_sorted(&[], 95.0), None);
    }

    #[test]
    fn p95_of_ten_values_picks_near_tail() {
        let durations: Vec<i64> = (1..=10).collect();
        assert_eq!(percentile_from_sorted(&durations, 95.0), Some(10));
    }

    #[test]
    fn child_span_inherits_trace_id() {
        let root = Span::root(SpanSource::Http, "router", "handle_request");
        let child = root.child(SpanSource::Db, "store", "query_rows");
        assert_eq!(root.trace_id(), child.trace_id());
    }
}
