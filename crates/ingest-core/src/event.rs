//! Lifecycle notifications emitted to downstream consumers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value as JsonValue};

use crate::{BusinessContext, JobFailure, JobId, Platform, RemoteJobId};

pub const EVENT_SOURCE: &str = "data-ingestion-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Triggered,
    Completed,
    Failed,
}

impl EventKind {
    /// Logical channel the event is delivered on.
    pub fn topic(self) -> &'static str {
        match self {
            EventKind::Triggered => "crawl-triggered",
            EventKind::Completed => "ingestion-completed",
            EventKind::Failed => "crawl-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Triggered {
        remote_job_id: RemoteJobId,
        platform: Platform,
        business_context: BusinessContext,
    },
    Completed {
        result_location: String,
        record_count: usize,
        media_count: u64,
        platform: Platform,
        business_context: BusinessContext,
    },
    Failed {
        failure: JobFailure,
        platform: Platform,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl LifecycleEvent {
    pub fn triggered(
        job_id: JobId,
        remote_job_id: RemoteJobId,
        platform: Platform,
        business_context: BusinessContext,
    ) -> Self {
        Self::now(
            job_id,
            EventPayload::Triggered {
                remote_job_id,
                platform,
                business_context,
            },
        )
    }

    pub fn completed(
        job_id: JobId,
        result_location: impl Into<String>,
        record_count: usize,
        media_count: u64,
        platform: Platform,
        business_context: BusinessContext,
    ) -> Self {
        Self::now(
            job_id,
            EventPayload::Completed {
                result_location: result_location.into(),
                record_count,
                media_count,
                platform,
                business_context,
            },
        )
    }

    pub fn failed(job_id: JobId, failure: JobFailure, platform: Platform) -> Self {
        Self::now(job_id, EventPayload::Failed { failure, platform })
    }

    fn now(job_id: JobId, payload: EventPayload) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Triggered { .. } => EventKind::Triggered,
            EventPayload::Completed { .. } => EventKind::Completed,
            EventPayload::Failed { .. } => EventKind::Failed,
        }
    }

    /// Flat JSON message body: common envelope plus kind-specific fields.
    pub fn to_message(&self) -> JsonValue {
        let mut body = Map::new();
        body.insert("event_type".into(), json!(self.kind().topic()));
        body.insert(
            "timestamp".into(),
            json!(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        body.insert("job_id".into(), json!(self.job_id.to_string()));
        body.insert("source".into(), json!(EVENT_SOURCE));

        match &self.payload {
            EventPayload::Triggered {
                remote_job_id,
                platform,
                business_context,
            } => {
                body.insert("remote_job_id".into(), json!(remote_job_id.as_str()));
                body.insert("platform".into(), json!(platform.as_str()));
                insert_context(&mut body, business_context);
            }
            EventPayload::Completed {
                result_location,
                record_count,
                media_count,
                platform,
                business_context,
            } => {
                body.insert("result_location".into(), json!(result_location));
                body.insert("record_count".into(), json!(record_count));
                body.insert("media_count".into(), json!(media_count));
                body.insert("platform".into(), json!(platform.as_str()));
                insert_context(&mut body, business_context);
            }
            EventPayload::Failed { failure, platform } => {
                body.insert("error_stage".into(), json!(failure.stage.as_str()));
                body.insert("error_message".into(), json!(failure.message));
                body.insert("platform".into(), json!(platform.as_str()));
            }
        }

        JsonValue::Object(body)
    }
}

fn insert_context(body: &mut Map<String, JsonValue>, context: &BusinessContext) {
    body.insert("competitor".into(), json!(context.competitor));
    body.insert("brand".into(), json!(context.brand));
    body.insert("category".into(), json!(context.category));
}
