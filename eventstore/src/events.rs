//! Normalization of heterogeneous raw events into uniform usage intervals.
//!
//! Each raw-event kind carries a differently shaped JSON payload. The
//! normalizer projects every payload into a tagged variant, orders events
//! per resource and walks a small state machine that turns lifecycle
//! transitions into half-open `[start, stop)` intervals. Open intervals are
//! closed at the supplied `now`; zero-length intervals are dropped. The same
//! pure function serves `refresh` and the forecaster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::{EventKind, Interval, RawEvent, UsageEvent};
use uuid::Uuid;

use crate::config::COMPUTE_PLAN_NAME;
use crate::error::{Error, Result};

/// App lifecycle states that commit resources.
const APP_STARTED: &str = "STARTED";

/// Service lifecycle states.
const SERVICE_CREATED: &str = "CREATED";
const SERVICE_UPDATED: &str = "UPDATED";

#[derive(Debug, Clone, Deserialize)]
pub struct AppUsageMessage {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub previous_state: String,
    #[serde(default)]
    pub app_guid: Uuid,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub org_guid: Uuid,
    #[serde(default)]
    pub space_guid: Uuid,
    #[serde(default)]
    pub instance_count: i32,
    #[serde(default)]
    pub memory_in_mb_per_instance: i32,
    #[serde(default)]
    pub process_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceUsageMessage {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub service_instance_guid: Uuid,
    #[serde(default)]
    pub service_instance_name: String,
    #[serde(default)]
    pub service_label: String,
    #[serde(default)]
    pub service_plan_guid: Uuid,
    #[serde(default)]
    pub service_plan_name: String,
    #[serde(default)]
    pub org_guid: Uuid,
    #[serde(default)]
    pub space_guid: Uuid,
}

/// A raw message projected into its per-kind shape.
#[derive(Debug, Clone)]
pub enum UsageEventMessage {
    App(AppUsageMessage),
    Service(ServiceUsageMessage),
    /// Compose events carry scale annotations only; no usage intervals are
    /// derived from them here.
    Compose,
}

impl UsageEventMessage {
    pub fn parse(kind: EventKind, raw_message: &serde_json::Value) -> Result<Self> {
        Ok(match kind {
            EventKind::App => UsageEventMessage::App(serde_json::from_value(raw_message.clone())?),
            EventKind::Service => {
                UsageEventMessage::Service(serde_json::from_value(raw_message.clone())?)
            }
            EventKind::Compose => UsageEventMessage::Compose,
        })
    }

    /// The resource a message belongs to, used to group events into streams.
    fn resource_guid(&self) -> Option<Uuid> {
        match self {
            UsageEventMessage::App(m) => Some(m.app_guid),
            UsageEventMessage::Service(m) => Some(m.service_instance_guid),
            UsageEventMessage::Compose => None,
        }
    }
}

struct ParsedEvent {
    guid: Uuid,
    created_at: DateTime<Utc>,
    message: UsageEventMessage,
}

/// Project raw events into normalized usage intervals.
///
/// `compute_plan_guid` is bound to every app interval regardless of any plan
/// the event declares. Events are ordered per resource by `(created_at,
/// guid)`; the output is sorted by `(start, event_guid)`.
pub fn normalize(
    raw_events: &[RawEvent],
    now: DateTime<Utc>,
    compute_plan_guid: Uuid,
) -> Result<Vec<UsageEvent>> {
    let mut streams: BTreeMap<(EventKind, Uuid), Vec<ParsedEvent>> = BTreeMap::new();

    for raw in raw_events {
        let (Some(guid), Some(created_at), Some(raw_message)) =
            (raw.guid, raw.created_at, raw.raw_message.as_ref())
        else {
            return Err(Error::BatchIngest(format!(
                "cannot normalize raw event missing guid, created_at or raw_message: {raw:?}"
            )));
        };
        let kind: EventKind = raw.kind.parse().map_err(Error::BatchIngest)?;
        let message = UsageEventMessage::parse(kind, raw_message)?;
        let Some(resource_guid) = message.resource_guid() else {
            continue;
        };
        streams.entry((kind, resource_guid)).or_default().push(ParsedEvent {
            guid,
            created_at,
            message,
        });
    }

    let mut events = Vec::new();
    for ((kind, _resource), mut stream) in streams {
        stream.sort_by_key(|ev| (ev.created_at, ev.guid));
        match kind {
            EventKind::App => normalize_app_stream(&stream, now, compute_plan_guid, &mut events),
            EventKind::Service => normalize_service_stream(&stream, now, &mut events),
            EventKind::Compose => {}
        }
    }

    events.sort_by_key(|ev| (ev.duration.start, ev.event_guid));
    Ok(events)
}

/// Every event for an app closes the interval in progress; a `STARTED` event
/// with a non-zero instance count opens the next one.
fn normalize_app_stream(
    stream: &[ParsedEvent],
    now: DateTime<Utc>,
    compute_plan_guid: Uuid,
    out: &mut Vec<UsageEvent>,
) {
    let mut open: Option<(&ParsedEvent, &AppUsageMessage)> = None;

    for event in stream {
        let UsageEventMessage::App(message) = &event.message else {
            continue;
        };
        if let Some((opener, opened)) = open.take() {
            push_app_interval(opener, opened, event.created_at, compute_plan_guid, out);
        }
        if message.state == APP_STARTED && message.instance_count > 0 {
            open = Some((event, message));
        }
    }

    if let Some((opener, opened)) = open {
        push_app_interval(opener, opened, now, compute_plan_guid, out);
    }
}

fn push_app_interval(
    opener: &ParsedEvent,
    message: &AppUsageMessage,
    stop: DateTime<Utc>,
    compute_plan_guid: Uuid,
    out: &mut Vec<UsageEvent>,
) {
    let duration = Interval::new(opener.created_at, stop);
    if duration.is_empty() {
        return;
    }
    out.push(UsageEvent {
        event_guid: opener.guid,
        resource_guid: message.app_guid,
        resource_name: message.app_name.clone(),
        resource_type: "app".to_string(),
        org_guid: message.org_guid,
        space_guid: message.space_guid,
        plan_guid: compute_plan_guid,
        plan_name: COMPUTE_PLAN_NAME.to_string(),
        duration,
        number_of_nodes: Some(message.instance_count),
        memory_in_mb: Some(message.memory_in_mb_per_instance),
        storage_in_mb: Some(0),
    });
}

/// `CREATED` and `UPDATED` open a segment, any following event closes it,
/// `DELETED` closes without reopening. An intervening `UPDATED` therefore
/// splits `CREATED -> DELETED` into adjacent segments.
fn normalize_service_stream(stream: &[ParsedEvent], now: DateTime<Utc>, out: &mut Vec<UsageEvent>) {
    let mut open: Option<(&ParsedEvent, &ServiceUsageMessage)> = None;

    for event in stream {
        let UsageEventMessage::Service(message) = &event.message else {
            continue;
        };
        if let Some((opener, opened)) = open.take() {
            push_service_interval(opener, opened, event.created_at, out);
        }
        if message.state == SERVICE_CREATED || message.state == SERVICE_UPDATED {
            open = Some((event, message));
        }
    }

    if let Some((opener, opened)) = open {
        push_service_interval(opener, opened, now, out);
    }
}

fn push_service_interval(
    opener: &ParsedEvent,
    message: &ServiceUsageMessage,
    stop: DateTime<Utc>,
    out: &mut Vec<UsageEvent>,
) {
    let duration = Interval::new(opener.created_at, stop);
    if duration.is_empty() {
        return;
    }
    out.push(UsageEvent {
        event_guid: opener.guid,
        resource_guid: message.service_instance_guid,
        resource_name: message.service_instance_name.clone(),
        resource_type: message.service_label.clone(),
        org_guid: message.org_guid,
        space_guid: message.space_guid,
        plan_guid: message.service_plan_guid,
        plan_name: message.service_plan_name.clone(),
        duration,
        number_of_nodes: None,
        memory_in_mb: None,
        storage_in_mb: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COMPUTE_PLAN_GUID;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn app_event(guid: &str, created_at: &str, state: &str, count: i32, memory: i32) -> RawEvent {
        RawEvent {
            guid: Some(guid.parse().unwrap()),
            created_at: Some(at(created_at)),
            kind: "app".to_string(),
            raw_message: Some(json!({
                "state": state,
                "previous_state": "STARTED",
                "app_guid": "c85e98f0-6d1b-4f45-9368-ea58263165a0",
                "app_name": "APP1",
                "org_guid": "51ba75ef-edc0-47ad-a633-a8f6e8770944",
                "space_guid": "276f4886-ac40-492d-a8cd-b2646637ba76",
                "space_name": "ORG1-SPACE1",
                "process_type": "web",
                "instance_count": count,
                "memory_in_mb_per_instance": memory,
            })),
        }
    }

    fn service_event(guid: &str, created_at: &str, state: &str) -> RawEvent {
        RawEvent {
            guid: Some(guid.parse().unwrap()),
            created_at: Some(at(created_at)),
            kind: "service".to_string(),
            raw_message: Some(json!({
                "state": state,
                "org_guid": "51ba75ef-edc0-47ad-a633-a8f6e8770944",
                "space_guid": "bd405d91-0b7c-4b8c-96ef-8b4c1e26e75d",
                "space_name": "sandbox",
                "service_guid": "efadb775-58c4-4e17-8087-6d0f4febc489",
                "service_label": "postgres",
                "service_plan_guid": "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe5",
                "service_plan_name": "Free",
                "service_instance_guid": "f3f98365-6a95-4bbd-ab8f-527a7957a41f",
                "service_instance_name": "ja-rails-postgres",
                "service_instance_type": "managed_service_instance",
            })),
        }
    }

    const NOW: &str = "2002-01-01T00:00:00Z";

    #[test]
    fn app_start_stop_yields_one_interval() {
        let events = normalize(
            &[
                app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", "2001-01-01T00:00:00Z", "STARTED", 1, 1024),
                app_event("8d9036c5-8367-497d-bb56-94bfcac6621a", "2001-01-01T01:00:00Z", "STOPPED", 1, 1024),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.event_guid.to_string(), "ee28a570-f485-48e1-87d0-98b7b8b66dfa");
        assert_eq!(
            ev.duration.to_string(),
            "[\"2001-01-01 00:00:00+00\",\"2001-01-01 01:00:00+00\")"
        );
        assert_eq!(ev.plan_guid, COMPUTE_PLAN_GUID);
        assert_eq!(ev.plan_name, "app");
        assert_eq!(ev.resource_type, "app");
        assert_eq!(ev.resource_name, "APP1");
        assert_eq!(ev.memory_in_mb, Some(1024));
        assert_eq!(ev.number_of_nodes, Some(1));
        assert_eq!(ev.storage_in_mb, Some(0));
    }

    #[test]
    fn consecutive_starts_yield_adjacent_intervals() {
        let events = normalize(
            &[
                app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", "2001-01-01T00:00:00Z", "STARTED", 1, 1024),
                app_event("8d9036c5-8367-497d-bb56-94bfcac6621a", "2001-01-01T01:00:00Z", "STARTED", 4, 2048),
                app_event("395b7d4c-c859-4a28-9a53-6b15fab447c7", "2001-01-01T02:00:00Z", "STOPPED", 4, 2048),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].duration.stop, events[1].duration.start);
        assert_eq!(events[0].number_of_nodes, Some(1));
        assert_eq!(events[0].memory_in_mb, Some(1024));
        assert_eq!(events[1].number_of_nodes, Some(4));
        assert_eq!(events[1].memory_in_mb, Some(2048));
        assert_eq!(events[1].event_guid.to_string(), "8d9036c5-8367-497d-bb56-94bfcac6621a");
    }

    #[test]
    fn lone_start_runs_until_now() {
        let events = normalize(
            &[app_event(
                "ee28a570-f485-48e1-87d0-98b7b8b66dfa",
                "2001-01-01T00:00:00Z",
                "STARTED",
                1,
                1024,
            )],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration.stop, at(NOW));
    }

    #[test]
    fn start_at_now_is_suppressed() {
        let events = normalize(
            &[app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", NOW, "STARTED", 1, 1024)],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn stop_without_start_is_suppressed() {
        let events = normalize(
            &[app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", "2001-01-01T00:00:00Z", "STOPPED", 1, 1024)],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn started_with_zero_instances_commits_nothing() {
        let events = normalize(
            &[
                app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", "2001-01-01T00:00:00Z", "STARTED", 0, 1024),
                app_event("8d9036c5-8367-497d-bb56-94bfcac6621a", "2001-01-01T01:00:00Z", "STOPPED", 0, 1024),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn service_created_deleted_yields_one_interval() {
        let events = normalize(
            &[
                service_event("c497eb13-f48a-4859-be53-5569f302b516", "2001-01-01T00:00:00Z", "CREATED"),
                service_event("6d52b4f4-9e33-4504-8fca-fd9e33af11a6", "2001-01-01T01:00:00Z", "DELETED"),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.event_guid.to_string(), "c497eb13-f48a-4859-be53-5569f302b516");
        assert_eq!(ev.resource_type, "postgres");
        assert_eq!(ev.resource_name, "ja-rails-postgres");
        assert_eq!(ev.plan_guid.to_string(), "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe5");
        assert_eq!(ev.plan_name, "Free");
        assert_eq!(ev.number_of_nodes, None);
        assert_eq!(ev.memory_in_mb, None);
        assert_eq!(ev.storage_in_mb, None);
    }

    #[test]
    fn update_splits_a_service_interval() {
        let events = normalize(
            &[
                service_event("c497eb13-f48a-4859-be53-5569f302b516", "2001-01-01T00:00:00Z", "CREATED"),
                service_event("94147a2f-2626-4445-8b4e-22ebe8071a29", "2001-01-01T01:00:00Z", "UPDATED"),
                service_event("6d52b4f4-9e33-4504-8fca-fd9e33af11a6", "2001-01-01T02:00:00Z", "DELETED"),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].duration.stop, events[1].duration.start);
        assert_eq!(events[1].event_guid.to_string(), "94147a2f-2626-4445-8b4e-22ebe8071a29");
        assert_eq!(events[1].duration.stop, at("2001-01-01T02:00:00Z"));
    }

    #[test]
    fn ties_break_on_guid() {
        // Same created_at: the lower guid is applied first, so the higher
        // guid's STARTED wins the open slot.
        let events = normalize(
            &[
                app_event("7311ecc5-33f7-42f5-92b6-7f0789bf92a5", "2001-01-01T00:00:00Z", "STARTED", 2, 512),
                app_event("395b7d4c-c859-4a28-9a53-6b15fab447c7", "2001-01-01T00:00:00Z", "STARTED", 1, 1024),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_guid.to_string(), "7311ecc5-33f7-42f5-92b6-7f0789bf92a5");
        assert_eq!(events[0].number_of_nodes, Some(2));
    }

    #[test]
    fn compose_events_project_no_intervals() {
        let raw = RawEvent {
            guid: Some("94147a2f-2626-4445-8b4e-22ebe8071a29".parse().unwrap()),
            created_at: Some(at("2001-01-01T00:00:00Z")),
            kind: "compose".to_string(),
            raw_message: Some(json!({"event": "deployment.scale.members", "deployment_id": "1"})),
        };
        let events = normalize(&[raw], at(NOW), COMPUTE_PLAN_GUID).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_app_state_closes_but_never_opens() {
        let events = normalize(
            &[
                app_event("ee28a570-f485-48e1-87d0-98b7b8b66dfa", "2001-01-01T00:00:00Z", "STARTED", 1, 1024),
                app_event("8d9036c5-8367-497d-bb56-94bfcac6621a", "2001-01-01T01:00:00Z", "BUILDPACK_SET", 1, 1024),
            ],
            at(NOW),
            COMPUTE_PLAN_GUID,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration.stop, at("2001-01-01T01:00:00Z"));
    }
}
