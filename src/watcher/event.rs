use serde::Deserialize;
use std::collections::BTreeMap;

/// Longest prefix of an undecodable line carried into the error log.
const DECODE_EXCERPT_CHARS: usize = 200;

/// One decoded line of event-source output.
///
/// The shape follows Docker's `events --format '{{json .}}'` records. Kinds
/// and actions are open strings; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EventActor,
    #[serde(default)]
    pub time: i64,
    #[serde(default, rename = "timeNano")]
    pub time_nano: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default, rename = "Attributes")]
    pub attributes: BTreeMap<String, String>,
}

/// Decode one line into an event.
///
/// A malformed line yields no event and never affects neighboring lines;
/// the failure is logged with a bounded excerpt of the offender.
pub fn decode_line(line: &str) -> Option<RawEvent> {
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            let excerpt: String = line.chars().take(DECODE_EXCERPT_CHARS).collect();
            log::error!("Undecodable event line ({e}): {excerpt}");
            None
        }
    }
}

/// Policy deciding which decoded events are forwarded to core.
///
/// Only container events are of interest downstream; within those, a
/// configurable action list (stop/kill by default) is suppressed as noise.
#[derive(Debug, Clone)]
pub struct EventFilter {
    ignored_actions: Vec<String>,
}

impl EventFilter {
    pub fn new(ignored_actions: Vec<String>) -> Self {
        Self { ignored_actions }
    }

    pub fn forwards(&self, event: &RawEvent) -> bool {
        if event.kind != "container" {
            return false;
        }
        !self
            .ignored_actions
            .iter()
            .any(|ignored| ignored == &event.action)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new(crate::config::default_ignored_actions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_line(kind: &str, action: &str) -> String {
        format!(
            r#"{{"status":"{action}","id":"c0ffee","Type":"{kind}","Action":"{action}","Actor":{{"ID":"c0ffee","Attributes":{{"image":"nginx","name":"web"}}}},"scope":"local","time":1736000000,"timeNano":1736000000123456789}}"#
        )
    }

    #[test]
    fn test_decode_container_event() {
        let event = decode_line(&event_line("container", "create")).expect("Failed to decode");
        assert_eq!(event.kind, "container");
        assert_eq!(event.action, "create");
        assert_eq!(event.actor.id, "c0ffee");
        assert_eq!(
            event.actor.attributes.get("name").map(|s| s.as_str()),
            Some("web")
        );
        assert_eq!(event.time, 1736000000);
        assert_eq!(event.time_nano, 1736000000123456789);
    }

    #[test]
    fn test_decode_failure_yields_no_event() {
        assert!(decode_line("not json at all").is_none());
        assert!(decode_line("{\"Type\": \"container\"").is_none());
    }

    #[test]
    fn test_bad_line_does_not_affect_next_line() {
        let lines = ["{truncated", &event_line("container", "die")];
        let events: Vec<RawEvent> = lines.iter().filter_map(|l| decode_line(l)).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "die");
    }

    #[test]
    fn test_missing_optional_timestamps() {
        let event = decode_line(
            r#"{"Type":"container","Action":"create","Actor":{"ID":"c0ffee"}}"#,
        )
        .expect("Failed to decode");
        assert_eq!(event.time, 0);
        assert_eq!(event.time_nano, 0);
        assert!(event.actor.attributes.is_empty());
    }

    #[test]
    fn test_filter_suppresses_stop_and_kill() {
        let filter = EventFilter::default();
        assert!(!filter.forwards(&decode_line(&event_line("container", "stop")).unwrap()));
        assert!(!filter.forwards(&decode_line(&event_line("container", "kill")).unwrap()));
    }

    #[test]
    fn test_filter_passes_other_container_actions() {
        let filter = EventFilter::default();
        for action in ["create", "start", "destroy", "die"] {
            assert!(
                filter.forwards(&decode_line(&event_line("container", action)).unwrap()),
                "{action} should be forwarded"
            );
        }
    }

    #[test]
    fn test_filter_drops_non_container_kinds() {
        let filter = EventFilter::default();
        for kind in ["image", "volume", "network", "plugin"] {
            assert!(!filter.forwards(&decode_line(&event_line(kind, "create")).unwrap()));
        }
    }

    #[test]
    fn test_filter_override() {
        let filter = EventFilter::new(vec!["die".to_string()]);
        assert!(!filter.forwards(&decode_line(&event_line("container", "die")).unwrap()));
        assert!(filter.forwards(&decode_line(&event_line("container", "stop")).unwrap()));
    }
}
