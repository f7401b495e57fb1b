//! Event view: per-record activation and flattened map
//!
//! Each telemetry record is materialized two ways. The activation binds the
//! expression variables (metadata scalars, the payload map for the record's
//! own kind, decoded argv, enum constants); enum labels in the payload are
//! interned to their integer codes so rules can compare against the named
//! constants. The flattened map keeps the labels as strings and is what
//! correlation grouping, baseline patterns and signal shaping read.

use santamon_core::telemetry::{constant_code, EventPayload, TelemetryRecord};
use santamon_core::Value;
use santamon_expr::Activation;

/// Payload fields whose string labels are enum wire names.
const ENUM_FIELDS: &[&str] = &[
    "decision",
    "mode",
    "reason",
    "policy_decision",
    "action",
    "item_type",
    "right",
];

pub struct EventView<'a> {
    record: &'a TelemetryRecord,
    map: Value,
    activation: Activation,
}

impl<'a> EventView<'a> {
    pub fn new(record: &'a TelemetryRecord) -> Self {
        let map = record.to_map();

        let mut activation = Activation::with_enum_constants();
        activation.set("kind", record.kind());
        activation.set("machine_id", record.machine_id.clone());
        activation.set("boot_session_uuid", record.boot_session_uuid.clone());
        if let Some(ts) = record.event_time {
            activation.set("event_time", Value::Timestamp(ts));
        }
        if let Some(ts) = record.processed_time {
            activation.set("processed_time", Value::Timestamp(ts));
        }
        activation.set(
            "decoded_args",
            Value::Array(
                record
                    .decoded_args()
                    .into_iter()
                    .map(Value::Str)
                    .collect(),
            ),
        );

        if let Some(payload) = map.get(record.kind()) {
            let mut typed = payload.clone();
            intern_enum_labels(&mut typed);
            activation.set(record.kind(), typed);
        }

        Self {
            record,
            map,
            activation,
        }
    }

    pub fn record(&self) -> &TelemetryRecord {
        self.record
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    /// Event-rooted dotted-access map view.
    pub fn map(&self) -> &Value {
        &self.map
    }

    pub fn is_execution(&self) -> bool {
        matches!(self.record.event, EventPayload::Execution(_))
    }
}

/// Replace enum label strings with their integer codes, in place. Only
/// fields known to carry enums are touched, so path-like strings can never
/// be mistaken for constants.
fn intern_enum_labels(value: &mut Value) {
    if let Value::Map(map) = value {
        for (key, entry) in map.iter_mut() {
            if ENUM_FIELDS.contains(&key.as_str()) {
                if let Value::Str(label) = entry {
                    if let Some(code) = constant_code(label) {
                        *entry = Value::Int(code);
                        continue;
                    }
                }
            }
            intern_enum_labels(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use santamon_core::telemetry::{
        Decision, Execution, FileInfo, Mode, ProcessInfo, Reason, TelemetryRecord,
    };

    fn execution_record() -> TelemetryRecord {
        TelemetryRecord {
            machine_id: "m1".into(),
            boot_session_uuid: "b1".into(),
            event_time: Some(chrono::Utc::now()),
            processed_time: None,
            event: EventPayload::Execution(Execution {
                target: Some(ProcessInfo {
                    executable: Some(FileInfo {
                        path: "/usr/bin/curl".into(),
                        hash: None,
                    }),
                    ..Default::default()
                }),
                decision: Decision::Deny,
                mode: Mode::Lockdown,
                reason: Reason::Binary,
                args: vec![b"curl".to_vec()],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_activation_interns_enums() {
        let record = execution_record();
        let view = EventView::new(&record);

        let exec = view.activation().get("execution").unwrap();
        assert_eq!(exec.get("decision"), Some(&Value::Int(2)));
        assert_eq!(exec.get("mode"), Some(&Value::Int(2)));
        assert_eq!(exec.get("reason"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_map_keeps_enum_labels() {
        let record = execution_record();
        let view = EventView::new(&record);
        assert_eq!(
            santamon_core::telemetry::extract_field(view.map(), "execution.decision"),
            "DECISION_DENY"
        );
    }

    #[test]
    fn test_activation_metadata() {
        let record = execution_record();
        let view = EventView::new(&record);
        assert_eq!(
            view.activation().get("kind"),
            Some(&Value::Str("execution".into()))
        );
        assert_eq!(
            view.activation().get("decoded_args"),
            Some(&Value::Array(vec![Value::Str("curl".into())]))
        );
        assert!(view.activation().get("event_time").is_some());
        assert!(view.activation().get("processed_time").is_none());
    }

    #[test]
    fn test_only_own_kind_variable_bound() {
        let record = execution_record();
        let view = EventView::new(&record);
        assert!(view.activation().get("execution").is_some());
        assert!(view.activation().get("file_access").is_none());
    }
}
