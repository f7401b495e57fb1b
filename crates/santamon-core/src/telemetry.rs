//! Telemetry record model
//!
//! A spool file carries one `TelemetryRecord` (or a `TelemetryBatch`) encoded
//! with bincode. The record is a tagged union over the sensor's event kinds;
//! the enums carry stable integer codes that are exposed to rule expressions
//! as named constants.

use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// All event kinds, in wire order.
pub const EVENT_KINDS: &[&str] = &[
    "execution",
    "fork",
    "exit",
    "close",
    "rename",
    "unlink",
    "link",
    "exchangedata",
    "disk",
    "bundle",
    "allowlist",
    "file_access",
    "codesigning_invalidated",
    "login_window_session",
    "login_logout",
    "screen_sharing",
    "open_ssh",
    "authentication",
    "clone",
    "copyfile",
    "gatekeeper_override",
    "launch_item",
    "tcc_modification",
    "xprotect",
];

macro_rules! telemetry_enum {
    ($(#[$meta:meta])* $name:ident {
        $first:ident = $first_label:literal = $first_code:literal
        $(, $variant:ident = $label:literal = $code:literal)* $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            #[serde(rename = $first_label)]
            $first,
            $( #[serde(rename = $label)] $variant, )*
        }

        impl $name {
            pub fn code(self) -> i64 {
                match self {
                    $name::$first => $first_code,
                    $( $name::$variant => $code, )*
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $name::$first => $first_label,
                    $( $name::$variant => $label, )*
                }
            }

            pub const ENTRIES: &'static [(&'static str, i64)] = &[
                ($first_label, $first_code),
                $( ($label, $code), )*
            ];
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$first
            }
        }
    };
}

telemetry_enum!(
    /// Allow/deny outcome of an execution event.
    Decision {
        Unknown = "DECISION_UNKNOWN" = 0,
        Allow = "DECISION_ALLOW" = 1,
        Deny = "DECISION_DENY" = 2,
    }
);

telemetry_enum!(
    /// Sensor enforcement mode at the time of the event.
    Mode {
        Unknown = "MODE_UNKNOWN" = 0,
        Monitor = "MODE_MONITOR" = 1,
        Lockdown = "MODE_LOCKDOWN" = 2,
    }
);

telemetry_enum!(
    /// Which policy matched an execution decision.
    Reason {
        Unknown = "REASON_UNKNOWN" = 0,
        Binary = "REASON_BINARY" = 1,
        Cert = "REASON_CERT" = 2,
        Scope = "REASON_SCOPE" = 3,
        TeamId = "REASON_TEAM_ID" = 4,
        SigningId = "REASON_SIGNING_ID" = 5,
        NotRunning = "REASON_NOT_RUNNING" = 6,
    }
);

telemetry_enum!(
    /// Outcome of a file-access policy check.
    PolicyDecision {
        Unknown = "POLICY_DECISION_UNKNOWN" = 0,
        Allowed = "POLICY_DECISION_ALLOWED" = 1,
        Denied = "POLICY_DECISION_DENIED" = 2,
        AllowedAuditOnly = "POLICY_DECISION_ALLOWED_AUDIT_ONLY" = 3,
    }
);

telemetry_enum!(
    LaunchItemAction {
        Unknown = "ACTION_UNKNOWN" = 0,
        Add = "ACTION_ADD" = 1,
        Remove = "ACTION_REMOVE" = 2,
    }
);

telemetry_enum!(
    LaunchItemType {
        Unknown = "ITEM_TYPE_UNKNOWN" = 0,
        Agent = "ITEM_TYPE_AGENT" = 1,
        Daemon = "ITEM_TYPE_DAEMON" = 2,
        LoginItem = "ITEM_TYPE_LOGIN_ITEM" = 3,
        App = "ITEM_TYPE_APP" = 4,
    }
);

telemetry_enum!(
    AuthorizationRight {
        Unknown = "AUTHORIZATION_RIGHT_UNKNOWN" = 0,
        Allowed = "AUTHORIZATION_RIGHT_ALLOWED" = 1,
        Denied = "AUTHORIZATION_RIGHT_DENIED" = 2,
    }
);

telemetry_enum!(
    AuthorizationReason {
        Unknown = "AUTHORIZATION_REASON_UNKNOWN" = 0,
        Password = "AUTHORIZATION_REASON_PASSWORD" = 1,
        TouchId = "AUTHORIZATION_REASON_TOUCH_ID" = 2,
        Token = "AUTHORIZATION_REASON_TOKEN" = 3,
        AutoUnlock = "AUTHORIZATION_REASON_AUTO_UNLOCK" = 4,
    }
);

telemetry_enum!(
    TccRight {
        Unknown = "TCC_RIGHT_UNKNOWN" = 0,
        Camera = "TCC_RIGHT_CAMERA" = 1,
        Microphone = "TCC_RIGHT_MICROPHONE" = 2,
        ScreenCapture = "TCC_RIGHT_SCREEN_CAPTURE" = 3,
        FullDiskAccess = "TCC_RIGHT_FULL_DISK_ACCESS" = 4,
        Accessibility = "TCC_RIGHT_ACCESSIBILITY" = 5,
    }
);

telemetry_enum!(
    TccReason {
        Unknown = "TCC_REASON_UNKNOWN" = 0,
        UserConsent = "TCC_REASON_USER_CONSENT" = 1,
        MdmPolicy = "TCC_REASON_MDM_POLICY" = 2,
        SystemSet = "TCC_REASON_SYSTEM_SET" = 3,
    }
);

/// Every named integer constant available to rule expressions.
pub fn enum_constants() -> &'static [(&'static str, i64)] {
    static TABLE: OnceLock<Vec<(&'static str, i64)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            Decision::ENTRIES,
            Mode::ENTRIES,
            Reason::ENTRIES,
            PolicyDecision::ENTRIES,
            LaunchItemAction::ENTRIES,
            LaunchItemType::ENTRIES,
            AuthorizationRight::ENTRIES,
            AuthorizationReason::ENTRIES,
            TccRight::ENTRIES,
            TccReason::ENTRIES,
        ]
        .concat()
    })
}

/// Look up an enum constant's integer code by its wire name.
pub fn constant_code(name: &str) -> Option<i64> {
    static INDEX: OnceLock<HashMap<&'static str, i64>> = OnceLock::new();
    INDEX
        .get_or_init(|| enum_constants().iter().copied().collect())
        .get(name)
        .copied()
}

// =============================================================================
// Supporting structures
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ProcessId {
    pub pid: i32,
    pub pidversion: i32,
}

impl ProcessId {
    pub fn is_zero(&self) -> bool {
        self.pid == 0 && self.pidversion == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HashInfo {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileInfo {
    pub path: String,
    pub hash: Option<HashInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CodeSignature {
    pub team_id: String,
    pub signing_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserInfo {
    pub uid: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupInfo {
    pub gid: i32,
    pub name: String,
}

/// Full process description, carried on execution targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessInfo {
    pub id: Option<ProcessId>,
    pub parent_id: Option<ProcessId>,
    pub responsible_id: Option<ProcessId>,
    pub executable: Option<FileInfo>,
    pub code_signature: Option<CodeSignature>,
    pub effective_user: Option<UserInfo>,
    pub effective_group: Option<GroupInfo>,
    pub session_id: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub is_platform_binary: bool,
}

/// Reduced process description used for instigators, without code signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessInfoLight {
    pub id: Option<ProcessId>,
    pub parent_id: Option<ProcessId>,
    pub executable: Option<FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathTarget {
    pub path: String,
}

// =============================================================================
// Event payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Execution {
    pub instigator: Option<ProcessInfoLight>,
    pub target: Option<ProcessInfo>,
    pub decision: Decision,
    pub mode: Mode,
    pub reason: Reason,
    pub args: Vec<Vec<u8>>,
    pub envs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Fork {
    pub instigator: Option<ProcessInfoLight>,
    pub child: Option<ProcessInfoLight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Exit {
    pub instigator: Option<ProcessInfoLight>,
    pub status: i32,
}

/// Single-path file events: close, unlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileEvent {
    pub instigator: Option<ProcessInfoLight>,
    pub target: Option<PathTarget>,
    pub modified: bool,
}

/// Two-path file events: rename, link, exchangedata, clone, copyfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilePairEvent {
    pub instigator: Option<ProcessInfoLight>,
    pub source: Option<PathTarget>,
    pub target: Option<PathTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Disk {
    pub device: String,
    pub mount_point: String,
    pub appeared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Bundle {
    pub path: String,
    pub hash: Option<HashInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Allowlist {
    pub target: Option<PathTarget>,
    pub hash: Option<HashInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileAccess {
    pub instigator: Option<ProcessInfo>,
    pub target: Option<PathTarget>,
    pub policy_name: String,
    pub policy_decision: PolicyDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CodesigningInvalidated {
    pub instigator: Option<ProcessInfoLight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoginWindowSession {
    pub user: String,
    pub session_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoginLogout {
    pub user: String,
    pub login: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScreenSharing {
    pub source_address: String,
    pub viewer: String,
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OpenSsh {
    pub source_address: String,
    pub user: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Authentication {
    pub user: String,
    pub right: AuthorizationRight,
    pub reason: AuthorizationReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GatekeeperOverride {
    pub target: Option<PathTarget>,
    pub hash: Option<HashInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LaunchItem {
    pub instigator: Option<ProcessInfoLight>,
    pub action: LaunchItemAction,
    pub item_type: LaunchItemType,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TccModification {
    pub instigator: Option<ProcessInfoLight>,
    pub right: TccRight,
    pub reason: TccReason,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct XprotectDetected {
    pub signature_name: String,
    pub detected_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Xprotect {
    pub detected: Option<XprotectDetected>,
}

/// The event payload, externally tagged so the JSON form nests under the
/// kind name (`{"execution": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Execution(Execution),
    Fork(Fork),
    Exit(Exit),
    Close(FileEvent),
    Rename(FilePairEvent),
    Unlink(FileEvent),
    Link(FilePairEvent),
    Exchangedata(FilePairEvent),
    Disk(Disk),
    Bundle(Bundle),
    Allowlist(Allowlist),
    FileAccess(FileAccess),
    CodesigningInvalidated(CodesigningInvalidated),
    LoginWindowSession(LoginWindowSession),
    LoginLogout(LoginLogout),
    ScreenSharing(ScreenSharing),
    OpenSsh(OpenSsh),
    Authentication(Authentication),
    Clone(FilePairEvent),
    Copyfile(FilePairEvent),
    GatekeeperOverride(GatekeeperOverride),
    LaunchItem(LaunchItem),
    TccModification(TccModification),
    Xprotect(Xprotect),
}

impl EventPayload {
    /// Lower-case kind name, matching the JSON tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Execution(_) => "execution",
            EventPayload::Fork(_) => "fork",
            EventPayload::Exit(_) => "exit",
            EventPayload::Close(_) => "close",
            EventPayload::Rename(_) => "rename",
            EventPayload::Unlink(_) => "unlink",
            EventPayload::Link(_) => "link",
            EventPayload::Exchangedata(_) => "exchangedata",
            EventPayload::Disk(_) => "disk",
            EventPayload::Bundle(_) => "bundle",
            EventPayload::Allowlist(_) => "allowlist",
            EventPayload::FileAccess(_) => "file_access",
            EventPayload::CodesigningInvalidated(_) => "codesigning_invalidated",
            EventPayload::LoginWindowSession(_) => "login_window_session",
            EventPayload::LoginLogout(_) => "login_logout",
            EventPayload::ScreenSharing(_) => "screen_sharing",
            EventPayload::OpenSsh(_) => "open_ssh",
            EventPayload::Authentication(_) => "authentication",
            EventPayload::Clone(_) => "clone",
            EventPayload::Copyfile(_) => "copyfile",
            EventPayload::GatekeeperOverride(_) => "gatekeeper_override",
            EventPayload::LaunchItem(_) => "launch_item",
            EventPayload::TccModification(_) => "tcc_modification",
            EventPayload::Xprotect(_) => "xprotect",
        }
    }
}

// =============================================================================
// Telemetry record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub machine_id: String,
    pub boot_session_uuid: String,
    pub event_time: Option<DateTime<Utc>>,
    pub processed_time: Option<DateTime<Utc>>,
    pub event: EventPayload,
}

/// Several records published in one spool file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub records: Vec<TelemetryRecord>,
}

impl TelemetryRecord {
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }

    /// Allow/deny outcome label, empty for kinds without one.
    pub fn decision_label(&self) -> &'static str {
        match &self.event {
            EventPayload::Execution(ev) => ev.decision.label(),
            EventPayload::FileAccess(ev) => ev.policy_decision.label(),
            _ => "",
        }
    }

    /// Hash identifier of the event target, when available.
    pub fn target_sha256(&self) -> &str {
        if let EventPayload::Execution(ev) = &self.event {
            if let Some(hash) = ev
                .target
                .as_ref()
                .and_then(|t| t.executable.as_ref())
                .and_then(|e| e.hash.as_ref())
            {
                return &hash.hash;
            }
        }
        ""
    }

    /// Human-readable target path.
    pub fn target_path(&self) -> &str {
        match &self.event {
            EventPayload::Execution(ev) => ev
                .target
                .as_ref()
                .and_then(|t| t.executable.as_ref())
                .map(|e| e.path.as_str())
                .unwrap_or(""),
            EventPayload::FileAccess(ev) => ev
                .target
                .as_ref()
                .map(|t| t.path.as_str())
                .unwrap_or(""),
            EventPayload::Xprotect(ev) => ev
                .detected
                .as_ref()
                .map(|d| d.detected_path.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    /// Instigator executable path.
    pub fn actor_path(&self) -> &str {
        match &self.event {
            EventPayload::Execution(ev) => ev
                .instigator
                .as_ref()
                .and_then(|i| i.executable.as_ref())
                .map(|e| e.path.as_str())
                .unwrap_or(""),
            EventPayload::FileAccess(ev) => ev
                .instigator
                .as_ref()
                .and_then(|i| i.executable.as_ref())
                .map(|e| e.path.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    /// Instigator team identifier. Only file-access instigators carry a code
    /// signature; execution instigators are reduced process descriptions.
    pub fn actor_team(&self) -> &str {
        match &self.event {
            EventPayload::FileAccess(ev) => ev
                .instigator
                .as_ref()
                .and_then(|i| i.code_signature.as_ref())
                .map(|cs| cs.team_id.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    /// Instigator signing identifier, file-access only (see `actor_team`).
    pub fn actor_signing_id(&self) -> &str {
        match &self.event {
            EventPayload::FileAccess(ev) => ev
                .instigator
                .as_ref()
                .and_then(|i| i.code_signature.as_ref())
                .map(|cs| cs.signing_id.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    pub fn target_team(&self) -> &str {
        match &self.event {
            EventPayload::Execution(ev) => ev
                .target
                .as_ref()
                .and_then(|t| t.code_signature.as_ref())
                .map(|cs| cs.team_id.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    pub fn target_signing_id(&self) -> &str {
        match &self.event {
            EventPayload::Execution(ev) => ev
                .target
                .as_ref()
                .and_then(|t| t.code_signature.as_ref())
                .map(|cs| cs.signing_id.as_str())
                .unwrap_or(""),
            _ => "",
        }
    }

    /// Decoded argv for execution events, empty list otherwise.
    pub fn decoded_args(&self) -> Vec<String> {
        match &self.event {
            EventPayload::Execution(ev) => ev
                .args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Flattened, event-rooted map view of the record. Used for correlation
    /// grouping, baseline pattern extraction and signal context shaping.
    /// Raw argv/env byte lists are decoded to strings here.
    pub fn to_map(&self) -> Value {
        let mut map = match serde_json::to_value(&self.event) {
            Ok(json) => match Value::from_json(json) {
                Value::Map(m) => m,
                _ => IndexMap::new(),
            },
            Err(_) => IndexMap::new(),
        };

        if let Some(Value::Map(exec)) = map.get_mut("execution") {
            for field in ["args", "envs"] {
                let decoded = exec.get(field).and_then(decode_byte_list);
                if let Some(decoded) = decoded {
                    exec.insert(field.to_string(), decoded);
                }
            }
        }

        map.insert("machine_id".to_string(), Value::Str(self.machine_id.clone()));
        map.insert(
            "boot_session_uuid".to_string(),
            Value::Str(self.boot_session_uuid.clone()),
        );
        map.insert("kind".to_string(), Value::Str(self.kind().to_string()));
        if let Some(ts) = self.event_time {
            map.insert("event_time".to_string(), Value::Timestamp(ts));
        }
        if let Some(ts) = self.processed_time {
            map.insert("processed_time".to_string(), Value::Timestamp(ts));
        }

        Value::Map(map)
    }
}

/// Decode a JSON-serialized `Vec<Vec<u8>>` (array of byte arrays) into an
/// array of strings. Returns `None` when the shape does not match.
fn decode_byte_list(raw: &Value) -> Option<Value> {
    let items = match raw {
        Value::Array(items) => items,
        _ => return None,
    };

    let mut decoded = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(bytes) => {
                let buf: Vec<u8> = bytes
                    .iter()
                    .filter_map(|b| b.as_int().map(|n| n as u8))
                    .collect();
                decoded.push(Value::Str(String::from_utf8_lossy(&buf).into_owned()));
            }
            Value::Str(s) => decoded.push(Value::Str(s.clone())),
            other => decoded.push(Value::Str(other.to_field_string())),
        }
    }
    Some(Value::Array(decoded))
}

/// Walk a dotted path within an event map and return the value as a string.
/// Missing intermediate keys yield the empty string.
pub fn extract_field(event: &Value, field: &str) -> String {
    let mut current = event;
    for part in field.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    current.to_field_string()
}

/// Strip the `event.` prefix rule files use for field paths; the map view is
/// already event-rooted.
pub fn strip_event_prefix(field: &str) -> &str {
    field.strip_prefix("event.").unwrap_or(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_record() -> TelemetryRecord {
        TelemetryRecord {
            machine_id: "machine-1".to_string(),
            boot_session_uuid: "boot-1".to_string(),
            event_time: Some(Utc::now()),
            processed_time: None,
            event: EventPayload::Execution(Execution {
                instigator: Some(ProcessInfoLight {
                    id: Some(ProcessId { pid: 10, pidversion: 1 }),
                    parent_id: None,
                    executable: Some(FileInfo {
                        path: "/bin/sh".to_string(),
                        hash: None,
                    }),
                }),
                target: Some(ProcessInfo {
                    id: Some(ProcessId { pid: 11, pidversion: 1 }),
                    executable: Some(FileInfo {
                        path: "/usr/bin/curl".to_string(),
                        hash: Some(HashInfo { hash: "abcd".to_string() }),
                    }),
                    code_signature: Some(CodeSignature {
                        team_id: "TEAM1".to_string(),
                        signing_id: "com.example.curl".to_string(),
                    }),
                    ..Default::default()
                }),
                decision: Decision::Allow,
                mode: Mode::Monitor,
                reason: Reason::Binary,
                args: vec![b"curl".to_vec(), b"https://example.com".to_vec()],
                envs: vec![],
            }),
        }
    }

    #[test]
    fn test_kind_names_cover_all_variants() {
        assert_eq!(EVENT_KINDS.len(), 24);
        assert_eq!(execution_record().kind(), "execution");
    }

    #[test]
    fn test_accessors() {
        let rec = execution_record();
        assert_eq!(rec.target_path(), "/usr/bin/curl");
        assert_eq!(rec.target_sha256(), "abcd");
        assert_eq!(rec.actor_path(), "/bin/sh");
        assert_eq!(rec.target_team(), "TEAM1");
        assert_eq!(rec.target_signing_id(), "com.example.curl");
        assert_eq!(rec.decision_label(), "DECISION_ALLOW");
        assert_eq!(rec.decoded_args(), vec!["curl", "https://example.com"]);
    }

    #[test]
    fn test_actor_team_only_for_file_access() {
        let rec = execution_record();
        assert_eq!(rec.actor_team(), "");

        let fa = TelemetryRecord {
            machine_id: "m".into(),
            boot_session_uuid: "b".into(),
            event_time: None,
            processed_time: None,
            event: EventPayload::FileAccess(FileAccess {
                instigator: Some(ProcessInfo {
                    code_signature: Some(CodeSignature {
                        team_id: "TEAMX".into(),
                        signing_id: "com.x".into(),
                    }),
                    ..Default::default()
                }),
                target: Some(PathTarget { path: "/etc/hosts".into() }),
                policy_name: "Hosts".into(),
                policy_decision: PolicyDecision::Denied,
            }),
        };
        assert_eq!(fa.actor_team(), "TEAMX");
        assert_eq!(fa.target_path(), "/etc/hosts");
        assert_eq!(fa.decision_label(), "POLICY_DECISION_DENIED");
    }

    #[test]
    fn test_to_map_decodes_args_and_adds_metadata() {
        let rec = execution_record();
        let map = rec.to_map();

        assert_eq!(extract_field(&map, "kind"), "execution");
        assert_eq!(extract_field(&map, "machine_id"), "machine-1");
        assert_eq!(
            extract_field(&map, "execution.target.executable.path"),
            "/usr/bin/curl"
        );
        assert_eq!(
            extract_field(&map, "execution.target.executable.hash.hash"),
            "abcd"
        );

        let args = map.get("execution").and_then(|e| e.get("args")).unwrap();
        assert_eq!(
            args,
            &Value::Array(vec![
                Value::Str("curl".into()),
                Value::Str("https://example.com".into())
            ])
        );
    }

    #[test]
    fn test_extract_field_missing_path() {
        let map = execution_record().to_map();
        assert_eq!(extract_field(&map, "execution.nonexistent.path"), "");
        assert_eq!(extract_field(&map, "file_access.target.path"), "");
    }

    #[test]
    fn test_strip_event_prefix() {
        assert_eq!(strip_event_prefix("event.execution.decision"), "execution.decision");
        assert_eq!(strip_event_prefix("execution.decision"), "execution.decision");
    }

    #[test]
    fn test_enum_constants_unique() {
        let table = enum_constants();
        let mut names: Vec<&str> = table.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len(), "duplicate constant names");
        assert_eq!(constant_code("DECISION_ALLOW"), Some(1));
        assert_eq!(constant_code("POLICY_DECISION_DENIED"), Some(2));
        assert_eq!(constant_code("NOT_A_CONSTANT"), None);
    }

    #[test]
    fn test_enum_json_uses_wire_names() {
        let json = serde_json::to_string(&Decision::Deny).unwrap();
        assert_eq!(json, "\"DECISION_DENY\"");
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Decision::Deny);
    }
}
