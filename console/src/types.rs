use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// ============================================================================
// Timestamps
// ============================================================================

/// Magnitude above which an integer timestamp is read as epoch milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// A point in time as exchanged with the backend.
///
/// Accepts RFC 3339 strings, epoch seconds (integer or fractional) and epoch
/// milliseconds on input; always emits RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
            .ok()
            .map(Self)
    }

    pub fn unix_millis(&self) -> i64 {
        (self.0.unix_timestamp_nanos() / 1_000_000) as i64
    }

    pub fn as_offset_date_time(&self) -> OffsetDateTime {
        self.0
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.format(&Rfc3339) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}", self.unix_millis()),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = self
            .0
            .format(&Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Integer(i64),
            Fractional(f64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Integer(n) if n.abs() >= MILLIS_THRESHOLD => {
                OffsetDateTime::from_unix_timestamp_nanos(n as i128 * 1_000_000)
                    .map_err(de::Error::custom)?
            }
            Raw::Integer(n) => OffsetDateTime::from_unix_timestamp(n).map_err(de::Error::custom)?,
            Raw::Fractional(secs) => {
                if !secs.is_finite() {
                    return Err(de::Error::custom("timestamp is not a finite number"));
                }
                let nanos = secs.trunc() as i128 * 1_000_000_000
                    + (secs.fract() * 1e9).round() as i128;
                OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(de::Error::custom)?
            }
            Raw::Text(s) => OffsetDateTime::parse(&s, &Rfc3339).map_err(de::Error::custom)?,
        };
        Ok(Self(parsed))
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Busy,
    Migrating,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

/// Point-in-time resource usage of a node. Every field may be missing before
/// the node's first metrics push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_processes: Option<u32>,
}

impl NodeMetrics {
    /// Load score as reported, or derived from cpu and memory usage.
    pub fn effective_load_score(&self) -> Option<f64> {
        self.load_score.or_else(|| match (self.cpu_usage, self.memory_usage) {
            (Some(cpu), Some(mem)) => Some(cpu * 0.6 + mem * 0.4),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
    #[serde(default)]
    pub connected_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

// ============================================================================
// Migrations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// Code only; execution restarts on the target.
    Weak,
    /// Code plus captured execution state.
    Strong,
}

impl std::str::FromStr for MigrationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WEAK" => Ok(Self::Weak),
            "STRONG" => Ok(Self::Strong),
            other => Err(format!("unknown migration type: {}", other)),
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weak => f.write_str("WEAK"),
            Self::Strong => f.write_str("STRONG"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// Terminal records never transition again.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Failed | Self::Cancelled => true,
            Self::Pending | Self::InProgress => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub id: String,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    pub source_node_id: String,
    pub target_node_id: String,
    pub code_id: String,
    pub status: MigrationStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Migration {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub code_id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
}

/// Body of a per-migration progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    #[serde(default)]
    pub migration_id: Option<String>,
    pub progress: u8,
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Code packages
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeMetadata {
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Execution state captured on the source node for strong mobility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeState {
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub execution_point: u32,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePackage {
    pub id: String,
    pub name: String,
    pub code: String,
    pub entry_point: String,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub metadata: CodeMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CodeState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCodeRequest {
    pub name: String,
    pub code: String,
    pub entry_point: String,
    pub initial_node_id: Option<String>,
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "debug")]
    Info,
    Success,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub message: String,
    pub level: LogLevel,
    #[serde(flatten)]
    pub tags: LogTags,
}

// ============================================================================
// Demo / status broadcasts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DemoEventKind {
    Started,
    Completed,
    Error,
    Warning,
    Other(String),
}

impl From<String> for DemoEventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "demo:started" => Self::Started,
            "demo:completed" => Self::Completed,
            "demo:error" => Self::Error,
            "demo:warning" => Self::Warning,
            _ => Self::Other(value),
        }
    }
}

impl From<DemoEventKind> for String {
    fn from(value: DemoEventKind) -> Self {
        match value {
            DemoEventKind::Started => "demo:started".to_string(),
            DemoEventKind::Completed => "demo:completed".to_string(),
            DemoEventKind::Error => "demo:error".to_string(),
            DemoEventKind::Warning => "demo:warning".to_string(),
            DemoEventKind::Other(s) => s,
        }
    }
}

impl DemoEventKind {
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Started | Self::Completed => LogLevel::Success,
            Self::Error => LogLevel::Error,
            Self::Warning => LogLevel::Warning,
            Self::Other(_) => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoEvent {
    #[serde(rename = "type")]
    pub kind: DemoEventKind,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Feed identity
// ============================================================================

/// Registration sent once per feed connection so the backend sees the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleIdentity {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl Default for ConsoleIdentity {
    fn default() -> Self {
        Self {
            id: "dashboard".to_string(),
            host: "localhost".to_string(),
            port: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_accepts_millis_seconds_and_rfc3339() {
        let millis: Timestamp = serde_json::from_str("1700000000123").unwrap();
        assert_eq!(millis.unix_millis(), 1_700_000_000_123);

        let secs: Timestamp = serde_json::from_str("1700000000").unwrap();
        assert_eq!(secs.unix_millis(), 1_700_000_000_000);

        let fractional: Timestamp = serde_json::from_str("1700000000.5").unwrap();
        assert_eq!(fractional.unix_millis(), 1_700_000_000_500);

        let text: Timestamp = serde_json::from_str("\"2023-11-14T22:13:20Z\"").unwrap();
        assert_eq!(text.unix_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_timestamp_serializes_as_rfc3339() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_000).unwrap();
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"2023-11-14T22:13:20Z\"");
    }

    #[test]
    fn test_node_decodes_backend_shape() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "node-1",
            "host": "10.0.0.5",
            "port": 8081,
            "role": "WORKER",
            "status": "ONLINE",
            "metrics": { "cpuUsage": 50.0, "memoryUsage": 25.0, "activeProcesses": 3, "uptime": 120 },
            "connectedAt": 1700000000.25
        }))
        .unwrap();

        assert_eq!(node.status, NodeStatus::Online);
        let metrics = node.metrics.unwrap();
        assert_eq!(metrics.active_processes, Some(3));
        assert_eq!(metrics.effective_load_score(), Some(40.0));
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let result = serde_json::from_value::<Migration>(serde_json::json!({
            "id": "m1",
            "type": "WEAK",
            "sourceNodeId": "a",
            "targetNodeId": "b",
            "codeId": "c",
            "status": "EXPLODED",
            "progress": 0
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_log_level_reads_as_info() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level, LogLevel::Info);
        assert!(serde_json::from_str::<LogLevel>("\"verbose\"").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(MigrationStatus::Completed.is_terminal());
        assert!(MigrationStatus::Failed.is_terminal());
        assert!(MigrationStatus::Cancelled.is_terminal());
        assert!(!MigrationStatus::Pending.is_terminal());
        assert!(!MigrationStatus::InProgress.is_terminal());
    }
}
