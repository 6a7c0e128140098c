//! Wire protocol between the server and its agents
//!
//! Two logical services run over a single transport. Unary host calls
//! (registration, status reporting) travel as JSON over plain HTTP POST.
//! The command channel is a persistent WebSocket carrying JSON-framed
//! [`CommandMessage`] values in both directions: the server pushes
//! [`CommandContent`] frames, the agent replies with [`CommandResult`]
//! frames, and either side may send a [`CommandCancel`].
//!
//! The server identifies an agent stream by the `host_id` carried in the
//! first message received on it; agents send an empty-command
//! [`CommandContent`] as that binding frame.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity a host presents when registering with the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    /// Stable host identifier chosen by the agent.
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub os: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Unix seconds at which the agent produced this record.
    pub last_seen: i64,
}

/// CPU utilisation snapshot included in a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuStatus {
    pub usage_percent: f64,
    pub core_count: u32,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,
}

/// Memory utilisation snapshot included in a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStatus {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub usage_percent: f64,
}

/// Per-mount disk utilisation snapshot included in a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskStatus {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

/// Periodic status report sent by an agent for its host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostStatus {
    pub host_id: String,
    /// Unix seconds at which the snapshot was taken.
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub ip: String,
    pub cpu: CpuStatus,
    pub memory: MemoryStatus,
    #[serde(default)]
    pub disks: Vec<DiskStatus>,
    #[serde(default)]
    pub custom_tags: HashMap<String, String>,
}

/// A command pushed from the server to an agent. Also used (with an empty
/// `command`) as the agent's first frame on a fresh stream to bind its
/// `host_id`, and as a periodic heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandContent {
    pub command_id: String,
    pub host_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Wall-clock limit in seconds; 0 means the agent applies its default.
    pub timeout_seconds: u64,
    /// Unix seconds at which the server created the command.
    pub created_at: i64,
}

impl CommandContent {
    /// Binding/heartbeat frame: carries only the host identity.
    pub fn heartbeat(host_id: &str, now: i64) -> Self {
        Self {
            command_id: String::new(),
            host_id: host_id.to_string(),
            command: String::new(),
            parameters: HashMap::new(),
            timeout_seconds: 0,
            created_at: now,
        }
    }

    /// Whether this frame carries an actual command to execute.
    pub fn is_executable(&self) -> bool {
        !self.command_id.is_empty() && !self.command.is_empty()
    }
}

/// Execution outcome reported by an agent. `started_at`/`finished_at` are
/// unix seconds; a missing `finished_at` means the command is still running
/// (progress report). Exit code `-1` means the command could not be run at
/// all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub command_id: String,
    pub host_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Best-effort cancellation of a previously dispatched command. The agent
/// resolves it to the running process and terminates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandCancel {
    pub command_id: String,
    pub host_id: String,
}

/// A single frame on the command stream; exactly one variant per frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CommandMessage {
    Content(CommandContent),
    Result(CommandResult),
    Cancel(CommandCancel),
}

impl CommandMessage {
    /// The host this frame concerns, regardless of variant.
    pub fn host_id(&self) -> &str {
        match self {
            CommandMessage::Content(c) => &c.host_id,
            CommandMessage::Result(r) => &r.host_id,
            CommandMessage::Cancel(c) => &c.host_id,
        }
    }

    /// Serialize to the JSON text used on the WebSocket.
    pub fn to_frame(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from the WebSocket.
    pub fn from_frame(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_message_frame_tagging() {
        let msg = CommandMessage::Result(CommandResult {
            command_id: "cmd-1".to_string(),
            host_id: "host-1".to_string(),
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Some(1_700_000_000),
            finished_at: Some(1_700_000_001),
            error_message: None,
        });

        let frame = msg.to_frame().unwrap();
        // Exactly one variant key is present on the wire.
        assert!(frame.contains("\"result\""));
        assert!(!frame.contains("\"content\""));

        let parsed = CommandMessage::from_frame(&frame).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_heartbeat_is_not_executable() {
        let hb = CommandContent::heartbeat("host-1", 1_700_000_000);
        assert!(!hb.is_executable());
        assert_eq!(hb.host_id, "host-1");

        let real = CommandContent {
            command_id: "cmd-1".to_string(),
            host_id: "host-1".to_string(),
            command: "echo hi".to_string(),
            parameters: HashMap::new(),
            timeout_seconds: 5,
            created_at: 1_700_000_000,
        };
        assert!(real.is_executable());
    }

    #[test]
    fn test_host_id_accessor_covers_all_variants() {
        let cancel = CommandMessage::Cancel(CommandCancel {
            command_id: "cmd-9".to_string(),
            host_id: "host-7".to_string(),
        });
        assert_eq!(cancel.host_id(), "host-7");
    }

    #[test]
    fn test_result_round_trip_preserves_optional_fields() {
        let json = r#"{"result":{"command_id":"c","host_id":"h","exit_code":-1,
            "started_at":null,"finished_at":null,"error_message":"could not run"}}"#;
        let parsed = CommandMessage::from_frame(json).unwrap();
        match parsed {
            CommandMessage::Result(r) => {
                assert_eq!(r.exit_code, -1);
                assert!(r.started_at.is_none());
                assert_eq!(r.error_message.as_deref(), Some("could not run"));
                assert_eq!(r.stdout, "");
            }
            _ => panic!("expected result frame"),
        }
    }
}
