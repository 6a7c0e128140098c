//! Cross-module wire compatibility tests
//!
//! These tests pin the JSON shapes that cross the process boundary: the
//! envelope the operator API returns, the frames on the command stream, and
//! the status report the agent posts. A change that breaks one of these
//! breaks deployed agents.

use crate::api::{ApiEnvelope, CreateTaskRequest, RegisterRequest};
use crate::model::{Task, TaskStatus};
use crate::protocol::{
    CommandCancel, CommandContent, CommandMessage, CpuStatus, DiskStatus, HostInfo, HostStatus,
    MemoryStatus,
};
use std::collections::HashMap;

#[test]
fn test_envelope_wraps_domain_types() {
    let task = Task {
        task_id: "task-1".to_string(),
        name: "restart nginx".to_string(),
        description: String::new(),
        created_by: "ops".to_string(),
        status: TaskStatus::Pending,
        total_hosts: 2,
        completed_hosts: 0,
        failed_hosts: 0,
        started_at: None,
        finished_at: None,
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
    };

    let env = ApiEnvelope::success(task);
    let json = serde_json::to_string(&env).unwrap();
    assert!(json.contains("\"status\":\"pending\""));
    assert!(json.contains("\"total_hosts\":2"));

    let back: ApiEnvelope<Task> = serde_json::from_str(&json).unwrap();
    assert!(back.success);
    assert_eq!(back.data.unwrap().task_id, "task-1");
}

#[test]
fn test_register_request_shape() {
    let req = RegisterRequest {
        host: HostInfo {
            id: "web-01".to_string(),
            hostname: "web-01.internal".to_string(),
            ip: "10.0.0.5".to_string(),
            os: "linux".to_string(),
            tags: HashMap::from([("env".to_string(), "prod".to_string())]),
            last_seen: 1_700_000_000,
        },
    };

    let json = serde_json::to_string(&req).unwrap();
    let back: RegisterRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(back.host.id, "web-01");
    assert_eq!(back.host.tags.get("env").map(String::as_str), Some("prod"));
}

#[test]
fn test_host_status_round_trip() {
    let status = HostStatus {
        host_id: "web-01".to_string(),
        timestamp: 1_700_000_000,
        uptime_seconds: 86_400,
        ip: "10.0.0.5".to_string(),
        cpu: CpuStatus {
            usage_percent: 12.5,
            core_count: 8,
            load_avg_1m: 0.4,
            load_avg_5m: 0.3,
            load_avg_15m: 0.2,
        },
        memory: MemoryStatus {
            used_bytes: 4 << 30,
            total_bytes: 16 << 30,
            usage_percent: 25.0,
        },
        disks: vec![DiskStatus {
            mount_point: "/".to_string(),
            total_bytes: 100 << 30,
            used_bytes: 40 << 30,
            free_bytes: 60 << 30,
            usage_percent: 40.0,
        }],
        custom_tags: HashMap::new(),
    };

    let json = serde_json::to_string(&status).unwrap();
    let back: HostStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(back, status);
}

#[test]
fn test_stream_frames_are_mutually_exclusive() {
    let content = CommandMessage::Content(CommandContent {
        command_id: "cmd-1".to_string(),
        host_id: "web-01".to_string(),
        command: "uptime".to_string(),
        parameters: HashMap::new(),
        timeout_seconds: 30,
        created_at: 1_700_000_000,
    });
    let cancel = CommandMessage::Cancel(CommandCancel {
        command_id: "cmd-1".to_string(),
        host_id: "web-01".to_string(),
    });

    let content_frame = content.to_frame().unwrap();
    let cancel_frame = cancel.to_frame().unwrap();

    assert!(content_frame.starts_with("{\"content\""));
    assert!(cancel_frame.starts_with("{\"cancel\""));

    // Each frame parses back to exactly its own variant.
    assert_eq!(CommandMessage::from_frame(&content_frame).unwrap(), content);
    assert_eq!(CommandMessage::from_frame(&cancel_frame).unwrap(), cancel);
}

#[test]
fn test_create_task_request_accepts_operator_json() {
    // The exact shape an operator posts; unknown-field tolerance is not
    // required, absent-field defaults are.
    let json = r#"{
        "name": "collect uptime",
        "host_ids": ["web-01", "web-02"],
        "command": "uptime",
        "timeout_seconds": 15,
        "priority": "high",
        "created_by": "alice"
    }"#;
    let req: CreateTaskRequest = serde_json::from_str(json).unwrap();
    assert_eq!(req.host_ids.len(), 2);
    assert_eq!(req.priority, crate::model::TaskPriority::High);
    assert_eq!(req.timeout_seconds, 15);
}
