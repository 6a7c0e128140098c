//! Utility functions for the fleet command system
//!
//! Common helpers used across the agent and server components: timestamps,
//! identifier validation, and the command deny-list shared by both sides so
//! an unsafe command is rejected before it ever reaches an agent.

use std::time::{SystemTime, UNIX_EPOCH};

/// Literal substrings (matched case-insensitively) that make a command
/// unconditionally unsafe to dispatch.
const DENIED_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "format",
    "del /f /s /q",
    "shutdown",
    "reboot",
    "halt",
    "mkfs",
    "dd if=",
];

/// Check a command against the deny-list.
///
/// Returns the offending pattern when the command is unsafe. Both the server
/// (at task creation) and the agent (before execution) apply this check, so
/// a denied command is rejected fail-closed on whichever side sees it first.
pub fn denied_command_pattern(command: &str) -> Option<&'static str> {
    let lowered = command.to_lowercase();
    DENIED_COMMAND_PATTERNS
        .iter()
        .find(|pattern| lowered.contains(&pattern.to_lowercase()))
        .copied()
}

/// Validate host ID format
///
/// Host IDs must contain only alphanumeric characters, hyphens, dots, and
/// underscores. They must not be empty and should be reasonable in length.
pub fn validate_host_id(host_id: &str) -> crate::Result<()> {
    if host_id.is_empty() {
        return Err(crate::ControlError::Validation("Host ID cannot be empty".to_string()).into());
    }

    if host_id.len() > 64 {
        return Err(crate::ControlError::Validation(
            "Host ID cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !host_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(crate::ControlError::Validation(
            "Host ID can only contain alphanumeric characters, hyphens, dots, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

/// Validate a task name supplied by an operator.
pub fn validate_task_name(name: &str) -> crate::Result<()> {
    if name.trim().is_empty() {
        return Err(
            crate::ControlError::Validation("Task name cannot be empty".to_string()).into(),
        );
    }
    if name.len() > 255 {
        return Err(crate::ControlError::Validation(
            "Task name cannot be longer than 255 characters".to_string(),
        )
        .into());
    }
    Ok(())
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert a unix-seconds timestamp to an RFC 3339 string for operator output.
pub fn timestamp_to_rfc3339(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Today's date in `YYYY-MM-DD`, used as the statistics rollup key.
pub fn today_date_key() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_commands_are_caught() {
        assert_eq!(denied_command_pattern("rm -rf /"), Some("rm -rf /"));
        assert_eq!(denied_command_pattern("sudo RM -RF / --yes"), Some("rm -rf /"));
        assert_eq!(denied_command_pattern("shutdown -h now"), Some("shutdown"));
        assert_eq!(denied_command_pattern("echo hi && reboot"), Some("reboot"));
        assert_eq!(denied_command_pattern("mkfs.ext4 /dev/sda1"), Some("mkfs"));
    }

    #[test]
    fn test_safe_commands_pass() {
        assert_eq!(denied_command_pattern("echo hi"), None);
        assert_eq!(denied_command_pattern("ls -la /tmp"), None);
        assert_eq!(denied_command_pattern("systemctl status nginx"), None);
    }

    #[test]
    fn test_host_id_validation() {
        assert!(validate_host_id("web-01.prod_eu").is_ok());
        assert!(validate_host_id("").is_err());
        assert!(validate_host_id("has space").is_err());
        assert!(validate_host_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_task_name_validation() {
        assert!(validate_task_name("deploy nginx").is_ok());
        assert!(validate_task_name("   ").is_err());
        assert!(validate_task_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_timestamp_formatting() {
        let rendered = timestamp_to_rfc3339(0);
        assert!(rendered.starts_with("1970-01-01"));
    }
}
