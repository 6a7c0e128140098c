//! End-to-end lifecycle tests against a real database
//!
//! These drive the engine the way the dispatcher and API do: create, start,
//! feed results in, and assert on the persisted task/command/result rows.

use super::fixtures::{approve_host, create_task, harness};
use crate::database::{db_commands, db_results, db_tasks};
use crate::lifecycle::{DISCONNECT_ERROR_MSG, TIMEOUT_ERROR_MSG};
use shared::model::{CommandHostStatus, CommandStatus, TaskStatus};
use shared::protocol::CommandResult;
use shared::utils::current_timestamp;
use shared::ControlError;

fn result_frame(
    command_id: &str,
    host_id: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> CommandResult {
    let now = current_timestamp();
    CommandResult {
        command_id: command_id.to_string(),
        host_id: host_id.to_string(),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
        started_at: Some(now - 1),
        finished_at: Some(now),
        error_message: None,
    }
}

#[tokio::test]
async fn test_happy_path_single_host() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "echo hi", 5).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.total_hosts, 1);

    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;
    assert_eq!(sent.len(), 1);

    h.lifecycle
        .handle_command_result(&result_frame(&sent[0], "h1", 0, "hi\n", ""))
        .await
        .unwrap();

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();

    let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_hosts, 1);
    assert_eq!(task.failed_hosts, 0);
    assert!(task.finished_at.is_some());

    let result = db_results::get_result(conn, &sent[0], "h1").unwrap().unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(db_results::result_count(conn, &sent[0]).unwrap(), 1);
}

#[tokio::test]
async fn test_partial_failure_marks_task_failed() {
    let h = harness().await;
    approve_host(&h, "h1").await;
    approve_host(&h, "h2").await;

    let task = create_task(&h, &["h1", "h2"], "do-it", 30).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();

    let sent = h.sender.sent.lock().await.clone();
    assert_eq!(sent.len(), 2);
    let (c1, c2) = (&sent[0], &sent[1]);

    h.lifecycle
        .handle_command_result(&result_frame(&c1.command_id, &c1.host_id, 0, "ok", ""))
        .await
        .unwrap();
    h.lifecycle
        .handle_command_result(&result_frame(&c2.command_id, &c2.host_id, 2, "", "boom"))
        .await
        .unwrap();

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();

    let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.completed_hosts, 1);
    assert_eq!(task.failed_hosts, 1);
    assert!(task.completed_hosts + task.failed_hosts <= task.total_hosts);

    let ok = db_commands::get_command_host(conn, &c1.command_id, &c1.host_id)
        .unwrap()
        .unwrap();
    assert_eq!(ok.status, CommandHostStatus::Completed);
    let bad = db_commands::get_command_host(conn, &c2.command_id, &c2.host_id)
        .unwrap()
        .unwrap();
    assert_eq!(bad.status, CommandHostStatus::ExecFailed);
}

#[tokio::test]
async fn test_result_handling_is_idempotent() {
    let h = harness().await;
    approve_host(&h, "h1").await;
    let task = create_task(&h, &["h1"], "echo hi", 5).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;

    let frame = result_frame(&sent[0], "h1", 0, "hi", "");
    h.lifecycle.handle_command_result(&frame).await.unwrap();
    h.lifecycle.handle_command_result(&frame).await.unwrap();

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_hosts, 1);
    assert_eq!(db_results::result_count(conn, &sent[0]).unwrap(), 1);
}

#[tokio::test]
async fn test_unsafe_command_is_rejected_fail_closed() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let err = h
        .lifecycle
        .create_task(shared::api::CreateTaskRequest {
            name: "danger".to_string(),
            description: String::new(),
            host_ids: vec!["h1".to_string()],
            command: "rm -rf /".to_string(),
            parameters: Default::default(),
            timeout_seconds: 5,
            priority: Default::default(),
            created_by: "tests".to_string(),
        })
        .await;
    assert!(matches!(err, Err(ControlError::Validation(_))));

    // Nothing was persisted and nothing was sent.
    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let (tasks, total) = db_tasks::list_tasks(conn, 1, 10, None, None).unwrap();
    assert!(tasks.is_empty());
    assert_eq!(total, 0);
    drop(db);
    assert!(h.sender.sent_command_ids().await.is_empty());
}

#[tokio::test]
async fn test_create_task_rejects_unapproved_host() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    // h2 registered but never approved: creation fails with no partial rows.
    h.registry
        .register(&shared::protocol::HostInfo {
            id: "h2".to_string(),
            hostname: "h2.test".to_string(),
            ip: "10.0.0.2".to_string(),
            os: "linux".to_string(),
            tags: Default::default(),
            last_seen: current_timestamp(),
        })
        .await
        .unwrap();

    let err = h
        .lifecycle
        .create_task(shared::api::CreateTaskRequest {
            name: "mixed targets".to_string(),
            description: String::new(),
            host_ids: vec!["h1".to_string(), "h2".to_string()],
            command: "uptime".to_string(),
            parameters: Default::default(),
            timeout_seconds: 5,
            priority: Default::default(),
            created_by: "tests".to_string(),
        })
        .await;
    assert!(matches!(err, Err(ControlError::Validation(_))));

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let (tasks, _) = db_tasks::list_tasks(conn, 1, 10, None, None).unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_start_requires_pending_status() {
    let h = harness().await;
    approve_host(&h, "h1").await;
    let task = create_task(&h, &["h1"], "echo hi", 5).await;

    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let err = h.lifecycle.start_task(&task.task_id).await;
    assert!(matches!(err, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_dispatch_failure_affects_only_that_command() {
    let h = harness().await;
    approve_host(&h, "h1").await;
    approve_host(&h, "h2").await;
    h.sender.fail_host("h2").await;

    let task = create_task(&h, &["h1", "h2"], "uptime", 30).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let commands = db_commands::commands_for_task(conn, &task.task_id).unwrap();

    let h1_cmd = commands.iter().find(|c| c.host_id == "h1").unwrap();
    let h2_cmd = commands.iter().find(|c| c.host_id == "h2").unwrap();
    // The healthy host's command is untouched, the failed one is terminal.
    assert_eq!(h1_cmd.status, CommandStatus::Pending);
    assert_eq!(h2_cmd.status, CommandStatus::Failed);
    assert!(h2_cmd.error_msg.contains("h2"));
    assert!(h2_cmd.finished_at.is_some());

    let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.failed_hosts, 1);
}

#[tokio::test]
async fn test_cancel_task_cascades_and_signals_agents() {
    let h = harness().await;
    approve_host(&h, "h1").await;
    approve_host(&h, "h2").await;

    let task = create_task(&h, &["h1", "h2"], "sleep 100", 300).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent.lock().await.clone();

    // h1 reports running before the cancel.
    h.lifecycle
        .handle_command_result(&CommandResult {
            command_id: sent[0].command_id.clone(),
            host_id: sent[0].host_id.clone(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Some(current_timestamp()),
            finished_at: None,
            error_message: None,
        })
        .await
        .unwrap();

    h.lifecycle.cancel_task(&task.task_id).await.unwrap();

    {
        let mut db = h.database.lock().await;
        let conn = db.get_connection().unwrap();
        let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.finished_at.is_some());

        for command in db_commands::commands_for_task(conn, &task.task_id).unwrap() {
            assert_eq!(command.status, CommandStatus::Canceled);
        }
    }

    // Best-effort cancel went out for both commands.
    let cancels = h.sender.cancels.lock().await.clone();
    assert_eq!(cancels.len(), 2);

    // A second cancel is a conflict.
    let err = h.lifecycle.cancel_task(&task.task_id).await;
    assert!(matches!(err, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_agent_disconnect_fails_running_commands() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "sleep 50", 300).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;

    // The agent reported the command running, then its stream dropped.
    h.lifecycle
        .handle_command_result(&CommandResult {
            command_id: sent[0].clone(),
            host_id: "h1".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Some(current_timestamp()),
            finished_at: None,
            error_message: None,
        })
        .await
        .unwrap();

    h.lifecycle.handle_agent_disconnection("h1").await.unwrap();
    // Disconnect writes flow through the batch pipeline.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    {
        let mut db = h.database.lock().await;
        let conn = db.get_connection().unwrap();
        let command = db_commands::get_command(conn, &sent[0]).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert_eq!(command.error_msg, DISCONNECT_ERROR_MSG);

        let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    // A result arriving after the reconnect does not revive the command.
    h.lifecycle
        .handle_command_result(&result_frame(&sent[0], "h1", 0, "late", ""))
        .await
        .unwrap();
    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let command = db_commands::get_command(conn, &sent[0]).unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
}

#[tokio::test]
async fn test_retry_resets_only_execution_fields() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "flaky-cmd", 30).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;

    h.lifecycle
        .handle_command_result(&result_frame(&sent[0], "h1", 7, "", "transient"))
        .await
        .unwrap();

    h.lifecycle.retry_failed_command(&sent[0]).await.unwrap();

    {
        let mut db = h.database.lock().await;
        let conn = db.get_connection().unwrap();

        let command = db_commands::get_command(conn, &sent[0]).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert!(command.stdout.is_empty());
        assert!(command.stderr.is_empty());
        assert_eq!(command.exit_code, None);
        assert_eq!(command.started_at, None);
        assert_eq!(command.finished_at, None);

        // Task shape is unchanged by the retry.
        let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
        assert_eq!(task.total_hosts, 1);
        assert_eq!(db_commands::commands_for_task(conn, &task.task_id).unwrap().len(), 1);
    }

    // The command went out again.
    assert_eq!(h.sender.sent_command_ids().await.len(), 2);

    // A completed command cannot be retried.
    h.lifecycle
        .handle_command_result(&result_frame(&sent[0], "h1", 0, "fine", ""))
        .await
        .unwrap();
    let err = h.lifecycle.retry_failed_command(&sent[0]).await;
    assert!(matches!(err, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_timeout_transition_and_error_message() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "sleep 100", 1).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;

    // Started well past its one second budget.
    h.lifecycle
        .handle_command_result(&CommandResult {
            command_id: sent[0].clone(),
            host_id: "h1".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Some(current_timestamp() - 10),
            finished_at: None,
            error_message: None,
        })
        .await
        .unwrap();

    let transitioned = h.lifecycle.handle_command_timeout(&sent[0]).await.unwrap();
    assert!(transitioned);

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let command = db_commands::get_command(conn, &sent[0]).unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Timeout);
    assert_eq!(command.error_msg, TIMEOUT_ERROR_MSG);
    assert!(command.finished_at.is_some());

    let host = db_commands::get_command_host(conn, &sent[0], "h1").unwrap().unwrap();
    assert_eq!(host.status, CommandHostStatus::Timeout);

    let task = db_tasks::get_task(conn, &task.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failed_hosts, 1);
}

#[tokio::test]
async fn test_timeout_does_not_fire_before_deadline() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "sleep 5", 3600).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;

    h.lifecycle
        .handle_command_result(&CommandResult {
            command_id: sent[0].clone(),
            host_id: "h1".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Some(current_timestamp()),
            finished_at: None,
            error_message: None,
        })
        .await
        .unwrap();

    let transitioned = h.lifecycle.handle_command_timeout(&sent[0]).await.unwrap();
    assert!(!transitioned);
}

#[tokio::test]
async fn test_statistics_rollup_counts_today() {
    let h = harness().await;
    approve_host(&h, "h1").await;

    let task = create_task(&h, &["h1"], "echo hi", 5).await;
    h.lifecycle.start_task(&task.task_id).await.unwrap();
    let sent = h.sender.sent_command_ids().await;
    h.lifecycle
        .handle_command_result(&result_frame(&sent[0], "h1", 0, "hi", ""))
        .await
        .unwrap();

    h.lifecycle.rollup_statistics().await.unwrap();

    let mut db = h.database.lock().await;
    let conn = db.get_connection().unwrap();
    let stats = crate::database::db_stats::get_statistics(
        conn,
        &shared::utils::today_date_key(),
        "daily",
    )
    .unwrap()
    .unwrap();
    assert_eq!(stats.total_tasks, 1);
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.total_commands, 1);
    assert_eq!(stats.completed_commands, 1);
}
