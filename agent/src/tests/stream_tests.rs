//! Command stream integration tests
//!
//! Runs the real client against an in-process WebSocket endpoint playing
//! the server's role, exercising the receive-execute-reply loop end to end:
//! binding frame, command execution, result delivery and cancellation.

use crate::client::AgentClient;
use crate::executor::{CommandExecutor, EXIT_CANCELED};
use futures_util::{SinkExt, StreamExt};
use shared::config::AgentConfig;
use shared::protocol::{CommandCancel, CommandContent, CommandMessage};
use shared::utils::current_timestamp;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

fn agent_config(port: u16) -> AgentConfig {
    AgentConfig::from_toml(&format!(
        r#"
host_id = "web-01"
server_url = "http://127.0.0.1:{}"
retry_interval_seconds = 1
report_interval_seconds = 60
"#,
        port
    ))
    .unwrap()
}

/// Accept one WebSocket connection and return its message halves.
async fn accept_stream(
    listener: TcpListener,
) -> (
    impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
) {
    let (tcp, _) = listener.accept().await.unwrap();
    let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
    let (sink, stream) = ws.split();
    (sink, stream)
}

/// Read frames until a non-heartbeat message arrives.
async fn next_message<S>(stream: &mut S) -> CommandMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let frame = timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("stream error");
        if let Message::Text(text) = frame {
            let message = CommandMessage::from_frame(text.as_str()).unwrap();
            match &message {
                CommandMessage::Content(content) if !content.is_executable() => continue,
                _ => return message,
            }
        }
    }
}

fn command_frame(command_id: &str, command: &str, timeout_seconds: u64) -> Message {
    let message = CommandMessage::Content(CommandContent {
        command_id: command_id.to_string(),
        host_id: "web-01".to_string(),
        command: command.to_string(),
        parameters: HashMap::new(),
        timeout_seconds,
        created_at: current_timestamp(),
    });
    Message::Text(message.to_frame().unwrap().into())
}

#[tokio::test]
async fn test_receive_execute_reply_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = AgentClient::new(agent_config(port), CommandExecutor::new(300, 1 << 20)).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let stream_task = {
        let client = client.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { client.run_command_stream(rx).await })
    };

    let (mut sink, mut stream) = accept_stream(listener).await;

    // The first frame binds the agent's host id.
    let binding = timeout(Duration::from_secs(10), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match binding {
        Message::Text(text) => {
            let message = CommandMessage::from_frame(text.as_str()).unwrap();
            assert_eq!(message.host_id(), "web-01");
        }
        other => panic!("expected text binding frame, got {:?}", other),
    }

    // Dispatch a command and collect its result.
    sink.send(command_frame("c1", "echo streamed", 10)).await.unwrap();
    match next_message(&mut stream).await {
        CommandMessage::Result(result) => {
            assert_eq!(result.command_id, "c1");
            assert_eq!(result.host_id, "web-01");
            assert_eq!(result.exit_code, 0);
            assert_eq!(result.stdout.trim(), "streamed");
            assert!(result.finished_at.is_some());
        }
        other => panic!("expected result frame, got {:?}", other),
    }

    shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), stream_task).await;
}

#[tokio::test]
async fn test_concurrent_commands_and_cancel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = AgentClient::new(agent_config(port), CommandExecutor::new(300, 1 << 20)).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let stream_task = {
        let client = client.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { client.run_command_stream(rx).await })
    };

    let (mut sink, mut stream) = accept_stream(listener).await;
    // Skip the binding frame.
    let _ = timeout(Duration::from_secs(10), stream.next()).await.unwrap();

    // A long command followed by a short one: the short one must not wait
    // for the long one.
    sink.send(command_frame("slow", "sleep 30", 60)).await.unwrap();
    sink.send(command_frame("fast", "echo quick", 10)).await.unwrap();

    match next_message(&mut stream).await {
        CommandMessage::Result(result) => {
            assert_eq!(result.command_id, "fast");
            assert_eq!(result.stdout.trim(), "quick");
        }
        other => panic!("expected fast result, got {:?}", other),
    }

    // Cancel the long one; its result reports the cancellation.
    let cancel = CommandMessage::Cancel(CommandCancel {
        command_id: "slow".to_string(),
        host_id: "web-01".to_string(),
    });
    sink.send(Message::Text(cancel.to_frame().unwrap().into()))
        .await
        .unwrap();

    match next_message(&mut stream).await {
        CommandMessage::Result(result) => {
            assert_eq!(result.command_id, "slow");
            assert_eq!(result.exit_code, EXIT_CANCELED);
            assert_eq!(result.error_message.as_deref(), Some("Command canceled"));
        }
        other => panic!("expected canceled result, got {:?}", other),
    }

    shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), stream_task).await;
}

#[tokio::test]
async fn test_denied_command_reports_refusal_not_execution() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = AgentClient::new(agent_config(port), CommandExecutor::new(300, 1 << 20)).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let stream_task = {
        let client = client.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { client.run_command_stream(rx).await })
    };

    let (mut sink, mut stream) = accept_stream(listener).await;
    let _ = timeout(Duration::from_secs(10), stream.next()).await.unwrap();

    sink.send(command_frame("bad", "shutdown -h now", 10)).await.unwrap();

    match next_message(&mut stream).await {
        CommandMessage::Result(result) => {
            assert_eq!(result.command_id, "bad");
            assert_eq!(result.exit_code, -1);
            assert!(result
                .error_message
                .unwrap()
                .contains("safety policy"));
        }
        other => panic!("expected refusal result, got {:?}", other),
    }

    shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), stream_task).await;
}
