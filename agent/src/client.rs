//! Server communication for the fleet agent
//!
//! Owns the three legs of the agent/server relationship: one-shot
//! registration retried until accepted, the periodic status report (which
//! re-enters registration when the server stops recognizing the host), and
//! the persistent WebSocket command stream with its receive-execute-reply
//! loop. Stream loss triggers reconnection after the configured retry
//! interval; commands received on the stream execute concurrently.

use crate::executor::CommandExecutor;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use shared::api::{
    endpoints, headers, HostStatusResponse, RegisterRequest, RegisterResponse, StatusReportRequest,
};
use shared::config::AgentConfig;
use shared::protocol::{CommandContent, CommandMessage, CommandResult};
use shared::utils::current_timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Capacity of the outbound result channel feeding the stream writer.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Client half of the agent: registration, status reports and the command
/// stream. Cloning shares the registered flag and the executor.
#[derive(Clone)]
pub struct AgentClient {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
    executor: CommandExecutor,
    /// Cleared when the server answers "not approved"; the report loop
    /// re-registers before the next report.
    registered: Arc<AtomicBool>,
}

impl AgentClient {
    pub fn new(config: AgentConfig, executor: CommandExecutor) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            http,
            executor,
            registered: Arc::new(AtomicBool::new(false)),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    /// The WebSocket endpoint derived from the configured server URL.
    fn stream_url(&self) -> String {
        let base = self.config.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", base)
        };
        format!("{}{}", ws_base, endpoints::COMMAND_STREAM)
    }

    fn with_api_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            request
        } else {
            request.header(headers::API_KEY, &self.config.api_key)
        }
    }

    /// One registration attempt. Returns whether the server accepted it.
    pub async fn register_once(&self) -> Result<bool> {
        let info = crate::status::collect_host_info(&self.config);
        let response = self
            .with_api_key(self.http.post(self.api_url(endpoints::HOST_REGISTER)))
            .json(&RegisterRequest { host: info })
            .send()
            .await
            .context("Registration request failed")?
            .json::<RegisterResponse>()
            .await
            .context("Malformed registration response")?;

        if response.success {
            info!(assigned_id = %response.assigned_id, "Registered with server");
            self.registered.store(true, Ordering::Relaxed);
        } else {
            warn!(error = %response.error_message, "Registration not accepted");
        }
        Ok(response.success)
    }

    /// Retry registration at the configured cadence until it succeeds or
    /// shutdown is requested.
    pub async fn register_until_success(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let retry = Duration::from_secs(self.config.retry_interval_seconds);
        loop {
            match self.register_once().await {
                Ok(true) => return,
                Ok(false) => debug!("Registration pending approval, retrying"),
                Err(e) => warn!("Registration attempt failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    /// Periodic status reporting, until shutdown. A "not approved" answer
    /// clears the registered flag and re-enters registration.
    pub async fn report_status_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.config.report_interval_seconds.max(1),
        ));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.registered.load(Ordering::Relaxed) {
                        if !matches!(self.register_once().await, Ok(true)) {
                            continue;
                        }
                    }
                    if let Err(e) = self.report_status_once().await {
                        warn!("Status report failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Status report loop received shutdown signal");
                    return;
                }
            }
        }
    }

    async fn report_status_once(&self) -> Result<()> {
        let status = crate::status::collect_host_status(&self.config);
        let response = self
            .with_api_key(self.http.post(self.api_url(endpoints::HOST_STATUS)))
            .json(&StatusReportRequest { status })
            .send()
            .await
            .context("Status report request failed")?
            .json::<HostStatusResponse>()
            .await
            .context("Malformed status response")?;

        if !response.success {
            warn!(message = %response.message, "Status report rejected");
            if response.message.contains("not approved") {
                // Re-enter registration on the next tick.
                self.registered.store(false, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Maintain the command stream: connect, serve it until it drops, wait
    /// the retry interval, reconnect. Runs until shutdown.
    pub async fn run_command_stream(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let retry = Duration::from_secs(self.config.retry_interval_seconds);
        loop {
            match self.connect_and_serve(&mut shutdown_rx).await {
                Ok(ServeEnd::Shutdown) => {
                    info!("Command stream loop received shutdown signal");
                    return;
                }
                Ok(ServeEnd::Disconnected) => {
                    warn!("Command stream lost, reconnecting after {:?}", retry);
                }
                Err(e) => {
                    warn!("Command stream connect failed: {}, retrying after {:?}", e, retry);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    async fn connect_and_serve(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ServeEnd> {
        let mut request = self
            .stream_url()
            .into_client_request()
            .context("Invalid stream URL")?;
        if !self.config.api_key.is_empty() {
            request.headers_mut().insert(
                headers::API_KEY,
                self.config
                    .api_key
                    .parse()
                    .context("API key is not a valid header value")?,
            );
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;
        info!("Command stream connected");

        let (mut sink, mut stream) = socket.split();

        // First frame binds this stream to our host id.
        let binding =
            CommandMessage::Content(CommandContent::heartbeat(&self.config.host_id, current_timestamp()));
        sink.send(Message::Text(binding.to_frame()?.into()))
            .await
            .context("Failed to send binding frame")?;

        // Results (and periodic heartbeats) funnel through one writer task.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<CommandMessage>(OUTBOUND_CHANNEL_CAPACITY);
        let heartbeat_interval = Duration::from_secs(self.config.report_interval_seconds.max(1));
        let host_id = self.config.host_id.clone();
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await; // the binding frame was the first beat
            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        CommandMessage::Content(CommandContent::heartbeat(&host_id, current_timestamp()))
                    }
                };
                let frame = match message.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Frame serialization failed: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        // Receive-execute-reply until the stream drops or shutdown.
        let end = loop {
            tokio::select! {
                received = stream.next() => match received {
                    Some(Ok(Message::Text(text))) => {
                        match CommandMessage::from_frame(text.as_str()) {
                            Ok(message) => self.dispatch_frame(message, &outbound_tx).await,
                            Err(e) => warn!("Malformed frame from server: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break ServeEnd::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Stream read error: {}", e);
                        break ServeEnd::Disconnected;
                    }
                },
                _ = shutdown_rx.recv() => break ServeEnd::Shutdown,
            }
        };

        writer.abort();
        Ok(end)
    }

    /// Route one frame received from the server.
    async fn dispatch_frame(
        &self,
        message: CommandMessage,
        outbound_tx: &mpsc::Sender<CommandMessage>,
    ) {
        match message {
            CommandMessage::Content(content) if content.is_executable() => {
                info!(
                    command_id = %content.command_id,
                    timeout_secs = content.timeout_seconds,
                    "Command received"
                );
                // Commands run concurrently; each sends its own result back.
                let executor = self.executor.clone();
                let outbound = outbound_tx.clone();
                let host_id = self.config.host_id.clone();
                tokio::spawn(async move {
                    let outcome = executor
                        .execute(&content.command_id, &content.command, content.timeout_seconds)
                        .await;
                    let result = CommandMessage::Result(CommandResult {
                        command_id: content.command_id.clone(),
                        host_id,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        exit_code: outcome.exit_code,
                        started_at: Some(outcome.started_at),
                        finished_at: Some(outcome.finished_at),
                        error_message: outcome.error,
                    });
                    if outbound.send(result).await.is_err() {
                        warn!(
                            command_id = %content.command_id,
                            "Stream gone before result could be sent"
                        );
                    }
                });
            }
            CommandMessage::Content(_) => {
                // Server-side heartbeat or empty content frame.
            }
            CommandMessage::Cancel(cancel) => {
                let canceled = self.executor.cancel(&cancel.command_id).await;
                info!(
                    command_id = %cancel.command_id,
                    canceled = canceled,
                    "Cancel received"
                );
            }
            CommandMessage::Result(result) => {
                debug!(command_id = %result.command_id, "Unexpected result frame from server");
            }
        }
    }
}

/// Why `connect_and_serve` returned.
enum ServeEnd {
    Disconnected,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(server_url: &str) -> AgentClient {
        let config = AgentConfig::from_toml(&format!(
            r#"
host_id = "web-01"
server_url = "{}"
"#,
            server_url
        ))
        .unwrap();
        AgentClient::new(config, CommandExecutor::new(300, 1024)).unwrap()
    }

    #[test]
    fn test_stream_url_derivation() {
        let client = client_with("http://127.0.0.1:8081");
        assert_eq!(
            client.stream_url(),
            "ws://127.0.0.1:8081/api/v1/hosts/stream"
        );

        let client = client_with("https://control.example.com/");
        assert_eq!(
            client.stream_url(),
            "wss://control.example.com/api/v1/hosts/stream"
        );
    }

    #[test]
    fn test_api_url_joins_without_double_slash() {
        let client = client_with("http://127.0.0.1:8081/");
        assert_eq!(
            client.api_url(endpoints::HOST_REGISTER),
            "http://127.0.0.1:8081/api/v1/hosts/register"
        );
    }
}
