//! Agent dispatcher: live command streams and per-host pending buffers
//!
//! Maintains the mapping from host id to the outbound half of that agent's
//! command stream, plus a buffer of commands addressed to hosts that are
//! currently offline. One lock guards both maps so stream registration and
//! buffer flush are atomic: commands buffered before a reconnect are always
//! delivered before commands sent after it.
//!
//! The WebSocket task owns the socket itself; the dispatcher only holds the
//! channel feeding that task. Incoming frames are routed here and handed to
//! the lifecycle engine.

use crate::lifecycle::{CommandSender, LifecycleEngine};
use async_trait::async_trait;
use shared::protocol::{CommandCancel, CommandContent, CommandMessage};
use shared::ControlError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Capacity of each per-agent outbound channel.
const STREAM_CHANNEL_CAPACITY: usize = 64;

struct DispatcherState {
    /// Outbound channel per connected host.
    streams: HashMap<String, mpsc::Sender<CommandMessage>>,
    /// Commands awaiting delivery to offline hosts, in enqueue order.
    buffers: HashMap<String, Vec<CommandContent>>,
}

/// Server-side dispatcher. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct AgentDispatcher {
    state: Arc<Mutex<DispatcherState>>,
    /// Set once at startup, after the lifecycle engine (which itself needs
    /// the dispatcher as its sender) has been constructed.
    lifecycle: Arc<OnceCell<Arc<LifecycleEngine>>>,
}

impl AgentDispatcher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatcherState {
                streams: HashMap::new(),
                buffers: HashMap::new(),
            })),
            lifecycle: Arc::new(OnceCell::new()),
        }
    }

    /// Wire in the lifecycle engine. Called once at startup; the dispatcher
    /// and the engine reference each other through this one-way seam.
    pub fn set_lifecycle(&self, lifecycle: Arc<LifecycleEngine>) {
        if self.lifecycle.set(lifecycle).is_err() {
            warn!("Lifecycle engine was already wired into the dispatcher");
        }
    }

    fn lifecycle(&self) -> Option<&Arc<LifecycleEngine>> {
        self.lifecycle.get()
    }

    /// Register a fresh stream for a host and flush its pending buffer into
    /// the new channel, under one lock acquisition. Returns the buffered
    /// commands count.
    pub async fn register_stream(
        &self,
        host_id: &str,
        outbound: mpsc::Sender<CommandMessage>,
    ) -> usize {
        let mut state = self.state.lock().await;

        // Holding the lock across registration and flush preserves the
        // buffered-before-new ordering guarantee.
        state.streams.insert(host_id.to_string(), outbound.clone());
        let buffered = state.buffers.remove(host_id).unwrap_or_default();
        let count = buffered.len();

        for content in buffered {
            if let Err(e) = outbound.try_send(CommandMessage::Content(content)) {
                warn!(host_id = %host_id, error = %e, "Buffered command lost on flush");
            }
        }

        if count > 0 {
            info!(host_id = %host_id, flushed = count, "Flushed buffered commands on connect");
        } else {
            debug!(host_id = %host_id, "Agent stream registered");
        }
        count
    }

    /// Remove a host's stream entry, if it is still the given one. Returns
    /// whether an entry was removed.
    pub async fn unregister_stream(&self, host_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.streams.remove(host_id).is_some();
        if removed {
            info!(host_id = %host_id, "Agent stream unregistered");
        }
        removed
    }

    /// Whether a host currently has a live stream.
    pub async fn is_connected(&self, host_id: &str) -> bool {
        self.state.lock().await.streams.contains_key(host_id)
    }

    /// Number of currently connected agents.
    pub async fn connected_count(&self) -> usize {
        self.state.lock().await.streams.len()
    }

    /// Number of commands buffered for a host.
    pub async fn buffered_count(&self, host_id: &str) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .get(host_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Route one frame received from an agent stream.
    ///
    /// Result frames go to the lifecycle engine. Content frames are the
    /// agent's heartbeat/binding pings; the stream task has already bound
    /// the host id, so they need no action here.
    pub async fn handle_incoming(&self, message: CommandMessage) {
        match message {
            CommandMessage::Result(result) => {
                let Some(lifecycle) = self.lifecycle() else {
                    warn!("Result received before lifecycle engine was wired");
                    return;
                };
                if let Err(e) = lifecycle.handle_command_result(&result).await {
                    warn!(
                        command_id = %result.command_id,
                        host_id = %result.host_id,
                        error = %e,
                        "Failed to process command result"
                    );
                }
            }
            CommandMessage::Content(content) => {
                debug!(host_id = %content.host_id, "Heartbeat received");
            }
            CommandMessage::Cancel(cancel) => {
                // Agents do not originate cancels; ignore defensively.
                debug!(command_id = %cancel.command_id, "Unexpected cancel frame from agent");
            }
        }
    }

    /// The stream for a host errored or reached EOF: drop the entry and
    /// fail its in-flight commands.
    pub async fn handle_stream_closed(&self, host_id: &str) {
        self.unregister_stream(host_id).await;
        if let Some(lifecycle) = self.lifecycle() {
            if let Err(e) = lifecycle.handle_agent_disconnection(host_id).await {
                warn!(host_id = %host_id, error = %e, "Disconnect handling failed");
            }
        }
    }
}

impl Default for AgentDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSender for AgentDispatcher {
    /// Deliver a command now if the host is connected, otherwise buffer it
    /// for the next (re)connect. A transport error tears the stream entry
    /// down, buffers the command, and is reported to the caller.
    async fn send(&self, host_id: &str, content: CommandContent) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;

        if let Some(outbound) = state.streams.get(host_id).cloned() {
            match outbound.try_send(CommandMessage::Content(content.clone())) {
                Ok(()) => {
                    debug!(
                        host_id = %host_id,
                        command_id = %content.command_id,
                        "Command sent on live stream"
                    );
                    Ok(())
                }
                Err(e) => {
                    // The stream task is gone or wedged; treat it as dead.
                    state.streams.remove(host_id);
                    state
                        .buffers
                        .entry(host_id.to_string())
                        .or_default()
                        .push(content);
                    warn!(host_id = %host_id, error = %e, "Stream write failed, command buffered");
                    Err(ControlError::Transport(format!(
                        "Stream write to {} failed: {}",
                        host_id, e
                    )))
                }
            }
        } else {
            // Accepted for later delivery; flushed in order on reconnect.
            state
                .buffers
                .entry(host_id.to_string())
                .or_default()
                .push(content);
            debug!(host_id = %host_id, "Host offline, command buffered");
            Ok(())
        }
    }

    /// Best-effort cancel: drop any buffered copy of the command, and if
    /// the host is connected, forward a cancel frame.
    async fn send_cancel(&self, host_id: &str, command_id: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;

        if let Some(buffer) = state.buffers.get_mut(host_id) {
            buffer.retain(|content| content.command_id != command_id);
            if buffer.is_empty() {
                state.buffers.remove(host_id);
            }
        }

        if let Some(outbound) = state.streams.get(host_id) {
            outbound
                .try_send(CommandMessage::Cancel(CommandCancel {
                    command_id: command_id.to_string(),
                    host_id: host_id.to_string(),
                }))
                .map_err(|e| {
                    ControlError::Transport(format!("Cancel to {} failed: {}", host_id, e))
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::utils::current_timestamp;

    fn content(command_id: &str, host_id: &str) -> CommandContent {
        CommandContent {
            command_id: command_id.to_string(),
            host_id: host_id.to_string(),
            command: "echo hi".to_string(),
            parameters: HashMap::new(),
            timeout_seconds: 5,
            created_at: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_offline_send_buffers_in_order() {
        let dispatcher = AgentDispatcher::new();

        dispatcher.send("h1", content("c1", "h1")).await.unwrap();
        dispatcher.send("h1", content("c2", "h1")).await.unwrap();
        assert_eq!(dispatcher.buffered_count("h1").await, 2);
        assert!(!dispatcher.is_connected("h1").await);

        // Connecting flushes the buffer into the stream channel in order.
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let flushed = dispatcher.register_stream("h1", tx).await;
        assert_eq!(flushed, 2);
        assert_eq!(dispatcher.buffered_count("h1").await, 0);

        match rx.recv().await.unwrap() {
            CommandMessage::Content(c) => assert_eq!(c.command_id, "c1"),
            other => panic!("unexpected frame: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            CommandMessage::Content(c) => assert_eq!(c.command_id, "c2"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_live_send_goes_straight_to_stream() {
        let dispatcher = AgentDispatcher::new();
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        dispatcher.register_stream("h1", tx).await;

        dispatcher.send("h1", content("c1", "h1")).await.unwrap();
        match rx.recv().await.unwrap() {
            CommandMessage::Content(c) => assert_eq!(c.command_id, "c1"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(dispatcher.buffered_count("h1").await, 0);
    }

    #[tokio::test]
    async fn test_failed_stream_write_buffers_and_errors() {
        let dispatcher = AgentDispatcher::new();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        dispatcher.register_stream("h1", tx).await;
        drop(rx); // Stream task is gone; the next send must fail.

        let err = dispatcher.send("h1", content("c1", "h1")).await;
        assert!(matches!(err, Err(ControlError::Transport(_))));

        // Stream entry torn down, command preserved for the reconnect.
        assert!(!dispatcher.is_connected("h1").await);
        assert_eq!(dispatcher.buffered_count("h1").await, 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_buffered_command() {
        let dispatcher = AgentDispatcher::new();
        dispatcher.send("h1", content("c1", "h1")).await.unwrap();
        dispatcher.send("h1", content("c2", "h1")).await.unwrap();

        dispatcher.send_cancel("h1", "c1").await.unwrap();
        assert_eq!(dispatcher.buffered_count("h1").await, 1);

        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        dispatcher.register_stream("h1", tx).await;
        match rx.recv().await.unwrap() {
            CommandMessage::Content(c) => assert_eq!(c.command_id, "c2"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_live_stream() {
        let dispatcher = AgentDispatcher::new();
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        dispatcher.register_stream("h1", tx).await;

        dispatcher.send_cancel("h1", "c9").await.unwrap();
        match rx.recv().await.unwrap() {
            CommandMessage::Cancel(c) => assert_eq!(c.command_id, "c9"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stream() {
        let dispatcher = AgentDispatcher::new();
        let (tx1, _rx1) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (tx2, mut rx2) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        dispatcher.register_stream("h1", tx1).await;
        dispatcher.register_stream("h1", tx2).await;
        assert_eq!(dispatcher.connected_count().await, 1);

        dispatcher.send("h1", content("c1", "h1")).await.unwrap();
        match rx2.recv().await.unwrap() {
            CommandMessage::Content(c) => assert_eq!(c.command_id, "c1"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
