use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::DocSweepError;

use super::connection::{self, RelayStream};
use super::protocol::{
    AgentCommand, ClientType, CommandResultFrame, CommandStatus, Frame, MetricsSnapshot,
};

/// Receives metrics the hub forwards from agents
pub trait MetricsSink: Send + Sync {
    fn record(&self, hostname: &str, snapshot: &MetricsSnapshot);
}

/// A command the controller has sent and is waiting on
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub target_hostname: String,
    pub kind: String,
    pub status: CommandStatus,
}

struct PendingCommand {
    record: CommandRecord,
    reply: oneshot::Sender<CommandResultFrame>,
}

struct ClientInner {
    config: ControllerConfig,
    /// Writer queue of the live connection, `None` while disconnected
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending: DashMap<String, PendingCommand>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    shutdown: CancellationToken,
}

/// The controller's connection to the relay hub.
///
/// Constructed once and handed to whatever needs to talk to agents; it keeps
/// itself connected in the background and correlates `command_result` frames
/// with the commands that caused them.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("hub_url", &self.inner.config.hub_url)
            .field("connected", &self.is_connected())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl RelayClient {
    pub fn new(config: ControllerConfig, metrics_sink: Option<Arc<dyn MetricsSink>>) -> Self {
        RelayClient {
            inner: Arc::new(ClientInner {
                config,
                outbound: Mutex::new(None),
                pending: DashMap::new(),
                metrics_sink,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .outbound
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn pending_commands(&self) -> Vec<CommandRecord> {
        self.inner
            .pending
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Keep a connection to the hub until `shutdown` is called
    pub fn spawn(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn run(self) {
        let delay = Duration::from_secs(self.inner.config.reconnect_delay_secs);

        loop {
            match connection::connect_and_register(
                &self.inner.config.hub_url,
                ClientType::Controller,
                &self.inner.config.token,
                None,
            )
            .await
            {
                Ok((mut sink, stream)) => {
                    info!("Controller connected to hub at {}", self.inner.config.hub_url);

                    let (tx, mut rx) = mpsc::channel::<String>(256);
                    if let Ok(mut slot) = self.inner.outbound.lock() {
                        *slot = Some(tx);
                    }

                    let writer = tokio::spawn(async move {
                        while let Some(text) = rx.recv().await {
                            if sink.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        let _ = sink.close().await;
                    });

                    self.read_loop(stream).await;

                    if let Ok(mut slot) = self.inner.outbound.lock() {
                        *slot = None;
                    }
                    writer.abort();
                    self.abandon_pending();
                    warn!("Controller lost its hub connection");
                }
                Err(e) => {
                    warn!("Controller could not register with hub: {}", e);
                }
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("Relay client shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_loop(&self, mut stream: RelayStream) {
        loop {
            let msg = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Hub receive error: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring unreadable frame from hub: {}", e);
                return;
            }
        };

        match frame {
            Frame::CommandResult(result) => match self.inner.pending.remove(&result.command_id) {
                Some((_, pending)) => {
                    debug!(
                        "Command {} ({}) on '{}' finished: {:?}",
                        pending.record.command_id,
                        pending.record.kind,
                        pending.record.target_hostname,
                        result.status
                    );
                    let _ = pending.reply.send(result);
                }
                None => debug!("Result for unknown or expired command {}", result.command_id),
            },
            Frame::Metrics(metrics) | Frame::UpdateMetrics(metrics) => {
                let Some(hostname) = metrics.hostname.clone() else {
                    warn!("Metrics frame without hostname ignored");
                    return;
                };
                if let Some(sink) = &self.inner.metrics_sink {
                    sink.record(&hostname, &metrics.snapshot());
                }
            }
            other => debug!("Ignoring {:?} from hub", other),
        }
    }

    /// In-flight commands are not replayed after a disconnect
    fn abandon_pending(&self) {
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if self.inner.pending.remove(&id).is_some() {
                warn!("Command {} lost with the hub connection", id);
            }
        }
    }

    /// Send a command to one agent and wait for its result
    pub async fn send_command(
        &self,
        hostname: &str,
        command: AgentCommand,
    ) -> Result<CommandResultFrame, DocSweepError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let kind = command.name().to_string();
        let frame = Frame::Command(command.into_frame(command_id.clone(), Some(hostname.to_string())));
        let json = frame.to_json()?;

        let sender = self
            .inner
            .outbound
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| DocSweepError::Connectivity("not connected to the hub".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(
            command_id.clone(),
            PendingCommand {
                record: CommandRecord {
                    command_id: command_id.clone(),
                    target_hostname: hostname.to_string(),
                    kind: kind.clone(),
                    status: CommandStatus::Pending,
                },
                reply: reply_tx,
            },
        );

        if sender.send(json).await.is_err() {
            self.inner.pending.remove(&command_id);
            return Err(DocSweepError::Connectivity(
                "hub connection closed while sending".to_string(),
            ));
        }
        if let Some(mut pending) = self.inner.pending.get_mut(&command_id) {
            pending.record.status = CommandStatus::Running;
        }

        let timeout = Duration::from_secs(self.inner.config.command_timeout_secs);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(DocSweepError::Connectivity(format!(
                "{} on '{}' lost with the hub connection",
                kind, hostname
            ))),
            Err(_) => {
                self.inner.pending.remove(&command_id);
                error!("{} on '{}' timed out after {:?}", kind, hostname, timeout);
                Err(DocSweepError::Connectivity(format!(
                    "{} on '{}' timed out",
                    kind, hostname
                )))
            }
        }
    }
}
