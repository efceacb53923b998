//! Endpoint-side runtime: holds one hub connection, reports host metrics on a
//! timer and executes filesystem commands routed to this host.

pub mod commands;
pub mod metrics;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::DocSweepError;
use crate::relay::connection::{self, RelayStream};
use crate::relay::protocol::{ClientType, CommandFrame, Frame, MetricsFrame, TYPE_COMMAND};

use commands::{handle_command, CommandExecutor};
use metrics::MetricsSource;

const WRITE_QUEUE: usize = 64;

pub struct AgentRuntime {
    config: AgentConfig,
    hostname: String,
    executor: Arc<CommandExecutor>,
    metrics: Arc<Mutex<Box<dyn MetricsSource>>>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, metrics: Box<dyn MetricsSource>) -> Self {
        let hostname = config
            .hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .or_else(System::host_name)
            .unwrap_or_else(|| "unknown-host".to_string());

        AgentRuntime {
            executor: Arc::new(CommandExecutor::new(config.max_download_bytes)),
            config,
            hostname,
            metrics: Arc::new(Mutex::new(metrics)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect, serve, and reconnect after a fixed delay until shut down
    pub async fn run(&self) {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs.max(1));

        loop {
            match self.run_session().await {
                Ok(()) => info!("[AGENT] Session with hub ended"),
                Err(e) => warn!("[AGENT] Hub session failed: {}", e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            debug!("[AGENT] Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("[AGENT] Stopped");
    }

    async fn run_session(&self) -> Result<(), DocSweepError> {
        let (mut sink, stream) = connection::connect_and_register(
            &self.config.hub_url,
            ClientType::Agent,
            &self.config.token,
            Some(&self.hostname),
        )
        .await?;
        info!("[AGENT] Registered with {} as {}", self.config.hub_url, self.hostname);

        // Every outbound frame goes through this queue so socket writes never interleave
        let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);
        let writer = async move {
            while let Some(text) = rx.recv().await {
                sink.send(Message::text(text)).await?;
            }
            Ok::<(), DocSweepError>(())
        };

        tokio::select! {
            result = writer => result,
            result = self.metrics_loop(tx.clone()) => result,
            result = self.command_loop(stream, tx) => result,
            _ = self.shutdown.cancelled() => Ok(()),
        }
    }

    async fn metrics_loop(&self, tx: mpsc::Sender<String>) -> Result<(), DocSweepError> {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.metrics_interval_secs.max(1)));

        loop {
            interval.tick().await;

            let source = Arc::clone(&self.metrics);
            let snapshot = tokio::task::spawn_blocking(move || {
                let mut source = source
                    .lock()
                    .map_err(|_| DocSweepError::Error("metrics collector poisoned".to_string()))?;
                Ok::<_, DocSweepError>(source.collect())
            })
            .await
            .map_err(|e| DocSweepError::Error(format!("metrics collection crashed: {}", e)))?;

            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("[AGENT] Skipping metrics report: {}", e);
                    continue;
                }
            };

            let frame = Frame::UpdateMetrics(MetricsFrame::from_snapshot(
                Some(self.hostname.clone()),
                snapshot,
            ));
            tx.send(frame.to_json()?)
                .await
                .map_err(|_| DocSweepError::Connectivity("writer closed".to_string()))?;
            debug!("[AGENT] Metrics reported");
        }
    }

    async fn command_loop(
        &self,
        mut stream: RelayStream,
        tx: mpsc::Sender<String>,
    ) -> Result<(), DocSweepError> {
        while let Some(msg) = stream.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let value: Value = match serde_json::from_str(text.as_str()) {
                Ok(value) => value,
                Err(e) => {
                    warn!("[AGENT] Ignoring malformed frame: {}", e);
                    continue;
                }
            };
            if value.get("type").and_then(Value::as_str) != Some(TYPE_COMMAND) {
                debug!("[AGENT] Ignoring frame {}", value);
                continue;
            }

            let frame: CommandFrame = match serde_json::from_value(value) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[AGENT] Ignoring unreadable command: {}", e);
                    continue;
                }
            };

            let executor = Arc::clone(&self.executor);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = handle_command(executor, frame).await;
                let command_id = result.command_id.clone();
                match Frame::CommandResult(result).to_json() {
                    Ok(json) => {
                        if tx.send(json).await.is_err() {
                            debug!("[AGENT] Connection gone, result for {} lost", command_id);
                        }
                    }
                    Err(e) => warn!("[AGENT] Could not encode result for {}: {}", command_id, e),
                }
            });
        }

        Err(DocSweepError::Connectivity("hub closed the connection".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::relay::auth::TokenAuthenticator;
    use crate::relay::client::RelayClient;
    use crate::relay::hub::RelayHub;
    use crate::relay::protocol::{
        AgentCommand, CommandStatus, DownloadedFile, MetricsSnapshot, RemoteFileEntry,
    };
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tokio::net::TcpListener;

    struct StaticMetrics;

    impl MetricsSource for StaticMetrics {
        fn collect(&mut self) -> MetricsSnapshot {
            let mut snapshot = MetricsSnapshot::default();
            snapshot.cpu.model = "Test CPU".to_string();
            snapshot
        }
    }

    async fn next_json(stream: &mut RelayStream) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn next_of_type(stream: &mut RelayStream, frame_type: &str) -> Value {
        loop {
            let value = next_json(stream).await;
            if value["type"] == frame_type {
                return value;
            }
        }
    }

    async fn start_hub() -> (RelayHub, String) {
        let hub = RelayHub::new(
            TokenAuthenticator::new("agent-token", "controller-token"),
            Duration::from_secs(2),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = hub.clone();
        tokio::spawn(async move {
            let _ = server.serve_listener(listener, std::future::pending()).await;
        });
        (hub, url)
    }

    fn agent_config(url: &str) -> AgentConfig {
        AgentConfig {
            hub_url: url.to_string(),
            token: "agent-token".to_string(),
            hostname: Some("PC1".to_string()),
            metrics_interval_secs: 60,
            reconnect_delay_secs: 1,
            ..AgentConfig::default()
        }
    }

    fn spawn_agent(config: AgentConfig) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let agent = Arc::new(AgentRuntime::new(config, Box::new(StaticMetrics)));
        let shutdown = agent.shutdown_token();
        let handle = tokio::spawn(async move { agent.run().await });
        (shutdown, handle)
    }

    #[tokio::test]
    async fn test_agent_reports_metrics_and_serves_commands() {
        let (_hub, url) = start_hub().await;

        let (mut ctl_tx, mut ctl_rx) = connection::connect_and_register(
            &url,
            ClientType::Controller,
            "controller-token",
            None,
        )
        .await
        .unwrap();

        let (shutdown, handle) = spawn_agent(agent_config(&url));

        // first report arrives right after registration
        let metrics = next_of_type(&mut ctl_rx, "metrics").await;
        assert_eq!(metrics["hostname"], "PC1");
        assert_eq!(metrics["cpu"]["model"], "Test CPU");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("statement.pdf"), b"%PDF").unwrap();

        let list = serde_json::json!({
            "type": "command", "hostname": "PC1", "command": "list_files",
            "command_id": "c1", "path": dir.path().to_string_lossy(),
        });
        ctl_tx.send(Message::text(list.to_string())).await.unwrap();
        let result = next_of_type(&mut ctl_rx, "command_result").await;
        assert_eq!(result["command_id"], "c1");
        assert_eq!(result["status"], "completed");
        let entries: Vec<RemoteFileEntry> = serde_json::from_value(result["data"].clone()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "statement.pdf");

        let unknown = serde_json::json!({
            "type": "command", "hostname": "PC1", "command": "reboot", "command_id": "c2",
        });
        ctl_tx.send(Message::text(unknown.to_string())).await.unwrap();
        let result = next_of_type(&mut ctl_rx, "command_result").await;
        assert_eq!(result["command_id"], "c2");
        let status: CommandStatus = serde_json::from_value(result["status"].clone()).unwrap();
        assert_eq!(status, CommandStatus::Failed);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_above_default_websocket_frame_limit() {
        let (hub, url) = start_hub().await;
        let client = RelayClient::new(
            ControllerConfig {
                hub_url: url.clone(),
                token: "controller-token".to_string(),
                command_timeout_secs: 30,
                reconnect_delay_secs: 1,
            },
            None,
        );
        client.spawn();
        let (shutdown, handle) = spawn_agent(agent_config(&url));

        for _ in 0..250 {
            if client.is_connected() && hub.connected_agents() == vec!["PC1".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // 13 MiB encodes to over 17 MiB of base64
        let body: Vec<u8> = (0..13 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annual-statement.pdf");
        std::fs::write(&path, &body).unwrap();

        let result = client
            .send_command(
                "PC1",
                AgentCommand::DownloadFile {
                    remote_path: path.to_string_lossy().into_owned(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, CommandStatus::Completed);
        let file: DownloadedFile = serde_json::from_value(result.data).unwrap();
        assert_eq!(file.size, body.len() as u64);
        assert!(BASE64.decode(file.file_content).unwrap() == body);

        client.shutdown();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_agent_reconnects_after_losing_the_hub() {
        // a bare hub that accepts a registration, acknowledges it and then goes away
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (shutdown, handle) = spawn_agent(agent_config(&url));

        for _ in 0..2 {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
                .await
                .unwrap()
                .unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let register = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str::<Value>(text.as_str()).unwrap(),
                other => panic!("expected a registration, got {:?}", other),
            };
            assert_eq!(register["type"], "register");
            assert_eq!(register["client_type"], "agent");
            assert_eq!(register["hostname"], "PC1");

            ws.send(Message::text(Frame::AuthSuccess.to_json().unwrap()))
                .await
                .unwrap();
            drop(ws);
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
