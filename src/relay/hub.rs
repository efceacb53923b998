use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::DocSweepError;

use super::auth::TokenAuthenticator;
use super::protocol::{
    Frame, RegisterFrame, RelayRole, MAX_FRAME_BYTES, TYPE_METRICS, TYPE_REGISTER,
    TYPE_UPDATE_METRICS,
};

/// Frames queued for one peer before further frames to it are dropped
const OUTBOUND_QUEUE: usize = 256;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound half of a registered connection
#[derive(Clone)]
struct Peer {
    conn_id: u64,
    display_name: String,
    sender: mpsc::Sender<String>,
}

struct HubState {
    authenticator: TokenAuthenticator,
    registration_timeout: Duration,
    /// Lowercased hostname -> agent connection
    agents: DashMap<String, Peer>,
    controller: Mutex<Option<Peer>>,
}

/// Rendezvous point between one controller and many agents
#[derive(Clone)]
pub struct RelayHub {
    state: Arc<HubState>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("agents", &self.state.agents.len())
            .field("controller", &self.has_controller())
            .finish()
    }
}

impl RelayHub {
    pub fn new(authenticator: TokenAuthenticator, registration_timeout: Duration) -> Self {
        RelayHub {
            state: Arc::new(HubState {
                authenticator,
                registration_timeout,
                agents: DashMap::new(),
                controller: Mutex::new(None),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/ws", get(relay_ws))
            .with_state(self.clone())
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), DocSweepError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DocSweepError::Error(format!("Failed to bind to {}: {}", addr, e)))?;
        info!("Relay hub listening on ws://{}/ws", addr);

        self.serve_listener(listener, shutdown).await
    }

    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), DocSweepError> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| DocSweepError::Error(format!("Hub server error: {}", e)))
    }

    /// Hostnames with a live connection, sorted
    pub fn connected_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .agents
            .iter()
            .map(|entry| entry.value().display_name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_controller(&self) -> bool {
        self.state
            .controller
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    async fn handle_socket(self, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let registration = tokio::time::timeout(
            self.state.registration_timeout,
            Self::read_registration(&mut ws_receiver),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DocSweepError::Authentication(
                "no registration before timeout".to_string(),
            ))
        })
        .and_then(|frame| self.state.authenticator.authenticate(&frame));

        let role = match registration {
            Ok(role) => role,
            Err(e) => {
                warn!("[HUB] Rejecting connection: {}", e);
                let _ = ws_sender.send(Message::Close(None)).await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        // auth_success heads the queue, ahead of anything routed once the peer is registered
        let queued = Frame::AuthSuccess
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| tx.try_send(json).map_err(|e| e.to_string()));
        if let Err(e) = queued {
            warn!("[HUB] Failed to queue auth_success: {}", e);
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }

        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst);
        self.register_peer(&role, conn_id, tx);

        // Single writer per connection; ends once the peer's sender is dropped,
        // which happens on disconnect or when another connection takes its slot
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if !self.owns_slot(&role, conn_id) {
                        info!("[HUB] {:?} was replaced by a newer connection, closing it", role);
                        break;
                    }
                    self.route(&role, text.as_str());
                }
                Ok(Message::Binary(_)) => {
                    warn!("[HUB] Dropping binary frame from {:?}", role);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("[HUB] Receive error from {:?}: {}", role, e);
                    break;
                }
            }
        }

        self.unregister_peer(&role, conn_id);
    }

    async fn read_registration(
        receiver: &mut SplitStream<WebSocket>,
    ) -> Result<RegisterFrame, DocSweepError> {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let value: Value = serde_json::from_str(text.as_str()).map_err(|e| {
                        DocSweepError::Authentication(format!("malformed registration: {}", e))
                    })?;
                    if value.get("type").and_then(Value::as_str) != Some(TYPE_REGISTER) {
                        return Err(DocSweepError::Authentication(
                            "first frame must be a registration".to_string(),
                        ));
                    }
                    return serde_json::from_value(value).map_err(|e| {
                        DocSweepError::Authentication(format!("malformed registration: {}", e))
                    });
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(_) => {
                    return Err(DocSweepError::Authentication(
                        "first frame must be a text registration".to_string(),
                    ))
                }
                Err(e) => return Err(DocSweepError::Connectivity(e.to_string())),
            }
        }
        Err(DocSweepError::Connectivity(
            "closed before registering".to_string(),
        ))
    }

    fn register_peer(&self, role: &RelayRole, conn_id: u64, sender: mpsc::Sender<String>) {
        match role {
            RelayRole::Agent { hostname } => {
                let peer = Peer {
                    conn_id,
                    display_name: hostname.clone(),
                    sender,
                };
                // Dropping the displaced peer's sender closes its socket
                if self
                    .state
                    .agents
                    .insert(hostname.to_ascii_lowercase(), peer)
                    .is_some()
                {
                    info!("[HUB] Agent '{}' re-registered, replacing previous connection", hostname);
                } else {
                    info!("[HUB] Agent '{}' registered", hostname);
                }
            }
            RelayRole::Controller => {
                let peer = Peer {
                    conn_id,
                    display_name: "controller".to_string(),
                    sender,
                };
                match self.state.controller.lock() {
                    Ok(mut slot) => {
                        if slot.replace(peer).is_some() {
                            info!("[HUB] Controller re-registered, replacing previous connection");
                        } else {
                            info!("[HUB] Controller registered");
                        }
                    }
                    Err(_) => warn!("[HUB] Controller slot poisoned, registration ignored"),
                }
            }
        }
    }

    /// Whether `conn_id` is still the routed connection for `role`
    fn owns_slot(&self, role: &RelayRole, conn_id: u64) -> bool {
        match role {
            RelayRole::Agent { hostname } => self
                .state
                .agents
                .get(&hostname.to_ascii_lowercase())
                .is_some_and(|peer| peer.conn_id == conn_id),
            RelayRole::Controller => self
                .state
                .controller
                .lock()
                .map(|slot| slot.as_ref().is_some_and(|peer| peer.conn_id == conn_id))
                .unwrap_or(false),
        }
    }

    /// Remove the peer only if this connection still owns its slot
    fn unregister_peer(&self, role: &RelayRole, conn_id: u64) {
        match role {
            RelayRole::Agent { hostname } => {
                let removed = self
                    .state
                    .agents
                    .remove_if(&hostname.to_ascii_lowercase(), |_, peer| peer.conn_id == conn_id);
                if removed.is_some() {
                    info!("[HUB] Agent '{}' disconnected", hostname);
                }
            }
            RelayRole::Controller => {
                if let Ok(mut slot) = self.state.controller.lock() {
                    if slot.as_ref().is_some_and(|peer| peer.conn_id == conn_id) {
                        *slot = None;
                        info!("[HUB] Controller disconnected");
                    }
                }
            }
        }
    }

    fn route(&self, role: &RelayRole, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("[HUB] Dropping malformed frame from {:?}: {}", role, e);
                return;
            }
        };

        match role {
            RelayRole::Agent { hostname } => self.route_from_agent(hostname, text, value),
            RelayRole::Controller => self.route_from_controller(text, value),
        }
    }

    fn route_from_agent(&self, hostname: &str, text: &str, value: Value) {
        let frame_type = value.get("type").and_then(Value::as_str);
        let outbound = if matches!(frame_type, Some(TYPE_UPDATE_METRICS) | Some(TYPE_METRICS)) {
            Self::envelope_metrics(hostname, &value).to_string()
        } else {
            text.to_string()
        };

        let controller = match self.state.controller.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };

        match controller {
            Some(peer) => Self::deliver(&peer, outbound),
            None => debug!(
                "[HUB] No controller connected, dropping {:?} frame from '{}'",
                frame_type, hostname
            ),
        }
    }

    fn route_from_controller(&self, text: &str, value: Value) {
        let Some(target) = value.get("hostname").and_then(Value::as_str) else {
            warn!("[HUB] Dropping controller frame without a target hostname");
            return;
        };

        let peer = self
            .state
            .agents
            .get(&target.to_ascii_lowercase())
            .map(|entry| entry.value().clone());

        match peer {
            Some(peer) => Self::deliver(&peer, text.to_string()),
            None => warn!(
                "[HUB] Agent '{}' is not connected, dropping frame",
                target
            ),
        }
    }

    /// Re-wrap an agent's metrics with its registered hostname and the forwarding time
    fn envelope_metrics(hostname: &str, value: &Value) -> Value {
        let section = |key: &str| value.get(key).cloned().unwrap_or_else(|| json!({}));
        json!({
            "type": TYPE_METRICS,
            "hostname": hostname,
            "forwarded_at": chrono::Utc::now().to_rfc3339(),
            "cpu": section("cpu"),
            "memory": section("memory"),
            "disk": section("disk"),
            "system": section("system"),
        })
    }

    /// Never waits on the peer's socket
    fn deliver(peer: &Peer, text: String) {
        match peer.sender.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                "[HUB] Outbound queue for '{}' is full, dropping frame",
                peer.display_name
            ),
            Err(TrySendError::Closed(_)) => debug!(
                "[HUB] '{}' is closing, dropping frame",
                peer.display_name
            ),
        }
    }
}

async fn relay_ws(ws: WebSocketUpgrade, State(hub): State<RelayHub>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| hub.handle_socket(socket))
}

async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "docsweep relay hub is running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::{self, RelayStream};
    use crate::relay::protocol::ClientType;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const AGENT_TOKEN: &str = "agent-token";
    const CONTROLLER_TOKEN: &str = "controller-token";

    async fn start_hub() -> (RelayHub, String) {
        let hub = RelayHub::new(
            TokenAuthenticator::new(AGENT_TOKEN, CONTROLLER_TOKEN),
            Duration::from_secs(2),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = hub.clone();
        tokio::spawn(async move {
            let _ = server
                .serve_listener(listener, std::future::pending())
                .await;
        });
        (hub, format!("ws://{}/ws", addr))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn next_json(stream: &mut RelayStream) -> Option<Value> {
        let msg = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .ok()??;
        match msg.ok()? {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_command_reaches_only_target_agent() {
        let (hub, url) = start_hub().await;

        let (_pc1_tx, mut pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();
        let (_pc2_tx, mut pc2_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC2"))
                .await
                .unwrap();
        let (mut ctl_tx, _ctl_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();

        wait_for(|| hub.connected_agents().len() == 2 && hub.has_controller()).await;

        let command = json!({
            "type": "command", "hostname": "PC1", "command": "list_files",
            "command_id": "abc", "path": "C:\\Users"
        });
        ctl_tx
            .send(WsMessage::text(command.to_string()))
            .await
            .unwrap();

        let received = next_json(&mut pc1_rx).await.expect("PC1 should get the command");
        assert_eq!(received, command);
        assert!(next_json(&mut pc2_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_hostname_is_dropped_and_controller_stays_connected() {
        let (hub, url) = start_hub().await;
        let (mut ctl_tx, mut ctl_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();
        let (mut pc1_tx, _pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();
        wait_for(|| hub.connected_agents().len() == 1 && hub.has_controller()).await;

        ctl_tx
            .send(WsMessage::text(
                json!({"type": "command", "hostname": "GHOST", "command": "list_files", "command_id": "x"})
                    .to_string(),
            ))
            .await
            .unwrap();
        ctl_tx.send(WsMessage::text("not json at all")).await.unwrap();

        // The controller is still routed to afterwards
        pc1_tx
            .send(WsMessage::text(
                json!({"type": "command_result", "command_id": "y", "status": "completed", "data": []})
                    .to_string(),
            ))
            .await
            .unwrap();
        let result = next_json(&mut ctl_rx).await.expect("controller should get the result");
        assert_eq!(result["command_id"], "y");
        assert!(hub.has_controller());
    }

    #[tokio::test]
    async fn test_metrics_are_re_enveloped() {
        let (hub, url) = start_hub().await;
        let (_ctl_tx, mut ctl_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();
        let (mut pc1_tx, _pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();
        wait_for(|| hub.connected_agents().len() == 1 && hub.has_controller()).await;

        pc1_tx
            .send(WsMessage::text(
                json!({"type": "update_metrics", "hostname": "spoofed", "cpu": {"percent": 5.0}})
                    .to_string(),
            ))
            .await
            .unwrap();

        let metrics = next_json(&mut ctl_rx).await.expect("controller should get metrics");
        assert_eq!(metrics["type"], "metrics");
        assert_eq!(metrics["hostname"], "PC1");
        assert!(metrics["forwarded_at"].is_string());
        assert_eq!(metrics["cpu"]["percent"], 5.0);
    }

    #[tokio::test]
    async fn test_replaced_controller_is_closed_and_no_longer_routed() {
        let (hub, url) = start_hub().await;
        let (_pc1_tx, mut pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();
        let (mut old_tx, mut old_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();
        let (mut new_tx, _new_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();
        assert_eq!(hub.connected_agents(), vec!["PC1".to_string()]);

        let stale = json!({
            "type": "command", "hostname": "PC1", "command": "list_files",
            "command_id": "from-old", "path": "C:\\"
        });
        let _ = old_tx.send(WsMessage::text(stale.to_string())).await;
        assert!(next_json(&mut pc1_rx).await.is_none());

        // the displaced controller is told to go away
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match old_rx.next().await {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "old controller socket should be closed");

        let fresh = json!({
            "type": "command", "hostname": "PC1", "command": "list_files",
            "command_id": "from-new", "path": "C:\\"
        });
        new_tx.send(WsMessage::text(fresh.to_string())).await.unwrap();
        let received = next_json(&mut pc1_rx).await.expect("PC1 should get the new controller's command");
        assert_eq!(received["command_id"], "from-new");
        assert!(hub.has_controller());
    }

    #[tokio::test]
    async fn test_registered_before_acknowledged() {
        let (hub, url) = start_hub().await;
        let (mut ctl_tx, _ctl_rx) =
            connection::connect_and_register(&url, ClientType::Controller, CONTROLLER_TOKEN, None)
                .await
                .unwrap();
        let (_pc1_tx, mut pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();

        // no settling delay: auth_success means the agent is already routable
        assert_eq!(hub.connected_agents(), vec!["PC1".to_string()]);
        ctl_tx
            .send(WsMessage::text(
                json!({"type": "command", "hostname": "pc1", "command": "list_files", "command_id": "now"})
                    .to_string(),
            ))
            .await
            .unwrap();
        let received = next_json(&mut pc1_rx).await.expect("command sent right after auth_success");
        assert_eq!(received["command_id"], "now");
    }

    #[tokio::test]
    async fn test_bad_token_is_refused() {
        let (hub, url) = start_hub().await;
        let result =
            connection::connect_and_register(&url, ClientType::Agent, "wrong", Some("PC1")).await;
        assert!(result.is_err());
        assert!(hub.connected_agents().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_agent() {
        let (hub, url) = start_hub().await;
        let (mut pc1_tx, _pc1_rx) =
            connection::connect_and_register(&url, ClientType::Agent, AGENT_TOKEN, Some("PC1"))
                .await
                .unwrap();
        wait_for(|| hub.connected_agents() == vec!["PC1".to_string()]).await;

        pc1_tx.close().await.unwrap();
        wait_for(|| hub.connected_agents().is_empty()).await;
    }
}
