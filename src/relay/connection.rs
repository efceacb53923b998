use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::DocSweepError;

use super::protocol::{ClientType, Frame, RegisterFrame, MAX_FRAME_BYTES};

pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type RelaySink = SplitSink<WsConnection, Message>;
pub type RelayStream = SplitStream<WsConnection>;

const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Frame limits matching the hub's, so file transfers are not cut off at the default 16 MiB
fn relay_ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_frame_size(Some(MAX_FRAME_BYTES))
        .max_message_size(Some(MAX_FRAME_BYTES))
}

/// Open a socket to the hub and complete the register / auth_success handshake
pub async fn connect_and_register(
    url: &str,
    client_type: ClientType,
    token: &str,
    hostname: Option<&str>,
) -> Result<(RelaySink, RelayStream), DocSweepError> {
    let (ws, _response) = tokio_tungstenite::connect_async_with_config(url, Some(relay_ws_config()), false)
        .await
        .map_err(|e| DocSweepError::Connectivity(format!("connect to {} failed: {}", url, e)))?;
    let (mut sink, mut stream) = ws.split();

    let register = Frame::Register(RegisterFrame::new(client_type, token, hostname)).to_json()?;
    sink.send(Message::text(register)).await?;

    tokio::time::timeout(AUTH_TIMEOUT, await_auth_success(&mut stream))
        .await
        .map_err(|_| DocSweepError::Authentication("hub did not acknowledge registration".to_string()))??;

    debug!("Registered with hub at {} as {:?}", url, client_type);
    Ok((sink, stream))
}

async fn await_auth_success(stream: &mut RelayStream) -> Result<(), DocSweepError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                return match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(Frame::AuthSuccess) => Ok(()),
                    Ok(other) => Err(DocSweepError::Authentication(format!(
                        "expected auth_success, got {:?}",
                        other
                    ))),
                    Err(e) => Err(DocSweepError::Authentication(format!(
                        "unreadable registration reply: {}",
                        e
                    ))),
                };
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(DocSweepError::Authentication(
        "hub closed the connection during registration".to_string(),
    ))
}
