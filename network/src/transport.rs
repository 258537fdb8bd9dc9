//! WebSocket transports behind [`PeerConnection`].
//!
//! Both directions speak the same framed-text protocol; they differ in
//! how the channel is established. Outgoing connections embed the local
//! node's identity and listen port as query parameters so the remote can
//! create its symmetric peer entry; incoming connections are validated
//! against the configured protocol version during the HTTP upgrade.

use crate::config::NetworkConfig;
use crate::connection::{Direction, PeerConnection, OUTBOUND_BUFFER};
use crate::error::NetworkError;
use cinder_gossip::Codec;
use cinder_types::{NodeId, PeerUrl};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Timeout for establishing an outgoing channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What an incoming channel declared about itself during the upgrade.
#[derive(Clone, Debug)]
pub struct IncomingHandshake {
    /// The remote's node id, when its request carried one.
    pub node_id: Option<NodeId>,
    /// The remote's own listening port, when declared.
    pub port: Option<u16>,
    /// The address the channel actually came from.
    pub remote_host: String,
}

/// Dial a peer's WebSocket endpoint.
///
/// Refused when `local_port` is 0 — a purely passive node cannot ask
/// others to dial it back, so it does not dial out either. The caller
/// owns the surrounding [`PeerConnection`]; on success it attaches the
/// returned socket via [`spawn_io`].
pub(crate) async fn dial(
    peer: &PeerUrl,
    local_node: NodeId,
    local_port: u16,
    config: &NetworkConfig,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, NetworkError> {
    if local_port == 0 {
        return Err(NetworkError::OutboundUnavailable);
    }

    let mut url = Url::parse(&format!("ws://{}:{}/", peer.host(), peer.port()))
        .map_err(|e| NetworkError::WebSocket(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair(&config.uuid_request_key, &local_node.to_string())
        .append_pair(&config.port_request_key, &local_port.to_string());

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| NetworkError::WebSocket(e.to_string()))?;
    let protocol = HeaderValue::from_str(&config.protocol_version)
        .map_err(|e| NetworkError::Config(format!("protocol version is not a header value: {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", protocol);

    let (socket, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| NetworkError::WebSocket(format!("connect to {peer} timed out")))?
        .map_err(|e| NetworkError::WebSocket(e.to_string()))?;
    tracing::debug!(%peer, "outgoing channel established");
    Ok(socket)
}

/// Upgrade an accepted socket into an incoming peer channel.
///
/// The upgrade callback enforces the protocol-version subprotocol and
/// extracts the remote's declared identity from the request query.
pub(crate) async fn accept_incoming(
    stream: TcpStream,
    remote_host: String,
    config: &NetworkConfig,
    codec: Arc<Codec>,
) -> Result<(Arc<PeerConnection>, IncomingHandshake), NetworkError> {
    let expected = &config.protocol_version;
    let mut rejection: Option<NetworkError> = None;
    let mut handshake = IncomingHandshake {
        node_id: None,
        port: None,
        remote_host,
    };

    let upgrade = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        match req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
        {
            None => {
                rejection = Some(NetworkError::ProtocolVersionMissing);
                return Err(reject_upgrade());
            }
            Some(offered) => {
                if !offered.split(',').map(str::trim).any(|p| p == expected.as_str()) {
                    rejection = Some(NetworkError::ProtocolVersionUnsupported {
                        offered: offered.to_string(),
                        expected: expected.clone(),
                    });
                    return Err(reject_upgrade());
                }
            }
        }
        if let Ok(value) = HeaderValue::from_str(expected) {
            resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        if let Some(query) = req.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == config.uuid_request_key.as_str() {
                    handshake.node_id = value.parse().ok();
                } else if key == config.port_request_key.as_str() {
                    handshake.port = value.parse().ok();
                }
            }
        }
        Ok(resp)
    })
    .await;

    let socket = match upgrade {
        Ok(socket) => socket,
        Err(e) => {
            return Err(rejection.unwrap_or_else(|| NetworkError::WebSocket(e.to_string())));
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let connection = PeerConnection::new(Direction::Incoming, codec, outbound_tx);
    let tasks = spawn_io(socket, &connection, outbound_rx);
    connection.attach_io_tasks(tasks);
    Ok((connection, handshake))
}

fn reject_upgrade() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Spawn the write and read tasks serving one socket. Frames go out as
/// text; the read task feeds inbound text to the connection in arrival
/// order and reports socket death. Both tasks hold only weak references
/// so dropping the connection's owners tears the channel down.
pub(crate) fn spawn_io<S>(
    socket: WebSocketStream<S>,
    connection: &Arc<PeerConnection>,
    mut outbound_rx: mpsc::Receiver<String>,
) -> Vec<JoinHandle<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();

    let write = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let weak = Arc::downgrade(connection);
    let connection_id = connection.id();
    let read = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let Some(connection) = weak.upgrade() else { return };
                    connection.receive(&text);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Binary(_)) => {
                    tracing::warn!(connection = connection_id, "invalid format: binary frame");
                }
                Ok(Message::Close(_)) | Err(_) => break,
            }
        }
        if let Some(connection) = weak.upgrade() {
            connection.handle_disconnect();
        }
    });

    vec![write, read]
}
