//! WebSocket plumbing for the cable transport.
//!
//! Wraps `tokio-tungstenite` in a write half and a read half that speak
//! [`ConnectionError`], so the protocol layer above never touches
//! tungstenite types. Handshake failures are classified here: a 401/403
//! answer means the credential was refused, anything else is a transport
//! problem worth retrying.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ConnectionError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer sent no close frame payload.
const NO_STATUS_CODE: u16 = 1005;

/// What the read half hands to the protocol layer.
#[derive(Debug, PartialEq, Eq)]
pub enum WsFrame {
    /// UTF-8 text.
    Text(String),
    /// Keepalive ping; answer with [`WsWriter::pong`].
    Ping(Vec<u8>),
    /// The peer closed the socket.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// Binary or pong frames; the cable protocol has no use for them.
    Ignored,
}

/// Write half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    /// Send one text frame.
    pub async fn text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::Transport(format!("send failed: {e}")))
    }

    /// Answer a ping.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Pong(payload))
            .await
            .map_err(|e| ConnectionError::Transport(format!("pong failed: {e}")))
    }
}

/// Read half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<WsFrame, ConnectionError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(ConnectionError::Transport(format!("read failed: {e}")))),
        };
        Some(Ok(into_frame(message)))
    }
}

fn into_frame(message: Message) -> WsFrame {
    match message {
        Message::Text(text) => WsFrame::Text(text),
        Message::Ping(payload) => WsFrame::Ping(payload),
        Message::Close(Some(frame)) => WsFrame::Closed {
            code: frame.code.into(),
            reason: frame.reason.into_owned(),
        },
        Message::Close(None) => WsFrame::Closed {
            code: NO_STATUS_CODE,
            reason: String::new(),
        },
        Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => WsFrame::Ignored,
    }
}

/// Open a WebSocket to `url`, sending `bearer` as the `Authorization`
/// header when given.
///
/// # Errors
///
/// `ConnectionError::AuthRejected` when the handshake is answered with 401
/// or 403, `ConnectionError::Transport` for everything else.
pub async fn connect(
    url: &str,
    bearer: Option<&str>,
) -> Result<(WsWriter, WsReader), ConnectionError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::Transport(format!("bad WebSocket URL {url}: {e}")))?;

    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ConnectionError::Transport(format!("token is not a valid header: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(handshake_error)?;
    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

fn handshake_error(error: WsError) -> ConnectionError {
    match &error {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ConnectionError::AuthRejected(format!("handshake answered {}", response.status()))
        }
        _ => ConnectionError::Transport(format!("WebSocket connect failed: {error}")),
    }
}

/// Map `http(s)://` to `ws(s)://`; other schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
