//! ActionCable-framed notification transport.
//!
//! Implements [`Transport`] over the shared WebSocket module.
//!
//! # Protocol
//!
//! - Connects to `<server>/cable` with `Authorization: Bearer <token>`
//! - Waits for the `welcome` frame before reporting the session open
//! - Joins by sending a `subscribe` command for
//!   `{"channel": "NotificationsChannel", "room": "notifications:<role>"}`
//! - Yields the `message` field of data frames addressed to that subscription
//! - `confirm_subscription` / `reject_subscription` are logged only
//! - A `disconnect` frame with reason `unauthorized` is an auth rejection;
//!   any other `disconnect` is a recoverable loss

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::{Credential, Transport, TransportSession};
use crate::constants::{NOTIFICATIONS_CHANNEL, WELCOME_TIMEOUT};
use crate::error::ConnectionError;
use crate::ws::{self, WsFrame, WsReader, WsWriter};

/// Transport to an ActionCable endpoint.
#[derive(Debug, Clone)]
pub struct CableTransport {
    server_url: String,
    welcome_timeout: Duration,
}

impl CableTransport {
    /// Create a transport for `server_url` (http(s) or ws(s)).
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            welcome_timeout: WELCOME_TIMEOUT,
        }
    }

    /// Override how long to wait for the welcome frame.
    #[must_use]
    pub fn with_welcome_timeout(mut self, timeout: Duration) -> Self {
        self.welcome_timeout = timeout;
        self
    }

    /// WebSocket endpoint derived from the server URL.
    pub fn endpoint(&self) -> String {
        build_ws_url(&self.server_url)
    }
}

/// Build the WebSocket URL from the server URL.
///
/// Converts `https://` to `wss://` and `http://` to `ws://`, then appends `/cable`.
fn build_ws_url(server_url: &str) -> String {
    format!(
        "{}/cable",
        ws::http_to_ws_scheme(server_url).trim_end_matches('/')
    )
}

#[async_trait]
impl Transport for CableTransport {
    async fn open(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn TransportSession>, ConnectionError> {
        let url = self.endpoint();
        log::info!("[Cable] Connecting to {}", url);

        let (mut writer, mut reader) = ws::connect(&url, Some(credential.token())).await?;

        tokio::time::timeout(
            self.welcome_timeout,
            wait_for_welcome(&mut writer, &mut reader),
        )
        .await
        .map_err(|elapsed| {
            ConnectionError::Transport(format!("no welcome from server: {elapsed}"))
        })??;

        log::debug!("[Cable] Received welcome");
        Ok(Box::new(CableSession {
            writer,
            reader,
            identifier: None,
        }))
    }
}

/// Live ActionCable session.
#[derive(Debug)]
pub struct CableSession {
    writer: WsWriter,
    reader: WsReader,
    identifier: Option<String>,
}

#[async_trait]
impl TransportSession for CableSession {
    async fn join(&mut self, room: &str) -> Result<(), ConnectionError> {
        let identifier = subscription_identifier(room);
        let subscribe_cmd = serde_json::json!({
            "command": "subscribe",
            "identifier": identifier
        });
        self.writer.text(subscribe_cmd.to_string()).await?;
        self.identifier = Some(identifier);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Value, ConnectionError>> {
        loop {
            match self.reader.next().await? {
                Ok(WsFrame::Text(text)) => match classify(&text, self.identifier.as_deref()) {
                    Inbound::Payload(payload) => return Some(Ok(payload)),
                    Inbound::Disconnect(error) => return Some(Err(error)),
                    Inbound::Skip => {}
                },
                Ok(WsFrame::Ping(payload)) => {
                    if let Err(e) = self.writer.pong(payload).await {
                        return Some(Err(e));
                    }
                }
                Ok(WsFrame::Closed { code, reason }) => {
                    log::info!("[Cable] Closed by server ({} {})", code, reason);
                    return None;
                }
                Ok(WsFrame::Ignored) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Identifier for the notification subscription (stringified JSON, as
/// ActionCable expects).
fn subscription_identifier(room: &str) -> String {
    serde_json::json!({
        "channel": NOTIFICATIONS_CHANNEL,
        "room": room
    })
    .to_string()
}

/// Wait for the ActionCable welcome message after connecting.
async fn wait_for_welcome(
    writer: &mut WsWriter,
    reader: &mut WsReader,
) -> Result<(), ConnectionError> {
    while let Some(frame) = reader.next().await {
        match frame? {
            WsFrame::Text(text) => {
                let Ok(json) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match json.get("type").and_then(Value::as_str) {
                    Some("welcome") => return Ok(()),
                    Some("disconnect") => return Err(disconnect_error(&json)),
                    _ => {}
                }
            }
            WsFrame::Ping(payload) => writer.pong(payload).await?,
            WsFrame::Closed { code, reason } => {
                return Err(ConnectionError::Transport(format!(
                    "closed before welcome ({code} {reason})"
                )))
            }
            WsFrame::Ignored => {}
        }
    }

    Err(ConnectionError::Transport(
        "WebSocket closed before welcome".into(),
    ))
}

/// What a text frame means to the session.
#[derive(Debug, PartialEq)]
enum Inbound {
    Payload(Value),
    Disconnect(ConnectionError),
    Skip,
}

fn classify(text: &str, identifier: Option<&str>) -> Inbound {
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        log::warn!("[Cable] Failed to parse message as JSON: {}", preview(text));
        return Inbound::Skip;
    };

    match json.get("type").and_then(Value::as_str) {
        Some("welcome" | "ping") => Inbound::Skip,
        Some("confirm_subscription") => {
            log::info!("[Cable] Subscription confirmed");
            Inbound::Skip
        }
        Some("reject_subscription") => {
            log::error!("[Cable] Subscription rejected by server");
            Inbound::Skip
        }
        Some("disconnect") => Inbound::Disconnect(disconnect_error(&json)),
        _ => {
            let Some(message) = json.get("message") else {
                log::trace!("[Cable] Unhandled message: {}", text);
                return Inbound::Skip;
            };
            let addressed_to = json.get("identifier").and_then(Value::as_str);
            match (identifier, addressed_to) {
                (Some(ours), Some(theirs)) if ours != theirs => {
                    log::trace!("[Cable] Message for unknown channel: {}", theirs);
                    Inbound::Skip
                }
                _ => Inbound::Payload(message.clone()),
            }
        }
    }
}

/// First 100 characters of `text`, cut on a char boundary.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn disconnect_error(json: &Value) -> ConnectionError {
    let reason = json
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("unspecified");
    if reason == "unauthorized" {
        ConnectionError::AuthRejected(reason.to_string())
    } else {
        log::warn!("[Cable] Server requested disconnect: {}", reason);
        ConnectionError::Transport(format!("server requested disconnect: {reason}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_ws_url() {
        assert_eq!(
            build_ws_url("https://notify.example.com"),
            "wss://notify.example.com/cable"
        );
        assert_eq!(
            build_ws_url("http://localhost:3000/"),
            "ws://localhost:3000/cable"
        );
    }

    #[test]
    fn test_subscription_identifier_is_stringified_json() {
        let parsed: Value =
            serde_json::from_str(&subscription_identifier("notifications:admin")).unwrap();
        assert_eq!(parsed["channel"], "NotificationsChannel");
        assert_eq!(parsed["room"], "notifications:admin");
    }

    #[test]
    fn test_classify_data_frame() {
        let identifier = subscription_identifier("notifications:user");
        let frame = json!({
            "identifier": identifier,
            "message": {"type": "notification", "data": {}}
        });

        assert_eq!(
            classify(&frame.to_string(), Some(&identifier)),
            Inbound::Payload(json!({"type": "notification", "data": {}}))
        );
    }

    #[test]
    fn test_classify_ignores_other_subscriptions() {
        let ours = subscription_identifier("notifications:user");
        let frame = json!({
            "identifier": subscription_identifier("notifications:admin"),
            "message": {"type": "notification"}
        });
        assert_eq!(classify(&frame.to_string(), Some(&ours)), Inbound::Skip);
    }

    #[test]
    fn test_classify_control_frames() {
        assert_eq!(classify(r#"{"type":"ping","message":1}"#, None), Inbound::Skip);
        assert_eq!(classify(r#"{"type":"reject_subscription"}"#, None), Inbound::Skip);
        assert_eq!(classify("not json", None), Inbound::Skip);
    }

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        let text = format!("{}é trailing", "x".repeat(99));
        let cut = preview(&text);
        assert_eq!(cut.chars().count(), 100);
        assert!(cut.ends_with('é'));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_multibyte_garbage_is_skipped() {
        log::set_max_level(log::LevelFilter::Trace);
        let text = format!("{}é trailing", "x".repeat(99));
        assert_eq!(classify(&text, None), Inbound::Skip);
        assert_eq!(classify(&"ü".repeat(80), None), Inbound::Skip);
    }

    #[test]
    fn test_unauthorized_disconnect_is_auth_rejection() {
        assert_eq!(
            classify(
                r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#,
                None
            ),
            Inbound::Disconnect(ConnectionError::AuthRejected("unauthorized".into()))
        );
        assert!(matches!(
            classify(r#"{"type":"disconnect","reason":"server_restart"}"#, None),
            Inbound::Disconnect(ConnectionError::Transport(_))
        ));
    }
}
