//! Transport Gateway wire protocol.
//!
//! Control events are JSON text frames tagged with `event`/`payload`; shell bytes
//! travel as binary frames in both directions. Frames are modelled independently
//! of the WebSocket library so the gateway (axum) and the terminal client
//! (tokio-tungstenite) share one codec.

pub mod state;

use crate::error::ErrorCategory;
use serde::{Deserialize, Serialize};

pub use state::{ConnectionState, InvalidTransition};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Connection-time parameters, carried in the WebSocket URL query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "serverId")]
    pub server_id: u64,
    #[serde(rename = "userId")]
    pub user_id: u64,
    /// Initial size; the client re-syncs with a `resize` after `ready` anyway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl ConnectParams {
    pub fn initial_size(&self) -> TermSize {
        let fallback = TermSize::default();
        TermSize::new(
            self.cols.filter(|c| *c > 0).unwrap_or(fallback.cols),
            self.rows.filter(|r| *r > 0).unwrap_or(fallback.rows),
        )
    }

    /// Render as a URL query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        let mut query = format!("serverId={}&userId={}", self.server_id, self.user_id);
        if let Some(cols) = self.cols {
            query.push_str(&format!("&cols={}", cols));
        }
        if let Some(rows) = self.rows {
            query.push_str(&format!("&rows={}", rows));
        }
        query
    }
}

/// Link status reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connecting,
    AuthInProgress,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: LinkStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub category: ErrorCategory,
}

/// A single WebSocket frame, library-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected binary frame")]
    UnexpectedBinary,
}

/// Events sent by the terminal client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Data(Vec<u8>),
    Resize(TermSize),
}

/// JSON shape of client control frames. `data` may arrive as text because
/// browser terminals emit strings.
#[derive(Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
enum ClientControl {
    Data(String),
    Resize(TermSize),
}

impl ClientEvent {
    pub fn to_frame(&self) -> Result<WireFrame, ProtocolError> {
        match self {
            Self::Data(bytes) => Ok(WireFrame::Binary(bytes.clone())),
            Self::Resize(size) => Ok(WireFrame::Text(serde_json::to_string(
                &ClientControl::Resize(*size),
            )?)),
        }
    }

    pub fn from_frame(frame: WireFrame) -> Result<Self, ProtocolError> {
        match frame {
            WireFrame::Binary(bytes) => Ok(Self::Data(bytes)),
            WireFrame::Text(text) => Ok(match serde_json::from_str(&text)? {
                ClientControl::Data(s) => Self::Data(s.into_bytes()),
                ClientControl::Resize(size) => Self::Resize(size),
            }),
        }
    }
}

/// Events sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Status(StatusPayload),
    /// Shell output; always a binary frame on the wire.
    #[serde(skip)]
    Data(Vec<u8>),
    Ready,
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn status(status: LinkStatus, message: impl Into<Option<String>>) -> Self {
        Self::Status(StatusPayload {
            status,
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            category,
        })
    }

    pub fn to_frame(&self) -> Result<WireFrame, ProtocolError> {
        match self {
            Self::Data(bytes) => Ok(WireFrame::Binary(bytes.clone())),
            other => Ok(WireFrame::Text(serde_json::to_string(other)?)),
        }
    }

    pub fn from_frame(frame: WireFrame) -> Result<Self, ProtocolError> {
        match frame {
            WireFrame::Binary(bytes) => Ok(Self::Data(bytes)),
            WireFrame::Text(text) => Ok(serde_json::from_str(&text)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_shape() {
        let frame = ServerEvent::status(LinkStatus::AuthInProgress, None)
            .to_frame()
            .unwrap();
        let WireFrame::Text(text) = frame else {
            panic!("status must be a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "status");
        assert_eq!(value["payload"]["status"], "auth_in_progress");
    }

    #[test]
    fn test_ready_has_no_payload() {
        let frame = ServerEvent::Ready.to_frame().unwrap();
        assert_eq!(frame, WireFrame::Text("{\"event\":\"ready\"}".to_string()));
        assert_eq!(
            ServerEvent::from_frame(frame).unwrap(),
            ServerEvent::Ready
        );
    }

    #[test]
    fn test_output_is_binary() {
        let frame = ServerEvent::Data(b"total 0\r\n".to_vec()).to_frame().unwrap();
        assert_eq!(frame, WireFrame::Binary(b"total 0\r\n".to_vec()));
    }

    #[test]
    fn test_text_data_from_browser() {
        let event = ClientEvent::from_frame(WireFrame::Text(
            r#"{"event":"data","payload":"ls\n"}"#.to_string(),
        ))
        .unwrap();
        assert_eq!(event, ClientEvent::Data(vec![0x6c, 0x73, 0x0a]));
    }

    #[test]
    fn test_resize_frame() {
        let event = ClientEvent::from_frame(WireFrame::Text(
            r#"{"event":"resize","payload":{"cols":120,"rows":40}}"#.to_string(),
        ))
        .unwrap();
        assert_eq!(event, ClientEvent::Resize(TermSize::new(120, 40)));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result = ClientEvent::from_frame(WireFrame::Text(
            r#"{"event":"exec","payload":"rm"}"#.to_string(),
        ));
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_error_event_carries_category() {
        let frame = ServerEvent::error("denied", ErrorCategory::Auth)
            .to_frame()
            .unwrap();
        let WireFrame::Text(text) = frame else {
            panic!("error must be a text frame");
        };
        assert!(text.contains("\"category\":\"auth\""));
    }

    #[test]
    fn test_connect_params_query() {
        let params = ConnectParams {
            server_id: 7,
            user_id: 3,
            cols: Some(100),
            rows: None,
        };
        assert_eq!(params.to_query(), "serverId=7&userId=3&cols=100");
        assert_eq!(params.initial_size(), TermSize::new(100, 24));
    }
}
