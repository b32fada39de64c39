//! One browser tab's link to a shell session.

use super::GatewayState;
use crate::error::{ConnectError, ErrorCategory};
use crate::protocol::{
    ClientEvent, ConnectParams, ConnectionState, LinkStatus, ServerEvent, WireFrame,
};
use crate::registry::{Attachment, SessionKey};
use crate::registry::ShellSession;
use crate::ssh::{ConnectProgress, ProgressSink, ShellOutput};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// What one read from the browser side produced.
enum Incoming {
    Event(ClientEvent),
    Skip,
    Gone,
}

/// How the relay loop ended.
enum Ending {
    ClientGone,
    ShellClosed(Option<String>),
}

struct GatewayConnection {
    id: u64,
    key: SessionKey,
    state: ConnectionState,
}

impl GatewayConnection {
    fn advance(&mut self, next: ConnectionState) {
        if let Err(e) = self.state.advance(next) {
            log::debug!("Connection {}: {}", self.id, e);
        }
    }

    /// Resolve the target and get a shell attachment. The socket stays watched
    /// throughout: `Ok(None)` means the client left first, which abandons the
    /// open. Input that arrives meanwhile lands in `early`.
    async fn establish(
        &mut self,
        gateway: &GatewayState,
        params: &ConnectParams,
        tx: &mut WsSink,
        rx: &mut WsStream,
        early: &mut Vec<ClientEvent>,
    ) -> Result<Option<Attachment>, ConnectError> {
        let config = gateway
            .resolve_target(params.server_id, params.initial_size())
            .await?;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let acquire = gateway
            .registry()
            .acquire(self.key, &config, ProgressSink::new(progress_tx));
        tokio::pin!(acquire);

        let result = loop {
            tokio::select! {
                result = &mut acquire => break result.map(Some),
                Some(progress) = progress_rx.recv() => self.on_progress(tx, progress).await,
                msg = rx.next() => match incoming(self.id, msg) {
                    Incoming::Event(event) => early.push(event),
                    Incoming::Skip => {}
                    Incoming::Gone => {
                        log::info!(
                            "Connection {} left while its shell for {} was opening",
                            self.id,
                            self.key
                        );
                        return Ok(None);
                    }
                },
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.on_progress(tx, progress).await;
        }
        result
    }

    async fn on_progress(&mut self, tx: &mut WsSink, progress: ConnectProgress) {
        match progress {
            ConnectProgress::Handshake => {
                log::debug!("Connection {}: SSH handshake with {}", self.id, self.key);
            }
            ConnectProgress::Authenticating { method } => {
                if self.state == ConnectionState::Connecting {
                    self.advance(ConnectionState::Authenticating);
                }
                let status = ServerEvent::status(
                    LinkStatus::AuthInProgress,
                    format!("Authenticating ({})", method),
                );
                // a vanished client is noticed by the relay loop
                let _ = send(tx, status).await;
            }
        }
    }

    /// Report a failed connect attempt and close the socket.
    async fn fail(&mut self, tx: &mut WsSink, err: &ConnectError) {
        log::warn!("Connection {} for {} failed: {}", self.id, self.key, err);
        self.advance(ConnectionState::Error);
        let _ = send(tx, ServerEvent::error(err.to_string(), err.category())).await;
        let _ = send(
            tx,
            ServerEvent::status(LinkStatus::Disconnected, err.category().headline().to_string()),
        )
        .await;
        close(tx, close_code::NORMAL, "connect failed").await;
    }

    async fn finish(&mut self, tx: &mut WsSink, ending: Ending) {
        match ending {
            Ending::ClientGone => {
                log::info!("Connection {} for {} closed by client", self.id, self.key);
                self.advance(ConnectionState::Closed);
            }
            Ending::ShellClosed(None) => {
                log::info!("Shell for {} closed (connection {})", self.key, self.id);
                self.advance(ConnectionState::Closed);
                let _ = send(
                    tx,
                    ServerEvent::status(
                        LinkStatus::Disconnected,
                        "The remote shell closed the connection.".to_string(),
                    ),
                )
                .await;
                close(tx, close_code::NORMAL, "shell closed").await;
            }
            Ending::ShellClosed(Some(error)) => {
                log::warn!(
                    "Shell for {} failed (connection {}): {}",
                    self.key,
                    self.id,
                    error
                );
                self.advance(ConnectionState::Error);
                let _ = send(tx, ServerEvent::error(error, ErrorCategory::Network)).await;
                let _ = send(tx, ServerEvent::status(LinkStatus::Disconnected, None)).await;
                close(tx, close_code::ERROR, "shell failed").await;
            }
        }
    }
}

/// Drive one gateway connection from upgrade to close.
pub(super) async fn run(socket: WebSocket, gateway: GatewayState, params: ConnectParams) {
    let _active = gateway.track_connection();
    let mut conn = GatewayConnection {
        id: gateway.next_connection_id(),
        key: SessionKey::new(params.server_id, params.user_id),
        state: ConnectionState::Init,
    };
    log::info!("Connection {} opened for {}", conn.id, conn.key);
    let (mut tx, mut rx) = socket.split();

    conn.advance(ConnectionState::Connecting);
    let connecting = ServerEvent::status(
        LinkStatus::Connecting,
        format!("Connecting to server {}...", conn.key.server_id),
    );
    if send(&mut tx, connecting).await.is_err() {
        return;
    }

    let mut early = Vec::new();
    let established = conn
        .establish(&gateway, &params, &mut tx, &mut rx, &mut early)
        .await;
    let mut attachment = match established {
        Ok(Some(attachment)) => attachment,
        Ok(None) => {
            conn.finish(&mut tx, Ending::ClientGone).await;
            return;
        }
        Err(e) => {
            conn.fail(&mut tx, &e).await;
            return;
        }
    };
    let session = attachment.session.clone();

    // Joined sessions and connectors that report no auth progress still pass
    // through AUTHENTICATING.
    if conn.state == ConnectionState::Connecting {
        conn.advance(ConnectionState::Authenticating);
        let message = if attachment.reused {
            "Joining the existing session"
        } else {
            "Authenticating"
        };
        let _ = send(
            &mut tx,
            ServerEvent::status(LinkStatus::AuthInProgress, message.to_string()),
        )
        .await;
    }
    let connected = ServerEvent::status(
        LinkStatus::Connected,
        format!("Authenticated via {}", session.auth_method()),
    );
    conn.advance(ConnectionState::Ready);
    let ending = if send(&mut tx, connected).await.is_err()
        || send(&mut tx, ServerEvent::Ready).await.is_err()
    {
        Ending::ClientGone
    } else {
        for event in early {
            apply(&conn, &session, event);
        }
        relay(&conn, &mut tx, &mut rx, &mut attachment).await
    };

    gateway.registry().detach(conn.key, session.id()).await;
    conn.finish(&mut tx, ending).await;
}

/// Pump bytes both ways until either side goes away.
async fn relay(
    conn: &GatewayConnection,
    tx: &mut WsSink,
    rx: &mut WsStream,
    attachment: &mut Attachment,
) -> Ending {
    let session = attachment.session.clone();
    loop {
        tokio::select! {
            output = attachment.output.recv() => match output {
                Some(ShellOutput::Data(bytes)) => {
                    if tx.send(Message::Binary(bytes)).await.is_err() {
                        return Ending::ClientGone;
                    }
                }
                Some(ShellOutput::Closed { error }) => return Ending::ShellClosed(error),
                None => return Ending::ShellClosed(None),
            },
            msg = rx.next() => match incoming(conn.id, msg) {
                Incoming::Event(event) => apply(conn, &session, event),
                Incoming::Skip => {}
                Incoming::Gone => return Ending::ClientGone,
            },
        }
    }
}

fn incoming(id: u64, msg: Option<Result<Message, axum::Error>>) -> Incoming {
    let frame = match msg {
        Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(bytes),
        Some(Ok(Message::Text(text))) => WireFrame::Text(text),
        Some(Ok(Message::Close(_))) | None => return Incoming::Gone,
        Some(Ok(_)) => return Incoming::Skip,
        Some(Err(e)) => {
            log::debug!("Connection {} read error: {}", id, e);
            return Incoming::Gone;
        }
    };
    match ClientEvent::from_frame(frame) {
        Ok(event) => Incoming::Event(event),
        Err(e) => {
            log::warn!("Connection {} sent a bad frame: {}", id, e);
            Incoming::Skip
        }
    }
}

fn apply(conn: &GatewayConnection, session: &ShellSession, event: ClientEvent) {
    match event {
        ClientEvent::Data(bytes) => session.write(&bytes),
        ClientEvent::Resize(size) => {
            log::debug!("Connection {} resize to {}x{}", conn.id, size.cols, size.rows);
            session.resize(size);
        }
    }
}

async fn send(tx: &mut WsSink, event: ServerEvent) -> Result<(), axum::Error> {
    let message = match event.to_frame() {
        Ok(WireFrame::Text(text)) => Message::Text(text),
        Ok(WireFrame::Binary(bytes)) => Message::Binary(bytes),
        Err(e) => {
            log::error!("Could not encode {:?}: {}", event, e);
            return Ok(());
        }
    };
    tx.send(message).await
}

async fn close(tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = tx.send(Message::Close(Some(frame))).await;
    let _ = tx.flush().await;
}
