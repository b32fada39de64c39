//! The adapter's side of one gateway connection.

use super::View;
use crate::lock;
use crate::protocol::{ClientEvent, ConnectionState, ServerEvent, TermSize, WireFrame};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct LinkConfig {
    /// Full connection URL, query string included.
    pub url: String,
    pub size: TermSize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Applies link events to the shared view, unless a newer link has taken over.
struct ViewHandle {
    view: Arc<Mutex<View>>,
    generation: u64,
}

impl ViewHandle {
    fn with(&self, f: impl FnOnce(&mut View)) {
        let mut view = lock(&self.view);
        if view.generation == self.generation {
            f(&mut view);
        } else {
            log::debug!("Dropping event from stale link {}", self.generation);
        }
    }
}

/// A running connection task and the channels that feed it.
pub(crate) struct Link {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    size_tx: watch::Sender<TermSize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    pub(crate) fn spawn(config: LinkConfig, view: Arc<Mutex<View>>, generation: u64) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (size_tx, size_rx) = watch::channel(config.size);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let view = ViewHandle { view, generation };
        let task = tokio::spawn(run(config, view, input_rx, size_rx, shutdown_rx));
        Self {
            input_tx,
            size_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Queue keystrokes; they are written once the shell is ready.
    pub(crate) fn send_input(&self, bytes: &[u8]) {
        let _ = self.input_tx.send(bytes.to_vec());
    }

    /// Latest size wins; intermediate sizes may be skipped.
    pub(crate) fn resize(&self, size: TermSize) {
        self.size_tx.send_replace(size);
    }

    /// Close the socket and wait for the task to finish.
    pub(crate) async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Terminal link task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connect(config: &LinkConfig) -> Result<Socket, tokio_tungstenite::tungstenite::Error> {
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((socket, _response)) => return Ok(socket),
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Gateway connect attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run(
    config: LinkConfig,
    view: ViewHandle,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut size_rx: watch::Receiver<TermSize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    view.with(|v| v.advance(ConnectionState::Connecting));

    let socket = tokio::select! {
        _ = &mut shutdown_rx => return,
        result = connect(&config) => result,
    };
    let socket = match socket {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("Giving up on gateway {}: {}", config.url, e);
            view.with(|v| v.on_transport_failed(format!("could not reach the terminal gateway: {}", e)));
            return;
        }
    };
    log::debug!("Terminal link {} connected", view.generation);
    let (mut tx, mut rx) = socket.split();
    let mut ready = false;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = tx.send(Message::Close(None)).await;
                let _ = tx.flush().await;
                break;
            }
            msg = rx.next() => {
                let frame = match msg {
                    Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(bytes),
                    Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                    Some(Ok(Message::Close(_))) | None => {
                        view.with(View::on_transport_closed);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::debug!("Terminal link {} read error: {}", view.generation, e);
                        view.with(View::on_transport_closed);
                        break;
                    }
                };
                match ServerEvent::from_frame(frame) {
                    Ok(ServerEvent::Data(bytes)) => view.with(|v| v.on_data(&bytes)),
                    Ok(ServerEvent::Status(status)) => view.with(|v| v.on_status(status)),
                    Ok(ServerEvent::Error(error)) => view.with(|v| v.on_error(error)),
                    Ok(ServerEvent::Ready) => {
                        view.with(View::on_ready);
                        ready = true;
                        // sync the pty with whatever the surface measures now
                        let size = *size_rx.borrow_and_update();
                        if send(&mut tx, ClientEvent::Resize(size)).await.is_err() {
                            view.with(View::on_transport_closed);
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring bad frame from gateway: {}", e),
                }
            }
            Some(bytes) = input_rx.recv(), if ready => {
                if send(&mut tx, ClientEvent::Data(bytes)).await.is_err() {
                    view.with(View::on_transport_closed);
                    break;
                }
            }
            Ok(()) = size_rx.changed(), if ready => {
                let size = *size_rx.borrow_and_update();
                if send(&mut tx, ClientEvent::Resize(size)).await.is_err() {
                    view.with(View::on_transport_closed);
                    break;
                }
            }
        }
    }
    log::debug!("Terminal link {} finished", view.generation);
}

async fn send(
    tx: &mut futures::stream::SplitSink<Socket, Message>,
    event: ClientEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
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
