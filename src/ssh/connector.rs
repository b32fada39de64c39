//! Connector seam and the channel-backed shell handle.
//!
//! A connector's job ends once the shell is interactive: it hands back a
//! [`ShellHandle`] for the caller and drives the matching [`ShellEndpoint`]
//! from a background task.

use super::SshConfig;
use crate::error::ConnectError;
use crate::protocol::TermSize;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Queued keystroke chunks per shell before input is dropped.
const INPUT_QUEUE: usize = 1024;
const OUTPUT_QUEUE: usize = 256;

/// One chunk of shell output, or the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    /// The shell is gone. `error` is set when it died rather than exited.
    Closed { error: Option<String> },
}

/// Progress milestones reported while a shell is being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectProgress {
    /// Transport and key exchange under way.
    Handshake,
    /// Trying the given authentication method.
    Authenticating { method: &'static str },
}

type Observer = Arc<dyn Fn(&ConnectProgress) + Send + Sync>;

/// Where a connector reports [`ConnectProgress`]. Reporting never fails.
#[derive(Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ConnectProgress>>,
    observer: Option<Observer>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ConnectProgress>) -> Self {
        Self {
            tx: Some(tx),
            observer: None,
        }
    }

    /// Silently discards progress.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Also call `observer` for every report.
    pub fn observed(mut self, observer: impl Fn(&ConnectProgress) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn report(&self, progress: ConnectProgress) {
        if let Some(observer) = &self.observer {
            observer(&progress);
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(progress);
        }
    }
}

/// A freshly opened, authenticated shell.
pub struct OpenedShell {
    pub handle: ShellHandle,
    /// The authentication method that succeeded.
    pub auth_method: &'static str,
}

/// Opens remote shells.
#[async_trait]
pub trait ShellConnector: Send + Sync + 'static {
    /// Open one authenticated shell. Never retries: an auth rejection or a
    /// network failure ends the attempt.
    async fn open(
        &self,
        config: &SshConfig,
        progress: &ProgressSink,
    ) -> Result<OpenedShell, ConnectError>;
}

/// Caller side of a live shell.
pub struct ShellHandle {
    input_tx: mpsc::Sender<Vec<u8>>,
    size_tx: watch::Sender<TermSize>,
    close_tx: watch::Sender<bool>,
    output_rx: Option<mpsc::Receiver<ShellOutput>>,
}

/// Backend side of a live shell, driven by the connector's I/O task.
pub struct ShellEndpoint {
    pub input_rx: mpsc::Receiver<Vec<u8>>,
    /// Latest requested pty size; only the newest value is ever observed.
    pub size_rx: watch::Receiver<TermSize>,
    pub close_rx: watch::Receiver<bool>,
    pub output_tx: mpsc::Sender<ShellOutput>,
}

impl ShellHandle {
    /// Create a connected handle/endpoint pair for a shell of `size`.
    pub fn pair(size: TermSize) -> (ShellHandle, ShellEndpoint) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (size_tx, size_rx) = watch::channel(size);
        let (close_tx, close_rx) = watch::channel(false);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        (
            ShellHandle {
                input_tx,
                size_tx,
                close_tx,
                output_rx: Some(output_rx),
            },
            ShellEndpoint {
                input_rx,
                size_rx,
                close_rx,
                output_tx,
            },
        )
    }

    /// Forward raw input to the shell. Best-effort: when the shell is gone or
    /// its input queue is full, the bytes are dropped.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.input_tx.try_send(bytes.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                log::warn!("Shell input queue full, dropping {} bytes", dropped.len());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Write to closed shell ignored");
            }
        }
    }

    /// Ask for a new pty size. A burst of resizes collapses to the last one.
    pub fn resize(&self, size: TermSize) {
        self.size_tx.send_replace(size);
    }

    pub fn size(&self) -> TermSize {
        *self.size_tx.borrow()
    }

    /// Terminate the shell. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.input_tx.is_closed()
    }

    /// Take the output stream. Yields `None` after the first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<ShellOutput>> {
        self.output_rx.take()
    }
}

impl ShellEndpoint {
    /// Resolve once the caller has asked to close (or dropped its handle).
    pub async fn closed(&mut self) {
        close_requested(&mut self.close_rx).await
    }
}

/// Resolve once `close_rx` flips to `true` or its handle is dropped.
pub async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    loop {
        if *close_rx.borrow_and_update() {
            return;
        }
        if close_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_write_preserves_order() {
        let (handle, mut endpoint) = ShellHandle::pair(TermSize::default());
        handle.write(b"l");
        handle.write(b"s");
        handle.write(b"\n");
        let mut received = Vec::new();
        for _ in 0..3 {
            received.extend(endpoint.input_rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![0x6c, 0x73, 0x0a]);
    }

    #[tokio::test]
    async fn test_resize_last_wins() {
        let (handle, mut endpoint) = ShellHandle::pair(TermSize::default());
        endpoint.size_rx.borrow_and_update();
        handle.resize(TermSize::new(80, 24));
        handle.resize(TermSize::new(100, 30));
        handle.resize(TermSize::new(120, 40));
        endpoint.size_rx.changed().await.unwrap();
        assert_eq!(*endpoint.size_rx.borrow_and_update(), TermSize::new(120, 40));
        assert!(!endpoint.size_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (handle, mut endpoint) = ShellHandle::pair(TermSize::default());
        handle.close();
        handle.close();
        endpoint.closed().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_close() {
        let (handle, mut endpoint) = ShellHandle::pair(TermSize::default());
        drop(handle);
        endpoint.closed().await;
    }

    #[test]
    fn test_write_after_close_is_silent() {
        let (handle, endpoint) = ShellHandle::pair(TermSize::default());
        drop(endpoint);
        handle.write(b"ignored");
        assert!(handle.is_closed());
    }

    #[test]
    fn test_progress_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            ProgressSink::discard().observed(move |p| seen.lock().unwrap().push(p.clone()))
        };
        sink.report(ConnectProgress::Authenticating { method: "password" });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectProgress::Authenticating { method: "password" }]
        );
    }
}
