//! Session Registry: the single owner of live shell sessions.
//!
//! Each [`SessionKey`] has its own async slot lock, so two tabs racing to open
//! the same terminal produce one shell while unrelated keys never wait on each
//! other. The outer map lock is only held to look a slot up.
//!
//! Shell output reaches each attached connection through its own bounded
//! queue. A full queue pauses the shell instead of dropping bytes.

use crate::error::ConnectError;
use crate::lock;
use crate::protocol::TermSize;
use crate::ssh::{ConnectProgress, ProgressSink, ShellConnector, ShellHandle, ShellOutput, SshConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};

/// Identifies one logical terminal: a server as seen by one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub server_id: u64,
    pub user_id: u64,
}

impl SessionKey {
    pub fn new(server_id: u64, user_id: u64) -> Self {
        Self { server_id, user_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {} / user {}", self.server_id, self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Authenticating,
    Ready,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Ready)
    }
}

/// One live authenticated shell.
///
/// Sessions only enter the table once the connector has returned, so their
/// status starts at `Ready`. While a key is still connecting or authenticating
/// it shows up in [`SessionRegistry::sessions`] as a pending row instead.
pub struct ShellSession {
    id: u64,
    key: SessionKey,
    handle: ShellHandle,
    auth_method: &'static str,
    /// One queue per attached connection.
    subscribers: Mutex<Vec<mpsc::Sender<ShellOutput>>>,
    output_buffer: usize,
    /// Gateway connections attached; only touched under the slot lock.
    attached: AtomicUsize,
    state: Mutex<SessionState>,
}

struct SessionState {
    status: SessionStatus,
    last_error: Option<String>,
}

impl ShellSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn auth_method(&self) -> &'static str {
        self.auth_method
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    pub fn size(&self) -> TermSize {
        self.handle.size()
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.status().is_live() && !self.handle.is_closed()
    }

    /// Forward input to the shell. Best-effort.
    pub fn write(&self, bytes: &[u8]) {
        self.handle.write(bytes);
    }

    pub fn resize(&self, size: TermSize) {
        self.handle.resize(size);
    }

    /// Hand `output` to every attached connection, waiting on any whose
    /// queue is full.
    async fn deliver(&self, output: ShellOutput) {
        let subscribers = lock(&self.subscribers).clone();
        let mut gone = false;
        for subscriber in &subscribers {
            if subscriber.send(output.clone()).await.is_err() {
                gone = true;
            }
        }
        if gone {
            lock(&self.subscribers).retain(|s| !s.is_closed());
        }
    }

    fn finish(&self, error: Option<String>) {
        let mut state = lock(&self.state);
        if state.status.is_live() {
            state.status = if error.is_some() {
                SessionStatus::Error
            } else {
                SessionStatus::Closed
            };
        }
        if error.is_some() {
            state.last_error = error;
        }
        drop(state);
        self.handle.close();
    }
}

/// A gateway connection's view of a session: the session plus its own output
/// queue.
pub struct Attachment {
    pub session: Arc<ShellSession>,
    pub output: mpsc::Receiver<ShellOutput>,
    /// True when an already-live shell was joined instead of opened.
    pub reused: bool,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("session_id", &self.session.id())
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

/// Row of the session listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub server_id: u64,
    pub user_id: u64,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub attached: usize,
    pub auth_method: Option<&'static str>,
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<ShellSession>>,
}

/// Exclusive hold on one key's slot. Dropping it, also when the holder is
/// cancelled mid-open, clears the key's pending row and forgets the slot if it
/// was left empty.
struct SlotLease {
    // Dropped before `cleanup`, so the slot is unlocked by the time it prunes.
    guard: OwnedMutexGuard<Slot>,
    cleanup: LeaseCleanup,
}

struct LeaseCleanup {
    registry: SessionRegistry,
    key: SessionKey,
    pending: bool,
}

impl SlotLease {
    fn set_pending(&mut self, status: SessionStatus) {
        lock(&self.cleanup.registry.inner.pending).insert(self.cleanup.key, status);
        self.cleanup.pending = true;
    }

    fn clear_pending(&mut self) {
        self.cleanup.clear_pending();
    }
}

impl LeaseCleanup {
    fn clear_pending(&mut self) {
        if std::mem::take(&mut self.pending) {
            lock(&self.registry.inner.pending).remove(&self.key);
        }
    }
}

impl Deref for SlotLease {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.guard
    }
}

impl DerefMut for SlotLease {
    fn deref_mut(&mut self) -> &mut Slot {
        &mut self.guard
    }
}

impl Drop for LeaseCleanup {
    fn drop(&mut self) {
        self.clear_pending();
        self.registry.prune(self.key);
    }
}

struct Inner {
    connector: Arc<dyn ShellConnector>,
    connect_timeout: Duration,
    output_buffer: usize,
    slots: Mutex<HashMap<SessionKey, Arc<AsyncMutex<Slot>>>>,
    /// Keys whose shell is being opened, with the latest progress.
    pending: Mutex<HashMap<SessionKey, SessionStatus>>,
    next_id: AtomicU64,
}

/// Maps [`SessionKey`] to at most one live [`ShellSession`].
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        connect_timeout: Duration,
        output_buffer: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                connect_timeout,
                output_buffer: output_buffer.max(1),
                slots: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Join the live session for `key`, or open one. Concurrent callers for the
    /// same key wait for the first one's attempt and then share its shell.
    pub async fn acquire(
        &self,
        key: SessionKey,
        config: &SshConfig,
        progress: ProgressSink,
    ) -> Result<Attachment, ConnectError> {
        let mut lease = self.lease(key).await;

        if let Some(session) = lease.session.as_ref().filter(|s| s.is_live()) {
            log::info!("Joining live shell for {}", key);
            return Ok(attach(session, true));
        }
        // A session that died between its close and its release is replaced.
        lease.session = None;

        lease.set_pending(SessionStatus::Connecting);
        let progress = {
            let inner = self.inner.clone();
            progress.observed(move |p| {
                let status = match p {
                    ConnectProgress::Handshake => SessionStatus::Connecting,
                    ConnectProgress::Authenticating { .. } => SessionStatus::Authenticating,
                };
                if let Some(pending) = lock(&inner.pending).get_mut(&key) {
                    *pending = status;
                }
            })
        };

        log::info!("Opening shell for {} on {}:{}", key, config.host, config.port);
        let opened = tokio::time::timeout(
            self.inner.connect_timeout,
            self.inner.connector.open(config, &progress),
        )
        .await;
        lease.clear_pending();

        let opened = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                log::warn!("Shell for {} failed to open: {}", key, e);
                return Err(e);
            }
            Err(_) => {
                log::warn!(
                    "Shell for {} timed out after {:?}",
                    key,
                    self.inner.connect_timeout
                );
                return Err(ConnectError::Timeout(self.inner.connect_timeout));
            }
        };

        let mut handle = opened.handle;
        let output_rx = handle.take_output();
        let session = Arc::new(ShellSession {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            key,
            handle,
            auth_method: opened.auth_method,
            subscribers: Mutex::new(Vec::new()),
            output_buffer: self.inner.output_buffer,
            attached: AtomicUsize::new(0),
            state: Mutex::new(SessionState {
                status: SessionStatus::Ready,
                last_error: None,
            }),
        });
        let attachment = attach(&session, false);

        if let Some(rx) = output_rx {
            tokio::spawn(fan_out(self.clone(), session.clone(), rx));
        }
        lease.session = Some(session.clone());
        log::info!(
            "Shell {} ready for {} (auth: {})",
            session.id,
            key,
            session.auth_method
        );
        Ok(attachment)
    }

    /// Drop one gateway connection's hold on a session. The last one out closes
    /// the shell.
    pub async fn detach(&self, key: SessionKey, session_id: u64) {
        let Some(mut lease) = self.existing_lease(key).await else {
            return;
        };
        let Some(session) = lease.session.clone().filter(|s| s.id == session_id) else {
            return;
        };
        let remaining = session.attached.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            log::info!("Last connection left {}, closing shell {}", key, session_id);
            lease.session = None;
            session.finish(None);
        } else {
            log::debug!("{} connection(s) still on {}", remaining, key);
        }
    }

    /// Tear down `session_id` for `key` if it is still the registered session.
    /// Returns whether anything was removed.
    pub async fn release(&self, key: SessionKey, session_id: u64, error: Option<String>) -> bool {
        let Some(mut lease) = self.existing_lease(key).await else {
            return false;
        };
        if lease.session.as_ref().map(|s| s.id) != Some(session_id) {
            return false;
        }
        if let Some(session) = lease.session.take() {
            session.finish(error);
        }
        log::info!("Released shell {} for {}", session_id, key);
        true
    }

    /// The live session for `key`, if any. Never waits on an in-flight open.
    pub fn get(&self, key: SessionKey) -> Option<Arc<ShellSession>> {
        let slots = lock(&self.inner.slots);
        let guard = slots.get(&key)?.try_lock().ok()?;
        let session = guard.session.clone();
        session.filter(|s| s.is_live())
    }

    /// Live and in-flight sessions.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = {
            let slots = lock(&self.inner.slots);
            let rows: Vec<SessionSummary> = slots
                .values()
                .filter_map(|slot| {
                    let guard = slot.try_lock().ok()?;
                    let session = guard.session.as_ref()?;
                    let size = session.size();
                    Some(SessionSummary {
                        server_id: session.key.server_id,
                        user_id: session.key.user_id,
                        status: session.status(),
                        cols: size.cols,
                        rows: size.rows,
                        attached: session.attached(),
                        auth_method: Some(session.auth_method),
                    })
                })
                .collect();
            rows
        };
        summaries.extend(lock(&self.inner.pending).iter().map(|(key, status)| SessionSummary {
            server_id: key.server_id,
            user_id: key.user_id,
            status: *status,
            cols: 0,
            rows: 0,
            attached: 0,
            auth_method: None,
        }));
        summaries.sort_by_key(|s| (s.server_id, s.user_id));
        summaries
    }

    pub fn live_count(&self) -> usize {
        self.sessions()
            .iter()
            .filter(|s| s.status == SessionStatus::Ready)
            .count()
    }

    /// Close every live shell.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = lock(&self.inner.slots).drain().collect();
        for (key, slot) in slots {
            if let Some(session) = slot.lock().await.session.take() {
                log::info!("Closing shell {} for {} on shutdown", session.id, key);
                session.finish(None);
            }
        }
    }

    async fn lease(&self, key: SessionKey) -> SlotLease {
        let slot = lock(&self.inner.slots).entry(key).or_default().clone();
        self.leased(key, slot).await
    }

    async fn existing_lease(&self, key: SessionKey) -> Option<SlotLease> {
        let slot = lock(&self.inner.slots).get(&key).cloned()?;
        Some(self.leased(key, slot).await)
    }

    async fn leased(&self, key: SessionKey, slot: Arc<AsyncMutex<Slot>>) -> SlotLease {
        SlotLease {
            guard: slot.lock_owned().await,
            cleanup: LeaseCleanup {
                registry: self.clone(),
                key,
                pending: false,
            },
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    /// Forget an empty slot nobody else is holding. Slot references outside
    /// the map only live inside a [`SlotLease`], which prunes on drop, and
    /// readers inspect slots under the map lock without cloning them.
    fn prune(&self, key: SessionKey) {
        let mut slots = lock(&self.inner.slots);
        let idle = slots.get(&key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|s| s.session.is_none()).unwrap_or(false)
        });
        if idle {
            slots.remove(&key);
        }
    }
}

fn attach(session: &Arc<ShellSession>, reused: bool) -> Attachment {
    session.attached.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::channel(session.output_buffer);
    lock(&session.subscribers).push(tx);
    Attachment {
        session: session.clone(),
        output: rx,
        reused,
    }
}

/// Copy shell output to every attached connection, then release the session
/// once the shell is gone.
async fn fan_out(
    registry: SessionRegistry,
    session: Arc<ShellSession>,
    mut rx: mpsc::Receiver<ShellOutput>,
) {
    let error = loop {
        match rx.recv().await {
            Some(ShellOutput::Data(bytes)) => session.deliver(ShellOutput::Data(bytes)).await,
            Some(ShellOutput::Closed { error }) => break error,
            None => break None,
        }
    };
    session.finish(error.clone());
    session
        .deliver(ShellOutput::Closed {
            error: error.clone(),
        })
        .await;
    lock(&session.subscribers).clear();
    registry.release(session.key, session.id, error).await;
}
