//! Client Terminal Adapter: drives one terminal surface against the gateway.
//!
//! The adapter owns the surface and at most one [`link::Link`] at a time.
//! Reconnecting or changing display preferences always disposes the current
//! link before a new one is opened.

mod link;

use crate::error::ErrorCategory;
use crate::lock;
use crate::protocol::{
    ConnectParams, ConnectionState, ErrorPayload, LinkStatus, StatusPayload, TermSize,
};
use crate::terminal::{DisplayPreferences, Notice, TerminalSurface, Viewport};
use link::{Link, LinkConfig};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("reconnect requested too soon, try again in {}ms", .0.as_millis())]
    ReconnectCooldown(Duration),
    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),
}

/// What the panel knows about the server whose terminal is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u64,
    pub address: Option<String>,
    pub ready: bool,
}

impl ServerInfo {
    fn is_reachable(&self) -> bool {
        self.ready && self.address.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct TerminalOptions {
    /// `ws://host:port/terminal`, without a query string.
    pub gateway_url: String,
    pub server: ServerInfo,
    pub user_id: u64,
    pub display: DisplayPreferences,
    /// Area of the element the terminal is mounted in.
    pub container: Viewport,
    /// Area used while fullscreen.
    pub screen: Viewport,
    /// Attempts at opening the WebSocket itself before giving up.
    pub max_transport_attempts: u32,
    pub transport_retry_delay: Duration,
    /// Minimum spacing between user-triggered reconnects.
    pub reconnect_cooldown: Duration,
}

impl TerminalOptions {
    pub fn new(gateway_url: impl Into<String>, server: ServerInfo, user_id: u64) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            server,
            user_id,
            display: DisplayPreferences::default(),
            container: Viewport::new(800, 480),
            screen: Viewport::new(1920, 1080),
            max_transport_attempts: 3,
            transport_retry_delay: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(1),
        }
    }
}

/// A failure as the user sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorView {
    pub category: ErrorCategory,
    pub message: String,
}

impl ErrorView {
    pub fn headline(&self) -> &'static str {
        self.category.headline()
    }

    pub fn hints(&self) -> &'static [&'static str] {
        self.category.troubleshooting()
    }
}

/// State shared between the adapter and its current link.
pub(crate) struct View {
    /// Bumped for every link; events from older links are dropped.
    generation: u64,
    state: ConnectionState,
    history: Vec<ConnectionState>,
    status_message: Option<String>,
    last_error: Option<ErrorView>,
    surface: TerminalSurface,
    state_tx: watch::Sender<ConnectionState>,
}

impl View {
    fn new(size: TermSize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Init);
        Self {
            generation: 0,
            state: ConnectionState::Init,
            history: Vec::new(),
            status_message: None,
            last_error: None,
            surface: TerminalSurface::new(size),
            state_tx,
        }
    }

    fn begin(&mut self, generation: u64) {
        self.generation = generation;
        self.state = ConnectionState::Init;
        self.history.clear();
        self.status_message = None;
        self.last_error = None;
        self.state_tx.send_replace(ConnectionState::Init);
    }

    pub(crate) fn advance(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        match self.state.advance(next) {
            Ok(()) => {
                self.history.push(next);
                self.state_tx.send_replace(next);
            }
            Err(e) => log::debug!("Terminal view: {}", e),
        }
    }

    fn fail(&mut self, category: ErrorCategory, message: String) {
        self.surface
            .write_notice(Notice::Error, &format!("{}: {}", category.headline(), message));
        for hint in category.troubleshooting() {
            self.surface.write_notice(Notice::Warning, hint);
        }
        self.last_error = Some(ErrorView { category, message });
        self.advance(ConnectionState::Error);
    }

    fn disconnected(&mut self, message: String) {
        let category = ErrorCategory::UnexpectedDisconnect;
        self.surface
            .write_notice(Notice::Warning, &format!("{}: {}", category.headline(), message));
        for hint in category.troubleshooting() {
            self.surface.write_notice(Notice::Info, hint);
        }
        self.last_error = Some(ErrorView { category, message });
        self.advance(ConnectionState::Closed);
    }

    pub(crate) fn on_data(&mut self, bytes: &[u8]) {
        self.surface.process(bytes);
    }

    pub(crate) fn on_status(&mut self, status: StatusPayload) {
        if self.state.is_terminal() {
            return;
        }
        match status.status {
            LinkStatus::Connecting => {
                self.advance(ConnectionState::Connecting);
                let text = status.message.as_deref().unwrap_or("Connecting...");
                self.surface.write_notice(Notice::Info, text);
            }
            LinkStatus::AuthInProgress => {
                self.advance(ConnectionState::Authenticating);
                let text = status.message.as_deref().unwrap_or("Authenticating...");
                self.surface.write_notice(Notice::Info, text);
            }
            LinkStatus::Connected => {
                let text = status.message.as_deref().unwrap_or("Connected");
                self.surface.write_notice(Notice::Success, text);
            }
            LinkStatus::Disconnected => {
                let message = status
                    .message
                    .clone()
                    .unwrap_or_else(|| "The connection was closed.".to_string());
                self.disconnected(message);
            }
        }
        if status.message.is_some() {
            self.status_message = status.message;
        }
    }

    pub(crate) fn on_ready(&mut self) {
        self.advance(ConnectionState::Ready);
    }

    pub(crate) fn on_error(&mut self, error: ErrorPayload) {
        if !self.state.is_terminal() {
            self.fail(error.category, error.message);
        }
    }

    pub(crate) fn on_transport_closed(&mut self) {
        if !self.state.is_terminal() {
            self.disconnected("The connection to the terminal gateway was lost.".to_string());
        }
    }

    pub(crate) fn on_transport_failed(&mut self, message: String) {
        if !self.state.is_terminal() {
            self.fail(ErrorCategory::Network, message);
        }
    }
}

/// One mounted terminal.
pub struct TerminalAdapter {
    options: TerminalOptions,
    view: Arc<Mutex<View>>,
    link: Option<Link>,
    generation: u64,
    size: TermSize,
    fullscreen: bool,
    last_reconnect: Option<Instant>,
}

impl TerminalAdapter {
    /// Create the surface and start connecting. A server without an address
    /// is reported as not ready and no connection is opened.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mount(options: TerminalOptions) -> Result<Self, ClientError> {
        let url = options.gateway_url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) || url.contains('?') {
            return Err(ClientError::InvalidUrl(options.gateway_url.clone()));
        }
        let size = options.container.fit(options.display.font_size_px);
        let mut adapter = Self {
            view: Arc::new(Mutex::new(View::new(size))),
            options,
            link: None,
            generation: 0,
            size,
            fullscreen: false,
            last_reconnect: None,
        };
        adapter.start();
        Ok(adapter)
    }

    fn start(&mut self) {
        self.generation += 1;
        let mut view = lock(&self.view);
        view.begin(self.generation);

        let server = &self.options.server;
        if !server.is_reachable() {
            log::info!("Server {} has no address yet, not connecting", server.id);
            view.fail(
                ErrorCategory::Precondition,
                "the server does not have an IP address yet".to_string(),
            );
            return;
        }
        drop(view);

        let params = ConnectParams {
            server_id: server.id,
            user_id: self.options.user_id,
            cols: Some(self.size.cols),
            rows: Some(self.size.rows),
        };
        let config = LinkConfig {
            url: format!("{}?{}", self.options.gateway_url.trim(), params.to_query()),
            size: self.size,
            max_attempts: self.options.max_transport_attempts,
            retry_delay: self.options.transport_retry_delay,
        };
        log::info!(
            "Opening terminal link {} for server {}",
            self.generation,
            server.id
        );
        self.link = Some(Link::spawn(config, self.view.clone(), self.generation));
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }

    /// Forward keystrokes or pasted text verbatim.
    pub fn send_input(&self, bytes: &[u8]) {
        if let Some(link) = &self.link {
            link.send_input(bytes);
        }
    }

    /// The mount container changed size.
    pub fn resize(&mut self, container: Viewport) {
        self.options.container = container;
        self.refit();
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
        self.refit();
    }

    fn refit(&mut self) {
        let viewport = if self.fullscreen {
            self.options.screen
        } else {
            self.options.container
        };
        let size = viewport.fit(self.options.display.font_size_px);
        if size == self.size {
            return;
        }
        self.size = size;
        lock(&self.view).surface.resize(size);
        if let Some(link) = &self.link {
            link.resize(size);
        }
    }

    /// Clear the surface, drop the current connection and open a new one.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        if let Some(last) = self.last_reconnect {
            let elapsed = now.duration_since(last);
            if elapsed < self.options.reconnect_cooldown {
                return Err(ClientError::ReconnectCooldown(
                    self.options.reconnect_cooldown - elapsed,
                ));
            }
        }
        self.last_reconnect = Some(now);

        self.teardown().await;
        lock(&self.view).surface.clear();
        self.start();
        Ok(())
    }

    /// Rebuild the terminal with new display settings. The session is reset
    /// even when only the font changes.
    pub async fn set_display_preferences(&mut self, display: DisplayPreferences) {
        if display == self.options.display {
            return;
        }
        log::info!(
            "Display changed to {}px {}, rebuilding terminal",
            display.font_size_px,
            display.font_family
        );
        self.teardown().await;
        self.options.display = display;
        let viewport = if self.fullscreen {
            self.options.screen
        } else {
            self.options.container
        };
        self.size = viewport.fit(self.options.display.font_size_px);
        lock(&self.view).surface = TerminalSurface::new(self.size);
        self.start();
    }

    /// Close the connection for good, as on unmount.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
        let mut view = lock(&self.view);
        if !view.state.is_terminal() && view.state != ConnectionState::Init {
            view.surface.write_notice(Notice::Info, "Disconnected");
            view.advance(ConnectionState::Closed);
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.view).state
    }

    /// States the current connection has passed through, oldest first.
    pub fn state_history(&self) -> Vec<ConnectionState> {
        lock(&self.view).history.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        lock(&self.view).state_tx.subscribe()
    }

    pub fn status_message(&self) -> Option<String> {
        lock(&self.view).status_message.clone()
    }

    pub fn last_error(&self) -> Option<ErrorView> {
        lock(&self.view).last_error.clone()
    }

    /// Visible screen text.
    pub fn screen_text(&self) -> String {
        lock(&self.view).surface.screen_text()
    }

    /// Scrollback and screen text.
    pub fn text(&self) -> String {
        lock(&self.view).surface.text()
    }

    /// Shell output received by the current surface, byte for byte.
    pub fn output_log(&self) -> Vec<u8> {
        lock(&self.view).surface.output_log()
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn display(&self) -> &DisplayPreferences {
        &self.options.display
    }

    /// Whether a gateway connection is currently owned by this adapter.
    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_ready() -> TerminalOptions {
        let server = ServerInfo {
            id: 12,
            address: None,
            ready: false,
        };
        TerminalOptions::new("ws://127.0.0.1:9/terminal", server, 3)
    }

    #[tokio::test]
    async fn test_not_ready_server_never_links() {
        let adapter = TerminalAdapter::mount(not_ready()).unwrap();
        assert!(!adapter.has_link());
        assert_eq!(adapter.state(), ConnectionState::Error);
        assert_eq!(adapter.state_history(), vec![ConnectionState::Error]);
        let error = adapter.last_error().unwrap();
        assert_eq!(error.category, ErrorCategory::Precondition);
        assert!(adapter.screen_text().contains("Server Not Ready"));
    }

    #[tokio::test]
    async fn test_reconnect_cooldown() {
        let mut adapter = TerminalAdapter::mount(not_ready()).unwrap();
        adapter.reconnect().await.unwrap();
        let err = adapter.reconnect().await.unwrap_err();
        assert!(matches!(err, ClientError::ReconnectCooldown(_)));
    }

    #[tokio::test]
    async fn test_reconnect_clears_surface() {
        let mut options = not_ready();
        options.reconnect_cooldown = Duration::ZERO;
        let mut adapter = TerminalAdapter::mount(options).unwrap();
        adapter.reconnect().await.unwrap();
        adapter.reconnect().await.unwrap();
        // only the latest attempt's banner is on screen
        assert_eq!(adapter.text().matches("Server Not Ready").count(), 1);
    }

    #[tokio::test]
    async fn test_fullscreen_changes_size() {
        let mut adapter = TerminalAdapter::mount(not_ready()).unwrap();
        let windowed = adapter.size();
        assert_eq!(windowed, Viewport::new(800, 480).fit(14));

        adapter.set_fullscreen(true);
        assert_eq!(adapter.size(), Viewport::new(1920, 1080).fit(14));
        adapter.set_fullscreen(false);
        assert_eq!(adapter.size(), windowed);
    }

    #[tokio::test]
    async fn test_font_change_refits() {
        let mut adapter = TerminalAdapter::mount(not_ready()).unwrap();
        let before = adapter.size();
        adapter
            .set_display_preferences(DisplayPreferences {
                font_size_px: 18,
                ..Default::default()
            })
            .await;
        assert!(adapter.size().cols < before.cols);
        assert_eq!(adapter.display().font_size_px, 18);
    }

    #[test]
    fn test_rejects_bad_url() {
        let mut options = not_ready();
        options.gateway_url = "http://example.com/terminal".to_string();
        assert!(matches!(
            TerminalAdapter::mount(options),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
