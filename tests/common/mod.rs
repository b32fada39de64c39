#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shell_bridge::client::{ServerInfo, TerminalAdapter, TerminalOptions};
use shell_bridge::config::{GatewayConfig, ServerEntry};
use shell_bridge::gateway::{self, GatewayState, LoginDefaults};
use shell_bridge::inventory::ConfigInventory;
use shell_bridge::protocol::{ConnectionState, ServerEvent, TermSize, WireFrame};
use shell_bridge::ssh::{
    connector::close_requested, ConnectProgress, OpenedShell, ProgressSink, ShellConnector,
    ShellEndpoint, ShellHandle, ShellOutput, SshConfig,
};
use shell_bridge::{ConnectError, SessionRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const PROMPT: &[u8] = b"root@vps:~# ";
pub const CREDENTIAL_KEY: [u8; 32] = [0x5a; 32];

/// Server with an address and a pre-provisioned key only.
pub const KEY_SERVER: u64 = 1;
/// Server still waiting for an address.
pub const PENDING_SERVER: u64 = 2;
/// Server with a stored root password as well as the key.
pub const PASSWORD_SERVER: u64 = 3;

/// In-memory shell: echoes input back, remembers what it was sent and its
/// last pty size. Input `exit\n` ends the shell.
pub struct EchoConnector {
    pub opens: AtomicUsize,
    /// Shells currently running.
    pub live: Arc<AtomicUsize>,
    /// Auth methods the fake server accepts.
    accepts: Mutex<Vec<&'static str>>,
    delay: Mutex<Duration>,
    pub input: Arc<Mutex<Vec<u8>>>,
    pub last_size: Arc<Mutex<Option<TermSize>>>,
}

impl EchoConnector {
    pub fn accepting(methods: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            accepts: Mutex::new(methods.to_vec()),
            delay: Mutex::new(Duration::ZERO),
            input: Arc::new(Mutex::new(Vec::new())),
            last_size: Arc::new(Mutex::new(None)),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn last_size(&self) -> Option<TermSize> {
        *self.last_size.lock().unwrap()
    }
}

#[async_trait]
impl ShellConnector for EchoConnector {
    async fn open(
        &self,
        config: &SshConfig,
        progress: &ProgressSink,
    ) -> Result<OpenedShell, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        progress.report(ConnectProgress::Handshake);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let accepts = self.accepts.lock().unwrap().clone();
        let mut method = None;
        for auth in &config.auth {
            progress.report(ConnectProgress::Authenticating {
                method: auth.method_name(),
            });
            if accepts.contains(&auth.method_name()) {
                method = Some(auth.method_name());
                break;
            }
        }
        let Some(auth_method) = method else {
            return Err(ConnectError::AuthFailure("server rejected every credential".into()));
        };

        let (handle, endpoint) = ShellHandle::pair(config.size);
        *self.last_size.lock().unwrap() = Some(config.size);
        tokio::spawn(echo_shell(
            endpoint,
            self.live.clone(),
            self.input.clone(),
            self.last_size.clone(),
        ));
        Ok(OpenedShell {
            handle,
            auth_method,
        })
    }
}

async fn echo_shell(
    mut endpoint: ShellEndpoint,
    live: Arc<AtomicUsize>,
    input: Arc<Mutex<Vec<u8>>>,
    last_size: Arc<Mutex<Option<TermSize>>>,
) {
    live.fetch_add(1, Ordering::SeqCst);
    let _ = endpoint
        .output_tx
        .send(ShellOutput::Data(PROMPT.to_vec()))
        .await;
    loop {
        tokio::select! {
            Some(bytes) = endpoint.input_rx.recv() => {
                input.lock().unwrap().extend_from_slice(&bytes);
                if bytes == b"exit\n" {
                    break;
                }
                if endpoint.output_tx.send(ShellOutput::Data(bytes)).await.is_err() {
                    break;
                }
            }
            Ok(()) = endpoint.size_rx.changed() => {
                let size = *endpoint.size_rx.borrow_and_update();
                *last_size.lock().unwrap() = Some(size);
            }
            _ = close_requested(&mut endpoint.close_rx) => break,
        }
    }
    let _ = endpoint
        .output_tx
        .send(ShellOutput::Closed { error: None })
        .await;
    live.fetch_sub(1, Ordering::SeqCst);
}

pub fn gateway_config() -> GatewayConfig {
    let password = shell_bridge::crypto::seal_hex(&CREDENTIAL_KEY, "hunter2").unwrap();
    GatewayConfig {
        fallback_key_path: Some(PathBuf::from("/etc/panel/id_ed25519")),
        credential_key: Some(hex::encode(CREDENTIAL_KEY)),
        servers: vec![
            ServerEntry {
                id: KEY_SERVER,
                address: Some("203.0.113.5".to_string()),
                ready: true,
                sealed_password: None,
            },
            ServerEntry {
                id: PENDING_SERVER,
                address: None,
                ready: false,
                sealed_password: None,
            },
            ServerEntry {
                id: PASSWORD_SERVER,
                address: Some("203.0.113.9".to_string()),
                ready: true,
                sealed_password: Some(password),
            },
        ],
        ..Default::default()
    }
}

/// A gateway served on an ephemeral local port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: GatewayState,
    pub connector: Arc<EchoConnector>,
    task: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(connector: Arc<EchoConnector>) -> Self {
        Self::start_with(gateway_config(), connector).await
    }

    pub async fn start_with(config: GatewayConfig, connector: Arc<EchoConnector>) -> Self {
        let inventory = Arc::new(ConfigInventory::from_config(&config).unwrap());
        let registry = SessionRegistry::new(
            connector.clone(),
            config.connect_timeout(),
            config.output_buffer,
        );
        let state = GatewayState::new(
            registry,
            inventory.clone(),
            inventory,
            LoginDefaults::from_config(&config),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                let _ = gateway::serve(listener, state, std::future::pending()).await;
            }
        });
        Self {
            addr,
            state,
            connector,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/terminal", self.addr)
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.state.registry()
    }

    pub fn options(&self, server_id: u64, user_id: u64) -> TerminalOptions {
        let entry = gateway_config()
            .servers
            .into_iter()
            .find(|s| s.id == server_id);
        let server = ServerInfo {
            id: server_id,
            address: entry.as_ref().and_then(|e| e.address.clone()),
            ready: entry.map(|e| e.ready).unwrap_or(false),
        };
        let mut options = TerminalOptions::new(self.url(), server, user_id);
        options.transport_retry_delay = Duration::from_millis(50);
        options.reconnect_cooldown = Duration::ZERO;
        options
    }

    /// Plain HTTP GET against the gateway, returning status line and body.
    pub async fn http_get(&self, path: &str) -> (String, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status = response.lines().next().unwrap_or_default().to_string();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to the gateway without the adapter, to look at the wire.
pub async fn raw_connect(gateway: &TestGateway, server_id: u64, user_id: u64) -> RawSocket {
    let url = format!("{}?serverId={}&userId={}", gateway.url(), server_id, user_id);
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    socket
}

/// Next gateway event, or `None` once the socket closes.
pub async fn next_event(socket: &mut RawSocket) -> Option<ServerEvent> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a gateway event");
        let frame = match msg {
            Some(Ok(Message::Text(text))) => WireFrame::Text(text),
            Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(bytes),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        };
        return Some(ServerEvent::from_frame(frame).unwrap());
    }
}

pub async fn send_binary(socket: &mut RawSocket, bytes: &[u8]) {
    socket.send(Message::Binary(bytes.to_vec())).await.unwrap();
}

pub async fn wait_for_state(adapter: &TerminalAdapter, state: ConnectionState) {
    let mut rx = adapter.subscribe_state();
    let result = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state)).await;
    match result {
        Ok(Ok(_)) => {}
        _ => panic!(
            "adapter never reached {:?}; now {:?}, screen:\n{}",
            state,
            adapter.state(),
            adapter.text()
        ),
    }
}

/// Poll `check` until it holds, for up to five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
