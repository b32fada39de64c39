use super::connector::{
    close_requested, ConnectProgress, OpenedShell, ProgressSink, ShellConnector, ShellEndpoint, ShellHandle,
    ShellOutput,
};
use super::{SshAuth, SshConfig};
use crate::error::ConnectError;
use crate::protocol::TermSize;
use async_trait::async_trait;
use russh::client;
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;

/// Opens shells over SSH with russh.
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open(
        &self,
        config: &SshConfig,
        progress: &ProgressSink,
    ) -> Result<OpenedShell, ConnectError> {
        let mut session = SshSession::new(config.clone());
        progress.report(ConnectProgress::Handshake);
        let auth_method = session.connect(self.config.clone(), progress).await?;
        let channel = match session.open_shell(config.size).await {
            Ok(channel) => channel,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        let (handle, endpoint) = ShellHandle::pair(config.size);
        tokio::spawn(pump(session, channel, endpoint));
        Ok(OpenedShell {
            handle,
            auth_method,
        })
    }
}

/// One SSH connection.
struct SshSession {
    config: SshConfig,
    handle: Option<client::Handle<SshHandler>>,
}

/// Minimal SSH client handler.
struct SshHandler {
    host: String,
}

impl client::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Freshly provisioned hosts have no pinned key yet.
        log::info!(
            "Accepting host key {} for {}",
            server_public_key.fingerprint(HashAlg::Sha256),
            self.host
        );
        Ok(true)
    }
}

impl SshSession {
    fn new(config: SshConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// Establish the connection and authenticate, trying each configured method
    /// in turn. Returns the method that was accepted.
    async fn connect(
        &mut self,
        client_config: Arc<client::Config>,
        progress: &ProgressSink,
    ) -> Result<&'static str, ConnectError> {
        let handler = SshHandler {
            host: self.config.host.clone(),
        };
        let mut session = client::connect(
            client_config,
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| classify(&e))?;

        let mut tried = Vec::new();
        for auth in &self.config.auth {
            let method = auth.method_name();
            progress.report(ConnectProgress::Authenticating { method });
            tried.push(method);

            let result = match auth {
                SshAuth::Password(password) => session
                    .authenticate_password(&self.config.username, password)
                    .await
                    .map_err(|e| classify_russh(&e))?,
                SshAuth::KeyFile { path, passphrase } => {
                    let key_pair = match load_secret_key(path, passphrase.as_deref()) {
                        Ok(key) => key,
                        Err(e) => {
                            log::warn!("Skipping unreadable key {}: {}", path, e);
                            continue;
                        }
                    };
                    let pk = PrivateKeyWithHashAlg::new(Arc::new(key_pair), None);
                    session
                        .authenticate_publickey(&self.config.username, pk)
                        .await
                        .map_err(|e| classify_russh(&e))?
                }
            };

            match result {
                client::AuthResult::Success => {
                    log::info!(
                        "SSH connected to {}:{} as {} via {}",
                        self.config.host,
                        self.config.port,
                        self.config.username,
                        method
                    );
                    self.handle = Some(session);
                    return Ok(method);
                }
                client::AuthResult::Failure { .. } => {
                    log::info!("{} rejected {} auth", self.config.host, method);
                }
            }
        }

        let _ = session
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await;
        if tried.is_empty() {
            Err(ConnectError::AuthFailure(
                "no credential available for this server".to_string(),
            ))
        } else {
            Err(ConnectError::AuthFailure(format!(
                "server rejected {}",
                tried.join(", ")
            )))
        }
    }

    /// Open an interactive shell channel with a pty.
    async fn open_shell(&self, size: TermSize) -> Result<russh::Channel<client::Msg>, ConnectError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| ConnectError::Network("not connected".to_string()))?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| classify_russh(&e))?;
        channel
            .request_pty(
                false,
                "xterm-256color",
                size.cols.into(),
                size.rows.into(),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| classify_russh(&e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| classify_russh(&e))?;
        Ok(channel)
    }

    async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "User disconnect", "en")
                .await
            {
                log::debug!("Disconnect from {} failed: {}", self.config.host, e);
            }
        }
    }
}

/// Shuttle bytes between the shell channel and its endpoint until either side ends.
async fn pump(
    mut session: SshSession,
    mut channel: russh::Channel<client::Msg>,
    mut endpoint: ShellEndpoint,
) {
    endpoint.size_rx.borrow_and_update();
    let host = session.config.host.clone();

    let error = loop {
        tokio::select! {
            Some(bytes) = endpoint.input_rx.recv() => {
                if let Err(e) = channel.data(&bytes[..]).await {
                    break Some(format!("write to shell failed: {}", e));
                }
            }
            Ok(()) = endpoint.size_rx.changed() => {
                let size = *endpoint.size_rx.borrow_and_update();
                if let Err(e) = channel
                    .window_change(size.cols.into(), size.rows.into(), 0, 0)
                    .await
                {
                    log::warn!("Resize on {} failed: {}", host, e);
                }
            }
            _ = close_requested(&mut endpoint.close_rx) => {
                let _ = channel.eof().await;
                break None;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if endpoint.output_tx.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                        break None;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    if endpoint.output_tx.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                        break None;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    log::info!("Shell on {} exited with status {}", host, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break None,
                Some(_) => {}
            }
        }
    };

    if let Some(reason) = &error {
        log::warn!("Shell on {} failed: {}", host, reason);
    }
    let _ = endpoint.output_tx.send(ShellOutput::Closed { error }).await;
    session.disconnect().await;
}

/// Map a connect failure onto the user-facing taxonomy.
fn classify(err: &anyhow::Error) -> ConnectError {
    if let Some(e) = err.downcast_ref::<russh::Error>() {
        return classify_russh(e);
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return ConnectError::from_io(io);
    }
    ConnectError::Network(err.to_string())
}

fn classify_russh(err: &russh::Error) -> ConnectError {
    match err {
        russh::Error::IO(io) => ConnectError::from_io(io),
        other => ConnectError::Network(other.to_string()),
    }
}
