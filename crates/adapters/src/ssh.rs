//! russh-backed [`TunnelConnector`]: known-hosts verification, password or
//! private-key authentication, and a loopback listener whose connections are
//! relayed over `direct-tcpip` channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use russh::client;
use russh_keys::key::PublicKey;
use sqlpane_core::config::SshAuth;
use sqlpane_core::events::HostKeyConfirmer;
use sqlpane_core::tunnel::{ForwardingTunnel, TunnelConnector, TunnelError, TunnelParams};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

type Session = Arc<Mutex<client::Handle<HostKeyCheck>>>;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct RusshTunnelConnector {
    bind_addr: Option<SocketAddr>,
}

impl RusshTunnelConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Local listener address; an ephemeral loopback port by default.
    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = Some(bind_addr);
        self
    }

    fn listen_addr(&self) -> SocketAddr {
        self.bind_addr
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

#[async_trait]
impl TunnelConnector for RusshTunnelConnector {
    async fn open(
        &self,
        params: &TunnelParams,
        confirmer: &HostKeyConfirmer,
    ) -> Result<ForwardingTunnel, TunnelError> {
        let handler = HostKeyCheck {
            host: params.ssh_host.clone(),
            port: params.ssh_port,
            confirmer: confirmer.clone(),
        };
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(
            config,
            (params.ssh_host.as_str(), params.ssh_port),
            handler,
        )
        .await
        .map_err(|error| match error {
            russh::Error::UnknownKey => TunnelError::HostUnconfirmed(format!(
                "{}:{}",
                params.ssh_host, params.ssh_port
            )),
            other => TunnelError::Handshake(other.to_string()),
        })?;

        let authenticated = match &params.auth {
            SshAuth::Password(password) => handle
                .authenticate_password(params.ssh_user.as_str(), password.as_str())
                .await
                .map_err(|error| TunnelError::Auth(error.to_string()))?,
            SshAuth::Key(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|error| {
                    TunnelError::Auth(format!("cannot load key {}: {error}", path.display()))
                })?;
                handle
                    .authenticate_publickey(params.ssh_user.as_str(), Arc::new(key))
                    .await
                    .map_err(|error| TunnelError::Auth(error.to_string()))?
            }
        };
        if !authenticated {
            return Err(TunnelError::Auth(format!(
                "server rejected credentials for {}",
                params.ssh_user
            )));
        }
        tracing::info!(
            "SSH authentication successful for {}@{}",
            params.ssh_user,
            params.ssh_host
        );

        let listener = TcpListener::bind(self.listen_addr())
            .await
            .map_err(|error| TunnelError::Forward(format!("cannot bind local port: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| TunnelError::Forward(error.to_string()))?;

        let serve = relay(
            listener,
            Arc::new(Mutex::new(handle)),
            params.remote_host.clone(),
            params.remote_port,
        );
        Ok(ForwardingTunnel {
            local_addr,
            serve: serve.boxed(),
        })
    }
}

struct HostKeyCheck {
    host: String,
    port: u16,
    confirmer: HostKeyConfirmer,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(russh_keys::Error::KeyChanged { line }) => {
                tracing::warn!(
                    host = %self.host,
                    line,
                    "SSH host key does not match known_hosts; refusing connection"
                );
                return Ok(false);
            }
            Err(error) => {
                tracing::debug!(%error, "known_hosts unavailable; asking for confirmation");
            }
        }

        let fingerprint = server_public_key.fingerprint();
        let accepted = self
            .confirmer
            .confirm(&format!("{}:{}", self.host, self.port), &fingerprint)
            .await;
        if accepted {
            if let Err(error) =
                russh_keys::known_hosts::learn_known_hosts(&self.host, self.port, server_public_key)
            {
                tracing::warn!(%error, "failed to record SSH host key");
            }
        }
        Ok(accepted)
    }
}

/// Accepts local connections until the session goes away. Dropping the
/// future aborts every in-flight relay.
async fn relay(listener: TcpListener, session: Session, remote_host: String, remote_port: u16) {
    let mut relays = JoinSet::new();
    let mut accept_failures = 0_u32;
    loop {
        let (local, peer) = match listener.accept().await {
            Ok(accepted) => {
                accept_failures = 0;
                accepted
            }
            Err(error) => {
                let delay = accept_backoff(accept_failures);
                accept_failures = accept_failures.saturating_add(1);
                tracing::warn!(%error, ?delay, "failed to accept tunnel connection");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        tracing::debug!(%peer, "new tunnel connection");

        let channel = {
            let handle = session.lock().await;
            if handle.is_closed() {
                tracing::info!("SSH session closed; stopping tunnel listener");
                return;
            }
            handle
                .channel_open_direct_tcpip(
                    remote_host.as_str(),
                    u32::from(remote_port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
        };
        match channel {
            Ok(channel) => {
                relays.spawn(forward(local, channel.into_stream()));
            }
            Err(error) => tracing::warn!(%error, "failed to open SSH channel"),
        }
        while relays.try_join_next().is_some() {}
    }
}

/// Delay before retrying `accept` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(2_u32.saturating_pow(failures.min(16)))
        .min(ACCEPT_BACKOFF_MAX)
}

async fn forward(mut local: TcpStream, mut remote: russh::ChannelStream<client::Msg>) {
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => tracing::debug!(sent, received, "tunnel connection closed"),
        Err(error) => tracing::debug!(%error, "tunnel connection ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use sqlpane_core::config::SshAuth;
    use sqlpane_core::events::{event_channel, HostKeyConfirmer};
    use sqlpane_core::tunnel::{TunnelConnector, TunnelError, TunnelParams};

    use super::{accept_backoff, RusshTunnelConnector, ACCEPT_BACKOFF_MAX, ACCEPT_BACKOFF_MIN};

    #[test]
    fn listens_on_ephemeral_loopback_port_by_default() {
        assert_eq!(
            RusshTunnelConnector::new().listen_addr(),
            SocketAddr::from(([127, 0, 0, 1], 0))
        );
        let fixed = SocketAddr::from(([127, 0, 0, 1], 13_306));
        assert_eq!(
            RusshTunnelConnector::new().with_bind_addr(fixed).listen_addr(),
            fixed
        );
    }

    #[test]
    fn accept_errors_back_off_up_to_a_cap() {
        assert_eq!(accept_backoff(0), ACCEPT_BACKOFF_MIN);
        assert_eq!(accept_backoff(1), ACCEPT_BACKOFF_MIN * 2);
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(40), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_handshake_failure() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe port");
        let port = closed.local_addr().expect("probe address").port();
        drop(closed);

        let params = TunnelParams {
            remote_host: "db.internal".to_string(),
            remote_port: 3306,
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: port,
            ssh_user: "deploy".to_string(),
            auth: SshAuth::Password("secret".to_string()),
        };
        let (events, _stream) = event_channel();
        let result = RusshTunnelConnector::new()
            .open(&params, &HostKeyConfirmer::new(events))
            .await;
        assert!(matches!(result, Err(TunnelError::Handshake(_))));
    }
}
