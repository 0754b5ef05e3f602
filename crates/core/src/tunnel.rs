//! SSH tunnel lifecycle.
//!
//! A [`Tunnel`] runs on its own worker task: it asks a [`TunnelConnector`] to
//! perform the handshake, authentication and local listener setup, reports
//! exactly one [`TunnelEvent`], and then keeps forwarding until it is shut
//! down. Failures are terminal; there is no retry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, SshAuth};
use crate::events::HostKeyConfirmer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub remote_host: String,
    pub remote_port: u16,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth: SshAuth,
}

impl TunnelParams {
    /// Tunnel towards the configured SQL endpoint, if tunneling is enabled.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Option<Self> {
        config.ssh.as_ref().map(|ssh| Self {
            remote_host: config.host.clone(),
            remote_port: config.port,
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            ssh_user: ssh.username.clone(),
            auth: ssh.auth.clone(),
        })
    }

    #[must_use]
    pub fn key_path(&self) -> Option<&PathBuf> {
        match &self.auth {
            SshAuth::Key(path) => Some(path),
            SshAuth::Password(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("SSH authentication failed: {0}")]
    Auth(String),
    #[error("SSH handshake failed: {0}")]
    Handshake(String),
    #[error("host key for {0} was not accepted")]
    HostUnconfirmed(String),
    #[error("SSH port forwarding failed: {0}")]
    Forward(String),
}

/// An authenticated session with a bound local listener.
pub struct ForwardingTunnel {
    pub local_addr: SocketAddr,
    /// Accepts and relays local connections; completes when the session ends.
    pub serve: BoxFuture<'static, ()>,
}

#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn open(
        &self,
        params: &TunnelParams,
        confirmer: &HostKeyConfirmer,
    ) -> Result<ForwardingTunnel, TunnelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Open(SocketAddr),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Opened { local_host: String, local_port: u16 },
    Failed(String),
}

#[derive(Debug)]
pub struct Tunnel {
    params: TunnelParams,
    state: Arc<Mutex<TunnelState>>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Starts the tunnel worker. The returned receiver yields the single
    /// open/failed outcome.
    pub fn spawn(
        params: TunnelParams,
        connector: Arc<dyn TunnelConnector>,
        confirmer: HostKeyConfirmer,
    ) -> (Self, oneshot::Receiver<TunnelEvent>) {
        let state = Arc::new(Mutex::new(TunnelState::Idle));
        let (events_tx, events_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = tokio::spawn(connect_to_server(
            params.clone(),
            connector,
            confirmer,
            Arc::clone(&state),
            events_tx,
            shutdown_rx,
        ));

        (
            Self {
                params,
                state,
                shutdown: Some(shutdown_tx),
                worker: Some(worker),
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.state.lock().clone()
    }

    /// Stops forwarding and waits for the worker to exit. A connect attempt
    /// still in flight is allowed to finish first.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.await {
                tracing::warn!(%error, "tunnel worker ended abnormally");
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn connect_to_server(
    params: TunnelParams,
    connector: Arc<dyn TunnelConnector>,
    confirmer: HostKeyConfirmer,
    state: Arc<Mutex<TunnelState>>,
    events: oneshot::Sender<TunnelEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    *state.lock() = TunnelState::Connecting;
    tracing::info!(
        "opening SSH tunnel to {}:{} via {}@{}:{}",
        params.remote_host,
        params.remote_port,
        params.ssh_user,
        params.ssh_host,
        params.ssh_port
    );

    match connector.open(&params, &confirmer).await {
        Ok(tunnel) => {
            let local_addr = tunnel.local_addr;
            *state.lock() = TunnelState::Open(local_addr);
            tracing::info!(%local_addr, "SSH tunnel open");
            let _ = events.send(TunnelEvent::Opened {
                local_host: local_addr.ip().to_string(),
                local_port: local_addr.port(),
            });

            tokio::select! {
                () = tunnel.serve => tracing::debug!(%local_addr, "SSH session ended"),
                _ = &mut shutdown => tracing::debug!(%local_addr, "SSH tunnel shut down"),
            }
        }
        Err(error) => {
            let message = error.to_string();
            tracing::warn!(%message, "SSH tunnel failed");
            *state.lock() = TunnelState::Failed(message.clone());
            let _ = events.send(TunnelEvent::Failed(message));
        }
    }
}
