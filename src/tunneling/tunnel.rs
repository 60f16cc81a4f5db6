use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use russh::{
    Disconnect,
    client::{self, AuthResult},
    keys::{PrivateKey, PrivateKeyWithHashAlg, load_secret_key},
};
use thiserror::Error;
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    config::{HostKeyChecking, TunnelConfig},
    storage,
    tunneling::{
        forward,
        handler::{ClientHandler, HostKeyVerifier},
    },
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const KEEP_ALIVE_MAX: usize = 3;

/// Opens a local port-forwarding tunnel through a bastion host and keeps just
/// enough state to probe it and reconnect. One manager owns one session; the
/// caller drives all scheduling.
pub(crate) struct TunnelManager {
    config: TunnelConfig,
    /// last requested forwarding, recorded before every connect attempt
    forward: Option<ForwardSpec>,
    session: Option<ActiveSession>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForwardSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

struct ActiveSession {
    handle: Arc<client::Handle<ClientHandler>>,
    forward_task: JoinHandle<()>,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("io error: {1}")]
    Io(std::io::Error, String),
    #[error("ssh error: {1}")]
    Ssh(russh::Error, String),
    #[error("private key error: {1}")]
    PrivateKey(russh::keys::Error, String),
    #[error("cannot determine the home directory for the default key path")]
    NoHomeDir,
    #[error("passphrase variable {0} is not set in the environment")]
    PassphraseEnv(String),
    #[error("bastion rejected public key authentication for user {0}")]
    AuthRejected(String),
    #[error("host key for {0} does not match the stored fingerprint")]
    KeyMismatch(String),
    #[error("storage layer error: {0}")]
    StorageLayer(String),
    #[error("cannot bind 127.0.0.1:{0}: {1}")]
    Bind(u16, std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        let str_val = value.to_string();
        Self::Io(value, str_val)
    }
}
impl From<russh::Error> for TunnelError {
    fn from(value: russh::Error) -> Self {
        let str_val = value.to_string();
        Self::Ssh(value, str_val)
    }
}
impl From<russh::keys::Error> for TunnelError {
    fn from(value: russh::keys::Error) -> Self {
        let str_val = value.to_string();
        Self::PrivateKey(value, str_val)
    }
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> TunnelManager {
        TunnelManager {
            config,
            forward: None,
            session: None,
        }
    }

    /// Connects to the bastion, binds `127.0.0.1:local_port` and forwards
    /// accepted connections to `remote_host:remote_port` through the session.
    ///
    /// The forwarding triple is recorded before the connect attempt, so a
    /// failed call still leaves [`auto_tunnel_reconnect`](Self::auto_tunnel_reconnect)
    /// with something to retry. Any previous session is released first so the
    /// old port binding cannot leak across reconnects.
    pub async fn create_tunnel(
        &mut self,
        local_port: u16,
        remote_port: u16,
        remote_host: &str,
    ) -> Result<(), TunnelError> {
        self.forward = Some(ForwardSpec {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        });
        self.close().await;

        let private_key = self.load_private_key()?;
        let session = Arc::new(self.connect(private_key).await?);
        let listener = forward::bind_local(local_port).await?;
        let forward_task = tokio::spawn(forward::accept_loop(
            listener,
            session.clone(),
            remote_host.to_string(),
            remote_port,
        ));
        self.session = Some(ActiveSession {
            handle: session,
            forward_task,
        });
        // the listener is bound at this point, so "connected" here means
        // forwarding is actually active
        info!("tunnel is connected: 127.0.0.1:{local_port} -> {remote_host}:{remote_port}");
        Ok(())
    }

    /// Weak liveness probe: a TCP connect to the recorded local port. Proves
    /// that something is listening locally, not that the remote path is
    /// healthy. Every I/O error maps to `false`.
    pub async fn is_tunnel_connected(&self) -> bool {
        let Some(spec) = &self.forward else {
            return false;
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, spec.local_port));
        matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }

    /// Returns `true` right away when the tunnel probes as connected,
    /// otherwise makes one attempt to re-create it with the recorded
    /// forwarding triple. Errors are logged and reported as `false`; the
    /// caller owns the polling cadence.
    pub async fn auto_tunnel_reconnect(&mut self) -> bool {
        if self.is_tunnel_connected().await {
            return true;
        }
        let Some(spec) = self.forward.clone() else {
            debug!("no tunnel was ever created, nothing to reconnect");
            return false;
        };
        match self
            .create_tunnel(spec.local_port, spec.remote_port, &spec.remote_host)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("tunnel reconnect attempt failed: {e}");
                false
            }
        }
    }

    /// Disconnects the session and drops the forwarding port. Idempotent.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.forward_task.abort();
            if let Err(e) = session
                .handle
                .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
                .await
            {
                debug!("disconnect while closing the previous session: {e}");
            }
        }
    }

    async fn connect(
        &self,
        private_key: PrivateKey,
    ) -> Result<client::Handle<ClientHandler>, TunnelError> {
        let mut config = client::Config::default();
        config.keepalive_interval = self.config.keep_alive_interval;
        config.keepalive_max = KEEP_ALIVE_MAX;
        let config = Arc::new(config);

        let verifier = match self.config.host_key_checking {
            HostKeyChecking::Off => HostKeyVerifier::AcceptAll,
            HostKeyChecking::Tofu => {
                let storage = storage::open_storage(&self.config.known_hosts_db)?;
                storage.ensure().await?;
                HostKeyVerifier::Tofu(storage)
            }
        };
        let handler = ClientHandler::new(
            &self.config.bastion_host,
            self.config.bastion_port,
            verifier,
        );

        let mut session = client::connect(
            config,
            (
                self.config.bastion_host.to_owned(),
                self.config.bastion_port,
            ),
            handler,
        )
        .await?;
        let auth_res = session
            .authenticate_publickey(
                self.config.bastion_user.clone(),
                PrivateKeyWithHashAlg::new(
                    Arc::new(private_key),
                    session.best_supported_rsa_hash().await?.flatten(),
                ),
            )
            .await?;
        match auth_res {
            AuthResult::Success => Ok(session),
            AuthResult::Failure { .. } => {
                Err(TunnelError::AuthRejected(self.config.bastion_user.clone()))
            }
        }
    }

    fn load_private_key(&self) -> Result<PrivateKey, TunnelError> {
        let home = dirs::home_dir().ok_or(TunnelError::NoHomeDir)?;
        let key_path = self.config.key_path_in(&home);
        let passphrase = match &self.config.rsa_key_passphrase_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| TunnelError::PassphraseEnv(var.clone()))?,
            ),
            None => None,
        };
        Ok(load_secret_key(&key_path, passphrase.as_deref())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn test_config(bastion_port: u16) -> TunnelConfig {
        TunnelConfig {
            bastion_user: String::from("unix-abc"),
            bastion_host: String::from("127.0.0.1"),
            bastion_port,
            // nonexistent on purpose: connect attempts fail before touching
            // the network
            rsa_key_location: Some(PathBuf::from("/nonexistent/id_rsa")),
            rsa_key_passphrase_env: None,
            host_key_checking: HostKeyChecking::Off,
            known_hosts_db: PathBuf::from("known_hosts.db"),
            keep_alive_interval: None,
        }
    }

    /// Binds and immediately drops a listener so the returned port is very
    /// unlikely to have anything listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn forward_spec_recorded_even_when_connect_fails() {
        let bastion_port = closed_port().await;
        let mut manager = TunnelManager::new(test_config(bastion_port));
        let result = manager.create_tunnel(9000, 5432, "db.internal").await;
        assert!(result.is_err());
        assert_eq!(
            manager.forward,
            Some(ForwardSpec {
                local_port: 9000,
                remote_host: String::from("db.internal"),
                remote_port: 5432,
            })
        );
    }

    #[tokio::test]
    async fn last_forward_spec_wins() {
        let bastion_port = closed_port().await;
        let mut manager = TunnelManager::new(test_config(bastion_port));
        let _ = manager.create_tunnel(9000, 5432, "db.internal").await;
        let _ = manager.create_tunnel(9100, 6379, "cache.internal").await;
        assert_eq!(
            manager.forward,
            Some(ForwardSpec {
                local_port: 9100,
                remote_host: String::from("cache.internal"),
                remote_port: 6379,
            })
        );
    }

    #[tokio::test]
    async fn probe_is_false_without_a_tunnel() {
        let manager = TunnelManager::new(test_config(22));
        assert!(!manager.is_tunnel_connected().await);
    }

    #[tokio::test]
    async fn probe_is_false_on_closed_port() {
        let mut manager = TunnelManager::new(test_config(22));
        manager.forward = Some(ForwardSpec {
            local_port: closed_port().await,
            remote_host: String::from("db.internal"),
            remote_port: 5432,
        });
        assert!(!manager.is_tunnel_connected().await);
    }

    #[tokio::test]
    async fn reconnect_is_a_noop_when_healthy() {
        // anything listening on the local port counts as "connected"
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();

        let mut manager = TunnelManager::new(test_config(22));
        manager.forward = Some(ForwardSpec {
            local_port,
            remote_host: String::from("db.internal"),
            remote_port: 5432,
        });

        assert!(manager.auto_tunnel_reconnect().await);
        // no connect attempt was made, so no session was created
        assert!(manager.session.is_none());
    }

    #[tokio::test]
    async fn reconnect_reports_failure_when_unhealthy() {
        let bastion_port = closed_port().await;
        let mut manager = TunnelManager::new(test_config(bastion_port));
        manager.forward = Some(ForwardSpec {
            local_port: closed_port().await,
            remote_host: String::from("db.internal"),
            remote_port: 5432,
        });

        assert!(!manager.auto_tunnel_reconnect().await);
        // the failed attempt keeps the recorded triple for the next poll
        assert_eq!(manager.forward.as_ref().unwrap().remote_port, 5432);
    }

    #[tokio::test]
    async fn reconnect_is_false_without_prior_tunnel() {
        let mut manager = TunnelManager::new(test_config(22));
        assert!(!manager.auto_tunnel_reconnect().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut manager = TunnelManager::new(test_config(22));
        manager.close().await;
        manager.close().await;
    }
}
