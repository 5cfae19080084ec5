// src/server/daemon.rs

use crate::core::builtins::{builtin_plugin, script_plugin};
use crate::core::executor::Executor;
use crate::core::locks::LockTable;
use crate::core::scheme::{Scheme, SchemeError};
use crate::core::session::{PeerIdentity, Session};
use crate::core::symbol::PluginRegistry;
use crate::models::DaemonConfig;
use crate::server::session::{DaemonSession, SessionLimits};
use crate::system::daemon_config::ConfigError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error("Another daemon is already listening on '{0}'.")]
    AlreadyRunning(PathBuf),
    #[error("Failed to listen on '{path}': {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Daemon I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// The registry every daemon starts with: the builtins and the script runner.
pub fn default_registry(shell: impl Into<PathBuf>) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(builtin_plugin());
    registry.register(script_plugin(shell));
    registry
}

/// Binds the listening socket, replacing a stale socket file left by a
/// daemon that is gone.
fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
        }
        log::info!("Removing stale socket '{}'", path.display());
        fs::remove_file(path)?;
    }
    UnixListener::bind(path).map_err(|source| DaemonError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Owns everything shared by the sessions of one daemon process.
#[derive(Debug)]
pub struct Daemon {
    socket_path: PathBuf,
    scheme: Arc<Scheme>,
    start_entry: Option<String>,
    executor: Arc<Executor>,
    limits: SessionLimits,
    interrupts: watch::Sender<u64>,
}

impl Daemon {
    pub fn new(config: &DaemonConfig, scheme: Scheme, registry: PluginRegistry) -> Result<Self, DaemonError> {
        let scheme = Arc::new(scheme);
        // Fail now rather than on the first connection.
        scheme.start_view(config.start_entry.as_deref())?;

        let locks = LockTable::new(Duration::from_millis(config.lock_timeout_ms));
        let executor = Executor::new(Arc::new(registry), Arc::new(locks))
            .with_max_children(config.max_children)
            .with_dry_run(config.dry_run);
        let (interrupts, _) = watch::channel(0);

        Ok(Self {
            socket_path: config.resolved_socket_path()?,
            scheme,
            start_entry: config.start_entry.clone(),
            executor: Arc::new(executor),
            limits: SessionLimits {
                max_payload: config.max_payload,
                drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            },
            interrupts,
        })
    }

    /// Loads the scheme the configuration points at and registers the
    /// default plugins.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let scheme_path = config.resolved_scheme_path()?;
        log::info!("Loading scheme from '{}'", scheme_path.display());
        let scheme = Scheme::load(&scheme_path)?;
        let registry = default_registry(config.resolved_shell()?);
        Self::new(config, scheme, registry)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Creates the protocol session for a newly accepted peer.
    pub fn open_session(&self, peer: PeerIdentity) -> Result<DaemonSession, DaemonError> {
        let mut session = Session::new(Arc::clone(&self.scheme), self.start_entry.as_deref())?;
        session.set_peer(peer);
        Ok(DaemonSession::new(
            Arc::clone(&self.executor),
            session,
            self.limits,
            self.interrupts.subscribe(),
        ))
    }

    /// Interrupts the running pipeline of every session.
    pub fn interrupt_all(&self) {
        self.interrupts.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn spawn_session(&self, stream: UnixStream) {
        let peer = match stream.peer_cred() {
            Ok(cred) => PeerIdentity::resolve(cred.pid(), Some(cred.uid())),
            Err(e) => {
                log::warn!("Could not read peer credentials: {}", e);
                PeerIdentity::default()
            }
        };
        match self.open_session(peer) {
            Ok(session) => {
                log::info!("Accepted connection, session {}", session.id());
                tokio::task::spawn_local(async move {
                    // Errors are logged by the session itself.
                    let _ = session.serve(stream).await;
                });
            }
            Err(e) => log::error!("Could not open a session: {}", e),
        }
    }

    /// Runs plugin init, serves connections until SIGTERM, then removes the
    /// socket and runs plugin fini. Must run inside a `LocalSet`.
    pub async fn run(self) -> Result<(), DaemonError> {
        let listener = bind_socket(&self.socket_path)?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        for plugin in self.executor.init_plugins() {
            log::warn!("Plugin '{}' failed to initialise.", plugin);
        }
        for sym in self.scheme.unresolved_symbols(self.executor.registry()) {
            log::warn!("No plugin provides '{}'; actions using it will fail.", sym);
        }
        if self.executor.is_dry_run() {
            log::info!("Dry run: only permanent actions will be invoked.");
        }
        log::info!("kshelld listening on '{}'", self.socket_path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_session(stream),
                    Err(e) => log::error!("Accept failed: {}", e),
                },
                _ = sigint.recv() => {
                    log::info!("SIGINT received, interrupting active pipelines.");
                    self.interrupt_all();
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down.");
                    break;
                }
            }
        }

        drop(listener);
        if let Err(e) = fs::remove_file(&self.socket_path) {
            log::warn!("Could not remove socket '{}': {}", self.socket_path.display(), e);
        }
        for plugin in self.executor.fini_plugins() {
            log::warn!("Plugin '{}' failed to finalise.", plugin);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SchemeConfig;

    fn scheme() -> Scheme {
        let config: SchemeConfig = toml::from_str("[[view]]\nname = \"main\"").unwrap();
        Scheme::from_config(&config).unwrap()
    }

    #[test]
    fn test_unknown_start_entry_fails_early() {
        let config = DaemonConfig {
            start_entry: Some("enable".to_string()),
            ..DaemonConfig::default()
        };
        let result = Daemon::new(&config, scheme(), PluginRegistry::new());
        assert!(matches!(result, Err(DaemonError::Scheme(SchemeError::UnknownView(_)))));
    }

    #[test]
    fn test_sessions_start_on_the_start_view() {
        let daemon = Daemon::new(&DaemonConfig::default(), scheme(), default_registry("/bin/sh")).unwrap();
        let session = daemon.open_session(PeerIdentity::default()).unwrap();
        assert_eq!(session.state(), crate::server::session::TransportState::Connected);
        assert!(daemon.executor().registry().resolve("printl").is_some());
        assert!(daemon.executor().registry().resolve("script@script").is_some());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        // Setup: a socket file nobody listens on.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kshell.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        // Execute
        let listener = bind_socket(&path);

        // Assert
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kshell.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let result = bind_socket(&path);

        assert!(matches!(result, Err(DaemonError::AlreadyRunning(_))));
    }
}
