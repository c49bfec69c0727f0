//! Kernel lifecycle orchestration for one document.
//!
//! A [`Session`] binds a document path to at most one [`KernelConnection`].
//! Having no connection is a normal state: the kernel has not been started
//! yet, or was shut down. Start, restart and shutdown are serialized.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use futures::future::BoxFuture;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::channel::Transport;
use crate::comm::CommRegistry;
use crate::config::KernelClientConfig;
use crate::connection::KernelConnection;
use crate::error::{KernelError, Result};
use crate::signal::{Signal, Subscription};
use crate::status::KernelStatus;

/// Which kernel a session wants, e.g. `python3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPreference {
    pub name: String,
}

impl Default for KernelPreference {
    fn default() -> Self {
        Self {
            name: "python3".to_string(),
        }
    }
}

impl KernelPreference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A kernel the provider has started.
pub struct StartedKernel {
    pub kernel_id: String,
    /// Transport for the kernel's message channel.
    pub transport: Arc<dyn Transport>,
}

/// Starts, restarts and stops kernel processes.
pub trait KernelProvider: Send + Sync + 'static {
    fn start_kernel(
        &self,
        preference: KernelPreference,
        path: String,
    ) -> BoxFuture<'static, Result<StartedKernel>>;

    fn restart_kernel(&self, kernel_id: String) -> BoxFuture<'static, Result<()>>;

    fn shutdown_kernel(&self, kernel_id: String) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Idle,
    Pending,
    Ready,
    Failed(KernelError),
}

struct SessionState {
    path: String,
    preference: KernelPreference,
    connection: Option<KernelConnection>,
    /// Forwards the current connection's status changes.
    forwarding: Option<Subscription>,
    status: KernelStatus,
}

struct SessionInner {
    provider: Arc<dyn KernelProvider>,
    config: KernelClientConfig,
    comms: CommRegistry,
    state: StdMutex<SessionState>,
    lifecycle: tokio::sync::Mutex<()>,
    status_changed: Signal<KernelStatus>,
    readiness: watch::Sender<Readiness>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        path: impl Into<String>,
        preference: KernelPreference,
        provider: Arc<dyn KernelProvider>,
        config: KernelClientConfig,
        comms: CommRegistry,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness::Idle);
        Self {
            inner: Arc::new(SessionInner {
                provider,
                config,
                comms,
                state: StdMutex::new(SessionState {
                    path: path.into(),
                    preference,
                    connection: None,
                    forwarding: None,
                    status: KernelStatus::Unknown,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
                status_changed: Signal::new(),
                readiness,
            }),
        }
    }

    pub fn path(&self) -> String {
        self.lock().path.clone()
    }

    /// Point the session at a new document path. The kernel is unaffected.
    pub fn rename(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.lock();
        info!("[session] Renamed {} -> {}", state.path, path);
        state.path = path;
    }

    pub fn kernel_preference(&self) -> KernelPreference {
        self.lock().preference.clone()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<KernelConnection> {
        self.lock().connection.clone()
    }

    pub fn comms(&self) -> &CommRegistry {
        &self.inner.comms
    }

    /// Status of the current kernel; the last known status if there is none.
    pub fn status(&self) -> KernelStatus {
        self.lock().status
    }

    /// Observe status changes across every connection this session makes.
    pub fn subscribe_status(
        &self,
        listener: impl Fn(&KernelStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status_changed.subscribe(listener)
    }

    /// Start a kernel, or return the live connection if there is one.
    ///
    /// A connection whose kernel died or whose channel closed for good is
    /// replaced by a fresh kernel.
    pub async fn start(&self) -> Result<KernelConnection> {
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(connection) = self.connection() {
            if connection.is_usable() {
                return Ok(connection);
            }
            if connection.is_closed() {
                info!("[session] Replacing closed connection to {}", connection.kernel_id());
            } else {
                info!("[session] Replacing dead kernel {}", connection.kernel_id());
            }
            self.detach_connection();
        }

        let (path, preference) = {
            let state = self.lock();
            (state.path.clone(), state.preference.clone())
        };
        self.inner.readiness.send_replace(Readiness::Pending);
        info!("[session] Starting {} kernel for {}", preference.name, path);

        let started = match self.inner.provider.start_kernel(preference, path).await {
            Ok(started) => started,
            Err(e) => return Err(self.fail_ready(e)),
        };
        let connection = match KernelConnection::connect(
            &started.kernel_id,
            started.transport,
            self.inner.config.clone(),
            self.inner.comms.clone(),
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                error!("[session] Could not connect to {}: {}", started.kernel_id, e);
                let _ = self
                    .inner
                    .provider
                    .shutdown_kernel(started.kernel_id.clone())
                    .await;
                return Err(self.fail_ready(e));
            }
        };

        self.attach_connection(connection.clone());
        self.handshake(&connection).await?;
        Ok(connection)
    }

    /// Restart the kernel in a new generation.
    ///
    /// Pending requests fail with [`KernelError::KernelRestarted`]. If the
    /// provider or the handshake fails the kernel is marked dead. A connection
    /// whose channel has closed cannot be restarted; `start` replaces it.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let connection = self.connection().ok_or(KernelError::NotConnected)?;
        if connection.is_closed() {
            warn!(
                "[session] Cannot restart {}: its channel is closed; start a new kernel",
                connection.kernel_id()
            );
            return Err(self.fail_ready(KernelError::NotConnected));
        }

        info!("[session] Restarting kernel {}", connection.kernel_id());
        self.inner.readiness.send_replace(Readiness::Pending);
        connection.begin_generation(KernelError::KernelRestarted);

        let restarted = self
            .inner
            .provider
            .restart_kernel(connection.kernel_id().to_string())
            .await;
        if let Err(e) = restarted {
            error!("[session] Restart failed: {}", e);
            connection.mark_dead();
            return Err(self.fail_ready(e));
        }

        if let Err(e) = self.handshake(&connection).await {
            connection.mark_dead();
            return Err(e);
        }
        Ok(())
    }

    /// Shut the kernel down and release the connection.
    ///
    /// Pending requests fail with [`KernelError::SessionShutdown`]. A session
    /// with no kernel shuts down trivially.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let Some(connection) = self.connection() else {
            return Ok(());
        };

        info!("[session] Shutting down kernel {}", connection.kernel_id());
        connection.close(KernelError::SessionShutdown);
        let result = self
            .inner
            .provider
            .shutdown_kernel(connection.kernel_id().to_string())
            .await;
        if let Err(e) = &result {
            warn!("[session] Provider shutdown failed: {}", e);
        }

        self.detach_connection();
        self.inner
            .readiness
            .send_replace(Readiness::Failed(KernelError::SessionShutdown));
        result
    }

    /// Wait for the first successful `kernel_info` handshake after the most
    /// recent start or restart.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.readiness.subscribe();
        let settled = rx
            .wait_for(|r| matches!(r, Readiness::Ready | Readiness::Failed(_)))
            .await
            .map(|r| r.clone());
        match settled {
            Ok(Readiness::Failed(e)) => Err(e),
            Ok(_) => Ok(()),
            Err(_) => Err(KernelError::SessionShutdown),
        }
    }

    async fn handshake(&self, connection: &KernelConnection) -> Result<()> {
        let timeout = self.inner.config.handshake_timeout();
        let future = connection.request_kernel_info();
        let outcome = match tokio::time::timeout(timeout, future.done()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                future.dispose();
                Err(KernelError::Timeout(timeout))
            }
        };

        match outcome {
            Ok(()) => {
                info!("[session] Kernel {} ready", connection.kernel_id());
                self.inner.readiness.send_replace(Readiness::Ready);
                Ok(())
            }
            Err(e) => {
                error!("[session] Handshake with {} failed: {}", connection.kernel_id(), e);
                Err(self.fail_ready(e))
            }
        }
    }

    fn fail_ready(&self, err: KernelError) -> KernelError {
        self.inner
            .readiness
            .send_replace(Readiness::Failed(err.clone()));
        err
    }

    fn attach_connection(&self, connection: KernelConnection) {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let forwarding = connection.subscribe_status(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .status = *status;
                inner.status_changed.emit(status);
            }
        });

        let status = connection.status();
        {
            let mut state = self.lock();
            state.connection = Some(connection);
            state.forwarding = Some(forwarding);
            state.status = status;
        }
        self.inner.status_changed.emit(&status);
    }

    fn detach_connection(&self) {
        let (connection, forwarding) = {
            let mut state = self.lock();
            (state.connection.take(), state.forwarding.take())
        };
        drop(forwarding);
        drop(connection);
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("path", &state.path)
            .field("kernel", &state.preference.name)
            .field("connected", &state.connection.is_some())
            .field("status", &state.status)
            .finish()
    }
}
