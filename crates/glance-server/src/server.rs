// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server lifecycle: bind, serve in the background, two-phase stop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use glance_scene::{BuildCache, MeshEncoder, SceneRegistry, Tessellator};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::routes::router;
use crate::settings::{Settings, SettingsError};
use crate::state::AppState;

/// Upper bound on how long `stop` waits for the listener task to exit once
/// in-flight requests have drained.
const LISTENER_EXIT: Duration = Duration::from_secs(5);

/// Server failed to start.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Settings are invalid.
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying error.
        source: io::Error,
    },
    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A running server.
///
/// Dropping it without [`stop`](Self::stop) closes the listener immediately.
#[derive(Debug)]
pub struct Server {
    state: Arc<AppState>,
    settings: Settings,
    handle: Handle<SocketAddr>,
    task: Option<JoinHandle<io::Result<()>>>,
    addr: SocketAddr,
}

impl Server {
    /// Validate `settings`, bind and start serving in a background task.
    pub async fn start(
        settings: Settings,
        tessellator: Arc<dyn Tessellator>,
        encoder: Arc<dyn MeshEncoder>,
    ) -> Result<Self, ServerError> {
        let state = Arc::new(AppState::new(&settings, tessellator, encoder)?);
        let requested = format!("{}:{}", settings.host, settings.port);
        let addr = tokio::net::lookup_host(&requested)
            .await
            .map_err(|source| ServerError::Bind {
                addr: requested.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::Bind {
                addr: requested.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"),
            })?;

        let handle: Handle<SocketAddr> = Handle::new();
        let app = router(Arc::clone(&state));
        let task = tokio::spawn(
            axum_server::bind(addr)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );
        let Some(local) = handle.listening().await else {
            let source = match task.await {
                Ok(Err(err)) => err,
                Ok(Ok(())) => io::Error::other("listener exited before binding"),
                Err(join) => io::Error::other(join),
            };
            return Err(ServerError::Bind {
                addr: requested,
                source,
            });
        };
        info!(addr = %local, "glance server listening");
        Ok(Self {
            state,
            settings,
            handle,
            task: Some(task),
            addr: local,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:32323`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The scene served by this server.
    pub fn registry(&self) -> &Arc<SceneRegistry> {
        self.state.registry()
    }

    /// The build cache behind the object routes.
    pub fn cache(&self) -> &BuildCache {
        self.state.cache()
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Another router over the same state, for in-process requests.
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Two-phase graceful stop.
    ///
    /// Phase one publishes the shutdown sentinel and gives a viewer up to
    /// `graceful_connect_secs` to have connected, so it can observe the
    /// final scene. Phase two waits up to `graceful_work_secs` for in-flight
    /// requests to release the drain lock, which stays held until the
    /// listener has exited. The listener is closed either way.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        info!("stopping glance server");
        self.state.begin_shutdown();
        if !self
            .state
            .wait_for_client(self.settings.graceful_connect())
            .await
        {
            warn!(
                waited_secs = self.settings.graceful_connect_secs,
                "no viewer connected before shutdown"
            );
        }
        let _drained = match self.state.drain().write(self.settings.graceful_work()).await {
            Ok(guard) => {
                info!("in-flight requests drained");
                Some(guard)
            }
            Err(timeout) => {
                warn!(
                    readers = timeout.readers,
                    waited = ?timeout.waited,
                    "in-flight requests still running at shutdown"
                );
                None
            }
        };

        self.handle.graceful_shutdown(Some(LISTENER_EXIT));
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(LISTENER_EXIT * 2, task).await {
                Ok(Ok(result)) => result?,
                Ok(Err(join)) => return Err(io::Error::other(join).into()),
                Err(_) => warn!("listener did not exit in time"),
            }
        }
        info!("glance server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.handle.shutdown();
        }
    }
}
