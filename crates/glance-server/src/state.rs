// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared state behind every request handler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glance_pubsub::DrainLock;
use glance_scene::{BuildCache, MeshEncoder, SceneRegistry, Tessellator};
use tokio::sync::watch;
use tracing::debug;

use crate::settings::{Settings, SettingsError};

/// Scene, build cache and shutdown bookkeeping shared by the HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    registry: Arc<SceneRegistry>,
    cache: BuildCache,
    drain: DrainLock,
    shutting_down: AtomicBool,
    client_seen: watch::Sender<bool>,
    keep_alive: Duration,
    frontend_dir: Option<PathBuf>,
}

impl AppState {
    /// Build the scene and cache described by `settings`.
    pub fn new(
        settings: &Settings,
        tessellator: Arc<dyn Tessellator>,
        encoder: Arc<dyn MeshEncoder>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let registry = Arc::new(SceneRegistry::with_history_cap(
            settings.render_defaults()?,
            settings.history_cap,
        ));
        let cache = BuildCache::new(
            Arc::clone(&registry),
            tessellator,
            encoder,
            settings.build_workers,
        );
        Ok(Self {
            registry,
            cache,
            drain: DrainLock::new(),
            shutting_down: AtomicBool::new(false),
            client_seen: watch::Sender::new(false),
            keep_alive: settings.keep_alive(),
            frontend_dir: settings.frontend_dir.clone(),
        })
    }

    /// The scene.
    pub fn registry(&self) -> &Arc<SceneRegistry> {
        &self.registry
    }

    /// The build cache.
    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Lock held by request sections while shutdown drains them.
    pub fn drain(&self) -> &DrainLock {
        &self.drain
    }

    pub(crate) fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub(crate) fn frontend_dir(&self) -> Option<&Path> {
        self.frontend_dir.as_deref()
    }

    /// First shutdown phase: flag the server as stopping and publish the
    /// sentinel so open update feeds end.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            self.registry.publish_shutdown();
        }
    }

    /// Returns `true` once [`begin_shutdown`](Self::begin_shutdown) ran.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns `true` once any viewer opened the update feed.
    pub fn client_seen(&self) -> bool {
        *self.client_seen.borrow()
    }

    pub(crate) fn mark_client_seen(&self) {
        if !self.client_seen.send_replace(true) {
            debug!("first viewer connected");
        }
    }

    /// Wait up to `timeout` for a first viewer. Returns whether one came.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        let mut seen = self.client_seen.subscribe();
        let waited = tokio::time::timeout(timeout, seen.wait_for(|seen| *seen)).await;
        matches!(waited, Ok(Ok(_)))
    }
}
