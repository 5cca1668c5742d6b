// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! On-demand conversion of shown objects into GLB artifacts.
//!
//! Each name owns at most one slot `(content_hash, channel)`. The first export
//! after a show creates the slot and starts the build; every concurrent export
//! subscribes to the same channel and receives the same outcome. Slots are
//! dropped when the registry shows or removes the name again, and a failed
//! build evicts its own slot so the next export retries.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use glance_proto::glbs::{self, GlbsError};
use glance_pubsub::{BufferedChannel, Subscription};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::event::ShowEvent;
use crate::hash::ContentHash;
use crate::object::{Geometry, Payload};
use crate::port::{Materials, MeshEncoder, PortError, TessellateRequest, Tessellation, Tessellator};
use crate::registry::SceneRegistry;

/// Edge length of the axes drawn for a location.
const AXES_SIZE: f64 = 1.0;

/// Why a build produced no artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildFailure {
    /// A collaborator reported an error.
    #[error(transparent)]
    Port(#[from] PortError),
    /// The build worker panicked.
    #[error("build worker panicked: {0}")]
    Panicked(String),
    /// The build was dropped before it produced an outcome (runtime shutdown).
    #[error("build abandoned before completion")]
    Abandoned,
}

/// Errors surfaced by [`BuildCache`].
#[derive(Debug, Error)]
pub enum ExportError {
    /// No visible object has this name.
    #[error("object {name:?} not found")]
    NotFound {
        /// Requested name.
        name: String,
    },
    /// The build for this name failed; the next export retries.
    #[error("failed to build {name:?}: {source}")]
    Build {
        /// Object name.
        name: String,
        /// Cause.
        #[source]
        source: BuildFailure,
    },
    /// GLBS framing failed.
    #[error(transparent)]
    Glbs(#[from] GlbsError),
    /// Writing an exported artifact failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A built GLB and the hash of the event it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// GLB bytes.
    pub bytes: Bytes,
    /// Content hash of the originating show event.
    pub hash: ContentHash,
}

type BuildOutcome = Result<Bytes, BuildFailure>;

#[derive(Debug)]
struct Slot {
    hash: ContentHash,
    outcome: BufferedChannel<BuildOutcome>,
}

/// Per-name build slots, shared between the registry (which invalidates) and
/// the cache (which fills).
#[derive(Debug, Clone, Default)]
pub(crate) struct BuildSlots(Arc<Mutex<HashMap<String, Slot>>>);

impl BuildSlots {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the slot for `name`. In-flight builds still complete and deliver
    /// to the exports already waiting on them.
    pub(crate) fn invalidate(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    fn evict_if_same(&self, name: &str, channel: &BufferedChannel<BuildOutcome>) {
        let mut slots = self.lock();
        if slots
            .get(name)
            .is_some_and(|slot| slot.outcome.same_channel(channel))
        {
            slots.remove(name);
        }
    }
}

struct Inner {
    registry: Arc<SceneRegistry>,
    tessellator: Arc<dyn Tessellator>,
    encoder: Arc<dyn MeshEncoder>,
    workers: Arc<Semaphore>,
    builds: AtomicUsize,
}

/// Lazily builds and caches one GLB per visible object.
///
/// Cloning yields a handle to the same cache.
#[derive(Clone)]
pub struct BuildCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("builds", &self.build_count())
            .field("idle_workers", &self.inner.workers.available_permits())
            .finish_non_exhaustive()
    }
}

impl BuildCache {
    /// Create a cache over `registry` running at most `workers` builds at once
    /// (clamped to at least one).
    pub fn new(
        registry: Arc<SceneRegistry>,
        tessellator: Arc<dyn Tessellator>,
        encoder: Arc<dyn MeshEncoder>,
        workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                tessellator,
                encoder,
                workers: Arc::new(Semaphore::new(workers.max(1))),
                builds: AtomicUsize::new(0),
            }),
        }
    }

    /// The registry this cache reads from.
    pub fn registry(&self) -> &Arc<SceneRegistry> {
        &self.inner.registry
    }

    /// Number of builds started so far.
    pub fn build_count(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Drop the cached artifact for `name`.
    pub fn invalidate(&self, name: &str) -> bool {
        self.inner.registry.slots().invalidate(name)
    }

    /// Export the latest visible version of `name`, building it if needed.
    pub async fn export(&self, name: &str) -> Result<Artifact, ExportError> {
        let (event, subscription) = self.dispatch(name, None)?;
        Self::await_outcome(&event, subscription).await
    }

    /// Export the version carried by `event`, even if it has since been
    /// replaced or removed. Superseded versions are built without touching
    /// the cached slot of the current one.
    async fn export_event(&self, event: Arc<ShowEvent>) -> Result<Artifact, ExportError> {
        let name = event.name.clone();
        let (event, subscription) = self.dispatch(&name, Some(event))?;
        Self::await_outcome(&event, subscription).await
    }

    async fn await_outcome(
        event: &ShowEvent,
        mut subscription: Subscription<BuildOutcome>,
    ) -> Result<Artifact, ExportError> {
        let outcome = subscription.recv().await;
        subscription.unsubscribe();
        match outcome {
            Some(Ok(bytes)) => Ok(Artifact {
                bytes,
                hash: event.content_hash,
            }),
            Some(Err(source)) => Err(ExportError::Build {
                name: event.name.clone(),
                source,
            }),
            None => Err(ExportError::Build {
                name: event.name.clone(),
                source: BuildFailure::Abandoned,
            }),
        }
    }

    /// Subscribe to the outcome for `name` (or for the pinned event),
    /// starting a build if no slot holds that content.
    ///
    /// Runs under the registry writer lock, so the resolved event and the
    /// slot map cannot change underneath it. Only the current version of a
    /// name ever owns the slot.
    fn dispatch(
        &self,
        name: &str,
        pinned: Option<Arc<ShowEvent>>,
    ) -> Result<(Arc<ShowEvent>, Subscription<BuildOutcome>), ExportError> {
        let registry = &self.inner.registry;
        let _writer = registry.write_lock();
        let current = registry.latest(name);
        let event = match pinned {
            Some(event) => event,
            None => current.clone().ok_or_else(|| ExportError::NotFound {
                name: name.to_string(),
            })?,
        };
        let is_current = current.is_some_and(|c| c.seq == event.seq);

        let slots = registry.slots();
        let mut map = slots.lock();
        if let Some(slot) = map.get(name) {
            if slot.hash == event.content_hash {
                let subscription = slot.outcome.subscribe(true, true);
                return Ok((event, subscription));
            }
        }
        let channel = BufferedChannel::with_capacity(1);
        if is_current {
            map.insert(
                name.to_string(),
                Slot {
                    hash: event.content_hash,
                    outcome: channel.clone(),
                },
            );
        } else {
            debug!(name, hash = %event.content_hash, "building superseded version uncached");
        }
        drop(map);
        let subscription = channel.subscribe(true, true);
        match &event.payload {
            Payload::Raw(bytes) => channel.publish(Ok(bytes.clone())),
            Payload::Geometry(_) => {
                debug!(name, hash = %event.content_hash, "scheduling build");
                self.spawn_build(Arc::clone(&event), channel);
            }
            Payload::None => channel.publish(Err(BuildFailure::Abandoned)),
        }
        Ok((event, subscription))
    }

    fn spawn_build(&self, event: Arc<ShowEvent>, channel: BufferedChannel<BuildOutcome>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.run_build(&event).await;
            if outcome.is_err() {
                inner.registry.slots().evict_if_same(&event.name, &channel);
            }
            channel.publish(outcome);
        });
    }

    /// Export every visible object accepted by `predicate`, in name order,
    /// handing each artifact to `sink`. Returns the number exported.
    ///
    /// The set of versions is fixed when this is called.
    pub async fn export_all<P, S>(
        &self,
        mut predicate: P,
        mut sink: S,
    ) -> Result<usize, ExportError>
    where
        P: FnMut(&str, &Payload) -> bool,
        S: FnMut(&str, Artifact) -> Result<(), ExportError>,
    {
        let mut exported = 0;
        for event in self.selected_events(&mut predicate) {
            let name = event.name.clone();
            let artifact = self.export_event(event).await?;
            sink(&name, artifact)?;
            exported += 1;
        }
        Ok(exported)
    }

    /// Progressive whole-scene export as GLBS chunks.
    ///
    /// The versions to export are fixed when this is called, so the header
    /// carries the exact count and objects removed or replaced mid-stream are
    /// still delivered as they were. Blobs are built one by one as the stream
    /// is polled.
    pub fn export_glbs<P>(
        &self,
        mut predicate: P,
    ) -> impl Stream<Item = Result<Bytes, ExportError>> + Send + 'static
    where
        P: FnMut(&str, &Payload) -> bool,
    {
        let events = self.selected_events(&mut predicate);
        let count = u32::try_from(events.len()).unwrap_or(glbs::UNKNOWN_COUNT);
        let cache = self.clone();
        let blobs = stream::iter(events).then(move |event| {
            let cache = cache.clone();
            async move { cache.export_event(event).await.map(|artifact| artifact.bytes) }
        });
        glbs::encode(blobs, count)
    }

    fn selected_events<P>(&self, predicate: &mut P) -> Vec<Arc<ShowEvent>>
    where
        P: FnMut(&str, &Payload) -> bool,
    {
        let registry = &self.inner.registry;
        let _writer = registry.write_lock();
        registry
            .shown_names(true)
            .into_iter()
            .filter_map(|name| registry.latest(&name))
            .filter(|event| predicate(&event.name, &event.payload))
            .collect()
    }
}

impl Inner {
    async fn run_build(&self, event: &Arc<ShowEvent>) -> BuildOutcome {
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| BuildFailure::Abandoned)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let tessellator = Arc::clone(&self.tessellator);
        let encoder = Arc::clone(&self.encoder);
        let job = Arc::clone(event);
        let joined = tokio::task::spawn_blocking(move || {
            build_glb(tessellator.as_ref(), encoder.as_ref(), &job)
        })
        .await;
        let outcome = match joined {
            Ok(result) => result.map_err(BuildFailure::from),
            Err(err) => Err(BuildFailure::Panicked(err.to_string())),
        };
        match &outcome {
            Ok(bytes) => info!(
                name = %event.name,
                elapsed_ms = start.elapsed().as_millis(),
                size = %human_size(bytes.len()),
                "export built"
            ),
            Err(err) => warn!(name = %event.name, error = %err, "export failed"),
        }
        outcome
    }
}

fn build_glb(
    tessellator: &dyn Tessellator,
    encoder: &dyn MeshEncoder,
    event: &ShowEvent,
) -> Result<Bytes, PortError> {
    let Payload::Geometry(geometry) = &event.payload else {
        return Err(PortError::Tessellation(format!(
            "{} has no geometry to build",
            event.name
        )));
    };
    let opts = &event.options;
    let request = TessellateRequest {
        tolerance: opts.tolerance,
        angular_tolerance: opts.angular_tolerance,
        faces: opts.faces,
        edges: opts.edges,
        vertices: opts.vertices,
        z_up_to_y_up: true,
    };
    let mesh = tessellate(tessellator, geometry, &request)?;
    let materials = Materials {
        faces: opts.color_faces,
        edges: opts.color_edges,
        vertices: opts.color_vertices,
        object: opts.color_object,
        texture: opts.texture.clone(),
    };
    encoder.encode(&mesh, &materials)
}

fn tessellate(
    tessellator: &dyn Tessellator,
    geometry: &Geometry,
    request: &TessellateRequest,
) -> Result<Tessellation, PortError> {
    match geometry {
        Geometry::Solid(shape) => tessellator.tessellate(shape.as_ref(), request),
        Geometry::Location(location) if request.edges => Ok(location.axes(AXES_SIZE)),
        Geometry::Location(_) => Ok(Tessellation::default()),
        Geometry::Composite(children) => {
            let mut out = Tessellation::default();
            for child in children {
                out.extend(tessellate(tessellator, child, request)?);
            }
            Ok(out)
        }
    }
}

/// Binary-prefixed size, e.g. `1.5KiB`.
#[allow(clippy::cast_precision_loss)]
fn human_size(len: usize) -> String {
    let mut value = len as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti"] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}PiB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_uses_binary_prefixes() {
        assert_eq!(human_size(0), "0.0B");
        assert_eq!(human_size(1536), "1.5KiB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0MiB");
    }
}
