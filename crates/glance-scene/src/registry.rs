// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scene registry: reduces an append-only event log into the set of visible
//! objects.
//!
//! The log is compacted as it grows: showing or removing a name deletes every
//! earlier entry for that name before appending the new one, so the log never
//! holds more than one entry per name (plus the shutdown sentinel). Late
//! subscribers therefore replay exactly the current scene.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use glance_proto::SHUTDOWN_NAME;
use glance_pubsub::{BufferedChannel, Subscription};
use thiserror::Error;
use tracing::{debug, info};

use crate::build::BuildSlots;
use crate::event::{EventKind, ShowEvent};
use crate::hash::content_hash;
use crate::object::{ObjectError, Payload, SceneObject};
use crate::options::{OptionError, RenderDefaults, ShowOptions, Texture};

/// A `show` call was rejected; nothing was published.
#[derive(Debug, Error)]
pub enum ShowError {
    /// The same name appears twice in one call.
    #[error("duplicate object name {0:?}")]
    DuplicateName(String),
    /// Empty or reserved name.
    #[error("invalid object name {0:?}")]
    InvalidName(String),
    /// An option value could not be parsed.
    #[error("invalid show option: {0}")]
    Config(#[from] OptionError),
    /// An object could not be resolved.
    #[error("cannot show {name:?}: {source}")]
    Object {
        /// Offending object.
        name: String,
        /// Cause.
        #[source]
        source: ObjectError,
    },
}

/// The scene: an event log plus the per-name build slots it invalidates.
#[derive(Debug)]
pub struct SceneRegistry {
    events: BufferedChannel<Arc<ShowEvent>>,
    next_seq: AtomicU64,
    defaults: RenderDefaults,
    slots: BuildSlots,
    writer: Mutex<()>,
}

impl Default for SceneRegistry {
    fn default() -> Self {
        Self::new(RenderDefaults::default())
    }
}

impl SceneRegistry {
    /// Registry with unbounded history.
    pub fn new(defaults: RenderDefaults) -> Self {
        Self::with_history_cap(defaults, None)
    }

    /// Registry whose log keeps at most `cap` entries when set.
    ///
    /// With compaction the log already holds one entry per name; a cap only
    /// matters for scenes with more names than `cap`, whose oldest entries
    /// are then forgotten by late subscribers.
    pub fn with_history_cap(defaults: RenderDefaults, cap: Option<usize>) -> Self {
        Self {
            events: cap.map_or_else(BufferedChannel::new, BufferedChannel::with_capacity),
            next_seq: AtomicU64::new(0),
            defaults,
            slots: BuildSlots::default(),
            writer: Mutex::new(()),
        }
    }

    /// Server-wide render defaults.
    pub fn defaults(&self) -> &RenderDefaults {
        &self.defaults
    }

    pub(crate) fn slots(&self) -> &BuildSlots {
        &self.slots
    }

    /// Serializes mutations of the log and its build slots.
    pub(crate) fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Show (or replace) named objects.
    ///
    /// Every object and option is validated before anything is published;
    /// on error the scene is unchanged.
    pub fn show(
        &self,
        objects: Vec<(String, SceneObject)>,
        options: &ShowOptions,
    ) -> Result<Vec<Arc<ShowEvent>>, ShowError> {
        let start = Instant::now();
        let mut seen = HashSet::new();
        for (name, _) in &objects {
            if name.is_empty() || name == SHUTDOWN_NAME {
                return Err(ShowError::InvalidName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ShowError::DuplicateName(name.clone()));
            }
        }
        let base = options.resolve(&self.defaults)?;

        let mut prepared = Vec::with_capacity(objects.len());
        for (name, object) in objects {
            let payload = object
                .into_payload()
                .map_err(|source| ShowError::Object {
                    name: name.clone(),
                    source,
                })?;
            let mut opts = base.clone();
            if let Payload::Geometry(geometry) = &payload {
                if let Some(color) = geometry.color() {
                    opts.color_object = Some(color);
                }
                if let Some(uri) = geometry.texture_uri() {
                    opts.texture = Some(Texture::from_uri(&uri)?);
                }
            }
            let hash = content_hash(&payload, &opts);
            prepared.push((name, payload, hash, Arc::new(opts)));
        }
        let names: Vec<String> = prepared.iter().map(|(name, ..)| name.clone()).collect();

        let _writer = self.write_lock();
        if options.auto_clear {
            let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
            self.clear_locked(&keep);
        }
        let mut published = Vec::with_capacity(prepared.len());
        for (name, payload, content_hash, options) in prepared {
            self.events.retain(|e| e.name != name);
            self.slots.invalidate(&name);
            let event = Arc::new(ShowEvent {
                seq: self.next_seq(),
                name,
                content_hash,
                payload,
                kind: EventKind::Show,
                options,
            });
            debug!(name = %event.name, hash = %event.content_hash, "show event");
            self.events.publish(Arc::clone(&event));
            published.push(event);
        }
        info!(
            names = ?names,
            elapsed_ms = start.elapsed().as_millis(),
            "show"
        );
        Ok(published)
    }

    /// Show a single object.
    pub fn show_one(
        &self,
        name: impl Into<String>,
        object: impl Into<SceneObject>,
        options: &ShowOptions,
    ) -> Result<Arc<ShowEvent>, ShowError> {
        let mut events = self.show(vec![(name.into(), object.into())], options)?;
        events.pop().ok_or_else(|| ShowError::InvalidName(String::new()))
    }

    /// Hide `name`. Returns `false` (and publishes nothing) if it is not
    /// visible.
    pub fn remove(&self, name: &str) -> bool {
        let _writer = self.write_lock();
        self.remove_locked(name)
    }

    fn remove_locked(&self, name: &str) -> bool {
        let Some(last) = self.latest(name) else {
            return false;
        };
        self.events.retain(|e| e.name != name);
        self.slots.invalidate(name);
        let event = Arc::new(ShowEvent {
            seq: self.next_seq(),
            name: name.to_string(),
            content_hash: last.content_hash,
            payload: Payload::None,
            kind: EventKind::Remove,
            options: Arc::clone(&last.options),
        });
        debug!(name, hash = %event.content_hash, "remove event");
        self.events.publish(event);
        true
    }

    /// Hide every visible object whose name is not in `except`.
    pub fn clear<S: AsRef<str>>(&self, except: &[S]) {
        let keep: HashSet<&str> = except.iter().map(AsRef::as_ref).collect();
        let _writer = self.write_lock();
        self.clear_locked(&keep);
    }

    fn clear_locked(&self, keep: &HashSet<&str>) {
        for name in self.visible().into_keys() {
            if !keep.contains(name.as_str()) {
                self.remove_locked(&name);
            }
        }
    }

    /// Replay the log into name → latest visible event.
    fn visible(&self) -> BTreeMap<String, Arc<ShowEvent>> {
        let mut out = BTreeMap::new();
        for event in self.events.buffer() {
            match event.kind {
                EventKind::Show => {
                    out.insert(event.name.clone(), event);
                }
                EventKind::Remove => {
                    out.remove(&event.name);
                }
                EventKind::Shutdown => {}
            }
        }
        out
    }

    /// Sorted names of visible objects, or of every object ever shown when
    /// `apply_removes` is `false`.
    pub fn shown_names(&self, apply_removes: bool) -> Vec<String> {
        let mut names = BTreeSet::new();
        for event in self.events.buffer() {
            match event.kind {
                EventKind::Show => {
                    names.insert(event.name.clone());
                }
                EventKind::Remove if apply_removes => {
                    names.remove(&event.name);
                }
                EventKind::Remove => {
                    names.insert(event.name.clone());
                }
                EventKind::Shutdown => {}
            }
        }
        names.into_iter().collect()
    }

    /// Latest visible event for `name`.
    pub fn latest(&self, name: &str) -> Option<Arc<ShowEvent>> {
        self.events
            .buffer()
            .into_iter()
            .rev()
            .find(|e| e.name == name && e.kind != EventKind::Shutdown)
            .filter(|e| e.kind == EventKind::Show)
    }

    /// Snapshot of the log, oldest first.
    pub fn events(&self) -> Vec<Arc<ShowEvent>> {
        self.events.buffer()
    }

    /// Subscribe to the log (see [`BufferedChannel::subscribe`]).
    pub fn subscribe(
        &self,
        include_buffered: bool,
        include_future: bool,
    ) -> Subscription<Arc<ShowEvent>> {
        self.events.subscribe(include_buffered, include_future)
    }

    /// Number of attached feed subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Append the shutdown sentinel.
    pub fn publish_shutdown(&self) -> Arc<ShowEvent> {
        let _writer = self.write_lock();
        let event = Arc::new(ShowEvent::shutdown(self.next_seq()));
        info!("publishing shutdown sentinel");
        self.events.publish(Arc::clone(&event));
        event
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mock::MockShape;
    use crate::object::Location;
    use bytes::Bytes;

    fn raw(tag: &'static [u8]) -> SceneObject {
        SceneObject::RawBytes(Bytes::from_static(tag))
    }

    #[test]
    fn replacing_keeps_one_entry_per_name() {
        let reg = SceneRegistry::default();
        reg.show_one("a", raw(b"1"), &ShowOptions::default()).unwrap();
        let second = reg.show_one("a", raw(b"2"), &ShowOptions::default()).unwrap();
        assert_eq!(reg.shown_names(true), vec!["a"]);
        assert_eq!(reg.events().len(), 1);
        assert_eq!(reg.latest("a").unwrap(), second);
    }

    #[test]
    fn auto_clear_removes_unnamed_objects() {
        let reg = SceneRegistry::default();
        reg.show(
            vec![("a".into(), raw(b"a")), ("b".into(), raw(b"b"))],
            &ShowOptions::default(),
        )
        .unwrap();
        reg.show_one("c", raw(b"c"), &ShowOptions::default()).unwrap();
        assert_eq!(reg.shown_names(true), vec!["c"]);
        assert_eq!(reg.shown_names(false), vec!["a", "b", "c"]);
    }

    #[test]
    fn keep_others_accumulates() {
        let reg = SceneRegistry::default();
        let opts = ShowOptions::default().keep_others();
        reg.show_one("b", raw(b"b"), &opts).unwrap();
        reg.show_one("a", raw(b"a"), &opts).unwrap();
        assert_eq!(reg.shown_names(true), vec!["a", "b"]);
    }

    #[test]
    fn remove_publishes_last_hash_once() {
        let reg = SceneRegistry::default();
        let shown = reg.show_one("a", raw(b"a"), &ShowOptions::default()).unwrap();
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"), "second remove is a no-op");
        assert!(!reg.remove("never"));
        let log = reg.events();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, EventKind::Remove);
        assert_eq!(log[0].content_hash, shown.content_hash);
        assert!(reg.latest("a").is_none());
    }

    #[test]
    fn clear_honours_exceptions() {
        let reg = SceneRegistry::default();
        let opts = ShowOptions::default().keep_others();
        for name in ["a", "b", "c"] {
            reg.show_one(name, raw(b"x"), &opts).unwrap();
        }
        reg.clear(&["b"]);
        assert_eq!(reg.shown_names(true), vec!["b"]);
    }

    #[test]
    fn duplicate_and_reserved_names_are_rejected() {
        let reg = SceneRegistry::default();
        let err = reg
            .show(
                vec![("a".into(), raw(b"1")), ("a".into(), raw(b"2"))],
                &ShowOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ShowError::DuplicateName(n) if n == "a"));
        let err = reg
            .show_one(SHUTDOWN_NAME, raw(b"1"), &ShowOptions::default())
            .unwrap_err();
        assert!(matches!(err, ShowError::InvalidName(_)));
        assert!(reg.events().is_empty());
    }

    #[test]
    fn bad_options_fail_only_that_call() {
        let reg = SceneRegistry::default();
        reg.show_one("a", raw(b"a"), &ShowOptions::default()).unwrap();
        let bad = ShowOptions {
            color_faces: Some("yellow".into()),
            ..ShowOptions::default()
        };
        assert!(matches!(
            reg.show_one("b", raw(b"b"), &bad),
            Err(ShowError::Config(OptionError::Color(_)))
        ));
        assert_eq!(reg.shown_names(true), vec!["a"]);
        reg.show_one("b", raw(b"b"), &ShowOptions::default().keep_others())
            .unwrap();
        assert_eq!(reg.shown_names(true), vec!["a", "b"]);
    }

    #[test]
    fn shape_color_becomes_object_color() {
        let reg = SceneRegistry::default();
        let red = crate::Color::rgb(255, 0, 0);
        let shape = MockShape::face("f").with_color(red);
        let event = reg
            .show_one("s", SceneObject::Solid(Arc::new(shape)), &ShowOptions::default())
            .unwrap();
        assert_eq!(event.options.color_object, Some(red));
    }

    #[test]
    fn options_change_the_hash() {
        let reg = SceneRegistry::default();
        let a = reg
            .show_one("loc", Location::at([1.0, 2.0, 3.0]), &ShowOptions::default())
            .unwrap();
        let b = reg
            .show_one(
                "loc",
                Location::at([1.0, 2.0, 3.0]),
                &ShowOptions {
                    edges: false,
                    ..ShowOptions::default()
                },
            )
            .unwrap();
        assert_ne!(a.content_hash, b.content_hash);
        assert!(a.seq < b.seq);
    }

    #[tokio::test]
    async fn shutdown_sentinel_reaches_live_subscribers_and_is_not_an_object() {
        let reg = SceneRegistry::default();
        let mut sub = reg.subscribe(true, true);
        reg.publish_shutdown();
        let event = sub.recv().await.unwrap();
        assert!(event.is_shutdown());
        assert!(reg.shown_names(false).is_empty());
        assert!(reg.latest(SHUTDOWN_NAME).is_none());
    }

    #[test]
    fn history_cap_forgets_oldest_names() {
        let reg = SceneRegistry::with_history_cap(RenderDefaults::default(), Some(2));
        let opts = ShowOptions::default().keep_others();
        for name in ["a", "b", "c"] {
            reg.show_one(name, raw(b"x"), &opts).unwrap();
        }
        assert_eq!(reg.shown_names(true), vec!["b", "c"]);
    }
}
