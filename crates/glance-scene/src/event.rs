// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Entries of the scene event log.

use std::sync::Arc;

use glance_proto::{UpdateRecord, SHUTDOWN_NAME};

use crate::hash::ContentHash;
use crate::object::Payload;
use crate::options::RenderOptions;

/// What an event does to the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Show or replace the named object.
    Show,
    /// Hide the named object.
    Remove,
    /// Terminal sentinel: the server is going away.
    Shutdown,
}

/// One immutable entry of the event log.
///
/// Equality is identity: two events are equal only if they carry the same
/// registry sequence number.
#[derive(Debug, Clone)]
pub struct ShowEvent {
    /// Registry-local, strictly increasing id.
    pub seq: u64,
    /// Object name.
    pub name: String,
    /// Digest of payload and options.
    pub content_hash: ContentHash,
    /// Content to render.
    pub payload: Payload,
    /// Show, remove or shutdown.
    pub kind: EventKind,
    /// Options the payload is rendered with.
    pub options: Arc<RenderOptions>,
}

impl PartialEq for ShowEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ShowEvent {}

impl ShowEvent {
    pub(crate) fn shutdown(seq: u64) -> Self {
        Self {
            seq,
            name: SHUTDOWN_NAME.to_string(),
            content_hash: ContentHash::ZERO,
            payload: Payload::None,
            kind: EventKind::Shutdown,
            options: Arc::new(RenderOptions::default()),
        }
    }

    /// Returns `true` for the shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.kind == EventKind::Shutdown
    }

    /// The update-feed record announcing this event.
    pub fn to_record(&self) -> UpdateRecord {
        match self.kind {
            EventKind::Show => UpdateRecord::shown(&self.name, self.content_hash.to_hex()),
            EventKind::Remove => UpdateRecord::removed(&self.name, self.content_hash.to_hex()),
            EventKind::Shutdown => UpdateRecord::shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_maps_to_null_flag_record() {
        let record = ShowEvent::shutdown(7).to_record();
        assert!(record.is_shutdown());
        assert_eq!(record.name, SHUTDOWN_NAME);
        assert!(record.hash.is_empty());
    }

    #[test]
    fn equality_is_by_sequence_number() {
        let a = ShowEvent::shutdown(1);
        let mut b = ShowEvent::shutdown(1);
        b.name = "other".into();
        assert_eq!(a, b);
        assert_ne!(a, ShowEvent::shutdown(2));
    }
}
