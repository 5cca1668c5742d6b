// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the Glance preview server.
//!
//! - [`UpdateRecord`] is the JSON body of one update-feed frame; the feed is
//!   served as server-sent events ([`parse_event_stream`] reads it back).
//! - [`glbs`] frames a sequence of independent GLB blobs into one stream.

use serde::{Deserialize, Serialize};

pub mod glbs;

/// Default TCP port of the preview server.
pub const DEFAULT_PORT: u16 = 32323;

/// Long-lived update feed (server-sent events).
pub const UPDATES_PATH: &str = "/api/updates";
/// Per-object GLB export; the object name is appended as a path segment.
pub const OBJECT_PATH: &str = "/api/object";
/// Whole-scene GLBS export.
pub const EXPORT_PATH: &str = "/api/export";

/// Name carried by the shutdown sentinel.
pub const SHUTDOWN_NAME: &str = "__shutdown";

/// MIME type of a single exported object.
pub const GLB_MIME: &str = "model/gltf-binary";
/// MIME type of a GLBS stream.
pub const GLBS_MIME: &str = "model/gltf-binary-sequence";

/// Reconnect delay advertised to viewers in the `retry:` field of the feed.
pub const SSE_RETRY_MILLIS: u64 = 100;

/// One update-feed record.
///
/// `is_remove` is tri-state on the wire: `false` shows (or replaces) the
/// object, `true` removes it, `null` announces that the server is shutting
/// down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Object name; unique within the scene.
    pub name: String,
    /// Content hash (lowercase hex) used to skip refetching unchanged objects.
    pub hash: String,
    /// `Some(false)` show, `Some(true)` remove, `None` shutdown.
    pub is_remove: Option<bool>,
}

impl UpdateRecord {
    /// Record announcing that `name` is now visible with content `hash`.
    pub fn shown(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            is_remove: Some(false),
        }
    }

    /// Record announcing that `name` is no longer visible.
    pub fn removed(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            is_remove: Some(true),
        }
    }

    /// Shutdown sentinel record.
    pub fn shutdown() -> Self {
        Self {
            name: SHUTDOWN_NAME.to_string(),
            hash: String::new(),
            is_remove: None,
        }
    }

    /// Returns `true` for the shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.is_remove.is_none()
    }

    /// Serialize to the compact JSON carried in one feed frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one feed frame body.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Extract the update records from a server-sent-events body.
///
/// Comment lines, `retry:`/`event:`/`id:` fields and blank events are
/// skipped; multi-line `data:` fields are joined with `\n` before parsing.
pub fn parse_event_stream(body: &str) -> Result<Vec<UpdateRecord>, serde_json::Error> {
    let mut records = Vec::new();
    let mut data: Vec<&str> = Vec::new();
    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                records.push(UpdateRecord::from_json(&data.join("\n"))?);
                data.clear();
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    Ok(records)
}
