// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content hashing for change detection.
//!
//! Every digest is BLAKE3 over a domain-separated, length-prefixed encoding,
//! so two payloads collide only if their canonical encodings are identical.
//! Engine-internal identifiers never take part: geometry is hashed through
//! [`Shape::sub_elements`](crate::Shape::sub_elements), sorted.

use std::fmt;

use crate::object::{Geometry, Location, Payload};
use crate::options::RenderOptions;

/// 32-byte BLAKE3 digest; lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// All-zero digest carried by events without content.
    pub const ZERO: Self = Self([0; 32]);

    /// View the digest as bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

fn update_len_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Fixed-point encoding with micro-unit resolution; `-0.0` maps to `0`.
#[allow(clippy::cast_possible_truncation)]
fn canonical_f64(v: f64) -> [u8; 8] {
    ((v * 1_000_000.0).round() as i64).to_le_bytes()
}

fn geometry_digest(geometry: &Geometry) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    match geometry {
        Geometry::Solid(shape) => {
            let mut elements = shape.sub_elements();
            elements.sort();
            hasher.update(b"solid:");
            hasher.update(&(elements.len() as u64).to_le_bytes());
            for element in &elements {
                hasher.update(&[element.kind.tag()]);
                update_len_prefixed(&mut hasher, &element.canonical);
            }
        }
        Geometry::Location(Location {
            position,
            orientation,
        }) => {
            hasher.update(b"loc:");
            for v in position.iter().chain(orientation) {
                hasher.update(&canonical_f64(*v));
            }
        }
        Geometry::Composite(children) => {
            hasher.update(b"composite:");
            hasher.update(&(children.len() as u64).to_le_bytes());
            for child in children {
                hasher.update(&geometry_digest(child));
            }
        }
    }
    *hasher.finalize().as_bytes()
}

/// Digest of `payload` rendered with `options`.
pub fn content_hash(payload: &Payload, options: &RenderOptions) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    match payload {
        Payload::Raw(bytes) => {
            hasher.update(b"raw:");
            update_len_prefixed(&mut hasher, bytes);
        }
        Payload::Geometry(geometry) => {
            hasher.update(b"geom:");
            hasher.update(&geometry_digest(geometry));
        }
        Payload::None => {
            hasher.update(b"none:");
        }
    }
    let pairs = options.canonical_pairs();
    hasher.update(b"opts:");
    hasher.update(&(pairs.len() as u64).to_le_bytes());
    for (key, value) in &pairs {
        update_len_prefixed(&mut hasher, key.as_bytes());
        update_len_prefixed(&mut hasher, value.as_bytes());
    }
    ContentHash(*hasher.finalize().as_bytes())
}
