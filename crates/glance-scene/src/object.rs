// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scene objects as callers hand them in, and the payloads stored on events.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::options::Color;
use crate::port::{Polyline, Shape, Tessellation};

/// A scene object could not be turned into a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// A composite list contains a raw GLB blob; blobs cannot be merged.
    #[error("composite lists cannot contain raw GLB blobs")]
    RawInComposite,
    /// A composite list is empty.
    #[error("composite list is empty")]
    EmptyComposite,
    /// A location has a NaN or infinite component.
    #[error("location has a non-finite component")]
    NonFiniteLocation,
}

/// Placement in space: position plus XYZ Euler orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    /// Translation.
    pub position: [f64; 3],
    /// Rotation about X, Y and Z (degrees).
    pub orientation: [f64; 3],
}

impl Location {
    /// Location at `position` with no rotation.
    pub const fn at(position: [f64; 3]) -> Self {
        Self {
            position,
            orientation: [0.0; 3],
        }
    }

    /// Convert from the engine's Z-up frame to the viewer's Y-up frame.
    pub fn to_y_up(self) -> Self {
        let [x, y, z] = self.position;
        let [rx, ry, rz] = self.orientation;
        Self {
            position: [x, z, -y],
            orientation: [rx - 90.0, ry, rz],
        }
    }

    fn is_finite(&self) -> bool {
        self.position.iter().chain(&self.orientation).all(|v| v.is_finite())
    }

    /// Unit basis vectors after applying the orientation (intrinsic X, Y, Z).
    fn basis(&self) -> [[f64; 3]; 3] {
        let [a, b, c] = self.orientation.map(f64::to_radians);
        let (sa, ca) = a.sin_cos();
        let (sb, cb) = b.sin_cos();
        let (sc, cc) = c.sin_cos();
        // Columns of Rx(a) * Ry(b) * Rz(c).
        [
            [cb * cc, ca * sc + sa * sb * cc, sa * sc - ca * sb * cc],
            [-cb * sc, ca * cc - sa * sb * sc, sa * cc + ca * sb * sc],
            [sb, -sa * cb, ca * cb],
        ]
    }

    /// Three axis polylines of length `size` (X red, Y green, Z blue).
    ///
    /// Exports draw them only when edges are enabled for the show call.
    pub fn axes(&self, size: f64) -> Tessellation {
        let colors = [
            Color::rgb(0xff, 0, 0),
            Color::rgb(0, 0xff, 0),
            Color::rgb(0, 0, 0xff),
        ];
        let origin = self.position;
        #[allow(clippy::cast_possible_truncation)]
        let to_f32 = |p: [f64; 3]| p.map(|v| v as f32);
        let edges = self
            .basis()
            .into_iter()
            .zip(colors)
            .map(|(dir, color)| {
                let tip = [
                    origin[0] + dir[0] * size,
                    origin[1] + dir[1] * size,
                    origin[2] + dir[2] * size,
                ];
                Polyline {
                    points: vec![to_f32(origin), to_f32(tip)],
                    color: Some(color),
                }
            })
            .collect();
        Tessellation {
            edges,
            ..Tessellation::default()
        }
    }
}

/// Caller input for `show`.
#[derive(Clone)]
pub enum SceneObject {
    /// A ready-made GLB blob, served as is.
    RawBytes(Bytes),
    /// Geometry to tessellate.
    Solid(Arc<dyn Shape>),
    /// A location, drawn as axes.
    Location(Location),
    /// Several geometric objects shown under one name.
    CompositeList(Vec<SceneObject>),
}

impl fmt::Debug for SceneObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawBytes(b) => f.debug_tuple("RawBytes").field(&b.len()).finish(),
            Self::Solid(s) => f.debug_tuple("Solid").field(s).finish(),
            Self::Location(l) => f.debug_tuple("Location").field(l).finish(),
            Self::CompositeList(items) => f.debug_tuple("CompositeList").field(items).finish(),
        }
    }
}

impl From<Bytes> for SceneObject {
    fn from(bytes: Bytes) -> Self {
        Self::RawBytes(bytes)
    }
}

impl From<Location> for SceneObject {
    fn from(location: Location) -> Self {
        Self::Location(location)
    }
}

/// Geometry in the viewer's frame, ready for the tessellator.
#[derive(Debug, Clone)]
pub enum Geometry {
    /// Engine shape; rotation to Y-up is applied by the tessellator.
    Solid(Arc<dyn Shape>),
    /// Location already converted to Y-up.
    Location(Location),
    /// Children in caller order.
    Composite(Vec<Geometry>),
}

impl Geometry {
    /// First engine color found, depth-first.
    pub fn color(&self) -> Option<Color> {
        match self {
            Self::Solid(s) => s.color(),
            Self::Location(_) => None,
            Self::Composite(items) => items.iter().find_map(Self::color),
        }
    }

    /// First texture URI attached to a shape, depth-first.
    pub fn texture_uri(&self) -> Option<String> {
        match self {
            Self::Solid(s) => s.texture_uri(),
            Self::Location(_) => None,
            Self::Composite(items) => items.iter().find_map(Self::texture_uri),
        }
    }
}

/// What a show event carries.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Ready-made GLB.
    Raw(Bytes),
    /// Geometry to build on demand.
    Geometry(Geometry),
    /// Remove and shutdown events carry nothing.
    None,
}

impl Payload {
    /// Returns `true` for a raw blob.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

impl SceneObject {
    /// Resolve into a payload, converting to the viewer's frame.
    pub fn into_payload(self) -> Result<Payload, ObjectError> {
        match self {
            Self::RawBytes(bytes) => Ok(Payload::Raw(bytes)),
            other => other.into_geometry().map(Payload::Geometry),
        }
    }

    fn into_geometry(self) -> Result<Geometry, ObjectError> {
        match self {
            Self::RawBytes(_) => Err(ObjectError::RawInComposite),
            Self::Solid(shape) => Ok(Geometry::Solid(shape)),
            Self::Location(loc) if loc.is_finite() => Ok(Geometry::Location(loc.to_y_up())),
            Self::Location(_) => Err(ObjectError::NonFiniteLocation),
            Self::CompositeList(items) if items.is_empty() => Err(ObjectError::EmptyComposite),
            Self::CompositeList(items) => items
                .into_iter()
                .map(Self::into_geometry)
                .collect::<Result<_, _>>()
                .map(Geometry::Composite),
        }
    }
}
