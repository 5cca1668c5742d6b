// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ports to the geometry engine and the mesh encoder.
//!
//! The registry never inspects geometry itself. A [`Shape`] is an opaque
//! handle that can describe its sub-elements canonically (for hashing); a
//! [`Tessellator`] turns it into a [`Tessellation`]; a [`MeshEncoder`] turns
//! that into one GLB blob.

use std::any::Any;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::options::{Color, Texture};

/// Topological category of a sub-element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    /// Surface patch.
    Face,
    /// Curve segment.
    Edge,
    /// Point.
    Vertex,
}

impl ElementKind {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Face => 2,
            Self::Edge => 1,
            Self::Vertex => 0,
        }
    }
}

/// Identifier-free description of one sub-element.
///
/// Two shapes with the same geometry must produce the same descriptions
/// regardless of allocation order or engine-internal ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubElement {
    /// Category.
    pub kind: ElementKind,
    /// Canonical bytes (e.g. rounded coordinates and surface parameters).
    pub canonical: Vec<u8>,
}

impl SubElement {
    /// Convenience constructor.
    pub fn new(kind: ElementKind, canonical: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            canonical: canonical.into(),
        }
    }
}

/// Opaque geometric handle owned by the geometry engine.
pub trait Shape: fmt::Debug + Send + Sync + 'static {
    /// Canonical descriptions of every face, edge and vertex.
    fn sub_elements(&self) -> Vec<SubElement>;

    /// Color attached to the shape by the modelling tool, if any.
    fn color(&self) -> Option<Color> {
        None
    }

    /// Texture URI attached to the shape, if any. Overrides the call option.
    fn texture_uri(&self) -> Option<String> {
        None
    }

    /// Downcasting hook for engine-specific tessellators.
    fn as_any(&self) -> &dyn Any;
}

/// Parameters handed to the tessellator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TessellateRequest {
    /// Linear deflection.
    pub tolerance: f64,
    /// Angular deflection (radians).
    pub angular_tolerance: f64,
    /// Emit faces.
    pub faces: bool,
    /// Emit edges.
    pub edges: bool,
    /// Emit vertices.
    pub vertices: bool,
    /// Rotate the result from the engine's Z-up frame into the viewer's Y-up
    /// frame (-90° about X).
    pub z_up_to_y_up: bool,
}

/// Triangulated face.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceMesh {
    /// Vertex positions.
    pub positions: Vec<[f32; 3]>,
    /// Triangles as indices into `positions`.
    pub triangles: Vec<[u32; 3]>,
    /// Per-vertex UVs; empty or the same length as `positions`.
    pub uvs: Vec<[f32; 2]>,
    /// Per-face color from the engine.
    pub color: Option<Color>,
}

/// Discretized edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Polyline {
    /// Consecutive points.
    pub points: Vec<[f32; 3]>,
    /// Per-edge color from the engine.
    pub color: Option<Color>,
}

/// Isolated point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    /// Position.
    pub position: [f32; 3],
    /// Per-vertex color from the engine.
    pub color: Option<Color>,
}

/// Output of the geometry engine for one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tessellation {
    /// Faces.
    pub faces: Vec<FaceMesh>,
    /// Edges.
    pub edges: Vec<Polyline>,
    /// Vertices.
    pub vertices: Vec<Point>,
}

impl Tessellation {
    /// Append everything from `other`.
    pub fn extend(&mut self, other: Self) {
        self.faces.extend(other.faces);
        self.edges.extend(other.edges);
        self.vertices.extend(other.vertices);
    }

    /// Returns `true` if nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty() && self.edges.is_empty() && self.vertices.is_empty()
    }

    /// Total triangle count across faces.
    pub fn triangle_count(&self) -> usize {
        self.faces.iter().map(|f| f.triangles.len()).sum()
    }
}

/// Materials applied by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Materials {
    /// Face color.
    pub faces: Color,
    /// Edge color.
    pub edges: Color,
    /// Vertex color.
    pub vertices: Color,
    /// Overrides the color of the highest-dimensional elements present.
    pub object: Option<Color>,
    /// Face texture.
    pub texture: Option<Texture>,
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// The geometry engine rejected the shape.
    #[error("tessellation failed: {0}")]
    Tessellation(String),
    /// The encoder could not produce a GLB.
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Geometry engine port.
pub trait Tessellator: Send + Sync {
    /// Tessellate `shape`.
    fn tessellate(
        &self,
        shape: &dyn Shape,
        request: &TessellateRequest,
    ) -> Result<Tessellation, PortError>;
}

/// Mesh encoder port.
pub trait MeshEncoder: Send + Sync {
    /// Encode `mesh` as one self-contained GLB.
    fn encode(&self, mesh: &Tessellation, materials: &Materials) -> Result<Bytes, PortError>;
}
