// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scene state for the Glance preview server.
//!
//! - [`SceneRegistry`] keeps the compacted show/remove log and answers "what
//!   is visible now".
//! - [`BuildCache`] turns visible objects into GLB artifacts on demand, at
//!   most one build per name and content hash.
//! - [`content_hash`] provides the digest viewers use to skip refetching.
//!
//! Geometry and GLB encoding are delegated to the [`Tessellator`] and
//! [`MeshEncoder`] ports. With the `test-utils` feature, [`mock`] provides
//! in-memory implementations.

mod build;
mod event;
mod hash;
mod object;
mod options;
mod port;
mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use build::{Artifact, BuildCache, BuildFailure, ExportError};
pub use event::{EventKind, ShowEvent};
pub use hash::{content_hash, ContentHash};
pub use object::{Geometry, Location, ObjectError, Payload, SceneObject};
pub use options::{
    Color, OptionError, RenderDefaults, RenderOptions, ShowOptions, Texture,
    DEFAULT_ANGULAR_TOLERANCE, DEFAULT_TOLERANCE,
};
pub use port::{
    ElementKind, FaceMesh, Materials, MeshEncoder, Point, Polyline, PortError, Shape, SubElement,
    TessellateRequest, Tessellation, Tessellator,
};
pub use registry::{SceneRegistry, ShowError};
