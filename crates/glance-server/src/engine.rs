// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Geometry engine used when none is linked in.
//!
//! The standalone binary only serves pre-built GLB blobs, so every port call
//! fails with a message naming what is missing.

use bytes::Bytes;
use glance_scene::{
    Materials, MeshEncoder, PortError, Shape, TessellateRequest, Tessellation, Tessellator,
};

/// Tessellator and encoder that reject all work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeometryEngine;

impl Tessellator for NoGeometryEngine {
    fn tessellate(
        &self,
        _shape: &dyn Shape,
        _request: &TessellateRequest,
    ) -> Result<Tessellation, PortError> {
        Err(PortError::Tessellation(
            "no geometry engine is linked into this server".into(),
        ))
    }
}

impl MeshEncoder for NoGeometryEngine {
    fn encode(&self, _mesh: &Tessellation, _materials: &Materials) -> Result<Bytes, PortError> {
        Err(PortError::Encoding(
            "no mesh encoder is linked into this server".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glance_scene::mock::MockShape;
    use glance_scene::Color;

    #[test]
    fn every_call_fails_with_a_port_error() {
        let engine = NoGeometryEngine;
        let request = TessellateRequest {
            tolerance: 0.1,
            angular_tolerance: 0.1,
            faces: true,
            edges: true,
            vertices: true,
            z_up_to_y_up: true,
        };
        let materials = Materials {
            faces: Color::rgb(1, 2, 3),
            edges: Color::rgb(1, 2, 3),
            vertices: Color::rgb(1, 2, 3),
            object: None,
            texture: None,
        };
        assert!(matches!(
            engine.tessellate(&MockShape::face("f"), &request),
            Err(PortError::Tessellation(_))
        ));
        assert!(matches!(
            engine.encode(&Tessellation::default(), &materials),
            Err(PortError::Encoding(_))
        ));
    }
}
