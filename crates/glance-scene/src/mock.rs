// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory collaborators for headless tests.
//!
//! [`MockShape`] describes itself through labelled sub-elements,
//! [`CountingTessellator`] turns every sub-element into one primitive and
//! counts its calls per shape, [`SummaryEncoder`] emits a deterministic text "GLB" that
//! tests can inspect.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use crate::options::Color;
use crate::port::{
    ElementKind, FaceMesh, Materials, MeshEncoder, Point, Polyline, PortError, Shape, SubElement,
    TessellateRequest, Tessellation, Tessellator,
};

/// Shape made of labelled sub-elements.
#[derive(Debug, Clone, Default)]
pub struct MockShape {
    /// Sub-elements in insertion order.
    pub elements: Vec<SubElement>,
    /// Engine color.
    pub color: Option<Color>,
    /// Attached texture URI.
    pub texture_uri: Option<String>,
}

impl MockShape {
    /// Shape with the given `(kind, label)` sub-elements.
    pub fn new(elements: &[(ElementKind, &str)]) -> Self {
        Self {
            elements: elements
                .iter()
                .map(|(kind, label)| SubElement::new(*kind, label.as_bytes()))
                .collect(),
            ..Self::default()
        }
    }

    /// A single-face shape; handy when only identity matters.
    pub fn face(label: &str) -> Self {
        Self::new(&[(ElementKind::Face, label)])
    }

    /// Attach an engine color.
    #[must_use]
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }
}

impl Shape for MockShape {
    fn sub_elements(&self) -> Vec<SubElement> {
        self.elements.clone()
    }

    fn color(&self) -> Option<Color> {
        self.color
    }

    fn texture_uri(&self) -> Option<String> {
        self.texture_uri.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tessellator that counts calls and can be told to fail or stall.
#[derive(Debug, Default)]
pub struct CountingTessellator {
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    last_request: Mutex<Option<TessellateRequest>>,
    per_label: Mutex<HashMap<String, usize>>,
}

impl CountingTessellator {
    /// Create a tessellator that always succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `tessellate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls per shape, keyed by the label of the shape's first sub-element.
    pub fn calls_by_label(&self) -> HashMap<String, usize> {
        self.per_label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Request of the most recent call.
    pub fn last_request(&self) -> Option<TessellateRequest> {
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tessellator for CountingTessellator {
    fn tessellate(
        &self,
        shape: &dyn Shape,
        request: &TessellateRequest,
    ) -> Result<Tessellation, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Some(*request);
        let elements = shape.sub_elements();
        let label = elements
            .first()
            .map(|element| String::from_utf8_lossy(&element.canonical).into_owned())
            .unwrap_or_default();
        *self
            .per_label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(label)
            .or_default() += 1;
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PortError::Tessellation("injected failure".into()));
        }
        let mut out = Tessellation::default();
        for element in elements {
            match element.kind {
                ElementKind::Face if request.faces => out.faces.push(FaceMesh {
                    positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                    triangles: vec![[0, 1, 2]],
                    ..FaceMesh::default()
                }),
                ElementKind::Edge if request.edges => out.edges.push(Polyline {
                    points: vec![[0.0; 3], [1.0, 0.0, 0.0]],
                    color: None,
                }),
                ElementKind::Vertex if request.vertices => out.vertices.push(Point::default()),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Encoder producing `glTF` followed by a readable summary of its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryEncoder;

impl MeshEncoder for SummaryEncoder {
    fn encode(&self, mesh: &Tessellation, materials: &Materials) -> Result<Bytes, PortError> {
        let object = materials
            .object
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let texture = materials.texture.as_ref().map_or("-", |t| t.mime.as_str());
        Ok(Bytes::from(format!(
            "glTF faces={} edges={} vertices={} triangles={} color_faces={} color_edges={} \
             color_vertices={} color={object} texture={texture}",
            mesh.faces.len(),
            mesh.edges.len(),
            mesh.vertices.len(),
            mesh.triangle_count(),
            materials.faces,
            materials.edges,
            materials.vertices,
        )))
    }
}
