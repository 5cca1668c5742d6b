// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Render options: caller-facing [`ShowOptions`], server-wide
//! [`RenderDefaults`], and the validated [`RenderOptions`] stored on events.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;

/// Default linear tessellation tolerance.
pub const DEFAULT_TOLERANCE: f64 = 0.1;
/// Default angular tessellation tolerance (radians).
pub const DEFAULT_ANGULAR_TOLERANCE: f64 = 0.1;

/// A render option value could not be parsed.
#[derive(Debug, Error)]
pub enum OptionError {
    /// Color is not `#RRGGBB` or `#RRGGBBAA`.
    #[error("invalid color {0:?}: expected #RRGGBB or #RRGGBBAA")]
    Color(String),
    /// Texture URI uses a scheme other than `file:` or `data:`, or is malformed.
    #[error("invalid texture uri {uri:?}: {reason}")]
    TextureUri {
        /// Offending URI (data payload elided).
        uri: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A `file:` texture could not be read.
    #[error("failed to read texture {path}: {source}")]
    TextureFile {
        /// Path named by the URI.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Tolerance is not a positive finite number.
    #[error("invalid {name}: {value} (must be positive and finite)")]
    Tolerance {
        /// Option name.
        name: &'static str,
        /// Rejected value.
        value: f64,
    },
}

/// RGBA color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub [u8; 4]);

impl Color {
    /// Opaque color from RGB components.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    /// Components scaled to `0.0..=1.0`, as glTF material factors expect.
    pub fn to_linear_rgba(self) -> [f32; 4] {
        self.0.map(|c| f32::from(c) / 255.0)
    }
}

impl FromStr for Color {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || OptionError::Color(s.to_string());
        let digits = s.strip_prefix('#').ok_or_else(err)?;
        if !matches!(digits.len(), 6 | 8) || !digits.is_ascii() {
            return Err(err());
        }
        let mut out = [255u8; 4];
        for (i, slot) in out.iter_mut().take(digits.len() / 2).enumerate() {
            *slot = u8::from_str_radix(&digits[2 * i..2 * i + 2], 16).map_err(|_| err())?;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        write!(f, "#{r:02x}{g:02x}{b:02x}{a:02x}")
    }
}

/// Image applied to faces.
#[derive(Clone, PartialEq, Eq)]
pub struct Texture {
    /// Encoded image bytes.
    pub data: Bytes,
    /// MIME type, e.g. `image/png`.
    pub mime: String,
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("mime", &self.mime)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Texture {
    /// Load a texture from a `file:<path>` or `data:<mime>;base64,<data>` URI.
    pub fn from_uri(uri: &str) -> Result<Self, OptionError> {
        if let Some(path) = uri.strip_prefix("file:") {
            let data = std::fs::read(path).map_err(|source| OptionError::TextureFile {
                path: PathBuf::from(path),
                source,
            })?;
            let format = image::guess_format(&data).map_err(|e| OptionError::TextureUri {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Self {
                data: Bytes::from(data),
                mime: format.to_mime_type().to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("data:") {
            let bad = |reason: &str| OptionError::TextureUri {
                uri: format!("data:{}", rest.split(',').next().unwrap_or_default()),
                reason: reason.to_string(),
            };
            let (header, payload) = rest.split_once(',').ok_or_else(|| bad("missing ','"))?;
            let (mime, encoding) = header.split_once(';').ok_or_else(|| bad("missing ';base64'"))?;
            if encoding != "base64" || mime.is_empty() {
                return Err(bad("expected <mime>;base64"));
            }
            let data = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| bad(&e.to_string()))?;
            return Ok(Self {
                data: Bytes::from(data),
                mime: mime.to_string(),
            });
        }
        Err(OptionError::TextureUri {
            uri: uri.to_string(),
            reason: "expected file: or data: scheme".to_string(),
        })
    }
}

/// Server-wide fallbacks applied when a call does not set a value.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderDefaults {
    /// Face color.
    pub color_faces: Color,
    /// Edge color.
    pub color_edges: Color,
    /// Vertex color.
    pub color_vertices: Color,
    /// Face texture.
    pub texture: Option<Texture>,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            color_faces: Color::rgb(0xff, 0xbf, 0x00),
            color_edges: Color::rgb(0x1a, 0x1a, 0xff),
            color_vertices: Color::rgb(0x1a, 0x1a, 0x1a),
            texture: None,
        }
    }
}

/// Options accepted by one `show` call.
///
/// Colors and the texture are kept as the caller's strings and validated
/// when the call is made, so a typo fails that call only.
#[derive(Debug, Clone, PartialEq)]
pub struct ShowOptions {
    /// Remove every visible object not named in the call first.
    pub auto_clear: bool,
    /// Color of the highest-dimensional elements of each object.
    pub color: Option<String>,
    /// Face color override.
    pub color_faces: Option<String>,
    /// Edge color override.
    pub color_edges: Option<String>,
    /// Vertex color override.
    pub color_vertices: Option<String>,
    /// Face texture URI override.
    pub texture: Option<String>,
    /// Linear tessellation tolerance.
    pub tolerance: f64,
    /// Angular tessellation tolerance.
    pub angular_tolerance: f64,
    /// Emit faces.
    pub faces: bool,
    /// Emit edges.
    pub edges: bool,
    /// Emit vertices.
    pub vertices: bool,
}

impl Default for ShowOptions {
    fn default() -> Self {
        Self {
            auto_clear: true,
            color: None,
            color_faces: None,
            color_edges: None,
            color_vertices: None,
            texture: None,
            tolerance: DEFAULT_TOLERANCE,
            angular_tolerance: DEFAULT_ANGULAR_TOLERANCE,
            faces: true,
            edges: true,
            vertices: true,
        }
    }
}

impl ShowOptions {
    /// Keep previously shown objects that this call does not name.
    #[must_use]
    pub fn keep_others(mut self) -> Self {
        self.auto_clear = false;
        self
    }

    /// Validate and merge with `defaults`.
    pub fn resolve(&self, defaults: &RenderDefaults) -> Result<RenderOptions, OptionError> {
        let color = |v: &Option<String>, fallback: Color| -> Result<Color, OptionError> {
            v.as_deref().map_or(Ok(fallback), str::parse)
        };
        for (name, value) in [
            ("tolerance", self.tolerance),
            ("angular_tolerance", self.angular_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(OptionError::Tolerance { name, value });
            }
        }
        Ok(RenderOptions {
            color_object: self.color.as_deref().map(str::parse).transpose()?,
            color_faces: color(&self.color_faces, defaults.color_faces)?,
            color_edges: color(&self.color_edges, defaults.color_edges)?,
            color_vertices: color(&self.color_vertices, defaults.color_vertices)?,
            texture: match &self.texture {
                Some(uri) => Some(Texture::from_uri(uri)?),
                None => defaults.texture.clone(),
            },
            tolerance: self.tolerance,
            angular_tolerance: self.angular_tolerance,
            faces: self.faces,
            edges: self.edges,
            vertices: self.vertices,
        })
    }
}

/// Fully resolved options attached to a show event.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Color of the highest-dimensional elements, if any.
    pub color_object: Option<Color>,
    /// Face color.
    pub color_faces: Color,
    /// Edge color.
    pub color_edges: Color,
    /// Vertex color.
    pub color_vertices: Color,
    /// Face texture.
    pub texture: Option<Texture>,
    /// Linear tessellation tolerance.
    pub tolerance: f64,
    /// Angular tessellation tolerance.
    pub angular_tolerance: f64,
    /// Emit faces.
    pub faces: bool,
    /// Emit edges.
    pub edges: bool,
    /// Emit vertices.
    pub vertices: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        let defaults = RenderDefaults::default();
        Self {
            color_object: None,
            color_faces: defaults.color_faces,
            color_edges: defaults.color_edges,
            color_vertices: defaults.color_vertices,
            texture: None,
            tolerance: DEFAULT_TOLERANCE,
            angular_tolerance: DEFAULT_ANGULAR_TOLERANCE,
            faces: true,
            edges: true,
            vertices: true,
        }
    }
}

impl RenderOptions {
    /// Sorted key/value view used for hashing.
    ///
    /// Floats use their shortest round-trip representation; the texture is
    /// represented by its MIME type and a digest of its bytes.
    pub fn canonical_pairs(&self) -> BTreeMap<&'static str, String> {
        let mut out = BTreeMap::new();
        if let Some(c) = self.color_object {
            out.insert("color", c.to_string());
        }
        out.insert("color_faces", self.color_faces.to_string());
        out.insert("color_edges", self.color_edges.to_string());
        out.insert("color_vertices", self.color_vertices.to_string());
        if let Some(t) = &self.texture {
            out.insert(
                "texture",
                format!("{}:{}", t.mime, blake3::hash(&t.data).to_hex()),
            );
        }
        out.insert("tolerance", format!("{:?}", self.tolerance));
        out.insert("angular_tolerance", format!("{:?}", self.angular_tolerance));
        out.insert("faces", self.faces.to_string());
        out.insert("edges", self.edges.to_string());
        out.insert("vertices", self.vertices.to_string());
        out
    }
}
