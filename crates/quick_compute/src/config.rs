//! JSON scene descriptions.
//!
//! A scene names its buffers, the compute units they are attached to and the
//! views presenting the results:
//!
//! ```json
//! {
//!   "buffers": [
//!     { "name": "particles", "kind": "storage", "payload": { "zeroed": 24000 } },
//!     { "name": "field", "kind": "image", "imageSize": [256, 256], "textureFormat": "RGBA32F",
//!       "payload": { "zeroed": 1048576 } }
//!   ],
//!   "computeUnits": [
//!     { "name": "sim", "computeShader": "particles.wgsl", "dispatchX": 16,
//!       "buffers": ["particles"], "uniforms": [{ "name": "dt", "value": 0.016 }],
//!       "continuous": true }
//!   ],
//!   "views": [
//!     { "type": "pointCloud", "computeUnit": "sim", "resultBuffer": "particles",
//!       "numberOfPoints": 1000, "pointSize": 2.0, "strideInByte": 24 }
//!   ]
//! }
//! ```
//!
//! Relative paths resolve against the scene file's directory. Unknown or
//! duplicate names are errors; out-of-range option values are refused with a
//! warning and the default is kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Deserialize;

use crate::buffer::{BufferArena, BufferHandle, ImageBuffer, ShaderBuffer, StorageBuffer, TextureFormat};
use crate::compute_unit::ComputeUnit;
use crate::error::ConfigError;
use crate::scene::{ItemId, Rect, SceneGraph};
use crate::surface::RenderSurface;
use crate::views::{PointCloudView, TextureView, MIN_STRIDE};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SceneConfig {
    #[serde(default)]
    pub buffers: Vec<BufferConfig>,
    #[serde(default)]
    pub compute_units: Vec<ComputeUnitConfig>,
    #[serde(default)]
    pub views: Vec<ViewConfig>,
}

impl SceneConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BufferKindConfig {
    Storage,
    Image,
}

/// Initial bytes of a buffer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadConfig {
    /// Native-endian `f32`s.
    Floats(Vec<f32>),
    /// Native-endian `u32`s.
    Uints(Vec<u32>),
    /// That many zero bytes.
    Zeroed(usize),
    /// Raw file contents.
    File(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BufferConfig {
    pub name: String,
    pub kind: BufferKindConfig,
    #[serde(default)]
    pub payload: Option<PayloadConfig>,
    #[serde(default)]
    pub image_size: Option<[u32; 2]>,
    #[serde(default)]
    pub texture_format: Option<TextureFormat>,
    #[serde(default)]
    pub image_source: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UniformValueConfig {
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniformConfig {
    pub name: String,
    pub value: UniformValueConfig,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComputeUnitConfig {
    pub name: String,
    pub compute_shader: PathBuf,
    #[serde(default = "one")]
    pub dispatch_x: u32,
    #[serde(default = "one")]
    pub dispatch_y: u32,
    #[serde(default = "one")]
    pub dispatch_z: u32,
    #[serde(default)]
    pub buffers: Vec<String>,
    #[serde(default)]
    pub uniforms: Vec<UniformConfig>,
    /// Dispatch every frame instead of once after the first build.
    #[serde(default)]
    pub continuous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RectConfig {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<RectConfig> for Rect {
    fn from(r: RectConfig) -> Self {
        Rect::new(r.x, r.y, r.width, r.height)
    }
}

fn default_point_size() -> f32 {
    1.0
}

fn default_stride() -> u32 {
    MIN_STRIDE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PointCloudConfig {
    pub compute_unit: String,
    pub result_buffer: String,
    #[serde(default)]
    pub number_of_points: u32,
    #[serde(default = "default_point_size")]
    pub point_size: f32,
    #[serde(default = "default_stride")]
    pub stride_in_byte: u32,
    #[serde(default)]
    pub rect: Option<RectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageViewConfig {
    pub compute_unit: String,
    pub result_buffer: String,
    #[serde(default)]
    pub rect: Option<RectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewConfig {
    PointCloud(PointCloudConfig),
    Image(ImageViewConfig),
}

/// A scene instantiated from a [`SceneConfig`].
pub struct Scene {
    arena: Rc<BufferArena>,
    buffers: HashMap<String, BufferHandle>,
    units: Vec<(String, ComputeUnit)>,
    views: Vec<ItemId>,
    graph: SceneGraph,
}

impl Scene {
    /// Reads `path` and instantiates it.
    pub fn load(
        path: &Path,
        surface: Option<Rc<RenderSurface>>,
        default_rect: Rect,
    ) -> Result<Self, ConfigError> {
        let config = SceneConfig::from_path(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_config(&config, base_dir, surface, default_rect)
    }

    /// Creates every buffer, unit and view of `config`. Units bind to
    /// `surface`, or to the first live surface when `None`. Views without a
    /// rectangle cover `default_rect`.
    pub fn from_config(
        config: &SceneConfig,
        base_dir: &Path,
        surface: Option<Rc<RenderSurface>>,
        default_rect: Rect,
    ) -> Result<Self, ConfigError> {
        let arena = BufferArena::new();
        let mut scene = Self {
            arena: arena.clone(),
            buffers: HashMap::new(),
            units: Vec::new(),
            views: Vec::new(),
            graph: SceneGraph::new(),
        };

        for buf in &config.buffers {
            if scene.buffers.contains_key(&buf.name) {
                return Err(ConfigError::DuplicateName {
                    what: "buffer",
                    name: buf.name.clone(),
                });
            }
            let handle = arena.insert(build_buffer(buf, base_dir)?);
            scene.buffers.insert(buf.name.clone(), handle);
        }

        for cfg in &config.compute_units {
            if scene.unit(&cfg.name).is_some() {
                return Err(ConfigError::DuplicateName {
                    what: "compute unit",
                    name: cfg.name.clone(),
                });
            }
            let unit = match &surface {
                Some(s) => ComputeUnit::with_surface(&arena, Some(s.clone())),
                None => ComputeUnit::new(&arena),
            };
            unit.set_compute_shader(resolve(base_dir, &cfg.compute_shader));
            unit.set_dispatch_x(cfg.dispatch_x);
            unit.set_dispatch_y(cfg.dispatch_y);
            unit.set_dispatch_z(cfg.dispatch_z);
            let handles = cfg
                .buffers
                .iter()
                .map(|name| scene.buffer_handle(name))
                .collect::<Result<Vec<_>, _>>()?;
            unit.set_buffers(&handles);
            for uniform in &cfg.uniforms {
                match uniform.value {
                    UniformValueConfig::Bool(v) => unit.declare_property(&uniform.name, v),
                    UniformValueConfig::Int(v) => unit.declare_property(&uniform.name, v),
                    UniformValueConfig::Float(v) => unit.declare_property(&uniform.name, v),
                };
            }
            unit.complete();
            if cfg.continuous {
                unit.compute_continuously();
            }
            log::info!(
                "compute unit '{}': {} buffer(s), {} uniform byte(s)",
                cfg.name,
                unit.buffer_count(),
                unit.uniform_buffer_size()
            );
            scene.units.push((cfg.name.clone(), unit));
        }

        for view in &config.views {
            let id = match view {
                ViewConfig::PointCloud(cfg) => {
                    let unit = scene.unit_or_err(&cfg.compute_unit)?.clone();
                    let handle = scene.buffer_handle(&cfg.result_buffer)?;
                    let mut item = PointCloudView::new(cfg.rect.map_or(default_rect, Rect::from));
                    item.set_compute_unit(&unit);
                    item.set_result_buffer(handle);
                    item.set_number_of_points(cfg.number_of_points);
                    item.set_point_size(cfg.point_size);
                    item.set_stride_in_byte(cfg.stride_in_byte);
                    scene.graph.add(item)
                }
                ViewConfig::Image(cfg) => {
                    let unit = scene.unit_or_err(&cfg.compute_unit)?.clone();
                    let handle = scene.buffer_handle(&cfg.result_buffer)?;
                    let mut item = TextureView::new(cfg.rect.map_or(default_rect, Rect::from));
                    item.set_compute_unit(&unit);
                    item.set_image_buffer(handle);
                    scene.graph.add(item)
                }
            };
            scene.views.push(id);
        }

        Ok(scene)
    }

    pub fn arena(&self) -> &Rc<BufferArena> {
        &self.arena
    }

    pub fn buffer(&self, name: &str) -> Option<BufferHandle> {
        self.buffers.get(name).copied()
    }

    pub fn unit(&self, name: &str) -> Option<&ComputeUnit> {
        self.units.iter().find(|(n, _)| n == name).map(|(_, u)| u)
    }

    pub fn units(&self) -> impl Iterator<Item = (&str, &ComputeUnit)> {
        self.units.iter().map(|(n, u)| (n.as_str(), u))
    }

    /// View items in declaration order.
    pub fn views(&self) -> &[ItemId] {
        &self.views
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut SceneGraph {
        &mut self.graph
    }

    fn buffer_handle(&self, name: &str) -> Result<BufferHandle, ConfigError> {
        self.buffer(name).ok_or_else(|| ConfigError::UnknownName {
            what: "buffer",
            name: name.to_owned(),
        })
    }

    fn unit_or_err(&self, name: &str) -> Result<&ComputeUnit, ConfigError> {
        self.unit(name).ok_or_else(|| ConfigError::UnknownName {
            what: "compute unit",
            name: name.to_owned(),
        })
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn payload_bytes(payload: &PayloadConfig, base_dir: &Path) -> Result<Vec<u8>, ConfigError> {
    Ok(match payload {
        PayloadConfig::Floats(v) => bytemuck::cast_slice(v).to_vec(),
        PayloadConfig::Uints(v) => bytemuck::cast_slice(v).to_vec(),
        PayloadConfig::Zeroed(n) => vec![0; *n],
        PayloadConfig::File(path) => {
            let path = resolve(base_dir, path);
            std::fs::read(&path).map_err(|source| ConfigError::Io { path, source })?
        }
    })
}

fn build_buffer(cfg: &BufferConfig, base_dir: &Path) -> Result<ShaderBuffer, ConfigError> {
    let payload = match &cfg.payload {
        Some(p) => payload_bytes(p, base_dir)?,
        None => Vec::new(),
    };
    match cfg.kind {
        BufferKindConfig::Storage => {
            if cfg.image_size.is_some() || cfg.image_source.is_some() || cfg.texture_format.is_some() {
                return Err(ConfigError::InvalidOption {
                    option: "kind",
                    reason: format!("storage buffer '{}' declares image options", cfg.name),
                });
            }
            Ok(StorageBuffer::new(payload).into())
        }
        BufferKindConfig::Image => {
            let mut image = ImageBuffer::new()
                .with_payload(payload)
                .with_format(cfg.texture_format.unwrap_or_default());
            if let Some([w, h]) = cfg.image_size {
                image = image.with_size(w, h);
            }
            if let Some(source) = &cfg.image_source {
                image = image.with_source(resolve(base_dir, source));
            }
            Ok(image.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;

    const SCENE: &str = r#"{
        "buffers": [
            { "name": "points", "kind": "storage", "payload": { "floats": [0.0, 0.0, 1.0, 0.0, 0.0, 1.0] } },
            { "name": "img", "kind": "image", "imageSize": [4, 4], "textureFormat": "RGBA16F",
              "payload": { "zeroed": 128 } }
        ],
        "computeUnits": [
            { "name": "sim", "computeShader": "sim.spv", "dispatchX": 4, "dispatchZ": 0,
              "buffers": ["points", "img"],
              "uniforms": [ { "name": "dt", "value": 0.5 }, { "name": "n", "value": 3 },
                            { "name": "on", "value": true } ] }
        ],
        "views": [
            { "type": "pointCloud", "computeUnit": "sim", "resultBuffer": "points",
              "numberOfPoints": 1, "strideInByte": 16 },
            { "type": "image", "computeUnit": "sim", "resultBuffer": "img",
              "rect": { "x": 1, "y": 2, "width": 3, "height": 4 } }
        ]
    }"#;

    #[test]
    fn builds_units_buffers_and_views() {
        let config = SceneConfig::from_json(SCENE).unwrap();
        let scene = Scene::from_config(&config, Path::new("/scenes"), None, Rect::default()).unwrap();

        let unit = scene.unit("sim").unwrap();
        assert_eq!(unit.compute_shader(), PathBuf::from("/scenes/sim.spv"));
        assert_eq!((unit.dispatch_x(), unit.dispatch_y(), unit.dispatch_z()), (4, 1, 1));
        assert_eq!(unit.buffer_count(), 2);
        assert_eq!(unit.uniform_buffer_size(), 12);
        assert_eq!(unit.property("n"), Some(PropertyValue::Int(3)));
        assert_eq!(unit.property("on"), Some(PropertyValue::Bool(true)));

        assert_eq!(scene.arena().payload(scene.buffer("points").unwrap()).unwrap().len(), 24);

        let views = scene.views();
        let cloud = scene.graph().item::<PointCloudView>(views[0]).unwrap();
        assert_eq!(cloud.stride_in_byte(), MIN_STRIDE);
        assert_eq!(cloud.result_index(), Some(0));
        let image = scene.graph().item::<TextureView>(views[1]).unwrap();
        assert_eq!(crate::scene::Item::rect(image), Rect::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn unknown_names_are_errors() {
        let config = SceneConfig::from_json(
            r#"{ "computeUnits": [ { "name": "u", "computeShader": "x", "buffers": ["nope"] } ] }"#,
        )
        .unwrap();
        let err = Scene::from_config(&config, Path::new("."), None, Rect::default()).err();
        assert!(matches!(err, Some(ConfigError::UnknownName { what: "buffer", .. })));
    }

    #[test]
    fn duplicate_buffers_are_errors() {
        let config = SceneConfig::from_json(
            r#"{ "buffers": [ { "name": "a", "kind": "storage" }, { "name": "a", "kind": "image" } ] }"#,
        )
        .unwrap();
        let err = Scene::from_config(&config, Path::new("."), None, Rect::default()).err();
        assert!(matches!(err, Some(ConfigError::DuplicateName { .. })));
    }

    #[test]
    fn storage_buffers_reject_image_options() {
        let config = SceneConfig::from_json(
            r#"{ "buffers": [ { "name": "a", "kind": "storage", "imageSize": [1, 1] } ] }"#,
        )
        .unwrap();
        let err = Scene::from_config(&config, Path::new("."), None, Rect::default()).err();
        assert!(matches!(err, Some(ConfigError::InvalidOption { option: "kind", .. })));
    }

    #[test]
    fn image_views_bind_their_result_buffer() {
        let config = SceneConfig::from_json(
            r#"{
                "buffers": [ { "name": "img", "kind": "image", "imageSize": [1, 1],
                               "payload": { "zeroed": 4 } } ],
                "computeUnits": [ { "name": "u", "computeShader": "u.spv", "buffers": ["img"] } ],
                "views": [ { "type": "image", "computeUnit": "u", "resultBuffer": "img" } ]
            }"#,
        )
        .unwrap();
        let scene = Scene::from_config(&config, Path::new("."), None, Rect::default()).unwrap();
        let view = scene.graph().item::<TextureView>(scene.views()[0]).unwrap();
        assert_eq!(view.image_buffer(), scene.buffer("img"));

        let err = SceneConfig::from_json(
            r#"{ "views": [ { "type": "image", "computeUnit": "u", "imageBuffer": "img" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let err = SceneConfig::from_json(r#"{ "buffers": [], "shaders": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
