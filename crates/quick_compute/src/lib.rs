// src/lib.rs
//! Compute-shader dispatch as retained-mode scene elements.
//!
//! This library maps declared data buffers onto GPU resources, builds a
//! compute pipeline over them, dispatches it in step with the host's frame
//! loop and republishes the results as renderable scene nodes (point clouds
//! and textured quads). The graphics device and the render surface are
//! capability traits supplied by the host.

pub mod buffer;
pub mod compute_unit;
pub mod config;
pub mod error;
pub mod image_source;
pub mod properties;
pub mod rhi;
pub mod scene;
pub mod shader;
pub mod signal;
pub mod surface;
pub mod uniforms;
pub mod views;

// Re-export commonly used types for convenience.
pub use self::buffer::{BufferArena, BufferHandle, BufferKind, ImageBuffer, ShaderBuffer, StorageBuffer, TextureFormat};
pub use self::compute_unit::{ComputeUnit, PipelineState, WeakComputeUnit};
pub use self::config::{Scene, SceneConfig};
pub use self::error::{BufferError, ConfigError, DeviceError};
pub use self::properties::{PropertyId, PropertySet, PropertyValue};
pub use self::rhi::{CommandBuffer, GraphicsDevice, RecordingDevice, ResourceUpdateBatch};
pub use self::scene::{Item, RenderNode, RenderState, SceneGraph, SceneNode};
pub use self::surface::{FramePhase, RenderSurface, WindowList};
pub use self::uniforms::UniformReflector;
pub use self::views::{PointCloudView, TextureView};
