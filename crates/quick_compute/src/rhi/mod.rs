//! Graphics-device capability interface.
//!
//! The core drives GPU work exclusively through [`GraphicsDevice`] and
//! [`CommandBuffer`]. Resources are referred to by small copyable handles;
//! the device implementation owns the real objects behind them.

mod recording;

pub use self::recording::{Command, RecordingDevice};

use bitflags::bitflags;

use crate::buffer::TextureFormat;
use crate::error::DeviceError;
use crate::scene::Rect;
use crate::shader::ShaderBytecode;

macro_rules! rhi_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

rhi_handle!(
    /// A GPU buffer.
    RhiBuffer
);
rhi_handle!(
    /// A GPU texture.
    RhiTexture
);
rhi_handle!(
    /// A resource-binding set.
    RhiBindings
);
rhi_handle!(RhiComputePipeline);
rhi_handle!(RhiGraphicsPipeline);

/// Any releasable device resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RhiResource {
    Buffer(RhiBuffer),
    Texture(RhiTexture),
    Bindings(RhiBindings),
    ComputePipeline(RhiComputePipeline),
    GraphicsPipeline(RhiGraphicsPipeline),
}

impl RhiResource {
    pub fn raw(self) -> u64 {
        match self {
            RhiResource::Buffer(h) => h.raw(),
            RhiResource::Texture(h) => h.raw(),
            RhiResource::Bindings(h) => h.raw(),
            RhiResource::ComputePipeline(h) => h.raw(),
            RhiResource::GraphicsPipeline(h) => h.raw(),
        }
    }
}

impl From<RhiBuffer> for RhiResource {
    fn from(h: RhiBuffer) -> Self {
        RhiResource::Buffer(h)
    }
}

impl From<RhiTexture> for RhiResource {
    fn from(h: RhiTexture) -> Self {
        RhiResource::Texture(h)
    }
}

impl From<RhiBindings> for RhiResource {
    fn from(h: RhiBindings) -> Self {
        RhiResource::Bindings(h)
    }
}

impl From<RhiComputePipeline> for RhiResource {
    fn from(h: RhiComputePipeline) -> Self {
        RhiResource::ComputePipeline(h)
    }
}

impl From<RhiGraphicsPipeline> for RhiResource {
    fn from(h: RhiGraphicsPipeline) -> Self {
        RhiResource::GraphicsPipeline(h)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const UNIFORM = 1 << 1;
        const STORAGE = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const LOAD_STORE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// Update frequency of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Uploaded once, then only touched by the GPU.
    Immutable,
    /// Rewritten by the host every frame.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub ty: BufferType,
    pub usage: BufferUsage,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    UniformBuffer(RhiBuffer),
    /// Read/write storage buffer.
    StorageBuffer(RhiBuffer),
    /// Read/write storage image, mip level 0.
    StorageImage(RhiTexture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceBinding {
    pub binding: u32,
    pub stages: ShaderStages,
    pub resource: BindingResource,
}

impl ShaderResourceBinding {
    pub fn uniform_buffer(binding: u32, stages: ShaderStages, buffer: RhiBuffer) -> Self {
        Self {
            binding,
            stages,
            resource: BindingResource::UniformBuffer(buffer),
        }
    }

    pub fn storage_buffer(binding: u32, stages: ShaderStages, buffer: RhiBuffer) -> Self {
        Self {
            binding,
            stages,
            resource: BindingResource::StorageBuffer(buffer),
        }
    }

    pub fn storage_image(binding: u32, stages: ShaderStages, texture: RhiTexture) -> Self {
        Self {
            binding,
            stages,
            resource: BindingResource::StorageImage(texture),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float2,
    Float4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float2 => 8,
            VertexFormat::Float4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// A point-topology graphics pipeline reading one interleaved vertex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsPipelineDesc {
    pub label: String,
    pub bindings: RhiBindings,
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

/// One queued upload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceUpdate {
    StaticBuffer {
        buffer: RhiBuffer,
        data: Vec<u8>,
    },
    DynamicBuffer {
        buffer: RhiBuffer,
        offset: u64,
        data: Vec<u8>,
    },
    Texture {
        texture: RhiTexture,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

/// Uploads recorded on the CPU and applied together before a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdateBatch {
    updates: Vec<ResourceUpdate>,
}

impl ResourceUpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_static_buffer(&mut self, buffer: RhiBuffer, data: impl Into<Vec<u8>>) {
        self.updates.push(ResourceUpdate::StaticBuffer {
            buffer,
            data: data.into(),
        });
    }

    pub fn update_dynamic_buffer(&mut self, buffer: RhiBuffer, offset: u64, data: impl Into<Vec<u8>>) {
        self.updates.push(ResourceUpdate::DynamicBuffer {
            buffer,
            offset,
            data: data.into(),
        });
    }

    pub fn upload_texture(&mut self, texture: RhiTexture, width: u32, height: u32, data: impl Into<Vec<u8>>) {
        self.updates.push(ResourceUpdate::Texture {
            texture,
            width,
            height,
            data: data.into(),
        });
    }

    /// Appends every update of `other` after the ones already queued.
    pub fn merge(&mut self, other: ResourceUpdateBatch) {
        self.updates.extend(other.updates);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> &[ResourceUpdate] {
        &self.updates
    }

    pub fn into_updates(self) -> Vec<ResourceUpdate> {
        self.updates
    }
}

/// A texture handed out for presentation.
///
/// Shared by reference between the compute unit that created it and any view
/// drawing it. Its release goes through the render surface's job queue.
#[derive(Debug, PartialEq, Eq)]
pub struct PresentedTexture {
    texture: RhiTexture,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl PresentedTexture {
    pub fn new(texture: RhiTexture, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            texture,
            width,
            height,
            format,
        }
    }

    pub fn rhi_texture(&self) -> RhiTexture {
        self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

/// Commands recorded into the current frame.
pub trait CommandBuffer {
    /// Applies uploads outside of any pass.
    fn resource_update(&mut self, batch: ResourceUpdateBatch);

    /// Opens a compute pass; `batch` is applied before it starts.
    fn begin_compute_pass(&mut self, batch: ResourceUpdateBatch);
    fn set_compute_pipeline(&mut self, pipeline: RhiComputePipeline);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn end_compute_pass(&mut self);

    fn begin_render_pass(&mut self);
    fn end_render_pass(&mut self);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_graphics_pipeline(&mut self, pipeline: RhiGraphicsPipeline);
    fn set_vertex_input(&mut self, slot: u32, buffer: RhiBuffer, offset: u64);
    fn draw(&mut self, vertex_count: u32);
    /// Draws `texture` as a quad covering `rect` in logical window coordinates.
    fn draw_texture(&mut self, texture: RhiTexture, filter: Filter, rect: Rect);

    /// Binds a resource set for the pipeline bound last.
    fn set_shader_resources(&mut self, bindings: RhiBindings);
}

/// Resource factory and frame recorder supplied by the host.
pub trait GraphicsDevice {
    fn next_resource_update_batch(&mut self) -> ResourceUpdateBatch {
        ResourceUpdateBatch::new()
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<RhiBuffer, DeviceError>;
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<RhiTexture, DeviceError>;
    fn create_shader_resource_bindings(
        &mut self,
        bindings: &[ShaderResourceBinding],
    ) -> Result<RhiBindings, DeviceError>;
    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBytecode,
        bindings: RhiBindings,
    ) -> Result<RhiComputePipeline, DeviceError>;
    fn create_points_pipeline(
        &mut self,
        desc: &PointsPipelineDesc,
    ) -> Result<RhiGraphicsPipeline, DeviceError>;

    /// Destroys a resource. Unknown handles are ignored.
    fn release(&mut self, resource: RhiResource);

    /// `true` when the framebuffer's Y axis points up (OpenGL convention).
    fn is_y_up_in_framebuffer(&self) -> bool;

    fn command_buffer(&mut self) -> &mut dyn CommandBuffer;
}
