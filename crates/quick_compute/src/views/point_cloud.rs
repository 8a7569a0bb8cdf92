use std::any::Any;

use bytemuck::{Pod, Zeroable};
use log::warn;

use super::UnitLink;
use crate::buffer::BufferHandle;
use crate::compute_unit::ComputeUnit;
use crate::rhi::{
    BufferDesc, BufferType, BufferUsage, CommandBuffer, GraphicsDevice, PointsPipelineDesc,
    RhiBindings, RhiBuffer, RhiGraphicsPipeline, RhiResource, ShaderResourceBinding, ShaderStages,
    VertexAttribute, VertexFormat, Viewport,
};
use crate::scene::{Item, Rect, RenderNode, RenderState, RenderingFlags, SceneNode};

/// Smallest vertex: position `vec2<f32>` followed by color `vec4<f32>`.
pub const MIN_STRIDE: u32 = 24;

const COLOR_OFFSET: u32 = 8;

/// Per-frame uniform block of the point pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointCloudUniforms {
    pub mvp: [[f32; 4]; 4],
    pub width: f32,
    pub height: f32,
    pub point_size: f32,
    pub flip: i32,
}

/// Draws the first `number_of_points` vertices of a storage buffer as points.
#[derive(Debug, Default)]
pub struct PointCloudView {
    link: UnitLink,
    result_index: Option<usize>,
    number_of_points: u32,
    point_size: f32,
    stride: u32,
    rect: Rect,
}

impl PointCloudView {
    pub fn new(rect: Rect) -> Self {
        Self {
            point_size: 1.0,
            stride: MIN_STRIDE,
            rect,
            ..Self::default()
        }
    }

    pub fn compute_unit(&self) -> Option<ComputeUnit> {
        self.link.get()
    }

    pub fn set_compute_unit(&mut self, unit: &ComputeUnit) {
        if self.link.set(unit) {
            self.result_index = None;
        }
    }

    /// The result buffer, looked up by its position in the unit's list.
    pub fn result_buffer(&self) -> Option<BufferHandle> {
        let unit = self.link.get()?;
        unit.buffer_at(self.result_index?)
    }

    /// Resolves `handle` to its index in the unit's attached list. Requires a
    /// compute unit to be set first.
    pub fn set_result_buffer(&mut self, handle: BufferHandle) -> bool {
        let Some(unit) = self.link.get() else {
            warn!("PointCloudView has no compute unit to resolve the result buffer against");
            return false;
        };
        let index = unit.index_of(handle);
        if index.is_none() {
            warn!("Result buffer is not attached to compute unit {}", unit.id());
        }
        if index != self.result_index {
            self.result_index = index;
            self.link.mark_dirty();
        }
        index.is_some()
    }

    pub fn result_index(&self) -> Option<usize> {
        self.result_index
    }

    pub fn number_of_points(&self) -> u32 {
        self.number_of_points
    }

    pub fn set_number_of_points(&mut self, count: u32) {
        if count != self.number_of_points {
            self.number_of_points = count;
            self.link.mark_dirty();
        }
    }

    pub fn point_size(&self) -> f32 {
        self.point_size
    }

    pub fn set_point_size(&mut self, size: f32) -> bool {
        if !(size > 0.0) {
            warn!("Point size must be > 0, got {size}");
            return false;
        }
        if size != self.point_size {
            self.point_size = size;
            self.link.mark_dirty();
        }
        true
    }

    pub fn stride_in_byte(&self) -> u32 {
        self.stride
    }

    pub fn set_stride_in_byte(&mut self, stride: u32) -> bool {
        if stride < MIN_STRIDE {
            warn!("Cannot set stride below {MIN_STRIDE} bytes, got {stride}");
            return false;
        }
        if stride != self.stride {
            self.stride = stride;
            self.link.mark_dirty();
        }
        true
    }

    pub fn set_rect(&mut self, rect: Rect) {
        if rect != self.rect {
            self.rect = rect;
            self.link.mark_dirty();
        }
    }
}

impl Item for PointCloudView {
    fn rect(&self) -> Rect {
        self.rect
    }

    fn needs_update(&self) -> bool {
        self.link.is_dirty()
    }

    fn update_paint_node(
        &mut self,
        old: Option<SceneNode>,
        device: &mut dyn GraphicsDevice,
    ) -> Option<SceneNode> {
        self.link.take_dirty();

        let Some(unit) = self.link.get() else {
            warn!("Cannot render without compute unit");
            return old;
        };
        let Some(buffer) = self.result_index.and_then(|i| unit.rhi_buffer_at(i)) else {
            warn!("Cannot render without storage buffer");
            return old;
        };

        let mut node: Box<dyn RenderNode> = match old {
            Some(SceneNode::Custom(node)) if node.as_any().is::<PointCloudNode>() => node,
            Some(mut other) => {
                other.release_resources(device);
                Box::new(PointCloudNode::new())
            }
            None => Box::new(PointCloudNode::new()),
        };
        if let Some(points) = node.as_any_mut().downcast_mut::<PointCloudNode>() {
            points.set_point_buffer(buffer);
            points.set_number_of_points(self.number_of_points);
            points.set_point_size(self.point_size);
            points.set_stride_in_byte(self.stride);
        }
        Some(SceneNode::Custom(node))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Render node of [`PointCloudView`].
///
/// The pipeline, its bindings and the uniform buffer are created on the first
/// `prepare()` and recreated only when the stride changes. The vertex buffer
/// belongs to the compute unit and is never released here.
#[derive(Debug, Default)]
pub struct PointCloudNode {
    vertex_buffer: Option<RhiBuffer>,
    number_of_points: u32,
    point_size: f32,
    stride: u32,

    pipeline: Option<RhiGraphicsPipeline>,
    bindings: Option<RhiBindings>,
    uniform_buffer: Option<RhiBuffer>,
    pipeline_stride: u32,
}

impl PointCloudNode {
    pub fn new() -> Self {
        Self {
            point_size: 1.0,
            stride: MIN_STRIDE,
            ..Self::default()
        }
    }

    pub fn set_point_buffer(&mut self, buffer: RhiBuffer) {
        self.vertex_buffer = Some(buffer);
    }

    pub fn point_buffer(&self) -> Option<RhiBuffer> {
        self.vertex_buffer
    }

    pub fn set_number_of_points(&mut self, count: u32) {
        self.number_of_points = count;
    }

    pub fn number_of_points(&self) -> u32 {
        self.number_of_points
    }

    pub fn set_point_size(&mut self, size: f32) {
        self.point_size = size;
    }

    pub fn set_stride_in_byte(&mut self, stride: u32) {
        self.stride = stride.max(MIN_STRIDE);
    }

    pub fn stride_in_byte(&self) -> u32 {
        self.stride
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    fn uniforms(&self, device: &dyn GraphicsDevice, state: &RenderState) -> PointCloudUniforms {
        PointCloudUniforms {
            mvp: state.mvp().to_cols_array_2d(),
            width: state.item_rect.width,
            height: state.item_rect.height,
            point_size: self.point_size,
            flip: device.is_y_up_in_framebuffer() as i32,
        }
    }

    fn create_pipeline(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), crate::error::DeviceError> {
        let uniform_buffer = match self.uniform_buffer {
            Some(b) => b,
            None => {
                let b = device.create_buffer(&BufferDesc {
                    label: "point-cloud-uniforms".into(),
                    ty: BufferType::Dynamic,
                    usage: BufferUsage::UNIFORM,
                    size: std::mem::size_of::<PointCloudUniforms>() as u64,
                })?;
                self.uniform_buffer = Some(b);
                b
            }
        };
        let bindings = match self.bindings {
            Some(b) => b,
            None => {
                let b = device.create_shader_resource_bindings(&[
                    ShaderResourceBinding::uniform_buffer(
                        0,
                        ShaderStages::VERTEX | ShaderStages::FRAGMENT,
                        uniform_buffer,
                    ),
                ])?;
                self.bindings = Some(b);
                b
            }
        };
        let pipeline = device.create_points_pipeline(&PointsPipelineDesc {
            label: "point-cloud".into(),
            bindings,
            stride: self.stride,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float2,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float4,
                    offset: COLOR_OFFSET,
                },
            ],
        })?;
        self.pipeline = Some(pipeline);
        self.pipeline_stride = self.stride;
        Ok(())
    }
}

impl RenderNode for PointCloudNode {
    fn prepare(&mut self, device: &mut dyn GraphicsDevice, state: &RenderState) {
        if self.pipeline.is_some() && self.pipeline_stride != self.stride {
            if let Some(old) = self.pipeline.take() {
                device.release(old.into());
            }
        }
        if self.pipeline.is_none() {
            if let Err(e) = self.create_pipeline(device) {
                warn!("Cannot create point cloud pipeline: {e}");
                return;
            }
        }
        let Some(uniform_buffer) = self.uniform_buffer else {
            return;
        };

        let uniforms = self.uniforms(device, state);
        let mut batch = device.next_resource_update_batch();
        batch.update_dynamic_buffer(uniform_buffer, 0, bytemuck::bytes_of(&uniforms).to_vec());
        device.command_buffer().resource_update(batch);
    }

    fn render(&mut self, commands: &mut dyn CommandBuffer, state: &RenderState) {
        let Some(vertex_buffer) = self.vertex_buffer else {
            warn!("Cannot render without buffer");
            return;
        };
        let (Some(pipeline), Some(bindings)) = (self.pipeline, self.bindings) else {
            return;
        };

        let (w, h) = state.window_size;
        let dpr = state.device_pixel_ratio;
        commands.set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: w as f32 * dpr,
            height: h as f32 * dpr,
        });
        commands.set_graphics_pipeline(pipeline);
        commands.set_shader_resources(bindings);
        commands.set_vertex_input(0, vertex_buffer, 0);
        commands.draw(self.number_of_points);
    }

    fn release_resources(&mut self, device: &mut dyn GraphicsDevice) {
        let owned = [
            self.pipeline.take().map(RhiResource::from),
            self.bindings.take().map(RhiResource::from),
            self.uniform_buffer.take().map(RhiResource::from),
        ];
        for resource in owned.into_iter().flatten() {
            device.release(resource);
        }
        self.vertex_buffer = None;
    }

    fn flags(&self) -> RenderingFlags {
        RenderingFlags::NO_EXTERNAL_RENDERING | RenderingFlags::DEPTH_AWARE_RENDERING
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
