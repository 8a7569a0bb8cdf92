use std::collections::HashMap;

use super::{
    BindingResource, BufferDesc, CommandBuffer, Filter, GraphicsDevice, PointsPipelineDesc,
    ResourceUpdate, ResourceUpdateBatch, RhiBindings, RhiBuffer, RhiComputePipeline,
    RhiGraphicsPipeline, RhiResource, RhiTexture, ShaderResourceBinding, TextureDesc, Viewport,
};
use crate::error::DeviceError;
use crate::scene::Rect;
use crate::shader::ShaderBytecode;

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ResourceUpdate(ResourceUpdateBatch),
    BeginComputePass(ResourceUpdateBatch),
    SetComputePipeline(RhiComputePipeline),
    SetShaderResources(RhiBindings),
    Dispatch(u32, u32, u32),
    EndComputePass,
    BeginRenderPass,
    EndRenderPass,
    SetViewport(Viewport),
    SetGraphicsPipeline(RhiGraphicsPipeline),
    SetVertexInput { slot: u32, buffer: RhiBuffer, offset: u64 },
    Draw(u32),
    DrawTexture { texture: RhiTexture, filter: Filter, rect: Rect },
}

#[derive(Debug, Clone)]
struct BufferState {
    size: u64,
    contents: Vec<u8>,
}

/// Headless [`GraphicsDevice`] that records instead of executing.
///
/// Handles are allocated from one counter, live resources are tracked so
/// leaks and double releases are observable, and buffer uploads are applied
/// to CPU-side copies so tests can read back what the GPU would have seen.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    next_id: u64,
    live: HashMap<u64, RhiResource>,
    buffers: HashMap<RhiBuffer, BufferState>,
    released: Vec<RhiResource>,
    commands: Vec<Command>,
    y_up: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose framebuffer convention is Y-up.
    pub fn y_up() -> Self {
        Self {
            y_up: true,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch(..)))
            .count()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, resource: impl Into<RhiResource>) -> bool {
        self.live.contains_key(&resource.into().raw())
    }

    pub fn released(&self) -> &[RhiResource] {
        &self.released
    }

    /// CPU copy of a buffer's contents after every applied upload.
    pub fn buffer_contents(&self, buffer: RhiBuffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.contents.as_slice())
    }

    fn alloc<H: Copy + Into<RhiResource>>(&mut self, make: impl FnOnce(u64) -> H) -> H {
        self.next_id += 1;
        let handle = make(self.next_id);
        self.live.insert(self.next_id, handle.into());
        handle
    }

    fn check_live(&self, resource: RhiResource) -> Result<(), DeviceError> {
        if self.live.contains_key(&resource.raw()) {
            Ok(())
        } else {
            Err(DeviceError::UnknownResource(format!("{resource:?}")))
        }
    }

    fn apply(&mut self, batch: &ResourceUpdateBatch) {
        for update in batch.updates() {
            match update {
                ResourceUpdate::StaticBuffer { buffer, data } => {
                    self.write_buffer(*buffer, 0, data)
                }
                ResourceUpdate::DynamicBuffer {
                    buffer,
                    offset,
                    data,
                } => self.write_buffer(*buffer, *offset, data),
                ResourceUpdate::Texture { .. } => {}
            }
        }
    }

    fn write_buffer(&mut self, buffer: RhiBuffer, offset: u64, data: &[u8]) {
        let Some(state) = self.buffers.get_mut(&buffer) else {
            log::warn!("upload to unknown buffer {buffer:?}");
            return;
        };
        let start = offset as usize;
        let end = (start + data.len()).min(state.size as usize);
        if start >= end {
            return;
        }
        state.contents[start..end].copy_from_slice(&data[..end - start]);
    }
}

impl GraphicsDevice for RecordingDevice {
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<RhiBuffer, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::ZeroSized { what: "buffer" });
        }
        let buffer = self.alloc(RhiBuffer::from_raw);
        self.buffers.insert(
            buffer,
            BufferState {
                size: desc.size,
                contents: vec![0; desc.size as usize],
            },
        );
        Ok(buffer)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<RhiTexture, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::ZeroSized { what: "texture" });
        }
        Ok(self.alloc(RhiTexture::from_raw))
    }

    fn create_shader_resource_bindings(
        &mut self,
        bindings: &[ShaderResourceBinding],
    ) -> Result<RhiBindings, DeviceError> {
        for b in bindings {
            let resource: RhiResource = match b.resource {
                BindingResource::UniformBuffer(h) | BindingResource::StorageBuffer(h) => h.into(),
                BindingResource::StorageImage(h) => h.into(),
            };
            self.check_live(resource)?;
        }
        Ok(self.alloc(RhiBindings::from_raw))
    }

    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBytecode,
        bindings: RhiBindings,
    ) -> Result<RhiComputePipeline, DeviceError> {
        if !shader.is_valid() {
            return Err(DeviceError::InvalidShader);
        }
        self.check_live(bindings.into())?;
        Ok(self.alloc(RhiComputePipeline::from_raw))
    }

    fn create_points_pipeline(
        &mut self,
        desc: &PointsPipelineDesc,
    ) -> Result<RhiGraphicsPipeline, DeviceError> {
        self.check_live(desc.bindings.into())?;
        Ok(self.alloc(RhiGraphicsPipeline::from_raw))
    }

    fn release(&mut self, resource: RhiResource) {
        if self.live.remove(&resource.raw()).is_some() {
            if let RhiResource::Buffer(b) = resource {
                self.buffers.remove(&b);
            }
            self.released.push(resource);
        } else {
            log::debug!("release of unknown resource {resource:?}");
        }
    }

    fn is_y_up_in_framebuffer(&self) -> bool {
        self.y_up
    }

    fn command_buffer(&mut self) -> &mut dyn CommandBuffer {
        self
    }
}

impl CommandBuffer for RecordingDevice {
    fn resource_update(&mut self, batch: ResourceUpdateBatch) {
        self.apply(&batch);
        self.commands.push(Command::ResourceUpdate(batch));
    }

    fn begin_compute_pass(&mut self, batch: ResourceUpdateBatch) {
        self.apply(&batch);
        self.commands.push(Command::BeginComputePass(batch));
    }

    fn set_compute_pipeline(&mut self, pipeline: RhiComputePipeline) {
        self.commands.push(Command::SetComputePipeline(pipeline));
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch(x, y, z));
    }

    fn end_compute_pass(&mut self) {
        self.commands.push(Command::EndComputePass);
    }

    fn begin_render_pass(&mut self) {
        self.commands.push(Command::BeginRenderPass);
    }

    fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    fn set_graphics_pipeline(&mut self, pipeline: RhiGraphicsPipeline) {
        self.commands.push(Command::SetGraphicsPipeline(pipeline));
    }

    fn set_vertex_input(&mut self, slot: u32, buffer: RhiBuffer, offset: u64) {
        self.commands.push(Command::SetVertexInput {
            slot,
            buffer,
            offset,
        });
    }

    fn draw(&mut self, vertex_count: u32) {
        self.commands.push(Command::Draw(vertex_count));
    }

    fn draw_texture(&mut self, texture: RhiTexture, filter: Filter, rect: Rect) {
        self.commands.push(Command::DrawTexture {
            texture,
            filter,
            rect,
        });
    }

    fn set_shader_resources(&mut self, bindings: RhiBindings) {
        self.commands.push(Command::SetShaderResources(bindings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::{BufferType, BufferUsage, ShaderStages};

    fn uniform(device: &mut RecordingDevice, size: u64) -> RhiBuffer {
        device
            .create_buffer(&BufferDesc {
                label: "ubo".into(),
                ty: BufferType::Dynamic,
                usage: BufferUsage::UNIFORM,
                size,
            })
            .unwrap()
    }

    #[test]
    fn tracks_live_resources() {
        let mut device = RecordingDevice::new();
        let buf = uniform(&mut device, 16);
        assert!(device.is_live(buf));
        device.release(buf.into());
        assert!(!device.is_live(buf));
        assert_eq!(device.live_count(), 0);
        assert_eq!(device.released(), &[RhiResource::Buffer(buf)]);
    }

    #[test]
    fn rejects_invalid_shader_and_zero_sizes() {
        let mut device = RecordingDevice::new();
        let err = device
            .create_buffer(&BufferDesc {
                label: "empty".into(),
                ty: BufferType::Immutable,
                usage: BufferUsage::STORAGE,
                size: 0,
            })
            .unwrap_err();
        assert_eq!(err, DeviceError::ZeroSized { what: "buffer" });

        let buf = uniform(&mut device, 4);
        let bindings = device
            .create_shader_resource_bindings(&[ShaderResourceBinding::uniform_buffer(
                0,
                ShaderStages::COMPUTE,
                buf,
            )])
            .unwrap();
        let err = device
            .create_compute_pipeline(&ShaderBytecode::default(), bindings)
            .unwrap_err();
        assert_eq!(err, DeviceError::InvalidShader);
    }

    #[test]
    fn dynamic_updates_land_at_their_offsets() {
        let mut device = RecordingDevice::new();
        let buf = uniform(&mut device, 8);
        let mut batch = device.next_resource_update_batch();
        batch.update_dynamic_buffer(buf, 4, 7i32.to_ne_bytes().to_vec());
        device.command_buffer().resource_update(batch);

        let contents = device.buffer_contents(buf).unwrap();
        assert_eq!(&contents[0..4], &[0; 4]);
        assert_eq!(&contents[4..8], &7i32.to_ne_bytes());
    }
}
