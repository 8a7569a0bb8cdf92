//! [`GraphicsDevice`] backed by wgpu.
//!
//! Resource creation happens immediately. Commands are recorded into a list
//! and replayed into one encoder by [`WgpuDevice::submit`], because wgpu
//! passes borrow their resources for the whole pass.

use std::collections::HashMap;
use std::sync::Arc;

use quick_compute::rhi::{
    BindingResource, BufferDesc, BufferUsage, CommandBuffer, Filter, GraphicsDevice,
    PointsPipelineDesc, ResourceUpdate, ResourceUpdateBatch, RhiBindings, RhiBuffer,
    RhiComputePipeline, RhiGraphicsPipeline, RhiResource, RhiTexture, ShaderResourceBinding,
    ShaderStages, TextureDesc, TextureUsage, Viewport,
};
use quick_compute::scene::Rect;
use quick_compute::shader::ShaderBytecode;
use quick_compute::{DeviceError, TextureFormat};
use wgpu::util::DeviceExt;

use super::pipelines::{self, QuadPipelines, QuadUniform, QUAD_VERTICES};

const SPIRV_MAGIC: u32 = 0x0723_0203;

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32F => wgpu::TextureFormat::Rgba32Float,
    }
}

fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= wgpu::ShaderStages::COMPUTE;
    }
    out
}

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    size: (u32, u32),
}

struct BindingsEntry {
    layout: wgpu::BindGroupLayout,
    group: wgpu::BindGroup,
}

struct GraphicsEntry {
    pipeline: wgpu::RenderPipeline,
    stride: u64,
}

enum Op {
    Copy {
        staging: wgpu::Buffer,
        dst: RhiBuffer,
        offset: u64,
        size: u64,
    },
    BeginCompute,
    EndCompute,
    BeginRender,
    EndRender,
    ComputePipeline(RhiComputePipeline),
    GraphicsPipeline(RhiGraphicsPipeline),
    Bindings(RhiBindings),
    Dispatch(u32, u32, u32),
    Viewport(Viewport),
    VertexInput {
        slot: u32,
        buffer: RhiBuffer,
        offset: u64,
    },
    Draw(u32),
    DrawTexture {
        texture: RhiTexture,
        filter: Filter,
        rect: Rect,
    },
}

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    color_fmt: wgpu::TextureFormat,
    clear_color: wgpu::Color,

    next_id: u64,
    buffers: HashMap<RhiBuffer, wgpu::Buffer>,
    textures: HashMap<RhiTexture, TextureEntry>,
    bindings: HashMap<RhiBindings, BindingsEntry>,
    compute_pipelines: HashMap<RhiComputePipeline, wgpu::ComputePipeline>,
    graphics_pipelines: HashMap<RhiGraphicsPipeline, GraphicsEntry>,

    points_module: wgpu::ShaderModule,
    quads: QuadPipelines,
    corners: wgpu::Buffer,

    ops: Vec<Op>,
    /// Released handles stay resolvable until the frame that may still
    /// reference them has been submitted.
    released: Vec<RhiResource>,
}

impl WgpuDevice {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        color_fmt: wgpu::TextureFormat,
    ) -> Self {
        let points_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shaders/points.wgsl"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/points.wgsl").into()),
        });
        let quads = QuadPipelines::new(&device, color_fmt);
        let corners = pipelines::quad_vertex_buffer(&device);

        Self {
            device,
            queue,
            color_fmt,
            clear_color: wgpu::Color::BLACK,
            next_id: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            bindings: HashMap::new(),
            compute_pipelines: HashMap::new(),
            graphics_pipelines: HashMap::new(),
            points_module,
            quads,
            corners,
            ops: Vec::new(),
            released: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Number of live device resources.
    pub fn live_count(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.bindings.len()
            + self.compute_pipelines.len()
            + self.graphics_pipelines.len()
    }

    /// Runs `create` inside a validation error scope.
    fn validated<T>(
        &self,
        what: &str,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(DeviceError::Rejected(format!("{what}: {err}"))),
            None => Ok(value),
        }
    }

    fn shader_module(&self, shader: &ShaderBytecode) -> Result<wgpu::ShaderModule, DeviceError> {
        if !shader.is_valid() {
            return Err(DeviceError::InvalidShader);
        }
        let bytes = shader.bytes();
        let is_spirv = bytes.len() % 4 == 0
            && bytes.len() >= 4
            && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC;
        let source = if is_spirv {
            wgpu::util::make_spirv(bytes)
        } else {
            let text = std::str::from_utf8(bytes).map_err(|_| DeviceError::InvalidShader)?;
            wgpu::ShaderSource::Wgsl(text.into())
        };
        let label = shader.path().map(|p| p.display().to_string());
        self.validated("shader module", |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: label.as_deref(),
                source,
            })
        })
    }

    fn apply_updates(&mut self, batch: ResourceUpdateBatch) {
        for update in batch.into_updates() {
            match update {
                ResourceUpdate::StaticBuffer { buffer, data } => match self.buffers.get(&buffer) {
                    Some(b) => self.queue.write_buffer(b, 0, &aligned(data)),
                    None => log::warn!("upload to unknown buffer {}", buffer.raw()),
                },
                ResourceUpdate::DynamicBuffer { buffer, offset, data } => {
                    if !self.buffers.contains_key(&buffer) {
                        log::warn!("update of unknown buffer {}", buffer.raw());
                        continue;
                    }
                    // staged so that each pass sees the value recorded for it
                    let data = aligned(data);
                    let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("Dynamic Update Staging"),
                        contents: &data,
                        usage: wgpu::BufferUsages::COPY_SRC,
                    });
                    self.ops.push(Op::Copy {
                        staging,
                        dst: buffer,
                        offset,
                        size: data.len() as u64,
                    });
                }
                ResourceUpdate::Texture {
                    texture,
                    width,
                    height,
                    data,
                } => match self.textures.get(&texture) {
                    Some(entry) => self.queue.write_texture(
                        wgpu::ImageCopyTexture {
                            texture: &entry.texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: wgpu::TextureAspect::All,
                        },
                        &data,
                        wgpu::ImageDataLayout {
                            offset: 0,
                            bytes_per_row: Some(width * entry.format.bytes_per_pixel() as u32),
                            rows_per_image: Some(height),
                        },
                        wgpu::Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                    ),
                    None => log::warn!("upload to unknown texture {}", texture.raw()),
                },
            }
        }
    }

    /// Replays the recorded frame into `target` and submits it.
    pub fn submit(&mut self, target: &wgpu::TextureView, target_size: (u32, u32), window: (f32, f32)) {
        let ops = std::mem::take(&mut self.ops);
        let quad_groups = self.quad_bind_groups(&ops, window);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        let mut i = 0;
        while i < ops.len() {
            match &ops[i] {
                Op::Copy {
                    staging,
                    dst,
                    offset,
                    size,
                } => {
                    if let Some(dst) = self.buffers.get(dst) {
                        encoder.copy_buffer_to_buffer(staging, 0, dst, *offset, *size);
                    }
                }
                Op::BeginCompute => {
                    let end = pass_end(&ops, i, |op| matches!(op, Op::EndCompute));
                    self.replay_compute(&mut encoder, &ops[i + 1..end]);
                    i = end;
                }
                Op::BeginRender => {
                    let end = pass_end(&ops, i, |op| matches!(op, Op::EndRender));
                    self.replay_render(
                        &mut encoder,
                        target,
                        target_size,
                        &ops[i + 1..end],
                        &quad_groups[i + 1..end],
                    );
                    i = end;
                }
                _ => log::warn!("command outside of a pass ignored"),
            }
            i += 1;
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        for resource in std::mem::take(&mut self.released) {
            self.destroy(resource);
        }
    }

    fn destroy(&mut self, resource: RhiResource) {
        let known = match resource {
            RhiResource::Buffer(h) => self.buffers.remove(&h).is_some(),
            RhiResource::Texture(h) => self.textures.remove(&h).is_some(),
            RhiResource::Bindings(h) => self.bindings.remove(&h).is_some(),
            RhiResource::ComputePipeline(h) => self.compute_pipelines.remove(&h).is_some(),
            RhiResource::GraphicsPipeline(h) => self.graphics_pipelines.remove(&h).is_some(),
        };
        if !known {
            log::debug!("release of unknown resource {}", resource.raw());
        }
    }

    fn quad_bind_groups(&self, ops: &[Op], window: (f32, f32)) -> Vec<Option<(bool, wgpu::BindGroup)>> {
        let (w, h) = (window.0.max(1.0), window.1.max(1.0));
        ops.iter()
            .map(|op| {
                let Op::DrawTexture { texture, filter, rect } = op else {
                    return None;
                };
                let entry = self.textures.get(texture)?;
                let filterable = entry.format != TextureFormat::Rgba32F;
                let (quad, sampler) = match (filterable, filter) {
                    (true, Filter::Linear) => (&self.quads.filtering, &self.quads.linear),
                    (true, Filter::Nearest) => (&self.quads.filtering, &self.quads.nearest),
                    (false, _) => (&self.quads.non_filtering, &self.quads.nearest),
                };
                let uniform = QuadUniform {
                    rect: [
                        rect.x / w * 2.0 - 1.0,
                        1.0 - rect.y / h * 2.0,
                        (rect.x + rect.width) / w * 2.0 - 1.0,
                        1.0 - (rect.y + rect.height) / h * 2.0,
                    ],
                };
                let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Quad Uniform"),
                    contents: bytemuck::bytes_of(&uniform),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Quad Bind Group"),
                    layout: &quad.layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&entry.view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        },
                    ],
                });
                Some((filterable, group))
            })
            .collect()
    }

    fn replay_compute(&self, encoder: &mut wgpu::CommandEncoder, ops: &[Op]) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Compute Pass"),
            timestamp_writes: None,
        });
        let mut ready = false;
        for op in ops {
            match op {
                Op::ComputePipeline(h) => match self.compute_pipelines.get(h) {
                    Some(pipeline) => {
                        pass.set_pipeline(pipeline);
                        ready = true;
                    }
                    None => ready = false,
                },
                Op::Bindings(h) => {
                    if let Some(entry) = self.bindings.get(h) {
                        pass.set_bind_group(0, &entry.group, &[]);
                    }
                }
                Op::Dispatch(x, y, z) if ready => pass.dispatch_workgroups(*x, *y, *z),
                _ => {}
            }
        }
    }

    fn replay_render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        target_size: (u32, u32),
        ops: &[Op],
        quad_groups: &[Option<(bool, wgpu::BindGroup)>],
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Scene Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(self.clear_color),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let (tw, th) = (target_size.0 as f32, target_size.1 as f32);
        let mut stride = None;
        let mut instances = None;
        for (op, quad) in ops.iter().zip(quad_groups) {
            match op {
                Op::Viewport(v) => {
                    let x = v.x.clamp(0.0, tw);
                    let y = v.y.clamp(0.0, th);
                    pass.set_viewport(x, y, v.width.min(tw - x), v.height.min(th - y), 0.0, 1.0);
                }
                Op::GraphicsPipeline(h) => match self.graphics_pipelines.get(h) {
                    Some(entry) => {
                        pass.set_pipeline(&entry.pipeline);
                        pass.set_vertex_buffer(0, self.corners.slice(..));
                        stride = Some(entry.stride);
                        instances = None;
                    }
                    None => stride = None,
                },
                Op::Bindings(h) => {
                    if let Some(entry) = self.bindings.get(h) {
                        pass.set_bind_group(0, &entry.group, &[]);
                    }
                }
                Op::VertexInput { slot, buffer, offset } => {
                    if let (Some(b), Some(stride)) = (self.buffers.get(buffer), stride) {
                        pass.set_vertex_buffer(slot + 1, b.slice(*offset..));
                        instances = Some((b.size().saturating_sub(*offset) / stride) as u32);
                    }
                }
                Op::Draw(count) => {
                    if let Some(available) = instances {
                        if *count > available {
                            log::warn!("Drawing {available} of {count} points; buffer is too small");
                        }
                        pass.draw(0..QUAD_VERTICES, 0..(*count).min(available));
                    }
                }
                Op::DrawTexture { .. } => {
                    if let Some((filterable, group)) = quad {
                        let quad = if *filterable {
                            &self.quads.filtering
                        } else {
                            &self.quads.non_filtering
                        };
                        pass.set_viewport(0.0, 0.0, tw, th, 0.0, 1.0);
                        pass.set_pipeline(&quad.pipeline);
                        pass.set_bind_group(0, group, &[]);
                        pass.set_vertex_buffer(0, self.corners.slice(..));
                        pass.draw(0..QUAD_VERTICES, 0..1);
                        stride = None;
                        instances = None;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Pads `data` with zeros to the copy alignment.
fn aligned(mut data: Vec<u8>) -> Vec<u8> {
    let len = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
    data.resize(len as usize, 0);
    data
}

/// Index of the op closing the pass opened at `start`, or the end of `ops`.
fn pass_end(ops: &[Op], start: usize, is_end: impl Fn(&Op) -> bool) -> usize {
    ops[start + 1..]
        .iter()
        .position(is_end)
        .map_or(ops.len(), |p| start + 1 + p)
}

impl CommandBuffer for WgpuDevice {
    fn resource_update(&mut self, batch: ResourceUpdateBatch) {
        self.apply_updates(batch);
    }

    fn begin_compute_pass(&mut self, batch: ResourceUpdateBatch) {
        self.apply_updates(batch);
        self.ops.push(Op::BeginCompute);
    }

    fn set_compute_pipeline(&mut self, pipeline: RhiComputePipeline) {
        self.ops.push(Op::ComputePipeline(pipeline));
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.ops.push(Op::Dispatch(x, y, z));
    }

    fn end_compute_pass(&mut self) {
        self.ops.push(Op::EndCompute);
    }

    fn begin_render_pass(&mut self) {
        self.ops.push(Op::BeginRender);
    }

    fn end_render_pass(&mut self) {
        self.ops.push(Op::EndRender);
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.ops.push(Op::Viewport(viewport));
    }

    fn set_graphics_pipeline(&mut self, pipeline: RhiGraphicsPipeline) {
        self.ops.push(Op::GraphicsPipeline(pipeline));
    }

    fn set_vertex_input(&mut self, slot: u32, buffer: RhiBuffer, offset: u64) {
        self.ops.push(Op::VertexInput { slot, buffer, offset });
    }

    fn draw(&mut self, vertex_count: u32) {
        self.ops.push(Op::Draw(vertex_count));
    }

    fn draw_texture(&mut self, texture: RhiTexture, filter: Filter, rect: Rect) {
        self.ops.push(Op::DrawTexture { texture, filter, rect });
    }

    fn set_shader_resources(&mut self, bindings: RhiBindings) {
        self.ops.push(Op::Bindings(bindings));
    }
}

impl GraphicsDevice for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<RhiBuffer, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::ZeroSized { what: "buffer" });
        }
        let mut usage = wgpu::BufferUsages::COPY_DST;
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= wgpu::BufferUsages::VERTEX;
        }
        if desc.usage.contains(BufferUsage::UNIFORM) {
            usage |= wgpu::BufferUsages::UNIFORM;
        }
        if desc.usage.contains(BufferUsage::STORAGE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        // copies and queue writes need 4-byte multiples
        let size = desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.validated("buffer", |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })?;
        let handle = RhiBuffer::from_raw(self.next_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<RhiTexture, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::ZeroSized { what: "texture" });
        }
        let mut usage = wgpu::TextureUsages::COPY_DST;
        if desc.usage.contains(TextureUsage::SAMPLED) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.contains(TextureUsage::LOAD_STORE) {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        let texture = self.validated("texture", |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(desc.format),
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = RhiTexture::from_raw(self.next_id());
        self.textures.insert(
            handle,
            TextureEntry {
                texture,
                view,
                format: desc.format,
                size: (desc.width, desc.height),
            },
        );
        Ok(handle)
    }

    fn create_shader_resource_bindings(
        &mut self,
        bindings: &[ShaderResourceBinding],
    ) -> Result<RhiBindings, DeviceError> {
        let mut layout_entries = Vec::with_capacity(bindings.len());
        for b in bindings {
            let ty = match b.resource {
                BindingResource::UniformBuffer(_) => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingResource::StorageBuffer(_) => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingResource::StorageImage(t) => {
                    let entry = self
                        .textures
                        .get(&t)
                        .ok_or_else(|| DeviceError::UnknownResource(format!("texture {}", t.raw())))?;
                    wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: texture_format(entry.format),
                        view_dimension: wgpu::TextureViewDimension::D2,
                    }
                }
            };
            layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding: b.binding,
                visibility: shader_stages(b.stages),
                ty,
                count: None,
            });
        }

        let mut group_entries = Vec::with_capacity(bindings.len());
        for b in bindings {
            let resource = match b.resource {
                BindingResource::UniformBuffer(h) | BindingResource::StorageBuffer(h) => self
                    .buffers
                    .get(&h)
                    .map(wgpu::Buffer::as_entire_binding)
                    .ok_or_else(|| DeviceError::UnknownResource(format!("buffer {}", h.raw())))?,
                BindingResource::StorageImage(h) => self
                    .textures
                    .get(&h)
                    .map(|t| wgpu::BindingResource::TextureView(&t.view))
                    .ok_or_else(|| DeviceError::UnknownResource(format!("texture {}", h.raw())))?,
            };
            group_entries.push(wgpu::BindGroupEntry {
                binding: b.binding,
                resource,
            });
        }

        let entry = self.validated("resource bindings", |device| {
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shader Resource Layout"),
                entries: &layout_entries,
            });
            let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Shader Resource Bindings"),
                layout: &layout,
                entries: &group_entries,
            });
            BindingsEntry { layout, group }
        })?;
        drop(group_entries);

        let handle = RhiBindings::from_raw(self.next_id());
        self.bindings.insert(handle, entry);
        Ok(handle)
    }

    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBytecode,
        bindings: RhiBindings,
    ) -> Result<RhiComputePipeline, DeviceError> {
        let module = self.shader_module(shader)?;
        let entry = self
            .bindings
            .get(&bindings)
            .ok_or_else(|| DeviceError::UnknownResource(format!("bindings {}", bindings.raw())))?;
        let pipeline = self.validated("compute pipeline", |device| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Compute PipelineLayout"),
                bind_group_layouts: &[&entry.layout],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Compute Pipeline"),
                layout: Some(&layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            })
        })?;
        let handle = RhiComputePipeline::from_raw(self.next_id());
        self.compute_pipelines.insert(handle, pipeline);
        Ok(handle)
    }

    fn create_points_pipeline(
        &mut self,
        desc: &PointsPipelineDesc,
    ) -> Result<RhiGraphicsPipeline, DeviceError> {
        let entry = self
            .bindings
            .get(&desc.bindings)
            .ok_or_else(|| DeviceError::UnknownResource(format!("bindings {}", desc.bindings.raw())))?;
        let pipeline = self.validated("points pipeline", |device| {
            pipelines::points_pipeline(device, &self.points_module, &entry.layout, self.color_fmt, desc)
        })?;
        let handle = RhiGraphicsPipeline::from_raw(self.next_id());
        self.graphics_pipelines.insert(
            handle,
            GraphicsEntry {
                pipeline,
                stride: desc.stride.max(1) as u64,
            },
        );
        Ok(handle)
    }

    fn release(&mut self, resource: RhiResource) {
        if !self.released.contains(&resource) {
            self.released.push(resource);
        }
    }

    fn is_y_up_in_framebuffer(&self) -> bool {
        false
    }

    fn command_buffer(&mut self) -> &mut dyn CommandBuffer {
        self
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("live", &self.live_count())
            .field("pending_ops", &self.ops.len())
            .field("textures", &self.textures.values().map(|t| t.size).collect::<Vec<_>>())
            .finish()
    }
}
