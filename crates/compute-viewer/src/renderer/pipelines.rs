//! Fixed render pipelines of the host: point sprites and textured quads.

use bytemuck::{Pod, Zeroable};
use quick_compute::rhi::{PointsPipelineDesc, VertexFormat};
use wgpu::util::DeviceExt;

/// Corners of the unit quad every sprite and image is drawn from.
const QUAD_CORNERS: [[f32; 2]; 6] = [
    [-1.0, -1.0],
    [1.0, -1.0],
    [1.0, 1.0],
    [-1.0, -1.0],
    [1.0, 1.0],
    [-1.0, 1.0],
];

/// Vertices per sprite or quad.
pub const QUAD_VERTICES: u32 = QUAD_CORNERS.len() as u32;

pub fn quad_vertex_buffer(device: &wgpu::Device) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("Quad Corners VB"),
        contents: bytemuck::cast_slice(&QUAD_CORNERS),
        usage: wgpu::BufferUsages::VERTEX,
    })
}

const CORNER_LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
    array_stride: std::mem::size_of::<[f32; 2]>() as u64,
    step_mode: wgpu::VertexStepMode::Vertex,
    attributes: &[wgpu::VertexAttribute {
        shader_location: 0,
        offset: 0,
        format: wgpu::VertexFormat::Float32x2,
    }],
};

fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float4 => wgpu::VertexFormat::Float32x4,
    }
}

fn alpha_target(format: wgpu::TextureFormat) -> [Option<wgpu::ColorTargetState>; 1] {
    [Some(wgpu::ColorTargetState {
        format,
        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
        write_mask: wgpu::ColorWrites::ALL,
    })]
}

/// Builds the instanced sprite pipeline for a point cloud. Slot 0 carries the
/// quad corners; the caller's stream is bound at slot 1 with its attribute
/// locations shifted by one.
pub fn points_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    layout: &wgpu::BindGroupLayout,
    color_fmt: wgpu::TextureFormat,
    desc: &PointsPipelineDesc,
) -> wgpu::RenderPipeline {
    let attributes: Vec<wgpu::VertexAttribute> = desc
        .attributes
        .iter()
        .map(|a| wgpu::VertexAttribute {
            shader_location: a.location + 1,
            offset: a.offset as u64,
            format: vertex_format(a.format),
        })
        .collect();

    let buffers = [
        CORNER_LAYOUT,
        wgpu::VertexBufferLayout {
            array_stride: desc.stride as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &attributes,
        },
    ];

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Points PipelineLayout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&desc.label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            buffers: &buffers,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: "fs_main",
            targets: &alpha_target(color_fmt),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
    })
}

/// Uniform block of `quad.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QuadUniform {
    /// Left, top, right, bottom in NDC.
    pub rect: [f32; 4],
}

/// One textured-quad pipeline and the layout its bind groups follow.
pub struct QuadPipeline {
    pub layout: wgpu::BindGroupLayout,
    pub pipeline: wgpu::RenderPipeline,
}

/// Textured-quad pipelines for filterable and unfilterable (32-bit float)
/// textures, plus their samplers.
pub struct QuadPipelines {
    pub filtering: QuadPipeline,
    pub non_filtering: QuadPipeline,
    pub linear: wgpu::Sampler,
    pub nearest: wgpu::Sampler,
}

impl QuadPipelines {
    pub fn new(device: &wgpu::Device, color_fmt: wgpu::TextureFormat) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shaders/quad.wgsl"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/quad.wgsl").into()),
        });

        let linear = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Quad Linear Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let nearest = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Quad Nearest Sampler"),
            ..Default::default()
        });

        Self {
            filtering: Self::pipeline(device, &module, color_fmt, true),
            non_filtering: Self::pipeline(device, &module, color_fmt, false),
            linear,
            nearest,
        }
    }

    fn pipeline(
        device: &wgpu::Device,
        module: &wgpu::ShaderModule,
        color_fmt: wgpu::TextureFormat,
        filterable: bool,
    ) -> QuadPipeline {
        let sampler_type = if filterable {
            wgpu::SamplerBindingType::Filtering
        } else {
            wgpu::SamplerBindingType::NonFiltering
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Quad Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<QuadUniform>() as u64,
                        ),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(sampler_type),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Quad PipelineLayout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Quad Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: "vs_main",
                buffers: &[CORNER_LAYOUT],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: "fs_main",
                targets: &alpha_target(color_fmt),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        QuadPipeline { layout, pipeline }
    }
}
