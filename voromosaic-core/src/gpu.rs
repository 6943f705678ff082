//! GPU Voronoi backend using wgpu.
//!
//! Cone-rendering technique: every site is drawn as an instanced inverted
//! cone (apex at the site at depth 0, rim at the image diagonal at depth 1).
//! The depth test keeps the nearest site per pixel, and the fragment shader
//! writes the site index into the color attachment as base-256 digits.
//! Readback is synchronous; per-cell statistics run CPU-side through the
//! shared accumulation pass.

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use tracing::debug;
use wgpu::util::DeviceExt;

use crate::voronoi::{accumulate_cells, ComputeBackend};
use crate::{Position, Result, VoronoiError, VoronoiResult};

/// Fan segments approximating each cone. The rim is circumscribed so the
/// polygonal base always covers the true circle.
const CONE_SEGMENTS: u32 = 64;

const CONE_SHADER: &str = r#"
struct Uniforms {
    size: vec2<f32>,
    radius: f32,
    _pad: f32,
};
@group(0) @binding(0) var<uniform> u: Uniforms;

struct VsIn {
    @location(0) cone: vec3<f32>,
    @location(1) site: vec2<f32>,
    @location(2) index: u32,
};

struct VsOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) @interpolate(flat) index: u32,
};

@vertex
fn vs_main(in: VsIn) -> VsOut {
    let px = in.site.x + in.cone.x * u.radius;
    let py = in.site.y + in.cone.y * u.radius;
    var out: VsOut;
    out.clip = vec4<f32>(
        px / u.size.x * 2.0 - 1.0,
        1.0 - py / u.size.y * 2.0,
        in.cone.z,
        1.0,
    );
    out.index = in.index;
    return out;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let idx = in.index;
    return vec4<f32>(
        f32(idx & 255u) / 255.0,
        f32((idx >> 8u) & 255u) / 255.0,
        f32((idx >> 16u) & 255u) / 255.0,
        1.0,
    );
}
"#;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConeVertex {
    pos: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SiteInstance {
    pos: [f32; 2],
    index: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Uniforms {
    size: [f32; 2],
    radius: f32,
    _pad: f32,
}

/// Render target, depth buffer, and readback staging sized to one image.
struct FrameTarget {
    width: u32,
    height: u32,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    color: wgpu::Texture,
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// GPU backend; device resources are created once and reused until the
/// image size or site count grows.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    cone_vertices: wgpu::Buffer,
    cone_vertex_count: u32,
    target: Option<FrameTarget>,
    instances: Option<wgpu::Buffer>,
    instance_capacity: usize,
}

impl GpuBackend {
    /// Create a new GPU backend, requesting a high-performance adapter.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = pollster::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))
        .ok_or_else(|| {
            VoronoiError::BackendUnavailable("no suitable GPU adapter found".into())
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Voronoi GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| VoronoiError::Gpu(format!("Failed to create device: {}", e)))?;

        debug!(adapter = %adapter.get_info().name, "GPU backend initialized");

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Cone Shader"),
            source: wgpu::ShaderSource::Wgsl(CONE_SHADER.into()),
        });

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Cone Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Cone Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let cone_attrs = wgpu::vertex_attr_array![0 => Float32x3];
        let instance_attrs = wgpu::vertex_attr_array![1 => Float32x2, 2 => Uint32];

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Cone Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<ConeVertex>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &cone_attrs,
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<SiteInstance>() as u64,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &instance_attrs,
                    },
                ],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: true,
                // Strictly-less keeps the first-drawn (lowest) site index
                // on depth ties.
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        let (cone_vertices, cone_vertex_count) = build_cone(&device);

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            cone_vertices,
            cone_vertex_count,
            target: None,
            instances: None,
            instance_capacity: 0,
        })
    }

    fn ensure_target(&mut self, width: u32, height: u32) {
        if self
            .target
            .as_ref()
            .is_some_and(|t| t.width == width && t.height == height)
        {
            return;
        }

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let color = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Cell Index Attachment"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Cone Depth"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = (width * 4).div_ceil(align) * align;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cell Index Readback"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let radius = ((width * width + height * height) as f32).sqrt();
        let uniforms = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Cone Uniforms"),
                contents: bytemuck::bytes_of(&Uniforms {
                    size: [width as f32, height as f32],
                    radius,
                    _pad: 0.0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cone Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }],
        });

        self.target = Some(FrameTarget {
            width,
            height,
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
            color,
            readback,
            padded_bytes_per_row,
            uniforms,
            bind_group,
        });
    }

    fn ensure_instances(&mut self, sites: &[Position]) {
        let data: Vec<SiteInstance> = sites
            .iter()
            .enumerate()
            .map(|(i, s)| SiteInstance {
                pos: [s.x as f32, s.y as f32],
                index: i as u32,
                _pad: 0,
            })
            .collect();

        if sites.len() > self.instance_capacity {
            self.instances = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Site Instances"),
                size: (sites.len() * std::mem::size_of::<SiteInstance>()) as u64,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            self.instance_capacity = sites.len();
        }
        let buffer = self.instances.as_ref().expect("instance buffer exists");
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&data));
    }

    fn render_and_read(&mut self, num_sites: usize) -> Result<Vec<i32>> {
        let target = self.target.as_ref().expect("target exists");
        let instances = self.instances.as_ref().expect("instance buffer exists");

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Cone Render"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Cone Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &target.bind_group, &[]);
            pass.set_vertex_buffer(0, self.cone_vertices.slice(..));
            pass.set_vertex_buffer(1, instances.slice(..));
            pass.draw(0..self.cone_vertex_count, 0..num_sites as u32);
        }
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.color,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &target.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(target.padded_bytes_per_row),
                    rows_per_image: Some(target.height),
                },
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        // Synchronous readback: block until the copy lands, then decode.
        let slice = target.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| VoronoiError::Gpu("readback callback dropped".into()))?
            .map_err(|e| VoronoiError::Gpu(format!("readback map failed: {e:?}")))?;

        let cell_of = {
            let data = slice.get_mapped_range();
            let mut cells =
                Vec::with_capacity((target.width * target.height) as usize);
            for y in 0..target.height {
                let row = (y * target.padded_bytes_per_row) as usize;
                for x in 0..target.width as usize {
                    let p = row + x * 4;
                    let idx = data[p] as u32
                        | (data[p + 1] as u32) << 8
                        | (data[p + 2] as u32) << 16;
                    if idx as usize >= num_sites {
                        return Err(VoronoiError::Gpu(format!(
                            "decoded site index {idx} out of range"
                        )));
                    }
                    cells.push(idx as i32);
                }
            }
            cells
        };
        target.readback.unmap();
        Ok(cell_of)
    }
}

impl ComputeBackend for GpuBackend {
    fn compute(
        &mut self,
        image: &RgbaImage,
        sites: &[Position],
    ) -> Result<VoronoiResult> {
        if sites.is_empty() {
            return Err(VoronoiError::InvalidConfig("no sites provided".into()));
        }
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(VoronoiError::InvalidConfig("empty image".into()));
        }

        self.ensure_target(width, height);
        self.ensure_instances(sites);
        let cell_of = self.render_and_read(sites.len())?;
        Ok(accumulate_cells(image, cell_of, sites))
    }
}

/// Static unit cone: a triangle list fanning from the apex at depth 0 to a
/// circumscribed rim at depth 1. Scaled to the image diagonal in the vertex
/// shader.
fn build_cone(device: &wgpu::Device) -> (wgpu::Buffer, u32) {
    let rim_scale = 1.0 / (std::f32::consts::PI / CONE_SEGMENTS as f32).cos();
    let mut vertices = Vec::with_capacity(CONE_SEGMENTS as usize * 3);
    for s in 0..CONE_SEGMENTS {
        let a0 = s as f32 / CONE_SEGMENTS as f32 * std::f32::consts::TAU;
        let a1 = (s + 1) as f32 / CONE_SEGMENTS as f32 * std::f32::consts::TAU;
        vertices.push(ConeVertex { pos: [0.0, 0.0, 0.0] });
        vertices.push(ConeVertex {
            pos: [a0.cos() * rim_scale, a0.sin() * rim_scale, 1.0],
        });
        vertices.push(ConeVertex {
            pos: [a1.cos() * rim_scale, a1.sin() * rim_scale, 1.0],
        });
    }

    let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("Cone Vertices"),
        contents: bytemuck::cast_slice(&vertices),
        usage: wgpu::BufferUsages::VERTEX,
    });
    (buffer, vertices.len() as u32)
}
