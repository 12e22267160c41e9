//! Rendering system: wgpu implementation of the instanced-batch bridge.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use thiserror::Error;
use wgpu::util::DeviceExt;

use crate::bridge::{BatchGeometry, BatchHandle, RendererBridge, StagedBatch};
use crate::params::RenderConfig;

/// No capable graphics context. Fatal at startup; there is no degraded
/// rendering fallback.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to create surface: {0}")]
    Surface(String),
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error("failed to request device: {0}")]
    Device(String),
}

/// Uniform buffer shared by the city and ground shaders.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Uniforms {
    pub view_proj: [[f32; 4]; 4],
    /// Camera eye position (w unused).
    pub camera_pos: [f32; 4],
    /// x: fog density, y: floor grid offset, z: floor grid unit, w: time.
    pub env: [f32; 4],
}

/// Mesh vertex: position only, flat unlit shading.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
}

/// One instanced batch: CPU staging plus its GPU buffer.
struct GpuBatch {
    staged: StagedBatch,
    buffer: wgpu::Buffer,
}

/// Static mesh on the GPU.
struct Mesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

/// Rendering system managing the wgpu device, pipelines, and batches.
pub struct RenderSystem {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    city_pipeline: wgpu::RenderPipeline,
    ground_pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    depth_view: wgpu::TextureView,
    tower_mesh: Mesh,
    road_line_mesh: Mesh,
    ground_mesh: Mesh,
    batches: Vec<GpuBatch>,
}

impl RenderSystem {
    /// Create the rendering system for a window.
    pub async fn new(
        window: std::sync::Arc<winit::window::Window>,
        render_config: &RenderConfig,
    ) -> Result<Self, RenderError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        // Surface (window must have 'static lifetime via Arc)
        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::Surface(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Main Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| RenderError::Device(e.to_string()))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let depth_view = create_depth_view(&device, &surface_config);

        // Shaders
        let city_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("City Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("city.wgsl").into()),
        });
        let ground_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Ground Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("ground.wgsl").into()),
        });

        // Uniforms
        let uniforms = Uniforms {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            camera_pos: [0.0; 4],
            env: [render_config.fog_density, 0.0, 2.0, 0.0],
        };
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: bytemuck::cast_slice(&[uniforms]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let uniform_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Uniform Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Uniform Bind Group"),
            layout: &uniform_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Render Pipeline Layout"),
            bind_group_layouts: &[&uniform_bind_group_layout],
            push_constant_ranges: &[],
        });

        // Vertex layouts: mesh position plus a mat4 + color per instance.
        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x3,
            }],
        };
        let instance_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<crate::bridge::RawInstance>()
                as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: 16,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: 32,
                    shader_location: 3,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: 48,
                    shader_location: 4,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: 64,
                    shader_location: 5,
                    format: wgpu::VertexFormat::Float32x4,
                },
            ],
        };

        let city_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("City Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &city_shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout.clone(), instance_layout],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &city_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_config.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                // Reflections flip winding (negative Y scale); draw both faces.
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let ground_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Ground Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &ground_shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &ground_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_config.format,
                    // Semi-transparent road: the reflections shimmer through.
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let tower_mesh = upload_mesh(&device, &tower_vertices(), &BOX_INDICES, "Tower");
        let road_line_mesh = upload_mesh(&device, &road_line_vertices(), &BOX_INDICES, "Road Line");
        let ground_mesh = upload_mesh(&device, &GROUND_VERTICES, &GROUND_INDICES, "Ground");

        Ok(Self {
            surface,
            device,
            queue,
            surface_config,
            city_pipeline,
            ground_pipeline,
            uniform_buffer,
            uniform_bind_group,
            depth_view,
            tower_mesh,
            road_line_mesh,
            ground_mesh,
            batches: Vec::new(),
        })
    }

    /// Current surface size in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    /// Upload the per-frame uniforms.
    pub fn update_uniforms(&self, uniforms: &Uniforms) {
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[*uniforms]));
    }

    /// Render a frame: ground grid behind, instanced city over it.
    pub fn render(&self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_pipeline(&self.city_pipeline);
            render_pass.set_bind_group(0, &self.uniform_bind_group, &[]);
            for batch in &self.batches {
                let mesh = match batch.staged.geometry {
                    BatchGeometry::Tower => &self.tower_mesh,
                    BatchGeometry::RoadLine => &self.road_line_mesh,
                };
                render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                render_pass.set_vertex_buffer(1, batch.buffer.slice(..));
                render_pass
                    .set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                render_pass.draw_indexed(
                    0..mesh.index_count,
                    0,
                    0..batch.staged.instances.len() as u32,
                );
            }

            // Drawn last so its alpha blend darkens the reflections below.
            render_pass.set_pipeline(&self.ground_pipeline);
            render_pass.set_bind_group(0, &self.uniform_bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.ground_mesh.vertex_buffer.slice(..));
            render_pass.set_index_buffer(
                self.ground_mesh.index_buffer.slice(..),
                wgpu::IndexFormat::Uint16,
            );
            render_pass.draw_indexed(0..self.ground_mesh.index_count, 0, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

impl RendererBridge for RenderSystem {
    fn create_instanced_batch(&mut self, count: usize, geometry: BatchGeometry) -> BatchHandle {
        let staged = StagedBatch::new(count, geometry);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Instance Buffer"),
            size: (std::mem::size_of::<crate::bridge::RawInstance>() * count.max(1))
                as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.batches.push(GpuBatch { staged, buffer });
        BatchHandle(self.batches.len() - 1)
    }

    fn set_instance_transform(&mut self, batch: BatchHandle, index: usize, transform: Mat4) {
        self.batches[batch.0].staged.set_transform(index, transform);
    }

    fn set_instance_color(&mut self, batch: BatchHandle, index: usize, color: glam::Vec4) {
        self.batches[batch.0].staged.set_color(index, color);
    }

    /// One buffer upload per batch per frame, however many instances changed.
    fn commit(&mut self, batch: BatchHandle) {
        let batch = &mut self.batches[batch.0];
        if batch.staged.dirty {
            self.queue.write_buffer(
                &batch.buffer,
                0,
                bytemuck::cast_slice(&batch.staged.instances),
            );
            batch.staged.dirty = false;
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
        self.depth_view = create_depth_view(&self.device, &self.surface_config);
    }
}

fn create_depth_view(
    device: &wgpu::Device,
    config: &wgpu::SurfaceConfiguration,
) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: wgpu::Extent3d {
            width: config.width,
            height: config.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Depth32Float,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn upload_mesh(
    device: &wgpu::Device,
    vertices: &[Vertex],
    indices: &[u16],
    label: &str,
) -> Mesh {
    let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(&format!("{label} Vertex Buffer")),
        contents: bytemuck::cast_slice(vertices),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(&format!("{label} Index Buffer")),
        contents: bytemuck::cast_slice(indices),
        usage: wgpu::BufferUsages::INDEX,
    });
    Mesh {
        vertex_buffer,
        index_buffer,
        index_count: indices.len() as u32,
    }
}

/// Shared box topology for the 8-corner meshes below.
const BOX_INDICES: [u16; 36] = [
    0, 1, 2, 2, 1, 3, // bottom
    4, 6, 5, 5, 6, 7, // top
    0, 4, 1, 1, 4, 5, // front
    2, 3, 6, 6, 3, 7, // back
    0, 2, 4, 4, 2, 6, // left
    1, 5, 3, 3, 5, 7, // right
];

fn box_vertices(half_x: f32, y_min: f32, y_max: f32, half_z: f32) -> [Vertex; 8] {
    let mut out = [Vertex { position: [0.0; 3] }; 8];
    for (i, v) in out.iter_mut().enumerate() {
        v.position = [
            if i & 1 == 0 { -half_x } else { half_x },
            if i & 4 == 0 { y_min } else { y_max },
            if i & 2 == 0 { -half_z } else { half_z },
        ];
    }
    out
}

/// Unit footprint, pivot at the base so Y scale equals height.
fn tower_vertices() -> [Vertex; 8] {
    box_vertices(0.75, 0.0, 1.0, 0.75)
}

/// Painted marking: 0.2 wide, barely raised, 4 deep.
fn road_line_vertices() -> [Vertex; 8] {
    box_vertices(0.1, -0.01, 0.01, 2.0)
}

const GROUND_Y: f32 = 0.05;
const GROUND_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [-100.0, GROUND_Y, -200.0],
    },
    Vertex {
        position: [100.0, GROUND_Y, -200.0],
    },
    Vertex {
        position: [-100.0, GROUND_Y, 200.0],
    },
    Vertex {
        position: [100.0, GROUND_Y, 200.0],
    },
];
const GROUND_INDICES: [u16; 6] = [0, 2, 1, 1, 2, 3];

/// Build the camera matrices from the render configuration.
pub fn view_proj(config: &RenderConfig, width: u32, height: u32) -> Mat4 {
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    let proj = Mat4::perspective_rh(
        config.fov_degrees.to_radians(),
        aspect,
        config.near_plane_m,
        config.far_plane_m,
    );
    let view = Mat4::look_at_rh(
        Vec3::from_array(config.camera_eye),
        Vec3::from_array(config.camera_target),
        Vec3::Y,
    );
    proj * view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tower_mesh_pivot_at_base() {
        let verts = tower_vertices();
        let min_y = verts.iter().map(|v| v.position[1]).fold(f32::MAX, f32::min);
        let max_y = verts.iter().map(|v| v.position[1]).fold(f32::MIN, f32::max);
        assert_eq!(min_y, 0.0);
        assert_eq!(max_y, 1.0);
    }

    #[test]
    fn test_box_indices_cover_all_corners() {
        let mut seen = [false; 8];
        for &i in BOX_INDICES.iter() {
            seen[i as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(BOX_INDICES.len(), 36);
    }

    #[test]
    fn test_view_proj_is_finite() {
        let config = RenderConfig::default();
        let mvp = view_proj(&config, 1280, 720);
        assert!(mvp.to_cols_array().iter().all(|c| c.is_finite()));
    }
}
