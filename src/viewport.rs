//! Viewport host: owns the GPU context, camera and root scene, and draws
//! the scene plus whatever loader content is mounted into it.

use crate::camera::{Camera, Projection};
use crate::config::ViewportSettings;
use crate::defaults;
use crate::dispose::{DisposeReport, dispose};
use crate::egui::EguiRenderer;
use crate::environment::EnvironmentLight;
use crate::light::{AmbientLight, LightSet};
use crate::loader::Theme;
use crate::model::{
    DrawModel, DrawShadow, GpuGeometry, GpuMaterial, InstanceRaw, Material, MaterialContext,
    ModelVertex, Vertex,
};
use crate::picking;
use crate::resources;
use crate::scene::{Fog, Node, NodeId, Scene};
use crate::texture::{GpuTexture, TextureData};
use anyhow::Context;
use cgmath::{Deg, EuclideanSpace, InnerSpace, Matrix4, Point3, Rad, SquareMatrix};
use egui_wgpu::ScreenDescriptor;
use std::ops::Range;
use std::{iter, sync::Arc};
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalPosition;
use winit::window::Window;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraUniform {
    view_position: [f32; 4],
    view_proj: [[f32; 4]; 4],
    fog_color: [f32; 4],
    fog_near: f32,
    fog_far: f32,
    exposure: f32,
    fog_enabled: u32,
}

impl CameraUniform {
    fn new(exposure: f32) -> Self {
        Self {
            view_position: [0.0; 4],
            view_proj: Matrix4::identity().into(),
            fog_color: [0.0; 4],
            fog_near: 0.0,
            fog_far: 0.0,
            exposure,
            fog_enabled: 0,
        }
    }

    fn update_view_proj(&mut self, camera: &Camera, projection: &Projection) {
        self.view_position = camera.position.to_homogeneous().into();
        self.view_proj = (projection.calc_matrix() * camera.calc_matrix()).into();
    }

    fn update_fog(&mut self, fog: Option<&Fog>) {
        match fog {
            Some(fog) => {
                let [r, g, b] = fog.color;
                self.fog_color = [r, g, b, 1.0];
                self.fog_near = fog.near;
                self.fog_far = fog.far.max(fog.near + f32::EPSILON);
                self.fog_enabled = 1;
            }
            None => self.fog_enabled = 0,
        }
    }
}

pub fn pixel_ratio(scale_factor: f64, max_pixel_ratio: f64) -> f64 {
    scale_factor.min(max_pixel_ratio).max(f64::MIN_POSITIVE)
}

/// Surface size for a window of `width` x `height` physical pixels when
/// drawing at `ratio` instead of the window's own scale factor.
pub fn surface_size(width: u32, height: u32, scale_factor: f64, ratio: f64) -> (u32, u32) {
    let scale = |px: u32| ((px as f64 / scale_factor) * ratio).round().max(1.0) as u32;
    (scale(width), scale(height))
}

/// Every visible node carrying a mesh, with its world matrix. Mounted
/// content is parented under the scene root.
pub fn visible_meshes<'a>(root: &'a Node, mounted: &[&'a Node]) -> Vec<(&'a Node, Matrix4<f32>)> {
    let mut out = Vec::new();
    let mut collect = |node: &'a Node, world: Matrix4<f32>| {
        if node.mesh.is_some() {
            out.push((node, world));
        }
    };
    root.visit_visible(Matrix4::identity(), &mut collect);
    if root.visible {
        let parent = root.transform.matrix();
        for node in mounted {
            node.visit_visible(parent, &mut collect);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipelineKey {
    transparent: bool,
    double_sided: bool,
}

impl PipelineKey {
    const ALL: [PipelineKey; 4] = [
        PipelineKey { transparent: false, double_sided: false },
        PipelineKey { transparent: false, double_sided: true },
        PipelineKey { transparent: true, double_sided: false },
        PipelineKey { transparent: true, double_sided: true },
    ];

    fn index(self) -> usize {
        ((self.transparent as usize) << 1) | self.double_sided as usize
    }
}

struct DrawItem {
    geometry: GpuGeometry,
    material: GpuMaterial,
    indices: Range<u32>,
    instance: u32,
    key: PipelineKey,
    cast_shadow: bool,
    /// Squared distance from the camera, for back-to-front sorting
    depth: f32,
}

/// Opaque items first in submission order, then transparent items far to
/// near.
fn order_for_drawing<T>(items: &mut [T], transparent: impl Fn(&T) -> bool, depth: impl Fn(&T) -> f32) {
    items.sort_by(|a, b| match (transparent(a), transparent(b)) {
        (false, false) => std::cmp::Ordering::Equal,
        (false, true) => std::cmp::Ordering::Less,
        (true, false) => std::cmp::Ordering::Greater,
        (true, true) => depth(b).total_cmp(&depth(a)),
    });
}

fn create_render_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    color_format: wgpu::TextureFormat,
    sample_count: u32,
    shader: &wgpu::ShaderModule,
    key: PipelineKey,
) -> wgpu::RenderPipeline {
    let blend = if key.transparent {
        wgpu::BlendState::ALPHA_BLENDING
    } else {
        wgpu::BlendState::REPLACE
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&format!("Render Pipeline {:?}", key)),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[ModelVertex::desc(), InstanceRaw::desc()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: color_format,
                blend: Some(blend),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: if key.double_sided {
                None
            } else {
                Some(wgpu::Face::Back)
            },
            // Setting this to anything other than Fill requires Features::NON_FILL_POLYGON_MODE
            polygon_mode: wgpu::PolygonMode::Fill,
            // Requires Features::DEPTH_CLIP_CONTROL
            unclipped_depth: false,
            // Requires Features::CONSERVATIVE_RASTERIZATION
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: GpuTexture::DEPTH_FORMAT,
            // Transparent surfaces test against depth but never occlude
            depth_write_enabled: !key.transparent,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState {
            count: sample_count,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    })
}

fn create_shadow_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Shadow Pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[ModelVertex::desc(), InstanceRaw::desc()],
            compilation_options: Default::default(),
        },
        fragment: None,
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: GpuTexture::DEPTH_FORMAT,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState {
                constant: 2,
                slope_scale: 2.0,
                clamp: 0.0,
            },
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_instance_buffer(device: &wgpu::Device, capacity: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Instance Buffer"),
        size: (capacity * std::mem::size_of::<InstanceRaw>()) as wgpu::BufferAddress,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

pub struct Viewport {
    // Put egui_renderer first so it gets dropped before GPU resources
    egui_renderer: EguiRenderer,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    is_surface_configured: bool,
    sample_count: u32,
    pixel_ratio: f64,
    max_pixel_ratio: f64,
    pipelines: Vec<wgpu::RenderPipeline>,
    shadow_pipeline: wgpu::RenderPipeline,
    camera: Camera,
    projection: Projection,
    camera_uniform: CameraUniform,
    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
    lights_buffer: wgpu::Buffer,
    lights_bind_group: wgpu::BindGroup,
    shadow_pass_bind_group: wgpu::BindGroup,
    shadow_map: GpuTexture,
    material_layout: wgpu::BindGroupLayout,
    white_srgb: GpuTexture,
    white_linear: GpuTexture,
    flat_normal: GpuTexture,
    instance_buffer: wgpu::Buffer,
    instance_capacity: usize,
    depth_texture: GpuTexture,
    msaa_target: Option<GpuTexture>,
    window: Arc<Window>,
    scene: Scene,
    base_ambient: AmbientLight,
    environment_dirty: bool,
    pub animating: bool,
    frame_time: web_time::Duration,
}

impl Viewport {
    pub async fn new(
        window: Arc<Window>,
        settings: &ViewportSettings,
        lights: LightSet,
    ) -> anyhow::Result<Viewport> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            #[cfg(not(target_arch = "wasm32"))]
            backends: wgpu::Backends::PRIMARY,
            #[cfg(target_arch = "wasm32")]
            backends: wgpu::Backends::GL,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .context("creating surface")?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no compatible graphics adapter")?;

        let backend = adapter.get_info().backend;
        log::info!("Render backend: {}", backend);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: if cfg!(target_arch = "wasm32") {
                    wgpu::Limits::downlevel_webgl2_defaults()
                } else {
                    wgpu::Limits::default()
                },
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .context("requesting device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .context("surface reports no formats")?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: surface_caps.present_modes[0],
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        let supports = |format: wgpu::TextureFormat, count: u32| {
            adapter
                .get_texture_format_features(format)
                .flags
                .sample_count_supported(count)
        };
        let sample_count = if supports(surface_format, settings.msaa_samples)
            && supports(GpuTexture::DEPTH_FORMAT, settings.msaa_samples)
        {
            settings.msaa_samples
        } else {
            log::warn!("{}x MSAA unsupported, rendering without it", settings.msaa_samples);
            1
        };

        let depth_texture =
            GpuTexture::create_depth_texture(&device, &config, sample_count, "Depth Texture");
        let msaa_target = (sample_count > 1)
            .then(|| GpuTexture::create_msaa_target(&device, &config, sample_count));
        let shadow_map = GpuTexture::create_shadow_map(&device, settings.shadow_map_size);

        let white_srgb = GpuTexture::from_data(
            &device,
            &queue,
            &TextureData::solid([255; 4], true),
            "White sRGB",
        );
        let white_linear = GpuTexture::from_data(
            &device,
            &queue,
            &TextureData::solid([255; 4], false),
            "White Linear",
        );
        let flat_normal = GpuTexture::from_data(
            &device,
            &queue,
            &TextureData::solid([128, 128, 255, 255], false),
            "Flat Normal",
        );

        let camera = Camera::new(settings.camera_position, settings.camera_target);
        let projection = Projection::new(
            config.width,
            config.height,
            Deg(settings.fovy_deg),
            settings.znear,
            settings.zfar,
        );

        let mut camera_uniform = CameraUniform::new(settings.exposure);
        camera_uniform.update_view_proj(&camera, &projection);
        camera_uniform.update_fog(settings.fog.as_ref());

        let camera_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Camera Buffer"),
            contents: bytemuck::cast_slice(&[camera_uniform]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let camera_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                entries: &[uniform_entry(
                    0,
                    wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                )],
                label: Some("camera_bind_group_layout"),
            });

        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &camera_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            }],
            label: Some("camera_bind_group"),
        });

        let lights_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Lights Buffer"),
            contents: bytemuck::cast_slice(&[lights.sync_to_gpu(None)]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let lights_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("lights_bind_group_layout"),
                entries: &[
                    uniform_entry(0, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Depth,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                        count: None,
                    },
                ],
            });

        let lights_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lights_bind_group"),
            layout: &lights_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: lights_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&shadow_map.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&shadow_map.sampler),
                },
            ],
        });

        // The shadow pass writes the map, so it only sees the light uniform
        let shadow_pass_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shadow_pass_bind_group_layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX)],
        });
        let shadow_pass_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadow_pass_bind_group"),
            layout: &shadow_pass_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: lights_buffer.as_entire_binding(),
            }],
        });

        let material_layout = Material::bind_group_layout(&device);

        let shader_source = resources::load_string("shader.wgsl")
            .await
            .context("loading shader.wgsl")?;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shader"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let render_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Render Pipeline Layout"),
                bind_group_layouts: &[
                    &camera_bind_group_layout,
                    &material_layout,
                    &lights_bind_group_layout,
                ],
                push_constant_ranges: &[],
            });

        let pipelines = PipelineKey::ALL
            .iter()
            .map(|key| {
                create_render_pipeline(
                    &device,
                    &render_pipeline_layout,
                    config.format,
                    sample_count,
                    &shader,
                    *key,
                )
            })
            .collect();

        let shadow_pipeline = {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Shadow Pipeline Layout"),
                bind_group_layouts: &[&shadow_pass_layout],
                push_constant_ranges: &[],
            });
            let shader_source = resources::load_string("shadow.wgsl")
                .await
                .context("loading shadow.wgsl")?;
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Shadow Shader"),
                source: wgpu::ShaderSource::Wgsl(shader_source.into()),
            });
            create_shadow_pipeline(&device, &layout, &shader)
        };

        let instance_capacity = defaults::INITIAL_INSTANCE_CAPACITY;
        let instance_buffer = create_instance_buffer(&device, instance_capacity);

        let egui_renderer = EguiRenderer::new(&device, config.format, &window);

        let scale_factor = window.scale_factor();
        let base_ambient = lights.ambient;
        log::info!(
            "Viewport ready: {}x{} {:?}, {}x MSAA",
            config.width,
            config.height,
            config.format,
            sample_count
        );

        Ok(Self {
            egui_renderer,
            surface,
            device,
            queue,
            config,
            is_surface_configured: false,
            sample_count,
            pixel_ratio: pixel_ratio(scale_factor, settings.max_pixel_ratio),
            max_pixel_ratio: settings.max_pixel_ratio,
            pipelines,
            shadow_pipeline,
            camera,
            projection,
            camera_uniform,
            camera_buffer,
            camera_bind_group,
            lights_buffer,
            lights_bind_group,
            shadow_pass_bind_group,
            shadow_map,
            material_layout,
            white_srgb,
            white_linear,
            flat_normal,
            instance_buffer,
            instance_capacity,
            depth_texture,
            msaa_target,
            window,
            scene: Scene::new(lights, settings.background, settings.fog),
            base_ambient,
            environment_dirty: false,
            animating: true,
            frame_time: web_time::Duration::ZERO,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn pixel_ratio(&self) -> f64 {
        self.pixel_ratio
    }

    pub fn frame_time(&self) -> web_time::Duration {
        self.frame_time
    }

    /// Logical height of the viewport, in the units the scroll track uses.
    pub fn logical_height(&self) -> f32 {
        (self.config.height as f64 / self.pixel_ratio) as f32
    }

    pub fn handle_input(&mut self, event: &winit::event::WindowEvent) -> bool {
        self.egui_renderer.handle_input(&self.window, event)
    }

    pub fn ui_wants_pointer(&self) -> bool {
        self.egui_renderer.wants_pointer()
    }

    /// The mesh node under the cursor, searching the root scene and the
    /// mounted content the way they are drawn.
    pub fn pick_at(&self, mounted: &[&Node], cursor: PhysicalPosition<f64>) -> Option<NodeId> {
        let size = self.window.inner_size();
        let view_proj = self.projection.calc_matrix() * self.camera.calc_matrix();
        let ray = picking::screen_ray(view_proj, cursor.x, cursor.y, size.width, size.height)?;
        let candidates = visible_meshes(&self.scene.root, mounted);
        picking::pick(&candidates, &ray).map(Node::id)
    }

    /// `width` and `height` are the window's physical size.
    pub fn resize(&mut self, width: u32, height: u32, scale_factor: f64) {
        if width == 0 || height == 0 {
            return;
        }

        let clamped = pixel_ratio(scale_factor, self.max_pixel_ratio);
        #[cfg(target_arch = "wasm32")]
        let (width, height, ratio) = {
            let (width, height) = surface_size(width, height, scale_factor, clamped);
            (width, height, clamped)
        };
        // Desktop surfaces must match the window exactly
        #[cfg(not(target_arch = "wasm32"))]
        let ratio = {
            if clamped < scale_factor {
                log::debug!("Pixel ratio cap {} not applied on desktop", self.max_pixel_ratio);
            }
            scale_factor
        };
        self.pixel_ratio = ratio;

        self.is_surface_configured = true;
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        self.depth_texture = GpuTexture::create_depth_texture(
            &self.device,
            &self.config,
            self.sample_count,
            "Depth Texture",
        );
        if self.sample_count > 1 {
            self.msaa_target = Some(GpuTexture::create_msaa_target(
                &self.device,
                &self.config,
                self.sample_count,
            ));
        }
        self.projection.resize(width, height);
        log::debug!("Resized to {}x{} at pixel ratio {}", width, height, self.pixel_ratio);
    }

    pub fn set_environment(&mut self, environment: EnvironmentLight) {
        log::info!("Applying environment '{}'", environment.source);
        self.scene.environment = Some(environment);
        self.environment_dirty = true;
    }

    pub fn set_theme(&mut self, theme: Theme) {
        let ambient = AmbientLight {
            intensity: self.base_ambient.intensity * theme.ambient_scale(),
            ..self.base_ambient
        };
        self.scene.lights.set_ambient(ambient);
    }

    pub fn update(&mut self, dt: web_time::Duration) {
        self.frame_time = dt;

        if self.animating {
            let root = &mut self.scene.root.transform;
            root.rotate_x(Rad(defaults::IDLE_ROTATION));
            root.rotate_y(Rad(defaults::IDLE_ROTATION));
        }

        self.camera_uniform
            .update_view_proj(&self.camera, &self.projection);
        self.camera_uniform.update_fog(self.scene.fog.as_ref());
        self.queue.write_buffer(
            &self.camera_buffer,
            0,
            bytemuck::cast_slice(&[self.camera_uniform]),
        );

        if self.scene.lights.is_dirty() || self.environment_dirty {
            let irradiance = self.scene.environment.as_ref().map(|env| env.ambient());
            self.queue.write_buffer(
                &self.lights_buffer,
                0,
                bytemuck::cast_slice(&[self.scene.lights.sync_to_gpu(irradiance)]),
            );
            self.scene.lights.clear_dirty();
            self.environment_dirty = false;
        }
    }

    fn build_draw_list(&self, mounted: &[&Node]) -> (Vec<InstanceRaw>, Vec<DrawItem>) {
        let ctx = MaterialContext {
            device: &self.device,
            queue: &self.queue,
            layout: &self.material_layout,
            white_srgb: &self.white_srgb,
            white_linear: &self.white_linear,
            flat_normal: &self.flat_normal,
        };

        let mut instances = Vec::new();
        let mut items = Vec::new();
        for (node, world) in visible_meshes(&self.scene.root, mounted) {
            let Some(mesh) = &node.mesh else { continue };
            let Some(geometry) = mesh.geometry.gpu(&self.device) else {
                continue;
            };
            if geometry.num_elements == 0 {
                continue;
            }

            let instance = instances.len() as u32;
            instances.push(InstanceRaw::from_world(world, node.receive_shadow));
            let depth = (Point3::from_vec(world.w.truncate()) - self.camera.position).magnitude2();

            for group in &mesh.geometry.groups {
                let Some(material) = mesh.materials.get(group.material_index) else {
                    log::warn!(
                        "'{}' has no material {} for a geometry group",
                        node.name,
                        group.material_index
                    );
                    continue;
                };
                let Some(gpu) = material.gpu(&ctx) else {
                    continue;
                };
                items.push(DrawItem {
                    geometry: geometry.clone(),
                    material: gpu,
                    indices: group.indices.clone(),
                    instance,
                    key: PipelineKey {
                        transparent: material.transparent,
                        double_sided: material.double_sided,
                    },
                    cast_shadow: node.cast_shadow,
                    depth,
                });
            }
        }

        order_for_drawing(&mut items, |item| item.key.transparent, |item| item.depth);
        (instances, items)
    }

    fn upload_instances(&mut self, instances: &[InstanceRaw]) {
        if instances.is_empty() {
            return;
        }
        if instances.len() > self.instance_capacity {
            self.instance_capacity = instances.len().next_power_of_two();
            self.instance_buffer.destroy();
            self.instance_buffer = create_instance_buffer(&self.device, self.instance_capacity);
            log::debug!("Instance buffer grown to {}", self.instance_capacity);
        }
        self.queue
            .write_buffer(&self.instance_buffer, 0, bytemuck::cast_slice(instances));
    }

    /// Draws the root scene plus `mounted` loader content, then the overlay
    /// built by `run_ui`.
    pub fn render(
        &mut self,
        mounted: &[&Node],
        run_ui: impl FnMut(&egui::Context),
    ) -> Result<(), wgpu::SurfaceError> {
        self.window.request_redraw();

        if !self.is_surface_configured {
            return Ok(());
        }

        let output = self.surface.get_current_texture()?;
        if output.suboptimal {
            return Err(wgpu::SurfaceError::Outdated);
        }

        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let (instances, items) = self.build_draw_list(mounted);
        self.upload_instances(&instances);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        if self.scene.lights.shadow_caster().is_some() {
            let mut shadow_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Shadow Pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.shadow_map.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            shadow_pass.set_pipeline(&self.shadow_pipeline);
            shadow_pass.set_bind_group(0, &self.shadow_pass_bind_group, &[]);
            shadow_pass.set_vertex_buffer(1, self.instance_buffer.slice(..));
            let mut last_instance = None;
            for item in items.iter().filter(|item| item.cast_shadow) {
                // Multi-material meshes would otherwise render once per group
                if last_instance == Some(item.instance) {
                    continue;
                }
                last_instance = Some(item.instance);
                shadow_pass.draw_shadow_caster(&item.geometry, item.instance);
            }
        }

        {
            let [r, g, b] = self.scene.background;
            let (color_view, resolve_target) = match &self.msaa_target {
                Some(msaa) => (&msaa.view, Some(&view)),
                None => (&view, None),
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: r as f64,
                            g: g as f64,
                            b: b as f64,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_texture.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            render_pass.set_bind_group(0, &self.camera_bind_group, &[]);
            render_pass.set_bind_group(2, &self.lights_bind_group, &[]);
            render_pass.set_vertex_buffer(1, self.instance_buffer.slice(..));

            let mut bound = None;
            for item in &items {
                if bound != Some(item.key) {
                    render_pass.set_pipeline(&self.pipelines[item.key.index()]);
                    bound = Some(item.key);
                }
                render_pass.draw_geometry_group(
                    &item.geometry,
                    item.indices.clone(),
                    &item.material,
                    item.instance,
                );
            }
        }

        let screen_descriptor = ScreenDescriptor {
            size_in_pixels: [self.config.width, self.config.height],
            pixels_per_point: self.pixel_ratio as f32,
        };

        self.egui_renderer.draw(
            &self.device,
            &self.queue,
            &mut encoder,
            &self.window,
            &view,
            screen_descriptor,
            run_ui,
        );

        self.queue.submit(iter::once(encoder.finish()));
        output.present();

        Ok(())
    }

    /// Disposes the root scene and destroys every GPU object this viewport
    /// created, the device last.
    pub fn teardown(self) -> DisposeReport {
        let Viewport {
            egui_renderer,
            device,
            scene,
            depth_texture,
            msaa_target,
            shadow_map,
            white_srgb,
            white_linear,
            flat_normal,
            camera_buffer,
            lights_buffer,
            instance_buffer,
            ..
        } = self;

        drop(egui_renderer);
        let report = dispose(&scene.root);

        for target in [Some(depth_texture), msaa_target, Some(shadow_map)]
            .into_iter()
            .flatten()
        {
            target.texture.destroy();
        }
        for fallback in [white_srgb, white_linear, flat_normal] {
            fallback.texture.destroy();
        }
        for buffer in [camera_buffer, lights_buffer, instance_buffer] {
            buffer.destroy();
        }
        device.destroy();

        log::info!(
            "Viewport torn down: {} geometries, {} materials, {} textures released",
            report.geometries,
            report.materials,
            report.textures
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mesh, TextureMaps};
    use crate::model::{Geometry, MaterialProperties};
    use crate::resource::ResourceTracker;
    use crate::scene::Transform;
    use cgmath::Vector3;

    fn mesh_node(name: &str, tracker: &ResourceTracker) -> Node {
        let geometry = Arc::new(Geometry::new(name, vec![], vec![0, 1, 2], tracker));
        let material = Arc::new(Material::new(
            name,
            MaterialProperties::default(),
            TextureMaps::default(),
            tracker,
        ));
        Node::with_mesh(name, Mesh::new(geometry, material))
    }

    #[test]
    fn pixel_ratio_is_capped() {
        assert_eq!(pixel_ratio(1.0, 2.0), 1.0);
        assert_eq!(pixel_ratio(3.0, 2.0), 2.0);
    }

    #[test]
    fn surface_size_follows_capped_ratio() {
        // 3x display, 1000x600 logical
        assert_eq!(surface_size(3000, 1800, 3.0, 2.0), (2000, 1200));
        assert_eq!(surface_size(1000, 600, 1.0, 1.0), (1000, 600));
        assert_eq!(surface_size(1, 1, 4.0, 1.0), (1, 1));
    }

    #[test]
    fn mounted_content_is_parented_under_the_root() {
        let tracker = ResourceTracker::new();
        let mut root = Node::new("scene");
        root.transform = Transform::from_position(Vector3::new(0.0, 10.0, 0.0));

        let mut model = mesh_node("model", &tracker);
        model.transform = Transform::from_position(Vector3::new(1.0, 0.0, 0.0));
        let mut hidden = mesh_node("hidden", &tracker);
        hidden.visible = false;
        model.add_child(hidden);

        let visible = visible_meshes(&root, &[&model]);
        assert_eq!(visible.len(), 1);
        let (node, world) = visible[0];
        assert_eq!(node.name, "model");
        assert_eq!(world.w.truncate(), Vector3::new(1.0, 10.0, 0.0));
    }

    #[test]
    fn hidden_root_hides_mounted_content() {
        let tracker = ResourceTracker::new();
        let mut root = Node::new("scene");
        root.visible = false;
        let model = mesh_node("model", &tracker);
        assert!(visible_meshes(&root, &[&model]).is_empty());
    }

    #[test]
    fn transparent_items_draw_last_back_to_front() {
        // (name, transparent, depth)
        let mut items = vec![
            ("glass-near", true, 1.0),
            ("body", false, 9.0),
            ("glass-far", true, 25.0),
            ("frame", false, 4.0),
        ];
        order_for_drawing(&mut items, |item| item.1, |item| item.2);
        let names: Vec<_> = items.iter().map(|item| item.0).collect();
        assert_eq!(names, ["body", "frame", "glass-far", "glass-near"]);
    }

    #[test]
    fn pipeline_keys_index_distinct_slots() {
        let mut seen: Vec<_> = PipelineKey::ALL.iter().map(|key| key.index()).collect();
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[test]
    fn fog_uniform_tracks_scene_fog() {
        let mut uniform = CameraUniform::new(1.0);
        uniform.update_fog(Some(&Fog::default()));
        assert_eq!(uniform.fog_enabled, 1);
        assert_eq!((uniform.fog_near, uniform.fog_far), (10.0, 50.0));
        uniform.update_fog(None);
        assert_eq!(uniform.fog_enabled, 0);
    }
}
