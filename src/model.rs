use crate::picking::Aabb;
use crate::resource::{GpuSlot, ReleaseError, ResourceKind, ResourceTracker};
use crate::texture::{GpuTexture, Texture};
use cgmath::{Matrix3, Matrix4, Point3};
use std::{ops::Range, sync::Arc};
use wgpu::util::DeviceExt;

pub trait Vertex {
    fn desc() -> wgpu::VertexBufferLayout<'static>;
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelVertex {
    pub position: [f32; 3],
    pub tex_coords: [f32; 2],
    pub normal: [f32; 3],
    /// xyz along +u, w is the bitangent sign
    pub tangent: [f32; 4],
}

impl Vertex for ModelVertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        use wgpu::{
            BufferAddress, VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
        };
        VertexBufferLayout {
            array_stride: std::mem::size_of::<ModelVertex>() as BufferAddress,
            step_mode: VertexStepMode::Vertex,
            attributes: &[
                VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 3]>() as BufferAddress,
                    shader_location: 1,
                    format: VertexFormat::Float32x2,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 5]>() as BufferAddress,
                    shader_location: 2,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 8]>() as BufferAddress,
                    shader_location: 3,
                    format: VertexFormat::Float32x4,
                },
            ],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRaw {
    model: [[f32; 4]; 4],
    normal: [[f32; 3]; 3],
    /// 1.0 when the node samples the shadow map
    receive_shadow: f32,
}

impl InstanceRaw {
    pub fn from_world(world: Matrix4<f32>, receive_shadow: bool) -> Self {
        use cgmath::SquareMatrix;

        let linear = Matrix3::from_cols(world.x.truncate(), world.y.truncate(), world.z.truncate());
        // Inverse-transpose keeps normals perpendicular under non-uniform scale
        let normal = linear
            .invert()
            .map(|inv| cgmath::Matrix::transpose(&inv))
            .unwrap_or(linear);

        Self {
            model: world.into(),
            normal: normal.into(),
            receive_shadow: if receive_shadow { 1.0 } else { 0.0 },
        }
    }
}

impl Vertex for InstanceRaw {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        use wgpu::{
            BufferAddress, VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
        };

        VertexBufferLayout {
            array_stride: std::mem::size_of::<InstanceRaw>() as BufferAddress,
            step_mode: VertexStepMode::Instance,
            attributes: &[
                VertexAttribute {
                    offset: 0,
                    shader_location: 5,
                    format: VertexFormat::Float32x4,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 4]>() as BufferAddress,
                    shader_location: 6,
                    format: VertexFormat::Float32x4,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 8]>() as BufferAddress,
                    shader_location: 7,
                    format: VertexFormat::Float32x4,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 12]>() as BufferAddress,
                    shader_location: 8,
                    format: VertexFormat::Float32x4,
                },
                // Normal matrix
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 16]>() as BufferAddress,
                    shader_location: 9,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 19]>() as BufferAddress,
                    shader_location: 10,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 22]>() as BufferAddress,
                    shader_location: 11,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    offset: std::mem::size_of::<[f32; 25]>() as BufferAddress,
                    shader_location: 12,
                    format: VertexFormat::Float32,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryGroup {
    pub indices: Range<u32>,
    pub material_index: usize,
}

#[derive(Debug, Clone)]
pub struct GpuGeometry {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub num_elements: u32,
}

#[derive(Debug)]
pub struct Geometry {
    pub name: String,
    pub vertices: Vec<ModelVertex>,
    pub indices: Vec<u32>,
    pub groups: Vec<GeometryGroup>,
    /// Local-space bounds; `None` without vertices
    pub bounds: Option<Aabb>,
    gpu: GpuSlot<GpuGeometry>,
}

impl Geometry {
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<ModelVertex>,
        indices: Vec<u32>,
        tracker: &ResourceTracker,
    ) -> Self {
        let groups = vec![GeometryGroup {
            indices: 0..indices.len() as u32,
            material_index: 0,
        }];
        Self::with_groups(name, vertices, indices, groups, tracker)
    }

    pub fn with_groups(
        name: impl Into<String>,
        vertices: Vec<ModelVertex>,
        indices: Vec<u32>,
        groups: Vec<GeometryGroup>,
        tracker: &ResourceTracker,
    ) -> Self {
        let name = name.into();
        Self {
            gpu: GpuSlot::new(ResourceKind::Geometry, name.clone(), tracker),
            bounds: Aabb::from_points(vertices.iter().map(|v| Point3::from(v.position))),
            name,
            vertices,
            indices,
            groups,
        }
    }

    pub fn is_released(&self) -> bool {
        self.gpu.is_released()
    }

    pub fn gpu(&self, device: &wgpu::Device) -> Option<GpuGeometry> {
        self.gpu.get_or_upload(|| GpuGeometry {
            vertex_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{} Vertex Buffer", self.name)),
                contents: bytemuck::cast_slice(&self.vertices),
                usage: wgpu::BufferUsages::VERTEX,
            }),
            index_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{} Index Buffer", self.name)),
                contents: bytemuck::cast_slice(&self.indices),
                usage: wgpu::BufferUsages::INDEX,
            }),
            num_elements: self.indices.len() as u32,
        })
    }

    pub fn release(&self) -> Result<bool, ReleaseError> {
        self.gpu.release(|gpu| {
            gpu.vertex_buffer.destroy();
            gpu.index_buffer.destroy();
        })
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialProperties {
    /// Linear RGBA; alpha is the material opacity.
    pub color: [f32; 4],
    pub emissive: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub normal_scale: f32,
    pub occlusion_strength: f32,
    /// Non-zero skips lighting, fog still applies
    pub unlit: u32,
    pub _padding: [u32; 3],
}

impl MaterialProperties {
    pub fn unlit(color: [f32; 4]) -> Self {
        Self {
            color,
            unlit: 1,
            ..Default::default()
        }
    }
}

impl Default for MaterialProperties {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0, 1.0],
            emissive: [0.0; 4],
            metallic: 0.0,
            roughness: 1.0,
            normal_scale: 1.0,
            occlusion_strength: 1.0,
            unlit: 0,
            _padding: [0; 3],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextureMaps {
    pub base_color: Option<Arc<Texture>>,
    pub normal: Option<Arc<Texture>>,
    pub roughness: Option<Arc<Texture>>,
    pub metalness: Option<Arc<Texture>>,
    pub emissive: Option<Arc<Texture>>,
    pub occlusion: Option<Arc<Texture>>,
}

impl TextureMaps {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Arc<Texture>)> {
        [
            ("base_color", &self.base_color),
            ("normal", &self.normal),
            ("roughness", &self.roughness),
            ("metalness", &self.metalness),
            ("emissive", &self.emissive),
            ("occlusion", &self.occlusion),
        ]
        .into_iter()
        .filter_map(|(channel, map)| map.as_ref().map(|texture| (channel, texture)))
    }
}

#[derive(Debug, Clone)]
pub struct GpuMaterial {
    pub properties_buffer: wgpu::Buffer,
    pub bind_group: wgpu::BindGroup,
    /// `Texture::uploads` of each map when the bind group was built
    texture_uploads: Vec<u64>,
}

pub struct MaterialContext<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub layout: &'a wgpu::BindGroupLayout,
    pub white_srgb: &'a GpuTexture,
    pub white_linear: &'a GpuTexture,
    /// Tangent-space +z, for materials without a normal map
    pub flat_normal: &'a GpuTexture,
}

#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub properties: MaterialProperties,
    pub maps: TextureMaps,
    pub transparent: bool,
    pub double_sided: bool,
    gpu: GpuSlot<GpuMaterial>,
}

impl Material {
    pub fn new(
        name: impl Into<String>,
        properties: MaterialProperties,
        maps: TextureMaps,
        tracker: &ResourceTracker,
    ) -> Self {
        let name = name.into();
        Self {
            gpu: GpuSlot::new(ResourceKind::Material, name.clone(), tracker),
            transparent: properties.color[3] < 1.0,
            double_sided: false,
            name,
            properties,
            maps,
        }
    }

    pub fn is_released(&self) -> bool {
        self.gpu.is_released()
    }

    /// Upload generation of each map. A released map reads as `u64::MAX`,
    /// so bind groups built before the release compare stale.
    pub fn texture_uploads(&self) -> Vec<u64> {
        self.maps
            .iter()
            .map(|(_, texture)| {
                if texture.is_released() {
                    u64::MAX
                } else {
                    texture.uploads()
                }
            })
            .collect()
    }

    pub fn bindings_stale(&self, built_with: &[u64]) -> bool {
        self.texture_uploads() != built_with
    }

    pub fn gpu(&self, ctx: &MaterialContext) -> Option<GpuMaterial> {
        if let Some(current) = self.gpu.resident() {
            if self.bindings_stale(&current.texture_uploads) {
                log::debug!("Rebuilding bind group of '{}' after a texture changed", self.name);
                self.gpu.invalidate(|gpu| gpu.properties_buffer.destroy());
            }
        }

        self.gpu.get_or_upload(|| {
            let texture_or = |map: &Option<Arc<Texture>>, fallback: &GpuTexture| {
                map.as_ref()
                    .and_then(|texture| texture.gpu(ctx.device, ctx.queue))
                    .unwrap_or_else(|| fallback.clone())
            };
            let base_color = texture_or(&self.maps.base_color, ctx.white_srgb);
            let roughness = texture_or(&self.maps.roughness, ctx.white_linear);
            let metalness = texture_or(&self.maps.metalness, ctx.white_linear);
            let emissive = texture_or(&self.maps.emissive, ctx.white_srgb);
            let normal = texture_or(&self.maps.normal, ctx.flat_normal);
            let occlusion = texture_or(&self.maps.occlusion, ctx.white_linear);

            let properties_buffer =
                ctx.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&format!("{}_properties", self.name)),
                        contents: bytemuck::cast_slice(&[self.properties]),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    });

            let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.name.as_str()),
                layout: ctx.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: properties_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&base_color.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&base_color.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&roughness.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(&metalness.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: wgpu::BindingResource::TextureView(&emissive.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: wgpu::BindingResource::TextureView(&normal.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: wgpu::BindingResource::TextureView(&occlusion.view),
                    },
                ],
            });

            GpuMaterial {
                properties_buffer,
                bind_group,
                texture_uploads: self.texture_uploads(),
            }
        })
    }

    pub fn release(&self) -> Result<bool, ReleaseError> {
        self.gpu.release(|gpu| gpu.properties_buffer.destroy())
    }

    pub fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        };

        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                texture_entry(2),
                texture_entry(3),
                texture_entry(4),
                texture_entry(5),
                texture_entry(6),
                texture_entry(7),
            ],
        })
    }
}

#[derive(Debug, Clone)]
pub enum Materials {
    Single(Arc<Material>),
    Multi(Vec<Arc<Material>>),
}

impl Materials {
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Material>> {
        match self {
            Materials::Single(material) => std::slice::from_ref(material).iter(),
            Materials::Multi(materials) => materials.iter(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Material>> {
        match self {
            Materials::Single(material) => Some(material),
            Materials::Multi(materials) => materials.get(index),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Materials::Single(_) => 1,
            Materials::Multi(materials) => materials.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub geometry: Arc<Geometry>,
    pub materials: Materials,
}

impl Mesh {
    pub fn new(geometry: Arc<Geometry>, material: Arc<Material>) -> Self {
        Self {
            geometry,
            materials: Materials::Single(material),
        }
    }
}

pub trait DrawModel<'a> {
    fn draw_geometry_group(
        &mut self,
        geometry: &'a GpuGeometry,
        indices: Range<u32>,
        material: &'a GpuMaterial,
        instance: u32,
    );
}

impl<'a, 'b> DrawModel<'b> for wgpu::RenderPass<'a>
where
    'b: 'a,
{
    fn draw_geometry_group(
        &mut self,
        geometry: &'b GpuGeometry,
        indices: Range<u32>,
        material: &'b GpuMaterial,
        instance: u32,
    ) {
        self.set_vertex_buffer(0, geometry.vertex_buffer.slice(..));
        self.set_index_buffer(geometry.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        self.set_bind_group(1, &material.bind_group, &[]);
        self.draw_indexed(indices, 0, instance..instance + 1);
    }
}

pub trait DrawShadow<'a> {
    fn draw_shadow_caster(&mut self, geometry: &'a GpuGeometry, instance: u32);
}

impl<'a, 'b> DrawShadow<'b> for wgpu::RenderPass<'a>
where
    'b: 'a,
{
    fn draw_shadow_caster(&mut self, geometry: &'b GpuGeometry, instance: u32) {
        self.set_vertex_buffer(0, geometry.vertex_buffer.slice(..));
        self.set_index_buffer(geometry.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        self.draw_indexed(0..geometry.num_elements, 0, instance..instance + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureData;

    fn material(name: &str, tracker: &ResourceTracker) -> Arc<Material> {
        Arc::new(Material::new(
            name,
            MaterialProperties::default(),
            TextureMaps::default(),
            tracker,
        ))
    }

    #[test]
    fn single_and_multi_materials_iterate_uniformly() {
        let tracker = ResourceTracker::new();
        let single = Materials::Single(material("a", &tracker));
        assert_eq!(single.iter().count(), 1);
        assert_eq!(single.get(3).map(|m| m.name.as_str()), Some("a"));

        let multi = Materials::Multi(vec![material("b", &tracker), material("c", &tracker)]);
        let names: Vec<_> = multi.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
        assert!(multi.get(2).is_none());
    }

    #[test]
    fn texture_maps_iterate_present_channels_only() {
        let tracker = ResourceTracker::new();
        let shared = Arc::new(Texture::new(
            "orm",
            TextureData::solid([255; 4], false),
            &tracker,
        ));
        let maps = TextureMaps {
            roughness: Some(shared.clone()),
            metalness: Some(shared),
            ..Default::default()
        };
        let channels: Vec<_> = maps.iter().map(|(channel, _)| channel).collect();
        assert_eq!(channels, ["roughness", "metalness"]);
    }

    #[test]
    fn translucent_color_marks_material_transparent() {
        let tracker = ResourceTracker::new();
        let properties = MaterialProperties {
            color: [1.0, 1.0, 1.0, 0.5],
            ..Default::default()
        };
        let glass = Material::new("glass", properties, TextureMaps::default(), &tracker);
        assert!(glass.transparent);
        assert!(!material("opaque", &tracker).transparent);
    }

    #[test]
    fn default_geometry_has_one_group() {
        let tracker = ResourceTracker::new();
        let geometry = Geometry::new("tri", vec![], vec![0, 1, 2], &tracker);
        assert_eq!(
            geometry.groups,
            vec![GeometryGroup {
                indices: 0..3,
                material_index: 0
            }]
        );
    }

    #[test]
    fn material_properties_match_the_shader_layout() {
        assert_eq!(std::mem::size_of::<MaterialProperties>(), 64);
        assert_eq!(std::mem::size_of::<ModelVertex>(), 48);
    }

    #[test]
    fn released_map_marks_bindings_stale_once() {
        let tracker = ResourceTracker::new();
        let shared = Arc::new(Texture::new(
            "albedo",
            TextureData::solid([255; 4], true),
            &tracker,
        ));
        let maps = TextureMaps {
            base_color: Some(shared.clone()),
            ..Default::default()
        };
        let material = Material::new("m", MaterialProperties::default(), maps, &tracker);

        let built = material.texture_uploads();
        assert!(!material.bindings_stale(&built));
        shared.release().unwrap();
        assert!(material.bindings_stale(&built));

        let rebuilt = material.texture_uploads();
        assert_eq!(rebuilt, vec![u64::MAX]);
        assert!(!material.bindings_stale(&rebuilt));
    }

    #[test]
    fn instance_normal_matrix_ignores_translation() {
        let world = Matrix4::from_translation(cgmath::Vector3::new(4.0, 5.0, 6.0));
        let raw = InstanceRaw::from_world(world, true);
        assert_eq!(raw.normal, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert_eq!(raw.model[3], [4.0, 5.0, 6.0, 1.0]);
        assert_eq!(raw.receive_shadow, 1.0);
    }
}
