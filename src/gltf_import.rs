//! glTF 2.0 (binary or embedded JSON) into a scene-graph root.

use crate::error::LoadError;
use crate::model::{
    Geometry, GeometryGroup, Material, MaterialProperties, Materials, Mesh, ModelVertex,
    TextureMaps,
};
use crate::resource::ResourceTracker;
use crate::scene::{Node, Transform};
use crate::texture::{Texture, TextureData};
use cgmath::{InnerSpace, Quaternion, Vector3};
use std::collections::HashMap;
use std::sync::Arc;

pub const DRACO_EXTENSION: &str = "KHR_draco_mesh_compression";

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Reported when a file needs a Draco decoder.
    pub draco_decoder_path: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            draco_decoder_path: crate::defaults::DRACO_DECODER_PATH.to_string(),
        }
    }
}

/// Parses `bytes` and builds an owned node tree whose resources are counted
/// by `tracker`.
pub fn import_model(
    url: &str,
    bytes: &[u8],
    tracker: &ResourceTracker,
    options: &ImportOptions,
) -> Result<Node, LoadError> {
    // Validation rejects required extensions the crate does not know, so
    // look for Draco before the full import.
    let raw = gltf::Gltf::from_slice_without_validation(bytes)
        .map_err(|err| LoadError::parse(url, err))?;
    if raw.extensions_required().any(|ext| ext == DRACO_EXTENSION) {
        return Err(LoadError::UnsupportedCompression {
            url: url.to_string(),
            decoder_path: options.draco_decoder_path.clone(),
        });
    }

    let (document, buffers, images) =
        gltf::import_slice(bytes).map_err(|err| LoadError::parse(url, err))?;

    let mut builder = Builder {
        url,
        tracker,
        buffers: &buffers,
        images: &images,
        textures: HashMap::new(),
        materials: HashMap::new(),
        meshes: HashMap::new(),
    };

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| LoadError::EmptyScene {
            url: url.to_string(),
        })?;

    let mut root = Node::new(scene.name().unwrap_or(url));
    for node in scene.nodes() {
        root.add_child(builder.node(&node)?);
    }

    if root.mesh_count() == 0 {
        return Err(LoadError::EmptyScene {
            url: url.to_string(),
        });
    }

    log::info!(
        "Imported '{}': {} nodes, {} geometries, {} materials, {} textures",
        url,
        root.node_count(),
        builder.meshes.len(),
        builder.materials.len(),
        builder.textures.len()
    );
    Ok(root)
}

struct Builder<'a> {
    url: &'a str,
    tracker: &'a ResourceTracker,
    buffers: &'a [gltf::buffer::Data],
    images: &'a [gltf::image::Data],
    /// Keyed by image index and color space, so maps that point at the same
    /// image (metallic-roughness) share one texture.
    textures: HashMap<(usize, bool), Arc<Texture>>,
    materials: HashMap<Option<usize>, Arc<Material>>,
    meshes: HashMap<usize, Option<Mesh>>,
}

impl Builder<'_> {
    fn node(&mut self, node: &gltf::Node) -> Result<Node, LoadError> {
        let name = node
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("node{}", node.index()));
        let mut out = Node::new(name);

        let (translation, rotation, scale) = node.transform().decomposed();
        out.transform = Transform {
            position: translation.into(),
            rotation: Quaternion::new(rotation[3], rotation[0], rotation[1], rotation[2]),
            scale: scale.into(),
        };

        if let Some(mesh) = node.mesh() {
            out.mesh = self.mesh(&mesh)?;
        }

        for child in node.children() {
            out.add_child(self.node(&child)?);
        }
        Ok(out)
    }

    /// All triangle primitives of a glTF mesh become one geometry with one
    /// group per primitive.
    fn mesh(&mut self, mesh: &gltf::Mesh) -> Result<Option<Mesh>, LoadError> {
        if let Some(done) = self.meshes.get(&mesh.index()) {
            return Ok(done.clone());
        }

        let label = mesh
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}#mesh{}", self.url, mesh.index()));

        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut groups = Vec::new();
        let mut materials = Vec::new();

        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::warn!(
                    "{}: skipping {:?} primitive in '{}'",
                    self.url,
                    primitive.mode(),
                    label
                );
                continue;
            }

            let buffers = self.buffers;
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| &d.0[..]));
            let Some(positions) = reader.read_positions() else {
                log::warn!("{}: primitive without positions in '{}'", self.url, label);
                continue;
            };
            let positions: Vec<[f32; 3]> = positions.collect();
            let tex_coords: Vec<[f32; 2]> = reader
                .read_tex_coords(0)
                .map(|t| t.into_f32().collect())
                .unwrap_or_default();
            let local_indices: Vec<u32> = match reader.read_indices() {
                Some(read) => read.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };
            if let Some(&bad) = local_indices.iter().find(|&&i| i as usize >= positions.len()) {
                return Err(LoadError::parse(
                    self.url,
                    format!("index {bad} out of range in mesh '{label}'"),
                ));
            }
            let normals: Vec<[f32; 3]> = match reader.read_normals() {
                Some(read) => read.collect(),
                None => vertex_normals(&positions, &local_indices),
            };
            let tangents: Vec<[f32; 4]> = match reader.read_tangents() {
                Some(read) => read.collect(),
                None => vertex_tangents(&positions, &normals, &tex_coords, &local_indices),
            };

            let base = vertices.len() as u32;
            vertices.extend(positions.iter().enumerate().map(|(i, position)| ModelVertex {
                position: *position,
                tex_coords: tex_coords.get(i).copied().unwrap_or([0.0, 0.0]),
                normal: normals.get(i).copied().unwrap_or([0.0, 1.0, 0.0]),
                tangent: tangents.get(i).copied().unwrap_or([1.0, 0.0, 0.0, 1.0]),
            }));

            let start = indices.len() as u32;
            indices.extend(local_indices.iter().map(|i| base + i));
            groups.push(GeometryGroup {
                indices: start..indices.len() as u32,
                material_index: materials.len(),
            });
            materials.push(self.material(&primitive.material())?);
        }

        let result = if groups.is_empty() {
            None
        } else {
            let geometry = Arc::new(Geometry::with_groups(
                label,
                vertices,
                indices,
                groups,
                self.tracker,
            ));
            let materials = if materials.len() == 1 {
                Materials::Single(materials.remove(0))
            } else {
                Materials::Multi(materials)
            };
            Some(Mesh {
                geometry,
                materials,
            })
        };

        self.meshes.insert(mesh.index(), result.clone());
        Ok(result)
    }

    fn material(&mut self, material: &gltf::Material) -> Result<Arc<Material>, LoadError> {
        if let Some(done) = self.materials.get(&material.index()) {
            return Ok(done.clone());
        }

        let pbr = material.pbr_metallic_roughness();
        let emissive = material.emissive_factor();
        let properties = MaterialProperties {
            color: pbr.base_color_factor(),
            emissive: [emissive[0], emissive[1], emissive[2], 1.0],
            metallic: pbr.metallic_factor(),
            roughness: pbr.roughness_factor(),
            normal_scale: material.normal_texture().map_or(1.0, |info| info.scale()),
            occlusion_strength: material
                .occlusion_texture()
                .map_or(1.0, |info| info.strength()),
            ..Default::default()
        };

        let metallic_roughness = pbr
            .metallic_roughness_texture()
            .map(|info| self.texture(&info.texture(), false))
            .transpose()?;
        let maps = TextureMaps {
            base_color: pbr
                .base_color_texture()
                .map(|info| self.texture(&info.texture(), true))
                .transpose()?,
            normal: material
                .normal_texture()
                .map(|info| self.texture(&info.texture(), false))
                .transpose()?,
            roughness: metallic_roughness.clone(),
            metalness: metallic_roughness,
            emissive: material
                .emissive_texture()
                .map(|info| self.texture(&info.texture(), true))
                .transpose()?,
            occlusion: material
                .occlusion_texture()
                .map(|info| self.texture(&info.texture(), false))
                .transpose()?,
        };

        let name = material
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| match material.index() {
                Some(index) => format!("{}#material{}", self.url, index),
                None => format!("{}#default_material", self.url),
            });
        let mut out = Material::new(name, properties, maps, self.tracker);
        out.transparent = material.alpha_mode() == gltf::material::AlphaMode::Blend;
        out.double_sided = material.double_sided();

        let out = Arc::new(out);
        self.materials.insert(material.index(), out.clone());
        Ok(out)
    }

    fn texture(&mut self, texture: &gltf::Texture, srgb: bool) -> Result<Arc<Texture>, LoadError> {
        let image_index = texture.source().index();
        if let Some(done) = self.textures.get(&(image_index, srgb)) {
            return Ok(done.clone());
        }

        let image = self.images.get(image_index).ok_or_else(|| {
            LoadError::parse(self.url, format!("missing image {image_index}"))
        })?;
        let data = TextureData {
            width: image.width,
            height: image.height,
            pixels: to_rgba8(image),
            srgb,
        };
        let name = texture
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}#image{}", self.url, image_index));

        let out = Arc::new(Texture::new(name, data, self.tracker));
        self.textures.insert((image_index, srgb), out.clone());
        Ok(out)
    }
}

fn to_rgba8(image: &gltf::image::Data) -> Vec<u8> {
    use gltf::image::Format;

    let pixels = &image.pixels;
    let count = image.width as usize * image.height as usize;
    let mut out = Vec::with_capacity(count * 4);

    let float = |bytes: &[u8]| {
        let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (value.clamp(0.0, 1.0) * 255.0).round() as u8
    };

    match image.format {
        Format::R8G8B8A8 => out.extend_from_slice(pixels),
        Format::R8G8B8 => {
            for px in pixels.chunks_exact(3) {
                out.extend_from_slice(&[px[0], px[1], px[2], 255]);
            }
        }
        // Two-channel images are luminance plus alpha
        Format::R8G8 => {
            for px in pixels.chunks_exact(2) {
                out.extend_from_slice(&[px[0], px[0], px[0], px[1]]);
            }
        }
        Format::R8 => {
            for &r in pixels {
                out.extend_from_slice(&[r, r, r, 255]);
            }
        }
        // 16-bit channels are little-endian; keep the high byte
        Format::R16 => {
            for px in pixels.chunks_exact(2) {
                out.extend_from_slice(&[px[1], px[1], px[1], 255]);
            }
        }
        Format::R16G16 => {
            for px in pixels.chunks_exact(4) {
                out.extend_from_slice(&[px[1], px[1], px[1], px[3]]);
            }
        }
        Format::R16G16B16 => {
            for px in pixels.chunks_exact(6) {
                out.extend_from_slice(&[px[1], px[3], px[5], 255]);
            }
        }
        Format::R16G16B16A16 => {
            for px in pixels.chunks_exact(8) {
                out.extend_from_slice(&[px[1], px[3], px[5], px[7]]);
            }
        }
        Format::R32G32B32FLOAT => {
            for px in pixels.chunks_exact(12) {
                out.extend_from_slice(&[float(&px[0..4]), float(&px[4..8]), float(&px[8..12]), 255]);
            }
        }
        Format::R32G32B32A32FLOAT => {
            for px in pixels.chunks_exact(16) {
                out.extend_from_slice(&[
                    float(&px[0..4]),
                    float(&px[4..8]),
                    float(&px[8..12]),
                    float(&px[12..16]),
                ]);
            }
        }
    }

    out.resize(count * 4, 255);
    out
}

/// Area-weighted vertex normals for primitives that ship without them.
fn vertex_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vector3::new(0.0f32, 0.0, 0.0); positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| i as usize);
        let (pa, pb, pc) = (
            Vector3::from(positions[a]),
            Vector3::from(positions[b]),
            Vector3::from(positions[c]),
        );
        let n = (pb - pa).cross(pc - pa);
        normals[a] += n;
        normals[b] += n;
        normals[c] += n;
    }
    normals
        .into_iter()
        .map(|n| {
            if n.magnitude2() > 0.0 {
                n.normalize().into()
            } else {
                [0.0, 1.0, 0.0]
            }
        })
        .collect()
}

// Per-triangle UV gradients accumulated per vertex, then orthogonalized
// against the normal.
fn vertex_tangents(
    positions: &[[f32; 3]],
    normals: &[[f32; 3]],
    tex_coords: &[[f32; 2]],
    indices: &[u32],
) -> Vec<[f32; 4]> {
    let zero = Vector3::new(0.0f32, 0.0, 0.0);
    let mut along_u = vec![zero; positions.len()];
    let mut along_v = vec![zero; positions.len()];
    if tex_coords.len() == positions.len() {
        for tri in indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| i as usize);
            let e1 = Vector3::from(positions[b]) - Vector3::from(positions[a]);
            let e2 = Vector3::from(positions[c]) - Vector3::from(positions[a]);
            let (du1, dv1) = (tex_coords[b][0] - tex_coords[a][0], tex_coords[b][1] - tex_coords[a][1]);
            let (du2, dv2) = (tex_coords[c][0] - tex_coords[a][0], tex_coords[c][1] - tex_coords[a][1]);
            let det = du1 * dv2 - du2 * dv1;
            if det.abs() < 1e-12 {
                continue;
            }
            let s = (e1 * dv2 - e2 * dv1) / det;
            let t = (e2 * du1 - e1 * du2) / det;
            for i in [a, b, c] {
                along_u[i] += s;
                along_v[i] += t;
            }
        }
    }

    normals
        .iter()
        .zip(along_u.iter().zip(&along_v))
        .map(|(&n, (&u, &v))| {
            let n = Vector3::from(n);
            let tangent = u - n * n.dot(u);
            let tangent = if tangent.magnitude2() > 1e-12 {
                tangent.normalize()
            } else {
                // No usable UVs; any direction in the surface plane will do
                let axis = if n.x.abs() < 0.9 { Vector3::unit_x() } else { Vector3::unit_y() };
                n.cross(axis).normalize()
            };
            let handedness = if n.cross(tangent).dot(v) < 0.0 { -1.0 } else { 1.0 };
            tangent.extend(handedness).into()
        })
        .collect()
}
