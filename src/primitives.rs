//! Procedural meshes used for loader placeholders.

use crate::model::ModelVertex;
use cgmath::{InnerSpace, Vector3};
use std::f32::consts::PI;

/// UV sphere centred on the origin. Triangles wind counter-clockwise when
/// seen from outside.
pub fn sphere(radius: f32, width_segments: u32, height_segments: u32) -> (Vec<ModelVertex>, Vec<u32>) {
    let width_segments = width_segments.max(3);
    let height_segments = height_segments.max(2);

    let mut vertices = Vec::with_capacity(((width_segments + 1) * (height_segments + 1)) as usize);
    for iy in 0..=height_segments {
        let v = iy as f32 / height_segments as f32;
        for ix in 0..=width_segments {
            let u = ix as f32 / width_segments as f32;
            let normal = [
                -(u * 2.0 * PI).cos() * (v * PI).sin(),
                (v * PI).cos(),
                (u * 2.0 * PI).sin() * (v * PI).sin(),
            ];
            let (sin, cos) = (u * 2.0 * PI).sin_cos();
            vertices.push(ModelVertex {
                position: normal.map(|c| c * radius),
                tex_coords: [u, v],
                normal,
                tangent: [sin, 0.0, cos, 1.0],
            });
        }
    }

    let row = width_segments + 1;
    let mut indices = Vec::new();
    for iy in 0..height_segments {
        for ix in 0..width_segments {
            let a = iy * row + ix + 1;
            let b = iy * row + ix;
            let c = (iy + 1) * row + ix;
            let d = (iy + 1) * row + ix + 1;
            // The pole rows collapse to a point; skip their degenerate halves
            if iy != 0 {
                indices.extend([a, b, d]);
            }
            if iy != height_segments - 1 {
                indices.extend([b, c, d]);
            }
        }
    }

    (vertices, indices)
}

/// Axis-aligned box centred on the origin, four vertices per face so each
/// face gets a flat normal.
pub fn cuboid(width: f32, height: f32, depth: f32) -> (Vec<ModelVertex>, Vec<u32>) {
    let half = Vector3::new(width, height, depth) / 2.0;
    let x = Vector3::unit_x();
    let y = Vector3::unit_y();
    let z = Vector3::unit_z();

    // (normal, u, v) with u x v == normal
    let faces = [(x, -z, y), (-x, z, y), (y, x, -z), (-y, x, z), (z, x, y), (-z, -x, y)];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let extent = |axis: Vector3<f32>| {
            axis.x.abs() * half.x + axis.y.abs() * half.y + axis.z.abs() * half.z
        };
        let centre = normal * extent(normal);
        let du = u * extent(u);
        let dv = v * extent(v);

        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = centre + du * su + dv * sv;
            vertices.push(ModelVertex {
                position: position.into(),
                tex_coords: [(su + 1.0) / 2.0, (1.0 - sv) / 2.0],
                normal: normal.normalize().into(),
                tangent: u.extend(1.0).into(),
            });
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_outward_winding(vertices: &[ModelVertex], indices: &[u32]) {
        for tri in indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vector3::from(vertices[i as usize].position));
            let face_normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(face_normal.dot(centroid) > 0.0, "triangle {tri:?} faces inwards");
        }
    }

    #[test]
    fn sphere_counts_and_radius() {
        let (vertices, indices) = sphere(1.0, 32, 32);
        assert_eq!(vertices.len(), 33 * 33);
        assert_eq!(indices.len(), 6 * 32 * 31);
        for vertex in &vertices {
            let r = Vector3::from(vertex.position).magnitude();
            assert!((r - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn sphere_faces_outwards() {
        let (vertices, indices) = sphere(2.0, 8, 6);
        assert_outward_winding(&vertices, &indices);
    }

    #[test]
    fn cuboid_counts_and_extent() {
        let (vertices, indices) = cuboid(2.0, 4.0, 6.0);
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        let max_y = vertices
            .iter()
            .map(|v| v.position[1])
            .fold(f32::MIN, f32::max);
        assert_eq!(max_y, 2.0);
    }

    #[test]
    fn tangents_are_perpendicular_to_normals() {
        let (sphere_vertices, _) = sphere(1.0, 8, 6);
        let (box_vertices, _) = cuboid(1.0, 2.0, 3.0);
        for vertex in sphere_vertices.iter().chain(&box_vertices) {
            let t = Vector3::new(vertex.tangent[0], vertex.tangent[1], vertex.tangent[2]);
            assert!((t.magnitude() - 1.0).abs() < 1e-5);
            assert!(t.dot(Vector3::from(vertex.normal)).abs() < 1e-5);
        }
    }

    #[test]
    fn cuboid_faces_outwards() {
        let (vertices, indices) = cuboid(1.0, 1.0, 1.0);
        assert_outward_winding(&vertices, &indices);
    }
}
