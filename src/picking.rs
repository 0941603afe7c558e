//! Cursor picking against mesh bounding boxes.

use crate::scene::Node;
use cgmath::{EuclideanSpace, InnerSpace, Matrix4, Point3, SquareMatrix, Vector3, Vector4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f32>,
    /// Unit length
    pub direction: Vector3<f32>,
}

impl Ray {
    pub fn at(&self, t: f32) -> Point3<f32> {
        self.origin + self.direction * t
    }
}

/// Ray from the near plane through pixel (`x`, `y`) of a `width` x `height`
/// surface, or `None` when the view-projection cannot be inverted.
pub fn screen_ray(view_proj: Matrix4<f32>, x: f64, y: f64, width: u32, height: u32) -> Option<Ray> {
    if width == 0 || height == 0 {
        return None;
    }
    let inverse = view_proj.invert()?;
    let ndc_x = (2.0 * x / width as f64 - 1.0) as f32;
    let ndc_y = (1.0 - 2.0 * y / height as f64) as f32;

    // wgpu clip space puts the near plane at z = 0
    let unproject = |z: f32| {
        let p = inverse * Vector4::new(ndc_x, ndc_y, z, 1.0);
        Point3::from_vec(p.truncate() / p.w)
    };
    let near = unproject(0.0);
    let far = unproject(1.0);
    let direction = far - near;
    if direction.magnitude2() <= f32::EPSILON {
        return None;
    }
    Some(Ray {
        origin: near,
        direction: direction.normalize(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn from_points(points: impl IntoIterator<Item = Point3<f32>>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self { min: first, max: first }, |bounds, p| Self {
            min: Point3::new(bounds.min.x.min(p.x), bounds.min.y.min(p.y), bounds.min.z.min(p.z)),
            max: Point3::new(bounds.max.x.max(p.x), bounds.max.y.max(p.y), bounds.max.z.max(p.z)),
        }))
    }

    /// World-space box enclosing this box's eight transformed corners.
    pub fn transformed(&self, m: &Matrix4<f32>) -> Self {
        let (lo, hi) = (self.min, self.max);
        let corners = (0..8).map(|i| {
            let corner = Point3::new(
                if i & 1 == 0 { lo.x } else { hi.x },
                if i & 2 == 0 { lo.y } else { hi.y },
                if i & 4 == 0 { lo.z } else { hi.z },
            );
            Point3::from_homogeneous(m * corner.to_homogeneous())
        });
        // Eight corners are always present
        Self::from_points(corners).unwrap_or(*self)
    }

    /// Slab test; the distance along `ray` to the entry point, or zero when
    /// the ray starts inside.
    pub fn intersect(&self, ray: &Ray) -> Option<f32> {
        let mut t_near = f32::MIN;
        let mut t_far = f32::MAX;

        for axis in 0..3 {
            let (origin, direction) = (ray.origin[axis], ray.direction[axis]);
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if direction.abs() < 1e-10 {
                if origin < lo || origin > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / direction;
            let (mut t1, mut t2) = ((lo - origin) * inv, (hi - origin) * inv);
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
            }
            t_near = t_near.max(t1);
            t_far = t_far.min(t2);
            if t_near > t_far || t_far < 0.0 {
                return None;
            }
        }
        Some(t_near.max(0.0))
    }
}

/// The nearest mesh node hit by `ray` among `candidates` (node and world
/// matrix pairs, as `visible_meshes` returns them).
pub fn pick<'a>(candidates: &[(&'a Node, Matrix4<f32>)], ray: &Ray) -> Option<&'a Node> {
    candidates
        .iter()
        .filter_map(|(node, world)| {
            let bounds = node.mesh.as_ref()?.geometry.bounds?;
            let t = bounds.transformed(world).intersect(ray)?;
            Some((t, *node))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, node)| node)
}
