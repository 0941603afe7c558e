use cgmath::{InnerSpace, Matrix4, Point3, SquareMatrix, Vector3};
use serde::{Deserialize, Serialize};

pub const MAX_DIRECTIONAL_LIGHTS: usize = 4;

/// Half-extent of the orthographic volume the shadow map covers.
pub const SHADOW_EXTENT: f32 = 10.0;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientLight {
    pub color: [f32; 3],
    pub intensity: f32,
}

impl Default for AmbientLight {
    fn default() -> Self {
        // 0x404040
        let c = 0x40 as f32 / 255.0;
        Self {
            color: [c, c, c],
            intensity: 1.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionalLight {
    pub color: [f32; 3],
    pub intensity: f32,
    pub position: [f32; 3],
    pub target: [f32; 3],
    pub cast_shadow: bool,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 0.5,
            position: [5.0, 5.0, 5.0],
            target: [0.0, 0.0, 0.0],
            cast_shadow: true,
        }
    }
}

impl DirectionalLight {
    /// Unit vector pointing from the surface towards the light.
    pub fn direction(&self) -> Vector3<f32> {
        let dir = Vector3::from(self.position) - Vector3::from(self.target);
        if dir.magnitude2() == 0.0 {
            Vector3::unit_y()
        } else {
            dir.normalize()
        }
    }

    pub fn shadow_view_proj(&self) -> Matrix4<f32> {
        let eye = Point3::from(self.position);
        let target = Point3::from(self.target);
        let up = if self.direction().y.abs() > 0.99 {
            Vector3::unit_z()
        } else {
            Vector3::unit_y()
        };
        let view = Matrix4::look_at_rh(eye, target, up);
        let distance = (eye - target).magnitude();
        let proj = cgmath::ortho(
            -SHADOW_EXTENT,
            SHADOW_EXTENT,
            -SHADOW_EXTENT,
            SHADOW_EXTENT,
            0.1,
            distance + SHADOW_EXTENT * 2.0,
        );
        crate::camera::OPENGL_TO_WGPU_MATRIX * proj * view
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectionalLightRaw {
    /// xyz direction towards the light, w unused
    direction: [f32; 4],
    /// rgb premultiplied by intensity
    color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightsUniform {
    ambient: [f32; 4],
    lights: [DirectionalLightRaw; MAX_DIRECTIONAL_LIGHTS],
    shadow_view_proj: [[f32; 4]; 4],
    num_lights: u32,
    /// Index of the shadow-casting light, or u32::MAX for none
    shadow_light: u32,
    _padding: [u32; 2],
}

#[derive(Debug, Clone)]
pub struct LightSet {
    pub ambient: AmbientLight,
    lights: [DirectionalLight; MAX_DIRECTIONAL_LIGHTS],
    active_mask: u32,
    dirty: bool,
}

impl Default for LightSet {
    fn default() -> Self {
        Self::with_lights(AmbientLight::default(), &[DirectionalLight::default()])
    }
}

impl LightSet {
    pub fn new(ambient: AmbientLight) -> Self {
        Self {
            ambient,
            lights: [DirectionalLight::default(); MAX_DIRECTIONAL_LIGHTS],
            active_mask: 0,
            dirty: true,
        }
    }

    pub fn with_lights(ambient: AmbientLight, lights: &[DirectionalLight]) -> Self {
        let mut set = Self::new(ambient);
        for light in lights {
            if set.add_light(*light).is_none() {
                log::warn!(
                    "Ignoring directional light beyond the limit of {}",
                    MAX_DIRECTIONAL_LIGHTS
                );
            }
        }
        set
    }

    pub fn add_light(&mut self, light: DirectionalLight) -> Option<usize> {
        for i in 0..MAX_DIRECTIONAL_LIGHTS {
            if self.active_mask & (1 << i) == 0 {
                self.lights[i] = light;
                self.active_mask |= 1 << i;
                self.dirty = true;
                return Some(i);
            }
        }
        None
    }

    pub fn remove_light(&mut self, index: usize) {
        if index < MAX_DIRECTIONAL_LIGHTS {
            self.active_mask &= !(1 << index);
            self.dirty = true;
        }
    }

    pub fn get_light(&self, index: usize) -> Option<&DirectionalLight> {
        self.is_active(index).then(|| &self.lights[index])
    }

    pub fn set_ambient(&mut self, ambient: AmbientLight) {
        self.ambient = ambient;
        self.dirty = true;
    }

    pub fn is_active(&self, index: usize) -> bool {
        index < MAX_DIRECTIONAL_LIGHTS && (self.active_mask & (1 << index)) != 0
    }

    pub fn num_lights(&self) -> u32 {
        self.active_mask.count_ones()
    }

    pub fn active(&self) -> impl Iterator<Item = &DirectionalLight> {
        (0..MAX_DIRECTIONAL_LIGHTS).filter_map(|i| self.get_light(i))
    }

    pub fn shadow_caster(&self) -> Option<&DirectionalLight> {
        self.active().find(|light| light.cast_shadow)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Packs the set for the GPU. `irradiance` is added to the ambient term
    /// when an environment map is applied.
    pub fn sync_to_gpu(&self, irradiance: Option<[f32; 3]>) -> LightsUniform {
        let mut lights = [DirectionalLightRaw::default(); MAX_DIRECTIONAL_LIGHTS];
        let mut shadow_light = u32::MAX;
        let mut shadow_view_proj = Matrix4::identity();

        for (write_idx, light) in self.active().enumerate() {
            let dir = light.direction();
            lights[write_idx] = DirectionalLightRaw {
                direction: [dir.x, dir.y, dir.z, 0.0],
                color: [
                    light.color[0] * light.intensity,
                    light.color[1] * light.intensity,
                    light.color[2] * light.intensity,
                    1.0,
                ],
            };
            if light.cast_shadow && shadow_light == u32::MAX {
                shadow_light = write_idx as u32;
                shadow_view_proj = light.shadow_view_proj();
            }
        }

        let extra = irradiance.unwrap_or([0.0; 3]);
        let a = &self.ambient;
        LightsUniform {
            ambient: [
                a.color[0] * a.intensity + extra[0],
                a.color[1] * a.intensity + extra[1],
                a.color[2] * a.intensity + extra[2],
                1.0,
            ],
            lights,
            shadow_view_proj: shadow_view_proj.into(),
            num_lights: self.num_lights(),
            shadow_light,
            _padding: [0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_is_dim_ambient_plus_one_shadow_caster() {
        let set = LightSet::default();
        assert_eq!(set.num_lights(), 1);
        let sun = set.shadow_caster().unwrap();
        assert_eq!(sun.position, [5.0, 5.0, 5.0]);
        assert_eq!(sun.intensity, 0.5);
        assert!((set.ambient.color[0] - 64.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn lights_beyond_capacity_are_rejected() {
        let mut set = LightSet::new(AmbientLight::default());
        for _ in 0..MAX_DIRECTIONAL_LIGHTS {
            assert!(set.add_light(DirectionalLight::default()).is_some());
        }
        assert!(set.add_light(DirectionalLight::default()).is_none());

        set.remove_light(1);
        assert_eq!(set.add_light(DirectionalLight::default()), Some(1));
    }

    #[test]
    fn gpu_packing_compacts_active_lights() {
        let mut set = LightSet::new(AmbientLight::default());
        set.add_light(DirectionalLight {
            cast_shadow: false,
            ..Default::default()
        });
        set.add_light(DirectionalLight {
            intensity: 2.0,
            ..Default::default()
        });
        set.remove_light(0);

        let raw = set.sync_to_gpu(None);
        assert_eq!(raw.num_lights, 1);
        assert_eq!(raw.shadow_light, 0);
        assert_eq!(raw.lights[0].color, [2.0, 2.0, 2.0, 1.0]);
    }

    #[test]
    fn irradiance_brightens_ambient() {
        let set = LightSet::new(AmbientLight {
            color: [0.1, 0.1, 0.1],
            intensity: 1.0,
        });
        let raw = set.sync_to_gpu(Some([0.2, 0.3, 0.4]));
        assert!((raw.ambient[0] - 0.3).abs() < 1e-6);
        assert!((raw.ambient[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn direction_points_towards_light() {
        let light = DirectionalLight::default();
        let dir = light.direction();
        let expected = 1.0 / 3f32.sqrt();
        assert!((dir.x - expected).abs() < 1e-6);
        assert!((dir.y - expected).abs() < 1e-6);
    }
}
