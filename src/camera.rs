use cgmath::{Deg, InnerSpace, Matrix4, Point3, Rad, Vector3, perspective};

/// Keeps the orbit short of the poles, where `look_at` flips.
const MAX_PITCH: f32 = 1.5;

#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Point3<f32>,
    pub target: Point3<f32>,
}

impl Camera {
    pub fn new<V: Into<Point3<f32>>, T: Into<Point3<f32>>>(position: V, target: T) -> Self {
        Self {
            position: position.into(),
            target: target.into(),
        }
    }

    pub fn calc_matrix(&self) -> Matrix4<f32> {
        let forward = self.target - self.position;
        // Looking straight up or down would make the view matrix degenerate
        let up = if forward.magnitude2() > 0.0 && forward.normalize().y.abs() > 0.999 {
            Vector3::unit_z()
        } else {
            Vector3::unit_y()
        };
        Matrix4::look_at_rh(self.position, self.target, up)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Projection {
    aspect: f32,
    fovy: Rad<f32>,
    znear: f32,
    zfar: f32,
}

impl Projection {
    pub fn new<F: Into<Rad<f32>>>(width: u32, height: u32, fovy: F, znear: f32, zfar: f32) -> Self {
        Self {
            aspect: width.max(1) as f32 / height.max(1) as f32,
            fovy: fovy.into(),
            znear,
            zfar,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn fovy(&self) -> Deg<f32> {
        self.fovy.into()
    }

    pub fn calc_matrix(&self) -> Matrix4<f32> {
        OPENGL_TO_WGPU_MATRIX * perspective(self.fovy, self.aspect, self.znear, self.zfar)
    }
}

/// Drag-to-orbit and wheel zoom around the camera target.
///
/// The controller holds offsets rather than a position, so it layers on top
/// of whatever base position the scroll track or the config supplies.
#[derive(Debug, Clone, Copy)]
pub struct OrbitController {
    yaw: Rad<f32>,
    pitch: Rad<f32>,
    zoom: f32,
    rotate_speed: f32,
    zoom_step: f32,
    zoom_range: (f32, f32),
}

impl OrbitController {
    pub fn new(rotate_speed: f32, zoom_step: f32, zoom_range: (f32, f32)) -> Self {
        Self {
            yaw: Rad(0.0),
            pitch: Rad(0.0),
            zoom: 1.0,
            rotate_speed,
            zoom_step,
            zoom_range,
        }
    }

    /// Cursor moved by (`dx`, `dy`) pixels while dragging.
    pub fn rotate(&mut self, dx: f64, dy: f64) {
        self.yaw.0 -= dx as f32 * self.rotate_speed;
        let limit = 2.0 * MAX_PITCH;
        self.pitch.0 = (self.pitch.0 + dy as f32 * self.rotate_speed).clamp(-limit, limit);
    }

    /// Positive `lines` move the camera closer.
    pub fn zoom(&mut self, lines: f32) {
        let (min, max) = self.zoom_range;
        self.zoom = (self.zoom * self.zoom_step.powf(lines)).clamp(min, max);
    }

    pub fn reset(&mut self) {
        self.yaw = Rad(0.0);
        self.pitch = Rad(0.0);
        self.zoom = 1.0;
    }

    pub fn is_idle(&self) -> bool {
        self.yaw.0 == 0.0 && self.pitch.0 == 0.0 && self.zoom == 1.0
    }

    pub fn eye(&self, base: Point3<f32>, target: Point3<f32>) -> Point3<f32> {
        let offset = base - target;
        let distance = offset.magnitude();
        if self.is_idle() || distance <= f32::EPSILON {
            return base;
        }

        let yaw = offset.x.atan2(offset.z) + self.yaw.0;
        let pitch = ((offset.y / distance).clamp(-1.0, 1.0).asin() + self.pitch.0)
            .clamp(-MAX_PITCH, MAX_PITCH);
        let (sin_yaw, cos_yaw) = yaw.sin_cos();
        let (sin_pitch, cos_pitch) = pitch.sin_cos();
        target
            + Vector3::new(sin_yaw * cos_pitch, sin_pitch, cos_yaw * cos_pitch)
                * (distance * self.zoom)
    }
}

impl Default for OrbitController {
    fn default() -> Self {
        use crate::defaults;
        Self::new(
            defaults::ORBIT_ROTATE_SPEED,
            defaults::ORBIT_ZOOM_STEP,
            defaults::ORBIT_ZOOM_RANGE,
        )
    }
}

/// Left-button gesture tracking. Movement while the button is held is a
/// drag; a press and release that barely moved is a click.
#[derive(Debug, Default)]
pub struct PointerGesture {
    cursor: Option<(f64, f64)>,
    /// Pixels travelled since the press, while the button is held
    travel: Option<f64>,
}

impl PointerGesture {
    pub fn cursor(&self) -> Option<(f64, f64)> {
        self.cursor
    }

    pub fn dragging(&self) -> bool {
        self.travel.is_some()
    }

    pub fn press(&mut self) {
        if self.cursor.is_some() {
            self.travel = Some(0.0);
        }
    }

    /// Records the new cursor position; returns the delta when dragging.
    pub fn moved(&mut self, x: f64, y: f64) -> Option<(f64, f64)> {
        let last = self.cursor.replace((x, y));
        let travel = self.travel.as_mut()?;
        let (last_x, last_y) = last?;
        let (dx, dy) = (x - last_x, y - last_y);
        *travel += dx.abs() + dy.abs();
        Some((dx, dy))
    }

    /// Ends the press; true when it counts as a click.
    pub fn release(&mut self, slop: f64) -> bool {
        self.travel.take().is_some_and(|travel| travel < slop)
    }

    pub fn left(&mut self) {
        self.cursor = None;
        self.travel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_updates_aspect_and_ignores_zero() {
        let mut projection = Projection::new(800, 600, Deg(45.0), 0.1, 1000.0);
        assert!((projection.aspect() - 4.0 / 3.0).abs() < 1e-6);

        projection.resize(1920, 1080);
        assert!((projection.aspect() - 16.0 / 9.0).abs() < 1e-6);

        projection.resize(0, 1080);
        assert!((projection.aspect() - 16.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn target_lands_in_front_of_camera() {
        let camera = Camera::new((0.0, 0.0, 5.0), (0.0, 0.0, 0.0));
        let view = camera.calc_matrix();
        let origin = view * cgmath::Vector4::new(0.0, 0.0, 0.0, 1.0);
        // Right-handed view space looks down -z
        assert!((origin.z + 5.0).abs() < 1e-5);
    }

    fn close(a: Point3<f32>, b: Point3<f32>) -> bool {
        (a - b).magnitude() < 1e-4
    }

    #[test]
    fn idle_orbit_keeps_base_position() {
        let orbit = OrbitController::default();
        let base = Point3::new(1.0, 2.0, 3.0);
        assert_eq!(orbit.eye(base, Point3::new(0.0, 0.0, 0.0)), base);
    }

    #[test]
    fn horizontal_drag_swings_around_target() {
        let mut orbit = OrbitController::new(0.01, 0.9, (0.25, 4.0));
        // -dx turns yaw positive
        orbit.rotate(-(std::f64::consts::FRAC_PI_2 / 0.01), 0.0);
        let eye = orbit.eye(Point3::new(0.0, 0.0, 5.0), Point3::new(0.0, 0.0, 0.0));
        assert!(close(eye, Point3::new(5.0, 0.0, 0.0)), "{eye:?}");

        let target = Point3::new(1.0, 1.0, 1.0);
        let eye = orbit.eye(Point3::new(1.0, 1.0, 6.0), target);
        assert!(((eye - target).magnitude() - 5.0).abs() < 1e-4);
    }

    #[test]
    fn vertical_drag_stops_short_of_the_pole() {
        let mut orbit = OrbitController::new(0.01, 0.9, (0.25, 4.0));
        orbit.rotate(0.0, 10_000.0);
        let eye = orbit.eye(Point3::new(0.0, 0.0, 5.0), Point3::new(0.0, 0.0, 0.0));
        assert!((eye.y - 5.0 * MAX_PITCH.sin()).abs() < 1e-4);
        assert!(eye.z > 0.0);
    }

    #[test]
    fn zoom_scales_distance_within_range() {
        let mut orbit = OrbitController::new(0.01, 0.5, (0.25, 4.0));
        orbit.zoom(1.0);
        let eye = orbit.eye(Point3::new(0.0, 0.0, 8.0), Point3::new(0.0, 0.0, 0.0));
        assert!(close(eye, Point3::new(0.0, 0.0, 4.0)));

        orbit.zoom(10.0);
        let eye = orbit.eye(Point3::new(0.0, 0.0, 8.0), Point3::new(0.0, 0.0, 0.0));
        assert!(close(eye, Point3::new(0.0, 0.0, 2.0)));

        orbit.reset();
        assert!(orbit.is_idle());
    }

    #[test]
    fn short_press_is_a_click_and_long_drag_is_not() {
        let mut pointer = PointerGesture::default();
        pointer.press();
        assert!(!pointer.dragging(), "no cursor yet");

        assert_eq!(pointer.moved(10.0, 10.0), None);
        pointer.press();
        assert_eq!(pointer.moved(11.0, 10.0), Some((1.0, 0.0)));
        assert!(pointer.release(4.0));
        assert!(!pointer.dragging());

        pointer.press();
        pointer.moved(30.0, 10.0);
        pointer.moved(30.0, 50.0);
        assert!(!pointer.release(4.0));
        assert_eq!(pointer.cursor(), Some((30.0, 50.0)));
        // Hovering again reports no drag
        assert_eq!(pointer.moved(31.0, 50.0), None);
    }
}
