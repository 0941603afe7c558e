/// Centralized default values for the showcase viewport and its assets.
/// Config fields fall back to these when absent.

/// Showcase configuration, relative to the `res` directory
pub const CONFIG_PATH: &str = "showcase.json";

/// Where a Draco decoder would be served from
pub const DRACO_DECODER_PATH: &str = "/draco/";

/// Vertical field of view, in degrees
pub const CAMERA_FOVY_DEG: f32 = 45.0;
pub const CAMERA_ZNEAR: f32 = 0.1;
pub const CAMERA_ZFAR: f32 = 1000.0;
pub const CAMERA_POSITION: [f32; 3] = [0.0, 0.0, 5.0];

pub const SHADOW_MAP_SIZE: u32 = 2048;

/// Multisample count for the color and depth targets
pub const MSAA_SAMPLES: u32 = 4;

/// Radians per frame of idle rotation around the y axis
pub const IDLE_ROTATION: f32 = 0.01;

/// Upper bound on the device pixel ratio the browser canvas renders at
pub const MAX_PIXEL_RATIO: f64 = 2.0;

pub const TONE_MAPPING_EXPOSURE: f32 = 1.0;

/// Environment contribution multiplier
pub const ENVIRONMENT_INTENSITY: f32 = 1.0;

/// Instance buffer slots allocated up front; the buffer grows on demand
pub const INITIAL_INSTANCE_CAPACITY: usize = 256;

/// Radians of orbit per pixel dragged
pub const ORBIT_ROTATE_SPEED: f32 = 0.005;

/// Distance factor per wheel line when zooming
pub const ORBIT_ZOOM_STEP: f32 = 0.9;
pub const ORBIT_ZOOM_RANGE: (f32, f32) = (0.25, 4.0);

/// Cursor travel, in physical pixels, below which a press and release is a click
pub const CLICK_SLOP: f64 = 4.0;
