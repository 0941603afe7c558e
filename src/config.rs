use crate::defaults;
use crate::environment::EnvironmentSource;
use crate::light::{AmbientLight, DirectionalLight};
use crate::loader::{PlaceholderStyle, Theme};
use crate::scene::Fog;
use crate::scroll::ScrollTrackConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub cast_shadow: bool,
    #[serde(default)]
    pub receive_shadow: bool,
}

impl GalleryEntry {
    fn sample(
        url: &str,
        title: &str,
        description: &str,
        href: &str,
        shadows: bool,
    ) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            href: Some(href.to_string()),
            cast_shadow: shadows,
            receive_shadow: shadows,
        }
    }
}

fn sample_gallery() -> Vec<GalleryEntry> {
    vec![
        GalleryEntry::sample(
            "/models/laptop.glb",
            "Laptop",
            "A high-quality 3D model of a modern laptop. Ideal for showcasing product features or creating realistic office environments.",
            "https://example.com/laptop-details",
            true,
        ),
        GalleryEntry::sample(
            "/models/chair.glb",
            "Modern Chair",
            "A stylish 3D model of a modern chair. Perfect for interior design visualizations and furniture showcases.",
            "https://example.com/chair-details",
            true,
        ),
        GalleryEntry::sample(
            "/models/plant.glb",
            "Office Plant",
            "A detailed 3D model of an office plant. Use it to add a touch of greenery and realism to your 3D scenes.",
            "https://example.com/plant-details",
            false,
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportSettings {
    pub fovy_deg: f32,
    pub znear: f32,
    pub zfar: f32,
    pub camera_position: [f32; 3],
    pub camera_target: [f32; 3],
    pub exposure: f32,
    pub max_pixel_ratio: f64,
    pub msaa_samples: u32,
    pub shadow_map_size: u32,
    pub background: [f32; 3],
    pub fog: Option<Fog>,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            fovy_deg: defaults::CAMERA_FOVY_DEG,
            znear: defaults::CAMERA_ZNEAR,
            zfar: defaults::CAMERA_ZFAR,
            camera_position: defaults::CAMERA_POSITION,
            camera_target: [0.0, 0.0, 0.0],
            exposure: defaults::TONE_MAPPING_EXPOSURE,
            max_pixel_ratio: defaults::MAX_PIXEL_RATIO,
            msaa_samples: defaults::MSAA_SAMPLES,
            shadow_map_size: defaults::SHADOW_MAP_SIZE,
            background: [0.0, 0.0, 0.0],
            fog: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    pub ambient: AmbientLight,
    pub directional: Vec<DirectionalLight>,
    pub environment: Option<EnvironmentSource>,
    pub environment_intensity: f32,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            ambient: AmbientLight::default(),
            directional: vec![DirectionalLight::default()],
            environment: None,
            environment_intensity: defaults::ENVIRONMENT_INTENSITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowcaseConfig {
    pub gallery: Vec<GalleryEntry>,
    pub viewport: ViewportSettings,
    pub lighting: LightingConfig,
    pub placeholder: PlaceholderStyle,
    pub theme: Theme,
    pub draco_decoder_path: String,
    pub scroll: ScrollTrackConfig,
    /// Rotate the shown model around its y axis every frame
    pub idle_rotation: bool,
}

impl Default for ShowcaseConfig {
    fn default() -> Self {
        Self {
            gallery: sample_gallery(),
            viewport: ViewportSettings::default(),
            lighting: LightingConfig::default(),
            placeholder: PlaceholderStyle::default(),
            theme: Theme::default(),
            draco_decoder_path: defaults::DRACO_DECODER_PATH.to_string(),
            scroll: ScrollTrackConfig::default(),
            idle_rotation: true,
        }
    }
}

impl ShowcaseConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads the config at `url`, falling back to the defaults if it is
    /// missing or malformed.
    pub async fn load(url: &str) -> Self {
        let json = match crate::resources::load_string(url).await {
            Ok(json) => json,
            Err(err) => {
                log::warn!("No showcase config at '{}' ({:#}), using defaults", url, err);
                return Self::default();
            }
        };
        match Self::from_json(&json) {
            Ok(config) => {
                log::info!("Loaded showcase config with {} gallery entries", config.gallery.len());
                config
            }
            Err(err) => {
                log::warn!("Invalid showcase config '{}': {}", url, err);
                Self::default()
            }
        }
    }
}
