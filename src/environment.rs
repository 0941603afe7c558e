use crate::resources;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Cube map face suffixes, in +x -x +y -y +z -z order.
pub const CUBE_FACES: [&str; 6] = ["px", "nx", "py", "ny", "pz", "nz"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentSource {
    /// `<prefix>px.png`, `<prefix>nx.png`, ...
    CubeFaces { prefix: String },
    /// A single equirectangular Radiance HDR file.
    Hdr { url: String },
}

/// Environment map reduced to its average radiance, which the viewport adds
/// to the ambient term.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentLight {
    pub source: String,
    pub irradiance: [f32; 3],
    pub intensity: f32,
}

impl EnvironmentLight {
    pub fn ambient(&self) -> [f32; 3] {
        self.irradiance.map(|c| c * self.intensity)
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn average(img: &image::Rgb32FImage, srgb: bool) -> [f32; 3] {
    let count = (img.width() as usize * img.height() as usize).max(1) as f32;
    let mut sum = [0.0f32; 3];
    for pixel in img.pixels() {
        for (acc, c) in sum.iter_mut().zip(pixel.0) {
            *acc += if srgb { srgb_to_linear(c) } else { c };
        }
    }
    sum.map(|c| c / count)
}

/// Averages six sRGB cube faces into a linear irradiance estimate.
pub fn irradiance_from_faces(faces: &[Vec<u8>]) -> anyhow::Result<[f32; 3]> {
    anyhow::ensure!(
        faces.len() == CUBE_FACES.len(),
        "expected {} cube faces, got {}",
        CUBE_FACES.len(),
        faces.len()
    );

    let mut sum = [0.0f32; 3];
    for (bytes, face) in faces.iter().zip(CUBE_FACES) {
        let img = image::load_from_memory(bytes)
            .with_context(|| format!("decoding cube face {face}"))?
            .to_rgb32f();
        let avg = average(&img, true);
        for (acc, c) in sum.iter_mut().zip(avg) {
            *acc += c;
        }
    }
    Ok(sum.map(|c| c / CUBE_FACES.len() as f32))
}

pub fn irradiance_from_hdr(bytes: &[u8]) -> anyhow::Result<[f32; 3]> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Hdr)
        .context("decoding HDR environment")?
        .to_rgb32f();
    Ok(average(&img, false))
}

pub async fn load_environment(
    source: &EnvironmentSource,
    intensity: f32,
) -> anyhow::Result<EnvironmentLight> {
    let (label, irradiance) = match source {
        EnvironmentSource::CubeFaces { prefix } => {
            let mut faces = Vec::with_capacity(CUBE_FACES.len());
            for face in CUBE_FACES {
                let url = format!("{prefix}{face}.png");
                faces.push(
                    resources::load_binary(&url)
                        .await
                        .with_context(|| format!("loading {url}"))?,
                );
            }
            (prefix.clone(), irradiance_from_faces(&faces)?)
        }
        EnvironmentSource::Hdr { url } => {
            let bytes = resources::load_binary(url)
                .await
                .with_context(|| format!("loading {url}"))?;
            (url.clone(), irradiance_from_hdr(&bytes)?)
        }
    };

    log::info!("Environment '{}' irradiance {:?}", label, irradiance);
    Ok(EnvironmentLight {
        source: label,
        irradiance,
        intensity,
    })
}
