//! In-memory glTF documents and a scripted asset source for tests.

use crate::cache::{AssetSource, FetchFuture};
use futures::channel::oneshot;
use futures::FutureExt;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const ALBEDO_RGBA: [u8; 4] = [200, 100, 50, 255];
pub const NORMAL_RGBA: [u8; 4] = [128, 128, 255, 255];
pub const ORM_RGBA: [u8; 4] = [255, 180, 20, 255];

pub const DRACO_GLTF: &str = r#"{
    "asset": { "version": "2.0" },
    "extensionsUsed": ["KHR_draco_mesh_compression"],
    "extensionsRequired": ["KHR_draco_mesh_compression"],
    "scenes": [{ "nodes": [] }],
    "scene": 0
}"#;

pub const EXTERNAL_BUFFER_GLTF: &str = r#"{
    "asset": { "version": "2.0" },
    "buffers": [{ "uri": "model.bin", "byteLength": 12 }],
    "scenes": [{ "nodes": [] }],
    "scene": 0
}"#;

pub const EMPTY_SCENE_GLTF: &str = r#"{
    "asset": { "version": "2.0" },
    "nodes": [{ "name": "empty" }],
    "scenes": [{ "nodes": [0] }],
    "scene": 0
}"#;

fn png(rgba: [u8; 4]) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(1, 1, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
        .unwrap();
    bytes
}

/// A GLB under construction: one shared triangle plus whatever materials,
/// meshes and images a fixture adds.
pub struct Fixture {
    bin: Vec<u8>,
    buffer_views: Vec<Value>,
    images: Vec<Value>,
    textures: Vec<Value>,
    materials: Vec<Value>,
    meshes: Vec<Value>,
    nodes: Vec<Value>,
}

impl Fixture {
    fn triangle() -> Self {
        let mut bin = Vec::new();
        let mut push_f32 = |values: &[f32]| {
            for v in values {
                bin.extend_from_slice(&v.to_le_bytes());
            }
        };
        push_f32(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        push_f32(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        push_f32(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        for i in [0u32, 1, 2] {
            bin.extend_from_slice(&i.to_le_bytes());
        }

        Self {
            bin,
            buffer_views: vec![
                json!({ "buffer": 0, "byteOffset": 0, "byteLength": 36 }),
                json!({ "buffer": 0, "byteOffset": 36, "byteLength": 36 }),
                json!({ "buffer": 0, "byteOffset": 72, "byteLength": 24 }),
                json!({ "buffer": 0, "byteOffset": 96, "byteLength": 12 }),
            ],
            images: Vec::new(),
            textures: Vec::new(),
            materials: Vec::new(),
            meshes: Vec::new(),
            nodes: Vec::new(),
        }
    }

    fn primitive(material: usize) -> Value {
        json!({
            "attributes": { "POSITION": 0, "NORMAL": 1, "TEXCOORD_0": 2 },
            "indices": 3,
            "material": material
        })
    }

    fn texture(&mut self, rgba: [u8; 4]) -> usize {
        let bytes = png(rgba);
        let offset = self.bin.len();
        self.bin.extend_from_slice(&bytes);
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }

        self.buffer_views
            .push(json!({ "buffer": 0, "byteOffset": offset, "byteLength": bytes.len() }));
        self.images.push(json!({
            "bufferView": self.buffer_views.len() - 1,
            "mimeType": "image/png"
        }));
        self.textures.push(json!({ "source": self.images.len() - 1 }));
        self.textures.len() - 1
    }

    fn node(&mut self, name: String, mesh: usize, x: f32) {
        self.nodes.push(json!({ "name": name, "mesh": mesh, "translation": [x, 0.0, 0.0] }));
    }

    /// `count` triangles, each with its own geometry and a material carrying
    /// a base color map and a normal map.
    pub fn textured_quads(count: usize) -> Self {
        let mut fixture = Self::triangle();
        for i in 0..count {
            let albedo = fixture.texture(ALBEDO_RGBA);
            let normal = fixture.texture(NORMAL_RGBA);
            fixture.materials.push(json!({
                "name": format!("paint{i}"),
                "pbrMetallicRoughness": { "baseColorTexture": { "index": albedo } },
                "normalTexture": { "index": normal }
            }));
            fixture.meshes.push(json!({ "primitives": [Self::primitive(i)] }));
            fixture.node(format!("quad{i}"), i, i as f32);
        }
        fixture
    }

    /// One mesh whose material has a metallic-roughness map.
    pub fn metal_plate() -> Self {
        let mut fixture = Self::triangle();
        let orm = fixture.texture(ORM_RGBA);
        fixture.materials.push(json!({
            "name": "brushed",
            "pbrMetallicRoughness": {
                "metallicFactor": 1.0,
                "roughnessFactor": 0.4,
                "metallicRoughnessTexture": { "index": orm }
            }
        }));
        fixture.meshes.push(json!({ "primitives": [Self::primitive(0)] }));
        fixture.node("plate".into(), 0, 0.0);
        fixture
    }

    /// One mesh with two primitives, each with its own untextured material.
    pub fn two_tone() -> Self {
        let mut fixture = Self::triangle();
        fixture.materials.push(json!({ "name": "red" }));
        fixture.materials.push(json!({ "name": "blue", "alphaMode": "BLEND" }));
        fixture
            .meshes
            .push(json!({ "primitives": [Self::primitive(0), Self::primitive(1)] }));
        fixture.node("vase".into(), 0, 0.0);
        fixture
    }

    pub fn glb(&self) -> Vec<u8> {
        let scene_nodes: Vec<usize> = (0..self.nodes.len()).collect();
        let mut json = json!({
            "asset": { "version": "2.0" },
            "buffers": [{ "byteLength": self.bin.len() }],
            "bufferViews": self.buffer_views,
            "accessors": [
                { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
                  "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
                { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC3" },
                { "bufferView": 2, "componentType": 5126, "count": 3, "type": "VEC2" },
                { "bufferView": 3, "componentType": 5125, "count": 3, "type": "SCALAR" }
            ],
            "materials": self.materials,
            "meshes": self.meshes,
            "nodes": self.nodes,
            "scenes": [{ "nodes": scene_nodes }],
            "scene": 0
        });
        if !self.images.is_empty() {
            json["images"] = json!(self.images);
            json["textures"] = json!(self.textures);
        }

        gltf::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: 0,
            },
            json: Cow::Owned(serde_json::to_vec(&json).unwrap()),
            bin: Some(Cow::Borrowed(&self.bin)),
        }
        .to_vec()
        .unwrap()
    }
}

/// Serves canned responses. Each fetch is counted; URLs registered with
/// [`ScriptedSource::gate`] stay pending until released.
#[derive(Default)]
pub struct ScriptedSource {
    responses: RefCell<HashMap<String, Result<Vec<u8>, String>>>,
    gates: RefCell<HashMap<String, Vec<oneshot::Sender<()>>>>,
    gated: RefCell<Vec<String>>,
    fetches: RefCell<Vec<String>>,
}

impl ScriptedSource {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.responses.borrow_mut().insert(url.to_string(), Ok(bytes));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.responses
            .borrow_mut()
            .insert(url.to_string(), Err(message.to_string()));
    }

    /// Holds every future fetch of `url` until [`ScriptedSource::release`].
    pub fn gate(&self, url: &str) {
        self.gated.borrow_mut().push(url.to_string());
    }

    pub fn release(&self, url: &str) {
        self.gated.borrow_mut().retain(|u| u != url);
        let waiting = self.gates.borrow_mut().remove(url).unwrap_or_default();
        for tx in waiting {
            let _ = tx.send(());
        }
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.borrow().iter().filter(|u| *u == url).count()
    }
}

impl AssetSource for ScriptedSource {
    fn fetch(&self, url: &str) -> FetchFuture {
        self.fetches.borrow_mut().push(url.to_string());
        let response = self
            .responses
            .borrow()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(format!("404 Not Found: {url}")));

        let gate = if self.gated.borrow().iter().any(|u| u == url) {
            let (tx, rx) = oneshot::channel();
            self.gates
                .borrow_mut()
                .entry(url.to_string())
                .or_default()
                .push(tx);
            Some(rx)
        } else {
            None
        };

        async move {
            if let Some(rx) = gate {
                let _ = rx.await;
            }
            response.map_err(|message| anyhow::anyhow!(message))
        }
        .boxed_local()
    }
}
