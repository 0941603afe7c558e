//! Model loader: shows a placeholder while a URL loads through the cache,
//! then the model, or an error marker if the load failed.

use crate::cache::AssetCache;
use crate::dispose::{DisposeReport, dispose};
use crate::error::LoadError;
use crate::model::{Geometry, Material, MaterialProperties, Mesh, TextureMaps};
use crate::primitives;
use crate::resource::ResourceTracker;
use crate::scene::{Node, NodeId};
use crate::tasks::TaskSpawner;
use futures::FutureExt;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Dark => Theme::Light,
            Theme::Light => Theme::Dark,
        }
    }

    /// Ambient light multiplier; light pages get a brighter scene.
    pub fn ambient_scale(self) -> f32 {
        match self {
            Theme::Dark => 1.0,
            Theme::Light => 5.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderStyle {
    pub pending_on_dark: [f32; 3],
    pub pending_on_light: [f32; 3],
    pub pending_opacity: f32,
    pub error: [f32; 3],
    pub sphere_radius: f32,
    pub sphere_segments: u32,
}

impl Default for PlaceholderStyle {
    fn default() -> Self {
        Self {
            pending_on_dark: [1.0, 1.0, 1.0],
            pending_on_light: [0.0, 0.0, 0.0],
            pending_opacity: 0.5,
            error: [1.0, 0.0, 0.0],
            sphere_radius: 1.0,
            sphere_segments: 32,
        }
    }
}

impl PlaceholderStyle {
    pub fn pending_color(&self, theme: Theme) -> [f32; 4] {
        let [r, g, b] = match theme {
            Theme::Dark => self.pending_on_dark,
            Theme::Light => self.pending_on_light,
        };
        [r, g, b, self.pending_opacity]
    }

    pub fn error_color(&self) -> [f32; 4] {
        let [r, g, b] = self.error;
        [r, g, b, 1.0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    Pending,
    Loaded,
    Failed(LoadError),
}

impl LoadState {
    pub fn label(&self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Pending => "loading",
            LoadState::Loaded => "loaded",
            LoadState::Failed(_) => "failed",
        }
    }
}

struct Resolution {
    generation: u64,
    url: String,
    result: Result<Node, LoadError>,
}

type UrlCallback = Box<dyn FnMut(&str)>;
type ErrorCallback = Box<dyn FnMut(&LoadError)>;
type SelectCallback = Box<dyn FnMut(&Node)>;

pub struct ModelLoader {
    cache: Rc<AssetCache>,
    style: PlaceholderStyle,
    theme: Theme,
    shadows: (bool, bool),
    url: Option<String>,
    /// Bumped on every URL change; resolutions carrying an older value are
    /// dropped.
    generation: u64,
    state: LoadState,
    model: Option<Node>,
    pending_placeholder: Node,
    error_placeholder: Node,
    tx: mpsc::UnboundedSender<Resolution>,
    rx: mpsc::UnboundedReceiver<Resolution>,
    on_load: Option<UrlCallback>,
    on_error: Option<ErrorCallback>,
    on_select: Option<SelectCallback>,
}

impl ModelLoader {
    pub fn new(cache: Rc<AssetCache>, style: PlaceholderStyle, theme: Theme) -> Self {
        let tracker = cache.tracker().clone();
        let (tx, rx) = mpsc::unbounded();
        Self {
            pending_placeholder: pending_placeholder(&style, theme, &tracker),
            error_placeholder: error_placeholder(&style, &tracker),
            cache,
            style,
            theme,
            shadows: (false, false),
            url: None,
            generation: 0,
            state: LoadState::Idle,
            model: None,
            tx,
            rx,
            on_load: None,
            on_error: None,
            on_select: None,
        }
    }

    pub fn on_load(mut self, f: impl FnMut(&str) + 'static) -> Self {
        self.on_load = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&LoadError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_select(mut self, f: impl FnMut(&Node) + 'static) -> Self {
        self.on_select = Some(Box::new(f));
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn set_url(&mut self, url: &str, spawner: &TaskSpawner) {
        if self.url.as_deref() == Some(url) {
            return;
        }

        self.generation += 1;
        self.url = Some(url.to_string());
        self.state = LoadState::Pending;
        // The previous model's resources belong to the cache
        self.model = None;

        let load = self.cache.load(url);
        let tx = self.tx.clone();
        let generation = self.generation;
        let url = url.to_string();
        spawner.spawn(
            async move {
                let result = load.await;
                // The loader may be gone by now
                let _ = tx.unbounded_send(Resolution {
                    generation,
                    url,
                    result,
                });
            }
            .boxed_local(),
        );
    }

    /// Shadow flags applied to every node of each model this loader shows.
    pub fn set_shadows(&mut self, cast: bool, receive: bool) {
        self.shadows = (cast, receive);
        if let Some(model) = &mut self.model {
            model.set_shadows(cast, receive);
        }
    }

    pub fn set_theme(&mut self, theme: Theme) {
        if theme == self.theme {
            return;
        }
        self.theme = theme;
        let tracker = self.cache.tracker().clone();
        let old = std::mem::replace(
            &mut self.pending_placeholder,
            pending_placeholder(&self.style, theme, &tracker),
        );
        dispose(&old);
    }

    /// Applies finished loads. Call once per frame.
    pub fn poll(&mut self) {
        while let Ok(resolution) = self.rx.try_recv() {
            self.resolve(resolution);
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        if resolution.generation != self.generation {
            log::debug!(
                "Ignoring stale load of '{}' (generation {}, current {})",
                resolution.url,
                resolution.generation,
                self.generation
            );
            return;
        }

        match resolution.result {
            Ok(mut model) => {
                let (cast, receive) = self.shadows;
                model.set_shadows(cast, receive);
                self.state = LoadState::Loaded;
                if let Some(on_load) = &mut self.on_load {
                    on_load(&resolution.url);
                }
                if let Some(on_select) = &mut self.on_select {
                    on_select(&model);
                }
                self.model = Some(model);
            }
            Err(err) => {
                log::error!("{}", err);
                if let Some(on_error) = &mut self.on_error {
                    on_error(&err);
                }
                self.state = LoadState::Failed(err);
            }
        }
    }

    /// What the viewport should draw for this loader right now.
    pub fn content(&self) -> Option<&Node> {
        match self.state {
            LoadState::Idle => None,
            LoadState::Pending => Some(&self.pending_placeholder),
            LoadState::Loaded => self.model.as_ref(),
            LoadState::Failed(_) => Some(&self.error_placeholder),
        }
    }

    pub fn content_mut(&mut self) -> Option<&mut Node> {
        match self.state {
            LoadState::Idle => None,
            LoadState::Pending => Some(&mut self.pending_placeholder),
            LoadState::Loaded => self.model.as_mut(),
            LoadState::Failed(_) => Some(&mut self.error_placeholder),
        }
    }

    /// Reports a picked node of the loaded model through `on_select`.
    /// Placeholders and nodes outside the model are ignored.
    pub fn select(&mut self, id: NodeId) -> bool {
        let Some(node) = self.model.as_ref().and_then(|model| model.find(id)) else {
            return false;
        };
        log::debug!("Selected '{}'", node.name);
        if let Some(on_select) = &mut self.on_select {
            on_select(node);
        }
        true
    }

    /// Releases the placeholders. Loads still in flight are ignored when
    /// they finish.
    pub fn unmount(mut self) -> DisposeReport {
        self.generation += 1;
        self.rx.close();
        let mut report = dispose(&self.pending_placeholder);
        report.merge(dispose(&self.error_placeholder));
        report
    }
}

fn placeholder(
    name: &str,
    (vertices, indices): (Vec<crate::model::ModelVertex>, Vec<u32>),
    color: [f32; 4],
    tracker: &ResourceTracker,
) -> Node {
    let geometry = Arc::new(Geometry::new(name, vertices, indices, tracker));
    let material = Arc::new(Material::new(
        name,
        MaterialProperties::unlit(color),
        TextureMaps::default(),
        tracker,
    ));
    Node::with_mesh(name, Mesh::new(geometry, material))
}

fn pending_placeholder(style: &PlaceholderStyle, theme: Theme, tracker: &ResourceTracker) -> Node {
    let segments = style.sphere_segments;
    placeholder(
        "loading",
        primitives::sphere(style.sphere_radius, segments, segments),
        style.pending_color(theme),
        tracker,
    )
}

fn error_placeholder(style: &PlaceholderStyle, tracker: &ResourceTracker) -> Node {
    placeholder(
        "load-error",
        primitives::cuboid(1.0, 1.0, 1.0),
        style.error_color(),
        tracker,
    )
}
