mod app_ui;
pub mod cache;
pub mod camera;
pub mod config;
mod defaults;
pub mod dispose;
mod egui;
pub mod environment;
pub mod error;
pub mod gltf_import;
pub mod light;
pub mod loader;
pub mod model;
pub mod picking;
pub mod primitives;
pub mod resource;
pub mod resources;
pub mod scene;
pub mod scroll;
pub mod tasks;
#[cfg(test)]
mod test_support;
pub mod texture;
pub mod viewport;

use crate::app_ui::{GalleryStatus, OverlayData, UiActions};
use crate::cache::AssetCache;
use crate::camera::{OrbitController, PointerGesture};
use crate::config::ShowcaseConfig;
use crate::gltf_import::ImportOptions;
use crate::light::LightSet;
use crate::loader::{ModelLoader, Theme};
use crate::resource::ResourceTracker;
use crate::scene::{Node, NodeId};
use crate::scroll::ScrollTrack;
use crate::tasks::TaskSpawner;
use crate::viewport::Viewport;
use std::{cell::RefCell, rc::Rc, sync::Arc};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;
use winit::{
    application::ApplicationHandler,
    event::*,
    event_loop::{ActiveEventLoop, EventLoop},
    dpi::PhysicalPosition,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

/// Everything that exists once the viewport is up: the render host, the
/// model cache, the loader showing the selected gallery entry, and the
/// scroll-driven camera.
pub struct Showcase {
    viewport: Viewport,
    cache: Rc<AssetCache>,
    loader: ModelLoader,
    spawner: TaskSpawner,
    config: ShowcaseConfig,
    selected: usize,
    status: Rc<RefCell<GalleryStatus>>,
    scroll: ScrollTrack,
    orbit: OrbitController,
    pointer: PointerGesture,
    /// Ctrl held; the wheel zooms instead of scrolling
    zoom_modifier: bool,
    theme: Theme,
    last_frame: web_time::Instant,
}

impl Showcase {
    async fn new(window: Arc<Window>) -> anyhow::Result<Showcase> {
        let config = ShowcaseConfig::load(defaults::CONFIG_PATH).await;
        let lights = LightSet::with_lights(config.lighting.ambient, &config.lighting.directional);
        let mut viewport = Viewport::new(window, &config.viewport, lights).await?;
        viewport.animating = config.idle_rotation;
        viewport.set_theme(config.theme);

        if let Some(source) = &config.lighting.environment {
            match environment::load_environment(source, config.lighting.environment_intensity)
                .await
            {
                Ok(env) => viewport.set_environment(env),
                Err(err) => log::warn!("Environment map unavailable: {:#}", err),
            }
        }

        let cache = AssetCache::with_resources(
            ResourceTracker::new(),
            ImportOptions {
                draco_decoder_path: config.draco_decoder_path.clone(),
            },
        );

        let status = Rc::new(RefCell::new(GalleryStatus::default()));
        let loader = ModelLoader::new(cache.clone(), config.placeholder, config.theme)
            .on_load({
                let status = status.clone();
                move |url| {
                    log::info!("Loaded '{}'", url);
                    status.borrow_mut().mark_loaded(url);
                }
            })
            .on_error({
                let status = status.clone();
                move |err| status.borrow_mut().mark_failed(err)
            })
            .on_select({
                let status = status.clone();
                move |node| status.borrow_mut().selected_node = Some(node.name.clone())
            });

        let mut showcase = Self {
            viewport,
            cache,
            loader,
            spawner: TaskSpawner::new(),
            scroll: ScrollTrack::new(config.scroll),
            orbit: OrbitController::default(),
            pointer: PointerGesture::default(),
            zoom_modifier: false,
            theme: config.theme,
            selected: 0,
            status,
            config,
            last_frame: web_time::Instant::now(),
        };
        showcase.select(0);
        Ok(showcase)
    }

    fn select(&mut self, index: usize) {
        let Some(entry) = self.config.gallery.get(index) else {
            log::warn!("Gallery has no entry {}", index);
            return;
        };
        self.selected = index;
        if self.loader.url() != Some(entry.url.as_str()) {
            self.status.borrow_mut().mark_loading(&entry.url);
        }
        self.loader
            .set_shadows(entry.cast_shadow, entry.receive_shadow);
        self.loader.set_url(&entry.url, &self.spawner);
        log::info!("Showing '{}' ({})", entry.title, entry.url);
    }

    fn step(&mut self, forward: bool) {
        let count = self.config.gallery.len();
        if count == 0 {
            return;
        }
        let next = if forward {
            (self.selected + 1) % count
        } else {
            (self.selected + count - 1) % count
        };
        self.select(next);
    }

    fn toggle_theme(&mut self) {
        self.theme = self.theme.toggled();
        self.loader.set_theme(self.theme);
        self.viewport.set_theme(self.theme);
    }

    fn toggle_animation(&mut self) {
        self.viewport.animating = !self.viewport.animating;
    }

    fn clear_cache(&mut self) {
        let report = self.cache.clear();
        self.status.borrow_mut().forget_loaded();
        log::info!("Released {} resources", report.released());
    }

    fn apply(&mut self, actions: UiActions) {
        if let Some(index) = actions.select {
            self.select(index);
        }
        if actions.clear_cache {
            self.clear_cache();
        }
        if actions.toggle_theme {
            self.toggle_theme();
        }
        if actions.toggle_animation {
            self.toggle_animation();
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::ArrowLeft => self.step(false),
            KeyCode::ArrowRight => self.step(true),
            KeyCode::Space => self.toggle_animation(),
            KeyCode::KeyT => self.toggle_theme(),
            KeyCode::KeyC => self.clear_cache(),
            KeyCode::KeyR => self.orbit.reset(),
            _ => return false,
        }
        true
    }

    fn handle_wheel(&mut self, delta: MouseScrollDelta) {
        if self.zoom_modifier || !self.scroll.enabled() {
            let lines = match delta {
                MouseScrollDelta::LineDelta(_, y) => y,
                MouseScrollDelta::PixelDelta(pos) => {
                    (pos.y / self.viewport.window().scale_factor()) as f32
                        / self.config.scroll.wheel_step
                }
            };
            self.orbit.zoom(lines);
            return;
        }

        let height = self.viewport.logical_height();
        match delta {
            // Positive y scrolls up the page
            MouseScrollDelta::LineDelta(_, y) => self.scroll.scroll_lines(-y, height),
            MouseScrollDelta::PixelDelta(pos) => {
                let logical = pos.y / self.viewport.window().scale_factor();
                self.scroll.scroll_by(-logical as f32, height);
            }
        }
    }

    /// The loaded-model node under `cursor`, if any.
    fn node_at(&self, cursor: PhysicalPosition<f64>) -> Option<NodeId> {
        let mounted: Vec<&Node> = self.loader.content().into_iter().collect();
        self.viewport.pick_at(&mounted, cursor)
    }

    fn handle_cursor_moved(&mut self, cursor: PhysicalPosition<f64>) {
        if let Some((dx, dy)) = self.pointer.moved(cursor.x, cursor.y) {
            self.orbit.rotate(dx, dy);
            return;
        }

        let hovered = self.node_at(cursor).and_then(|id| {
            let content = self.loader.content()?;
            content.find(id).map(|node| node.name.clone())
        });
        self.status.borrow_mut().hovered_node = hovered;
    }

    fn handle_mouse_button(&mut self, state: ElementState, button: MouseButton) {
        if button != MouseButton::Left {
            return;
        }
        match state {
            ElementState::Pressed => self.pointer.press(),
            ElementState::Released => {
                if !self.pointer.release(defaults::CLICK_SLOP) {
                    return;
                }
                let Some((x, y)) = self.pointer.cursor() else {
                    return;
                };
                let picked = self.node_at(PhysicalPosition::new(x, y));
                if !picked.is_some_and(|id| self.loader.select(id)) {
                    self.status.borrow_mut().selected_node = None;
                }
            }
        }
    }

    fn frame(&mut self) -> Result<(), wgpu::SurfaceError> {
        let now = web_time::Instant::now();
        let dt = now - self.last_frame;
        self.last_frame = now;

        self.spawner.run_until_stalled();
        self.loader.poll();

        let height = self.viewport.logical_height();
        let base = self
            .scroll
            .camera_position(height)
            .unwrap_or_else(|| self.config.viewport.camera_position.into());
        let camera = self.viewport.camera_mut();
        camera.position = self.orbit.eye(base, camera.target);
        self.viewport.update(dt);

        let mounted: Vec<&Node> = self.loader.content().into_iter().collect();
        let status = self.status.borrow();
        let data = OverlayData {
            gallery: &self.config.gallery,
            selected: self.selected,
            status: &status,
            load_state: self.loader.state(),
            counts: self.cache.tracker().counts(),
            cached: self.cache.len(),
            theme: self.theme,
            animating: self.viewport.animating,
            frame_time_ms: dt.as_secs_f32() * 1000.0,
            scroll_progress: self.scroll.progress(height),
        };

        let mut actions = UiActions::default();
        let result = self
            .viewport
            .render(&mounted, |ctx| app_ui::app_ui(ctx, &data, &mut actions));
        drop(status);

        self.apply(actions);
        result
    }

    /// Unmounts the loader, empties the cache and tears the viewport down.
    fn shutdown(self) {
        let Showcase {
            viewport,
            cache,
            loader,
            ..
        } = self;

        let mut report = loader.unmount();
        report.merge(cache.clear());
        report.merge(viewport.teardown());

        let left = cache.tracker().counts();
        if left.total() > 0 {
            log::warn!("{:?} still live after shutdown", left);
        }
        log::info!("Shut down, {} resources released", report.released());
    }
}

pub struct App {
    #[cfg(target_arch = "wasm32")]
    proxy: Option<winit::event_loop::EventLoopProxy<Showcase>>,
    showcase: Option<Showcase>,
}

impl App {
    pub fn new(#[cfg(target_arch = "wasm32")] event_loop: &EventLoop<Showcase>) -> Self {
        #[cfg(target_arch = "wasm32")]
        let proxy = Some(event_loop.create_proxy());

        Self {
            showcase: None,
            #[cfg(target_arch = "wasm32")]
            proxy,
        }
    }

    fn close(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(showcase) = self.showcase.take() {
            showcase.shutdown();
        }
        event_loop.exit();
    }
}

impl ApplicationHandler<Showcase> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.showcase.is_some() {
            return;
        }

        #[allow(unused_mut)]
        let mut window_attributes = Window::default_attributes().with_title("vitrine");

        #[cfg(target_arch = "wasm32")]
        {
            use winit::platform::web::WindowAttributesExtWebSys;

            const CANVAS_ID: &str = "canvas";

            let canvas = wgpu::web_sys::window()
                .and_then(|window| window.document())
                .and_then(|document| document.get_element_by_id(CANVAS_ID));
            match canvas {
                Some(canvas) => {
                    window_attributes = window_attributes.with_canvas(Some(canvas.unchecked_into()))
                }
                None => log::error!("No <canvas id=\"{}\"> on the page", CANVAS_ID),
            }
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("Unable to create window: {}", err);
                event_loop.exit();
                return;
            }
        };

        // [Desktop]
        // Block on async initialization.
        #[cfg(not(target_arch = "wasm32"))]
        {
            match pollster::block_on(Showcase::new(window)) {
                Ok(showcase) => self.showcase = Some(showcase),
                Err(err) => {
                    log::error!("Unable to start: {:#}", err);
                    event_loop.exit();
                }
            }
        }

        // [Browser]
        // Initialization is async and cannot block in wasm, so it runs in a
        // background task that sends the finished showcase back to the event
        // loop.
        #[cfg(target_arch = "wasm32")]
        {
            if let Some(proxy) = self.proxy.take() {
                wasm_bindgen_futures::spawn_local(async move {
                    match Showcase::new(window).await {
                        Ok(showcase) => {
                            if proxy.send_event(showcase).is_err() {
                                log::error!("Event loop closed before the showcase was ready");
                            }
                        }
                        Err(err) => log::error!("Unable to start: {:#}", err),
                    }
                });
            }
        }
    }

    #[allow(unused_mut)]
    fn user_event(&mut self, _event_loop: &ActiveEventLoop, mut event: Showcase) {
        #[cfg(target_arch = "wasm32")]
        {
            let window = event.viewport.window();
            let size = window.inner_size();
            let scale_factor = window.scale_factor();
            window.request_redraw();
            event.viewport.resize(size.width, size.height, scale_factor);
        }
        self.showcase = Some(event);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let showcase = match &mut self.showcase {
            Some(showcase) => showcase,
            None => return,
        };

        match event {
            WindowEvent::CloseRequested => self.close(event_loop),
            WindowEvent::Resized(size) => {
                let scale_factor = showcase.viewport.window().scale_factor();
                showcase
                    .viewport
                    .resize(size.width, size.height, scale_factor);
            }
            WindowEvent::RedrawRequested => match showcase.frame() {
                Ok(_) => {}
                // Reconfigure the surface if it's lost, outdated, or suboptimal
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    let window = showcase.viewport.window();
                    let size = window.inner_size();
                    let scale_factor = window.scale_factor();
                    showcase
                        .viewport
                        .resize(size.width, size.height, scale_factor);
                }
                Err(e) => {
                    log::error!("Unable to render {}", e);
                }
            },
            event => {
                if showcase.viewport.handle_input(&event) {
                    return;
                }
                match event {
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(code),
                                state: key_state,
                                ..
                            },
                        ..
                    } => {
                        if !key_state.is_pressed() {
                            return;
                        }
                        if code == KeyCode::Escape {
                            self.close(event_loop);
                        } else if !showcase.handle_key(code) {
                            log::trace!("Unbound key {:?}", code);
                        }
                    }
                    WindowEvent::ModifiersChanged(modifiers) => {
                        showcase.zoom_modifier = modifiers.state().control_key();
                    }
                    WindowEvent::CursorMoved { position, .. } => {
                        showcase.handle_cursor_moved(position)
                    }
                    WindowEvent::CursorLeft { .. } => {
                        showcase.pointer.left();
                        showcase.status.borrow_mut().hovered_node = None;
                    }
                    WindowEvent::MouseInput { state, button, .. }
                        if !showcase.viewport.ui_wants_pointer() || state == ElementState::Released =>
                    {
                        showcase.handle_mouse_button(state, button)
                    }
                    WindowEvent::MouseWheel { delta, .. } if !showcase.viewport.ui_wants_pointer() => {
                        showcase.handle_wheel(delta)
                    }
                    _ => {}
                }
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(showcase) = self.showcase.take() {
            showcase.shutdown();
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    // Set up logging
    #[cfg(not(target_arch = "wasm32"))]
    env_logger::init();
    #[cfg(target_arch = "wasm32")]
    console_log::init_with_level(log::Level::Info)
        .map_err(|err| anyhow::anyhow!("console logger: {}", err))?;

    let event_loop = EventLoop::with_user_event().build()?;
    let mut app = App::new(
        #[cfg(target_arch = "wasm32")]
        &event_loop,
    );
    event_loop.run_app(&mut app)?;

    Ok(())
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn run_web() -> Result<(), wasm_bindgen::JsValue> {
    console_error_panic_hook::set_once();
    run().map_err(|err| wasm_bindgen::JsValue::from_str(&format!("{:#}", err)))?;

    Ok(())
}
