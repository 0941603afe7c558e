use crate::config::GalleryEntry;
use crate::error::LoadError;
use crate::loader::{LoadState, Theme};
use crate::resource::ResourceCounts;
use egui::{Align2, Color32, Context};
use std::collections::HashMap;

/// What the gallery knows about one entry's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Unvisited,
    Loading,
    Loaded,
    Failed(String),
}

impl EntryStatus {
    fn label(&self) -> &str {
        match self {
            EntryStatus::Unvisited => "",
            EntryStatus::Loading => "loading",
            EntryStatus::Loaded => "loaded",
            EntryStatus::Failed(_) => "failed",
        }
    }
}

/// Per-URL load history, fed by the loader callbacks.
#[derive(Debug, Default)]
pub struct GalleryStatus {
    entries: HashMap<String, EntryStatus>,
    pub selected_node: Option<String>,
    pub hovered_node: Option<String>,
}

impl GalleryStatus {
    pub fn mark_loading(&mut self, url: &str) {
        // A URL that loaded once stays loaded; the cache serves it again
        let status = self
            .entries
            .entry(url.to_string())
            .or_insert(EntryStatus::Unvisited);
        if *status != EntryStatus::Loaded {
            *status = EntryStatus::Loading;
        }
    }

    pub fn mark_loaded(&mut self, url: &str) {
        self.entries.insert(url.to_string(), EntryStatus::Loaded);
    }

    pub fn mark_failed(&mut self, err: &LoadError) {
        self.entries
            .insert(err.url().to_string(), EntryStatus::Failed(err.to_string()));
    }

    /// Everything loaded before a cache clear must be fetched again.
    pub fn forget_loaded(&mut self) {
        self.entries.retain(|_, status| *status != EntryStatus::Loaded);
    }

    pub fn status(&self, url: &str) -> &EntryStatus {
        self.entries.get(url).unwrap_or(&EntryStatus::Unvisited)
    }
}

pub struct OverlayData<'a> {
    pub gallery: &'a [GalleryEntry],
    pub selected: usize,
    pub status: &'a GalleryStatus,
    pub load_state: &'a LoadState,
    pub counts: ResourceCounts,
    pub cached: usize,
    pub theme: Theme,
    pub animating: bool,
    pub frame_time_ms: f32,
    pub scroll_progress: f32,
}

/// Requests from the overlay, applied by the app after the frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UiActions {
    pub select: Option<usize>,
    pub clear_cache: bool,
    pub toggle_theme: bool,
    pub toggle_animation: bool,
}

pub fn app_ui(ctx: &Context, data: &OverlayData, actions: &mut UiActions) {
    egui::Window::new("Gallery")
        .default_open(true)
        .max_width(360.0)
        .default_width(320.0)
        .resizable(true)
        .anchor(Align2::LEFT_TOP, [10.0, 10.0])
        .show(ctx, |ui| {
            if let Some(entry) = data.gallery.get(data.selected) {
                ui.heading(&entry.title);
                ui.label(&entry.description);
                if let Some(href) = &entry.href {
                    ui.hyperlink_to("Details", href);
                }
            }

            ui.horizontal(|ui| {
                let count = data.gallery.len();
                if ui.button("◀ Prev").clicked() && count > 0 {
                    actions.select = Some((data.selected + count - 1) % count);
                }
                ui.label(format!("{} / {}", data.selected + 1, count));
                if ui.button("Next ▶").clicked() && count > 0 {
                    actions.select = Some((data.selected + 1) % count);
                }
            });

            ui.separator();

            for (index, entry) in data.gallery.iter().enumerate() {
                let status = data.status.status(&entry.url);
                ui.horizontal(|ui| {
                    if ui
                        .selectable_label(index == data.selected, &entry.title)
                        .clicked()
                    {
                        actions.select = Some(index);
                    }
                    let color = match status {
                        EntryStatus::Failed(_) => Color32::RED,
                        EntryStatus::Loaded => Color32::GREEN,
                        _ => ui.visuals().weak_text_color(),
                    };
                    ui.colored_label(color, status.label());
                });
                if let EntryStatus::Failed(message) = status {
                    ui.small(message);
                }
            }

            ui.separator();

            ui.label(format!("Loader: {}", data.load_state.label()));
            if let Some(name) = &data.status.selected_node {
                ui.label(format!("Selected: {}", name));
            }
            if let Some(name) = &data.status.hovered_node {
                ui.weak(format!("Hover: {}", name));
            }

            ui.collapsing("Resources", |ui| {
                ui.label(format!("Geometries: {}", data.counts.geometries));
                ui.label(format!("Materials: {}", data.counts.materials));
                ui.label(format!("Textures: {}", data.counts.textures));
                ui.label(format!("Cached models: {}", data.cached));
                if ui.button("Clear cache").clicked() {
                    actions.clear_cache = true;
                }
            });

            ui.separator();

            ui.horizontal(|ui| {
                let mut animating = data.animating;
                if ui.checkbox(&mut animating, "Rotate").changed() {
                    actions.toggle_animation = true;
                }
                let theme = match data.theme {
                    Theme::Dark => "Light theme",
                    Theme::Light => "Dark theme",
                };
                if ui.button(theme).clicked() {
                    actions.toggle_theme = true;
                }
            });

            ui.label(format!("Scroll: {:.0}%", data.scroll_progress * 100.0));
            ui.small("Drag to orbit, Ctrl+wheel to zoom");
            if data.frame_time_ms > 0.0 {
                ui.label(format!(
                    "{:.2} ms ({:.1} FPS)",
                    data.frame_time_ms,
                    1000.0 / data.frame_time_ms
                ));
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_load_lifecycle() {
        let mut status = GalleryStatus::default();
        assert_eq!(status.status("/models/laptop.glb"), &EntryStatus::Unvisited);

        status.mark_loading("/models/laptop.glb");
        assert_eq!(status.status("/models/laptop.glb"), &EntryStatus::Loading);
        status.mark_loaded("/models/laptop.glb");

        // Revisiting a loaded entry is served from the cache
        status.mark_loading("/models/laptop.glb");
        assert_eq!(status.status("/models/laptop.glb"), &EntryStatus::Loaded);

        status.forget_loaded();
        assert_eq!(status.status("/models/laptop.glb"), &EntryStatus::Unvisited);
    }

    #[test]
    fn failures_keep_the_message() {
        let mut status = GalleryStatus::default();
        status.mark_loading("/models/plant.glb");
        status.mark_failed(&LoadError::fetch("/models/plant.glb", "404 Not Found"));
        match status.status("/models/plant.glb") {
            EntryStatus::Failed(message) => assert!(message.contains("404")),
            other => panic!("unexpected status {other:?}"),
        }

        // A retry shows as loading again
        status.mark_loading("/models/plant.glb");
        assert_eq!(status.status("/models/plant.glb"), &EntryStatus::Loading);
    }
}
