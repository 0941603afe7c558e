//! Deterministic teardown of the GPU resources behind a scene subtree.

use crate::model::{Geometry, Material};
use crate::resource::ReleaseError;
use crate::scene::{Node, NodeId};
use crate::texture::Texture;

/// What one disposal call released. Resources that were already released
/// (by an earlier call, or because they are shared with a node visited
/// earlier in the same call) are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposeReport {
    pub geometries: usize,
    pub materials: usize,
    pub textures: usize,
    pub failures: usize,
}

impl DisposeReport {
    pub fn released(&self) -> usize {
        self.geometries + self.materials + self.textures
    }

    pub fn merge(&mut self, other: DisposeReport) {
        self.geometries += other.geometries;
        self.materials += other.materials;
        self.textures += other.textures;
        self.failures += other.failures;
    }

    fn record(&mut self, outcome: Result<bool, ReleaseError>, counter: fn(&mut Self) -> &mut usize) {
        match outcome {
            Ok(true) => *counter(self) += 1,
            Ok(false) => {}
            Err(err) => {
                log::warn!("Failed to release resource: {}", err);
                self.failures += 1;
            }
        }
    }
}

/// Releases the geometry, materials and texture maps of every mesh in the
/// subtree rooted at `node`. Safe to call any number of times.
pub fn dispose(node: &Node) -> DisposeReport {
    let mut report = DisposeReport::default();
    node.traverse(&mut |node| {
        let Some(mesh) = &node.mesh else {
            return;
        };
        release_geometry(&mesh.geometry, &mut report);
        for material in mesh.materials.iter() {
            release_material(material, &mut report);
        }
    });

    if report.released() > 0 || report.failures > 0 {
        log::debug!(
            "Disposed '{}': {} geometries, {} materials, {} textures, {} failures",
            node.name,
            report.geometries,
            report.materials,
            report.textures,
            report.failures
        );
    }
    report
}

/// Detaches the node `id` from its parent inside `root` and disposes it.
/// Disposing `root` itself releases it in place. An id that is not part of
/// the tree is ignored.
pub fn dispose_descendant(root: &mut Node, id: NodeId) -> DisposeReport {
    if root.id() == id {
        return dispose(root);
    }
    match root.detach(id) {
        Some(node) => dispose(&node),
        None => {
            log::debug!("Node {} is not part of '{}'; nothing to dispose", id, root.name);
            DisposeReport::default()
        }
    }
}

fn release_geometry(geometry: &Geometry, report: &mut DisposeReport) {
    report.record(geometry.release(), |r| &mut r.geometries);
}

fn release_material(material: &Material, report: &mut DisposeReport) {
    report.record(material.release(), |r| &mut r.materials);
    for (_, texture) in material.maps.iter() {
        release_texture(texture, report);
    }
}

fn release_texture(texture: &Texture, report: &mut DisposeReport) {
    report.record(texture.release(), |r| &mut r.textures);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Materials, MaterialProperties, Mesh, TextureMaps};
    use crate::resource::{ResourceCounts, ResourceTracker};
    use crate::texture::TextureData;
    use std::sync::Arc;

    fn texture(name: &str, tracker: &ResourceTracker) -> Arc<Texture> {
        Arc::new(Texture::new(name, TextureData::solid([255; 4], true), tracker))
    }

    /// One geometry, one material carrying a base color and a normal map.
    fn mesh_node(name: &str, tracker: &ResourceTracker) -> Node {
        let geometry = Arc::new(Geometry::new(name, vec![], vec![0, 1, 2], tracker));
        let maps = TextureMaps {
            base_color: Some(texture(&format!("{name}_albedo"), tracker)),
            normal: Some(texture(&format!("{name}_normal"), tracker)),
            ..Default::default()
        };
        let material = Arc::new(Material::new(name, MaterialProperties::default(), maps, tracker));
        Node::with_mesh(name, Mesh::new(geometry, material))
    }

    #[test]
    fn releases_every_resource_exactly_once() {
        let tracker = ResourceTracker::new();
        let mut root = Node::new("root");
        for i in 0..3 {
            root.add_child(mesh_node(&format!("mesh{i}"), &tracker));
        }
        assert_eq!(
            tracker.counts(),
            ResourceCounts {
                geometries: 3,
                materials: 3,
                textures: 6
            }
        );

        let report = dispose(&root);
        assert_eq!(
            report,
            DisposeReport {
                geometries: 3,
                materials: 3,
                textures: 6,
                failures: 0
            }
        );
        assert_eq!(tracker.counts().total(), 0);
    }

    #[test]
    fn second_dispose_releases_nothing() {
        let tracker = ResourceTracker::new();
        let node = mesh_node("chair", &tracker);
        assert_eq!(dispose(&node).released(), 4);
        assert_eq!(dispose(&node), DisposeReport::default());
        assert_eq!(tracker.counts().total(), 0);
    }

    #[test]
    fn shared_texture_is_released_once() {
        let tracker = ResourceTracker::new();
        let orm = texture("orm", &tracker);
        let maps = TextureMaps {
            roughness: Some(orm.clone()),
            metalness: Some(orm),
            ..Default::default()
        };
        let material = Arc::new(Material::new("metal", MaterialProperties::default(), maps, &tracker));
        let geometry = Arc::new(Geometry::new("plate", vec![], vec![], &tracker));
        let node = Node::with_mesh("plate", Mesh::new(geometry, material));

        let report = dispose(&node);
        assert_eq!(report.textures, 1);
        assert_eq!(tracker.counts().total(), 0);
    }

    #[test]
    fn material_lists_are_disposed_like_single_materials() {
        let tracker = ResourceTracker::new();
        let materials = (0..2)
            .map(|i| {
                Arc::new(Material::new(
                    format!("m{i}"),
                    MaterialProperties::default(),
                    TextureMaps {
                        base_color: Some(texture(&format!("t{i}"), &tracker)),
                        ..Default::default()
                    },
                    &tracker,
                ))
            })
            .collect();
        let geometry = Arc::new(Geometry::new("multi", vec![], vec![], &tracker));
        let node = Node::with_mesh(
            "multi",
            Mesh {
                geometry,
                materials: Materials::Multi(materials),
            },
        );

        let report = dispose(&node);
        assert_eq!((report.geometries, report.materials, report.textures), (1, 2, 2));
    }

    #[test]
    fn clones_share_resources_with_their_source() {
        let tracker = ResourceTracker::new();
        let original = mesh_node("plant", &tracker);
        let copy = original.clone();

        assert_eq!(dispose(&copy).released(), 4);
        // Already released through the clone
        assert_eq!(dispose(&original).released(), 0);
    }

    #[test]
    fn dispose_descendant_detaches_then_disposes() {
        let tracker = ResourceTracker::new();
        let mut root = Node::new("root");
        let keep = root.add_child(mesh_node("keep", &tracker));
        let doomed = root.add_child(mesh_node("doomed", &tracker));

        let report = dispose_descendant(&mut root, doomed);
        assert_eq!(report.geometries, 1);
        assert!(root.contains(keep));
        assert!(!root.contains(doomed));
        assert_eq!(tracker.counts().total(), 4);
    }

    #[test]
    fn surviving_material_rebinds_after_shared_texture_goes() {
        let tracker = ResourceTracker::new();
        let shared = texture("wood", &tracker);
        let sibling = |name: &str| {
            let maps = TextureMaps {
                base_color: Some(shared.clone()),
                ..Default::default()
            };
            let material = Arc::new(Material::new(name, MaterialProperties::default(), maps, &tracker));
            let geometry = Arc::new(Geometry::new(name, vec![], vec![0, 1, 2], &tracker));
            Node::with_mesh(name, Mesh::new(geometry, material))
        };
        let mut root = Node::new("root");
        let keep = root.add_child(sibling("table"));
        let doomed = root.add_child(sibling("chair"));

        let kept = root.find(keep).unwrap().mesh.as_ref().unwrap().materials.get(0).unwrap().clone();
        let built = kept.texture_uploads();
        assert!(!kept.bindings_stale(&built));

        let report = dispose_descendant(&mut root, doomed);
        assert_eq!(report.textures, 1);
        assert!(!kept.is_released());
        assert!(shared.is_released());
        assert!(kept.bindings_stale(&built));
    }

    #[test]
    fn dispose_descendant_of_unknown_node_is_noop() {
        let tracker = ResourceTracker::new();
        let mut root = Node::new("root");
        root.add_child(mesh_node("a", &tracker));
        let stranger = Node::new("elsewhere");

        assert_eq!(dispose_descendant(&mut root, stranger.id()), DisposeReport::default());
        assert_eq!(root.children.len(), 1);
        assert_eq!(tracker.counts().total(), 4);
    }

    #[test]
    fn dispose_descendant_of_root_keeps_tree() {
        let tracker = ResourceTracker::new();
        let mut root = mesh_node("root", &tracker);
        let id = root.id();
        assert_eq!(dispose_descendant(&mut root, id).released(), 4);
        assert_eq!(root.mesh_count(), 1);
    }
}
