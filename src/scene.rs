//! Retained scene graph.
//!
//! Nodes own their children. Cloning a node copies the whole subtree
//! structurally (fresh ids, own transforms and child lists) while the
//! geometry, materials and textures behind each mesh stay shared through
//! `Arc`, so a clone can be moved, re-parented or pruned freely without
//! touching the node it came from.

use crate::environment::EnvironmentLight;
use crate::light::LightSet;
use crate::model::Mesh;
use cgmath::{Matrix4, One, Quaternion, Rad, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: Quaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 0.0),
            rotation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    pub fn from_position(position: Vector3<f32>) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.position)
            * Matrix4::from(self.rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    pub fn rotate_x(&mut self, angle: Rad<f32>) {
        self.rotation = self.rotation * Quaternion::from_angle_x(angle);
    }

    pub fn rotate_y(&mut self, angle: Rad<f32>) {
        self.rotation = self.rotation * Quaternion::from_angle_y(angle);
    }
}

pub struct Node {
    id: NodeId,
    pub name: String,
    pub transform: Transform,
    pub visible: bool,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub mesh: Option<Mesh>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            transform: Transform::default(),
            visible: true,
            cast_shadow: false,
            receive_shadow: false,
            mesh: None,
            children: Vec::new(),
        }
    }

    pub fn with_mesh(name: impl Into<String>, mesh: Mesh) -> Self {
        Self {
            mesh: Some(mesh),
            ..Self::new(name)
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn add_child(&mut self, child: Node) -> NodeId {
        let id = child.id;
        self.children.push(child);
        id
    }

    /// Depth-first, parents before children.
    pub fn traverse<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for child in &self.children {
            child.traverse(f);
        }
    }

    pub fn traverse_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for child in &mut self.children {
            child.traverse_mut(f);
        }
    }

    pub fn find(&self, id: NodeId) -> Option<&Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find_by_name(name))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.find(id).is_some()
    }

    /// Removes the descendant `id` from its parent and hands it back.
    /// `self` is never detached from itself.
    pub fn detach(&mut self, id: NodeId) -> Option<Node> {
        if let Some(index) = self.children.iter().position(|child| child.id == id) {
            return Some(self.children.remove(index));
        }
        self.children
            .iter_mut()
            .find_map(|child| child.detach(id))
    }

    pub fn set_shadows(&mut self, cast: bool, receive: bool) {
        self.traverse_mut(&mut |node| {
            node.cast_shadow = cast;
            node.receive_shadow = receive;
        });
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.traverse(&mut |_| count += 1);
        count
    }

    pub fn mesh_count(&self) -> usize {
        let mut count = 0;
        self.traverse(&mut |node| {
            if node.mesh.is_some() {
                count += 1;
            }
        });
        count
    }

    /// Visits every visible node with its world matrix. Hidden nodes hide
    /// their whole subtree.
    pub fn visit_visible<'a>(
        &'a self,
        parent: Matrix4<f32>,
        f: &mut impl FnMut(&'a Node, Matrix4<f32>),
    ) {
        if !self.visible {
            return;
        }
        let world = parent * self.transform.matrix();
        f(self, world);
        for child in &self.children {
            child.visit_visible(world, f);
        }
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            id: NodeId::next(),
            name: self.name.clone(),
            transform: self.transform,
            visible: self.visible,
            cast_shadow: self.cast_shadow,
            receive_shadow: self.receive_shadow,
            mesh: self.mesh.clone(),
            children: self.children.clone(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mesh", &self.mesh.is_some())
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fog {
    pub color: [f32; 3],
    pub near: f32,
    pub far: f32,
}

impl Default for Fog {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0],
            near: 10.0,
            far: 50.0,
        }
    }
}

#[derive(Debug)]
pub struct Scene {
    pub root: Node,
    pub lights: LightSet,
    pub background: [f32; 3],
    pub fog: Option<Fog>,
    pub environment: Option<EnvironmentLight>,
}

impl Scene {
    pub fn new(lights: LightSet, background: [f32; 3], fog: Option<Fog>) -> Self {
        Self {
            root: Node::new("scene"),
            lights,
            background,
            fog,
            environment: None,
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(LightSet::default(), [0.0, 0.0, 0.0], None)
    }
}
