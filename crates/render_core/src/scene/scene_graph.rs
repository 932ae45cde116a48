//! Scene graph of transformable nodes
//!
//! Nodes live in a `SlotMap` arena and form a tree under a single root. Each node
//! carries a local [`Transform`], an optional [`Drawable`], and the distance-culling
//! parameters draw operations consult. Cameras are registered alongside the nodes.
//!
//! Draw operations consume the tree only through [`SceneWalker`], a pre-order
//! iterator that accumulates world transforms and can be told to skip the children
//! of the node it just returned.

use std::rc::Rc;
use crate::foundation::collections::{CameraId, NodeId, SlotMap};
use crate::foundation::math::{Mat4, Transform};
use crate::render::{MaterialId, Mesh, RenderError, RenderResult};
use super::camera::Camera;

/// Something a node can draw
#[derive(Debug, Clone)]
pub struct Drawable {
    /// Geometry
    pub mesh: Rc<Mesh>,
    /// Material whose uniforms apply while drawing
    pub material: MaterialId,
}

impl Drawable {
    /// Create a drawable
    pub fn new(mesh: Rc<Mesh>, material: MaterialId) -> Self {
        Self { mesh, material }
    }
}

/// One node of the scene tree
#[derive(Debug, Clone)]
pub struct SceneNode {
    name: String,
    /// Transform relative to the parent
    pub transform: Transform,
    drawable: Option<Drawable>,
    draw_distance: Option<f32>,
    cull_children: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SceneNode {
    fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            transform: Transform::identity(),
            drawable: None,
            draw_distance: None,
            cull_children: false,
            parent,
            children: Vec::new(),
        }
    }

    /// Node name, for debugging
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the node draws, if anything
    pub fn drawable(&self) -> Option<&Drawable> {
        self.drawable.as_ref()
    }

    /// Own culling distance; `None` defers to the draw operation
    pub fn draw_distance(&self) -> Option<f32> {
        self.draw_distance
    }

    /// Whether culling this node also culls its descendants
    pub fn culls_children(&self) -> bool {
        self.cull_children
    }

    /// Parent node (`None` for the root)
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena-backed scene tree plus cameras
#[derive(Debug)]
pub struct SceneGraph {
    nodes: SlotMap<NodeId, SceneNode>,
    cameras: SlotMap<CameraId, Camera>,
    root: NodeId,
}

impl SceneGraph {
    /// Create a graph holding only the root node
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(SceneNode::new("root", None));
        Self {
            nodes,
            cameras: SlotMap::with_key(),
            root,
        }
    }

    /// The root node
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root cannot be removed
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a child under `parent`
    pub fn add_node(&mut self, parent: NodeId, name: impl Into<String>) -> RenderResult<NodeId> {
        if !self.nodes.contains_key(parent) {
            return Err(RenderError::UnknownNode(parent));
        }
        let id = self.nodes.insert(SceneNode::new(name, Some(parent)));
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Remove a node and its whole subtree
    ///
    /// Drawables of removed nodes drop their mesh references; pools reap the meshes
    /// once nothing else holds them.
    pub fn remove_node(&mut self, id: NodeId) -> RenderResult<usize> {
        if id == self.root {
            return Err(RenderError::UnknownNode(id));
        }
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent.and_then(|parent| self.nodes.get_mut(parent)) {
            parent.children.retain(|child| *child != id);
        }

        let mut removed = 0;
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.remove(next) {
                pending.extend(node.children);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Move a node under a new parent
    ///
    /// Moving the root, or moving a node below itself or one of its own
    /// descendants, is rejected.
    pub fn reparent(&mut self, id: NodeId, new_parent: NodeId) -> RenderResult<()> {
        self.node(id)?;
        self.node(new_parent)?;
        let invalid = RenderError::InvalidReparent { node: id, parent: new_parent };
        if id == self.root {
            return Err(invalid);
        }

        let mut cursor = Some(new_parent);
        while let Some(ancestor) = cursor {
            if ancestor == id {
                return Err(invalid);
            }
            cursor = self.nodes.get(ancestor).and_then(|node| node.parent);
        }

        let old_parent = self.node(id)?.parent;
        if let Some(old) = old_parent.and_then(|old| self.nodes.get_mut(old)) {
            old.children.retain(|child| *child != id);
        }
        self.nodes[new_parent].children.push(id);
        self.nodes[id].parent = Some(new_parent);
        Ok(())
    }

    /// Look up a node
    pub fn node(&self, id: NodeId) -> RenderResult<&SceneNode> {
        self.nodes.get(id).ok_or(RenderError::UnknownNode(id))
    }

    /// Look up a node mutably
    pub fn node_mut(&mut self, id: NodeId) -> RenderResult<&mut SceneNode> {
        self.nodes.get_mut(id).ok_or(RenderError::UnknownNode(id))
    }

    /// Replace a node's local transform
    pub fn set_transform(&mut self, id: NodeId, transform: Transform) -> RenderResult<()> {
        self.node_mut(id)?.transform = transform;
        Ok(())
    }

    /// Attach or detach a drawable
    pub fn set_drawable(&mut self, id: NodeId, drawable: Option<Drawable>) -> RenderResult<()> {
        self.node_mut(id)?.drawable = drawable;
        Ok(())
    }

    /// Set the culling distance of a node
    pub fn set_draw_distance(&mut self, id: NodeId, distance: Option<f32>) -> RenderResult<()> {
        self.node_mut(id)?.draw_distance = distance;
        Ok(())
    }

    /// Choose whether culling the node also culls its descendants
    pub fn set_cull_children(&mut self, id: NodeId, cull: bool) -> RenderResult<()> {
        self.node_mut(id)?.cull_children = cull;
        Ok(())
    }

    /// Local-to-world transform of a node
    pub fn world_matrix(&self, id: NodeId) -> RenderResult<Mat4> {
        let mut matrix = self.node(id)?.transform.to_matrix();
        let mut cursor = self.node(id)?.parent;
        while let Some(parent) = cursor {
            let node = self.node(parent)?;
            matrix = node.transform.to_matrix() * matrix;
            cursor = node.parent;
        }
        Ok(matrix)
    }

    /// Register a camera
    pub fn add_camera(&mut self, camera: Camera) -> CameraId {
        self.cameras.insert(camera)
    }

    /// Unregister a camera
    pub fn remove_camera(&mut self, id: CameraId) -> Option<Camera> {
        self.cameras.remove(id)
    }

    /// Look up a camera
    pub fn camera(&self, id: CameraId) -> RenderResult<&Camera> {
        self.cameras.get(id).ok_or(RenderError::UnknownCamera(id))
    }

    /// Look up a camera mutably
    pub fn camera_mut(&mut self, id: CameraId) -> RenderResult<&mut Camera> {
        self.cameras.get_mut(id).ok_or(RenderError::UnknownCamera(id))
    }

    /// Pre-order walk of the subtree rooted at `root`
    pub fn walk(&self, root: NodeId) -> RenderResult<SceneWalker<'_>> {
        let parent_world = match self.node(root)?.parent {
            Some(parent) => self.world_matrix(parent)?,
            None => Mat4::identity(),
        };
        Ok(SceneWalker {
            graph: self,
            stack: vec![(root, parent_world)],
            last: None,
        })
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// A node visited by [`SceneWalker`]
#[derive(Debug, Clone, Copy)]
pub struct WalkEntry<'a> {
    /// Node handle
    pub id: NodeId,
    /// The node
    pub node: &'a SceneNode,
    /// Local-to-world transform
    pub world: Mat4,
}

/// Pre-order subtree iterator with skip-children support
///
/// Children of a node are only queued when the walk moves past it, so calling
/// [`skip_children`](Self::skip_children) right after receiving a node prunes its
/// whole subtree.
#[derive(Debug)]
pub struct SceneWalker<'a> {
    graph: &'a SceneGraph,
    stack: Vec<(NodeId, Mat4)>,
    last: Option<(NodeId, Mat4)>,
}

impl SceneWalker<'_> {
    /// Do not descend into the node returned last
    pub fn skip_children(&mut self) {
        self.last = None;
    }
}

impl<'a> Iterator for SceneWalker<'a> {
    type Item = WalkEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((id, world)) = self.last.take() {
            if let Some(node) = self.graph.nodes.get(id) {
                self.stack.extend(node.children.iter().rev().map(|child| (*child, world)));
            }
        }

        loop {
            let (id, parent_world) = self.stack.pop()?;
            let Some(node) = self.graph.nodes.get(id) else {
                continue;
            };
            let world = parent_world * node.transform.to_matrix();
            self.last = Some((id, world));
            return Some(WalkEntry { id, node, world });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{utils, Vec3};
    use approx::assert_relative_eq;

    fn tree() -> (SceneGraph, [NodeId; 5]) {
        //        root
        //       /    \
        //      a      d
        //     / \
        //    b   c
        let mut scene = SceneGraph::new();
        let root = scene.root();
        let a = scene.add_node(root, "a").unwrap();
        let b = scene.add_node(a, "b").unwrap();
        let c = scene.add_node(a, "c").unwrap();
        let d = scene.add_node(root, "d").unwrap();
        (scene, [root, a, b, c, d])
    }

    #[test]
    fn test_walk_is_pre_order() {
        let (scene, [root, a, b, c, d]) = tree();
        let order: Vec<NodeId> = scene.walk(root).unwrap().map(|entry| entry.id).collect();
        assert_eq!(order, vec![root, a, b, c, d]);
    }

    #[test]
    fn test_skip_children_prunes_subtree() {
        let (scene, [root, a, _, _, d]) = tree();
        let mut walker = scene.walk(root).unwrap();
        let mut order = Vec::new();
        while let Some(entry) = walker.next() {
            order.push(entry.id);
            if entry.id == a {
                walker.skip_children();
            }
        }
        assert_eq!(order, vec![root, a, d]);
    }

    #[test]
    fn test_world_transforms_accumulate() {
        let (mut scene, [root, a, b, _, _]) = tree();
        scene.set_transform(a, Transform::from_position(Vec3::new(1.0, 0.0, 0.0))).unwrap();
        scene.set_transform(b, Transform::from_position(Vec3::new(0.0, 2.0, 0.0))).unwrap();

        let walked = scene.walk(root).unwrap().find(|entry| entry.id == b).unwrap();
        assert_relative_eq!(utils::translation_of(&walked.world), Vec3::new(1.0, 2.0, 0.0));
        assert_relative_eq!(scene.world_matrix(b).unwrap(), walked.world);

        // Walking a subtree still starts from the right world position
        let from_a: Vec<_> = scene.walk(a).unwrap().collect();
        assert_relative_eq!(utils::translation_of(&from_a[0].world), Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_remove_and_reparent() {
        let (mut scene, [root, a, b, c, d]) = tree();
        assert!(matches!(
            scene.reparent(a, b),
            Err(RenderError::InvalidReparent { node, parent }) if node == a && parent == b
        ));
        assert!(matches!(scene.reparent(a, a), Err(RenderError::InvalidReparent { .. })));
        assert!(matches!(scene.reparent(root, d), Err(RenderError::InvalidReparent { .. })));

        scene.reparent(c, d).unwrap();
        assert_eq!(scene.node(d).unwrap().children(), &[c]);
        assert_eq!(scene.node(a).unwrap().children(), &[b]);

        assert_eq!(scene.remove_node(d).unwrap(), 2);
        assert!(scene.node(c).is_err());
        assert_eq!(scene.len(), 3);
        assert!(scene.remove_node(root).is_err());
    }
}
