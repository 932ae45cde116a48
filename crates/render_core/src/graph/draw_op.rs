//! Scene-subtree draw unit
//!
//! A [`DrawOp`] renders one subtree of the scene through one camera, optionally under
//! its own state. Execution walks the subtree, drops nodes that are too far from the
//! camera, hands every surviving mesh to its buffer pool, and then alternates between
//! committing the pools and drawing until every mesh is on screen.
//!
//! With the pools as they are, the first pass always draws everything: all queued
//! meshes land in the newest generation, and a successful commit backs the whole
//! generation. Further passes only guard against a pool dropping backing between
//! commit and draw. `DrawConfig::max_commit_passes` bounds them; a limit of zero
//! refuses to draw at all.

use std::collections::BTreeSet;
use std::rc::Rc;
use crate::foundation::collections::{CameraId, NodeId};
use crate::foundation::math::{utils, Mat4};
use crate::render::{CommitReport, FormatId, MaterialId, Mesh, RenderError, RenderResult, RenderState, UniformValue};
use super::Frame;

/// Uniform receiving the model matrix of each draw
pub const MODEL_UNIFORM: &str = "u_model";

/// Uniform receiving the model-view-projection matrix of each draw
pub const MVP_UNIFORM: &str = "u_mvp";

/// What one execution did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawReport {
    /// Nodes visited by the walk
    pub visited: usize,
    /// Nodes dropped by distance culling
    pub culled: usize,
    /// Draw calls issued
    pub drawn: usize,
    /// Commit/draw passes taken
    pub passes: u32,
    /// Pool commits performed along the way
    pub commits: CommitReport,
}

impl DrawReport {
    /// Add another report's counters to this one
    pub fn absorb(&mut self, other: &DrawReport) {
        self.visited += other.visited;
        self.culled += other.culled;
        self.drawn += other.drawn;
        self.passes += other.passes;
        self.commits.absorb(&other.commits);
    }
}

/// Draws one scene subtree through one camera
#[derive(Debug, Clone)]
pub struct DrawOp {
    /// Subtree root
    pub root: NodeId,
    /// Camera to view through
    pub camera: CameraId,
    /// State pushed for the duration of the draw
    pub state: Option<Rc<RenderState>>,
    /// Culling distance for nodes without their own (falls back to the frame config)
    pub draw_distance: Option<f32>,
}

struct Queued {
    mesh: Rc<Mesh>,
    material: MaterialId,
    model: Mat4,
}

impl DrawOp {
    /// Draw `root` and its descendants through `camera`
    pub fn new(root: NodeId, camera: CameraId) -> Self {
        Self {
            root,
            camera,
            state: None,
            draw_distance: None,
        }
    }

    /// Push `state` around the draw
    pub fn with_state(mut self, state: Rc<RenderState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Cull nodes farther than `distance` unless they set their own
    pub fn with_draw_distance(mut self, distance: f32) -> Self {
        self.draw_distance = Some(distance);
        self
    }

    /// Run the draw
    ///
    /// The state override is popped again even when drawing fails. The draw error
    /// wins over an error raised by that pop.
    pub fn execute(&self, frame: &mut Frame<'_>) -> RenderResult<DrawReport> {
        if let Some(state) = &self.state {
            frame.ctx.push_state(Rc::clone(state))?;
        }

        let result = self.draw(frame);

        if self.state.is_some() {
            let popped = frame.ctx.pop_state();
            if result.is_ok() {
                popped?;
            } else if let Err(e) = popped {
                log::warn!("Restoring state after a failed draw also failed: {}", e);
            }
        }
        result
    }

    fn draw(&self, frame: &mut Frame<'_>) -> RenderResult<DrawReport> {
        let mut report = DrawReport::default();
        let camera = frame.scene.camera(self.camera)?;
        let view_projection = camera.view_projection_matrix();
        let fallback = self.draw_distance.or(frame.config.default_draw_distance);

        let mut queue = Vec::new();
        let mut walker = frame.scene.walk(self.root)?;
        while let Some(entry) = walker.next() {
            report.visited += 1;

            if let Some(limit) = entry.node.draw_distance().or(fallback) {
                if camera.distance_to(utils::translation_of(&entry.world)) > limit {
                    report.culled += 1;
                    if entry.node.culls_children() {
                        walker.skip_children();
                    }
                    continue;
                }
            }

            if let Some(drawable) = entry.node.drawable() {
                queue.push(Queued {
                    mesh: Rc::clone(&drawable.mesh),
                    material: drawable.material,
                    model: entry.world,
                });
            }
        }

        let mut touched = BTreeSet::new();
        for item in &queue {
            frame.pools.add_mesh(&item.mesh)?;
            touched.insert(item.mesh.format().id);
        }

        while !queue.is_empty() {
            if report.passes >= frame.config.max_commit_passes {
                return Err(RenderError::CommitStalled { remaining: queue.len() });
            }
            report.passes += 1;

            for format in &touched {
                let commit = frame.pools.end_generation(frame.ctx.device_mut(), *format)?;
                report.commits.absorb(&commit);
            }

            let before = queue.len();
            let mut waiting = Vec::new();
            for item in queue {
                if Self::draw_one(frame, &item, &view_projection)? {
                    report.drawn += 1;
                } else {
                    waiting.push(item);
                }
            }

            // Every queued mesh sits in the newest generation, which a commit backs
            // in full and eviction never touches, so one pass draws everything
            debug_assert!(waiting.is_empty(), "{} committed mesh(es) left without backing", waiting.len());
            if waiting.len() == before {
                return Err(RenderError::CommitStalled { remaining: waiting.len() });
            }
            // Backing lost between commit and draw: queue for the next commit
            for item in &waiting {
                frame.pools.add_mesh(&item.mesh)?;
            }
            queue = waiting;
        }

        log::trace!(
            "DrawOp {:?}: visited {}, culled {}, drew {} in {} pass(es)",
            self.root, report.visited, report.culled, report.drawn, report.passes
        );
        Ok(report)
    }

    fn draw_one(frame: &mut Frame<'_>, item: &Queued, view_projection: &Mat4) -> RenderResult<bool> {
        let format: FormatId = item.mesh.format().id;
        let resident = frame
            .pools
            .pool(format)
            .map_or(false, |pool| pool.is_resident(&item.mesh));
        if !resident {
            return Ok(false);
        }

        frame.ctx.bind_material(item.material)?;
        frame.ctx.set_transient_uniform(MODEL_UNIFORM, &UniformValue::Mat4(item.model))?;
        frame.ctx.set_transient_uniform(MVP_UNIFORM, &UniformValue::Mat4(view_projection * item.model))?;
        frame.pools.draw(frame.ctx.device_mut(), &item.mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DrawConfig, PoolConfig};
    use crate::foundation::math::{Transform, Vec3};
    use crate::render::headless::BrittleDevice;
    use crate::render::{
        DeviceCall, DeviceError, FormatId, HeadlessDevice, IndexType, PoolSet, RenderContext, ShaderId, VertexFormat,
    };
    use crate::scene::{Camera, Drawable, SceneGraph};

    const FORMAT: VertexFormat = VertexFormat::new(FormatId(1), 16, IndexType::U16);

    fn mesh() -> Rc<Mesh> {
        Rc::new(Mesh::new(FORMAT, 4, 6, vec![0; 64], vec![0; 12]).unwrap())
    }

    struct Fixture {
        scene: SceneGraph,
        pools: PoolSet,
        ctx: RenderContext,
        config: DrawConfig,
        camera: CameraId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut scene = SceneGraph::new();
            let camera = scene.add_camera(Camera::perspective(Vec3::zeros(), 60.0, 1.0, 0.1, 500.0));
            Self {
                scene,
                pools: PoolSet::new(PoolConfig::default()),
                ctx: RenderContext::new(Box::new(HeadlessDevice::new())),
                config: DrawConfig::default(),
                camera,
            }
        }

        fn place(&mut self, parent: NodeId, x: f32) -> NodeId {
            let node = self.scene.add_node(parent, "mesh").unwrap();
            self.scene.set_transform(node, Transform::from_position(Vec3::new(x, 0.0, 0.0))).unwrap();
            self.scene.set_drawable(node, Some(Drawable::new(mesh(), MaterialId(1)))).unwrap();
            node
        }

        fn run(&mut self, op: &DrawOp) -> RenderResult<DrawReport> {
            let mut frame = Frame::new(&self.scene, &mut self.pools, &mut self.ctx, &self.config);
            op.execute(&mut frame)
        }

        fn draws(&self) -> usize {
            let device = self.ctx.device_as::<HeadlessDevice>().unwrap();
            device
                .calls()
                .iter()
                .filter(|call| matches!(call, DeviceCall::DrawIndexed(_)))
                .count()
        }
    }

    #[test]
    fn test_draws_every_mesh_in_subtree() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        fx.place(root, 1.0);
        fx.place(root, 2.0);
        fx.place(root, 3.0);

        let report = fx.run(&DrawOp::new(root, fx.camera)).unwrap();
        assert_eq!(report.visited, 4);
        assert_eq!(report.drawn, 3);
        assert_eq!(report.passes, 1);
        assert_eq!(report.commits.meshes_committed, 3);
        assert_eq!(fx.draws(), 3);
    }

    #[test]
    fn test_distance_culling_with_skip_children() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        fx.place(root, 5.0);

        // Far group whose children sit back near the camera
        let far = fx.place(root, 100.0);
        fx.scene.set_cull_children(far, true).unwrap();
        fx.place(far, -98.0);

        // Far node without skip: its near child is still drawn
        let far_open = fx.place(root, 100.0);
        fx.place(far_open, -99.0);

        let report = fx.run(&DrawOp::new(root, fx.camera).with_draw_distance(50.0)).unwrap();
        assert_eq!(report.culled, 2);
        assert_eq!(report.drawn, 2);
        assert_eq!(report.visited, 5);
    }

    #[test]
    fn test_node_distance_overrides_op_distance() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        let near = fx.place(root, 5.0);
        fx.scene.set_draw_distance(near, Some(1.0)).unwrap();
        fx.place(root, 40.0);

        fx.config = DrawConfig::new().with_draw_distance(50.0);
        let report = fx.run(&DrawOp::new(root, fx.camera)).unwrap();
        assert_eq!(report.culled, 1);
        assert_eq!(report.drawn, 1);
    }

    #[test]
    fn test_state_override_is_popped() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        fx.place(root, 1.0);

        let state = Rc::new(RenderState::new().with_shader(ShaderId(4)));
        fx.run(&DrawOp::new(root, fx.camera).with_state(state)).unwrap();
        assert_eq!(fx.ctx.depth(), 0);

        let device = fx.ctx.device_as::<HeadlessDevice>().unwrap();
        assert!(device.uniform(MVP_UNIFORM).is_some());
        assert!(device.uniform(MODEL_UNIFORM).is_some());
    }

    #[test]
    fn test_unknown_camera_still_pops_state() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        let camera = fx.camera;
        fx.scene.remove_camera(camera);

        let op = DrawOp::new(root, camera).with_state(Rc::new(RenderState::new()));
        assert!(matches!(fx.run(&op), Err(RenderError::UnknownCamera(_))));
        assert_eq!(fx.ctx.depth(), 0);
    }

    #[test]
    fn test_out_of_memory_surfaces() {
        let mut fx = Fixture::new();
        fx.ctx = RenderContext::new(Box::new(HeadlessDevice::new().with_memory_budget(100)));
        let root = fx.scene.root();
        fx.place(root, 1.0);
        fx.place(root, 2.0);

        assert!(matches!(
            fx.run(&DrawOp::new(root, fx.camera)),
            Err(RenderError::OutOfMemory { .. })
        ));
        assert_eq!(fx.draws(), 0);
    }

    #[test]
    fn test_draw_error_wins_over_restore_error() {
        let mut fx = Fixture::new();
        fx.ctx = RenderContext::new(Box::new(BrittleDevice::default()));
        fx.ctx.push_state(Rc::new(RenderState::new().with_shader(ShaderId(1)))).unwrap();
        let root = fx.scene.root();
        fx.place(root, 1.0);

        // Popping the override rebinds shader 1, which fails once the draw has failed
        let op = DrawOp::new(root, fx.camera).with_state(Rc::new(RenderState::new().with_shader(ShaderId(2))));
        match fx.run(&op) {
            Err(RenderError::Device(DeviceError::Fatal(message))) => assert_eq!(message, "draw refused"),
            other => panic!("expected the draw failure, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_pass_limit() {
        let mut fx = Fixture::new();
        let root = fx.scene.root();
        fx.place(root, 1.0);
        fx.place(root, 2.0);

        fx.config.max_commit_passes = 0;
        assert!(matches!(
            fx.run(&DrawOp::new(root, fx.camera)),
            Err(RenderError::CommitStalled { remaining: 2 })
        ));
        assert_eq!(fx.draws(), 0);

        fx.config.max_commit_passes = 1;
        let report = fx.run(&DrawOp::new(root, fx.camera)).unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.drawn, 2);
        assert_eq!(fx.draws(), 2);
    }
}
