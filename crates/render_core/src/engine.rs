//! Core engine implementation

use crate::{
    core::{Config, RenderCoreConfig},
    foundation::collections::TargetId,
    graph::{DrawReport, Frame, TargetGraph},
    render::{CommitReport, GraphicsDevice, HeadlessDevice, PoolSet, RenderContext, RenderError, RenderResult},
    scene::SceneGraph,
};

/// What one frame did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Frame number, starting at 1
    pub frame: u64,
    /// Target executions across all roots
    pub executions: usize,
    /// Combined draw statistics
    pub draws: DrawReport,
    /// Clear steps run
    pub clears: usize,
    /// End-of-frame flush of every pool
    pub flush: CommitReport,
}

/// Main engine struct
///
/// Owns the scene, the target graph, the buffer pools and the device context, and
/// lends them to the scheduler once per frame.
pub struct Engine {
    /// Scene graph draw operations read from
    pub scene: SceneGraph,

    /// Render targets
    pub targets: TargetGraph,

    /// Buffer pools, one per vertex format
    pub pools: PoolSet,

    /// Device and state stack
    pub ctx: RenderContext,

    /// Engine configuration
    config: RenderCoreConfig,

    /// Frames rendered so far
    frame_count: u64,
}

impl Engine {
    /// Create an engine driving `device`
    ///
    /// Fails with [`RenderError::Config`] if `config` does not validate.
    pub fn new(config: RenderCoreConfig, device: Box<dyn GraphicsDevice>) -> RenderResult<Self> {
        log::info!("Initializing render core...");
        config.validate()?;
        if config.engine.debug_mode {
            log::debug!("Debug mode: pool consistency is checked after every frame");
        }

        Ok(Self {
            scene: SceneGraph::new(),
            targets: TargetGraph::new(),
            pools: PoolSet::new(config.pools.clone()),
            ctx: RenderContext::new(device),
            config,
            frame_count: 0,
        })
    }

    /// Create an engine on a [`HeadlessDevice`] configured from `config.device`
    pub fn headless(config: RenderCoreConfig) -> RenderResult<Self> {
        let device = HeadlessDevice::from_config(&config.device);
        Self::new(config, Box::new(device))
    }

    /// Hit every root target in order, then flush all pools
    ///
    /// In debug mode the pools are checked for consistency once flushed.
    pub fn render_frame(&mut self, roots: &[TargetId]) -> RenderResult<FrameReport> {
        self.frame_count += 1;
        let mut report = FrameReport {
            frame: self.frame_count,
            ..FrameReport::default()
        };

        {
            let mut frame = Frame::new(&self.scene, &mut self.pools, &mut self.ctx, &self.config.draw);
            for &root in roots {
                let hit = self.targets.hit(root, &mut frame)?;
                report.executions += hit.executions.len();
                report.draws.absorb(&hit.draws);
                report.clears += hit.clears;
            }
        }

        report.flush = self.pools.end_all_generations(self.ctx.device_mut())?;
        self.pools.reap_all(self.ctx.device_mut())?;
        if self.config.engine.debug_mode {
            self.check_pools()?;
        }

        log::debug!(
            "Frame {}: {} execution(s), {} draw(s), {} clear(s)",
            report.frame,
            report.executions,
            report.draws.drawn,
            report.clears
        );
        Ok(report)
    }

    /// Verify the bookkeeping of every buffer pool
    pub fn check_pools(&self) -> RenderResult<()> {
        for pool in self.pools.iter() {
            pool.check_invariants().map_err(|reason| {
                log::error!("Buffer pool {:?} is inconsistent: {}", pool.format().id, reason);
                RenderError::InvariantViolation(format!("pool {:?}: {}", pool.format().id, reason))
            })?;
        }
        Ok(())
    }

    /// Release every pooled buffer
    pub fn shutdown(&mut self) -> RenderResult<()> {
        log::info!("Shutting down render core after {} frame(s)", self.frame_count);
        self.pools.release_all(self.ctx.device_mut())
    }

    /// Get the configuration
    pub fn config(&self) -> &RenderCoreConfig {
        &self.config
    }

    /// Get the scene graph
    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    /// Get mutable access to the scene graph
    pub fn scene_mut(&mut self) -> &mut SceneGraph {
        &mut self.scene
    }

    /// Get the target graph
    pub fn targets(&self) -> &TargetGraph {
        &self.targets
    }

    /// Get mutable access to the target graph
    pub fn targets_mut(&mut self) -> &mut TargetGraph {
        &mut self.targets
    }

    /// Get the buffer pools
    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Get the device context
    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    /// Get mutable access to the device context
    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }

    /// Frames rendered so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("frame_count", &self.frame_count)
            .field("nodes", &self.scene.len())
            .field("targets", &self.targets.len())
            .field("pools", &self.pools.len())
            .field("state_depth", &self.ctx.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConfigError, DeviceConfig, DrawConfig, EngineConfig};
    use crate::foundation::math::{Transform, Vec3};
    use crate::graph::{ClearOp, DrawOp, Step};
    use crate::render::{FormatId, IndexType, MaterialId, Mesh, VertexFormat};
    use crate::scene::{Camera, Drawable};
    use std::rc::Rc;

    const FORMAT: VertexFormat = VertexFormat::new(FormatId(2), 16, IndexType::U16);

    fn populate(engine: &mut Engine, meshes: usize) -> TargetId {
        let camera = engine
            .scene
            .add_camera(Camera::perspective(Vec3::new(0.0, 0.0, 10.0), 60.0, 1.0, 0.1, 100.0));
        let root = engine.scene.root();
        for i in 0..meshes {
            let node = engine.scene.add_node(root, format!("mesh{i}")).unwrap();
            engine
                .scene
                .set_transform(node, Transform::from_position(Vec3::new(i as f32, 0.0, 0.0)))
                .unwrap();
            let mesh = Rc::new(Mesh::new(FORMAT, 4, 6, vec![i as u8; 64], vec![0; 12]).unwrap());
            engine
                .scene
                .set_drawable(node, Some(Drawable::new(mesh, MaterialId::GLOBAL)))
                .unwrap();
        }

        let main = engine.targets.create("main");
        engine
            .targets
            .add_step(main, Step::Clear(ClearOp::new([0.0, 0.0, 0.0, 1.0], 1.0)))
            .unwrap();
        engine.targets.add_step(main, Step::Draw(DrawOp::new(root, camera))).unwrap();
        main
    }

    #[test]
    fn test_render_frame_draws_scene() {
        let mut engine = Engine::headless(RenderCoreConfig::default()).unwrap();
        let main = populate(&mut engine, 3);

        let report = engine.render_frame(&[main]).unwrap();
        assert_eq!(report.frame, 1);
        assert_eq!(report.executions, 1);
        assert_eq!(report.clears, 1);
        assert_eq!(report.draws.drawn, 3);

        let second = engine.render_frame(&[main]).unwrap();
        assert_eq!(second.frame, 2);
        assert_eq!(second.draws.drawn, 3);
        assert_eq!(second.draws.commits.meshes_committed, 0);
        assert_eq!(engine.pools().stats().meshes_committed, 3);
    }

    #[test]
    fn test_shutdown_releases_buffers() {
        let mut engine = Engine::headless(RenderCoreConfig::default()).unwrap();
        let main = populate(&mut engine, 2);
        engine.render_frame(&[main]).unwrap();
        assert!(engine.context().device().memory_used() > 0);

        engine.shutdown().unwrap();
        assert_eq!(engine.context().device().memory_used(), 0);
    }

    #[test]
    fn test_memory_budget_from_config() {
        let config = RenderCoreConfig {
            device: DeviceConfig::default().with_memory_budget(64),
            ..RenderCoreConfig::default()
        };
        let mut engine = Engine::headless(config).unwrap();
        let main = populate(&mut engine, 2);
        assert!(matches!(
            engine.render_frame(&[main]),
            Err(RenderError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_invalid_draw_config_is_rejected() {
        let config = RenderCoreConfig {
            draw: DrawConfig {
                default_draw_distance: Some(-1.0),
                max_commit_passes: 0,
            },
            ..RenderCoreConfig::default()
        };
        assert!(matches!(
            Engine::headless(config),
            Err(RenderError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_debug_mode_checks_pools() {
        let config = RenderCoreConfig {
            engine: EngineConfig::default().with_debug(true),
            ..RenderCoreConfig::default()
        };
        let mut engine = Engine::headless(config).unwrap();
        let main = populate(&mut engine, 3);
        engine.render_frame(&[main]).unwrap();
        engine.check_pools().unwrap();

        engine.pools.pool_mut(FORMAT).unwrap().skew_resident_bytes(8);
        assert!(matches!(
            engine.render_frame(&[main]),
            Err(RenderError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_pools_unchecked_without_debug_mode() {
        let config = RenderCoreConfig {
            engine: EngineConfig::default().with_debug(false),
            ..RenderCoreConfig::default()
        };
        let mut engine = Engine::headless(config).unwrap();
        let main = populate(&mut engine, 2);
        engine.render_frame(&[main]).unwrap();

        engine.pools.pool_mut(FORMAT).unwrap().skew_resident_bytes(8);
        engine.render_frame(&[main]).unwrap();
        assert!(engine.check_pools().is_err());
    }
}
