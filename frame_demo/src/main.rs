//! Frame demo application
//!
//! Drives the render core on the headless device: a field of randomly placed cubes
//! viewed by an orbiting camera, rendered through a small target graph (a depth
//! pre-pass, the main pass and a repeated overlay). Cubes are spawned and destroyed
//! while frames run, so buffer pool generations fill up, get reaped and, under the
//! configured memory budget, evicted.
//!
//! Usage: `frame_demo [config.toml|config.ron] [frames]`

use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use rand::Rng;
use render_core::foundation::logging;
use render_core::foundation::math::Quat;
use render_core::prelude::*;
use render_core::core::ConfigError;
use thiserror::Error;

const CUBE_FORMAT: VertexFormat = VertexFormat::new(FormatId(1), 28, IndexType::U16);
const SHADOW_TARGET: ColorTargetId = ColorTargetId(1);
const FIELD_RADIUS: f32 = 60.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

#[derive(Error, Debug)]
enum DemoError {
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid frame count '{0}'")]
    FrameCount(String),
}

struct FrameDemo {
    engine: Engine,
    camera: CameraId,
    field: NodeId,
    cubes: Vec<NodeId>,
    roots: Vec<TargetId>,
    orbit: f32,
}

impl FrameDemo {
    fn new(config: RenderCoreConfig) -> Result<Self, DemoError> {
        log::info!("Creating frame demo...");
        let mut engine = Engine::headless(config)?;

        let mut camera = Camera::perspective(Vec3::new(0.0, 20.0, 80.0), 60.0, 16.0 / 9.0, 0.1, 500.0);
        camera.look_at(Vec3::zeros(), Vec3::new(0.0, 1.0, 0.0));
        let camera = engine.scene.add_camera(camera);

        let root = engine.scene.root();
        let field = engine.scene.add_node(root, "field")?;

        let mut demo = Self {
            engine,
            camera,
            field,
            cubes: Vec::new(),
            roots: Vec::new(),
            orbit: 0.0,
        };
        demo.spawn_cubes(64)?;
        demo.build_targets()?;
        Ok(demo)
    }

    fn build_targets(&mut self) -> Result<(), DemoError> {
        let targets = &mut self.engine.targets;

        // Depth-only pre-pass into its own target, limited to nearby cubes
        let depth = targets.create("depth_prepass");
        targets.set_base_state(
            depth,
            Some(Rc::new(
                RenderState::new()
                    .with_flags(StateFlags::DEPTH_TEST | StateFlags::DEPTH_WRITE, true)
                    .with_flags(StateFlags::COLOR_WRITE, false)
                    .with_shader(ShaderId(1))
                    .with_color_target(SHADOW_TARGET),
            )),
        )?;
        targets.add_step(depth, Step::Clear(ClearOp::depth_only(1.0)))?;
        targets.add_step(
            depth,
            Step::Draw(DrawOp::new(self.field, self.camera).with_draw_distance(FIELD_RADIUS)),
        )?;

        // Two blended overlay layers drawn on top of the main pass
        let overlay = targets.create("overlay");
        targets.set_base_state(
            overlay,
            Some(Rc::new(
                RenderState::new()
                    .with_flags(StateFlags::DEPTH_TEST, false)
                    .with_blend(BlendMode::Alpha)
                    .with_shader(ShaderId(3))
                    .with_uniform(MaterialId::GLOBAL, "u_opacity", UniformValue::Float(0.25)),
            )),
        )?;
        targets.add_step(overlay, Step::Draw(DrawOp::new(self.field, self.camera)))?;
        targets.set_repeat(overlay, 2)?;

        let main = targets.create("main");
        targets.set_base_state(
            main,
            Some(Rc::new(
                RenderState::new()
                    .with_flags(StateFlags::DEPTH_TEST | StateFlags::COLOR_WRITE | StateFlags::CULL_FACE, true)
                    .with_flags(StateFlags::DEPTH_WRITE, false)
                    .with_blend(BlendMode::Opaque)
                    .with_shader(ShaderId(2))
                    .with_color_target(ColorTargetId::SCREEN)
                    .with_uniform(MaterialId(1), "u_tint", UniformValue::Vec4([0.8, 0.7, 0.5, 1.0])),
            )),
        )?;
        targets.add_dep(main, depth)?;
        targets.add_step(main, Step::Clear(ClearOp::new([0.02, 0.02, 0.05, 1.0], 1.0)))?;
        targets.add_step(main, Step::Draw(DrawOp::new(self.field, self.camera)))?;
        targets.add_step(main, Step::Hit(overlay))?;

        self.roots = vec![main];
        log::info!("Built {} targets", targets.len());
        Ok(())
    }

    fn spawn_cubes(&mut self, count: usize) -> Result<(), DemoError> {
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            let position = Vec3::new(
                rng.gen_range(-FIELD_RADIUS..FIELD_RADIUS),
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-FIELD_RADIUS..FIELD_RADIUS),
            );
            let spin = Quat::from_euler_angles(
                rng.gen_range(0.0..std::f32::consts::TAU),
                rng.gen_range(0.0..std::f32::consts::TAU),
                0.0,
            );
            let size = rng.gen_range(0.5..3.0);
            let color = [rng.gen(), rng.gen(), rng.gen(), 1.0];
            let material = MaterialId(rng.gen_range(1..4));

            let node = self.engine.scene.add_node(self.field, "cube")?;
            self.engine.scene.set_transform(node, Transform::from_position_rotation(position, spin))?;
            self.engine
                .scene
                .set_drawable(node, Some(Drawable::new(Rc::new(cube(size, color)?), material)))?;
            self.cubes.push(node);
        }
        Ok(())
    }

    fn despawn_cubes(&mut self, count: usize) -> Result<(), DemoError> {
        let mut rng = rand::thread_rng();
        for _ in 0..count.min(self.cubes.len()) {
            let node = self.cubes.swap_remove(rng.gen_range(0..self.cubes.len()));
            self.engine.scene.remove_node(node)?;
        }
        Ok(())
    }

    fn update(&mut self, frame: u64) -> Result<(), DemoError> {
        self.orbit += 0.02;
        let position = Vec3::new(80.0 * self.orbit.sin(), 20.0, 80.0 * self.orbit.cos());
        self.engine.scene.camera_mut(self.camera)?.set_position(position);

        if frame % 10 == 0 {
            self.despawn_cubes(8)?;
            self.spawn_cubes(12)?;
        }
        Ok(())
    }

    fn run(&mut self, frames: u64) -> Result<(), DemoError> {
        log::info!("Running {} frames...", frames);
        for frame in 1..=frames {
            self.update(frame)?;
            let report = self.engine.render_frame(&self.roots)?;
            if frame % 30 == 0 || frame == frames {
                log::info!(
                    "Frame {}: {} executions, {} visited, {} culled, {} drawn, {} committed, {} generation(s) evicted",
                    report.frame,
                    report.executions,
                    report.draws.visited,
                    report.draws.culled,
                    report.draws.drawn,
                    report.draws.commits.meshes_committed + report.flush.meshes_committed,
                    report.draws.commits.generations_evicted + report.flush.generations_evicted,
                );
            }
        }
        Ok(())
    }

    fn report(&self) {
        let pools = self.engine.pools().stats();
        log::info!(
            "Pools: {} generations opened, {} evicted, {} meshes committed, {} reaped, {} bytes resident",
            pools.generations_opened,
            pools.generations_evicted,
            pools.meshes_committed,
            pools.meshes_reaped,
            pools.bytes_resident
        );

        let ctx = self.engine.context().stats();
        log::info!(
            "Context: {} state entries, {} flag changes, {} shader binds, {} uniforms sent, {} skipped",
            ctx.enters,
            ctx.flag_changes,
            ctx.shader_binds,
            ctx.uniforms_sent,
            ctx.uniforms_skipped
        );

        if let Some(device) = self.engine.context().device_as::<HeadlessDevice>() {
            log::info!(
                "Device: {} draw calls, {} buffers live, {} bytes in use",
                device.draw_count(),
                device.buffer_count(),
                device.memory_used()
            );
        }
    }
}

/// Build an axis-aligned cube of edge length `size` centred on the origin
fn cube(size: f32, color: [f32; 4]) -> RenderResult<Mesh> {
    let h = size * 0.5;
    let vertices: Vec<Vertex> = (0..8)
        .map(|i| Vertex {
            position: [
                if i & 1 == 0 { -h } else { h },
                if i & 2 == 0 { -h } else { h },
                if i & 4 == 0 { -h } else { h },
            ],
            color,
        })
        .collect();

    #[rustfmt::skip]
    let indices: [u32; 36] = [
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 3, 6, 7, // +y
        0, 4, 2, 2, 4, 6, // -x
        1, 3, 5, 3, 7, 5, // +x
    ];

    Mesh::from_vertices(CUBE_FORMAT, &vertices, &indices)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match load_config(args.get(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    logging::init_with_level(&config.engine.log_level);
    log::info!("Starting frame demo");

    if let Err(e) = run(config, args.get(2)) {
        log::error!("Frame demo failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&String>) -> Result<RenderCoreConfig, DemoError> {
    match path {
        Some(path) => Ok(RenderCoreConfig::load_from_file(path)?),
        None => Ok(RenderCoreConfig {
            device: DeviceConfig::default().with_memory_budget(64 * 1024),
            ..RenderCoreConfig::default()
        }),
    }
}

fn run(config: RenderCoreConfig, frames: Option<&String>) -> Result<(), DemoError> {
    let frames = match frames {
        Some(text) => text.parse().map_err(|_| DemoError::FrameCount(text.clone()))?,
        None => 120,
    };

    let mut demo = FrameDemo::new(config)?;
    demo.run(frames)?;
    demo.report();
    demo.engine.shutdown()?;
    log::info!("Frame demo complete");
    Ok(())
}
