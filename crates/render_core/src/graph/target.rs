//! Render targets and their scheduler
//!
//! A [`Target`] is a render goal: an ordered list of [`Step`]s plus the targets that
//! must have run before it. [`TargetGraph::hit`] resolves the dependency closure of a
//! target and executes it in passes, like a phase plan:
//!
//! ```text
//! remaining = closure(root)
//! loop {
//!     ready   = { t in remaining | requires(t) ∩ remaining = ∅ }
//!     execute ready (creation order)
//!     remaining -= ready
//! }
//! ```
//!
//! A pass that finds nothing ready means the closure contains a cycle, which is
//! reported instead of looping.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use crate::foundation::collections::{SlotMap, TargetId};
use crate::render::{ColorTargetId, RenderContext, RenderError, RenderResult, RenderState};
use super::{DrawOp, DrawReport, Frame};

/// Clear of a color target's color and/or depth buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearOp {
    /// Target to clear (`None` = whatever the effective state selects)
    pub target: Option<ColorTargetId>,
    /// Clear color, if the color buffer should be cleared
    pub color: Option<[f32; 4]>,
    /// Clear depth, if the depth buffer should be cleared
    pub depth: Option<f32>,
}

impl ClearOp {
    /// Clear color and depth of the effective color target
    pub fn new(color: [f32; 4], depth: f32) -> Self {
        Self {
            target: None,
            color: Some(color),
            depth: Some(depth),
        }
    }

    /// Clear only the depth buffer
    pub fn depth_only(depth: f32) -> Self {
        Self {
            target: None,
            color: None,
            depth: Some(depth),
        }
    }

    /// Clear `target` instead of the effective color target
    pub fn on_target(mut self, target: ColorTargetId) -> Self {
        self.target = Some(target);
        self
    }
}

/// One unit of work in a target's step list
#[derive(Debug, Clone)]
pub enum Step {
    /// Draw a scene subtree
    Draw(DrawOp),
    /// Hit another target (its whole closure) at this point
    Hit(TargetId),
    /// Clear a color target
    Clear(ClearOp),
}

/// Render goal in a [`TargetGraph`]
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    steps: Vec<Step>,
    deps: Vec<TargetId>,
    seq_deps: Vec<TargetId>,
    base_state: Option<Rc<RenderState>>,
    repeat: u32,
    order: u64,
}

impl Target {
    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Targets that must run first, in any order
    pub fn deps(&self) -> &[TargetId] {
        &self.deps
    }

    /// Targets that must run first, each after the previous one
    pub fn seq_deps(&self) -> &[TargetId] {
        &self.seq_deps
    }

    /// State pushed around the steps
    pub fn base_state(&self) -> Option<&Rc<RenderState>> {
        self.base_state.as_ref()
    }

    /// How many times the step list runs per hit
    pub fn repeat(&self) -> u32 {
        self.repeat
    }
}

/// What one hit executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitReport {
    /// Targets in the order they executed, including nested hits
    pub executions: Vec<TargetId>,
    /// Combined report of every draw step
    pub draws: DrawReport,
    /// Clear steps run
    pub clears: usize,
}

/// Owner of all targets and their edges
#[derive(Debug, Default)]
pub struct TargetGraph {
    targets: SlotMap<TargetId, Target>,
    next_order: u64,
}

impl TargetGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a target with no steps, no dependencies and a repeat of one
    pub fn create(&mut self, name: impl Into<String>) -> TargetId {
        let order = self.next_order;
        self.next_order += 1;
        let name = name.into();
        log::debug!("Created target '{}'", name);
        self.targets.insert(Target {
            name,
            steps: Vec::new(),
            deps: Vec::new(),
            seq_deps: Vec::new(),
            base_state: None,
            repeat: 1,
            order,
        })
    }

    /// Remove a target along with every edge and hit step that names it
    pub fn remove_target(&mut self, id: TargetId) -> RenderResult<Target> {
        let removed = self.targets.remove(id).ok_or(RenderError::UnknownTarget(id))?;
        for (_, target) in self.targets.iter_mut() {
            target.deps.retain(|&dep| dep != id);
            target.seq_deps.retain(|&dep| dep != id);
            target.steps.retain(|step| !matches!(step, Step::Hit(hit) if *hit == id));
        }
        log::debug!("Removed target '{}'", removed.name);
        Ok(removed)
    }

    /// Look up a target
    pub fn target(&self, id: TargetId) -> RenderResult<&Target> {
        self.targets.get(id).ok_or(RenderError::UnknownTarget(id))
    }

    fn target_mut(&mut self, id: TargetId) -> RenderResult<&mut Target> {
        self.targets.get_mut(id).ok_or(RenderError::UnknownTarget(id))
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the graph has no targets
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Append a step
    pub fn add_step(&mut self, id: TargetId, step: Step) -> RenderResult<()> {
        if let Step::Hit(hit) = step {
            self.target(hit)?;
        }
        self.target_mut(id)?.steps.push(step);
        Ok(())
    }

    /// Drop every step, keeping edges and state
    pub fn clear_steps(&mut self, id: TargetId) -> RenderResult<()> {
        self.target_mut(id)?.steps.clear();
        Ok(())
    }

    /// Make `id` wait for `dep`
    pub fn add_dep(&mut self, id: TargetId, dep: TargetId) -> RenderResult<()> {
        self.check_edge(id, dep)?;
        let target = self.target_mut(id)?;
        if !target.deps.contains(&dep) {
            target.deps.push(dep);
        }
        Ok(())
    }

    /// Make `id` wait for `dep`, which itself waits for the previously added sequential dependency
    pub fn add_seq_dep(&mut self, id: TargetId, dep: TargetId) -> RenderResult<()> {
        self.check_edge(id, dep)?;
        let target = self.target_mut(id)?;
        if !target.seq_deps.contains(&dep) {
            target.seq_deps.push(dep);
        }
        Ok(())
    }

    fn check_edge(&self, id: TargetId, dep: TargetId) -> RenderResult<()> {
        self.target(id)?;
        self.target(dep)?;
        if id == dep {
            return Err(RenderError::DependencyCycle { targets: vec![id] });
        }
        Ok(())
    }

    /// Set how many times the step list runs per hit (zero disables the steps)
    pub fn set_repeat(&mut self, id: TargetId, repeat: u32) -> RenderResult<()> {
        self.target_mut(id)?.repeat = repeat;
        Ok(())
    }

    /// Replace the state pushed around the steps
    pub fn set_base_state(&mut self, id: TargetId, state: Option<Rc<RenderState>>) -> RenderResult<()> {
        self.target_mut(id)?.base_state = state;
        Ok(())
    }

    /// The state pushed around the steps, if any
    pub fn base_state(&self, id: TargetId) -> RenderResult<Option<Rc<RenderState>>> {
        Ok(self.target(id)?.base_state.clone())
    }

    /// Edit the base state in place
    ///
    /// Goes through [`RenderContext::update_state`], so a state that is active right
    /// now is copied and re-entered rather than changed under the device. A target
    /// without a base state gets a fresh one.
    pub fn update_base_state<F>(&mut self, id: TargetId, ctx: &mut RenderContext, f: F) -> RenderResult<()>
    where
        F: FnOnce(&mut RenderState),
    {
        let target = self.target_mut(id)?;
        match target.base_state.as_mut() {
            Some(state) => ctx.update_state(state, f),
            None => {
                let mut state = RenderState::new();
                f(&mut state);
                target.base_state = Some(Rc::new(state));
                Ok(())
            }
        }
    }

    /// Execute `root` and everything it depends on, each exactly once
    pub fn hit(&self, root: TargetId, frame: &mut Frame<'_>) -> RenderResult<HitReport> {
        let mut report = HitReport::default();
        let mut active = Vec::new();
        self.hit_nested(root, frame, &mut active, &mut report)?;
        log::trace!(
            "Hit '{}': {} execution(s), {} draw(s), {} clear(s)",
            self.target(root)?.name,
            report.executions.len(),
            report.draws.drawn,
            report.clears
        );
        Ok(report)
    }

    fn hit_nested(
        &self,
        root: TargetId,
        frame: &mut Frame<'_>,
        active: &mut Vec<TargetId>,
        report: &mut HitReport,
    ) -> RenderResult<()> {
        let closure = self.closure(root)?;
        let requires = self.requirements(&closure)?;

        let mut remaining = closure;
        remaining.sort_by_key(|&id| self.targets[id].order);

        while !remaining.is_empty() {
            let pending: HashSet<TargetId> = remaining.iter().copied().collect();
            let (ready, blocked): (Vec<TargetId>, Vec<TargetId>) = remaining.iter().partition(|id| {
                requires
                    .get(*id)
                    .map_or(true, |reqs| reqs.iter().all(|req| !pending.contains(req)))
            });

            if ready.is_empty() {
                log::error!("Dependency cycle among {} target(s)", blocked.len());
                return Err(RenderError::DependencyCycle { targets: blocked });
            }

            for id in ready {
                self.execute(id, frame, active, report)?;
            }
            remaining = blocked;
        }
        Ok(())
    }

    fn closure(&self, root: TargetId) -> RenderResult<Vec<TargetId>> {
        self.target(root)?;
        let mut seen = HashSet::new();
        let mut closure = Vec::new();
        let mut worklist = vec![root];
        seen.insert(root);

        while let Some(id) = worklist.pop() {
            let target = self.target(id)?;
            closure.push(id);
            for &dep in target.deps.iter().chain(&target.seq_deps) {
                if seen.insert(dep) {
                    worklist.push(dep);
                }
            }
        }
        Ok(closure)
    }

    fn requirements(&self, closure: &[TargetId]) -> RenderResult<HashMap<TargetId, Vec<TargetId>>> {
        let mut requires: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        for &id in closure {
            let target = self.target(id)?;
            requires
                .entry(id)
                .or_default()
                .extend(target.deps.iter().chain(&target.seq_deps).copied());
            for pair in target.seq_deps.windows(2) {
                requires.entry(pair[1]).or_default().push(pair[0]);
            }
        }
        Ok(requires)
    }

    fn execute(
        &self,
        id: TargetId,
        frame: &mut Frame<'_>,
        active: &mut Vec<TargetId>,
        report: &mut HitReport,
    ) -> RenderResult<()> {
        if active.contains(&id) {
            return Err(RenderError::RecursiveHit(id));
        }
        let target = self.target(id)?;
        log::trace!("Executing target '{}' x{}", target.name, target.repeat);

        if let Some(state) = &target.base_state {
            frame.ctx.push_state(Rc::clone(state))?;
        }
        active.push(id);
        report.executions.push(id);

        let result = self.run_steps(target, frame, active, report);

        active.pop();
        if target.base_state.is_some() {
            let popped = frame.ctx.pop_state();
            if result.is_ok() {
                popped?;
            } else if let Err(e) = popped {
                log::warn!("Restoring state after target '{}' failed also failed: {}", target.name, e);
            }
        }
        result
    }

    fn run_steps(
        &self,
        target: &Target,
        frame: &mut Frame<'_>,
        active: &mut Vec<TargetId>,
        report: &mut HitReport,
    ) -> RenderResult<()> {
        for _ in 0..target.repeat {
            for step in &target.steps {
                match step {
                    Step::Draw(op) => {
                        let draw = op.execute(frame)?;
                        report.draws.absorb(&draw);
                    }
                    Step::Hit(sub) => self.hit_nested(*sub, frame, active, report)?,
                    Step::Clear(clear) => {
                        frame.ctx.clear(clear.target, clear.color, clear.depth)?;
                        report.clears += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
