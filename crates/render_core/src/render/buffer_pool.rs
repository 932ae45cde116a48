//! Generational GPU buffer pooling
//!
//! A [`BufferPool`] decides when and where mesh geometry of one vertex format is
//! copied into device buffers. Meshes are not uploaded when they are added; they are
//! collected into the newest *generation* and committed together when the generation
//! ends, with a single allocation per buffer kind sized to the whole batch.
//!
//! # Architecture
//!
//! ```text
//! add_mesh ──► newest generation (open)
//!                     │ end_generation
//!                     ▼
//!          pending meshes without backing
//!                     │ existing free space first, then one allocation per kind
//!                     ▼
//!   OutOfMemory? ──► evict oldest generation, retry (never the last one)
//!                     │
//!                     ▼
//!      GpuBuffer::store per mesh (alloc_find + unset + upload)
//! ```
//!
//! Generations are kept oldest-first. Adding a mesh that already lives in an older
//! generation moves it to the newest one and keeps its backing, so the order is a
//! least-recently-used order and eviction always drops the geometry that has gone
//! unused the longest.
//!
//! # Ownership
//!
//! Pools hold `Weak<Mesh>` references only. A mesh whose last `Rc` is dropped is
//! reaped at the next commit and its space returned to its buffers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use crate::core::PoolConfig;
use crate::foundation::collections::{BufferKey, SlotMap};
use super::buffer::{GpuBuffer, Span};
use super::device::{BufferKind, DeviceError, DrawCall, GraphicsDevice};
use super::mesh::{FormatId, Mesh, MeshId, VertexFormat};
use super::{RenderError, RenderResult};

/// Identity of one generation within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(u64);

/// Where a committed mesh lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBacking {
    /// Vertex payload
    pub vertex: Span,
    /// Index payload
    pub element: Span,
}

/// Outcome of one [`BufferPool::end_generation`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Generation that was closed, if one was open
    pub generation: Option<GenerationId>,
    /// Meshes given backing by this commit
    pub meshes_committed: usize,
    /// Older generations evicted to make room
    pub generations_evicted: usize,
    /// Bytes of new device buffers allocated
    pub bytes_allocated: u64,
}

impl CommitReport {
    /// Add another report's counters to this one
    pub fn absorb(&mut self, other: &CommitReport) {
        self.meshes_committed += other.meshes_committed;
        self.generations_evicted += other.generations_evicted;
        self.bytes_allocated += other.bytes_allocated;
    }
}

/// Lifetime counters of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Generations opened
    pub generations_opened: u64,
    /// Generations evicted under memory pressure
    pub generations_evicted: u64,
    /// Meshes given backing
    pub meshes_committed: u64,
    /// Meshes dropped by eviction
    pub meshes_evicted: u64,
    /// Meshes forgotten because their last owner dropped them
    pub meshes_reaped: u64,
    /// Device buffers created
    pub buffers_created: u64,
    /// Device buffers destroyed
    pub buffers_destroyed: u64,
    /// Bytes currently occupied by committed meshes
    pub bytes_resident: u64,
}

impl PoolStats {
    /// Add another pool's counters to this one
    pub fn accumulate(&mut self, other: &PoolStats) {
        self.generations_opened += other.generations_opened;
        self.generations_evicted += other.generations_evicted;
        self.meshes_committed += other.meshes_committed;
        self.meshes_evicted += other.meshes_evicted;
        self.meshes_reaped += other.meshes_reaped;
        self.buffers_created += other.buffers_created;
        self.buffers_destroyed += other.buffers_destroyed;
        self.bytes_resident += other.bytes_resident;
    }
}

#[derive(Debug)]
struct Generation {
    id: GenerationId,
    members: BTreeSet<MeshId>,
    closed: bool,
}

#[derive(Debug)]
struct Resident {
    mesh: Weak<Mesh>,
    generation: GenerationId,
    backing: Option<MeshBacking>,
}

/// Generational buffer pool for one vertex format
#[derive(Debug)]
pub struct BufferPool {
    format: VertexFormat,
    config: PoolConfig,
    buffers: SlotMap<BufferKey, GpuBuffer>,
    generations: VecDeque<Generation>,
    resident: HashMap<MeshId, Resident>,
    next_generation: u64,
    stats: PoolStats,
}

impl BufferPool {
    /// Create an empty pool
    pub fn new(format: VertexFormat, config: PoolConfig) -> Self {
        Self {
            format,
            config,
            buffers: SlotMap::with_key(),
            generations: VecDeque::new(),
            resident: HashMap::new(),
            next_generation: 1,
            stats: PoolStats::default(),
        }
    }

    /// Vertex format of every mesh in this pool
    pub fn format(&self) -> VertexFormat {
        self.format
    }

    /// Add a mesh to the newest generation, opening one if needed
    ///
    /// No device work happens here. A mesh already tracked by the pool moves to the
    /// newest generation and keeps its backing.
    pub fn add_mesh(&mut self, mesh: &Rc<Mesh>) -> RenderResult<GenerationId> {
        if mesh.format() != self.format {
            return Err(RenderError::FormatMismatch {
                expected: self.format.id,
                actual: mesh.format().id,
            });
        }

        let newest = self.open_generation();
        let id = mesh.id();

        match self.resident.get_mut(&id) {
            Some(resident) if resident.generation == newest => return Ok(newest),
            Some(resident) => {
                let previous = std::mem::replace(&mut resident.generation, newest);
                if let Some(generation) = self.generations.iter_mut().find(|g| g.id == previous) {
                    generation.members.remove(&id);
                }
            }
            None => {
                self.resident.insert(id, Resident {
                    mesh: Rc::downgrade(mesh),
                    generation: newest,
                    backing: None,
                });
            }
        }

        if let Some(generation) = self.generations.back_mut() {
            generation.members.insert(id);
        }
        self.prune_empty_generations();
        Ok(newest)
    }

    /// Close the newest generation and commit its meshes to device buffers
    ///
    /// Pending meshes are placed into free space of existing buffers first; the rest
    /// share one new buffer per kind. When the device runs out of memory the oldest
    /// generation is evicted and the allocation retried, until it succeeds or a single
    /// generation is left, which escalates to [`RenderError::OutOfMemory`].
    pub fn end_generation(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<CommitReport> {
        self.reap_dropped(device)?;

        let mut report = CommitReport::default();
        let Some(newest) = self.generations.back_mut() else {
            return Ok(report);
        };
        if newest.closed {
            return Ok(report);
        }
        if newest.members.is_empty() {
            self.generations.pop_back();
            return Ok(report);
        }

        newest.closed = true;
        report.generation = Some(newest.id);

        let pending: Vec<Rc<Mesh>> = newest
            .members
            .iter()
            .filter_map(|id| self.resident.get(id))
            .filter(|resident| resident.backing.is_none())
            .filter_map(|resident| resident.mesh.upgrade())
            .collect();

        if !pending.is_empty() {
            self.commit(device, &pending, &mut report)?;
        }

        log::debug!(
            "Pool {:?} closed generation {:?}: {} committed, {} evicted, {} bytes allocated",
            self.format.id, report.generation, report.meshes_committed,
            report.generations_evicted, report.bytes_allocated
        );
        Ok(report)
    }

    /// Forget a mesh, returning its space; `false` when the pool did not track it
    pub fn remove_mesh(&mut self, device: &mut dyn GraphicsDevice, mesh: &Mesh) -> RenderResult<bool> {
        self.detach(device, mesh.id())
    }

    /// Forget every mesh whose last owner has dropped it
    pub fn reap_dropped(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<usize> {
        let dead: Vec<MeshId> = self
            .resident
            .iter()
            .filter(|(_, resident)| resident.mesh.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            self.detach(device, *id)?;
        }

        if !dead.is_empty() {
            self.stats.meshes_reaped += dead.len() as u64;
            log::debug!("Pool {:?} reaped {} dropped mesh(es)", self.format.id, dead.len());
        }
        Ok(dead.len())
    }

    /// Evict the oldest generation unless it is the only one
    pub fn evict_oldest(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<Option<GenerationId>> {
        if self.generations.len() <= 1 {
            return Ok(None);
        }
        let Some(generation) = self.generations.pop_front() else {
            return Ok(None);
        };

        for id in &generation.members {
            if let Some(resident) = self.resident.remove(id) {
                if let Some(backing) = resident.backing {
                    self.release_backing(device, backing)?;
                }
                self.stats.meshes_evicted += 1;
            }
        }

        self.stats.generations_evicted += 1;
        log::debug!(
            "Pool {:?} evicted generation {:?} ({} mesh(es))",
            self.format.id, generation.id, generation.members.len()
        );
        Ok(Some(generation.id))
    }

    /// Issue an indexed draw for a committed mesh
    ///
    /// Returns `Ok(false)` without touching the device when the mesh has no backing.
    pub fn draw(&self, device: &mut dyn GraphicsDevice, mesh: &Mesh) -> RenderResult<bool> {
        let Some(backing) = self.backing(mesh) else {
            return Ok(false);
        };
        let (Some(vertices), Some(elements)) = (
            self.buffers.get(backing.vertex.buffer),
            self.buffers.get(backing.element.buffer),
        ) else {
            return Ok(false);
        };

        device.draw_indexed(&DrawCall {
            vertex_buffer: vertices.id(),
            vertex_offset: backing.vertex.offset,
            vertex_stride: self.format.stride,
            element_buffer: elements.id(),
            element_offset: backing.element.offset,
            index_count: mesh.index_count(),
            index_type: self.format.index_type,
        })?;
        Ok(true)
    }

    /// Evict everything and destroy all buffers
    pub fn release_all(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.generations.clear();
        self.resident.clear();
        self.stats.bytes_resident = 0;

        let keys: Vec<BufferKey> = self.buffers.keys().collect();
        for key in keys {
            if let Some(buffer) = self.buffers.remove(key) {
                buffer.destroy(device)?;
                self.stats.buffers_destroyed += 1;
            }
        }
        Ok(())
    }

    /// GPU backing of a mesh, if committed
    pub fn backing(&self, mesh: &Mesh) -> Option<MeshBacking> {
        self.resident.get(&mesh.id()).and_then(|resident| resident.backing)
    }

    /// Generation a mesh currently belongs to
    pub fn generation_of(&self, mesh: &Mesh) -> Option<GenerationId> {
        self.resident.get(&mesh.id()).map(|resident| resident.generation)
    }

    /// True when the mesh is committed and drawable
    pub fn is_resident(&self, mesh: &Mesh) -> bool {
        self.backing(mesh).is_some()
    }

    /// Number of generations held
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Generation ids, oldest first
    pub fn generations(&self) -> impl Iterator<Item = GenerationId> + '_ {
        self.generations.iter().map(|generation| generation.id)
    }

    /// Number of live device buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of meshes tracked, committed or not
    pub fn mesh_count(&self) -> usize {
        self.resident.len()
    }

    /// Lifetime counters
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Verify generation membership and backing bookkeeping
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = 0;
        for (index, generation) in self.generations.iter().enumerate() {
            let newest = index + 1 == self.generations.len();
            if !newest && !generation.closed {
                return Err(format!("generation {:?} is open but not newest", generation.id));
            }
            if !newest && generation.members.is_empty() {
                return Err(format!("generation {:?} is empty but not newest", generation.id));
            }
            for id in &generation.members {
                match self.resident.get(id) {
                    Some(resident) if resident.generation == generation.id => seen += 1,
                    _ => return Err(format!("{:?} listed in {:?} but not owned by it", id, generation.id)),
                }
            }
        }
        if seen != self.resident.len() {
            return Err(format!("{} resident meshes but {} generation members", self.resident.len(), seen));
        }

        let mut bytes = 0;
        for resident in self.resident.values() {
            if let Some(backing) = resident.backing {
                for (span, kind) in [(backing.vertex, BufferKind::Vertex), (backing.element, BufferKind::Element)] {
                    match self.buffers.get(span.buffer) {
                        Some(buffer) if buffer.kind() == kind => bytes += span.size,
                        _ => return Err(format!("span {:?} does not point at a {:?} buffer", span, kind)),
                    }
                }
            }
        }
        if bytes != self.stats.bytes_resident {
            return Err(format!("{} bytes resident but stats say {}", bytes, self.stats.bytes_resident));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn skew_resident_bytes(&mut self, delta: u64) {
        self.stats.bytes_resident += delta;
    }

    fn open_generation(&mut self) -> GenerationId {
        if let Some(generation) = self.generations.back() {
            if !generation.closed {
                return generation.id;
            }
        }

        let id = GenerationId(self.next_generation);
        self.next_generation += 1;
        self.generations.push_back(Generation {
            id,
            members: BTreeSet::new(),
            closed: false,
        });
        self.stats.generations_opened += 1;
        log::trace!("Pool {:?} opened generation {:?}", self.format.id, id);
        id
    }

    fn prune_empty_generations(&mut self) {
        let newest = self.generations.back().map(|generation| generation.id);
        self.generations
            .retain(|generation| !generation.members.is_empty() || Some(generation.id) == newest);
    }

    fn commit(
        &mut self,
        device: &mut dyn GraphicsDevice,
        pending: &[Rc<Mesh>],
        report: &mut CommitReport,
    ) -> RenderResult<()> {
        let mut waiting = self.place_in_existing(device, pending.iter().collect(), report)?;

        while !waiting.is_empty() {
            let vertex_bytes: u64 = waiting.iter().map(|mesh| mesh.vertex_bytes().len() as u64).sum();
            let element_bytes: u64 = waiting.iter().map(|mesh| mesh.index_bytes().len() as u64).sum();

            match self.allocate_pair(device, vertex_bytes, element_bytes) {
                Ok(()) => {
                    report.bytes_allocated += vertex_bytes + element_bytes;
                    waiting = self.place_in_existing(device, waiting, report)?;
                    debug_assert!(waiting.is_empty(), "fresh buffers must fit every pending mesh");
                    if !waiting.is_empty() {
                        return Err(RenderError::OutOfMemory {
                            requested: vertex_bytes + element_bytes,
                            generations: self.generations.len(),
                        });
                    }
                }
                Err(DeviceError::OutOfMemory { requested, available }) => {
                    let limit_reached = self
                        .config
                        .max_evictions_per_commit
                        .map_or(false, |limit| report.generations_evicted >= limit as usize);

                    if limit_reached || self.generations.len() <= 1 {
                        log::warn!(
                            "Pool {:?} cannot commit {} bytes ({} available) with {} generation(s) left",
                            self.format.id, requested, available, self.generations.len()
                        );
                        return Err(RenderError::OutOfMemory {
                            requested,
                            generations: self.generations.len(),
                        });
                    }

                    self.evict_oldest(device)?;
                    report.generations_evicted += 1;
                    waiting = self.place_in_existing(device, waiting, report)?;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn place_in_existing<'m>(
        &mut self,
        device: &mut dyn GraphicsDevice,
        waiting: Vec<&'m Rc<Mesh>>,
        report: &mut CommitReport,
    ) -> RenderResult<Vec<&'m Rc<Mesh>>> {
        let mut rest = Vec::new();
        for mesh in waiting {
            if self.store_mesh(device, mesh)? {
                report.meshes_committed += 1;
            } else {
                rest.push(mesh);
            }
        }
        Ok(rest)
    }

    fn allocate_pair(
        &mut self,
        device: &mut dyn GraphicsDevice,
        vertex_bytes: u64,
        element_bytes: u64,
    ) -> Result<(), DeviceError> {
        let vertices = GpuBuffer::create(device, BufferKind::Vertex, vertex_bytes)?;
        let elements = match GpuBuffer::create(device, BufferKind::Element, element_bytes) {
            Ok(buffer) => buffer,
            Err(error) => {
                vertices.destroy(device)?;
                return Err(error);
            }
        };

        self.buffers.insert(vertices);
        self.buffers.insert(elements);
        self.stats.buffers_created += 2;
        Ok(())
    }

    fn find_space(&self, kind: BufferKind, size: u64) -> Option<BufferKey> {
        self.buffers
            .iter()
            .find(|(_, buffer)| buffer.kind() == kind && buffer.largest_free() >= size)
            .map(|(key, _)| key)
    }

    fn store_mesh(&mut self, device: &mut dyn GraphicsDevice, mesh: &Mesh) -> RenderResult<bool> {
        let Some(vertex) = self.store_span(device, BufferKind::Vertex, mesh.vertex_bytes())? else {
            return Ok(false);
        };
        let Some(element) = self.store_span(device, BufferKind::Element, mesh.index_bytes())? else {
            self.release_span(device, vertex)?;
            return Ok(false);
        };

        if let Some(resident) = self.resident.get_mut(&mesh.id()) {
            resident.backing = Some(MeshBacking { vertex, element });
        }
        self.stats.meshes_committed += 1;
        Ok(true)
    }

    fn store_span(
        &mut self,
        device: &mut dyn GraphicsDevice,
        kind: BufferKind,
        bytes: &[u8],
    ) -> RenderResult<Option<Span>> {
        let size = bytes.len() as u64;
        let Some(key) = self.find_space(kind, size) else {
            return Ok(None);
        };
        let Some(buffer) = self.buffers.get_mut(key) else {
            return Ok(None);
        };

        let span = buffer
            .store(device, bytes)?
            .map(|offset| Span { buffer: key, offset, size });
        if span.is_some() {
            self.stats.bytes_resident += size;
        }
        Ok(span)
    }

    fn release_span(&mut self, device: &mut dyn GraphicsDevice, span: Span) -> RenderResult<()> {
        let Some(buffer) = self.buffers.get_mut(span.buffer) else {
            debug_assert!(false, "span {span:?} points at a missing buffer");
            return Ok(());
        };

        buffer.release(span.offset, span.size)?;
        self.stats.bytes_resident -= span.size;

        if buffer.is_unused() && self.config.reap_empty_buffers {
            if let Some(buffer) = self.buffers.remove(span.buffer) {
                buffer.destroy(device)?;
                self.stats.buffers_destroyed += 1;
            }
        }
        Ok(())
    }

    fn release_backing(&mut self, device: &mut dyn GraphicsDevice, backing: MeshBacking) -> RenderResult<()> {
        self.release_span(device, backing.vertex)?;
        self.release_span(device, backing.element)
    }

    fn detach(&mut self, device: &mut dyn GraphicsDevice, id: MeshId) -> RenderResult<bool> {
        let Some(resident) = self.resident.remove(&id) else {
            return Ok(false);
        };

        if let Some(generation) = self.generations.iter_mut().find(|g| g.id == resident.generation) {
            generation.members.remove(&id);
        }
        if let Some(backing) = resident.backing {
            self.release_backing(device, backing)?;
        }
        self.prune_empty_generations();
        Ok(true)
    }
}

/// Buffer pools keyed by vertex format, created on first use
#[derive(Debug, Default)]
pub struct PoolSet {
    config: PoolConfig,
    pools: BTreeMap<FormatId, BufferPool>,
}

impl PoolSet {
    /// Create an empty registry whose pools share `config`
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: BTreeMap::new(),
        }
    }

    /// Pool for `format`, creating it if needed
    pub fn pool_mut(&mut self, format: VertexFormat) -> RenderResult<&mut BufferPool> {
        let config = &self.config;
        let pool = self
            .pools
            .entry(format.id)
            .or_insert_with(|| BufferPool::new(format, config.clone()));

        if pool.format() != format {
            return Err(RenderError::FormatMismatch {
                expected: pool.format().id,
                actual: format.id,
            });
        }
        Ok(pool)
    }

    /// Existing pool for a format id
    pub fn pool(&self, format: FormatId) -> Option<&BufferPool> {
        self.pools.get(&format)
    }

    /// Add a mesh to the pool of its format
    pub fn add_mesh(&mut self, mesh: &Rc<Mesh>) -> RenderResult<GenerationId> {
        self.pool_mut(mesh.format())?.add_mesh(mesh)
    }

    /// Draw a mesh from the pool of its format
    pub fn draw(&self, device: &mut dyn GraphicsDevice, mesh: &Mesh) -> RenderResult<bool> {
        match self.pools.get(&mesh.format().id) {
            Some(pool) => pool.draw(device, mesh),
            None => Ok(false),
        }
    }

    /// End the generation of one pool
    pub fn end_generation(&mut self, device: &mut dyn GraphicsDevice, format: FormatId) -> RenderResult<CommitReport> {
        match self.pools.get_mut(&format) {
            Some(pool) => pool.end_generation(device),
            None => Ok(CommitReport::default()),
        }
    }

    /// End the generation of every pool
    pub fn end_all_generations(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<CommitReport> {
        let mut total = CommitReport::default();
        for pool in self.pools.values_mut() {
            total.absorb(&pool.end_generation(device)?);
        }
        Ok(total)
    }

    /// Reap dropped meshes in every pool
    pub fn reap_all(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<usize> {
        let mut reaped = 0;
        for pool in self.pools.values_mut() {
            reaped += pool.reap_dropped(device)?;
        }
        Ok(reaped)
    }

    /// Release every pool's buffers
    pub fn release_all(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        for pool in self.pools.values_mut() {
            pool.release_all(device)?;
        }
        Ok(())
    }

    /// Iterate over pools in format order
    pub fn iter(&self) -> impl Iterator<Item = &BufferPool> {
        self.pools.values()
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// True when no pool exists yet
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Counters summed over every pool
    pub fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for pool in self.pools.values() {
            total.accumulate(&pool.stats());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::headless::HeadlessDevice;
    use crate::render::mesh::IndexType;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const FORMAT: VertexFormat = VertexFormat::new(FormatId(7), 16, IndexType::U16);

    /// 64 vertex bytes and 16 index bytes, 80 bytes in total
    fn mesh(fill: u8) -> Rc<Mesh> {
        Rc::new(Mesh::new(FORMAT, 4, 8, vec![fill; 64], vec![0; 16]).unwrap())
    }

    fn pool() -> BufferPool {
        BufferPool::new(FORMAT, PoolConfig::default())
    }

    #[test]
    fn test_add_defers_device_work() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool();
        let a = mesh(1);

        pool.add_mesh(&a).unwrap();
        assert!(device.calls().is_empty());
        assert!(!pool.is_resident(&a));

        let report = pool.end_generation(&mut device).unwrap();
        assert_eq!(report.meshes_committed, 1);
        assert_eq!(report.bytes_allocated, 80);
        assert!(pool.is_resident(&a));

        let backing = pool.backing(&a).unwrap();
        let vertex_id = pool.buffers[backing.vertex.buffer].id();
        assert_eq!(device.buffer_contents(vertex_id), Some(&[1u8; 64][..]));
    }

    #[test]
    fn test_closed_generation_is_not_reused() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool();
        let (a, b) = (mesh(1), mesh(2));

        let first = pool.add_mesh(&a).unwrap();
        assert_eq!(pool.add_mesh(&b).unwrap(), first);
        pool.end_generation(&mut device).unwrap();

        let c = mesh(3);
        let second = pool.add_mesh(&c).unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.generation_count(), 2);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_generation_exclusivity_random() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = HeadlessDevice::new();
        let mut pool = pool();
        let meshes: Vec<Rc<Mesh>> = (0..24).map(|i| mesh(i as u8)).collect();

        for _ in 0..400 {
            match rng.gen_range(0..10) {
                0..=5 => {
                    let mesh = &meshes[rng.gen_range(0..meshes.len())];
                    let generation = pool.add_mesh(mesh).unwrap();
                    assert_eq!(pool.generation_of(mesh), Some(generation));
                }
                6..=7 => {
                    pool.end_generation(&mut device).unwrap();
                }
                8 => {
                    let mesh = &meshes[rng.gen_range(0..meshes.len())];
                    pool.remove_mesh(&mut device, mesh).unwrap();
                    assert_eq!(pool.generation_of(mesh), None);
                }
                _ => {
                    pool.evict_oldest(&mut device).unwrap();
                }
            }
            pool.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_eviction_scenario_eight_then_five() {
        // Room for ten meshes of 80 bytes
        let mut device = HeadlessDevice::new().with_memory_budget(800);
        let mut pool = pool();

        let first: Vec<Rc<Mesh>> = (0..8).map(mesh).collect();
        for m in &first {
            pool.add_mesh(m).unwrap();
        }
        pool.end_generation(&mut device).unwrap();
        assert!(first.iter().all(|m| pool.is_resident(m)));
        assert_eq!(device.memory_used(), 640);

        let second: Vec<Rc<Mesh>> = (8..13).map(mesh).collect();
        for m in &second {
            pool.add_mesh(m).unwrap();
        }
        let report = pool.end_generation(&mut device).unwrap();

        assert_eq!(report.generations_evicted, 1);
        assert_eq!(report.meshes_committed, 5);
        assert!(first.iter().all(|m| pool.backing(m).is_none()));
        assert!(second.iter().all(|m| pool.is_resident(m)));
        assert_eq!(pool.generation_count(), 1);
        assert_eq!(device.memory_used(), 400);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_eviction_stops_at_last_generation() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool();
        let mut keep = Vec::new();

        for i in 0..3 {
            let m = mesh(i);
            pool.add_mesh(&m).unwrap();
            pool.end_generation(&mut device).unwrap();
            keep.push(m);
        }
        assert_eq!(pool.generation_count(), 3);

        device.set_fail_allocations(true);
        let late = mesh(9);
        pool.add_mesh(&late).unwrap();

        let result = pool.end_generation(&mut device);
        assert!(matches!(result, Err(RenderError::OutOfMemory { generations: 1, .. })));
        assert_eq!(pool.generation_count(), 1);
        assert_eq!(pool.stats().generations_evicted, 3);
        assert!(keep.iter().all(|m| !pool.is_resident(m)));
        assert!(!pool.is_resident(&late));
    }

    #[test]
    fn test_eviction_limit_is_respected() {
        let mut device = HeadlessDevice::new();
        let mut pool = BufferPool::new(FORMAT, PoolConfig::default().with_max_evictions(1));

        let old: Vec<Rc<Mesh>> = (0..3).map(mesh).collect();
        for m in &old {
            pool.add_mesh(m).unwrap();
            pool.end_generation(&mut device).unwrap();
        }

        device.set_fail_allocations(true);
        let late = mesh(9);
        pool.add_mesh(&late).unwrap();
        assert!(pool.end_generation(&mut device).is_err());
        assert_eq!(pool.stats().generations_evicted, 1);
        assert_eq!(pool.generation_count(), 3);
    }

    #[test]
    fn test_readd_moves_mesh_to_newest_generation() {
        let mut device = HeadlessDevice::new().with_memory_budget(240);
        let mut pool = pool();
        let (a, b) = (mesh(1), mesh(2));

        pool.add_mesh(&a).unwrap();
        pool.end_generation(&mut device).unwrap();
        pool.add_mesh(&b).unwrap();
        pool.end_generation(&mut device).unwrap();

        // `a` is used again: its generation empties and disappears, backing is kept
        let backing = pool.backing(&a);
        pool.add_mesh(&a).unwrap();
        pool.end_generation(&mut device).unwrap();
        assert_eq!(pool.backing(&a), backing);
        assert_eq!(pool.generation_count(), 2);

        // Pressure now evicts `b`, the least recently used
        let (c, d) = (mesh(3), mesh(4));
        pool.add_mesh(&c).unwrap();
        pool.add_mesh(&d).unwrap();
        pool.end_generation(&mut device).unwrap();

        assert!(pool.is_resident(&a));
        assert!(!pool.is_resident(&b));
        assert!(pool.is_resident(&c) && pool.is_resident(&d));
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_dropped_meshes_are_reaped() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool();

        let a = mesh(1);
        pool.add_mesh(&a).unwrap();
        pool.end_generation(&mut device).unwrap();
        assert_eq!(device.buffer_count(), 2);

        drop(a);
        pool.end_generation(&mut device).unwrap();
        assert_eq!(pool.mesh_count(), 0);
        assert_eq!(pool.stats().meshes_reaped, 1);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_freed_space_is_reused_before_allocating() {
        let mut device = HeadlessDevice::new();
        let mut pool = BufferPool::new(FORMAT, PoolConfig::default().with_buffer_reuse());

        let a = mesh(1);
        pool.add_mesh(&a).unwrap();
        pool.end_generation(&mut device).unwrap();
        pool.remove_mesh(&mut device, &a).unwrap();
        assert_eq!(device.buffer_count(), 2);

        let b = mesh(2);
        pool.add_mesh(&b).unwrap();
        let report = pool.end_generation(&mut device).unwrap();
        assert_eq!(report.bytes_allocated, 0);
        assert_eq!(report.meshes_committed, 1);
        assert_eq!(pool.stats().buffers_created, 2);
    }

    #[test]
    fn test_draw_uses_backing() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool();
        let (a, b) = (mesh(1), mesh(2));

        pool.add_mesh(&a).unwrap();
        pool.add_mesh(&b).unwrap();
        assert!(!pool.draw(&mut device, &a).unwrap());

        pool.end_generation(&mut device).unwrap();
        device.clear_calls();
        assert!(pool.draw(&mut device, &b).unwrap());

        let backing = pool.backing(&b).unwrap();
        match device.calls() {
            [crate::render::DeviceCall::DrawIndexed(call)] => {
                assert_eq!(call.vertex_offset, backing.vertex.offset);
                assert_eq!(call.element_offset, backing.element.offset);
                assert_eq!(call.index_count, 8);
                assert_eq!(call.vertex_stride, 16);
            }
            calls => panic!("unexpected calls {calls:?}"),
        }
    }

    #[test]
    fn test_format_mismatch_is_rejected() {
        let mut pool = pool();
        let other = VertexFormat::new(FormatId(8), 16, IndexType::U16);
        let foreign = Rc::new(Mesh::new(other, 4, 8, vec![0; 64], vec![0; 16]).unwrap());
        assert!(matches!(pool.add_mesh(&foreign), Err(RenderError::FormatMismatch { .. })));

        let mut pools = PoolSet::new(PoolConfig::default());
        pools.add_mesh(&foreign).unwrap();
        pools.add_mesh(&mesh(1)).unwrap();
        assert_eq!(pools.len(), 2);

        let clash = VertexFormat::new(FormatId(7), 32, IndexType::U16);
        assert!(pools.pool_mut(clash).is_err());
    }
}
