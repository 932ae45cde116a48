//! Mesh payloads handed to buffer pools
//!
//! A [`Mesh`] is the raw geometry of one drawable: a vertex byte payload laid out
//! according to a [`VertexFormat`] plus an index payload. Meshes are immutable once
//! built and shared through `Rc<Mesh>`; where a mesh currently lives on the GPU is
//! tracked by the [`BufferPool`](super::BufferPool) of its format, never by the mesh.

use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Serialize, Deserialize};
use super::{RenderError, RenderResult};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique mesh identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);

impl MeshId {
    fn next() -> Self {
        Self(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Identifier of a vertex layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatId(pub u32);

/// Width of one index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexType {
    /// Bytes per index
    pub fn size(self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// Vertex layout descriptor
///
/// Only the pieces the pools need: an identity, the byte stride and the index width.
/// Attribute layout is the shader's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexFormat {
    /// Layout identity; pools are keyed by it
    pub id: FormatId,
    /// Bytes per vertex
    pub stride: u32,
    /// Index width
    pub index_type: IndexType,
}

impl VertexFormat {
    /// Create a vertex format
    pub const fn new(id: FormatId, stride: u32, index_type: IndexType) -> Self {
        Self { id, stride, index_type }
    }
}

/// Immutable vertex and index payload of one drawable
#[derive(Debug)]
pub struct Mesh {
    id: MeshId,
    format: VertexFormat,
    vertex_count: u32,
    index_count: u32,
    vertices: Vec<u8>,
    indices: Vec<u8>,
}

impl Mesh {
    /// Build a mesh from raw bytes
    ///
    /// The byte lengths must match the counts and the format exactly, and a mesh must
    /// contain at least one vertex and one index.
    pub fn new(
        format: VertexFormat,
        vertex_count: u32,
        index_count: u32,
        vertices: Vec<u8>,
        indices: Vec<u8>,
    ) -> RenderResult<Self> {
        if vertex_count == 0 || index_count == 0 {
            return Err(RenderError::InvalidMesh("mesh must have vertices and indices".to_string()));
        }

        let expected_vertices = u64::from(vertex_count) * u64::from(format.stride);
        if vertices.len() as u64 != expected_vertices {
            return Err(RenderError::InvalidMesh(format!(
                "{} vertex bytes for {} vertices of stride {}",
                vertices.len(), vertex_count, format.stride
            )));
        }

        let expected_indices = u64::from(index_count) * u64::from(format.index_type.size());
        if indices.len() as u64 != expected_indices {
            return Err(RenderError::InvalidMesh(format!(
                "{} index bytes for {} indices of {:?}",
                indices.len(), index_count, format.index_type
            )));
        }

        Ok(Self {
            id: MeshId::next(),
            format,
            vertex_count,
            index_count,
            vertices,
            indices,
        })
    }

    /// Build a mesh from typed vertices and 32-bit indices
    ///
    /// Indices are narrowed when the format uses 16-bit indices; an index that does
    /// not fit, or one that points past the vertex list, is rejected.
    pub fn from_vertices<V: bytemuck::Pod>(
        format: VertexFormat,
        vertices: &[V],
        indices: &[u32],
    ) -> RenderResult<Self> {
        if std::mem::size_of::<V>() != format.stride as usize {
            return Err(RenderError::InvalidMesh(format!(
                "vertex type is {} bytes but format stride is {}",
                std::mem::size_of::<V>(), format.stride
            )));
        }
        if let Some(bad) = indices.iter().find(|&&index| index as usize >= vertices.len()) {
            return Err(RenderError::InvalidMesh(format!(
                "index {} out of range for {} vertices", bad, vertices.len()
            )));
        }

        let index_bytes = match format.index_type {
            IndexType::U32 => bytemuck::cast_slice(indices).to_vec(),
            IndexType::U16 => {
                let narrowed = indices
                    .iter()
                    .map(|&index| u16::try_from(index))
                    .collect::<Result<Vec<u16>, _>>()
                    .map_err(|_| RenderError::InvalidMesh("index does not fit in 16 bits".to_string()))?;
                bytemuck::cast_slice(&narrowed).to_vec()
            }
        };

        let vertex_count = u32::try_from(vertices.len())
            .map_err(|_| RenderError::InvalidMesh("too many vertices".to_string()))?;
        let index_count = u32::try_from(indices.len())
            .map_err(|_| RenderError::InvalidMesh("too many indices".to_string()))?;

        Self::new(
            format,
            vertex_count,
            index_count,
            bytemuck::cast_slice(vertices).to_vec(),
            index_bytes,
        )
    }

    /// Mesh identity
    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Vertex layout
    pub fn format(&self) -> VertexFormat {
        self.format
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Raw vertex payload
    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertices
    }

    /// Raw index payload
    pub fn index_bytes(&self) -> &[u8] {
        &self.indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION_ONLY: VertexFormat = VertexFormat::new(FormatId(1), 12, IndexType::U16);

    #[test]
    fn test_from_vertices_packs_bytes() {
        let vertices = [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mesh = Mesh::from_vertices(POSITION_ONLY, &vertices, &[0, 1, 2]).unwrap();

        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.index_count(), 3);
        assert_eq!(mesh.vertex_bytes().len(), 36);
        assert_eq!(mesh.index_bytes(), &[0, 0, 1, 0, 2, 0]);
    }

    #[test]
    fn test_mesh_ids_are_unique() {
        let a = Mesh::new(POSITION_ONLY, 1, 1, vec![0; 12], vec![0; 2]).unwrap();
        let b = Mesh::new(POSITION_ONLY, 1, 1, vec![0; 12], vec![0; 2]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_invalid_payloads_are_rejected() {
        assert!(matches!(
            Mesh::new(POSITION_ONLY, 2, 1, vec![0; 12], vec![0; 2]),
            Err(RenderError::InvalidMesh(_))
        ));
        assert!(matches!(
            Mesh::new(POSITION_ONLY, 0, 0, Vec::new(), Vec::new()),
            Err(RenderError::InvalidMesh(_))
        ));

        let vertices = [[0.0f32; 3]; 2];
        assert!(matches!(
            Mesh::from_vertices(POSITION_ONLY, &vertices, &[0, 2]),
            Err(RenderError::InvalidMesh(_))
        ));
        assert!(matches!(
            Mesh::from_vertices(POSITION_ONLY, &[[0.0f32; 2]], &[0]),
            Err(RenderError::InvalidMesh(_))
        ));
    }
}
