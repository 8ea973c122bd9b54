use glam::{IVec4, Vec3, Vec4};

use crate::bounds::Aabb;
use crate::bvh::{self, LinearNode, Primitive, SahBuilder};
use crate::error::{Error, Result};
use crate::wide::{self, WideNode};

/// Node layout a BLAS is compiled to. Scene-wide; every BLAS in a scene
/// shares the flavor so one traversal program serves them all.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BlasKind {
    Sah,
    #[default]
    Wide,
}

/// Bookkeeping for one `add_shape` call. The triangle range is only
/// meaningful until the next build permutes the triangle array.
#[derive(Clone, Copy, Debug)]
pub struct Shape {
    pub id: u32,
    pub vertex_offset: u32,
    pub num_vertices: u32,
    pub triangle_offset: u32,
    pub num_triangles: u32,
}

#[derive(Debug, Clone)]
pub enum BlasNodes {
    Sah(Vec<LinearNode>),
    Wide(Vec<WideNode>),
}

/// Strided triangle-mesh input for [`Blas::add_shape`]. Strides count
/// floats. Normals and uvs may be absent; missing attributes read as zero.
/// Indices come in groups of four: `v0, v1, v2, material`.
#[derive(Clone, Copy, Debug)]
pub struct ShapeDesc<'a> {
    pub positions: &'a [f32],
    pub position_stride: usize,
    pub normals: Option<&'a [f32]>,
    pub normal_stride: usize,
    pub uvs: Option<&'a [f32]>,
    pub uv_stride: usize,
    pub num_vertices: usize,
    pub indices: &'a [i32],
    pub num_triangles: usize,
}

/// Bottom-level structure: the triangle soup of all added shapes plus the
/// flat node records of the last build.
#[derive(Debug)]
pub struct Blas {
    pub kind: BlasKind,
    /// `(px, py, pz, u)` per vertex.
    pub vertices: Vec<Vec4>,
    /// `(nx, ny, nz, v)` per vertex, parallel to `vertices`.
    pub normals: Vec<Vec4>,
    /// `(v0, v1, v2, material)`; permuted by builds so leaves span
    /// contiguous ranges.
    pub triangles: Vec<IVec4>,
    pub shapes: Vec<Shape>,
    pub nodes: BlasNodes,
    pub needs_rebuild: bool,
    next_shape_id: u32,
}

impl Blas {
    pub fn new(kind: BlasKind) -> Blas {
        Blas {
            kind,
            vertices: Vec::new(),
            normals: Vec::new(),
            triangles: Vec::new(),
            shapes: Vec::new(),
            nodes: match kind {
                BlasKind::Sah => BlasNodes::Sah(Vec::new()),
                BlasKind::Wide => BlasNodes::Wide(Vec::new()),
            },
            needs_rebuild: false,
            next_shape_id: 0,
        }
    }

    /// Appends a shape, biasing its vertex indices to absolute offsets into
    /// this BLAS's attribute arrays. Returns the shape id.
    pub fn add_shape(&mut self, desc: &ShapeDesc) -> Result<u32> {
        if desc.num_vertices == 0
            || desc.positions.len() < (desc.num_vertices - 1) * desc.position_stride + 3
        {
            return Err(Error::InvalidPositionBuffer);
        }
        if desc.indices.len() < desc.num_triangles * 4 {
            return Err(Error::InvalidIndexBuffer);
        }
        for tri in desc.indices.chunks_exact(4).take(desc.num_triangles) {
            if tri[..3]
                .iter()
                .any(|&v| v < 0 || v as usize >= desc.num_vertices)
            {
                return Err(Error::InvalidIndexBuffer);
            }
        }
        if let Some(normals) = desc.normals {
            if normals.len() < (desc.num_vertices - 1) * desc.normal_stride + 3 {
                return Err(Error::InvalidAttributeBuffer);
            }
        }
        if let Some(uvs) = desc.uvs {
            if uvs.len() < (desc.num_vertices - 1) * desc.uv_stride + 2 {
                return Err(Error::InvalidAttributeBuffer);
            }
        }

        self.next_shape_id += 1;
        let shape = Shape {
            id: self.next_shape_id,
            vertex_offset: self.vertices.len() as u32,
            num_vertices: desc.num_vertices as u32,
            triangle_offset: self.triangles.len() as u32,
            num_triangles: desc.num_triangles as u32,
        };

        for i in 0..desc.num_vertices {
            let p = &desc.positions[i * desc.position_stride..];
            let (nx, ny, nz) = match desc.normals {
                Some(n) => {
                    let n = &n[i * desc.normal_stride..];
                    (n[0], n[1], n[2])
                }
                None => (0.0, 0.0, 0.0),
            };
            let (u, v) = match desc.uvs {
                Some(t) => {
                    let t = &t[i * desc.uv_stride..];
                    (t[0], t[1])
                }
                None => (0.0, 0.0),
            };
            self.vertices.push(Vec4::new(p[0], p[1], p[2], u));
            self.normals.push(Vec4::new(nx, ny, nz, v));
        }

        let bias = shape.vertex_offset as i32;
        for tri in desc.indices.chunks_exact(4).take(desc.num_triangles) {
            self.triangles
                .push(IVec4::new(tri[0] + bias, tri[1] + bias, tri[2] + bias, tri[3]));
        }

        self.shapes.push(shape);
        self.needs_rebuild = true;

        Ok(shape.id)
    }

    pub fn position(&self, i: usize) -> Vec3 {
        self.vertices[i].truncate()
    }

    pub fn normal(&self, i: usize) -> Vec3 {
        self.normals[i].truncate()
    }

    pub fn total_nodes(&self) -> usize {
        match &self.nodes {
            BlasNodes::Sah(nodes) => nodes.len(),
            BlasNodes::Wide(nodes) => nodes.len(),
        }
    }

    /// Root bounds of the built structure; the union identity when empty.
    pub fn bounds(&self) -> Aabb {
        match &self.nodes {
            BlasNodes::Sah(nodes) => nodes.first().map(|n| n.bounds()).unwrap_or_default(),
            BlasNodes::Wide(nodes) => nodes
                .first()
                .map(|n| n.child_bounds(0))
                .unwrap_or_default(),
        }
    }

    fn primitives(&self) -> Vec<Primitive> {
        self.triangles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Primitive::new(
                    i as u32,
                    Aabb::from_triangle(
                        self.position(t.x as usize),
                        self.position(t.y as usize),
                        self.position(t.z as usize),
                    ),
                )
            })
            .collect()
    }

    /// Rebuilds the node records if any shape was added since the last
    /// build. Idempotent otherwise. Failure leaves the BLAS untouched.
    pub fn build(&mut self) -> Result<()> {
        if !self.needs_rebuild {
            return Ok(());
        }
        if self.triangles.is_empty() {
            self.nodes = match self.kind {
                BlasKind::Sah => BlasNodes::Sah(Vec::new()),
                BlasKind::Wide => BlasNodes::Wide(Vec::new()),
            };
            self.needs_rebuild = false;
            return Ok(());
        }

        let _span = tracing::debug_span!("blas_build", triangles = self.triangles.len()).entered();
        let mut prims = self.primitives();
        match self.kind {
            BlasKind::Sah => {
                let tree = SahBuilder::new().build(&mut prims, &self.triangles);
                let nodes = bvh::flatten(&tree);
                self.triangles = tree.ordered;
                self.nodes = BlasNodes::Sah(nodes);
            }
            BlasKind::Wide => {
                let tree = SahBuilder::single_prim().build(&mut prims, &self.triangles);
                let wide = wide::collapse(&tree)?;
                self.triangles = wide.ordered;
                self.nodes = BlasNodes::Wide(wide.nodes);
            }
        }
        tracing::debug!(nodes = self.total_nodes(), "built blas");
        self.needs_rebuild = false;
        Ok(())
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn normal_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.normals)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.triangles)
    }

    pub fn node_bytes(&self) -> &[u8] {
        match &self.nodes {
            BlasNodes::Sah(nodes) => bytemuck::cast_slice(nodes),
            BlasNodes::Wide(nodes) => bytemuck::cast_slice(nodes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_desc<'a>(positions: &'a [f32], indices: &'a [i32]) -> ShapeDesc<'a> {
        ShapeDesc {
            positions,
            position_stride: 3,
            normals: None,
            normal_stride: 0,
            uvs: None,
            uv_stride: 0,
            num_vertices: positions.len() / 3,
            indices,
            num_triangles: indices.len() / 4,
        }
    }

    const TRI: [f32; 9] = [-1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    #[test]
    fn add_shape_biases_indices() {
        let mut blas = Blas::new(BlasKind::Sah);
        let first = blas.add_shape(&triangle_desc(&TRI, &[0, 1, 2, 0])).unwrap();
        let second = blas.add_shape(&triangle_desc(&TRI, &[0, 1, 2, 4])).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(blas.triangles[0], IVec4::new(0, 1, 2, 0));
        assert_eq!(blas.triangles[1], IVec4::new(3, 4, 5, 4));
        assert_eq!(blas.vertices.len(), blas.normals.len());
    }

    #[test]
    fn missing_attributes_default_to_zero() {
        let mut blas = Blas::new(BlasKind::Sah);
        blas.add_shape(&triangle_desc(&TRI, &[0, 1, 2, 0])).unwrap();
        assert_eq!(blas.normals[0], Vec4::ZERO);
        assert_eq!(blas.vertices[0].w, 0.0);
    }

    #[test]
    fn strided_attributes_are_gathered() {
        // interleaved px py pz nx ny nz u v
        let data = [
            -1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.1, 0.2, //
            1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.3, 0.4, //
            0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.5, 0.6,
        ];
        let desc = ShapeDesc {
            positions: &data,
            position_stride: 8,
            normals: Some(&data[3..]),
            normal_stride: 8,
            uvs: Some(&data[6..]),
            uv_stride: 8,
            num_vertices: 3,
            indices: &[0, 1, 2, 0],
            num_triangles: 1,
        };
        let mut blas = Blas::new(BlasKind::Sah);
        blas.add_shape(&desc).unwrap();
        assert_eq!(blas.vertices[1], Vec4::new(1.0, 0.0, 0.0, 0.3));
        assert_eq!(blas.normals[2], Vec4::new(0.0, 0.0, 1.0, 0.6));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut blas = Blas::new(BlasKind::Sah);
        let truncated = ShapeDesc {
            positions: &TRI[..6],
            num_vertices: 3,
            ..triangle_desc(&TRI, &[0, 1, 2, 0])
        };
        assert!(matches!(
            blas.add_shape(&truncated),
            Err(Error::InvalidPositionBuffer)
        ));
        let short_indices = ShapeDesc {
            indices: &[0, 1, 2],
            num_triangles: 1,
            ..triangle_desc(&TRI, &[0, 1, 2, 0])
        };
        assert!(matches!(
            blas.add_shape(&short_indices),
            Err(Error::InvalidIndexBuffer)
        ));
        // indices must stay inside the shape's vertex range
        assert!(matches!(
            blas.add_shape(&triangle_desc(&TRI, &[0, 1, 3, 0])),
            Err(Error::InvalidIndexBuffer)
        ));
        assert!(blas.triangles.is_empty());
    }

    #[test]
    fn empty_build_succeeds_with_zero_nodes() {
        let mut blas = Blas::new(BlasKind::Wide);
        blas.needs_rebuild = true;
        blas.build().unwrap();
        assert_eq!(blas.total_nodes(), 0);
    }

    #[test]
    fn build_is_idempotent_when_clean() {
        let mut blas = Blas::new(BlasKind::Sah);
        blas.add_shape(&triangle_desc(&TRI, &[0, 1, 2, 0])).unwrap();
        blas.build().unwrap();
        let before = blas.node_bytes().to_vec();
        let triangles = blas.triangles.clone();
        blas.build().unwrap();
        assert_eq!(blas.node_bytes(), &before[..]);
        assert_eq!(blas.triangles, triangles);
    }

    #[test]
    fn both_kinds_build_the_same_triangle_multiset() {
        let positions: Vec<f32> = (0..12)
            .flat_map(|i| {
                let f = i as f32;
                [f, (f * 0.5).sin(), f * 0.25, f + 1.0, f.cos(), 0.0, f, 1.0, 1.0]
            })
            .collect();
        let indices: Vec<i32> = (0..12)
            .flat_map(|i| [3 * i, 3 * i + 1, 3 * i + 2, 0])
            .collect();
        for kind in [BlasKind::Sah, BlasKind::Wide] {
            let mut blas = Blas::new(kind);
            blas.add_shape(&triangle_desc(&positions, &indices)).unwrap();
            let mut before: Vec<_> = blas.triangles.iter().map(|t| t.to_array()).collect();
            blas.build().unwrap();
            let mut after: Vec<_> = blas.triangles.iter().map(|t| t.to_array()).collect();
            before.sort();
            after.sort();
            assert_eq!(before, after);
            assert!(blas.total_nodes() > 0);
        }
    }
}
