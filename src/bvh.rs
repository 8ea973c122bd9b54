use glam::{IVec4, Vec3};

use crate::bounds::Aabb;

/// Per-input-triangle build record, created once at build start and
/// discarded after flattening.
#[derive(Clone, Copy, Debug)]
pub struct Primitive {
    pub index: u32,
    pub bounds: Aabb,
    pub centroid: Vec3,
}

impl Primitive {
    pub fn new(index: u32, bounds: Aabb) -> Primitive {
        Primitive {
            index,
            bounds,
            centroid: (bounds.min + bounds.max) * 0.5,
        }
    }
}

/// Builder-internal binary node. Leaves have `n_prims > 0` and reference a
/// contiguous range of the ordered triangle output; interiors reference two
/// arena slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildNode {
    pub bounds: Aabb,
    pub left: u32,
    pub right: u32,
    pub split_axis: u8,
    pub first_prim: u32,
    pub n_prims: u32,
}

impl BuildNode {
    pub fn is_leaf(&self) -> bool {
        self.n_prims > 0
    }
}

/// Binary BVH in arena form, plus the triangle permutation the build
/// produced. Leaf primitive ranges index `ordered`.
#[derive(Debug, Default)]
pub struct BinaryTree {
    pub nodes: Vec<BuildNode>,
    pub root: u32,
    pub ordered: Vec<IVec4>,
}

impl BinaryTree {
    pub fn node(&self, idx: u32) -> &BuildNode {
        &self.nodes[idx as usize]
    }
}

/// Flat 32-byte node record, laid out as two RGBA32F texels. Interior
/// nodes store the left child at the next array slot and the right child
/// offset in `offset`; leaves store their first primitive there.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LinearNode {
    pub min: [f32; 3],
    pub offset: i32,
    pub max: [f32; 3],
    pub n_prims: u16,
    pub axis: u8,
    pub pad: u8,
}

impl LinearNode {
    pub fn is_leaf(&self) -> bool {
        self.n_prims > 0
    }

    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: Vec3::from_array(self.min),
            max: Vec3::from_array(self.max),
        }
    }
}

pub const N_BUCKETS: usize = 64;
pub const MAX_PRIMS_IN_NODE: usize = 5;

const DEGENERATE_CENTROID_SPREAD: f32 = 0.01;

#[derive(Clone, Copy, Default)]
struct Bucket {
    count: usize,
    bounds: Aabb,
}

/// Recursive binned-SAH builder. The default configuration allows up to
/// [`MAX_PRIMS_IN_NODE`] triangles per leaf; the `single_prim` variant
/// forces one-triangle leaves and is the front end of the wide builder.
pub struct SahBuilder {
    max_prims_in_node: usize,
    single_prim_leaves: bool,
}

impl Default for SahBuilder {
    fn default() -> Self {
        SahBuilder {
            max_prims_in_node: MAX_PRIMS_IN_NODE,
            single_prim_leaves: false,
        }
    }
}

impl SahBuilder {
    pub fn new() -> SahBuilder {
        SahBuilder::default()
    }

    pub fn single_prim() -> SahBuilder {
        SahBuilder {
            max_prims_in_node: 1,
            single_prim_leaves: true,
        }
    }

    /// Builds the pointer tree over `prims` and emits the reordered
    /// triangle list. An empty input yields an empty tree.
    pub fn build(&self, prims: &mut [Primitive], triangles: &[IVec4]) -> BinaryTree {
        let mut tree = BinaryTree {
            nodes: Vec::with_capacity(2 * prims.len().max(1)),
            root: 0,
            ordered: Vec::with_capacity(prims.len()),
        };
        if prims.is_empty() {
            return tree;
        }
        tree.root = self.build_range(&mut tree, prims, triangles);
        tree
    }

    fn build_range(
        &self,
        tree: &mut BinaryTree,
        prims: &mut [Primitive],
        triangles: &[IVec4],
    ) -> u32 {
        let this = tree.nodes.len() as u32;
        tree.nodes.push(BuildNode::default());

        let mut bounds = Aabb::default();
        for p in prims.iter() {
            bounds = bounds.union(&p.bounds);
        }
        let n = prims.len();

        if n == 1 {
            self.emit_leaf(tree, prims, bounds, this, triangles);
            return this;
        }

        let mut centroid_bounds = Aabb::default();
        for p in prims.iter() {
            centroid_bounds = centroid_bounds.union_point(p.centroid);
        }
        let dim = centroid_bounds.maximum_extent();
        let spread = centroid_bounds.max[dim] - centroid_bounds.min[dim];

        let mid = if spread.abs() < DEGENERATE_CENTROID_SPREAD {
            if !self.single_prim_leaves {
                self.emit_leaf(tree, prims, bounds, this, triangles);
                return this;
            }
            // all centroids coincide along the split axis; fall back to a
            // median split so one-triangle leaves still come out
            median_split(prims, dim)
        } else if n <= 2 {
            median_split(prims, dim)
        } else {
            match self.binned_split(prims, &bounds, &centroid_bounds, dim) {
                Some(mid) => mid,
                None => {
                    self.emit_leaf(tree, prims, bounds, this, triangles);
                    return this;
                }
            }
        };

        let (lo, hi) = prims.split_at_mut(mid);
        let left = self.build_range(tree, lo, triangles);
        let right = self.build_range(tree, hi, triangles);
        let bounds = tree.nodes[left as usize]
            .bounds
            .union(&tree.nodes[right as usize].bounds);
        tree.nodes[this as usize] = BuildNode {
            bounds,
            left,
            right,
            split_axis: dim as u8,
            first_prim: 0,
            n_prims: 0,
        };
        this
    }

    /// Bins the range along `dim` and evaluates the SAH at every split
    /// position. Returns the partition point, or `None` when a leaf is
    /// cheaper and small enough.
    fn binned_split(
        &self,
        prims: &mut [Primitive],
        bounds: &Aabb,
        centroid_bounds: &Aabb,
        dim: usize,
    ) -> Option<usize> {
        let bucket_of = |p: &Primitive| -> usize {
            let b = (N_BUCKETS as f32 * centroid_bounds.offset(p.centroid)[dim]) as usize;
            b.min(N_BUCKETS - 1)
        };

        let mut buckets = [Bucket::default(); N_BUCKETS];
        for p in prims.iter() {
            let b = bucket_of(p);
            buckets[b].count += 1;
            buckets[b].bounds = buckets[b].bounds.union(&p.bounds);
        }

        let mut min_cost = f32::MAX;
        let mut min_bucket = 0;
        for i in 0..N_BUCKETS - 1 {
            let mut b0 = Aabb::default();
            let mut b1 = Aabb::default();
            let mut count0 = 0;
            let mut count1 = 0;
            for b in &buckets[..=i] {
                b0 = b0.union(&b.bounds);
                count0 += b.count;
            }
            for b in &buckets[i + 1..] {
                b1 = b1.union(&b.bounds);
                count1 += b.count;
            }
            let cost = 1.0
                + (count0 as f32 * b0.surface_area() + count1 as f32 * b1.surface_area())
                    / bounds.surface_area();
            // strict comparison keeps the lowest-index bucket on ties
            if cost < min_cost {
                min_cost = cost;
                min_bucket = i;
            }
        }

        let leaf_cost = prims.len() as f32;
        if prims.len() > self.max_prims_in_node || min_cost < leaf_cost {
            let mid = itertools::partition(prims.iter_mut(), |p| bucket_of(p) <= min_bucket);
            Some(mid)
        } else {
            None
        }
    }

    fn emit_leaf(
        &self,
        tree: &mut BinaryTree,
        prims: &[Primitive],
        bounds: Aabb,
        slot: u32,
        triangles: &[IVec4],
    ) {
        let first = tree.ordered.len() as u32;
        for p in prims {
            tree.ordered.push(triangles[p.index as usize]);
        }
        tree.nodes[slot as usize] = BuildNode {
            bounds,
            left: 0,
            right: 0,
            split_axis: 0,
            first_prim: first,
            n_prims: prims.len() as u32,
        };
    }
}

fn median_split(prims: &mut [Primitive], dim: usize) -> usize {
    let mid = prims.len() / 2;
    prims.select_nth_unstable_by(mid, |a, b| a.centroid[dim].total_cmp(&b.centroid[dim]));
    mid
}

/// Flattens the pointer tree depth-first. The left child lands at the slot
/// after its parent; the right child's slot is written into the parent.
pub fn flatten(tree: &BinaryTree) -> Vec<LinearNode> {
    let mut out = Vec::with_capacity(tree.nodes.len());
    if !tree.nodes.is_empty() {
        flatten_node(tree, tree.root, &mut out);
    }
    out
}

fn flatten_node(tree: &BinaryTree, idx: u32, out: &mut Vec<LinearNode>) -> i32 {
    let node = tree.node(idx);
    let slot = out.len();
    out.push(LinearNode {
        min: node.bounds.min.to_array(),
        max: node.bounds.max.to_array(),
        ..Default::default()
    });

    if node.is_leaf() {
        out[slot].offset = node.first_prim as i32;
        out[slot].n_prims = node.n_prims as u16;
    } else {
        out[slot].axis = node.split_axis;
        flatten_node(tree, node.left, out);
        let second = flatten_node(tree, node.right, out);
        out[slot].offset = second;
    }
    slot as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn quad_grid(n: usize) -> (Vec<Vec4>, Vec<IVec4>) {
        // n*n unit quads in the z=0 plane, two triangles each
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for y in 0..n {
            for x in 0..n {
                let base = vertices.len() as i32;
                let (fx, fy) = (x as f32, y as f32);
                vertices.push(Vec4::new(fx, fy, 0.0, 0.0));
                vertices.push(Vec4::new(fx + 1.0, fy, 0.0, 0.0));
                vertices.push(Vec4::new(fx + 1.0, fy + 1.0, 0.0, 0.0));
                vertices.push(Vec4::new(fx, fy + 1.0, 0.0, 0.0));
                triangles.push(IVec4::new(base, base + 1, base + 2, 0));
                triangles.push(IVec4::new(base, base + 2, base + 3, 0));
            }
        }
        (vertices, triangles)
    }

    fn primitives(vertices: &[Vec4], triangles: &[IVec4]) -> Vec<Primitive> {
        triangles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Primitive::new(
                    i as u32,
                    Aabb::from_triangle(
                        vertices[t.x as usize].truncate(),
                        vertices[t.y as usize].truncate(),
                        vertices[t.z as usize].truncate(),
                    ),
                )
            })
            .collect()
    }

    #[test]
    fn empty_input_builds_empty_tree() {
        let tree = SahBuilder::new().build(&mut [], &[]);
        assert!(tree.nodes.is_empty());
        assert!(flatten(&tree).is_empty());
    }

    #[test]
    fn single_triangle_root_is_leaf() {
        let (vertices, triangles) = quad_grid(1);
        let triangles = &triangles[..1];
        let mut prims = primitives(&vertices, triangles);
        let tree = SahBuilder::new().build(&mut prims, triangles);
        let nodes = flatten(&tree);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_leaf());
        assert_eq!(nodes[0].n_prims, 1);
        assert_eq!(nodes[0].offset, 0);
    }

    #[test]
    fn ordered_triangles_are_a_permutation() {
        let (vertices, triangles) = quad_grid(8);
        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::new().build(&mut prims, &triangles);
        assert_eq!(tree.ordered.len(), triangles.len());
        let mut sorted_in: Vec<_> = triangles.iter().map(|t| t.to_array()).collect();
        let mut sorted_out: Vec<_> = tree.ordered.iter().map(|t| t.to_array()).collect();
        sorted_in.sort();
        sorted_out.sort();
        assert_eq!(sorted_in, sorted_out);
    }

    #[test]
    fn leaf_ranges_cover_triangles_without_overlap() {
        let (vertices, triangles) = quad_grid(6);
        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::new().build(&mut prims, &triangles);
        let nodes = flatten(&tree);

        let mut covered = vec![false; triangles.len()];
        for node in &nodes {
            if node.is_leaf() {
                for i in node.offset..node.offset + node.n_prims as i32 {
                    assert!(!covered[i as usize], "overlapping leaf ranges");
                    covered[i as usize] = true;
                }
            }
        }
        assert!(covered.into_iter().all(|c| c));
    }

    #[test]
    fn interior_children_are_forward_references() {
        let (vertices, triangles) = quad_grid(6);
        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::new().build(&mut prims, &triangles);
        let nodes = flatten(&tree);
        for (i, node) in nodes.iter().enumerate() {
            if !node.is_leaf() {
                assert!((i as i32 + 1) < node.offset);
                assert!((node.offset as usize) < nodes.len());
            }
        }
    }

    #[test]
    fn single_prim_variant_only_emits_one_triangle_leaves() {
        let (vertices, triangles) = quad_grid(5);
        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::single_prim().build(&mut prims, &triangles);
        for node in &tree.nodes {
            if node.is_leaf() {
                assert_eq!(node.n_prims, 1);
            }
        }
        assert_eq!(tree.ordered.len(), triangles.len());
    }

    #[test]
    fn identical_centroids_terminate() {
        // stacked coincident triangles: zero centroid spread on every axis
        let vertices = vec![
            Vec4::new(0.0, 0.0, 0.0, 0.0),
            Vec4::new(1.0, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0, 0.0, 0.0),
        ];
        let triangles = vec![IVec4::new(0, 1, 2, 0); 16];
        let mut prims = primitives(&vertices, &triangles);

        let tree = SahBuilder::new().build(&mut prims, &triangles);
        assert_eq!(tree.ordered.len(), triangles.len());

        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::single_prim().build(&mut prims, &triangles);
        assert_eq!(tree.ordered.len(), triangles.len());
        for node in &tree.nodes {
            if node.is_leaf() {
                assert_eq!(node.n_prims, 1);
            }
        }
    }

    #[test]
    fn parent_bounds_enclose_children() {
        let (vertices, triangles) = quad_grid(4);
        let mut prims = primitives(&vertices, &triangles);
        let tree = SahBuilder::new().build(&mut prims, &triangles);
        for node in &tree.nodes {
            if !node.is_leaf() {
                assert!(node.bounds.contains(&tree.node(node.left).bounds));
                assert!(node.bounds.contains(&tree.node(node.right).bounds));
            }
        }
    }
}
