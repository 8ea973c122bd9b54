use glam::{Vec2, Vec3};

use crate::blas::{Blas, BlasNodes};
use crate::bvh::LinearNode;
use crate::error::{Error, Result};
use crate::ray::{self, Ray};
use crate::scene::{AdsHandle, INSTANCE_TRIANGLE_SPLIT_BIT, Scene};
use crate::wide::WideNode;

/// Depth cap of the SAH traversal stack. A deeper tree is a build-time
/// error; the emitted GPU program allocates exactly this much.
pub const SAH_TRAVERSE_STACK_SIZE: usize = 32;
/// Depth cap of the wide traversal stack.
pub const WIDE_TRAVERSE_STACK_SIZE: usize = 16;

/// Packed closest-hit record: `(prim_id, bits(b1), bits(b2), bits(t))`,
/// with `prim_id == -1` marking a miss. Layout matches the RGBA32I
/// intersection buffer the GPU path writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Intersection(pub [i32; 4]);

impl Intersection {
    pub fn miss(tmax: f32) -> Intersection {
        Intersection([-1, 0, 0, tmax.to_bits() as i32])
    }

    fn new(prim: i32, barys_and_t: Vec3) -> Intersection {
        Intersection([
            prim,
            barys_and_t.x.to_bits() as i32,
            barys_and_t.y.to_bits() as i32,
            barys_and_t.z.to_bits() as i32,
        ])
    }

    pub fn is_valid(&self) -> bool {
        self.0[0] >= 0
    }

    /// The raw id word; for TLAS queries the instance lives in the bits
    /// above [`INSTANCE_TRIANGLE_SPLIT_BIT`].
    pub fn primitive(&self) -> i32 {
        self.0[0]
    }

    pub fn triangle_id(&self) -> u32 {
        self.0[0] as u32 & ((1 << INSTANCE_TRIANGLE_SPLIT_BIT) - 1)
    }

    pub fn instance_id(&self) -> u32 {
        self.0[0] as u32 >> INSTANCE_TRIANGLE_SPLIT_BIT
    }

    pub fn bary_coords(&self) -> Vec2 {
        Vec2::new(
            f32::from_bits(self.0[1] as u32),
            f32::from_bits(self.0[2] as u32),
        )
    }

    pub fn distance(&self) -> f32 {
        f32::from_bits(self.0[3] as u32)
    }

    /// Typed view for CPU consumers. `from_tlas` controls whether the id
    /// word is split into triangle and instance parts.
    pub fn hit(&self, from_tlas: bool) -> Option<Hit> {
        if !self.is_valid() {
            return None;
        }
        Some(Hit {
            triangle: if from_tlas {
                self.triangle_id()
            } else {
                self.0[0] as u32
            },
            instance: from_tlas.then(|| self.instance_id()),
            barycentrics: self.bary_coords(),
            distance: self.distance(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Hit {
    pub triangle: u32,
    pub instance: Option<u32>,
    pub barycentrics: Vec2,
    pub distance: f32,
}

/// Closest hit against a single built BLAS.
pub fn intersect_blas(blas: &Blas, ray: Ray) -> Intersection {
    match &blas.nodes {
        BlasNodes::Sah(nodes) => intersect_sah(blas, nodes, ray),
        BlasNodes::Wide(nodes) => intersect_wide(blas, nodes, ray),
    }
}

/// Any hit within `ray.tmax` against a single built BLAS.
pub fn occlude_blas(blas: &Blas, ray: Ray) -> bool {
    match &blas.nodes {
        BlasNodes::Sah(nodes) => occlude_sah(blas, nodes, ray),
        BlasNodes::Wide(nodes) => occlude_wide(blas, nodes, ray),
    }
}

/// Closest hit against a BLAS or a TLAS. TLAS queries transform the ray
/// into each instance's BLAS space and pack the winning instance into the
/// id word.
pub fn intersect_scene(scene: &Scene, ads: AdsHandle, ray: Ray) -> Result<Intersection> {
    match ads {
        AdsHandle::Blas(_) => Ok(intersect_blas(scene.blas(ads)?, ray)),
        AdsHandle::Tlas(_) => {
            let tlas = scene.tlas(ads)?;
            let mut best = Intersection::miss(ray.tmax);
            let mut min_distance = ray.tmax;
            for (i, instance) in tlas.instances.iter().enumerate() {
                let blas = scene
                    .blas
                    .get(instance.blas_id as usize)
                    .ok_or(Error::InvalidBlasHandle)?;
                let inverse = instance.object_transform().inverse();
                let local = Ray::new(
                    inverse.transform_point3(ray.origin),
                    inverse.transform_vector3(ray.dir),
                    min_distance,
                );
                let hit = intersect_blas(blas, local);
                if hit.is_valid() && hit.distance() < min_distance {
                    min_distance = hit.distance();
                    best = hit;
                    best.0[0] |= (i as i32) << INSTANCE_TRIANGLE_SPLIT_BIT;
                }
            }
            Ok(best)
        }
    }
}

/// Occlusion against a BLAS or a TLAS.
pub fn occlude_scene(scene: &Scene, ads: AdsHandle, ray: Ray) -> Result<bool> {
    match ads {
        AdsHandle::Blas(_) => Ok(occlude_blas(scene.blas(ads)?, ray)),
        AdsHandle::Tlas(_) => {
            let tlas = scene.tlas(ads)?;
            for instance in &tlas.instances {
                let blas = scene
                    .blas
                    .get(instance.blas_id as usize)
                    .ok_or(Error::InvalidBlasHandle)?;
                let inverse = instance.object_transform().inverse();
                let local = Ray::new(
                    inverse.transform_point3(ray.origin),
                    inverse.transform_vector3(ray.dir),
                    ray.tmax,
                );
                if occlude_blas(blas, local) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn test_triangle(blas: &Blas, prim: usize, origin: Vec3, dir: Vec3, t_max: f32) -> Vec3 {
    let tri = blas.triangles[prim];
    ray::intersect_triangle(
        dir,
        origin,
        blas.position(tri.x as usize),
        blas.position(tri.y as usize),
        blas.position(tri.z as usize),
        t_max,
    )
}

fn intersect_sah(blas: &Blas, nodes: &[LinearNode], ray: Ray) -> Intersection {
    let mut best = Intersection::miss(ray.tmax);
    if nodes.is_empty() {
        return best;
    }

    let mut min_distance = ray.tmax;
    let inv_dir = ray.dir.recip();
    let dir_is_neg = [inv_dir.x < 0.0, inv_dir.y < 0.0, inv_dir.z < 0.0];
    let mut stack = Vec::with_capacity(SAH_TRAVERSE_STACK_SIZE);
    let mut current = 0usize;

    loop {
        let node = &nodes[current];
        let bounds = node.bounds();
        if ray::intersect_bounds(bounds.min, bounds.max, ray.origin, inv_dir, min_distance) {
            if node.is_leaf() {
                for i in 0..node.n_prims as usize {
                    let prim = node.offset as usize + i;
                    let hit = test_triangle(blas, prim, ray.origin, ray.dir, min_distance);
                    if hit.z < min_distance {
                        min_distance = hit.z;
                        best = Intersection::new(prim as i32, hit);
                    }
                }
                match stack.pop() {
                    Some(next) => current = next,
                    None => break,
                }
            } else if dir_is_neg[node.axis as usize] {
                stack.push(current + 1);
                current = node.offset as usize;
            } else {
                stack.push(node.offset as usize);
                current += 1;
            }
        } else {
            match stack.pop() {
                Some(next) => current = next,
                None => break,
            }
        }
    }
    best
}

fn occlude_sah(blas: &Blas, nodes: &[LinearNode], ray: Ray) -> bool {
    if nodes.is_empty() {
        return false;
    }

    let inv_dir = ray.dir.recip();
    let dir_is_neg = [inv_dir.x < 0.0, inv_dir.y < 0.0, inv_dir.z < 0.0];
    let mut stack = Vec::with_capacity(SAH_TRAVERSE_STACK_SIZE);
    let mut current = 0usize;

    loop {
        let node = &nodes[current];
        let bounds = node.bounds();
        if ray::intersect_bounds(bounds.min, bounds.max, ray.origin, inv_dir, ray.tmax) {
            if node.is_leaf() {
                for i in 0..node.n_prims as usize {
                    let prim = node.offset as usize + i;
                    let hit = test_triangle(blas, prim, ray.origin, ray.dir, ray.tmax);
                    if hit.z < ray.tmax {
                        return true;
                    }
                }
                match stack.pop() {
                    Some(next) => current = next,
                    None => break,
                }
            } else if dir_is_neg[node.axis as usize] {
                stack.push(current + 1);
                current = node.offset as usize;
            } else {
                stack.push(node.offset as usize);
                current += 1;
            }
        } else {
            match stack.pop() {
                Some(next) => current = next,
                None => break,
            }
        }
    }
    false
}

/// Intersects the ray against all eight quantized child boxes of one wide
/// record. Returns the hitmask: internal-child ordinals in bits 24..32,
/// triangle-presence bits below, both positioned by the meta bytes.
fn wide_intersect_children(node: &WideNode, origin: Vec3, dir: Vec3, t_max: f32) -> u32 {
    const OOEPS: f32 = 1e-40;
    let safe = |d: f32| 1.0 / if d.abs() > OOEPS { d } else { OOEPS.copysign(d) };
    let idir = Vec3::new(safe(dir.x), safe(dir.y), safe(dir.z));

    let adjusted = node.scales() * idir;
    let org = (Vec3::from_array(node.origin) - origin) * idir;

    let mut hitmask = 0u32;
    for half in 0..2 {
        // swizzle lo/hi halves by direction sign so the same gather order
        // serves both slab orientations
        let mut lo = [0u32; 3];
        let mut hi = [0u32; 3];
        for axis in 0..3 {
            let lo_word = node.child_bbox[2 * axis + half];
            let hi_word = node.child_bbox[6 + 2 * axis + half];
            if dir[axis] < 0.0 {
                lo[axis] = hi_word;
                hi[axis] = lo_word;
            } else {
                lo[axis] = lo_word;
                hi[axis] = hi_word;
            }
        }

        for j in 0..4 {
            let shift = 8 * j;
            let tmin = Vec3::new(
                ((lo[0] >> shift) & 0xFF) as f32 * adjusted.x + org.x,
                ((lo[1] >> shift) & 0xFF) as f32 * adjusted.y + org.y,
                ((lo[2] >> shift) & 0xFF) as f32 * adjusted.z + org.z,
            );
            let tmax = Vec3::new(
                ((hi[0] >> shift) & 0xFF) as f32 * adjusted.x + org.x,
                ((hi[1] >> shift) & 0xFF) as f32 * adjusted.y + org.y,
                ((hi[2] >> shift) & 0xFF) as f32 * adjusted.z + org.z,
            );
            let cmin = tmin.max_element().max(0.0);
            let cmax = tmax.min_element().min(t_max);
            if cmin <= cmax {
                let meta = (node.meta[half] >> shift) & 0xFF;
                hitmask |= (meta >> 5) << (meta & 31);
            }
        }
    }
    hitmask
}

fn intersect_wide(blas: &Blas, nodes: &[WideNode], ray: Ray) -> Intersection {
    let mut best = Intersection::miss(ray.tmax);
    if nodes.is_empty() {
        return best;
    }

    let mut min_distance = ray.tmax;
    let mut stack: Vec<(u32, u32)> = Vec::with_capacity(WIDE_TRAVERSE_STACK_SIZE);
    // the pseudo-root group: record 0, one unvisited internal child
    let mut group = (0u32, 0x0100_0000u32);
    let mut tri_base;
    let mut tri_hits;

    loop {
        if group.1 & 0xFF00_0000 != 0 {
            let n = ((group.1 >> 24) & 0xFF).trailing_zeros();
            group.1 &= !(1 << (n + 24));
            if group.1 & 0xFF00_0000 != 0 {
                stack.push(group);
            }
            let node = &nodes[(group.0 + n) as usize];
            let hitmask = wide_intersect_children(node, ray.origin, ray.dir, min_distance);
            tri_base = node.triangle_base_index;
            tri_hits = hitmask & 0x00FF_FFFF;
            group = (
                node.child_node_base_index,
                (hitmask & 0xFF00_0000) | node.imask as u32,
            );
        } else {
            tri_base = group.0;
            tri_hits = group.1;
            group = (0, 0);
        }

        let mut rel = 0;
        while tri_hits != 0 {
            if tri_hits & 1 != 0 {
                let prim = (tri_base + rel) as usize;
                let hit = test_triangle(blas, prim, ray.origin, ray.dir, min_distance);
                if hit.z < min_distance {
                    min_distance = hit.z;
                    best = Intersection::new(prim as i32, hit);
                }
            }
            rel += 1;
            tri_hits >>= 1;
        }

        if group.1 & 0xFF00_0000 == 0 {
            match stack.pop() {
                Some(g) => group = g,
                None => break,
            }
        }
    }
    best
}

fn occlude_wide(blas: &Blas, nodes: &[WideNode], ray: Ray) -> bool {
    if nodes.is_empty() {
        return false;
    }

    let mut stack: Vec<(u32, u32)> = Vec::with_capacity(WIDE_TRAVERSE_STACK_SIZE);
    let mut group = (0u32, 0x0100_0000u32);
    let mut tri_base;
    let mut tri_hits;

    loop {
        if group.1 & 0xFF00_0000 != 0 {
            let n = ((group.1 >> 24) & 0xFF).trailing_zeros();
            group.1 &= !(1 << (n + 24));
            if group.1 & 0xFF00_0000 != 0 {
                stack.push(group);
            }
            let node = &nodes[(group.0 + n) as usize];
            let hitmask = wide_intersect_children(node, ray.origin, ray.dir, ray.tmax);
            tri_base = node.triangle_base_index;
            tri_hits = hitmask & 0x00FF_FFFF;
            group = (
                node.child_node_base_index,
                (hitmask & 0xFF00_0000) | node.imask as u32,
            );
        } else {
            tri_base = group.0;
            tri_hits = group.1;
            group = (0, 0);
        }

        let mut rel = 0;
        while tri_hits != 0 {
            if tri_hits & 1 != 0 {
                let prim = (tri_base + rel) as usize;
                let hit = test_triangle(blas, prim, ray.origin, ray.dir, ray.tmax);
                if hit.z < ray.tmax {
                    return true;
                }
            }
            rel += 1;
            tri_hits >>= 1;
        }

        if group.1 & 0xFF00_0000 == 0 {
            match stack.pop() {
                Some(g) => group = g,
                None => break,
            }
        }
    }
    false
}
