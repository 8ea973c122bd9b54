use glam::Vec3;

/// A query ray. `origin` and `dir` are never mutated by the core; hit
/// searches shrink their own working copy of `tmax`.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
    pub tmax: f32,
}

impl Ray {
    pub fn new(origin: Vec3, dir: Vec3, tmax: f32) -> Ray {
        Ray { origin, dir, tmax }
    }
}

/// Möller–Trumbore ray/triangle test. Returns `(b1, b2, t)` on a hit and
/// `(0, 0, t_max)` on a miss, so callers detect hits with `t < t_max`.
///
/// A parallel ray makes `invd` infinite; the interval checks below reject
/// the resulting barycentrics, no special casing needed.
pub fn intersect_triangle(
    dir: Vec3,
    origin: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    t_max: f32,
) -> Vec3 {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let s1 = dir.cross(e2);
    let invd = 1.0 / s1.dot(e1);

    let d = origin - v0;
    let b1 = d.dot(s1) * invd;
    let s2 = d.cross(e1);
    let b2 = dir.dot(s2) * invd;
    let t = e2.dot(s2) * invd;

    if b1 < 0.0 || b1 > 1.0 || b2 < 0.0 || b1 + b2 > 1.0 || t < 0.0 || t > t_max {
        Vec3::new(0.0, 0.0, t_max)
    } else {
        Vec3::new(b1, b2, t)
    }
}

/// Slab test against `[0, t_max]` with a precomputed reciprocal direction.
pub fn intersect_bounds(vmin: Vec3, vmax: Vec3, origin: Vec3, dirfrac: Vec3, t_max: f32) -> bool {
    let mut t0 = 0.0f32;
    let mut t1 = t_max;
    for i in 0..3 {
        let mut t_near = (vmin[i] - origin[i]) * dirfrac[i];
        let mut t_far = (vmax[i] - origin[i]) * dirfrac[i];
        if dirfrac[i] < 0.0 {
            std::mem::swap(&mut t_near, &mut t_far);
        }
        t0 = t0.max(t_near);
        t1 = t1.min(t_far);
        if t0 > t1 {
            return false;
        }
    }
    true
}
