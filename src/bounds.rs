use glam::Vec3;

/// Axis-aligned bounding box. The default value is the union identity
/// (`min = +inf`, `max = -inf`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Aabb {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }
}

impl Aabb {
    pub fn from_point(p: Vec3) -> Aabb {
        Aabb { min: p, max: p }
    }

    pub fn from_triangle(v0: Vec3, v1: Vec3, v2: Vec3) -> Aabb {
        Aabb {
            min: v0.min(v1).min(v2),
            max: v0.max(v1).max(v2),
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn union_point(&self, p: Vec3) -> Aabb {
        Aabb {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn diagonal(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn surface_area(&self) -> f32 {
        let d = self.diagonal();
        2.0 * (d.x * d.y + d.x * d.z + d.y * d.z)
    }

    /// Index of the largest diagonal component; ties resolve x over y over z.
    pub fn maximum_extent(&self) -> usize {
        let d = self.diagonal();
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// Component-wise position of `p` inside the box, in `[0, 1]` per axis.
    /// Degenerate axes yield zero so binning never sees a NaN.
    pub fn offset(&self, p: Vec3) -> Vec3 {
        let d = self.diagonal();
        let o = p - self.min;
        Vec3::new(
            if d.x > 0.0 { o.x / d.x } else { 0.0 },
            if d.y > 0.0 { o.y / d.y } else { 0.0 },
            if d.z > 0.0 { o.z / d.z } else { 0.0 },
        )
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_identity() {
        let b = Aabb::default().union_point(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.min, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn surface_area_unit_cube() {
        let b = Aabb::from_point(Vec3::ZERO).union_point(Vec3::ONE);
        assert_eq!(b.surface_area(), 6.0);
    }

    #[test]
    fn maximum_extent_tie_breaks_low_axis() {
        let b = Aabb::from_point(Vec3::ZERO).union_point(Vec3::new(1.0, 1.0, 0.5));
        assert_eq!(b.maximum_extent(), 0);
        let b = Aabb::from_point(Vec3::ZERO).union_point(Vec3::new(0.5, 1.0, 1.0));
        assert_eq!(b.maximum_extent(), 1);
    }

    #[test]
    fn offset_degenerate_axis_is_zero() {
        let b = Aabb::from_point(Vec3::ZERO).union_point(Vec3::new(2.0, 0.0, 2.0));
        let o = b.offset(Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(o, Vec3::new(0.5, 0.0, 1.0));
    }

    #[test]
    fn triangle_bounds_cover_vertices() {
        let b = Aabb::from_triangle(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        assert_eq!(b.min, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 0.0));
    }
}
