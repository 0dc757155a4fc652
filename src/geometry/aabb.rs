use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec3A};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in min/max form.
///
/// `min == max` is a valid point-box. The `Default` value is the inverted
/// infinite box, so folding `union` over any set of boxes starts correctly.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(C)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_extent(center: Vec3, extent: Vec3) -> Self {
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half-size per axis.
    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Full size per axis.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn is_valid(&self) -> bool {
        Vec3A::from(self.min).cmple(Vec3A::from(self.max)).all()
    }

    /// Point containment, boundary inclusive.
    #[inline]
    pub fn contains(&self, point: Vec3) -> bool {
        let p = Vec3A::from(point);
        p.cmpge(Vec3A::from(self.min)).all() && p.cmple(Vec3A::from(self.max)).all()
    }

    /// Overlap test, touching boxes count as intersecting.
    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        Vec3A::from(self.min).cmple(Vec3A::from(other.max)).all()
            && Vec3A::from(self.max).cmpge(Vec3A::from(other.min)).all()
    }

    /// True when `other` lies entirely inside `self`, boundary inclusive.
    #[inline]
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        Vec3A::from(self.min).cmple(Vec3A::from(other.min)).all()
            && Vec3A::from(self.max).cmpge(Vec3A::from(other.max)).all()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn extend(&mut self, other: &Aabb) {
        *self = self.union(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scalar_contains(aabb: &Aabb, p: Vec3) -> bool {
        p.x >= aabb.min.x
            && p.x <= aabb.max.x
            && p.y >= aabb.min.y
            && p.y <= aabb.max.y
            && p.z >= aabb.min.z
            && p.z <= aabb.max.z
    }

    fn scalar_intersects(a: &Aabb, b: &Aabb) -> bool {
        a.min.x <= b.max.x
            && a.max.x >= b.min.x
            && a.min.y <= b.max.y
            && a.max.y >= b.min.y
            && a.min.z <= b.max.z
            && a.max.z >= b.min.z
    }

    fn random_aabb(rng: &mut StdRng) -> Aabb {
        let a = Vec3::new(
            rng.random_range(-100.0..100.0),
            rng.random_range(-100.0..100.0),
            rng.random_range(-100.0..100.0),
        );
        let b = Vec3::new(
            rng.random_range(-100.0..100.0),
            rng.random_range(-100.0..100.0),
            rng.random_range(-100.0..100.0),
        );
        Aabb::new(a.min(b), a.max(b))
    }

    #[test]
    fn test_contains_matches_scalar_form() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let aabb = random_aabb(&mut rng);
            let p = Vec3::new(
                rng.random_range(-120.0..120.0),
                rng.random_range(-120.0..120.0),
                rng.random_range(-120.0..120.0),
            );
            assert_eq!(aabb.contains(p), scalar_contains(&aabb, p), "{aabb:?} vs {p:?}");
        }
    }

    #[test]
    fn test_intersects_matches_scalar_form() {
        let mut rng = StdRng::seed_from_u64(0xbeef);
        for _ in 0..10_000 {
            let a = random_aabb(&mut rng);
            let b = random_aabb(&mut rng);
            assert_eq!(a.intersects(&b), scalar_intersects(&a, &b), "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains(Vec3::ZERO));
        assert!(aabb.contains(Vec3::ONE));
        assert!(aabb.contains(Vec3::new(1.0, 0.0, 0.5)));
        assert!(!aabb.contains(Vec3::new(1.0 + f32::EPSILON * 2.0, 0.0, 0.5)));
    }

    #[test]
    fn test_single_axis_miss_is_detected() {
        // Each axis must be able to veto on its own; a predicate that only
        // checks two lanes passes exactly one of these.
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(!aabb.contains(Vec3::new(2.0, 0.5, 0.5)));
        assert!(!aabb.contains(Vec3::new(0.5, 2.0, 0.5)));
        assert!(!aabb.contains(Vec3::new(0.5, 0.5, 2.0)));

        let z_off = Aabb::new(Vec3::new(0.0, 0.0, 5.0), Vec3::new(1.0, 1.0, 6.0));
        assert!(!aabb.intersects(&z_off));
    }

    #[test]
    fn test_zero_extent_box() {
        let point_box = Aabb::new(Vec3::splat(2.0), Vec3::splat(2.0));
        assert!(point_box.contains(Vec3::splat(2.0)));
        assert!(!point_box.contains(Vec3::new(2.0, 2.0, 2.1)));
        assert!(point_box.intersects(&Aabb::new(Vec3::ZERO, Vec3::splat(2.0))));
        assert_eq!(point_box.extent(), Vec3::ZERO);
    }

    #[test]
    fn test_union_and_default_fold() {
        let boxes = [
            Aabb::new(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0)),
            Aabb::new(Vec3::new(0.0, -5.0, 0.0), Vec3::new(0.5, 0.5, 9.0)),
        ];
        let total = boxes.iter().fold(Aabb::default(), |acc, b| acc.union(b));
        assert_eq!(total.min, Vec3::new(-1.0, -5.0, 0.0));
        assert_eq!(total.max, Vec3::new(1.0, 1.0, 9.0));
        for b in &boxes {
            assert!(total.contains_aabb(b));
        }
    }
}
