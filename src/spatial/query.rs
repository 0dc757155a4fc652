use glam::Vec3;

use super::SpatialObject;
use crate::geometry::{Aabb, Frustum, FrustumSide, Ray};

/// Visitor protocol for container traversal.
///
/// `should_traverse` prunes whole subtrees or cell ranges;
/// `should_accept` filters individual objects. `volume_hint` lets flat
/// containers plan which cells to scan without knowing the concrete query
/// type: a point query reports its degenerate box, a volume query its
/// bounds, rays and frusta report nothing and fall back to a full scan.
pub trait SpatialQuery<T: SpatialObject> {
    fn should_traverse(&self, node_bounds: &Aabb) -> bool;
    fn should_accept(&self, object: &T) -> bool;

    /// Optional early termination, checked between visits.
    fn is_complete(&self) -> bool {
        false
    }

    /// Conservative bounding volume of the query region, if it has one.
    fn volume_hint(&self) -> Option<Aabb> {
        None
    }
}

/// All objects containing a point.
#[derive(Debug, Clone, Copy)]
pub struct PointQuery {
    pub point: Vec3,
}

impl PointQuery {
    pub fn new(point: Vec3) -> Self {
        Self { point }
    }
}

impl<T: SpatialObject> SpatialQuery<T> for PointQuery {
    fn should_traverse(&self, node_bounds: &Aabb) -> bool {
        node_bounds.contains(self.point)
    }

    fn should_accept(&self, object: &T) -> bool {
        object.contains(self.point)
    }

    fn volume_hint(&self) -> Option<Aabb> {
        Some(Aabb::new(self.point, self.point))
    }
}

/// All objects hit by a ray within `max_distance`.
#[derive(Debug, Clone, Copy)]
pub struct RayQuery {
    pub ray: Ray,
    pub max_distance: f32,
}

impl RayQuery {
    pub fn new(ray: Ray, max_distance: f32) -> Self {
        Self { ray, max_distance }
    }

    pub fn unbounded(ray: Ray) -> Self {
        Self::new(ray, f32::MAX)
    }
}

impl<T: SpatialObject> SpatialQuery<T> for RayQuery {
    fn should_traverse(&self, node_bounds: &Aabb) -> bool {
        self.ray
            .intersect_aabb(node_bounds)
            .is_some_and(|t| t <= self.max_distance)
    }

    fn should_accept(&self, object: &T) -> bool {
        object
            .intersects_ray(&self.ray)
            .is_some_and(|t| t <= self.max_distance)
    }
}

/// All objects intersecting a box.
#[derive(Debug, Clone, Copy)]
pub struct VolumeQuery {
    pub bounds: Aabb,
}

impl VolumeQuery {
    pub fn new(bounds: Aabb) -> Self {
        Self { bounds }
    }
}

impl<T: SpatialObject> SpatialQuery<T> for VolumeQuery {
    fn should_traverse(&self, node_bounds: &Aabb) -> bool {
        node_bounds.intersects(&self.bounds)
    }

    fn should_accept(&self, object: &T) -> bool {
        object.intersects(&self.bounds)
    }

    fn volume_hint(&self) -> Option<Aabb> {
        Some(self.bounds)
    }
}

/// All objects at least partially inside a view frustum.
#[derive(Debug, Clone, Copy)]
pub struct FrustumQuery {
    pub frustum: Frustum,
}

impl FrustumQuery {
    pub fn new(frustum: Frustum) -> Self {
        Self { frustum }
    }
}

impl<T: SpatialObject> SpatialQuery<T> for FrustumQuery {
    fn should_traverse(&self, node_bounds: &Aabb) -> bool {
        self.frustum.classify_aabb(node_bounds) != FrustumSide::Outside
    }

    fn should_accept(&self, object: &T) -> bool {
        object.intersects_frustum(&self.frustum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::testutil::TestBox;

    #[test]
    fn test_point_query_predicates() {
        let query = PointQuery::new(Vec3::splat(1.0));
        let node = Aabb::new(Vec3::ZERO, Vec3::splat(4.0));
        let far_node = Aabb::new(Vec3::splat(10.0), Vec3::splat(12.0));
        assert!(SpatialQuery::<TestBox>::should_traverse(&query, &node));
        assert!(!SpatialQuery::<TestBox>::should_traverse(&query, &far_node));

        let hit = TestBox::new(Vec3::splat(1.0), 0.5, 0);
        let miss = TestBox::new(Vec3::splat(3.0), 0.5, 1);
        assert!(query.should_accept(&hit));
        assert!(!query.should_accept(&miss));

        let hint = SpatialQuery::<TestBox>::volume_hint(&query).unwrap();
        assert_eq!(hint.min, hint.max);
    }

    #[test]
    fn test_ray_query_respects_max_distance() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let target = TestBox::new(Vec3::new(10.0, 0.0, 0.0), 0.5, 0);

        let near = RayQuery::new(ray, 20.0);
        let short = RayQuery::new(ray, 5.0);
        assert!(near.should_accept(&target));
        assert!(!short.should_accept(&target));

        let node = target.bounds;
        assert!(SpatialQuery::<TestBox>::should_traverse(&near, &node));
        assert!(!SpatialQuery::<TestBox>::should_traverse(&short, &node));
    }

    #[test]
    fn test_volume_query_predicates() {
        let query = VolumeQuery::new(Aabb::new(Vec3::ZERO, Vec3::splat(2.0)));
        let overlapping = TestBox::new(Vec3::splat(2.0), 0.5, 0);
        let outside = TestBox::new(Vec3::splat(5.0), 0.5, 1);
        assert!(query.should_accept(&overlapping));
        assert!(!query.should_accept(&outside));
        assert_eq!(
            SpatialQuery::<TestBox>::volume_hint(&query),
            Some(query.bounds)
        );
    }
}
