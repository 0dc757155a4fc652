//! Spatial partitioning: one object/query protocol shared by four
//! containers (BSP tree, loose octree, planar quadtree, sparse hash grid).
//!
//! Containers own their objects behind generational [`ObjectHandle`]s; a
//! handle stays valid until the object is removed, and query results are
//! handle lists that borrow nothing.

mod bsp;
mod config;
mod hash_grid;
mod octree;
mod quadtree;
mod query;

pub use bsp::BspTree;
pub use config::{ConfigError, ProjectionPlane, SpatialConfig};
pub use hash_grid::SpatialHashGrid;
pub use octree::LooseOctree;
pub use quadtree::Quadtree;
pub use query::{FrustumQuery, PointQuery, RayQuery, SpatialQuery, VolumeQuery};

use glam::Vec3;
use slotmap::new_key_type;

use crate::geometry::{Aabb, Frustum, Ray};

new_key_type! {
    /// Generational handle to an object owned by a spatial container.
    ///
    /// Reusing a freed slot bumps the generation, so a stale handle never
    /// aliases a newer object.
    pub struct ObjectHandle;
}

/// Capability an object needs to live in a spatial container.
///
/// The ray and frustum hooks are optional; the defaults opt the object out
/// of those query kinds.
pub trait SpatialObject {
    fn bounds(&self) -> Aabb;
    fn intersects(&self, bounds: &Aabb) -> bool;
    fn contains(&self, point: Vec3) -> bool;

    fn intersects_ray(&self, _ray: &Ray) -> Option<f32> {
        None
    }

    fn intersects_frustum(&self, _frustum: &Frustum) -> bool {
        false
    }
}

/// Operations every spatial container supports. Containers are single-writer:
/// reads may run concurrently with reads, never with writes.
pub trait SpatialContainer<T: SpatialObject> {
    /// Take ownership of `object` and index it. The returned handle is the
    /// object's identity for the rest of its life in this container.
    fn insert(&mut self, object: T) -> ObjectHandle;

    /// Remove and return the object; unknown handles are a silent no-op.
    fn remove(&mut self, handle: ObjectHandle) -> Option<T>;

    /// Re-index the object after its bounds changed (mutate it through
    /// [`get_mut`](Self::get_mut) first). Unknown handles are a silent
    /// no-op.
    fn update(&mut self, handle: ObjectHandle);

    fn clear(&mut self);

    fn get(&self, handle: ObjectHandle) -> Option<&T>;
    fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T>;

    /// Append every accepted object's handle to `results`. Containers that
    /// can hold an object in several places deduplicate before accepting.
    fn query<Q: SpatialQuery<T>>(&self, query: &Q, results: &mut Vec<ObjectHandle>);

    /// Restructure if the container's own heuristics say it degraded.
    fn optimize(&mut self);

    /// Flatten and reinsert everything.
    fn rebuild(&mut self);

    fn object_count(&self) -> usize;
    fn node_count(&self) -> usize;
    fn max_depth(&self) -> usize;

    fn average_objects_per_node(&self) -> f32 {
        let nodes = self.node_count();
        if nodes == 0 {
            0.0
        } else {
            self.object_count() as f32 / nodes as f32
        }
    }

    /// Visit the bounds of every live node, for debug visualization.
    fn debug_draw(&self, draw: &mut dyn FnMut(&Aabb));
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::geometry::{Frustum, Ray};

    /// Minimal object for container tests: an AABB with a tag.
    #[derive(Debug, Clone, PartialEq)]
    pub struct TestBox {
        pub bounds: Aabb,
        pub tag: i32,
    }

    impl TestBox {
        pub fn new(center: Vec3, half_extent: f32, tag: i32) -> Self {
            Self {
                bounds: Aabb::from_center_extent(center, Vec3::splat(half_extent)),
                tag,
            }
        }
    }

    impl SpatialObject for TestBox {
        fn bounds(&self) -> Aabb {
            self.bounds
        }

        fn intersects(&self, bounds: &Aabb) -> bool {
            self.bounds.intersects(bounds)
        }

        fn contains(&self, point: Vec3) -> bool {
            self.bounds.contains(point)
        }

        fn intersects_ray(&self, ray: &Ray) -> Option<f32> {
            ray.intersect_aabb(&self.bounds)
        }

        fn intersects_frustum(&self, frustum: &Frustum) -> bool {
            frustum.intersects_aabb(&self.bounds)
        }
    }

    /// Brute-force oracle: handles of all objects intersecting `volume`.
    pub fn brute_force_volume<T, C>(container: &C, handles: &[ObjectHandle], volume: &Aabb) -> Vec<ObjectHandle>
    where
        T: SpatialObject,
        C: SpatialContainer<T>,
    {
        handles
            .iter()
            .copied()
            .filter(|&h| container.get(h).is_some_and(|o| o.intersects(volume)))
            .collect()
    }

    /// Sorted copy for set comparison.
    pub fn sorted(mut handles: Vec<ObjectHandle>) -> Vec<ObjectHandle> {
        handles.sort();
        handles.dedup();
        handles
    }
}
