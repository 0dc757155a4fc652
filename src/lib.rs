//! Foundation layer for the Veldra engine.
//!
//! Ships the pieces every other subsystem builds on: fixed-lifetime memory
//! allocators, SIMD-aware geometry primitives, spatial partitioning
//! containers sharing one object/query protocol, and the broad-phase
//! collision grid that feeds narrow-phase pair generation.

pub mod broadphase;
pub mod geometry;
pub mod memory;
pub mod spatial;

// Re-exports for the common entry points
pub use broadphase::{BroadPhaseGrid, CollisionPair, GridStats};
pub use geometry::{Aabb, Frustum, FrustumSide, Plane, PlaneSide, Ray, Sphere};
pub use memory::{
    AllocError, Allocator, LinearArena, Marker, PoolAllocator, SizeClass, StackArena,
};
pub use spatial::{
    BspTree, ConfigError, FrustumQuery, LooseOctree, ObjectHandle, PointQuery, ProjectionPlane,
    Quadtree, RayQuery, SpatialConfig, SpatialContainer, SpatialHashGrid, SpatialObject,
    SpatialQuery, VolumeQuery,
};
