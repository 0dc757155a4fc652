use std::fmt;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::geometry::Aabb;

/// Plane the quadtree partitions over; the remaining axis is carried
/// opaquely through queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectionPlane {
    #[default]
    Xz,
    Xy,
    Yz,
}

impl ProjectionPlane {
    /// Project a 3D point onto the partitioning plane.
    pub(crate) fn project(&self, v: Vec3) -> Vec2 {
        match self {
            ProjectionPlane::Xz => Vec2::new(v.x, v.z),
            ProjectionPlane::Xy => Vec2::new(v.x, v.y),
            ProjectionPlane::Yz => Vec2::new(v.y, v.z),
        }
    }

    /// The coordinate along the unpartitioned axis.
    pub(crate) fn w(&self, v: Vec3) -> f32 {
        match self {
            ProjectionPlane::Xz => v.y,
            ProjectionPlane::Xy => v.z,
            ProjectionPlane::Yz => v.x,
        }
    }

    /// Rebuild a 3D box from planar bounds and a range on the remaining
    /// axis.
    pub(crate) fn lift(&self, min: Vec2, max: Vec2, w_min: f32, w_max: f32) -> Aabb {
        match self {
            ProjectionPlane::Xz => Aabb::new(
                Vec3::new(min.x, w_min, min.y),
                Vec3::new(max.x, w_max, max.y),
            ),
            ProjectionPlane::Xy => Aabb::new(
                Vec3::new(min.x, min.y, w_min),
                Vec3::new(max.x, max.y, w_max),
            ),
            ProjectionPlane::Yz => Aabb::new(
                Vec3::new(w_min, min.x, min.y),
                Vec3::new(w_max, max.x, max.y),
            ),
        }
    }
}

/// Tuning knobs shared by all spatial containers. Every field has a default;
/// containers validate the bag at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpatialConfig {
    pub max_objects_per_node: u32,
    pub max_depth: u32,
    pub min_node_size: f32,
    /// Bound expansion factor for the loose octree and quadtree.
    pub looseness: f32,
    /// Leaf split threshold for the BSP tree.
    pub max_triangles_per_leaf: u32,
    /// Hash grid cell edge length.
    pub cell_size: f32,
    pub rebuild_threshold: f32,
    pub update_interval: u32,
    pub projection_plane: ProjectionPlane,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            max_objects_per_node: 16,
            max_depth: 16,
            min_node_size: 1.0,
            looseness: 1.5,
            max_triangles_per_leaf: 32,
            cell_size: 10.0,
            rebuild_threshold: 0.7,
            update_interval: 60,
            projection_plane: ProjectionPlane::default(),
        }
    }
}

impl SpatialConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_objects_per_node == 0 {
            return Err(ConfigError("max_objects_per_node must be non-zero"));
        }
        if self.max_depth == 0 {
            return Err(ConfigError("max_depth must be non-zero"));
        }
        if self.max_triangles_per_leaf == 0 {
            return Err(ConfigError("max_triangles_per_leaf must be non-zero"));
        }
        if !(self.min_node_size > 0.0) || !self.min_node_size.is_finite() {
            return Err(ConfigError("min_node_size must be positive"));
        }
        if !(self.looseness > 1.0) || !self.looseness.is_finite() {
            return Err(ConfigError("looseness must be greater than 1"));
        }
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(ConfigError("cell_size must be positive"));
        }
        if !(self.rebuild_threshold > 0.0 && self.rebuild_threshold <= 1.0) {
            return Err(ConfigError("rebuild_threshold must lie in (0, 1]"));
        }
        Ok(())
    }
}

/// Rejected configuration value, reported at container construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError(pub &'static str);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid spatial configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SpatialConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = SpatialConfig::default();
        config.looseness = 1.0;
        assert!(config.validate().is_err());

        let mut config = SpatialConfig::default();
        config.min_node_size = -2.0;
        assert!(config.validate().is_err());

        let mut config = SpatialConfig::default();
        config.cell_size = 0.0;
        assert!(config.validate().is_err());

        let mut config = SpatialConfig::default();
        config.max_objects_per_node = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_projection_roundtrip() {
        let v = Vec3::new(1.0, 2.0, 3.0);
        for plane in [ProjectionPlane::Xz, ProjectionPlane::Xy, ProjectionPlane::Yz] {
            let p = plane.project(v);
            let w = plane.w(v);
            let lifted = plane.lift(p, p, w, w);
            assert_eq!(lifted.min, v);
            assert_eq!(lifted.max, v);
        }
    }
}
