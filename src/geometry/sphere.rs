use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::Aabb;

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(C)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        debug_assert!(radius >= 0.0, "sphere radius must be non-negative");
        Self { center, radius }
    }

    /// Point containment, surface inclusive.
    #[inline]
    pub fn contains(&self, point: Vec3) -> bool {
        (point - self.center).length_squared() <= self.radius * self.radius
    }

    #[inline]
    pub fn intersects(&self, other: &Sphere) -> bool {
        let radii = self.radius + other.radius;
        (other.center - self.center).length_squared() <= radii * radii
    }

    /// Sphere/AABB overlap via the closest point on the box.
    #[inline]
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let closest = self.center.clamp(aabb.min, aabb.max);
        (closest - self.center).length_squared() <= self.radius * self.radius
    }
}
