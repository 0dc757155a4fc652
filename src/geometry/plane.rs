use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{Aabb, Ray};

/// Classification tolerance: points within this distance lie on the plane.
const PLANE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    Front,
    Back,
    On,
}

/// Plane in constant-normal form, `n · p + d = 0` with a unit normal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self {
            normal: normal.normalize(),
            distance,
        }
    }

    /// Plane through `point` with the given normal.
    pub fn from_point(normal: Vec3, point: Vec3) -> Self {
        let normal = normal.normalize();
        Self {
            normal,
            distance: -normal.dot(point),
        }
    }

    #[inline]
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    pub fn classify(&self, point: Vec3) -> PlaneSide {
        let d = self.signed_distance(point);
        if d > PLANE_EPSILON {
            PlaneSide::Front
        } else if d < -PLANE_EPSILON {
            PlaneSide::Back
        } else {
            PlaneSide::On
        }
    }

    /// Which half-space holds the whole box; `On` means it straddles.
    pub fn side_of_aabb(&self, aabb: &Aabb) -> PlaneSide {
        let radius = aabb.extent().dot(self.normal.abs());
        let distance = self.signed_distance(aabb.center());
        if distance > radius {
            PlaneSide::Front
        } else if distance < -radius {
            PlaneSide::Back
        } else {
            PlaneSide::On
        }
    }

    /// Hit distance along the ray; near-parallel rays and hits behind the
    /// origin are rejected.
    pub fn intersect_ray(&self, ray: &Ray) -> Option<f32> {
        let denominator = self.normal.dot(ray.direction);
        if denominator.abs() < PLANE_EPSILON {
            return None;
        }
        let t = -(self.normal.dot(ray.origin) + self.distance) / denominator;
        (t >= 0.0).then_some(t)
    }
}
