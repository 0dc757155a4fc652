use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{Aabb, Sphere};

/// Axes with |direction| below this are treated as parallel to the slab.
const PARALLEL_EPSILON: f32 = 1e-8;

/// Ray with a direction normalized at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Smallest non-negative hit distance; an origin inside the sphere
    /// reports `t = 0`.
    pub fn intersect_sphere(&self, sphere: &Sphere) -> Option<f32> {
        let m = self.origin - sphere.center;
        let b = m.dot(self.direction);
        let c = m.length_squared() - sphere.radius * sphere.radius;

        // Origin outside and pointing away: no hit.
        if c > 0.0 && b > 0.0 {
            return None;
        }
        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return None;
        }
        Some((-b - discriminant.sqrt()).max(0.0))
    }

    /// Slab test. Returns the entry distance, or the exit distance when the
    /// origin is inside the box; per-axis parallel rays miss unless the
    /// origin sits inside that slab.
    pub fn intersect_aabb(&self, aabb: &Aabb) -> Option<f32> {
        let mut t_min = f32::NEG_INFINITY;
        let mut t_max = f32::INFINITY;

        for axis in 0..3 {
            let dir = self.direction[axis];
            let origin = self.origin[axis];
            let (min, max) = (aabb.min[axis], aabb.max[axis]);

            if dir.abs() < PARALLEL_EPSILON {
                if origin < min || origin > max {
                    return None;
                }
            } else {
                let inv = 1.0 / dir;
                let mut t1 = (min - origin) * inv;
                let mut t2 = (max - origin) * inv;
                if t1 > t2 {
                    std::mem::swap(&mut t1, &mut t2);
                }
                t_min = t_min.max(t1);
                t_max = t_max.min(t2);
                if t_min > t_max {
                    return None;
                }
            }
        }

        if t_max < 0.0 {
            return None;
        }
        Some(if t_min < 0.0 { t_max } else { t_min })
    }
}
