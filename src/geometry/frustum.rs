use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::{Aabb, Plane, Sphere};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrustumSide {
    Outside,
    Intersecting,
    Inside,
}

/// Six-plane convex volume for view culling.
///
/// Plane normals point inward; order is near, far, left, right, top, bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract the planes from a view-projection matrix by row combination.
    pub fn from_view_projection(view_projection: Mat4) -> Self {
        let m = view_projection.to_cols_array_2d();
        let row = |i: usize| Vec4::new(m[0][i], m[1][i], m[2][i], m[3][i]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

        Self {
            planes: [
                normalized_plane(r3 + r2), // near
                normalized_plane(r3 - r2), // far
                normalized_plane(r3 + r0), // left
                normalized_plane(r3 - r0), // right
                normalized_plane(r3 - r1), // top
                normalized_plane(r3 + r1), // bottom
            ],
        }
    }

    pub fn classify_point(&self, point: Vec3) -> FrustumSide {
        for plane in &self.planes {
            if plane.signed_distance(point) < 0.0 {
                return FrustumSide::Outside;
            }
        }
        FrustumSide::Inside
    }

    pub fn classify_sphere(&self, sphere: &Sphere) -> FrustumSide {
        let mut intersecting = false;
        for plane in &self.planes {
            let distance = plane.signed_distance(sphere.center);
            if distance < -sphere.radius {
                return FrustumSide::Outside;
            }
            if distance.abs() <= sphere.radius {
                intersecting = true;
            }
        }
        if intersecting {
            FrustumSide::Intersecting
        } else {
            FrustumSide::Inside
        }
    }

    /// Center-extent projection test against each plane.
    pub fn classify_aabb(&self, aabb: &Aabb) -> FrustumSide {
        let center = aabb.center();
        let extent = aabb.extent();

        let mut intersecting = false;
        for plane in &self.planes {
            let radius = extent.dot(plane.normal.abs());
            let distance = plane.signed_distance(center);
            if distance < -radius {
                return FrustumSide::Outside;
            }
            if distance.abs() <= radius {
                intersecting = true;
            }
        }
        if intersecting {
            FrustumSide::Intersecting
        } else {
            FrustumSide::Inside
        }
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.classify_aabb(aabb) != FrustumSide::Outside
    }
}

fn normalized_plane(v: Vec4) -> Plane {
    let normal = v.truncate();
    let length = normal.length();
    debug_assert!(length > 0.0, "degenerate frustum plane");
    Plane {
        normal: normal / length,
        distance: v.w / length,
    }
}
