// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Mathematical utilities and decisions.

use cgmath::{InnerSpace as _, Vector3};

mod color;
pub use color::*;

/// Coordinates that are not locked to any grid.
pub type FreeCoordinate = f64;

/// Tolerance for geometric coincidence tests.
pub(crate) const EPSILON: FreeCoordinate = 1.0e-10;

/// Reflects `v` about the plane with the given (unit) normal:
/// `v − 2(v·n)n`. Not normalized; `v`'s length is preserved when `n` is unit.
#[inline]
pub fn reflect(v: Vector3<FreeCoordinate>, normal: Vector3<FreeCoordinate>) -> Vector3<FreeCoordinate> {
    v - normal * (2.0 * v.dot(normal))
}

/// Builds two unit vectors perpendicular to `normal` and to each other.
///
/// When the normal is within ~0.1 of vertical the cross-product axis switches
/// to the horizon so the frame never degenerates.
pub fn perpendicular_frame(
    normal: Vector3<FreeCoordinate>,
) -> (Vector3<FreeCoordinate>, Vector3<FreeCoordinate>) {
    let up = if (normal.z.abs() - 1.0).abs() < 0.1 {
        // too close to vertical for comfort, so use cross product with horizon
        Vector3::new(0.0, 1.0, 0.0)
    } else {
        Vector3::new(0.0, 0.0, 1.0)
    };
    let n2 = normal.cross(up).normalize();
    let n3 = normal.cross(n2).normalize();
    (n2, n3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflect_bounces_off_plane() {
        let r = reflect(
            Vector3::new(1.0, -1.0, 0.0).normalize(),
            Vector3::new(0.0, 1.0, 0.0),
        );
        assert!((r - Vector3::new(1.0, 1.0, 0.0).normalize()).magnitude() < 1e-12);
    }

    #[test]
    fn perpendicular_frame_never_degenerates() {
        for normal in &[
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.577, 0.577, 0.577),
        ] {
            let n = normal.normalize();
            let (a, b) = perpendicular_frame(n);
            assert!(a.dot(n).abs() < 1e-9);
            assert!(b.dot(n).abs() < 1e-9);
            assert!(a.dot(b).abs() < 1e-9);
            assert!((a.magnitude() - 1.0).abs() < 1e-9);
        }
    }
}
