// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Camera models and primary-ray generation.
//!
//! Every model maps a (possibly fractional) pixel coordinate to a ray;
//! models with a circular image (fisheye, omnimax) refuse pixels outside
//! their disk by returning no ray at all.

use cgmath::{InnerSpace as _, Point3, Vector3};

use crate::math::FreeCoordinate;
use crate::texture::NormalPerturber;

/// The supported projections.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Projection {
    /// Pinhole camera; the standard.
    Perspective,
    Orthographic,
    Fisheye,
    /// OMNIMAX dome projection.
    Omnimax,
    /// Cylindrical panorama with tangent-corrected vertical.
    Panoramic,
    UltraWideAngle,
    /// Cylinder with its axis along `up`.
    Cylinder1,
    /// Cylinder with its axis along `right`.
    Cylinder2,
    /// Like [`Projection::Cylinder1`] but orthographic along `right`.
    Cylinder3,
    /// Like [`Projection::Cylinder2`] but orthographic along `up`.
    Cylinder4,
}

/// A camera.
pub struct Camera {
    pub projection: Projection,
    pub location: Point3<FreeCoordinate>,
    /// View direction; its length sets the focal length for perspective.
    pub direction: Vector3<FreeCoordinate>,
    pub up: Vector3<FreeCoordinate>,
    pub right: Vector3<FreeCoordinate>,
    /// The point the camera was aimed at (used for focal defaults).
    pub look_at: Point3<FreeCoordinate>,
    /// Field-of-view angle in degrees, used by the angular projections.
    pub angle: FreeCoordinate,
    /// Aperture diameter for focal blur; 0 disables.
    pub aperture: FreeCoordinate,
    pub blur_samples: usize,
    pub focal_distance: FreeCoordinate,
    /// Confidence level for the focal-blur variance test.
    pub confidence: FreeCoordinate,
    /// Target variance for the focal-blur early exit.
    pub variance: FreeCoordinate,
    /// Optional perturbation of ray directions in screen space.
    pub perturb: Option<Box<dyn NormalPerturber>>,
}

impl Camera {
    /// A camera at `location` aimed at `look_at`, with a 4:3 film plane and
    /// conventional axes.
    pub fn looking_at(
        projection: Projection,
        location: Point3<FreeCoordinate>,
        look_at: Point3<FreeCoordinate>,
    ) -> Self {
        let forward = (look_at - location).normalize();
        let up_guess = if forward.y.abs() > 0.99 {
            Vector3::new(0.0, 0.0, 1.0)
        } else {
            Vector3::new(0.0, 1.0, 0.0)
        };
        let right_unit = up_guess.cross(forward).normalize();
        let up = forward.cross(right_unit);
        Camera {
            projection,
            location,
            direction: forward,
            up,
            right: right_unit * (4.0 / 3.0),
            look_at,
            angle: 90.0,
            aperture: 0.0,
            blur_samples: 0,
            focal_distance: (look_at - location).magnitude(),
            confidence: 0.9,
            variance: 1.0 / 128.0,
            perturb: None,
        }
    }

    /// Distance from the camera to its aim point.
    pub fn focus_distance(&self) -> FreeCoordinate {
        (self.look_at - self.location).magnitude()
    }

    /// Whether focal blur is active.
    pub fn uses_focal_blur(&self) -> bool {
        self.aperture != 0.0 && self.blur_samples > 0
    }

    /// Maps pixel coordinates to a primary ray, or `None` when the pixel is
    /// outside the projection's image.
    ///
    /// `constants` caches normalization that is identical for every ray of a
    /// frame. The returned direction is *not* yet normalized — focal blur
    /// must deflect it first — and `screen` is the final screen-space
    /// coordinate pair, used for direction perturbation.
    pub(crate) fn project(
        &self,
        x: FreeCoordinate,
        y: FreeCoordinate,
        width: FreeCoordinate,
        height: FreeCoordinate,
        constants: &mut CameraConstants,
    ) -> Option<ProjectedRay> {
        if !constants.computed {
            constants.aspect_ratio = self.right.magnitude() / self.up.magnitude();
            constants.right_n = self.right.normalize();
            constants.up_n = self.up.normalize();
            constants.direction_n = self.direction.normalize();
            constants.computed = true;
        }

        // Screen coordinates: x0 and y0 in -0.5..0.5 with y increasing
        // upward (scanlines count down).
        let half_x = x / width - 0.5;
        let half_y = ((height - 1.0) - y) / height - 0.5;
        // Or -1..1 for the circular projections.
        let full_x = 2.0 * x / width - 1.0;
        let full_y = 2.0 * ((height - 1.0) - y) / height - 1.0;

        let mut origin = self.location;
        let direction;
        let screen;
        let mut per_ray_containers = false;

        match self.projection {
            Projection::Perspective => {
                direction = self.direction + self.right * half_x + self.up * half_y;
                screen = (half_x, half_y);
            }
            Projection::Orthographic => {
                direction = self.direction;
                origin = self.location + self.right * half_x + self.up * half_y;
                screen = (half_x, half_y);
                per_ray_containers = true;
            }
            Projection::Fisheye => {
                let x0 = full_x * constants.aspect_ratio;
                let rad = (x0 * x0 + full_y * full_y).sqrt();
                // Pixels outside the unit circle see nothing.
                if rad > 1.0 {
                    return None;
                }
                let phi = polar_angle(x0, full_y, rad);
                // The vertical angle spans half the viewing angle.
                let theta = rad * self.angle * std::f64::consts::PI / 360.0;
                let (sin_phi, cos_phi) = (phi.sin(), phi.cos());
                let (sin_theta, cos_theta) = (theta.sin(), theta.cos());
                direction = constants.right_n * (cos_phi * sin_theta)
                    + constants.up_n * (sin_phi * sin_theta)
                    + constants.direction_n * cos_theta;
                screen = (phi, theta);
            }
            Projection::Omnimax => {
                let x0 = full_x * constants.aspect_ratio;
                let rad = (x0 * x0 + full_y * full_y).sqrt();
                if rad > 1.0 {
                    return None;
                }
                let phi = polar_angle(x0, full_y, rad);
                let theta =
                    1.411269 * rad - 0.09439 * rad.powi(3) + 0.25674 * rad.powi(5);
                let (sin_phi, cos_phi) = (phi.sin(), phi.cos());
                let (sin_theta, cos_theta) = (theta.sin(), theta.cos());
                // The dome can't see below 45 degrees under its axis.
                if sin_phi * sin_theta < (135.0f64).to_radians().tan() * cos_theta {
                    return None;
                }
                direction = constants.right_n * (cos_phi * sin_theta)
                    + constants.up_n * (sin_phi * sin_theta)
                    + constants.direction_n * cos_theta;
                screen = (phi, theta);
            }
            Projection::Panoramic => {
                let x0 = (1.0 - x / width) * std::f64::consts::PI;
                let y0 = std::f64::consts::FRAC_PI_2 * full_y;
                let ty = if (std::f64::consts::FRAC_PI_2 - y0.abs()).abs() < 1.0e-10 {
                    // The poles want an infinite tangent; a huge one will do.
                    1.0e17f64.copysign(y0)
                } else {
                    y0.tan()
                };
                direction = self.right * x0.cos() + self.up * ty + self.direction * x0.sin();
                screen = (x0, y0);
            }
            Projection::UltraWideAngle => {
                let x0 = half_x * self.angle / 180.0;
                let y0 = half_y * self.angle / 180.0;
                direction = self.right * x0.sin()
                    + self.up * y0.sin()
                    + self.direction * (x0.cos() * y0.cos());
                screen = (x0, y0);
            }
            Projection::Cylinder1 => {
                let x0 = half_x * self.angle.to_radians();
                direction = self.right * x0.sin() + self.up * half_y + self.direction * x0.cos();
                screen = (x0, half_y);
            }
            Projection::Cylinder2 => {
                let y0 = half_y * self.angle.to_radians();
                direction = self.right * half_x + self.up * y0.sin() + self.direction * y0.cos();
                screen = (half_x, y0);
            }
            Projection::Cylinder3 => {
                let x0 = half_x * self.angle.to_radians();
                direction = self.right * x0.sin() + self.direction * x0.cos();
                origin = self.location + self.up * half_y;
                screen = (x0, half_y);
                per_ray_containers = true;
            }
            Projection::Cylinder4 => {
                let y0 = half_y * self.angle.to_radians();
                direction = self.up * y0.sin() + self.direction * y0.cos();
                origin = self.location + self.right * half_x;
                screen = (half_x, y0);
                per_ray_containers = true;
            }
        }

        Some(ProjectedRay {
            origin,
            direction,
            screen,
            per_ray_containers,
        })
    }
}

/// Azimuth of `(x0, y0)` with radius `rad`, in the convention the circular
/// projections use.
fn polar_angle(x0: FreeCoordinate, y0: FreeCoordinate, rad: FreeCoordinate) -> FreeCoordinate {
    if rad == 0.0 {
        return 0.0;
    }
    // The quotient can drift past 1 by rounding; asin must not see that.
    let sine = (y0 / rad).clamp(-1.0, 1.0);
    if x0 < 0.0 {
        std::f64::consts::PI - sine.asin()
    } else {
        sine.asin()
    }
}

/// Per-frame cached camera constants.
#[derive(Clone, Debug)]
pub(crate) struct CameraConstants {
    computed: bool,
    aspect_ratio: FreeCoordinate,
    right_n: Vector3<FreeCoordinate>,
    up_n: Vector3<FreeCoordinate>,
    direction_n: Vector3<FreeCoordinate>,
}

impl CameraConstants {
    pub fn new() -> Self {
        CameraConstants {
            computed: false,
            aspect_ratio: 1.0,
            right_n: Vector3::new(1.0, 0.0, 0.0),
            up_n: Vector3::new(0.0, 1.0, 0.0),
            direction_n: Vector3::new(0.0, 0.0, 1.0),
        }
    }
}

/// Result of projecting a pixel through a camera model.
pub(crate) struct ProjectedRay {
    pub origin: Point3<FreeCoordinate>,
    /// Unnormalized direction.
    pub direction: Vector3<FreeCoordinate>,
    /// Final screen-space coordinates, for direction perturbation.
    pub screen: (FreeCoordinate, FreeCoordinate),
    /// Whether this model moves the ray origin per pixel, so the containing
    /// interiors must be recomputed for every ray.
    pub per_ray_containers: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera(projection: Projection) -> Camera {
        Camera::looking_at(
            projection,
            Point3::new(0.0, 0.0, -5.0),
            Point3::new(0.0, 0.0, 0.0),
        )
    }

    #[test]
    fn perspective_center_ray_is_straight_ahead() {
        let camera = test_camera(Projection::Perspective);
        let mut constants = CameraConstants::new();
        // The exact image center of an odd-height image.
        let projected = camera
            .project(160.0, 119.5, 320.0, 240.0, &mut constants)
            .unwrap();
        let direction = projected.direction.normalize();
        assert!((direction - Vector3::new(0.0, 0.0, 1.0)).magnitude() < 1e-2);
        assert_eq!(projected.origin, camera.location);
        assert!(!projected.per_ray_containers);
    }

    #[test]
    fn perspective_edges_spread() {
        let camera = test_camera(Projection::Perspective);
        let mut constants = CameraConstants::new();
        let left = camera.project(0.0, 120.0, 320.0, 240.0, &mut constants).unwrap();
        let right = camera
            .project(320.0, 120.0, 320.0, 240.0, &mut constants)
            .unwrap();
        assert!(left.direction.x < 0.0);
        assert!(right.direction.x > 0.0);
    }

    #[test]
    fn orthographic_moves_origin_not_direction() {
        let camera = test_camera(Projection::Orthographic);
        let mut constants = CameraConstants::new();
        let corner = camera.project(0.0, 0.0, 320.0, 240.0, &mut constants).unwrap();
        assert_eq!(corner.direction, camera.direction);
        assert!((corner.origin - camera.location).magnitude() > 0.0);
        assert!(corner.per_ray_containers);
    }

    #[test]
    fn fisheye_rejects_outside_unit_disk() {
        let mut camera = test_camera(Projection::Fisheye);
        camera.angle = 180.0;
        let mut constants = CameraConstants::new();
        // Far corner of a square image lies outside the inscribed circle.
        assert!(camera.project(0.0, 0.0, 240.0, 240.0, &mut constants).is_none());
        // Center is fine.
        assert!(camera
            .project(120.0, 119.5, 240.0, 240.0, &mut constants)
            .is_some());
    }

    #[test]
    fn omnimax_rejects_below_dome() {
        let camera = test_camera(Projection::Omnimax);
        let mut constants = CameraConstants::new();
        // Bottom edge of the disk looks too far under the projection axis.
        assert!(camera
            .project(120.0, 239.0, 240.0, 240.0, &mut constants)
            .is_none());
        assert!(camera
            .project(120.0, 119.5, 240.0, 240.0, &mut constants)
            .is_some());
    }

    #[test]
    fn cylinder_cameras_distinguish_axes() {
        let mut constants = CameraConstants::new();
        let cyl1 = test_camera(Projection::Cylinder1);
        let edge = cyl1.project(320.0, 120.0, 320.0, 240.0, &mut constants).unwrap();
        // Horizontal angle bends the direction; vertical offset is linear.
        assert!(edge.direction.x != 0.0);

        let mut constants = CameraConstants::new();
        let cyl3 = test_camera(Projection::Cylinder3);
        let above = cyl3.project(160.0, 0.0, 320.0, 240.0, &mut constants).unwrap();
        // Orthographic vertically: origin moves up instead.
        assert!((above.origin - cyl3.location).magnitude() > 0.0);
        assert!(above.per_ray_containers);
    }
}
