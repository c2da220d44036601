// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! The narrow geometric capability set the shading core consumes, and a few
//! concrete primitives.
//!
//! Primitive geometry is not the interesting part of this crate; anything
//! implementing [`Shape`] may be plugged in (meshes, CSG, a bounding
//! hierarchy adapter). The sphere/plane/box here exist so the core can be
//! exercised end to end.

use cgmath::{EuclideanSpace as _, InnerSpace as _, Point3, Vector3};

use crate::math::FreeCoordinate;
use crate::ray::Ray;

/// Intersections closer than this along a ray are ignored, so that secondary
/// rays do not re-hit the surface they just left.
pub const DEPTH_TOLERANCE: FreeCoordinate = 1.0e-6;

/// One parametric hit against a single shape. The `cookie` is an opaque
/// per-shape value (such as a mesh triangle index) passed back to
/// [`Shape::normal`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawHit {
    pub t: FreeCoordinate,
    pub cookie: usize,
}

/// Capabilities the core needs from scene geometry.
pub trait Shape {
    /// The closest intersection with `t > DEPTH_TOLERANCE`, if any.
    fn intersect(&self, ray: &Ray) -> Option<RawHit>;

    /// Appends every intersection with `t > DEPTH_TOLERANCE`, in no
    /// particular order.
    fn all_intersections(&self, ray: &Ray, hits: &mut Vec<RawHit>);

    /// Whether the point is inside the shape's volume.
    fn inside(&self, point: Point3<FreeCoordinate>) -> bool;

    /// The geometric surface normal at a hit point. Not guaranteed to face
    /// the ray; the shading evaluator flips it as needed.
    fn normal(&self, point: Point3<FreeCoordinate>, cookie: usize) -> Vector3<FreeCoordinate>;
}

/// A sphere.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: Point3<FreeCoordinate>,
    pub radius: FreeCoordinate,
}

impl Sphere {
    fn roots(&self, ray: &Ray) -> Option<(FreeCoordinate, FreeCoordinate)> {
        let oc = ray.origin - self.center;
        // Direction is unit length, so the quadratic's leading coefficient is 1.
        let b = oc.dot(ray.direction);
        let c = oc.magnitude2() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        Some((-b - sq, -b + sq))
    }
}

impl Shape for Sphere {
    fn intersect(&self, ray: &Ray) -> Option<RawHit> {
        let (t0, t1) = self.roots(ray)?;
        if t0 > DEPTH_TOLERANCE {
            Some(RawHit { t: t0, cookie: 0 })
        } else if t1 > DEPTH_TOLERANCE {
            Some(RawHit { t: t1, cookie: 0 })
        } else {
            None
        }
    }

    fn all_intersections(&self, ray: &Ray, hits: &mut Vec<RawHit>) {
        if let Some((t0, t1)) = self.roots(ray) {
            for &t in &[t0, t1] {
                if t > DEPTH_TOLERANCE {
                    hits.push(RawHit { t, cookie: 0 });
                }
            }
        }
    }

    fn inside(&self, point: Point3<FreeCoordinate>) -> bool {
        (point - self.center).magnitude2() < self.radius * self.radius
    }

    fn normal(&self, point: Point3<FreeCoordinate>, _cookie: usize) -> Vector3<FreeCoordinate> {
        (point - self.center) / self.radius
    }
}

/// An infinite plane `normal · p = distance`. Points on the normal side are
/// outside; the half-space behind is the interior.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    /// Unit normal.
    pub normal: Vector3<FreeCoordinate>,
    pub distance: FreeCoordinate,
}

impl Plane {
    fn hit_t(&self, ray: &Ray) -> Option<FreeCoordinate> {
        let denom = self.normal.dot(ray.direction);
        if denom.abs() < 1.0e-12 {
            return None;
        }
        let t = (self.distance - self.normal.dot(ray.origin.to_vec())) / denom;
        if t > DEPTH_TOLERANCE {
            Some(t)
        } else {
            None
        }
    }
}

impl Shape for Plane {
    fn intersect(&self, ray: &Ray) -> Option<RawHit> {
        self.hit_t(ray).map(|t| RawHit { t, cookie: 0 })
    }

    fn all_intersections(&self, ray: &Ray, hits: &mut Vec<RawHit>) {
        if let Some(t) = self.hit_t(ray) {
            hits.push(RawHit { t, cookie: 0 });
        }
    }

    fn inside(&self, point: Point3<FreeCoordinate>) -> bool {
        self.normal.dot(point.to_vec()) < self.distance
    }

    fn normal(&self, _point: Point3<FreeCoordinate>, _cookie: usize) -> Vector3<FreeCoordinate> {
        self.normal
    }
}

/// An axis-aligned box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Box3 {
    pub min: Point3<FreeCoordinate>,
    pub max: Point3<FreeCoordinate>,
}

impl Box3 {
    /// Entry and exit parameters by the slab method, if the ray passes
    /// through the box at all.
    fn slab_interval(&self, ray: &Ray) -> Option<(FreeCoordinate, FreeCoordinate)> {
        let mut t_enter = FreeCoordinate::NEG_INFINITY;
        let mut t_exit = FreeCoordinate::INFINITY;
        for axis in 0..3 {
            let (o, d) = (ray.origin[axis], ray.direction[axis]);
            if d.abs() < 1.0e-12 {
                if o < self.min[axis] || o > self.max[axis] {
                    return None;
                }
            } else {
                let ta = (self.min[axis] - o) / d;
                let tb = (self.max[axis] - o) / d;
                t_enter = t_enter.max(ta.min(tb));
                t_exit = t_exit.min(ta.max(tb));
            }
        }
        if t_enter <= t_exit {
            Some((t_enter, t_exit))
        } else {
            None
        }
    }
}

impl Shape for Box3 {
    fn intersect(&self, ray: &Ray) -> Option<RawHit> {
        let (t0, t1) = self.slab_interval(ray)?;
        if t0 > DEPTH_TOLERANCE {
            Some(RawHit { t: t0, cookie: 0 })
        } else if t1 > DEPTH_TOLERANCE {
            Some(RawHit { t: t1, cookie: 0 })
        } else {
            None
        }
    }

    fn all_intersections(&self, ray: &Ray, hits: &mut Vec<RawHit>) {
        if let Some((t0, t1)) = self.slab_interval(ray) {
            for &t in &[t0, t1] {
                if t > DEPTH_TOLERANCE {
                    hits.push(RawHit { t, cookie: 0 });
                }
            }
        }
    }

    fn inside(&self, point: Point3<FreeCoordinate>) -> bool {
        (0..3).all(|axis| point[axis] > self.min[axis] && point[axis] < self.max[axis])
    }

    fn normal(&self, point: Point3<FreeCoordinate>, _cookie: usize) -> Vector3<FreeCoordinate> {
        // The face whose plane the point is nearest wins.
        let mut best_axis = 0;
        let mut best_dist = FreeCoordinate::INFINITY;
        let mut sign = 1.0;
        for axis in 0..3 {
            let d_min = (point[axis] - self.min[axis]).abs();
            let d_max = (point[axis] - self.max[axis]).abs();
            if d_min < best_dist {
                best_dist = d_min;
                best_axis = axis;
                sign = -1.0;
            }
            if d_max < best_dist {
                best_dist = d_max;
                best_axis = axis;
                sign = 1.0;
            }
        }
        let mut n = Vector3::new(0.0, 0.0, 0.0);
        n[best_axis] = sign;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z_ray(origin: Point3<FreeCoordinate>) -> Ray {
        Ray::new(origin, Vector3::new(0.0, 0.0, 1.0))
    }

    #[test]
    fn sphere_hits_twice() {
        let sphere = Sphere {
            center: Point3::new(0.0, 0.0, 5.0),
            radius: 1.0,
        };
        let ray = z_ray(Point3::new(0.0, 0.0, 0.0));
        assert_eq!(sphere.intersect(&ray).unwrap().t, 4.0);
        let mut hits = Vec::new();
        sphere.all_intersections(&ray, &mut hits);
        let mut ts: Vec<_> = hits.iter().map(|h| h.t).collect();
        ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(ts, vec![4.0, 6.0]);
    }

    #[test]
    fn sphere_from_inside() {
        let sphere = Sphere {
            center: Point3::new(0.0, 0.0, 0.0),
            radius: 2.0,
        };
        assert!(sphere.inside(Point3::new(0.5, 0.5, 0.5)));
        let hit = sphere.intersect(&z_ray(Point3::new(0.0, 0.0, 0.0))).unwrap();
        assert_eq!(hit.t, 2.0);
    }

    #[test]
    fn plane_hit_and_halfspace() {
        let floor = Plane {
            normal: Vector3::new(0.0, 1.0, 0.0),
            distance: 0.0,
        };
        let ray = Ray::new(Point3::new(0.0, 2.0, 0.0), Vector3::new(0.0, -1.0, 0.0));
        assert_eq!(floor.intersect(&ray).unwrap().t, 2.0);
        assert!(floor.inside(Point3::new(0.0, -1.0, 0.0)));
        assert!(!floor.inside(Point3::new(0.0, 1.0, 0.0)));
        // Parallel ray misses.
        assert!(floor.intersect(&z_ray(Point3::new(0.0, 1.0, 0.0))).is_none());
    }

    #[test]
    fn box_slabs_and_normals() {
        let cube = Box3 {
            min: Point3::new(-1.0, -1.0, -1.0),
            max: Point3::new(1.0, 1.0, 1.0),
        };
        let ray = z_ray(Point3::new(0.0, 0.0, -5.0));
        let hit = cube.intersect(&ray).unwrap();
        assert_eq!(hit.t, 4.0);
        let n = cube.normal(ray.at(hit.t), 0);
        assert_eq!(n, Vector3::new(0.0, 0.0, -1.0));
        assert!(cube.inside(Point3::new(0.0, 0.9, 0.0)));
        assert!(!cube.inside(Point3::new(0.0, 1.1, 0.0)));
    }
}
