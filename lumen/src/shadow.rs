// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Per-light visibility: how much of a light source's color survives the
//! trip from a surface point to the light.
//!
//! Shadow rays are walked blocker to blocker, multiplying in each
//! translucent blocker's filter, with two accelerations: each light
//! remembers the opaque object that last shadowed it (tested first, since
//! shadows are spatially coherent), and area lights sample their grid
//! adaptively, reusing corner results across the recursive subdivision.
//!
//! This module is closely tied to [`Tracer`] and separated out for
//! readability, not modularity.

use cgmath::{InnerSpace as _, Point3, Vector3};
use rand::Rng as _;

use crate::light::LightKind;
use crate::math::{colour_distance, FreeCoordinate, Rgb};
use crate::ray::Ray;
use crate::scene::{Intersection, ObjectId};
use crate::trace::Tracer;

/// Shadow-ray hits closer than this to either endpoint are ignored;
/// higher-order surfaces don't resolve more finely than this anyway.
pub const SHADOW_TOLERANCE: FreeCoordinate = 1.0e-3;

impl<'a> Tracer<'a> {
    /// Builds the light color and ray for one light as seen from `point`.
    ///
    /// Returns `(colour, ray toward light, distance)`. The color is already
    /// scaled by distance fade and spot/cylinder cone attenuation but not
    /// yet by any shadowing. The ray inherits the viewing ray's interior
    /// stack. `center_override` substitutes a jittered center during
    /// area-light sampling.
    pub(crate) fn do_light(
        &self,
        light_index: usize,
        center_override: Option<Point3<FreeCoordinate>>,
        point: Point3<FreeCoordinate>,
        eye_ray: &Ray,
    ) -> (Rgb, Ray, FreeCoordinate) {
        let light = &self.scene.lights[light_index];
        let center = center_override.unwrap_or(light.center);

        let mut direction = center - point;
        let depth = direction.magnitude();
        if depth > 0.0 {
            direction /= depth;
        } else {
            direction = Vector3::new(0.0, 1.0, 0.0);
        }

        let attenuation = light.attenuation(direction, depth);
        let colour = light.colour * attenuation as f32;

        let ray = eye_ray.continued(point, direction);
        (colour, ray, depth)
    }

    /// Returns the color of the given light that survives transmission from
    /// `point` to the light's center: the full per-light visibility query,
    /// including filtered shadows and area-light sampling.
    pub fn test_shadow(
        &mut self,
        light_index: usize,
        eye_ray: &Ray,
        point: Point3<FreeCoordinate>,
    ) -> Rgb {
        let (mut colour, mut light_ray, depth) = self.do_light(light_index, None, point, eye_ray);

        // No need to test for shadows if no light arrives in the first
        // place (outside a spot cone, or faded to nothing).
        if !colour.is_black()
            && self.options.quality.shadows
            && !self.scene.lights[light_index].is_fill()
        {
            self.block_light_source(light_index, depth, &mut light_ray, eye_ray, point, &mut colour);
        }
        colour
    }

    /// Dispatches to the area or point shadow walk, then applies any
    /// atmosphere over the unobstructed remainder of the ray.
    pub(crate) fn block_light_source(
        &mut self,
        light_index: usize,
        depth: FreeCoordinate,
        light_ray: &mut Ray,
        eye_ray: &Ray,
        point: Point3<FreeCoordinate>,
        colour: &mut Rgb,
    ) {
        let mut remaining_depth = depth;

        let is_area = self.scene.lights[light_index].is_area();
        if is_area && self.options.quality.area_lights {
            *colour = self.block_area_light(
                light_index,
                &mut remaining_depth,
                light_ray,
                eye_ray,
                point,
                *colour,
                (0, 0, 0, 0),
                0,
            );
        } else {
            self.block_point_light(light_index, &mut remaining_depth, light_ray, colour);
        }

        // Whatever distance is left before the light gets atmospheric
        // treatment of its own.
        let light = &self.scene.lights[light_index];
        if remaining_depth > SHADOW_TOLERANCE
            && light.media_interaction
            && light.media_attenuation
            && self.options.quality.volume
        {
            if let Some(atmosphere) = &self.scene.atmosphere {
                let mut rgba = colour.with_transmittance(crate::math::NotNan::new(0.0).unwrap());
                atmosphere.finite(light_ray, remaining_depth, &mut rgba, true);
                *colour = rgba.to_rgb();
            }
        }
    }

    /// Walks a shadow ray toward a point-style light, attenuating `colour`
    /// through every blocker. The ray origin and `depth` advance past each
    /// translucent blocker; an opaque full occlusion ends the walk.
    pub(crate) fn block_point_light(
        &mut self,
        light_index: usize,
        depth: &mut FreeCoordinate,
        light_ray: &mut Ray,
        colour: &mut Rgb,
    ) {
        let scene = self.scene;

        // First test the cached blocker; don't bother with anything else if
        // it still fully occludes this ray.
        if let Some(cached_id) = self.shadow_caches[light_index] {
            self.stats.shadow_ray_tests += 1;
            let cached = scene.object(cached_id);
            if !cached.flags.no_shadow {
                let mut hits = Vec::new();
                cached.shape.all_intersections(light_ray, &mut hits);
                for hit in hits {
                    if hit.t < *depth - SHADOW_TOLERANCE && hit.t > SHADOW_TOLERANCE {
                        let intersection = Intersection {
                            object: cached_id,
                            t: hit.t,
                            point: light_ray.at(hit.t),
                            cookie: hit.cookie,
                        };
                        if self.do_blocking(&intersection, light_ray, colour) {
                            self.stats.shadow_cache_hits += 1;
                            return;
                        }
                    }
                }
            }
        }

        // Walk from the surface toward the light.
        let mut not_found_shadow = true;
        let mut cache_candidate: Option<ObjectId> = None;

        loop {
            self.stats.shadow_ray_tests += 1;
            let skip = self.shadow_caches[light_index];
            match scene.intersect_best(light_ray, *depth, skip, true) {
                Some(intersection) => {
                    self.stats.shadow_rays_succeeded += 1;

                    self.filter_shadow_ray(&intersection, light_ray, colour);

                    if colour.is_black() && scene.object(intersection.object).flags.opaque {
                        // Full occlusion by an opaque object; remember it,
                        // but only if it was the first blocker on this ray.
                        if not_found_shadow {
                            cache_candidate = Some(intersection.object);
                        }
                        break;
                    }

                    // Move the ray to the point of intersection, and keep
                    // going.
                    *depth -= intersection.t;
                    light_ray.origin = intersection.point;
                    not_found_shadow = false;
                }
                None => break,
            }
        }

        if let Some(id) = cache_candidate {
            self.shadow_caches[light_index] = Some(id);
        }
    }

    /// Applies one blocker to the shadow ray; true if the light was fully
    /// extinguished.
    fn do_blocking(
        &mut self,
        intersection: &Intersection,
        light_ray: &mut Ray,
        colour: &mut Rgb,
    ) -> bool {
        self.stats.shadow_rays_succeeded += 1;
        self.filter_shadow_ray(intersection, light_ray, colour);
        colour.is_black()
    }

    /// Adaptive area-light sampling over the rectangle `(u1,v1)-(u2,v2)` of
    /// the light's sample grid. Returns the averaged light color.
    #[allow(clippy::too_many_arguments)]
    fn block_area_light(
        &mut self,
        light_index: usize,
        depth: &mut FreeCoordinate,
        light_ray: &mut Ray,
        eye_ray: &Ray,
        point: Point3<FreeCoordinate>,
        input_colour: Rgb,
        region: (usize, usize, usize, usize),
        level: u32,
    ) -> Rgb {
        let (axis1, axis2, size1, size2, adaptive_level, jitter) =
            match &self.scene.lights[light_index].kind {
                LightKind::Area {
                    axis1,
                    axis2,
                    size1,
                    size2,
                    adaptive_level,
                    jitter,
                } => (*axis1, *axis2, *size1, *size2, *adaptive_level, *jitter),
                _ => unreachable!("block_area_light requires an area light"),
            };
        let light_center = self.scene.lights[light_index].center;

        let (mut u1, mut v1, mut u2, mut v2) = region;

        // First call for this shading point: flag the whole grid
        // uncomputed and widen to the full rectangle.
        if u1 == 0 && v1 == 0 && u2 == 0 && v2 == 0 {
            for slot in self.area_grids[light_index].iter_mut() {
                *slot = None;
            }
            u1 = 0;
            v1 = 0;
            u2 = size1 - 1;
            v2 = size2 - 1;
        }

        // Sample the four corners of the region, reusing grid entries
        // computed by earlier sub-rectangles.
        let mut sample_colour = [Rgb::ZERO; 4];
        for (i, &(u, v)) in [(u1, v1), (u2, v1), (u1, v2), (u2, v2)].iter().enumerate() {
            let slot = u * size2 + v;
            if let Some(cached) = self.area_grids[light_index][slot] {
                sample_colour[i] = cached;
                continue;
            }

            let mut jitter_u = u as FreeCoordinate;
            let mut jitter_v = v as FreeCoordinate;
            if jitter {
                jitter_u += self.rng.gen::<FreeCoordinate>() - 0.5;
                jitter_v += self.rng.gen::<FreeCoordinate>() - 0.5;
            }

            let offset1 = if size1 > 1 {
                axis1 * (jitter_u / (size1 - 1) as FreeCoordinate - 0.5)
            } else {
                Vector3::new(0.0, 0.0, 0.0)
            };
            let offset2 = if size2 > 1 {
                axis2 * (jitter_v / (size2 - 1) as FreeCoordinate - 0.5)
            } else {
                Vector3::new(0.0, 0.0, 0.0)
            };

            // Re-derive the shadow ray for the displaced center, but keep
            // the already-attenuated light color.
            let center = light_center + offset1 + offset2;
            let (_, new_ray, new_depth) = self.do_light(light_index, Some(center), point, eye_ray);
            *light_ray = new_ray;
            *depth = new_depth;

            let mut colour = input_colour;
            self.block_point_light(light_index, depth, light_ray, &mut colour);
            sample_colour[i] = colour;
            self.area_grids[light_index][slot] = Some(colour);
        }

        // Subdivide when the region is still divisible, recursion is
        // allowed, and the corners disagree.
        if (u2 - u1 > 1 || v2 - v1 > 1) && level < adaptive_level {
            let disagree = colour_distance(sample_colour[0], sample_colour[1]) > 0.1
                || colour_distance(sample_colour[1], sample_colour[3]) > 0.1
                || colour_distance(sample_colour[3], sample_colour[2]) > 0.1
                || colour_distance(sample_colour[2], sample_colour[0]) > 0.1;
            if disagree {
                let mid_lo_u = ((u1 + u2) as FreeCoordinate / 2.0).floor() as usize;
                let mid_hi_u = ((u1 + u2) as FreeCoordinate / 2.0).ceil() as usize;
                let mid_lo_v = ((v1 + v2) as FreeCoordinate / 2.0).floor() as usize;
                let mid_hi_v = ((v1 + v2) as FreeCoordinate / 2.0).ceil() as usize;
                let quadrants = [
                    (u1, v1, mid_lo_u, mid_lo_v),
                    (mid_hi_u, v1, u2, mid_lo_v),
                    (u1, mid_hi_v, mid_lo_u, v2),
                    (mid_hi_u, mid_hi_v, u2, v2),
                ];
                for (i, &quadrant) in quadrants.iter().enumerate() {
                    // Restore the undisplaced shadow ray for the recursion.
                    let (_, new_ray, new_depth) =
                        self.do_light(light_index, None, point, eye_ray);
                    *light_ray = new_ray;
                    *depth = new_depth;

                    sample_colour[i] = self.block_area_light(
                        light_index,
                        depth,
                        light_ray,
                        eye_ray,
                        point,
                        input_colour,
                        quadrant,
                        level + 1,
                    );
                }
            }
        }

        // The region's color is the average of its four corners.
        let mut total = Rgb::ZERO;
        for colour in &sample_colour {
            total += *colour * 0.25;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Projection};
    use crate::math::PigmentColour;
    use crate::light::Light;
    use crate::options::RenderOptions;
    use crate::scene::{Object, Scene};
    use crate::shape::{Box3, Plane, Sphere};
    use crate::texture::{Finish, Texture};

    fn base_scene() -> Scene {
        let camera = Camera::looking_at(
            Projection::Perspective,
            Point3::new(0.0, 2.0, -6.0),
            Point3::new(0.0, 0.0, 0.0),
        );
        let mut scene = Scene::new(camera);
        // Matte ground plane.
        let mut finish = Finish::default();
        finish.ambient = Rgb::ZERO;
        scene.push_object(Object::new(
            Box::new(Plane {
                normal: Vector3::new(0.0, 1.0, 0.0),
                distance: 0.0,
            }),
            Texture::uniform(PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0), finish),
        ));
        scene
    }

    fn eye_ray() -> Ray {
        Ray::new(Point3::new(0.0, 2.0, -6.0), Vector3::new(0.0, -0.316, 0.949).normalize())
    }

    #[test]
    fn opaque_sphere_blocks_and_caches() {
        let mut scene = base_scene();
        let blocker = scene.push_object(Object::new(
            Box::new(Sphere {
                center: Point3::new(2.0, 3.0, 0.0),
                radius: 1.0,
            }),
            Texture::uniform(
                PigmentColour::new(0.5, 0.5, 0.5, 0.0, 0.0),
                Finish::default(),
            ),
        ));
        scene
            .lights
            .push(Light::point(Point3::new(4.0, 4.0, 0.0), Rgb::ONE));

        let mut tracer = Tracer::new(&scene, &RenderOptions::default());
        let surface = Point3::new(0.0, 0.0, 0.0);

        let colour = tracer.test_shadow(0, &eye_ray(), surface);
        assert_eq!(colour, Rgb::ZERO);
        // The opaque first blocker was cached.
        assert_eq!(tracer.shadow_caches[0], Some(blocker));
        assert_eq!(tracer.stats.shadow_cache_hits, 0);

        // Second identical query takes the cache fast path.
        let colour = tracer.test_shadow(0, &eye_ray(), surface);
        assert_eq!(colour, Rgb::ZERO);
        assert_eq!(tracer.stats.shadow_cache_hits, 1);
    }

    #[test]
    fn filtered_shadow_tints_the_light() {
        let mut scene = base_scene();
        // A filtering orange cube between surface point and light.
        scene.push_object(Object::new(
            Box::new(Box3 {
                min: Point3::new(1.5, 1.5, -0.5),
                max: Point3::new(2.5, 2.5, 0.5),
            }),
            Texture::uniform(
                PigmentColour::new(1.0, 0.5, 0.0, 0.7, 0.0),
                Finish::default(),
            ),
        ));
        scene
            .lights
            .push(Light::point(Point3::new(4.0, 4.0, 0.0), Rgb::ONE));

        let mut tracer = Tracer::new(&scene, &RenderOptions::default());
        let colour = tracer.test_shadow(0, &eye_ray(), Point3::new(0.0, 0.0, 0.0));

        // Each crossing multiplies the light by filter·pigment per channel,
        // i.e. (0.7, 0.35, 0), and the ray crosses the cube's entry and
        // exit surfaces: (0.49, 0.1225, 0). Green stays at a quarter of
        // red, blue is extinguished.
        let r = colour.red().into_inner();
        let g = colour.green().into_inner();
        assert!((r - 0.49).abs() < 1e-5, "r = {}", r);
        assert!((g - 0.1225).abs() < 1e-5, "g = {}", g);
        assert!(colour.blue().into_inner().abs() < 1e-6);
        // Translucent blockers are never cached.
        assert_eq!(tracer.shadow_caches[0], None);
    }

    #[test]
    fn unshadowed_point_is_lit_and_fill_lights_skip_testing() {
        let mut scene = base_scene();
        scene
            .lights
            .push(Light::fill(Point3::new(4.0, 4.0, 0.0), Rgb::ONE));
        scene.push_object(Object::new(
            // Would block the light if fills were shadow-tested.
            Box::new(Sphere {
                center: Point3::new(2.0, 2.0, 0.0),
                radius: 1.0,
            }),
            Texture::uniform(
                PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0),
                Finish::default(),
            ),
        ));

        let mut tracer = Tracer::new(&scene, &RenderOptions::default());
        let colour = tracer.test_shadow(0, &eye_ray(), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(colour, Rgb::ONE);
        assert_eq!(tracer.stats.shadow_ray_tests, 0);
    }

    #[test]
    fn area_light_agreeing_corners_stop_at_four_samples() {
        let mut scene = base_scene();
        scene.lights.push(Light::area(
            Point3::new(4.0, 4.0, 0.0),
            Rgb::ONE,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            3,
            3,
            1,
        ));

        // Nothing blocks: all corners agree, so only the four corners are
        // ever sampled.
        let mut tracer = Tracer::new(&scene, &RenderOptions::default());
        let colour = tracer.test_shadow(0, &eye_ray(), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(colour, Rgb::ONE);
        let computed = tracer.area_grids[0].iter().filter(|s| s.is_some()).count();
        assert_eq!(computed, 4);
    }

    #[test]
    fn area_light_disagreeing_corners_subdivide_without_reshooting() {
        let mut scene = base_scene();
        // A wall that shadows one side of the area light but not the other.
        scene.push_object(Object::new(
            Box::new(Box3 {
                min: Point3::new(0.5, 3.0, -4.0),
                max: Point3::new(1.4, 6.0, 4.0),
            }),
            Texture::uniform(
                PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0),
                Finish::default(),
            ),
        ));
        scene.lights.push(Light::area(
            Point3::new(4.0, 4.0, 0.0),
            Rgb::ONE,
            Vector3::new(6.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 6.0),
            3,
            3,
            1,
        ));

        let mut tracer = Tracer::new(&scene, &RenderOptions::default());
        let colour = tracer.test_shadow(0, &eye_ray(), Point3::new(-2.0, 0.0, 0.0));

        // Disagreement drives the full 3×3 grid to be evaluated, each
        // corner exactly once thanks to the grid cache.
        let computed = tracer.area_grids[0].iter().filter(|s| s.is_some()).count();
        assert_eq!(computed, 9);
        // Partial occlusion: some but not all of the light survives.
        let grey = colour.grey();
        assert!(grey > 0.05 && grey < 0.95, "grey = {}", grey);
    }
}
