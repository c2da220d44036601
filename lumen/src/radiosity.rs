// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Diffuse interreflection via an irradiance cache.
//!
//! Rather than a constant ambient term, the first shading point on a diffuse
//! surface casts a hemisphere of sample rays to measure the indirect
//! illumination arriving there, then caches the result (with a translational
//! gradient) in the octree. Later shading points reuse nearby cached samples
//! whenever the combined translation/rotation error is acceptable, so the
//! expensive gathers happen only where illumination actually changes.
//!
//! This module is closely tied to [`Tracer`] and separated out for
//! readability, not modularity.

use cgmath::{InnerSpace as _, Point3, Vector3};
use once_cell::sync::Lazy;
use std::io::{BufRead, Write};

use crate::math::{perpendicular_frame, FreeCoordinate, Rgb};
use crate::octree::{self, CacheFileError, LoadSummary, NodeId, Octree, OtBlock};
use crate::options::{Quality, RadiosityOptions};
use crate::ray::Ray;
use crate::trace::Tracer;

/// Upper bound on how many nearest samples may be averaged.
pub const MAX_NEAREST_COUNT: usize = 10;

/// Number of precomputed hemisphere sample directions.
const RAD_SAMPLE_COUNT: usize = 2000;

/// The irradiance cache: the octree of gathered samples plus the running
/// state of the brightness calibration.
pub struct RadiosityCache {
    pub octree: Octree,
    /// Sum of all depth-1 gathered illuminances, for brightness calibration.
    gather_total: Vector3<f32>,
    gather_total_count: usize,
    /// Output scale applied to depth-1 ambient values.
    pub brightness: FreeCoordinate,
    /// Whether the preview (calibration) pass has completed.
    pub preview_done: bool,
}

impl RadiosityCache {
    pub fn new(options: &RadiosityOptions) -> Self {
        RadiosityCache {
            octree: Octree::new(),
            gather_total: Vector3::new(0.0, 0.0, 0.0),
            gather_total_count: 0,
            brightness: options.brightness,
            preview_done: false,
        }
    }

    /// Resets the calibration accumulators at the start of a preview pass.
    pub fn begin_calibration(&mut self) {
        self.gather_total = Vector3::new(0.0, 0.0, 0.0);
        self.gather_total_count = 0;
    }

    /// Rescales `brightness` so the average gathered ambient matches unity
    /// gray, cancelling the darkening inherent in measuring indirect light.
    /// Returns the new brightness if any samples were gathered.
    pub fn normalize_brightness(&mut self) -> Option<FreeCoordinate> {
        if self.gather_total_count == 0 {
            return None;
        }
        let average = self.gather_total / self.gather_total_count as f32;
        let grey = (average.x + average.y + average.z) as FreeCoordinate;
        if grey > 0.0 {
            self.brightness = 3.0 / grey;
            Some(self.brightness)
        } else {
            None
        }
    }

    /// Writes the whole cache (brightness, depth-1 blocks, preview marker)
    /// in the textual format.
    pub fn save(&self, writer: &mut dyn Write) -> Result<(), CacheFileError> {
        writeln!(writer, "B{}", self.brightness)?;
        self.octree.save(writer)?;
        if self.preview_done {
            writeln!(writer, "P")?;
        }
        Ok(())
    }

    /// Loads a previously saved cache, adding its blocks to the tree and
    /// adopting its brightness/preview markers.
    pub fn load(
        &mut self,
        reader: &mut dyn BufRead,
        error_bound: FreeCoordinate,
    ) -> Result<LoadSummary, CacheFileError> {
        self.begin_calibration();
        let summary = self.octree.load(reader, error_bound)?;
        if let Some(brightness) = summary.brightness {
            self.brightness = brightness;
        }
        self.preview_done |= summary.preview_done;
        Ok(summary)
    }

    /// Like [`Self::load`], but a failure merely clears the cache and logs;
    /// an unreadable cache file is never fatal.
    pub fn load_or_clear(&mut self, reader: &mut dyn BufRead, error_bound: FreeCoordinate) {
        match self.load(reader, error_bound) {
            Ok(summary) => {
                log::info!("reloaded {} values from radiosity cache file", summary.blocks);
            }
            Err(error) => {
                log::warn!("discarding unreadable radiosity cache: {}", error);
                self.octree.clear();
                self.begin_calibration();
            }
        }
    }
}

/// A hemisphere direction packed to a byte per axis. x and y span −1..1;
/// z spans 0..1 (the hemisphere is above the tangent plane).
struct PackedDir {
    x: u8,
    y: u8,
    z: u8,
}

impl PackedDir {
    fn unpack(&self) -> Vector3<FreeCoordinate> {
        let v = Vector3::new(
            self.x as FreeCoordinate * (1.0 / 255.0) * 2.0 - 1.0,
            self.y as FreeCoordinate * (1.0 / 255.0) * 2.0 - 1.0,
            self.z as FreeCoordinate * (1.0 / 255.0),
        );
        // Already good to about 1%, but we can do better.
        v.normalize()
    }
}

/// Precomputed sample directions: evenly spread over the hemisphere above +Z
/// with cosine-weighted density (many rays near the normal, few near the
/// tangent plane), in a low-discrepancy order so any prefix of the table is
/// itself well spread.
static RAD_SAMPLES: Lazy<Vec<PackedDir>> = Lazy::new(|| {
    fn radical_inverse(base: u64, mut index: u64) -> FreeCoordinate {
        let mut result = 0.0;
        let mut digit = 1.0 / base as FreeCoordinate;
        while index > 0 {
            result += (index % base) as FreeCoordinate * digit;
            index /= base;
            digit /= base as FreeCoordinate;
        }
        result
    }

    (0..RAD_SAMPLE_COUNT)
        .map(|i| {
            let u = radical_inverse(2, i as u64 + 1);
            let v = radical_inverse(3, i as u64 + 1);
            // Cosine-weighted: uniform disk, projected up to the hemisphere.
            let r = u.sqrt();
            let phi = 2.0 * std::f64::consts::PI * v;
            let x = r * phi.cos();
            let y = r * phi.sin();
            let z = (1.0 - u).sqrt();
            PackedDir {
                x: ((x + 1.0) * 0.5 * 255.0).round() as u8,
                y: ((y + 1.0) * 0.5 * 255.0).round() as u8,
                z: (z * 255.0).round() as u8,
            }
        })
        .collect()
});

/// Running weighted average of acceptable nearby cache blocks.
struct ReuseAverager {
    point: Point3<FreeCoordinate>,
    normal: Vector3<FreeCoordinate>,
    error_bound: FreeCoordinate,
    nearest_count: usize,
    /// Total accepted samples (may exceed the nearest list length).
    good_count: usize,
    distances: [FreeCoordinate; MAX_NEAREST_COUNT],
    weights: [FreeCoordinate; MAX_NEAREST_COUNT],
    weighted_illuminance: [Vector3<f32>; MAX_NEAREST_COUNT],
    close_count: usize,
}

impl ReuseAverager {
    fn consider(&mut self, block: &OtBlock) {
        let delta = self.point - block.point;
        let square_dist = delta.magnitude2();

        // Cheap reject first; this runs for every block near the query.
        let quickcheck_rad = block.harmonic_mean_distance as FreeCoordinate * self.error_bound;
        if square_dist >= quickcheck_rad * quickcheck_rad {
            return;
        }

        let dist = square_dist.sqrt();
        let mut ri = block.harmonic_mean_distance as FreeCoordinate;
        let mut delta_unit = Vector3::new(0.0, 0.0, 0.0);

        if dist > 1.0e-6 {
            delta_unit = delta / dist;
            // Shrink the radius of influence where it points toward the
            // nearest surface found while gathering.
            let cos_diff_from_nearest = block.to_nearest_surface.dot(delta_unit);
            if cos_diff_from_nearest > 0.0 {
                ri = cos_diff_from_nearest * block.nearest_distance as FreeCoordinate
                    + (1.0 - cos_diff_from_nearest) * ri;
            }
        }

        if dist >= ri * self.error_bound {
            return;
        }

        // Error is translation plus rotation; it ranges 0 to 1 + 2√2.
        let dir_diff = self.normal.dot(block.s_normal);
        let error_reuse = dist / ri + 2.0 * (1.0 - dir_diff).abs().sqrt();
        if error_reuse >= self.error_bound {
            return;
        }

        // An old sample in front of this surface would shadow it and make
        // the prediction meaningless; a *little* in front is tolerated so
        // samples on the same surface are not discarded by accident.
        let in_front = if dist > 1.0e-6 {
            let half = (self.normal + block.s_normal).normalize();
            delta_unit.dot(half)
        } else {
            1.0
        };
        if in_front <= -0.05 {
            return;
        }

        let weight = 1.0 - error_reuse / self.error_bound;
        if weight <= 0.001 {
            // Avoid floating point oddities near zero.
            return;
        }

        let prediction = self.predicted_vector(block, delta);
        self.good_count += 1;

        // Keep the geometrically nearest few. When full, the first entry
        // farther than the newcomer is the one replaced.
        let mut index = None;
        if self.close_count < self.nearest_count {
            index = Some(self.close_count);
            self.close_count += 1;
        } else {
            for i in 0..self.close_count {
                if dist < self.distances[i] {
                    index = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = index {
            self.distances[i] = dist;
            self.weights[i] = weight;
            self.weighted_illuminance[i] = prediction * weight as f32;
        }
    }

    fn predicted_vector(&self, block: &OtBlock, delta: Vector3<FreeCoordinate>) -> Vector3<f32> {
        let predicted = block.predict(delta);
        Vector3::new(
            predicted.red().into_inner(),
            predicted.green().into_inner(),
            predicted.blue().into_inner(),
        )
    }

    fn result(&self) -> Option<Rgb> {
        if self.good_count == 0 {
            return None;
        }
        let mut sum = Vector3::new(0.0f32, 0.0, 0.0);
        let mut weight_sum = 0.0;
        for i in 0..self.close_count {
            sum += self.weighted_illuminance[i];
            weight_sum += self.weights[i];
        }
        Some(Rgb::new(
            sum.x / weight_sum as f32,
            sum.y / weight_sum as f32,
            sum.z / weight_sum as f32,
        ))
    }
}

impl<'a> Tracer<'a> {
    /// Computes the indirect diffuse illumination at a surface point.
    ///
    /// Returns the ambient color and whether a fresh gather was required
    /// (`false` means nearby cached samples were reused). `weight` is the
    /// maximum possible contribution of this value to the output pixel.
    pub fn compute_ambient(
        &mut self,
        point: Point3<FreeCoordinate>,
        s_normal: Vector3<FreeCoordinate>,
        weight: FreeCoordinate,
    ) -> (Rgb, bool) {
        // Weak contributions tolerate a sloppier match.
        let save_bound = self.options.radiosity.error_bound;
        if weight < 0.25 {
            self.options.radiosity.error_bound += 0.25 - weight;
        }
        let reused = self.ra_reuse(point, s_normal);
        self.options.radiosity.error_bound = save_bound;

        let (mut ambient, fresh) = match reused {
            Some(colour) => {
                self.stats.reuse_count += 1;
                (colour, false)
            }
            None => {
                let colour = self.ra_gather(point, s_normal, weight);
                self.stats.gather_count += 1;
                (colour, true)
            }
        };

        if self.radiosity_trace_level == 1 {
            // Bias toward gray to tame saturated color bleeding, then scale
            // by the calibrated brightness.
            let gray = self.options.radiosity.gray;
            let grey_value = (ambient.red().into_inner()
                + ambient.green().into_inner()
                + ambient.blue().into_inner())
                / 3.0;
            ambient = Rgb::new(
                gray * grey_value + ambient.red().into_inner() * (1.0 - gray),
                gray * grey_value + ambient.green().into_inner() * (1.0 - gray),
                gray * grey_value + ambient.blue().into_inner() * (1.0 - gray),
            );
            ambient = ambient * self.radiosity.brightness as f32;
        }

        (ambient, fresh)
    }

    /// Weighted average of previously cached values near this point, if any
    /// are close enough (in position and orientation) to trust.
    fn ra_reuse(
        &mut self,
        point: Point3<FreeCoordinate>,
        s_normal: Vector3<FreeCoordinate>,
    ) -> Option<Rgb> {
        if self.radiosity.octree.is_empty() {
            return None;
        }

        // Deeper bounces accept looser matches.
        let mut error_bound = self.options.radiosity.error_bound;
        for _ in 1..self.radiosity_trace_level {
            error_bound *= 1.4;
        }

        let mut averager = ReuseAverager {
            point,
            normal: s_normal,
            error_bound,
            nearest_count: self.options.radiosity.nearest_count.min(MAX_NEAREST_COUNT),
            good_count: 0,
            distances: [0.0; MAX_NEAREST_COUNT],
            weights: [0.0; MAX_NEAREST_COUNT],
            weighted_illuminance: [Vector3::new(0.0, 0.0, 0.0); MAX_NEAREST_COUNT],
            close_count: 0,
        };

        let depth = self.radiosity_trace_level as u8;
        self.radiosity.octree.dist_traverse(point, depth, &mut |block| {
            averager.consider(block);
            true
        });

        averager.result()
    }

    /// Shoots a hemisphere of sample rays to measure the incident indirect
    /// light, caches the result, and returns it.
    fn ra_gather(
        &mut self,
        point: Point3<FreeCoordinate>,
        s_normal: Vector3<FreeCoordinate>,
        weight: FreeCoordinate,
    ) -> Rgb {
        let dist_max = self.options.radiosity.distance_maximum.max(1.0e-10);

        // Deeper bounces use fewer rays over wider reuse radii.
        let mut current_count = self.options.radiosity.count;
        let mut minimum_reuse = self.options.radiosity.minimum_reuse;
        for _ in 1..self.radiosity_trace_level {
            current_count /= 3;
            minimum_reuse *= 2.0;
        }
        let current_count = current_count.clamp(1, RAD_SAMPLE_COUNT);

        let (n2, n3) = perpendicular_frame(s_normal);
        let straight_up = (s_normal.z - 1.0).abs() < 0.001;

        // The max() forces at least some light through; otherwise every
        // sample ray would bail out immediately and the loop would measure
        // nothing.
        let ray_weight = self
            .options
            .adc_bailout
            .max(weight / current_count as FreeCoordinate);

        // Secondary gather rays run at reduced quality: shadows only, and no
        // light-buffer shortcuts.
        let saved_quality = self.options.quality;
        self.options.quality = Quality {
            shadows: true,
            area_lights: false,
            reflect: false,
            refract: false,
            volume: false,
            normals: false,
            full_ambient: false,
            use_light_buffer: false,
            use_vista_buffer: false,
        };

        let mut colour_sum = Vector3::new(0.0f32, 0.0, 0.0);
        let mut inverse_distance_sum = 0.0;
        let mut min_dist = FreeCoordinate::INFINITY;
        let mut min_dist_vec = s_normal;

        // Integrals that become the translational gradient.
        let mut gradient_sum = [Vector3::new(0.0f32, 0.0, 0.0); 3];
        let mut sum_of_inverse_dist = 0.0;
        let mut sum_of_dist = 0.0;
        let mut gradient_count = 0usize;

        for i in 0..current_count {
            // Precomputed directions have the right cosine-weighted
            // statistical skew; rotate them into the surface frame unless
            // the normal already points straight up.
            let sample = RAD_SAMPLES[i].unpack();
            let direction = if straight_up {
                sample
            } else {
                n2 * sample.x + n3 * sample.y + s_normal * sample.z
            };

            // Sample rays start fresh outside every interior.
            let new_ray = Ray::new(point, direction);

            self.trace_level += 1;
            self.radiosity_trace_level += 1;
            let (colour, depth) = self.trace(&new_ray, ray_weight);
            self.radiosity_trace_level -= 1;
            self.trace_level -= 1;

            let rgb: cgmath::Vector3<f32> = colour.to_rgb().into();

            if depth < dist_max * 10.0 {
                let depth_weight = (1.0 / depth) as f32;
                sum_of_inverse_dist += 1.0 / depth;
                sum_of_dist += depth;
                gradient_count += 1;

                // Axis contributions are weighted by the signed square of
                // the direction component.
                let signed_sq = |c: FreeCoordinate| (c * c).copysign(c) as f32;
                gradient_sum[0] += rgb * (signed_sq(direction.x) * depth_weight);
                gradient_sum[1] += rgb * (signed_sq(direction.y) * depth_weight);
                gradient_sum[2] += rgb * (signed_sq(direction.z) * depth_weight);
            }

            let depth = depth.min(dist_max);
            if depth < min_dist {
                min_dist = depth;
                min_dist_vec = direction;
            }

            colour_sum += rgb;
            inverse_distance_sum += 1.0 / depth;
        }

        self.options.quality = saved_quality;

        // The sphere of influence of this sample is set by the harmonic mean
        // distance to everything it saw.
        let mean_dist_raw = 1.0 / (inverse_distance_sum / current_count as FreeCoordinate);
        let illuminance_vec = colour_sum / current_count as f32;
        let illuminance = Rgb::new(illuminance_vec.x, illuminance_vec.y, illuminance_vec.z);

        if self.radiosity_trace_level == 1 {
            self.radiosity.gather_total += illuminance_vec;
            self.radiosity.gather_total_count += 1;
        }

        // Hemmed in on all sides, the value has no reuse potential; don't
        // bother caching it.
        if mean_dist_raw > dist_max * 0.0001 {
            // A minimum reuse radius, proportional to the distance from the
            // eye, stops us from re-gathering at every point along inside
            // edges.
            let to_eye = (self.scene.camera.location - point).magnitude();
            let mean_dist = mean_dist_raw.max(to_eye * minimum_reuse);

            let mut gradient = [Vector3::new(0.0f32, 0.0, 0.0); 3];
            if gradient_count > 10 {
                let average_dist = sum_of_dist / gradient_count as FreeCoordinate;
                let constant_term = (1.0 / (sum_of_inverse_dist * average_dist)) as f32;
                for axis in 0..3 {
                    gradient[axis] = gradient_sum[axis] * constant_term;
                }
            }

            let block = OtBlock {
                point,
                s_normal,
                illuminance,
                harmonic_mean_distance: mean_dist as f32,
                nearest_distance: min_dist as f32,
                to_nearest_surface: min_dist_vec,
                bounce_depth: self.radiosity_trace_level as u8,
                gradient,
            };

            let id = NodeId::for_sphere(point, mean_dist * self.options.radiosity.error_bound);
            if block.bounce_depth == 1 {
                let mut append_failed = false;
                if let Some(sink) = self.cache_append.as_mut() {
                    // Failing to append is logged, never fatal.
                    if let Err(error) = octree::write_block(sink.as_mut(), &block) {
                        log::error!("radiosity cache append failed: {}", error);
                        append_failed = true;
                    }
                }
                if append_failed {
                    self.cache_append = None;
                }
            }
            self.radiosity.octree.insert(id, block);
        }

        illuminance
    }

    /// Writes a raw marker line to the radiosity cache sink, if one is
    /// attached.
    pub(crate) fn append_cache_marker(&mut self, line: &str) {
        let mut append_failed = false;
        if let Some(sink) = self.cache_append.as_mut() {
            append_failed = writeln!(sink, "{}", line).is_err();
        }
        if append_failed {
            log::error!("radiosity cache append failed; detaching sink");
            self.cache_append = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Projection};
    use crate::math::PigmentColour;
    use crate::options::RenderOptions;
    use crate::scene::{Object, Scene};
    use crate::shape::Plane;
    use crate::texture::{Finish, Texture};
    use std::io;

    /// A diffuse white floor below a luminous white ceiling: every gather
    /// from the floor sees the same light, so reuse ought to kick in fast.
    fn furnace_scene() -> Scene {
        let camera = Camera::looking_at(
            Projection::Perspective,
            Point3::new(0.0, 5.0, -10.0),
            Point3::new(0.0, 0.0, 0.0),
        );
        let mut scene = Scene::new(camera);

        let mut floor_finish = Finish::default();
        floor_finish.ambient = Rgb::ZERO;
        floor_finish.diffuse = 0.7;
        scene.push_object(Object::new(
            Box::new(Plane {
                normal: Vector3::new(0.0, 1.0, 0.0),
                distance: 0.0,
            }),
            Texture::uniform(PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0), floor_finish),
        ));

        let mut glow_finish = Finish::default();
        glow_finish.ambient = Rgb::ONE;
        glow_finish.diffuse = 0.0;
        scene.push_object(Object::new(
            Box::new(Plane {
                normal: Vector3::new(0.0, -1.0, 0.0),
                distance: -20.0,
            }),
            Texture::uniform(PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0), glow_finish),
        ));
        scene
    }

    fn radiosity_options() -> RenderOptions {
        let mut options = RenderOptions::default();
        options.radiosity.enabled = true;
        options.radiosity.count = 30;
        options.radiosity.distance_maximum = 20.0;
        options
    }

    #[test]
    fn first_point_gathers_neighbor_reuses() {
        let scene = furnace_scene();
        let options = radiosity_options();
        let mut tracer = Tracer::new(&scene, &options);
        let up = Vector3::new(0.0, 1.0, 0.0);

        let (first, fresh) = tracer.compute_ambient(Point3::new(0.0, 0.0, 0.0), up, 1.0);
        assert!(fresh);
        assert_eq!(tracer.stats.gather_count, 1);
        assert!(first.grey() > 0.0, "ceiling glow should reach the floor");

        // A hand's width away on a featureless plane: well within the reuse
        // radius.
        let (second, fresh) = tracer.compute_ambient(Point3::new(0.1, 0.0, 0.1), up, 1.0);
        assert!(!fresh);
        assert_eq!(tracer.stats.gather_count, 1);
        assert_eq!(tracer.stats.reuse_count, 1);
        // And the prediction can't stray far from the gathered value.
        assert!((second.grey() - first.grey()).abs() < 0.25);
    }

    #[test]
    fn rotated_normal_defeats_reuse() {
        let scene = furnace_scene();
        let options = radiosity_options();
        let mut tracer = Tracer::new(&scene, &options);

        let up = Vector3::new(0.0, 1.0, 0.0);
        let (_, fresh) = tracer.compute_ambient(Point3::new(0.0, 0.0, 0.0), up, 1.0);
        assert!(fresh);

        // Same position, normal swung 90 degrees: the rotation error alone
        // (2·√(1−N·N') = 2) exceeds any sane error bound.
        let sideways = Vector3::new(1.0, 0.0, 0.0);
        let (_, fresh) = tracer.compute_ambient(Point3::new(0.0, 0.0, 0.0), sideways, 1.0);
        assert!(fresh);
        assert_eq!(tracer.stats.gather_count, 2);
    }

    #[test]
    fn gradient_prediction_follows_stored_gradient() {
        let block = OtBlock {
            point: Point3::new(0.0, 0.0, 0.0),
            s_normal: Vector3::new(0.0, 0.0, 1.0),
            illuminance: Rgb::new(0.5, 0.5, 0.5),
            harmonic_mean_distance: 4.0,
            nearest_distance: 4.0,
            to_nearest_surface: Vector3::new(0.0, 0.0, 1.0),
            bounce_depth: 1,
            gradient: [
                Vector3::new(0.125, 0.0, 0.0),
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(0.0, 0.0, 0.0),
            ],
        };
        // One unit of lateral offset moves red by exactly the x-gradient.
        let predicted = block.predict(Vector3::new(1.0, 0.0, 0.0));
        assert!((predicted.red().into_inner() - 0.625).abs() < 1e-6);
        assert_eq!(predicted.green(), block.illuminance.green());
        // And the clamp holds under a huge offset.
        let clamped = block.predict(Vector3::new(100.0, 0.0, 0.0));
        assert_eq!(clamped.red().into_inner(), 1.0);
    }

    #[test]
    fn sample_table_is_a_cosine_weighted_hemisphere() {
        let mut z_sum = 0.0;
        for packed in RAD_SAMPLES.iter() {
            let v = packed.unpack();
            assert!(v.z >= 0.0, "sample below the tangent plane");
            assert!((v.magnitude() - 1.0).abs() < 1e-9);
            z_sum += v.z;
        }
        // Cosine weighting puts the average z around 2/3.
        let mean_z = z_sum / RAD_SAMPLE_COUNT as FreeCoordinate;
        assert!((mean_z - 2.0 / 3.0).abs() < 0.02, "mean z = {}", mean_z);
    }

    #[test]
    fn brightness_calibration() {
        let options = RadiosityOptions::default();
        let mut cache = RadiosityCache::new(&options);
        assert_eq!(cache.normalize_brightness(), None);

        cache.gather_total = Vector3::new(0.25, 0.25, 0.25);
        cache.gather_total_count = 1;
        let b = cache.normalize_brightness().unwrap();
        assert!((b - 4.0).abs() < 1e-9);
    }

    #[test]
    fn cache_save_and_reload_preserves_markers() {
        let options = RadiosityOptions::default();
        let mut cache = RadiosityCache::new(&options);
        cache.brightness = 2.5;
        cache.preview_done = true;

        let mut buffer = Vec::new();
        cache.save(&mut buffer).unwrap();

        let mut other = RadiosityCache::new(&options);
        let summary = other
            .load(&mut io::Cursor::new(&buffer), options.error_bound)
            .unwrap();
        assert_eq!(summary.brightness, Some(2.5));
        assert!(other.preview_done);
        assert_eq!(other.brightness, 2.5);
    }
}
